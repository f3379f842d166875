use criterion::{black_box, Criterion};
use revgrad_autograd::{
    conv::{conv, ConvParams},
    Variable,
};
use revgrad_core::{device::Device, dtype::DType, error::Result};
use revgrad_tensor::Tensor;

// (batch, channels, spatial extent, label)
const SIZES: [(usize, usize, usize, &str); 3] = [(1, 4, 8, "small"), (2, 8, 16, "medium"), (4, 16, 32, "large")];

struct Setup {
    input: Variable,
    weight: Variable,
    bias: Variable,
    params: ConvParams,
}

fn setup(batch: usize, channels: usize, extent: usize, groups: usize) -> Result<Setup> {
    let input = Tensor::randn_seeded(&[batch, channels, extent, extent], 7, Device::CPU, DType::F32)?;
    let weight = Tensor::randn_seeded(&[channels, channels / groups, 3, 3], 11, Device::CPU, DType::F32)?;
    let bias = Tensor::randn_seeded(&[channels], 13, Device::CPU, DType::F32)?;
    Ok(Setup {
        input: Variable::new(input, true),
        weight: Variable::new(weight, true),
        bias: Variable::new(bias, true),
        params: ConvParams::new(&[1, 1], &[1, 1], &[1, 1], groups)?,
    })
}

fn first_order(s: &Setup) -> Result<(Variable, Vec<Variable>)> {
    let output = conv(&s.input, &s.weight, &s.bias, s.params.clone())?;
    let grad_output = Variable::new(Tensor::ones_like(output.data()?)?, true);
    let grad_fn = output.grad_fn().expect("conv output has a grad_fn");
    let grads = grad_fn.apply(&[grad_output.clone()])?;
    Ok((grad_output, grads))
}

pub fn forward(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("conv/forward");
    group.warm_up_time(core::time::Duration::from_millis(500));
    group.measurement_time(core::time::Duration::from_secs(3));
    group.sample_size(50);

    for (name, groups) in [("dense", 1), ("grouped", 2), ("depthwise", 0)] {
        for &(batch, channels, extent, label) in SIZES.iter() {
            let groups = if groups == 0 { channels } else { groups };
            let s = setup(batch, channels, extent, groups).unwrap();
            group.bench_function(format!("{}/{}", name, label), |b| {
                b.iter(|| black_box(conv(&s.input, &s.weight, &s.bias, s.params.clone())).unwrap())
            });
        }
    }

    group.finish();
}

pub fn backward(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("conv/backward");
    group.warm_up_time(core::time::Duration::from_millis(500));
    group.measurement_time(core::time::Duration::from_secs(3));
    group.sample_size(30);

    for &(batch, channels, extent, label) in SIZES.iter() {
        let s = setup(batch, channels, extent, 1).unwrap();
        group.bench_function(label, |b| b.iter(|| black_box(first_order(&s)).unwrap()));
    }

    group.finish();
}

pub fn double_backward(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("conv/double_backward");
    group.warm_up_time(core::time::Duration::from_millis(500));
    group.measurement_time(core::time::Duration::from_secs(3));
    group.sample_size(20);

    for &(batch, channels, extent, label) in SIZES.iter().take(2) {
        let s = setup(batch, channels, extent, 1).unwrap();
        group.bench_function(label, |b| {
            b.iter(|| {
                let (_, grads) = first_order(&s).unwrap();
                let gg_input = Variable::new(Tensor::ones_like(s.input.data().unwrap()).unwrap(), false);
                let gg_weight = Variable::new(Tensor::ones_like(s.weight.data().unwrap()).unwrap(), false);
                let gg_bias = Variable::new(Tensor::ones_like(s.bias.data().unwrap()).unwrap(), false);
                let grad_fn = grads[0].grad_fn().unwrap();
                black_box(grad_fn.apply(&[gg_input, gg_weight, gg_bias])).unwrap()
            })
        });
    }

    group.finish();
}
