use super::engine;
use revgrad_core::{
    config,
    error::{Error, Result},
};
use revgrad_tensor::{ConvGeometry, Tensor};

/// Execution strategy of one convolution call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvStrategy {
    Depthwise,
    Accelerated,
    Generic,
}

/// Parameter block shared by the convolution node family.
///
/// `padding` and `output_padding` stay signed so that invalid values reach the
/// nodes and are rejected there with a descriptive error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvParams {
    pub stride: Vec<usize>,
    pub padding: Vec<i64>,
    pub dilation: Vec<usize>,
    pub output_padding: Vec<i64>,
    pub groups: usize,
    pub transposed: bool,
    pub deterministic: bool,
    pub benchmark: bool,
    pub accelerated_enabled: bool,
    pub depthwise_enabled: bool,
}

impl ConvParams {
    /// Parameters of a regular convolution, with the strategy hints taken from
    /// the current configuration.
    pub fn new(stride: &[usize], padding: &[i64], dilation: &[usize], groups: usize) -> Result<Self> {
        let cfg = config::get_config();
        let params = Self {
            stride: stride.to_vec(),
            padding: padding.to_vec(),
            dilation: dilation.to_vec(),
            output_padding: vec![0; stride.len()],
            groups,
            transposed: false,
            deterministic: cfg.deterministic,
            benchmark: cfg.benchmark,
            accelerated_enabled: cfg.accelerated_enabled,
            depthwise_enabled: cfg.depthwise_enabled,
        };
        params.validate()?;
        Ok(params)
    }

    /// Parameters of a transposed convolution.
    ///
    /// An `output_padding` entry is rejected only when it is at least both the
    /// stride and the dilation of its dimension. Entries that reach just one of
    /// them are accepted here and keep the accelerated path off (see
    /// [`ConvParams::is_output_padding_big`]).
    pub fn transposed(
        stride: &[usize],
        padding: &[i64],
        dilation: &[usize],
        output_padding: &[i64],
        groups: usize,
    ) -> Result<Self> {
        let mut params = Self::new(stride, padding, dilation, groups)?;
        params.transposed = true;
        params.output_padding = output_padding.to_vec();
        params.validate()?;

        if let Some(i) = (0..params.output_padding.len()).find(|&i| {
            let op = params.output_padding[i];
            op >= params.stride[i] as i64 && op >= params.dilation[i] as i64
        }) {
            return Err(Error::InvalidArgument(format!(
                "output_padding {} at dimension {} must be smaller than either stride {} or dilation {}",
                params.output_padding[i], i, params.stride[i], params.dilation[i]
            )));
        }
        Ok(params)
    }

    fn validate(&self) -> Result<()> {
        let n = self.stride.len();
        if n == 0 || self.padding.len() != n || self.dilation.len() != n || self.output_padding.len() != n {
            return Err(Error::InvalidArgument(format!(
                "stride {:?}, padding {:?}, dilation {:?} and output_padding {:?} must have the same non-zero length",
                self.stride, self.padding, self.dilation, self.output_padding
            )));
        }
        if self.stride.iter().chain(self.dilation.iter()).any(|&v| v == 0) {
            return Err(Error::InvalidArgument(format!(
                "stride {:?} and dilation {:?} must be positive",
                self.stride, self.dilation
            )));
        }
        if self.groups == 0 {
            return Err(Error::InvalidArgument("groups must be positive".to_string()));
        }
        Ok(())
    }

    pub fn is_strided(&self) -> bool {
        self.stride.iter().any(|&s| s != 1)
    }

    pub fn is_dilated(&self) -> bool {
        self.dilation.iter().any(|&d| d != 1)
    }

    pub fn is_padded(&self) -> bool {
        self.padding.iter().any(|&p| p != 0)
    }

    pub fn is_padding_neg(&self) -> bool {
        self.padding.iter().any(|&p| p < 0)
    }

    pub fn is_output_padding_neg(&self) -> bool {
        self.output_padding.iter().any(|&p| p < 0)
    }

    pub fn is_output_padding_big(&self) -> bool {
        self.output_padding
            .iter()
            .zip(self.stride.iter().zip(self.dilation.iter()))
            .any(|(&op, (&s, &d))| op >= s as i64 || op >= d as i64)
    }

    pub(crate) fn check_padding(&self) -> Result<()> {
        if self.is_padding_neg() {
            return Err(Error::InvalidArgument("negative padding is not supported".to_string()));
        }
        if self.is_output_padding_neg() {
            return Err(Error::InvalidArgument("negative output_padding is not supported".to_string()));
        }
        Ok(())
    }

    /// Lifts 1-D parameters to 2-D by prepending a unit spatial dimension.
    pub(crate) fn view1d_as_2d(&mut self) {
        if self.stride.len() == 1 {
            self.stride.insert(0, 1);
            self.padding.insert(0, 0);
            self.dilation.insert(0, 1);
            self.output_padding.insert(0, 0);
        }
    }

    /// Kernel-level geometry. Padding must already be checked.
    pub fn geometry(&self) -> ConvGeometry {
        ConvGeometry {
            stride: self.stride.clone(),
            padding: self.padding.iter().map(|&p| p.max(0) as usize).collect(),
            dilation: self.dilation.clone(),
            output_padding: self.output_padding.iter().map(|&p| p.max(0) as usize).collect(),
        }
    }

    /// Output shape for `input` and `weight` shapes of equal rank.
    pub fn output_size(&self, input: &[usize], weight: &[usize]) -> Vec<usize> {
        let offset = self.stride.len().saturating_sub(input.len().saturating_sub(2));
        let mut out = Vec::with_capacity(input.len());
        out.push(input[0]);
        out.push(if self.transposed {
            weight[1] * self.groups
        } else {
            weight[0]
        });
        for d in 2..input.len() {
            let p = d - 2 + offset;
            let kernel = (self.dilation[p] * (weight[d].max(1) - 1) + 1) as i64;
            let (i, s, pad) = (input[d] as i64, self.stride[p] as i64, self.padding[p]);
            let size = if self.transposed {
                (i - 1) * s - 2 * pad + kernel + self.output_padding[p]
            } else {
                (i + 2 * pad - kernel).div_euclid(s) + 1
            };
            out.push(size.max(0) as usize);
        }
        out
    }

    /// Depthwise kernels apply to non-transposed 4-D problems with one input
    /// channel per group and a whole multiple of output channels.
    pub fn is_depthwise(&self, input: &Tensor, weight: &Tensor) -> bool {
        self.depthwise_enabled
            && !self.transposed
            && input.ndim() == 4
            && self.groups > 1
            && input.shape()[1] == self.groups
            && weight.shape()[0] % input.shape()[1] == 0
    }

    pub fn use_accelerated(&self, input: &Tensor) -> bool {
        if input.device().is_cpu() || !self.accelerated_enabled {
            return false;
        }
        let Some(engine) = engine::engine_for(input.device()) else {
            return false;
        };
        if self.is_dilated() && (self.deterministic || !engine.supports_dilation()) {
            return false;
        }
        !self.is_output_padding_big()
    }

    pub fn select_strategy(&self, input: &Tensor, weight: &Tensor) -> ConvStrategy {
        if self.is_depthwise(input, weight) {
            ConvStrategy::Depthwise
        } else if self.use_accelerated(input) {
            ConvStrategy::Accelerated
        } else {
            ConvStrategy::Generic
        }
    }
}

pub(crate) fn check_input_shape_forward(
    input: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
    groups: usize,
    transposed: bool,
) -> Result<()> {
    let k = input.ndim();
    if weight.ndim() != k {
        return Err(Error::InvalidShape {
            message: format!(
                "Expected {}-dimensional input for {}-dimensional weight {:?}, but got input of size {:?} instead",
                k,
                k,
                weight.shape(),
                input.shape()
            ),
        });
    }
    if k < 3 {
        return Err(Error::InvalidShape {
            message: format!("convolution expects at least 3-dimensional input, got {:?}", input.shape()),
        });
    }
    if weight.shape()[0] < groups {
        return Err(Error::InvalidShape {
            message: format!(
                "Given groups={}, expected weight to be at least {} at dimension 0, but got weight of size {:?} instead",
                groups,
                groups,
                weight.shape()
            ),
        });
    }
    if weight.shape()[0] % groups != 0 {
        return Err(Error::InvalidShape {
            message: format!(
                "Given groups={}, weight {:?} has {} channels at dimension 0, which is not divisible by groups",
                groups,
                weight.shape(),
                weight.shape()[0]
            ),
        });
    }

    if !transposed {
        if input.shape()[1] != weight.shape()[1] * groups {
            return Err(Error::InvalidShape {
                message: format!(
                    "Given groups={}, weight {:?}, so expected input {:?} to have {} channels, but got {} channels instead",
                    groups,
                    weight.shape(),
                    input.shape(),
                    weight.shape()[1] * groups,
                    input.shape()[1]
                ),
            });
        }
        if let Some(bias) = bias {
            if bias.ndim() != 1 || bias.shape()[0] != weight.shape()[0] {
                return Err(Error::InvalidShape {
                    message: format!(
                        "Given weight of size {:?}, expected bias to be 1-dimensional with {} elements, but got bias of size {:?} instead",
                        weight.shape(),
                        weight.shape()[0],
                        bias.shape()
                    ),
                });
            }
        }
    } else {
        if input.shape()[1] != weight.shape()[0] {
            return Err(Error::InvalidShape {
                message: format!(
                    "Given transposed=true, weight {:?}, so expected input {:?} to have {} channels, but got {} channels instead",
                    weight.shape(),
                    input.shape(),
                    weight.shape()[0],
                    input.shape()[1]
                ),
            });
        }
        if let Some(bias) = bias {
            if bias.ndim() != 1 || bias.shape()[0] != weight.shape()[1] * groups {
                return Err(Error::InvalidShape {
                    message: format!(
                        "Given transposed=true, weight of size {:?}, expected bias to be 1-dimensional with {} elements, but got bias of size {:?} instead",
                        weight.shape(),
                        weight.shape()[1] * groups,
                        bias.shape()
                    ),
                });
            }
        }
    }
    Ok(())
}
