mod conv;

use criterion::criterion_group;

criterion_group!(benches, conv::forward, conv::backward, conv::double_backward);
