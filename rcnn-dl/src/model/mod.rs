//! The two-stage detector and its heads.

mod backbone;
mod detector;
mod engine;
mod head;
mod output;
mod rpn;

pub use backbone::*;
pub use detector::*;
pub use engine::*;
pub use head::*;
pub use output::*;
pub use rpn::*;

use crate::common::*;

/// Create a `weight` variable drawn from `N(0, stdev)`.
///
/// With `truncated`, the samples are folded into `(-2, 2)` before scaling.
fn normal_var(path: &nn::Path, dims: &[i64], stdev: f64, truncated: bool) -> Tensor {
    if truncated {
        let init = tch::no_grad(|| {
            Tensor::randn(dims, (Kind::Float, path.device())).fmod(2.0) * stdev
        });
        path.var_copy("weight", &init)
    } else {
        path.var("weight", dims, nn::Init::Randn { mean: 0.0, stdev })
    }
}
