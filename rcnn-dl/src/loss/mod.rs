//! Multi-task losses of the two stages.

mod cross_entropy;
mod detector_loss;
mod smooth_l1;

pub use cross_entropy::*;
pub use detector_loss::*;
pub use smooth_l1::*;
