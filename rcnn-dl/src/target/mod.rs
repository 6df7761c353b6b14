//! Label and regression target assignment.

mod anchor_target;
mod overlap;
mod proposal_target;
mod sampling;

pub use anchor_target::*;
pub use overlap::*;
pub use proposal_target::*;
pub use sampling::*;
