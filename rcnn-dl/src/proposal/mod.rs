//! Region proposal transform.

mod codec;
mod layer;
mod nms;

pub use codec::*;
pub use layer::*;
pub use nms::*;
