//! Safe bounding box types and the center-size box regression codec.
//!
//! Boxes follow the inclusive pixel convention: a box spanning pixels
//! `x1..=x2` has width `x2 - x1 + 1`.

mod common;

pub use rect::*;
pub mod rect;

pub use xyxy::*;
pub mod xyxy;

pub use cxcywh::*;
pub mod cxcywh;

pub use delta::*;
pub mod delta;

pub mod prelude {
    pub use crate::rect::{Rect, RectFloat, RectNum};
}
