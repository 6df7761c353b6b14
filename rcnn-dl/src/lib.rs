//! The trainable core of a two-stage object detector.
//!
//! The crate covers the numerical pipeline between a backbone feature
//! extractor and an optimizer: anchor generation, region proposals, anchor
//! and proposal target assignment, region feature pooling, block mixing of
//! pooled features and the multi-task losses of both stages.

mod common;

pub mod anchor;
pub mod block_mix;
pub mod config;
pub mod error;
pub mod input;
pub mod loss;
pub mod model;
pub mod pooling;
pub mod postprocess;
pub mod proposal;
pub mod snapshot;
pub mod target;
