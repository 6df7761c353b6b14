//! Typed failures of the detection core.

use thiserror::Error;

/// The kinds of failure raised by the detector.
///
/// Errors are carried inside [anyhow::Error]. The training loop can recover
/// the kind with `error.downcast_ref::<DetectorError>()`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DetectorError {
    /// Incompatible or invalid settings, detected at construction.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// A tensor does not have the shape an operation requires.
    #[error("input shape error: {0}")]
    InputShape(String),
    /// Unknown pooling or proposal selection mode.
    #[error("unsupported mode '{0}'")]
    UnsupportedMode(String),
}

impl DetectorError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn shape(msg: impl Into<String>) -> Self {
        Self::InputShape(msg.into())
    }
}
