use thiserror::Error;

use crate::tensor::{Backend, Shape};

/// Every failure the engine reports. Nothing is retried and nothing is reshaped
/// behind the caller's back.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("invalid shape: {0}")]
    ShapeError(String),
    #[error("shape mismatch in {context}: expected {expected}, found {found}")]
    ShapeMismatch {
        context: String,
        expected: String,
        found: Shape,
    },
    #[error("unsupported layer kind `{0}`")]
    UnsupportedLayer(String),
    #[error("unsupported backend `{0}`")]
    UnsupportedBackend(String),
    #[error("unsupported dataset `{0}`")]
    UnsupportedDataset(String),
    #[error("tensor lives on {found} but {expected} was required, transfer it explicitly")]
    BackendMismatch { expected: Backend, found: Backend },
    #[error("illegal state: {0}")]
    IllegalState(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("array layout: {0}")]
    Layout(#[from] ndarray::ShapeError),
    #[error("dataset: {0:#}")]
    Dataset(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, NetError>;

impl NetError {
    pub(crate) fn mismatch(context: impl Into<String>, expected: impl ToString, found: &Shape) -> Self {
        NetError::ShapeMismatch {
            context: context.into(),
            expected: expected.to_string(),
            found: found.clone(),
        }
    }

    pub(crate) fn no_forward_state(who: &str) -> Self {
        NetError::IllegalState(format!(
            "{who}: update called without a preceding training-mode activation"
        ))
    }
}
