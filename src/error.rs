//! Error types for XLM decoding.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum XlmError {
    /// Lengths, ranks or indices that do not fit the declared shapes.
    #[error("shape violation: {0}")]
    ShapeViolation(String),

    /// Hyperparameters that cannot describe a valid model or search.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The attention cache does not match the call it is used in.
    #[error("cache state error: {0}")]
    State(String),

    #[error("tensor error: {0}")]
    Tensor(#[from] ndarray::ShapeError),
}

pub type Result<T> = std::result::Result<T, XlmError>;
