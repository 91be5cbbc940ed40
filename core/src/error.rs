pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Runtime error: {0}")]
    RuntimeError(String),
}
