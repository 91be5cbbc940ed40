pub mod color;
pub mod convolve;
pub mod resize;

pub use color::*;
pub use convolve::*;
pub use resize::*;

pub type Result<T> = std::result::Result<T, ImgprocError>;

#[derive(Debug, thiserror::Error)]
pub enum ImgprocError {
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
}
