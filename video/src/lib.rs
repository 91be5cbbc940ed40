//! Video processing and optical flow
//!
//! Dense Horn-Schunck motion estimation between consecutive grey-scale frames,
//! with pyramidal Lucas-Kanade tracking and Farneback dense flow as
//! alternatives, flow-field visualization and a driver that walks an image
//! sequence pair by pair.

use cv_core::Field;
use image::GrayImage;

pub mod flow_field;
pub mod horn_schunck;
pub mod optical_flow;
pub mod sequence;
pub mod visualize;

pub use flow_field::*;
pub use horn_schunck::*;
pub use optical_flow::*;
pub use sequence::*;
pub use visualize::*;

pub type Result<T> = std::result::Result<T, VideoError>;

#[derive(Debug, thiserror::Error)]
pub enum VideoError {
    #[error("Image size mismatch: {0}")]
    SizeMismatch(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Non-finite value in {what} at ({x}, {y})")]
    NonFinite { what: &'static str, x: u32, y: u32 },

    #[error("Frame source error: {0}")]
    Source(String),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] cv_core::Error),

    #[error(transparent)]
    Imgproc(#[from] cv_imgproc::ImgprocError),
}

pub(crate) fn ensure_same_size(a: &Field, b: &Field, what: &str) -> Result<()> {
    if a.same_shape(b) {
        return Ok(());
    }
    Err(VideoError::SizeMismatch(format!(
        "{} must have the same dimensions: {}x{} vs {}x{}",
        what,
        a.width(),
        a.height(),
        b.width(),
        b.height()
    )))
}

/// Reject frame pairs no flow method can work on: different shapes, zero
/// area, or NaN/Inf samples.
pub(crate) fn check_frame_pair(prev: &Field, next: &Field) -> Result<()> {
    ensure_same_size(prev, next, "frames")?;
    if prev.is_empty() {
        return Err(VideoError::InvalidParameters(format!(
            "frames must be non-empty, got {}x{}",
            prev.width(),
            prev.height()
        )));
    }
    if let Some((x, y)) = prev.first_non_finite() {
        return Err(VideoError::NonFinite {
            what: "previous frame",
            x,
            y,
        });
    }
    if let Some((x, y)) = next.first_non_finite() {
        return Err(VideoError::NonFinite {
            what: "next frame",
            x,
            y,
        });
    }
    Ok(())
}

/// Video frame representation
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub image: GrayImage,
    pub timestamp: f64,
    pub frame_number: usize,
}

impl VideoFrame {
    pub fn new(image: GrayImage, timestamp: f64, frame_number: usize) -> Self {
        Self {
            image,
            timestamp,
            frame_number,
        }
    }
}
