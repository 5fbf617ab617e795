//! Error types for the relief crate.

use thiserror::Error;

/// Errors that can occur while rasterizing, cataloguing or serving elevation.
#[derive(Debug, Error)]
pub enum ReliefError {
    /// No samples were supplied to the rasterizer.
    #[error("No samples to rasterize")]
    EmptyInput,

    /// A caller-supplied parameter is out of range or malformed.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// No source, cached or remote, produced a valid elevation.
    #[error("No elevation data available: {0}")]
    NoCoverage(String),

    /// A remote service could not be reached or answered with an error.
    #[error("Remote service unavailable: {0}")]
    RemoteUnavailable(String),

    /// A file or remote response could not be parsed as a raster or image.
    #[error("Decode error: {0}")]
    DecodeError(String),

    /// A coordinate transformation failed or a CRS is unknown.
    #[error("Projection error: {0}")]
    Projection(String),

    /// I/O error reading or writing a file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TIFF encoding or decoding error.
    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    /// PNG encoding or decoding error.
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// Catalog lock was poisoned (a thread panicked while holding the lock).
    #[error("Catalog lock was poisoned")]
    LockPoisoned,
}

impl ReliefError {
    /// Whether the resolution chain may recover from this error by trying the next stage.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ReliefError::NoCoverage(_)
                | ReliefError::RemoteUnavailable(_)
                | ReliefError::DecodeError(_)
        )
    }

    /// Whether the error was caused by the caller rather than by data or services.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, ReliefError::EmptyInput | ReliefError::InvalidParameter(_))
    }
}

impl From<reqwest::Error> for ReliefError {
    fn from(e: reqwest::Error) -> Self {
        ReliefError::RemoteUnavailable(e.to_string())
    }
}
