use thiserror::Error;

/// Errors produced while rectifying or augmenting an image.
///
/// The first three variants are data-quality failures of the input geometry and
/// are never retryable. The rest come from the surrounding I/O.
#[derive(Debug, Error)]
pub enum PrepError {
    #[error("invalid corner geometry: {0}")]
    InvalidCornerGeometry(String),

    #[error("homography estimation failed: {0}")]
    HomographyEstimationFailed(String),

    #[error("empty region: {width}x{height} after clamping to {image_width}x{image_height}")]
    EmptyRegion {
        width: i64,
        height: i64,
        image_width: u32,
        image_height: u32,
    },

    #[error("malformed annotation: {0}")]
    Annotation(String),

    #[error("invalid locator '{0}'")]
    Locator(String),

    #[error("image codec error: {0}")]
    Image(#[from] image::ImageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PrepError>;
