/// Errors returned by homography estimation and point mapping.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum HomographyError {
    /// Correspondence counts are mismatched or insufficient, or a coordinate
    /// is not finite.
    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },
    /// The homography has no usable inverse.
    #[error("homography is singular")]
    SingularMatrix,
    /// The perspective divisor vanishes at the mapped point.
    #[error("degenerate transform at ({x}, {y}): divisor {w:e}")]
    DegenerateTransform { x: f64, y: f64, w: f64 },
}

impl HomographyError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            reason: reason.into(),
        }
    }
}
