use crate::camera::{CameraModelError, Resolution};
use crate::config::ConfigError;
use crate::geometry::GeometryError;
use crate::pattern::PatternError;
use crate::persist::PersistError;

/// Failure categories of the calibration pipeline.
///
/// Only configuration-class errors abort a run; everything else is handled at
/// frame granularity and the session keeps growing.
#[derive(thiserror::Error, Debug)]
pub enum CalibrationError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),
    #[error(transparent)]
    Pattern(#[from] PatternError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Input error: {0}")]
    Input(String),
    #[error(
        "Frame size {}x{} differs from session image size {}x{}",
        .found.width, .found.height, .expected.width, .expected.height
    )]
    ImageSizeMismatch {
        expected: Resolution,
        found: Resolution,
    },
    #[error("No views accumulated, nothing to calibrate")]
    NoObservations,
    #[error("View {view} has {found} points, expected {expected}")]
    PointCountMismatch {
        view: usize,
        expected: usize,
        found: usize,
    },
    #[error("Solver failed: {0}")]
    Solver(String),
    #[error(transparent)]
    Camera(#[from] CameraModelError),
    #[error(transparent)]
    Geometry(#[from] GeometryError),
    #[error(transparent)]
    Output(#[from] PersistError),
}

impl CalibrationError {
    /// `false` for errors that must stop the run before any frame is processed.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            CalibrationError::Configuration(_)
                | CalibrationError::Pattern(_)
                | CalibrationError::Config(_)
        )
    }
}
