//! Progressive Calibration Library
//!
//! Incremental camera calibration from a stream of planar-pattern views.
//! Every accepted view grows a [`CalibrationSession`]; the whole history is
//! then re-solved and the latest result overwrites the output document, so a
//! usable calibration exists even when the input ends early.
//!
//! - [`pattern`]: reference geometry for chessboards and circle grids
//! - [`session`]: append-only view accumulation and calibration flags
//! - [`optimization`]: solver contract and the tiny-solver backend
//! - [`util`]: reprojection error evaluation
//! - [`persist`]: output document writer
//! - [`pipeline`]: per-frame driver, frame sources and detectors

pub mod camera;
pub mod config;
pub mod error;
pub mod geometry;
pub mod optimization;
pub mod pattern;
pub mod persist;
pub mod pipeline;
pub mod session;
pub mod util;

// Re-export commonly used types
pub use camera::{CameraModel, CameraModelError, Intrinsics, RadTanModel, Resolution};
pub use config::{CalibrationSettings, ConfigError};
pub use error::CalibrationError;
pub use optimization::{
    run_calibration, CalibrationResult, CalibrationSolver, Optimizer, PlanarCalibrator,
};
pub use pattern::{generate_reference_points, PatternConfig, PatternKind};
pub use persist::{PersistOptions, ResultPersister};
pub use pipeline::{CalibrationPipeline, CornerFileDetector, Detection, ImageListSource};
pub use session::{CalibrationFlags, CalibrationSession};
