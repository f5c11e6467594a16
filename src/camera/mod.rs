//! Camera intrinsics, image resolution and the projection model used by the
//! calibration pipeline.

use nalgebra::{Matrix3, Point2, Point3};
use serde::{Deserialize, Serialize};

pub mod rad_tan;

pub use rad_tan::{RadTanModel, DISTORTION_LEN};

/// Pinhole intrinsics without skew.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl Intrinsics {
    /// Builds intrinsics from the upper triangle of a 3x3 camera matrix.
    pub fn from_camera_matrix(k: &Matrix3<f64>) -> Self {
        Intrinsics {
            fx: k[(0, 0)],
            fy: k[(1, 1)],
            cx: k[(0, 2)],
            cy: k[(1, 2)],
        }
    }

    pub fn camera_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, 0.0, self.cx, //
            0.0, self.fy, self.cy, //
            0.0, 0.0, 1.0,
        )
    }
}

/// Image size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Pixel-center principal point, `((w - 1) / 2, (h - 1) / 2)`.
    pub fn center(&self) -> (f64, f64) {
        (
            (self.width as f64 - 1.0) * 0.5,
            (self.height as f64 - 1.0) * 0.5,
        )
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CameraModelError {
    #[error("z is close to zero, point is at camera center")]
    PointAtCameraCenter,
    #[error("Focal length must be positive")]
    FocalLengthMustBePositive,
    #[error("Principal point must be finite")]
    PrincipalPointMustBeFinite,
    #[error("Distortion coefficients must be finite")]
    DistortionMustBeFinite,
    #[error("Invalid camera parameters: {0}")]
    InvalidParams(String),
}

/// Core functionality of a camera projection model.
pub trait CameraModel {
    /// Projects a point given in camera coordinates to pixel coordinates.
    fn project(&self, point_3d: &Point3<f64>) -> Result<Point2<f64>, CameraModelError>;

    /// Validates the model parameters.
    fn validate_params(&self) -> Result<(), CameraModelError>;
}

/// Common validation functions for camera parameters
pub mod validation {
    use super::*;

    pub fn validate_intrinsics(intrinsics: &Intrinsics) -> Result<(), CameraModelError> {
        if !(intrinsics.fx.is_finite() && intrinsics.fy.is_finite())
            || intrinsics.fx <= 0.0
            || intrinsics.fy <= 0.0
        {
            return Err(CameraModelError::FocalLengthMustBePositive);
        }
        if !intrinsics.cx.is_finite() || !intrinsics.cy.is_finite() {
            return Err(CameraModelError::PrincipalPointMustBeFinite);
        }
        Ok(())
    }

    pub fn validate_distortion(distortion: &[f64]) -> Result<(), CameraModelError> {
        if distortion.iter().any(|d| !d.is_finite()) {
            return Err(CameraModelError::DistortionMustBeFinite);
        }
        Ok(())
    }
}
