//! Implements the Radial-Tangential (RadTan) camera model in its 8-coefficient
//! rational form.
//!
//! This module provides the [`RadTanModel`] struct used to express a solved
//! calibration: pinhole intrinsics plus the distortion vector
//! `[k1, k2, p1, p2, k3, k4, k5, k6]`. The radial part is the ratio
//! `(1 + k1 r² + k2 r⁴ + k3 r⁶) / (1 + k4 r² + k5 r⁴ + k6 r⁶)`, so a model with
//! `k4 = k5 = k6 = 0` reduces to the classic 5-parameter RadTan model.
//!
//! The distortion itself is exposed as [`distort_normalized`], a function
//! generic over [`nalgebra::RealField`]. The same code path is used for plain
//! `f64` projection and for automatic differentiation inside the optimizer.

use crate::camera::{validation, CameraModel, CameraModelError, Intrinsics, Resolution};
use nalgebra::{Point2, Point3, RealField};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of distortion coefficients carried by [`RadTanModel`].
pub const DISTORTION_LEN: usize = 8;

/// Index of each coefficient in the distortion vector.
pub mod coeff {
    pub const K1: usize = 0;
    pub const K2: usize = 1;
    pub const P1: usize = 2;
    pub const P2: usize = 3;
    pub const K3: usize = 4;
    pub const K4: usize = 5;
    pub const K5: usize = 6;
    pub const K6: usize = 7;
}

/// Represents a Radial-Tangential camera model with rational radial distortion.
///
/// # Examples
///
/// ```rust
/// use nalgebra::Point3;
/// use progressive_calib::camera::{CameraModel, Intrinsics, RadTanModel, Resolution};
///
/// let model = RadTanModel {
///     intrinsics: Intrinsics { fx: 500.0, fy: 500.0, cx: 320.0, cy: 240.0 },
///     resolution: Resolution { width: 640, height: 480 },
///     distortions: [0.0; 8],
/// };
/// let uv = model.project(&Point3::new(0.1, 0.2, 1.0)).unwrap();
/// assert!((uv.x - 370.0).abs() < 1e-9);
/// assert!((uv.y - 340.0).abs() < 1e-9);
/// ```
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct RadTanModel {
    pub intrinsics: Intrinsics,
    pub resolution: Resolution,
    /// `[k1, k2, p1, p2, k3, k4, k5, k6]`
    pub distortions: [f64; DISTORTION_LEN],
}

impl RadTanModel {
    pub fn new(
        intrinsics: Intrinsics,
        resolution: Resolution,
        distortions: [f64; DISTORTION_LEN],
    ) -> Result<Self, CameraModelError> {
        let model = RadTanModel {
            intrinsics,
            resolution,
            distortions,
        };
        model.validate_params()?;
        Ok(model)
    }
}

/// Provides a debug string representation for [`RadTanModel`].
impl fmt::Debug for RadTanModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RadTanModel [fx: {} fy: {} cx: {} cy: {} distortions: {:?}]",
            self.intrinsics.fx,
            self.intrinsics.fy,
            self.intrinsics.cx,
            self.intrinsics.cy,
            self.distortions,
        )
    }
}

/// Applies radial-tangential distortion to a normalized image point `(x, y)`.
///
/// # Arguments
///
/// * `x`, `y` - Normalized coordinates `X/Z`, `Y/Z`.
/// * `d` - Distortion vector `[k1, k2, p1, p2, k3, k4, k5, k6]`.
///
/// # Returns
///
/// The distorted normalized coordinates `(x'', y'')`.
pub fn distort_normalized<T: RealField>(x: T, y: T, d: &[T; DISTORTION_LEN]) -> (T, T) {
    let two = T::one() + T::one();
    let x2 = x.clone() * x.clone();
    let y2 = y.clone() * y.clone();
    let xy = x.clone() * y.clone();
    let r2 = x2.clone() + y2.clone();
    let r4 = r2.clone() * r2.clone();
    let r6 = r4.clone() * r2.clone();

    let numerator = T::one()
        + d[coeff::K1].clone() * r2.clone()
        + d[coeff::K2].clone() * r4.clone()
        + d[coeff::K3].clone() * r6.clone();
    let denominator = T::one()
        + d[coeff::K4].clone() * r2.clone()
        + d[coeff::K5].clone() * r4
        + d[coeff::K6].clone() * r6;
    let radial = numerator / denominator;

    let p1 = d[coeff::P1].clone();
    let p2 = d[coeff::P2].clone();
    let x_tan =
        two.clone() * p1.clone() * xy.clone() + p2.clone() * (r2.clone() + two.clone() * x2);
    let y_tan = p1 * (r2 + two.clone() * y2) + two * p2 * xy;

    (x * radial.clone() + x_tan, y * radial + y_tan)
}

impl CameraModel for RadTanModel {
    /// Projects a 3D point from camera coordinates to 2D image coordinates, applying distortion.
    ///
    /// Unlike a viewer-facing projection, points falling outside the image are
    /// still returned: reprojection error must account for every observed point.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::PointAtCameraCenter`]: If the 3D point's Z-coordinate is
    ///   too close to zero.
    fn project(&self, point_3d: &Point3<f64>) -> Result<Point2<f64>, CameraModelError> {
        if point_3d.z.abs() < f64::EPSILON.sqrt() {
            return Err(CameraModelError::PointAtCameraCenter);
        }

        let x_prime = point_3d.x / point_3d.z;
        let y_prime = point_3d.y / point_3d.z;
        let (x_distorted, y_distorted) = distort_normalized(x_prime, y_prime, &self.distortions);

        let u = self.intrinsics.fx * x_distorted + self.intrinsics.cx;
        let v = self.intrinsics.fy * y_distorted + self.intrinsics.cy;
        Ok(Point2::new(u, v))
    }

    /// Checks that the intrinsics are usable and every coefficient is finite.
    fn validate_params(&self) -> Result<(), CameraModelError> {
        validation::validate_intrinsics(&self.intrinsics)?;
        validation::validate_distortion(&self.distortions)?;
        Ok(())
    }
}
