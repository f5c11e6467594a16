//! Reprojection error evaluation.

use crate::camera::{CameraModel, CameraModelError, RadTanModel};
use crate::geometry::ViewPose;
use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};

#[cfg(test)]
pub(crate) mod synthetic;

#[derive(thiserror::Error, Debug)]
pub enum UtilError {
    #[error("Zero projection points")]
    ZeroProjectionPoints,
    #[error("Mismatched inputs: {0}")]
    LengthMismatch(String),
    #[error(transparent)]
    Camera(#[from] CameraModelError),
}

/// Per-view and aggregate reprojection error of a solved model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReprojectionErrors {
    /// `sqrt(sum_squared_i / n_i)` for every view, in view order.
    pub per_view: Vec<f64>,
    /// `sqrt(sum_i sum_squared_i / sum_i n_i)` over all points of all views.
    pub rms: f64,
}

/// Squared residual sum of one view.
pub fn view_squared_error(
    model: &RadTanModel,
    pose: &ViewPose,
    object_points: &[Point3<f64>],
    image_points: &[Point2<f64>],
) -> Result<f64, UtilError> {
    if object_points.len() != image_points.len() {
        return Err(UtilError::LengthMismatch(format!(
            "{} reference points vs {} observed points",
            object_points.len(),
            image_points.len()
        )));
    }
    let mut sum_squared = 0.0;
    for (p3d, observed) in object_points.iter().zip(image_points) {
        let projected = model.project(&pose.transform_point(p3d))?;
        sum_squared += (projected - observed).norm_squared();
    }
    Ok(sum_squared)
}

/// Aggregates `(sum_squared, point_count)` pairs into one RMS value.
///
/// The reduction runs over all points globally. It is not the mean of the
/// per-view RMS values, which weights views with fewer points too heavily.
pub fn aggregate_rms(views: &[(f64, usize)]) -> Result<f64, UtilError> {
    let (total_squared, total_points) = views
        .iter()
        .fold((0.0, 0usize), |(s, n), &(vs, vn)| (s + vs, n + vn));
    if total_points == 0 {
        return Err(UtilError::ZeroProjectionPoints);
    }
    Ok((total_squared / total_points as f64).sqrt())
}

/// Projects every reference set through its view pose and compares it with
/// the observed points.
pub fn compute_reprojection_errors(
    object_points: &[Vec<Point3<f64>>],
    image_points: &[Vec<Point2<f64>>],
    poses: &[ViewPose],
    model: &RadTanModel,
) -> Result<ReprojectionErrors, UtilError> {
    if object_points.len() != image_points.len() || object_points.len() != poses.len() {
        return Err(UtilError::LengthMismatch(format!(
            "{} reference sets, {} observation sets, {} poses",
            object_points.len(),
            image_points.len(),
            poses.len()
        )));
    }

    let mut sums = Vec::with_capacity(poses.len());
    let mut per_view = Vec::with_capacity(poses.len());
    for ((obj, img), pose) in object_points.iter().zip(image_points).zip(poses) {
        let sum_squared = view_squared_error(model, pose, obj, img)?;
        let n = obj.len();
        per_view.push(if n > 0 {
            (sum_squared / n as f64).sqrt()
        } else {
            0.0
        });
        sums.push((sum_squared, n));
    }

    let rms = aggregate_rms(&sums)?;
    Ok(ReprojectionErrors { per_view, rms })
}
