//! Synthetic planar scenes for tests.

use crate::camera::{CameraModel, Intrinsics, RadTanModel, Resolution, DISTORTION_LEN};
use crate::geometry::ViewPose;
use nalgebra::{Point2, Point3, Rotation3, Vector3};

pub fn vga_model(intrinsics: Intrinsics, distortions: [f64; DISTORTION_LEN]) -> RadTanModel {
    RadTanModel {
        intrinsics,
        resolution: Resolution {
            width: 640,
            height: 480,
        },
        distortions,
    }
}

/// `n` well-conditioned poses looking at a board of size `extent`, each
/// tilted about a different axis and centered in front of the camera.
pub fn orbit_poses(n: usize, extent: (f64, f64), distance: f64) -> Vec<ViewPose> {
    let center = Vector3::new(extent.0 * 0.5, extent.1 * 0.5, 0.0);
    (0..n)
        .map(|i| {
            let phase = i as f64 * std::f64::consts::TAU / n as f64;
            let tilt = 0.35 + 0.05 * (i % 3) as f64;
            let roll = 0.1 * (i as f64 - n as f64 / 2.0) / n as f64;
            let axis = Vector3::new(phase.cos() * tilt, phase.sin() * tilt, roll);
            let rotation = Rotation3::new(axis);
            let offset = Vector3::new(
                0.01 * phase.sin(),
                0.01 * phase.cos(),
                distance + 0.02 * (i % 4) as f64,
            );
            let translation = offset - rotation * center;
            ViewPose::from_rotation_matrix(rotation.matrix(), translation)
        })
        .collect()
}

/// Projects `board` through every pose.
pub fn project_views(
    model: &RadTanModel,
    board: &[Point3<f64>],
    poses: &[ViewPose],
) -> Vec<Vec<Point2<f64>>> {
    poses
        .iter()
        .map(|pose| {
            board
                .iter()
                .map(|p| model.project(&pose.transform_point(p)).unwrap())
                .collect()
        })
        .collect()
}
