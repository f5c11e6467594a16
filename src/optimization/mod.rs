//! The `optimization` module turns an accumulated session into a calibration.
//!
//! [`CalibrationSolver`] is the seam to the numerical backend: it receives the
//! full view history and returns intrinsics, distortion and per-view poses.
//! [`run_calibration`] wraps any solver with the decisions this crate makes
//! regardless of backend:
//!
//! 1. An empty session is rejected before the backend is touched.
//! 2. The two highest-order radial terms in use, `k4` and `k5`, are always
//!    pinned to zero (`FIX_K4 | FIX_K5`), independent of user flags.
//! 3. With `FIX_ASPECT_RATIO`, the seed camera matrix carries the configured
//!    aspect ratio in its focal-x entry.
//! 4. The solved parameters are validated; an implausible result is reported
//!    through `success = false` rather than as an error.
//!
//! The default backend is [`PlanarCalibrator`], a linear initialization
//! followed by Levenberg-Marquardt refinement with `tiny_solver`.

use crate::camera::rad_tan::coeff;
use crate::camera::{
    CameraModel, CameraModelError, Intrinsics, RadTanModel, Resolution, DISTORTION_LEN,
};
use crate::error::CalibrationError;
use crate::geometry::ViewPose;
use crate::session::{CalibrationFlags, CalibrationSession};
use crate::util::compute_reprojection_errors;
use chrono::{DateTime, Local};
use log::{debug, info};
use nalgebra::{Matrix3, Point2, Point3};

pub mod planar;

pub use planar::{PlanarCalibrationCost, PlanarCalibrator};

/// Raw output of a [`CalibrationSolver`].
#[derive(Debug, Clone)]
pub struct SolveOutput {
    pub camera_matrix: Matrix3<f64>,
    /// `[k1, k2, p1, p2, k3, k4, k5, k6]`
    pub distortion: [f64; DISTORTION_LEN],
    pub poses: Vec<ViewPose>,
    /// RMS reported by the backend.
    pub rms: f64,
}

/// Full-history least-squares calibration backend.
pub trait CalibrationSolver {
    /// Solves for intrinsics, distortion and one pose per view.
    ///
    /// # Arguments
    ///
    /// * `object_points` - One reference set per view, parallel to `image_points`.
    /// * `image_points` - Observed points per view, index-aligned with the reference set.
    /// * `image_size` - Size of every frame in the session.
    /// * `camera_matrix` - Seed camera matrix.
    /// * `distortion` - Seed distortion vector; fixed entries keep these values.
    /// * `flags` - Constraint bit-set.
    fn solve(
        &self,
        object_points: &[Vec<Point3<f64>>],
        image_points: &[Vec<Point2<f64>>],
        image_size: Resolution,
        camera_matrix: &Matrix3<f64>,
        distortion: &[f64; DISTORTION_LEN],
        flags: CalibrationFlags,
    ) -> Result<SolveOutput, CalibrationError>;
}

/// Common interface of a single-model optimization task.
///
/// Implementors hold their correspondences and current estimate; a linear
/// estimation provides the starting point for the non-linear refinement.
pub trait Optimizer {
    /// Computes a closed-form estimate of the model and the view poses.
    fn linear_estimation(&mut self) -> Result<(), CalibrationError>;

    /// Refines every free parameter by minimizing the reprojection error.
    fn optimize(&mut self, verbose: bool) -> Result<(), CalibrationError>;

    fn get_intrinsics(&self) -> Intrinsics;
}

/// A solved calibration for the whole session.
#[derive(Debug, Clone)]
pub struct CalibrationResult {
    pub camera_matrix: Matrix3<f64>,
    pub distortion: [f64; DISTORTION_LEN],
    /// One pose per view, in view order.
    pub extrinsics: Vec<ViewPose>,
    pub per_view_errors: Vec<f64>,
    /// Aggregate RMS over every point of every view.
    pub rms: f64,
    /// RMS reported by the solver backend.
    pub solver_rms: f64,
    /// `false` when the solved parameters are non-finite or implausible.
    pub success: bool,
    /// Local time at which the solve finished; stamped into the output document.
    pub timestamp: DateTime<Local>,
}

/// Checks that the camera matrix and distortion are finite with positive focal lengths.
pub fn check_solution(
    camera_matrix: &Matrix3<f64>,
    distortion: &[f64; DISTORTION_LEN],
) -> Result<(), CameraModelError> {
    if camera_matrix.iter().any(|v| !v.is_finite()) {
        return Err(CameraModelError::InvalidParams(
            "camera matrix has non-finite entries".to_string(),
        ));
    }
    RadTanModel {
        intrinsics: Intrinsics::from_camera_matrix(camera_matrix),
        resolution: Resolution {
            width: 0,
            height: 0,
        },
        distortions: *distortion,
    }
    .validate_params()
}

/// Solves the whole session history with `solver` and evaluates the result.
pub fn run_calibration<S>(
    session: &CalibrationSession,
    solver: &S,
) -> Result<CalibrationResult, CalibrationError>
where
    S: CalibrationSolver + ?Sized,
{
    if session.is_empty() {
        return Err(CalibrationError::NoObservations);
    }
    let image_size = session.image_size().ok_or_else(|| {
        CalibrationError::Input("session has views but no image size".to_string())
    })?;

    let mut camera_matrix = Matrix3::identity();
    if session.flags().contains(CalibrationFlags::FIX_ASPECT_RATIO) {
        camera_matrix[(0, 0)] = session.aspect_ratio();
    }
    // k4 and k5 stay at zero whatever the user flags say.
    let mut distortion = [0.0; DISTORTION_LEN];
    distortion[coeff::K4] = 0.0;
    distortion[coeff::K5] = 0.0;

    let object_points = vec![session.reference_points().to_vec(); session.len()];
    let flags = session.flags() | CalibrationFlags::FIX_K4 | CalibrationFlags::FIX_K5;
    debug!(
        "Solving {} views with flags {} ({})",
        session.len(),
        flags.bits(),
        session.flags().describe()
    );

    let solved = solver.solve(
        &object_points,
        session.views(),
        image_size,
        &camera_matrix,
        &distortion,
        flags,
    )?;
    info!("RMS error reported by solver: {}", solved.rms);

    let success = match check_solution(&solved.camera_matrix, &solved.distortion) {
        Ok(()) => true,
        Err(e) => {
            debug!("Rejecting solution: {}", e);
            false
        }
    };

    let (per_view_errors, rms) = if success {
        let model = RadTanModel {
            intrinsics: Intrinsics::from_camera_matrix(&solved.camera_matrix),
            resolution: image_size,
            distortions: solved.distortion,
        };
        let errors =
            compute_reprojection_errors(&object_points, session.views(), &solved.poses, &model)
                .map_err(|e| CalibrationError::Solver(e.to_string()))?;
        (errors.per_view, errors.rms)
    } else {
        (Vec::new(), f64::NAN)
    };

    Ok(CalibrationResult {
        camera_matrix: solved.camera_matrix,
        distortion: solved.distortion,
        extrinsics: solved.poses,
        per_view_errors,
        rms,
        solver_rms: solved.rms,
        success,
        timestamp: Local::now(),
    })
}
