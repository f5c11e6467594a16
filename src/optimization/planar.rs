//! This module provides the cost function and optimization routines for
//! calibrating a camera from several views of a planar pattern.
//!
//! It uses the `tiny_solver` crate for non-linear optimization. The problem has
//! one intrinsic parameter block shared by all views and one 6-parameter pose
//! block (rotation vector, translation) per view. Parameters held fixed by the
//! calibration flags are left out of the intrinsic block entirely, so the
//! solver only ever sees free variables.

use crate::camera::rad_tan::{coeff, distort_normalized};
use crate::camera::{Intrinsics, RadTanModel, Resolution, DISTORTION_LEN};
use crate::error::CalibrationError;
use crate::geometry::{find_homography, pose_from_homography, rotate_point, ViewPose};
use crate::optimization::{CalibrationSolver, Optimizer, SolveOutput};
use crate::session::CalibrationFlags;
use crate::util::compute_reprojection_errors;

use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector, Matrix3, Point2, Point3, RealField, Vector3};
use std::collections::HashMap;
use tiny_solver::factors::Factor;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

const FX: usize = 0;
const FY: usize = 1;
const CX: usize = 2;
const CY: usize = 3;
const DIST: usize = 4;
/// `[fx, fy, cx, cy, k1, k2, p1, p2, k3, k4, k5, k6]`
const PARAM_LEN: usize = DIST + DISTORTION_LEN;

const INTRINSICS_BLOCK: &str = "intrinsics";

fn lit<T: RealField>(v: f64) -> T {
    nalgebra::convert(v)
}

/// Maps the free-parameter vector seen by the solver onto the full parameter set.
#[derive(Debug, Clone)]
struct ParameterLayout {
    /// Indices into the full parameter vector, in solver order.
    free: Vec<usize>,
    /// Values used for every slot not listed in `free`.
    fixed: [f64; PARAM_LEN],
    /// When set, `fx` is not a variable but `ratio * fy`.
    aspect_ratio: Option<f64>,
}

impl ParameterLayout {
    fn new(flags: CalibrationFlags, initial: &[f64; PARAM_LEN]) -> Self {
        let mut fixed = *initial;
        let aspect_ratio = flags
            .contains(CalibrationFlags::FIX_ASPECT_RATIO)
            .then(|| initial[FX] / initial[FY]);

        let mut free = vec![FY];
        if aspect_ratio.is_none() {
            free.push(FX);
        }
        if !flags.contains(CalibrationFlags::FIX_PRINCIPAL_POINT) {
            free.extend([CX, CY]);
        }
        free.extend([DIST + coeff::K1, DIST + coeff::K2, DIST + coeff::K3]);
        if flags.contains(CalibrationFlags::ZERO_TANGENT_DIST) {
            fixed[DIST + coeff::P1] = 0.0;
            fixed[DIST + coeff::P2] = 0.0;
        } else {
            free.extend([DIST + coeff::P1, DIST + coeff::P2]);
        }

        if flags.contains(CalibrationFlags::RATIONAL_MODEL) {
            if !flags.contains(CalibrationFlags::FIX_K4) {
                free.push(DIST + coeff::K4);
            }
            if !flags.contains(CalibrationFlags::FIX_K5) {
                free.push(DIST + coeff::K5);
            }
            free.push(DIST + coeff::K6);
        } else {
            fixed[DIST + coeff::K4] = 0.0;
            fixed[DIST + coeff::K5] = 0.0;
            fixed[DIST + coeff::K6] = 0.0;
        }
        free.sort_unstable();

        ParameterLayout {
            free,
            fixed,
            aspect_ratio,
        }
    }

    fn pack(&self, full: &[f64; PARAM_LEN]) -> DVector<f64> {
        DVector::from_iterator(self.free.len(), self.free.iter().map(|&idx| full[idx]))
    }

    fn unpack<T: RealField>(&self, free: &DVector<T>) -> [T; PARAM_LEN] {
        let mut full: [T; PARAM_LEN] = self.fixed.map(lit);
        for (slot, &idx) in self.free.iter().enumerate() {
            full[idx] = free[slot].clone();
        }
        if let Some(ratio) = self.aspect_ratio {
            full[FX] = full[FY].clone() * lit(ratio);
        }
        full
    }
}

/// Reprojection residuals of one view, `projected - observed` per point.
#[derive(Debug, Clone)]
struct ViewReprojectionCost {
    layout: ParameterLayout,
    object_points: Vec<Vector3<f64>>,
    image_points: Vec<Point2<f64>>,
}

impl<T: RealField> Factor<T> for ViewReprojectionCost {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let camera = self.layout.unpack(&params[0]);
        let pose = &params[1];
        let r = [pose[0].clone(), pose[1].clone(), pose[2].clone()];
        let t = [pose[3].clone(), pose[4].clone(), pose[5].clone()];
        let d: [T; DISTORTION_LEN] = std::array::from_fn(|i| camera[DIST + i].clone());

        let mut residuals = DVector::zeros(self.image_points.len() * 2);
        for (i, (p3d, p2d)) in self
            .object_points
            .iter()
            .zip(&self.image_points)
            .enumerate()
        {
            let pc = rotate_point(&r, &[lit(p3d.x), lit(p3d.y), lit(p3d.z)]);
            let z = pc[2].clone() + t[2].clone();
            let x = (pc[0].clone() + t[0].clone()) / z.clone();
            let y = (pc[1].clone() + t[1].clone()) / z;
            let (xd, yd) = distort_normalized(x, y, &d);

            residuals[i * 2] = camera[FX].clone() * xd + camera[CX].clone() - lit(p2d.x);
            residuals[i * 2 + 1] = camera[FY].clone() * yd + camera[CY].clone() - lit(p2d.y);
        }
        residuals
    }
}

/// Cost structure for planar multi-view calibration.
///
/// Holds every view's correspondences, the current [`RadTanModel`] estimate and
/// one pose per view.
#[derive(Clone)]
pub struct PlanarCalibrationCost {
    model: RadTanModel,
    poses: Vec<ViewPose>,
    object_points: Vec<Vec<Point3<f64>>>,
    image_points: Vec<Vec<Point2<f64>>>,
    flags: CalibrationFlags,
}

impl PlanarCalibrationCost {
    /// Creates a cost structure seeded with `camera_matrix` and `distortion`.
    ///
    /// Every view needs at least 4 points, all reference points must lie on
    /// the `z = 0` plane, and the two point lists must be parallel.
    pub fn new(
        object_points: &[Vec<Point3<f64>>],
        image_points: &[Vec<Point2<f64>>],
        image_size: Resolution,
        camera_matrix: &Matrix3<f64>,
        distortion: &[f64; DISTORTION_LEN],
        flags: CalibrationFlags,
    ) -> Result<Self, CalibrationError> {
        if object_points.is_empty() {
            return Err(CalibrationError::NoObservations);
        }
        if object_points.len() != image_points.len() {
            return Err(CalibrationError::Solver(format!(
                "{} reference sets but {} observation sets",
                object_points.len(),
                image_points.len()
            )));
        }
        for (view, (obj, img)) in object_points.iter().zip(image_points).enumerate() {
            if obj.len() != img.len() || obj.len() < 4 {
                return Err(CalibrationError::PointCountMismatch {
                    view,
                    expected: obj.len().max(4),
                    found: img.len(),
                });
            }
            if obj.iter().any(|p| p.z.abs() > f64::EPSILON) {
                return Err(CalibrationError::Solver(format!(
                    "reference points of view {view} are not planar (z != 0)"
                )));
            }
        }

        Ok(PlanarCalibrationCost {
            model: RadTanModel {
                intrinsics: Intrinsics::from_camera_matrix(camera_matrix),
                resolution: image_size,
                distortions: *distortion,
            },
            poses: Vec::new(),
            object_points: object_points.to_vec(),
            image_points: image_points.to_vec(),
            flags,
        })
    }

    pub fn model(&self) -> &RadTanModel {
        &self.model
    }

    pub fn poses(&self) -> &[ViewPose] {
        &self.poses
    }

    fn full_params(&self) -> [f64; PARAM_LEN] {
        let mut full = [0.0; PARAM_LEN];
        full[FX] = self.model.intrinsics.fx;
        full[FY] = self.model.intrinsics.fy;
        full[CX] = self.model.intrinsics.cx;
        full[CY] = self.model.intrinsics.cy;
        full[DIST..].copy_from_slice(&self.model.distortions);
        full
    }

    fn set_full_params(&mut self, full: &[f64; PARAM_LEN]) {
        self.model.intrinsics = Intrinsics {
            fx: full[FX],
            fy: full[FY],
            cx: full[CX],
            cy: full[CY],
        };
        self.model.distortions.copy_from_slice(&full[DIST..]);
    }

    /// Focal lengths from the orthogonality constraints of each homography.
    ///
    /// With the principal point known, every homography gives two linear
    /// equations in `1/fx²` and `1/fy²`. A fixed aspect ratio collapses them to
    /// one unknown. Returns `None` when the system has no positive solution.
    fn estimate_focal_lengths(
        homographies: &[Matrix3<f64>],
        cx: f64,
        cy: f64,
        aspect_ratio: Option<f64>,
    ) -> Result<Option<(f64, f64)>, CalibrationError> {
        let shift = Matrix3::new(1.0, 0.0, -cx, 0.0, 1.0, -cy, 0.0, 0.0, 1.0);
        let n = homographies.len();
        let mut a = DMatrix::<f64>::zeros(2 * n, 2);
        let mut b = DVector::<f64>::zeros(2 * n);

        for (i, h) in homographies.iter().enumerate() {
            let hc = shift * h;
            let hc = hc / hc.norm();
            let (h1, h2) = (hc.column(0), hc.column(1));

            a[(2 * i, 0)] = h1[0] * h2[0];
            a[(2 * i, 1)] = h1[1] * h2[1];
            b[2 * i] = -h1[2] * h2[2];

            a[(2 * i + 1, 0)] = h1[0] * h1[0] - h2[0] * h2[0];
            a[(2 * i + 1, 1)] = h1[1] * h1[1] - h2[1] * h2[1];
            b[2 * i + 1] = -(h1[2] * h1[2] - h2[2] * h2[2]);
        }

        let (inv_fx2, inv_fy2) = match aspect_ratio {
            Some(ratio) => {
                let r2 = ratio * ratio;
                let col = a.column(0) / r2 + a.column(1);
                let denom = col.dot(&col);
                if denom <= f64::EPSILON * f64::EPSILON {
                    return Ok(None);
                }
                let inv_fy2 = col.dot(&b) / denom;
                (inv_fy2 / r2, inv_fy2)
            }
            None => {
                let svd = a.svd(true, true);
                let x = svd
                    .solve(&b, 1e-14)
                    .map_err(|e| CalibrationError::Solver(e.to_string()))?;
                (x[0], x[1])
            }
        };

        if inv_fx2 > 0.0 && inv_fy2 > 0.0 && inv_fx2.is_finite() && inv_fy2.is_finite() {
            Ok(Some((1.0 / inv_fx2.sqrt(), 1.0 / inv_fy2.sqrt())))
        } else {
            Ok(None)
        }
    }
}

impl Optimizer for PlanarCalibrationCost {
    /// Initial intrinsics and poses from per-view homographies.
    ///
    /// Without `USE_INTRINSIC_GUESS` the principal point starts at the image
    /// center and the focal lengths come from the homography constraints
    /// (falling back to the larger image side when those are degenerate).
    fn linear_estimation(&mut self) -> Result<(), CalibrationError> {
        let homographies = self
            .object_points
            .iter()
            .zip(&self.image_points)
            .map(|(obj, img)| {
                let plane: Vec<Point2<f64>> = obj.iter().map(|p| Point2::new(p.x, p.y)).collect();
                find_homography(&plane, img)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let seed = self.model.intrinsics.clone();
        let aspect_ratio = self
            .flags
            .contains(CalibrationFlags::FIX_ASPECT_RATIO)
            .then(|| seed.fx / seed.fy);

        if !self.flags.contains(CalibrationFlags::USE_INTRINSIC_GUESS) {
            let (cx, cy) = self.model.resolution.center();
            let estimate = Self::estimate_focal_lengths(&homographies, cx, cy, aspect_ratio)?;
            let (fx, fy) = match estimate {
                Some(focal) => focal,
                None => {
                    let f = self.model.resolution.width.max(self.model.resolution.height) as f64;
                    warn!("Degenerate focal length estimate, falling back to f = {}", f);
                    (aspect_ratio.map_or(f, |r| r * f), f)
                }
            };
            self.model.intrinsics = Intrinsics { fx, fy, cx, cy };
        }
        debug!("Linear estimate: {:?}", self.model);

        let k = self.model.intrinsics.camera_matrix();
        self.poses = homographies
            .iter()
            .map(|h| pose_from_homography(&k, h))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(())
    }

    /// Refines intrinsics, distortion and all poses with Levenberg-Marquardt.
    ///
    /// Requires [`Optimizer::linear_estimation`] to have produced the poses.
    fn optimize(&mut self, verbose: bool) -> Result<(), CalibrationError> {
        if self.poses.len() != self.image_points.len() {
            return Err(CalibrationError::Solver(
                "poses are not initialized, run linear_estimation first".to_string(),
            ));
        }

        let initial_full = self.full_params();
        let layout = ParameterLayout::new(self.flags, &initial_full);

        let mut problem = tiny_solver::Problem::new();
        let mut initial_values = HashMap::new();
        initial_values.insert(INTRINSICS_BLOCK.to_string(), layout.pack(&initial_full));

        for (i, ((obj, img), pose)) in self
            .object_points
            .iter()
            .zip(&self.image_points)
            .zip(&self.poses)
            .enumerate()
        {
            let pose_name = format!("pose_{i}");
            let cost_function = ViewReprojectionCost {
                layout: layout.clone(),
                object_points: obj.iter().map(|p| p.coords).collect(),
                image_points: img.clone(),
            };
            problem.add_residual_block(
                img.len() * 2,
                &[INTRINSICS_BLOCK, pose_name.as_str()],
                Box::new(cost_function),
                None,
            );
            initial_values.insert(pose_name, DVector::from_row_slice(&pose.to_row()));
        }

        if verbose {
            info!(
                "Starting tiny-solver Levenberg-Marquardt over {} free intrinsics and {} poses...",
                layout.free.len(),
                self.poses.len()
            );
        }

        let optimizer = LevenbergMarquardtOptimizer::default();
        let result = optimizer
            .optimize(&problem, &initial_values, None)
            .ok_or_else(|| CalibrationError::Solver("Optimization failed".to_string()))?;

        if verbose {
            info!("Optimization finished");
        }

        let intrinsics = result.get(INTRINSICS_BLOCK).ok_or_else(|| {
            CalibrationError::Solver("solution is missing the intrinsics block".to_string())
        })?;
        self.set_full_params(&layout.unpack(intrinsics));

        for (i, pose) in self.poses.iter_mut().enumerate() {
            let p = result.get(&format!("pose_{i}")).ok_or_else(|| {
                CalibrationError::Solver(format!("solution is missing pose_{i}"))
            })?;
            *pose = ViewPose {
                rotation: Vector3::new(p[0], p[1], p[2]),
                translation: Vector3::new(p[3], p[4], p[5]),
            };
        }
        Ok(())
    }

    fn get_intrinsics(&self) -> Intrinsics {
        self.model.intrinsics.clone()
    }
}

/// Default [`CalibrationSolver`]: linear initialization followed by
/// tiny-solver Levenberg-Marquardt refinement.
#[derive(Debug, Clone, Default)]
pub struct PlanarCalibrator {
    pub verbose: bool,
}

impl CalibrationSolver for PlanarCalibrator {
    fn solve(
        &self,
        object_points: &[Vec<Point3<f64>>],
        image_points: &[Vec<Point2<f64>>],
        image_size: Resolution,
        camera_matrix: &Matrix3<f64>,
        distortion: &[f64; DISTORTION_LEN],
        flags: CalibrationFlags,
    ) -> Result<SolveOutput, CalibrationError> {
        let mut cost = PlanarCalibrationCost::new(
            object_points,
            image_points,
            image_size,
            camera_matrix,
            distortion,
            flags,
        )?;
        cost.linear_estimation()?;
        cost.optimize(self.verbose)?;
        debug!("Refined intrinsics: {:?}", cost.get_intrinsics());

        // A diverged solution still comes back; the caller decides on plausibility.
        let rms = compute_reprojection_errors(object_points, image_points, &cost.poses, &cost.model)
            .map(|errors| errors.rms)
            .unwrap_or(f64::NAN);

        Ok(SolveOutput {
            camera_matrix: cost.model.intrinsics.camera_matrix(),
            distortion: cost.model.distortions,
            poses: cost.poses,
            rms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::{generate_reference_points, PatternConfig, PatternKind};
    use crate::util::synthetic::{orbit_poses, project_views, vga_model};
    use approx::assert_relative_eq;

    struct Scene {
        board: Vec<Point3<f64>>,
        views: Vec<Vec<Point2<f64>>>,
        truth: RadTanModel,
    }

    fn make_scene(
        intrinsics: Intrinsics,
        distortions: [f64; DISTORTION_LEN],
        (width, height): (u32, u32),
        square: f64,
        n_views: usize,
    ) -> Scene {
        let pattern = PatternConfig::new(PatternKind::Chessboard, width, height, square).unwrap();
        let board = generate_reference_points(&pattern);
        let truth = vga_model(intrinsics, distortions);
        let extent = ((width - 1) as f64 * square, (height - 1) as f64 * square);
        let poses = orbit_poses(n_views, extent, 0.3);
        let views = project_views(&truth, &board, &poses);
        Scene {
            board,
            views,
            truth,
        }
    }

    fn solve(scene: &Scene, flags: CalibrationFlags, seed: Matrix3<f64>) -> SolveOutput {
        let object_points = vec![scene.board.clone(); scene.views.len()];
        PlanarCalibrator::default()
            .solve(
                &object_points,
                &scene.views,
                scene.truth.resolution,
                &seed,
                &[0.0; DISTORTION_LEN],
                flags | CalibrationFlags::FIX_K4 | CalibrationFlags::FIX_K5,
            )
            .unwrap()
    }

    #[test]
    fn test_layout_pack_unpack() {
        let mut full = [0.0; PARAM_LEN];
        full[FX] = 1000.0;
        full[FY] = 800.0;
        full[CX] = 320.0;
        full[CY] = 240.0;
        full[DIST + coeff::P1] = 0.5;

        let flags = CalibrationFlags::FIX_ASPECT_RATIO
            | CalibrationFlags::FIX_PRINCIPAL_POINT
            | CalibrationFlags::ZERO_TANGENT_DIST;
        let layout = ParameterLayout::new(flags, &full);
        // fy, k1, k2, k3
        assert_eq!(layout.free.len(), 4);

        let mut packed = layout.pack(&full);
        packed[0] = 400.0;
        let unpacked: [f64; PARAM_LEN] = layout.unpack(&packed);
        assert_relative_eq!(unpacked[FY], 400.0);
        assert_relative_eq!(unpacked[FX], 500.0);
        assert_eq!(unpacked[CX], 320.0);
        assert_eq!(unpacked[DIST + coeff::P1], 0.0);

        let layout = ParameterLayout::new(CalibrationFlags::NONE, &full);
        assert_eq!(layout.free.len(), 9);
        let unpacked: [f64; PARAM_LEN] = layout.unpack(&layout.pack(&full));
        assert_eq!(unpacked, full);
    }

    #[test]
    fn test_linear_estimation_recovers_focal_length() {
        let intrinsics = Intrinsics {
            fx: 800.0,
            fy: 780.0,
            cx: 319.5,
            cy: 239.5,
        };
        let scene = make_scene(intrinsics, [0.0; DISTORTION_LEN], (9, 6), 0.02, 6);
        let object_points = vec![scene.board.clone(); scene.views.len()];
        let mut cost = PlanarCalibrationCost::new(
            &object_points,
            &scene.views,
            scene.truth.resolution,
            &Matrix3::identity(),
            &[0.0; DISTORTION_LEN],
            CalibrationFlags::NONE,
        )
        .unwrap();
        cost.linear_estimation().unwrap();

        assert_relative_eq!(cost.get_intrinsics().fx, 800.0, max_relative = 1e-6);
        assert_relative_eq!(cost.get_intrinsics().fy, 780.0, max_relative = 1e-6);
        assert_eq!(cost.poses().len(), 6);
    }

    #[test]
    fn test_optimize_noise_free_views() {
        let intrinsics = Intrinsics {
            fx: 810.0,
            fy: 790.0,
            cx: 322.0,
            cy: 236.0,
        };
        let scene = make_scene(intrinsics, [0.0; DISTORTION_LEN], (9, 6), 0.02, 8);
        let solved = solve(&scene, CalibrationFlags::NONE, Matrix3::identity());

        assert!(solved.rms < 1e-3, "rms too large: {}", solved.rms);
        assert_relative_eq!(solved.camera_matrix[(0, 0)], 810.0, max_relative = 1e-4);
        assert_relative_eq!(solved.camera_matrix[(1, 1)], 790.0, max_relative = 1e-4);
        assert_relative_eq!(solved.camera_matrix[(0, 2)], 322.0, epsilon = 0.05);
        assert_relative_eq!(solved.camera_matrix[(1, 2)], 236.0, epsilon = 0.05);
        assert_eq!(solved.distortion[coeff::K4], 0.0);
        assert_eq!(solved.distortion[coeff::K5], 0.0);
        assert_eq!(solved.poses.len(), 8);
    }

    #[test]
    fn test_optimize_recovers_radial_distortion() {
        let intrinsics = Intrinsics {
            fx: 800.0,
            fy: 800.0,
            cx: 319.5,
            cy: 239.5,
        };
        let mut distortions = [0.0; DISTORTION_LEN];
        distortions[coeff::K1] = -0.15;
        let scene = make_scene(intrinsics, distortions, (9, 6), 0.02, 10);
        let solved = solve(&scene, CalibrationFlags::NONE, Matrix3::identity());

        assert!(solved.rms < 1e-2, "rms too large: {}", solved.rms);
        assert_relative_eq!(solved.camera_matrix[(0, 0)], 800.0, max_relative = 1e-2);
    }

    #[test]
    fn test_constraint_flags_hold_after_solve() {
        let intrinsics = Intrinsics {
            fx: 800.0,
            fy: 800.0,
            cx: 319.5,
            cy: 239.5,
        };
        let scene = make_scene(intrinsics, [0.0; DISTORTION_LEN], (9, 6), 0.02, 6);
        let flags = CalibrationFlags::FIX_ASPECT_RATIO
            | CalibrationFlags::FIX_PRINCIPAL_POINT
            | CalibrationFlags::ZERO_TANGENT_DIST;
        let solved = solve(&scene, flags, Matrix3::identity());

        let k = solved.camera_matrix;
        assert_relative_eq!(k[(0, 0)] / k[(1, 1)], 1.0, epsilon = 1e-12);
        assert_eq!(k[(0, 2)], 319.5);
        assert_eq!(k[(1, 2)], 239.5);
        assert_eq!(solved.distortion[coeff::P1], 0.0);
        assert_eq!(solved.distortion[coeff::P2], 0.0);
        assert!(solved.rms < 1e-3, "rms too large: {}", solved.rms);
    }

    #[test]
    fn test_invalid_inputs_are_rejected() {
        let board = vec![Point3::new(0.0, 0.0, 0.0); 4];
        let view = vec![Point2::new(0.0, 0.0); 4];
        let size = Resolution {
            width: 10,
            height: 10,
        };
        let k = Matrix3::identity();
        let d = [0.0; DISTORTION_LEN];
        let flags = CalibrationFlags::NONE;

        assert!(matches!(
            PlanarCalibrationCost::new(&[], &[], size, &k, &d, flags),
            Err(CalibrationError::NoObservations)
        ));
        let short = view[..3].to_vec();
        assert!(matches!(
            PlanarCalibrationCost::new(&[board.clone()], &[short], size, &k, &d, flags),
            Err(CalibrationError::PointCountMismatch { .. })
        ));
        let lifted = vec![Point3::new(0.0, 0.0, 1.0); 4];
        assert!(matches!(
            PlanarCalibrationCost::new(&[lifted], &[view.clone()], size, &k, &d, flags),
            Err(CalibrationError::Solver(_))
        ));

        let mut cost = PlanarCalibrationCost::new(&[board], &[view], size, &k, &d, flags).unwrap();
        assert!(matches!(cost.optimize(false), Err(CalibrationError::Solver(_))));
    }
}
