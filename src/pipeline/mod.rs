//! Per-frame driver of a progressive calibration run.
//!
//! For every frame: detect, accumulate, solve over the whole history, check,
//! persist. The session is owned by the [`CalibrationPipeline`] and nothing
//! else mutates it.

mod detector;
mod source;

pub use detector::{CornerFileDetector, Detection, Detector};
pub use source::{Frame, FrameSource, ImageListSource};

use crate::camera::Resolution;
use crate::error::CalibrationError;
use crate::optimization::{run_calibration, CalibrationResult, CalibrationSolver};
use crate::persist::ResultPersister;
use crate::session::{CalibrationSession, ViewDecision};
use log::{debug, info, warn};

/// Result of one solve-and-persist round.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RoundOutcome {
    /// The result was written; carries the aggregate RMS.
    Saved { rms: f64 },
    /// The solver produced an implausible result. Nothing was written.
    SolveInvalid,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameOutcome {
    /// The view did not enter the session.
    Rejected(ViewDecision),
    Calibrated { views: usize, round: RoundOutcome },
}

/// Counters of a completed [`CalibrationPipeline::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub frames: usize,
    pub views: usize,
    pub skipped_frames: usize,
    pub rejected_frames: usize,
    pub saved_rounds: usize,
    pub invalid_rounds: usize,
    pub failed_rounds: usize,
}

pub struct CalibrationPipeline<S: CalibrationSolver> {
    session: CalibrationSession,
    solver: S,
    persister: ResultPersister,
    /// Views were added since the last successful persist.
    unflushed: bool,
    last_result: Option<CalibrationResult>,
}

impl<S: CalibrationSolver> CalibrationPipeline<S> {
    pub fn new(session: CalibrationSession, solver: S, persister: ResultPersister) -> Self {
        CalibrationPipeline {
            session,
            solver,
            persister,
            unflushed: false,
            last_result: None,
        }
    }

    pub fn session(&self) -> &CalibrationSession {
        &self.session
    }

    pub fn persister(&self) -> &ResultPersister {
        &self.persister
    }

    /// Last result that was written to the destination.
    pub fn last_result(&self) -> Option<&CalibrationResult> {
        self.last_result.as_ref()
    }

    pub fn has_unflushed_views(&self) -> bool {
        self.unflushed
    }

    /// Feeds one detector result taken from a frame of size `image_size`.
    ///
    /// An accepted view triggers a full solve-and-persist round.
    pub fn process_frame(
        &mut self,
        image_size: Resolution,
        detection: Detection,
    ) -> Result<FrameOutcome, CalibrationError> {
        self.session.observe_image_size(image_size)?;
        match self.session.add_view(detection.points, detection.found) {
            ViewDecision::Accepted(views) => {
                self.unflushed = true;
                let round = self.run_and_save()?;
                Ok(FrameOutcome::Calibrated { views, round })
            }
            decision => {
                debug!("Frame rejected: {:?}", decision);
                Ok(FrameOutcome::Rejected(decision))
            }
        }
    }

    /// Solves the full history and persists the result if it is plausible.
    pub fn run_and_save(&mut self) -> Result<RoundOutcome, CalibrationError> {
        let result = run_calibration(&self.session, &self.solver)?;
        info!(
            "{}. avg reprojection error = {:.2}",
            if result.success {
                "Calibration succeeded"
            } else {
                "Calibration failed"
            },
            result.rms
        );
        if !result.success {
            return Ok(RoundOutcome::SolveInvalid);
        }

        self.persister.save(&self.session, &result)?;
        self.unflushed = false;
        let rms = result.rms;
        self.last_result = Some(result);
        Ok(RoundOutcome::Saved { rms })
    }

    /// Runs one last round if views were added since the last persist.
    pub fn finish(&mut self) -> Result<Option<RoundOutcome>, CalibrationError> {
        if !self.unflushed || self.session.is_empty() {
            return Ok(None);
        }
        self.run_and_save().map(Some)
    }

    /// Drains `source` through `detector`, then flushes.
    ///
    /// Frame-level failures are logged and skipped. Only configuration-class
    /// errors and a failed final flush are returned.
    pub fn run<F, D>(
        &mut self,
        source: &mut F,
        detector: &mut D,
    ) -> Result<RunSummary, CalibrationError>
    where
        F: FrameSource + ?Sized,
        D: Detector + ?Sized,
    {
        let mut summary = RunSummary::default();

        while let Some(next) = source.next_frame() {
            summary.frames += 1;
            let frame = match next {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Skipping frame: {}", e);
                    summary.skipped_frames += 1;
                    continue;
                }
            };
            let detection = match detector.detect(&frame, self.session.pattern()) {
                Ok(detection) => detection,
                Err(e) => {
                    warn!("Skipping {}: {}", frame.path.display(), e);
                    summary.skipped_frames += 1;
                    continue;
                }
            };

            match self.process_frame(frame.resolution(), detection) {
                Ok(FrameOutcome::Rejected(_)) => summary.rejected_frames += 1,
                Ok(FrameOutcome::Calibrated { round, .. }) => match round {
                    RoundOutcome::Saved { .. } => summary.saved_rounds += 1,
                    RoundOutcome::SolveInvalid => summary.invalid_rounds += 1,
                },
                Err(e) if e.is_recoverable() => {
                    warn!("{}: {}", frame.path.display(), e);
                    match e {
                        CalibrationError::ImageSizeMismatch { .. } => summary.skipped_frames += 1,
                        _ => summary.failed_rounds += 1,
                    }
                }
                Err(e) => return Err(e),
            }
        }

        match self.finish()? {
            Some(RoundOutcome::Saved { .. }) => summary.saved_rounds += 1,
            Some(RoundOutcome::SolveInvalid) => summary.invalid_rounds += 1,
            None => {}
        }
        summary.views = self.session.len();
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{Intrinsics, DISTORTION_LEN};
    use crate::geometry::ViewPose;
    use crate::optimization::{PlanarCalibrator, SolveOutput};
    use crate::pattern::{PatternConfig, PatternKind};
    use crate::persist::{load_document, PersistOptions};
    use crate::session::CalibrationFlags;
    use crate::util::synthetic::{orbit_poses, project_views, vga_model};
    use image::GrayImage;
    use nalgebra::{Matrix3, Point2, Point3, Vector3};
    use std::cell::Cell;
    use std::collections::VecDeque;
    use std::path::{Path, PathBuf};

    const VGA: Resolution = Resolution {
        width: 640,
        height: 480,
    };

    /// Returns a fixed identity-camera solution, optionally with a NaN focal length.
    struct StubSolver {
        calls: Cell<usize>,
        valid: bool,
    }

    impl StubSolver {
        fn new(valid: bool) -> Self {
            StubSolver {
                calls: Cell::new(0),
                valid,
            }
        }
    }

    impl CalibrationSolver for StubSolver {
        fn solve(
            &self,
            object_points: &[Vec<Point3<f64>>],
            _image_points: &[Vec<Point2<f64>>],
            _image_size: Resolution,
            _camera_matrix: &Matrix3<f64>,
            _distortion: &[f64; DISTORTION_LEN],
            _flags: CalibrationFlags,
        ) -> Result<SolveOutput, CalibrationError> {
            self.calls.set(self.calls.get() + 1);
            let mut camera_matrix = Matrix3::identity();
            if !self.valid {
                camera_matrix[(0, 0)] = f64::NAN;
            }
            let pose = ViewPose {
                rotation: Vector3::zeros(),
                translation: Vector3::new(0.0, 0.0, 1.0),
            };
            Ok(SolveOutput {
                camera_matrix,
                distortion: [0.0; DISTORTION_LEN],
                poses: vec![pose; object_points.len()],
                rms: 0.0,
            })
        }
    }

    fn small_session() -> CalibrationSession {
        let pattern = PatternConfig::new(PatternKind::Chessboard, 3, 2, 1.0).unwrap();
        CalibrationSession::new(pattern, CalibrationFlags::NONE, 1.0).unwrap()
    }

    fn stub_pipeline(valid: bool, persister: ResultPersister) -> CalibrationPipeline<StubSolver> {
        CalibrationPipeline::new(small_session(), StubSolver::new(valid), persister)
    }

    fn hit() -> Detection {
        Detection {
            points: (0..6).map(|i| Point2::new(i as f64, 0.0)).collect(),
            found: true,
        }
    }

    fn persister_in(dir: &Path) -> ResultPersister {
        ResultPersister::new(dir.join("out_camera_data.yml"), PersistOptions::default())
    }

    struct QueuedSource(VecDeque<Result<Frame, CalibrationError>>);

    impl FrameSource for QueuedSource {
        fn next_frame(&mut self) -> Option<Result<Frame, CalibrationError>> {
            self.0.pop_front()
        }
    }

    struct QueuedDetector(VecDeque<Detection>);

    impl Detector for QueuedDetector {
        fn detect(
            &mut self,
            _frame: &Frame,
            _pattern: &PatternConfig,
        ) -> Result<Detection, CalibrationError> {
            Ok(self.0.pop_front().unwrap_or_else(Detection::miss))
        }
    }

    fn blank_frame(i: usize) -> Frame {
        Frame {
            path: PathBuf::from(format!("frame{i}.png")),
            image: GrayImage::new(VGA.width, VGA.height),
            flipped: false,
        }
    }

    #[test]
    fn test_end_to_end_synthetic_board() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = PatternConfig::new(PatternKind::Chessboard, 5, 4, 0.025).unwrap();
        let session = CalibrationSession::new(pattern, CalibrationFlags::NONE, 1.0).unwrap();
        let board = session.reference_points().to_vec();

        let truth = vga_model(
            Intrinsics {
                fx: 800.0,
                fy: 790.0,
                cx: 322.0,
                cy: 238.0,
            },
            [0.0; DISTORTION_LEN],
        );
        let poses = orbit_poses(10, (0.1, 0.075), 0.3);
        let views = project_views(&truth, &board, &poses);

        let persister = persister_in(dir.path());
        let mut pipeline =
            CalibrationPipeline::new(session, PlanarCalibrator::default(), persister);
        for (i, points) in views.into_iter().enumerate() {
            let outcome = pipeline
                .process_frame(VGA, Detection { points, found: true })
                .unwrap();
            assert!(
                matches!(
                    outcome,
                    FrameOutcome::Calibrated { views: n, round: RoundOutcome::Saved { .. } }
                        if n == i + 1
                ),
                "round {} was not saved: {:?}",
                i + 1,
                outcome
            );
            let doc = load_document(dir.path().join("out_camera_data.yml")).unwrap();
            assert_eq!(doc.nframes, i + 1);
        }
        assert!(!pipeline.has_unflushed_views());
        assert!(pipeline.finish().unwrap().is_none());

        let result = pipeline.last_result().unwrap();
        assert!(result.success);
        assert!(result.rms < 1e-3, "rms too large: {}", result.rms);
        assert_eq!(result.per_view_errors.len(), 10);

        let doc = load_document(dir.path().join("out_camera_data.yml")).unwrap();
        assert_eq!(doc.nframes, 10);
        assert_eq!((doc.board_width, doc.board_height), (5, 4));
        assert_eq!(doc.square_size, 0.025);
        assert_eq!(doc.distortion_coefficients.data[5], 0.0);
        assert_eq!(doc.distortion_coefficients.data[6], 0.0);
    }

    #[test]
    fn test_every_accepted_view_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = stub_pipeline(true, persister_in(dir.path()));

        let outcome = pipeline.process_frame(VGA, hit()).unwrap();
        assert!(matches!(
            outcome,
            FrameOutcome::Calibrated {
                views: 1,
                round: RoundOutcome::Saved { .. }
            }
        ));
        assert!(!pipeline.has_unflushed_views());
        pipeline.process_frame(VGA, hit()).unwrap();

        let doc = load_document(pipeline.persister().path()).unwrap();
        assert_eq!(doc.nframes, 2);
        assert!(pipeline.finish().unwrap().is_none());
        assert_eq!(pipeline.solver.calls.get(), 2);
    }

    #[test]
    fn test_invalid_solve_is_retried_on_finish() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = stub_pipeline(false, persister_in(dir.path()));

        let outcome = pipeline.process_frame(VGA, hit()).unwrap();
        assert!(matches!(
            outcome,
            FrameOutcome::Calibrated {
                round: RoundOutcome::SolveInvalid,
                ..
            }
        ));
        assert!(pipeline.has_unflushed_views());
        assert!(!pipeline.persister().path().exists());
        assert_eq!(pipeline.session().len(), 1);

        assert_eq!(pipeline.finish().unwrap(), Some(RoundOutcome::SolveInvalid));
        assert_eq!(pipeline.solver.calls.get(), 2);
    }

    #[test]
    fn test_failed_persist_keeps_session() {
        let dir = tempfile::tempdir().unwrap();
        let persister = persister_in(&dir.path().join("missing"));
        let mut pipeline = stub_pipeline(true, persister);

        let err = pipeline.process_frame(VGA, hit()).unwrap_err();
        assert!(matches!(err, CalibrationError::Output(_)));
        assert!(err.is_recoverable());
        assert_eq!(pipeline.session().len(), 1);
        assert!(pipeline.has_unflushed_views());
    }

    #[test]
    fn test_frame_size_is_invariant() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = stub_pipeline(true, persister_in(dir.path()));
        pipeline.process_frame(VGA, hit()).unwrap();

        let rotated = Resolution {
            width: 480,
            height: 640,
        };
        assert!(matches!(
            pipeline.process_frame(rotated, hit()),
            Err(CalibrationError::ImageSizeMismatch { .. })
        ));
        assert_eq!(pipeline.session().len(), 1);
        assert_eq!(pipeline.session().image_size(), Some(VGA));
    }

    #[test]
    fn test_run_skips_misses_and_bad_frames() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = stub_pipeline(true, persister_in(dir.path()));

        let mut frames: VecDeque<_> = (0..5).map(|i| Ok(blank_frame(i))).collect();
        frames.insert(2, Err(CalibrationError::Input("unreadable".to_string())));
        let mut source = QueuedSource(frames);
        let mut detector = QueuedDetector(VecDeque::from(vec![
            hit(),
            Detection::miss(),
            hit(),
            Detection::miss(),
            hit(),
        ]));

        let summary = pipeline.run(&mut source, &mut detector).unwrap();
        assert_eq!(
            summary,
            RunSummary {
                frames: 6,
                views: 3,
                skipped_frames: 1,
                rejected_frames: 2,
                saved_rounds: 3,
                invalid_rounds: 0,
                failed_rounds: 0,
            }
        );
        assert_eq!(pipeline.solver.calls.get(), 3);
    }

    #[test]
    fn test_empty_run_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = stub_pipeline(true, persister_in(dir.path()));
        let summary = pipeline
            .run(&mut QueuedSource(VecDeque::new()), &mut QueuedDetector(VecDeque::new()))
            .unwrap();
        assert_eq!(summary.views, 0);
        assert_eq!(pipeline.solver.calls.get(), 0);
        assert!(!pipeline.persister().path().exists());
    }
}
