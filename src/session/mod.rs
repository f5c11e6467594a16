//! Append-only calibration session state.
//!
//! A [`CalibrationSession`] owns everything that stays fixed while views are
//! collected (pattern, reference points, constraint flags, image size) and the
//! ordered list of accepted observations. It is owned by a single driver and
//! only ever grows.

use crate::camera::Resolution;
use crate::error::CalibrationError;
use crate::pattern::{generate_reference_points, PatternConfig};
use log::debug;
use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};
use std::ops::{BitOr, BitOrAssign};

/// Calibration constraint bit-set. Bit values follow the conventional
/// calibration flag layout so persisted documents stay interchangeable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CalibrationFlags(u32);

impl CalibrationFlags {
    pub const NONE: Self = Self(0);
    pub const USE_INTRINSIC_GUESS: Self = Self(1);
    pub const FIX_ASPECT_RATIO: Self = Self(1 << 1);
    pub const FIX_PRINCIPAL_POINT: Self = Self(1 << 2);
    pub const ZERO_TANGENT_DIST: Self = Self(1 << 3);
    pub const FIX_K4: Self = Self(1 << 11);
    pub const FIX_K5: Self = Self(1 << 12);
    pub const RATIONAL_MODEL: Self = Self(1 << 14);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Human-readable summary, e.g. `+fix_aspectRatio+zero_tangent_dist`.
    pub fn describe(&self) -> String {
        [
            (Self::USE_INTRINSIC_GUESS, "+use_intrinsic_guess"),
            (Self::FIX_ASPECT_RATIO, "+fix_aspectRatio"),
            (Self::FIX_PRINCIPAL_POINT, "+fix_principal_point"),
            (Self::ZERO_TANGENT_DIST, "+zero_tangent_dist"),
        ]
        .iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| *name)
        .collect()
    }
}

impl BitOr for CalibrationFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for CalibrationFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// What happened to a detector result handed to [`CalibrationSession::add_view`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewDecision {
    /// Appended; carries the new view count.
    Accepted(usize),
    /// The detector reported that the pattern was not found.
    NotDetected,
    /// Detected, but the point list does not match the reference set.
    WrongPointCount { expected: usize, found: usize },
}

#[derive(Debug, Clone)]
pub struct CalibrationSession {
    pattern: PatternConfig,
    reference_points: Vec<Point3<f64>>,
    flags: CalibrationFlags,
    aspect_ratio: f64,
    image_size: Option<Resolution>,
    views: Vec<Vec<Point2<f64>>>,
}

impl CalibrationSession {
    pub fn new(
        pattern: PatternConfig,
        flags: CalibrationFlags,
        aspect_ratio: f64,
    ) -> Result<Self, CalibrationError> {
        pattern.validate()?;
        if !(aspect_ratio.is_finite() && aspect_ratio > 0.0) {
            return Err(CalibrationError::Configuration(format!(
                "Invalid aspect ratio {aspect_ratio}"
            )));
        }
        let reference_points = generate_reference_points(&pattern);
        Ok(CalibrationSession {
            pattern,
            reference_points,
            flags,
            aspect_ratio,
            image_size: None,
            views: Vec::new(),
        })
    }

    pub fn pattern(&self) -> &PatternConfig {
        &self.pattern
    }

    pub fn reference_points(&self) -> &[Point3<f64>] {
        &self.reference_points
    }

    pub fn flags(&self) -> CalibrationFlags {
        self.flags
    }

    pub fn aspect_ratio(&self) -> f64 {
        self.aspect_ratio
    }

    pub fn image_size(&self) -> Option<Resolution> {
        self.image_size
    }

    /// Accepted observations in capture order.
    pub fn views(&self) -> &[Vec<Point2<f64>>] {
        &self.views
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// Records the size of an incoming frame.
    ///
    /// The first frame fixes the session's image size; later frames must match.
    pub fn observe_image_size(&mut self, size: Resolution) -> Result<(), CalibrationError> {
        match self.image_size {
            None => {
                debug!("Session image size fixed at {}x{}", size.width, size.height);
                self.image_size = Some(size);
                Ok(())
            }
            Some(expected) if expected == size => Ok(()),
            Some(expected) => Err(CalibrationError::ImageSizeMismatch {
                expected,
                found: size,
            }),
        }
    }

    /// Appends `points` iff `detected` is set and the point count matches the
    /// reference set. Rejected views leave no trace in the session.
    pub fn add_view(&mut self, points: Vec<Point2<f64>>, detected: bool) -> ViewDecision {
        if !detected {
            return ViewDecision::NotDetected;
        }
        let expected = self.reference_points.len();
        if points.len() != expected {
            return ViewDecision::WrongPointCount {
                expected,
                found: points.len(),
            };
        }
        self.views.push(points);
        ViewDecision::Accepted(self.views.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::PatternKind;

    fn make_session() -> CalibrationSession {
        let pattern = PatternConfig::new(PatternKind::Chessboard, 3, 2, 1.0).unwrap();
        CalibrationSession::new(pattern, CalibrationFlags::NONE, 1.0).unwrap()
    }

    fn view(tag: f64) -> Vec<Point2<f64>> {
        (0..6).map(|i| Point2::new(tag, i as f64)).collect()
    }

    #[test]
    fn test_misses_leave_no_gap() {
        let mut session = make_session();
        let frames = [(1.0, true), (2.0, false), (3.0, true), (4.0, false), (5.0, true)];

        for (tag, detected) in frames {
            session.add_view(view(tag), detected);
        }

        assert_eq!(session.len(), 3);
        let tags: Vec<f64> = session.views().iter().map(|v| v[0].x).collect();
        assert_eq!(tags, vec![1.0, 3.0, 5.0]);
    }

    #[test]
    fn test_wrong_point_count_is_rejected() {
        let mut session = make_session();
        let decision = session.add_view(vec![Point2::new(0.0, 0.0); 5], true);
        assert_eq!(
            decision,
            ViewDecision::WrongPointCount {
                expected: 6,
                found: 5
            }
        );
        assert!(session.is_empty());
        assert_eq!(session.add_view(view(0.0), true), ViewDecision::Accepted(1));
        assert_eq!(session.add_view(view(0.0), false), ViewDecision::NotDetected);
    }

    #[test]
    fn test_image_size_is_fixed_by_first_frame() {
        let mut session = make_session();
        let vga = Resolution {
            width: 640,
            height: 480,
        };
        assert!(session.image_size().is_none());
        session.observe_image_size(vga).unwrap();
        session.observe_image_size(vga).unwrap();
        assert!(matches!(
            session.observe_image_size(Resolution {
                width: 480,
                height: 640
            }),
            Err(CalibrationError::ImageSizeMismatch { .. })
        ));
        assert_eq!(session.image_size(), Some(vga));
    }

    #[test]
    fn test_invalid_aspect_ratio() {
        let pattern = PatternConfig::new(PatternKind::Chessboard, 3, 2, 1.0).unwrap();
        assert!(matches!(
            CalibrationSession::new(pattern, CalibrationFlags::FIX_ASPECT_RATIO, 0.0),
            Err(CalibrationError::Configuration(_))
        ));
    }

    #[test]
    fn test_flags() {
        let mut flags = CalibrationFlags::FIX_ASPECT_RATIO | CalibrationFlags::ZERO_TANGENT_DIST;
        assert_eq!(flags.bits(), 10);
        assert!(flags.contains(CalibrationFlags::FIX_ASPECT_RATIO));
        assert!(!flags.contains(CalibrationFlags::FIX_PRINCIPAL_POINT));
        assert_eq!(flags.describe(), "+fix_aspectRatio+zero_tangent_dist");

        flags |= CalibrationFlags::FIX_K4;
        flags.insert(CalibrationFlags::FIX_K5);
        assert_eq!(flags.bits(), 10 | 2048 | 4096);
        assert!(CalibrationFlags::NONE.is_empty());
    }
}
