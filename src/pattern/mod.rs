//! Reference geometry for planar calibration targets.
//!
//! A calibration pattern is described by a [`PatternConfig`]. Its feature
//! points live on the `z = 0` plane of the pattern's own frame and are
//! generated in row-major order, so index `i` of the reference set names the
//! same physical feature as index `i` of every detector observation.

use nalgebra::Point3;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PatternError {
    #[error("Invalid pattern kind '{0}': must be chessboard, circles or acircles")]
    InvalidPatternKind(String),
    #[error("Pattern dimensions must be positive, got {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
    #[error("Square size must be positive and finite, got {0}")]
    InvalidSquareSize(f64),
}

/// Kind of planar calibration target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    #[default]
    Chessboard,
    CirclesGrid,
    AsymmetricCirclesGrid,
}

impl PatternKind {
    /// Name accepted on the command line and in settings files.
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternKind::Chessboard => "chessboard",
            PatternKind::CirclesGrid => "circles",
            PatternKind::AsymmetricCirclesGrid => "acircles",
        }
    }
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PatternKind {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "chessboard" => Ok(PatternKind::Chessboard),
            "circles" | "circles_grid" => Ok(PatternKind::CirclesGrid),
            "acircles" | "asymmetric_circles_grid" => Ok(PatternKind::AsymmetricCirclesGrid),
            _ => Err(PatternError::InvalidPatternKind(s.to_string())),
        }
    }
}

/// Numeric pattern codes, in declaration order.
impl TryFrom<i32> for PatternKind {
    type Error = PatternError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(PatternKind::Chessboard),
            1 => Ok(PatternKind::CirclesGrid),
            2 => Ok(PatternKind::AsymmetricCirclesGrid),
            other => Err(PatternError::InvalidPatternKind(other.to_string())),
        }
    }
}

/// Geometry of a calibration target. Fixed for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternConfig {
    pub kind: PatternKind,
    /// Number of features along the pattern's x axis.
    pub width: u32,
    /// Number of features along the pattern's y axis.
    pub height: u32,
    /// Feature spacing in user-defined units.
    pub square_size: f64,
}

impl PatternConfig {
    pub fn new(
        kind: PatternKind,
        width: u32,
        height: u32,
        square_size: f64,
    ) -> Result<Self, PatternError> {
        let config = PatternConfig {
            kind,
            width,
            height,
            square_size,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PatternError> {
        if self.width == 0 || self.height == 0 {
            return Err(PatternError::InvalidDimensions {
                width: self.width,
                height: self.height,
            });
        }
        if !(self.square_size.is_finite() && self.square_size > 0.0) {
            return Err(PatternError::InvalidSquareSize(self.square_size));
        }
        Ok(())
    }

    /// Number of features one complete detection must contain.
    pub fn point_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Generates the pattern-local 3D feature positions for `config`.
///
/// Points are emitted row-major: outer loop over rows `i in 0..height`, inner
/// loop over columns `j in 0..width`. Asymmetric circle grids stagger every
/// odd row by one spacing unit, so their x coordinate is `(2j + i mod 2) * s`.
pub fn generate_reference_points(config: &PatternConfig) -> Vec<Point3<f64>> {
    let s = config.square_size;
    let mut points = Vec::with_capacity(config.point_count());

    for i in 0..config.height {
        for j in 0..config.width {
            let x = match config.kind {
                PatternKind::Chessboard | PatternKind::CirclesGrid => j as f64 * s,
                PatternKind::AsymmetricCirclesGrid => (2 * j + i % 2) as f64 * s,
            };
            points.push(Point3::new(x, i as f64 * s, 0.0));
        }
    }

    points
}
