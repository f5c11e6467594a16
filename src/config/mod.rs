//! Run settings and the image list document.

use crate::pattern::{PatternConfig, PatternError, PatternKind};
use crate::persist::PersistOptions;
use crate::session::CalibrationFlags;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use yaml_rust::{Yaml, YamlLoader};

pub const DEFAULT_OUTPUT: &str = "out_camera_data.yml";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(String),
    #[error("Empty YAML document: {0}")]
    EmptyDocument(String),
    #[error("Invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },
    #[error("The first node of {0} is not a sequence")]
    NotASequence(String),
    #[error(transparent)]
    Pattern(#[from] PatternError),
}

/// Everything that stays fixed for one calibration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSettings {
    pub pattern: PatternConfig,
    /// fx / fy, only used with `FIX_ASPECT_RATIO`.
    pub aspect_ratio: f64,
    pub flags: CalibrationFlags,
    pub output: PathBuf,
    pub write_extrinsics: bool,
    pub write_points: bool,
    pub flip_vertical: bool,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        CalibrationSettings {
            pattern: PatternConfig {
                kind: PatternKind::Chessboard,
                width: 0,
                height: 0,
                square_size: 1.0,
            },
            aspect_ratio: 1.0,
            flags: CalibrationFlags::NONE,
            output: PathBuf::from(DEFAULT_OUTPUT),
            write_extrinsics: false,
            write_points: false,
            flip_vertical: false,
        }
    }
}

fn load_yaml(path: &Path) -> Result<Yaml, ConfigError> {
    let contents = fs::read_to_string(path)?;
    let docs =
        YamlLoader::load_from_str(&contents).map_err(|e| ConfigError::Yaml(e.to_string()))?;
    docs.into_iter()
        .next()
        .ok_or_else(|| ConfigError::EmptyDocument(path.display().to_string()))
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn read_u32(doc: &Yaml, key: &str) -> Result<Option<u32>, ConfigError> {
    match &doc[key] {
        Yaml::BadValue => Ok(None),
        value => value
            .as_i64()
            .and_then(|v| u32::try_from(v).ok())
            .map(Some)
            .ok_or_else(|| invalid(key, "expected a non-negative integer")),
    }
}

fn read_f64(doc: &Yaml, key: &str) -> Result<Option<f64>, ConfigError> {
    match &doc[key] {
        Yaml::BadValue => Ok(None),
        Yaml::Integer(v) => Ok(Some(*v as f64)),
        value => value
            .as_f64()
            .map(Some)
            .ok_or_else(|| invalid(key, "expected a number")),
    }
}

fn read_bool(doc: &Yaml, key: &str) -> Result<Option<bool>, ConfigError> {
    match &doc[key] {
        Yaml::BadValue => Ok(None),
        value => value
            .as_bool()
            .map(Some)
            .ok_or_else(|| invalid(key, "expected true or false")),
    }
}

fn read_str<'a>(doc: &'a Yaml, key: &str) -> Result<Option<&'a str>, ConfigError> {
    match &doc[key] {
        Yaml::BadValue => Ok(None),
        value => value
            .as_str()
            .map(Some)
            .ok_or_else(|| invalid(key, "expected a string")),
    }
}

impl CalibrationSettings {
    /// Loads settings from a YAML file whose keys mirror the command line.
    ///
    /// Recognized keys: `board_width`, `board_height`, `pattern`,
    /// `square_size`, `aspect_ratio`, `output`, `write_extrinsics`,
    /// `write_points`, `zero_tangent_dist`, `fix_principal_point`,
    /// `flip_vertical`. Missing keys keep their defaults. Giving
    /// `aspect_ratio` turns on `FIX_ASPECT_RATIO`.
    pub fn load_from_yaml(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let doc = load_yaml(path.as_ref())?;
        let mut settings = CalibrationSettings::default();

        if let Some(width) = read_u32(&doc, "board_width")? {
            settings.pattern.width = width;
        }
        if let Some(height) = read_u32(&doc, "board_height")? {
            settings.pattern.height = height;
        }
        if let Some(kind) = read_str(&doc, "pattern")? {
            settings.pattern.kind = kind.parse()?;
        }
        if let Some(size) = read_f64(&doc, "square_size")? {
            settings.pattern.square_size = size;
        }
        if let Some(ratio) = read_f64(&doc, "aspect_ratio")? {
            settings.aspect_ratio = ratio;
            settings.flags |= CalibrationFlags::FIX_ASPECT_RATIO;
        }
        if let Some(output) = read_str(&doc, "output")? {
            settings.output = PathBuf::from(output);
        }
        if let Some(v) = read_bool(&doc, "write_extrinsics")? {
            settings.write_extrinsics = v;
        }
        if let Some(v) = read_bool(&doc, "write_points")? {
            settings.write_points = v;
        }
        if let Some(v) = read_bool(&doc, "flip_vertical")? {
            settings.flip_vertical = v;
        }
        if read_bool(&doc, "zero_tangent_dist")?.unwrap_or(false) {
            settings.flags |= CalibrationFlags::ZERO_TANGENT_DIST;
        }
        if read_bool(&doc, "fix_principal_point")?.unwrap_or(false) {
            settings.flags |= CalibrationFlags::FIX_PRINCIPAL_POINT;
        }
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pattern.validate()?;
        if !(self.aspect_ratio.is_finite() && self.aspect_ratio > 0.0) {
            return Err(invalid("aspect_ratio", "must be positive"));
        }
        Ok(())
    }

    pub fn persist_options(&self) -> PersistOptions {
        PersistOptions {
            write_extrinsics: self.write_extrinsics,
            write_points: self.write_points,
        }
    }
}

/// Reads the list of frame paths from a YAML document.
///
/// The first top-level node must be a sequence of strings, either the root
/// itself or the first value of a root mapping (`images: [...]`). An empty
/// sequence is returned as an empty list.
pub fn read_image_list(path: impl AsRef<Path>) -> Result<Vec<PathBuf>, ConfigError> {
    let path = path.as_ref();
    let doc = load_yaml(path)?;
    let first = match &doc {
        Yaml::Hash(map) => map.iter().next().map(|(_, v)| v),
        other => Some(other),
    };
    let items = match first {
        Some(Yaml::Array(items)) => items,
        _ => return Err(ConfigError::NotASequence(path.display().to_string())),
    };

    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            item.as_str()
                .map(PathBuf::from)
                .ok_or_else(|| invalid(&format!("item {i}"), "expected a path string"))
        })
        .collect()
}
