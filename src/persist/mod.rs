//! Output document of a calibration round.
//!
//! Every successful round overwrites the destination with the latest result.
//! The document is YAML unless the destination ends in `.json`.

use crate::optimization::CalibrationResult;
use crate::session::{CalibrationFlags, CalibrationSession};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum PersistError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Session has no image size yet")]
    MissingImageSize,
    #[error("Result does not match session: {0}")]
    Inconsistent(String),
}

/// Optional sections of the output document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistOptions {
    /// Per-view errors and one `[rvec | tvec]` row per view.
    pub write_extrinsics: bool,
    /// Raw observation table.
    pub write_points: bool,
}

/// Row-major matrix with an element type tag (`d` or `2f`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMatrix {
    pub rows: usize,
    pub cols: usize,
    pub dt: String,
    pub data: Vec<f64>,
}

impl StoredMatrix {
    pub fn doubles(rows: usize, cols: usize, data: Vec<f64>) -> Self {
        StoredMatrix {
            rows,
            cols,
            dt: "d".to_string(),
            data,
        }
    }

    pub fn point_table(rows: usize, cols: usize, data: Vec<f64>) -> Self {
        StoredMatrix {
            rows,
            cols,
            dt: "2f".to_string(),
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationDocument {
    pub calibration_time: String,
    pub nframes: usize,
    pub image_width: u32,
    pub image_height: u32,
    pub board_width: u32,
    pub board_height: u32,
    pub square_size: f64,
    #[serde(rename = "aspectRatio", default, skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<f64>,
    pub flags: u32,
    pub camera_matrix: StoredMatrix,
    pub distortion_coefficients: StoredMatrix,
    pub avg_reprojection_error: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_view_reprojection_errors: Option<StoredMatrix>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extrinsic_parameters: Option<StoredMatrix>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_points: Option<StoredMatrix>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DocumentFormat {
    Yaml,
    Json,
}

impl DocumentFormat {
    fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => DocumentFormat::Json,
            _ => DocumentFormat::Yaml,
        }
    }
}

/// Writes calibration results to a fixed destination, replacing it every time.
#[derive(Debug, Clone)]
pub struct ResultPersister {
    path: PathBuf,
    options: PersistOptions,
}

impl ResultPersister {
    pub fn new(path: impl Into<PathBuf>, options: PersistOptions) -> Self {
        ResultPersister {
            path: path.into(),
            options,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> PersistOptions {
        self.options
    }

    /// Builds the document for `result`, stamped with the result's solve time.
    pub fn document(
        &self,
        session: &CalibrationSession,
        result: &CalibrationResult,
    ) -> Result<CalibrationDocument, PersistError> {
        let image_size = session.image_size().ok_or(PersistError::MissingImageSize)?;
        let pattern = session.pattern();
        let flags = session.flags();
        let n = session.len();

        let (per_view_reprojection_errors, extrinsic_parameters) = if self.options.write_extrinsics
        {
            if result.per_view_errors.len() != n || result.extrinsics.len() != n {
                return Err(PersistError::Inconsistent(format!(
                    "{} views, {} per-view errors, {} extrinsics",
                    n,
                    result.per_view_errors.len(),
                    result.extrinsics.len()
                )));
            }
            let rows = result
                .extrinsics
                .iter()
                .flat_map(|pose| pose.to_row())
                .collect();
            (
                Some(StoredMatrix::doubles(n, 1, result.per_view_errors.clone())),
                Some(StoredMatrix::doubles(n, 6, rows)),
            )
        } else {
            (None, None)
        };

        let image_points = self.options.write_points.then(|| {
            let data = session
                .views()
                .iter()
                .flat_map(|view| view.iter().flat_map(|p| [p.x, p.y]))
                .collect();
            StoredMatrix::point_table(n, session.reference_points().len(), data)
        });

        Ok(CalibrationDocument {
            calibration_time: result.timestamp.format("%c").to_string(),
            nframes: n,
            image_width: image_size.width,
            image_height: image_size.height,
            board_width: pattern.width,
            board_height: pattern.height,
            square_size: pattern.square_size,
            aspect_ratio: flags
                .contains(CalibrationFlags::FIX_ASPECT_RATIO)
                .then(|| session.aspect_ratio()),
            flags: flags.bits(),
            camera_matrix: StoredMatrix::doubles(
                3,
                3,
                result.camera_matrix.transpose().iter().copied().collect(),
            ),
            distortion_coefficients: StoredMatrix::doubles(
                result.distortion.len(),
                1,
                result.distortion.to_vec(),
            ),
            avg_reprojection_error: result.rms,
            per_view_reprojection_errors,
            extrinsic_parameters,
            image_points,
        })
    }

    /// Serializes `result` and atomically replaces the destination.
    pub fn save(
        &self,
        session: &CalibrationSession,
        result: &CalibrationResult,
    ) -> Result<(), PersistError> {
        let document = self.document(session, result)?;
        let contents = match DocumentFormat::from_path(&self.path) {
            DocumentFormat::Yaml => serde_yaml::to_string(&document)?,
            DocumentFormat::Json => serde_json::to_string_pretty(&document)?,
        };

        let tmp_path = temporary_sibling(&self.path);
        fs::write(&tmp_path, contents)?;
        if let Err(e) = fs::rename(&tmp_path, &self.path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        debug!("Wrote {} frames to {}", document.nframes, self.path.display());
        Ok(())
    }
}

fn temporary_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp"))
}

/// Reads a document written by [`ResultPersister::save`].
pub fn load_document(path: impl AsRef<Path>) -> Result<CalibrationDocument, PersistError> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;
    Ok(match DocumentFormat::from_path(path) {
        DocumentFormat::Yaml => serde_yaml::from_str(&contents)?,
        DocumentFormat::Json => serde_json::from_str(&contents)?,
    })
}
