use super::source::Frame;
use crate::error::CalibrationError;
use crate::pattern::PatternConfig;
use log::debug;
use nalgebra::Point2;
use std::fs;
use std::path::PathBuf;
use yaml_rust::{Yaml, YamlLoader};

/// Output of a feature detector for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// Points ordered like the reference set.
    pub points: Vec<Point2<f64>>,
    pub found: bool,
}

impl Detection {
    pub fn miss() -> Self {
        Detection {
            points: Vec::new(),
            found: false,
        }
    }
}

/// Finds the pattern's feature points in a frame.
pub trait Detector {
    fn detect(
        &mut self,
        frame: &Frame,
        pattern: &PatternConfig,
    ) -> Result<Detection, CalibrationError>;
}

/// Replays detector output recorded next to each frame as
/// `<frame>.corners.yaml`:
///
/// ```yaml
/// found: true
/// points: [[10.5, 20.0], [30.5, 20.0]]
/// ```
///
/// A frame without a record counts as not detected. Points of a flipped
/// frame are mirrored to match the flipped image.
#[derive(Debug, Clone, Copy, Default)]
pub struct CornerFileDetector;

impl CornerFileDetector {
    pub fn record_path(frame: &Frame) -> PathBuf {
        let mut name = frame.path.as_os_str().to_owned();
        name.push(".corners.yaml");
        PathBuf::from(name)
    }
}

fn parse_point(item: &Yaml) -> Option<Point2<f64>> {
    let coord = |v: &Yaml| match v {
        Yaml::Integer(i) => Some(*i as f64),
        other => other.as_f64(),
    };
    match item.as_vec()?.as_slice() {
        [x, y] => Some(Point2::new(coord(x)?, coord(y)?)),
        _ => None,
    }
}

impl Detector for CornerFileDetector {
    fn detect(
        &mut self,
        frame: &Frame,
        _pattern: &PatternConfig,
    ) -> Result<Detection, CalibrationError> {
        let record = Self::record_path(frame);
        if !record.exists() {
            debug!("No detector record for {}", frame.path.display());
            return Ok(Detection::miss());
        }

        let bad_record = |reason: &str| {
            CalibrationError::Input(format!("{}: {}", record.display(), reason))
        };
        let contents = fs::read_to_string(&record).map_err(|e| bad_record(&e.to_string()))?;
        let docs = YamlLoader::load_from_str(&contents).map_err(|e| bad_record(&e.to_string()))?;
        let doc = docs.first().ok_or_else(|| bad_record("empty document"))?;

        let found = doc["found"]
            .as_bool()
            .ok_or_else(|| bad_record("missing 'found'"))?;
        let mut points = match &doc["points"] {
            Yaml::BadValue | Yaml::Null => Vec::new(),
            Yaml::Array(items) => items
                .iter()
                .map(parse_point)
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| bad_record("points must be [x, y] pairs"))?,
            _ => return Err(bad_record("'points' must be a sequence")),
        };

        if frame.flipped {
            let last_row = frame.image.height() as f64 - 1.0;
            for p in &mut points {
                p.y = last_row - p.y;
            }
        }
        Ok(Detection { points, found })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::PatternKind;
    use image::GrayImage;

    fn frame_in(dir: &std::path::Path, flipped: bool) -> Frame {
        Frame {
            path: dir.join("view.png"),
            image: GrayImage::new(640, 480),
            flipped,
        }
    }

    fn pattern() -> PatternConfig {
        PatternConfig::new(PatternKind::Chessboard, 2, 1, 1.0).unwrap()
    }

    #[test]
    fn test_reads_record() {
        let dir = tempfile::tempdir().unwrap();
        let frame = frame_in(dir.path(), false);
        assert_eq!(
            CornerFileDetector::record_path(&frame),
            dir.path().join("view.png.corners.yaml")
        );
        fs::write(
            CornerFileDetector::record_path(&frame),
            "found: true\npoints: [[10.5, 20], [30, 40.25]]\n",
        )
        .unwrap();

        let detection = CornerFileDetector.detect(&frame, &pattern()).unwrap();
        assert!(detection.found);
        assert_eq!(
            detection.points,
            vec![Point2::new(10.5, 20.0), Point2::new(30.0, 40.25)]
        );

        let flipped = frame_in(dir.path(), true);
        let detection = CornerFileDetector.detect(&flipped, &pattern()).unwrap();
        assert_eq!(detection.points[0], Point2::new(10.5, 459.0));
    }

    #[test]
    fn test_missing_record_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let detection = CornerFileDetector
            .detect(&frame_in(dir.path(), false), &pattern())
            .unwrap();
        assert_eq!(detection, Detection::miss());
    }

    #[test]
    fn test_malformed_record() {
        let dir = tempfile::tempdir().unwrap();
        let frame = frame_in(dir.path(), false);
        fs::write(
            CornerFileDetector::record_path(&frame),
            "found: true\npoints: [[1.0]]\n",
        )
        .unwrap();
        assert!(matches!(
            CornerFileDetector.detect(&frame, &pattern()),
            Err(CalibrationError::Input(_))
        ));
    }
}
