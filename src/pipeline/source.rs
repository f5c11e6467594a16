use crate::camera::Resolution;
use crate::config::{read_image_list, ConfigError};
use crate::error::CalibrationError;
use image::GrayImage;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

/// A decoded 8-bit grayscale frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub path: PathBuf,
    pub image: GrayImage,
    /// Set when the image was flipped upside down after decoding.
    pub flipped: bool,
}

impl Frame {
    pub fn resolution(&self) -> Resolution {
        Resolution {
            width: self.image.width(),
            height: self.image.height(),
        }
    }
}

/// Ordered supply of frames. `None` means the source is exhausted.
pub trait FrameSource {
    fn next_frame(&mut self) -> Option<Result<Frame, CalibrationError>>;
}

/// Frames decoded one by one from a list of image files.
#[derive(Debug, Clone)]
pub struct ImageListSource {
    paths: VecDeque<PathBuf>,
    flip_vertical: bool,
}

impl ImageListSource {
    pub fn new(paths: Vec<PathBuf>, flip_vertical: bool) -> Self {
        ImageListSource {
            paths: paths.into(),
            flip_vertical,
        }
    }

    /// Opens the image list document at `path`.
    pub fn from_list_file(
        path: impl AsRef<Path>,
        flip_vertical: bool,
    ) -> Result<Self, ConfigError> {
        Ok(Self::new(read_image_list(path)?, flip_vertical))
    }

    pub fn remaining(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    fn load(&self, path: PathBuf) -> Result<Frame, CalibrationError> {
        let mut image = image::open(&path)
            .map_err(|e| CalibrationError::Input(format!("{}: {}", path.display(), e)))?
            .to_luma8();
        if self.flip_vertical {
            image::imageops::flip_vertical_in_place(&mut image);
        }
        Ok(Frame {
            path,
            image,
            flipped: self.flip_vertical,
        })
    }
}

impl FrameSource for ImageListSource {
    fn next_frame(&mut self) -> Option<Result<Frame, CalibrationError>> {
        let path = self.paths.pop_front()?;
        Some(self.load(path))
    }
}
