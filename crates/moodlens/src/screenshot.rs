//! Saving rendered frames on request.

use chrono::{DateTime, Local};
use image::{ImageFormat, RgbImage};
use std::fs::OpenOptions;
use std::io::BufWriter;
use std::path::PathBuf;
use thiserror::Error;

/// Upper bound on `_N` suffixes tried for one timestamp.
const MAX_NAME_ATTEMPTS: u32 = 1000;

#[derive(Error, Debug)]
pub enum ScreenshotError {
    #[error("cannot write screenshot to {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to encode screenshot {path}: {source}")]
    Encode {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("no free screenshot name for {0}")]
    NamesExhausted(String),
}

/// Writes PNG screenshots with unique, timestamp-derived names.
///
/// Files are created with `create_new`, so an existing screenshot is never
/// overwritten.
pub struct ScreenshotWriter {
    dir: PathBuf,
}

impl ScreenshotWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Save `image`, returning the path of the new file.
    pub fn save(&self, image: &RgbImage, at: DateTime<Local>) -> Result<PathBuf, ScreenshotError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| ScreenshotError::Write {
            path: self.dir.clone(),
            source,
        })?;

        let stem = format!("screenshot_{}", at.format("%Y%m%d_%H%M%S_%3f"));
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let name = if attempt == 0 {
                format!("{stem}.png")
            } else {
                format!("{stem}_{attempt}.png")
            };
            let path = self.dir.join(name);

            let file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(source) => return Err(ScreenshotError::Write { path, source }),
            };

            let mut out = BufWriter::new(file);
            if let Err(source) = image.write_to(&mut out, ImageFormat::Png) {
                drop(out);
                let _ = std::fs::remove_file(&path);
                return Err(ScreenshotError::Encode { path, source });
            }

            tracing::info!(path = %path.display(), "saved screenshot");
            return Ok(path);
        }

        Err(ScreenshotError::NamesExhausted(stem))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 10, 19, 8, 30, 5).unwrap()
    }

    #[test]
    fn test_save_creates_png() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ScreenshotWriter::new(dir.path().join("shots"));
        let image = RgbImage::from_pixel(8, 6, image::Rgb([10, 20, 30]));

        let path = writer.save(&image, at()).unwrap();
        assert_eq!(path.file_name().unwrap(), "screenshot_20261019_083005_000.png");

        let loaded = image::open(&path).unwrap().to_rgb8();
        assert_eq!(loaded, image);
    }

    #[test]
    fn test_same_timestamp_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ScreenshotWriter::new(dir.path());
        let first = RgbImage::from_pixel(4, 4, image::Rgb([255, 0, 0]));
        let second = RgbImage::from_pixel(4, 4, image::Rgb([0, 255, 0]));

        let p1 = writer.save(&first, at()).unwrap();
        let p2 = writer.save(&second, at()).unwrap();
        assert_ne!(p1, p2);
        assert!(p2.to_string_lossy().ends_with("_1.png"));
        assert_eq!(image::open(&p1).unwrap().to_rgb8(), first);
        assert_eq!(image::open(&p2).unwrap().to_rgb8(), second);
    }

    #[test]
    fn test_unwritable_directory_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();
        let writer = ScreenshotWriter::new(blocker.join("shots"));

        let err = writer.save(&RgbImage::new(2, 2), at()).unwrap_err();
        assert!(matches!(err, ScreenshotError::Write { .. }));
    }
}
