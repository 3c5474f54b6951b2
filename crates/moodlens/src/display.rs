//! Presenting rendered frames and status messages to the user.

use image::RgbImage;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DisplayError {
    #[error("failed to write preview {path}: {source}")]
    Preview {
        path: PathBuf,
        source: image::ImageError,
    },
}

/// Output surface for the pipeline.
pub trait Display {
    /// Show one rendered frame.
    fn render(&mut self, frame: &RgbImage) -> Result<(), DisplayError>;

    /// Show a transient, non-fatal message without interrupting the feed.
    fn status(&mut self, message: &str);

    /// Release the surface.
    fn close(&mut self) {}
}

/// Terminal display: mirrors the latest frame to a preview JPEG and reports throughput.
pub struct ConsoleDisplay {
    preview_path: Option<PathBuf>,
    report_every: Duration,
    window_start: Instant,
    window_frames: u32,
}

impl ConsoleDisplay {
    pub fn new(preview_path: Option<PathBuf>, report_every: Duration) -> Self {
        Self {
            preview_path,
            report_every,
            window_start: Instant::now(),
            window_frames: 0,
        }
    }

    fn write_preview(&self, frame: &RgbImage) -> Result<(), DisplayError> {
        let Some(path) = &self.preview_path else {
            return Ok(());
        };
        // Write beside the target then rename, so viewers never see a partial file.
        let tmp = path.with_extension("tmp.jpg");
        let to_err = |source| DisplayError::Preview {
            path: path.clone(),
            source,
        };
        frame.save_with_format(&tmp, image::ImageFormat::Jpeg).map_err(to_err)?;
        std::fs::rename(&tmp, path).map_err(|e| to_err(image::ImageError::IoError(e)))
    }
}

impl Display for ConsoleDisplay {
    fn render(&mut self, frame: &RgbImage) -> Result<(), DisplayError> {
        self.window_frames += 1;
        let elapsed = self.window_start.elapsed();
        if elapsed >= self.report_every {
            let fps = self.window_frames as f32 / elapsed.as_secs_f32();
            tracing::info!(fps = format_args!("{fps:.1}"), "pipeline throughput");
            self.window_start = Instant::now();
            self.window_frames = 0;
        }
        self.write_preview(frame)
    }

    fn status(&mut self, message: &str) {
        tracing::warn!(message, "status");
        eprintln!("moodlens: {message}");
    }

    fn close(&mut self) {
        if let Some(path) = &self.preview_path {
            tracing::debug!(path = %path.display(), "preview left at last frame");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_written_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preview.jpg");
        let mut display = ConsoleDisplay::new(Some(path.clone()), Duration::from_secs(60));

        display.render(&RgbImage::from_pixel(16, 16, image::Rgb([90, 90, 90]))).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp.jpg").exists());
        assert_eq!(image::open(&path).unwrap().dimensions(), (16, 16));
    }

    #[test]
    fn test_no_preview_path_is_noop() {
        let mut display = ConsoleDisplay::new(None, Duration::from_secs(60));
        assert!(display.render(&RgbImage::new(4, 4)).is_ok());
    }
}
