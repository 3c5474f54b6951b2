use moodlens_core::SelectionPolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Application configuration.
///
/// Resolved in order: built-in defaults, the TOML file named by
/// `MOODLENS_CONFIG`, `MOODLENS_*` environment variables, command-line flags.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path or index (default: 0).
    pub camera_device: String,
    pub frame_width: u32,
    pub frame_height: u32,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// SCRFD detector file name inside `model_dir`.
    pub detector_model: String,
    /// Expression classifier file name inside `model_dir`.
    pub emotion_model: String,
    /// Minimum SCRFD score for a face.
    pub detection_confidence: f32,
    /// Apply CLAHE to face crops before classification.
    pub enhance_contrast: bool,
    pub selection: SelectionPolicy,
    /// CSV detection log.
    pub log_path: PathBuf,
    /// Flush the log after this many buffered records.
    pub log_flush_every: usize,
    pub log_flush_interval_ms: u64,
    pub screenshot_dir: PathBuf,
    /// Where the latest rendered frame is mirrored as JPEG, if anywhere.
    pub preview_path: Option<PathBuf>,
    /// Draw session percentages onto rendered frames.
    pub stats_overlay: bool,
    /// Total read attempts per frame before a capture error is fatal.
    pub capture_attempts: u32,
    pub capture_retry_delay_ms: u64,
    /// Stop cleanly after this many frames.
    pub max_frames: Option<u64>,
    /// Seconds between console status reports.
    pub status_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = moodlens_core::data_dir();
        Self {
            camera_device: "0".to_string(),
            frame_width: 640,
            frame_height: 480,
            model_dir: moodlens_core::default_model_dir(),
            detector_model: "det_10g.onnx".to_string(),
            emotion_model: "facial_expression.onnx".to_string(),
            detection_confidence: moodlens_core::detector::SCRFD_DEFAULT_CONFIDENCE,
            enhance_contrast: true,
            selection: SelectionPolicy::plain(),
            log_path: data_dir.join("logs").join("detections.csv"),
            log_flush_every: 32,
            log_flush_interval_ms: 1000,
            screenshot_dir: data_dir.join("screenshots"),
            preview_path: None,
            stats_overlay: true,
            capture_attempts: 5,
            capture_retry_delay_ms: 50,
            max_frames: None,
            status_interval_secs: 5,
        }
    }
}

impl Config {
    /// Load defaults, the optional config file, then environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os("MOODLENS_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Override fields from `MOODLENS_*` environment variables.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("MOODLENS_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Ok(v) = std::env::var("MOODLENS_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("MOODLENS_LOG_PATH") {
            self.log_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("MOODLENS_SCREENSHOT_DIR") {
            self.screenshot_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("MOODLENS_PREVIEW_PATH") {
            self.preview_path = Some(PathBuf::from(v));
        }
        self.frame_width = env_parse("MOODLENS_FRAME_WIDTH", self.frame_width);
        self.frame_height = env_parse("MOODLENS_FRAME_HEIGHT", self.frame_height);
        self.detection_confidence = env_parse("MOODLENS_DETECTION_CONFIDENCE", self.detection_confidence);
        self.capture_attempts = env_parse("MOODLENS_CAPTURE_ATTEMPTS", self.capture_attempts);
        self.enhance_contrast = env_flag("MOODLENS_ENHANCE_CONTRAST", self.enhance_contrast);
        self.stats_overlay = env_flag("MOODLENS_STATS_OVERLAY", self.stats_overlay);
        if env_flag("MOODLENS_REFINE", false) {
            self.selection = SelectionPolicy::refined();
        }
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join(&self.detector_model)
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the expression classification model.
    pub fn emotion_model_path(&self) -> String {
        self.model_dir
            .join(&self.emotion_model)
            .to_string_lossy()
            .into_owned()
    }

    pub fn log_flush_interval(&self) -> Duration {
        Duration::from_millis(self.log_flush_interval_ms)
    }

    pub fn capture_retry_delay(&self) -> Duration {
        Duration::from_millis(self.capture_retry_delay_ms)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key).map(|v| v != "0").unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.camera_device, "0");
        assert_eq!(config.capture_attempts, 5);
        assert_eq!(config.selection, SelectionPolicy::plain());
        assert!(config.detector_model_path().ends_with("det_10g.onnx"));
        assert!(config.log_path.ends_with("logs/detections.csv"));
    }

    #[test]
    fn test_default_paths_share_one_data_dir() {
        let config = Config::default();
        let root = moodlens_core::data_dir();
        assert!(config.model_dir.starts_with(&root));
        assert!(config.log_path.starts_with(&root));
        assert!(config.screenshot_dir.starts_with(&root));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            camera_device = "/dev/video2"
            max_frames = 100
            log_path = "/tmp/moodlens/log.csv"

            [selection]
            neutral_fallback = true
            smoothing_window = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.camera_device, "/dev/video2");
        assert_eq!(config.max_frames, Some(100));
        assert_eq!(config.log_path, PathBuf::from("/tmp/moodlens/log.csv"));
        assert!(config.selection.neutral_fallback);
        assert_eq!(config.selection.smoothing_window, 3);
        assert!(config.selection.weights.is_none());
        assert_eq!(config.frame_width, 640);
    }

    #[test]
    fn test_toml_weights() {
        let config = Config::from_toml(
            r#"
            [selection.weights]
            happy = 1.0
            sad = 1.5
            angry = 1.0
            neutral = 0.5
            surprise = 1.0
            fear = 1.0
            disgust = 1.0
            "#,
        )
        .unwrap();
        let weights = config.selection.weights.unwrap();
        assert_eq!(weights.sad, 1.5);
    }

    #[test]
    fn test_invalid_toml_rejected() {
        assert!(Config::from_toml("frame_width = \"wide\"").is_err());
    }

    #[test]
    fn test_missing_file_reported() {
        let err = Config::from_file(Path::new("/nonexistent/moodlens.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
