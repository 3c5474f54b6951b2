//! moodlens-core: Face detection and emotion classification.
//!
//! Uses SCRFD for face detection and a FER-style expression classifier,
//! both running via ONNX Runtime for CPU inference.

pub mod classifier;
pub mod detector;
pub mod enhance;
pub mod refine;
pub mod stats;
pub mod types;

pub use classifier::{ClassifierError, EmotionClassifier, OnnxEmotionClassifier};
pub use detector::{DetectorError, FaceDetector, FaceLocator};
pub use refine::{Selection, SelectionPolicy, Selector, SensitivityWeights};
pub use stats::{StatsSnapshot, StatsTracker};
pub use types::{BoundingBox, Emotion, EmotionScores, FaceRegion};

use std::path::PathBuf;

/// `$XDG_DATA_HOME/moodlens`, falling back to `~/.local/share/moodlens`.
///
/// Models, logs and screenshots all live under this directory by default.
pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("moodlens")
}

/// Default directory for ONNX model files (`<data dir>/models`).
pub fn default_model_dir() -> PathBuf {
    data_dir().join("models")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_models_live_under_data_dir() {
        let models = default_model_dir();
        assert!(data_dir().ends_with("moodlens"));
        assert_eq!(models.parent(), Some(data_dir().as_path()));
        assert!(models.ends_with("moodlens/models"));
    }
}
