//! Facial expression classifier via ONNX Runtime.
//!
//! Expects a 7-class model over 48×48 single-channel crops, with outputs in
//! the FER-2013 order used by common pretrained exports:
//! angry, disgust, fear, happy, sad, surprise, neutral.

use crate::enhance;
use crate::types::{Emotion, EmotionScores};
use image::imageops::FilterType;
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const FER_INPUT_SIZE: u32 = 48;
const FER_OUTPUT_ORDER: [Emotion; Emotion::COUNT] = [
    Emotion::Angry,
    Emotion::Disgust,
    Emotion::Fear,
    Emotion::Happy,
    Emotion::Sad,
    Emotion::Surprise,
    Emotion::Neutral,
];

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("invalid input: {width}x{height} face crop")]
    InvalidInput { width: u32, height: u32 },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Anything that turns a cropped face into a distribution over [`Emotion`]s.
pub trait EmotionClassifier {
    fn classify(&mut self, face: &GrayImage) -> Result<EmotionScores, ClassifierError>;
}

/// Reject crops with no pixels before they reach a model.
pub fn validate_crop(face: &GrayImage) -> Result<(), ClassifierError> {
    let (width, height) = face.dimensions();
    if width == 0 || height == 0 {
        return Err(ClassifierError::InvalidInput { width, height });
    }
    Ok(())
}

/// ONNX-backed expression classifier.
pub struct OnnxEmotionClassifier {
    session: Session,
    enhance_contrast: bool,
}

impl OnnxEmotionClassifier {
    /// Load the classifier ONNX model from the given path.
    pub fn load(model_path: &str, enhance_contrast: bool) -> Result<Self, ClassifierError> {
        if !Path::new(model_path).exists() {
            return Err(ClassifierError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            enhance_contrast,
            "loaded emotion model"
        );

        Ok(Self {
            session,
            enhance_contrast,
        })
    }

    /// Resize a face crop to the model input and scale it to [0, 1] in NCHW layout.
    fn preprocess(&self, face: &GrayImage) -> Array4<f32> {
        let mut face = face.clone();
        if self.enhance_contrast {
            enhance::clahe(&mut face, enhance::FACE_CLAHE_TILES, enhance::FACE_CLAHE_CLIP);
        }
        to_tensor(&face)
    }
}

fn to_tensor(face: &GrayImage) -> Array4<f32> {
    let size = FER_INPUT_SIZE as usize;
    let resized = image::imageops::resize(face, FER_INPUT_SIZE, FER_INPUT_SIZE, FilterType::Triangle);
    let mut tensor = Array4::<f32>::zeros((1, 1, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        tensor[[0, 0, y as usize, x as usize]] = pixel.0[0] as f32 / 255.0;
    }
    tensor
}

impl EmotionClassifier for OnnxEmotionClassifier {
    fn classify(&mut self, face: &GrayImage) -> Result<EmotionScores, ClassifierError> {
        validate_crop(face)?;
        let input = self.preprocess(face);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ClassifierError::InferenceFailed(format!("emotion output: {e}")))?;

        scores_from_output(raw)
    }
}

/// Map raw model output to [`EmotionScores`], applying softmax when the model
/// emits logits rather than probabilities.
fn scores_from_output(raw: &[f32]) -> Result<EmotionScores, ClassifierError> {
    if raw.len() != FER_OUTPUT_ORDER.len() {
        return Err(ClassifierError::InferenceFailed(format!(
            "expected {} emotion outputs, got {}",
            FER_OUTPUT_ORDER.len(),
            raw.len()
        )));
    }

    let scores = EmotionScores::from_pairs(FER_OUTPUT_ORDER.iter().copied().zip(raw.iter().copied()));
    if scores.is_distribution() {
        return Ok(scores);
    }

    let max_logit = raw.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp: Vec<f32> = raw.iter().map(|&x| (x - max_logit).exp()).collect();
    let exp_sum: f32 = exp.iter().sum();
    if !exp_sum.is_finite() || exp_sum <= 0.0 {
        return Err(ClassifierError::InferenceFailed("non-finite emotion logits".into()));
    }

    Ok(EmotionScores::from_pairs(
        FER_OUTPUT_ORDER.iter().copied().zip(exp.iter().map(|e| e / exp_sum)),
    ))
}
