//! Turning classifier scores into the emotion reported for a face.
//!
//! The default policy is a plain argmax. Sensitivity weights, a neutral
//! fallback and per-face temporal smoothing can be switched on to favour
//! subtle expressions over a dominant "neutral".

use crate::types::{Emotion, EmotionScores};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Neutral selections below this confidence may be overridden.
const NEUTRAL_FALLBACK_BELOW: f32 = 0.6;
/// Minimum probability a non-neutral label needs to override a weak neutral.
const NEUTRAL_FALLBACK_MIN_ALTERNATIVE: f32 = 0.2;

/// The emotion reported for one face, with the classifier's probability for it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Selection {
    pub emotion: Emotion,
    pub confidence: f32,
}

/// Multiplicative per-label weights used only to choose a label.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensitivityWeights {
    pub happy: f32,
    pub sad: f32,
    pub angry: f32,
    pub neutral: f32,
    pub surprise: f32,
    pub fear: f32,
    pub disgust: f32,
}

impl Default for SensitivityWeights {
    fn default() -> Self {
        Self {
            happy: 0.9,
            sad: 1.2,
            angry: 1.1,
            neutral: 0.8,
            surprise: 1.0,
            fear: 1.1,
            disgust: 1.2,
        }
    }
}

impl SensitivityWeights {
    pub fn weight(&self, emotion: Emotion) -> f32 {
        match emotion {
            Emotion::Happy => self.happy,
            Emotion::Sad => self.sad,
            Emotion::Angry => self.angry,
            Emotion::Neutral => self.neutral,
            Emotion::Surprise => self.surprise,
            Emotion::Fear => self.fear,
            Emotion::Disgust => self.disgust,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionPolicy {
    pub weights: Option<SensitivityWeights>,
    pub neutral_fallback: bool,
    /// Number of recent selections per face to vote over; 0 or 1 disables smoothing.
    pub smoothing_window: usize,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self::plain()
    }
}

impl SelectionPolicy {
    /// Argmax with declaration-order tie-break.
    pub fn plain() -> Self {
        Self {
            weights: None,
            neutral_fallback: false,
            smoothing_window: 0,
        }
    }

    /// Weighted, neutral-averse and lightly smoothed.
    pub fn refined() -> Self {
        Self {
            weights: Some(SensitivityWeights::default()),
            neutral_fallback: true,
            smoothing_window: 2,
        }
    }
}

/// Applies a [`SelectionPolicy`], keeping smoothing history per face index.
#[derive(Debug, Default)]
pub struct Selector {
    policy: SelectionPolicy,
    history: HashMap<usize, VecDeque<Emotion>>,
}

impl Selector {
    pub fn new(policy: SelectionPolicy) -> Self {
        Self {
            policy,
            history: HashMap::new(),
        }
    }

    /// Choose the reported emotion for face `face_index` of the current frame.
    pub fn select(&mut self, face_index: usize, scores: &EmotionScores) -> Selection {
        let chosen = match &self.policy.weights {
            Some(weights) => weighted_argmax(scores, weights),
            None => scores.dominant().0,
        };
        let emotion = self.smooth(face_index, chosen);
        let confidence = scores.get(emotion);

        if self.policy.neutral_fallback && emotion == Emotion::Neutral && confidence < NEUTRAL_FALLBACK_BELOW {
            let alternative = scores
                .iter()
                .filter(|(e, _)| *e != Emotion::Neutral)
                .fold(None::<(Emotion, f32)>, |best, (e, p)| match best {
                    Some((_, bp)) if bp >= p => best,
                    _ => Some((e, p)),
                });
            if let Some((alt, p)) = alternative {
                if p > NEUTRAL_FALLBACK_MIN_ALTERNATIVE {
                    return Selection { emotion: alt, confidence: p };
                }
            }
        }

        Selection { emotion, confidence }
    }

    /// Forget smoothing history for faces beyond `face_count`.
    pub fn retain_faces(&mut self, face_count: usize) {
        self.history.retain(|&idx, _| idx < face_count);
    }

    fn smooth(&mut self, face_index: usize, chosen: Emotion) -> Emotion {
        let window = self.policy.smoothing_window;
        if window <= 1 {
            return chosen;
        }

        let recent = self.history.entry(face_index).or_default();
        recent.push_back(chosen);
        while recent.len() > window {
            recent.pop_front();
        }

        // Most frequent label; ties go to the label that entered the window first.
        let mut counts = [0usize; Emotion::COUNT];
        for e in recent.iter() {
            counts[e.index()] += 1;
        }
        let mut best = recent[0];
        for e in recent.iter() {
            if counts[e.index()] > counts[best.index()] {
                best = *e;
            }
        }
        best
    }
}

fn weighted_argmax(scores: &EmotionScores, weights: &SensitivityWeights) -> Emotion {
    let weighted = EmotionScores::from_pairs(scores.iter().map(|(e, p)| (e, p * weights.weight(e))));
    weighted.dominant().0
}
