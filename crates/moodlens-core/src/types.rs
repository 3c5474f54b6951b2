use serde::{Deserialize, Serialize};
use std::fmt;

/// Raw detector output in frame coordinates (may extend past the frame edges).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// A face rectangle in pixel coordinates, guaranteed to lie inside its source frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Detector confidence in [0, 1].
    pub confidence: f32,
}

impl FaceRegion {
    /// Clamp a detector box to a `frame_width` × `frame_height` frame.
    ///
    /// Returns `None` when nothing of the box remains inside the frame.
    pub fn from_bbox(bbox: &BoundingBox, frame_width: u32, frame_height: u32) -> Option<Self> {
        let fw = frame_width as f32;
        let fh = frame_height as f32;
        let x1 = bbox.x.max(0.0).min(fw);
        let y1 = bbox.y.max(0.0).min(fh);
        let x2 = (bbox.x + bbox.width).max(0.0).min(fw);
        let y2 = (bbox.y + bbox.height).max(0.0).min(fh);

        let x = x1.floor() as u32;
        let y = y1.floor() as u32;
        let width = (x2.ceil() as u32).saturating_sub(x);
        let height = (y2.ceil() as u32).saturating_sub(y);
        if width == 0 || height == 0 {
            return None;
        }

        Some(Self {
            x,
            y,
            width,
            height,
            confidence: bbox.confidence,
        })
    }

    /// Crop this region out of `frame` as a grayscale image.
    ///
    /// The crop is clipped to the frame; a region that falls outside yields an
    /// empty image, which classifiers reject as invalid input.
    pub fn crop(&self, frame: &image::RgbImage) -> image::GrayImage {
        let x = self.x.min(frame.width());
        let y = self.y.min(frame.height());
        let width = self.width.min(frame.width() - x);
        let height = self.height.min(frame.height() - y);
        let view = image::imageops::crop_imm(frame, x, y, width, height).to_image();
        image::imageops::grayscale(&view)
    }
}

/// The fixed emotion label set.
///
/// Declaration order doubles as the tie-break priority when two labels score equally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Emotion {
    Happy,
    Sad,
    Angry,
    Neutral,
    Surprise,
    Fear,
    Disgust,
}

impl Emotion {
    pub const COUNT: usize = 7;

    pub const ALL: [Emotion; Emotion::COUNT] = [
        Emotion::Happy,
        Emotion::Sad,
        Emotion::Angry,
        Emotion::Neutral,
        Emotion::Surprise,
        Emotion::Fear,
        Emotion::Disgust,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn label(self) -> &'static str {
        match self {
            Emotion::Happy => "Happy",
            Emotion::Sad => "Sad",
            Emotion::Angry => "Angry",
            Emotion::Neutral => "Neutral",
            Emotion::Surprise => "Surprise",
            Emotion::Fear => "Fear",
            Emotion::Disgust => "Disgust",
        }
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Probability distribution over [`Emotion::ALL`] for one face.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EmotionScores {
    probs: [f32; Emotion::COUNT],
}

impl EmotionScores {
    /// Tolerance used when checking that scores sum to one.
    pub const SUM_TOLERANCE: f32 = 1e-3;

    /// Build scores from `(label, probability)` pairs; unlisted labels score 0.
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (Emotion, f32)>,
    {
        let mut probs = [0.0f32; Emotion::COUNT];
        for (emotion, p) in pairs {
            probs[emotion.index()] = p;
        }
        Self { probs }
    }

    pub fn get(&self, emotion: Emotion) -> f32 {
        self.probs[emotion.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (Emotion, f32)> + '_ {
        Emotion::ALL.into_iter().map(|e| (e, self.probs[e.index()]))
    }

    pub fn sum(&self) -> f32 {
        self.probs.iter().sum()
    }

    /// True when every probability is in [0, 1] and they sum to one.
    pub fn is_distribution(&self) -> bool {
        self.probs.iter().all(|p| (0.0..=1.0).contains(p))
            && (self.sum() - 1.0).abs() <= Self::SUM_TOLERANCE
    }

    /// Label with the highest probability, earliest-declared label on ties.
    pub fn dominant(&self) -> (Emotion, f32) {
        let mut best = (Emotion::ALL[0], self.probs[0]);
        for (emotion, p) in self.iter().skip(1) {
            // Strict comparison keeps the earlier label on ties.
            if p > best.1 {
                best = (emotion, p);
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dominant_picks_max() {
        let scores = EmotionScores::from_pairs([
            (Emotion::Happy, 0.7),
            (Emotion::Sad, 0.1),
            (Emotion::Neutral, 0.2),
        ]);
        assert_eq!(scores.dominant(), (Emotion::Happy, 0.7));
        assert!(scores.is_distribution());
    }

    #[test]
    fn test_dominant_tie_uses_declaration_order() {
        let scores = EmotionScores::from_pairs([(Emotion::Fear, 0.5), (Emotion::Sad, 0.5)]);
        assert_eq!(scores.dominant().0, Emotion::Sad);

        let scores = EmotionScores::from_pairs([(Emotion::Disgust, 0.5), (Emotion::Neutral, 0.5)]);
        assert_eq!(scores.dominant().0, Emotion::Neutral);
    }

    #[test]
    fn test_dominant_all_zero_is_first_label() {
        let scores = EmotionScores::default();
        assert_eq!(scores.dominant(), (Emotion::Happy, 0.0));
        assert!(!scores.is_distribution());
    }

    #[test]
    fn test_region_clamped_to_frame() {
        let bbox = BoundingBox { x: -10.0, y: 5.5, width: 50.0, height: 200.0, confidence: 0.9 };
        let region = FaceRegion::from_bbox(&bbox, 100, 80).unwrap();
        assert_eq!((region.x, region.y), (0, 5));
        assert_eq!((region.width, region.height), (40, 75));
        assert!(region.x + region.width <= 100);
        assert!(region.y + region.height <= 80);
    }

    #[test]
    fn test_region_outside_frame_dropped() {
        let bbox = BoundingBox { x: 150.0, y: 10.0, width: 20.0, height: 20.0, confidence: 0.9 };
        assert!(FaceRegion::from_bbox(&bbox, 100, 80).is_none());
    }

    #[test]
    fn test_crop_dimensions() {
        let frame = image::RgbImage::from_pixel(64, 48, image::Rgb([200, 100, 50]));
        let region = FaceRegion { x: 10, y: 8, width: 20, height: 16, confidence: 1.0 };
        let crop = region.crop(&frame);
        assert_eq!(crop.dimensions(), (20, 16));
    }

    #[test]
    fn test_crop_outside_frame_is_empty() {
        let frame = image::RgbImage::new(32, 32);
        let region = FaceRegion { x: 40, y: 0, width: 10, height: 10, confidence: 1.0 };
        let crop = region.crop(&frame);
        assert_eq!(crop.width(), 0);
    }
}
