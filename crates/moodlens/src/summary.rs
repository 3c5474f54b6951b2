//! Offline summary of a detection log.

use crate::detection_log::DetectionRecord;
use chrono::{DateTime, FixedOffset};
use moodlens_core::{Emotion, StatsSnapshot, StatsTracker};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Serialize)]
pub struct LogSummary {
    pub records: usize,
    /// Distinct frames with at least one face.
    pub frames: usize,
    pub first: Option<DateTime<FixedOffset>>,
    pub last: Option<DateTime<FixedOffset>>,
    pub counts: StatsSnapshot,
    /// Mean reported confidence per label, for labels that occur.
    pub mean_confidence: BTreeMap<&'static str, f32>,
}

impl LogSummary {
    pub fn from_records(records: &[DetectionRecord]) -> Self {
        let mut tracker = StatsTracker::new();
        let mut confidence_sums = [0.0f64; Emotion::COUNT];
        let mut frames: Vec<u64> = Vec::new();

        for record in records {
            tracker.record(record.emotion);
            confidence_sums[record.emotion.index()] += f64::from(record.confidence);
            frames.push(record.frame);
        }
        frames.sort_unstable();
        frames.dedup();

        let counts = tracker.snapshot();
        let mean_confidence = counts
            .iter()
            .filter(|(_, n)| *n > 0)
            .map(|(e, n)| (e.label(), (confidence_sums[e.index()] / n as f64) as f32))
            .collect();

        Self {
            records: records.len(),
            frames: frames.len(),
            first: records.iter().map(|r| r.timestamp).min(),
            last: records.iter().map(|r| r.timestamp).max(),
            counts,
            mean_confidence,
        }
    }
}

impl fmt::Display for LogSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} detections across {} frames", self.records, self.frames)?;
        if let (Some(first), Some(last)) = (self.first, self.last) {
            writeln!(f, "from {first} to {last}")?;
        }
        for (emotion, share) in self.counts.percentages() {
            let count = self.counts.count(emotion);
            write!(f, "{:<8} {:>6} {:>5.1}%", emotion.label(), count, share * 100.0)?;
            if let Some(mean) = self.mean_confidence.get(emotion.label()) {
                write!(f, "  mean confidence {mean:.2}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
