//! Running per-session emotion tallies.

use crate::types::Emotion;
use serde::{Serialize, Serializer};

/// Immutable copy of the session counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    counts: [u64; Emotion::COUNT],
}

impl StatsSnapshot {
    pub fn count(&self, emotion: Emotion) -> u64 {
        self.counts[emotion.index()]
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Emotion, u64)> + '_ {
        Emotion::ALL.into_iter().map(|e| (e, self.counts[e.index()]))
    }

    /// Each label's share of the total; all zero when nothing was recorded.
    pub fn percentages(&self) -> [(Emotion, f32); Emotion::COUNT] {
        let total = self.total();
        Emotion::ALL.map(|e| {
            let share = if total == 0 {
                0.0
            } else {
                self.counts[e.index()] as f32 / total as f32
            };
            (e, share)
        })
    }

    /// Most frequent label so far, earliest-declared on ties.
    pub fn leading(&self) -> Option<(Emotion, u64)> {
        if self.total() == 0 {
            return None;
        }
        self.iter().fold(None, |best, (e, c)| match best {
            Some((_, bc)) if bc >= c => best,
            _ => Some((e, c)),
        })
    }
}

impl Serialize for StatsSnapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.iter().map(|(e, c)| (e.label(), c)))
    }
}

/// Mutable session tally, owned by the pipeline loop.
///
/// Counts never decrease; the sum of all counts equals the number of
/// [`record`](Self::record) calls.
#[derive(Debug, Default)]
pub struct StatsTracker {
    current: StatsSnapshot,
}

impl StatsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, emotion: Emotion) {
        self.current.counts[emotion.index()] += 1;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.current
    }

    pub fn percentages(&self) -> [(Emotion, f32); Emotion::COUNT] {
        self.current.percentages()
    }

    pub fn total(&self) -> u64 {
        self.current.total()
    }
}
