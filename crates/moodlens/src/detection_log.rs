//! Append-only CSV log of per-face detections.

use chrono::{DateTime, FixedOffset, Local, SubsecRound};
use moodlens_core::{Emotion, FaceRegion, Selection};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Column names, in the order [`DetectionRecord`] serializes its fields.
pub const HEADER: [&str; 9] = [
    "timestamp", "frame", "face", "x", "y", "width", "height", "emotion", "confidence",
];

#[derive(Error, Debug)]
pub enum LogError {
    #[error("failed to open detection log {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to encode detection record: {0}")]
    Encode(#[from] csv::Error),
    #[error("detection log write failed: {0}")]
    Write(#[from] std::io::Error),
}

/// One detected face in one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub timestamp: DateTime<FixedOffset>,
    pub frame: u64,
    pub face: usize,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub emotion: Emotion,
    pub confidence: f32,
}

impl DetectionRecord {
    pub fn new(
        captured_at: DateTime<Local>,
        frame: u64,
        face: usize,
        region: &FaceRegion,
        selection: &Selection,
    ) -> Self {
        Self {
            timestamp: captured_at.fixed_offset().trunc_subsecs(3),
            frame,
            face,
            x: region.x,
            y: region.y,
            width: region.width,
            height: region.height,
            emotion: selection.emotion,
            confidence: selection.confidence,
        }
    }
}

/// Buffered CSV writer with periodic flushing.
///
/// Each record is encoded to a complete line before it reaches the buffer, so
/// the file only ever holds whole rows. While the writer is failing and the
/// buffer is full, new rows are dropped rather than split.
///
/// Write failures are reported once per failure episode: the first failing
/// `append` returns the error, later ones are counted and swallowed until a
/// write succeeds again.
pub struct DetectionLog<W: Write = File> {
    out: BufWriter<W>,
    flush_every: usize,
    flush_interval: Duration,
    pending: usize,
    last_flush: Instant,
    failing: bool,
    suppressed: u64,
    written: u64,
    dropped: u64,
}

impl DetectionLog<File> {
    /// Open (or create) the log at `path` in append mode.
    ///
    /// The header row is written only when the file is new or empty.
    pub fn open(path: &Path, flush_every: usize, flush_interval: Duration) -> Result<Self, LogError> {
        let open_err = |source| LogError::Open {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(open_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(open_err)?;
        let is_new = file.metadata().map_err(open_err)?.len() == 0;

        tracing::info!(path = %path.display(), is_new, "opened detection log");
        Self::from_writer(file, is_new, flush_every, flush_interval)
    }
}

impl<W: Write> DetectionLog<W> {
    pub fn from_writer(
        inner: W,
        write_header: bool,
        flush_every: usize,
        flush_interval: Duration,
    ) -> Result<Self, LogError> {
        let mut out = BufWriter::new(inner);
        if write_header {
            out.write_all(&encode_line(|w| w.write_record(HEADER))?)?;
            out.flush()?;
        }
        Ok(Self {
            out,
            flush_every: flush_every.max(1),
            flush_interval,
            pending: 0,
            last_flush: Instant::now(),
            failing: false,
            suppressed: 0,
            written: 0,
            dropped: 0,
        })
    }

    /// Buffer one record, flushing when the batch size or interval is reached.
    pub fn append(&mut self, record: &DetectionRecord) -> Result<(), LogError> {
        let result = self.try_append(record);
        self.settle(result)
    }

    /// Push buffered rows to the underlying writer.
    pub fn flush(&mut self) -> Result<(), LogError> {
        let result = self.flush_buffered();
        self.settle(result)
    }

    /// Records accepted into the log.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Records discarded because the buffer could not drain.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Failures swallowed since the last reported one.
    pub fn suppressed_failures(&self) -> u64 {
        self.suppressed
    }

    fn try_append(&mut self, record: &DetectionRecord) -> Result<(), LogError> {
        let line = encode_line(|w| w.serialize(record))?;
        // BufWriter either takes the whole line or none of it.
        if let Err(e) = self.out.write_all(&line) {
            self.dropped += 1;
            return Err(e.into());
        }
        self.written += 1;
        self.pending += 1;
        if self.pending >= self.flush_every || self.last_flush.elapsed() >= self.flush_interval {
            self.flush_buffered()?;
        }
        Ok(())
    }

    fn flush_buffered(&mut self) -> Result<(), LogError> {
        self.out.flush()?;
        self.pending = 0;
        self.last_flush = Instant::now();
        Ok(())
    }

    fn settle(&mut self, result: Result<(), LogError>) -> Result<(), LogError> {
        match result {
            Ok(()) => {
                if self.failing {
                    tracing::info!(
                        suppressed = self.suppressed,
                        dropped = self.dropped,
                        "detection log writable again"
                    );
                    self.failing = false;
                    self.suppressed = 0;
                }
                Ok(())
            }
            Err(e) if self.failing => {
                self.suppressed += 1;
                tracing::debug!(error = %e, "detection log still failing");
                Ok(())
            }
            Err(e) => {
                self.failing = true;
                Err(e)
            }
        }
    }
}

/// Encode one CSV row into an owned, newline-terminated buffer.
fn encode_line<F>(write: F) -> Result<Vec<u8>, LogError>
where
    F: FnOnce(&mut csv::Writer<&mut Vec<u8>>) -> Result<(), csv::Error>,
{
    let mut line = Vec::with_capacity(96);
    {
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(&mut line);
        write(&mut writer)?;
        writer.flush()?;
    }
    Ok(line)
}

/// Parse every record of a detection log.
pub fn read_records(path: &Path) -> Result<Vec<DetectionRecord>, csv::Error> {
    let mut reader = csv::Reader::from_path(path)?;
    reader.deserialize().collect()
}
