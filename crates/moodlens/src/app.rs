//! The frame pipeline and its lifecycle.

use crate::annotate::{annotate, draw_stats_overlay, AnnotatedFace};
use crate::config::Config;
use crate::detection_log::{DetectionLog, DetectionRecord};
use crate::display::Display;
use crate::screenshot::ScreenshotWriter;
use image::RgbImage;
use moodlens_core::{ClassifierError, EmotionClassifier, FaceLocator, Selector, StatsSnapshot, StatsTracker};
use moodlens_hw::{CameraError, Frame, FrameSource};
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// A user request, delivered between frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Quit,
    Screenshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Initializing,
    Running,
    ShuttingDown,
    Terminated,
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("camera capture failed {attempts} times in a row: {source}")]
    CaptureExhausted { attempts: u32, source: CameraError },
    #[error("camera lost: {0}")]
    DeviceLost(CameraError),
}

/// Why a session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    QuitRequested,
    EndOfStream,
    FrameLimit,
}

#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub reason: StopReason,
    pub frames: u64,
    pub stats: StatsSnapshot,
    pub screenshots: Vec<PathBuf>,
    /// Worst capture-to-render delay seen in the session.
    pub max_latency: Duration,
}

/// Loop tuning taken from [`Config`].
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub capture_attempts: u32,
    pub capture_retry_delay: Duration,
    pub max_frames: Option<u64>,
    pub stats_overlay: bool,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl LoopSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            capture_attempts: config.capture_attempts.max(1),
            capture_retry_delay: config.capture_retry_delay(),
            max_frames: config.max_frames,
            stats_overlay: config.stats_overlay,
        }
    }
}

/// Owns every pipeline stage and runs them one frame at a time.
pub struct App<S, L, C, D, W: Write = File> {
    source: S,
    locator: L,
    classifier: C,
    display: D,
    log: DetectionLog<W>,
    controls: mpsc::UnboundedReceiver<Control>,
    screenshots: Option<ScreenshotWriter>,
    selector: Selector,
    settings: LoopSettings,
    stats: StatsTracker,
    stats_tx: watch::Sender<StatsSnapshot>,
    state: AppState,
    last_rendered: Option<RgbImage>,
    saved: Vec<PathBuf>,
    frames: u64,
    max_latency: Duration,
}

impl<S, L, C, D, W> App<S, L, C, D, W>
where
    S: FrameSource,
    L: FaceLocator,
    C: EmotionClassifier,
    D: Display,
    W: Write,
{
    pub fn new(
        source: S,
        locator: L,
        classifier: C,
        display: D,
        log: DetectionLog<W>,
        controls: mpsc::UnboundedReceiver<Control>,
    ) -> Self {
        let (stats_tx, _) = watch::channel(StatsSnapshot::default());
        Self {
            source,
            locator,
            classifier,
            display,
            log,
            controls,
            screenshots: None,
            selector: Selector::default(),
            settings: LoopSettings::default(),
            stats: StatsTracker::new(),
            stats_tx,
            state: AppState::Initializing,
            last_rendered: None,
            saved: Vec::new(),
            frames: 0,
            max_latency: Duration::ZERO,
        }
    }

    pub fn with_screenshots(mut self, writer: ScreenshotWriter) -> Self {
        self.screenshots = Some(writer);
        self
    }

    pub fn with_selector(mut self, selector: Selector) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_settings(mut self, settings: LoopSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Receive a stats snapshot after every frame.
    pub fn subscribe_stats(&self) -> watch::Receiver<StatsSnapshot> {
        self.stats_tx.subscribe()
    }

    pub fn state(&self) -> AppState {
        self.state
    }

    /// Run until quit, end of stream, the frame limit, or a fatal camera error.
    ///
    /// The log is flushed and the display closed on every path out.
    pub fn run(mut self) -> Result<SessionSummary, AppError> {
        self.transition(AppState::Running);
        let outcome = self.frame_loop();

        self.transition(AppState::ShuttingDown);
        if let Err(e) = self.log.flush() {
            tracing::error!(error = %e, "final detection log flush failed");
        }
        self.display.close();
        self.transition(AppState::Terminated);

        let reason = outcome?;
        tracing::info!(
            ?reason,
            frames = self.frames,
            records = self.log.written(),
            faces = self.stats.total(),
            max_latency_ms = self.max_latency.as_millis() as u64,
            "session finished"
        );
        Ok(SessionSummary {
            reason,
            frames: self.frames,
            stats: self.stats.snapshot(),
            screenshots: std::mem::take(&mut self.saved),
            max_latency: self.max_latency,
        })
    }

    fn transition(&mut self, next: AppState) {
        tracing::debug!(from = ?self.state, to = ?next, "state transition");
        self.state = next;
    }

    fn frame_loop(&mut self) -> Result<StopReason, AppError> {
        loop {
            let Some(frame) = self.next_frame()? else {
                tracing::info!("frame source ended");
                return Ok(StopReason::EndOfStream);
            };
            self.process(&frame);
            self.frames += 1;

            if self.poll_controls() {
                return Ok(StopReason::QuitRequested);
            }
            if self.settings.max_frames.is_some_and(|max| self.frames >= max) {
                return Ok(StopReason::FrameLimit);
            }
        }
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, AppError> {
        let attempts = self.settings.capture_attempts;
        let mut attempt = 1;
        loop {
            match self.source.next_frame() {
                Ok(frame) => return Ok(frame),
                Err(e) if e.is_transient() && attempt < attempts => {
                    tracing::warn!(attempt, attempts, error = %e, "capture failed, retrying");
                    std::thread::sleep(self.settings.capture_retry_delay);
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    return Err(AppError::CaptureExhausted { attempts, source: e });
                }
                Err(e) => return Err(AppError::DeviceLost(e)),
            }
        }
    }

    fn process(&mut self, frame: &Frame) {
        let regions = match self.locator.locate(&frame.image) {
            Ok(regions) => regions,
            Err(e) => {
                tracing::warn!(frame = frame.sequence, error = %e, "face location failed");
                Vec::new()
            }
        };
        self.selector.retain_faces(regions.len());

        let mut faces = Vec::with_capacity(regions.len());
        for (index, region) in regions.iter().enumerate() {
            let crop = region.crop(&frame.image);
            let scores = match self.classifier.classify(&crop) {
                Ok(scores) => scores,
                Err(ClassifierError::InvalidInput { width, height }) => {
                    tracing::warn!(frame = frame.sequence, face = index, width, height, "skipping unusable face crop");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(frame = frame.sequence, face = index, error = %e, "classification failed");
                    continue;
                }
            };

            let selection = self.selector.select(index, &scores);
            self.stats.record(selection.emotion);

            let record = DetectionRecord::new(frame.captured_at, frame.sequence, index, region, &selection);
            if let Err(e) = self.log.append(&record) {
                tracing::error!(error = %e, "detection log write failed");
                self.display.status(&format!("detection log unavailable: {e}"));
            }
            faces.push(AnnotatedFace {
                region: *region,
                selection,
            });
        }

        let snapshot = self.stats.snapshot();
        let mut rendered = annotate(&frame.image, &faces);
        if self.settings.stats_overlay {
            draw_stats_overlay(&mut rendered, &snapshot);
        }
        if let Err(e) = self.display.render(&rendered) {
            tracing::warn!(error = %e, "render failed");
            self.display.status(&format!("display: {e}"));
        }
        self.last_rendered = Some(rendered);
        self.stats_tx.send_replace(snapshot);

        let latency = frame.timestamp.elapsed();
        tracing::trace!(frame = frame.sequence, latency_ms = latency.as_millis() as u64, "frame processed");
        self.max_latency = self.max_latency.max(latency);
    }

    /// Drain pending controls in arrival order. Returns true when quit was requested.
    fn poll_controls(&mut self) -> bool {
        while let Ok(control) = self.controls.try_recv() {
            match control {
                Control::Screenshot => self.take_screenshot(),
                Control::Quit => {
                    tracing::info!(frame = self.frames, "quit requested");
                    return true;
                }
            }
        }
        false
    }

    fn take_screenshot(&mut self) {
        let (Some(writer), Some(image)) = (&self.screenshots, &self.last_rendered) else {
            self.display.status("screenshot unavailable");
            return;
        };
        match writer.save(image, chrono::Local::now()) {
            Ok(path) => {
                self.display.status(&format!("saved {}", path.display()));
                self.saved.push(path);
            }
            Err(e) => {
                tracing::warn!(error = %e, "screenshot failed");
                self.display.status(&format!("screenshot failed: {e}"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection_log::read_records;
    use crate::display::DisplayError;
    use image::GrayImage;
    use moodlens_core::{DetectorError, Emotion, EmotionScores, FaceRegion};
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::rc::Rc;

    struct ScriptedSource {
        script: VecDeque<Result<Option<Frame>, CameraError>>,
        pulls: Rc<RefCell<u32>>,
    }

    impl ScriptedSource {
        fn frames(count: u64) -> Self {
            Self::new((0..count).map(|seq| Ok(Some(frame(seq)))).collect())
        }

        fn new(script: Vec<Result<Option<Frame>, CameraError>>) -> Self {
            Self {
                script: script.into(),
                pulls: Rc::new(RefCell::new(0)),
            }
        }
    }

    impl FrameSource for ScriptedSource {
        fn next_frame(&mut self) -> Result<Option<Frame>, CameraError> {
            *self.pulls.borrow_mut() += 1;
            self.script.pop_front().unwrap_or(Ok(None))
        }
    }

    struct FixedLocator(Vec<FaceRegion>);

    impl FaceLocator for FixedLocator {
        fn locate(&mut self, _frame: &RgbImage) -> Result<Vec<FaceRegion>, DetectorError> {
            Ok(self.0.clone())
        }
    }

    /// Validates the crop like a real model, then returns fixed scores.
    struct FixedClassifier(EmotionScores);

    impl EmotionClassifier for FixedClassifier {
        fn classify(&mut self, face: &GrayImage) -> Result<EmotionScores, ClassifierError> {
            moodlens_core::classifier::validate_crop(face)?;
            Ok(self.0)
        }
    }

    #[derive(Default, Clone)]
    struct RecordingDisplay {
        rendered: Rc<RefCell<Vec<RgbImage>>>,
        messages: Rc<RefCell<Vec<String>>>,
        closed: Rc<RefCell<bool>>,
    }

    impl Display for RecordingDisplay {
        fn render(&mut self, frame: &RgbImage) -> Result<(), DisplayError> {
            self.rendered.borrow_mut().push(frame.clone());
            Ok(())
        }

        fn status(&mut self, message: &str) {
            self.messages.borrow_mut().push(message.to_string());
        }

        fn close(&mut self) {
            *self.closed.borrow_mut() = true;
        }
    }

    fn frame(seq: u64) -> Frame {
        Frame::new(RgbImage::from_pixel(64, 48, image::Rgb([90, 90, 90])), seq)
    }

    fn region(x: u32) -> FaceRegion {
        FaceRegion { x, y: 10, width: 20, height: 20, confidence: 0.9 }
    }

    fn happy() -> EmotionScores {
        EmotionScores::from_pairs([(Emotion::Happy, 0.7), (Emotion::Sad, 0.1), (Emotion::Neutral, 0.2)])
    }

    fn settings() -> LoopSettings {
        LoopSettings {
            capture_attempts: 3,
            capture_retry_delay: Duration::ZERO,
            max_frames: None,
            stats_overlay: false,
        }
    }

    fn log_at(path: &Path) -> DetectionLog {
        DetectionLog::open(path, 1, Duration::from_secs(60)).unwrap()
    }

    fn app(
        source: ScriptedSource,
        faces: Vec<FaceRegion>,
        display: RecordingDisplay,
        log_path: &Path,
    ) -> (
        App<ScriptedSource, FixedLocator, FixedClassifier, RecordingDisplay>,
        mpsc::UnboundedSender<Control>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let app = App::new(
            source,
            FixedLocator(faces),
            FixedClassifier(happy()),
            display,
            log_at(log_path),
            rx,
        )
        .with_settings(settings());
        (app, tx)
    }

    #[test]
    fn test_happy_face_is_logged_counted_and_drawn() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("log.csv");
        let display = RecordingDisplay::default();
        let (app, _tx) = app(ScriptedSource::frames(1), vec![region(10)], display.clone(), &log_path);
        let stats_rx = app.subscribe_stats();

        let summary = app.run().unwrap();
        assert_eq!(summary.reason, StopReason::EndOfStream);
        assert_eq!(summary.frames, 1);
        assert_eq!(summary.stats.count(Emotion::Happy), 1);
        assert_eq!(summary.stats.percentages()[Emotion::Happy.index()], (Emotion::Happy, 1.0));
        assert_eq!(*stats_rx.borrow(), summary.stats);

        let records = read_records(&log_path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].emotion, Emotion::Happy);
        assert!((records[0].confidence - 0.7).abs() < 1e-6);
        assert_eq!((records[0].x, records[0].width), (10, 20));

        let rendered = display.rendered.borrow();
        assert_eq!(rendered.len(), 1);
        // Box edge drawn in the Happy colour.
        assert_eq!(rendered[0].get_pixel(10, 25).0, [255, 255, 0]);
        assert!(*display.closed.borrow());
    }

    #[test]
    fn test_frame_without_faces_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("log.csv");
        let display = RecordingDisplay::default();
        let (app, _tx) = app(ScriptedSource::frames(2), Vec::new(), display.clone(), &log_path);

        let summary = app.run().unwrap();
        assert_eq!(summary.frames, 2);
        assert_eq!(summary.stats.total(), 0);
        assert!(read_records(&log_path).unwrap().is_empty());
        assert_eq!(display.rendered.borrow()[0], frame(0).image);
    }

    #[test]
    fn test_invalid_crop_skips_only_that_face() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("log.csv");
        // The first region lies outside the 64x48 frame and crops to nothing.
        let faces = vec![region(100), region(30)];
        let (app, _tx) = app(ScriptedSource::frames(1), faces, RecordingDisplay::default(), &log_path);

        let summary = app.run().unwrap();
        assert_eq!(summary.stats.total(), 1);
        let records = read_records(&log_path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].face, 1);
        assert_eq!(records[0].x, 30);
    }

    #[test]
    fn test_quit_takes_effect_after_current_frame() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("log.csv");
        let source = ScriptedSource::frames(5);
        let pulls = source.pulls.clone();
        let (app, tx) = app(source, vec![region(10)], RecordingDisplay::default(), &log_path);
        tx.send(Control::Quit).unwrap();

        let summary = app.run().unwrap();
        assert_eq!(summary.reason, StopReason::QuitRequested);
        assert_eq!(summary.frames, 1);
        assert_eq!(*pulls.borrow(), 1);
        let records = read_records(&log_path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].frame, 0);
    }

    #[test]
    fn test_screenshot_saves_exactly_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let shots = dir.path().join("shots");
        let display = RecordingDisplay::default();
        let (app, tx) = app(ScriptedSource::frames(3), vec![region(10)], display.clone(), &dir.path().join("log.csv"));
        let app = app.with_screenshots(ScreenshotWriter::new(&shots));
        tx.send(Control::Screenshot).unwrap();
        tx.send(Control::Quit).unwrap();

        let summary = app.run().unwrap();
        assert_eq!(summary.screenshots.len(), 1);
        assert_eq!(std::fs::read_dir(&shots).unwrap().count(), 1);
        let saved = image::open(&summary.screenshots[0]).unwrap().to_rgb8();
        assert_eq!(saved, display.rendered.borrow()[0]);
    }

    #[test]
    fn test_screenshot_failure_is_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let display = RecordingDisplay::default();
        let (app, tx) = app(ScriptedSource::frames(2), Vec::new(), display.clone(), &dir.path().join("log.csv"));
        let app = app.with_screenshots(ScreenshotWriter::new(blocker.join("shots")));
        tx.send(Control::Screenshot).unwrap();

        let summary = app.run().unwrap();
        assert_eq!(summary.frames, 2);
        assert!(summary.screenshots.is_empty());
        assert!(display.messages.borrow().iter().any(|m| m.starts_with("screenshot failed")));
    }

    #[test]
    fn test_transient_capture_errors_are_retried() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScriptedSource::new(vec![
            Err(CameraError::CaptureFailed("timeout".into())),
            Err(CameraError::CaptureFailed("timeout".into())),
            Ok(Some(frame(0))),
        ]);
        let (app, _tx) = app(source, Vec::new(), RecordingDisplay::default(), &dir.path().join("log.csv"));

        let summary = app.run().unwrap();
        assert_eq!(summary.frames, 1);
        assert_eq!(summary.reason, StopReason::EndOfStream);
    }

    #[test]
    fn test_capture_retries_exhausted_is_fatal_but_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("log.csv");
        let mut script = vec![Ok(Some(frame(0)))];
        script.extend((0..3).map(|_| Err(CameraError::CaptureFailed("timeout".into()))));
        let display = RecordingDisplay::default();
        let (app, _tx) = app(ScriptedSource::new(script), vec![region(10)], display.clone(), &log_path);

        let err = app.run().unwrap_err();
        assert!(matches!(err, AppError::CaptureExhausted { attempts: 3, .. }));
        assert_eq!(read_records(&log_path).unwrap().len(), 1);
        assert!(*display.closed.borrow());
    }

    #[test]
    fn test_disconnect_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScriptedSource::new(vec![Err(CameraError::Disconnected("unplugged".into()))]);
        let pulls = source.pulls.clone();
        let (app, _tx) = app(source, Vec::new(), RecordingDisplay::default(), &dir.path().join("log.csv"));

        assert!(matches!(app.run(), Err(AppError::DeviceLost(_))));
        assert_eq!(*pulls.borrow(), 1);
    }

    #[test]
    fn test_log_follows_capture_order() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("log.csv");
        let (app, _tx) = app(ScriptedSource::frames(3), vec![region(5), region(35)], RecordingDisplay::default(), &log_path);

        app.run().unwrap();
        let order: Vec<(u64, usize)> = read_records(&log_path).unwrap().iter().map(|r| (r.frame, r.face)).collect();
        assert_eq!(order, vec![(0, 0), (0, 1), (1, 0), (1, 1), (2, 0), (2, 1)]);
    }

    #[test]
    fn test_frame_limit_stops_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _tx) = app(ScriptedSource::frames(10), Vec::new(), RecordingDisplay::default(), &dir.path().join("log.csv"));
        let app = app.with_settings(LoopSettings { max_frames: Some(4), ..settings() });
        assert_eq!(app.state(), AppState::Initializing);

        let summary = app.run().unwrap();
        assert_eq!(summary.reason, StopReason::FrameLimit);
        assert_eq!(summary.frames, 4);
    }

    #[test]
    fn test_latency_measured_from_capture_time() {
        let dir = tempfile::tempdir().unwrap();
        let mut stale = frame(0);
        stale.timestamp = std::time::Instant::now().checked_sub(Duration::from_millis(50)).unwrap();
        let source = ScriptedSource::new(vec![Ok(Some(stale)), Ok(Some(frame(1)))]);
        let (app, _tx) = app(source, vec![region(10)], RecordingDisplay::default(), &dir.path().join("log.csv"));

        let summary = app.run().unwrap();
        assert_eq!(summary.frames, 2);
        assert!(summary.max_latency >= Duration::from_millis(50));
    }
}
