use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use moodlens_core::{FaceDetector, OnnxEmotionClassifier, SelectionPolicy, Selector, StatsSnapshot};
use moodlens_hw::Camera;
use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

mod annotate;
mod app;
mod config;
mod detection_log;
mod display;
mod screenshot;
mod summary;

use app::{App, Control, LoopSettings};
use config::Config;
use detection_log::DetectionLog;
use display::ConsoleDisplay;
use screenshot::ScreenshotWriter;

#[derive(Parser)]
#[command(name = "moodlens", about = "Live webcam emotion detection")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the live pipeline (default)
    Run(RunArgs),
    /// List video capture devices
    Devices,
    /// Summarize an existing detection log
    Summarize {
        /// Path to the CSV log
        log: PathBuf,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Default)]
struct RunArgs {
    /// Camera device path or index
    #[arg(short, long)]
    camera: Option<String>,
    /// Stop after this many frames
    #[arg(long)]
    frames: Option<u64>,
    /// Use sensitivity weights, neutral fallback and smoothing
    #[arg(long)]
    refine: bool,
    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
    /// Directory containing the ONNX models
    #[arg(long)]
    model_dir: Option<PathBuf>,
    /// CSV detection log
    #[arg(long)]
    log: Option<PathBuf>,
    #[arg(long)]
    screenshot_dir: Option<PathBuf>,
    /// Mirror each rendered frame to this JPEG
    #[arg(long)]
    preview: Option<PathBuf>,
    /// Do not draw session percentages onto frames
    #[arg(long)]
    no_overlay: bool,
}

impl RunArgs {
    fn apply(self, config: &mut Config) {
        if let Some(camera) = self.camera {
            config.camera_device = camera;
        }
        if self.frames.is_some() {
            config.max_frames = self.frames;
        }
        if self.refine {
            config.selection = SelectionPolicy::refined();
        }
        if let Some(width) = self.width {
            config.frame_width = width;
        }
        if let Some(height) = self.height {
            config.frame_height = height;
        }
        if let Some(dir) = self.model_dir {
            config.model_dir = dir;
        }
        if let Some(log) = self.log {
            config.log_path = log;
        }
        if let Some(dir) = self.screenshot_dir {
            config.screenshot_dir = dir;
        }
        if self.preview.is_some() {
            config.preview_path = self.preview;
        }
        if self.no_overlay {
            config.stats_overlay = false;
        }
    }
}

type LiveApp = App<Camera, FaceDetector, OnnxEmotionClassifier, ConsoleDisplay>;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => run(args).await,
        Commands::Devices => devices(),
        Commands::Summarize { log, json } => summarize(log, json),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "moodlens failed");
            eprintln!("moodlens: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let mut config = Config::load()?;
    args.apply(&mut config);

    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let app = initialize(&config, control_rx)?;
    let stats_rx = app.subscribe_stats();

    spawn_stdin_reader(control_tx.clone())?;
    tokio::spawn(forward_interrupts(control_tx));
    let reporter = tokio::spawn(report_stats(
        stats_rx,
        Duration::from_secs(config.status_interval_secs.max(1)),
    ));

    let pipeline = std::thread::Builder::new()
        .name("moodlens-pipeline".into())
        .spawn(move || {
            tracing::info!("pipeline thread started");
            app.run()
        })
        .context("failed to spawn pipeline thread")?;
    println!("moodlens running: type 's' + Enter for a screenshot, 'q' + Enter to quit");

    let joined = tokio::task::spawn_blocking(move || pipeline.join()).await?;
    reporter.abort();

    let Ok(outcome) = joined else {
        bail!("pipeline thread panicked");
    };
    let summary = outcome?;

    println!(
        "session ended ({:?}) after {} frames, worst latency {} ms",
        summary.reason,
        summary.frames,
        summary.max_latency.as_millis()
    );
    for (emotion, share) in summary.stats.percentages() {
        println!("  {:<8} {:>5.1}%", emotion.label(), share * 100.0);
    }
    for path in &summary.screenshots {
        println!("  screenshot: {}", path.display());
    }
    Ok(())
}

/// Open every resource the pipeline needs, failing fast on the first problem.
fn initialize(config: &Config, controls: mpsc::UnboundedReceiver<Control>) -> Result<LiveApp> {
    std::fs::create_dir_all(&config.screenshot_dir)
        .with_context(|| format!("cannot create {}", config.screenshot_dir.display()))?;

    let camera = Camera::open(&config.camera_device, config.frame_width, config.frame_height)
        .with_context(|| format!("cannot open camera {}", config.camera_device))?;
    tracing::info!(
        device = %camera.device_path,
        width = camera.width,
        height = camera.height,
        "camera ready"
    );

    let detector_path = config.detector_model_path();
    let detector = FaceDetector::load(&detector_path, config.detection_confidence)
        .with_context(|| format!("cannot load face detector {detector_path}"))?;
    tracing::info!(path = %detector_path, "face detector loaded");

    let emotion_path = config.emotion_model_path();
    let classifier = OnnxEmotionClassifier::load(&emotion_path, config.enhance_contrast)
        .with_context(|| format!("cannot load emotion classifier {emotion_path}"))?;
    tracing::info!(path = %emotion_path, "emotion classifier loaded");

    let log = DetectionLog::open(&config.log_path, config.log_flush_every, config.log_flush_interval())?;
    let display = ConsoleDisplay::new(
        config.preview_path.clone(),
        Duration::from_secs(config.status_interval_secs.max(1)),
    );

    Ok(App::new(camera, detector, classifier, display, log, controls)
        .with_screenshots(ScreenshotWriter::new(&config.screenshot_dir))
        .with_selector(Selector::new(config.selection.clone()))
        .with_settings(LoopSettings::from_config(config)))
}

/// First Ctrl-C asks the pipeline to stop after the current frame; a second one
/// exits at once, even if the pipeline is stuck inside a read.
async fn forward_interrupts(tx: mpsc::UnboundedSender<Control>) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    tracing::info!("interrupt received, stopping after the current frame");
    let _ = tx.send(Control::Quit);

    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::warn!("second interrupt, exiting immediately");
        std::process::exit(130);
    }
}

/// Forward `q`/`s` lines from stdin as controls. EOF stops reading, not the session.
fn spawn_stdin_reader(tx: mpsc::UnboundedSender<Control>) -> Result<()> {
    std::thread::Builder::new()
        .name("moodlens-stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                let control = match line.trim() {
                    "q" | "quit" => Control::Quit,
                    "s" | "screenshot" => Control::Screenshot,
                    "" => continue,
                    other => {
                        tracing::warn!(input = other, "unknown command");
                        continue;
                    }
                };
                if tx.send(control).is_err() {
                    break;
                }
            }
        })
        .context("failed to spawn stdin reader")?;
    Ok(())
}

async fn report_stats(stats: watch::Receiver<StatsSnapshot>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let snapshot = *stats.borrow();
        let Some((leading, _)) = snapshot.leading() else {
            continue;
        };
        let shares = snapshot
            .percentages()
            .iter()
            .filter(|(_, share)| *share > 0.0)
            .map(|(e, share)| format!("{e} {:.0}%", share * 100.0))
            .collect::<Vec<_>>()
            .join(", ");
        tracing::info!(faces = snapshot.total(), %leading, "{shares}");
    }
}

fn devices() -> Result<()> {
    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("no video capture devices found");
        return Ok(());
    }
    for device in devices {
        println!("{}\t{}\t{} ({})", device.path, device.name, device.driver, device.bus);
    }
    Ok(())
}

fn summarize(path: PathBuf, json: bool) -> Result<()> {
    let records = detection_log::read_records(&path)
        .with_context(|| format!("cannot read detection log {}", path.display()))?;
    let summary = summary::LogSummary::from_records(&records);
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print!("{summary}");
    }
    Ok(())
}
