//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use image::RgbImage;
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use std::io;
use std::time::Duration;
use v4l::io::traits::{CaptureStream, Stream as _};
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Kernel errno for a device that has been unplugged.
const ENODEV: i32 = 19;
const STREAM_BUFFERS: u32 = 4;
/// Longest wait for one frame before the read counts as a failed capture.
pub const CAPTURE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device disconnected: {0}")]
    Disconnected(String),
}

impl CameraError {
    /// Whether another read could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, CameraError::CaptureFailed(_))
    }
}

/// A blocking source of frames.
pub trait FrameSource {
    /// Wait for the next frame. `Ok(None)` marks the end of the stream.
    fn next_frame(&mut self) -> Result<Option<Frame>, CameraError>;
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// 8-bit grayscale (1 byte/pixel), common on IR sensors.
    Grey,
}

/// V4L2 camera device handle with a persistent capture stream.
pub struct Camera {
    // Declared before `device` so the stream is torn down first.
    stream: MmapStream<'static>,
    #[allow(dead_code)]
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
    sequence: u64,
}

/// Resolve a bare index ("0") to its device node; paths pass through.
pub fn resolve_device(device: &str) -> String {
    match device.trim().parse::<u32>() {
        Ok(index) => format!("/dev/video{index}"),
        Err(_) => device.to_string(),
    }
}

impl Camera {
    /// Open a V4L2 camera by path (`/dev/video0`) or index (`0`) and start streaming.
    pub fn open(device: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        let device_path = resolve_device(device);
        if !Path::new(&device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path));
        }

        let device = Device::with_path(&device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = %device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = width;
        fmt.height = height;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = if fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else if fourcc == FourCC::new(b"GREY") {
            PixelFormat::Grey
        } else {
            return Err(CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV or GREY)"
            )));
        };

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "negotiated format"
        );

        let mut stream = MmapStream::with_buffers(&device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| {
                tracing::error!(error = %e, "failed to create mmap stream");
                CameraError::StreamingNotSupported
            })?;
        stream.set_timeout(CAPTURE_TIMEOUT);

        Ok(Self {
            stream,
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path,
            fourcc,
            pixel_format,
            sequence: 0,
        })
    }

    /// Capture a single frame, converting to RGB.
    pub fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        let (format, width, height) = (self.pixel_format, self.width, self.height);
        let (buf, meta) = match self.stream.next() {
            Ok(next) => next,
            Err(e) => {
                let err = dequeue_error(&e);
                if e.kind() == io::ErrorKind::TimedOut {
                    // The timed-out read left its buffer queued; stopping the
                    // stream makes the next read re-queue everything cleanly.
                    if let Err(stop) = self.stream.stop() {
                        tracing::warn!(error = %stop, "failed to stop stalled stream");
                    }
                }
                return Err(err);
            }
        };

        let image = buf_to_rgb(format, buf, width, height)?;
        tracing::trace!(driver_seq = meta.sequence, bytes = buf.len(), "dequeued buffer");

        self.sequence += 1;
        Ok(Frame::new(image, self.sequence))
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

impl FrameSource for Camera {
    fn next_frame(&mut self) -> Result<Option<Frame>, CameraError> {
        self.capture_frame().map(Some)
    }
}

/// Classify a failed buffer dequeue.
fn dequeue_error(e: &io::Error) -> CameraError {
    if e.raw_os_error() == Some(ENODEV) {
        CameraError::Disconnected(e.to_string())
    } else if e.kind() == io::ErrorKind::TimedOut {
        CameraError::CaptureFailed(format!("no frame within {CAPTURE_TIMEOUT:?}"))
    } else {
        CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}"))
    }
}

/// Convert a raw buffer to RGB based on the negotiated format.
fn buf_to_rgb(format: PixelFormat, buf: &[u8], width: u32, height: u32) -> Result<RgbImage, CameraError> {
    let converted = match format {
        PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, width, height),
        PixelFormat::Grey => frame::grey_to_rgb(buf, width, height),
    };
    converted.map_err(|e| CameraError::CaptureFailed(format!("{format:?} conversion failed: {e}")))
}
