//! V4L2 capture backend

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};
use v4l::buffer::Type;
use v4l::capability::Flags;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::Format;

use super::capture::{CaptureBackend, CaptureDevice, SampleHandler};
use super::format::{FrameRate, PixelFormat, Resolution};
use super::frame::CapturedSample;
use crate::config::CaptureConfig;
use crate::error::{AppError, Result};
use crate::utils::LogThrottler;

/// Driver errors that mean the device is gone for good
fn is_device_lost(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(5) | Some(6) | Some(19) | Some(32) | Some(108)
    )
}

fn is_capture_device(device: &Device) -> bool {
    match device.query_caps() {
        Ok(caps) => {
            caps.capabilities.contains(Flags::VIDEO_CAPTURE)
                && caps.capabilities.contains(Flags::STREAMING)
        }
        Err(_) => false,
    }
}

pub struct V4l2Backend {
    config: CaptureConfig,
}

impl V4l2Backend {
    pub fn new(config: CaptureConfig) -> Self {
        Self { config }
    }
}

impl CaptureBackend for V4l2Backend {
    /// Paths of `/dev/video*` nodes that can stream video capture
    fn enumerate_devices(&self) -> Result<Vec<String>> {
        let entries = std::fs::read_dir("/dev")
            .map_err(|e| AppError::Capture(format!("Failed to read /dev: {}", e)))?;

        let mut devices: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("video"))
            })
            .filter(|path| match Device::with_path(path) {
                Ok(device) => is_capture_device(&device),
                Err(e) => {
                    debug!("Failed to open {:?}: {}", path, e);
                    false
                }
            })
            .map(|path| path.display().to_string())
            .collect();

        devices.sort();
        info!("Found {} video capture devices", devices.len());
        Ok(devices)
    }

    fn instantiate_device(&self, name: &str) -> Result<Box<dyn CaptureDevice>> {
        Ok(Box::new(V4l2CaptureDevice::open(name, self.config.clone())?))
    }
}

/// An opened V4L2 capture node
pub struct V4l2CaptureDevice {
    path: PathBuf,
    name: String,
    device: Device,
    config: CaptureConfig,
    resolution: Resolution,
    format: PixelFormat,
    stride: usize,
    frame_rate: FrameRate,
}

impl V4l2CaptureDevice {
    pub fn open(path: impl AsRef<Path>, config: CaptureConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        debug!("Opening video device: {:?}", path);

        let device = Device::with_path(&path).map_err(|e| {
            AppError::Capture(format!("Failed to open device {:?}: {}", path, e))
        })?;
        let name = device
            .query_caps()
            .map(|caps| caps.card)
            .unwrap_or_else(|_| path.display().to_string());

        Ok(Self {
            path,
            name,
            device,
            resolution: Resolution::new(config.width, config.height),
            format: config.format,
            stride: 0,
            frame_rate: FrameRate::new(config.fps_numerator, config.fps_denominator),
            config,
        })
    }

    fn negotiate_format(&mut self) -> Result<()> {
        let requested = Resolution::new(self.config.width, self.config.height);
        let actual = match self.config.format.to_fourcc() {
            Some(fourcc) => {
                let fmt = Format::new(requested.width, requested.height, fourcc);
                self.device.set_format(&fmt).map_err(|e| {
                    AppError::Capture(format!("Failed to set format: {}", e))
                })?
            }
            None => self.device.format().map_err(|e| {
                AppError::Capture(format!("Failed to get format: {}", e))
            })?,
        };

        if actual.width != requested.width || actual.height != requested.height {
            warn!(
                "Requested {}, got {}x{}",
                requested, actual.width, actual.height
            );
        }

        self.resolution = Resolution::new(actual.width, actual.height);
        self.format = PixelFormat::from_fourcc(actual.fourcc);
        self.stride = actual.stride as usize;
        if self.format == PixelFormat::Unknown {
            warn!("Device delivers unsupported fourcc {}", actual.fourcc);
        }
        Ok(())
    }

    fn negotiate_frame_rate(&mut self) {
        let requested = FrameRate::new(self.config.fps_numerator, self.config.fps_denominator);
        let mut params = match self.device.params() {
            Ok(params) => params,
            Err(e) => {
                warn!("Failed to read stream parameters: {}", e);
                return;
            }
        };
        // The interval is seconds per frame, the inverse of the rate
        params.interval = v4l::Fraction::new(requested.denominator, requested.numerator);
        let actual = self.device.set_params(&params).unwrap_or(params);
        if actual.interval.numerator > 0 && actual.interval.denominator > 0 {
            self.frame_rate = FrameRate::new(actual.interval.denominator, actual.interval.numerator);
        }
    }
}

impl CaptureDevice for V4l2CaptureDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare_streaming(&mut self) -> Result<()> {
        self.negotiate_format()?;
        self.negotiate_frame_rate();
        info!(
            "Prepared {:?} ({}): {} {} @ {}",
            self.path, self.name, self.resolution, self.format, self.frame_rate
        );
        Ok(())
    }

    fn frame_size(&self) -> Resolution {
        self.resolution
    }

    fn frame_rate(&self) -> FrameRate {
        self.frame_rate
    }

    fn video_format(&self) -> PixelFormat {
        self.format
    }

    fn stride(&self) -> usize {
        self.stride
    }

    fn stream(&mut self, run: &AtomicBool, handler: &mut dyn SampleHandler) -> Result<()> {
        let mut stream = Stream::with_buffers(
            &self.device,
            Type::VideoCapture,
            self.config.buffer_count.max(2),
        )
        .map_err(|e| AppError::Capture(format!("Failed to start streaming: {}", e)))?;

        let throttler = LogThrottler::with_secs(5);
        let mut frame_id = 0u64;
        info!("Capture started on {:?}", self.path);

        while run.load(Ordering::Relaxed) {
            trace!(frame_id, "Capture_WaitForNextSample");
            match stream.next() {
                Ok((buf, meta)) => {
                    let used = (meta.bytesused as usize).min(buf.len());
                    let timestamp = Duration::from_secs(meta.timestamp.sec.max(0) as u64)
                        + Duration::from_micros(meta.timestamp.usec.max(0) as u64);
                    trace!(frame_id, bytes = used, "Capture_SampleReady");
                    handler.on_sample(CapturedSample {
                        timestamp,
                        data: &buf[..used],
                        frame_id,
                    });
                }
                Err(e) if is_device_lost(&e) => {
                    error!("Video device lost: {:?} - {}", self.path, e);
                    return Err(AppError::Capture(format!("device lost: {}", e)));
                }
                Err(e) => {
                    trace!(frame_id, "Capture_SampleFailed");
                    crate::error_throttled!(throttler, "capture_read", "Capture error: {}", e);
                }
            }
            frame_id += 1;
        }

        info!("Capture stopped after {} frames", frame_id);
        Ok(())
    }
}
