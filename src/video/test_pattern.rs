//! Synthetic capture device producing moving color bars
//!
//! Useful on machines without a camera and for exercising the pipeline end to
//! end. It can emit any supported layout, and also an unrecognized one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, trace};

use crate::config::CaptureConfig;
use crate::error::{AppError, Result};

use super::capture::{CaptureBackend, CaptureDevice, SampleHandler};
use super::format::{FrameRate, PixelFormat, Resolution};
use super::frame::CapturedSample;

pub const TEST_PATTERN_DEVICE: &str = "test-pattern";

/// RGB of the eight classic bars
const BARS: [[u8; 3]; 8] = [
    [235, 235, 235],
    [235, 235, 16],
    [16, 235, 235],
    [16, 235, 16],
    [235, 16, 235],
    [235, 16, 16],
    [16, 16, 235],
    [16, 16, 16],
];

pub struct TestPatternBackend {
    config: CaptureConfig,
}

impl TestPatternBackend {
    pub fn new(config: CaptureConfig) -> Self {
        Self { config }
    }
}

impl CaptureBackend for TestPatternBackend {
    fn enumerate_devices(&self) -> Result<Vec<String>> {
        Ok(vec![TEST_PATTERN_DEVICE.to_string()])
    }

    fn instantiate_device(&self, name: &str) -> Result<Box<dyn CaptureDevice>> {
        if name != TEST_PATTERN_DEVICE {
            return Err(AppError::Capture(format!("no such device: {}", name)));
        }
        Ok(Box::new(TestPatternDevice::new(
            Resolution::new(self.config.width, self.config.height),
            FrameRate::new(self.config.fps_numerator, self.config.fps_denominator),
            self.config.format,
        )))
    }
}

pub struct TestPatternDevice {
    resolution: Resolution,
    frame_rate: FrameRate,
    format: PixelFormat,
    buffer: Vec<u8>,
}

impl TestPatternDevice {
    pub fn new(resolution: Resolution, frame_rate: FrameRate, format: PixelFormat) -> Self {
        Self {
            resolution,
            frame_rate,
            format,
            buffer: Vec::new(),
        }
    }

    fn bar_at(&self, x: usize, offset: usize) -> [u8; 3] {
        let width = (self.resolution.width as usize).max(1);
        BARS[((x + offset) % width) * BARS.len() / width]
    }

    /// Render the pattern shifted by `offset` pixels into the internal buffer
    fn render(&mut self, offset: usize) {
        let width = self.resolution.width as usize;
        let height = self.resolution.height as usize;
        let mut buffer = std::mem::take(&mut self.buffer);
        buffer.clear();

        match self.format {
            PixelFormat::Bgra => {
                for _ in 0..height {
                    for x in 0..width {
                        let [r, g, b] = self.bar_at(x, offset);
                        buffer.extend_from_slice(&[b, g, r, 255]);
                    }
                }
            }
            PixelFormat::Rgb24 => {
                for _ in 0..height {
                    for x in 0..width {
                        buffer.extend_from_slice(&self.bar_at(x, offset));
                    }
                }
            }
            PixelFormat::Nv12 => {
                for _ in 0..height {
                    for x in 0..width {
                        let [r, g, b] = self.bar_at(x, offset);
                        let y = (66 * r as u32 + 129 * g as u32 + 25 * b as u32 + 128) >> 8;
                        buffer.push((y + 16) as u8);
                    }
                }
                buffer.resize(width * height + width * height.div_ceil(2), 128);
            }
            PixelFormat::Unknown => {
                // Packed 4:2:2-sized noise the adapter cannot interpret
                buffer.resize(width * height * 2, (offset % 256) as u8);
            }
        }
        self.buffer = buffer;
    }
}

impl CaptureDevice for TestPatternDevice {
    fn name(&self) -> &str {
        TEST_PATTERN_DEVICE
    }

    fn prepare_streaming(&mut self) -> Result<()> {
        let size = self
            .format
            .frame_size(self.resolution)
            .unwrap_or(self.resolution.pixels() as usize * 2);
        self.buffer = Vec::with_capacity(size);
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
        self.resolution.width as usize * self.format.bytes_per_pixel().unwrap_or(2)
    }

    fn stream(&mut self, run: &AtomicBool, handler: &mut dyn SampleHandler) -> Result<()> {
        let interval = self.frame_rate.interval();
        let start = Instant::now();
        let mut frame_id = 0u64;
        info!("Test pattern streaming at {}", self.frame_rate);

        while run.load(Ordering::Relaxed) {
            let due = start + interval * frame_id as u32;
            let now = Instant::now();
            if due > now {
                std::thread::sleep(due - now);
            }
            trace!(frame_id, "Capture_WaitForNextSample");

            self.render(frame_id as usize * 4);
            let timestamp: Duration = start.elapsed();
            trace!(frame_id, "Capture_SampleReady");
            handler.on_sample(CapturedSample {
                timestamp,
                data: &self.buffer,
                frame_id,
            });
            frame_id += 1;
        }

        info!("Test pattern stopped after {} frames", frame_id);
        Ok(())
    }
}
