//! Encoder traits and common types

use bytes::Bytes;

use crate::error::Result;
use crate::video::format::{FrameRate, Resolution};
use crate::video::frame::StagingFrame;

/// Encoder configuration
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub resolution: Resolution,
    pub frame_rate: FrameRate,
    /// Target bitrate in bits per second
    pub bitrate_bps: u32,
    /// Frames between forced IDR frames (0 = encoder default)
    pub keyframe_interval: u32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            resolution: Resolution::HD720,
            frame_rate: FrameRate::default(),
            bitrate_bps: 4_000_000,
            keyframe_interval: 60,
        }
    }
}

/// A video encoder fed one NV12 frame at a time.
///
/// Not `Sync`: encoders are driven from the single capture thread.
pub trait Encoder: Send {
    fn name(&self) -> &str;

    fn config(&self) -> &EncoderConfig;

    /// Encode one frame in encoder layout. May yield no packets (the encoder
    /// skipped or buffered the frame) or several.
    fn encode(&mut self, frame: &StagingFrame, sequence: u64) -> Result<Vec<Bytes>>;

    /// Out-of-band sequence parameters, for encoders that expose them
    /// separately from the bitstream.
    fn sequence_parameters(&self) -> Option<Bytes> {
        None
    }

    /// Make the next encoded frame an IDR frame
    fn request_keyframe(&mut self) {}

    /// Drain anything still buffered
    fn flush(&mut self) -> Result<Vec<Bytes>> {
        Ok(vec![])
    }
}
