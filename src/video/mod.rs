//! Video capture and encoding
//!
//! Capture devices (V4L2 or a synthetic test pattern) feed the encode stage,
//! which normalizes raw frames and produces H.264 access units.

pub mod adapter;
pub mod capture;
pub mod convert;
pub mod device;
pub mod encoder;
pub mod format;
pub mod frame;
pub mod pipeline;
pub mod test_pattern;
pub mod timing;

pub use adapter::FrameFormatAdapter;
pub use capture::{CaptureBackend, CaptureDevice, SampleHandler};
pub use format::{FrameRate, PixelFormat, Resolution};
pub use frame::{CapturedSample, EncodedSample};
pub use pipeline::{EncodeStage, KeyframeRequest, SampleConsumer};
pub use timing::MediaTime;
