//! Video encoders

pub mod annexb;
pub mod h264;
pub mod traits;

pub use h264::H264Encoder;
pub use traits::{Encoder, EncoderConfig};
