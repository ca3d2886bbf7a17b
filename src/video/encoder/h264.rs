//! H.264 software encoder (OpenH264)
//!
//! Produces Annex-B access units. SPS/PPS are repeated in every IDR frame;
//! the encode stage lifts them out of the first one as the codec
//! configuration for new viewers.

use bytes::Bytes;
use openh264::encoder::{
    BitRate, Encoder as OpenH264Encoder, EncoderConfig as OpenH264Config, FrameRate,
    IntraFramePeriod, RateControlMode, SpsPpsStrategy, UsageType,
};
use openh264::formats::YUVBuffer;
use openh264::OpenH264API;
use tracing::{debug, info};

use super::traits::{Encoder, EncoderConfig};
use crate::error::{AppError, Result};
use crate::video::convert::nv12_to_i420;
use crate::video::frame::{StagingFrame, StagingLayout};

pub struct H264Encoder {
    inner: OpenH264Encoder,
    config: EncoderConfig,
}

impl H264Encoder {
    pub fn new(config: EncoderConfig) -> Result<Self> {
        if !config.resolution.is_valid() {
            return Err(AppError::Encoder(format!(
                "unsupported resolution {}",
                config.resolution
            )));
        }

        let cfg = OpenH264Config::new()
            .usage_type(UsageType::CameraVideoRealTime)
            .max_frame_rate(FrameRate::from_hz(config.frame_rate.as_f32()))
            .bitrate(BitRate::from_bps(config.bitrate_bps))
            .rate_control_mode(RateControlMode::Bitrate)
            .sps_pps_strategy(SpsPpsStrategy::ConstantId)
            .intra_frame_period(IntraFramePeriod::from_num_frames(config.keyframe_interval));

        let inner = OpenH264Encoder::with_api_config(OpenH264API::from_source(), cfg)
            .map_err(|e| AppError::Encoder(format!("OpenH264 init failed: {}", e)))?;

        info!(
            "H264 encoder ready: {} @ {}, {} bps, keyframe every {} frames",
            config.resolution, config.frame_rate, config.bitrate_bps, config.keyframe_interval
        );
        Ok(Self { inner, config })
    }
}

impl Encoder for H264Encoder {
    fn name(&self) -> &str {
        "openh264"
    }

    fn config(&self) -> &EncoderConfig {
        &self.config
    }

    fn encode(&mut self, frame: &StagingFrame, sequence: u64) -> Result<Vec<Bytes>> {
        if frame.layout() != StagingLayout::Nv12 || frame.resolution() != self.config.resolution {
            return Err(AppError::Encoder(format!(
                "frame {:?} {} does not match encoder input {}",
                frame.layout(),
                frame.resolution(),
                self.config.resolution
            )));
        }

        let i420 = nv12_to_i420(frame)?;
        let yuv = YUVBuffer::from_vec(
            i420,
            self.config.resolution.width as usize,
            self.config.resolution.height as usize,
        );

        let bitstream = self
            .inner
            .encode(&yuv)
            .map_err(|e| AppError::Encoder(format!("frame {}: {}", sequence, e)))?;
        let data = bitstream.to_vec();
        if data.is_empty() {
            debug!(sequence, "Encoder skipped frame");
            return Ok(vec![]);
        }
        Ok(vec![Bytes::from(data)])
    }

    fn request_keyframe(&mut self) {
        debug!("Keyframe requested");
        self.inner.force_intra_frame();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::encoder::annexb::parameter_sets;
    use crate::video::format::{FrameRate as StreamRate, Resolution};

    fn test_config() -> EncoderConfig {
        EncoderConfig {
            resolution: Resolution::new(64, 48),
            frame_rate: StreamRate::from_fps(30),
            bitrate_bps: 500_000,
            keyframe_interval: 30,
        }
    }

    #[test]
    fn test_first_access_unit_starts_with_start_code() {
        let config = test_config();
        let mut encoder = H264Encoder::new(config.clone()).unwrap();
        let mut frame = StagingFrame::new(StagingLayout::Nv12, config.resolution, 16);
        frame.as_bytes_mut().fill(128);

        let packets = encoder.encode(&frame, 0).unwrap();
        assert_eq!(packets.len(), 1);
        assert!(packets[0].starts_with(&[0, 0, 0, 1]) || packets[0].starts_with(&[0, 0, 1]));
        assert!(parameter_sets(&packets[0]).is_some());
    }

    #[test]
    fn test_rejects_wrong_layout() {
        let config = test_config();
        let mut encoder = H264Encoder::new(config.clone()).unwrap();
        let frame = StagingFrame::new(StagingLayout::Bgra, config.resolution, 16);
        assert!(matches!(encoder.encode(&frame, 0), Err(AppError::Encoder(_))));
    }

    #[test]
    fn test_rejects_invalid_resolution() {
        let config = EncoderConfig {
            resolution: Resolution::new(63, 48),
            ..test_config()
        };
        assert!(H264Encoder::new(config).is_err());
    }
}
