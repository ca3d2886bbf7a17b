//! Capture → encode stage
//!
//! Runs on the capture thread: every raw frame is normalized by the frame
//! adapter, converted when needed, encoded, and handed to the sample consumer
//! together with the codec configuration blob (the SPS and PPS lifted from the
//! first access unit that carries them).

use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace};

use super::adapter::{FrameFormatAdapter, Upload};
use super::capture::SampleHandler;
use super::convert::ColorConverter;
use super::encoder::annexb::parameter_sets;
use super::encoder::Encoder;
use super::frame::{CapturedSample, EncodedSample, FrameGeometry};
use crate::error::{AppError, Result};
use crate::utils::LogThrottler;

/// Receives encoded samples from the encode stage
pub trait SampleConsumer: Send + Sync {
    /// `codec_config` holds the stream's SPS and PPS. It is empty until the
    /// encoder first emits them and the same blob for every call after.
    fn on_sample_ready(&self, sample: EncodedSample, codec_config: &Bytes);
}

/// Shared counters for the capture/encode thread
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub frames_captured: AtomicU64,
    pub frames_encoded: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub frames_skipped: AtomicU64,
}

impl PipelineStats {
    pub fn log_summary(&self) {
        info!(
            captured = self.frames_captured.load(Ordering::Relaxed),
            encoded = self.frames_encoded.load(Ordering::Relaxed),
            dropped = self.frames_dropped.load(Ordering::Relaxed),
            skipped = self.frames_skipped.load(Ordering::Relaxed),
            "Pipeline statistics"
        );
    }
}

/// Handle other components use to ask for an IDR on the next frame
#[derive(Debug, Clone, Default)]
pub struct KeyframeRequest(Arc<AtomicBool>);

impl KeyframeRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

/// Join the packets of one frame into a single access unit
fn reassemble(packets: Vec<Bytes>) -> Option<Bytes> {
    match packets.len() {
        0 => None,
        1 => packets.into_iter().next(),
        _ => {
            let total = packets.iter().map(|p| p.len()).sum();
            let mut buf = BytesMut::with_capacity(total);
            for packet in &packets {
                buf.extend_from_slice(packet);
            }
            Some(buf.freeze())
        }
    }
}

pub struct EncodeStage {
    adapter: FrameFormatAdapter,
    converter: ColorConverter,
    encoder: Box<dyn Encoder>,
    consumer: Arc<dyn SampleConsumer>,
    codec_config: Option<Bytes>,
    keyframe_request: KeyframeRequest,
    stats: Arc<PipelineStats>,
    throttler: LogThrottler,
}

impl EncodeStage {
    pub fn new(
        geometry: FrameGeometry,
        row_alignment: usize,
        encoder: Box<dyn Encoder>,
        consumer: Arc<dyn SampleConsumer>,
        keyframe_request: KeyframeRequest,
    ) -> Self {
        Self {
            adapter: FrameFormatAdapter::new(geometry, row_alignment),
            converter: ColorConverter::new(geometry.resolution, row_alignment),
            encoder,
            consumer,
            codec_config: None,
            keyframe_request,
            stats: Arc::new(PipelineStats::default()),
            throttler: LogThrottler::with_secs(5),
        }
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    pub fn codec_config(&self) -> Option<&Bytes> {
        self.codec_config.as_ref()
    }

    /// Drain the encoder; anything it still holds is discarded.
    pub fn shutdown(&mut self) {
        match self.encoder.flush() {
            Ok(rest) if !rest.is_empty() => {
                debug!("Discarding {} buffered packets at shutdown", rest.len())
            }
            Ok(_) => {}
            Err(e) => debug!("Encoder flush failed: {}", e),
        }
        self.stats.log_summary();
    }

    fn process(&mut self, sample: CapturedSample<'_>) -> Result<()> {
        let frame_id = sample.frame_id;
        trace!(frame_id, "Encode_UploadStart");
        let (staging, upload) = self.adapter.upload(sample.data)?;
        let frame = match upload {
            Upload::Ready => staging,
            Upload::NeedsConversion => self.converter.convert(staging)?,
        };

        if self.keyframe_request.take() {
            self.encoder.request_keyframe();
        }

        trace!(frame_id, "Encode_Start");
        let packets = self.encoder.encode(frame, frame_id)?;
        trace!(frame_id, packets = packets.len(), "Encode_Finish");

        let Some(data) = reassemble(packets) else {
            debug!(frame_id, "Encoder produced no output");
            self.stats.frames_skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        };
        self.stats.frames_encoded.fetch_add(1, Ordering::Relaxed);

        if self.codec_config.is_none() {
            match self
                .encoder
                .sequence_parameters()
                .or_else(|| parameter_sets(&data))
            {
                Some(blob) => {
                    info!("Codec configuration captured ({} bytes)", blob.len());
                    self.codec_config = Some(blob);
                }
                None => debug!(frame_id, "No parameter sets yet"),
            }
        }
        let config = self.codec_config.clone().unwrap_or_default();

        self.consumer.on_sample_ready(
            EncodedSample {
                data,
                frame_id,
                captured_at: sample.timestamp,
            },
            &config,
        );
        Ok(())
    }
}

impl SampleHandler for EncodeStage {
    fn on_sample(&mut self, sample: CapturedSample<'_>) {
        self.stats.frames_captured.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.process(sample) {
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            let key = match &e {
                AppError::UnsupportedFormat(_) => "unsupported_format",
                AppError::Format(_) => "frame_format",
                AppError::Encoder(_) => "encode",
                _ => "pipeline",
            };
            crate::warn_throttled!(
                self.throttler,
                key,
                "Dropping frame {}: {}",
                sample.frame_id,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::encoder::annexb::{nal_type, nal_units, NAL_IDR, NAL_PPS, NAL_SLICE, NAL_SPS};
    use crate::video::encoder::EncoderConfig;
    use crate::video::format::{PixelFormat, Resolution};
    use crate::video::frame::StagingFrame;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::time::Duration;

    struct ScriptedEncoder {
        config: EncoderConfig,
        calls: Arc<AtomicU64>,
        keyframes: Arc<AtomicU64>,
        outputs: VecDeque<Vec<Bytes>>,
    }

    impl ScriptedEncoder {
        fn new(outputs: Vec<Vec<&'static str>>) -> (Self, Arc<AtomicU64>, Arc<AtomicU64>) {
            let calls = Arc::new(AtomicU64::new(0));
            let keyframes = Arc::new(AtomicU64::new(0));
            let encoder = Self {
                config: EncoderConfig::default(),
                calls: calls.clone(),
                keyframes: keyframes.clone(),
                outputs: outputs
                    .into_iter()
                    .map(|packets| {
                        packets
                            .into_iter()
                            .map(|p| Bytes::from_static(p.as_bytes()))
                            .collect()
                    })
                    .collect(),
            };
            (encoder, calls, keyframes)
        }
    }

    impl Encoder for ScriptedEncoder {
        fn name(&self) -> &str {
            "scripted"
        }

        fn config(&self) -> &EncoderConfig {
            &self.config
        }

        fn encode(&mut self, _frame: &StagingFrame, _sequence: u64) -> Result<Vec<Bytes>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.outputs.pop_front().unwrap_or_default())
        }

        fn request_keyframe(&mut self) {
            self.keyframes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct RecordingConsumer {
        samples: Mutex<Vec<(u64, Bytes, Bytes)>>,
    }

    impl SampleConsumer for RecordingConsumer {
        fn on_sample_ready(&self, sample: EncodedSample, codec_config: &Bytes) {
            self.samples
                .lock()
                .push((sample.frame_id, sample.data, codec_config.clone()));
        }
    }

    fn stage(
        format: PixelFormat,
        outputs: Vec<Vec<&'static str>>,
    ) -> (EncodeStage, Arc<RecordingConsumer>, Arc<AtomicU64>, Arc<AtomicU64>) {
        let geometry = FrameGeometry::packed(Resolution::new(4, 2), format);
        let (encoder, calls, keyframes) = ScriptedEncoder::new(outputs);
        let consumer = Arc::new(RecordingConsumer::default());
        let stage = EncodeStage::new(
            geometry,
            16,
            Box::new(encoder),
            consumer.clone(),
            KeyframeRequest::new(),
        );
        (stage, consumer, calls, keyframes)
    }

    fn sample(data: &[u8], frame_id: u64) -> CapturedSample<'_> {
        CapturedSample {
            timestamp: Duration::from_millis(frame_id * 33),
            data,
            frame_id,
        }
    }

    #[test]
    fn test_unknown_layout_never_reaches_encoder() {
        let (mut stage, consumer, calls, _) = stage(PixelFormat::Unknown, vec![]);
        let raw = [0u8; 16];

        stage.on_sample(sample(&raw, 0));
        stage.on_sample(sample(&raw, 1));

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(consumer.samples.lock().is_empty());
        assert_eq!(stage.stats().frames_dropped.load(Ordering::SeqCst), 2);
        assert_eq!(stage.stats().frames_captured.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_bad_frame_does_not_stop_the_next_one() {
        let (mut stage, consumer, calls, _) = stage(PixelFormat::Bgra, vec![vec!["au0"]]);

        stage.on_sample(sample(&[0u8; 3], 0));
        stage.on_sample(sample(&[0u8; 32], 1));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let samples = consumer.samples.lock();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].0, 1);
    }

    const IDR_UNIT: &str =
        "\x00\x00\x00\x01\x67\x42\x00\x1f\x00\x00\x00\x01\x68\x4e\x38\x70\x00\x00\x00\x01\x65\x08\x04";
    const P_UNIT: &str = "\x00\x00\x00\x01\x41\x1a\x02";

    #[test]
    fn test_codec_config_holds_only_parameter_sets() {
        let (mut stage, consumer, _, _) = stage(
            PixelFormat::Rgb24,
            vec![vec![P_UNIT], vec![IDR_UNIT], vec![P_UNIT], vec![P_UNIT]],
        );
        let raw = [7u8; 24];
        for id in 0..4 {
            stage.on_sample(sample(&raw, id));
        }

        let samples = consumer.samples.lock();
        assert_eq!(samples.len(), 4);
        // nothing to replay before the first IDR
        assert!(samples[0].2.is_empty());

        let config = stage.codec_config().unwrap();
        let types: Vec<u8> = nal_units(config).into_iter().filter_map(nal_type).collect();
        assert_eq!(types, vec![NAL_SPS, NAL_PPS]);
        assert!(!types.contains(&NAL_IDR) && !types.contains(&NAL_SLICE));
        for (_, _, blob) in samples.iter().skip(1) {
            assert_eq!(blob, config);
        }
        assert_eq!(samples[1].1.as_ref(), IDR_UNIT.as_bytes());
        assert_eq!(samples[3].1.as_ref(), P_UNIT.as_bytes());
    }

    #[test]
    fn test_zero_packets_are_skipped_and_many_are_joined() {
        let (mut stage, consumer, _, _) = stage(
            PixelFormat::Nv12,
            vec![vec![], vec!["\x00\x00\x01a", "\x00\x00\x01b"]],
        );
        let raw = [16u8; 12];
        stage.on_sample(sample(&raw, 0));
        stage.on_sample(sample(&raw, 1));

        let samples = consumer.samples.lock();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].1.as_ref(), b"\x00\x00\x01a\x00\x00\x01b");
        assert_eq!(stage.stats().frames_skipped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_keyframe_request_is_consumed_once() {
        let geometry = FrameGeometry::packed(Resolution::new(4, 2), PixelFormat::Nv12);
        let (encoder, _, keyframes) = ScriptedEncoder::new(vec![]);
        let request = KeyframeRequest::new();
        let mut stage = EncodeStage::new(
            geometry,
            16,
            Box::new(encoder),
            Arc::new(RecordingConsumer::default()),
            request.clone(),
        );
        let raw = [16u8; 12];

        request.request();
        stage.on_sample(sample(&raw, 0));
        stage.on_sample(sample(&raw, 1));

        assert_eq!(keyframes.load(Ordering::SeqCst), 1);
    }
}
