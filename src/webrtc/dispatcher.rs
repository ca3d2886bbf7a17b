//! Broadcast dispatcher: the encode stage's sample consumer

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

use super::registry::SessionRegistry;
use crate::video::frame::EncodedSample;
use crate::video::pipeline::SampleConsumer;

pub struct BroadcastDispatcher {
    registry: Arc<SessionRegistry>,
    samples_dispatched: AtomicU64,
}

impl BroadcastDispatcher {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            samples_dispatched: AtomicU64::new(0),
        }
    }

    pub fn samples_dispatched(&self) -> u64 {
        self.samples_dispatched.load(Ordering::Relaxed)
    }
}

impl SampleConsumer for BroadcastDispatcher {
    fn on_sample_ready(&self, sample: EncodedSample, codec_config: &Bytes) {
        let is_first_sample = self.samples_dispatched.fetch_add(1, Ordering::Relaxed) == 0;
        trace!(frame_id = sample.frame_id, "WebRTC_DispatchSample");
        self.registry
            .broadcast_sample(&sample, codec_config, is_first_sample);
        self.registry.reap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::format::FrameRate;
    use crate::webrtc::transport::testing::RecordingFactory;
    use crate::webrtc::transport::TransportState;
    use std::time::Duration;

    fn sample(data: &'static str, frame_id: u64) -> EncodedSample {
        EncodedSample {
            data: Bytes::from_static(data.as_bytes()),
            frame_id,
            captured_at: Duration::from_millis(frame_id * 33),
        }
    }

    #[test]
    fn test_dispatch_broadcasts_and_reaps() {
        let factory = RecordingFactory::new();
        let registry = Arc::new(SessionRegistry::new(
            factory.clone(),
            FrameRate::from_fps(30),
        ));
        let dispatcher = BroadcastDispatcher::new(registry.clone());
        let config = Bytes::from_static(b"cfg");

        let (a, _) = registry.open_session();
        let (b, _) = registry.open_session();
        factory.transport(a).unwrap().connect();
        factory
            .transport(b)
            .unwrap()
            .fire_state(TransportState::Closed);

        dispatcher.on_sample_ready(sample("s1", 1), &config);
        dispatcher.on_sample_ready(sample("s2", 2), &config);

        assert_eq!(dispatcher.samples_dispatched(), 2);
        assert_eq!(registry.session_count(), 1);
        assert_eq!(
            factory.transport(a).unwrap().video_payloads(),
            vec!["cfg", "s1", "s2"]
        );
        assert_eq!(registry.pacing_anchor(), Duration::from_millis(66));
    }
}
