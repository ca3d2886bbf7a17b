//! Session registry
//!
//! Owns every connection session. A single lock serializes creation,
//! broadcast and reclamation; deliveries only enqueue into each transport's
//! own queue, so the lock is never held across network I/O.

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

use super::session::{ConnectionSession, SessionState};
use super::transport::TransportFactory;
use crate::video::format::FrameRate;
use crate::video::frame::EncodedSample;
use crate::video::pipeline::KeyframeRequest;

/// Point-in-time view of one session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub id: u64,
    pub state: SessionState,
    pub frames_sent: u64,
}

/// Result of one broadcast pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub skipped: usize,
    pub failed: usize,
}

struct RegistryInner {
    sessions: HashMap<u64, Arc<ConnectionSession>>,
    next_session_id: u64,
    /// Capture timestamp of the most recently broadcast sample
    pacing_anchor: Duration,
}

pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
    factory: Arc<dyn TransportFactory>,
    frame_rate: FrameRate,
    keyframe_request: Option<KeyframeRequest>,
}

impl SessionRegistry {
    pub fn new(factory: Arc<dyn TransportFactory>, frame_rate: FrameRate) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                sessions: HashMap::new(),
                next_session_id: 1,
                pacing_anchor: Duration::ZERO,
            }),
            factory,
            frame_rate,
            keyframe_request: None,
        }
    }

    /// Sessions reaching `Connected` raise this request
    pub fn with_keyframe_request(mut self, request: KeyframeRequest) -> Self {
        self.keyframe_request = Some(request);
        self
    }

    pub fn frame_rate(&self) -> FrameRate {
        self.frame_rate
    }

    pub fn pacing_anchor(&self) -> Duration {
        self.inner.lock().pacing_anchor
    }

    /// Create a session paced at `frame_rate`, starting its timeline at
    /// `pacing_anchor`.
    pub fn create_session(
        &self,
        frame_rate: FrameRate,
        pacing_anchor: Duration,
    ) -> (u64, Arc<ConnectionSession>) {
        let id = {
            let mut inner = self.inner.lock();
            let id = inner.next_session_id;
            inner.next_session_id += 1;
            id
        };

        let transport = self.factory.create(id);
        let session = Arc::new(ConnectionSession::new(
            id,
            transport,
            frame_rate,
            pacing_anchor,
            self.keyframe_request.clone(),
        ));

        let count = {
            let mut inner = self.inner.lock();
            inner.sessions.insert(id, session.clone());
            inner.sessions.len()
        };
        info!("Session {} created ({} active)", id, count);
        (id, session)
    }

    /// Create a session at the stream frame rate, anchored at the last
    /// broadcast sample
    pub fn open_session(&self) -> (u64, Arc<ConnectionSession>) {
        let anchor = self.pacing_anchor();
        self.create_session(self.frame_rate, anchor)
    }

    pub fn lookup(&self, session_id: u64) -> Option<Arc<ConnectionSession>> {
        self.inner.lock().sessions.get(&session_id).cloned()
    }

    /// Deliver one sample to every connected session. Failures stay with the
    /// failing session.
    pub fn broadcast_sample(
        &self,
        sample: &EncodedSample,
        codec_config: &Bytes,
        is_first_sample: bool,
    ) -> BroadcastReport {
        let mut inner = self.inner.lock();
        if is_first_sample {
            info!(
                "First sample {} at {:?}, {} bytes of codec configuration",
                sample.frame_id,
                sample.captured_at,
                codec_config.len()
            );
        }

        let mut report = BroadcastReport::default();
        for session in inner.sessions.values() {
            match session.deliver_video_sample(sample, codec_config) {
                Ok(true) => report.delivered += 1,
                Ok(false) => report.skipped += 1,
                Err(_) => report.failed += 1,
            }
        }
        inner.pacing_anchor = sample.captured_at;

        trace!(
            frame_id = sample.frame_id,
            delivered = report.delivered,
            skipped = report.skipped,
            failed = report.failed,
            "WebRTC_BroadcastSample"
        );
        report
    }

    /// Deliver an auxiliary message to every session whose side channel is open
    pub fn broadcast_side_channel_message(&self, payload: Bytes) -> BroadcastReport {
        let inner = self.inner.lock();
        let mut report = BroadcastReport::default();
        for session in inner.sessions.values() {
            match session.deliver_side_channel_message(&payload) {
                Ok(true) => report.delivered += 1,
                Ok(false) => report.skipped += 1,
                Err(_) => report.failed += 1,
            }
        }
        debug!(
            "Side channel message ({} bytes) delivered to {} sessions",
            payload.len(),
            report.delivered
        );
        report
    }

    /// Remove and close every disconnected session
    pub fn reap(&self) -> usize {
        let reaped: Vec<Arc<ConnectionSession>> = {
            let mut inner = self.inner.lock();
            let ids: Vec<u64> = inner
                .sessions
                .iter()
                .filter(|(_, s)| s.is_disconnected())
                .map(|(id, _)| *id)
                .collect();
            let reaped = ids
                .iter()
                .filter_map(|id| inner.sessions.remove(id))
                .collect::<Vec<_>>();
            for session in &reaped {
                session.shutdown();
            }
            reaped
        };

        if !reaped.is_empty() {
            info!(
                "Reclaimed {} disconnected sessions ({} active)",
                reaped.len(),
                self.session_count()
            );
        }
        reaped.len()
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let inner = self.inner.lock();
        let mut sessions: Vec<SessionInfo> = inner
            .sessions
            .values()
            .map(|s| SessionInfo {
                id: s.id(),
                state: s.state(),
                frames_sent: s.frames_sent(),
            })
            .collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    /// Close every session
    pub fn shutdown(&self) {
        let sessions: Vec<Arc<ConnectionSession>> = {
            let mut inner = self.inner.lock();
            inner.sessions.drain().map(|(_, s)| s).collect()
        };
        let count = sessions.len();
        for session in sessions {
            session.shutdown();
        }
        info!("Session registry shut down, closed {} sessions", count);
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        for (_, session) in self.inner.get_mut().sessions.drain() {
            session.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::timing::MediaTime;
    use crate::webrtc::transport::testing::RecordingFactory;
    use crate::webrtc::transport::{TransportPart, TransportState};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn sample(data: &'static str, frame_id: u64, captured_ms: u64) -> EncodedSample {
        EncodedSample {
            data: Bytes::from_static(data.as_bytes()),
            frame_id,
            captured_at: Duration::from_millis(captured_ms),
        }
    }

    fn registry() -> (Arc<RecordingFactory>, SessionRegistry) {
        let factory = RecordingFactory::new();
        let registry = SessionRegistry::new(factory.clone(), FrameRate::from_fps(30));
        (factory, registry)
    }

    #[test]
    fn test_session_ids_strictly_increase() {
        let (_, registry) = registry();
        let ids: Vec<u64> = (0..10).map(|_| registry.open_session().0).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(registry.session_count(), 10);
    }

    #[test]
    fn test_concurrent_creation() {
        let (factory, registry) = registry();
        let registry = Arc::new(registry);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    (0..125)
                        .map(|_| registry.open_session().0)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ids: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 1000);
        assert_eq!(registry.session_count(), 1000);
        assert_eq!(factory.created(), 1000);
    }

    #[test]
    fn test_broadcast_during_concurrent_mutation() {
        const OPENERS: u64 = 4;
        const PER_OPENER: u64 = 50;
        const TOTAL: u64 = OPENERS * PER_OPENER;

        let (factory, registry) = registry();
        let registry = Arc::new(registry);
        let config = Bytes::from_static(b"cfg");
        let done = Arc::new(AtomicBool::new(false));

        let broadcaster = {
            let registry = registry.clone();
            let config = config.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                let mut frame = 0u64;
                while !done.load(Ordering::Acquire) {
                    let sample = EncodedSample {
                        data: Bytes::from(frame.to_be_bytes().to_vec()),
                        frame_id: frame,
                        captured_at: Duration::from_millis(frame),
                    };
                    registry.broadcast_sample(&sample, &config, frame == 0);
                    registry.reap();
                    frame += 1;
                }
                frame
            })
        };

        let openers: Vec<_> = (0..OPENERS)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    (0..PER_OPENER)
                        .map(|_| registry.open_session().0)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        // every third session fails, the rest connect
        let signaler = {
            let registry = registry.clone();
            let factory = factory.clone();
            std::thread::spawn(move || {
                for id in 1..=TOTAL {
                    while registry.lookup(id).is_none() {
                        std::thread::yield_now();
                    }
                    let transport = factory.transport(id).unwrap();
                    if id % 3 == 0 {
                        transport.fire_state(TransportState::Failed);
                    } else {
                        transport.connect();
                    }
                }
            })
        };

        let mut ids: Vec<u64> = openers
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        signaler.join().unwrap();
        done.store(true, Ordering::Release);
        let frames = broadcaster.join().unwrap();
        assert!(frames > 0);

        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids, (1..=TOTAL).collect::<Vec<_>>());

        registry.reap();
        let snapshot = registry.snapshot();
        assert!(snapshot
            .iter()
            .all(|s| s.state != SessionState::Disconnected));
        assert_eq!(snapshot.len() as u64, TOTAL - TOTAL / 3);

        for id in 1..=TOTAL {
            let transport = factory.transport(id).unwrap();
            let payloads = transport.video_payloads();
            if id % 3 == 0 {
                assert!(registry.lookup(id).is_none());
                assert_eq!(
                    transport.closes(),
                    vec![
                        TransportPart::Auxiliary,
                        TransportPart::Video,
                        TransportPart::Connection
                    ]
                );
            }
            let Some((first, rest)) = payloads.split_first() else {
                continue;
            };
            assert_eq!(first, &config, "session {} got a sample before the config", id);
            let frames: Vec<u64> = rest
                .iter()
                .map(|p| u64::from_be_bytes(p.as_ref().try_into().unwrap()))
                .collect();
            assert!(frames.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn test_lookup_absent() {
        let (_, registry) = registry();
        assert!(registry.lookup(42).is_none());
        let (id, _) = registry.open_session();
        assert_eq!(registry.lookup(id).unwrap().id(), id);
    }

    #[test]
    fn test_awaiting_sessions_receive_nothing() {
        let (factory, registry) = registry();
        let (id, _) = registry.open_session();
        let report = registry.broadcast_sample(&sample("s1", 1, 0), &Bytes::from_static(b"cfg"), true);

        assert_eq!(report.skipped, 1);
        assert!(factory.transport(id).unwrap().video_payloads().is_empty());
    }

    #[test]
    fn test_late_joiner_gets_config_then_next_sample() {
        let (factory, registry) = registry();
        let config = Bytes::from_static(b"cfg");
        let (id, _) = registry.open_session();
        let transport = factory.transport(id).unwrap();

        registry.broadcast_sample(&sample("s1", 1, 0), &config, true);
        transport.connect();
        registry.broadcast_sample(&sample("s2", 2, 33), &config, false);

        assert_eq!(transport.video_payloads(), vec!["cfg", "s2"]);
    }

    #[test]
    fn test_new_sessions_anchor_at_last_broadcast() {
        let (factory, registry) = registry();
        let config = Bytes::from_static(b"cfg");
        registry.broadcast_sample(&sample("s1", 1, 1500), &config, true);

        let (id, session) = registry.open_session();
        assert_eq!(
            session.start_timestamp(),
            MediaTime::from_duration(Duration::from_millis(1500))
        );

        let transport = factory.transport(id).unwrap();
        transport.connect();
        for n in 2..5 {
            registry.broadcast_sample(&sample("s", n, n * 33), &config, false);
        }
        let times = transport.video_times();
        assert_eq!(times.len(), 4);
        assert_eq!(times[3], MediaTime::new(3, 2) + MediaTime::new(2, 30));
        assert_eq!(session.frames_sent(), 3);
    }

    #[test]
    fn test_reap_removes_disconnected_sessions() {
        let (factory, registry) = registry();
        let (a, _) = registry.open_session();
        let (b, _) = registry.open_session();
        factory.transport(a).unwrap().connect();
        factory
            .transport(b)
            .unwrap()
            .fire_state(TransportState::Failed);

        assert_eq!(registry.reap(), 1);
        assert!(registry.lookup(b).is_none());
        assert!(registry.lookup(a).is_some());
        assert!(registry
            .snapshot()
            .iter()
            .all(|s| s.state != SessionState::Disconnected));
        assert_eq!(
            factory.transport(b).unwrap().closes(),
            vec![
                TransportPart::Auxiliary,
                TransportPart::Video,
                TransportPart::Connection
            ]
        );
    }

    #[test]
    fn test_failing_session_does_not_stop_others() {
        let (factory, registry) = registry();
        let config = Bytes::from_static(b"cfg");
        let ids: Vec<u64> = (0..3).map(|_| registry.open_session().0).collect();
        for id in &ids {
            factory.transport(*id).unwrap().connect();
        }
        factory.transport(ids[1]).unwrap().fail_sends();

        let report = registry.broadcast_sample(&sample("s1", 1, 0), &config, true);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(
            factory.transport(ids[2]).unwrap().video_payloads(),
            vec!["cfg", "s1"]
        );
        assert_eq!(registry.reap(), 1);
        assert_eq!(registry.session_count(), 2);
    }

    #[test]
    fn test_side_channel_broadcast() {
        let (factory, registry) = registry();
        let (a, _) = registry.open_session();
        let (_b, _) = registry.open_session();
        factory.transport(a).unwrap().connect();

        let report = registry.broadcast_side_channel_message(Bytes::from_static(b"hello"));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.skipped, 1);
    }

    #[test]
    fn test_shutdown_closes_everything() {
        let (factory, registry) = registry();
        let (a, handle) = registry.open_session();
        registry.shutdown();

        assert_eq!(registry.session_count(), 0);
        assert_eq!(handle.state(), SessionState::Disconnected);
        assert_eq!(factory.transport(a).unwrap().closes().len(), 3);
    }

    #[test]
    fn test_connect_raises_keyframe_request() {
        let factory = RecordingFactory::new();
        let request = KeyframeRequest::new();
        let registry = SessionRegistry::new(factory.clone(), FrameRate::from_fps(30))
            .with_keyframe_request(request.clone());
        let (id, _) = registry.open_session();

        assert!(!request.is_requested());
        factory.transport(id).unwrap().connect();
        assert!(request.is_requested());
    }
}
