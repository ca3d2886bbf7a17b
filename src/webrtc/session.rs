//! Connection session: one remote viewer
//!
//! Lifecycle state and readiness flags are atomics written from transport
//! callbacks (any thread) and read by the dispatcher without taking the
//! registry lock. Pacing state is only touched by the dispatcher, which holds
//! the registry lock while delivering.

use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use super::signaling::{SdpType, SessionDescription, SessionOffer};
use super::transport::{Transport, TransportError, TransportPart, TransportState, VideoPayload};
use crate::error::{AppError, Result};
use crate::video::format::FrameRate;
use crate::video::frame::EncodedSample;
use crate::video::pipeline::KeyframeRequest;
use crate::video::timing::MediaTime;

/// Session lifecycle. `Disconnected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SessionState {
    AwaitingConnection = 0,
    Connected = 1,
    Disconnected = 2,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::AwaitingConnection,
            1 => SessionState::Connected,
            _ => SessionState::Disconnected,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::AwaitingConnection => write!(f, "awaiting connection"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// State shared with transport callbacks
struct SessionSignals {
    id: u64,
    state: AtomicU8,
    video_ready: AtomicBool,
    auxiliary_ready: AtomicBool,
}

impl SessionSignals {
    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Apply a transition if the state machine allows it
    fn transition(&self, to: SessionState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let allowed = match (SessionState::from_u8(current), to) {
                (SessionState::AwaitingConnection, SessionState::Connected) => true,
                (SessionState::AwaitingConnection, SessionState::Disconnected) => true,
                (SessionState::Connected, SessionState::Disconnected) => true,
                _ => false,
            };
            if !allowed {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    info!("Session {} {}", self.id, to);
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }
}

pub struct ConnectionSession {
    id: u64,
    signals: Arc<SessionSignals>,
    transport: Arc<dyn Transport>,
    opened: bool,
    frames_sent: AtomicU64,
    frame_duration: MediaTime,
    start_timestamp: MediaTime,
    answer_attached: AtomicBool,
    closed: AtomicBool,
}

impl ConnectionSession {
    /// Wire callbacks, open the transport and start creating the offer.
    ///
    /// Transport failures at this point do not fail construction: the session
    /// is created `Disconnected` and reclaimed by the next sweep.
    pub fn new(
        id: u64,
        transport: Arc<dyn Transport>,
        frame_rate: FrameRate,
        start_timestamp: Duration,
        keyframe_request: Option<KeyframeRequest>,
    ) -> Self {
        let signals = Arc::new(SessionSignals {
            id,
            state: AtomicU8::new(SessionState::AwaitingConnection as u8),
            video_ready: AtomicBool::new(false),
            auxiliary_ready: AtomicBool::new(false),
        });

        let s = signals.clone();
        transport.on_state_change(Box::new(move |state| {
            debug!("Session {} transport state: {:?}", s.id, state);
            match state {
                TransportState::Connected => {
                    if s.transition(SessionState::Connected) {
                        if let Some(request) = &keyframe_request {
                            request.request();
                        }
                    }
                }
                TransportState::Disconnected | TransportState::Failed | TransportState::Closed => {
                    s.transition(SessionState::Disconnected);
                }
                TransportState::New | TransportState::Connecting => {}
            }
        }));

        let s = signals.clone();
        transport.on_video_ready(Box::new(move || {
            debug!("Session {} video ready", s.id);
            s.video_ready.store(true, Ordering::Release);
        }));

        let s = signals.clone();
        transport.on_auxiliary_ready(Box::new(move || {
            debug!("Session {} side channel ready", s.id);
            s.auxiliary_ready.store(true, Ordering::Release);
        }));

        let opened = match transport
            .open()
            .and_then(|_| transport.set_local_description())
        {
            Ok(()) => true,
            Err(e) => {
                warn!("Session {} failed to open transport: {}", id, e);
                signals.transition(SessionState::Disconnected);
                false
            }
        };

        Self {
            id,
            signals,
            transport,
            opened,
            frames_sent: AtomicU64::new(0),
            frame_duration: frame_rate.frame_duration(),
            start_timestamp: MediaTime::from_duration(start_timestamp),
            answer_attached: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.signals.state()
    }

    pub fn is_disconnected(&self) -> bool {
        self.state() == SessionState::Disconnected
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Acquire)
    }

    pub fn start_timestamp(&self) -> MediaTime {
        self.start_timestamp
    }

    /// Presentation time of this session's `n`th sample
    pub fn presentation_time(&self, n: u64) -> MediaTime {
        self.start_timestamp + self.frame_duration * n
    }

    /// The offer with this session's index, once candidate gathering is done
    pub fn offer(&self) -> Option<SessionOffer> {
        self.transport
            .local_description()
            .map(|description| SessionOffer::new(description, self.id))
    }

    /// Forward one encoded sample, preceded by `codec_config` on the first
    /// delivery. Returns whether anything was sent.
    ///
    /// Must not be called concurrently for the same session; the registry
    /// serializes deliveries.
    pub fn deliver_video_sample(
        &self,
        sample: &EncodedSample,
        codec_config: &Bytes,
    ) -> std::result::Result<bool, TransportError> {
        if self.state() != SessionState::Connected
            || !self.signals.video_ready.load(Ordering::Acquire)
        {
            return Ok(false);
        }

        let n = self.frames_sent.load(Ordering::Acquire);
        let elapsed = self.frame_duration * n;
        let presentation_time = self.start_timestamp + elapsed;

        let sent = (|| {
            if n == 0 && !codec_config.is_empty() {
                trace!(session = self.id, "WebRTC_SendCodecConfig");
                self.transport.send_video(VideoPayload {
                    data: codec_config.clone(),
                    elapsed,
                    presentation_time,
                })?;
            }
            trace!(session = self.id, frame_id = sample.frame_id, "WebRTC_SendVideoSample");
            self.transport.send_video(VideoPayload {
                data: sample.data.clone(),
                elapsed,
                presentation_time,
            })
        })();

        match sent {
            Ok(()) => {
                self.frames_sent.fetch_add(1, Ordering::AcqRel);
                Ok(true)
            }
            Err(e) => {
                warn!("Session {} video send failed: {}", self.id, e);
                self.signals.transition(SessionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Forward an auxiliary message if the side channel is open
    pub fn deliver_side_channel_message(
        &self,
        payload: &Bytes,
    ) -> std::result::Result<bool, TransportError> {
        if self.state() != SessionState::Connected
            || !self.signals.auxiliary_ready.load(Ordering::Acquire)
        {
            return Ok(false);
        }
        match self.transport.send_auxiliary(payload.clone()) {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("Session {} side channel send failed: {}", self.id, e);
                self.signals.transition(SessionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Attach the viewer's answer, given as browser JSON `{"type","sdp"}`.
    ///
    /// Malformed input fails the session instead of the caller's process.
    pub fn attach_remote_answer(&self, answer: &str) -> Result<()> {
        if self.answer_attached.swap(true, Ordering::AcqRel) {
            return Err(AppError::BadRequest(format!(
                "session {} already has an answer",
                self.id
            )));
        }

        let parsed = serde_json::from_str::<SessionDescription>(answer)
            .map_err(|e| format!("malformed answer: {}", e))
            .and_then(|description| match description.sdp_type {
                SdpType::Answer => Ok(description),
                SdpType::Offer => Err("expected an answer, got an offer".to_string()),
            });

        let description = match parsed {
            Ok(description) => description,
            Err(reason) => {
                warn!("Session {}: {}", self.id, reason);
                self.signals.transition(SessionState::Disconnected);
                return Err(AppError::BadRequest(reason));
            }
        };

        if let Err(e) = self.transport.set_remote_description(description) {
            warn!("Session {} rejected answer: {}", self.id, e);
            self.signals.transition(SessionState::Disconnected);
            return Err(AppError::WebRtcError(e.to_string()));
        }
        debug!("Session {} answer attached", self.id);
        Ok(())
    }

    /// Release the side channel, then the video track, then the connection.
    /// Runs at most once.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.signals.transition(SessionState::Disconnected);
        if self.opened {
            self.transport.close(TransportPart::Auxiliary);
            self.transport.close(TransportPart::Video);
        }
        self.transport.close(TransportPart::Connection);
        debug!(
            "Session {} closed after {} frames",
            self.id,
            self.frames_sent()
        );
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("frames_sent", &self.frames_sent())
            .finish()
    }
}
