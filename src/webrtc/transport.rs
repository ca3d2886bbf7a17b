//! Per-viewer transport capability
//!
//! A connection session only talks to its viewer through this trait. Every
//! method is non-blocking: implementations queue the work and perform it on
//! their own tasks, reporting progress back through the registered callbacks,
//! which may fire on any thread.

use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;

use super::signaling::SessionDescription;
use crate::video::timing::MediaTime;

/// Transport-level connection state as reported by the implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// The independently releasable parts of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportPart {
    /// Side channel for auxiliary messages
    Auxiliary,
    /// Outgoing video track
    Video,
    /// The connection itself
    Connection,
}

/// One video payload with its position on the viewer's timeline
#[derive(Debug, Clone)]
pub struct VideoPayload {
    pub data: Bytes,
    /// Time since the viewer's first payload
    pub elapsed: MediaTime,
    /// Absolute presentation time in the capture clock domain
    pub presentation_time: MediaTime,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("send queue full")]
    QueueFull,

    #[error("transport closed")]
    Closed,

    #[error("invalid session description: {0}")]
    InvalidDescription(String),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("send failed: {0}")]
    Send(String),
}

pub type StateCallback = Box<dyn Fn(TransportState) + Send + Sync>;
pub type ReadyCallback = Box<dyn Fn() + Send + Sync>;

pub trait Transport: Send + Sync {
    /// Start building the connection (tracks, side channel)
    fn open(&self) -> Result<(), TransportError>;

    /// Release one part. Releasing a part that was never opened is a no-op.
    fn close(&self, part: TransportPart);

    /// Create the local offer. The result becomes visible through
    /// [`local_description`](Self::local_description) once candidate
    /// gathering has finished.
    fn set_local_description(&self) -> Result<(), TransportError>;

    fn set_remote_description(&self, description: SessionDescription)
        -> Result<(), TransportError>;

    fn local_description(&self) -> Option<SessionDescription>;

    fn send_video(&self, payload: VideoPayload) -> Result<(), TransportError>;

    fn send_auxiliary(&self, payload: Bytes) -> Result<(), TransportError>;

    fn on_state_change(&self, callback: StateCallback);

    fn on_video_ready(&self, callback: ReadyCallback);

    fn on_auxiliary_ready(&self, callback: ReadyCallback);
}

/// Creates one transport per viewer
pub trait TransportFactory: Send + Sync {
    fn create(&self, session_id: u64) -> Arc<dyn Transport>;
}

#[cfg(test)]
pub mod testing {
    //! Recording transport for exercising sessions without a network

    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        Open,
        Close(TransportPart),
        SetLocalDescription,
        SetRemoteDescription(String),
        Video(Bytes, MediaTime),
        Auxiliary(Bytes),
    }

    #[derive(Default)]
    pub struct RecordingTransport {
        calls: Mutex<Vec<Call>>,
        state_cb: Mutex<Option<StateCallback>>,
        video_cb: Mutex<Option<ReadyCallback>>,
        aux_cb: Mutex<Option<ReadyCallback>>,
        local: Mutex<Option<SessionDescription>>,
        fail_sends: AtomicBool,
    }

    impl RecordingTransport {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }

        /// Video payload bytes in send order
        pub fn video_payloads(&self) -> Vec<Bytes> {
            self.calls
                .lock()
                .iter()
                .filter_map(|c| match c {
                    Call::Video(data, _) => Some(data.clone()),
                    _ => None,
                })
                .collect()
        }

        pub fn video_times(&self) -> Vec<MediaTime> {
            self.calls
                .lock()
                .iter()
                .filter_map(|c| match c {
                    Call::Video(_, pts) => Some(*pts),
                    _ => None,
                })
                .collect()
        }

        pub fn closes(&self) -> Vec<TransportPart> {
            self.calls
                .lock()
                .iter()
                .filter_map(|c| match c {
                    Call::Close(part) => Some(*part),
                    _ => None,
                })
                .collect()
        }

        pub fn fire_state(&self, state: TransportState) {
            if let Some(cb) = self.state_cb.lock().as_ref() {
                cb(state);
            }
        }

        pub fn fire_video_ready(&self) {
            if let Some(cb) = self.video_cb.lock().as_ref() {
                cb();
            }
        }

        pub fn fire_auxiliary_ready(&self) {
            if let Some(cb) = self.aux_cb.lock().as_ref() {
                cb();
            }
        }

        /// Connected, with video and side channel ready
        pub fn connect(&self) {
            self.fire_state(TransportState::Connected);
            self.fire_video_ready();
            self.fire_auxiliary_ready();
        }

        pub fn set_local(&self, sdp: &str) {
            *self.local.lock() = Some(SessionDescription::offer(sdp));
        }

        pub fn fail_sends(&self) {
            self.fail_sends.store(true, Ordering::SeqCst);
        }
    }

    impl Transport for RecordingTransport {
        fn open(&self) -> Result<(), TransportError> {
            self.calls.lock().push(Call::Open);
            Ok(())
        }

        fn close(&self, part: TransportPart) {
            self.calls.lock().push(Call::Close(part));
        }

        fn set_local_description(&self) -> Result<(), TransportError> {
            self.calls.lock().push(Call::SetLocalDescription);
            Ok(())
        }

        fn set_remote_description(
            &self,
            description: SessionDescription,
        ) -> Result<(), TransportError> {
            self.calls
                .lock()
                .push(Call::SetRemoteDescription(description.sdp));
            Ok(())
        }

        fn local_description(&self) -> Option<SessionDescription> {
            self.local.lock().clone()
        }

        fn send_video(&self, payload: VideoPayload) -> Result<(), TransportError> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }
            self.calls
                .lock()
                .push(Call::Video(payload.data, payload.presentation_time));
            Ok(())
        }

        fn send_auxiliary(&self, payload: Bytes) -> Result<(), TransportError> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }
            self.calls.lock().push(Call::Auxiliary(payload));
            Ok(())
        }

        fn on_state_change(&self, callback: StateCallback) {
            *self.state_cb.lock() = Some(callback);
        }

        fn on_video_ready(&self, callback: ReadyCallback) {
            *self.video_cb.lock() = Some(callback);
        }

        fn on_auxiliary_ready(&self, callback: ReadyCallback) {
            *self.aux_cb.lock() = Some(callback);
        }
    }

    /// Factory handing out recording transports and keeping them for inspection
    #[derive(Default)]
    pub struct RecordingFactory {
        created: Mutex<Vec<(u64, Arc<RecordingTransport>)>>,
    }

    impl RecordingFactory {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn transport(&self, session_id: u64) -> Option<Arc<RecordingTransport>> {
            self.created
                .lock()
                .iter()
                .find(|(id, _)| *id == session_id)
                .map(|(_, t)| t.clone())
        }

        pub fn created(&self) -> usize {
            self.created.lock().len()
        }
    }

    impl TransportFactory for RecordingFactory {
        fn create(&self, session_id: u64) -> Arc<dyn Transport> {
            let transport = RecordingTransport::new();
            self.created.lock().push((session_id, transport.clone()));
            transport
        }
    }
}
