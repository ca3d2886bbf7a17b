//! WebRTC transport backed by webrtc-rs
//!
//! Each viewer gets one peer connection with a send-only H264 track and a
//! server-created data channel. All peer connection work runs on a
//! per-session task; the [`Transport`] methods only enqueue commands into a
//! bounded queue, so callers on the capture thread never wait on the network.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;

use super::config::WebRtcConfig;
use super::rtp::{h264_track, H264RtpWriter, H264_CLOCK_RATE};
use super::signaling::SessionDescription;
use super::transport::{
    ReadyCallback, StateCallback, Transport, TransportError, TransportFactory, TransportPart,
    TransportState, VideoPayload,
};

enum Command {
    CreateOffer,
    SetRemote(SessionDescription),
    Video(VideoPayload),
    Auxiliary(Bytes),
    Close(TransportPart),
}

#[derive(Default)]
struct Callbacks {
    state: RwLock<Option<StateCallback>>,
    video_ready: RwLock<Option<ReadyCallback>>,
    auxiliary_ready: RwLock<Option<ReadyCallback>>,
}

impl Callbacks {
    fn state(&self, state: TransportState) {
        if let Some(cb) = self.state.read().as_ref() {
            cb(state);
        }
    }

    fn video_ready(&self) {
        if let Some(cb) = self.video_ready.read().as_ref() {
            cb();
        }
    }

    fn auxiliary_ready(&self) {
        if let Some(cb) = self.auxiliary_ready.read().as_ref() {
            cb();
        }
    }
}

fn map_state(state: RTCPeerConnectionState) -> Option<TransportState> {
    match state {
        RTCPeerConnectionState::New => Some(TransportState::New),
        RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
        RTCPeerConnectionState::Connected => Some(TransportState::Connected),
        RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCPeerConnectionState::Failed => Some(TransportState::Failed),
        RTCPeerConnectionState::Closed => Some(TransportState::Closed),
        _ => None,
    }
}

fn enqueue_error(e: TrySendError<Command>) -> TransportError {
    match e {
        TrySendError::Full(_) => TransportError::QueueFull,
        TrySendError::Closed(_) => TransportError::Closed,
    }
}

pub struct WebRtcTransport {
    session_id: u64,
    config: WebRtcConfig,
    runtime: Handle,
    commands: mpsc::Sender<Command>,
    pending: Mutex<Option<mpsc::Receiver<Command>>>,
    callbacks: Arc<Callbacks>,
    local: Arc<RwLock<Option<SessionDescription>>>,
    cancel: CancellationToken,
    workers: TaskTracker,
}

impl WebRtcTransport {
    /// The session worker is spawned on `runtime` and tracked by `workers`
    pub fn new(
        session_id: u64,
        config: WebRtcConfig,
        runtime: Handle,
        workers: TaskTracker,
    ) -> Self {
        let (commands, rx) = mpsc::channel(config.send_queue_depth.max(1));
        Self {
            session_id,
            config,
            runtime,
            commands,
            pending: Mutex::new(Some(rx)),
            callbacks: Arc::new(Callbacks::default()),
            local: Arc::new(RwLock::new(None)),
            cancel: CancellationToken::new(),
            workers,
        }
    }

    fn enqueue(&self, command: Command) -> Result<(), TransportError> {
        self.commands.try_send(command).map_err(enqueue_error)
    }
}

impl Transport for WebRtcTransport {
    fn open(&self) -> Result<(), TransportError> {
        let rx = self.pending.lock().take().ok_or(TransportError::Closed)?;
        let worker = Worker {
            session_id: self.session_id,
            config: self.config.clone(),
            callbacks: self.callbacks.clone(),
            local: self.local.clone(),
            pc: None,
            writer: None,
            sender: None,
            data_channel: None,
        };
        self.workers
            .spawn_on(worker.run(rx, self.cancel.clone()), &self.runtime);
        Ok(())
    }

    fn close(&self, part: TransportPart) {
        if self.pending.lock().is_some() {
            // never opened
            return;
        }
        match part {
            // the worker releases any remaining parts in order on its way out
            TransportPart::Connection => self.cancel.cancel(),
            _ => {
                if let Err(TrySendError::Full(_)) = self.commands.try_send(Command::Close(part)) {
                    debug!("Session {} queue full, {:?} released at close", self.session_id, part);
                }
            }
        }
    }

    fn set_local_description(&self) -> Result<(), TransportError> {
        self.enqueue(Command::CreateOffer)
    }

    fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.enqueue(Command::SetRemote(description))
    }

    fn local_description(&self) -> Option<SessionDescription> {
        self.local.read().clone()
    }

    fn send_video(&self, payload: VideoPayload) -> Result<(), TransportError> {
        trace!(session = self.session_id, "WebRTC_EnqueueVideoSample");
        self.enqueue(Command::Video(payload))
    }

    fn send_auxiliary(&self, payload: Bytes) -> Result<(), TransportError> {
        self.enqueue(Command::Auxiliary(payload))
    }

    fn on_state_change(&self, callback: StateCallback) {
        *self.callbacks.state.write() = Some(callback);
    }

    fn on_video_ready(&self, callback: ReadyCallback) {
        *self.callbacks.video_ready.write() = Some(callback);
    }

    fn on_auxiliary_ready(&self, callback: ReadyCallback) {
        *self.callbacks.auxiliary_ready.write() = Some(callback);
    }
}

/// Owns the peer connection for one session
struct Worker {
    session_id: u64,
    config: WebRtcConfig,
    callbacks: Arc<Callbacks>,
    local: Arc<RwLock<Option<SessionDescription>>>,
    pc: Option<Arc<RTCPeerConnection>>,
    writer: Option<H264RtpWriter>,
    sender: Option<Arc<RTCRtpSender>>,
    data_channel: Option<Arc<RTCDataChannel>>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>, cancel: CancellationToken) {
        if let Err(e) = self.build().await {
            warn!("Session {} peer connection setup failed: {}", self.session_id, e);
            self.callbacks.state(TransportState::Failed);
            return;
        }

        loop {
            let command = tokio::select! {
                _ = cancel.cancelled() => break,
                command = rx.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            let result = match command {
                Command::CreateOffer => self.create_offer().await,
                Command::SetRemote(description) => self.set_remote(description).await,
                Command::Video(payload) => self.write_video(payload).await,
                Command::Auxiliary(payload) => self.write_auxiliary(payload).await,
                Command::Close(part) => {
                    self.release(part).await;
                    Ok(())
                }
            };
            if let Err(e) = result {
                warn!("Session {} transport error: {}", self.session_id, e);
                self.callbacks.state(TransportState::Failed);
            }
        }

        self.release(TransportPart::Auxiliary).await;
        self.release(TransportPart::Video).await;
        self.release(TransportPart::Connection).await;
        debug!("Session {} peer connection closed", self.session_id);
    }

    async fn build(&mut self) -> Result<(), TransportError> {
        let negotiation = |what: &str, e: webrtc::Error| {
            TransportError::Negotiation(format!("{}: {}", what, e))
        };

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| negotiation("register codecs", e))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| negotiation("register interceptors", e))?;

        let mut setting_engine = SettingEngine::default();
        let udp = EphemeralUDP::new(self.config.udp_port_min, self.config.udp_port_max)
            .map_err(|e| TransportError::Negotiation(format!("UDP port range: {}", e)))?;
        setting_engine.set_udp_network(UDPNetwork::Ephemeral(udp));

        let api = APIBuilder::new()
            .with_setting_engine(setting_engine)
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: self.config.ice_servers(),
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| negotiation("create peer connection", e))?,
        );

        let callbacks = self.callbacks.clone();
        let session_id = self.session_id;
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            if let Some(state) = map_state(s) {
                info!("Session {} peer connection state: {:?}", session_id, state);
                callbacks.state(state);
                if state == TransportState::Connected {
                    callbacks.video_ready();
                }
            }
            Box::pin(async {})
        }));

        let track = h264_track(&self.config.track_id, &self.config.stream_id);
        let sender = pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| negotiation("add video track", e))?;

        // drain RTCP so interceptors keep running
        let rtcp_sender = sender.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });

        let dc = pc
            .create_data_channel(&self.config.data_channel_label, None)
            .await
            .map_err(|e| negotiation("create data channel", e))?;
        let callbacks = self.callbacks.clone();
        let label = self.config.data_channel_label.clone();
        dc.on_open(Box::new(move || {
            debug!("Session {} data channel '{}' open", session_id, label);
            callbacks.auxiliary_ready();
            Box::pin(async {})
        }));

        self.writer = Some(H264RtpWriter::new(track));
        self.sender = Some(sender);
        self.data_channel = Some(dc);
        self.pc = Some(pc);
        Ok(())
    }

    fn peer(&self) -> Result<Arc<RTCPeerConnection>, TransportError> {
        self.pc.clone().ok_or(TransportError::Closed)
    }

    async fn create_offer(&mut self) -> Result<(), TransportError> {
        let pc = self.peer()?;
        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| TransportError::Negotiation(format!("create offer: {}", e)))?;

        let mut gather_complete = pc.gathering_complete_promise().await;
        pc.set_local_description(offer)
            .await
            .map_err(|e| TransportError::Negotiation(format!("set local description: {}", e)))?;
        let _ = gather_complete.recv().await;

        let description = pc
            .local_description()
            .await
            .ok_or_else(|| TransportError::Negotiation("no local description".to_string()))?;
        debug!(
            "Session {} offer ready ({} bytes of SDP)",
            self.session_id,
            description.sdp.len()
        );
        *self.local.write() = Some(SessionDescription::offer(description.sdp));
        Ok(())
    }

    async fn set_remote(&mut self, description: SessionDescription) -> Result<(), TransportError> {
        let pc = self.peer()?;
        let answer = RTCSessionDescription::answer(description.sdp)
            .map_err(|e| TransportError::InvalidDescription(e.to_string()))?;
        pc.set_remote_description(answer)
            .await
            .map_err(|e| TransportError::InvalidDescription(e.to_string()))?;
        debug!("Session {} remote description set", self.session_id);
        Ok(())
    }

    async fn write_video(&mut self, payload: VideoPayload) -> Result<(), TransportError> {
        let writer = self.writer.as_mut().ok_or(TransportError::Closed)?;
        let ticks = payload.elapsed.to_clock_ticks(H264_CLOCK_RATE);
        trace!(session = self.session_id, ticks, "WebRTC_PickupVideoSample");
        writer.write_access_unit(&payload.data, ticks).await?;
        Ok(())
    }

    async fn write_auxiliary(&mut self, payload: Bytes) -> Result<(), TransportError> {
        let dc = self.data_channel.as_ref().ok_or(TransportError::Closed)?;
        dc.send(&payload)
            .await
            .map_err(|e| TransportError::Send(format!("data channel: {}", e)))?;
        Ok(())
    }

    async fn release(&mut self, part: TransportPart) {
        match part {
            TransportPart::Auxiliary => {
                if let Some(dc) = self.data_channel.take() {
                    if let Err(e) = dc.close().await {
                        debug!("Session {} data channel close failed: {}", self.session_id, e);
                    }
                }
            }
            TransportPart::Video => {
                if let Some(writer) = self.writer.take() {
                    debug!(
                        "Session {} video track released after {} packets",
                        self.session_id,
                        writer.packets_sent()
                    );
                }
                if let (Some(sender), Some(pc)) = (self.sender.take(), self.pc.as_ref()) {
                    if let Err(e) = pc.remove_track(&sender).await {
                        debug!("Session {} remove track failed: {}", self.session_id, e);
                    }
                }
            }
            TransportPart::Connection => {
                if let Some(pc) = self.pc.take() {
                    if let Err(e) = pc.close().await {
                        debug!("Session {} close failed: {}", self.session_id, e);
                    }
                }
            }
        }
    }
}

/// Creates one [`WebRtcTransport`] per session on the given runtime
pub struct WebRtcTransportFactory {
    config: WebRtcConfig,
    runtime: Handle,
    workers: TaskTracker,
}

impl WebRtcTransportFactory {
    pub fn new(config: WebRtcConfig, runtime: Handle) -> Self {
        Self {
            config,
            runtime,
            workers: TaskTracker::new(),
        }
    }

    /// Wait until every session worker has released its peer connection.
    /// Call after the transports were closed; returns `false` on timeout.
    pub async fn wait_closed(&self, timeout: Duration) -> bool {
        self.workers.close();
        let pending = self.workers.len();
        if pending > 0 {
            debug!("Waiting for {} peer connections to close", pending);
        }
        tokio::time::timeout(timeout, self.workers.wait())
            .await
            .is_ok()
    }
}

impl TransportFactory for WebRtcTransportFactory {
    fn create(&self, session_id: u64) -> Arc<dyn Transport> {
        Arc::new(WebRtcTransport::new(
            session_id,
            self.config.clone(),
            self.runtime.clone(),
            self.workers.clone(),
        ))
    }
}
