use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;

use crate::config::SignalingConfig;
use crate::video::pipeline::PipelineStats;
use crate::webrtc::SessionRegistry;

/// Application-wide state shared across handlers
pub struct AppState {
    /// Signaling server settings (token, offer wait limit)
    pub signaling: SignalingConfig,
    /// Every viewer session
    pub registry: Arc<SessionRegistry>,
    /// Capture/encode counters, absent until the pipeline starts
    pub stats: Option<Arc<PipelineStats>>,
    /// Shutdown signal sender
    pub shutdown_tx: broadcast::Sender<()>,
    started_at: Instant,
}

impl AppState {
    pub fn new(
        signaling: SignalingConfig,
        registry: Arc<SessionRegistry>,
        stats: Option<Arc<PipelineStats>>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Arc<Self> {
        Arc::new(Self {
            signaling,
            registry,
            stats,
            shutdown_tx,
            started_at: Instant::now(),
        })
    }

    /// Seconds since startup
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Subscribe to shutdown signal
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Whether `token` matches the configured viewer token
    pub fn token_matches(&self, token: Option<&str>) -> bool {
        token == Some(self.signaling.auth_token.as_str())
    }
}
