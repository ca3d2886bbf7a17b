use axum::{
    extract::{Query, State},
    Json,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::webrtc::{SessionInfo, SessionOffer};

/// Poll interval while waiting for a session's offer
const OFFER_POLL_INTERVAL: Duration = Duration::from_millis(1);

// ============================================================================
// Health & Status
// ============================================================================

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Debug, Serialize)]
pub struct PipelineCounters {
    pub frames_captured: u64,
    pub frames_encoded: u64,
    pub frames_dropped: u64,
    pub frames_skipped: u64,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub session_count: usize,
    pub sessions: Vec<SessionInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<PipelineCounters>,
}

pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    use std::sync::atomic::Ordering::Relaxed;

    let sessions = state.registry.snapshot();
    let pipeline = state.stats.as_ref().map(|s| PipelineCounters {
        frames_captured: s.frames_captured.load(Relaxed),
        frames_encoded: s.frames_encoded.load(Relaxed),
        frames_dropped: s.frames_dropped.load(Relaxed),
        frames_skipped: s.frames_skipped.load(Relaxed),
    });
    Json(StatusResponse {
        uptime_secs: state.uptime_secs(),
        session_count: sessions.len(),
        sessions,
        pipeline,
    })
}

// ============================================================================
// Signaling
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    #[serde(rename = "authToken")]
    pub auth_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AnswerQuery {
    #[serde(rename = "connectionIndex")]
    pub connection_index: Option<String>,
}

/// Create a session and return its offer once candidate gathering is done
pub async fn offer(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TokenQuery>,
) -> Result<Json<SessionOffer>> {
    if !state.token_matches(query.auth_token.as_deref()) {
        return Err(AppError::Forbidden("invalid auth token".to_string()));
    }

    let (id, session) = state.registry.open_session();
    let deadline = Instant::now() + Duration::from_millis(state.signaling.offer_timeout_ms);

    loop {
        if let Some(offer) = session.offer() {
            info!("Offer for session {} ready", id);
            return Ok(Json(offer));
        }
        if session.is_disconnected() {
            return Err(AppError::WebRtcError(format!(
                "session {} failed before its offer was ready",
                id
            )));
        }
        if Instant::now() >= deadline {
            // reclaimed by the next sweep
            session.shutdown();
            return Err(AppError::Timeout(format!("offer for session {}", id)));
        }
        tokio::time::sleep(OFFER_POLL_INTERVAL).await;
    }
}

/// Attach a viewer's answer (`{"type":"answer","sdp":...}`) to its session
pub async fn answer(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AnswerQuery>,
    body: String,
) -> Result<Json<serde_json::Value>> {
    let index = query
        .connection_index
        .ok_or_else(|| AppError::Forbidden("missing connectionIndex".to_string()))?;
    let id: u64 = index
        .parse()
        .map_err(|_| AppError::BadRequest(format!("invalid connectionIndex: {}", index)))?;

    let session = state
        .registry
        .lookup(id)
        .ok_or_else(|| AppError::NotFound(format!("session {}", id)))?;

    session.attach_remote_answer(&body)?;
    debug!("Answer attached to session {}", id);
    Ok(Json(serde_json::json!({})))
}

#[derive(Debug, Serialize)]
pub struct BroadcastResponse {
    pub delivered: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Send the request body to every viewer's side channel
pub async fn broadcast(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TokenQuery>,
    body: Bytes,
) -> Result<Json<BroadcastResponse>> {
    if !state.token_matches(query.auth_token.as_deref()) {
        return Err(AppError::Forbidden("invalid auth token".to_string()));
    }
    if body.is_empty() {
        return Err(AppError::BadRequest("empty message".to_string()));
    }

    let report = state.registry.broadcast_side_channel_message(body);
    state.registry.reap();
    Ok(Json(BroadcastResponse {
        delivered: report.delivered,
        skipped: report.skipped,
        failed: report.failed,
    }))
}
