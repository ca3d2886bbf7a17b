use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers;
use super::static_files::static_file_router;
use crate::state::AppState;

/// Create the signaling router
pub fn create_router(state: Arc<AppState>) -> Router {
    // the viewer page may be served from another origin
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/offer", get(handlers::offer))
        .route("/answer", post(handlers::answer))
        .route("/broadcast", post(handlers::broadcast))
        .route("/status", get(handlers::status))
        .route("/health", get(handlers::health_check));

    let router = match state
        .signaling
        .document_root
        .as_deref()
        .and_then(static_file_router::<Arc<AppState>>)
    {
        Some(static_routes) => api_routes.merge(static_routes),
        None => api_routes,
    };

    router
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SignalingConfig;
    use crate::video::format::FrameRate;
    use crate::webrtc::transport::testing::RecordingFactory;
    use crate::webrtc::SessionRegistry;
    use tokio::sync::broadcast;

    #[test]
    fn test_router_builds_with_and_without_document_root() {
        let dir = tempfile::tempdir().unwrap();
        for root in [None, Some(dir.path().to_path_buf())] {
            let registry = Arc::new(SessionRegistry::new(
                RecordingFactory::new(),
                FrameRate::from_fps(30),
            ));
            let (shutdown_tx, _) = broadcast::channel(1);
            let signaling = SignalingConfig {
                document_root: root,
                ..Default::default()
            };
            let _router = create_router(AppState::new(signaling, registry, None, shutdown_tx));
        }
    }
}
