use axum::Router;
use std::path::Path;
use tower_http::services::{ServeDir, ServeFile};
use tracing::{info, warn};

/// Router serving the viewer page from `document_root`, with `index.html`
/// as the fallback for unknown paths
pub fn static_file_router<S>(document_root: &Path) -> Option<Router<S>>
where
    S: Clone + Send + Sync + 'static,
{
    if !document_root.is_dir() {
        warn!(
            "Document root {} is not a directory, static files disabled",
            document_root.display()
        );
        return None;
    }

    info!("Serving static files from {}", document_root.display());
    let index = document_root.join("index.html");
    let service = ServeDir::new(document_root).not_found_service(ServeFile::new(index));
    Some(Router::new().fallback_service(service))
}
