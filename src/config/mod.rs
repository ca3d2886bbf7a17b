//! Application configuration
//!
//! Loaded from an optional JSON file. Missing sections and fields fall back
//! to their defaults; command line flags are applied on top by `main`.

mod schema;

pub use schema::*;

use std::path::Path;
use tracing::info;

use crate::error::{AppError, Result};

/// Load configuration from `path`, or defaults when no path is given
pub fn load(path: Option<&Path>) -> Result<AppConfig> {
    let Some(path) = path else {
        return Ok(AppConfig::default());
    };

    let text = std::fs::read_to_string(path).map_err(|e| {
        AppError::Config(format!("cannot read {}: {}", path.display(), e))
    })?;
    let config: AppConfig = serde_json::from_str(&text).map_err(|e| {
        AppError::Config(format!("invalid configuration in {}: {}", path.display(), e))
    })?;
    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

/// Write `config` to `path` as pretty-printed JSON
pub fn save(config: &AppConfig, path: &Path) -> Result<()> {
    let text = serde_json::to_string_pretty(config)?;
    std::fs::write(path, text)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_path_gives_defaults() {
        assert_eq!(load(None).unwrap(), AppConfig::default());
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"signaling": {{"port": 9000}}, "webrtc": {{"udp_port_max": 45000}}}}"#
        )
        .unwrap();

        let config = load(Some(file.path())).unwrap();
        assert_eq!(config.signaling.port, 9000);
        assert_eq!(config.signaling.auth_token, "PPSVideoMirror");
        assert_eq!(config.webrtc.udp_port_max, 45000);
        assert_eq!(config.webrtc.udp_port_min, 40000);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = AppConfig::default();
        config.capture.backend = CaptureBackendKind::TestPattern;
        config.capture.device = Some("test-pattern".to_string());

        save(&config, &path).unwrap();
        assert_eq!(load(Some(&path)).unwrap(), config);
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(load(Some(file.path())), Err(AppError::Config(_))));

        assert!(matches!(
            load(Some(Path::new("/nonexistent/video-mirror.json"))),
            Err(AppError::Config(_))
        ));
    }
}
