use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::video::format::{FrameRate, PixelFormat, Resolution};
use crate::video::encoder::EncoderConfig;
pub use crate::webrtc::config::{TurnServer, WebRtcConfig};

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Video capture settings
    pub capture: CaptureConfig,
    /// H.264 encoder settings
    pub encoder: EncoderSettings,
    /// Peer connection settings
    pub webrtc: WebRtcConfig,
    /// Offer/answer HTTP server settings
    pub signaling: SignalingConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !self.capture.resolution().is_valid() {
            return Err(format!(
                "invalid capture resolution {}",
                self.capture.resolution()
            ));
        }
        if !self.capture.frame_rate().is_valid() {
            return Err(format!(
                "invalid frame rate {}/{}",
                self.capture.fps_numerator, self.capture.fps_denominator
            ));
        }
        if self.encoder.bitrate_bps == 0 {
            return Err("encoder bitrate must be positive".to_string());
        }
        if self.encoder.row_alignment == 0 || !self.encoder.row_alignment.is_power_of_two() {
            return Err(format!(
                "row alignment {} is not a power of two",
                self.encoder.row_alignment
            ));
        }
        if self.signaling.auth_token.is_empty() {
            return Err("signaling auth token must not be empty".to_string());
        }
        self.webrtc.validate()
    }
}

/// Capture source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CaptureBackendKind {
    /// Video4Linux2 devices under /dev/video*
    #[default]
    V4l2,
    /// Synthetic color bars
    TestPattern,
}

impl std::str::FromStr for CaptureBackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "v4l2" => Ok(Self::V4l2),
            "test-pattern" | "testpattern" => Ok(Self::TestPattern),
            _ => Err(format!("unknown capture backend: {}", s)),
        }
    }
}

/// Video capture configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub backend: CaptureBackendKind,
    /// Device name or path (e.g., /dev/video0); first available when unset
    pub device: Option<String>,
    pub width: u32,
    pub height: u32,
    pub fps_numerator: u32,
    pub fps_denominator: u32,
    /// Requested pixel layout; drivers may substitute their own
    pub format: PixelFormat,
    /// Number of memory-mapped capture buffers
    pub buffer_count: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            backend: CaptureBackendKind::V4l2,
            device: None,
            width: 1280,
            height: 720,
            fps_numerator: 30,
            fps_denominator: 1,
            format: PixelFormat::Nv12,
            buffer_count: 4,
        }
    }
}

impl CaptureConfig {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    pub fn frame_rate(&self) -> FrameRate {
        FrameRate::new(self.fps_numerator, self.fps_denominator)
    }
}

/// Encoder configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderSettings {
    /// Target bitrate in bits per second
    pub bitrate_bps: u32,
    /// Frames between IDR frames
    pub keyframe_interval: u32,
    /// Row alignment of the staging buffers, in bytes
    pub row_alignment: usize,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            bitrate_bps: 4_000_000,
            keyframe_interval: 60,
            row_alignment: 16,
        }
    }
}

impl EncoderSettings {
    /// Encoder configuration for a stream of the given geometry
    pub fn encoder_config(&self, resolution: Resolution, frame_rate: FrameRate) -> EncoderConfig {
        EncoderConfig {
            resolution,
            frame_rate,
            bitrate_bps: self.bitrate_bps,
            keyframe_interval: self.keyframe_interval,
        }
    }
}

/// Signaling server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Bind address
    pub bind_address: String,
    pub port: u16,
    /// Token viewers must present to request an offer
    pub auth_token: String,
    /// Directory served at `/` (viewer page)
    pub document_root: Option<PathBuf>,
    /// How long `/offer` waits for candidate gathering
    pub offer_timeout_ms: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8081,
            auth_token: "PPSVideoMirror".to_string(),
            document_root: None,
            offer_timeout_ms: 10_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.signaling.port, 8081);
        assert_eq!(config.signaling.auth_token, "PPSVideoMirror");
        assert_eq!(config.capture.frame_rate(), FrameRate::from_fps(30));
    }

    #[test]
    fn test_backend_names() {
        let json = r#"{"capture": {"backend": "test-pattern", "format": "BGRA"}}"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.capture.backend, CaptureBackendKind::TestPattern);
        assert_eq!(config.capture.format, PixelFormat::Bgra);
        assert_eq!(config.capture.width, 1280);
        assert_eq!("v4l2".parse::<CaptureBackendKind>().unwrap(), CaptureBackendKind::V4l2);
        assert!("dshow".parse::<CaptureBackendKind>().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.capture.fps_denominator = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.encoder.row_alignment = 12;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.signaling.auth_token.clear();
        assert!(config.validate().is_err());
    }
}
