//! WebRTC configuration

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_server::RTCIceServer;

/// Smallest per-viewer queue that holds a first delivery
pub const MIN_SEND_QUEUE_DEPTH: usize = 2;

/// WebRTC configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
    /// TURN server configuration
    pub turn_servers: Vec<TurnServer>,
    /// Lowest local UDP port used for ICE candidates
    pub udp_port_min: u16,
    /// Highest local UDP port used for ICE candidates
    pub udp_port_max: u16,
    /// Pending sends queued per viewer before samples are refused
    pub send_queue_depth: usize,
    pub track_id: String,
    pub stream_id: String,
    /// Label of the side channel opened toward every viewer
    pub data_channel_label: String,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: vec![],
            udp_port_min: 40000,
            udp_port_max: 50000,
            send_queue_depth: 256,
            track_id: "video-stream".to_string(),
            stream_id: "stream1".to_string(),
            data_channel_label: "broadcast".to_string(),
        }
    }
}

impl WebRtcConfig {
    /// ICE servers in the form the peer connection expects
    pub fn ice_servers(&self) -> Vec<RTCIceServer> {
        let mut servers = Vec::new();
        if !self.stun_servers.is_empty() {
            servers.push(RTCIceServer {
                urls: self.stun_servers.clone(),
                ..Default::default()
            });
        }
        for turn in &self.turn_servers {
            servers.push(RTCIceServer {
                urls: turn.urls.clone(),
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }
        servers
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.udp_port_min == 0 || self.udp_port_min > self.udp_port_max {
            return Err(format!(
                "invalid UDP port range {}-{}",
                self.udp_port_min, self.udp_port_max
            ));
        }
        // a first delivery enqueues the codec configuration and a sample
        if self.send_queue_depth < MIN_SEND_QUEUE_DEPTH {
            return Err(format!(
                "send_queue_depth must be at least {}",
                MIN_SEND_QUEUE_DEPTH
            ));
        }
        Ok(())
    }
}

/// TURN server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnServer {
    /// TURN server URLs (e.g., ["turn:turn.example.com:3478?transport=udp"])
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WebRtcConfig::default();
        assert_eq!(config.udp_port_min, 40000);
        assert_eq!(config.udp_port_max, 50000);
        assert_eq!(config.data_channel_label, "broadcast");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ice_servers() {
        let config = WebRtcConfig {
            turn_servers: vec![TurnServer {
                urls: vec!["turn:turn.example.com:3478".to_string()],
                username: "user".to_string(),
                credential: "pass".to_string(),
            }],
            ..Default::default()
        };
        let servers = config.ice_servers();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[1].username, "user");

        let none = WebRtcConfig {
            stun_servers: vec![],
            ..Default::default()
        };
        assert!(none.ice_servers().is_empty());
    }

    #[test]
    fn test_invalid_port_range() {
        let config = WebRtcConfig {
            udp_port_min: 50001,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_send_queue_must_hold_first_delivery() {
        for (depth, ok) in [(0, false), (1, false), (2, true)] {
            let config = WebRtcConfig {
                send_queue_depth: depth,
                ..Default::default()
            };
            assert_eq!(config.validate().is_ok(), ok, "depth {}", depth);
        }
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: WebRtcConfig = serde_json::from_str(r#"{"udp_port_min": 41000}"#).unwrap();
        assert_eq!(config.udp_port_min, 41000);
        assert_eq!(config.udp_port_max, 50000);
    }
}
