//! Signaling message types
//!
//! The viewer page fetches an offer, answers it, and posts the answer back
//! with the session index it received.

use serde::{Deserialize, Serialize};

/// SDP type, serialized lowercase like the browser's `RTCSessionDescription`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// A session description in browser JSON form: `{"type": ..., "sdp": ...}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Offer handed to a new viewer, tagged with its session index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOffer {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
    pub index: u64,
}

impl SessionOffer {
    pub fn new(description: SessionDescription, index: u64) -> Self {
        Self {
            sdp_type: description.sdp_type,
            sdp: description.sdp,
            index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_json_shape() {
        let offer = SessionOffer::new(SessionDescription::offer("v=0\r\n"), 7);
        let json = serde_json::to_value(&offer).unwrap();
        assert_eq!(json["type"], "offer");
        assert_eq!(json["sdp"], "v=0\r\n");
        assert_eq!(json["index"], 7);
    }

    #[test]
    fn test_answer_parses_from_browser_json() {
        let answer: SessionDescription =
            serde_json::from_str(r#"{"sdp":"v=0\r\n","type":"answer"}"#).unwrap();
        assert_eq!(answer, SessionDescription::answer("v=0\r\n"));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(serde_json::from_str::<SessionDescription>(r#"{"sdp":"x","type":"pranswer"}"#)
            .is_err());
    }
}
