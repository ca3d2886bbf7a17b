//! RTP packetization for H264 video
//!
//! Access units arrive as Annex B byte streams. `H264Payloader` splits them
//! into NAL units (SPS/PPS are aggregated into STAP-A, large slices become
//! FU-A fragments). Sequence numbers and timestamps are assigned here rather
//! than by a sample track, so each viewer's timeline follows its own exact
//! frame count.

use bytes::Bytes;
use rtp::codecs::h264::H264Payloader;
use rtp::header::Header;
use rtp::packet::Packet;
use rtp::packetizer::Payloader;
use std::sync::Arc;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;

use super::transport::TransportError;

/// Default MTU for RTP packets (conservative for most networks)
pub const RTP_MTU: usize = 1200;

/// H264 clock rate (always 90kHz per RFC 6184)
pub const H264_CLOCK_RATE: u32 = 90000;

/// Dynamic payload type advertised for H264; the negotiated binding
/// overrides it on write.
pub const H264_PAYLOAD_TYPE: u8 = 102;

/// Build the local H264 track offered to every viewer
pub fn h264_track(track_id: &str, stream_id: &str) -> Arc<TrackLocalStaticRTP> {
    let codec = RTCRtpCodecCapability {
        mime_type: "video/H264".to_string(),
        clock_rate: H264_CLOCK_RATE,
        channels: 0,
        sdp_fmtp_line: "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
            .to_string(),
        rtcp_feedback: vec![],
    };
    Arc::new(TrackLocalStaticRTP::new(
        codec,
        track_id.to_string(),
        stream_id.to_string(),
    ))
}

/// Per-viewer RTP state for one H264 track
pub struct H264RtpWriter {
    track: Arc<TrackLocalStaticRTP>,
    payloader: H264Payloader,
    mtu: usize,
    sequence_number: u16,
    timestamp_base: u32,
    packets_sent: u64,
}

impl H264RtpWriter {
    /// Sequence number and timestamp start at random offsets (RFC 3550 §5.1)
    pub fn new(track: Arc<TrackLocalStaticRTP>) -> Self {
        Self::with_bases(track, rand::random(), rand::random())
    }

    pub fn with_bases(
        track: Arc<TrackLocalStaticRTP>,
        sequence_number: u16,
        timestamp_base: u32,
    ) -> Self {
        Self {
            track,
            payloader: H264Payloader::default(),
            mtu: RTP_MTU,
            sequence_number,
            timestamp_base,
            packets_sent: 0,
        }
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    /// Split one access unit into RTP packets stamped `elapsed_ticks` (90 kHz)
    /// after this writer's timestamp base. The marker bit is set on the last
    /// packet of the access unit.
    pub fn packetize(
        &mut self,
        access_unit: &Bytes,
        elapsed_ticks: u64,
    ) -> Result<Vec<Packet>, TransportError> {
        let payloads = self
            .payloader
            .payload(self.mtu, access_unit)
            .map_err(|e| TransportError::Send(format!("H264 payloading failed: {}", e)))?;

        let timestamp = self.timestamp_base.wrapping_add(elapsed_ticks as u32);
        let count = payloads.len();
        let packets = payloads
            .into_iter()
            .enumerate()
            .map(|(i, payload)| {
                let sequence_number = self.sequence_number;
                self.sequence_number = self.sequence_number.wrapping_add(1);
                Packet {
                    header: Header {
                        version: 2,
                        marker: i + 1 == count,
                        payload_type: H264_PAYLOAD_TYPE,
                        sequence_number,
                        timestamp,
                        ..Default::default()
                    },
                    payload,
                }
            })
            .collect();
        Ok(packets)
    }

    /// Packetize and write one access unit to the track
    pub async fn write_access_unit(
        &mut self,
        access_unit: &Bytes,
        elapsed_ticks: u64,
    ) -> Result<usize, TransportError> {
        let packets = self.packetize(access_unit, elapsed_ticks)?;
        let count = packets.len();
        for packet in &packets {
            self.track
                .write_rtp(packet)
                .await
                .map_err(|e| TransportError::Send(format!("RTP write failed: {}", e)))?;
        }
        self.packets_sent += count as u64;
        Ok(count)
    }
}
