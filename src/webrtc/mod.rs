//! WebRTC broadcast
//!
//! Every encoded sample is fanned out to all connected viewers:
//!
//! ```text
//! EncodeStage
//!      |
//!      v
//! BroadcastDispatcher --> SessionRegistry --> ConnectionSession (one per viewer)
//!                                                   |
//!                                                   v
//!                                             Transport (peer connection,
//!                                             H264 track, data channel)
//!      Browser <------ offer / answer ------ signaling server
//! ```

pub mod config;
pub mod dispatcher;
pub mod peer;
pub mod registry;
pub mod rtp;
pub mod session;
pub mod signaling;
pub mod transport;

pub use config::WebRtcConfig;
pub use dispatcher::BroadcastDispatcher;
pub use peer::{WebRtcTransport, WebRtcTransportFactory};
pub use registry::{SessionInfo, SessionRegistry};
pub use session::{ConnectionSession, SessionState};
pub use signaling::{SdpType, SessionDescription, SessionOffer};
pub use transport::{Transport, TransportError, TransportFactory, TransportPart, TransportState};
