//! WebRTC peer sessions
//!
//! This module provides:
//! - the offer/answer negotiation state machine ([`PeerSession`])
//! - role-tagged data channels carrying the command protocol
//! - an H.264 sample track fed from the capture broadcast
//!
//! Architecture:
//! ```text
//! CaptureEngine ---(H.264 FrameBuffer broadcast)---> VideoTrack
//!                                                        |
//! signaling collaborator <-- SignalingEvent --- PeerSession --- RtcTransport (webrtc)
//!                          -- offer/answer -->       |
//!                                                    +--- DataChannel (cmd/lossy/reliable)
//! ```

pub mod channel;
pub mod config;
pub mod session;
pub mod signaling;
pub mod track;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use channel::{ChannelRole, DataChannel};
pub use config::{DataChannelMode, TurnServer, WebRtcConfig};
pub use session::{PeerSession, SessionEvent, SessionKind, SignalingEvent};
pub use signaling::{ConnectionState, IceCandidate, SdpType, SignalingMessage, SignalingState};
pub use track::{VideoTrack, VideoTrackConfig};
pub use transport::{RtcTransport, TransportFactory, WebRtcTransport, WebRtcTransportFactory};
