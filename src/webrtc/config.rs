//! WebRTC configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::channel::ChannelRole;

/// WebRTC configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
    /// TURN server configuration
    pub turn_servers: Vec<TurnServer>,
    /// Seconds a session may sit in negotiation before it is force-closed
    pub peer_timeout_secs: u64,
    /// Gather candidates into the SDP instead of trickling them
    pub has_candidates_in_sdp: bool,
    /// Delay before a local description is emitted (only with `has_candidates_in_sdp`)
    pub local_description_delay_ms: u64,
    /// Which payload data channels accompany the command channel
    pub data_channels: DataChannelMode,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: vec![],
            peer_timeout_secs: 10,
            has_candidates_in_sdp: false,
            local_description_delay_ms: 1000,
            data_channels: DataChannelMode::Both,
        }
    }
}

impl WebRtcConfig {
    /// Negotiation watchdog timeout
    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs)
    }

    /// Delay applied before emitting a local description.
    ///
    /// Trickled sessions send candidates separately, so there is nothing to wait for.
    pub fn emit_delay(&self) -> Duration {
        if self.has_candidates_in_sdp {
            Duration::from_millis(self.local_description_delay_ms)
        } else {
            Duration::ZERO
        }
    }
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServer {
    /// TURN server URLs (e.g., ["turn:turn.example.com:3478?transport=udp"])
    pub urls: Vec<String>,
    /// Username for TURN authentication
    pub username: String,
    /// Credential for TURN authentication
    pub credential: String,
}

impl TurnServer {
    /// Create a TurnServer with a single URL
    pub fn new(url: String, username: String, credential: String) -> Self {
        Self {
            urls: vec![url],
            username,
            credential,
        }
    }
}

/// Data channel selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DataChannelMode {
    #[default]
    Both,
    Lossy,
    Reliable,
    None,
}

impl DataChannelMode {
    /// Channel roles a session opens. The command channel is always present.
    pub fn roles(&self) -> Vec<ChannelRole> {
        let mut roles = vec![ChannelRole::Command];
        match self {
            DataChannelMode::Both => {
                roles.push(ChannelRole::Lossy);
                roles.push(ChannelRole::Reliable);
            }
            DataChannelMode::Lossy => roles.push(ChannelRole::Lossy),
            DataChannelMode::Reliable => roles.push(ChannelRole::Reliable),
            DataChannelMode::None => {}
        }
        roles
    }
}
