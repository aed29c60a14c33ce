//! WebRTC signaling types and messages

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Signaling message types exchanged with the signaling collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    /// SDP offer
    Offer(SdpOffer),
    /// SDP answer
    Answer(SdpAnswer),
    /// ICE candidate
    Candidate(IceCandidate),
    /// Refresh ICE credentials without a full renegotiation
    RestartIce(IceRestart),
    /// Connection error
    Error(SignalingError),
    /// Connection closed
    Close,
}

/// SDP offer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdpOffer {
    /// SDP content
    pub sdp: String,
}

impl SdpOffer {
    pub fn new(sdp: impl Into<String>) -> Self {
        Self { sdp: sdp.into() }
    }
}

/// SDP answer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdpAnswer {
    /// SDP content
    pub sdp: String,
}

impl SdpAnswer {
    pub fn new(sdp: impl Into<String>) -> Self {
        Self { sdp: sdp.into() }
    }
}

/// New ICE credentials for a restart
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceRestart {
    pub ufrag: String,
    pub pwd: String,
}

/// ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate string
    pub candidate: String,
    /// SDP mid (media ID)
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    /// SDP mline index
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    /// Username fragment
    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    pub fn with_mid(mut self, mid: impl Into<String>, index: u16) -> Self {
        self.sdp_mid = Some(mid.into());
        self.sdp_mline_index = Some(index);
        self
    }

    /// Candidate attribute without an `a=` line prefix.
    ///
    /// Fails unless the attribute starts with `candidate:`.
    pub fn attribute(&self) -> Result<&str, AppError> {
        let trimmed = self.candidate.trim();
        let attr = trimmed.strip_prefix("a=").unwrap_or(trimmed);
        if attr.starts_with("candidate:") {
            Ok(attr)
        } else {
            Err(AppError::CandidateParse(format!(
                "missing candidate: prefix in '{}'",
                self.candidate
            )))
        }
    }
}

/// Signaling error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingError {
    /// Error code
    pub code: u32,
    /// Error message
    pub message: String,
}

impl SignalingError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Map a failed signaling operation to a wire error
    pub fn from_app_error(err: &AppError) -> Self {
        let code = match err {
            AppError::SdpParse(_) | AppError::CandidateParse(_) => 400,
            AppError::NegotiationLocked(_) | AppError::InvalidState(_) => 409,
            AppError::SessionClosed(_) => 410,
            _ => 500,
        };
        Self::new(code, err.to_string())
    }
}

/// Session description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

impl FromStr for SdpType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "offer" => Ok(SdpType::Offer),
            "answer" => Ok(SdpType::Answer),
            "pranswer" => Ok(SdpType::Pranswer),
            "rollback" => Ok(SdpType::Rollback),
            other => Err(AppError::SdpParse(format!("unknown description type '{}'", other))),
        }
    }
}

impl std::fmt::Display for SdpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SdpType::Offer => write!(f, "offer"),
            SdpType::Answer => write!(f, "answer"),
            SdpType::Pranswer => write!(f, "pranswer"),
            SdpType::Rollback => write!(f, "rollback"),
        }
    }
}

/// Offer/answer negotiation phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

impl std::fmt::Display for SignalingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalingState::Stable => write!(f, "stable"),
            SignalingState::HaveLocalOffer => write!(f, "have-local-offer"),
            SignalingState::HaveRemoteOffer => write!(f, "have-remote-offer"),
            SignalingState::Closed => write!(f, "closed"),
        }
    }
}

/// Connection state notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::New => write!(f, "new"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed => write!(f, "failed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_wire_shape() {
        let msg: SignalingMessage =
            serde_json::from_str(r#"{"type":"offer","sdp":"v=0"}"#).unwrap();
        assert!(matches!(msg, SignalingMessage::Offer(ref o) if o.sdp == "v=0"));

        let msg: SignalingMessage =
            serde_json::from_str(r#"{"type":"restart_ice","ufrag":"u","pwd":"p"}"#).unwrap();
        assert!(matches!(msg, SignalingMessage::RestartIce(ref r) if r.ufrag == "u"));

        let json = serde_json::to_string(&SignalingMessage::Candidate(
            IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 5000 typ host").with_mid("0", 0),
        ))
        .unwrap();
        assert!(json.contains("\"type\":\"candidate\""));
        assert!(json.contains("\"sdpMid\":\"0\""));

        let close = serde_json::to_string(&SignalingMessage::Close).unwrap();
        assert_eq!(close, r#"{"type":"close"}"#);
    }

    #[test]
    fn test_sdp_type_parse() {
        assert_eq!("offer".parse::<SdpType>().unwrap(), SdpType::Offer);
        assert_eq!("PrAnswer".parse::<SdpType>().unwrap(), SdpType::Pranswer);
        assert!(matches!("bogus".parse::<SdpType>(), Err(AppError::SdpParse(_))));
    }

    #[test]
    fn test_candidate_attribute_prefix() {
        let c = IceCandidate::new("a=candidate:1 1 udp 1 10.0.0.1 5000 typ host");
        assert!(c.attribute().unwrap().starts_with("candidate:1"));
        assert!(matches!(
            IceCandidate::new("garbage").attribute(),
            Err(AppError::CandidateParse(_))
        ));
    }
}
