use thiserror::Error;

use crate::video::format::Resolution;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Failed to open device {device}: {reason}")]
    DeviceOpen { device: String, reason: String },

    #[error("Format mismatch: requested {requested}, driver negotiated {actual}")]
    FormatMismatch {
        requested: Resolution,
        actual: Resolution,
    },

    #[error("Buffer allocation failed: {0}")]
    Allocation(String),

    #[error("Queue buffer failed: {0}")]
    Queue(String),

    #[error("Dequeue buffer failed: {reason}")]
    Dequeue { reason: String, errno: Option<i32> },

    #[error("Stream control failed: {0}")]
    StreamControl(String),

    #[error("Device control failed: {0}")]
    Control(String),

    #[error("Device event error: {0}")]
    DeviceEvent(String),

    #[error("End of stream signaled by {0}")]
    EndOfStream(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("SDP parse error: {0}")]
    SdpParse(String),

    #[error("ICE candidate parse error: {0}")]
    CandidateParse(String),

    #[error("Data channel creation failed: {0}")]
    ChannelCreation(String),

    #[error("Session {0} is connected, renegotiation rejected")]
    NegotiationLocked(String),

    #[error("Session {0} is closed")]
    SessionClosed(String),

    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Actuator not connected")]
    ActuatorUnavailable,

    #[error("Actuator error [{device}]: {reason}")]
    Actuator { device: String, reason: String },

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    /// Build a dequeue error from a raw errno
    pub fn dequeue_errno(errno: nix::errno::Errno) -> Self {
        AppError::Dequeue {
            reason: errno.desc().to_string(),
            errno: Some(errno as i32),
        }
    }

    /// Whether a dequeue failure means the driver will not deliver more buffers.
    ///
    /// A cancelled request or a vanished device terminates the owning loop; every
    /// other dequeue failure is a transient hiccup.
    pub fn is_fatal_dequeue(&self) -> bool {
        match self {
            AppError::Dequeue {
                errno: Some(code), ..
            } => matches!(
                *code,
                libc::ECANCELED | libc::ENODEV | libc::ENXIO | libc::ESHUTDOWN | libc::EPIPE
            ),
            _ => false,
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AppError>;
