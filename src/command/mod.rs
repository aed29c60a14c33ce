//! Structured commands over the command data channel
//!
//! - [`protocol`]: protobuf packet framing and the typed [`Command`]
//! - [`files`]: recording lookup for file queries and transfers
//! - [`orchestrator`]: session wiring and command handlers

pub mod files;
pub mod orchestrator;
pub mod protocol;

pub use files::RecordingIndex;
pub use orchestrator::{ChannelPayload, SessionOrchestrator};
pub use protocol::{decode_command, Command, CommandKind, DisconnectReason, FileQuery};
