//! camstream - camera streaming for embedded boards
//!
//! This crate captures frames from a V4L2 device, optionally runs them
//! through a hardware M2M encoder, and streams them to WebRTC peers. A
//! protobuf command channel alongside the media carries snapshots, recording
//! queries and drive control.

pub mod actuator;
pub mod command;
pub mod config;
pub mod error;
pub mod signaling;
pub mod utils;
pub mod video;
pub mod webrtc;

pub use error::{AppError, Result};
