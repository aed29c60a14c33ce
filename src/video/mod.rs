//! Video capture and hardware codec module
//!
//! This module provides the V4L2 buffer-exchange engine, the capture loop and
//! the memory-to-memory codec pipeline built on top of it.

pub mod buffer;
pub mod capture;
pub mod codec;
pub mod device;
pub mod format;
pub mod frame;
pub mod snapshot;
pub mod v4l2;

#[cfg(test)]
pub(crate) mod testing;

pub use buffer::{BufferGroup, SlotState};
pub use capture::{CaptureConfig, CaptureEngine, CaptureState, CaptureStats};
pub use codec::{CodecConfig, CodecPipeline, CodecState};
pub use device::{Direction, MemoryMode, VideoDevice};
pub use format::{PixelFormat, Resolution};
pub use frame::FrameBuffer;
pub use v4l2::{open_device, V4l2Device};
