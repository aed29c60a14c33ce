//! Video device abstraction
//!
//! Everything the buffer-exchange engine needs from a kernel video node,
//! one method per ioctl-level operation. [`V4l2Device`](super::v4l2::V4l2Device)
//! is the real implementation; tests plug in a scripted device.

use std::os::fd::{OwnedFd, RawFd};
use std::time::Duration;

pub use v4l2r::QueueType;

use crate::error::{AppError, Result};

/// Which side of the device a buffer group talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device -> software (camera frames, codec results)
    Capture,
    /// Software -> device (codec input)
    Output,
}

/// How buffer memory is shared with the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryMode {
    /// Driver-allocated, mapped into our address space
    Mmap,
    /// Driver-allocated, mapped and additionally exported as DMA-BUF handles
    DmaBufExport,
    /// Memory owned by another stage, passed in by DMA-BUF handle at queue time
    DmaBufImport,
}

impl MemoryMode {
    /// Raw `v4l2_memory` value
    pub fn as_raw(&self) -> u32 {
        match self {
            MemoryMode::Mmap | MemoryMode::DmaBufExport => V4L2_MEMORY_MMAP,
            MemoryMode::DmaBufImport => V4L2_MEMORY_DMABUF,
        }
    }

    pub fn is_mapped(&self) -> bool {
        !matches!(self, MemoryMode::DmaBufImport)
    }
}

pub const V4L2_MEMORY_MMAP: u32 = 1;
pub const V4L2_MEMORY_DMABUF: u32 = 4;

/// Upper bound on planes per buffer
pub const VIDEO_MAX_PLANES: usize = 8;

/// Capabilities relevant to queue selection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceCaps {
    pub capture: bool,
    pub output: bool,
    pub m2m: bool,
    pub multiplanar: bool,
    pub streaming: bool,
}

impl DeviceCaps {
    /// Resolve the queue for a direction.
    ///
    /// Single-plane requests are upgraded to their multi-planar equivalent
    /// whenever the device advertises multi-planar support.
    pub fn queue_for(&self, direction: Direction) -> Result<QueueType> {
        let supported = match direction {
            Direction::Capture => self.capture || self.m2m,
            Direction::Output => self.output || self.m2m,
        };
        if !supported {
            return Err(AppError::DeviceOpen {
                device: String::new(),
                reason: format!("device has no {:?} queue", direction),
            });
        }

        Ok(match (direction, self.multiplanar) {
            (Direction::Capture, false) => QueueType::VideoCapture,
            (Direction::Capture, true) => QueueType::VideoCaptureMplane,
            (Direction::Output, false) => QueueType::VideoOutput,
            (Direction::Output, true) => QueueType::VideoOutputMplane,
        })
    }
}

pub fn is_multiplanar(queue: QueueType) -> bool {
    matches!(
        queue,
        QueueType::VideoCaptureMplane | QueueType::VideoOutputMplane
    )
}

/// Per-plane layout reported by the driver
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaneLayout {
    pub bytesperline: u32,
    pub sizeimage: u32,
}

/// Negotiated format of one queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFormat {
    pub width: u32,
    pub height: u32,
    pub fourcc: [u8; 4],
    pub planes: Vec<PlaneLayout>,
}

impl DeviceFormat {
    pub fn stride(&self) -> u32 {
        self.planes.first().map(|p| p.bytesperline).unwrap_or(0)
    }
}

/// Location of one plane inside the driver's buffer memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneInfo {
    pub offset: u32,
    pub length: u32,
}

/// CPU-visible memory of one mapped plane. Unmapped on drop.
pub trait PlaneMemory: Send {
    fn as_slice(&self) -> &[u8];
    fn as_mut_slice(&mut self) -> &mut [u8];
}

/// Plane description handed to the driver on queue
#[derive(Debug, Clone, Copy, Default)]
pub struct QueuePlane {
    pub bytes_used: u32,
    pub length: u32,
    /// DMA-BUF handle for imported memory
    pub dmabuf_fd: Option<RawFd>,
}

/// What the driver reports for a dequeued buffer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DequeuedBuffer {
    pub index: u32,
    pub flags: u32,
    pub sequence: u32,
    pub timestamp: Duration,
    pub bytes_used: Vec<u32>,
    pub data_offsets: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEventKind {
    EndOfStream,
    SourceChange,
}

impl DeviceEventKind {
    pub fn as_raw(&self) -> u32 {
        match self {
            DeviceEventKind::EndOfStream => 2,
            DeviceEventKind::SourceChange => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    EndOfStream,
    SourceChange { changes: u32 },
    Other(u32),
}

/// Result of a bounded readiness wait. All false means the wait timed out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    /// A capture-side buffer can be dequeued
    pub readable: bool,
    /// An output-side buffer has been consumed and can be dequeued
    pub writable: bool,
    /// An event is pending
    pub priority: bool,
    /// The device reported an error condition
    pub error: bool,
}

impl Readiness {
    pub fn is_timeout(&self) -> bool {
        !self.readable && !self.writable && !self.priority && !self.error
    }
}

/// Kernel video device operations
pub trait VideoDevice: Send + Sync {
    /// Device path or label, for diagnostics
    fn name(&self) -> &str;

    fn capabilities(&self) -> Result<DeviceCaps>;

    fn get_format(&self, queue: QueueType) -> Result<DeviceFormat>;

    /// Request a format and return what the driver actually applied
    fn set_format(&self, queue: QueueType, format: &DeviceFormat) -> Result<DeviceFormat>;

    /// Returns the number of buffers the driver granted
    fn request_buffers(&self, queue: QueueType, memory: MemoryMode, count: u32) -> Result<u32>;

    fn query_buffer(&self, queue: QueueType, index: u32) -> Result<Vec<PlaneInfo>>;

    fn map_plane(&self, plane: &PlaneInfo) -> Result<Box<dyn PlaneMemory>>;

    fn export_plane(&self, queue: QueueType, index: u32, plane: u32) -> Result<OwnedFd>;

    fn queue_buffer(
        &self,
        queue: QueueType,
        memory: MemoryMode,
        index: u32,
        planes: &[QueuePlane],
    ) -> Result<()>;

    fn dequeue_buffer(
        &self,
        queue: QueueType,
        memory: MemoryMode,
        num_planes: usize,
    ) -> Result<DequeuedBuffer>;

    fn stream_on(&self, queue: QueueType) -> Result<()>;

    fn stream_off(&self, queue: QueueType) -> Result<()>;

    fn set_control(&self, id: u32, value: i32) -> Result<()>;

    fn set_frame_rate(&self, queue: QueueType, fps: u32) -> Result<()>;

    fn subscribe_event(&self, kind: DeviceEventKind) -> Result<()>;

    /// Pop one pending event, `None` when the event queue is empty
    fn dequeue_event(&self) -> Result<Option<DeviceEvent>>;

    /// Wait until a buffer or an event is ready, or the timeout expires
    fn poll(&self, timeout: Duration) -> Result<Readiness>;
}

/// V4L2 control ids used by the engines
pub mod controls {
    const CID_BASE: u32 = 0x0098_0900;
    const CID_CODEC_BASE: u32 = 0x0099_0900;
    const CID_CAMERA_CLASS_BASE: u32 = 0x009a_0900;

    pub const AUTO_WHITE_BALANCE: u32 = CID_BASE + 12;
    pub const AUTOGAIN: u32 = CID_BASE + 18;
    pub const ROTATE: u32 = CID_BASE + 34;

    pub const EXPOSURE_AUTO: u32 = CID_CAMERA_CLASS_BASE + 1;
    pub const EXPOSURE_AUTO_ON: i32 = 0;

    pub const BITRATE_MODE: u32 = CID_CODEC_BASE + 206;
    pub const BITRATE_MODE_VBR: i32 = 0;
    pub const BITRATE: u32 = CID_CODEC_BASE + 207;
    pub const REPEAT_SEQ_HEADER: u32 = CID_CODEC_BASE + 226;
    pub const FORCE_KEY_FRAME: u32 = CID_CODEC_BASE + 229;
    pub const H264_I_PERIOD: u32 = CID_CODEC_BASE + 358;
    pub const H264_LEVEL: u32 = CID_CODEC_BASE + 359;
    pub const H264_LEVEL_4_0: i32 = 11;
    pub const H264_PROFILE: u32 = CID_CODEC_BASE + 363;
    pub const H264_PROFILE_HIGH: i32 = 4;
}
