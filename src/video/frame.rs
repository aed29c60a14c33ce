//! Video frame data structures

use bytes::{Bytes, BytesMut};
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use super::format::{PixelFormat, Resolution};
use crate::error::{AppError, Result};

/// V4L2_BUF_FLAG_KEYFRAME
pub const BUF_FLAG_KEYFRAME: u32 = 0x0000_0008;

#[derive(Debug, Clone)]
enum FrameData {
    /// Payload lifted out of a hardware buffer; shared by every subscriber
    Captured(Bytes),
    /// Software-owned copy that may be written to
    Owned(BytesMut),
}

/// A video frame with metadata
///
/// Frames coming out of [`CaptureEngine`](super::capture::CaptureEngine) or
/// [`CodecPipeline`](super::codec::CodecPipeline) are immutable and cheap to
/// clone. Call [`clone_owned`](Self::clone_owned) to get a writable copy.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    data: FrameData,
    /// Frame resolution
    pub resolution: Resolution,
    /// Pixel format
    pub format: PixelFormat,
    /// Stride of the first plane (bytes per line, 0 for compressed data)
    pub stride: u32,
    /// Raw V4L2 buffer flags
    pub flags: u32,
    /// Driver timestamp
    pub timestamp: Duration,
    /// Frame sequence number
    pub sequence: u64,
    /// Exported DMA-BUF handle of the source buffer, if any.
    /// Borrowed from the producer's buffer group; never closed by the frame.
    pub dma_fd: Option<RawFd>,
    /// Time the frame was lifted off the device
    pub capture_ts: Instant,
}

impl FrameBuffer {
    /// Wrap a payload produced by hardware
    pub fn captured(
        data: Bytes,
        resolution: Resolution,
        format: PixelFormat,
        stride: u32,
        sequence: u64,
    ) -> Self {
        Self {
            data: FrameData::Captured(data),
            resolution,
            format,
            stride,
            flags: 0,
            timestamp: Duration::ZERO,
            sequence,
            dma_fd: None,
            capture_ts: Instant::now(),
        }
    }

    /// Allocate a zeroed, writable frame
    pub fn new_owned(resolution: Resolution, format: PixelFormat, size: usize) -> Self {
        let stride = format
            .bytes_per_pixel()
            .map(|bpp| resolution.width * bpp as u32)
            .unwrap_or(resolution.width);
        Self {
            data: FrameData::Owned(BytesMut::zeroed(size)),
            resolution,
            format,
            stride,
            flags: 0,
            timestamp: Duration::ZERO,
            sequence: 0,
            dma_fd: None,
            capture_ts: Instant::now(),
        }
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_timestamp(mut self, timestamp: Duration) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn with_dma_fd(mut self, fd: Option<RawFd>) -> Self {
        self.dma_fd = fd;
        self
    }

    /// Get frame data as bytes slice
    pub fn data(&self) -> &[u8] {
        match &self.data {
            FrameData::Captured(bytes) => bytes,
            FrameData::Owned(bytes) => bytes,
        }
    }

    /// Get frame data as Bytes (cheap for captured frames)
    pub fn data_bytes(&self) -> Bytes {
        match &self.data {
            FrameData::Captured(bytes) => bytes.clone(),
            FrameData::Owned(bytes) => Bytes::copy_from_slice(bytes),
        }
    }

    /// Writable access, only for software-owned frames
    pub fn data_mut(&mut self) -> Result<&mut [u8]> {
        match &mut self.data {
            FrameData::Owned(bytes) => Ok(bytes.as_mut()),
            FrameData::Captured(_) => Err(AppError::InvalidState(
                "captured frame is read-only, clone_owned() it first".to_string(),
            )),
        }
    }

    /// Deep copy into a writable frame that shares nothing with the producer
    pub fn clone_owned(&self) -> Self {
        Self {
            data: FrameData::Owned(BytesMut::from(self.data())),
            dma_fd: None,
            ..self.clone()
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self.data, FrameData::Owned(_))
    }

    pub fn is_key_frame(&self) -> bool {
        self.flags & BUF_FLAG_KEYFRAME != 0
    }

    /// Get data length
    pub fn len(&self) -> usize {
        self.data().len()
    }

    /// Check if frame is empty
    pub fn is_empty(&self) -> bool {
        self.data().is_empty()
    }

    pub fn width(&self) -> u32 {
        self.resolution.width
    }

    pub fn height(&self) -> u32 {
        self.resolution.height
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_captured_frame_is_read_only() {
        let mut frame = FrameBuffer::captured(
            Bytes::from_static(&[1, 2, 3, 4]),
            Resolution::new(2, 1),
            PixelFormat::Yuyv,
            4,
            7,
        );
        assert!(frame.data_mut().is_err());

        let mut owned = frame.clone_owned();
        assert!(owned.is_owned());
        owned.data_mut().unwrap()[0] = 9;
        assert_eq!(owned.data(), &[9, 2, 3, 4]);
        assert_eq!(frame.data(), &[1, 2, 3, 4]);
        assert_eq!(owned.sequence, 7);
    }

    #[test]
    fn test_keyframe_flag() {
        let frame = FrameBuffer::captured(
            Bytes::new(),
            Resolution::VGA,
            PixelFormat::H264,
            0,
            0,
        );
        assert!(!frame.is_key_frame());
        assert!(frame.with_flags(BUF_FLAG_KEYFRAME | 0x1).is_key_frame());
    }

    #[test]
    fn test_new_owned_stride() {
        let frame = FrameBuffer::new_owned(Resolution::VGA, PixelFormat::Yuyv, 16);
        assert_eq!(frame.stride, 1280);
        assert_eq!(frame.len(), 16);
        assert!(frame.dma_fd.is_none());
    }
}
