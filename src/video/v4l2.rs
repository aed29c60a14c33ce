//! V4L2 device backed by the v4l2r ioctl layer.
//!
//! Buffer queueing, export, controls and events go through `nix` ioctl
//! wrappers over the v4l2r bindings so that memory type, DMA-BUF handles and
//! errno values stay under our control.

use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::debug;
use v4l2r::bindings::{
    v4l2_buffer, v4l2_control, v4l2_event, v4l2_event_subscription, v4l2_exportbuffer,
    v4l2_plane, v4l2_requestbuffers, v4l2_streamparm, v4l2_streamparm__bindgen_ty_1,
};
use v4l2r::ioctl::{
    self, Capabilities, Capability as V4l2rCapability, MemoryConsistency, PlaneMapping,
    QueryBuffer,
};
use v4l2r::memory::MemoryType;
use v4l2r::{Format as V4l2rFormat, PixelFormat as V4l2rPixelFormat};

use super::device::{
    is_multiplanar, DequeuedBuffer, DeviceCaps, DeviceEvent, DeviceEventKind, DeviceFormat,
    MemoryMode, PlaneInfo, PlaneLayout, PlaneMemory, QueuePlane, QueueType, Readiness,
    VideoDevice, VIDEO_MAX_PLANES,
};
use crate::error::{AppError, Result};

mod raw {
    use v4l2r::bindings::{
        v4l2_buffer, v4l2_control, v4l2_event, v4l2_event_subscription, v4l2_exportbuffer,
    };

    nix::ioctl_readwrite!(vidioc_qbuf, b'V', 15, v4l2_buffer);
    nix::ioctl_readwrite!(vidioc_expbuf, b'V', 16, v4l2_exportbuffer);
    nix::ioctl_readwrite!(vidioc_dqbuf, b'V', 17, v4l2_buffer);
    nix::ioctl_readwrite!(vidioc_s_ctrl, b'V', 28, v4l2_control);
    nix::ioctl_read!(vidioc_dqevent, b'V', 89, v4l2_event);
    nix::ioctl_write_ptr!(vidioc_subscribe_event, b'V', 90, v4l2_event_subscription);
}

/// Open a video device node read/write
pub fn open_device(path: impl AsRef<Path>) -> Result<V4l2Device> {
    V4l2Device::open(path)
}

/// Mapped plane; `PlaneMapping` unmaps itself on drop.
struct MappedPlane(PlaneMapping);

// SAFETY: the mapping is a plain region of process memory owned exclusively by
// this value; the buffer state machine keeps hardware and software access apart.
unsafe impl Send for MappedPlane {}

impl PlaneMemory for MappedPlane {
    fn as_slice(&self) -> &[u8] {
        &self.0
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

/// A V4L2 video node
pub struct V4l2Device {
    path: String,
    fd: File,
}

impl V4l2Device {
    /// Open read/write and non-blocking. Dequeues report EAGAIN instead of
    /// sleeping in the driver, so callers must poll for readiness first.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let fd = File::options()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|e| AppError::DeviceOpen {
                device: path.display().to_string(),
                reason: e.to_string(),
            })?;

        debug!("Opened video device {}", path.display());
        Ok(Self {
            path: path.display().to_string(),
            fd,
        })
    }

    fn raw_fd(&self) -> i32 {
        self.fd.as_raw_fd()
    }
}

fn to_device_format(fmt: &V4l2rFormat) -> DeviceFormat {
    DeviceFormat {
        width: fmt.width,
        height: fmt.height,
        fourcc: u32::from(fmt.pixelformat).to_le_bytes(),
        planes: fmt
            .plane_fmt
            .iter()
            .map(|p| PlaneLayout {
                bytesperline: p.bytesperline,
                sizeimage: p.sizeimage,
            })
            .collect(),
    }
}

impl VideoDevice for V4l2Device {
    fn name(&self) -> &str {
        &self.path
    }

    fn capabilities(&self) -> Result<DeviceCaps> {
        let caps: V4l2rCapability = ioctl::querycap(&self.fd)
            .map_err(|e| AppError::DeviceOpen {
                device: self.path.clone(),
                reason: format!("Failed to query capabilities: {}", e),
            })?;
        let flags = caps.device_caps();

        Ok(DeviceCaps {
            capture: flags.intersects(
                Capabilities::VIDEO_CAPTURE | Capabilities::VIDEO_CAPTURE_MPLANE,
            ),
            output: flags
                .intersects(Capabilities::VIDEO_OUTPUT | Capabilities::VIDEO_OUTPUT_MPLANE),
            m2m: flags.intersects(Capabilities::VIDEO_M2M | Capabilities::VIDEO_M2M_MPLANE),
            multiplanar: flags.intersects(
                Capabilities::VIDEO_CAPTURE_MPLANE
                    | Capabilities::VIDEO_OUTPUT_MPLANE
                    | Capabilities::VIDEO_M2M_MPLANE,
            ),
            streaming: flags.contains(Capabilities::STREAMING),
        })
    }

    fn get_format(&self, queue: QueueType) -> Result<DeviceFormat> {
        let fmt: V4l2rFormat = ioctl::g_fmt(&self.fd, queue)
            .map_err(|e| AppError::StreamControl(format!("Failed to get format: {}", e)))?;
        Ok(to_device_format(&fmt))
    }

    fn set_format(&self, queue: QueueType, format: &DeviceFormat) -> Result<DeviceFormat> {
        let mut fmt: V4l2rFormat = ioctl::g_fmt(&self.fd, queue)
            .map_err(|e| AppError::StreamControl(format!("Failed to get format: {}", e)))?;
        fmt.width = format.width;
        fmt.height = format.height;
        fmt.pixelformat = V4l2rPixelFormat::from(&format.fourcc);
        for (dst, src) in fmt.plane_fmt.iter_mut().zip(format.planes.iter()) {
            if src.sizeimage > 0 {
                dst.sizeimage = src.sizeimage;
            }
        }

        let mut fd = self.fd.try_clone()?;
        let actual: V4l2rFormat = ioctl::s_fmt(&mut fd, (queue, &fmt))
            .map_err(|e| AppError::StreamControl(format!("Failed to set format: {}", e)))?;
        Ok(to_device_format(&actual))
    }

    fn request_buffers(&self, queue: QueueType, memory: MemoryMode, count: u32) -> Result<u32> {
        let memory_type = match memory {
            MemoryMode::Mmap | MemoryMode::DmaBufExport => MemoryType::Mmap,
            MemoryMode::DmaBufImport => MemoryType::DmaBuf,
        };
        let req: v4l2_requestbuffers =
            ioctl::reqbufs(&self.fd, queue, memory_type, count, MemoryConsistency::empty())
                .map_err(|e| AppError::Allocation(format!("Failed to request buffers: {}", e)))?;
        Ok(req.count)
    }

    fn query_buffer(&self, queue: QueueType, index: u32) -> Result<Vec<PlaneInfo>> {
        let query: QueryBuffer = ioctl::querybuf(&self.fd, queue, index as usize).map_err(|e| {
            AppError::Allocation(format!("Failed to query buffer {}: {}", index, e))
        })?;
        Ok(query
            .planes
            .iter()
            .map(|p| PlaneInfo {
                offset: p.mem_offset,
                length: p.length,
            })
            .collect())
    }

    fn map_plane(&self, plane: &PlaneInfo) -> Result<Box<dyn PlaneMemory>> {
        let mapping = ioctl::mmap(&self.fd, plane.offset, plane.length).map_err(|e| {
            AppError::Allocation(format!("Failed to mmap offset {}: {}", plane.offset, e))
        })?;
        Ok(Box::new(MappedPlane(mapping)))
    }

    fn export_plane(&self, queue: QueueType, index: u32, plane: u32) -> Result<OwnedFd> {
        let mut req = unsafe { std::mem::zeroed::<v4l2_exportbuffer>() };
        req.type_ = queue as u32;
        req.index = index;
        req.plane = plane;
        req.flags = (libc::O_CLOEXEC | libc::O_RDWR) as u32;

        // SAFETY: `req` is a valid, initialised v4l2_exportbuffer.
        unsafe { raw::vidioc_expbuf(self.raw_fd(), &mut req) }.map_err(|e| {
            AppError::Allocation(format!("Failed to export buffer {}: {}", index, e))
        })?;
        // SAFETY: on success the kernel returned a fresh descriptor we now own.
        Ok(unsafe { OwnedFd::from_raw_fd(req.fd) })
    }

    fn queue_buffer(
        &self,
        queue: QueueType,
        memory: MemoryMode,
        index: u32,
        planes: &[QueuePlane],
    ) -> Result<()> {
        if planes.is_empty() || planes.len() > VIDEO_MAX_PLANES {
            return Err(AppError::Queue(format!(
                "invalid plane count {} for buffer {}",
                planes.len(),
                index
            )));
        }

        let mut raw_planes = unsafe { std::mem::zeroed::<[v4l2_plane; VIDEO_MAX_PLANES]>() };
        let mut buf = unsafe { std::mem::zeroed::<v4l2_buffer>() };
        buf.type_ = queue as u32;
        buf.memory = memory.as_raw();
        buf.index = index;

        if is_multiplanar(queue) {
            for (dst, src) in raw_planes.iter_mut().zip(planes) {
                dst.bytesused = src.bytes_used;
                dst.length = src.length;
                if let Some(fd) = src.dmabuf_fd {
                    dst.m.fd = fd;
                }
            }
            buf.length = planes.len() as u32;
            buf.m.planes = raw_planes.as_mut_ptr();
        } else {
            let plane = &planes[0];
            buf.bytesused = plane.bytes_used;
            buf.length = plane.length;
            if let Some(fd) = plane.dmabuf_fd {
                buf.m.fd = fd;
            }
        }

        // SAFETY: `buf` and the plane array it points to outlive the call.
        unsafe { raw::vidioc_qbuf(self.raw_fd(), &mut buf) }
            .map_err(|e| AppError::Queue(format!("buffer {}: {}", index, e)))?;
        Ok(())
    }

    fn dequeue_buffer(
        &self,
        queue: QueueType,
        memory: MemoryMode,
        num_planes: usize,
    ) -> Result<DequeuedBuffer> {
        let mut raw_planes = unsafe { std::mem::zeroed::<[v4l2_plane; VIDEO_MAX_PLANES]>() };
        let mut buf = unsafe { std::mem::zeroed::<v4l2_buffer>() };
        buf.type_ = queue as u32;
        buf.memory = memory.as_raw();

        let multiplanar = is_multiplanar(queue);
        if multiplanar {
            buf.length = num_planes.clamp(1, VIDEO_MAX_PLANES) as u32;
            buf.m.planes = raw_planes.as_mut_ptr();
        }

        // SAFETY: `buf` and the plane array it points to outlive the call.
        unsafe { raw::vidioc_dqbuf(self.raw_fd(), &mut buf) }.map_err(AppError::dequeue_errno)?;

        let (bytes_used, data_offsets) = if multiplanar {
            let count = (buf.length as usize).min(VIDEO_MAX_PLANES);
            raw_planes[..count]
                .iter()
                .map(|p| (p.bytesused, p.data_offset))
                .unzip()
        } else {
            (vec![buf.bytesused], vec![0])
        };

        Ok(DequeuedBuffer {
            index: buf.index,
            flags: buf.flags,
            sequence: buf.sequence,
            timestamp: Duration::new(
                buf.timestamp.tv_sec.max(0) as u64,
                (buf.timestamp.tv_usec.max(0) as u32).saturating_mul(1000),
            ),
            bytes_used,
            data_offsets,
        })
    }

    fn stream_on(&self, queue: QueueType) -> Result<()> {
        ioctl::streamon(&self.fd, queue)
            .map_err(|e| AppError::StreamControl(format!("Failed to start stream: {}", e)))
    }

    fn stream_off(&self, queue: QueueType) -> Result<()> {
        ioctl::streamoff(&self.fd, queue)
            .map_err(|e| AppError::StreamControl(format!("Failed to stop stream: {}", e)))
    }

    fn set_control(&self, id: u32, value: i32) -> Result<()> {
        let mut ctrl = v4l2_control { id, value };
        // SAFETY: `ctrl` is a valid v4l2_control.
        unsafe { raw::vidioc_s_ctrl(self.raw_fd(), &mut ctrl) }.map_err(|e| {
            AppError::Control(format!("control {:#x} = {}: {}", id, value, e))
        })?;
        Ok(())
    }

    fn set_frame_rate(&self, queue: QueueType, fps: u32) -> Result<()> {
        let fract = v4l2r::bindings::v4l2_fract {
            numerator: 1,
            denominator: fps,
        };
        let mut params = unsafe { std::mem::zeroed::<v4l2_streamparm>() };
        params.type_ = queue as u32;
        params.parm = match queue {
            QueueType::VideoOutput | QueueType::VideoOutputMplane => {
                v4l2_streamparm__bindgen_ty_1 {
                    output: v4l2r::bindings::v4l2_outputparm {
                        timeperframe: fract,
                        ..unsafe { std::mem::zeroed() }
                    },
                }
            }
            _ => v4l2_streamparm__bindgen_ty_1 {
                capture: v4l2r::bindings::v4l2_captureparm {
                    timeperframe: fract,
                    ..unsafe { std::mem::zeroed() }
                },
            },
        };

        let _actual: v4l2_streamparm = ioctl::s_parm(&self.fd, params)
            .map_err(|e| AppError::Control(format!("Failed to set FPS: {}", e)))?;
        Ok(())
    }

    fn subscribe_event(&self, kind: DeviceEventKind) -> Result<()> {
        let mut sub = unsafe { std::mem::zeroed::<v4l2_event_subscription>() };
        sub.type_ = kind.as_raw();
        // SAFETY: `sub` is a valid v4l2_event_subscription.
        unsafe { raw::vidioc_subscribe_event(self.raw_fd(), &sub) }.map_err(|e| {
            AppError::DeviceEvent(format!("Failed to subscribe {:?}: {}", kind, e))
        })?;
        Ok(())
    }

    fn dequeue_event(&self) -> Result<Option<DeviceEvent>> {
        let mut event = unsafe { std::mem::zeroed::<v4l2_event>() };
        // SAFETY: `event` is large enough for any v4l2_event payload.
        match unsafe { raw::vidioc_dqevent(self.raw_fd(), &mut event) } {
            Ok(_) => {}
            Err(Errno::ENOENT) => return Ok(None),
            Err(e) => {
                return Err(AppError::DeviceEvent(format!(
                    "Failed to dequeue event: {}",
                    e
                )))
            }
        }

        Ok(Some(match event.type_ {
            t if t == DeviceEventKind::EndOfStream.as_raw() => DeviceEvent::EndOfStream,
            t if t == DeviceEventKind::SourceChange.as_raw() => DeviceEvent::SourceChange {
                // SAFETY: the kernel fills `src_change` for source-change events.
                changes: unsafe { event.u.src_change.changes },
            },
            other => DeviceEvent::Other(other),
        }))
    }

    fn poll(&self, timeout: Duration) -> Result<Readiness> {
        let mut fds = [PollFd::new(
            self.fd.as_fd(),
            PollFlags::POLLIN | PollFlags::POLLOUT | PollFlags::POLLPRI,
        )];
        let timeout_ms = timeout.as_millis().min(u16::MAX as u128) as u16;

        match poll(&mut fds, PollTimeout::from(timeout_ms)) {
            Ok(0) | Err(Errno::EINTR) => Ok(Readiness::default()),
            Ok(_) => {
                let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                Ok(Readiness {
                    readable: revents.contains(PollFlags::POLLIN),
                    writable: revents.contains(PollFlags::POLLOUT),
                    priority: revents.contains(PollFlags::POLLPRI),
                    error: revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP),
                })
            }
            Err(e) => Err(AppError::Io(std::io::Error::from(e))),
        }
    }
}
