//! Buffer groups: one device queue and the buffers allocated on it
//!
//! Every slot carries an explicit [`SlotState`]. Plane memory is only handed
//! out while software owns the slot, so a buffer can never be touched while
//! the hardware may be writing into it.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::device::{
    DequeuedBuffer, DeviceFormat, Direction, MemoryMode, PlaneInfo, PlaneLayout, PlaneMemory,
    QueuePlane, QueueType, VideoDevice,
};
use super::format::{fourcc_str, Resolution};
use crate::error::{AppError, Result};

/// Who currently owns a buffer slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Allocated, owned by nobody, may be queued
    Free,
    /// Handed to the driver, must not be touched
    QueuedToHardware,
    /// Dequeued and held by software until released or requeued
    OwnedBySoftware,
}

struct Slot {
    state: SlotState,
    planes: Vec<PlaneInfo>,
    mappings: Vec<Box<dyn PlaneMemory>>,
    exported: Vec<OwnedFd>,
    bytes_used: Vec<u32>,
    data_offsets: Vec<u32>,
}

impl Slot {
    fn new(planes: Vec<PlaneInfo>) -> Self {
        let n = planes.len();
        Self {
            state: SlotState::Free,
            planes,
            mappings: Vec::new(),
            exported: Vec::new(),
            bytes_used: vec![0; n],
            data_offsets: vec![0; n],
        }
    }
}

/// One direction of a video device with its allocated buffers
pub struct BufferGroup {
    device: Arc<dyn VideoDevice>,
    direction: Direction,
    queue: QueueType,
    memory: MemoryMode,
    format: Option<DeviceFormat>,
    slots: Vec<Slot>,
    num_planes: usize,
    streaming: bool,
}

impl BufferGroup {
    /// Create a group, resolving the queue type from the device capabilities
    pub fn new(
        device: Arc<dyn VideoDevice>,
        direction: Direction,
        memory: MemoryMode,
    ) -> Result<Self> {
        let caps = device.capabilities()?;
        let queue = caps.queue_for(direction).map_err(|e| match e {
            AppError::DeviceOpen { reason, .. } => AppError::DeviceOpen {
                device: device.name().to_string(),
                reason,
            },
            other => other,
        })?;
        if !caps.streaming {
            warn!("{} does not advertise streaming I/O", device.name());
        }

        debug!(
            "Buffer group on {}: {:?} queue {:?}, memory {:?}",
            device.name(),
            direction,
            queue,
            memory
        );

        Ok(Self {
            device,
            direction,
            queue,
            memory,
            format: None,
            slots: Vec::new(),
            num_planes: 0,
            streaming: false,
        })
    }

    /// Negotiate width, height and pixel format on this queue.
    ///
    /// A request of `0x0` keeps the driver's current size and skips the
    /// mismatch check.
    pub fn negotiate_format(
        &mut self,
        resolution: Resolution,
        fourcc: [u8; 4],
    ) -> Result<DeviceFormat> {
        if !self.slots.is_empty() {
            return Err(AppError::InvalidState(
                "cannot change format while buffers are allocated".to_string(),
            ));
        }

        let current = self.device.get_format(self.queue)?;
        let (width, height) = if resolution.is_unspecified() {
            (current.width, current.height)
        } else {
            (resolution.width, resolution.height)
        };

        let request = DeviceFormat {
            width,
            height,
            fourcc,
            planes: current
                .planes
                .iter()
                .map(|_| PlaneLayout::default())
                .collect(),
        };
        self.device.set_format(self.queue, &request)?;
        let actual = self.device.get_format(self.queue)?;

        if !resolution.is_unspecified()
            && (actual.width != resolution.width || actual.height != resolution.height)
        {
            return Err(AppError::FormatMismatch {
                requested: resolution,
                actual: Resolution::new(actual.width, actual.height),
            });
        }
        if actual.fourcc != fourcc {
            warn!(
                "Driver adjusted pixel format on {}: requested {}, got {}",
                self.device.name(),
                fourcc_str(&fourcc),
                fourcc_str(&actual.fourcc)
            );
        }

        self.num_planes = actual.planes.len().max(1);
        info!(
            "Negotiated {:?} format on {}: {}x{} {} ({} plane(s), stride {})",
            self.direction,
            self.device.name(),
            actual.width,
            actual.height,
            fourcc_str(&actual.fourcc),
            self.num_planes,
            actual.stride()
        );
        self.format = Some(actual.clone());
        Ok(actual)
    }

    /// Request `count` buffers and map or export every plane.
    ///
    /// Returns the number the driver granted. On any failure everything
    /// allocated so far is released before the error is returned.
    pub fn allocate(&mut self, count: u32) -> Result<u32> {
        if !self.slots.is_empty() {
            return Err(AppError::InvalidState(format!(
                "{} buffers already allocated",
                self.slots.len()
            )));
        }

        let granted = self
            .device
            .request_buffers(self.queue, self.memory, count)?;
        if granted == 0 {
            return Err(AppError::Allocation(format!(
                "{} granted no buffers",
                self.device.name()
            )));
        }
        if granted < count {
            warn!(
                "{} granted {} of {} requested buffers",
                self.device.name(),
                granted,
                count
            );
        }

        for index in 0..granted {
            match self.setup_slot(index) {
                Ok(slot) => self.slots.push(slot),
                Err(e) => {
                    self.slots.clear();
                    if let Err(release) = self.device.request_buffers(self.queue, self.memory, 0)
                    {
                        warn!("Failed to release buffers after allocation error: {}", release);
                    }
                    return Err(e);
                }
            }
        }

        debug!(
            "Allocated {} {:?} buffer(s) on {}",
            granted,
            self.memory,
            self.device.name()
        );
        Ok(granted)
    }

    /// Query one buffer and map or export its planes. A partially set up slot
    /// is dropped on error, unmapping whatever was already mapped.
    fn setup_slot(&self, index: u32) -> Result<Slot> {
        let planes = self.device.query_buffer(self.queue, index)?;
        if planes.is_empty() {
            return Err(AppError::Allocation(format!(
                "driver returned zero planes for buffer {}",
                index
            )));
        }

        let mut slot = Slot::new(planes);
        if self.memory.is_mapped() {
            for plane in &slot.planes {
                let mapping = self.device.map_plane(plane)?;
                slot.mappings.push(mapping);
            }
        }
        if self.memory == MemoryMode::DmaBufExport {
            for plane in 0..slot.planes.len() {
                let fd = self.device.export_plane(self.queue, index, plane as u32)?;
                slot.exported.push(fd);
            }
        }
        Ok(slot)
    }

    fn slot(&self, index: u32) -> Result<&Slot> {
        self.slots
            .get(index as usize)
            .ok_or_else(|| AppError::InvalidState(format!("no buffer with index {}", index)))
    }

    fn slot_mut(&mut self, index: u32) -> Result<&mut Slot> {
        self.slots
            .get_mut(index as usize)
            .ok_or_else(|| AppError::InvalidState(format!("no buffer with index {}", index)))
    }

    fn submit(&mut self, index: u32, planes: Vec<QueuePlane>) -> Result<()> {
        let state = self.slot(index)?.state;
        if state == SlotState::QueuedToHardware {
            return Err(AppError::Queue(format!("buffer {} is already queued", index)));
        }

        self.device
            .queue_buffer(self.queue, self.memory, index, &planes)?;
        self.slot_mut(index)?.state = SlotState::QueuedToHardware;
        Ok(())
    }

    /// Queue a buffer using the payload sizes recorded by [`fill`](Self::fill).
    /// Capture buffers are queued empty.
    pub fn queue(&mut self, index: u32) -> Result<()> {
        let slot = self.slot(index)?;
        let output = self.direction == Direction::Output;
        let planes = slot
            .planes
            .iter()
            .zip(&slot.bytes_used)
            .map(|(plane, &used)| QueuePlane {
                bytes_used: if output { used } else { 0 },
                length: plane.length,
                dmabuf_fd: None,
            })
            .collect();
        self.submit(index, planes)
    }

    /// Queue an imported DMA-BUF handle into a slot of a DMA-BUF import group
    pub fn queue_imported(&mut self, index: u32, fd: RawFd, bytes_used: u32) -> Result<()> {
        if self.memory != MemoryMode::DmaBufImport {
            return Err(AppError::Queue(format!(
                "buffer group uses {:?} memory, not DMA-BUF import",
                self.memory
            )));
        }
        let slot = self.slot(index)?;
        let planes = slot
            .planes
            .iter()
            .enumerate()
            .map(|(i, plane)| QueuePlane {
                bytes_used: if i == 0 { bytes_used } else { 0 },
                length: plane.length.max(bytes_used),
                dmabuf_fd: Some(fd),
            })
            .collect();
        self.submit(index, planes)
    }

    /// Queue every free slot
    pub fn queue_all(&mut self) -> Result<()> {
        for index in 0..self.slots.len() as u32 {
            if self.slots[index as usize].state == SlotState::Free {
                self.queue(index)?;
            }
        }
        Ok(())
    }

    /// Dequeue the next completed buffer. The slot becomes software owned.
    pub fn dequeue(&mut self) -> Result<DequeuedBuffer> {
        let buf = self
            .device
            .dequeue_buffer(self.queue, self.memory, self.num_planes)?;

        let num_planes = self.num_planes;
        let slot = self.slots.get_mut(buf.index as usize).ok_or_else(|| {
            AppError::Dequeue {
                reason: format!("driver returned unknown buffer {}", buf.index),
                errno: None,
            }
        })?;
        if slot.state != SlotState::QueuedToHardware {
            return Err(AppError::Dequeue {
                reason: format!(
                    "driver returned buffer {} which was {:?}",
                    buf.index, slot.state
                ),
                errno: None,
            });
        }

        slot.state = SlotState::OwnedBySoftware;
        for plane in 0..num_planes.min(slot.planes.len()) {
            slot.bytes_used[plane] = buf.bytes_used.get(plane).copied().unwrap_or(0);
            slot.data_offsets[plane] = buf.data_offsets.get(plane).copied().unwrap_or(0);
        }
        Ok(buf)
    }

    /// Return a software-owned slot to the free pool without queueing it
    pub fn release(&mut self, index: u32) -> Result<()> {
        let slot = self.slot_mut(index)?;
        match slot.state {
            SlotState::OwnedBySoftware => {
                slot.state = SlotState::Free;
                Ok(())
            }
            SlotState::Free => Ok(()),
            SlotState::QueuedToHardware => Err(AppError::InvalidState(format!(
                "buffer {} is queued to hardware",
                index
            ))),
        }
    }

    fn mapping(&self, index: u32, plane: usize) -> Result<&dyn PlaneMemory> {
        let slot = self.slot(index)?;
        if slot.state == SlotState::QueuedToHardware {
            return Err(AppError::InvalidState(format!(
                "buffer {} is queued to hardware",
                index
            )));
        }
        slot.mappings
            .get(plane)
            .map(|m| m.as_ref())
            .ok_or_else(|| AppError::InvalidState(format!("buffer {} plane {} is not mapped", index, plane)))
    }

    /// Whole mapped plane
    pub fn plane_data(&self, index: u32, plane: usize) -> Result<&[u8]> {
        Ok(self.mapping(index, plane)?.as_slice())
    }

    /// Writable mapped plane
    pub fn plane_data_mut(&mut self, index: u32, plane: usize) -> Result<&mut [u8]> {
        let slot = self.slot_mut(index)?;
        if slot.state == SlotState::QueuedToHardware {
            return Err(AppError::InvalidState(format!(
                "buffer {} is queued to hardware",
                index
            )));
        }
        slot.mappings
            .get_mut(plane)
            .map(|m| m.as_mut_slice())
            .ok_or_else(|| AppError::InvalidState(format!("buffer {} plane {} is not mapped", index, plane)))
    }

    /// Valid payload of a dequeued plane (data offset up to bytes used)
    pub fn plane_payload(&self, index: u32, plane: usize) -> Result<&[u8]> {
        let data = self.plane_data(index, plane)?;
        let slot = self.slot(index)?;
        let end = (slot.bytes_used[plane] as usize).min(data.len());
        let start = (slot.data_offsets[plane] as usize).min(end);
        Ok(&data[start..end])
    }

    /// Copy `data` into a plane and record its size for the next queue.
    /// Returns the number of bytes copied, which is less than `data.len()`
    /// when the plane is too small.
    pub fn fill(&mut self, index: u32, plane: usize, data: &[u8]) -> Result<usize> {
        let dst = self.plane_data_mut(index, plane)?;
        let n = data.len().min(dst.len());
        dst[..n].copy_from_slice(&data[..n]);
        self.slot_mut(index)?.bytes_used[plane] = n as u32;
        Ok(n)
    }

    /// Exported DMA-BUF handle of a plane, if this group exports
    pub fn exported_fd(&self, index: u32, plane: usize) -> Option<RawFd> {
        self.slots
            .get(index as usize)
            .and_then(|s| s.exported.get(plane))
            .map(|fd| fd.as_raw_fd())
    }

    pub fn stream_on(&mut self) -> Result<()> {
        self.device.stream_on(self.queue)?;
        self.streaming = true;
        Ok(())
    }

    /// Stop streaming. The driver drops every queued buffer, so queued slots
    /// become free again.
    pub fn stream_off(&mut self) -> Result<()> {
        self.device.stream_off(self.queue)?;
        self.streaming = false;
        for slot in &mut self.slots {
            if slot.state == SlotState::QueuedToHardware {
                slot.state = SlotState::Free;
            }
        }
        Ok(())
    }

    /// Unmap, close exported handles and release all buffers. Idempotent.
    pub fn deallocate(&mut self) -> Result<()> {
        if self.streaming {
            if let Err(e) = self.stream_off() {
                warn!("Stream off before deallocation failed: {}", e);
                self.streaming = false;
            }
        }
        if self.slots.is_empty() {
            return Ok(());
        }

        let count = self.slots.len();
        self.slots.clear();
        self.device
            .request_buffers(self.queue, self.memory, 0)?;
        debug!("Released {} buffer(s) on {}", count, self.device.name());
        Ok(())
    }

    pub fn state(&self, index: u32) -> Option<SlotState> {
        self.slots.get(index as usize).map(|s| s.state)
    }

    pub fn count_in(&self, state: SlotState) -> usize {
        self.slots.iter().filter(|s| s.state == state).count()
    }

    pub fn num_buffers(&self) -> usize {
        self.slots.len()
    }

    pub fn num_planes(&self) -> usize {
        self.num_planes
    }

    pub fn format(&self) -> Option<&DeviceFormat> {
        self.format.as_ref()
    }

    pub fn queue_type(&self) -> QueueType {
        self.queue
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn memory(&self) -> MemoryMode {
        self.memory
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn device(&self) -> &Arc<dyn VideoDevice> {
        &self.device
    }
}

impl Drop for BufferGroup {
    fn drop(&mut self) {
        if let Err(e) = self.deallocate() {
            warn!("Failed to release buffers on {}: {}", self.device.name(), e);
        }
    }
}
