//! Scripted in-memory video device for tests

use std::collections::VecDeque;
use std::fs::File;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use parking_lot::{Condvar, Mutex};

use super::device::{
    DequeuedBuffer, DeviceCaps, DeviceEvent, DeviceEventKind, DeviceFormat, MemoryMode,
    PlaneInfo, PlaneLayout, PlaneMemory, QueuePlane, QueueType, Readiness, VideoDevice,
};
use super::format::{PixelFormat, Resolution};
use super::frame::BUF_FLAG_KEYFRAME;
use crate::error::{AppError, Result};

const CAPTURE: usize = 0;
const OUTPUT: usize = 1;

fn side(queue: QueueType) -> usize {
    match queue {
        QueueType::VideoOutput | QueueType::VideoOutputMplane => OUTPUT,
        _ => CAPTURE,
    }
}

struct FakePlane {
    data: Vec<u8>,
    live: Arc<AtomicUsize>,
}

impl PlaneMemory for FakePlane {
    fn as_slice(&self) -> &[u8] {
        &self.data
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for FakePlane {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct Side {
    format: Option<DeviceFormat>,
    allocated: u32,
    queued: VecDeque<u32>,
    completed: VecDeque<u32>,
    streaming: bool,
    sequence: u32,
    last_queued_bytes: Option<u32>,
}

#[derive(Default)]
struct State {
    sides: [Side; 2],
    size_override: Option<(u32, u32)>,
    stride_override: Option<u32>,
    grant_limit: Option<u32>,
    fail_map_at: Option<usize>,
    map_calls: usize,
    frames: VecDeque<u32>,
    dequeue_errors: VecDeque<Errno>,
    events: VecDeque<DeviceEvent>,
    subscribed: Vec<DeviceEventKind>,
    controls: Vec<(u32, i32)>,
    fps: Option<u32>,
    hold: bool,
    swap_outputs: bool,
    stall_capture: bool,
    stalled: usize,
}

/// In-memory stand-in for a V4L2 node.
///
/// A capture device delivers one buffer per [`push_frame`](Self::push_frame).
/// An M2M device pairs the oldest queued output buffer with the oldest
/// queued capture buffer whenever both sides are streaming.
pub struct FakeDevice {
    caps: DeviceCaps,
    planes: usize,
    live: Arc<AtomicUsize>,
    state: Mutex<State>,
    wake: Condvar,
}

impl FakeDevice {
    fn with_caps(caps: DeviceCaps, planes: usize) -> Self {
        Self {
            caps,
            planes,
            live: Arc::new(AtomicUsize::new(0)),
            state: Mutex::new(State::default()),
            wake: Condvar::new(),
        }
    }

    pub fn capture() -> Self {
        Self::with_caps(
            DeviceCaps {
                capture: true,
                streaming: true,
                ..Default::default()
            },
            1,
        )
    }

    pub fn capture_mplane(planes: usize) -> Self {
        Self::with_caps(
            DeviceCaps {
                capture: true,
                multiplanar: true,
                streaming: true,
                ..Default::default()
            },
            planes,
        )
    }

    pub fn m2m() -> Self {
        Self::with_caps(
            DeviceCaps {
                m2m: true,
                streaming: true,
                ..Default::default()
            },
            1,
        )
    }

    /// The driver answers every capture-side format request with this size
    pub fn force_size(&self, width: u32, height: u32) {
        self.state.lock().size_override = Some((width, height));
    }

    pub fn force_stride(&self, stride: u32) {
        self.state.lock().stride_override = Some(stride);
    }

    pub fn limit_grant(&self, count: u32) {
        self.state.lock().grant_limit = Some(count);
    }

    /// Fail the n-th (0-based) map call
    pub fn fail_map_at(&self, call: usize) {
        self.state.lock().fail_map_at = Some(call);
    }

    pub fn push_frame(&self, flags: u32) {
        self.state.lock().frames.push_back(flags);
    }

    pub fn clear_frames(&self) {
        self.state.lock().frames.clear();
    }

    pub fn push_dequeue_error(&self, errno: Errno) {
        self.state.lock().dequeue_errors.push_back(errno);
    }

    pub fn push_event(&self, event: DeviceEvent) {
        self.state.lock().events.push_back(event);
    }

    /// Stop pairing M2M buffers until released
    pub fn hold(&self, hold: bool) {
        self.state.lock().hold = hold;
    }

    /// Complete M2M output buffers out of order
    pub fn swap_outputs(&self, swap: bool) {
        self.state.lock().swap_outputs = swap;
    }

    /// Report the capture side ready but block its dequeues, like a driver
    /// that sleeps in DQBUF. Blocked calls return once the queue stops
    /// streaming or the stall is lifted.
    pub fn stall_capture(&self, stall: bool) {
        self.state.lock().stall_capture = stall;
        self.wake.notify_all();
    }

    /// Dequeue calls currently blocked by [`stall_capture`](Self::stall_capture)
    pub fn stalled_dequeues(&self) -> usize {
        self.state.lock().stalled
    }

    pub fn live_mappings(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn allocated(&self, queue: QueueType) -> u32 {
        self.state.lock().sides[side(queue)].allocated
    }

    pub fn is_streaming(&self, queue: QueueType) -> bool {
        self.state.lock().sides[side(queue)].streaming
    }

    pub fn queued(&self, queue: QueueType) -> usize {
        self.state.lock().sides[side(queue)].queued.len()
    }

    pub fn last_queued_bytes(&self, queue: QueueType) -> Option<u32> {
        self.state.lock().sides[side(queue)].last_queued_bytes
    }

    pub fn controls(&self) -> Vec<(u32, i32)> {
        self.state.lock().controls.clone()
    }

    pub fn fps(&self) -> Option<u32> {
        self.state.lock().fps
    }

    pub fn subscribed(&self) -> Vec<DeviceEventKind> {
        self.state.lock().subscribed.clone()
    }

    fn layout(&self, width: u32, height: u32, fourcc: [u8; 4], stride: Option<u32>) -> DeviceFormat {
        let resolution = Resolution::new(width, height);
        let format = PixelFormat::from_fourcc(&fourcc);
        let total = format
            .and_then(|f| f.frame_size(resolution))
            .unwrap_or((width * height * 3 / 2) as usize)
            .max(1) as u32;
        let bytesperline = stride.unwrap_or_else(|| {
            format
                .and_then(|f| f.bytes_per_pixel())
                .map(|bpp| width * bpp as u32)
                .unwrap_or(width)
        });
        let per_plane = (total / self.planes as u32).max(1);

        DeviceFormat {
            width,
            height,
            fourcc,
            planes: (0..self.planes)
                .map(|_| PlaneLayout {
                    bytesperline,
                    sizeimage: per_plane,
                })
                .collect(),
        }
    }

    fn pair_m2m(state: &mut State) {
        if !pairing_possible(state) {
            return;
        }
        while !state.sides[OUTPUT].queued.is_empty() && !state.sides[CAPTURE].queued.is_empty() {
            if let (Some(out), Some(cap)) = (
                state.sides[OUTPUT].queued.pop_front(),
                state.sides[CAPTURE].queued.pop_front(),
            ) {
                state.sides[OUTPUT].completed.push_back(out);
                state.sides[CAPTURE].completed.push_back(cap);
            }
        }
        if state.swap_outputs && state.sides[OUTPUT].completed.len() >= 2 {
            state.sides[OUTPUT].completed.swap(0, 1);
            state.swap_outputs = false;
        }
    }
}

fn pairing_possible(state: &State) -> bool {
    !state.hold && state.sides[OUTPUT].streaming && state.sides[CAPTURE].streaming
}

impl VideoDevice for FakeDevice {
    fn name(&self) -> &str {
        "fake"
    }

    fn capabilities(&self) -> Result<DeviceCaps> {
        Ok(self.caps.clone())
    }

    fn get_format(&self, queue: QueueType) -> Result<DeviceFormat> {
        let state = self.state.lock();
        if let Some(fmt) = &state.sides[side(queue)].format {
            return Ok(fmt.clone());
        }
        let (w, h) = match side(queue) {
            CAPTURE => state.size_override.unwrap_or((640, 480)),
            _ => (640, 480),
        };
        Ok(self.layout(w, h, *b"YUYV", None))
    }

    fn set_format(&self, queue: QueueType, format: &DeviceFormat) -> Result<DeviceFormat> {
        let mut state = self.state.lock();
        let s = side(queue);
        let (w, h) = match (s, state.size_override) {
            (CAPTURE, Some(size)) => size,
            _ => (format.width, format.height),
        };
        let stride = if s == CAPTURE { state.stride_override } else { None };
        let actual = self.layout(w, h, format.fourcc, stride);
        state.sides[s].format = Some(actual.clone());
        Ok(actual)
    }

    fn request_buffers(&self, queue: QueueType, _memory: MemoryMode, count: u32) -> Result<u32> {
        let mut state = self.state.lock();
        let granted = state.grant_limit.map(|l| l.min(count)).unwrap_or(count);
        let s = &mut state.sides[side(queue)];
        s.allocated = granted;
        s.queued.clear();
        s.completed.clear();
        Ok(granted)
    }

    fn query_buffer(&self, queue: QueueType, index: u32) -> Result<Vec<PlaneInfo>> {
        let state = self.state.lock();
        let s = &state.sides[side(queue)];
        if index >= s.allocated {
            return Err(AppError::Allocation(format!("no buffer {}", index)));
        }
        let fmt = match &s.format {
            Some(fmt) => fmt.clone(),
            None => self.layout(640, 480, *b"YUYV", None),
        };
        Ok(fmt
            .planes
            .iter()
            .enumerate()
            .map(|(plane, layout)| PlaneInfo {
                offset: (index * 16 + plane as u32) * 4096,
                length: layout.sizeimage,
            })
            .collect())
    }

    fn map_plane(&self, plane: &PlaneInfo) -> Result<Box<dyn PlaneMemory>> {
        let mut state = self.state.lock();
        let call = state.map_calls;
        state.map_calls += 1;
        if state.fail_map_at == Some(call) {
            return Err(AppError::Allocation(format!(
                "mmap of offset {} failed",
                plane.offset
            )));
        }
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakePlane {
            data: vec![0; plane.length as usize],
            live: self.live.clone(),
        }))
    }

    fn export_plane(&self, _queue: QueueType, _index: u32, _plane: u32) -> Result<OwnedFd> {
        Ok(File::open("/dev/null")?.into())
    }

    fn queue_buffer(
        &self,
        queue: QueueType,
        _memory: MemoryMode,
        index: u32,
        planes: &[QueuePlane],
    ) -> Result<()> {
        let mut state = self.state.lock();
        let s = &mut state.sides[side(queue)];
        if index >= s.allocated {
            return Err(AppError::Queue(format!("no buffer {}", index)));
        }
        s.last_queued_bytes = planes.first().map(|p| p.bytes_used);
        s.queued.push_back(index);
        Ok(())
    }

    fn dequeue_buffer(
        &self,
        queue: QueueType,
        _memory: MemoryMode,
        num_planes: usize,
    ) -> Result<DequeuedBuffer> {
        let mut state = self.state.lock();
        if let Some(errno) = state.dequeue_errors.pop_front() {
            return Err(AppError::dequeue_errno(errno));
        }

        let s = side(queue);
        if s == CAPTURE && state.stall_capture {
            state.stalled += 1;
            while state.stall_capture && state.sides[CAPTURE].streaming {
                self.wake.wait(&mut state);
            }
            state.stalled -= 1;
            if !state.sides[CAPTURE].streaming {
                return Err(AppError::dequeue_errno(Errno::EINVAL));
            }
        }

        let (index, flags) = if self.caps.m2m {
            Self::pair_m2m(&mut state);
            let flags = if s == CAPTURE { BUF_FLAG_KEYFRAME } else { 0 };
            match state.sides[s].completed.pop_front() {
                Some(index) => (index, flags),
                None => return Err(AppError::dequeue_errno(Errno::EAGAIN)),
            }
        } else {
            if !state.sides[s].streaming || state.frames.is_empty() {
                return Err(AppError::dequeue_errno(Errno::EAGAIN));
            }
            match state.sides[s].queued.pop_front() {
                Some(index) => (index, state.frames.pop_front().unwrap_or(0)),
                None => return Err(AppError::dequeue_errno(Errno::EAGAIN)),
            }
        };

        let sd = &mut state.sides[s];
        sd.sequence += 1;
        let sizes: Vec<u32> = sd
            .format
            .as_ref()
            .map(|f| f.planes.iter().map(|p| p.sizeimage).collect())
            .unwrap_or_default();
        let count = num_planes.max(1);

        Ok(DequeuedBuffer {
            index,
            flags,
            sequence: sd.sequence,
            timestamp: Duration::from_millis(sd.sequence as u64 * 33),
            bytes_used: (0..count).map(|i| sizes.get(i).copied().unwrap_or(0)).collect(),
            data_offsets: vec![0; count],
        })
    }

    fn stream_on(&self, queue: QueueType) -> Result<()> {
        self.state.lock().sides[side(queue)].streaming = true;
        Ok(())
    }

    fn stream_off(&self, queue: QueueType) -> Result<()> {
        let mut state = self.state.lock();
        let s = &mut state.sides[side(queue)];
        s.streaming = false;
        s.queued.clear();
        s.completed.clear();
        drop(state);
        self.wake.notify_all();
        Ok(())
    }

    fn set_control(&self, id: u32, value: i32) -> Result<()> {
        self.state.lock().controls.push((id, value));
        Ok(())
    }

    fn set_frame_rate(&self, _queue: QueueType, fps: u32) -> Result<()> {
        self.state.lock().fps = Some(fps);
        Ok(())
    }

    fn subscribe_event(&self, kind: DeviceEventKind) -> Result<()> {
        self.state.lock().subscribed.push(kind);
        Ok(())
    }

    fn dequeue_event(&self) -> Result<Option<DeviceEvent>> {
        Ok(self.state.lock().events.pop_front())
    }

    fn poll(&self, timeout: Duration) -> Result<Readiness> {
        let readiness = {
            let mut state = self.state.lock();
            if self.caps.m2m {
                Self::pair_m2m(&mut state);
            }
            let readable = if !state.dequeue_errors.is_empty() || state.stall_capture {
                true
            } else if self.caps.m2m {
                !state.sides[CAPTURE].completed.is_empty()
            } else {
                let cap = &state.sides[CAPTURE];
                cap.streaming && !cap.queued.is_empty() && !state.frames.is_empty()
            };
            Readiness {
                readable,
                writable: self.caps.m2m && !state.sides[OUTPUT].completed.is_empty(),
                priority: !state.events.is_empty(),
                error: false,
            }
        };

        if readiness.is_timeout() {
            std::thread::sleep(timeout.min(Duration::from_millis(2)));
        }
        Ok(readiness)
    }
}
