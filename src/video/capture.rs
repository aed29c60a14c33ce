//! V4L2 video capture engine
//!
//! A dedicated thread polls the device, lifts each dequeued buffer into a
//! [`FrameBuffer`], fans it out on a broadcast channel and requeues the buffer
//! right away. A transform that imports the buffer's DMA-BUF handle borrows
//! the buffer instead; it goes back to the driver once the transform has read
//! it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use super::buffer::{BufferGroup, SlotState};
use super::codec::{CodecPipeline, ResultCallback};
use super::device::{controls, Direction, MemoryMode, VideoDevice};
use super::format::{PixelFormat, Resolution};
use super::frame::{FrameBuffer, BUF_FLAG_KEYFRAME};
use super::v4l2::open_device;
use crate::error::{AppError, Result};
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Default number of capture buffers
const DEFAULT_BUFFER_COUNT: u32 = 4;
/// Bounded readiness wait; also the worst-case stop latency
const POLL_TIMEOUT: Duration = Duration::from_millis(200);
/// Broadcast capacity; slow subscribers lose the oldest frames
const FRAME_CHANNEL_CAPACITY: usize = 8;
/// Back-off while every buffer is lent to the transform
const LENT_WAIT: Duration = Duration::from_millis(5);

/// Video capture configuration
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Device path
    pub device_path: PathBuf,
    /// Desired resolution
    pub resolution: Resolution,
    /// Desired pixel format
    pub format: PixelFormat,
    /// Desired frame rate (0 = leave driver default)
    pub fps: u32,
    /// Number of capture buffers
    pub buffer_count: u32,
    /// Rotation in degrees, applied when nonzero
    pub rotation: i32,
    /// Target bitrate for H.264 sources
    pub bitrate: u32,
    /// Export DMA-BUF handles alongside the mapping
    pub dma_export: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from("/dev/video0"),
            resolution: Resolution::VGA,
            format: PixelFormat::Yuyv,
            fps: 30,
            buffer_count: DEFAULT_BUFFER_COUNT,
            rotation: 0,
            bitrate: 10_000_000,
            dma_export: false,
        }
    }
}

impl CaptureConfig {
    /// Create config for a specific device
    pub fn for_device(path: impl AsRef<Path>) -> Self {
        Self {
            device_path: path.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    /// Set resolution
    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = Resolution::new(width, height);
        self
    }

    /// Set format
    pub fn with_format(mut self, format: PixelFormat) -> Self {
        self.format = format;
        self
    }

    /// Set frame rate
    pub fn with_fps(mut self, fps: u32) -> Self {
        self.fps = fps;
        self
    }

    pub fn with_buffer_count(mut self, count: u32) -> Self {
        self.buffer_count = count;
        self
    }

    pub fn with_rotation(mut self, degrees: i32) -> Self {
        self.rotation = degrees;
        self
    }
}

/// Capture counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    /// Frames lifted off the device
    pub frames_captured: u64,
    /// Frames dropped while waiting for the first keyframe
    pub frames_dropped: u64,
}

/// Video capture state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// Not started, or stopped
    Stopped,
    /// Running and capturing
    Running,
    /// The loop hit a fatal error and exited
    Error,
}

/// Negotiated stream parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    pub resolution: Resolution,
    pub format: PixelFormat,
    pub stride: u32,
}

struct Shared {
    frames: broadcast::Sender<FrameBuffer>,
    latest: ArcSwapOption<FrameBuffer>,
    pending_controls: Mutex<Vec<(u32, i32)>>,
    transform: ArcSwapOption<CodecPipeline>,
    /// Lent buffers the transform has finished reading
    returned: Arc<Mutex<Vec<u32>>>,
    stop_flag: AtomicBool,
    frames_captured: AtomicU64,
    frames_dropped: AtomicU64,
}

impl Shared {
    /// Returns `true` when the transform borrowed buffer `index`. It then
    /// stays out of the queue until it shows up in `returned`.
    fn publish(&self, frame: FrameBuffer, index: u32) -> bool {
        self.latest.store(Some(Arc::new(frame.clone())));

        let Some(codec) = self.transform.load_full() else {
            let _ = self.frames.send(frame);
            return false;
        };

        let frames = self.frames.clone();
        let on_result: ResultCallback = Box::new(move |out| {
            let _ = frames.send(out);
        });
        if codec.imports_dma_buf() && frame.dma_fd.is_some() {
            let returned = self.returned.clone();
            codec.emplace_buffer_holding(
                &frame,
                on_result,
                Box::new(move || returned.lock().push(index)),
            )
        } else {
            codec.emplace_buffer(&frame, on_result);
            false
        }
    }

    fn requeue_returned(&self, group: &mut BufferGroup, throttler: &LogThrottler) {
        let returned = std::mem::take(&mut *self.returned.lock());
        for index in returned {
            if group.state(index) == Some(SlotState::OwnedBySoftware) {
                requeue(group, index, throttler);
            }
        }
    }

    /// Apply queued control updates; repeated ids keep only the last value
    fn apply_pending_controls(&self, device: &dyn VideoDevice) {
        let pending = std::mem::take(&mut *self.pending_controls.lock());
        if pending.is_empty() {
            return;
        }

        let mut merged: Vec<(u32, i32)> = Vec::with_capacity(pending.len());
        for (id, value) in pending {
            match merged.iter_mut().find(|(existing, _)| *existing == id) {
                Some(entry) => entry.1 = value,
                None => merged.push((id, value)),
            }
        }
        for (id, value) in merged {
            match device.set_control(id, value) {
                Ok(()) => debug!("Control {:#x} set to {}", id, value),
                Err(e) => warn!("{}", e),
            }
        }
    }
}

/// Continuous capture from one video device
pub struct CaptureEngine {
    config: CaptureConfig,
    device: Arc<dyn VideoDevice>,
    info: StreamInfo,
    shared: Arc<Shared>,
    state: Arc<watch::Sender<CaptureState>>,
    state_rx: watch::Receiver<CaptureState>,
    /// Buffer group while the loop is not running
    parked: Mutex<Option<BufferGroup>>,
    worker: Mutex<Option<JoinHandle<BufferGroup>>>,
}

impl CaptureEngine {
    /// Open the configured device and bring it to streaming.
    ///
    /// Any failure here is a startup failure and is not retried.
    pub fn open(config: CaptureConfig) -> Result<Self> {
        let device: Arc<dyn VideoDevice> = Arc::new(open_device(&config.device_path)?);
        Self::with_device(device, config)
    }

    /// Configure an already opened device
    pub fn with_device(device: Arc<dyn VideoDevice>, config: CaptureConfig) -> Result<Self> {
        info!(
            "Opening capture on {:?} at {} {}",
            config.device_path, config.resolution, config.format
        );

        let memory = if config.dma_export {
            MemoryMode::DmaBufExport
        } else {
            MemoryMode::Mmap
        };
        let mut group = BufferGroup::new(device.clone(), Direction::Capture, memory)?;
        let actual = group.negotiate_format(config.resolution, config.format.to_fourcc())?;

        let format = PixelFormat::from_fourcc(&actual.fourcc).unwrap_or(config.format);
        let stride = actual.stride();
        if let Some(bpp) = format.bytes_per_pixel() {
            let row = actual.width * bpp as u32;
            if stride < row {
                return Err(AppError::InvalidState(format!(
                    "stride {} is shorter than a {} byte row of {}x{} {}",
                    stride, row, actual.width, actual.height, format
                )));
            }
        }

        if config.fps > 0 {
            if let Err(e) = device.set_frame_rate(group.queue_type(), config.fps) {
                warn!("Failed to set {} fps: {}", config.fps, e);
            }
        }
        apply_startup_controls(device.as_ref(), &config, format);

        group.allocate(config.buffer_count)?;
        group.queue_all()?;
        group.stream_on()?;

        let info = StreamInfo {
            resolution: Resolution::new(actual.width, actual.height),
            format,
            stride,
        };
        info!(
            "Capture format: {} {} stride={}",
            info.resolution, info.format, info.stride
        );

        let (frames, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(CaptureState::Stopped);

        Ok(Self {
            config,
            device,
            info,
            shared: Arc::new(Shared {
                frames,
                latest: ArcSwapOption::empty(),
                pending_controls: Mutex::new(Vec::new()),
                transform: ArcSwapOption::empty(),
                returned: Arc::new(Mutex::new(Vec::new())),
                stop_flag: AtomicBool::new(false),
                frames_captured: AtomicU64::new(0),
                frames_dropped: AtomicU64::new(0),
            }),
            state: Arc::new(state_tx),
            state_rx,
            parked: Mutex::new(Some(group)),
            worker: Mutex::new(None),
        })
    }

    /// Get current capture state
    pub fn state(&self) -> CaptureState {
        *self.state_rx.borrow()
    }

    /// Subscribe to state changes
    pub fn state_watch(&self) -> watch::Receiver<CaptureState> {
        self.state_rx.clone()
    }

    /// Subscribe to captured (or transformed) frames
    pub fn subscribe(&self) -> broadcast::Receiver<FrameBuffer> {
        self.shared.frames.subscribe()
    }

    /// Most recent raw frame from the device
    pub fn latest_frame(&self) -> Option<Arc<FrameBuffer>> {
        self.shared.latest.load_full()
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            frames_captured: self.shared.frames_captured.load(Ordering::Relaxed),
            frames_dropped: self.shared.frames_dropped.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn stream_info(&self) -> StreamInfo {
        self.info
    }

    /// Route every captured frame through a hardware transform
    pub fn attach_transform(&self, codec: Arc<CodecPipeline>) {
        self.shared.transform.store(Some(codec));
    }

    pub fn detach_transform(&self) -> Option<Arc<CodecPipeline>> {
        self.shared.transform.swap(None)
    }

    /// Queue a control update for the next capture cycle
    pub fn set_control(&self, id: u32, value: i32) {
        self.shared.pending_controls.lock().push((id, value));
    }

    /// Start the capture thread
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        let mut group = self
            .parked
            .lock()
            .take()
            .ok_or_else(|| AppError::InvalidState("capture buffers are gone".to_string()))?;
        if !group.is_streaming() {
            group.queue_all()?;
            group.stream_on()?;
        }

        self.shared.stop_flag.store(false, Ordering::SeqCst);
        let _ = self.state.send(CaptureState::Running);

        let shared = self.shared.clone();
        let state = self.state.clone();
        let info = self.info;
        let spawned = std::thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || capture_loop(group, info, shared, state));
        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                info!("Capture started on {}", self.device.name());
                Ok(())
            }
            Err(e) => {
                let _ = self.state.send(CaptureState::Error);
                Err(e.into())
            }
        }
    }

    /// Stop the capture thread and stream off. `start()` resumes.
    pub fn stop(&self) {
        self.shared.stop_flag.store(true, Ordering::SeqCst);

        if let Some(handle) = self.worker.lock().take() {
            match handle.join() {
                Ok(mut group) => {
                    if let Err(e) = group.stream_off() {
                        warn!("Stream off failed: {}", e);
                    }
                    *self.parked.lock() = Some(group);
                }
                Err(_) => error!("Capture thread panicked"),
            }
        }

        if self.state() == CaptureState::Running {
            let _ = self.state.send(CaptureState::Stopped);
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == CaptureState::Running
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        self.stop();
        if let Some(mut group) = self.parked.lock().take() {
            if let Err(e) = group.deallocate() {
                warn!("Failed to release capture buffers: {}", e);
            }
        }
    }
}

fn apply_startup_controls(device: &dyn VideoDevice, config: &CaptureConfig, format: PixelFormat) {
    let mut wanted: Vec<(u32, i32)> = Vec::new();

    if format == PixelFormat::H264 {
        wanted.extend([
            (controls::BITRATE_MODE, controls::BITRATE_MODE_VBR),
            (controls::H264_PROFILE, controls::H264_PROFILE_HIGH),
            (controls::REPEAT_SEQ_HEADER, 1),
            (controls::H264_LEVEL, controls::H264_LEVEL_4_0),
            (controls::H264_I_PERIOD, 60),
            (controls::BITRATE, config.bitrate.min(i32::MAX as u32) as i32),
            (controls::FORCE_KEY_FRAME, 1),
        ]);
    } else if !format.is_compressed() {
        wanted.extend([
            (controls::EXPOSURE_AUTO, controls::EXPOSURE_AUTO_ON),
            (controls::AUTO_WHITE_BALANCE, 1),
            (controls::AUTOGAIN, 1),
        ]);
    }
    if config.rotation != 0 {
        wanted.push((controls::ROTATE, config.rotation));
    }

    for (id, value) in wanted {
        if let Err(e) = device.set_control(id, value) {
            debug!("Startup control not applied: {}", e);
        }
    }
}

/// Runs on the capture thread. Hands the buffer group back on exit so the
/// engine can stream it off or restart it.
fn capture_loop(
    mut group: BufferGroup,
    info: StreamInfo,
    shared: Arc<Shared>,
    state: Arc<watch::Sender<CaptureState>>,
) -> BufferGroup {
    match run_capture(&mut group, info, &shared) {
        Ok(()) => debug!("Capture loop exited"),
        Err(e) => {
            error!("Capture stopped on {}: {}", group.device().name(), e);
            let _ = state.send(CaptureState::Error);
        }
    }
    group
}

fn run_capture(group: &mut BufferGroup, info: StreamInfo, shared: &Shared) -> Result<()> {
    let device = group.device().clone();
    let throttler = LogThrottler::with_secs(5);
    let mut seen_keyframe = !info.format.needs_keyframe();

    while !shared.stop_flag.load(Ordering::Relaxed) {
        shared.apply_pending_controls(device.as_ref());
        shared.requeue_returned(group, &throttler);
        if group.count_in(SlotState::QueuedToHardware) == 0 {
            std::thread::sleep(LENT_WAIT);
            continue;
        }

        let readiness = match device.poll(POLL_TIMEOUT) {
            Ok(r) => r,
            Err(e) => {
                warn_throttled!(throttler, "capture_poll", "Capture poll failed: {}", e);
                continue;
            }
        };
        if !readiness.readable {
            if readiness.error {
                warn_throttled!(throttler, "capture_pollerr", "Capture device reported an error");
            }
            continue;
        }

        let buf = match group.dequeue() {
            Ok(buf) => buf,
            Err(e) if e.is_fatal_dequeue() => return Err(e),
            Err(e) => {
                warn_throttled!(throttler, "capture_dequeue", "Capture dequeue failed: {}", e);
                continue;
            }
        };
        shared.frames_captured.fetch_add(1, Ordering::Relaxed);

        if !seen_keyframe && buf.flags & BUF_FLAG_KEYFRAME != 0 {
            info!("First keyframe at sequence {}", buf.sequence);
            seen_keyframe = true;
        }

        let lent = if seen_keyframe {
            match lift_frame(group, buf.index, info) {
                Ok(frame) => shared.publish(
                    frame
                        .with_flags(buf.flags)
                        .with_timestamp(buf.timestamp)
                        .with_sequence(buf.sequence as u64)
                        .with_dma_fd(group.exported_fd(buf.index, 0)),
                    buf.index,
                ),
                Err(e) => {
                    warn_throttled!(throttler, "capture_lift", "Dropping frame: {}", e);
                    false
                }
            }
        } else {
            shared.frames_dropped.fetch_add(1, Ordering::Relaxed);
            debug!("Dropping frame {} before first keyframe", buf.sequence);
            false
        };

        if !lent {
            requeue(group, buf.index, &throttler);
        }
    }

    Ok(())
}

fn requeue(group: &mut BufferGroup, index: u32, throttler: &LogThrottler) {
    if let Err(e) = group.queue(index) {
        warn_throttled!(
            throttler,
            "capture_queue",
            "Failed to requeue buffer {}: {}",
            index,
            e
        );
        if let Err(e) = group.release(index) {
            warn!("Capture buffer {} left unusable: {}", index, e);
        }
    }
}

fn lift_frame(group: &BufferGroup, index: u32, info: StreamInfo) -> Result<FrameBuffer> {
    let data = if group.num_planes() == 1 {
        Bytes::copy_from_slice(group.plane_payload(index, 0)?)
    } else {
        let mut joined = BytesMut::new();
        for plane in 0..group.num_planes() {
            joined.extend_from_slice(group.plane_payload(index, plane)?);
        }
        joined.freeze()
    };

    Ok(FrameBuffer::captured(
        data,
        info.resolution,
        info.format,
        info.stride,
        0,
    ))
}
