//! Hardware memory-to-memory codec pipeline
//!
//! Frames are submitted to the device's output queue and results are read
//! back from its capture queue. The hardware is assumed to complete buffers
//! in submission order, so results are matched to pending tasks FIFO. Each
//! task also records the output slot it occupied; a completion that frees a
//! different slot is logged as an ordering violation.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::buffer::BufferGroup;
use super::device::{
    controls, DeviceEvent, DeviceEventKind, Direction, MemoryMode, QueueType, Readiness,
    VideoDevice,
};
use super::format::{PixelFormat, Resolution};
use super::frame::FrameBuffer;
use super::v4l2::open_device;
use crate::error::{AppError, Result};
use crate::utils::LogThrottler;
use crate::warn_throttled;

const POLL_TIMEOUT: Duration = Duration::from_millis(200);

/// Completion callback for one submitted frame
pub type ResultCallback = Box<dyn FnOnce(FrameBuffer) + Send>;

/// Called once the hardware has finished reading a submitted frame
pub type ReleaseCallback = Box<dyn FnOnce() + Send>;

/// Pipeline lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecState {
    Idle,
    /// Formats negotiated and buffers allocated on both queues
    Configured,
    /// Both queues streaming, completion thread running
    Streaming,
    /// The device signalled end of stream or a fatal error
    Failed,
}

/// One side of the codec
#[derive(Debug, Clone)]
pub struct CodecSide {
    pub format: PixelFormat,
    pub resolution: Resolution,
    pub memory: MemoryMode,
    pub buffer_count: u32,
}

#[derive(Debug, Clone)]
pub struct CodecConfig {
    /// Frames going into the hardware
    pub output: CodecSide,
    /// Results coming out of the hardware
    pub capture: CodecSide,
    /// Controls applied once after format negotiation
    pub controls: Vec<(u32, i32)>,
    pub fps: u32,
}

impl CodecConfig {
    /// Raw frames in, H.264 out
    pub fn encoder(input: PixelFormat, resolution: Resolution, bitrate: u32, fps: u32) -> Self {
        Self {
            output: CodecSide {
                format: input,
                resolution,
                memory: MemoryMode::Mmap,
                buffer_count: 4,
            },
            capture: CodecSide {
                format: PixelFormat::H264,
                resolution,
                memory: MemoryMode::Mmap,
                buffer_count: 4,
            },
            controls: vec![
                (controls::BITRATE_MODE, controls::BITRATE_MODE_VBR),
                (controls::H264_PROFILE, controls::H264_PROFILE_HIGH),
                (controls::REPEAT_SEQ_HEADER, 1),
                (controls::H264_LEVEL, controls::H264_LEVEL_4_0),
                (controls::H264_I_PERIOD, 60),
                (controls::BITRATE, bitrate.min(i32::MAX as u32) as i32),
            ],
            fps,
        }
    }

    /// Compressed frames in, raw frames out
    pub fn decoder(input: PixelFormat, resolution: Resolution, output: PixelFormat) -> Self {
        Self {
            output: CodecSide {
                format: input,
                resolution,
                memory: MemoryMode::Mmap,
                buffer_count: 4,
            },
            capture: CodecSide {
                format: output,
                resolution,
                memory: MemoryMode::Mmap,
                buffer_count: 4,
            },
            controls: Vec::new(),
            fps: 0,
        }
    }

    pub fn with_output_memory(mut self, memory: MemoryMode) -> Self {
        self.output.memory = memory;
        self
    }

    pub fn with_buffer_count(mut self, output: u32, capture: u32) -> Self {
        self.output.buffer_count = output;
        self.capture.buffer_count = capture;
        self
    }
}

struct Task {
    sequence: u64,
    slot: u32,
    output_done: bool,
    source_sequence: u64,
    source_timestamp: Duration,
    on_result: Option<ResultCallback>,
    on_consumed: Option<ReleaseCallback>,
}

impl Task {
    fn is_finished(&self) -> bool {
        self.output_done && self.on_result.is_none()
    }
}

/// Input side: slots the hardware reads frames from
struct OutputSide {
    group: BufferGroup,
    free_slots: VecDeque<u32>,
}

#[derive(Default)]
struct Pending {
    tasks: VecDeque<Task>,
    next_sequence: u64,
}

impl Pending {
    fn prune(&mut self) {
        while self.tasks.front().is_some_and(Task::is_finished) {
            self.tasks.pop_front();
        }
    }
}

/// State shared with the completion thread.
///
/// The two queues are locked separately and no path holds both, so a
/// dequeue in progress on one side never stalls the other. `pending` is
/// always taken last and only for bookkeeping.
struct Shared {
    device: Arc<dyn VideoDevice>,
    output: Mutex<Option<OutputSide>>,
    capture: Mutex<Option<BufferGroup>>,
    pending: Mutex<Pending>,
    state: watch::Sender<CodecState>,
    abort: AtomicBool,
    throttler: LogThrottler,
}

impl Shared {
    fn set_state(&self, state: CodecState) {
        self.state.send_replace(state);
    }
}

fn no_buffers() -> AppError {
    AppError::InvalidState("codec has no buffers".to_string())
}

/// Hardware transform stage built on two buffer groups of one M2M device
pub struct CodecPipeline {
    config: CodecConfig,
    shared: Arc<Shared>,
    queue_types: Mutex<Option<(QueueType, QueueType)>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CodecPipeline {
    pub fn new(device: Arc<dyn VideoDevice>, config: CodecConfig) -> Self {
        let (state, _) = watch::channel(CodecState::Idle);
        Self {
            config,
            shared: Arc::new(Shared {
                device,
                output: Mutex::new(None),
                capture: Mutex::new(None),
                pending: Mutex::new(Pending::default()),
                state,
                abort: AtomicBool::new(false),
                throttler: LogThrottler::with_secs(5),
            }),
            queue_types: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    /// Open a device node, configure it and start streaming
    pub fn open(path: impl AsRef<Path>, config: CodecConfig) -> Result<Self> {
        let device: Arc<dyn VideoDevice> = Arc::new(open_device(path)?);
        let pipeline = Self::new(device, config);
        pipeline.configure()?;
        pipeline.start()?;
        Ok(pipeline)
    }

    pub fn state(&self) -> CodecState {
        *self.shared.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<CodecState> {
        self.shared.state.subscribe()
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// Whether submitted frames are read in place through their DMA-BUF handle
    pub fn imports_dma_buf(&self) -> bool {
        self.config.output.memory == MemoryMode::DmaBufImport
    }

    /// Current capture-side size, which follows source changes
    pub fn capture_resolution(&self) -> Option<Resolution> {
        self.shared
            .capture
            .lock()
            .as_ref()
            .and_then(|c| c.format().map(|f| Resolution::new(f.width, f.height)))
    }

    /// Number of submissions still waiting for a result
    pub fn pending(&self) -> usize {
        self.shared
            .pending
            .lock()
            .tasks
            .iter()
            .filter(|t| t.on_result.is_some())
            .count()
    }

    /// Negotiate both queues and allocate their buffers. `Idle -> Configured`
    pub fn configure(&self) -> Result<()> {
        if self.state() != CodecState::Idle {
            return Err(AppError::InvalidState(format!(
                "codec is {:?}, expected Idle",
                self.state()
            )));
        }

        let device = &self.shared.device;
        let mut output = BufferGroup::new(device.clone(), Direction::Output, self.config.output.memory)?;
        let mut capture =
            BufferGroup::new(device.clone(), Direction::Capture, self.config.capture.memory)?;

        output.negotiate_format(self.config.output.resolution, self.config.output.format.to_fourcc())?;
        capture.negotiate_format(
            self.config.capture.resolution,
            self.config.capture.format.to_fourcc(),
        )?;

        for &(id, value) in &self.config.controls {
            if let Err(e) = device.set_control(id, value) {
                warn!("Codec control {:#x} not applied: {}", id, e);
            }
        }
        if self.config.fps > 0 {
            if let Err(e) = device.set_frame_rate(output.queue_type(), self.config.fps) {
                warn!("Failed to set codec frame rate: {}", e);
            }
        }

        let granted = output.allocate(self.config.output.buffer_count)?;
        capture.allocate(self.config.capture.buffer_count)?;

        *self.queue_types.lock() = Some((output.queue_type(), capture.queue_type()));
        *self.shared.output.lock() = Some(OutputSide {
            group: output,
            free_slots: (0..granted).collect(),
        });
        *self.shared.capture.lock() = Some(capture);
        *self.shared.pending.lock() = Pending::default();
        self.shared.set_state(CodecState::Configured);
        info!(
            "Codec on {} configured: {} {} -> {} {}",
            device.name(),
            self.config.output.format,
            self.config.output.resolution,
            self.config.capture.format,
            self.config.capture.resolution
        );
        Ok(())
    }

    /// Start both queues and the completion thread. `Configured -> Streaming`
    pub fn start(&self) -> Result<()> {
        if self.state() != CodecState::Configured {
            return Err(AppError::InvalidState(format!(
                "codec is {:?}, expected Configured",
                self.state()
            )));
        }

        for kind in [DeviceEventKind::SourceChange, DeviceEventKind::EndOfStream] {
            if let Err(e) = self.shared.device.subscribe_event(kind) {
                warn!("{}", e);
            }
        }

        self.shared
            .capture
            .lock()
            .as_mut()
            .ok_or_else(no_buffers)?
            .queue_all()?;
        self.shared
            .output
            .lock()
            .as_mut()
            .ok_or_else(no_buffers)?
            .group
            .stream_on()?;
        self.shared
            .capture
            .lock()
            .as_mut()
            .ok_or_else(no_buffers)?
            .stream_on()?;

        self.shared.abort.store(false, Ordering::SeqCst);
        self.shared.set_state(CodecState::Streaming);

        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("codec".to_string())
            .spawn(move || completion_loop(shared))?;
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    /// Submit a frame. Returns `false` when the frame was dropped, either
    /// because every output slot is in flight or because queueing failed.
    /// `on_result` is never called for a dropped frame.
    pub fn emplace_buffer(&self, frame: &FrameBuffer, on_result: ResultCallback) -> bool {
        self.emplace(frame, on_result, None)
    }

    /// Like [`emplace_buffer`](Self::emplace_buffer) for a frame whose memory
    /// the hardware reads in place. `on_consumed` runs once the input slot
    /// comes back, or when the pipeline closes with the frame still queued.
    /// Neither callback runs for a dropped frame.
    pub fn emplace_buffer_holding(
        &self,
        frame: &FrameBuffer,
        on_result: ResultCallback,
        on_consumed: ReleaseCallback,
    ) -> bool {
        self.emplace(frame, on_result, Some(on_consumed))
    }

    fn emplace(
        &self,
        frame: &FrameBuffer,
        on_result: ResultCallback,
        on_consumed: Option<ReleaseCallback>,
    ) -> bool {
        if self.state() != CodecState::Streaming {
            return false;
        }

        let mut guard = self.shared.output.lock();
        let Some(side) = guard.as_mut() else {
            return false;
        };
        let Some(slot) = side.free_slots.pop_front() else {
            debug!("No free codec input slot, dropping frame {}", frame.sequence);
            return false;
        };

        // Registered before queueing so a fast completion finds its task
        let sequence = {
            let mut pending = self.shared.pending.lock();
            let sequence = pending.next_sequence;
            pending.next_sequence += 1;
            pending.tasks.push_back(Task {
                sequence,
                slot,
                output_done: false,
                source_sequence: frame.sequence,
                source_timestamp: frame.timestamp,
                on_result: Some(on_result),
                on_consumed,
            });
            sequence
        };

        if let Err(e) = submit(&mut side.group, slot, frame, &self.shared.throttler) {
            warn_throttled!(
                self.shared.throttler,
                "codec_submit",
                "Codec submission of frame {} failed: {}",
                frame.sequence,
                e
            );
            if let Err(e) = side.group.release(slot) {
                warn!("Failed to release codec slot {}: {}", slot, e);
            }
            side.free_slots.push_back(slot);

            let mut pending = self.shared.pending.lock();
            if let Some(pos) = pending.tasks.iter().rposition(|t| t.sequence == sequence) {
                pending.tasks.remove(pos);
            }
            return false;
        }
        true
    }

    /// Ask an encoder for an IDR frame on its next output
    pub fn request_keyframe(&self) -> Result<()> {
        self.shared.device.set_control(controls::FORCE_KEY_FRAME, 1)
    }

    /// Stop the completion thread and release both queues. Back to `Idle`.
    pub fn close(&self) {
        self.shared.abort.store(true, Ordering::SeqCst);
        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            // A dequeue sleeping in the driver returns once its queue stops
            let queue_types = *self.queue_types.lock();
            if let Some((output, capture)) = queue_types {
                for queue in [output, capture] {
                    if let Err(e) = self.shared.device.stream_off(queue) {
                        debug!("Codec {:?} stream off failed: {}", queue, e);
                    }
                }
            }
            if handle.join().is_err() {
                error!("Codec thread panicked");
            }
        }

        let output = self.shared.output.lock().take().map(|side| side.group);
        let capture = self.shared.capture.lock().take();
        for mut group in output.into_iter().chain(capture) {
            if let Err(e) = group.deallocate() {
                warn!("Failed to release codec buffers: {}", e);
            }
        }

        let dropped = std::mem::take(&mut *self.shared.pending.lock());
        if !dropped.tasks.is_empty() {
            debug!("Dropping {} pending codec task(s)", dropped.tasks.len());
        }
        // The hardware no longer reads any input, hand held frames back
        for task in dropped.tasks {
            if let Some(on_consumed) = task.on_consumed {
                on_consumed();
            }
        }
        *self.queue_types.lock() = None;
        self.shared.set_state(CodecState::Idle);
    }
}

impl Drop for CodecPipeline {
    fn drop(&mut self) {
        self.close();
    }
}

fn submit(
    output: &mut BufferGroup,
    slot: u32,
    frame: &FrameBuffer,
    throttler: &LogThrottler,
) -> Result<()> {
    if output.memory() == MemoryMode::DmaBufImport {
        let fd = frame.dma_fd.ok_or_else(|| {
            AppError::Queue("frame carries no DMA-BUF handle for import".to_string())
        })?;
        return output.queue_imported(slot, fd, frame.len() as u32);
    }

    let mut rest = frame.data();
    for plane in 0..output.num_planes() {
        if rest.is_empty() {
            break;
        }
        let copied = output.fill(slot, plane, rest)?;
        rest = &rest[copied..];
    }
    if !rest.is_empty() {
        warn_throttled!(
            throttler,
            "codec_truncate",
            "Frame {} truncated by {} bytes to fit codec input",
            frame.sequence,
            rest.len()
        );
    }
    output.queue(slot)
}

fn completion_loop(shared: Arc<Shared>) {
    let device = shared.device.clone();
    debug!("Codec completion loop started on {}", device.name());

    while !shared.abort.load(Ordering::Relaxed) {
        let readiness = match device.poll(POLL_TIMEOUT) {
            Ok(r) => r,
            Err(e) => {
                warn_throttled!(shared.throttler, "codec_poll", "Codec poll failed: {}", e);
                continue;
            }
        };
        if readiness.is_timeout() {
            continue;
        }

        match service(&shared, readiness) {
            Ok(Some((on_result, frame))) => on_result(frame),
            Ok(None) => {}
            Err(e) => {
                error!("Codec stopped: {}", e);
                shared.set_state(CodecState::Failed);
                return;
            }
        }
    }
    debug!("Codec completion loop exited");
}

/// Handle whatever the device reported ready. Each side is dequeued only
/// when poll says it has a buffer waiting.
fn service(shared: &Shared, readiness: Readiness) -> Result<Option<(ResultCallback, FrameBuffer)>> {
    if readiness.priority {
        drain_events(shared)?;
    }
    if readiness.writable {
        reclaim_output(shared)?;
    }
    if readiness.readable {
        return complete_capture(shared);
    }
    Ok(None)
}

fn drain_events(shared: &Shared) -> Result<()> {
    while let Some(event) = shared.device.dequeue_event()? {
        match event {
            DeviceEvent::SourceChange { changes } => {
                info!("Codec source change (changes={:#x}), reconfiguring capture", changes);
                let mut guard = shared.capture.lock();
                if let Some(capture) = guard.as_mut() {
                    reconfigure_capture(capture)?;
                }
            }
            DeviceEvent::EndOfStream => {
                return Err(AppError::EndOfStream(shared.device.name().to_string()));
            }
            DeviceEvent::Other(kind) => debug!("Ignoring codec event {}", kind),
        }
    }
    Ok(())
}

/// Rebuild the capture side at whatever size the driver now reports.
/// The output side keeps streaming untouched.
fn reconfigure_capture(capture: &mut BufferGroup) -> Result<()> {
    let fourcc = capture
        .format()
        .map(|f| f.fourcc)
        .ok_or_else(|| AppError::InvalidState("capture side has no format".to_string()))?;
    let count = capture.num_buffers() as u32;

    capture.stream_off()?;
    capture.deallocate()?;
    let format = capture.negotiate_format(Resolution::new(0, 0), fourcc)?;
    capture.allocate(count)?;
    capture.queue_all()?;
    capture.stream_on()?;

    info!(
        "Codec capture side now {}x{}",
        format.width, format.height
    );
    Ok(())
}

/// Take back one input slot the hardware has finished reading
fn reclaim_output(shared: &Shared) -> Result<()> {
    let index = {
        let mut guard = shared.output.lock();
        let Some(side) = guard.as_mut() else {
            return Ok(());
        };
        let buf = match side.group.dequeue() {
            Ok(buf) => buf,
            Err(e) if e.is_fatal_dequeue() => return Err(e),
            Err(_) => return Ok(()),
        };
        match side.group.release(buf.index) {
            Ok(()) => side.free_slots.push_back(buf.index),
            Err(e) => warn!("Codec input slot {} left unusable: {}", buf.index, e),
        }
        buf.index
    };

    let on_consumed = {
        let mut pending = shared.pending.lock();
        if let Some(oldest) = pending.tasks.iter().find(|t| !t.output_done) {
            if oldest.slot != index {
                warn_throttled!(
                    shared.throttler,
                    "codec_order",
                    "Codec completed input slot {} but task {} used slot {}",
                    index,
                    oldest.sequence,
                    oldest.slot
                );
            }
        }
        let on_consumed = pending
            .tasks
            .iter_mut()
            .find(|t| !t.output_done && t.slot == index)
            .and_then(|task| {
                task.output_done = true;
                task.on_consumed.take()
            });
        pending.prune();
        on_consumed
    };

    if let Some(on_consumed) = on_consumed {
        on_consumed();
    }
    Ok(())
}

/// Read one result and match it to the oldest submission still waiting
fn complete_capture(shared: &Shared) -> Result<Option<(ResultCallback, FrameBuffer)>> {
    let frame = {
        let mut guard = shared.capture.lock();
        let Some(capture) = guard.as_mut() else {
            return Ok(None);
        };
        let buf = match capture.dequeue() {
            Ok(buf) => buf,
            Err(e) if e.is_fatal_dequeue() => return Err(e),
            Err(_) => return Ok(None),
        };

        let frame = lift_result(capture, buf.index, buf.flags, buf.timestamp);
        if let Err(e) = capture.queue(buf.index) {
            warn_throttled!(
                shared.throttler,
                "codec_requeue",
                "Failed to requeue codec buffer {}: {}",
                buf.index,
                e
            );
            if let Err(e) = capture.release(buf.index) {
                warn!("Codec result buffer {} left unusable: {}", buf.index, e);
            }
        }
        frame?
    };

    let task = {
        let mut pending = shared.pending.lock();
        let task = pending
            .tasks
            .iter_mut()
            .find(|t| t.on_result.is_some())
            .and_then(|task| {
                let on_result = task.on_result.take()?;
                Some((on_result, task.source_sequence, task.source_timestamp))
            });
        pending.prune();
        task
    };

    match task {
        Some((on_result, sequence, timestamp)) => Ok(Some((
            on_result,
            frame.with_sequence(sequence).with_timestamp(timestamp),
        ))),
        None => {
            warn_throttled!(
                shared.throttler,
                "codec_orphan",
                "Codec produced a result with no pending task"
            );
            Ok(None)
        }
    }
}

fn lift_result(
    capture: &BufferGroup,
    index: u32,
    flags: u32,
    timestamp: Duration,
) -> Result<FrameBuffer> {
    let format = capture
        .format()
        .ok_or_else(|| AppError::InvalidState("capture side has no format".to_string()))?;

    let data = if capture.num_planes() == 1 {
        Bytes::copy_from_slice(capture.plane_payload(index, 0)?)
    } else {
        let mut joined = BytesMut::new();
        for plane in 0..capture.num_planes() {
            joined.extend_from_slice(capture.plane_payload(index, plane)?);
        }
        joined.freeze()
    };

    let pixel_format = PixelFormat::from_fourcc(&format.fourcc).unwrap_or(PixelFormat::H264);
    Ok(FrameBuffer::captured(
        data,
        Resolution::new(format.width, format.height),
        pixel_format,
        format.stride(),
        0,
    )
    .with_flags(flags)
    .with_timestamp(timestamp))
}
