//! Serial motor controller
//!
//! Commands are framed as ASCII lines `T,{throttle},{steer},0,{seq}\n` and
//! written by a dedicated thread, so callers on the event loop never wait on
//! the port.

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::Actuator;
use crate::error::{AppError, Result};
use crate::utils::LogThrottler;

/// Baud rates the controller firmware accepts
pub const SUPPORTED_BAUD_RATES: [u32; 6] = [9600, 19200, 38400, 57600, 115200, 230400];

/// Write timeout for the serial port
const WRITE_TIMEOUT_MS: u64 = 100;

/// Time given to the neutral command to reach the device before closing
const STOP_SETTLE_MS: u64 = 100;

/// Non-zero commands logged once per this many
const LOG_EVERY: u64 = 100;

/// Check a baud rate against [`SUPPORTED_BAUD_RATES`]
pub fn validate_baud_rate(baud_rate: u32) -> Result<()> {
    if SUPPORTED_BAUD_RATES.contains(&baud_rate) {
        Ok(())
    } else {
        Err(AppError::Config(format!(
            "unsupported baud rate {}, expected one of {:?}",
            baud_rate, SUPPORTED_BAUD_RATES
        )))
    }
}

/// Build one command line
fn frame(throttle: i32, steer: i32, seq: u16) -> Vec<u8> {
    format!("T,{},{},0,{}\n", throttle, steer, seq).into_bytes()
}

/// UART-attached drive actuator
pub struct UartActuator {
    device: String,
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    connected: Arc<AtomicBool>,
    seq: AtomicU16,
    nonzero_sent: AtomicU64,
}

impl UartActuator {
    /// Open the serial port (8N1, no flow control) and start the writer thread
    pub fn open(device: &str, baud_rate: u32) -> Result<Self> {
        validate_baud_rate(baud_rate).map_err(|e| AppError::Actuator {
            device: device.to_string(),
            reason: e.to_string(),
        })?;

        let port = serialport::new(device, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::from_millis(WRITE_TIMEOUT_MS))
            .open()
            .map_err(|e| Self::serial_error(device, e))?;

        info!("Actuator serial port opened: {} @ {} baud", device, baud_rate);
        Self::with_writer(device, Box::new(port))
    }

    /// Open the port, falling back to a disconnected actuator on failure
    pub fn open_or_disconnected(device: &str, baud_rate: u32) -> Self {
        match Self::open(device, baud_rate) {
            Ok(actuator) => actuator,
            Err(e) => {
                warn!("Actuator unavailable, car control disabled: {}", e);
                Self::disconnected(device)
            }
        }
    }

    /// Actuator with no device behind it; every command is refused
    pub fn disconnected(device: &str) -> Self {
        Self {
            device: device.to_string(),
            tx: Mutex::new(None),
            writer: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            seq: AtomicU16::new(0),
            nonzero_sent: AtomicU64::new(0),
        }
    }

    /// Drive an arbitrary writer instead of a serial port
    pub fn with_writer(device: &str, mut sink: Box<dyn Write + Send>) -> Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let connected = Arc::new(AtomicBool::new(true));
        let name = device.to_string();
        let thread_connected = connected.clone();

        let writer = std::thread::Builder::new()
            .name("actuator-uart".to_string())
            .spawn(move || {
                let throttler = LogThrottler::with_secs(5);
                while let Some(line) = rx.blocking_recv() {
                    if let Err(e) = sink.write_all(&line).and_then(|_| sink.flush()) {
                        if let Some(suppressed) = throttler.check("write") {
                            warn!(
                                device = %name,
                                suppressed,
                                "Actuator write failed: {}",
                                e
                            );
                        }
                    }
                }
                thread_connected.store(false, Ordering::SeqCst);
                debug!(device = %name, "Actuator writer stopped");
            })
            .map_err(|e| AppError::Actuator {
                device: device.to_string(),
                reason: format!("failed to spawn writer: {}", e),
            })?;

        Ok(Self {
            device: device.to_string(),
            tx: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
            connected,
            seq: AtomicU16::new(0),
            nonzero_sent: AtomicU64::new(0),
        })
    }

    /// Device path this actuator was opened on
    pub fn device(&self) -> &str {
        &self.device
    }

    fn serial_error(device: &str, e: serialport::Error) -> AppError {
        let reason = match e.kind() {
            serialport::ErrorKind::NoDevice => format!("port not found: {}", e),
            serialport::ErrorKind::InvalidInput => format!("invalid port settings: {}", e),
            _ => e.to_string(),
        };
        AppError::Actuator {
            device: device.to_string(),
            reason,
        }
    }

    fn enqueue(&self, throttle: i32, steer: i32) -> Result<()> {
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(AppError::ActuatorUnavailable)?;
        let seq = self.seq.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        tx.send(frame(throttle, steer, seq))
            .map_err(|_| AppError::ActuatorUnavailable)?;

        if throttle != 0 || steer != 0 {
            let count = self.nonzero_sent.fetch_add(1, Ordering::Relaxed) + 1;
            if count % LOG_EVERY == 0 {
                debug!(
                    device = %self.device,
                    count,
                    "Actuator command T,{},{} seq={}",
                    throttle,
                    steer,
                    seq
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Actuator for UartActuator {
    fn name(&self) -> &'static str {
        "uart"
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.tx.lock().is_some()
    }

    async fn send_command(&self, throttle: i32, steer: i32) -> Result<()> {
        self.enqueue(throttle, steer)
    }

    async fn stop(&self) -> Result<()> {
        if self.tx.lock().is_none() {
            return Ok(());
        }
        if let Err(e) = self.enqueue(0, 0) {
            warn!(device = %self.device, "Failed to queue neutral command: {}", e);
        }
        tokio::time::sleep(Duration::from_millis(STOP_SETTLE_MS)).await;

        // Dropping the sender ends the writer loop after the queue drains
        self.tx.lock().take();
        let writer = self.writer.lock().take();
        if let Some(handle) = writer {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
        self.connected.store(false, Ordering::SeqCst);
        info!(device = %self.device, "Actuator stopped");
        Ok(())
    }
}

impl Drop for UartActuator {
    fn drop(&mut self) {
        self.tx.lock().take();
    }
}
