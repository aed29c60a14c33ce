//! Log throttling utility
//!
//! Poll loops run every few milliseconds; a device that keeps failing would
//! otherwise flood the log with the same line.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct KeyState {
    last_logged: Instant,
    suppressed: u64,
}

/// Log throttler that limits how often the same message is logged
///
/// # Example
///
/// ```rust
/// use camstream::utils::LogThrottler;
/// use std::time::Duration;
///
/// let throttler = LogThrottler::new(Duration::from_secs(5));
/// assert!(throttler.should_log("dqbuf"));
/// assert!(!throttler.should_log("dqbuf"));
/// ```
pub struct LogThrottler {
    keys: Mutex<HashMap<String, KeyState>>,
    interval: Duration,
}

impl LogThrottler {
    /// Create a new log throttler with the specified interval
    pub fn new(interval: Duration) -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
            interval,
        }
    }

    /// Create a new log throttler with interval specified in seconds
    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Check if a message should be logged (not throttled)
    pub fn should_log(&self, key: &str) -> bool {
        self.check(key).is_some()
    }

    /// Like [`should_log`](Self::should_log), but also reports how many
    /// messages for `key` were swallowed since the last one that got through.
    pub fn check(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        let mut keys = self.keys.lock();

        match keys.get_mut(key) {
            Some(state) if now.duration_since(state.last_logged) < self.interval => {
                state.suppressed = state.suppressed.saturating_add(1);
                None
            }
            Some(state) => {
                let suppressed = state.suppressed;
                state.last_logged = now;
                state.suppressed = 0;
                Some(suppressed)
            }
            None => {
                keys.insert(
                    key.to_string(),
                    KeyState {
                        last_logged: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
        }
    }

    /// Clear throttle state for a specific key, so the next occurrence is
    /// logged immediately (call when the condition recovers).
    pub fn clear(&self, key: &str) {
        self.keys.lock().remove(key);
    }

    /// Clear all throttle state
    pub fn clear_all(&self) {
        self.keys.lock().clear();
    }

    /// Get the number of tracked keys
    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    /// Check if the throttler is empty
    pub fn is_empty(&self) -> bool {
        self.keys.lock().is_empty()
    }
}

impl Default for LogThrottler {
    /// Create a default log throttler with 5 second interval
    fn default() -> Self {
        Self::with_secs(5)
    }
}

/// Macro for throttled warning logging
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if $throttler.should_log($key) {
            tracing::warn!($($arg)*);
        }
    };
}

/// Macro for throttled error logging
#[macro_export]
macro_rules! error_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if $throttler.should_log($key) {
            tracing::error!($($arg)*);
        }
    };
}

/// Macro for throttled info logging
#[macro_export]
macro_rules! info_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if $throttler.should_log($key) {
            tracing::info!($($arg)*);
        }
    };
}
