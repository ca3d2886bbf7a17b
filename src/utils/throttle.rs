//! Log throttling for per-frame failures
//!
//! The capture/encode loop runs at the stream's frame rate, so a persistent
//! failure (unplugged device, unsupported layout) would otherwise log once per
//! frame. `LogThrottler` lets a message through at most once per interval and
//! counts what it swallowed in between.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct KeyState {
    last_logged: Instant,
    suppressed: u64,
}

/// Rate limiter for repeated log messages, keyed by message kind
pub struct LogThrottler {
    keys: Mutex<HashMap<String, KeyState>>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Returns `true` when a message for `key` should be emitted now.
    pub fn should_log(&self, key: &str) -> bool {
        self.admit(key).is_some()
    }

    /// Like [`should_log`](Self::should_log), but returns how many messages
    /// for `key` were suppressed since the last admitted one.
    pub fn admit(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        let mut keys = self.keys.lock();
        match keys.get_mut(key) {
            Some(state) if now.duration_since(state.last_logged) < self.interval => {
                state.suppressed += 1;
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

    /// Forget `key`, so the next failure of that kind is logged immediately.
    pub fn clear(&self, key: &str) {
        self.keys.lock().remove(key);
    }

    pub fn clear_all(&self) {
        self.keys.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.lock().is_empty()
    }
}

impl Default for LogThrottler {
    fn default() -> Self {
        Self::with_secs(5)
    }
}

/// Throttled `tracing::warn!`
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suppressed) = $throttler.admit($key) {
            tracing::warn!(suppressed, $($arg)*);
        }
    };
}

/// Throttled `tracing::error!`
#[macro_export]
macro_rules! error_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suppressed) = $throttler.admit($key) {
            tracing::error!(suppressed, $($arg)*);
        }
    };
}
