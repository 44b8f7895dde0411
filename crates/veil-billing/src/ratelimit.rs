//! Fixed-window rate limiting for the anonymous link-guest path, keyed by
//! source IP. Same atomic counter-table idiom as the reservation store.

use std::collections::HashMap;
use std::sync::Mutex;

use veil_core::types::Timestamp;
use veil_core::VeilError;

struct Window {
    started_at: Timestamp,
    count: u32,
}

pub struct RateLimiter {
    max_per_window: u32,
    window_secs: i64,
    counters: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(max_per_window: u32, window_secs: i64) -> Self {
        Self {
            max_per_window,
            window_secs,
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Count one hit for `key`; `rate-limited` once the window is full.
    pub fn check(&self, key: &str, now: Timestamp) -> Result<(), VeilError> {
        let mut counters = self.counters.lock().expect("rate counters poisoned");
        let window = counters.entry(key.to_string()).or_insert(Window {
            started_at: now,
            count: 0,
        });
        if now - window.started_at >= self.window_secs {
            window.started_at = now;
            window.count = 0;
        }
        if window.count >= self.max_per_window {
            return Err(VeilError::RateLimited {
                retry_after_secs: window.started_at + self.window_secs - now,
            });
        }
        window.count += 1;
        Ok(())
    }
}
