use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Outcome of a limiter check. Throttling is an expected value here, not
/// an error; the middleware turns it into a 429.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Throttled { retry_after_secs: u64 },
}

/// Keys with no live timestamps are swept once the map grows past this.
const GC_KEY_WATERMARK: usize = 10_000;

/// Trailing-window request counter over an in-process map. State is local
/// to the process, so horizontally scaled deployments multiply the
/// effective allowance per instance.
///
/// `check_and_record` takes `now` as an argument so tests can drive the
/// clock instead of sleeping.
pub struct RateLimiter {
    windows: Mutex<HashMap<String, Vec<Instant>>>,
    window: Duration,
    max_requests: usize,
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: usize) -> Self {
        RateLimiter {
            windows: Mutex::new(HashMap::new()),
            window,
            max_requests,
        }
    }

    /// Counts a request against `key`. A rejected request is NOT recorded,
    /// so hammering a throttled route never extends the lockout.
    pub fn check_and_record(&self, key: &str, now: Instant) -> RateDecision {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());

        let stamps = windows.entry(key.to_string()).or_default();
        stamps.retain(|&t| now.duration_since(t) < self.window);

        if stamps.len() >= self.max_requests {
            // Retry once the oldest counted request leaves the window.
            // Rounded up and floored at 1 so clients never get zero.
            let remaining = match stamps.first() {
                Some(&oldest) => self.window.saturating_sub(now.duration_since(oldest)),
                None => self.window,
            };
            let retry_after_secs = (remaining.as_millis() as u64).div_ceil(1000).max(1);
            return RateDecision::Throttled { retry_after_secs };
        }

        stamps.push(now);

        if windows.len() > GC_KEY_WATERMARK {
            windows.retain(|_, stamps| {
                stamps.retain(|&t| now.duration_since(t) < self.window);
                !stamps.is_empty()
            });
        }

        RateDecision::Allowed
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.windows.lock().unwrap().len()
    }
}
