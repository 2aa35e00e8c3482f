use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

/// Rolling-window limiter for error-notification emission.
///
/// A permanent processing failure enqueues an `error_message` audit
/// notification on the agent's own queue; if that notification itself fails
/// to process, the loop would feed on its own errors forever. The limiter
/// caps emission at `max_per_window` per window (default 5 per 60 s).
pub struct ErrorRateLimiter {
    max_per_window: u32,
    window: Duration,
    state: Mutex<WindowState>,
}

struct WindowState {
    window_start: Instant,
    count: u32,
}

impl ErrorRateLimiter {
    pub fn new() -> Self {
        Self::with_limits(5, Duration::from_secs(60))
    }

    pub fn with_limits(max_per_window: u32, window: Duration) -> Self {
        Self {
            max_per_window,
            window,
            state: Mutex::new(WindowState {
                window_start: Instant::now(),
                count: 0,
            }),
        }
    }

    /// Record one emission attempt; returns whether it is allowed.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock();
        if state.window_start.elapsed() > self.window {
            state.window_start = Instant::now();
            state.count = 0;
        }
        state.count += 1;
        if state.count > self.max_per_window {
            warn!(
                count = state.count,
                limit = self.max_per_window,
                "error notification suppressed by circuit breaker"
            );
            false
        } else {
            true
        }
    }
}

impl Default for ErrorRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
