use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Fixed-window rate limiter: `limit` events per `window`. Resets the
/// window the first time it is found to be stale rather than on a timer,
/// so an idle session costs nothing between frames.
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    state: Mutex<(Instant, u32)>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            state: Mutex::new((Instant::now(), 0)),
        }
    }

    pub fn per_minute(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(60))
    }

    /// Returns `true` if the event is allowed and should count against the
    /// window; `false` if the caller is over limit and the event must be
    /// rejected.
    pub fn check(&self) -> bool {
        let mut guard = self.state.lock();
        let (window_start, count) = &mut *guard;

        if window_start.elapsed() >= self.window {
            *window_start = Instant::now();
            *count = 0;
        }

        if *count >= self.limit {
            return false;
        }

        *count += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_limit_then_rejects() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        assert!(limiter.check());
        assert!(limiter.check());
        assert!(limiter.check());
        assert!(!limiter.check());
    }
}
