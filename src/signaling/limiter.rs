#![forbid(unsafe_code)]

// Per-address connection throttle: a rolling window of attempt timestamps.
// Exceeding it rejects the upgrade before any envelope is exchanged.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Entries for addresses idle past the window are pruned once the map grows
/// beyond this, keeping memory bounded under address churn.
const PRUNE_THRESHOLD: usize = 1024;

pub struct ConnectLimiter {
    max_attempts: usize,
    window: Duration,
    attempts: Mutex<HashMap<IpAddr, VecDeque<Instant>>>,
}

impl ConnectLimiter {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts: max_attempts as usize,
            window,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Records one connection attempt from `addr` and returns whether it is
    /// within the allowance.
    pub fn allow(&self, addr: IpAddr) -> bool {
        let now = Instant::now();
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());

        if attempts.len() > PRUNE_THRESHOLD {
            let window = self.window;
            attempts.retain(|_, log| {
                log.back().map_or(false, |last| now.duration_since(*last) < window)
            });
        }

        let log = attempts.entry(addr).or_default();
        while log
            .front()
            .map_or(false, |t| now.duration_since(*t) >= self.window)
        {
            log.pop_front();
        }

        if log.len() >= self.max_attempts {
            return false;
        }
        log.push_back(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> IpAddr {
        IpAddr::from([127, 0, 0, last])
    }

    #[test]
    fn allows_up_to_the_limit_then_blocks() {
        let limiter = ConnectLimiter::new(3, Duration::from_secs(60));
        assert!(limiter.allow(addr(1)));
        assert!(limiter.allow(addr(1)));
        assert!(limiter.allow(addr(1)));
        assert!(!limiter.allow(addr(1)));
    }

    #[test]
    fn addresses_are_throttled_independently() {
        let limiter = ConnectLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.allow(addr(1)));
        assert!(!limiter.allow(addr(1)));
        assert!(limiter.allow(addr(2)));
    }

    #[test]
    fn window_expiry_frees_the_allowance() {
        let limiter = ConnectLimiter::new(2, Duration::from_millis(20));
        assert!(limiter.allow(addr(1)));
        assert!(limiter.allow(addr(1)));
        assert!(!limiter.allow(addr(1)));

        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.allow(addr(1)));
    }
}
