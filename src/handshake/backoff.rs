//! Per-address rejection delay.
//!
//! A first rejection waits a random fraction of a second. Each rejection
//! arriving before the previous delay expired doubles it, up to a ceiling.

use rand::Rng;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Blocked {
    expires: Instant,
    delay: f64,
}

/// Rejection delays keyed by peer address.
#[derive(Debug)]
pub struct Backoff {
    ceiling: f64,
    blocked: HashMap<String, Blocked>,
}

impl Backoff {
    pub fn new(ceiling: Duration) -> Self {
        Self {
            ceiling: ceiling.as_secs_f64(),
            blocked: HashMap::new(),
        }
    }

    /// Delay before rejecting the attempt from `address` arriving at `now`.
    pub fn next_delay(&mut self, address: &str, now: Instant) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.0..1.0);
        self.next_delay_with(address, now, jitter)
    }

    fn next_delay_with(&mut self, address: &str, now: Instant, jitter: f64) -> Duration {
        let delay = match self.blocked.get(address) {
            Some(prev) if now < prev.expires => (prev.delay * 2.0).min(self.ceiling),
            _ => jitter.min(self.ceiling),
        };
        let delay_dur = Duration::from_secs_f64(delay);
        self.blocked.insert(
            address.to_string(),
            Blocked {
                expires: now + delay_dur,
                delay,
            },
        );
        self.prune(now);
        delay_dur
    }

    // Expired addresses start over anyway; dropping them bounds the map.
    fn prune(&mut self, now: Instant) {
        if self.blocked.len() > 1024 {
            self.blocked.retain(|_, b| b.expires > now);
        }
    }

    /// Number of addresses currently tracked.
    pub fn tracked(&self) -> usize {
        self.blocked.len()
    }
}
