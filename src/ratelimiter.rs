use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);

/// Sliding one-minute window of accepted connections per client IP.
pub struct RateLimiter {
    connections: HashMap<IpAddr, VecDeque<Instant>>,
    max_per_minute: usize,
}

impl RateLimiter {
    pub fn new(max_per_minute: usize) -> Self {
        Self {
            connections: HashMap::new(),
            max_per_minute,
        }
    }

    pub fn check_and_add(&mut self, addr: IpAddr) -> bool {
        self.check_and_add_at(addr, Instant::now())
    }

    fn check_and_add_at(&mut self, addr: IpAddr, now: Instant) -> bool {
        // Expire every window; clients with nothing left are dropped.
        self.connections.retain(|_, entries| {
            while let Some(&time) = entries.front() {
                if now.duration_since(time) > WINDOW {
                    entries.pop_front();
                } else {
                    break;
                }
            }
            !entries.is_empty()
        });

        let entries = self.connections.entry(addr).or_default();
        if entries.len() >= self.max_per_minute {
            if entries.is_empty() {
                self.connections.remove(&addr);
            }
            false
        } else {
            entries.push_back(now);
            true
        }
    }
}
