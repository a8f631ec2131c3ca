//! Per-IP token bucket rate limiter.
//!
//! Each client IP gets three independent buckets: general requests, command
//! execution, and file operations. Buckets refill continuously from the
//! monotonic clock; idle clients are evicted by a periodic sweep.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::RateLimitConfig;

/// How often the eviction sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Clients idle longer than this are dropped by the sweep.
const IDLE_EVICTION: Duration = Duration::from_secs(10 * 60);

/// A single token bucket. The per-minute allowance from the config is
/// converted to a per-second drip; the balance stays within
/// `0 ..= capacity` and is fractional between whole drips.
struct TokenBucket {
    capacity: f64,
    balance: f64,
    drip_per_sec: f64,
    refilled_at: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, per_minute: u32) -> Self {
        Self {
            capacity: capacity as f64,
            balance: capacity as f64,
            drip_per_sec: per_minute as f64 / 60.0,
            refilled_at: Instant::now(),
        }
    }

    /// Credit the elapsed drip, then spend one token if the balance allows.
    fn take(&mut self, now: Instant) -> bool {
        let credit = now.duration_since(self.refilled_at).as_secs_f64() * self.drip_per_sec;
        self.balance = self.capacity.min(self.balance + credit);
        self.refilled_at = now;

        if self.balance < 1.0 {
            return false;
        }
        self.balance -= 1.0;
        true
    }
}

struct ClientBuckets {
    requests: TokenBucket,
    commands: TokenBucket,
    file_ops: TokenBucket,
    last_seen: Instant,
}

/// Bucket classes, routed from the wire method name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Requests,
    Commands,
    FileOps,
}

const COMMAND_METHODS: &[&str] = &[
    "ExecuteCommand",
    "ExecuteShell",
    "ServiceAction",
    "KillProcess",
];

const FILE_METHODS: &[&str] = &[
    "ReadFile",
    "WriteFile",
    "DeleteFile",
    "ListDirectory",
    "UploadFile",
    "DownloadFile",
];

/// Route a method to its bucket by substring match on the method name.
pub fn category_for_method(method: &str) -> Category {
    if COMMAND_METHODS.iter().any(|m| method.contains(m)) {
        Category::Commands
    } else if FILE_METHODS.iter().any(|m| method.contains(m)) {
        Category::FileOps
    } else {
        Category::Requests
    }
}

pub struct RateLimiter {
    config: RateLimitConfig,
    clients: Mutex<HashMap<IpAddr, ClientBuckets>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Check whether a call from `ip` on `method` is allowed right now.
    pub fn allow(&self, ip: IpAddr, method: &str) -> bool {
        if !self.config.enabled {
            return true;
        }
        let category = category_for_method(method);
        let mut clients = self.clients.lock().unwrap();
        let entry = clients.entry(ip).or_insert_with(|| ClientBuckets {
            requests: TokenBucket::new(self.config.burst_size, self.config.requests_per_minute),
            commands: TokenBucket::new(
                self.config.burst_size / 2,
                self.config.commands_per_minute,
            ),
            file_ops: TokenBucket::new(self.config.burst_size, self.config.file_ops_per_minute),
            last_seen: Instant::now(),
        });
        let now = Instant::now();
        entry.last_seen = now;
        match category {
            Category::Requests => entry.requests.take(now),
            Category::Commands => entry.commands.take(now),
            Category::FileOps => entry.file_ops.take(now),
        }
    }

    /// Number of tracked client IPs.
    pub fn active_clients(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    /// Drop clients not seen within the idle window.
    fn sweep(&self) {
        let mut clients = self.clients.lock().unwrap();
        let before = clients.len();
        clients.retain(|_, c| c.last_seen.elapsed() < IDLE_EVICTION);
        let evicted = before - clients.len();
        if evicted > 0 {
            debug!(evicted, remaining = clients.len(), "rate limiter eviction sweep");
        }
    }

    /// Spawn the periodic eviction sweep for the daemon's lifetime.
    pub fn spawn_eviction_loop(self: &Arc<Self>) {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                limiter.sweep();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        format!("203.0.113.{}", last).parse().unwrap()
    }

    fn limiter() -> RateLimiter {
        RateLimiter::new(RateLimitConfig::default())
    }

    #[test]
    fn method_routing_by_substring() {
        assert_eq!(category_for_method("ExecuteCommand"), Category::Commands);
        assert_eq!(category_for_method("ExecuteShell"), Category::Commands);
        assert_eq!(category_for_method("KillProcess"), Category::Commands);
        assert_eq!(category_for_method("UploadFile"), Category::FileOps);
        assert_eq!(category_for_method("ReadFile"), Category::FileOps);
        assert_eq!(category_for_method("GetMetrics"), Category::Requests);
        assert_eq!(category_for_method("Authenticate"), Category::Requests);
    }

    #[test]
    fn burst_allows_then_denies() {
        let l = limiter();
        // Requests bucket has a burst of 20.
        for _ in 0..20 {
            assert!(l.allow(ip(1), "GetSystemInfo"));
        }
        assert!(!l.allow(ip(1), "GetSystemInfo"));
    }

    #[test]
    fn command_bucket_is_half_burst() {
        let l = limiter();
        for _ in 0..10 {
            assert!(l.allow(ip(2), "ExecuteCommand"));
        }
        assert!(!l.allow(ip(2), "ExecuteCommand"));
        // Requests bucket unaffected.
        assert!(l.allow(ip(2), "GetSystemInfo"));
    }

    #[test]
    fn per_ip_isolation() {
        let l = limiter();
        for _ in 0..10 {
            assert!(l.allow(ip(3), "ExecuteCommand"));
        }
        assert!(!l.allow(ip(3), "ExecuteCommand"));
        // A different client still has a full bucket.
        assert!(l.allow(ip(4), "ExecuteCommand"));
    }

    #[test]
    fn disabled_limiter_always_allows() {
        let mut config = RateLimitConfig::default();
        config.enabled = false;
        config.requests_per_minute = 1;
        let l = RateLimiter::new(config);
        for _ in 0..100 {
            assert!(l.allow(ip(5), "GetSystemInfo"));
        }
    }

    #[test]
    fn tokens_refill_over_time() {
        let mut config = RateLimitConfig::default();
        // 600/min = 10/sec so a short sleep yields a token.
        config.requests_per_minute = 600;
        let l = RateLimiter::new(config);
        for _ in 0..20 {
            assert!(l.allow(ip(6), "GetSystemInfo"));
        }
        assert!(!l.allow(ip(6), "GetSystemInfo"));
        std::thread::sleep(Duration::from_millis(250));
        assert!(l.allow(ip(6), "GetSystemInfo"));
    }

    #[test]
    fn bucket_never_exceeds_capacity() {
        let mut bucket = TokenBucket::new(5, 6000);
        std::thread::sleep(Duration::from_millis(120));
        // The drip credits far more than capacity; only 5 takes may succeed.
        let mut granted = 0;
        for _ in 0..10 {
            if bucket.take(Instant::now()) {
                granted += 1;
            }
        }
        assert_eq!(granted, 5);
        assert!(bucket.balance >= 0.0);
        assert!(bucket.balance <= bucket.capacity);
    }

    #[test]
    fn sweep_drops_only_idle_clients() {
        let l = limiter();
        assert!(l.allow(ip(7), "GetSystemInfo"));
        assert_eq!(l.active_clients(), 1);
        // Fresh client survives the sweep.
        l.sweep();
        assert_eq!(l.active_clients(), 1);
    }
}
