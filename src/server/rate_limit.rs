//! Per-IP request throttling.
//!
//! Fixed windows per client address: up to `RATE_LIMIT_MAX_REQUESTS` per
//! `RATE_LIMIT_WINDOW`, counted in memory. A background sweeper evicts
//! addresses not seen for `RATE_LIMIT_STALE_WINDOWS` windows so the map
//! cannot grow without bound.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::constants::{
    RATE_LIMIT_MAX_REQUESTS, RATE_LIMIT_STALE_WINDOWS, RATE_LIMIT_SWEEP_INTERVAL,
    RATE_LIMIT_WINDOW,
};

struct IpWindow {
    count: u32,
    reset_at: Instant,
    last_seen: Instant,
}

/// In-memory per-IP fixed-window limiter.
pub struct IpRateLimiter {
    windows: Mutex<HashMap<IpAddr, IpWindow>>,
    max_requests: u32,
    window: Duration,
}

impl Default for IpRateLimiter {
    fn default() -> Self {
        Self::new(RATE_LIMIT_MAX_REQUESTS, RATE_LIMIT_WINDOW)
    }
}

impl IpRateLimiter {
    /// Limiter with explicit bounds (tests tighten them).
    pub fn new(max_requests: u32, window: Duration) -> Self {
        IpRateLimiter {
            windows: Mutex::new(HashMap::new()),
            max_requests,
            window,
        }
    }

    /// Counts a request from `ip`. Returns whether it is allowed.
    pub fn allow(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap();
        let entry = windows.entry(ip).or_insert(IpWindow {
            count: 0,
            reset_at: now + self.window,
            last_seen: now,
        });
        if now > entry.reset_at {
            entry.count = 0;
            entry.reset_at = now + self.window;
        }
        entry.count += 1;
        entry.last_seen = now;
        entry.count <= self.max_requests
    }

    /// Evicts addresses idle for more than the stale bound.
    pub fn sweep(&self) {
        let now = Instant::now();
        let stale_after = self.window * RATE_LIMIT_STALE_WINDOWS;
        let mut windows = self.windows.lock().unwrap();
        let before = windows.len();
        windows.retain(|_, entry| now.duration_since(entry.last_seen) <= stale_after);
        let evicted = before - windows.len();
        if evicted > 0 {
            debug!("Rate limiter swept {evicted} stale entries ({} live)", windows.len());
        }
    }

    /// Number of tracked addresses.
    pub fn tracked(&self) -> usize {
        self.windows.lock().unwrap().len()
    }

    /// Spawns the periodic sweeper; stops when `shutdown` cancels.
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RATE_LIMIT_SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => limiter.sweep(),
                    _ = shutdown.cancelled() => break,
                }
            }
        });
    }
}
