//! Connection admission: origin allowlist, global/per-remote caps, and a
//! per-client sliding-window message-rate limiter (`spec.md` §4.5).

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Checks a handshake `Origin` header against a configured allowlist. An
/// empty allowlist accepts every origin (development default).
pub struct OriginAllowlist {
    allowed: Vec<String>,
}

impl OriginAllowlist {
    pub fn new(allowed: Vec<String>) -> Self {
        Self { allowed }
    }

    pub fn is_allowed(&self, origin: Option<&str>) -> bool {
        if self.allowed.is_empty() {
            return true;
        }
        match origin {
            Some(origin) => self.allowed.iter().any(|a| a == origin),
            None => false,
        }
    }
}

/// Tracks a global connection count and a per-remote-address count, enforcing
/// both caps at admission time.
pub struct ConnectionLimiter {
    max_global: usize,
    max_per_remote: usize,
    global: AtomicUsize,
    per_remote: Mutex<HashMap<IpAddr, usize>>,
}

impl ConnectionLimiter {
    pub fn new(max_global: usize, max_per_remote: usize) -> Self {
        Self {
            max_global,
            max_per_remote,
            global: AtomicUsize::new(0),
            per_remote: Mutex::new(HashMap::new()),
        }
    }

    /// Try to admit a connection from `remote`. Returns `false` (and leaves
    /// counters untouched) if either cap would be exceeded.
    pub fn try_admit(&self, remote: IpAddr) -> bool {
        if self.global.load(Ordering::Relaxed) >= self.max_global {
            return false;
        }
        let mut per_remote = self.per_remote.lock().expect("connection limiter poisoned");
        let count = per_remote.entry(remote).or_insert(0);
        if *count >= self.max_per_remote {
            return false;
        }
        *count += 1;
        self.global.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Release a previously admitted connection's slot.
    pub fn release(&self, remote: IpAddr) {
        self.global.fetch_sub(1, Ordering::Relaxed);
        let mut per_remote = self.per_remote.lock().expect("connection limiter poisoned");
        if let Some(count) = per_remote.get_mut(&remote) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                per_remote.remove(&remote);
            }
        }
    }

    pub fn global_count(&self) -> usize {
        self.global.load(Ordering::Relaxed)
    }
}

/// A fixed-window rate limiter: at most `max_messages` accepted per
/// `window`, reset when the window elapses.
pub struct RateLimiter {
    max_messages: u32,
    window: Duration,
    state: Mutex<(Instant, u32)>,
}

impl RateLimiter {
    pub fn new(max_messages: u32, window: Duration) -> Self {
        Self {
            max_messages,
            window,
            state: Mutex::new((Instant::now(), 0)),
        }
    }

    /// Record one message attempt, returning `true` if it is within budget.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().expect("rate limiter poisoned");
        let (window_start, count) = &mut *state;
        if window_start.elapsed() >= self.window {
            *window_start = Instant::now();
            *count = 0;
        }
        if *count >= self.max_messages {
            return false;
        }
        *count += 1;
        true
    }
}
