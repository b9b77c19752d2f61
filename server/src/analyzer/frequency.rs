//! Sliding-window connection frequency table
//!
//! Tracks how often each `(src_ip, dst_ip)` pair was seen over the trailing
//! window. Every access prunes the key it touches, so no stored timestamp is
//! older than the window relative to the last prune of that key.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub src_ip: String,
    pub dst_ip: String,
}

impl ConnectionKey {
    pub fn new(src_ip: impl Into<String>, dst_ip: impl Into<String>) -> Self {
        Self {
            src_ip: src_ip.into(),
            dst_ip: dst_ip.into(),
        }
    }
}

pub struct ConnectionFrequencyTable {
    window: Duration,
    entries: Mutex<HashMap<ConnectionKey, VecDeque<Instant>>>,
}

impl ConnectionFrequencyTable {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record one connection now and return the in-window count
    pub fn record(&self, key: &ConnectionKey) -> usize {
        self.record_at(key, Instant::now())
    }

    pub fn record_at(&self, key: &ConnectionKey, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        let seen = entries.entry(key.clone()).or_default();
        prune(seen, now, self.window);
        seen.push_back(now);
        seen.len()
    }

    /// In-window count without recording
    pub fn frequency_at(&self, key: &ConnectionKey, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(seen) => {
                prune(seen, now, self.window);
                seen.len()
            }
            None => 0,
        }
    }

    /// Prune every key and drop the ones left empty. Returns keys removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, seen| {
            prune(seen, now, self.window);
            !seen.is_empty()
        });
        before - entries.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.entries.lock().len()
    }
}

impl Default for ConnectionFrequencyTable {
    fn default() -> Self {
        Self::new()
    }
}

fn prune(seen: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = seen.front() {
        if now.saturating_duration_since(*oldest) >= window {
            seen.pop_front();
        } else {
            break;
        }
    }
}
