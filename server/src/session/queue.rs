//! Bounded per-session frame queue
//!
//! Sits between a session's reader and its processing task. When full,
//! [`QueuePolicy::Block`] suspends the reader and [`QueuePolicy::DropOldest`]
//! evicts the oldest queued frame.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::config::QueuePolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueClosed;

struct QueueState {
    frames: VecDeque<Vec<u8>>,
    closed: bool,
}

/// Single-producer, single-consumer frame queue
pub struct FrameQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    policy: QueuePolicy,
    not_empty: Notify,
    not_full: Notify,
    dropped: AtomicU64,
}

impl FrameQueue {
    pub fn new(capacity: usize, policy: QueuePolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                frames: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            capacity,
            policy,
            not_empty: Notify::new(),
            not_full: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue one frame, applying the overflow policy
    pub async fn push(&self, frame: Vec<u8>) -> Result<(), QueueClosed> {
        let mut frame = Some(frame);
        loop {
            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(QueueClosed);
                }
                if state.frames.len() >= self.capacity && self.policy == QueuePolicy::DropOldest {
                    state.frames.pop_front();
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                if state.frames.len() < self.capacity {
                    if let Some(frame) = frame.take() {
                        state.frames.push_back(frame);
                    }
                    drop(state);
                    self.not_empty.notify_one();
                    return Ok(());
                }
            }
            // Full under Block: wait for the consumer
            self.not_full.notified().await;
        }
    }

    /// Next frame in order; `None` once closed and drained
    pub async fn pop(&self) -> Option<Vec<u8>> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(frame) = state.frames.pop_front() {
                    drop(state);
                    self.not_full.notify_one();
                    return Some(frame);
                }
                if state.closed {
                    return None;
                }
            }
            self.not_empty.notified().await;
        }
    }

    /// Stop accepting frames. Queued frames can still be popped.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_one();
        self.not_full.notify_one();
    }

    pub fn len(&self) -> usize {
        self.state.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames evicted by the drop-oldest policy
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
