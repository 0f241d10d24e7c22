use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use tokio::sync::{broadcast, RwLock};

use crate::config::{LOG_BROADCAST_CAPACITY, RAW_LOG_BUFFER_SIZE};

/// Free-text line from the backend's structured test log.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RawLogLine {
    /// Position of the line in the log artifact (1-based).
    pub line: usize,
    pub timestamp: Option<DateTime<Utc>>,
    pub message: String,
}

/// Fixed-capacity FIFO; the oldest entry is dropped once full.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.capacity == 0 {
            return;
        }
        if self.items.len() >= self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.items.iter()
    }
}

/// Shared raw-log buffer plus a live feed for SSE subscribers.
pub struct LogState {
    buffer: RwLock<RingBuffer<RawLogLine>>,
    sender: broadcast::Sender<RawLogLine>,
}

impl Default for LogState {
    fn default() -> Self {
        Self::new()
    }
}

impl LogState {
    pub fn new() -> Self {
        Self::with_capacity(RAW_LOG_BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(LOG_BROADCAST_CAPACITY);
        Self {
            buffer: RwLock::new(RingBuffer::with_capacity(capacity)),
            sender,
        }
    }

    pub async fn push(&self, entry: RawLogLine) {
        self.buffer.write().await.push(entry.clone());
        let _ = self.sender.send(entry);
    }

    pub async fn extend(&self, entries: Vec<RawLogLine>) {
        if entries.is_empty() {
            return;
        }
        let mut buf = self.buffer.write().await;
        for entry in entries {
            buf.push(entry.clone());
            let _ = self.sender.send(entry);
        }
    }

    /// Buffered entries, oldest first.
    pub async fn history(&self) -> Vec<RawLogLine> {
        self.buffer.read().await.iter().cloned().collect()
    }

    pub async fn clear(&self) {
        self.buffer.write().await.clear();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RawLogLine> {
        self.sender.subscribe()
    }
}
