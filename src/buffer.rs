//! Bounded in-memory event buffers, one per event kind.

use crate::config::BufferConfig;
use crate::model::{KeyRecord, MouseRecord, TerminalCommandRecord, WindowRecord};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

/// The event kinds that get their own buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferKind {
    Keys,
    Mouse,
    Windows,
    Terminal,
}

impl BufferKind {
    pub const ALL: [BufferKind; 4] = [
        BufferKind::Keys,
        BufferKind::Mouse,
        BufferKind::Windows,
        BufferKind::Terminal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BufferKind::Keys => "keys",
            BufferKind::Mouse => "mouse",
            BufferKind::Windows => "windows",
            BufferKind::Terminal => "terminal",
        }
    }
}

impl fmt::Display for BufferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// FIFO accumulator shared by many producers and one drainer.
///
/// Holds at most `capacity` events; pushing into a full buffer evicts the
/// oldest event and counts it as dropped.
pub struct EventBuffer<T> {
    kind: BufferKind,
    events: Mutex<VecDeque<T>>,
    threshold: usize,
    capacity: usize,
    dropped: AtomicU64,
}

impl<T> EventBuffer<T> {
    pub fn new(kind: BufferKind, threshold: usize, capacity: usize) -> Self {
        Self {
            kind,
            events: Mutex::new(VecDeque::new()),
            threshold: threshold.max(1),
            capacity: capacity.max(threshold).max(1),
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an event, returning whether the flush threshold is now reached.
    pub fn push(&self, event: T) -> bool {
        let mut events = self.lock();
        if events.len() >= self.capacity {
            events.pop_front();
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            // One warning per thousand drops keeps a sustained overflow readable
            if dropped == 1 || dropped % 1000 == 0 {
                tracing::warn!(
                    kind = %self.kind,
                    capacity = self.capacity,
                    dropped_total = dropped,
                    "buffer full, dropping oldest event"
                );
            }
        }
        events.push_back(event);
        events.len() >= self.threshold
    }

    pub fn should_flush(&self) -> bool {
        self.len() >= self.threshold
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Atomically take every buffered event, oldest first.
    pub fn drain(&self) -> Vec<T> {
        self.lock().drain(..).collect()
    }

    /// Put a batch that failed to persist back in front of newer events.
    ///
    /// If the merged contents exceed capacity, the oldest events are dropped
    /// and the number dropped is returned.
    pub fn restore(&self, batch: Vec<T>) -> usize {
        if batch.is_empty() {
            return 0;
        }

        let mut events = self.lock();
        let newer = std::mem::take(&mut *events);
        let mut merged: VecDeque<T> = batch.into();
        merged.extend(newer);

        let overflow = merged.len().saturating_sub(self.capacity);
        if overflow > 0 {
            merged.drain(..overflow);
            let total = self.dropped.fetch_add(overflow as u64, Ordering::Relaxed) + overflow as u64;
            tracing::warn!(
                kind = %self.kind,
                dropped = overflow,
                dropped_total = total,
                "buffer over capacity after failed flush, dropped oldest events"
            );
        }
        *events = merged;
        overflow
    }

    /// Events evicted because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<T> fmt::Debug for EventBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBuffer")
            .field("kind", &self.kind)
            .field("len", &self.len())
            .field("threshold", &self.threshold)
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Number of events waiting in each buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferedCounts {
    pub keys: usize,
    pub mouse: usize,
    pub windows: usize,
    pub terminal: usize,
}

impl BufferedCounts {
    pub fn total(&self) -> usize {
        self.keys + self.mouse + self.windows + self.terminal
    }
}

/// One buffer per event kind, each behind its own lock.
#[derive(Debug)]
pub struct Buffers {
    pub keys: EventBuffer<KeyRecord>,
    pub mouse: EventBuffer<MouseRecord>,
    pub windows: EventBuffer<WindowRecord>,
    pub terminal: EventBuffer<TerminalCommandRecord>,
}

impl Buffers {
    pub fn new(config: &BufferConfig) -> Self {
        let capacity = config.max_buffered_events;
        Self {
            keys: EventBuffer::new(BufferKind::Keys, config.keys, capacity),
            mouse: EventBuffer::new(BufferKind::Mouse, config.mouse, capacity),
            windows: EventBuffer::new(BufferKind::Windows, config.windows, capacity),
            terminal: EventBuffer::new(BufferKind::Terminal, config.terminal, capacity),
        }
    }

    pub fn counts(&self) -> BufferedCounts {
        BufferedCounts {
            keys: self.keys.len(),
            mouse: self.mouse.len(),
            windows: self.windows.len(),
            terminal: self.terminal.len(),
        }
    }

    /// Events evicted by overflow across all buffers.
    pub fn dropped(&self) -> u64 {
        self.keys.dropped() + self.mouse.dropped() + self.windows.dropped() + self.terminal.dropped()
    }

    /// Discard everything still buffered, returning how many events that was.
    pub fn discard(&self) -> usize {
        self.keys.drain().len()
            + self.mouse.drain().len()
            + self.windows.drain().len()
            + self.terminal.drain().len()
    }
}
