//! Moves buffered records into the event sink.

use crate::buffer::{BufferKind, Buffers, EventBuffer};
use crate::config::RetryConfig;
use crate::model::Persist;
use crate::storage::EventSink;
use crate::transparency::{Counter, SharedTransparencyLog};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Result of one flush attempt for one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was buffered
    Empty,
    /// The whole batch was written
    Written(usize),
    /// Skipped because the buffer is backing off after a failure
    Deferred,
    /// The write failed and the batch was put back
    Failed,
}

/// Per-kind retry state after failed writes.
#[derive(Debug, Default)]
struct Backoff {
    failures: u32,
    retry_at: Option<Instant>,
}

impl Backoff {
    fn ready(&self, now: Instant) -> bool {
        self.retry_at.map_or(true, |at| now >= at)
    }

    fn fail(&mut self, retry: &RetryConfig, now: Instant) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let delay = backoff_delay(retry, self.failures);
        self.retry_at = Some(now + delay);
        delay
    }

    fn reset(&mut self) {
        self.failures = 0;
        self.retry_at = None;
    }
}

/// `initial * 2^(failures-1)`, capped at `max`.
pub(crate) fn backoff_delay(retry: &RetryConfig, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(20);
    retry
        .initial_backoff
        .saturating_mul(1u32 << exponent)
        .min(retry.max_backoff)
}

/// Drains buffers into the sink.
///
/// A flush either writes the whole drained batch or restores it in front of
/// the buffer. Flushes of the same kind are serialized by the kind's backoff
/// lock; different kinds flush independently.
pub struct Flusher {
    sink: Arc<dyn EventSink>,
    buffers: Arc<Buffers>,
    retry: RetryConfig,
    backoff: [Mutex<Backoff>; 4],
    transparency: SharedTransparencyLog,
}

impl Flusher {
    pub fn new(
        sink: Arc<dyn EventSink>,
        buffers: Arc<Buffers>,
        retry: RetryConfig,
        transparency: SharedTransparencyLog,
    ) -> Self {
        Self {
            sink,
            buffers,
            retry,
            backoff: Default::default(),
            transparency,
        }
    }

    fn backoff(&self, kind: BufferKind) -> MutexGuard<'_, Backoff> {
        let slot = &self.backoff[kind as usize];
        match slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Flush one buffer. `force` ignores any pending backoff.
    pub fn flush_kind(&self, kind: BufferKind, force: bool) -> FlushOutcome {
        match kind {
            BufferKind::Keys => self.flush_buffer(&self.buffers.keys, force),
            BufferKind::Mouse => self.flush_buffer(&self.buffers.mouse, force),
            BufferKind::Windows => self.flush_buffer(&self.buffers.windows, force),
            BufferKind::Terminal => self.flush_buffer(&self.buffers.terminal, force),
        }
    }

    /// Flush every buffer, returning the outcome per kind.
    pub fn flush_all(&self, force: bool) -> Vec<(BufferKind, FlushOutcome)> {
        BufferKind::ALL
            .iter()
            .map(|kind| (*kind, self.flush_kind(*kind, force)))
            .collect()
    }

    /// Whether `kind` is waiting out a backoff period.
    pub fn is_backing_off(&self, kind: BufferKind) -> bool {
        !self.backoff(kind).ready(Instant::now())
    }

    fn flush_buffer<T: Persist>(&self, buffer: &EventBuffer<T>, force: bool) -> FlushOutcome {
        let mut backoff = self.backoff(T::KIND);
        let now = Instant::now();
        if !force && !backoff.ready(now) {
            return FlushOutcome::Deferred;
        }

        let batch = buffer.drain();
        if batch.is_empty() {
            return FlushOutcome::Empty;
        }

        match T::persist(self.sink.as_ref(), &batch) {
            Ok(written) => {
                if backoff.failures > 0 {
                    tracing::info!(kind = %T::KIND, failures = backoff.failures, "storage recovered");
                }
                backoff.reset();
                self.transparency.record(Counter::RowsWritten, written as u64);
                tracing::debug!(kind = %T::KIND, rows = written, "flushed buffer");
                FlushOutcome::Written(written)
            }
            Err(e) => {
                let size = batch.len();
                let delay = backoff.fail(&self.retry, now);
                buffer.restore(batch);
                self.transparency.increment(Counter::FlushFailures);
                tracing::warn!(
                    kind = %T::KIND,
                    batch = size,
                    failures = backoff.failures,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "flush failed, batch kept for retry"
                );
                FlushOutcome::Failed
            }
        }
    }
}
