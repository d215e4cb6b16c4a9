//! Bounded SPSC event dispatcher decoupling the transport/decoder from a
//! strategy consumer.
//!
//! Backed by a [`crossbeam_queue::ArrayQueue`] ring buffer, a lock-free
//! bounded MPMC queue that the rest of this corpus's MQTT/trading code
//! already reaches for (`crossbeam::queue::SegQueue` in the beluga MQTT
//! client, `crossbeam-queue` directly in vibemq) — used here for its
//! lock-free `push`/`pop` on `&self`, which is what lets both `push` and
//! `poll` take a shared reference instead of forcing callers behind a
//! `Mutex<Dispatcher<T>>`.
//!
//! # SPSC contract
//!
//! [`Dispatcher::push`] must only ever be called from a single producer
//! (the decoder), and [`Dispatcher::poll`] only from a single consumer.
//! Counters are single-writer per field, so no locking is needed even
//! though they're read from other threads via [`Dispatcher::stats`] and
//! [`Dispatcher::health`]. Breaking the SPSC contract invalidates these
//! guarantees; the underlying ring buffer tolerates extra concurrent
//! pops (e.g. from `clear`) without memory-unsafety, but the counter
//! invariants in §8 only hold under the documented contract.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;

use crate::error::PollError;

/// Configuration for [`Dispatcher`].
#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    /// Maximum queue length. Oldest events are dropped once exceeded.
    pub maxlen: usize,
    /// EMA smoothing factor for drop rate, in `(0.0, 1.0]`.
    pub ema_alpha: f64,
    /// Drop-rate EMA threshold that triggers a one-shot warning log.
    pub drop_warning_threshold: f64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            maxlen: 100_000,
            ema_alpha: 0.01,
            drop_warning_threshold: 0.01,
        }
    }
}

/// Eventually-consistent snapshot of dispatcher counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatcherStats {
    pub total_pushed: u64,
    pub total_polled: u64,
    pub total_dropped: u64,
    pub queue_len: usize,
    pub maxlen: usize,
}

/// Eventually-consistent snapshot of dispatcher health metrics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatcherHealth {
    pub drop_rate_ema: f64,
    pub queue_utilization: f64,
    pub total_dropped: u64,
    pub total_pushed: u64,
}

/// Bounded, single-producer single-consumer event queue.
///
/// `push`/`poll` take `&self`: the ring buffer itself provides the
/// interior mutability, so the producer and consumer threads never
/// contend on a lock around the whole dispatcher.
pub struct Dispatcher<T> {
    queue: ArrayQueue<T>,
    maxlen: usize,
    ema_alpha: f64,
    drop_warning_threshold: f64,

    total_pushed: AtomicU64,
    total_polled: AtomicU64,
    total_dropped: AtomicU64,
    drop_rate_ema_bits: AtomicU64,
    warned_drop_rate: AtomicBool,
}

impl<T> Dispatcher<T> {
    pub fn new(config: DispatcherConfig) -> Self {
        tracing::info!(maxlen = config.maxlen, "dispatcher created");
        Self {
            queue: ArrayQueue::new(config.maxlen.max(1)),
            maxlen: config.maxlen,
            ema_alpha: config.ema_alpha,
            drop_warning_threshold: config.drop_warning_threshold,
            total_pushed: AtomicU64::new(0),
            total_polled: AtomicU64::new(0),
            total_dropped: AtomicU64::new(0),
            drop_rate_ema_bits: AtomicU64::new(0.0f64.to_bits()),
            warned_drop_rate: AtomicBool::new(false),
        }
    }

    /// Appends an event to the queue, evicting the oldest event if full.
    ///
    /// **Hot path** — producer thread only, lock-free. Updates the
    /// drop-rate EMA and emits a one-shot warning/recovery log when the
    /// EMA crosses `drop_warning_threshold`.
    pub fn push(&self, event: T) {
        let mut dropped = 0.0f64;
        if let Err(rejected) = self.queue.push(event) {
            // Full: evict the oldest entry to make room. As the sole
            // producer we're the only thread that ever does this, so the
            // retry below is guaranteed to find space even if the
            // consumer is concurrently popping its own entries too.
            let _ = self.queue.pop();
            self.total_dropped.fetch_add(1, Ordering::Relaxed);
            dropped = 1.0;
            let _ = self.queue.push(rejected);
        }
        self.total_pushed.fetch_add(1, Ordering::Relaxed);

        let prev_ema = f64::from_bits(self.drop_rate_ema_bits.load(Ordering::Relaxed));
        let ema = self.ema_alpha * dropped + (1.0 - self.ema_alpha) * prev_ema;
        self.drop_rate_ema_bits
            .store(ema.to_bits(), Ordering::Relaxed);

        if ema > self.drop_warning_threshold {
            if !self.warned_drop_rate.swap(true, Ordering::Relaxed) {
                tracing::warn!(
                    drop_rate_ema = ema,
                    threshold = self.drop_warning_threshold,
                    "drop rate EMA exceeds threshold"
                );
            }
        } else if self.warned_drop_rate.swap(false, Ordering::Relaxed) {
            tracing::info!(
                drop_rate_ema = ema,
                threshold = self.drop_warning_threshold,
                "drop rate EMA recovered below threshold"
            );
        }
    }

    /// Consumes up to `max_events` from the front of the queue in FIFO
    /// order. Returns fewer if the queue had fewer, or an empty `Vec` if
    /// empty. Consumer thread only.
    pub fn poll(&self, max_events: usize) -> Result<Vec<T>, PollError> {
        if max_events == 0 {
            return Err(PollError::InvalidMaxEvents(max_events));
        }
        let mut events = Vec::with_capacity(max_events.min(self.queue.len()));
        for _ in 0..max_events {
            match self.queue.pop() {
                Some(event) => events.push(event),
                None => break,
            }
        }
        self.total_polled
            .fetch_add(events.len() as u64, Ordering::Relaxed);
        Ok(events)
    }

    /// Clears the queue and resets all counters. Main thread only, not
    /// concurrent with `push`/`poll`.
    pub fn clear(&self) {
        let mut remaining = 0usize;
        while self.queue.pop().is_some() {
            remaining += 1;
        }
        if remaining > 0 {
            tracing::warn!(remaining, "dispatcher cleared a non-empty queue");
        }
        self.total_pushed.store(0, Ordering::Relaxed);
        self.total_polled.store(0, Ordering::Relaxed);
        self.total_dropped.store(0, Ordering::Relaxed);
        self.drop_rate_ema_bits
            .store(0.0f64.to_bits(), Ordering::Relaxed);
        self.warned_drop_rate.store(false, Ordering::Relaxed);
        tracing::info!("dispatcher cleared");
    }

    /// Lock-free, eventually-consistent snapshot. Any thread.
    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            total_pushed: self.total_pushed.load(Ordering::Relaxed),
            total_polled: self.total_polled.load(Ordering::Relaxed),
            total_dropped: self.total_dropped.load(Ordering::Relaxed),
            queue_len: self.queue.len(),
            maxlen: self.maxlen,
        }
    }

    /// Lock-free, eventually-consistent health snapshot. Any thread.
    pub fn health(&self) -> DispatcherHealth {
        DispatcherHealth {
            drop_rate_ema: f64::from_bits(self.drop_rate_ema_bits.load(Ordering::Relaxed)),
            queue_utilization: self.queue.len() as f64 / self.maxlen as f64,
            total_dropped: self.total_dropped.load(Ordering::Relaxed),
            total_pushed: self.total_pushed.load(Ordering::Relaxed),
        }
    }

    /// `total_pushed - total_dropped - total_polled == queue_len` under
    /// quiescence. Test/debug helper.
    fn invariant_ok(&self) -> bool {
        let pushed = self.total_pushed.load(Ordering::Relaxed) as i64;
        let dropped = self.total_dropped.load(Ordering::Relaxed) as i64;
        let polled = self.total_polled.load(Ordering::Relaxed) as i64;
        pushed - dropped - polled == self.queue.len() as i64
    }
}
