// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{fmt::Display, future::Future, time::Duration};

use tokio::{
    sync::{Mutex, mpsc},
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::rate_limit::rate_limited;

/// Hard cap on the number of buffered items, independent of the cost threshold.
///
/// Reaching it triggers a flush even if the accumulated cost is still below the threshold, which bounds memory when
/// the cost function under-reports.
pub const MAX_BUFFERED_ITEMS: usize = 10_000;

/// Errors returned by [`BatchAccumulator::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AccumulatorError {
    /// [`BatchAccumulator::stop`] was called, or the accumulation loop exited.
    #[error("batch accumulator is closed")]
    Closed,
    /// The caller's cancellation token fired while waiting for queue capacity.
    #[error("enqueue was cancelled")]
    Cancelled,
}

/// Receives batches from a [`BatchAccumulator`].
///
/// The batch is borrowed: when `flush` returns an error the accumulator keeps the items and offers them again (along
/// with anything accumulated since) on the next trigger. Timer-triggered flushes may pass an empty slice.
pub trait FlushBatch<T>: Send + 'static {
    /// Error reported by a failed flush. It is only logged.
    type Error: Display + Send;

    /// Write out `batch`.
    fn flush(&mut self, batch: &[T]) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Builder for [`BatchAccumulator`]
#[derive(Debug, Clone)]
pub struct BatchAccumulatorBuilder {
    max_queue_size: usize,
    max_cost_threshold: u64,
    flush_interval: Duration,
    name: String,
}

impl Default for BatchAccumulatorBuilder {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            max_cost_threshold: 1_000,
            flush_interval: Duration::from_secs(10),
            name: "batch-accumulator".into(),
        }
    }
}

impl BatchAccumulatorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how many items may wait in the ingress queue before [`BatchAccumulator::enqueue`] starts waiting.
    ///
    /// Defaults to `10_000`. This is the only backpressure producers ever observe.
    pub fn max_queue_size(mut self, max_queue_size: usize) -> Self {
        assert!(max_queue_size > 0, "max_queue_size must not be zero");
        self.max_queue_size = max_queue_size;
        self
    }

    /// Sets the accumulated cost at which the buffer is flushed.
    ///
    /// Defaults to `1_000`.
    pub fn max_cost_threshold(mut self, max_cost_threshold: u64) -> Self {
        assert!(max_cost_threshold > 0, "max_cost_threshold must not be zero");
        self.max_cost_threshold = max_cost_threshold;
        self
    }

    /// Sets how often the buffer is flushed regardless of cost.
    ///
    /// Defaults to every 10 seconds. The flush happens even when nothing was buffered.
    pub fn flush_interval(mut self, flush_interval: Duration) -> Self {
        assert!(
            flush_interval > Duration::ZERO,
            "flush_interval must not be zero"
        );
        self.flush_interval = flush_interval;
        self
    }

    /// Name used in log lines emitted by the accumulation loop.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        assert!(!name.is_empty());
        self.name = name;
        self
    }

    /// Build an accumulator for items of type `T`.
    ///
    /// `cost_fn` computes each item's contribution towards the cost threshold. Nothing runs until
    /// [`BatchAccumulator::start`] is awaited.
    pub fn build<T, C, F>(self, cost_fn: C, flusher: F) -> BatchAccumulator<T, C, F>
    where
        T: Send + 'static,
        C: Fn(&T) -> u64 + Send + Sync + 'static,
        F: FlushBatch<T>,
    {
        let (sender, receiver) = mpsc::channel(self.max_queue_size);
        BatchAccumulator {
            sender,
            stopping: CancellationToken::new(),
            finished: CancellationToken::new(),
            worker: Mutex::new(Some(Worker {
                name: self.name,
                receiver,
                buffer: Vec::new(),
                cost: 0,
                max_cost_threshold: self.max_cost_threshold,
                flush_interval: self.flush_interval,
                cost_fn,
                flusher,
            })),
        }
    }
}

/// Buffers items and hands them to a [`FlushBatch`] in cost-bounded, time-windowed batches.
///
/// Producers call [`enqueue`](Self::enqueue) from any task; a single task runs the loop via
/// [`start`](Self::start). Share it with an `Arc`.
pub struct BatchAccumulator<T, C, F> {
    sender: mpsc::Sender<T>,
    // cancelled by `stop`, observed by both producers and the loop
    stopping: CancellationToken,
    // cancelled once the loop (or `stop` itself) has performed the final flush
    finished: CancellationToken,
    // taken by whichever of `start`/`stop` runs first
    worker: Mutex<Option<Worker<T, C, F>>>,
}

impl<T, C, F> BatchAccumulator<T, C, F>
where
    T: Send + 'static,
    C: Fn(&T) -> u64 + Send + Sync + 'static,
    F: FlushBatch<T>,
{
    /// Enqueue `items`, waiting for queue capacity if needed.
    ///
    /// Returns [`AccumulatorError::Closed`] without waiting once [`stop`](Self::stop) has been called, and
    /// [`AccumulatorError::Cancelled`] if `ctx` fires while waiting. Items accepted before either error remain queued.
    pub async fn enqueue(
        &self,
        ctx: &CancellationToken,
        items: impl IntoIterator<Item = T>,
    ) -> Result<(), AccumulatorError> {
        for item in items {
            tokio::select! {
                biased;
                _ = self.stopping.cancelled() => return Err(AccumulatorError::Closed),
                _ = ctx.cancelled() => return Err(AccumulatorError::Cancelled),
                sent = self.sender.send(item) => {
                    sent.map_err(|_| AccumulatorError::Closed)?;
                }
            }
        }
        Ok(())
    }

    /// Number of items waiting in the ingress queue (not yet in the flush buffer).
    pub fn len(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run the accumulation loop until `ctx` is cancelled or [`stop`](Self::stop) is called.
    ///
    /// Either way the queue is closed, drained and flushed before this returns. Only the first call runs the loop;
    /// later calls return immediately.
    pub async fn start(&self, ctx: CancellationToken) {
        let Some(worker) = self.worker.lock().await.take() else {
            return;
        };
        worker.run(ctx, self.stopping.clone()).await;
        self.finished.cancel();
    }

    /// Stop accepting items, flush everything already accepted, and wait for that flush to complete.
    ///
    /// Call this once.
    pub async fn stop(&self) {
        self.stopping.cancel();
        let idle_worker = self.worker.lock().await.take();
        match idle_worker {
            // the loop was never started, so do its shutdown work here
            Some(worker) => {
                worker.shut_down().await;
                self.finished.cancel();
            }
            None => self.finished.cancelled().await,
        }
    }
}

struct Worker<T, C, F> {
    name: String,
    receiver: mpsc::Receiver<T>,
    buffer: Vec<T>,
    cost: u64,
    max_cost_threshold: u64,
    flush_interval: Duration,
    cost_fn: C,
    flusher: F,
}

impl<T, C, F> Worker<T, C, F>
where
    T: Send + 'static,
    C: Fn(&T) -> u64 + Send + Sync + 'static,
    F: FlushBatch<T>,
{
    async fn run(mut self, ctx: CancellationToken, stopping: CancellationToken) {
        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.flush_interval,
            self.flush_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    tracing::debug!(accumulator = %self.name, "context cancelled, shutting down");
                    break;
                }
                _ = stopping.cancelled() => {
                    tracing::debug!(accumulator = %self.name, "caught stop signal, shutting down");
                    break;
                }
                item = self.receiver.recv() => match item {
                    Some(item) => self.push(item).await,
                    None => break,
                },
                _ = ticker.tick() => self.flush().await,
            }
        }

        self.shut_down().await;
    }

    async fn shut_down(mut self) {
        // close first so that producers blocked on a full queue fail fast instead of racing the drain
        self.receiver.close();
        while let Some(item) = self.receiver.recv().await {
            self.push(item).await;
        }
        if !self.buffer.is_empty() {
            self.flush().await;
        }
        tracing::debug!(accumulator = %self.name, "batch accumulator has shut down");
    }

    async fn push(&mut self, item: T) {
        self.cost = self.cost.saturating_add((self.cost_fn)(&item));
        self.buffer.push(item);
        if self.cost >= self.max_cost_threshold || self.buffer.len() >= MAX_BUFFERED_ITEMS {
            self.flush().await;
        }
    }

    async fn flush(&mut self) {
        let result = self.flusher.flush(&self.buffer).await;
        self.cost = 0;
        match result {
            Ok(()) => self.buffer.clear(),
            Err(err) => {
                rate_limited!(
                    Duration::from_secs(1),
                    tracing::error!(
                        accumulator = %self.name,
                        items = self.buffer.len(),
                        %err,
                        "failed to flush batch, keeping items for the next flush"
                    )
                );
                if self.buffer.len() >= MAX_BUFFERED_ITEMS {
                    tracing::error!(
                        accumulator = %self.name,
                        items = self.buffer.len(),
                        "flush buffer is full after a failed flush, dropping batch"
                    );
                    self.buffer.clear();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        convert::Infallible,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use super::*;

    #[derive(Clone, Default)]
    struct Failing {
        attempts: Arc<AtomicUsize>,
    }

    impl FlushBatch<u32> for Failing {
        type Error = &'static str;

        async fn flush(&mut self, batch: &[u32]) -> Result<(), &'static str> {
            if batch.is_empty() {
                return Ok(());
            }
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err("storage unavailable")
        }
    }

    struct Noop;

    impl FlushBatch<u32> for Noop {
        type Error = Infallible;

        async fn flush(&mut self, _batch: &[u32]) -> Result<(), Infallible> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_flush_retains_buffer_and_resets_cost() {
        let flusher = Failing::default();
        let (_sender, receiver) = mpsc::channel(8);
        let mut worker = Worker {
            name: "test".into(),
            receiver,
            buffer: Vec::new(),
            cost: 0,
            max_cost_threshold: 2,
            flush_interval: Duration::from_secs(3600),
            cost_fn: |_: &u32| 1u64,
            flusher: flusher.clone(),
        };

        worker.push(1).await;
        worker.push(2).await;
        assert_eq!(flusher.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(worker.buffer, vec![1, 2]);
        assert_eq!(worker.cost, 0);

        // the retained items are offered again on the next trigger
        worker.push(3).await;
        assert_eq!(flusher.attempts.load(Ordering::SeqCst), 1);
        worker.push(4).await;
        assert_eq!(flusher.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(worker.buffer, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn failed_flush_drops_buffer_at_hard_cap() {
        let flusher = Failing::default();
        let (_sender, receiver) = mpsc::channel(8);
        let mut worker = Worker {
            name: "test".into(),
            receiver,
            buffer: (0..MAX_BUFFERED_ITEMS as u32 - 1).collect(),
            cost: 0,
            max_cost_threshold: u64::MAX,
            flush_interval: Duration::from_secs(3600),
            cost_fn: |_: &u32| 0u64,
            flusher: flusher.clone(),
        };

        worker.push(0).await;
        assert_eq!(flusher.attempts.load(Ordering::SeqCst), 1);
        assert!(worker.buffer.is_empty());
    }

    #[tokio::test]
    async fn len_counts_queued_items() {
        let accumulator = BatchAccumulatorBuilder::new()
            .max_queue_size(16)
            .build(|_: &u32| 1, Noop);
        let ctx = CancellationToken::new();
        assert!(accumulator.is_empty());
        accumulator.enqueue(&ctx, [1, 2, 3]).await.unwrap();
        assert_eq!(accumulator.len(), 3);
        accumulator.stop().await;
    }

    #[test]
    #[should_panic(expected = "flush_interval must not be zero")]
    fn zero_flush_interval_is_rejected() {
        let _ = BatchAccumulatorBuilder::new().flush_interval(Duration::ZERO);
    }
}
