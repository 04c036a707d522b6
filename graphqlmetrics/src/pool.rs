// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{
    future::Future,
    pin::pin,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use crossbeam_queue::ArrayQueue;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// A unit of background work. It owns everything it needs, so nothing borrowed from the submitter outlives the
/// submission.
pub trait Task: Send + 'static {
    fn run(self) -> impl Future<Output = ()> + Send;
}

type Job = BoxFuture<'static, ()>;

struct Shared {
    queue: ArrayQueue<Job>,
    // guards admission: nothing is pushed once this is false
    open: Mutex<bool>,
    // admitted jobs that have not finished yet
    outstanding: AtomicUsize,
    running: AtomicUsize,
    notify: Notify,
    // fired after `open` is cleared
    stopping: CancellationToken,
    abandon: CancellationToken,
}

/// A fixed set of tokio workers fed from a bounded queue.
///
/// Submission never waits: [`try_submit`](Self::try_submit) either admits the task or refuses it on the spot. At most
/// `workers + queue_capacity` tasks are admitted and unfinished at any time.
pub struct WorkerPool {
    shared: Arc<Shared>,
    tracker: TaskTracker,
    capacity: usize,
}

impl WorkerPool {
    /// Spawn `workers` workers on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// If `workers` is zero, or if called outside a tokio runtime.
    pub fn new(workers: usize, queue_capacity: usize) -> Self {
        assert!(workers > 0, "a worker pool needs at least one worker");
        let capacity = workers.saturating_add(queue_capacity);
        let shared = Arc::new(Shared {
            queue: ArrayQueue::new(capacity),
            open: Mutex::new(true),
            outstanding: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            notify: Notify::new(),
            stopping: CancellationToken::new(),
            abandon: CancellationToken::new(),
        });
        let tracker = TaskTracker::new();
        for _ in 0..workers {
            tracker.spawn(work(Arc::clone(&shared)));
        }
        Self {
            shared,
            tracker,
            capacity,
        }
    }

    /// Admit `task` if there is room and the pool is not stopping. Returns whether it was admitted.
    ///
    /// Admitted tasks run eventually, unless the pool is abandoned by
    /// [`stop_and_wait_for`](Self::stop_and_wait_for) first.
    pub fn try_submit(&self, task: impl Task) -> bool {
        {
            let open = self.shared.open.lock();
            if !*open {
                return false;
            }
            if self.shared.outstanding.fetch_add(1, Ordering::AcqRel) >= self.capacity {
                self.shared.outstanding.fetch_sub(1, Ordering::AcqRel);
                return false;
            }
            if self.shared.queue.push(Box::pin(task.run())).is_err() {
                self.shared.outstanding.fetch_sub(1, Ordering::AcqRel);
                return false;
            }
        }
        self.shared.notify.notify_one();
        true
    }

    /// Stop admitting work and wait up to `deadline` for admitted work to finish.
    ///
    /// Returns `true` if everything finished in time. Otherwise whatever is still queued or running is dropped and
    /// `false` is returned.
    pub async fn stop_and_wait_for(&self, deadline: Duration) -> bool {
        *self.shared.open.lock() = false;
        self.shared.stopping.cancel();
        self.tracker.close();

        if tokio::time::timeout(deadline, self.tracker.wait()).await.is_ok() {
            return true;
        }
        tracing::warn!(
            ?deadline,
            running = self.running(),
            waiting = self.waiting(),
            "worker pool did not drain before the deadline, abandoning remaining work"
        );
        self.shared.abandon.cancel();
        self.tracker.wait().await;
        false
    }

    /// Number of tasks currently executing.
    pub fn running(&self) -> usize {
        self.shared.running.load(Ordering::Relaxed)
    }

    /// Number of admitted tasks not yet picked up by a worker.
    pub fn waiting(&self) -> usize {
        self.shared.queue.len()
    }

    /// Maximum number of admitted, unfinished tasks.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Drop for WorkerPool {
    // workers finish what was admitted, then exit
    fn drop(&mut self) {
        *self.shared.open.lock() = false;
        self.shared.stopping.cancel();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("capacity", &self.capacity)
            .field("running", &self.running())
            .field("waiting", &self.waiting())
            .finish()
    }
}

async fn work(shared: Arc<Shared>) {
    loop {
        let mut notified = pin!(shared.notify.notified());
        notified.as_mut().enable();

        if let Some(job) = shared.queue.pop() {
            shared.running.fetch_add(1, Ordering::Relaxed);
            let abandoned = tokio::select! {
                biased;
                _ = shared.abandon.cancelled() => true,
                _ = job => false,
            };
            shared.running.fetch_sub(1, Ordering::Relaxed);
            shared.outstanding.fetch_sub(1, Ordering::AcqRel);
            if abandoned {
                return;
            }
            continue;
        }

        if shared.stopping.is_cancelled() {
            // admission closed before the token fired, so an empty queue stays empty
            if shared.queue.is_empty() {
                return;
            }
            continue;
        }

        tokio::select! {
            _ = notified => {}
            _ = shared.stopping.cancelled() => {}
            _ = shared.abandon.cancelled() => return,
        }
    }
}
