//! Work queues the engine runs its stages on.
//!
//! Each [`StageExecutor`] bounds the number of concurrently running tasks with a semaphore.
//! Tasks beyond that bound wait for a permit in FIFO order. All stages of one generation share a
//! [`CancellationToken`] and a [`TaskTracker`], so [`Stages::shutdown`] can interrupt and await
//! everything that was spawned on them.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::pending::{Stage, TaskHandle};

/// A resizable bound on concurrently running tasks.
#[derive(Debug)]
pub struct StageExecutor {
    stage: Stage,
    semaphore: Semaphore,
    size: Mutex<usize>,
    /// Permits held by running tasks that are forgotten instead of returned.
    retiring: AtomicUsize,
}

impl StageExecutor {
    pub fn new(stage: Stage, size: usize) -> Self {
        let size = size.max(1);
        Self {
            stage,
            semaphore: Semaphore::new(size),
            size: Mutex::new(size),
            retiring: AtomicUsize::new(0),
        }
    }

    /// The number of tasks allowed to run at the same time.
    pub fn size(&self) -> usize {
        *self.size.lock().unwrap()
    }

    /// The number of tasks that could start right now.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Changes the number of tasks allowed to run at the same time.
    ///
    /// Growing takes effect immediately. Shrinking never interrupts running tasks: permits held by
    /// them are retired as they are returned, before any queued task can pick them up.
    pub fn resize(&self, size: usize) {
        let size = size.max(1);
        let mut current = self.size.lock().unwrap();
        if size == *current {
            return;
        }

        tracing::debug!(
            "Resizing {} executor from {} to {}",
            self.stage.as_str(),
            *current,
            size
        );

        if size > *current {
            let grow = size - *current;
            let kept = self.take_retiring(grow);
            self.semaphore.add_permits(grow - kept);
        } else {
            let excess = *current - size;
            let retired = self.semaphore.forget_permits(excess);
            self.retiring.fetch_add(excess - retired, Ordering::SeqCst);
        }
        *current = size;
    }

    /// Cancels up to `max` pending retirements, returning how many were cancelled.
    fn take_retiring(&self, max: usize) -> usize {
        let previous = self
            .retiring
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |retiring| {
                Some(retiring.saturating_sub(max))
            })
            .unwrap_or_default();
        previous.min(max)
    }

    /// Waits for a free slot, then runs `future` in it.
    async fn run<F: Future>(&self, future: F) -> F::Output {
        // The semaphore is never closed.
        let permit = self.semaphore.acquire().await.ok();
        let _slot = Slot {
            executor: self,
            permit,
        };
        future.await
    }
}

/// A running task's permit, retired on drop if the executor shrank in the meantime.
struct Slot<'a> {
    executor: &'a StageExecutor,
    permit: Option<SemaphorePermit<'a>>,
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            if self.executor.take_retiring(1) == 1 {
                permit.forget();
            }
        }
    }
}

/// The four executors of one engine generation.
#[derive(Debug)]
pub struct Stages {
    runtime: Handle,
    token: CancellationToken,
    tracker: TaskTracker,

    dispatch: Arc<StageExecutor>,
    disk: Arc<StageExecutor>,
    staleness: Arc<StageExecutor>,
    download: Arc<StageExecutor>,
}

impl Stages {
    /// Creates fresh executors on `runtime`.
    ///
    /// Dispatch, disk and staleness each run one task at a time, downloads run `download_workers`.
    pub fn new(runtime: Handle, download_workers: usize) -> Self {
        Self {
            runtime,
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),

            dispatch: Arc::new(StageExecutor::new(Stage::Dispatch, 1)),
            disk: Arc::new(StageExecutor::new(Stage::Disk, 1)),
            staleness: Arc::new(StageExecutor::new(Stage::Staleness, 1)),
            download: Arc::new(StageExecutor::new(Stage::Download, download_workers)),
        }
    }

    pub fn executor(&self, stage: Stage) -> &StageExecutor {
        match stage {
            Stage::Dispatch => &self.dispatch,
            Stage::Disk => &self.disk,
            Stage::Staleness => &self.staleness,
            Stage::Download => &self.download,
        }
    }

    pub fn resize_downloads(&self, workers: usize) {
        self.download.resize(workers);
    }

    /// Queues `future` on the executor for `stage`.
    ///
    /// The future is dropped without completing once these stages shut down.
    pub fn spawn<F>(&self, stage: Stage, future: F) -> TaskHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let executor = Arc::clone(match stage {
            Stage::Dispatch => &self.dispatch,
            Stage::Disk => &self.disk,
            Stage::Staleness => &self.staleness,
            Stage::Download => &self.download,
        });
        let token = self.token.clone();

        let task = async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    tracing::trace!("{} task interrupted by shutdown", stage.as_str());
                }
                _ = executor.run(future) => {}
            }
        };
        let handle = self.tracker.spawn_on(task, &self.runtime);

        TaskHandle::new(stage, handle.abort_handle())
    }

    /// Interrupts every task, then waits up to `timeout` for all of them to finish.
    pub async fn shutdown(&self, timeout: Duration) {
        self.token.cancel();
        self.tracker.close();

        if tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                "{} tasks still running after {}",
                self.tracker.len(),
                humantime::format_duration(timeout)
            );
        }
    }
}
