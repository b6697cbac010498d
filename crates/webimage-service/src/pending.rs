//! The ledger of in-flight loads.
//!
//! There is at most one [`PendingTask`] per [`CacheKey`], and every listener is attached to at
//! most one task. Both maps live behind a single lock, and a task is removed in the same critical
//! section that observes its listener set becoming empty or that takes its listeners for delivery.
//! Tasks the engine installs for itself start out without listeners and stay until delivered.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::task::AbortHandle;

use crate::caching::CacheKey;
use crate::types::{Listener, ListenerId, Outcome, Request};

/// The executor a task is currently running on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Dispatch,
    Disk,
    Staleness,
    Download,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Dispatch => "dispatch",
            Stage::Disk => "disk",
            Stage::Staleness => "staleness",
            Stage::Download => "download",
        }
    }
}

/// A cancellable handle to the stage currently running for a task.
#[derive(Debug)]
pub struct TaskHandle {
    stage: Stage,
    abort: AbortHandle,
}

impl TaskHandle {
    pub fn new(stage: Stage, abort: AbortHandle) -> Self {
        Self { stage, abort }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Stops the stage, unless it is a download.
    ///
    /// Downloads run to completion so the transferred data still lands in the disk tier.
    pub fn cancel(&self) {
        if self.stage != Stage::Download {
            self.abort.abort();
        }
    }
}

/// Distinguishes successive tasks for the same key.
///
/// Stages hold on to the id they were started for, so a stage of a cancelled task can never
/// deliver to, or replace the handle of, a newer task for the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

/// Result of [`PendingTable::try_attach`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attach {
    /// A task for the key is already running, the listener was added to it.
    AlreadyPending,
    /// A new task was installed, the caller has to start it.
    NeedsTask(TaskId),
}

#[derive(Debug)]
struct PendingTask<T> {
    id: TaskId,
    request: Request,
    handle: Option<TaskHandle>,
    listeners: HashMap<ListenerId, Listener<T>>,
}

#[derive(Debug)]
struct Inner<T> {
    tasks: HashMap<CacheKey, PendingTask<T>>,
    listeners: HashMap<ListenerId, CacheKey>,
}

impl<T> Inner<T> {
    /// Removes `listener` from the task it is attached to, cancelling and removing the task if
    /// it was the last one.
    fn detach(&mut self, listener: ListenerId) -> Option<Listener<T>> {
        let key = self.listeners.remove(&listener)?;
        let Some(task) = self.tasks.get_mut(&key) else {
            panic!("{listener} is attached to `{key}`, which has no pending task");
        };
        let Some(removed) = task.listeners.remove(&listener) else {
            panic!("{listener} is attached to `{key}`, but missing from its listeners");
        };

        if task.listeners.is_empty() {
            tracing::debug!("No listeners left for `{}`, cancelling", task.request.source());
            if let Some(handle) = task.handle.take() {
                handle.cancel();
            }
            self.tasks.remove(&key);
        }

        Some(removed)
    }
}

/// The deduplication ledger.
#[derive(Debug)]
pub struct PendingTable<T> {
    inner: Mutex<Inner<T>>,
    next_task: AtomicU64,
}

impl<T> Default for PendingTable<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                tasks: HashMap::new(),
                listeners: HashMap::new(),
            }),
            next_task: AtomicU64::new(0),
        }
    }
}

impl<T> PendingTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches `listener` to the task for `request`.
    ///
    /// A listener attached to a different task is detached from it first, without being notified.
    /// If no task exists for the key, a task without a running stage is installed and
    /// [`Attach::NeedsTask`] is returned. The caller is then responsible for either starting it
    /// via [`register_task`](Self::register_task), or finishing it via [`deliver`](Self::deliver).
    pub fn try_attach(&self, request: &Request, listener: Listener<T>) -> Attach {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let listener_id = listener.id();
        let key = request.key();

        let attached_elsewhere = inner
            .listeners
            .get(&listener_id)
            .is_some_and(|attached| attached != key);
        if attached_elsewhere {
            inner.detach(listener_id);
        }

        if let Some(task) = inner.tasks.get_mut(key) {
            task.listeners.insert(listener_id, listener);
            inner.listeners.insert(listener_id, key.clone());
            return Attach::AlreadyPending;
        }

        let id = TaskId(self.next_task.fetch_add(1, Ordering::Relaxed));
        let task = PendingTask {
            id,
            request: request.clone(),
            handle: None,
            listeners: HashMap::from([(listener_id, listener)]),
        };
        inner.tasks.insert(key.clone(), task);
        inner.listeners.insert(listener_id, key.clone());

        Attach::NeedsTask(id)
    }

    /// Installs a task for `request` without any listener, unless one is already pending.
    ///
    /// This is used for loads the engine starts on its own. Listeners of later requests join the
    /// task like any other. The task only goes away through [`deliver`](Self::deliver), or once
    /// the last of those listeners is detached.
    pub fn try_install(&self, request: &Request) -> Option<TaskId> {
        let mut inner = self.inner.lock().unwrap();
        let key = request.key();
        if inner.tasks.contains_key(key) {
            return None;
        }

        let id = TaskId(self.next_task.fetch_add(1, Ordering::Relaxed));
        let task = PendingTask {
            id,
            request: request.clone(),
            handle: None,
            listeners: HashMap::new(),
        };
        inner.tasks.insert(key.clone(), task);

        Some(id)
    }

    /// Starts the first stage of a task installed by [`try_attach`](Self::try_attach) or
    /// [`try_install`](Self::try_install).
    ///
    /// `spawn` runs while the table is locked, and only if the task is still pending. Returns
    /// whether it ran.
    pub fn register_task<F>(&self, key: &CacheKey, id: TaskId, spawn: F) -> bool
    where
        F: FnOnce() -> TaskHandle,
    {
        let mut inner = self.inner.lock().unwrap();
        match inner.tasks.get_mut(key) {
            Some(task) if task.id == id => {
                debug_assert!(task.handle.is_none(), "task for `{key}` started twice");
                task.handle = Some(spawn());
                true
            }
            _ => false,
        }
    }

    /// Moves a pending task to its next stage, keeping its listeners.
    ///
    /// `spawn` runs while the table is locked, and only if the task is still pending. Returns
    /// whether it ran.
    pub fn swap_task<F>(&self, key: &CacheKey, id: TaskId, spawn: F) -> bool
    where
        F: FnOnce() -> TaskHandle,
    {
        let mut inner = self.inner.lock().unwrap();
        match inner.tasks.get_mut(key) {
            Some(task) if task.id == id => {
                task.handle = Some(spawn());
                true
            }
            _ => false,
        }
    }

    /// Removes `listener` from its task.
    ///
    /// Returns `None` if the listener was not attached to any task.
    ///
    /// # Panics
    ///
    /// Panics if the ledger and the task it points to disagree about the listener.
    pub fn detach(&self, listener: ListenerId) -> Option<Listener<T>> {
        self.inner.lock().unwrap().detach(listener)
    }

    /// Finishes the task `id` for `key`, sending `outcome` to every listener.
    ///
    /// Returns `false` without sending anything if that task is no longer pending.
    pub fn deliver(&self, key: &CacheKey, id: TaskId, outcome: Outcome<T>) -> bool {
        let task = {
            let mut inner = self.inner.lock().unwrap();
            if inner.tasks.get(key).is_none_or(|task| task.id != id) {
                return false;
            }
            let Some(task) = inner.tasks.remove(key) else {
                return false;
            };
            for listener in task.listeners.keys() {
                inner.listeners.remove(listener);
            }
            task
        };

        tracing::trace!(
            "Delivering `{}` to {} listeners",
            task.request.source(),
            task.listeners.len()
        );
        for listener in task.listeners.into_values() {
            listener.send(outcome.clone());
        }
        true
    }

    /// Cancels every task and sends [`Outcome::Cancelled`] to every listener.
    pub fn clear_all(&self) {
        let tasks = {
            let mut inner = self.inner.lock().unwrap();
            inner.listeners.clear();
            std::mem::take(&mut inner.tasks)
        };

        for task in tasks.into_values() {
            if let Some(handle) = &task.handle {
                handle.cancel();
            }
            for listener in task.listeners.into_values() {
                listener.send(Outcome::Cancelled);
            }
        }
    }

    /// Whether a task for `key` is pending.
    pub fn is_pending(&self, key: &CacheKey) -> bool {
        self.inner.lock().unwrap().tasks.contains_key(key)
    }

    /// The stage the task for `key` is running on, if it has been started.
    pub fn stage(&self, key: &CacheKey) -> Option<Stage> {
        let inner = self.inner.lock().unwrap();
        inner.tasks.get(key)?.handle.as_ref().map(TaskHandle::stage)
    }

    /// The number of pending tasks.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
