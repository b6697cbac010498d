//! The load engine.
//!
//! Every request walks through the same state machine:
//!
//! ```text
//! load ──► memory hit ─────────────────────────────────────────────► delivered
//!   │
//!   └────► dispatch ──► disk ──────────────────────────────────────► delivered
//!                 │       ▲  └─(entry older than recheck age)─► staleness check
//!                 │       │
//!                 └──► download
//! ```
//!
//! Requests for the same key share one pending task in the [`PendingTable`], whose listeners all
//! receive the same [`Outcome`]. Each stage runs on its own executor, see [`Stages`].
//!
//! A staleness check asks the origin for the entry's expiry. A fresh entry has its `mtime` reset,
//! an expired one (or one without a usable expiry) is removed from both tiers and fetched again
//! through a pending task of its own, which later requests for the key join. A failing check keeps
//! the entry, it is checked again on its next read.

use std::collections::HashSet;
use std::error::Error;
use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use anyhow::Context;
use tokio::runtime::Handle;
use url::Url;

use crate::caching::{CacheContents, CacheKey, CleanupStats, DiskCache, LoadError, MemoryCache};
use crate::config::{CacheConfig, Config};
use crate::decoder::Decoder;
use crate::download::{Fetcher, HttpFetcher};
use crate::pending::{Attach, PendingTable, Stage, TaskId};
use crate::pool::{NetworkClass, PoolSizer};
use crate::stages::Stages;
use crate::types::{Listener, ListenerId, Outcome, Request, Response, Subscription};
use crate::utils::defer::defer;

#[derive(Debug)]
struct ExecutorState {
    sizer: PoolSizer,
    network_class: NetworkClass,
    /// The current generation of executors, created by the first load after startup or shutdown.
    stages: Option<Arc<Stages>>,
}

impl ExecutorState {
    fn download_workers(&self) -> usize {
        self.sizer.workers_for(self.network_class)
    }

    fn apply(&self) {
        let workers = self.download_workers();
        if let Some(stages) = &self.stages {
            stages.resize_downloads(workers);
        }
        metric!(gauge("download.workers") = workers as u64);
    }
}

struct EngineInner<D: Decoder> {
    caches: CacheConfig,
    shutdown_timeout: Duration,

    decoder: D,
    fetcher: Arc<dyn Fetcher>,
    disk: DiskCache,
    memory: MemoryCache<D::Item>,
    pending: PendingTable<D::Item>,

    /// Keys with a running staleness check.
    refreshes: Mutex<HashSet<CacheKey>>,

    runtime: Handle,
    state: Mutex<ExecutorState>,
}

/// Loads remote resources through the memory tier, the disk tier and the network.
///
/// Cloning an engine is cheap, all clones share the same caches and executors.
pub struct Engine<D: Decoder> {
    inner: Arc<EngineInner<D>>,
}

impl<D: Decoder> Clone for Engine<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Decoder> std::fmt::Debug for Engine<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("disk", &self.inner.disk)
            .field("memory", &self.inner.memory)
            .field("pending", &self.inner.pending.len())
            .finish()
    }
}

impl<D: Decoder> Engine<D> {
    /// Creates an engine spawning its work on `runtime`.
    ///
    /// This creates the disk tier below `config.cache_dir` and removes temporary files left behind
    /// by a previous process.
    pub fn new<F: Fetcher>(
        config: &Config,
        decoder: D,
        fetcher: F,
        runtime: Handle,
    ) -> io::Result<Self> {
        let disk = DiskCache::from_config(config)?;
        disk.clear_tmp()?;

        let memory = MemoryCache::new(&config.caches, D::weight);

        let state = ExecutorState {
            sizer: PoolSizer::new(config.downloads.max_workers),
            network_class: config.downloads.network_class,
            stages: None,
        };

        let inner = EngineInner {
            caches: config.caches,
            shutdown_timeout: config.shutdown_timeout,
            decoder,
            fetcher: Arc::new(fetcher),
            disk,
            memory,
            pending: PendingTable::new(),
            refreshes: Mutex::new(HashSet::new()),
            runtime,
            state: Mutex::new(state),
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Creates an engine fetching over HTTP, running on the current tokio runtime.
    pub fn with_http(config: &Config, decoder: D) -> anyhow::Result<Self> {
        let fetcher =
            HttpFetcher::from_config(&config.downloads).context("failed to create HTTP client")?;
        let runtime = Handle::try_current().context("engine requires a tokio runtime")?;

        Self::new(config, decoder, fetcher, runtime).context("failed to set up disk cache")
    }

    /// Requests `request` on behalf of `listener`.
    ///
    /// The listener receives exactly one outcome for this request, unless it is registered for a
    /// different request before that, in which case it silently stops listening to this one. A
    /// memory hit is delivered before this returns.
    pub fn load(&self, request: Request, listener: Listener<D::Item>) -> Subscription {
        metric!(counter("engine.load") += 1);
        let subscription = Subscription::new(listener.id(), request.key().clone());

        match self.inner.pending.try_attach(&request, listener) {
            Attach::AlreadyPending => {
                metric!(counter("engine.dedup") += 1);
                tracing::trace!("Joining pending load of `{}`", request.source());
            }
            Attach::NeedsTask(id) => self.inner.start(request, id),
        }

        subscription
    }

    /// Stops `listener` from listening, delivering [`Outcome::Cancelled`] to it.
    ///
    /// Does nothing if the listener is not waiting for any request. A load without listeners is
    /// stopped, except for a running download, which still populates the disk tier.
    pub fn cancel(&self, listener: ListenerId) {
        if let Some(listener) = self.inner.pending.detach(listener) {
            listener.send(Outcome::Cancelled);
        }
    }

    /// Cancels every pending load, see [`cancel`](Self::cancel).
    pub fn cancel_all(&self) {
        self.inner.pending.clear_all();
    }

    /// Changes the number of download workers used on unmetered networks.
    pub fn set_max_download_workers(&self, max_workers: usize) {
        let mut state = self.inner.state.lock().unwrap();
        state.sizer = PoolSizer::new(max_workers);
        state.apply();
    }

    /// Resizes the download executor for the new network conditions.
    ///
    /// Queued and running downloads are kept.
    pub fn on_network_class_changed(&self, network_class: NetworkClass) {
        tracing::debug!("Network class changed to {}", network_class.as_str());
        let mut state = self.inner.state.lock().unwrap();
        state.network_class = network_class;
        state.apply();
    }

    /// The number of downloads allowed to run at the same time.
    pub fn download_workers(&self) -> usize {
        let state = self.inner.state.lock().unwrap();
        match &state.stages {
            Some(stages) => stages.executor(Stage::Download).size(),
            None => state.download_workers(),
        }
    }

    /// Removes disk entries whose age exceeds `max_age`, or all of them for a zero `max_age`.
    ///
    /// Both ages are truncated to whole seconds before comparing: with a `max_age` of 10 seconds,
    /// an entry is removed once it is 11 seconds old. Sub-second parts of `max_age` are ignored.
    pub fn evict_disk_older_than(&self, max_age: Duration) -> io::Result<CleanupStats> {
        self.inner.disk.evict_older_than(max_age)
    }

    /// Removes every disk entry.
    pub fn evict_disk(&self) -> io::Result<CleanupStats> {
        self.evict_disk_older_than(Duration::ZERO)
    }

    /// Removes disk entries older than the configured maximum age.
    pub fn evict_disk_expired(&self) -> io::Result<CleanupStats> {
        self.evict_disk_older_than(self.inner.caches.max_age)
    }

    /// Drops every entry of the memory tier.
    pub fn clear_memory(&self) {
        self.inner.memory.clear();
    }

    /// Removes the resource at `source` from both tiers.
    pub fn evict(&self, source: &Url) -> io::Result<()> {
        let key = CacheKey::from_url(source);
        self.inner.memory.remove(&key);
        self.inner.disk.delete(&key)?;
        Ok(())
    }

    /// Whether the resource at `source` is present in either tier.
    pub fn is_cached(&self, source: &Url) -> bool {
        let key = CacheKey::from_url(source);
        self.inner.memory.contains(&key) || self.inner.disk.exists(&key)
    }

    /// Cancels every pending load and stops the executors.
    ///
    /// Waits up to the configured shutdown timeout for running work to wind down. Calling this
    /// again is a no-op, and the next [`load`](Self::load) starts new executors.
    pub async fn shutdown(&self) {
        let stages = self.inner.state.lock().unwrap().stages.take();
        self.inner.pending.clear_all();

        if let Some(stages) = stages {
            tracing::info!("Shutting down executors");
            stages.shutdown(self.inner.shutdown_timeout).await;
        }
    }
}

impl<D: Decoder> EngineInner<D> {
    fn stages(&self) -> Arc<Stages> {
        let mut state = self.state.lock().unwrap();
        let workers = state.download_workers();
        let stages = state.stages.get_or_insert_with(|| {
            tracing::debug!("Starting executors with {} download workers", workers);
            Arc::new(Stages::new(self.runtime.clone(), workers))
        });
        Arc::clone(stages)
    }

    /// Starts a task installed by the pending table, answering from memory if possible.
    fn start(self: &Arc<Self>, request: Request, id: TaskId) {
        let key = request.key().clone();

        let cached = match request.force_refresh() {
            true => None,
            false => self.memory.get(&key),
        };
        if let Some(payload) = cached {
            metric!(counter("caches.memory.hit") += 1);
            let response = Response { request, payload };
            self.pending.deliver(&key, id, Outcome::Loaded(response));
            return;
        }

        let stages = self.stages();
        let inner = Arc::clone(self);
        let next = Arc::clone(&stages);
        self.pending.register_task(&key, id, move || {
            stages.spawn(Stage::Dispatch, inner.dispatch(next, request, id))
        });
    }

    /// Moves the task `id` to `stage`, unless it is no longer pending.
    fn advance<F>(&self, stages: &Stages, stage: Stage, key: &CacheKey, id: TaskId, next: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::trace!("Moving `{}` to the {} stage", key.source(), stage.as_str());
        self.pending.swap_task(key, id, || stages.spawn(stage, next))
    }

    async fn dispatch(self: Arc<Self>, stages: Arc<Stages>, request: Request, id: TaskId) {
        let key = request.key().clone();

        if !request.force_refresh() && self.disk.exists(&key) {
            metric!(counter("caches.file.hit") += 1);
            let next = Arc::clone(&self).read_disk(Arc::clone(&stages), request, id);
            self.advance(&stages, Stage::Disk, &key, id, next);
        } else {
            metric!(counter("caches.file.miss") += 1);
            let next = Arc::clone(&self).download(Arc::clone(&stages), request, id);
            self.advance(&stages, Stage::Download, &key, id, next);
        }
    }

    async fn download(self: Arc<Self>, stages: Arc<Stages>, request: Request, id: TaskId) {
        let key = request.key().clone();

        match self.fetch_to_disk(&request).await {
            Ok(()) => {
                let next = Arc::clone(&self).read_disk(Arc::clone(&stages), request, id);
                if !self.advance(&stages, Stage::Disk, &key, id, next) {
                    tracing::debug!("Downloaded `{}`, but nobody is waiting", key.source());
                }
            }
            Err(err) => {
                metric!(counter("download.failure") += 1);
                tracing::debug!(
                    error = &err as &dyn Error,
                    "Failed to download `{}`",
                    key.source()
                );
                self.pending.deliver(&key, id, Outcome::Error(err));
            }
        }
    }

    async fn read_disk(self: Arc<Self>, stages: Arc<Stages>, request: Request, id: TaskId) {
        let key = request.key().clone();

        let outcome = match self.load_from_disk(&stages, &request).await {
            Ok(payload) => Outcome::Loaded(Response { request, payload }),
            Err(err) => {
                tracing::debug!(
                    error = &err as &dyn Error,
                    "Failed to load `{}` from disk",
                    key.source()
                );
                Outcome::Error(err)
            }
        };

        if !self.pending.deliver(&key, id, outcome) {
            tracing::trace!("Nobody is waiting for `{}` anymore", key.source());
        }
    }

    /// Reads and decodes the entry for `request` on the blocking pool.
    async fn load_from_disk(
        self: &Arc<Self>,
        stages: &Arc<Stages>,
        request: &Request,
    ) -> CacheContents<Arc<D::Item>> {
        let inner = Arc::clone(self);
        let blocking_request = request.clone();
        let (item, age) = self
            .runtime
            .spawn_blocking(move || {
                let request = blocking_request;
                let data = inner.disk.read(request.key())?;
                let age = inner.disk.age(request.key());
                let item = inner.decoder.decode(data, request.decode_options())?;
                Ok::<_, LoadError>((item, age))
            })
            .await
            .map_err(io::Error::from)??;

        let key = request.key();
        let item = Arc::new(item);
        self.memory.insert(key.clone(), Arc::clone(&item));

        match age {
            Ok(Some(age)) if age > self.caches.recheck_age => {
                self.spawn_revalidation(stages, request.clone());
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn Error,
                    "Failed to read the age of `{}`",
                    key.source()
                );
            }
        }

        Ok(item)
    }

    /// Fetches `request` into a temporary file, then moves it into the disk tier.
    async fn fetch_to_disk(&self, request: &Request) -> CacheContents {
        let temp_file = self.disk.tempfile()?;
        let mut destination = tokio::fs::File::from_std(temp_file.reopen()?);

        let size = self
            .fetcher
            .fetch(request.source(), &mut destination)
            .await?;
        drop(destination);

        self.disk.persist(temp_file, request.key())?;
        metric!(counter("caches.file.write") += 1);
        tracing::debug!("Stored `{}` ({} bytes)", request.source(), size);

        Ok(())
    }

    /// Schedules a staleness check for `request`, unless one is already running.
    fn spawn_revalidation(self: &Arc<Self>, stages: &Arc<Stages>, request: Request) {
        let key = request.key().clone();
        if !self.refreshes.lock().unwrap().insert(key.clone()) {
            return;
        }

        // Dropping the task, whether finished, aborted or never run, ends the refresh.
        let done = {
            let inner = Arc::clone(self);
            defer(move || {
                inner.refreshes.lock().unwrap().remove(&key);
            })
        };

        let inner = Arc::clone(self);
        let next = Arc::clone(stages);
        stages.spawn(Stage::Staleness, async move {
            let _done = done;
            inner.revalidate(&next, request).await;
        });
    }

    async fn revalidate(self: &Arc<Self>, stages: &Arc<Stages>, request: Request) {
        metric!(counter("caches.revalidate") += 1);
        let key = request.key();

        let expires = match self.fetcher.probe_expiry(request.source()).await {
            Ok(expires) => expires,
            Err(err) => {
                tracing::debug!(
                    error = &err as &dyn Error,
                    "Failed to check `{}`, keeping it",
                    key.source()
                );
                return;
            }
        };

        if expires.is_some_and(|expires| expires > SystemTime::now()) {
            tracing::debug!("`{}` is still fresh", key.source());
            if let Err(err) = self.disk.touch(key) {
                tracing::warn!(
                    error = &err as &dyn Error,
                    "Failed to touch `{}`",
                    key.source()
                );
            }
            return;
        }

        // A pending load may be reading the entry, it is checked again on its next read.
        let Some(id) = self.pending.try_install(&request) else {
            tracing::debug!("`{}` expired, but is already loading", key.source());
            return;
        };

        tracing::debug!("`{}` expired, fetching it again", key.source());
        if let Err(err) = self.disk.delete(key) {
            tracing::warn!(
                error = &err as &dyn Error,
                "Failed to remove `{}`",
                key.source()
            );
        }
        self.memory.remove(key);

        let key = key.clone();
        let inner = Arc::clone(self);
        let next = Arc::clone(stages);
        self.pending.register_task(&key, id, move || {
            stages.spawn(Stage::Download, inner.download(next, request, id))
        });
    }
}
