//! Requests, listeners and the outcomes delivered to them.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use url::Url;

use crate::caching::{CacheKey, LoadError};

/// Size hints passed to the [`Decoder`](crate::decoder::Decoder).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeOptions {
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
}

/// A request to load the resource at `source`.
///
/// Two requests are equal if they share the same `source`, regardless of their other options.
/// The first request for a source decides the options used while it is pending.
#[derive(Debug, Clone)]
pub struct Request {
    key: CacheKey,
    source: Url,
    force_refresh: bool,
    decode_options: DecodeOptions,
}

impl Request {
    pub fn new(source: Url) -> Self {
        Self {
            key: CacheKey::from_url(&source),
            source,
            force_refresh: false,
            decode_options: DecodeOptions::default(),
        }
    }

    /// Skips the memory and disk tiers and fetches the resource from the network.
    pub fn with_force_refresh(mut self, force_refresh: bool) -> Self {
        self.force_refresh = force_refresh;
        self
    }

    pub fn with_decode_options(mut self, decode_options: DecodeOptions) -> Self {
        self.decode_options = decode_options;
        self
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn source(&self) -> &Url {
        &self.source
    }

    pub fn force_refresh(&self) -> bool {
        self.force_refresh
    }

    pub fn decode_options(&self) -> &DecodeOptions {
        &self.decode_options
    }
}

impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for Request {}

impl Hash for Request {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.source.hash(state);
    }
}

/// A successfully loaded resource.
#[derive(Debug)]
pub struct Response<T> {
    pub request: Request,
    pub payload: Arc<T>,
}

impl<T> Clone for Response<T> {
    fn clone(&self) -> Self {
        Self {
            request: self.request.clone(),
            payload: Arc::clone(&self.payload),
        }
    }
}

/// The terminal result delivered to a [`Listener`], exactly once per registration.
#[derive(Debug)]
pub enum Outcome<T> {
    Loaded(Response<T>),
    Error(LoadError),
    Cancelled,
}

impl<T> Clone for Outcome<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Loaded(response) => Self::Loaded(response.clone()),
            Self::Error(err) => Self::Error(err.clone()),
            Self::Cancelled => Self::Cancelled,
        }
    }
}

impl<T> Outcome<T> {
    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns the loaded payload, if any.
    pub fn payload(&self) -> Option<&Arc<T>> {
        match self {
            Self::Loaded(response) => Some(&response.payload),
            _ => None,
        }
    }
}

/// Identity of a [`Listener`], shared by all of its clones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

/// The receiving end of load outcomes.
///
/// Outcomes are queued on a channel, the owner of the receiver consumes them on its own task.
/// Registering a listener (or any clone of it) for a new request detaches it from the previous
/// one.
#[derive(Debug)]
pub struct Listener<T> {
    id: ListenerId,
    sender: mpsc::UnboundedSender<Outcome<T>>,
}

impl<T> Clone for Listener<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            sender: self.sender.clone(),
        }
    }
}

impl<T> Listener<T> {
    /// Creates a new listener together with the receiver its outcomes are delivered to.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outcome<T>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let listener = Self {
            id: ListenerId::next(),
            sender,
        };
        (listener, receiver)
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub(crate) fn send(&self, outcome: Outcome<T>) {
        if self.sender.send(outcome).is_err() {
            tracing::trace!("{} went away before its outcome was delivered", self.id);
        }
    }
}

/// Returned by [`Engine::load`](crate::engine::Engine::load), identifying one registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    listener: ListenerId,
    key: CacheKey,
}

impl Subscription {
    pub(crate) fn new(listener: ListenerId, key: CacheKey) -> Self {
        Self { listener, key }
    }

    /// The listener to pass to [`Engine::cancel`](crate::engine::Engine::cancel).
    pub fn listener(&self) -> ListenerId {
        self.listener
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}
