//! Cancellation sources bound to owner lifetimes
//!
//! A [`CancellationSource`] is a tri-state flag (`Active` → `Requested` →
//! `Finalized`) with an ordered list of callbacks. Requesting it fires every
//! registered callback once, in registration order, then the source is
//! finalized. Task cells observe a source through a [`CancellationToken`];
//! they never request it.
//!
//! An owner (anything exposing [`DestroyNotifier`]) drives its source to
//! `Requested` when it is destroyed, cutting off every pending operation
//! started on its behalf in one sweep.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::runtime::errors::panic_message;

type Callback = Box<dyn FnOnce() + Send>;

/// Cancellation source state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationState {
    /// Not requested.
    Active,
    /// Requested; callbacks are firing.
    Requested,
    /// Requested and every callback has fired.
    Finalized,
}

impl CancellationState {
    #[inline]
    fn from_u8(val: u8) -> Self {
        match val {
            0 => CancellationState::Active,
            1 => CancellationState::Requested,
            _ => CancellationState::Finalized,
        }
    }

    #[inline]
    fn as_u8(&self) -> u8 {
        match self {
            CancellationState::Active => 0,
            CancellationState::Requested => 1,
            CancellationState::Finalized => 2,
        }
    }
}

struct SourceInner {
    state: AtomicU8,
    callbacks: Mutex<IndexMap<u64, Callback>>,
    next_id: AtomicU64,
    /// Registrations on parent sources for linked sources.
    links: Mutex<Vec<Registration>>,
}

impl SourceInner {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(CancellationState::Active.as_u8()),
            callbacks: Mutex::new(IndexMap::new()),
            next_id: AtomicU64::new(0),
            links: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    fn state(&self) -> CancellationState {
        CancellationState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn is_requested(&self) -> bool {
        self.state.load(Ordering::Acquire) != CancellationState::Active.as_u8()
    }

    fn request(&self) -> bool {
        if self
            .state
            .compare_exchange(
                CancellationState::Active.as_u8(),
                CancellationState::Requested.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }

        let callbacks = std::mem::take(&mut *self.callbacks.lock());
        debug!("Cancellation requested, firing {} callbacks", callbacks.len());
        for (_, callback) in callbacks {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(callback)) {
                error!(
                    "Cancellation callback panicked: {}",
                    panic_message(payload.as_ref())
                );
            }
        }

        self.state
            .store(CancellationState::Finalized.as_u8(), Ordering::Release);
        for link in std::mem::take(&mut *self.links.lock()) {
            link.dispose();
        }
        true
    }

    fn register(
        self: &Arc<Self>,
        callback: Callback,
    ) -> Registration {
        let mut callbacks = self.callbacks.lock();
        if !self.is_requested() {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            callbacks.insert(id, callback);
            return Registration {
                id,
                source: Arc::downgrade(self),
            };
        }
        drop(callbacks);

        callback();
        Registration::inert()
    }

    fn deregister(
        &self,
        id: u64,
    ) -> bool {
        self.callbacks.lock().shift_remove(&id).is_some()
    }
}

impl Drop for SourceInner {
    fn drop(&mut self) {
        for link in self.links.get_mut().drain(..) {
            link.dispose();
        }
    }
}

/// Handle returned by `register`; pass it to `deregister` to remove a
/// callback that has not fired yet.
#[derive(Clone)]
pub struct Registration {
    id: u64,
    source: Weak<SourceInner>,
}

impl Registration {
    fn inert() -> Self {
        Self {
            id: u64::MAX,
            source: Weak::new(),
        }
    }

    /// Remove the callback. Returns `false` if it already fired or was removed.
    pub fn dispose(&self) -> bool {
        match self.source.upgrade() {
            Some(source) => source.deregister(self.id),
            None => false,
        }
    }

    /// Whether the source this registration belongs to was requested.
    pub fn is_requested(&self) -> bool {
        self.source
            .upgrade()
            .is_some_and(|source| source.is_requested())
    }
}

impl fmt::Debug for Registration {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Registration").field("id", &self.id).finish()
    }
}

/// Lifetime-scoped cancellation signal.
#[derive(Clone)]
pub struct CancellationSource {
    inner: Arc<SourceInner>,
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationSource {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("CancellationSource")
            .field("state", &self.state())
            .field("registered", &self.registered())
            .finish()
    }
}

impl CancellationSource {
    /// Create an active source.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SourceInner::new()),
        }
    }

    /// Create a source that is requested as soon as any parent is.
    pub fn linked(parents: &[CancellationToken]) -> Self {
        let source = Self::new();
        for parent in parents {
            let child = Arc::downgrade(&source.inner);
            let link = parent.register(move || {
                if let Some(child) = child.upgrade() {
                    child.request();
                }
            });
            if source.is_requested() {
                break;
            }
            source.inner.links.lock().push(link);
        }
        source
    }

    /// Create a source requested when `owner` is destroyed.
    pub fn bound_to<N: DestroyNotifier + ?Sized>(owner: &N) -> Self {
        let source = Self::new();
        let inner = source.inner.clone();
        owner.on_destroy(Box::new(move || {
            inner.request();
        }));
        source
    }

    /// Read-only observer handle.
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            inner: Some(self.inner.clone()),
        }
    }

    /// Request cancellation. Returns `true` for the call that flipped the flag.
    pub fn request(&self) -> bool {
        self.inner.request()
    }

    /// Whether cancellation was requested. Lock-free.
    #[inline]
    pub fn is_requested(&self) -> bool {
        self.inner.is_requested()
    }

    /// Current state.
    #[inline]
    pub fn state(&self) -> CancellationState {
        self.inner.state()
    }

    /// Register a callback. Fires synchronously if already requested.
    pub fn register<F>(
        &self,
        callback: F,
    ) -> Registration
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.register(Box::new(callback))
    }

    /// Remove a callback that has not fired yet.
    pub fn deregister(
        &self,
        registration: &Registration,
    ) -> bool {
        registration.dispose()
    }

    /// Number of callbacks waiting to fire.
    pub fn registered(&self) -> usize {
        self.inner.callbacks.lock().len()
    }
}

/// Observer side of a [`CancellationSource`].
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Option<Arc<SourceInner>>,
}

impl fmt::Debug for CancellationToken {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("requested", &self.is_requested())
            .finish()
    }
}

impl CancellationToken {
    /// A token that is never requested.
    pub fn none() -> Self {
        Self { inner: None }
    }

    /// Whether cancellation was requested. Lock-free.
    #[inline]
    pub fn is_requested(&self) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|inner| inner.is_requested())
    }

    /// Whether this token is attached to a source at all.
    #[inline]
    pub fn can_be_canceled(&self) -> bool {
        self.inner.is_some()
    }

    /// Register a callback on the underlying source.
    pub fn register<F>(
        &self,
        callback: F,
    ) -> Registration
    where
        F: FnOnce() + Send + 'static,
    {
        match &self.inner {
            Some(inner) => inner.register(Box::new(callback)),
            None => Registration::inert(),
        }
    }
}

/// Single-fire "on destroy" notification exposed by an owner.
pub trait DestroyNotifier {
    /// Run `callback` once when the owner is destroyed, or immediately if it
    /// already was.
    fn on_destroy(
        &self,
        callback: Box<dyn FnOnce() + Send>,
    );
}

/// An owner with a deterministic destruction point.
///
/// Destruction happens on [`OwnerLifetime::destroy`] or on drop, whichever
/// comes first.
pub struct OwnerLifetime {
    name: String,
    destroyed: AtomicBool,
    subscribers: Mutex<Vec<Callback>>,
    source: OnceCell<CancellationSource>,
}

impl fmt::Debug for OwnerLifetime {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("OwnerLifetime")
            .field("name", &self.name)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl OwnerLifetime {
    /// Create a live owner.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            destroyed: AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
            source: OnceCell::new(),
        }
    }

    /// Owner name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the owner was destroyed.
    #[inline]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Token requested when this owner is destroyed.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.source
            .get_or_init(|| CancellationSource::bound_to(self))
            .token()
    }

    /// Destroy the owner, notifying subscribers in subscription order.
    pub fn destroy(&self) {
        let subscribers = {
            let mut subscribers = self.subscribers.lock();
            if self.destroyed.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *subscribers)
        };
        debug!("Owner '{}' destroyed", self.name);
        for subscriber in subscribers {
            subscriber();
        }
    }
}

impl DestroyNotifier for OwnerLifetime {
    fn on_destroy(
        &self,
        callback: Box<dyn FnOnce() + Send>,
    ) {
        let mut subscribers = self.subscribers.lock();
        if self.is_destroyed() {
            drop(subscribers);
            callback();
        } else {
            subscribers.push(callback);
        }
    }
}

impl Drop for OwnerLifetime {
    fn drop(&mut self) {
        self.destroy();
    }
}
