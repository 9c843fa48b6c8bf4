use std::collections::HashMap;
use std::collections::hash_map;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use sentry::{Hub, SentryFutureExt};
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::Instrument;

use crate::config::CacheConfig;
use crate::entry::{Entry, InFlight, Snapshot, Status};
use crate::error::{CacheError, FetchError, ResolveError, ResolveResult};
use crate::resolver::{Resolver, ResolverRegistry, SharedResolver};
use crate::subscription::Subscription;
use crate::utils::CallOnDrop;

/// A keyed stale-while-revalidate cache of remote resources.
///
/// Consumers [`subscribe`](Self::subscribe) to keys and observe [`Snapshot`]s of them. The
/// cache calls the key's [`Resolver`] when the key is first subscribed to and whenever it is
/// [`invalidate`](Self::invalidate)d, and guarantees that at most one resolver call per key
/// is in flight at any time:
///
/// - Concurrent subscribers of a key share one resolution.
/// - Invalidating a key with a resolution in flight queues exactly one follow-up resolution,
///   no matter how often it is called. The follow-up starts after the running one settled,
///   so a write that invalidates its key is always reflected eventually.
/// - A revalidation never clears the last good value. Subscribers keep seeing it, together
///   with the newest error if the revalidation failed.
///
/// Resolutions run as tasks on the runtime the cache was created with. Dropping all
/// subscriptions of a key does not cancel its resolution.
///
/// Entries without subscribers are kept for the lifetime of the cache, unless
/// [`CacheConfig::eviction_grace`] is configured.
///
/// The cache is cheap to clone, clones share the same entries.
pub struct ResourceCache<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for ResourceCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> fmt::Debug for ResourceCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("ResourceCache")
            .field("config", &self.inner.config)
            .field("resolvers", &self.inner.resolvers)
            .field("entries", &state.entries.len())
            .field("disposed", &state.disposed)
            .finish()
    }
}

struct Inner<V> {
    config: CacheConfig,
    resolvers: ResolverRegistry<V>,
    runtime: Handle,
    next_epoch: AtomicU64,
    state: Mutex<State<V>>,
}

struct State<V> {
    entries: HashMap<String, Entry<V>>,
    disposed: bool,
}

impl<V> ResourceCache<V>
where
    V: Send + Sync + 'static,
{
    /// Creates a new cache.
    ///
    /// `resolvers` is consulted by [`subscribe`](Self::subscribe), resolutions are spawned on
    /// `runtime`.
    pub fn new(config: CacheConfig, resolvers: ResolverRegistry<V>, runtime: Handle) -> Self {
        let inner = Inner {
            config,
            resolvers,
            runtime,
            next_epoch: AtomicU64::new(0),
            state: Mutex::new(State {
                entries: HashMap::new(),
                disposed: false,
            }),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Subscribes to `key`, resolving it with the resolver registered for it.
    ///
    /// # Errors
    ///
    /// Fails with [`CacheError::NoResolverConfigured`] if the key has no entry yet and no
    /// resolver is registered for it, and with [`CacheError::Disposed`] after
    /// [`dispose`](Self::dispose).
    pub fn subscribe(&self, key: &str) -> Result<Subscription<V>, CacheError> {
        self.inner.subscribe(key, None)
    }

    /// Subscribes to `key`, resolving it with `resolver`.
    ///
    /// The resolver replaces the one the entry resolved with so far and is used for all
    /// following resolutions of the key.
    pub fn subscribe_with(
        &self,
        key: &str,
        resolver: impl Resolver<V>,
    ) -> Result<Subscription<V>, CacheError> {
        self.inner.subscribe(key, Some(Arc::new(resolver)))
    }

    /// Requests a fresh resolution of `key`.
    ///
    /// Starts a resolution right away, or, if one is already in flight, queues a single
    /// follow-up. Does nothing if the key has no entry.
    pub fn invalidate(&self, key: &str) {
        let mut state = self.inner.lock();
        match state.entries.get_mut(key) {
            Some(entry) => self.inner.invalidate_entry(key, entry),
            None => tracing::trace!(key, "Ignoring invalidation of unknown key"),
        }
    }

    /// Invalidates every key for which `predicate` returns `true`.
    pub fn invalidate_matching<F>(&self, mut predicate: F)
    where
        F: FnMut(&str) -> bool,
    {
        let mut state = self.inner.lock();
        for (key, entry) in state.entries.iter_mut() {
            if predicate(key.as_str()) {
                self.inner.invalidate_entry(key, entry);
            }
        }
    }

    /// Removes the entry of `key`, dropping its value and error.
    ///
    /// Current subscribers receive an [`Idle`](Status::Idle) snapshot and are detached from
    /// the key. A resolution in flight is aborted, so that a new subscription to the key
    /// never runs its resolver alongside the evicted one.
    ///
    /// Returns whether the key had an entry.
    pub fn evict(&self, key: &str) -> bool {
        let entry = {
            let mut state = self.inner.lock();
            let Some(entry) = state.entries.remove(key) else {
                return false;
            };
            metric!(gauge("cache.entries") = state.entries.len() as u64);
            entry
        };
        tracing::debug!(key, in_flight = entry.in_flight.is_some(), "Evicting entry");
        metric!(counter("cache.evict") += 1, "reason" => "explicit");

        if let Some(in_flight) = &entry.in_flight {
            in_flight.abort.abort();
        }
        entry.publish_idle();
        true
    }

    /// Subscribes to `key`, waits until it settled and returns its value.
    ///
    /// A stale value is preferred over an error from a failed revalidation.
    pub async fn fetch(&self, key: &str) -> Result<Arc<V>, FetchError> {
        let mut subscription = self.subscribe(key)?;
        let snapshot = subscription.settled().await;

        match snapshot {
            Snapshot {
                value: Some(value), ..
            } => Ok(value),
            Snapshot {
                error: Some(error), ..
            } => Err(error.into()),
            _ => Err(CacheError::Evicted { key: key.into() }.into()),
        }
    }

    /// The current snapshot of `key`, without subscribing to it.
    pub fn peek(&self, key: &str) -> Option<Snapshot<V>> {
        let state = self.inner.lock();
        state.entries.get(key).map(|entry| entry.snapshot())
    }

    /// The number of live subscriptions of `key`.
    pub fn subscriber_count(&self, key: &str) -> usize {
        let state = self.inner.lock();
        state.entries.get(key).map_or(0, |entry| entry.subscribers)
    }

    /// The number of entries in the cache.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shuts the cache down.
    ///
    /// Aborts all resolutions in flight, drops every entry and hands an
    /// [`Idle`](Status::Idle) snapshot to all subscribers. Subscribing afterwards fails with
    /// [`CacheError::Disposed`].
    pub fn dispose(&self) {
        let entries = {
            let mut state = self.inner.lock();
            state.disposed = true;
            std::mem::take(&mut state.entries)
        };
        tracing::debug!(entries = entries.len(), "Disposing cache");
        metric!(gauge("cache.entries") = 0u64);

        for entry in entries.into_values() {
            if let Some(in_flight) = &entry.in_flight {
                in_flight.abort.abort();
            }
            entry.publish_idle();
        }
    }
}

impl<V> Inner<V> {
    fn lock(&self) -> MutexGuard<'_, State<V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<V> Inner<V>
where
    V: Send + Sync + 'static,
{
    fn subscribe(
        self: &Arc<Self>,
        key: &str,
        resolver: Option<SharedResolver<V>>,
    ) -> Result<Subscription<V>, CacheError> {
        let mut state = self.lock();
        if state.disposed {
            return Err(CacheError::Disposed);
        }
        metric!(counter("cache.subscribe") += 1);

        let entries_before = state.entries.len();
        let (epoch, receiver) = match state.entries.entry(key.to_owned()) {
            hash_map::Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.subscribers += 1;
                entry.touch();
                if let Some(resolver) = resolver {
                    entry.resolver = resolver;
                }
                tracing::trace!(key, subscribers = entry.subscribers, "Subscribed");

                if entry.in_flight.is_some() {
                    metric!(counter("cache.resolve.deduplicated") += 1);
                } else if self.should_revalidate_on_subscribe(entry) {
                    tracing::debug!(key, "Revalidating on subscribe");
                    self.start_resolution(key, entry);
                }

                (entry.epoch, entry.receiver())
            }
            hash_map::Entry::Vacant(vacant) => {
                let resolver = resolver
                    .or_else(|| self.resolvers.lookup(key))
                    .ok_or_else(|| CacheError::NoResolverConfigured { key: key.into() })?;

                let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
                let entry = vacant.insert(Entry::new(epoch, resolver));
                entry.subscribers = 1;
                tracing::trace!(key, "Subscribed to new entry");
                self.start_resolution(key, entry);

                (epoch, entry.receiver())
            }
        };
        if state.entries.len() != entries_before {
            metric!(gauge("cache.entries") = state.entries.len() as u64);
        }
        drop(state);

        let unsubscribe = {
            let inner = Arc::clone(self);
            let key = key.to_owned();
            CallOnDrop::new(move || inner.unsubscribe(&key, epoch))
        };
        Ok(Subscription::new(key.to_owned(), receiver, unsubscribe))
    }

    fn should_revalidate_on_subscribe(&self, entry: &Entry<V>) -> bool {
        self.config.revalidate_on_subscribe
            && entry.settled_at.is_none_or(|settled_at| {
                settled_at.elapsed() >= self.config.dedupe_interval
            })
    }

    fn unsubscribe(self: &Arc<Self>, key: &str, epoch: u64) {
        let mut state = self.lock();
        let Some(entry) = state.entries.get_mut(key) else {
            return;
        };
        // the subscription belongs to an evicted incarnation of this key
        if entry.epoch != epoch {
            return;
        }

        entry.subscribers = entry.subscribers.saturating_sub(1);
        tracing::trace!(key, subscribers = entry.subscribers, "Unsubscribed");
        if entry.subscribers == 0 && entry.in_flight.is_none() {
            self.schedule_eviction(key, entry);
        }
    }

    fn invalidate_entry(self: &Arc<Self>, key: &str, entry: &mut Entry<V>) {
        entry.touch();
        if entry.in_flight.is_none() {
            tracing::debug!(key, "Invalidated, starting resolution");
            metric!(counter("cache.invalidate") += 1, "action" => "started");
            self.start_resolution(key, entry);
        } else if !entry.revalidate_queued {
            tracing::debug!(key, "Invalidated while validating, queueing revalidation");
            metric!(counter("cache.invalidate") += 1, "action" => "queued");
            entry.revalidate_queued = true;
        } else {
            metric!(counter("cache.invalidate") += 1, "action" => "coalesced");
        }
    }

    /// Marks `entry` as validating and spawns a task resolving it.
    ///
    /// Must only be called when no resolution is in flight.
    fn start_resolution(self: &Arc<Self>, key: &str, entry: &mut Entry<V>) {
        debug_assert!(entry.in_flight.is_none());

        entry.status = Status::Validating;
        entry.touch();
        entry.publish();

        let id = entry.next_resolution_id();
        let epoch = entry.epoch;
        let resolver = Arc::clone(&entry.resolver);

        let span = tracing::debug_span!("resolve", key = %key);
        let inner = Arc::clone(self);
        let owned_key = key.to_owned();
        let task = async move {
            let key = owned_key;
            // created inside the task, so a task dropped before its first poll never
            // touches the lock we are holding right now
            let _done_token = {
                let inner = Arc::clone(&inner);
                let key = key.clone();
                CallOnDrop::new(move || inner.finish(&key, epoch, id))
            };
            inner.run_resolutions(&key, epoch, id, resolver).await;
        };
        let handle = self
            .runtime
            .spawn(task.instrument(span).bind_hub(Hub::new_from_top(Hub::current())));

        // A running task cannot finish while we hold the lock, so this only happens if the
        // runtime is shutting down and dropped the task without ever polling it.
        if handle.is_finished() {
            tracing::error!(key, "Runtime rejected the resolution");
            metric!(counter("cache.resolve") += 1, "status" => "rejected");
            entry.revalidate_queued = false;
            entry.error = Some(ResolveError::InternalError);
            entry.status = Status::Settled;
            entry.settled_at = Some(Instant::now());
            entry.publish();
            return;
        }

        entry.in_flight = Some(InFlight {
            id,
            abort: handle.abort_handle(),
        });
    }

    /// Resolves the key until no more revalidations are queued.
    async fn run_resolutions(
        &self,
        key: &str,
        epoch: u64,
        id: u64,
        mut resolver: SharedResolver<V>,
    ) {
        loop {
            tracing::debug!("Calling resolver");
            let start = Instant::now();
            let future = resolver.resolve(key);
            let result = match self.config.resolve_timeout {
                Some(timeout) => match tokio::time::timeout(timeout, future).await {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::warn!(key, ?timeout, "Resolver timed out");
                        Err(ResolveError::Timeout(timeout))
                    }
                },
                None => future.await,
            };
            metric!(timer("cache.resolve.duration") = start.elapsed());

            match self.settle(key, epoch, id, result) {
                Some(next) => resolver = next,
                None => break,
            }
        }
    }

    /// Applies the outcome of a resolver call to the entry.
    ///
    /// Returns the resolver to call again if a revalidation was queued in the meantime.
    fn settle(
        &self,
        key: &str,
        epoch: u64,
        id: u64,
        result: ResolveResult<V>,
    ) -> Option<SharedResolver<V>> {
        let mut state = self.lock();
        let entry = match state.entries.get_mut(key) {
            Some(entry) if entry.epoch == epoch && entry.is_running(id) => entry,
            _ => {
                tracing::debug!(key, "Discarding result for evicted entry");
                return None;
            }
        };

        match result {
            Ok(value) => {
                metric!(counter("cache.resolve") += 1, "status" => "ok");
                entry.value = Some(Arc::new(value));
                entry.error = None;
            }
            Err(error) => {
                tracing::debug!(key, error = %error, "Resolver failed");
                metric!(counter("cache.resolve") += 1, "status" => error.metrics_tag());
                entry.error = Some(error);
            }
        }
        entry.settled_at = Some(Instant::now());
        entry.touch();

        if entry.revalidate_queued {
            tracing::debug!(key, "Starting queued revalidation");
            entry.revalidate_queued = false;
            entry.publish();
            return Some(Arc::clone(&entry.resolver));
        }

        tracing::debug!(key, "Settled");
        entry.status = Status::Settled;
        entry.in_flight = None;
        entry.publish();
        None
    }

    /// Runs when a resolution task ends, however it ended.
    ///
    /// A task that did not settle had its resolver panic, or was aborted. Its entry settles
    /// with an internal error so that it does not stay validating forever. Either way, an
    /// entry left without subscribers becomes eligible for eviction.
    fn finish(self: &Arc<Self>, key: &str, epoch: u64, id: u64) {
        let mut state = self.lock();
        let Some(entry) = state.entries.get_mut(key) else {
            return;
        };
        if entry.epoch == epoch && entry.is_running(id) {
            tracing::error!(key, "Resolution ended without settling");
            metric!(counter("cache.resolve") += 1, "status" => "abandoned");
            entry.in_flight = None;
            entry.revalidate_queued = false;
            entry.error = Some(ResolveError::InternalError);
            entry.status = Status::Settled;
            entry.settled_at = Some(Instant::now());
            entry.publish();
        }

        if entry.epoch == epoch && entry.subscribers == 0 && entry.in_flight.is_none() {
            self.schedule_eviction(key, entry);
        }
    }

    /// Evicts `entry` after the configured grace period, unless it sees any activity in
    /// between.
    fn schedule_eviction(self: &Arc<Self>, key: &str, entry: &mut Entry<V>) {
        let Some(grace) = self.config.eviction_grace else {
            return;
        };

        entry.touch();
        let generation = entry.generation;
        let epoch = entry.epoch;
        let inner = Arc::downgrade(self);
        let key = key.to_owned();

        tracing::trace!(key, ?grace, "Scheduling eviction");
        self.runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            sweep(inner, &key, epoch, generation);
        });
    }
}

fn sweep<V>(inner: Weak<Inner<V>>, key: &str, epoch: u64, generation: u64)
where
    V: Send + Sync + 'static,
{
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let mut state = inner.lock();
    let expired = state.entries.get(key).is_some_and(|entry| {
        entry.epoch == epoch
            && entry.generation == generation
            && entry.subscribers == 0
            && entry.in_flight.is_none()
    });

    if expired {
        tracing::debug!(key, "Evicting unused entry");
        state.entries.remove(key);
        metric!(counter("cache.evict") += 1, "reason" => "unused");
        metric!(gauge("cache.entries") = state.entries.len() as u64);
    }
}
