use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::error::ResolveError;
use crate::resolver::SharedResolver;

/// Where a key is in its resolution lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// There is no entry for the key, either because it was never resolved or because it
    /// has been evicted.
    Idle,
    /// A resolver call for the key is in flight.
    Validating,
    /// No resolver call is in flight. This says nothing about whether the last call succeeded.
    Settled,
}

/// What a subscriber sees of a cached resource.
///
/// `value` and `error` are independent: after a failed revalidation both are set, the
/// value being the last one that resolved successfully.
#[derive(Debug, PartialEq)]
pub struct Snapshot<V> {
    pub value: Option<Arc<V>>,
    pub error: Option<ResolveError>,
    pub status: Status,
}

impl<V> Snapshot<V> {
    /// The snapshot of a key that has no entry.
    pub fn idle() -> Self {
        Self {
            value: None,
            error: None,
            status: Status::Idle,
        }
    }

    /// `true` while the first value of the key is still being resolved.
    pub fn is_loading(&self) -> bool {
        self.status == Status::Validating && self.value.is_none()
    }

    /// `true` while any resolution of the key is in flight, including revalidations.
    pub fn is_validating(&self) -> bool {
        self.status == Status::Validating
    }
}

impl<V> Clone for Snapshot<V> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            error: self.error.clone(),
            status: self.status,
        }
    }
}

/// The running resolution task of an entry.
#[derive(Debug)]
pub(crate) struct InFlight {
    /// Distinguishes consecutive resolution tasks of the same entry.
    pub id: u64,
    pub abort: AbortHandle,
}

/// The bookkeeping for one cached key.
///
/// Only ever touched while holding the cache lock.
pub(crate) struct Entry<V> {
    /// Identity of this incarnation of the key.
    pub epoch: u64,
    pub value: Option<Arc<V>>,
    pub error: Option<ResolveError>,
    pub status: Status,
    pub subscribers: usize,
    pub in_flight: Option<InFlight>,
    pub revalidate_queued: bool,
    pub resolver: SharedResolver<V>,
    pub settled_at: Option<Instant>,
    /// Bumped on every activity, outstanding eviction timers compare against it.
    pub generation: u64,
    next_resolution: u64,
    sender: watch::Sender<Snapshot<V>>,
}

impl<V> Entry<V> {
    pub fn new(epoch: u64, resolver: SharedResolver<V>) -> Self {
        let (sender, _) = watch::channel(Snapshot::idle());
        Self {
            epoch,
            value: None,
            error: None,
            status: Status::Idle,
            subscribers: 0,
            in_flight: None,
            revalidate_queued: false,
            resolver,
            settled_at: None,
            generation: 0,
            next_resolution: 0,
            sender,
        }
    }

    pub fn snapshot(&self) -> Snapshot<V> {
        Snapshot {
            value: self.value.clone(),
            error: self.error.clone(),
            status: self.status,
        }
    }

    /// Pushes the current state to all subscribers.
    pub fn publish(&self) {
        self.sender.send_replace(self.snapshot());
    }

    /// Tells all subscribers that this entry is gone.
    pub fn publish_idle(&self) {
        self.sender.send_replace(Snapshot::idle());
    }

    pub fn receiver(&self) -> watch::Receiver<Snapshot<V>> {
        self.sender.subscribe()
    }

    pub fn next_resolution_id(&mut self) -> u64 {
        self.next_resolution += 1;
        self.next_resolution
    }

    /// Whether the resolution task `id` is the one currently in flight.
    pub fn is_running(&self, id: u64) -> bool {
        self.in_flight.as_ref().is_some_and(|f| f.id == id)
    }

    pub fn touch(&mut self) {
        self.generation += 1;
    }
}

impl<V> fmt::Debug for Entry<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("epoch", &self.epoch)
            .field("has_value", &self.value.is_some())
            .field("error", &self.error)
            .field("status", &self.status)
            .field("subscribers", &self.subscribers)
            .field("in_flight", &self.in_flight.is_some())
            .field("revalidate_queued", &self.revalidate_queued)
            .finish()
    }
}
