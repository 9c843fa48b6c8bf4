use std::fmt;

use tokio::sync::watch;

use crate::entry::{Snapshot, Status};
use crate::utils::CallOnDrop;

/// A live view on one key of a [`ResourceCache`](crate::ResourceCache).
///
/// The subscription counts as a consumer of the key until it is dropped or
/// [`unsubscribe`](Self::unsubscribe)d. Changes are delivered through a watch channel, so a
/// slow consumer only ever misses intermediate snapshots, never the latest one.
pub struct Subscription<V> {
    key: String,
    receiver: watch::Receiver<Snapshot<V>>,
    _unsubscribe: CallOnDrop,
}

impl<V> Subscription<V> {
    pub(crate) fn new(
        key: String,
        receiver: watch::Receiver<Snapshot<V>>,
        unsubscribe: CallOnDrop,
    ) -> Self {
        Self {
            key,
            receiver,
            _unsubscribe: unsubscribe,
        }
    }

    /// The key this subscription observes.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The latest snapshot of the key.
    pub fn snapshot(&self) -> Snapshot<V> {
        self.receiver.borrow().clone()
    }

    /// Waits for the next change of the key and returns the new snapshot.
    ///
    /// Returns `None` once the entry has been evicted or the cache disposed and the final
    /// idle snapshot has already been observed.
    pub async fn changed(&mut self) -> Option<Snapshot<V>> {
        match self.receiver.changed().await {
            Ok(()) => Some(self.receiver.borrow_and_update().clone()),
            Err(_) => None,
        }
    }

    /// Waits until no resolution of the key is in flight and returns that snapshot.
    ///
    /// Returns immediately if the key is already settled. An evicted key yields an
    /// [`Idle`](Status::Idle) snapshot.
    pub async fn settled(&mut self) -> Snapshot<V> {
        let settled = self
            .receiver
            .wait_for(|snapshot| snapshot.status != Status::Validating)
            .await
            .map(|snapshot| snapshot.clone());

        settled.unwrap_or_else(|_| self.receiver.borrow().clone())
    }

    /// Stops observing the key.
    ///
    /// Equivalent to dropping the subscription. An in-flight resolution of the key keeps
    /// running.
    pub fn unsubscribe(self) {}
}

impl<V> fmt::Debug for Subscription<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("status", &self.receiver.borrow().status)
            .finish()
    }
}
