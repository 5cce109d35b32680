//! Subscription manager: observer registration, notification and GC timers.
//!
//! Each subscription registers an [`Observer`] inside its cache entry, so the
//! entry's subscriber count always equals the number of live
//! [`ObserverHandle`]s. When the last handle goes away a collection timer is
//! armed; a new subscriber before it fires cancels it and reuses the cached
//! data.

use crate::key::CacheKey;
use crate::observability::QueryMetrics;
use crate::store::{CacheEntry, CacheStore, QueryOrigin, QuerySnapshot};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::runtime::Handle;

/// Type alias for observer callbacks.
pub type ObserverFn = dyn Fn(&QuerySnapshot) + Send + Sync;

/// One registered callback.
///
/// Snapshots are delivered at most once per entry version and never out of
/// order: a snapshot that is not newer than the last delivered one is
/// skipped. Only one thread runs the callback at a time. A thread that finds
/// a delivery in progress parks its snapshot in the pending slot and leaves;
/// the delivering thread drains the slot before it returns. The lock is never
/// held while the callback runs, so callbacks may call back into the client.
pub struct Observer {
    id: u64,
    callback: Box<ObserverFn>,
    delivery: Mutex<Delivery>,
}

#[derive(Default)]
struct Delivery {
    /// Highest version handed to the callback or parked in `pending`.
    last_version: u64,
    pending: Option<QuerySnapshot>,
    draining: bool,
}

impl Observer {
    pub(crate) fn new(id: u64, callback: Box<ObserverFn>) -> Self {
        Observer {
            id,
            callback,
            delivery: Mutex::new(Delivery::default()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn deliver(&self, snapshot: &QuerySnapshot) {
        {
            let mut delivery = self.lock();
            if snapshot.version <= delivery.last_version {
                return;
            }
            delivery.last_version = snapshot.version;
            delivery.pending = Some(snapshot.clone());
            if delivery.draining {
                return;
            }
            delivery.draining = true;
        }

        let _draining = DrainGuard(self);
        loop {
            let next = {
                let mut delivery = self.lock();
                match delivery.pending.take() {
                    Some(next) => next,
                    None => {
                        delivery.draining = false;
                        return;
                    }
                }
            };
            (self.callback)(&next);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Delivery> {
        self.delivery
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Releases the delivery role if a callback panics.
struct DrainGuard<'a>(&'a Observer);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            let mut delivery = self.0.lock();
            delivery.draining = false;
            delivery.pending = None;
        }
    }
}

/// A transition waiting to be delivered.
///
/// Built under the store lock, dispatched after it is released so callbacks
/// may call back into the client.
pub(crate) struct Notification {
    snapshot: QuerySnapshot,
    observers: Vec<Arc<Observer>>,
}

impl Notification {
    pub(crate) fn new(snapshot: QuerySnapshot, observers: Vec<Arc<Observer>>) -> Self {
        Notification {
            snapshot,
            observers,
        }
    }

    pub(crate) fn snapshot(&self) -> &QuerySnapshot {
        &self.snapshot
    }

    pub(crate) fn dispatch(self) {
        for observer in &self.observers {
            observer.deliver(&self.snapshot);
        }
    }
}

/// Result of registering an observer.
pub(crate) struct Subscribed {
    pub handle: ObserverHandle,
    /// The subscriber count went from 0 to 1.
    pub first: bool,
    /// The entry holds invalidated data.
    pub stale: bool,
}

/// Tracks observers per key and collects entries nobody observes.
pub struct SubscriptionManager {
    store: Arc<CacheStore>,
    metrics: Arc<dyn QueryMetrics>,
    runtime: Handle,
    next_observer_id: AtomicU64,
}

impl SubscriptionManager {
    pub fn new(store: Arc<CacheStore>, metrics: Arc<dyn QueryMetrics>, runtime: Handle) -> Self {
        SubscriptionManager {
            store,
            metrics,
            runtime,
            next_observer_id: AtomicU64::new(1),
        }
    }

    /// Register `callback` for `key`, creating an Idle entry if needed.
    ///
    /// The callback receives the current snapshot before this returns, unless
    /// a concurrent transition is already being delivered to it; that
    /// delivery then passes on the newest snapshot.
    pub(crate) fn subscribe(
        self: &Arc<Self>,
        key: &CacheKey,
        origin: QueryOrigin,
        keep_unused_for: Option<Duration>,
        callback: Box<ObserverFn>,
    ) -> Subscribed {
        let id = self.next_observer_id.fetch_add(1, Ordering::Relaxed);
        let observer = Arc::new(Observer::new(id, callback));

        let (snapshot, first, stale) = self.store.upsert(
            key,
            || CacheEntry::new(origin, keep_unused_for),
            |entry| {
                entry.cancel_gc();
                entry.add_observer(Arc::clone(&observer));
                (
                    entry.snapshot(),
                    entry.subscriber_count() == 1,
                    entry.is_stale(),
                )
            },
        );

        debug!(
            "✓ SUBSCRIBE {} (observer {}, first: {})",
            key, id, first
        );
        observer.deliver(&snapshot);

        Subscribed {
            handle: ObserverHandle {
                key: key.clone(),
                observer_id: id,
                manager: Arc::downgrade(self),
            },
            first,
            stale,
        }
    }

    /// Remove an observer; arms the collection timer when none are left.
    ///
    /// Unknown observer ids are ignored.
    pub(crate) fn unsubscribe(&self, key: &CacheKey, observer_id: u64) {
        let removed = self.store.update(key, |entry| {
            let observer = entry.remove_observer(observer_id)?;
            if entry.subscriber_count() == 0 {
                self.arm_gc(key, entry);
            }
            Some((observer, entry.subscriber_count()))
        });

        // The observer owns the callback, which may own handles of its own;
        // it is dropped here, outside the store lock.
        match removed.flatten() {
            Some((observer, count)) => {
                drop(observer);
                debug!(
                    "✓ UNSUBSCRIBE {} (observer {}, {} left)",
                    key, observer_id, count
                );
            }
            None => debug!("UNSUBSCRIBE {} ignored for observer {}", key, observer_id),
        }
    }

    fn arm_gc(&self, key: &CacheKey, entry: &mut CacheEntry) {
        let Some(delay) = entry.keep_unused_for() else {
            debug!("GC disabled for {}", key);
            return;
        };

        let generation = entry.next_gc_generation();
        let store = Arc::clone(&self.store);
        let metrics = Arc::clone(&self.metrics);
        let key = key.clone();

        debug!("GC armed for {} in {:?}", key, delay);
        let timer = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let removed = store.remove_if(&key, |entry| {
                entry.subscriber_count() == 0 && entry.gc_generation() == generation
            });
            if removed {
                metrics.record_evicted(key.as_str());
                debug!("✓ GC removed {}", key);
            }
        });
        entry.set_gc_timer(timer.abort_handle());
    }
}

/// A live subscription. Dropping it unsubscribes.
pub struct ObserverHandle {
    key: CacheKey,
    observer_id: u64,
    manager: Weak<SubscriptionManager>,
}

impl ObserverHandle {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn observer_id(&self) -> u64 {
        self.observer_id
    }

    /// Explicit form of dropping the handle.
    pub fn unsubscribe(self) {}
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.unsubscribe(&self.key, self.observer_id);
        }
    }
}

impl fmt::Debug for ObserverHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverHandle")
            .field("key", &self.key)
            .field("observer_id", &self.observer_id)
            .finish()
    }
}
