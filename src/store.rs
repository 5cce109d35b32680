//! Cache store: the single source of truth for query state.
//!
//! Uses DashMap for concurrent access with per-key sharding. Every mutation
//! goes through [`CacheStore::upsert`] or [`CacheStore::update`], which hold
//! the shard lock for the whole read-modify-write, so two callers can never
//! interleave on the same key. Reads hand out [`QuerySnapshot`] copies.

use crate::error::Error;
use crate::key::CacheKey;
use crate::subscription::{Notification, Observer};
use dashmap::DashMap;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::AbortHandle;

/// Lifecycle state of a cache entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum QueryStatus {
    #[default]
    Idle,
    Loading,
    Success,
    Error,
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryStatus::Idle => write!(f, "Idle"),
            QueryStatus::Loading => write!(f, "Loading"),
            QueryStatus::Success => write!(f, "Success"),
            QueryStatus::Error => write!(f, "Error"),
        }
    }
}

/// The call an entry was created for. Needed to rebuild the request on refetch.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryOrigin {
    pub endpoint: String,
    pub args: Value,
}

/// Immutable view of a cache entry, as delivered to observers.
#[derive(Clone, Debug, PartialEq)]
pub struct QuerySnapshot {
    pub status: QueryStatus,
    /// Last successful payload. Kept while refetching and after errors.
    pub data: Option<Value>,
    pub error: Option<Error>,
    /// Most recently issued request for the entry (0 before the first one).
    pub request_id: u64,
    /// Transition counter; strictly increases with every state change.
    pub version: u64,
    pub fulfilled_at: Option<Instant>,
}

impl QuerySnapshot {
    /// Snapshot of a key that has no entry.
    pub fn idle() -> Self {
        QuerySnapshot {
            status: QueryStatus::Idle,
            data: None,
            error: None,
            request_id: 0,
            version: 0,
            fulfilled_at: None,
        }
    }

    pub fn is_uninitialized(&self) -> bool {
        self.status == QueryStatus::Idle
    }

    /// First load: a request is running and there is no data yet.
    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Loading && self.data.is_none()
    }

    /// Any request is running, including refetches over existing data.
    pub fn is_fetching(&self) -> bool {
        self.status == QueryStatus::Loading
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }
}

impl Default for QuerySnapshot {
    fn default() -> Self {
        Self::idle()
    }
}

/// Per-key state record. Owned by [`CacheStore`]; only reachable through its
/// mutation closures.
pub struct CacheEntry {
    origin: QueryOrigin,
    status: QueryStatus,
    data: Option<Value>,
    error: Option<Error>,
    request_id: u64,
    data_request_id: u64,
    invalidated_through: u64,
    version: u64,
    fulfilled_at: Option<Instant>,
    observers: Vec<Arc<Observer>>,
    keep_unused_for: Option<Duration>,
    gc_timer: Option<AbortHandle>,
    gc_generation: u64,
}

impl CacheEntry {
    /// New Idle entry. `keep_unused_for` of `None` disables collection.
    pub fn new(origin: QueryOrigin, keep_unused_for: Option<Duration>) -> Self {
        CacheEntry {
            origin,
            status: QueryStatus::Idle,
            data: None,
            error: None,
            request_id: 0,
            data_request_id: 0,
            invalidated_through: 0,
            // Observers start at 0, so even the first snapshot is "newer".
            version: 1,
            fulfilled_at: None,
            observers: Vec::new(),
            keep_unused_for,
            gc_timer: None,
            gc_generation: 0,
        }
    }

    pub fn origin(&self) -> &QueryOrigin {
        &self.origin
    }

    pub fn status(&self) -> QueryStatus {
        self.status
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn subscriber_count(&self) -> usize {
        self.observers.len()
    }

    pub fn keep_unused_for(&self) -> Option<Duration> {
        self.keep_unused_for
    }

    pub fn has_gc_timer(&self) -> bool {
        self.gc_timer.is_some()
    }

    pub(crate) fn gc_generation(&self) -> u64 {
        self.gc_generation
    }

    /// Successful data from a request newer than the last invalidation.
    pub fn is_fresh(&self) -> bool {
        self.status == QueryStatus::Success && self.data_request_id > self.invalidated_through
    }

    /// Successful data that has been invalidated since it was fetched.
    pub fn is_stale(&self) -> bool {
        self.status == QueryStatus::Success && !self.is_fresh()
    }

    pub fn snapshot(&self) -> QuerySnapshot {
        QuerySnapshot {
            status: self.status,
            data: self.data.clone(),
            error: self.error.clone(),
            request_id: self.request_id,
            version: self.version,
            fulfilled_at: self.fulfilled_at,
        }
    }

    pub(crate) fn notification(&self) -> Notification {
        Notification::new(self.snapshot(), self.observers.clone())
    }

    // ------------------------------------------------------------------
    // Lifecycle transitions
    // ------------------------------------------------------------------

    /// Idle/Success/Error -> Loading for a newly issued (or joined) request.
    pub(crate) fn begin(&mut self, request_id: u64) {
        self.status = QueryStatus::Loading;
        self.error = None;
        self.request_id = request_id;
        self.version += 1;
    }

    /// Loading -> Success.
    pub(crate) fn fulfill(&mut self, data: Value) {
        self.status = QueryStatus::Success;
        self.data = Some(data);
        self.error = None;
        self.data_request_id = self.request_id;
        self.fulfilled_at = Some(Instant::now());
        self.version += 1;
    }

    /// Loading -> Error. Previous data stays available.
    pub(crate) fn reject(&mut self, error: Error) {
        self.status = QueryStatus::Error;
        self.error = Some(error);
        self.version += 1;
    }

    /// Mark everything fetched so far (or in flight) as stale.
    pub(crate) fn invalidate(&mut self) {
        self.invalidated_through = self.request_id;
    }

    // ------------------------------------------------------------------
    // Subscribers and collection
    // ------------------------------------------------------------------

    pub(crate) fn add_observer(&mut self, observer: Arc<Observer>) {
        self.observers.push(observer);
    }

    /// Returns `None` if no observer with this id is registered.
    pub(crate) fn remove_observer(&mut self, observer_id: u64) -> Option<Arc<Observer>> {
        let position = self.observers.iter().position(|o| o.id() == observer_id)?;
        Some(self.observers.remove(position))
    }

    /// Cancel a pending collection. Bumping the generation also defuses a
    /// timer that already fired and is waiting for the shard lock.
    pub(crate) fn cancel_gc(&mut self) {
        if let Some(timer) = self.gc_timer.take() {
            timer.abort();
        }
        self.gc_generation += 1;
    }

    /// Start a new timer generation and return it.
    pub(crate) fn next_gc_generation(&mut self) -> u64 {
        self.cancel_gc();
        self.gc_generation
    }

    pub(crate) fn set_gc_timer(&mut self, timer: AbortHandle) {
        self.gc_timer = Some(timer);
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("origin", &self.origin)
            .field("status", &self.status)
            .field("request_id", &self.request_id)
            .field("subscriber_count", &self.observers.len())
            .field("gc_pending", &self.gc_timer.is_some())
            .finish()
    }
}

/// Concurrent map from cache key to entry.
#[derive(Default)]
pub struct CacheStore {
    entries: DashMap<CacheKey, CacheEntry>,
}

impl CacheStore {
    pub fn new() -> Self {
        CacheStore {
            entries: DashMap::new(),
        }
    }

    /// Snapshot of an entry, if present.
    pub fn get(&self, key: &CacheKey) -> Option<QuerySnapshot> {
        self.entries.get(key).map(|entry| entry.snapshot())
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Read an entry in place without cloning it.
    pub fn inspect<R>(&self, key: &CacheKey, reader: impl FnOnce(&CacheEntry) -> R) -> Option<R> {
        self.entries.get(key).map(|entry| reader(entry.value()))
    }

    /// Origin of an entry, if present.
    pub fn origin(&self, key: &CacheKey) -> Option<QueryOrigin> {
        self.entries.get(key).map(|entry| entry.origin().clone())
    }

    /// Atomically create-if-absent and mutate an entry.
    pub fn upsert<R>(
        &self,
        key: &CacheKey,
        create: impl FnOnce() -> CacheEntry,
        mutator: impl FnOnce(&mut CacheEntry) -> R,
    ) -> R {
        let mut entry = self.entries.entry(key.clone()).or_insert_with(create);
        mutator(entry.value_mut())
    }

    /// Atomically mutate an existing entry; `None` if the key is absent.
    pub fn update<R>(
        &self,
        key: &CacheKey,
        mutator: impl FnOnce(&mut CacheEntry) -> R,
    ) -> Option<R> {
        self.entries
            .get_mut(key)
            .map(|mut entry| mutator(entry.value_mut()))
    }

    /// Remove an entry unconditionally.
    pub fn remove(&self, key: &CacheKey) -> Option<QuerySnapshot> {
        let (_, mut entry) = self.entries.remove(key)?;
        entry.cancel_gc();
        debug!("✓ Store REMOVE {}", key);
        Some(entry.snapshot())
    }

    /// Remove an entry if the predicate holds under the shard lock.
    pub fn remove_if(&self, key: &CacheKey, predicate: impl FnOnce(&CacheEntry) -> bool) -> bool {
        self.entries
            .remove_if(key, |_, entry| predicate(entry))
            .is_some()
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry and its pending timers. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let keys = self.keys();
        let mut removed = 0;
        for key in keys {
            // Entries leave the map before they drop, so observer callbacks
            // released here can call back into the store.
            if let Some((_, mut entry)) = self.entries.remove(&key) {
                entry.cancel_gc();
                removed += 1;
            }
        }
        warn!("⚠ Store CLEAR executed - {} entries dropped", removed);
        removed
    }

    pub fn stats(&self) -> StoreStats {
        let mut stats = StoreStats::default();
        for entry in self.entries.iter() {
            stats.total_entries += 1;
            stats.total_subscribers += entry.subscriber_count();
            if entry.subscriber_count() == 0 {
                stats.unused_entries += 1;
            }
            match entry.status() {
                QueryStatus::Loading => stats.loading_entries += 1,
                QueryStatus::Error => stats.error_entries += 1,
                _ => {}
            }
        }
        stats
    }
}

/// Store statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub total_entries: usize,
    pub unused_entries: usize,
    pub total_subscribers: usize,
    pub loading_entries: usize,
    pub error_entries: usize,
}
