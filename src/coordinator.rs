//! Request coordinator - decides whether a key needs a transport call.
//!
//! For every key the coordinator either serves fresh cached data, joins the
//! request already in flight, or issues a new one. The in-flight registry is
//! separate from the cache store, so a pending request survives its entry
//! being collected and recreated.
//!
//! # Ordering
//!
//! Request ids come from one counter shared by all keys. When a response
//! arrives, it is applied only if the entry still points at the same request
//! id; anything older is dropped as a stale response.
//!
//! # Locking
//!
//! Deduplication relies on DashMap's entry API: the in-flight shard lock is
//! held while deciding and registering, so two callers can never both issue a
//! request for the same key. The store lock may be taken while the in-flight
//! lock is held, never the other way round.

use crate::endpoint::{EndpointDefinition, EndpointRegistry, RequestDescriptor};
use crate::error::{Error, Result};
use crate::key::CacheKey;
use crate::observability::QueryMetrics;
use crate::store::{CacheStore, QueryOrigin, QueryStatus};
use crate::subscription::Notification;
use crate::transport::Transport;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;

/// Shared handle to a pending fetch. Resolves once the result is applied
/// (or discarded).
pub type FetchTask = Shared<BoxFuture<'static, ()>>;

struct InFlight {
    request_id: u64,
    task: FetchTask,
}

/// When `ensure_fetched` issues a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Only when the entry holds no fresh data; joins a running request.
    IfStale,
    /// Always issue a new request, superseding any running one.
    Always,
    /// Issue a new request unless one is running, which is joined instead.
    UnlessInFlight,
}

/// What `ensure_fetched` decided, acted on after the locks are released.
enum Decision {
    /// Fresh data is cached.
    Hit,
    /// A request for the key is already running.
    Joined(FetchTask, Option<Notification>),
    /// A new request was registered and must be spawned.
    Issued(FetchTask, Notification),
    /// The request could not be built; the entry is in Error.
    Failed(Option<Notification>),
    /// The entry disappeared before the request could start.
    Skipped,
}

/// Coordinates transport calls for all keys of one client.
pub struct RequestCoordinator<T: Transport> {
    registry: Arc<EndpointRegistry>,
    store: Arc<CacheStore>,
    transport: Arc<T>,
    metrics: Arc<dyn QueryMetrics>,
    runtime: Handle,
    in_flight: DashMap<CacheKey, InFlight>,
    next_request_id: AtomicU64,
}

impl<T: Transport> RequestCoordinator<T> {
    pub fn new(
        registry: Arc<EndpointRegistry>,
        store: Arc<CacheStore>,
        transport: Arc<T>,
        metrics: Arc<dyn QueryMetrics>,
        runtime: Handle,
    ) -> Self {
        RequestCoordinator {
            registry,
            store,
            transport,
            metrics,
            runtime,
            in_flight: DashMap::new(),
            next_request_id: AtomicU64::new(1),
        }
    }

    /// Make sure `key` has, or is getting, data.
    ///
    /// Fire-and-forget: outcomes are delivered as store transitions. The
    /// returned task can be awaited by callers that want to know when the
    /// request has settled; `None` means no request is involved (cache hit).
    ///
    /// `mode` says whether fresh data or a running request is good enough;
    /// see [`FetchMode`]. A superseded request's result is discarded.
    ///
    /// # Errors
    /// Returns `Error::UnknownEndpoint` if the origin names no registered endpoint.
    pub fn ensure_fetched(
        self: &Arc<Self>,
        key: &CacheKey,
        origin: &QueryOrigin,
        mode: FetchMode,
    ) -> Result<Option<FetchTask>> {
        if mode == FetchMode::IfStale && self.is_fresh(key) {
            return Ok(self.act(key, Decision::Hit));
        }

        let definition = self.registry.get(&origin.endpoint)?;

        let decision = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(in_flight) if mode != FetchMode::Always => {
                self.join(key, in_flight.get())
            }
            Entry::Occupied(mut in_flight) => {
                let (decision, registration) = self.issue(key, origin, definition);
                if let Some(registration) = registration {
                    in_flight.insert(registration);
                }
                decision
            }
            Entry::Vacant(slot) => {
                // A request may have completed between the first check and
                // taking the lock.
                if mode == FetchMode::IfStale && self.is_fresh(key) {
                    Decision::Hit
                } else {
                    let (decision, registration) = self.issue(key, origin, definition);
                    if let Some(registration) = registration {
                        slot.insert(registration);
                    }
                    decision
                }
            }
        };

        Ok(self.act(key, decision))
    }

    /// Pending task for `key`, if a request is in flight.
    pub fn in_flight(&self, key: &CacheKey) -> Option<FetchTask> {
        self.in_flight.get(key).map(|in_flight| in_flight.task.clone())
    }

    /// Request id of the request in flight for `key`.
    pub fn in_flight_request(&self, key: &CacheKey) -> Option<u64> {
        self.in_flight.get(key).map(|in_flight| in_flight.request_id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    fn is_fresh(&self, key: &CacheKey) -> bool {
        self.store
            .inspect(key, |entry| entry.is_fresh())
            .unwrap_or(false)
    }

    fn join(&self, key: &CacheKey, in_flight: &InFlight) -> Decision {
        let request_id = in_flight.request_id;
        // The entry was collected and recreated while the request was pending.
        let notification = self
            .store
            .update(key, |entry| {
                (entry.status() == QueryStatus::Idle).then(|| {
                    entry.begin(request_id);
                    entry.notification()
                })
            })
            .flatten();

        debug!("» Query {} joined request {}", key, request_id);
        Decision::Joined(in_flight.task.clone(), notification)
    }

    fn issue(
        self: &Arc<Self>,
        key: &CacheKey,
        origin: &QueryOrigin,
        definition: Arc<EndpointDefinition>,
    ) -> (Decision, Option<InFlight>) {
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);

        let request = match self.registry.request_for(&origin.endpoint, &origin.args) {
            Ok(request) => request,
            Err(error) => {
                warn!("Query {} could not build request: {}", key, error);
                let notification = self.store.update(key, |entry| {
                    entry.begin(request_id);
                    entry.reject(error);
                    entry.notification()
                });
                return (Decision::Failed(notification), None);
            }
        };

        let Some(notification) = self.store.update(key, |entry| {
            entry.begin(request_id);
            entry.notification()
        }) else {
            return (Decision::Skipped, None);
        };

        let task = Arc::clone(self)
            .run(key.clone(), request_id, definition, request)
            .boxed()
            .shared();

        (
            Decision::Issued(task.clone(), notification),
            Some(InFlight { request_id, task }),
        )
    }

    fn act(&self, key: &CacheKey, decision: Decision) -> Option<FetchTask> {
        match decision {
            Decision::Hit => {
                self.metrics.record_hit(key.as_str());
                debug!("✓ Query {} -> HIT", key);
                None
            }
            Decision::Joined(task, notification) => {
                if let Some(notification) = notification {
                    notification.dispatch();
                }
                Some(task)
            }
            Decision::Issued(task, notification) => {
                debug!(
                    "» Query {} -> FETCH (request {})",
                    key,
                    notification.snapshot().request_id
                );
                notification.dispatch();
                self.runtime.spawn(task.clone());
                Some(task)
            }
            Decision::Failed(notification) => {
                if let Some(notification) = notification {
                    notification.dispatch();
                }
                None
            }
            Decision::Skipped => {
                debug!("Query {} no longer cached, fetch skipped", key);
                None
            }
        }
    }

    async fn run(
        self: Arc<Self>,
        key: CacheKey,
        request_id: u64,
        definition: Arc<EndpointDefinition>,
        request: RequestDescriptor,
    ) {
        let timer = Instant::now();
        let outcome = match self.transport.execute(request).await {
            Ok(body) => definition.decode(&body),
            Err(error) => Err(error),
        };
        self.metrics.record_fetch(key.as_str(), timer.elapsed());
        self.complete(&key, request_id, outcome);
    }

    /// Apply a response if it belongs to the entry's latest request.
    fn complete(&self, key: &CacheKey, request_id: u64, outcome: Result<Value>) {
        let failure = outcome.as_ref().err().map(|error| error.to_string());

        let applied = self
            .store
            .update(key, |entry| {
                if entry.request_id() != request_id {
                    return None;
                }
                match outcome {
                    Ok(data) => entry.fulfill(data),
                    Err(error) => entry.reject(error),
                }
                Some(entry.notification())
            })
            .flatten();

        self.in_flight
            .remove_if(key, |_, in_flight| in_flight.request_id == request_id);

        match applied {
            Some(notification) => {
                match &failure {
                    Some(error) => self.metrics.record_error(key.as_str(), error),
                    None => info!("✓ Query {} request {} succeeded", key, request_id),
                }
                notification.dispatch();
            }
            None => {
                let stale = Error::StaleResponseDiscarded {
                    key: key.to_string(),
                    request_id,
                };
                self.metrics.record_discarded(key.as_str(), request_id);
                debug!("✗ {}", stale);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{EndpointDefinition, EndpointRegistry};
    use crate::key::CacheKeyBuilder;
    use crate::observability::NoOpMetrics;
    use crate::store::CacheEntry;
    use crate::transport::InMemoryTransport;
    use serde_json::json;
    use std::time::Duration;

    fn registry() -> Arc<EndpointRegistry> {
        Arc::new(
            EndpointRegistry::builder("productsApi")
                .endpoint(EndpointDefinition::query("getProduct", |p: String| {
                    RequestDescriptor::get(format!("products/search?q={}", p))
                }))
                .build()
                .expect("Failed to build registry"),
        )
    }

    fn setup(
        transport: InMemoryTransport,
    ) -> (Arc<CacheStore>, Arc<RequestCoordinator<InMemoryTransport>>) {
        let store = Arc::new(CacheStore::new());
        let coordinator = Arc::new(RequestCoordinator::new(
            registry(),
            Arc::clone(&store),
            Arc::new(transport),
            Arc::new(NoOpMetrics),
            Handle::current(),
        ));
        (store, coordinator)
    }

    fn origin(product: &str) -> QueryOrigin {
        QueryOrigin {
            endpoint: "getProduct".to_string(),
            args: json!(product),
        }
    }

    fn seed(store: &CacheStore, product: &str) -> CacheKey {
        let key = CacheKeyBuilder::build("getProduct", product).expect("Failed to build key");
        store.upsert(&key, || CacheEntry::new(origin(product), None), |_| {});
        key
    }

    #[tokio::test]
    async fn test_ensure_fetched_issues_and_applies() {
        let transport = InMemoryTransport::new();
        transport.respond_json("products/search?q=iphone", json!({"products": ["iphone"]}));
        let (store, coordinator) = setup(transport.clone());
        let key = seed(&store, "iphone");

        let task = coordinator
            .ensure_fetched(&key, &origin("iphone"), FetchMode::IfStale)
            .expect("Failed to ensure")
            .expect("request issued");
        assert_eq!(store.get(&key).map(|s| s.status), Some(QueryStatus::Loading));

        task.await;
        let snap = store.get(&key).expect("entry exists");
        assert_eq!(snap.status, QueryStatus::Success);
        assert_eq!(snap.data, Some(json!({"products": ["iphone"]})));
        assert_eq!(coordinator.in_flight_count(), 0);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_ensure_fetched_joins_in_flight() {
        let transport = InMemoryTransport::new();
        transport.respond_json("products/search?q=iphone", json!([]));
        let (store, coordinator) = setup(transport.clone());
        let key = seed(&store, "iphone");

        let first = coordinator
            .ensure_fetched(&key, &origin("iphone"), FetchMode::IfStale)
            .expect("Failed to ensure")
            .expect("request issued");
        let second = coordinator
            .ensure_fetched(&key, &origin("iphone"), FetchMode::IfStale)
            .expect("Failed to ensure")
            .expect("joined");

        first.await;
        second.await;
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_ensure_fetched_hit_after_success() {
        let transport = InMemoryTransport::new();
        transport.respond_json("products/search?q=iphone", json!([]));
        let (store, coordinator) = setup(transport.clone());
        let key = seed(&store, "iphone");

        if let Some(task) = coordinator
            .ensure_fetched(&key, &origin("iphone"), FetchMode::IfStale)
            .expect("Failed to ensure")
        {
            task.await;
        }

        let again = coordinator
            .ensure_fetched(&key, &origin("iphone"), FetchMode::IfStale)
            .expect("Failed to ensure");
        assert!(again.is_none());
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_forced_request_supersedes_in_flight() {
        let transport = InMemoryTransport::new();
        transport.respond_json("products/search?q=iphone", json!([]));
        let (store, coordinator) = setup(transport.clone());
        let key = seed(&store, "iphone");

        let first = coordinator
            .ensure_fetched(&key, &origin("iphone"), FetchMode::IfStale)
            .expect("Failed to ensure")
            .expect("request issued");
        let first_id = coordinator.in_flight_request(&key).expect("in flight");

        let second = coordinator
            .ensure_fetched(&key, &origin("iphone"), FetchMode::Always)
            .expect("Failed to ensure")
            .expect("request issued");
        let second_id = coordinator.in_flight_request(&key).expect("in flight");
        assert!(second_id > first_id);

        first.await;
        second.await;

        let snap = store.get(&key).expect("entry exists");
        assert_eq!(snap.request_id, second_id);
        assert_eq!(snap.status, QueryStatus::Success);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_unless_in_flight_joins_then_refreshes() {
        let transport = InMemoryTransport::new();
        transport.respond_json("products/search?q=iphone", json!([]));
        let (store, coordinator) = setup(transport.clone());
        let key = seed(&store, "iphone");

        let first = coordinator
            .ensure_fetched(&key, &origin("iphone"), FetchMode::IfStale)
            .expect("Failed to ensure")
            .expect("request issued");
        let first_id = coordinator.in_flight_request(&key).expect("in flight");

        // A running request is joined, not replaced.
        let joined = coordinator
            .ensure_fetched(&key, &origin("iphone"), FetchMode::UnlessInFlight)
            .expect("Failed to ensure")
            .expect("joined");
        assert_eq!(coordinator.in_flight_request(&key), Some(first_id));
        first.await;
        joined.await;
        assert_eq!(transport.calls(), 1);

        // Fresh data does not stop a new request.
        let refreshed = coordinator
            .ensure_fetched(&key, &origin("iphone"), FetchMode::UnlessInFlight)
            .expect("Failed to ensure")
            .expect("request issued");
        refreshed.await;
        assert_eq!(transport.calls(), 2);
        assert!(store.get(&key).expect("entry exists").request_id > first_id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_unless_in_flight_issues_once() {
        let transport = InMemoryTransport::new().with_latency(Duration::from_millis(250));
        transport.respond_json("products/search?q=iphone", json!([]));
        let (store, coordinator) = setup(transport.clone());
        let key = seed(&store, "iphone");

        let barrier = Arc::new(std::sync::Barrier::new(8));
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let coordinator = Arc::clone(&coordinator);
                let barrier = Arc::clone(&barrier);
                let key = key.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    coordinator
                        .ensure_fetched(&key, &origin("iphone"), FetchMode::UnlessInFlight)
                        .expect("Failed to ensure")
                        .expect("request issued or joined")
                })
            })
            .collect();

        for worker in workers {
            worker.join().expect("worker panicked").await;
        }
        assert_eq!(transport.calls(), 1);
        assert_eq!(
            store.get(&key).map(|s| s.status),
            Some(QueryStatus::Success)
        );
    }

    #[tokio::test]
    async fn test_transport_failure_sets_error() {
        let transport = InMemoryTransport::new();
        transport.fail("products/search?q=iphone", json!({"code": 500}));
        let (store, coordinator) = setup(transport);
        let key = seed(&store, "iphone");

        if let Some(task) = coordinator
            .ensure_fetched(&key, &origin("iphone"), FetchMode::IfStale)
            .expect("Failed to ensure")
        {
            task.await;
        }

        let snap = store.get(&key).expect("entry exists");
        assert_eq!(snap.status, QueryStatus::Error);
        assert_eq!(snap.error, Some(Error::Transport(json!({"code": 500}))));
        assert_eq!(snap.data, None);
    }

    #[tokio::test]
    async fn test_decode_failure_sets_error() {
        let transport = InMemoryTransport::new();
        transport.respond_raw("products/search?q=iphone", "not json");
        let (store, coordinator) = setup(transport);
        let key = seed(&store, "iphone");

        if let Some(task) = coordinator
            .ensure_fetched(&key, &origin("iphone"), FetchMode::IfStale)
            .expect("Failed to ensure")
        {
            task.await;
        }

        let snap = store.get(&key).expect("entry exists");
        assert!(matches!(snap.error, Some(Error::Decode(_))));
    }

    #[tokio::test]
    async fn test_bad_arguments_fail_without_transport_call() {
        let transport = InMemoryTransport::new();
        let (store, coordinator) = setup(transport.clone());
        let key = CacheKeyBuilder::build("getProduct", &42).expect("Failed to build key");
        let bad_origin = QueryOrigin {
            endpoint: "getProduct".to_string(),
            args: json!(42),
        };
        store.upsert(&key, || CacheEntry::new(bad_origin.clone(), None), |_| {});

        let task = coordinator
            .ensure_fetched(&key, &bad_origin, FetchMode::IfStale)
            .expect("Failed to ensure");
        assert!(task.is_none());

        let snap = store.get(&key).expect("entry exists");
        assert!(matches!(snap.error, Some(Error::InvalidArguments(_))));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_endpoint() {
        let (_store, coordinator) = setup(InMemoryTransport::new());
        let key = CacheKeyBuilder::build("nope", &()).expect("Failed to build key");
        let origin = QueryOrigin {
            endpoint: "nope".to_string(),
            args: Value::Null,
        };
        let err = coordinator
            .ensure_fetched(&key, &origin, FetchMode::IfStale)
            .err()
            .expect("unknown endpoint rejected");
        assert_eq!(err, Error::UnknownEndpoint("nope".to_string()));
    }

    #[tokio::test]
    async fn test_result_for_removed_entry_is_discarded() {
        let transport = InMemoryTransport::new();
        transport.respond_json("products/search?q=iphone", json!([]));
        let (store, coordinator) = setup(transport);
        let key = seed(&store, "iphone");

        let task = coordinator
            .ensure_fetched(&key, &origin("iphone"), FetchMode::IfStale)
            .expect("Failed to ensure")
            .expect("request issued");
        store.remove(&key);

        task.await;
        assert!(!store.contains(&key));
        assert_eq!(coordinator.in_flight_count(), 0);
    }
}
