//! High-level query client.
//!
//! Ties the endpoint registry, cache store, request coordinator and
//! subscription manager together behind one cheaply cloneable handle.

use crate::coordinator::{FetchMode, RequestCoordinator};
use crate::endpoint::EndpointRegistry;
use crate::error::{Error, Result};
use crate::key::{CacheKey, CacheKeyBuilder};
use crate::observability::{NoOpMetrics, QueryMetrics, RetentionPolicy};
use crate::store::{CacheStore, QueryOrigin, QuerySnapshot, StoreStats};
use crate::strategy::FetchPolicy;
use crate::subscription::{ObserverFn, ObserverHandle, SubscriptionManager};
use crate::transport::Transport;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;

struct ClientInner<T: Transport> {
    registry: Arc<EndpointRegistry>,
    store: Arc<CacheStore>,
    coordinator: Arc<RequestCoordinator<T>>,
    subscriptions: Arc<SubscriptionManager>,
    retention: RetentionPolicy,
}

/// Client for declarative, key-based data fetching.
///
/// Cloning is cheap; every clone shares the same cache.
///
/// # Example
///
/// ```ignore
/// use query_kit::{EndpointDefinition, EndpointRegistry, QueryClient, RequestDescriptor};
///
/// let registry = EndpointRegistry::builder("productsApi")
///     .base_url("https://dummyjson.com/")
///     .endpoint(EndpointDefinition::query("getProduct", |product: String| {
///         RequestDescriptor::get(format!("products/search?q={}", product))
///     }))
///     .build()?;
///
/// let client = QueryClient::new(registry, transport)?;
/// let handle = client.subscribe("getProduct", "iphone", |snapshot| {
///     println!("{} {:?}", snapshot.status, snapshot.data);
/// })?;
/// ```
pub struct QueryClient<T: Transport> {
    inner: Arc<ClientInner<T>>,
}

impl<T: Transport> Clone for QueryClient<T> {
    fn clone(&self) -> Self {
        QueryClient {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> QueryClient<T> {
    /// Create a client with default metrics and retention on the current
    /// Tokio runtime.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` when called outside a Tokio runtime.
    pub fn new(registry: impl Into<Arc<EndpointRegistry>>, transport: T) -> Result<Self> {
        Self::builder(registry, transport).build()
    }

    pub fn builder(
        registry: impl Into<Arc<EndpointRegistry>>,
        transport: T,
    ) -> QueryClientBuilder<T> {
        QueryClientBuilder {
            registry: registry.into(),
            transport,
            metrics: None,
            retention: RetentionPolicy::default(),
            runtime: None,
        }
    }

    /// Observe `endpoint(args)` with the default `CacheFirst` policy.
    ///
    /// See [`QueryClient::subscribe_with`].
    pub fn subscribe<A, F>(&self, endpoint: &str, args: &A, callback: F) -> Result<ObserverHandle>
    where
        A: Serialize + ?Sized,
        F: Fn(&QuerySnapshot) + Send + Sync + 'static,
    {
        self.subscribe_with(endpoint, args, FetchPolicy::CacheFirst, callback)
    }

    /// Observe `endpoint(args)`.
    ///
    /// The callback receives the current snapshot before this returns, then
    /// every later transition of the entry. Dropping the returned handle
    /// unsubscribes.
    ///
    /// # Errors
    /// - `Error::UnknownEndpoint` if `endpoint` is not registered
    /// - `Error::InvalidArguments` if `args` cannot be serialized
    pub fn subscribe_with<A, F>(
        &self,
        endpoint: &str,
        args: &A,
        policy: FetchPolicy,
        callback: F,
    ) -> Result<ObserverHandle>
    where
        A: Serialize + ?Sized,
        F: Fn(&QuerySnapshot) + Send + Sync + 'static,
    {
        let query = self.prepare(endpoint, args)?;
        self.attach(&query, policy, Box::new(callback))
    }

    /// Observe `endpoint(args)` through a watch channel instead of a callback.
    ///
    /// # Errors
    /// Same as [`QueryClient::subscribe`].
    pub fn watch<A>(&self, endpoint: &str, args: &A) -> Result<QueryWatch>
    where
        A: Serialize + ?Sized,
    {
        let (sender, receiver) = watch::channel(QuerySnapshot::idle());
        let handle = self.subscribe(endpoint, args, move |snapshot| {
            sender.send_replace(snapshot.clone());
        })?;
        Ok(QueryWatch { handle, receiver })
    }

    /// Explicit form of dropping the handle.
    pub fn unsubscribe(&self, handle: ObserverHandle) {
        handle.unsubscribe();
    }

    /// Subscribe, request the data unless fresh data is cached, wait until no
    /// request is pending for the key, and return the resulting snapshot.
    ///
    /// The temporary subscription is released afterwards, so the entry
    /// follows the usual retention rules.
    ///
    /// # Errors
    /// Same as [`QueryClient::subscribe`]. Fetch failures are not errors here;
    /// they show up as a snapshot in the `Error` state.
    pub async fn fetch<A>(&self, endpoint: &str, args: &A) -> Result<QuerySnapshot>
    where
        A: Serialize + ?Sized,
    {
        let query = self.prepare(endpoint, args)?;
        let handle = self.attach(
            &query,
            FetchPolicy::CacheOnly,
            Box::new(|_: &QuerySnapshot| {}),
        )?;
        // Another subscriber may have been counted first without having
        // registered its request yet, so ask for the data directly.
        self.inner
            .coordinator
            .ensure_fetched(&query.key, &query.origin, FetchMode::IfStale)?;
        while let Some(task) = self.inner.coordinator.in_flight(handle.key()) {
            task.await;
        }
        let snapshot = self.snapshot_by_key(handle.key());
        drop(handle);
        Ok(snapshot)
    }

    /// Current snapshot for `endpoint(args)`; Idle if nothing is cached.
    ///
    /// # Errors
    /// Returns `Error::InvalidArguments` if `args` cannot be serialized.
    pub fn snapshot<A>(&self, endpoint: &str, args: &A) -> Result<QuerySnapshot>
    where
        A: Serialize + ?Sized,
    {
        let key = CacheKeyBuilder::build(endpoint, args)?;
        Ok(self.snapshot_by_key(&key))
    }

    pub fn snapshot_by_key(&self, key: &CacheKey) -> QuerySnapshot {
        self.inner.store.get(key).unwrap_or_default()
    }

    /// Cache key for `endpoint(args)`.
    ///
    /// # Errors
    /// Returns `Error::InvalidArguments` if `args` cannot be serialized.
    pub fn cache_key<A>(&self, endpoint: &str, args: &A) -> Result<CacheKey>
    where
        A: Serialize + ?Sized,
    {
        CacheKeyBuilder::build(endpoint, args)
    }

    /// Mark the entry for `endpoint(args)` stale.
    ///
    /// Entries with subscribers are refetched immediately; unobserved
    /// entries are refetched by their next subscriber. Unknown keys are
    /// ignored.
    ///
    /// # Errors
    /// Returns `Error::InvalidArguments` if `args` cannot be serialized.
    pub fn invalidate<A>(&self, endpoint: &str, args: &A) -> Result<()>
    where
        A: Serialize + ?Sized,
    {
        let key = CacheKeyBuilder::build(endpoint, args)?;
        let observed = self.inner.store.update(&key, |entry| {
            entry.invalidate();
            (entry.subscriber_count() > 0).then(|| entry.origin().clone())
        });

        match observed {
            None => debug!("Invalidate {} ignored, not cached", key),
            Some(None) => info!("✓ Query {} invalidated", key),
            Some(Some(origin)) => {
                info!("✓ Query {} invalidated, refetching", key);
                self.inner
                    .coordinator
                    .ensure_fetched(&key, &origin, FetchMode::Always)?;
            }
        }
        Ok(())
    }

    /// Issue a new request for a cached key, superseding any request in
    /// flight.
    ///
    /// # Errors
    /// Returns `Error::NotCached` if the key has no entry.
    pub fn refetch(&self, key: &CacheKey) -> Result<()> {
        let origin = self
            .inner
            .store
            .update(key, |entry| {
                entry.invalidate();
                entry.origin().clone()
            })
            .ok_or_else(|| Error::NotCached(key.to_string()))?;

        self.inner
            .coordinator
            .ensure_fetched(key, &origin, FetchMode::Always)?;
        Ok(())
    }

    /// Drop every cached entry. Pending responses for dropped entries are
    /// discarded when they arrive.
    pub fn clear(&self) -> usize {
        self.inner.store.clear()
    }

    pub fn stats(&self) -> StoreStats {
        self.inner.store.stats()
    }

    /// Number of requests currently in flight.
    pub fn in_flight_count(&self) -> usize {
        self.inner.coordinator.in_flight_count()
    }

    pub fn registry(&self) -> &EndpointRegistry {
        &self.inner.registry
    }

    pub fn store(&self) -> &CacheStore {
        &self.inner.store
    }

    fn prepare<A>(&self, endpoint: &str, args: &A) -> Result<PreparedQuery>
    where
        A: Serialize + ?Sized,
    {
        let definition = self.inner.registry.get(endpoint)?;
        let args = CacheKeyBuilder::args_value(args)?;
        let key = CacheKeyBuilder::build_from_value(endpoint, &args);
        let keep_unused_for = definition
            .retention_override()
            .or_else(|| self.inner.retention.delay_for(endpoint));

        Ok(PreparedQuery {
            key,
            origin: QueryOrigin {
                endpoint: endpoint.to_string(),
                args,
            },
            keep_unused_for,
        })
    }

    fn attach(
        &self,
        query: &PreparedQuery,
        policy: FetchPolicy,
        callback: Box<ObserverFn>,
    ) -> Result<ObserverHandle> {
        let key = &query.key;
        let subscribed = self.inner.subscriptions.subscribe(
            key,
            query.origin.clone(),
            query.keep_unused_for,
            callback,
        );

        match policy {
            FetchPolicy::CacheFirst => {
                if subscribed.first || subscribed.stale {
                    self.inner
                        .coordinator
                        .ensure_fetched(key, &query.origin, FetchMode::IfStale)?;
                }
            }
            FetchPolicy::CacheOnly => {
                debug!("Query {} subscribed cache-only", key);
            }
            FetchPolicy::Refetch => {
                self.inner
                    .coordinator
                    .ensure_fetched(key, &query.origin, FetchMode::UnlessInFlight)?;
            }
        }

        Ok(subscribed.handle)
    }
}

/// A call resolved against the registry.
struct PreparedQuery {
    key: CacheKey,
    origin: QueryOrigin,
    keep_unused_for: Option<Duration>,
}

/// Builder for [`QueryClient`].
pub struct QueryClientBuilder<T: Transport> {
    registry: Arc<EndpointRegistry>,
    transport: T,
    metrics: Option<Box<dyn QueryMetrics>>,
    retention: RetentionPolicy,
    runtime: Option<Handle>,
}

impl<T: Transport> QueryClientBuilder<T> {
    pub fn with_metrics(mut self, metrics: Box<dyn QueryMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_retention_policy(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    /// Runtime used for requests and collection timers. Defaults to the
    /// runtime `build` is called on.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// # Errors
    /// Returns `Error::ConfigError` if no runtime was given and `build` is
    /// called outside a Tokio runtime.
    pub fn build(self) -> Result<QueryClient<T>> {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|e| {
                Error::ConfigError(format!("QueryClient needs a Tokio runtime: {}", e))
            })?,
        };

        let metrics: Arc<dyn QueryMetrics> = match self.metrics {
            Some(metrics) => Arc::from(metrics),
            None => Arc::new(NoOpMetrics),
        };

        let store = Arc::new(CacheStore::new());
        let coordinator = Arc::new(RequestCoordinator::new(
            Arc::clone(&self.registry),
            Arc::clone(&store),
            Arc::new(self.transport),
            Arc::clone(&metrics),
            runtime.clone(),
        ));
        let subscriptions = Arc::new(SubscriptionManager::new(
            Arc::clone(&store),
            metrics,
            runtime,
        ));

        info!(
            "✓ QueryClient for {} ready ({} endpoints)",
            self.registry.name(),
            self.registry.len()
        );

        Ok(QueryClient {
            inner: Arc::new(ClientInner {
                registry: self.registry,
                store,
                coordinator,
                subscriptions,
                retention: self.retention,
            }),
        })
    }
}

/// Subscription that exposes snapshots through a `tokio::sync::watch`
/// channel.
#[derive(Debug)]
pub struct QueryWatch {
    handle: ObserverHandle,
    receiver: watch::Receiver<QuerySnapshot>,
}

impl QueryWatch {
    pub fn handle(&self) -> &ObserverHandle {
        &self.handle
    }

    pub fn key(&self) -> &CacheKey {
        self.handle.key()
    }

    /// Latest delivered snapshot.
    pub fn current(&self) -> QuerySnapshot {
        self.receiver.borrow().clone()
    }

    /// Wait for the next transition.
    ///
    /// # Errors
    /// Returns `Error::Other` if the entry was dropped (e.g. by `clear`).
    pub async fn changed(&mut self) -> Result<QuerySnapshot> {
        self.receiver
            .changed()
            .await
            .map_err(|_| Error::Other(format!("entry {} was dropped", self.handle.key())))?;
        Ok(self.current())
    }

    /// Wait until a snapshot satisfies `predicate`, including the current one.
    ///
    /// # Errors
    /// Returns `Error::Other` if the entry was dropped (e.g. by `clear`).
    pub async fn wait_for(
        &mut self,
        predicate: impl FnMut(&QuerySnapshot) -> bool,
    ) -> Result<QuerySnapshot> {
        let key = self.handle.key().to_string();
        self.receiver
            .wait_for(predicate)
            .await
            .map(|snapshot| (*snapshot).clone())
            .map_err(|_| Error::Other(format!("entry {} was dropped", key)))
    }
}
