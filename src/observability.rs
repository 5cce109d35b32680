//! Observability hooks and retention policies for cached queries.
//!
//! This module separates two concerns:
//!
//! - **Metrics (`QueryMetrics`)**: hits, fetch latency, failures, discarded
//!   responses, evictions
//! - **Retention (`RetentionPolicy`)**: how long an entry without subscribers
//!   is kept before it is collected
//!
//! # Metrics
//!
//! ```ignore
//! use query_kit::observability::QueryMetrics;
//! use std::time::Duration;
//!
//! struct PrometheusMetrics;
//!
//! impl QueryMetrics for PrometheusMetrics {
//!     fn record_fetch(&self, _key: &str, _duration: Duration) {
//!         // histogram!("query_fetch_latency").record(duration);
//!     }
//!     // ... implement other methods
//! }
//!
//! // let client = QueryClient::builder(registry, transport)
//! //     .with_metrics(Box::new(PrometheusMetrics))
//! //     .build()?;
//! ```
//!
//! Default behavior uses `NoOpMetrics`. Methods that are not overridden log
//! via the `log` crate.
//!
//! # Retention Policies
//!
//! ```
//! use query_kit::observability::RetentionPolicy;
//! use std::time::Duration;
//!
//! // Keep unused entries for 5 minutes
//! let _policy = RetentionPolicy::Fixed(Duration::from_secs(300));
//!
//! // Different delay per endpoint
//! let _policy = RetentionPolicy::PerEndpoint(|endpoint| match endpoint {
//!     "getAllProducts" => Duration::from_secs(600),
//!     _ => Duration::from_secs(30),
//! });
//! ```
//!
//! | Policy | Delay |
//! |--------|-------|
//! | `Default` | 60 seconds |
//! | `Fixed` | The given duration for every endpoint |
//! | `Infinite` | Never collected |
//! | `PerEndpoint` | Chosen by endpoint name |
//!
//! An endpoint's own `keep_unused_data_for` always wins over the policy.

use std::time::Duration;

/// Delay used by `RetentionPolicy::Default`.
pub const DEFAULT_KEEP_UNUSED_DATA_FOR: Duration = Duration::from_secs(60);

/// Trait for query cache metrics collection.
pub trait QueryMetrics: Send + Sync {
    /// Record a subscription served from fresh cached data.
    fn record_hit(&self, key: &str) {
        debug!("Query HIT: {}", key);
    }

    /// Record a completed transport call (success or failure).
    fn record_fetch(&self, key: &str, duration: Duration) {
        debug!("Query FETCH: {} took {:?}", key, duration);
    }

    /// Record a failed fetch.
    fn record_error(&self, key: &str, error: &str) {
        warn!("Query ERROR for {}: {}", key, error);
    }

    /// Record a response dropped because a newer request superseded it.
    fn record_discarded(&self, key: &str, request_id: u64) {
        debug!("Query DISCARD: {} request {}", key, request_id);
    }

    /// Record an entry removed after its retention delay.
    fn record_evicted(&self, key: &str) {
        debug!("Query EVICT: {}", key);
    }
}

/// Default metrics implementation (no-op).
#[derive(Clone, Default)]
pub struct NoOpMetrics;

impl QueryMetrics for NoOpMetrics {
    fn record_hit(&self, _key: &str) {}
    fn record_fetch(&self, _key: &str, _duration: Duration) {}
    fn record_error(&self, _key: &str, _error: &str) {}
    fn record_discarded(&self, _key: &str, _request_id: u64) {}
    fn record_evicted(&self, _key: &str) {}
}

/// How long an entry without subscribers stays cached.
#[derive(Clone, Debug, Default)]
pub enum RetentionPolicy {
    /// [`DEFAULT_KEEP_UNUSED_DATA_FOR`]
    #[default]
    Default,

    /// Fixed duration for all endpoints
    Fixed(Duration),

    /// Entries are never collected
    Infinite,

    /// Custom per-endpoint policy
    PerEndpoint(fn(&str) -> Duration),
}

impl RetentionPolicy {
    /// Retention delay for an endpoint; `None` means keep forever.
    pub fn delay_for(&self, endpoint: &str) -> Option<Duration> {
        match self {
            RetentionPolicy::Default => Some(DEFAULT_KEEP_UNUSED_DATA_FOR),
            RetentionPolicy::Fixed(d) => Some(*d),
            RetentionPolicy::Infinite => None,
            RetentionPolicy::PerEndpoint(f) => Some(f(endpoint)),
        }
    }
}
