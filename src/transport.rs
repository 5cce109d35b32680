//! Transport adapter trait for executing remote calls.
//!
//! The `Transport` trait decouples the query cache from any HTTP client or
//! RPC stack. The embedding application supplies one; the cache only ever
//! calls [`Transport::execute`] and decodes the returned body as JSON.
//!
//! # Implementing Transport
//!
//! ```ignore
//! use query_kit::{Error, RequestDescriptor, Result, Transport};
//! use std::future::Future;
//!
//! struct ReqwestTransport {
//!     client: reqwest::Client,
//! }
//!
//! impl Transport for ReqwestTransport {
//!     fn execute(&self, request: RequestDescriptor) -> impl Future<Output = Result<Vec<u8>>> + Send {
//!         let client = self.client.clone();
//!         async move {
//!             let response = client.get(&request.path).send().await
//!                 .map_err(|e| Error::Transport(e.to_string().into()))?;
//!             // map non-2xx to Error::Transport(json!({"code": status}))
//!             Ok(response.bytes().await.map_err(|e| Error::Transport(e.to_string().into()))?.to_vec())
//!         }
//!     }
//! }
//! ```
//!
//! Closures work too, through [`FnTransport`]. For tests, use
//! [`InMemoryTransport`].

use crate::endpoint::RequestDescriptor;
use crate::error::{Error, Result};
use dashmap::DashMap;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Trait for transport adapter implementations.
///
/// Returns the raw response body. Failures should be reported as
/// `Error::Transport` with whatever detail the adapter has (status code,
/// error body, ...); that value is what observers see in `snapshot.error`.
///
/// Calls for different keys run concurrently and may complete in any order.
pub trait Transport: Send + Sync + 'static {
    fn execute(&self, request: RequestDescriptor) -> impl Future<Output = Result<Vec<u8>>> + Send;
}

impl<T: Transport> Transport for Arc<T> {
    fn execute(&self, request: RequestDescriptor) -> impl Future<Output = Result<Vec<u8>>> + Send {
        T::execute(self, request)
    }
}

/// Adapter turning an async function into a [`Transport`].
///
/// ```
/// use query_kit::transport::FnTransport;
///
/// let transport = FnTransport::new(|request: query_kit::RequestDescriptor| async move {
///     Ok::<_, query_kit::Error>(format!("{{\"path\":\"{}\"}}", request.path).into_bytes())
/// });
/// # let _ = transport;
/// ```
pub struct FnTransport<F> {
    execute: F,
}

impl<F> FnTransport<F> {
    pub fn new<Fut>(execute: F) -> Self
    where
        F: Fn(RequestDescriptor) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<u8>>> + Send + 'static,
    {
        FnTransport { execute }
    }
}

impl<F, Fut> Transport for FnTransport<F>
where
    F: Fn(RequestDescriptor) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<u8>>> + Send + 'static,
{
    fn execute(&self, request: RequestDescriptor) -> impl Future<Output = Result<Vec<u8>>> + Send {
        (self.execute)(request)
    }
}

// ============================================================================
// In-Memory Test Transport
// ============================================================================

/// Canned response for [`InMemoryTransport`].
#[derive(Clone, Debug)]
enum CannedResponse {
    Body(Vec<u8>),
    Failure(Value),
}

/// Transport serving canned responses by request path.
///
/// Records every request it receives, which makes it the natural test double
/// for deduplication and cache-hit assertions.
///
/// - **Unknown paths** fail with `Error::Transport({"status": 404, "path": ..})`
/// - **Latency** can be simulated with `with_latency`
/// - **Clones** share responses and call records
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    responses: Arc<DashMap<String, CannedResponse>>,
    requests: Arc<Mutex<Vec<RequestDescriptor>>>,
    calls: Arc<AtomicUsize>,
    latency: Option<Duration>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every response by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Answer `path` with a JSON body.
    pub fn respond_json(&self, path: impl Into<String>, body: Value) {
        self.responses
            .insert(path.into(), CannedResponse::Body(body.to_string().into_bytes()));
    }

    /// Answer `path` with a raw body (useful for decode failures).
    pub fn respond_raw(&self, path: impl Into<String>, body: impl Into<Vec<u8>>) {
        self.responses
            .insert(path.into(), CannedResponse::Body(body.into()));
    }

    /// Fail `path` with `Error::Transport(detail)`.
    pub fn fail(&self, path: impl Into<String>, detail: Value) {
        self.responses
            .insert(path.into(), CannedResponse::Failure(detail));
    }

    /// Number of `execute` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of calls for one path.
    pub fn calls_for(&self, path: &str) -> usize {
        self.requests()
            .iter()
            .filter(|request| request.path == path)
            .count()
    }

    /// Every request received, in call order.
    pub fn requests(&self) -> Vec<RequestDescriptor> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    fn respond(&self, request: &RequestDescriptor) -> Result<Vec<u8>> {
        match self.responses.get(&request.path).map(|r| r.value().clone()) {
            Some(CannedResponse::Body(body)) => Ok(body),
            Some(CannedResponse::Failure(detail)) => Err(Error::Transport(detail)),
            None => Err(Error::Transport(
                json!({"status": 404, "path": request.path}),
            )),
        }
    }
}

impl Transport for InMemoryTransport {
    fn execute(&self, request: RequestDescriptor) -> impl Future<Output = Result<Vec<u8>>> + Send {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        debug!("✓ InMemory transport {}", request);

        let response = self.respond(&request);
        let latency = self.latency;
        async move {
            if let Some(delay) = latency {
                tokio::time::sleep(delay).await;
            }
            response
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_transport_serves_json() {
        let transport = InMemoryTransport::new();
        transport.respond_json("products", json!({"products": [1, 2]}));

        let body = transport
            .execute(RequestDescriptor::get("products"))
            .await
            .expect("Failed to execute");
        let value: Value = serde_json::from_slice(&body).expect("Failed to parse");
        assert_eq!(value, json!({"products": [1, 2]}));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_in_memory_transport_failure() {
        let transport = InMemoryTransport::new();
        transport.fail("products", json!({"code": 500}));

        let err = transport
            .execute(RequestDescriptor::get("products"))
            .await
            .unwrap_err();
        assert_eq!(err, Error::Transport(json!({"code": 500})));
    }

    #[tokio::test]
    async fn test_in_memory_transport_unknown_path() {
        let transport = InMemoryTransport::new();
        let err = transport
            .execute(RequestDescriptor::get("missing"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            Error::Transport(json!({"status": 404, "path": "missing"}))
        );
    }

    #[tokio::test]
    async fn test_in_memory_transport_records_requests() {
        let transport = InMemoryTransport::new();
        transport.respond_json("a", json!(1));

        let clone = transport.clone();
        let _ = clone.execute(RequestDescriptor::get("a")).await;
        let _ = clone.execute(RequestDescriptor::get("b")).await;

        assert_eq!(transport.calls(), 2, "clones share call records");
        assert_eq!(transport.calls_for("a"), 1);
        assert_eq!(transport.requests()[1].path, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_memory_transport_latency() {
        let transport = InMemoryTransport::new().with_latency(Duration::from_millis(100));
        transport.respond_json("a", json!(1));

        let started = tokio::time::Instant::now();
        transport
            .execute(RequestDescriptor::get("a"))
            .await
            .expect("Failed to execute");
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_fn_transport() {
        let transport = FnTransport::new(|request: RequestDescriptor| async move {
            Ok::<_, Error>(json!({"echo": request.path}).to_string().into_bytes())
        });

        let body = transport
            .execute(RequestDescriptor::get("ping"))
            .await
            .expect("Failed to execute");
        let value: Value = serde_json::from_slice(&body).expect("Failed to parse");
        assert_eq!(value, json!({"echo": "ping"}));
    }
}
