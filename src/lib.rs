//! # query-kit
//!
//! Declarative, key-based remote data fetching with a shared cache.
//!
//! ## Features
//!
//! - **Declarative Endpoints:** Describe each remote call once; components only name it
//! - **Deduplication:** Concurrent subscribers of the same key share one request
//! - **Ordered Results:** Responses for superseded requests are discarded
//! - **Reference-Counted Retention:** Unused entries are collected after a delay
//! - **Transport Agnostic:** Bring any HTTP or RPC client through [`Transport`]
//! - **Production Ready:** Built-in logging, metrics hooks, and error handling
//!
//! ## Quick Start
//!
//! ```ignore
//! use query_kit::{
//!     EndpointDefinition, EndpointRegistry, QueryClient, RequestDescriptor,
//!     transport::InMemoryTransport,
//! };
//! use serde_json::json;
//!
//! // 1. Describe the endpoints
//! let registry = EndpointRegistry::builder("productsApi")
//!     .base_url("https://dummyjson.com/")
//!     .endpoint(EndpointDefinition::query("getAllProducts", |_: ()| {
//!         RequestDescriptor::get("products")
//!     }))
//!     .endpoint(EndpointDefinition::query("getProduct", |product: String| {
//!         RequestDescriptor::get(format!("products/search?q={}", product))
//!     }))
//!     .build()?;
//!
//! // 2. Plug in a transport
//! let transport = InMemoryTransport::new();
//! transport.respond_json("https://dummyjson.com/products", json!({"products": []}));
//!
//! // 3. Create the client (Clone is cheap - just Arc increment)
//! let client = QueryClient::new(registry, transport)?;
//!
//! // 4. Subscribe; the callback sees Idle, Loading, then Success
//! let handle = client.subscribe("getAllProducts", &(), |snapshot| {
//!     println!("{}: {:?}", snapshot.status, snapshot.data);
//! })?;
//!
//! // 5. Dropping the handle unsubscribes; the entry stays cached for 60s
//! drop(handle);
//! ```
//!
//! ### Awaiting a Result
//!
//! ```ignore
//! let snapshot = client.fetch("getProduct", "iphone").await?;
//! assert!(snapshot.is_success());
//! ```

#[macro_use]
extern crate log;

pub mod client;
pub mod coordinator;
pub mod endpoint;
pub mod error;
pub mod key;
pub mod observability;
pub mod store;
pub mod strategy;
pub mod subscription;
pub mod transport;

// Re-exports for convenience
pub use client::{QueryClient, QueryClientBuilder, QueryWatch};
pub use endpoint::{EndpointDefinition, EndpointRegistry, Method, RequestDescriptor};
pub use error::{Error, Result};
pub use key::{CacheKey, CacheKeyBuilder};
pub use observability::{QueryMetrics, RetentionPolicy};
pub use store::{QuerySnapshot, QueryStatus, StoreStats};
pub use strategy::FetchPolicy;
pub use subscription::ObserverHandle;
pub use transport::{FnTransport, InMemoryTransport, Transport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
