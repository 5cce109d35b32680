//! Endpoint declarations and the registry that holds them.
//!
//! An endpoint turns call arguments into a [`RequestDescriptor`]; the registry
//! maps endpoint names to their definitions. Both are immutable once built and
//! are shared by every component of a [`QueryClient`](crate::QueryClient).
//!
//! ```
//! use query_kit::endpoint::{EndpointDefinition, EndpointRegistry, RequestDescriptor};
//!
//! let registry = EndpointRegistry::builder("productsApi")
//!     .base_url("https://dummyjson.com/")
//!     .endpoint(EndpointDefinition::query("getAllProducts", |_: ()| {
//!         RequestDescriptor::get("products")
//!     }))
//!     .endpoint(EndpointDefinition::query("getProduct", |product: String| {
//!         RequestDescriptor::get(format!("products/search?q={}", product))
//!     }))
//!     .build()
//!     .expect("unique endpoint names");
//!
//! assert!(registry.contains("getProduct"));
//! ```

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Request method carried by a descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
            Method::Put => write!(f, "PUT"),
            Method::Patch => write!(f, "PATCH"),
            Method::Delete => write!(f, "DELETE"),
        }
    }
}

/// Transport-agnostic description of one remote call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    pub path: String,
    pub method: Method,
    pub body: Option<Value>,
}

impl RequestDescriptor {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        RequestDescriptor {
            path: path.into(),
            method,
            body: None,
        }
    }

    /// Shorthand for a GET without body.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

impl fmt::Display for RequestDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

/// Type alias for the request builder function.
type BuildRequestFn = dyn Fn(&Value) -> Result<RequestDescriptor> + Send + Sync;

/// Type alias for the response transform function.
type TransformResponseFn = dyn Fn(Value) -> Result<Value> + Send + Sync;

/// Immutable definition of one remote-data endpoint.
pub struct EndpointDefinition {
    name: String,
    build_request: Box<BuildRequestFn>,
    transform_response: Option<Box<TransformResponseFn>>,
    keep_unused_data_for: Option<Duration>,
}

impl EndpointDefinition {
    /// Define an endpoint from a raw argument mapper.
    ///
    /// The mapper receives the call arguments as JSON (`null` when the call
    /// has none).
    pub fn new<F>(name: impl Into<String>, build_request: F) -> Self
    where
        F: Fn(&Value) -> Result<RequestDescriptor> + Send + Sync + 'static,
    {
        EndpointDefinition {
            name: name.into(),
            build_request: Box::new(build_request),
            transform_response: None,
            keep_unused_data_for: None,
        }
    }

    /// Define an endpoint whose arguments deserialize into `A`.
    ///
    /// Arguments that do not fit `A` surface as `Error::InvalidArguments`
    /// when the request is built.
    pub fn query<A, F>(name: impl Into<String>, build_request: F) -> Self
    where
        A: DeserializeOwned,
        F: Fn(A) -> RequestDescriptor + Send + Sync + 'static,
    {
        let name = name.into();
        let endpoint = name.clone();
        Self::new(name, move |args: &Value| {
            let typed = A::deserialize(args).map_err(|e| {
                Error::InvalidArguments(format!("{}: {}", endpoint, e))
            })?;
            Ok(build_request(typed))
        })
    }

    /// Post-process decoded payloads before they are cached.
    pub fn with_transform_response<F>(mut self, transform: F) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.transform_response = Some(Box::new(transform));
        self
    }

    /// Override how long unused entries of this endpoint are kept.
    ///
    /// Takes precedence over the client's `RetentionPolicy`.
    pub fn keep_unused_data_for(mut self, delay: Duration) -> Self {
        self.keep_unused_data_for = Some(delay);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn retention_override(&self) -> Option<Duration> {
        self.keep_unused_data_for
    }

    /// Build the request descriptor for the given arguments.
    ///
    /// # Errors
    /// Propagates whatever the endpoint's mapper returns.
    pub fn build_request(&self, args: &Value) -> Result<RequestDescriptor> {
        (self.build_request)(args)
    }

    /// Decode a raw response body into the cached payload.
    ///
    /// An empty body decodes to `null`.
    ///
    /// # Errors
    /// Returns `Error::Decode` if the body is not JSON or the transform fails.
    pub fn decode(&self, body: &[u8]) -> Result<Value> {
        let value = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(body).map_err(|e| Error::Decode(e.to_string()))?
        };

        match &self.transform_response {
            Some(transform) => transform(value).map_err(|e| match e {
                Error::Decode(msg) => Error::Decode(msg),
                other => Error::Decode(other.to_string()),
            }),
            None => Ok(value),
        }
    }
}

impl fmt::Debug for EndpointDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointDefinition")
            .field("name", &self.name)
            .field("transform_response", &self.transform_response.is_some())
            .field("keep_unused_data_for", &self.keep_unused_data_for)
            .finish()
    }
}

/// Registry mapping endpoint names to their definitions.
#[derive(Debug)]
pub struct EndpointRegistry {
    name: String,
    base_url: Option<String>,
    endpoints: HashMap<String, Arc<EndpointDefinition>>,
}

impl EndpointRegistry {
    pub fn builder(name: impl Into<String>) -> EndpointRegistryBuilder {
        EndpointRegistryBuilder {
            name: name.into(),
            base_url: None,
            endpoints: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_url(&self) -> Option<&str> {
        self.base_url.as_deref()
    }

    /// Look up an endpoint definition.
    ///
    /// # Errors
    /// Returns `Error::UnknownEndpoint` if no endpoint has this name.
    pub fn get(&self, name: &str) -> Result<Arc<EndpointDefinition>> {
        self.endpoints
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownEndpoint(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.endpoints.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.endpoints.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Build the request for a call, resolving the path against the base URL.
    ///
    /// # Errors
    /// Returns `Error::UnknownEndpoint` or whatever the endpoint's mapper returns.
    pub fn request_for(&self, endpoint: &str, args: &Value) -> Result<RequestDescriptor> {
        let mut request = self.get(endpoint)?.build_request(args)?;
        if let Some(base) = &self.base_url {
            request.path = join_url(base, &request.path);
        }
        Ok(request)
    }
}

/// Builder for [`EndpointRegistry`].
pub struct EndpointRegistryBuilder {
    name: String,
    base_url: Option<String>,
    endpoints: Vec<EndpointDefinition>,
}

impl EndpointRegistryBuilder {
    /// Prefix for every relative request path.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn endpoint(mut self, definition: EndpointDefinition) -> Self {
        self.endpoints.push(definition);
        self
    }

    /// Freeze the registry.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` if two endpoints share a name.
    pub fn build(self) -> Result<EndpointRegistry> {
        let mut endpoints = HashMap::with_capacity(self.endpoints.len());
        for definition in self.endpoints {
            let name = definition.name().to_string();
            if endpoints.insert(name.clone(), Arc::new(definition)).is_some() {
                return Err(Error::ConfigError(format!(
                    "endpoint '{}' registered twice in '{}'",
                    name, self.name
                )));
            }
        }

        debug!(
            "✓ Registry {} built with {} endpoints",
            self.name,
            endpoints.len()
        );

        Ok(EndpointRegistry {
            name: self.name,
            base_url: self.base_url,
            endpoints,
        })
    }
}

/// Join a base URL and a path with exactly one `/` between them.
///
/// Absolute URLs are returned unchanged.
pub fn join_url(base: &str, path: &str) -> String {
    if path.contains("://") || base.is_empty() {
        return path.to_string();
    }
    if path.is_empty() {
        return base.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn products_registry() -> EndpointRegistry {
        EndpointRegistry::builder("productsApi")
            .base_url("https://dummyjson.com/")
            .endpoint(EndpointDefinition::query("getAllProducts", |_: ()| {
                RequestDescriptor::get("products")
            }))
            .endpoint(EndpointDefinition::query("getProduct", |product: String| {
                RequestDescriptor::get(format!("products/search?q={}", product))
            }))
            .build()
            .expect("Failed to build registry")
    }

    #[test]
    fn test_request_for_joins_base_url() {
        let registry = products_registry();

        let all = registry
            .request_for("getAllProducts", &Value::Null)
            .expect("Failed to build request");
        assert_eq!(all.path, "https://dummyjson.com/products");
        assert_eq!(all.method, Method::Get);

        let one = registry
            .request_for("getProduct", &json!("iphone"))
            .expect("Failed to build request");
        assert_eq!(one.path, "https://dummyjson.com/products/search?q=iphone");
    }

    #[test]
    fn test_unknown_endpoint() {
        let registry = products_registry();
        let err = registry.get("getReviews").unwrap_err();
        assert_eq!(err, Error::UnknownEndpoint("getReviews".to_string()));
    }

    #[test]
    fn test_typed_endpoint_rejects_wrong_args() {
        let registry = products_registry();
        let err = registry
            .request_for("getProduct", &json!({"id": 1}))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArguments(_)));
    }

    #[test]
    fn test_duplicate_endpoint_is_config_error() {
        let result = EndpointRegistry::builder("api")
            .endpoint(EndpointDefinition::query("a", |_: ()| RequestDescriptor::get("a")))
            .endpoint(EndpointDefinition::query("a", |_: ()| RequestDescriptor::get("b")))
            .build();
        assert!(matches!(result, Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("https://x.io/", "/a"), "https://x.io/a");
        assert_eq!(join_url("https://x.io", "a"), "https://x.io/a");
        assert_eq!(join_url("https://x.io", ""), "https://x.io");
        assert_eq!(join_url("https://x.io", "https://y.io/b"), "https://y.io/b");
    }

    #[test]
    fn test_decode_and_transform() {
        let endpoint = EndpointDefinition::query("getProduct", |p: String| {
            RequestDescriptor::get(format!("products/search?q={}", p))
        })
        .with_transform_response(|payload| {
            payload
                .get("products")
                .cloned()
                .ok_or_else(|| Error::Decode("missing products".to_string()))
        });

        let decoded = endpoint
            .decode(br#"{"products":[{"id":1}]}"#)
            .expect("Failed to decode");
        assert_eq!(decoded, json!([{"id": 1}]));

        let err = endpoint.decode(br#"{"total":0}"#).unwrap_err();
        assert_eq!(err, Error::Decode("missing products".to_string()));

        let err = endpoint.decode(b"<html>").unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn test_decode_empty_body_is_null() {
        let endpoint = EndpointDefinition::query("ping", |_: ()| RequestDescriptor::get("ping"));
        assert_eq!(endpoint.decode(b"").expect("Failed to decode"), Value::Null);
    }

    #[test]
    fn test_request_descriptor_display() {
        let request = RequestDescriptor::new(Method::Post, "products/add").with_body(json!({}));
        assert_eq!(request.to_string(), "POST products/add");
        assert!(request.body.is_some());
    }
}
