//! Cache key management utilities.

use crate::error::{Error, Result};
use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// Placeholder written for calls without arguments.
pub const NO_ARGS_SENTINEL: &str = "undefined";

/// Deterministic identifier of one `(endpoint, arguments)` call.
///
/// Format: `"{endpoint}({canonical args})"`, e.g. `getProduct("iphone")` or
/// `getAllProducts(undefined)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Endpoint portion of the key.
    pub fn endpoint(&self) -> &str {
        CacheKeyBuilder::parse(&self.0)
            .map(|(endpoint, _)| endpoint)
            .unwrap_or(&self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Builder for cache keys.
pub struct CacheKeyBuilder;

impl CacheKeyBuilder {
    /// Build the key for an endpoint call with serializable arguments.
    ///
    /// `()` and `None` both mean "no arguments".
    ///
    /// # Errors
    /// Returns `Error::InvalidArguments` if `args` cannot be serialized.
    pub fn build<A: Serialize + ?Sized>(endpoint: &str, args: &A) -> Result<CacheKey> {
        let value = Self::args_value(args)?;
        Ok(Self::build_from_value(endpoint, &value))
    }

    /// Build the key from already serialized arguments.
    pub fn build_from_value(endpoint: &str, args: &Value) -> CacheKey {
        CacheKey(format!("{}({})", endpoint, Self::canonicalize(args)))
    }

    /// Serialize call arguments into the JSON form stored with each entry.
    ///
    /// # Errors
    /// Returns `Error::InvalidArguments` if `args` cannot be serialized.
    pub fn args_value<A: Serialize + ?Sized>(args: &A) -> Result<Value> {
        serde_json::to_value(args).map_err(|e| Error::InvalidArguments(e.to_string()))
    }

    /// Canonical text form of call arguments.
    ///
    /// Object keys are sorted at every level, so two argument maps that differ
    /// only in insertion order produce the same text. A top-level `null`
    /// becomes [`NO_ARGS_SENTINEL`].
    pub fn canonicalize(args: &Value) -> String {
        if args.is_null() {
            return NO_ARGS_SENTINEL.to_string();
        }
        let mut out = String::new();
        write_canonical(args, &mut out);
        out
    }

    /// Split a key into its endpoint and canonical argument text.
    pub fn parse(key: &str) -> Option<(&str, &str)> {
        let open = key.find('(')?;
        let inner = key[open + 1..].strip_suffix(')')?;
        Some((&key[..open], inner))
    }
}

// Sorted explicitly so the output does not depend on serde_json's
// `preserve_order` feature being off.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut fields: Vec<(&String, &Value)> = map.iter().collect();
            fields.sort_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (i, (name, field)) in fields.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(name.clone()).to_string());
                out.push(':');
                write_canonical(field, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cache_key_no_args() {
        let key = CacheKeyBuilder::build("getAllProducts", &()).unwrap();
        assert_eq!(key.as_str(), "getAllProducts(undefined)");

        let none: Option<String> = None;
        let key_none = CacheKeyBuilder::build("getAllProducts", &none).unwrap();
        assert_eq!(key, key_none);
    }

    #[test]
    fn test_cache_key_string_arg() {
        let key = CacheKeyBuilder::build("getProduct", "iphone").unwrap();
        assert_eq!(key.to_string(), "getProduct(\"iphone\")");
    }

    #[test]
    fn test_cache_key_sorts_object_fields() {
        let a = json!({"q": "phone", "limit": 10, "filter": {"z": 1, "a": 2}});
        let b = json!({"filter": {"a": 2, "z": 1}, "limit": 10, "q": "phone"});

        let key_a = CacheKeyBuilder::build_from_value("search", &a);
        let key_b = CacheKeyBuilder::build_from_value("search", &b);

        assert_eq!(key_a, key_b);
        assert_eq!(
            key_a.as_str(),
            "search({\"filter\":{\"a\":2,\"z\":1},\"limit\":10,\"q\":\"phone\"})"
        );
    }

    #[test]
    fn test_cache_key_array_order_matters() {
        let a = CacheKeyBuilder::build("batch", &[1, 2]).unwrap();
        let b = CacheKeyBuilder::build("batch", &[2, 1]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_cache_key_endpoint_namespacing() {
        let a = CacheKeyBuilder::build("getProduct", "1").unwrap();
        let b = CacheKeyBuilder::build("getReview", "1").unwrap();
        assert_ne!(a, b);
        assert_eq!(a.endpoint(), "getProduct");
    }

    #[test]
    fn test_cache_key_nested_null_is_not_sentinel() {
        let key = CacheKeyBuilder::build_from_value("f", &json!([null]));
        assert_eq!(key.as_str(), "f([null])");
    }

    #[test]
    fn test_cache_key_escapes_field_names() {
        let key = CacheKeyBuilder::build_from_value("f", &json!({"a\"b": 1}));
        assert_eq!(key.as_str(), "f({\"a\\\"b\":1})");
    }

    #[test]
    fn test_cache_key_parser() {
        let key = CacheKeyBuilder::build("getProduct", "iphone").unwrap();
        let (endpoint, args) = CacheKeyBuilder::parse(key.as_str()).unwrap();
        assert_eq!(endpoint, "getProduct");
        assert_eq!(args, "\"iphone\"");

        assert!(CacheKeyBuilder::parse("no-parens").is_none());
    }
}
