//! Fetch policies applied when an observer subscribes.
//!
//! # The Three Policies
//!
//! ```
//! use query_kit::strategy::FetchPolicy;
//!
//! // 1. CacheFirst - fetch only if nothing fresh is cached (default)
//! let _p = FetchPolicy::CacheFirst;
//!
//! // 2. CacheOnly - observe the entry, never fetch
//! let _p = FetchPolicy::CacheOnly;
//!
//! // 3. Refetch - treat cached data as stale and fetch again
//! let _p = FetchPolicy::Refetch;
//! ```
//!
//! | Policy | Fresh entry | Missing / stale entry | In-flight request |
//! |--------|-------------|-----------------------|-------------------|
//! | **CacheFirst** | Serve it | Fetch | Join |
//! | **CacheOnly** | Serve it | Stay as is | Join (observe) |
//! | **Refetch** | Fetch | Fetch | Join |

/// Policy deciding whether a subscription triggers a fetch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FetchPolicy {
    /// Serve fresh cached data; fetch when the entry is new or invalidated.
    ///
    /// A fetch is started by the first subscriber of an entry, or by any
    /// subscriber of an entry that was invalidated.
    #[default]
    CacheFirst,

    /// Observe only. Useful while the arguments are not known yet.
    CacheOnly,

    /// Mark the entry stale and fetch, unless a request is already in flight.
    Refetch,
}

impl std::fmt::Display for FetchPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchPolicy::CacheFirst => write!(f, "CacheFirst"),
            FetchPolicy::CacheOnly => write!(f, "CacheOnly"),
            FetchPolicy::Refetch => write!(f, "Refetch"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_display() {
        assert_eq!(FetchPolicy::CacheFirst.to_string(), "CacheFirst");
        assert_eq!(FetchPolicy::CacheOnly.to_string(), "CacheOnly");
        assert_eq!(FetchPolicy::Refetch.to_string(), "Refetch");
    }

    #[test]
    fn test_policy_default() {
        assert_eq!(FetchPolicy::default(), FetchPolicy::CacheFirst);
    }
}
