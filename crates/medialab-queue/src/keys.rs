//! Queue key builders
//!
//! All keys for one queue share the `{prefix}:queue:{name}` stem.
//!
//! # Key Patterns
//!
//! - `{stem}:ready` - list of job ids ready for delivery, popped from the right
//! - `{stem}:delayed` - sorted set of job ids scored by due time (ms)
//! - `{stem}:leases` - sorted set of leased job ids scored by lease expiry (ms)
//! - `{stem}:jobs` - hash of job id to descriptor JSON
//! - `{stem}:attempts` - hash of job id to delivery count
//! - `{stem}:tokens` - hash of job id to the current lease token
//!
//! # Example
//!
//! ```
//! use medialab_queue::keys::QueueKeys;
//!
//! let keys = QueueKeys::new("medialab", "generation");
//! assert_eq!(keys.ready, "medialab:queue:generation:ready");
//! ```

/// Fully built key names for one queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    pub ready: String,
    pub delayed: String,
    pub leases: String,
    pub jobs: String,
    pub attempts: String,
    pub tokens: String,
}

impl QueueKeys {
    pub fn new(prefix: &str, name: &str) -> Self {
        let stem = format!("{}:queue:{}", prefix, name);
        Self {
            ready: format!("{}:ready", stem),
            delayed: format!("{}:delayed", stem),
            leases: format!("{}:leases", stem),
            jobs: format!("{}:jobs", stem),
            attempts: format!("{}:attempts", stem),
            tokens: format!("{}:tokens", stem),
        }
    }
}
