//! Tag-scoped profiling context.
//!
//! Call sites annotate in-flight samples with key/value tags. Tags are attached to an
//! *execution context* (a thread, or a logical task) and the sampler reads the tags of
//! the context it just sampled.
//!
//! # Components
//!
//! - [`context`]: execution context identifiers and the pluggable providers that
//!   resolve "the current context"
//! - [`store`]: the concurrent [`TagStore`] mapping contexts to tag multisets, plus the
//!   process-wide global tags
//! - [`scope`]: [`TagScope`] guards that add tags on entry and always remove them on
//!   exit, including on panics and dropped futures
//! - [`legacy`]: the `key=value,key=value` wire format used by older host bindings, and
//!   the structured JSON encoding that replaces it
//!
//! # Example
//!
//! ```
//! use pyroscope_agent_native::tags::{
//!     context::ThreadContextProvider, scope::with_tags, ContextProvider, TagStore,
//! };
//!
//! let store = TagStore::new();
//! let provider = ThreadContextProvider;
//!
//! let answer = with_tags(&store, &provider, [("endpoint", "/checkout")], || {
//!     // samples captured here carry endpoint=/checkout
//!     42
//! })
//! .unwrap();
//!
//! assert_eq!(answer, 42);
//! assert!(store.snapshot(provider.current_id()).is_empty());
//! ```

pub mod context;
pub mod legacy;
pub mod scope;
pub mod store;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use context::{ContextProvider, ExecutionContextId};
pub use scope::TagScope;
pub use store::TagStore;

/// A single key/value annotation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Tag {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Rejects tags the sampler cannot attribute (an empty key).
    pub fn validate(&self) -> Result<(), TagError> {
        if self.key.trim().is_empty() {
            return Err(TagError::EmptyKey {
                value: self.value.clone(),
            });
        }
        Ok(())
    }
}

impl<K: Into<String>, V: Into<String>> From<(K, V)> for Tag {
    fn from((key, value): (K, V)) -> Self {
        Tag::new(key, value)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

#[derive(Debug, Error)]
pub enum TagError {
    #[error("tag key must not be empty (value '{value}')")]
    EmptyKey { value: String },

    #[error("tag '{key}' cannot be encoded in the legacy format: '{character}' is a delimiter")]
    Delimiter { key: String, character: char },

    #[error("tag '{key}' cannot be encoded in the legacy format: surrounding whitespace is lost when parsed")]
    Whitespace { key: String },

    #[error("invalid tag JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_display() {
        assert_eq!(Tag::new("env", "prod").to_string(), "env=prod");
    }

    #[test]
    fn test_tag_from_tuple() {
        let tag: Tag = ("region", String::from("us-east")).into();
        assert_eq!(tag, Tag::new("region", "us-east"));
    }

    #[test]
    fn test_validate_rejects_empty_key() {
        assert!(Tag::new("", "x").validate().is_err());
        assert!(Tag::new("  ", "x").validate().is_err());
        assert!(Tag::new("k", "").validate().is_ok());
    }
}
