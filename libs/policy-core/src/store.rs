//! Document store port.
//!
//! The storage engine itself is an external collaborator; the decision core
//! only needs scoped reads: `find` for env lookups and `count` for
//! store-backed condition leaves. Collections are addressed by schema name
//! (or `<appShortId>-<schema>` for application schemas — the naming is owned
//! by the caller).

use async_trait::async_trait;
use serde_json::Value;

/// Error from the document store driver.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The named collection does not exist.
    #[error("unknown collection '{0}'")]
    UnknownCollection(String),

    /// The driver rejected the filter.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Any other driver failure.
    #[error("store failure: {0}")]
    Other(String),
}

/// Read-only document store access used during policy evaluation.
///
/// Filters are in the store's native (`$`-prefixed) syntax. Implementations
/// must not mutate anything on behalf of the decision engine.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Find documents in `collection` matching `filter`.
    async fn find(&self, collection: &str, filter: &Value) -> Result<Vec<Value>, StoreError>;

    /// Count documents in `collection` matching `filter`.
    async fn count(&self, collection: &str, filter: &Value) -> Result<u64, StoreError>;
}
