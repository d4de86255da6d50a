//! In-memory collaborators for tests.
//!
//! Not gated behind `cfg(test)` so downstream crates can reuse the same
//! mocks in their own suites.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::filter::FilterExpr;
use crate::store::{DocumentStore, StoreError};

/// In-memory document store: collections of JSON documents, filtered by the
/// same native-syntax trees the engine emits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, Vec<Value>>>,
}

impl MemoryStore {
    /// Insert a document into a collection, creating it if needed.
    pub fn insert(&self, collection: &str, doc: Value) {
        let mut guard = self.collections.lock().unwrap_or_else(|e| e.into_inner());
        guard.entry(collection.to_owned()).or_default().push(doc);
    }

    /// Replace a collection's contents wholesale.
    pub fn set(&self, collection: &str, docs: Vec<Value>) {
        let mut guard = self.collections.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(collection.to_owned(), docs);
    }

    fn matching(&self, collection: &str, filter: &Value) -> Result<Vec<Value>, StoreError> {
        let expr = FilterExpr::parse(filter)
            .map_err(|e| StoreError::InvalidQuery(e.to_string()))?;
        let guard = self.collections.lock().unwrap_or_else(|e| e.into_inner());
        Ok(guard
            .get(collection)
            .map(|docs| docs.iter().filter(|d| expr.matches(d)).cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn find(&self, collection: &str, filter: &Value) -> Result<Vec<Value>, StoreError> {
        self.matching(collection, filter)
    }

    async fn count(&self, collection: &str, filter: &Value) -> Result<u64, StoreError> {
        Ok(self.matching(collection, filter)?.len() as u64)
    }
}
