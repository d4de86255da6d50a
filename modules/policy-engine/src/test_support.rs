//! In-memory doubles for the engine's ports.
//!
//! Not gated behind `cfg(test)` so downstream crates can drive the engine in
//! their own suites.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::bus::{BusError, BusSubscription, EventBus};
use crate::cache::{PolicySource, SchemaDef, SchemaSource};
use policy_core::store::StoreError;

/// In-process bus: publishes fan out to local subscribers and are recorded
/// for assertions.
#[derive(Default)]
pub struct LoopbackBus {
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Value>>>>,
    published: Mutex<Vec<(String, Value)>>,
}

impl LoopbackBus {
    /// Everything published so far, in order.
    #[must_use]
    pub fn published(&self) -> Vec<(String, Value)> {
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl EventBus for LoopbackBus {
    async fn publish(&self, channel: &str, payload: Value) -> Result<(), BusError> {
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((channel.to_owned(), payload.clone()));

        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(senders) = subscribers.get_mut(channel) {
            senders.retain(|tx| tx.send(payload.clone()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BusSubscription, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(channel.to_owned())
            .or_default()
            .push(tx);
        Ok(BusSubscription::new(rx))
    }
}

/// Serves a fixed set of policy documents and counts loads.
pub struct StaticPolicySource {
    docs: Vec<Value>,
    loads: AtomicUsize,
}

impl StaticPolicySource {
    #[must_use]
    pub fn new(docs: Vec<Value>) -> Self {
        Self {
            docs,
            loads: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PolicySource for StaticPolicySource {
    async fn load_policies(&self, _app_id: Uuid) -> Result<Vec<Value>, StoreError> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        Ok(self.docs.clone())
    }
}

/// Serves a fixed set of schema definitions.
pub struct StaticSchemaSource {
    defs: Vec<SchemaDef>,
}

impl StaticSchemaSource {
    #[must_use]
    pub fn new(defs: Vec<SchemaDef>) -> Self {
        Self { defs }
    }
}

#[async_trait]
impl SchemaSource for StaticSchemaSource {
    async fn load_schemas(&self, _app_id: Uuid) -> Result<Vec<SchemaDef>, StoreError> {
        Ok(self.defs.clone())
    }
}
