//! Revisioned per-app policy and schema caches.
//!
//! Both caches hold whole snapshots behind `ArcSwap`: readers see a
//! stale-but-consistent snapshot, never a partially updated one. Invalidation
//! drops the snapshot and bumps a revision counter; the next reader triggers
//! a full re-fetch from the source. Invalidation signals arrive out-of-band
//! on the bus.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use dashmap::DashMap;
use policy_core::policy::Policy;
use policy_core::store::StoreError;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bus::{CHANNEL_POLICY_CHANGED, CHANNEL_SCHEMA_CHANGED, EventBus};

/// Loads policy documents for an app from persistent storage.
#[async_trait]
pub trait PolicySource: Send + Sync {
    async fn load_policies(&self, app_id: Uuid) -> Result<Vec<Value>, StoreError>;
}

/// Loads schema definitions for an app from persistent storage.
#[async_trait]
pub trait SchemaSource: Send + Sync {
    async fn load_schemas(&self, app_id: Uuid) -> Result<Vec<SchemaDef>, StoreError>;
}

/// One field of a schema.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FieldDef {
    pub name: String,
    /// Value a create-verb projection reset falls back to.
    #[serde(default)]
    pub default: Option<Value>,
}

/// One schema of an app.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SchemaDef {
    pub name: String,
    /// Platform core schema (as opposed to application-defined).
    #[serde(default)]
    pub core: bool,
    #[serde(default)]
    pub fields: Vec<FieldDef>,
}

impl SchemaDef {
    /// All field names, for deny-list projection computation.
    #[must_use]
    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    /// Declared defaults keyed by field name.
    #[must_use]
    pub fn defaults(&self) -> Map<String, Value> {
        let mut out = Map::new();
        for field in &self.fields {
            if let Some(default) = &field.default {
                out.insert(field.name.clone(), default.clone());
            }
        }
        out
    }
}

/// One app's schemas, indexed by name.
#[derive(Debug, Default)]
pub struct AppSchemas {
    by_name: HashMap<String, SchemaDef>,
}

impl AppSchemas {
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&SchemaDef> {
        self.by_name.get(name)
    }

    #[must_use]
    pub fn is_core(&self, name: &str) -> bool {
        self.by_name.get(name).is_some_and(|s| s.core)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(String::as_str)
    }
}

struct AppEntry<T> {
    snapshot: ArcSwapOption<T>,
    revision: AtomicU64,
}

impl<T> Default for AppEntry<T> {
    fn default() -> Self {
        Self {
            snapshot: ArcSwapOption::empty(),
            revision: AtomicU64::new(0),
        }
    }
}

impl<T> AppEntry<T> {
    fn invalidate(&self) {
        self.snapshot.store(None);
        self.revision.fetch_add(1, Ordering::Release);
    }

    /// Install the snapshot unless an invalidation raced the load that
    /// produced it. Returns `false` when the caller must reload.
    fn install_if_unchanged(&self, seen: u64, snapshot: Arc<T>) -> bool {
        if self
            .revision
            .compare_exchange(seen, seen + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.snapshot.store(Some(snapshot));
        true
    }
}

/// Per-app policy cache.
pub struct PolicyCache {
    source: Arc<dyn PolicySource>,
    apps: DashMap<Uuid, Arc<AppEntry<Vec<Arc<Policy>>>>>,
}

impl PolicyCache {
    #[must_use]
    pub fn new(source: Arc<dyn PolicySource>) -> Self {
        Self {
            source,
            apps: DashMap::new(),
        }
    }

    /// The app's policy snapshot, fetching on a cold or invalidated entry.
    ///
    /// Malformed policy documents are logged and skipped; one bad policy
    /// never takes down the app's whole set. A load raced by an invalidation
    /// is discarded and retried, so an event arriving mid-fetch never pins
    /// pre-change state.
    ///
    /// # Errors
    ///
    /// Propagates source failures.
    pub async fn get(&self, app_id: Uuid) -> Result<Arc<Vec<Arc<Policy>>>, StoreError> {
        let entry = self.entry(app_id);
        loop {
            if let Some(snapshot) = entry.snapshot.load_full() {
                return Ok(snapshot);
            }
            let seen = entry.revision.load(Ordering::Acquire);

            let docs = self.source.load_policies(app_id).await?;
            let mut policies = Vec::with_capacity(docs.len());
            for doc in &docs {
                match Policy::from_document(doc) {
                    Ok(policy) => policies.push(Arc::new(policy)),
                    Err(err) => {
                        tracing::warn!(%app_id, error = %err, "skipping malformed policy document");
                    }
                }
            }
            let snapshot = Arc::new(policies);
            if entry.install_if_unchanged(seen, Arc::clone(&snapshot)) {
                return Ok(snapshot);
            }
        }
    }

    /// Drop the app's snapshot; the next `get` re-fetches.
    pub fn invalidate(&self, app_id: Uuid) {
        self.entry(app_id).invalidate();
    }

    /// Monotonic per-app revision; bumps on every install and invalidation.
    #[must_use]
    pub fn revision(&self, app_id: Uuid) -> u64 {
        self.apps
            .get(&app_id)
            .map_or(0, |e| e.revision.load(Ordering::Relaxed))
    }

    /// Listen for `policy-changed` events until cancelled.
    pub fn spawn_invalidation_listener(
        self: &Arc<Self>,
        bus: Arc<dyn EventBus>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            run_listener(CHANNEL_POLICY_CHANGED, bus, cancel, move |app_id| {
                cache.invalidate(app_id);
            })
            .await;
        })
    }

    fn entry(&self, app_id: Uuid) -> Arc<AppEntry<Vec<Arc<Policy>>>> {
        self.apps.entry(app_id).or_default().clone()
    }
}

/// Per-app schema cache.
pub struct SchemaCache {
    source: Arc<dyn SchemaSource>,
    apps: DashMap<Uuid, Arc<AppEntry<AppSchemas>>>,
}

impl SchemaCache {
    #[must_use]
    pub fn new(source: Arc<dyn SchemaSource>) -> Self {
        Self {
            source,
            apps: DashMap::new(),
        }
    }

    /// The app's schema snapshot, fetching on a cold or invalidated entry.
    ///
    /// A load raced by an invalidation is discarded and retried.
    ///
    /// # Errors
    ///
    /// Propagates source failures.
    pub async fn get(&self, app_id: Uuid) -> Result<Arc<AppSchemas>, StoreError> {
        let entry = self.entry(app_id);
        loop {
            if let Some(snapshot) = entry.snapshot.load_full() {
                return Ok(snapshot);
            }
            let seen = entry.revision.load(Ordering::Acquire);

            let defs = self.source.load_schemas(app_id).await?;
            let by_name = defs.into_iter().map(|s| (s.name.clone(), s)).collect();
            let snapshot = Arc::new(AppSchemas { by_name });
            if entry.install_if_unchanged(seen, Arc::clone(&snapshot)) {
                return Ok(snapshot);
            }
        }
    }

    /// Drop the app's snapshot; the next `get` re-fetches.
    pub fn invalidate(&self, app_id: Uuid) {
        self.entry(app_id).invalidate();
    }

    /// Monotonic per-app revision; bumps on every install and invalidation.
    #[must_use]
    pub fn revision(&self, app_id: Uuid) -> u64 {
        self.apps
            .get(&app_id)
            .map_or(0, |e| e.revision.load(Ordering::Relaxed))
    }

    /// Listen for `schema-changed` events until cancelled.
    pub fn spawn_invalidation_listener(
        self: &Arc<Self>,
        bus: Arc<dyn EventBus>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            run_listener(CHANNEL_SCHEMA_CHANGED, bus, cancel, move |app_id| {
                cache.invalidate(app_id);
            })
            .await;
        })
    }

    fn entry(&self, app_id: Uuid) -> Arc<AppEntry<AppSchemas>> {
        self.apps.entry(app_id).or_default().clone()
    }
}

async fn run_listener(
    channel: &'static str,
    bus: Arc<dyn EventBus>,
    cancel: CancellationToken,
    on_app: impl Fn(Uuid) + Send + 'static,
) {
    let mut sub = match bus.subscribe(channel).await {
        Ok(sub) => sub,
        Err(err) => {
            tracing::error!(channel, error = %err, "invalidation listener failed to subscribe");
            return;
        }
    };
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            msg = sub.recv() => {
                let Some(payload) = msg else { break };
                match payload.get("appId").and_then(Value::as_str).map(Uuid::parse_str) {
                    Some(Ok(app_id)) => on_app(app_id),
                    _ => tracing::warn!(channel, "invalidation event without a valid appId"),
                }
            }
        }
    }
}
