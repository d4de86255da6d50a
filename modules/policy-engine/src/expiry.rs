//! Debounced policy expiry timers.
//!
//! A policy with a `limit` instant is retired shortly before the instant
//! elapses: its app's cache is invalidated and a `policy-expired` event is
//! published so the owning driver can delete the document. Scheduling is
//! idempotent per policy name; duplicate requests while a timer is pending
//! are no-ops.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use policy_core::policy::Policy;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::bus::{CHANNEL_POLICY_EXPIRED, EventBus};
use crate::cache::PolicyCache;

/// How far ahead of `limit` the timer fires.
pub const DEFAULT_LEAD: Duration = Duration::from_secs(60);

pub struct ExpiryScheduler {
    cache: Arc<PolicyCache>,
    bus: Arc<dyn EventBus>,
    cancel: CancellationToken,
    scheduled: Arc<DashMap<String, ()>>,
    lead: Duration,
}

impl ExpiryScheduler {
    #[must_use]
    pub fn new(cache: Arc<PolicyCache>, bus: Arc<dyn EventBus>, cancel: CancellationToken) -> Self {
        Self {
            cache,
            bus,
            cancel,
            scheduled: Arc::new(DashMap::new()),
            lead: DEFAULT_LEAD,
        }
    }

    #[must_use]
    pub fn with_lead(mut self, lead: Duration) -> Self {
        self.lead = lead;
        self
    }

    /// Queue an expiry timer for the policy, if it carries a `limit` and no
    /// timer is already pending for its name.
    pub fn schedule(&self, policy: &Policy) {
        let Some(limit) = policy.limit else { return };
        let name = policy.name.clone();
        if self.scheduled.insert(name.clone(), ()).is_some() {
            return;
        }

        // A limit already in the past fires immediately.
        let delay = (limit - Utc::now())
            .to_std()
            .unwrap_or_default()
            .saturating_sub(self.lead);

        let cache = Arc::clone(&self.cache);
        let bus = Arc::clone(&self.bus);
        let cancel = self.cancel.clone();
        let scheduled = Arc::clone(&self.scheduled);
        let app_id = policy.app_id;
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {
                    scheduled.remove(&name);
                    return;
                }
                () = tokio::time::sleep(delay) => {}
            }
            scheduled.remove(&name);
            cache.invalidate(app_id);
            let payload = json!({"appId": app_id.to_string(), "policy": name});
            if let Err(err) = bus.publish(CHANNEL_POLICY_EXPIRED, payload).await {
                tracing::warn!(policy = %name, error = %err, "failed to publish policy expiry");
            }
        });
    }

    /// Is a timer pending for the policy name?
    #[must_use]
    pub fn is_scheduled(&self, name: &str) -> bool {
        self.scheduled.contains_key(name)
    }
}
