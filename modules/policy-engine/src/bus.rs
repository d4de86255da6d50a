//! Event bus port.
//!
//! Cache invalidation, policy expiry, and room traffic all travel over a
//! shared pub/sub bus. The engine only needs publish and subscribe by named
//! channel; the concrete transport lives with the host process.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

/// Published when an app's policies change; payload carries `appId`.
pub const CHANNEL_POLICY_CHANGED: &str = "policy-changed";
/// Published when an app's schemas change; payload carries `appId`.
pub const CHANNEL_SCHEMA_CHANGED: &str = "schema-changed";
/// Published when a policy's `limit` elapses; payload carries `appId` and
/// the policy name.
pub const CHANNEL_POLICY_EXPIRED: &str = "policy-expired";

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("bus failure: {0}")]
    Other(String),
}

/// Pub/sub by named channel.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Emit a payload on a channel.
    async fn publish(&self, channel: &str, payload: Value) -> Result<(), BusError>;

    /// Open a subscription on a channel.
    async fn subscribe(&self, channel: &str) -> Result<BusSubscription, BusError>;
}

/// A live subscription; yields payloads until the bus drops the channel.
pub struct BusSubscription {
    receiver: mpsc::UnboundedReceiver<Value>,
}

impl BusSubscription {
    #[must_use]
    pub fn new(receiver: mpsc::UnboundedReceiver<Value>) -> Self {
        Self { receiver }
    }

    /// Next payload, or `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<Value> {
        self.receiver.recv().await
    }
}
