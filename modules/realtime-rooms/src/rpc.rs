//! Correlated request/response over the event bus.
//!
//! Two primitives:
//! - [`RpcClient::call`] — single responder, timeout-bounded. Used for room
//!   queries against the authority.
//! - [`RpcClient::rollcall`] — multiple responders aggregated within a
//!   debounce window (each response extends the wait). Used for diagnostics
//!   where partial answers are expected and tolerated.
//!
//! Requests carry a generated `requestId`; replies travel on a per-request
//! channel derived from it.

use std::sync::Arc;
use std::time::Duration;

use policy_engine::bus::{BusError, EventBus};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const REQUEST_ID_KEY: &str = "requestId";

/// Default wait for a single-responder call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum RpcError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("no response within the timeout")]
    Timeout,
    #[error("reply channel closed before a response arrived")]
    ChannelClosed,
    #[error("request payload must be an object")]
    InvalidRequest,
}

fn reply_channel(channel: &str, id: Uuid) -> String {
    format!("{channel}.reply.{id}")
}

/// Worker-side handle for talking to the authority.
pub struct RpcClient {
    bus: Arc<dyn EventBus>,
    timeout: Duration,
}

impl RpcClient {
    #[must_use]
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self {
            bus,
            timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send one request and await its single correlated response.
    ///
    /// # Errors
    ///
    /// [`RpcError::Timeout`] when no responder answers in time.
    pub async fn call(&self, channel: &str, mut payload: Value) -> Result<Value, RpcError> {
        let Some(map) = payload.as_object_mut() else {
            return Err(RpcError::InvalidRequest);
        };
        let id = Uuid::new_v4();
        map.insert(REQUEST_ID_KEY.to_owned(), Value::String(id.to_string()));

        let mut sub = self.bus.subscribe(&reply_channel(channel, id)).await?;
        self.bus.publish(channel, payload).await?;

        match tokio::time::timeout(self.timeout, sub.recv()).await {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(RpcError::ChannelClosed),
            Err(_) => Err(RpcError::Timeout),
        }
    }

    /// Broadcast a request and gather every response that arrives before the
    /// responders fall quiet for `window`.
    ///
    /// # Errors
    ///
    /// Bus failures only; an empty aggregation is a valid result.
    pub async fn rollcall(
        &self,
        channel: &str,
        mut payload: Value,
        window: Duration,
    ) -> Result<Vec<Value>, RpcError> {
        let Some(map) = payload.as_object_mut() else {
            return Err(RpcError::InvalidRequest);
        };
        let id = Uuid::new_v4();
        map.insert(REQUEST_ID_KEY.to_owned(), Value::String(id.to_string()));

        let mut sub = self.bus.subscribe(&reply_channel(channel, id)).await?;
        self.bus.publish(channel, payload).await?;

        let mut responses = Vec::new();
        loop {
            match tokio::time::timeout(window, sub.recv()).await {
                Ok(Some(response)) => responses.push(response),
                // Quiet window elapsed or the channel went away.
                Ok(None) | Err(_) => break,
            }
        }
        Ok(responses)
    }
}

/// Serve a request channel until cancelled.
///
/// The handler returns `Some(reply)` to answer or `None` to stay silent
/// (rollcall responders that have nothing to say). Requests without a valid
/// `requestId` are dropped with a warning.
pub fn serve<F>(
    bus: Arc<dyn EventBus>,
    channel: &'static str,
    cancel: CancellationToken,
    handler: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn(Value) -> Option<Value> + Send + 'static,
{
    tokio::spawn(async move {
        let mut sub = match bus.subscribe(channel).await {
            Ok(sub) => sub,
            Err(err) => {
                tracing::error!(channel, error = %err, "rpc server failed to subscribe");
                return;
            }
        };
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                msg = sub.recv() => {
                    let Some(request) = msg else { break };
                    let id = request
                        .get(REQUEST_ID_KEY)
                        .and_then(Value::as_str)
                        .and_then(|s| Uuid::parse_str(s).ok());
                    let Some(id) = id else {
                        tracing::warn!(channel, "rpc request without a requestId");
                        continue;
                    };
                    if let Some(reply) = handler(request) {
                        if let Err(err) = bus.publish(&reply_channel(channel, id), reply).await {
                            tracing::warn!(channel, error = %err, "failed to publish rpc reply");
                        }
                    }
                }
            }
        }
    })
}
