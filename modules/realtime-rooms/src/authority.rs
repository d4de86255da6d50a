//! The room authority and its worker-side client.
//!
//! One process is elected authority at startup (and not re-elected); it owns
//! the [`RoomTable`] and answers acquire/release/lookup requests over the
//! bus. Workers never touch the table directly. A worker whose request times
//! out treats the result as "no room" — realtime access fails closed, the
//! owning mutation never does.

use std::sync::Arc;
use std::time::Duration;

use policy_engine::bus::EventBus;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::room::{Room, RoomId};
use crate::rpc::{RpcClient, serve};
use crate::table::RoomTable;

/// Single-responder: register a room reference, payload carries `room`.
pub const CHANNEL_ROOM_ACQUIRE: &str = "room-acquire";
/// Single-responder: drop a room reference, payload carries `roomId`.
pub const CHANNEL_ROOM_RELEASE: &str = "room-release";
/// Multi-responder diagnostics: every node reports its room count.
pub const CHANNEL_ROOM_ROLLCALL: &str = "room-rollcall";

/// Serve the room table on the bus until cancelled.
pub struct RoomAuthority {
    handles: Vec<JoinHandle<()>>,
}

impl RoomAuthority {
    /// Start answering on the room channels.
    #[must_use]
    pub fn spawn(
        table: Arc<RoomTable>,
        bus: Arc<dyn EventBus>,
        cancel: CancellationToken,
    ) -> Self {
        let acquire_table = Arc::clone(&table);
        let acquire = serve(
            Arc::clone(&bus),
            CHANNEL_ROOM_ACQUIRE,
            cancel.clone(),
            move |request| {
                let room: Room =
                    match serde_json::from_value(request.get("room")?.clone()) {
                        Ok(room) => room,
                        Err(err) => {
                            tracing::warn!(error = %err, "malformed room in acquire request");
                            return None;
                        }
                    };
                let id = acquire_table.acquire(room);
                Some(json!({"roomId": id}))
            },
        );

        let release_table = Arc::clone(&table);
        let release = serve(
            Arc::clone(&bus),
            CHANNEL_ROOM_RELEASE,
            cancel.clone(),
            move |request| {
                let id: RoomId =
                    serde_json::from_value(request.get("roomId")?.clone()).ok()?;
                release_table.release(id);
                Some(json!({"released": true}))
            },
        );

        let rollcall_table = Arc::clone(&table);
        let rollcall = serve(bus, CHANNEL_ROOM_ROLLCALL, cancel, move |_| {
            Some(json!({"rooms": rollcall_table.len()}))
        });

        Self {
            handles: vec![acquire, release, rollcall],
        }
    }

    /// Wait for the serving tasks to wind down after cancellation.
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// Worker-side room operations.
pub struct RoomServiceClient {
    rpc: RpcClient,
}

impl RoomServiceClient {
    #[must_use]
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self {
            rpc: RpcClient::new(bus),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.rpc = self.rpc.with_timeout(timeout);
        self
    }

    /// Register a reference to the room with the authority.
    ///
    /// Failures (timeout, bus trouble, malformed reply) resolve to `None`:
    /// the caller simply gets no room.
    pub async fn acquire(&self, room: &Room) -> Option<RoomId> {
        let payload = json!({"room": room});
        match self.rpc.call(CHANNEL_ROOM_ACQUIRE, payload).await {
            Ok(reply) => match serde_json::from_value(reply.get("roomId")?.clone()) {
                Ok(id) => Some(id),
                Err(err) => {
                    tracing::warn!(error = %err, "malformed roomId in acquire reply");
                    None
                }
            },
            Err(err) => {
                tracing::warn!(room = %room.id, error = %err, "room acquire failed");
                None
            }
        }
    }

    /// Drop a reference to the room.
    pub async fn release(&self, id: RoomId) {
        let payload = json!({"roomId": id});
        if let Err(err) = self.rpc.call(CHANNEL_ROOM_RELEASE, payload).await {
            tracing::warn!(room = %id, error = %err, "room release failed");
        }
    }

    /// Gather room counts from every responding node.
    pub async fn rollcall(&self, window: Duration) -> Vec<Value> {
        self.rpc
            .rollcall(CHANNEL_ROOM_ROLLCALL, json!({}), window)
            .await
            .unwrap_or_else(|err| {
                tracing::warn!(error = %err, "room rollcall failed");
                Vec::new()
            })
    }
}
