//! Socket session reconciliation.
//!
//! A session tracks which rooms its connection has joined. When the room set
//! is recomputed, the diff against the currently joined set drives leaves and
//! joins: departing rooms first tell the client to purge the affected
//! collections (`db-disconnect-room`, fire-and-forget — access is revoked
//! without awaiting an acknowledgement), new rooms are joined and announced
//! with `db-connect-room` naming the collections that became visible.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::authority::RoomServiceClient;
use crate::room::{Room, RoomId};

/// Client event announcing newly visible collections.
pub const EVENT_CONNECT_ROOM: &str = "db-connect-room";
/// Client event revoking collections; the client purges its local caches.
pub const EVENT_DISCONNECT_ROOM: &str = "db-disconnect-room";

/// The realtime transport's connection/room primitives.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn join(&self, connection: &str, room: RoomId);
    async fn leave(&self, connection: &str, room: RoomId);
    /// Emit an event to one connection.
    async fn emit(&self, connection: &str, event: &str, payload: Value);
    /// Emit an event to every connection in a room.
    async fn emit_to_room(&self, room: RoomId, event: &str, payload: Value);
}

/// One connection's room membership.
#[derive(Default)]
struct SessionState {
    /// Joined room → the collections it granted.
    joined: HashMap<RoomId, Vec<String>>,
}

/// Reconciles a connection's joined rooms against freshly computed ones.
pub struct SessionReconciler {
    transport: Arc<dyn RealtimeTransport>,
    rooms: RoomServiceClient,
    state: Mutex<SessionState>,
    connection: String,
}

impl SessionReconciler {
    #[must_use]
    pub fn new(
        transport: Arc<dyn RealtimeTransport>,
        rooms: RoomServiceClient,
        connection: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            rooms,
            state: Mutex::new(SessionState::default()),
            connection: connection.into(),
        }
    }

    /// The rooms the connection currently holds.
    #[must_use]
    pub fn joined(&self) -> Vec<RoomId> {
        let mut ids: Vec<RoomId> = self.state.lock().joined.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Apply a freshly computed room set.
    pub async fn reconcile(&self, fresh: Vec<Room>) {
        let (to_leave, to_join) = {
            let state = self.state.lock();
            let to_leave: Vec<(RoomId, Vec<String>)> = state
                .joined
                .iter()
                .filter(|(id, _)| !fresh.iter().any(|r| r.id == **id))
                .map(|(id, collections)| (*id, collections.clone()))
                .collect();
            let to_join: Vec<Room> = fresh
                .iter()
                .filter(|r| !state.joined.contains_key(&r.id))
                .cloned()
                .collect();
            (to_leave, to_join)
        };

        for (id, collections) in to_leave {
            self.transport
                .emit(
                    &self.connection,
                    EVENT_DISCONNECT_ROOM,
                    json!({"collections": collections}),
                )
                .await;
            self.transport.leave(&self.connection, id).await;
            self.rooms.release(id).await;
            self.state.lock().joined.remove(&id);
        }

        for room in to_join {
            let Some(id) = self.rooms.acquire(&room).await else {
                // No answer from the authority: fail closed, skip the room.
                continue;
            };
            self.transport.join(&self.connection, id).await;
            self.transport
                .emit(
                    &self.connection,
                    EVENT_CONNECT_ROOM,
                    json!({"collections": room.collections()}),
                )
                .await;
            self.state.lock().joined.insert(id, room.collections());
        }
    }

    /// Leave everything; used on disconnect.
    pub async fn clear(&self) {
        self.reconcile(Vec::new()).await;
    }
}
