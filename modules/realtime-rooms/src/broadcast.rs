//! Broadcast filtering and retraction.
//!
//! Every persisted mutation is re-evaluated against each room of the changed
//! app + schema using the **current full entity**, not the diff. A room whose
//! query still matches receives the event; a room whose query no longer
//! matches receives the event with its verb forced to `delete`, so clients
//! retract the entity instead of keeping a stale copy. Either way the entity
//! is first stripped to the room grant's projection, so a field-restricted
//! room never sees fields its policies withheld. Per-room failures are
//! logged and skipped; the owning mutation is never failed from here.

use std::sync::Arc;

use policy_core::filter::{FilterExpr, is_empty_filter};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use policy_engine::bus::EventBus;

use crate::room::{RoomGrant, RoomId};
use crate::session::RealtimeTransport;
use crate::table::RoomTable;

/// Bus channel carrying persisted mutations.
pub const CHANNEL_ENTITY_CHANGED: &str = "entity-changed";
/// Client event name for data change notifications.
pub const EVENT_DB_EVENT: &str = "db-event";
/// The verb a retraction is re-emitted with.
pub const VERB_DELETE: &str = "delete";

/// One persisted mutation.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "appId")]
    pub app_id: Uuid,
    pub schema: String,
    pub verb: String,
    /// The full entity after the mutation.
    pub entity: Value,
}

/// Fan one change out to every room of its app + schema.
pub async fn fan_out(table: &RoomTable, transport: &dyn RealtimeTransport, event: &ChangeEvent) {
    for room in table.rooms_for_schema(event.app_id, &event.schema) {
        let Some(grant) = room.grants.get(&event.schema) else {
            continue;
        };
        let Some(verb) = grant_verb(room.id, grant, event) else {
            continue;
        };
        let payload = json!({
            "schema": event.schema,
            "verb": verb,
            "entity": grant.project(&event.entity),
        });
        transport.emit_to_room(room.id, EVENT_DB_EVENT, payload).await;
    }
}

/// The verb to emit to this room, or `None` to skip it.
fn grant_verb(room: RoomId, grant: &RoomGrant, event: &ChangeEvent) -> Option<String> {
    if is_empty_filter(&grant.query) {
        return Some(event.verb.clone());
    }
    let expr = match FilterExpr::parse(&grant.query) {
        Ok(expr) => expr,
        Err(err) => {
            tracing::warn!(%room, error = %err, "unparseable room query, skipping room");
            return None;
        }
    };
    if expr.matches(&event.entity) {
        Some(event.verb.clone())
    } else {
        // Retraction: the entity left the room's view.
        Some(VERB_DELETE.to_owned())
    }
}

/// Listen for `entity-changed` events until cancelled.
pub fn spawn_broadcast_listener(
    table: Arc<RoomTable>,
    transport: Arc<dyn RealtimeTransport>,
    bus: Arc<dyn EventBus>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sub = match bus.subscribe(CHANNEL_ENTITY_CHANGED).await {
            Ok(sub) => sub,
            Err(err) => {
                tracing::error!(error = %err, "broadcast listener failed to subscribe");
                return;
            }
        };
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                msg = sub.recv() => {
                    let Some(payload) = msg else { break };
                    match serde_json::from_value::<ChangeEvent>(payload) {
                        Ok(event) => fan_out(&table, transport.as_ref(), &event).await,
                        Err(err) => {
                            tracing::warn!(error = %err, "malformed entity-changed payload");
                        }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use policy_core::outcome::{EvaluatedConfig, Outcome};
    use policy_core::policy::{TargetSet, VerbSet};
    use policy_core::projection::ProjectionMap;
    use crate::room::Room;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        emitted: Mutex<Vec<(RoomId, Value)>>,
    }

    impl RecordingTransport {
        fn emitted(&self) -> Vec<(RoomId, Value)> {
            self.emitted.lock().clone()
        }
    }

    #[async_trait]
    impl RealtimeTransport for RecordingTransport {
        async fn join(&self, _connection: &str, _room: RoomId) {}
        async fn leave(&self, _connection: &str, _room: RoomId) {}
        async fn emit(&self, _connection: &str, _event: &str, _payload: Value) {}
        async fn emit_to_room(&self, room: RoomId, _event: &str, payload: Value) {
            self.emitted.lock().push((room, payload));
        }
    }

    fn app_id() -> Uuid {
        Uuid::from_u128(5)
    }

    fn room_with_query(schema: &str, query: Value) -> Room {
        room_with_grant(schema, query, None)
    }

    fn room_with_grant(schema: &str, query: Value, projected: Option<&[&str]>) -> Room {
        let outcome = Outcome::merge(vec![EvaluatedConfig {
            policy_name: "P1".to_owned(),
            priority: 0,
            verbs: VerbSet::parse(&["GET".to_owned()]),
            schemas: TargetSet::parse(&[schema.to_owned()]),
            endpoints: TargetSet::default(),
            query,
            projection: projected
                .map(|keys| ProjectionMap::from_fields(keys.iter().map(|k| (*k).to_owned()))),
        }]);
        Room::from_outcome(app_id(), schema, &outcome)
    }

    fn change(schema: &str, verb: &str, entity: Value) -> ChangeEvent {
        ChangeEvent {
            app_id: app_id(),
            schema: schema.to_owned(),
            verb: verb.to_owned(),
            entity,
        }
    }

    #[tokio::test]
    async fn matching_entities_keep_their_verb() {
        let table = RoomTable::new();
        let room = room_with_query("person", json!({"age": {"$gt": 18}}));
        table.acquire(room.clone());
        let transport = RecordingTransport::default();

        fan_out(&table, &transport, &change("person", "update", json!({"age": 20}))).await;

        let emitted = transport.emitted();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].0, room.id);
        assert_eq!(emitted[0].1["verb"], "update");
    }

    #[tokio::test]
    async fn non_matching_entities_are_retracted_as_delete() {
        let table = RoomTable::new();
        let room = room_with_query("person", json!({"age": {"$gt": 18}}));
        table.acquire(room.clone());
        let transport = RecordingTransport::default();

        fan_out(&table, &transport, &change("person", "update", json!({"age": 10}))).await;

        let emitted = transport.emitted();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].1["verb"], VERB_DELETE);
        assert_eq!(emitted[0].1["entity"], json!({"age": 10}));
    }

    #[tokio::test]
    async fn projected_rooms_receive_only_their_fields() {
        let table = RoomTable::new();
        let room = room_with_grant("car", json!({"make": "Ford"}), Some(&["make"]));
        table.acquire(room);
        let transport = RecordingTransport::default();

        let matching = change("car", "update", json!({"make": "Ford", "vin": "SECRET-123"}));
        fan_out(&table, &transport, &matching).await;

        // A retraction carries the stripped entity too.
        let leaving = change("car", "update", json!({"make": "Opel", "vin": "SECRET-123"}));
        fan_out(&table, &transport, &leaving).await;

        let emitted = transport.emitted();
        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[0].1["verb"], "update");
        assert_eq!(emitted[0].1["entity"], json!({"make": "Ford"}));
        assert!(emitted[0].1["entity"].get("vin").is_none());
        assert_eq!(emitted[1].1["verb"], VERB_DELETE);
        assert_eq!(emitted[1].1["entity"], json!({"make": "Opel"}));
    }

    #[tokio::test]
    async fn unrestricted_rooms_see_everything() {
        let table = RoomTable::new();
        table.acquire(room_with_query("person", json!({})));
        let transport = RecordingTransport::default();

        fan_out(&table, &transport, &change("person", "create", json!({"age": 1}))).await;
        assert_eq!(transport.emitted()[0].1["verb"], "create");
    }

    #[tokio::test]
    async fn other_schemas_and_apps_are_untouched() {
        let table = RoomTable::new();
        table.acquire(room_with_query("car", json!({"make": "Ford"})));
        let transport = RecordingTransport::default();

        fan_out(&table, &transport, &change("person", "update", json!({"age": 10}))).await;
        assert!(transport.emitted().is_empty());
    }

    #[tokio::test]
    async fn or_subtrees_pass_independently_of_and_siblings() {
        let table = RoomTable::new();
        let query = json!({
            "$and": [
                {"kind": "sedan"},
                {"$or": [{"make": "Ford"}, {"make": "Opel"}]}
            ]
        });
        let room = room_with_query("car", query);
        table.acquire(room);
        let transport = RecordingTransport::default();

        fan_out(
            &table,
            &transport,
            &change("car", "update", json!({"kind": "sedan", "make": "Opel"})),
        )
        .await;
        assert_eq!(transport.emitted()[0].1["verb"], "update");

        fan_out(
            &table,
            &transport,
            &change("car", "update", json!({"kind": "coupe", "make": "Opel"})),
        )
        .await;
        assert_eq!(transport.emitted()[1].1["verb"], VERB_DELETE);
    }
}
