//! End-to-end realtime flow: compute rooms, reconcile a session, broadcast.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use policy_core::test_support::MemoryStore;
use policy_core::token::{Token, TokenKind};
use policy_engine::bus::EventBus;
use policy_engine::cache::{FieldDef, PolicyCache, SchemaCache, SchemaDef};
use policy_engine::engine::PolicyDecisionService;
use policy_engine::test_support::{LoopbackBus, StaticPolicySource, StaticSchemaSource};
use realtime_rooms::authority::{RoomAuthority, RoomServiceClient};
use realtime_rooms::broadcast::{ChangeEvent, VERB_DELETE, fan_out};
use realtime_rooms::compute::RoomComputer;
use realtime_rooms::room::RoomId;
use realtime_rooms::session::{RealtimeTransport, SessionReconciler};
use realtime_rooms::table::RoomTable;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn app_id() -> Uuid {
    Uuid::from_u128(77)
}

#[derive(Default)]
struct RecordingTransport {
    room_events: Mutex<Vec<(RoomId, Value)>>,
    client_events: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl RealtimeTransport for RecordingTransport {
    async fn join(&self, _connection: &str, _room: RoomId) {}
    async fn leave(&self, _connection: &str, _room: RoomId) {}
    async fn emit(&self, connection: &str, event: &str, _payload: Value) {
        self.client_events
            .lock()
            .push((connection.to_owned(), event.to_owned()));
    }
    async fn emit_to_room(&self, room: RoomId, _event: &str, payload: Value) {
        self.room_events.lock().push((room, payload));
    }
}

fn person_policy() -> Value {
    json!({
        "name": "adults-only",
        "appId": app_id().to_string(),
        "selection": {"role": {"@eq": "VIEWER"}},
        "config": [{
            "verbs": ["GET"],
            "schema": ["person"],
            "query": {"age": {"@gt": 18}}
        }]
    })
}

fn computer() -> (RoomComputer, Arc<SchemaCache>) {
    let policies = Arc::new(PolicyCache::new(Arc::new(StaticPolicySource::new(vec![
        person_policy(),
    ]))));
    let schemas = Arc::new(SchemaCache::new(Arc::new(StaticSchemaSource::new(vec![
        SchemaDef {
            name: "person".to_owned(),
            core: false,
            fields: vec![FieldDef {
                name: "age".to_owned(),
                default: None,
            }],
        },
    ]))));
    let service = Arc::new(PolicyDecisionService::new(
        policies,
        Arc::clone(&schemas),
        Arc::new(MemoryStore::default()),
    ));
    (RoomComputer::new(service, Arc::clone(&schemas)), schemas)
}

#[tokio::test]
async fn connection_sees_updates_then_a_retraction() {
    let bus = Arc::new(LoopbackBus::default());
    let table = Arc::new(RoomTable::new());
    let cancel = CancellationToken::new();
    let authority = RoomAuthority::spawn(table.clone(), bus.clone(), cancel.clone());
    tokio::task::yield_now().await;

    // Session computes its rooms and joins them through the authority.
    let (computer, _schemas) = computer();
    let token = Token::new("tok", TokenKind::User, app_id()).with_property("role", "VIEWER");
    let rooms = computer.rooms_for(&token, None).await;
    assert_eq!(rooms.len(), 1);
    let room_id = rooms[0].id;

    let transport = Arc::new(RecordingTransport::default());
    let session = SessionReconciler::new(
        transport.clone(),
        RoomServiceClient::new(bus.clone() as Arc<dyn EventBus>),
        "conn-1",
    );
    session.reconcile(rooms).await;
    assert_eq!(table.ref_count(room_id), 1);

    // A matching entity keeps its verb.
    let update = ChangeEvent {
        app_id: app_id(),
        schema: "person".to_owned(),
        verb: "update".to_owned(),
        entity: json!({"age": 20}),
    };
    fan_out(&table, transport.as_ref(), &update).await;

    // The same entity dropping below the threshold is retracted.
    let shrunk = ChangeEvent {
        entity: json!({"age": 10}),
        ..update
    };
    fan_out(&table, transport.as_ref(), &shrunk).await;

    let events = transport.room_events.lock().clone();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].0, room_id);
    assert_eq!(events[0].1["verb"], "update");
    assert_eq!(events[1].1["verb"], VERB_DELETE);

    // Disconnect releases the last reference and the room is evicted.
    session.clear().await;
    assert!(table.is_empty());

    cancel.cancel();
    authority.join().await;
}

#[tokio::test]
async fn identical_outcomes_from_two_connections_share_a_room() {
    let bus = Arc::new(LoopbackBus::default());
    let table = Arc::new(RoomTable::new());
    let cancel = CancellationToken::new();
    let authority = RoomAuthority::spawn(table.clone(), bus.clone(), cancel.clone());
    tokio::task::yield_now().await;

    let (computer, _schemas) = computer();
    let first = Token::new("tok-1", TokenKind::User, app_id()).with_property("role", "VIEWER");
    let second = Token::new("tok-2", TokenKind::User, app_id()).with_property("role", "VIEWER");

    let transport = Arc::new(RecordingTransport::default());
    let session_a = SessionReconciler::new(
        transport.clone(),
        RoomServiceClient::new(bus.clone() as Arc<dyn EventBus>),
        "conn-a",
    );
    let session_b = SessionReconciler::new(
        transport.clone(),
        RoomServiceClient::new(bus.clone() as Arc<dyn EventBus>),
        "conn-b",
    );

    let rooms_a = computer.rooms_for(&first, None).await;
    let rooms_b = computer.rooms_for(&second, None).await;
    assert_eq!(rooms_a[0].id, rooms_b[0].id);

    session_a.reconcile(rooms_a.clone()).await;
    session_b.reconcile(rooms_b).await;
    assert_eq!(table.len(), 1);
    assert_eq!(table.ref_count(rooms_a[0].id), 2);

    session_a.clear().await;
    assert_eq!(table.ref_count(rooms_a[0].id), 1);
    session_b.clear().await;
    assert!(table.is_empty());

    cancel.cancel();
    authority.join().await;
}
