//! The authoritative room table.
//!
//! One process owns the canonical `RoomId -> Room` map; everyone else talks
//! to it over the bus. Rooms are reference-counted per acquiring connection
//! and evicted when the last reference is released.

use dashmap::DashMap;
use uuid::Uuid;

use crate::room::{Room, RoomId};

struct RoomEntry {
    room: Room,
    refs: usize,
}

/// Reference-counted room registry.
#[derive(Default)]
pub struct RoomTable {
    rooms: DashMap<RoomId, RoomEntry>,
}

impl RoomTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one reference to the room, inserting it on first use.
    pub fn acquire(&self, room: Room) -> RoomId {
        let id = room.id;
        self.rooms
            .entry(id)
            .and_modify(|e| e.refs += 1)
            .or_insert(RoomEntry { room, refs: 1 });
        id
    }

    /// Drop one reference; the room is evicted when none remain.
    pub fn release(&self, id: RoomId) {
        self.rooms.remove_if_mut(&id, |_, entry| {
            entry.refs = entry.refs.saturating_sub(1);
            entry.refs == 0
        });
    }

    #[must_use]
    pub fn get(&self, id: RoomId) -> Option<Room> {
        self.rooms.get(&id).map(|e| e.room.clone())
    }

    /// Current reference count; zero for an unknown room.
    #[must_use]
    pub fn ref_count(&self, id: RoomId) -> usize {
        self.rooms.get(&id).map_or(0, |e| e.refs)
    }

    /// Every room granting visibility into the given app + schema.
    #[must_use]
    pub fn rooms_for_schema(&self, app_id: Uuid, schema: &str) -> Vec<Room> {
        self.rooms
            .iter()
            .filter(|e| e.room.app_id == app_id && e.room.grants.contains_key(schema))
            .map(|e| e.room.clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use policy_core::outcome::{EvaluatedConfig, Outcome};
    use policy_core::policy::{TargetSet, VerbSet};
    use serde_json::json;

    fn room(app: u128, schema: &str, make: &str) -> Room {
        let outcome = Outcome::merge(vec![EvaluatedConfig {
            policy_name: "P1".to_owned(),
            priority: 0,
            verbs: VerbSet::parse(&["GET".to_owned()]),
            schemas: TargetSet::parse(&[schema.to_owned()]),
            endpoints: TargetSet::default(),
            query: json!({"make": make}),
            projection: None,
        }]);
        Room::from_outcome(Uuid::from_u128(app), schema, &outcome)
    }

    #[test]
    fn acquire_and_release_track_references() {
        let table = RoomTable::new();
        let id = table.acquire(room(1, "car", "Ford"));
        table.acquire(room(1, "car", "Ford"));
        assert_eq!(table.ref_count(id), 2);
        assert_eq!(table.len(), 1);

        table.release(id);
        assert_eq!(table.ref_count(id), 1);
        assert!(table.get(id).is_some());

        table.release(id);
        assert_eq!(table.ref_count(id), 0);
        assert!(table.get(id).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn releasing_an_unknown_room_is_harmless() {
        let table = RoomTable::new();
        let id = room(1, "car", "Ford").id;
        table.release(id);
        assert!(table.is_empty());
    }

    #[test]
    fn lookup_filters_by_app_and_schema() {
        let table = RoomTable::new();
        table.acquire(room(1, "car", "Ford"));
        table.acquire(room(1, "car", "Opel"));
        table.acquire(room(1, "bike", "BMX"));
        table.acquire(room(2, "car", "Ford"));

        assert_eq!(table.rooms_for_schema(Uuid::from_u128(1), "car").len(), 2);
        assert_eq!(table.rooms_for_schema(Uuid::from_u128(1), "bike").len(), 1);
        assert_eq!(table.rooms_for_schema(Uuid::from_u128(3), "car").len(), 0);
    }
}
