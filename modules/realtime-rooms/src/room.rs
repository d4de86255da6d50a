//! Room identity and structure.
//!
//! A room is the realtime authorization unit: every socket whose policy
//! outcome for a schema hashes to the same [`RoomId`] shares one broadcast
//! partition. Identity is a hash over the canonical outcome form, so
//! byte-identical outcomes always land in the same room and any difference in
//! query or projection opens a new one.

use std::collections::BTreeMap;
use std::fmt;

use policy_core::outcome::{Outcome, canonical_json};
use policy_core::projection::ProjectionMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use uuid::Uuid;
use xxhash_rust::xxh3::xxh3_64;

/// Stable identifier of a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(u64);

impl RoomId {
    /// Derive the id for one app + schema + outcome.
    #[must_use]
    pub fn derive(app_id: Uuid, schema: &str, outcome: &Outcome) -> Self {
        let canonical = json!({
            "appId": app_id.to_string(),
            "schema": schema,
            "outcome": outcome.canonical_value(),
        });
        let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
        Self(xxh3_64(&bytes))
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// What a room's members may see of one schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomGrant {
    /// Native-syntax filter; `{}` grants the whole collection.
    pub query: Value,
    /// Field-inclusion map; absent when unrestricted.
    pub projection: Option<Value>,
}

impl RoomGrant {
    /// Strip an entity down to the grant's field set.
    ///
    /// Unrestricted grants pass the entity through. A grant naming a prefix
    /// keeps the whole subtree (`profile` keeps `profile.name`); a grant
    /// naming a leaf descends to it (`engine.cylinders` drops the rest of
    /// `engine`).
    #[must_use]
    pub fn project(&self, entity: &Value) -> Value {
        let Some(inclusion) = self.projection.as_ref().and_then(Value::as_object) else {
            return entity.clone();
        };
        let allowed = ProjectionMap::from_fields(inclusion.keys().cloned());
        keep_allowed(entity, "", &allowed).unwrap_or_else(|| Value::Object(Map::new()))
    }
}

fn keep_allowed(value: &Value, prefix: &str, allowed: &ProjectionMap) -> Option<Value> {
    let map = value.as_object()?;
    let mut out = Map::new();
    for (key, val) in map {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        if allowed.allows_path(&path) {
            out.insert(key.clone(), val.clone());
        } else if let Some(kept) = keep_allowed(val, &path, allowed) {
            out.insert(key.clone(), kept);
        }
    }
    (!out.is_empty()).then(|| Value::Object(out))
}

/// One realtime broadcast partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    #[serde(rename = "appId")]
    pub app_id: Uuid,
    /// Schema name → grant.
    pub grants: BTreeMap<String, RoomGrant>,
    /// Names of the policies whose outcome formed this room.
    #[serde(rename = "appliedPolicies")]
    pub applied_policies: Vec<String>,
}

impl Room {
    /// Build the room for one schema's merged outcome.
    ///
    /// Bucket queries fold together with OR; the projection survives only
    /// when every bucket restricts fields (one unprojected bucket grants the
    /// whole document).
    #[must_use]
    pub fn from_outcome(app_id: Uuid, schema: &str, outcome: &Outcome) -> Self {
        let mut query = Value::Object(serde_json::Map::new());
        let mut projection: Option<serde_json::Map<String, Value>> =
            Some(serde_json::Map::new());
        let mut policies: Vec<String> = Vec::new();

        for bucket in &outcome.buckets {
            query = policy_core::filter::merge_query_filters(
                query,
                canonical_json(&bucket.query),
                policy_core::filter::LogicalOp::Or,
            );
            match (&mut projection, &bucket.projection) {
                (Some(acc), Some(map)) => {
                    if let Some(fields) = map.to_inclusion().as_object() {
                        acc.extend(fields.clone());
                    }
                }
                (slot, None) => *slot = None,
                (None, _) => {}
            }
            for name in &bucket.policies {
                if !policies.contains(name) {
                    policies.push(name.clone());
                }
            }
        }
        policies.sort();

        let grant = RoomGrant {
            query,
            projection: projection.map(Value::Object),
        };
        let mut grants = BTreeMap::new();
        grants.insert(schema.to_owned(), grant);

        Self {
            id: RoomId::derive(app_id, schema, outcome),
            app_id,
            grants,
            applied_policies: policies,
        }
    }

    /// The collections this room makes visible.
    #[must_use]
    pub fn collections(&self) -> Vec<String> {
        self.grants.keys().cloned().collect()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use policy_core::outcome::EvaluatedConfig;
    use policy_core::policy::{TargetSet, VerbSet};
    use policy_core::projection::ProjectionMap;

    fn app_id() -> Uuid {
        Uuid::from_u128(9)
    }

    fn outcome(query: Value, projected: Option<&[&str]>) -> Outcome {
        Outcome::merge(vec![EvaluatedConfig {
            policy_name: "P1".to_owned(),
            priority: 0,
            verbs: VerbSet::parse(&["GET".to_owned()]),
            schemas: TargetSet::parse(&["car".to_owned()]),
            endpoints: TargetSet::default(),
            query,
            projection: projected
                .map(|keys| ProjectionMap::from_fields(keys.iter().map(|k| (*k).to_owned()))),
        }])
    }

    #[test]
    fn identical_outcomes_share_an_id() {
        let a = RoomId::derive(app_id(), "car", &outcome(json!({"make": "Ford"}), None));
        let b = RoomId::derive(app_id(), "car", &outcome(json!({"make": "Ford"}), None));
        assert_eq!(a, b);
    }

    #[test]
    fn query_and_projection_differences_change_the_id() {
        let base = RoomId::derive(app_id(), "car", &outcome(json!({"make": "Ford"}), None));
        let other_query =
            RoomId::derive(app_id(), "car", &outcome(json!({"make": "Opel"}), None));
        let projected = RoomId::derive(
            app_id(),
            "car",
            &outcome(json!({"make": "Ford"}), Some(&["make"])),
        );
        assert_ne!(base, other_query);
        assert_ne!(base, projected);
    }

    #[test]
    fn key_order_does_not_change_the_id() {
        let a = RoomId::derive(app_id(), "car", &outcome(json!({"a": 1, "b": 2}), None));
        let b = RoomId::derive(app_id(), "car", &outcome(json!({"b": 2, "a": 1}), None));
        assert_eq!(a, b);
    }

    #[test]
    fn grant_projection_strips_entities() {
        let grant = RoomGrant {
            query: json!({}),
            projection: Some(json!({"make": 1, "engine.cylinders": 1})),
        };
        let entity = json!({
            "make": "Ford",
            "vin": "SECRET-123",
            "engine": {"cylinders": 6, "serial": "x"}
        });
        assert_eq!(
            grant.project(&entity),
            json!({"make": "Ford", "engine": {"cylinders": 6}})
        );

        let open = RoomGrant {
            query: json!({}),
            projection: None,
        };
        assert_eq!(open.project(&entity), entity);
    }

    #[test]
    fn room_grant_carries_query_and_projection() {
        let room = Room::from_outcome(
            app_id(),
            "car",
            &outcome(json!({"make": "Ford"}), Some(&["make", "model"])),
        );
        let grant = room.grants.get("car").unwrap();
        assert_eq!(grant.query, json!({"make": "Ford"}));
        assert_eq!(grant.projection, Some(json!({"make": 1, "model": 1})));
        assert_eq!(room.applied_policies, vec!["P1"]);
        assert_eq!(room.collections(), vec!["car"]);
    }
}
