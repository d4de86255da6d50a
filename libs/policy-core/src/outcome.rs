//! Outcome merging: combining surviving policy configs into a minimal set of
//! non-duplicated `{query, projection, policies[]}` buckets.
//!
//! Evaluation is fail-closed; no bucket is ever granted by omission. The
//! distinct "nothing survived" errors are raised by the decision flow that
//! feeds this merger, one per filtering stage.

use serde_json::{Map, Value};

use crate::filter::{LogicalOp, merge_query_filters};
use crate::policy::{TargetSet, VerbSet};
use crate::projection::ProjectionMap;

/// One policy config after condition filtering, query building, and
/// projection computation — ready to merge.
#[derive(Debug, Clone)]
pub struct EvaluatedConfig {
    pub policy_name: String,
    /// Lower merges first.
    pub priority: i64,
    pub verbs: VerbSet,
    pub schemas: TargetSet,
    pub endpoints: TargetSet,
    /// Native-syntax filter; `{}` when the config is unrestricted.
    pub query: Value,
    /// `None` when the config imposes no field restriction.
    pub projection: Option<ProjectionMap>,
}

/// One merged decision bucket.
#[derive(Debug, Clone)]
pub struct OutcomeBucket {
    pub verbs: VerbSet,
    pub schemas: TargetSet,
    pub endpoints: TargetSet,
    pub query: Value,
    pub projection: Option<ProjectionMap>,
    /// Names of every policy that contributed to this bucket.
    pub policies: Vec<String>,
}

/// The final decision attached to a request.
#[derive(Debug, Clone, Default)]
pub struct Outcome {
    pub buckets: Vec<OutcomeBucket>,
}

impl Outcome {
    /// Merge evaluated configs, lowest priority first.
    ///
    /// A candidate folds into an existing bucket only when the bucket's
    /// verbs, endpoints, and schemas are each supersets of the candidate's.
    /// Equal queries dedupe only when the projections are equal as well; the
    /// same query behind a different field set opens its own bucket, so an
    /// unrestricted grant is never narrowed by an earlier projected one.
    /// Diverging queries merge by OR only when **neither** side restricts
    /// fields; any projection difference opens a new bucket instead, so a
    /// wider query can never bypass a narrower projection.
    #[must_use]
    pub fn merge(mut evaluated: Vec<EvaluatedConfig>) -> Self {
        evaluated.sort_by_key(|c| c.priority);

        let mut buckets: Vec<OutcomeBucket> = Vec::new();
        for candidate in evaluated {
            let existing = buckets.iter_mut().find(|b| {
                b.verbs.is_superset(&candidate.verbs)
                    && b.endpoints.is_superset(&candidate.endpoints)
                    && b.schemas.is_superset(&candidate.schemas)
            });

            match existing {
                Some(bucket)
                    if bucket.query == candidate.query
                        && bucket.projection == candidate.projection =>
                {
                    push_unique(&mut bucket.policies, candidate.policy_name);
                }
                Some(bucket)
                    if bucket.projection.is_none() && candidate.projection.is_none() =>
                {
                    bucket.query = merge_query_filters(
                        std::mem::take(&mut bucket.query),
                        candidate.query,
                        LogicalOp::Or,
                    );
                    push_unique(&mut bucket.policies, candidate.policy_name);
                }
                _ => buckets.push(OutcomeBucket {
                    verbs: candidate.verbs,
                    schemas: candidate.schemas,
                    endpoints: candidate.endpoints,
                    query: candidate.query,
                    projection: candidate.projection,
                    policies: vec![candidate.policy_name],
                }),
            }
        }

        Self { buckets }
    }

    /// Deterministic JSON form: stable key order, sorted policy names.
    ///
    /// Byte-identical outcomes must hash identically (room identity depends
    /// on it), so everything that can vary in order is sorted here.
    #[must_use]
    pub fn canonical_value(&self) -> Value {
        Value::Array(self.buckets.iter().map(OutcomeBucket::canonical_value).collect())
    }
}

impl OutcomeBucket {
    fn canonical_value(&self) -> Value {
        let mut map = Map::new();
        map.insert(
            "verbs".to_owned(),
            if self.verbs.is_all() {
                Value::from(vec!["all"])
            } else {
                Value::Array(self.verbs.verbs().iter().cloned().map(Value::String).collect())
            },
        );
        map.insert("schema".to_owned(), target_value(&self.schemas));
        map.insert("endpoints".to_owned(), target_value(&self.endpoints));
        map.insert("query".to_owned(), canonical_json(&self.query));
        map.insert(
            "projection".to_owned(),
            self.projection
                .as_ref()
                .map_or(Value::Null, ProjectionMap::to_inclusion),
        );
        let mut policies: Vec<String> = self.policies.clone();
        policies.sort();
        map.insert(
            "policies".to_owned(),
            Value::Array(policies.into_iter().map(Value::String).collect()),
        );
        Value::Object(map)
    }
}

fn target_value(targets: &TargetSet) -> Value {
    Value::Array(targets.tokens().into_iter().map(Value::String).collect())
}

/// Recursively sort object keys so serialization is order-independent.
#[must_use]
pub fn canonical_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: Vec<(&String, &Value)> = map.iter().collect();
            sorted.sort_by_key(|(k, _)| (*k).clone());
            let mut out = Map::new();
            for (k, v) in sorted {
                out.insert(k.clone(), canonical_json(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical_json).collect()),
        other => other.clone(),
    }
}

fn push_unique(names: &mut Vec<String>, name: String) {
    if !names.contains(&name) {
        names.push(name);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(
        name: &str,
        priority: i64,
        query: Value,
        projection: Option<&[&str]>,
    ) -> EvaluatedConfig {
        EvaluatedConfig {
            policy_name: name.to_owned(),
            priority,
            verbs: VerbSet::parse(&["GET".to_owned()]),
            schemas: TargetSet::parse(&["car".to_owned()]),
            endpoints: TargetSet::default(),
            query,
            projection: projection
                .map(|keys| ProjectionMap::from_fields(keys.iter().map(|k| (*k).to_owned()))),
        }
    }

    #[test]
    fn identical_queries_share_a_bucket() {
        let outcome = Outcome::merge(vec![
            config("P1", 0, json!({"make": "Ford"}), None),
            config("P2", 1, json!({"make": "Ford"}), None),
        ]);
        assert_eq!(outcome.buckets.len(), 1);
        assert_eq!(outcome.buckets[0].policies, vec!["P1", "P2"]);
    }

    #[test]
    fn query_only_configs_merge_by_or() {
        let outcome = Outcome::merge(vec![
            config("P1", 0, json!({"make": "Ford"}), None),
            config("P2", 1, json!({"make": "Opel"}), None),
        ]);
        assert_eq!(outcome.buckets.len(), 1);
        assert_eq!(
            outcome.buckets[0].query,
            json!({"$or": [{"make": "Ford"}, {"make": "Opel"}]})
        );
    }

    #[test]
    fn equal_queries_with_different_projections_stay_apart() {
        let outcome = Outcome::merge(vec![
            config("P1", 0, json!({"make": "Ford"}), Some(&["make"])),
            config("P2", 1, json!({"make": "Ford"}), None),
        ]);
        assert_eq!(outcome.buckets.len(), 2);
        assert!(outcome.buckets[0].projection.is_some());
        // P2's unrestricted field grant survives in its own bucket.
        assert!(outcome.buckets[1].projection.is_none());
        assert_eq!(outcome.buckets[1].policies, vec!["P2"]);
    }

    #[test]
    fn projection_difference_opens_a_new_bucket() {
        let outcome = Outcome::merge(vec![
            config("P1", 0, json!({"make": "Ford"}), Some(&["make"])),
            config("P2", 1, json!({"make": "Opel"}), None),
        ]);
        assert_eq!(outcome.buckets.len(), 2);
    }

    #[test]
    fn priority_orders_merging() {
        let outcome = Outcome::merge(vec![
            config("later", 5, json!({"make": "Opel"}), None),
            config("first", 0, json!({"make": "Ford"}), None),
        ]);
        assert_eq!(outcome.buckets[0].policies, vec!["first", "later"]);
        assert_eq!(
            outcome.buckets[0].query,
            json!({"$or": [{"make": "Ford"}, {"make": "Opel"}]})
        );
    }

    #[test]
    fn canonical_value_is_order_independent() {
        let a = Outcome::merge(vec![config(
            "P1",
            0,
            json!({"b": 1, "a": 2}),
            Some(&["make", "model"]),
        )]);
        let b = Outcome::merge(vec![config(
            "P1",
            0,
            json!({"a": 2, "b": 1}),
            Some(&["model", "make"]),
        )]);
        assert_eq!(a.canonical_value(), b.canonical_value());
    }
}
