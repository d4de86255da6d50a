//! Policy documents and their load-time typed form.
//!
//! Policies arrive as JSON from the administrative API. They are parsed once
//! into typed trees here; request-time evaluation never re-inspects raw JSON
//! shapes.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::condition::ConditionExpr;
use crate::error::ResolveError;
use crate::filter::{APP_SCHEMA, CORE_SCHEMA, PolicyQuery};
use crate::operator::Operator;

/// Wildcard verb/target entry.
const ALL: &str = "all";

/// Verb classification used by projection enforcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerbClass {
    Read,
    Create,
    Update,
    Delete,
    Other,
}

impl VerbClass {
    /// Classify an HTTP-style verb.
    #[must_use]
    pub fn of(verb: &str) -> Self {
        match verb.to_ascii_uppercase().as_str() {
            "GET" => Self::Read,
            "POST" => Self::Create,
            "PUT" | "PATCH" => Self::Update,
            "DELETE" => Self::Delete,
            _ => Self::Other,
        }
    }
}

/// A set of verbs a config targets, possibly the wildcard "all".
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VerbSet {
    verbs: BTreeSet<String>,
    all: bool,
}

impl VerbSet {
    /// Parse from the policy document's verb list.
    #[must_use]
    pub fn parse(entries: &[String]) -> Self {
        let mut set = Self::default();
        for entry in entries {
            if entry.eq_ignore_ascii_case(ALL) || entry == "*" {
                set.all = true;
            } else {
                set.verbs.insert(entry.to_ascii_uppercase());
            }
        }
        set
    }

    /// Does this set cover the given verb?
    #[must_use]
    pub fn matches(&self, verb: &str) -> bool {
        self.all || self.verbs.contains(&verb.to_ascii_uppercase())
    }

    /// Is this set a superset of `other`?
    #[must_use]
    pub fn is_superset(&self, other: &Self) -> bool {
        self.all || (!other.all && other.verbs.is_subset(&self.verbs))
    }

    /// The explicit verbs (empty when the wildcard is set).
    #[must_use]
    pub fn verbs(&self) -> &BTreeSet<String> {
        &self.verbs
    }

    /// Whether the wildcard is set.
    #[must_use]
    pub fn is_all(&self) -> bool {
        self.all
    }
}

/// A set of schema or endpoint targets, with wildcards for "everything",
/// "every application schema", and "every core schema".
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TargetSet {
    entries: BTreeSet<String>,
    all: bool,
    app_wildcard: bool,
    core_wildcard: bool,
}

impl TargetSet {
    /// Parse from the policy document's target list.
    #[must_use]
    pub fn parse(entries: &[String]) -> Self {
        let mut set = Self::default();
        for entry in entries {
            match entry.as_str() {
                "*" => set.all = true,
                APP_SCHEMA => set.app_wildcard = true,
                CORE_SCHEMA => set.core_wildcard = true,
                name if name.eq_ignore_ascii_case(ALL) => set.all = true,
                name => {
                    set.entries.insert(name.to_owned());
                }
            }
        }
        set
    }

    /// Does this set cover the named target? `core` says whether the target
    /// belongs to the platform's core schema set.
    #[must_use]
    pub fn matches(&self, name: &str, core: bool) -> bool {
        self.all
            || (core && self.core_wildcard)
            || (!core && self.app_wildcard)
            || self.entries.contains(name)
    }

    /// Is this set a superset of `other`?
    #[must_use]
    pub fn is_superset(&self, other: &Self) -> bool {
        if self.all {
            return true;
        }
        if other.all {
            return false;
        }
        (!other.app_wildcard || self.app_wildcard)
            && (!other.core_wildcard || self.core_wildcard)
            && other.entries.is_subset(&self.entries)
    }

    /// Explicit entries (without wildcards).
    #[must_use]
    pub fn entries(&self) -> &BTreeSet<String> {
        &self.entries
    }

    /// True when no entries and no wildcards were given.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.all && !self.app_wildcard && !self.core_wildcard && self.entries.is_empty()
    }

    /// The declared target list in normalized form, wildcards included.
    #[must_use]
    pub fn tokens(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.all {
            out.push("*".to_owned());
        }
        if self.app_wildcard {
            out.push(APP_SCHEMA.to_owned());
        }
        if self.core_wildcard {
            out.push(CORE_SCHEMA.to_owned());
        }
        out.extend(self.entries.iter().cloned());
        out
    }
}

/// Field projection declared by a policy config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
    /// Field paths the config exposes.
    pub keys: Vec<String>,
    /// Whether `keys` is an allow-list or a deny-list.
    pub access: ProjectionAccess,
}

/// Interpretation of a projection's key list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectionAccess {
    #[default]
    Allow,
    Deny,
}

/// One selection test: attribute key → operator + right-hand value.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionTest {
    pub op: Operator,
    pub value: Value,
}

/// Predicate matching a policy to a token's attributes.
///
/// Every key must be present in the token's `policyProperties` and satisfy
/// its test for the policy to match. The reserved `#tokenType` and `id` keys
/// address data-sharing tokens directly.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Selection {
    pub tests: Vec<(String, SelectionTest)>,
}

/// The reserved selection key naming a token kind.
pub const SELECT_TOKEN_TYPE: &str = "#tokenType";
/// The reserved selection key naming a token id.
pub const SELECT_TOKEN_ID: &str = "id";

/// One rule within a policy.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyConfig {
    pub verbs: VerbSet,
    pub schemas: TargetSet,
    pub endpoints: TargetSet,
    /// Outer-AND condition array.
    pub conditions: Vec<ConditionExpr>,
    pub query: PolicyQuery,
    pub projection: Option<Projection>,
}

impl PolicyConfig {
    /// Does this config target the given verb + schema pair?
    #[must_use]
    pub fn targets(&self, verb: &str, schema: &str, core_schema: bool) -> bool {
        self.verbs.matches(verb) && self.schemas.matches(schema, core_schema)
    }
}

/// A named, prioritized rule bundle owned by one application.
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    pub name: String,
    /// Lower sorts first.
    pub priority: i64,
    pub app_id: Uuid,
    pub selection: Selection,
    /// Named values available to conditions and queries.
    pub env: Map<String, Value>,
    pub configs: Vec<PolicyConfig>,
    /// Expiry instant; the policy is auto-deleted shortly before it elapses.
    pub limit: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct RawPolicy {
    name: String,
    #[serde(default)]
    priority: i64,
    #[serde(rename = "appId")]
    app_id: Uuid,
    #[serde(default)]
    selection: Map<String, Value>,
    #[serde(default)]
    env: Map<String, Value>,
    #[serde(default)]
    config: Vec<RawConfig>,
    #[serde(default)]
    limit: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct RawConfig {
    #[serde(default)]
    verbs: Vec<String>,
    #[serde(default, rename = "schema")]
    schemas: Vec<String>,
    #[serde(default)]
    endpoints: Vec<String>,
    #[serde(default)]
    conditions: Vec<Value>,
    #[serde(default)]
    query: Value,
    #[serde(default)]
    projection: Option<RawProjection>,
}

#[derive(Deserialize)]
struct RawProjection {
    #[serde(default)]
    keys: Vec<String>,
    #[serde(default)]
    access: ProjectionAccess,
}

impl Policy {
    /// Parse a policy document, building all typed trees up front.
    ///
    /// # Errors
    ///
    /// [`ResolveError::MalformedTree`] for a document that does not
    /// deserialize, plus any condition/filter parse failure.
    pub fn from_document(doc: &Value) -> Result<Self, ResolveError> {
        let raw: RawPolicy = serde_json::from_value(doc.clone())
            .map_err(|e| ResolveError::MalformedTree(e.to_string()))?;

        let selection = parse_selection(&raw.selection)?;
        let configs = raw
            .config
            .iter()
            .map(parse_config)
            .collect::<Result<_, _>>()?;

        Ok(Self {
            name: raw.name,
            priority: raw.priority,
            app_id: raw.app_id,
            selection,
            env: raw.env,
            configs,
            limit: raw.limit,
        })
    }
}

fn parse_selection(raw: &Map<String, Value>) -> Result<Selection, ResolveError> {
    let mut tests = Vec::new();
    for (key, val) in raw {
        let test = match val.as_object() {
            Some(map) if map.len() == 1 => {
                let (op_key, operand) = map.iter().next().ok_or_else(|| {
                    ResolveError::MissingOperator(key.clone())
                })?;
                SelectionTest {
                    op: Operator::parse(op_key)?,
                    value: operand.clone(),
                }
            }
            // Bare value → equality test
            _ => SelectionTest {
                op: Operator::Eq,
                value: val.clone(),
            },
        };
        tests.push((key.clone(), test));
    }
    Ok(Selection { tests })
}

fn parse_config(raw: &RawConfig) -> Result<PolicyConfig, ResolveError> {
    let conditions = raw
        .conditions
        .iter()
        .map(ConditionExpr::parse)
        .collect::<Result<_, _>>()?;
    Ok(PolicyConfig {
        verbs: VerbSet::parse(&raw.verbs),
        schemas: TargetSet::parse(&raw.schemas),
        endpoints: TargetSet::parse(&raw.endpoints),
        conditions,
        query: PolicyQuery::parse(&raw.query)?,
        projection: raw.projection.as_ref().map(|p| Projection {
            keys: p.keys.clone(),
            access: p.access,
        }),
    })
}

/// A [`PolicyConfig`] proven relevant to the current request, paired with its
/// policy. Ephemeral, recomputed per request.
#[derive(Debug, Clone)]
pub struct ApplicablePolicy {
    pub policy: Arc<Policy>,
    pub config_index: usize,
}

impl ApplicablePolicy {
    /// The underlying config.
    ///
    /// # Panics
    ///
    /// Never — the index is produced by iterating the same config list.
    #[must_use]
    pub fn config(&self) -> &PolicyConfig {
        &self.policy.configs[self.config_index]
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use serde_json::json;

    const APP: &str = "11111111-1111-1111-1111-111111111111";

    #[test]
    fn parses_a_full_document() {
        let policy = Policy::from_document(&json!({
            "name": "P1",
            "priority": 0,
            "appId": APP,
            "selection": {"role": {"@eq": "ADMIN"}},
            "env": {"team": "core"},
            "config": [{
                "verbs": ["GET"],
                "schema": ["car"],
                "conditions": [{"date": {"@gt": "2026-01-01T00:00:00Z"}}],
                "query": {"@eq": {"make": "Ford"}},
                "projection": {"keys": ["make", "model"]}
            }],
            "limit": "2027-01-01T00:00:00Z"
        }))
        .unwrap();

        assert_eq!(policy.name, "P1");
        assert_eq!(policy.configs.len(), 1);
        let config = &policy.configs[0];
        assert!(config.targets("GET", "car", false));
        assert!(!config.targets("POST", "car", false));
        assert!(!config.targets("GET", "bike", false));
        assert_eq!(config.conditions.len(), 1);
        assert!(config.projection.is_some());
        assert!(policy.limit.is_some());
    }

    #[test]
    fn malformed_condition_rejects_the_document() {
        let err = Policy::from_document(&json!({
            "name": "bad",
            "appId": APP,
            "config": [{"conditions": [{"role": "no-operator"}]}]
        }))
        .unwrap_err();
        assert!(matches!(err, ResolveError::MissingOperator(_)));
    }

    #[test]
    fn verb_set_wildcard_and_supersets() {
        let all = VerbSet::parse(&["all".to_owned()]);
        assert!(all.matches("GET"));
        assert!(all.matches("DELETE"));

        let some = VerbSet::parse(&["get".to_owned(), "POST".to_owned()]);
        assert!(some.matches("GET"));
        assert!(!some.matches("DELETE"));
        assert!(all.is_superset(&some));
        assert!(!some.is_superset(&all));
        assert!(some.is_superset(&VerbSet::parse(&["GET".to_owned()])));
    }

    #[test]
    fn target_set_wildcards() {
        let apps = TargetSet::parse(&[APP_SCHEMA.to_owned()]);
        assert!(apps.matches("car", false));
        assert!(!apps.matches("account", true));

        let core = TargetSet::parse(&[CORE_SCHEMA.to_owned()]);
        assert!(core.matches("account", true));
        assert!(!core.matches("car", false));

        let named = TargetSet::parse(&["car".to_owned()]);
        assert!(named.matches("car", false));
        assert!(named.matches("car", true));
        assert!(!named.matches("bike", false));
    }

    #[test]
    fn verb_class_mapping() {
        assert_eq!(VerbClass::of("get"), VerbClass::Read);
        assert_eq!(VerbClass::of("POST"), VerbClass::Create);
        assert_eq!(VerbClass::of("PATCH"), VerbClass::Update);
        assert_eq!(VerbClass::of("DELETE"), VerbClass::Delete);
        assert_eq!(VerbClass::of("SEARCH"), VerbClass::Other);
    }
}
