//! Filter trees: policy-author syntax, store-native syntax, and merging.
//!
//! Policy authors write `@`-prefixed operators and logical keys; the store
//! speaks `$`-prefixed ones. Both parse into the same typed [`FilterExpr`]
//! (`Leaf | And | Or`), built once at policy-load time and evaluated by
//! recursion — never by re-inspecting JSON shapes per request.
//!
//! The reserved `access` key carries sentinel grants (`%FULL_ACCESS%`,
//! `%APP_SCHEMA%`, `%CORE_SCHEMA%`) which are stripped from the filter rather
//! than treated as terms.

use serde_json::{Map, Value, json};

use crate::error::{DecisionError, ResolveError};
use crate::operator::{Operator, values_equal};

/// Sentinel: the config grants unrestricted access to its targets.
pub const FULL_ACCESS: &str = "%FULL_ACCESS%";
/// Sentinel: the config targets every application-owned schema.
pub const APP_SCHEMA: &str = "%APP_SCHEMA%";
/// Sentinel: the config targets every core (platform) schema.
pub const CORE_SCHEMA: &str = "%CORE_SCHEMA%";

/// The reserved key sentinels live under.
const ACCESS_KEY: &str = "access";

/// Access class carried by a stripped `access` sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessClass {
    Full,
    AppSchema,
    CoreSchema,
}

impl AccessClass {
    fn from_sentinel(s: &str) -> Option<Self> {
        match s {
            FULL_ACCESS => Some(Self::Full),
            APP_SCHEMA => Some(Self::AppSchema),
            CORE_SCHEMA => Some(Self::CoreSchema),
            _ => None,
        }
    }
}

/// Logical combinator for [`merge_query_filters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

impl LogicalOp {
    /// The store-native key for this combinator.
    #[must_use]
    pub fn native(self) -> &'static str {
        match self {
            Self::And => "$and",
            Self::Or => "$or",
        }
    }
}

/// A typed filter tree.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr {
    /// All children must match.
    And(Vec<FilterExpr>),
    /// At least one child must match.
    Or(Vec<FilterExpr>),
    /// A single field comparison.
    Leaf {
        field: String,
        op: Operator,
        value: Value,
    },
}

/// A policy config's query after parsing: the filter tree (if any terms
/// remain) plus the access class stripped from the reserved `access` key.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyQuery {
    pub expr: Option<FilterExpr>,
    pub access: Option<AccessClass>,
}

impl PolicyQuery {
    /// Parse a policy-author filter object.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] on malformed trees or unknown operators.
    pub fn parse(value: &Value) -> Result<Self, ResolveError> {
        let Some(map) = value.as_object() else {
            if value.is_null() {
                return Ok(Self {
                    expr: None,
                    access: None,
                });
            }
            return Err(ResolveError::MalformedTree(
                "filter root must be an object".to_owned(),
            ));
        };

        let mut access = None;
        let mut stripped = Map::new();
        for (key, val) in map {
            if key == ACCESS_KEY {
                if let Some(class) = val.as_str().and_then(AccessClass::from_sentinel) {
                    access = Some(class);
                    continue;
                }
            }
            stripped.insert(key.clone(), val.clone());
        }

        let expr = if stripped.is_empty() {
            None
        } else {
            Some(FilterExpr::parse(&Value::Object(stripped))?)
        };
        Ok(Self { expr, access })
    }

    /// Returns `true` when this query imposes no restriction at all.
    #[must_use]
    pub fn is_unrestricted(&self) -> bool {
        self.expr.is_none()
    }
}

impl FilterExpr {
    /// Parse a filter object in either syntax (`@` or `$` prefixed).
    ///
    /// Accepted shapes:
    /// - `{"@and": [ ... ]}` / `{"@or": [ ... ]}` — logical nodes
    /// - `{"@eq": {"make": "Ford"}}` — operator over a field map
    /// - `{"age": {"@gt": 18}}` — field with operator object
    /// - `{"make": "Ford"}` — bare equality
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] on non-object roots, unknown operators, or
    /// logical keys without an array of children.
    pub fn parse(value: &Value) -> Result<Self, ResolveError> {
        let Some(map) = value.as_object() else {
            return Err(ResolveError::MalformedTree(
                "filter node must be an object".to_owned(),
            ));
        };

        let mut nodes = Vec::new();
        for (key, val) in map {
            nodes.push(Self::parse_entry(key, val)?);
        }
        Ok(Self::combine_and(nodes))
    }

    fn parse_entry(key: &str, val: &Value) -> Result<Self, ResolveError> {
        if let Some(logical) = logical_key(key) {
            let Some(children) = val.as_array() else {
                return Err(ResolveError::MalformedTree(format!(
                    "'{key}' expects an array of sub-filters"
                )));
            };
            let parsed = children.iter().map(Self::parse).collect::<Result<_, _>>()?;
            return Ok(match logical {
                LogicalOp::And => Self::And(parsed),
                LogicalOp::Or => Self::Or(parsed),
            });
        }

        if Operator::is_operator_key(key) {
            let op = Operator::parse(key)?;
            let Some(fields) = val.as_object() else {
                return Err(ResolveError::MalformedTree(format!(
                    "operator '{key}' expects a field map"
                )));
            };
            let leaves = fields
                .iter()
                .map(|(field, operand)| Self::Leaf {
                    field: field.clone(),
                    op,
                    value: operand.clone(),
                })
                .collect();
            return Ok(Self::combine_and(leaves));
        }

        // Field key: either an operator object or a bare equality.
        if let Some(inner) = val.as_object()
            && !inner.is_empty()
            && inner.keys().all(|k| Operator::is_operator_key(k))
        {
            let leaves = inner
                .iter()
                .map(|(op_key, operand)| {
                    Operator::parse(op_key).map(|op| Self::Leaf {
                        field: key.to_owned(),
                        op,
                        value: operand.clone(),
                    })
                })
                .collect::<Result<_, _>>()?;
            return Ok(Self::combine_and(leaves));
        }

        Ok(Self::Leaf {
            field: key.to_owned(),
            op: Operator::Eq,
            value: val.clone(),
        })
    }

    fn combine_and(mut nodes: Vec<Self>) -> Self {
        if nodes.len() == 1 {
            nodes.remove(0)
        } else {
            Self::And(nodes)
        }
    }

    /// Render this tree into the store's native (`$`-prefixed) filter syntax.
    ///
    /// Bare equality is emitted as `{field: value}` (the store's shorthand);
    /// other operators nest as `{field: {"$op": value}}`.
    #[must_use]
    pub fn to_native(&self) -> Value {
        match self {
            Self::Leaf { field, op, value } => {
                if matches!(op, Operator::Eq) {
                    json!({ field.clone(): value.clone() })
                } else {
                    json!({ field.clone(): { op.native(): value.clone() } })
                }
            }
            Self::And(children) => {
                let mut acc = Map::new();
                for child in children {
                    if let Value::Object(entries) = child.to_native() {
                        for (key, val) in entries {
                            merge_native_key(&mut acc, key, val);
                        }
                    }
                }
                Value::Object(acc)
            }
            Self::Or(children) => {
                json!({ "$or": children.iter().map(Self::to_native).collect::<Vec<_>>() })
            }
        }
    }

    /// Evaluate this tree against a full entity document.
    ///
    /// AND nodes pass only when every child passes; OR nodes pass when any
    /// child does, independently of sibling AND failures. Missing fields
    /// resolve to null and fail the leaf (fail-closed).
    #[must_use]
    pub fn matches(&self, entity: &Value) -> bool {
        match self {
            Self::And(children) => children.iter().all(|c| c.matches(entity)),
            Self::Or(children) => children.iter().any(|c| c.matches(entity)),
            Self::Leaf { field, op, value } => {
                let left = lookup_path(entity, field);
                op.evaluate(left.unwrap_or(&Value::Null), value)
            }
        }
    }
}

/// Resolve a dotted path inside an entity document.
#[must_use]
pub fn lookup_path<'a>(entity: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = entity;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn logical_key(key: &str) -> Option<LogicalOp> {
    match key {
        "@and" | "$and" => Some(LogicalOp::And),
        "@or" | "$or" => Some(LogicalOp::Or),
        _ => None,
    }
}

/// Returns `true` for a filter that imposes no restriction (null or `{}`).
#[must_use]
pub fn is_empty_filter(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Merge one translated top-level key into an accumulating native filter.
///
/// - absent key → inserted
/// - both arrays → unioned, deduplicated by deep equality
/// - both objects → merged key-by-key; array-valued operators (`$in`/`$nin`)
///   are concatenated and deduplicated rather than overwritten
/// - anything else → the values are pushed under `$and` so neither is lost
pub fn merge_native_key(acc: &mut Map<String, Value>, key: String, val: Value) {
    let Some(existing) = acc.get_mut(&key) else {
        acc.insert(key, val);
        return;
    };

    match (existing, val) {
        (Value::Array(have), Value::Array(incoming)) => {
            union_dedup(have, incoming);
        }
        (Value::Object(have), Value::Object(incoming)) => {
            for (inner_key, inner_val) in incoming {
                match (have.get_mut(&inner_key), inner_val) {
                    (Some(Value::Array(have_arr)), Value::Array(incoming_arr))
                        if inner_key == "$in" || inner_key == "$nin" =>
                    {
                        union_dedup(have_arr, incoming_arr);
                    }
                    (_, other) => {
                        have.insert(inner_key, other);
                    }
                }
            }
        }
        (existing, incoming) => {
            if *existing == incoming {
                return;
            }
            let first = std::mem::take(existing);
            let clauses = vec![json!({ key.clone(): first }), json!({ key.clone(): incoming })];
            // Re-home the conflicting values under $and.
            acc.remove(&key);
            match acc.get_mut("$and") {
                Some(Value::Array(and_clauses)) => and_clauses.extend(clauses),
                _ => {
                    acc.insert("$and".to_owned(), Value::Array(clauses));
                }
            }
        }
    }
}

fn union_dedup(have: &mut Vec<Value>, incoming: Vec<Value>) {
    for item in incoming {
        if !have.iter().any(|existing| values_equal(existing, &item)) {
            have.push(item);
        }
    }
}

/// Merge two native filters under a logical operator.
///
/// If either side is empty, the other is returned unchanged. Otherwise both
/// are wrapped under `op`, flattening a side that already uses the same
/// operator as its only key. Clauses are deduplicated by deep equality, so
/// re-merging an identical filter never accumulates duplicates.
#[must_use]
pub fn merge_query_filters(base: Value, additional: Value, op: LogicalOp) -> Value {
    if is_empty_filter(&base) {
        return additional;
    }
    if is_empty_filter(&additional) {
        return base;
    }
    if base == additional {
        return base;
    }

    let mut clauses: Vec<Value> = Vec::new();
    for side in [base, additional] {
        let incoming = match flatten_under(&side, op) {
            Some(existing) => existing,
            None => vec![side],
        };
        union_dedup(&mut clauses, incoming);
    }
    json!({ op.native(): clauses })
}

/// If `filter` is exactly `{"$op": [..]}` for the given op, return its clauses.
fn flatten_under(filter: &Value, op: LogicalOp) -> Option<Vec<Value>> {
    let map = filter.as_object()?;
    if map.len() != 1 {
        return None;
    }
    map.get(op.native())?.as_array().cloned()
}

/// Apply a built policy filter on top of the caller's own requested filter.
///
/// - An empty caller filter is replaced by the policy filter outright.
/// - A key present on both sides with differing values is a query violation
///   (fail-closed; conflicts are never silently resolved).
/// - Logical-operator arrays present on both sides are cross-checked entry by
///   entry; policy entries the caller lacks are merged in.
///
/// # Errors
///
/// Returns [`DecisionError::QueryViolation`] naming the conflicting key.
pub fn apply_policy_filter(caller: &Value, policy: &Value) -> Result<Value, DecisionError> {
    if is_empty_filter(caller) {
        return Ok(policy.clone());
    }
    if is_empty_filter(policy) {
        return Ok(caller.clone());
    }

    let mut merged = caller
        .as_object()
        .cloned()
        .unwrap_or_default();
    let policy_map = policy.as_object().cloned().unwrap_or_default();

    for (key, policy_val) in policy_map {
        if key == "$and" || key == "$or" {
            match merged.get_mut(&key) {
                Some(Value::Array(caller_clauses)) => {
                    let policy_clauses = policy_val.as_array().cloned().unwrap_or_default();
                    merge_logical_clauses(caller_clauses, policy_clauses)?;
                }
                _ => {
                    merged.insert(key, policy_val);
                }
            }
            continue;
        }

        match merged.get(&key) {
            None => {
                merged.insert(key, policy_val);
            }
            Some(existing) if values_equal(existing, &policy_val) => {}
            Some(_) => {
                return Err(DecisionError::QueryViolation { key });
            }
        }
    }

    Ok(Value::Object(merged))
}

/// Cross-check logical clause arrays key by key.
///
/// A key the caller constrains differently from the policy is a violation;
/// clauses the caller lacks entirely give the policy priority by being merged
/// in.
fn merge_logical_clauses(
    caller_clauses: &mut Vec<Value>,
    policy_clauses: Vec<Value>,
) -> Result<(), DecisionError> {
    for policy_clause in policy_clauses {
        let Some(policy_entries) = policy_clause.as_object() else {
            caller_clauses.push(policy_clause);
            continue;
        };

        let mut seen = false;
        for (key, policy_val) in policy_entries {
            for caller_clause in caller_clauses.iter() {
                if let Some(caller_val) = caller_clause.get(key) {
                    seen = true;
                    if !values_equal(caller_val, policy_val) {
                        return Err(DecisionError::QueryViolation { key: key.clone() });
                    }
                }
            }
        }
        if !seen {
            caller_clauses.push(policy_clause);
        }
    }
    Ok(())
}
