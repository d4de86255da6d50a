//! Field projection enforcement.
//!
//! A config's projection restricts which fields a caller may read or write.
//! Enforcement depends on the verb class:
//!
//! - read: the allowed set becomes the response projection
//! - create: submitted fields outside the set are reset to schema defaults
//! - update: every mutated path must prefix-match an allowed key, or the
//!   whole request is rejected (no partial application)
//! - other: the caller's own filter must not reference outside fields

use std::collections::BTreeSet;

use serde_json::{Map, Value};

use crate::error::DecisionError;
use crate::policy::{Projection, ProjectionAccess};

/// The concrete set of field paths a config exposes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProjectionMap {
    fields: BTreeSet<String>,
}

impl ProjectionMap {
    /// Compute the allowed field set for a projection.
    ///
    /// For a deny-list projection the schema's full field list is required;
    /// without it the projection cannot be computed and the config must be
    /// dropped from the applicable set — hence `None`.
    #[must_use]
    pub fn compute(projection: &Projection, schema_fields: Option<&[String]>) -> Option<Self> {
        match projection.access {
            ProjectionAccess::Allow => Some(Self {
                fields: projection.keys.iter().cloned().collect(),
            }),
            ProjectionAccess::Deny => {
                let all = schema_fields?;
                let denied: BTreeSet<&String> = projection.keys.iter().collect();
                Some(Self {
                    fields: all
                        .iter()
                        .filter(|f| !denied.contains(f))
                        .cloned()
                        .collect(),
                })
            }
        }
    }

    /// Build directly from a list of allowed fields.
    #[must_use]
    pub fn from_fields(fields: impl IntoIterator<Item = String>) -> Self {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    /// The allowed field paths.
    #[must_use]
    pub fn fields(&self) -> &BTreeSet<String> {
        &self.fields
    }

    /// Is the dotted path covered by the allowed set (exact or by prefix)?
    #[must_use]
    pub fn allows_path(&self, path: &str) -> bool {
        self.fields.iter().any(|key| {
            path == key || path.strip_prefix(key.as_str()).is_some_and(|r| r.starts_with('.'))
        })
    }

    /// The store-facing inclusion map (`{"make": 1, "model": 1}`).
    #[must_use]
    pub fn to_inclusion(&self) -> Value {
        let mut map = Map::new();
        for field in &self.fields {
            map.insert(field.clone(), Value::from(1));
        }
        Value::Object(map)
    }
}

/// Reset submitted fields outside the allowed set to their schema defaults.
///
/// Create-like verbs never reject on projection; disallowed fields are
/// silently replaced by the schema default (or removed when none exists).
pub fn enforce_create(
    payload: &mut Value,
    allowed: &ProjectionMap,
    defaults: &Map<String, Value>,
) {
    let Some(map) = payload.as_object_mut() else {
        return;
    };
    let submitted: Vec<String> = map.keys().cloned().collect();
    for field in submitted {
        if allowed.allows_path(&field) {
            continue;
        }
        match defaults.get(&field) {
            Some(default) => {
                map.insert(field, default.clone());
            }
            None => {
                map.remove(&field);
            }
        }
    }
}

/// Reject the update if any mutated path falls outside the allowed set.
///
/// # Errors
///
/// [`DecisionError::ProjectionViolation`] — the whole request fails, no
/// partial application.
pub fn enforce_update(payload: &Value, allowed: &ProjectionMap) -> Result<(), DecisionError> {
    let mut paths = Vec::new();
    collect_leaf_paths(payload, String::new(), &mut paths);
    for path in &paths {
        if !allowed.allows_path(path) {
            return Err(DecisionError::ProjectionViolation);
        }
    }
    Ok(())
}

/// Reject the request if its filter references a field outside the allowed
/// set. Walks logical-operator arrays and flat keys.
///
/// # Errors
///
/// [`DecisionError::ProjectionViolation`].
pub fn enforce_filter_fields(
    filter: &Value,
    allowed: &ProjectionMap,
) -> Result<(), DecisionError> {
    let Some(map) = filter.as_object() else {
        return Ok(());
    };
    for (key, val) in map {
        if key == "$and" || key == "$or" {
            for clause in val.as_array().into_iter().flatten() {
                enforce_filter_fields(clause, allowed)?;
            }
            continue;
        }
        if key.starts_with('$') {
            continue;
        }
        if !allowed.allows_path(key) {
            return Err(DecisionError::ProjectionViolation);
        }
    }
    Ok(())
}

/// Flatten a payload into dotted leaf paths (`{"a": {"b": 1}}` → `a.b`).
fn collect_leaf_paths(value: &Value, prefix: String, out: &mut Vec<String>) {
    match value.as_object() {
        Some(map) if !map.is_empty() => {
            for (key, val) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                collect_leaf_paths(val, path, out);
            }
        }
        _ => {
            if !prefix.is_empty() {
                out.push(prefix);
            }
        }
    }
}
