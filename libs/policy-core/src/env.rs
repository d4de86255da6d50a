//! Environment reference resolution.
//!
//! Policies carry an `env` map of named values available to conditions and
//! queries. A reference is a dotted string (`env.teams.mine`); the leaf it
//! points at is either a plain value or a structured lookup
//! `{collection, query, output}` executed against the document store. Lookup
//! queries may themselves embed `env.*` references, so resolution is
//! recursive. Unresolved references yield null ("no match"); malformed
//! references and incomplete lookups error.

use std::future::Future;
use std::pin::Pin;

use serde_json::{Map, Value};

use crate::error::ResolveError;
use crate::filter::FilterExpr;
use crate::store::DocumentStore;

/// The reserved collection name resolving against the caller's own record.
pub const USER_COLLECTION: &str = "user";

const REF_PREFIX: &str = "env.";

/// How a structured lookup's results are shaped into a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputKind {
    /// First result's output field, as-is.
    String,
    /// First result's output field, cast to an identifier string.
    Id,
    /// Flattened list of the output field across all results.
    Array,
    /// True only if every result satisfies the output field.
    Boolean,
}

impl OutputKind {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "string" => Some(Self::String),
            "id" => Some(Self::Id),
            "array" => Some(Self::Array),
            "boolean" => Some(Self::Boolean),
            _ => None,
        }
    }
}

/// Resolves `env.*` references for one policy during one request.
pub struct EnvResolver<'a> {
    env: &'a Map<String, Value>,
    store: &'a dyn DocumentStore,
    caller: Option<&'a Value>,
}

impl<'a> EnvResolver<'a> {
    /// Create a resolver over a policy's env map.
    ///
    /// `caller` is the caller's stored identity record, consulted for lookups
    /// against the reserved `user` collection.
    #[must_use]
    pub fn new(
        env: &'a Map<String, Value>,
        store: &'a dyn DocumentStore,
        caller: Option<&'a Value>,
    ) -> Self {
        Self { env, store, caller }
    }

    /// Returns `true` if `value` is an `env.*` reference string.
    #[must_use]
    pub fn is_reference(value: &Value) -> bool {
        value.as_str().is_some_and(|s| s.starts_with(REF_PREFIX))
    }

    /// Resolve a dotted reference to its value.
    ///
    /// A reference pointing nowhere resolves to null; only a reference that
    /// does not start with `env.` is an error.
    ///
    /// # Errors
    ///
    /// [`ResolveError::MalformedReference`] for a non-`env.` reference,
    /// [`ResolveError::IncompleteLookup`] for a lookup missing a required
    /// part, [`ResolveError::Store`] if a scoped lookup fails.
    pub async fn resolve(&self, reference: &str) -> Result<Value, ResolveError> {
        let Some(path) = reference.strip_prefix(REF_PREFIX) else {
            return Err(ResolveError::MalformedReference(reference.to_owned()));
        };

        let mut current = self.env.get(path.split('.').next().unwrap_or(path));
        for segment in path.split('.').skip(1) {
            current = current.and_then(|v| v.as_object()).and_then(|m| m.get(segment));
        }
        let Some(leaf) = current else {
            return Ok(Value::Null);
        };

        if Self::is_reference(leaf) {
            // Cross-reference into another env entry.
            let reference = leaf.as_str().unwrap_or_default().to_owned();
            return self.resolve_boxed(reference).await;
        }
        if let Some(lookup) = as_lookup(leaf)? {
            return self.perform_lookup(lookup).await;
        }
        Ok(leaf.clone())
    }

    fn resolve_boxed(
        &self,
        reference: String,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ResolveError>> + Send + '_>> {
        Box::pin(async move { self.resolve(&reference).await })
    }

    /// Replace every embedded `env.*` string inside `value`, in place.
    ///
    /// # Errors
    ///
    /// Propagates resolution failures from scoped lookups.
    pub fn substitute<'b>(
        &'b self,
        value: &'b mut Value,
    ) -> Pin<Box<dyn Future<Output = Result<(), ResolveError>> + Send + 'b>> {
        Box::pin(async move {
            match value {
                Value::String(s) if s.starts_with(REF_PREFIX) => {
                    let resolved = self.resolve_boxed(s.clone()).await?;
                    *value = resolved;
                }
                Value::Array(items) => {
                    for item in items {
                        self.substitute(item).await?;
                    }
                }
                Value::Object(map) => {
                    for (_, item) in map.iter_mut() {
                        self.substitute(item).await?;
                    }
                }
                _ => {}
            }
            Ok(())
        })
    }

    async fn perform_lookup(&self, lookup: Lookup<'_>) -> Result<Value, ResolveError> {
        let Some(output) = lookup.output else {
            // Undefined output is "no match", not an error.
            return Ok(Value::Null);
        };

        let mut query = lookup.query.clone();
        self.substitute(&mut query).await?;
        let expr = FilterExpr::parse(&query)?;

        let results = if lookup.collection == USER_COLLECTION {
            match self.caller {
                Some(record) if expr.matches(record) => vec![record.clone()],
                _ => Vec::new(),
            }
        } else {
            self.store
                .find(lookup.collection, &expr.to_native())
                .await?
        };

        Ok(shape_results(&results, &output))
    }
}

struct Lookup<'v> {
    collection: &'v str,
    query: &'v Value,
    output: Option<Output>,
}

struct Output {
    field: Option<String>,
    kind: OutputKind,
}

/// Interpret a leaf as a structured lookup.
///
/// An object without a `collection` key is a plain value. One that names a
/// collection but lacks the other required parts is a broken lookup and
/// errors instead of leaking the raw lookup config as a resolved value.
fn as_lookup(leaf: &Value) -> Result<Option<Lookup<'_>>, ResolveError> {
    let Some(map) = leaf.as_object() else {
        return Ok(None);
    };
    let Some(collection) = map.get("collection") else {
        return Ok(None);
    };
    let collection = collection
        .as_str()
        .ok_or(ResolveError::IncompleteLookup("collection"))?;
    let query = map
        .get("query")
        .ok_or(ResolveError::IncompleteLookup("query"))?;
    let output = map.get("output").and_then(|o| {
        let out = o.as_object()?;
        let kind = OutputKind::parse(out.get("type")?.as_str()?)?;
        Some(Output {
            field: out.get("field").and_then(Value::as_str).map(str::to_owned),
            kind,
        })
    });
    Ok(Some(Lookup {
        collection,
        query,
        output,
    }))
}

fn shape_results(results: &[Value], output: &Output) -> Value {
    let field_of = |doc: &Value| -> Value {
        match &output.field {
            Some(field) => crate::filter::lookup_path(doc, field)
                .cloned()
                .unwrap_or(Value::Null),
            None => doc.clone(),
        }
    };

    match output.kind {
        OutputKind::String => results.first().map(field_of).unwrap_or(Value::Null),
        OutputKind::Id => match results.first().map(field_of) {
            Some(Value::String(s)) => Value::String(s),
            Some(Value::Number(n)) => Value::String(n.to_string()),
            _ => Value::Null,
        },
        OutputKind::Array => {
            let mut items = Vec::new();
            for doc in results {
                match field_of(doc) {
                    Value::Array(inner) => items.extend(inner),
                    Value::Null => {}
                    other => items.push(other),
                }
            }
            Value::Array(items)
        }
        OutputKind::Boolean => {
            Value::Bool(!results.is_empty() && results.iter().all(|doc| truthy(&field_of(doc))))
        }
    }
}

/// JSON truthiness: null, `false`, `0`, and `""` are falsy.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
