//! Condition trees gating whether a policy config applies.
//!
//! A config carries an array of condition trees; the array is an outer AND.
//! Each tree is `AND`/`OR` nodes over leaves: `location` (client IP),
//! `date`/`time` (against now), an env-bound key, or a `query.<schema>`
//! store lookup whose truthiness is "count > 0" — the one point where
//! condition evaluation performs I/O.
//!
//! Trees are parsed once at policy-load time; evaluation recurses over the
//! typed tree.

use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::env::EnvResolver;
use crate::error::ResolveError;
use crate::filter::FilterExpr;
use crate::operator::Operator;
use crate::store::DocumentStore;

/// Prefix marking a store-backed condition leaf (`query.<schema>`).
const QUERY_PREFIX: &str = "query.";

/// Per-request facts conditions compare against.
#[derive(Debug, Clone)]
pub struct ConditionContext {
    /// The caller's resolved client IP, if any.
    pub client_ip: Option<IpAddr>,
    /// The evaluation instant.
    pub now: DateTime<Utc>,
}

impl ConditionContext {
    /// Context for "now" without a client address.
    #[must_use]
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            client_ip: None,
            now,
        }
    }
}

impl Default for ConditionContext {
    fn default() -> Self {
        Self::at(Utc::now())
    }
}

/// A typed condition tree.
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionExpr {
    /// All children must pass.
    And(Vec<ConditionExpr>),
    /// At least one child must pass.
    Or(Vec<ConditionExpr>),
    Leaf(ConditionLeaf),
}

/// A single condition predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionLeaf {
    /// Compare the caller's client IP.
    Location { op: Operator, value: Value },
    /// Compare an instant against now.
    Date { op: Operator, value: Value },
    /// Compare a time-of-day against now.
    Time { op: Operator, value: Value },
    /// Compare a resolved env value.
    Env {
        key: String,
        op: Operator,
        value: Value,
    },
    /// Pass when the schema's collection has at least one match.
    StoreQuery { schema: String, query: Value },
}

impl ConditionExpr {
    /// Parse one condition tree from its JSON form.
    ///
    /// # Errors
    ///
    /// [`ResolveError::MissingOperator`] for a leaf without an operator,
    /// [`ResolveError::MalformedTree`] for unexpected shapes.
    pub fn parse(value: &Value) -> Result<Self, ResolveError> {
        let Some(map) = value.as_object() else {
            return Err(ResolveError::MalformedTree(
                "condition node must be an object".to_owned(),
            ));
        };

        let mut nodes = Vec::new();
        for (key, val) in map {
            nodes.push(Self::parse_entry(key, val)?);
        }
        if nodes.len() == 1 {
            Ok(nodes.remove(0))
        } else {
            Ok(Self::And(nodes))
        }
    }

    fn parse_entry(key: &str, val: &Value) -> Result<Self, ResolveError> {
        match key.to_ascii_uppercase().as_str() {
            "AND" => return Ok(Self::And(Self::parse_children(val)?)),
            "OR" => return Ok(Self::Or(Self::parse_children(val)?)),
            _ => {}
        }

        if let Some(schema) = key.strip_prefix(QUERY_PREFIX) {
            return Ok(Self::Leaf(ConditionLeaf::StoreQuery {
                schema: schema.to_owned(),
                query: val.clone(),
            }));
        }

        let (op, operand) = single_operator(key, val)?;
        let leaf = match key {
            "location" => ConditionLeaf::Location { op, value: operand },
            "date" => ConditionLeaf::Date { op, value: operand },
            "time" => ConditionLeaf::Time { op, value: operand },
            other => ConditionLeaf::Env {
                key: other.to_owned(),
                op,
                value: operand,
            },
        };
        Ok(Self::Leaf(leaf))
    }

    fn parse_children(val: &Value) -> Result<Vec<Self>, ResolveError> {
        let Some(children) = val.as_array() else {
            return Err(ResolveError::MalformedTree(
                "logical condition expects an array of children".to_owned(),
            ));
        };
        children.iter().map(Self::parse).collect()
    }

    /// Evaluate this tree: AND children all pass, OR children any passes.
    ///
    /// # Errors
    ///
    /// Propagates env resolution and store failures.
    pub fn evaluate<'a>(
        &'a self,
        ctx: &'a ConditionContext,
        env: &'a EnvResolver<'a>,
        store: &'a dyn DocumentStore,
    ) -> Pin<Box<dyn Future<Output = Result<bool, ResolveError>> + Send + 'a>> {
        Box::pin(async move {
            match self {
                Self::And(children) => {
                    for child in children {
                        if !child.evaluate(ctx, env, store).await? {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
                Self::Or(children) => {
                    for child in children {
                        if child.evaluate(ctx, env, store).await? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
                Self::Leaf(leaf) => leaf.evaluate(ctx, env, store).await,
            }
        })
    }
}

impl ConditionLeaf {
    async fn evaluate(
        &self,
        ctx: &ConditionContext,
        env: &EnvResolver<'_>,
        store: &dyn DocumentStore,
    ) -> Result<bool, ResolveError> {
        match self {
            Self::Location { op, value } => {
                let left = ctx
                    .client_ip
                    .map_or(Value::Null, |ip| Value::String(ip.to_string()));
                let right = resolved_operand(env, value).await?;
                Ok(op.evaluate(&left, &right))
            }
            Self::Date { op, value } => {
                let left = Value::String(ctx.now.to_rfc3339());
                let right = resolved_operand(env, value).await?;
                Ok(as_date_variant(*op).evaluate(&left, &right))
            }
            Self::Time { op, value } => {
                let left = Value::String(ctx.now.format("%H:%M:%S").to_string());
                let right = resolved_operand(env, value).await?;
                Ok(as_date_variant(*op).evaluate(&left, &right))
            }
            Self::Env { key, op, value } => {
                let left = env.resolve(&format!("env.{key}")).await?;
                let right = resolved_operand(env, value).await?;
                Ok(op.evaluate(&left, &right))
            }
            Self::StoreQuery { schema, query } => {
                let mut filter = query.clone();
                env.substitute(&mut filter).await?;
                let expr = FilterExpr::parse(&filter)?;
                let count = store.count(schema, &expr.to_native()).await?;
                Ok(count > 0)
            }
        }
    }
}

/// Run a config's outer-AND condition array.
///
/// # Errors
///
/// Propagates env resolution and store failures.
pub async fn all_pass(
    conditions: &[ConditionExpr],
    ctx: &ConditionContext,
    env: &EnvResolver<'_>,
    store: &dyn DocumentStore,
) -> Result<bool, ResolveError> {
    for condition in conditions {
        if !condition.evaluate(ctx, env, store).await? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Extract the single `{op: operand}` pair a leaf must carry.
fn single_operator(key: &str, val: &Value) -> Result<(Operator, Value), ResolveError> {
    let Some(map) = val.as_object() else {
        return Err(ResolveError::MissingOperator(key.to_owned()));
    };
    let mut entries = map.iter();
    let Some((op_key, operand)) = entries.next() else {
        return Err(ResolveError::MissingOperator(key.to_owned()));
    };
    if entries.next().is_some() {
        return Err(ResolveError::MalformedTree(format!(
            "condition leaf '{key}' must carry exactly one operator"
        )));
    }
    Ok((Operator::parse(op_key)?, operand.clone()))
}

/// Substitute an env reference operand; plain values pass through.
async fn resolved_operand(env: &EnvResolver<'_>, value: &Value) -> Result<Value, ResolveError> {
    if EnvResolver::is_reference(value) {
        env.resolve(value.as_str().unwrap_or_default()).await
    } else {
        Ok(value.clone())
    }
}

/// Map a plain comparison to its instant-aware variant.
fn as_date_variant(op: Operator) -> Operator {
    match op {
        Operator::Eq => Operator::DateEq,
        Operator::Gt => Operator::DateGt,
        Operator::Gte => Operator::DateGte,
        Operator::Lt => Operator::DateLt,
        Operator::Lte => Operator::DateLte,
        other => other,
    }
}
