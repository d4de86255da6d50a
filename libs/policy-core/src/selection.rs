//! Policy selection: matching a token's attributes against each policy's
//! selection predicate.
//!
//! Pure function of cached state; no side effects.

use std::sync::Arc;

use serde_json::Value;

use crate::policy::{Policy, SELECT_TOKEN_ID, SELECT_TOKEN_TYPE, Selection, SelectionTest};
use crate::token::{Token, TokenKind};

/// Filter the app's cached policies down to those matching the token.
///
/// A policy matches only if **all** selection keys match; a policy with an
/// empty selection never matches (no vacuous grants).
#[must_use]
pub fn select_policies(token: &Token, policies: &[Arc<Policy>]) -> Vec<Arc<Policy>> {
    policies
        .iter()
        .filter(|p| policy_matches(token, p))
        .cloned()
        .collect()
}

fn policy_matches(token: &Token, policy: &Policy) -> bool {
    if policy.selection.tests.is_empty() {
        return false;
    }
    if token.kind == TokenKind::DataSharing {
        return data_sharing_matches(token, &policy.selection);
    }

    policy.selection.tests.iter().all(|(key, test)| {
        token
            .policy_properties
            .get(key)
            .is_some_and(|attr| attribute_matches(attr, test))
    })
}

/// Data-sharing tokens are addressed directly by the reserved `#tokenType`
/// and `id` selectors rather than by policy properties.
fn data_sharing_matches(token: &Token, selection: &Selection) -> bool {
    let mut saw_token_type = false;
    for (key, test) in &selection.tests {
        match key.as_str() {
            SELECT_TOKEN_TYPE => {
                saw_token_type = true;
                if !evaluate_test(&Value::String("dataSharing".to_owned()), test) {
                    return false;
                }
            }
            SELECT_TOKEN_ID => {
                if !evaluate_test(&Value::String(token.id.clone()), test) {
                    return false;
                }
            }
            // Ordinary selectors do not address data-sharing tokens.
            _ => return false,
        }
    }
    saw_token_type
}

/// Evaluate one test against a token attribute. Array-valued attributes
/// match if any element satisfies the operator.
fn attribute_matches(attr: &Value, test: &SelectionTest) -> bool {
    match attr.as_array() {
        Some(elements) => elements.iter().any(|e| evaluate_test(e, test)),
        None => evaluate_test(attr, test),
    }
}

fn evaluate_test(left: &Value, test: &SelectionTest) -> bool {
    let (left, right) = normalized_pair(left, &test.value);
    test.op.evaluate(&left, &right)
}

/// Uppercase both sides when neither is numeric, so selection matching is
/// case-insensitive for textual attributes.
fn normalized_pair(left: &Value, right: &Value) -> (Value, Value) {
    if left.is_number() || right.is_number() {
        return (left.clone(), right.clone());
    }
    (uppercase_strings(left), uppercase_strings(right))
}

fn uppercase_strings(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.to_uppercase()),
        Value::Array(items) => Value::Array(items.iter().map(uppercase_strings).collect()),
        other => other.clone(),
    }
}
