//! Error taxonomy for policy decisions.
//!
//! Every decision error is fail-closed: the request is rejected rather than
//! silently granted. The variants are deliberately distinct so callers can
//! tell "no access at all" from "access, but outside the allowed fields".

use thiserror::Error;

/// A fail-closed policy decision error.
///
/// Carries an HTTP status code and a stable machine-readable message key so
/// the transport layer can surface it without string matching.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecisionError {
    /// The token matched zero policies.
    #[error("no policy applies to this token")]
    NoPolicyForToken,

    /// Policies matched the token, but none targets this verb + schema pair.
    #[error("no policy rule for verb '{verb}' on schema '{schema}'")]
    NoRuleForRequest { verb: String, schema: String },

    /// Every applicable config's condition tree failed.
    #[error("policy conditions not fulfilled")]
    ConditionNotFulfilled,

    /// The request touches fields or paths outside every applicable projection.
    #[error("request references fields outside the allowed projection")]
    ProjectionViolation,

    /// The caller-supplied filter conflicts with a narrower policy filter in a
    /// way that cannot be merged.
    #[error("caller filter conflicts with policy filter on key '{key}'")]
    QueryViolation { key: String },
}

impl DecisionError {
    /// HTTP status code surfaced to the transport layer.
    ///
    /// Decision errors are authorization failures, always 401.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        401
    }

    /// Stable machine-readable message key.
    #[must_use]
    pub fn message_key(&self) -> &'static str {
        match self {
            Self::NoPolicyForToken => "policy.none_for_token",
            Self::NoRuleForRequest { .. } => "policy.no_rule_for_request",
            Self::ConditionNotFulfilled => "policy.condition_not_fulfilled",
            Self::ProjectionViolation => "policy.projection_violation",
            Self::QueryViolation { .. } => "policy.query_violation",
        }
    }
}

/// Error while resolving env references or parsing policy trees.
///
/// These are configuration problems, not authorization verdicts. At room
/// structure time they are treated as "no room" rather than propagated; at
/// policy load time they reject the policy document.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// An env reference does not use the expected `env.` dotted form.
    #[error("malformed env reference '{0}'")]
    MalformedReference(String),

    /// A condition or filter leaf is missing its operator.
    #[error("missing operator in leaf '{0}'")]
    MissingOperator(String),

    /// An operator key was not recognized.
    #[error("unknown operator '{0}'")]
    UnknownOperator(String),

    /// A structured env lookup is missing a required part.
    #[error("incomplete env lookup: missing '{0}'")]
    IncompleteLookup(&'static str),

    /// A tree node has a shape the parser cannot interpret.
    #[error("malformed policy tree: {0}")]
    MalformedTree(String),

    /// The document store failed during a scoped lookup.
    #[error("store lookup failed: {0}")]
    Store(#[from] crate::store::StoreError),
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn decision_errors_are_401() {
        assert_eq!(DecisionError::NoPolicyForToken.status_code(), 401);
        assert_eq!(
            DecisionError::QueryViolation { key: "make".into() }.status_code(),
            401
        );
    }

    #[test]
    fn message_keys_are_distinct() {
        let keys = [
            DecisionError::NoPolicyForToken.message_key(),
            DecisionError::NoRuleForRequest {
                verb: "GET".into(),
                schema: "car".into(),
            }
            .message_key(),
            DecisionError::ConditionNotFulfilled.message_key(),
            DecisionError::ProjectionViolation.message_key(),
            DecisionError::QueryViolation { key: "k".into() }.message_key(),
        ];
        let unique: std::collections::HashSet<_> = keys.iter().collect();
        assert_eq!(unique.len(), keys.len());
    }
}
