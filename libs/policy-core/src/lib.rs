//! Core policy evaluation for the Fluxbase authorization engine.
//!
//! This crate is transport-free: it knows nothing about HTTP, the event bus,
//! or realtime rooms. It models policies, matches them against tokens,
//! evaluates condition trees, builds and merges store filters, and folds the
//! surviving configs into decision buckets.
//!
//! # Decision pipeline
//!
//! | Stage | Input | Failure |
//! |-------|-------|---------|
//! | selection | token attributes | [`DecisionError::NoPolicyForToken`] |
//! | targeting | verb + schema/endpoint | [`DecisionError::NoRuleForRequest`] |
//! | conditions | env, store, client context | [`DecisionError::ConditionNotFulfilled`] |
//! | query build | policy query + caller filter | [`DecisionError::QueryViolation`] |
//! | projection | verb class + schema fields | [`DecisionError::ProjectionViolation`] |
//! | merge | evaluated configs | — |
//!
//! Every stage is fail-closed: whatever cannot be positively granted is
//! denied. The crate's only I/O seam is the [`DocumentStore`] trait, used by
//! env lookups and store-backed conditions.

pub mod condition;
pub mod env;
pub mod error;
pub mod filter;
pub mod operator;
pub mod outcome;
pub mod policy;
pub mod projection;
pub mod selection;
pub mod store;
pub mod test_support;
pub mod token;

pub use condition::{ConditionContext, ConditionExpr, all_pass};
pub use env::EnvResolver;
pub use error::{DecisionError, ResolveError};
pub use filter::{
    FilterExpr, LogicalOp, PolicyQuery, apply_policy_filter, merge_query_filters,
};
pub use operator::Operator;
pub use outcome::{EvaluatedConfig, Outcome, OutcomeBucket};
pub use policy::{
    ApplicablePolicy, Policy, PolicyConfig, Projection, ProjectionAccess, TargetSet, VerbClass,
    VerbSet,
};
pub use projection::ProjectionMap;
pub use selection::select_policies;
pub use store::{DocumentStore, StoreError};
pub use token::{Token, TokenKind};
