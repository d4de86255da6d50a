//! Per-process policy decision service for the Fluxbase backend.
//!
//! Wires the pure machinery of `policy_core` to process state: revisioned
//! per-app policy and schema caches invalidated over the event bus, debounced
//! policy expiry timers, client-IP resolution from forwarded headers, and the
//! end-to-end [`PolicyDecisionService::decide`] flow.
//!
//! Collaborators reach the engine through three ports: [`EventBus`] for
//! pub/sub traffic, and the [`PolicySource`]/[`SchemaSource`] loaders backing
//! the caches. The document store port comes from `policy_core`.

pub mod bus;
pub mod cache;
pub mod client_ip;
pub mod engine;
pub mod expiry;
pub mod test_support;

pub use bus::{BusError, BusSubscription, EventBus};
pub use cache::{
    AppSchemas, FieldDef, PolicyCache, PolicySource, SchemaCache, SchemaDef, SchemaSource,
};
pub use client_ip::resolve_client_ip;
pub use engine::{Decision, DecisionRequest, EngineError, PolicyDecisionService};
pub use expiry::ExpiryScheduler;
