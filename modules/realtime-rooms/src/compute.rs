//! Per-connection room computation.
//!
//! When a socket authenticates (or its app's policies change), the engine
//! recomputes the read outcome for every schema in the app and derives one
//! room per schema that grants anything. Denials simply produce no room;
//! resolver or store trouble is logged and likewise yields no room — a
//! realtime connection can never widen access by failing.

use std::net::IpAddr;
use std::sync::Arc;

use policy_core::token::Token;
use policy_engine::cache::SchemaCache;
use policy_engine::engine::{DecisionRequest, EngineError, PolicyDecisionService};

use crate::room::Room;

pub struct RoomComputer {
    decisions: Arc<PolicyDecisionService>,
    schemas: Arc<SchemaCache>,
}

impl RoomComputer {
    #[must_use]
    pub fn new(decisions: Arc<PolicyDecisionService>, schemas: Arc<SchemaCache>) -> Self {
        Self { decisions, schemas }
    }

    /// The rooms this token may join right now, one per readable schema.
    pub async fn rooms_for(&self, token: &Token, client_ip: Option<IpAddr>) -> Vec<Room> {
        let schemas = match self.schemas.get(token.app_id).await {
            Ok(schemas) => schemas,
            Err(err) => {
                tracing::warn!(app_id = %token.app_id, error = %err, "schema load failed, no rooms");
                return Vec::new();
            }
        };

        let mut rooms = Vec::new();
        for schema in schemas.names() {
            let mut request = DecisionRequest::new(token.clone(), "GET", schema);
            if let Some(ip) = client_ip {
                request = request.with_client_ip(ip);
            }
            match self.decisions.decide(&request).await {
                Ok(decision) => {
                    rooms.push(Room::from_outcome(token.app_id, schema, &decision.outcome));
                }
                Err(EngineError::Decision(_)) => {}
                Err(err) => {
                    tracing::warn!(
                        app_id = %token.app_id,
                        schema,
                        error = %err,
                        "room computation failed, no room"
                    );
                }
            }
        }
        rooms.sort_by_key(|r| r.id);
        rooms
    }
}
