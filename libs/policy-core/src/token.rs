//! Caller identity.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The kind of caller behind a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TokenKind {
    System,
    User,
    App,
    DataSharing,
    Lambda,
}

/// Caller identity, loaded once per request and immutable thereafter.
///
/// `policy_properties` carries the attributes policies select on (role,
/// department, group memberships, ...). Values may be scalars or arrays;
/// array-valued attributes match a selection predicate if any element does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    /// Token identifier (used by data-sharing policy selection).
    pub id: String,
    /// Caller kind.
    #[serde(rename = "type")]
    pub kind: TokenKind,
    /// Attributes available to policy selection.
    #[serde(default, rename = "policyProperties")]
    pub policy_properties: BTreeMap<String, Value>,
    /// Owning application.
    #[serde(rename = "appId")]
    pub app_id: Uuid,
    /// The caller's stored identity record, if loaded. Used by env lookups
    /// against the reserved `user` collection.
    #[serde(default)]
    pub record: Option<Value>,
}

impl Token {
    /// Build a minimal token of the given kind.
    #[must_use]
    pub fn new(id: impl Into<String>, kind: TokenKind, app_id: Uuid) -> Self {
        Self {
            id: id.into(),
            kind,
            policy_properties: BTreeMap::new(),
            app_id,
            record: None,
        }
    }

    /// Add a policy property (builder style).
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.policy_properties.insert(key.into(), value.into());
        self
    }

    /// Attach the caller's stored record.
    #[must_use]
    pub fn with_record(mut self, record: Value) -> Self {
        self.record = Some(record);
        self
    }
}
