//! The end-to-end decision flow.
//!
//! `decide()` runs the full pipeline for one request:
//!
//! 1. select policies for the token (none ⇒ `NoPolicyForToken`)
//! 2. filter configs targeting the verb + schema (none ⇒ `NoRuleForRequest`)
//! 3. evaluate each config's conditions (none pass ⇒ `ConditionNotFulfilled`)
//! 4. build each config's store filter and merge the caller's own filter
//!    (irreconcilable conflict ⇒ `QueryViolation`)
//! 5. enforce projections per verb class (none survive ⇒ `ProjectionViolation`)
//! 6. fold survivors into outcome buckets
//!
//! Every stage is fail-closed; the pipeline never grants by omission.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::Utc;
use policy_core::condition::{ConditionContext, all_pass};
use policy_core::env::EnvResolver;
use policy_core::error::{DecisionError, ResolveError};
use policy_core::filter::{FilterExpr, apply_policy_filter};
use policy_core::outcome::{EvaluatedConfig, Outcome};
use policy_core::policy::{ApplicablePolicy, VerbClass};
use policy_core::projection::{
    ProjectionMap, enforce_create, enforce_filter_fields, enforce_update,
};
use policy_core::selection::select_policies;
use policy_core::store::{DocumentStore, StoreError};
use policy_core::token::Token;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::cache::{PolicyCache, SchemaCache, SchemaDef};

/// Decision failure surfaced to the HTTP layer.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Fail-closed decision; answered with 401 and a message key.
    #[error(transparent)]
    Decision(#[from] DecisionError),
    /// Internal evaluation failure; answered with a generic 500.
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    /// Store failure; answered with a generic 500.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Decision(err) => err.status_code(),
            Self::Resolve(_) | Self::Store(_) => 500,
        }
    }
}

/// One authorization question.
#[derive(Debug, Clone)]
pub struct DecisionRequest {
    pub token: Token,
    /// HTTP verb, any case.
    pub verb: String,
    /// Target schema name.
    pub schema: String,
    /// The caller's own filter; `{}` when absent.
    pub filter: Value,
    /// Request body, for create/update verbs.
    pub payload: Option<Value>,
    /// Resolved client address, for `location` conditions.
    pub client_ip: Option<IpAddr>,
}

impl DecisionRequest {
    #[must_use]
    pub fn new(token: Token, verb: impl Into<String>, schema: impl Into<String>) -> Self {
        Self {
            token,
            verb: verb.into(),
            schema: schema.into(),
            filter: Value::Object(Map::new()),
            payload: None,
            client_ip: None,
        }
    }

    #[must_use]
    pub fn with_filter(mut self, filter: Value) -> Self {
        self.filter = filter;
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    #[must_use]
    pub fn with_client_ip(mut self, ip: IpAddr) -> Self {
        self.client_ip = Some(ip);
        self
    }
}

/// The answer: merged outcome buckets plus the (possibly rewritten) payload.
#[derive(Debug, Clone)]
pub struct Decision {
    pub outcome: Outcome,
    /// For create verbs, fields outside the allowed set have been reset to
    /// their schema defaults.
    pub payload: Option<Value>,
}

/// The per-process decision service.
pub struct PolicyDecisionService {
    policies: Arc<PolicyCache>,
    schemas: Arc<SchemaCache>,
    store: Arc<dyn DocumentStore>,
}

impl PolicyDecisionService {
    #[must_use]
    pub fn new(
        policies: Arc<PolicyCache>,
        schemas: Arc<SchemaCache>,
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        Self {
            policies,
            schemas,
            store,
        }
    }

    /// Run the full decision pipeline for one request.
    ///
    /// # Errors
    ///
    /// [`EngineError::Decision`] for every fail-closed denial;
    /// [`EngineError::Resolve`]/[`EngineError::Store`] for internal failures.
    #[tracing::instrument(
        skip_all,
        fields(
            app_id = %request.token.app_id,
            verb = %request.verb,
            schema = %request.schema,
        )
    )]
    pub async fn decide(&self, request: &DecisionRequest) -> Result<Decision, EngineError> {
        let policies = self.policies.get(request.token.app_id).await?;
        let candidates = select_policies(&request.token, &policies);
        if candidates.is_empty() {
            tracing::debug!("token matched no policies");
            return Err(DecisionError::NoPolicyForToken.into());
        }

        let schemas = self.schemas.get(request.token.app_id).await?;
        let core = schemas.is_core(&request.schema);
        let verb = request.verb.to_uppercase();

        let mut applicable = Vec::new();
        for policy in &candidates {
            for (index, config) in policy.configs.iter().enumerate() {
                if config.targets(&verb, &request.schema, core) {
                    applicable.push(ApplicablePolicy {
                        policy: Arc::clone(policy),
                        config_index: index,
                    });
                }
            }
        }
        if applicable.is_empty() {
            return Err(DecisionError::NoRuleForRequest {
                verb,
                schema: request.schema.clone(),
            }
            .into());
        }

        // Conditions: a resolver failure fails the config, never opens it.
        let ctx = ConditionContext {
            client_ip: request.client_ip,
            now: Utc::now(),
        };
        let caller = request.token.record.clone();
        let mut satisfied = Vec::new();
        for entry in applicable {
            let resolver =
                EnvResolver::new(&entry.policy.env, self.store.as_ref(), caller.as_ref());
            match all_pass(&entry.config().conditions, &ctx, &resolver, self.store.as_ref())
                .await
            {
                Ok(true) => satisfied.push(entry),
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(
                        policy = %entry.policy.name,
                        error = %err,
                        "condition evaluation failed, config dropped"
                    );
                }
            }
        }
        if satisfied.is_empty() {
            return Err(DecisionError::ConditionNotFulfilled.into());
        }

        let schema_def = schemas.get(&request.schema);
        let field_names = schema_def.map(SchemaDef::field_names);
        let verb_class = VerbClass::of(&verb);

        let mut evaluated = Vec::new();
        for entry in satisfied {
            let config = entry.config();

            // Projection first. A config whose projection cannot be computed
            // or whose allowed set rejects this write drops out of the
            // applicable set; it only becomes fatal if nothing survives.
            let projection = match &config.projection {
                None => None,
                Some(p) => match ProjectionMap::compute(p, field_names.as_deref()) {
                    Some(map) => Some(map),
                    None => continue,
                },
            };
            if let Some(map) = &projection {
                let rejected = match verb_class {
                    VerbClass::Update => request
                        .payload
                        .as_ref()
                        .is_some_and(|body| enforce_update(body, map).is_err()),
                    VerbClass::Delete | VerbClass::Other => {
                        enforce_filter_fields(&request.filter, map).is_err()
                    }
                    VerbClass::Read | VerbClass::Create => false,
                };
                if rejected {
                    continue;
                }
            }

            // Query: translate, substitute env values, merge the caller's
            // filter. An irreconcilable conflict is a decision error.
            let resolver =
                EnvResolver::new(&entry.policy.env, self.store.as_ref(), caller.as_ref());
            let mut native = config
                .query
                .expr
                .as_ref()
                .map_or_else(|| Value::Object(Map::new()), FilterExpr::to_native);
            resolver.substitute(&mut native).await?;
            let merged = apply_policy_filter(&request.filter, &native)?;

            evaluated.push(EvaluatedConfig {
                policy_name: entry.policy.name.clone(),
                priority: entry.policy.priority,
                verbs: config.verbs.clone(),
                schemas: config.schemas.clone(),
                endpoints: config.endpoints.clone(),
                query: merged,
                projection,
            });
        }
        if evaluated.is_empty() {
            return Err(DecisionError::ProjectionViolation.into());
        }

        let mut payload = request.payload.clone();
        if verb_class == VerbClass::Create {
            if let (Some(body), Some(allowed)) =
                (payload.as_mut(), combined_projection(&evaluated))
            {
                let defaults = schema_def.map(SchemaDef::defaults).unwrap_or_default();
                enforce_create(body, &allowed, &defaults);
            }
        }

        let outcome = Outcome::merge(evaluated);
        tracing::debug!(buckets = outcome.buckets.len(), "decision granted");
        Ok(Decision { outcome, payload })
    }
}

/// Union of the surviving configs' allowed fields. One unprojected config
/// lifts the restriction entirely.
fn combined_projection(evaluated: &[EvaluatedConfig]) -> Option<ProjectionMap> {
    let mut fields = BTreeSet::new();
    for config in evaluated {
        match &config.projection {
            None => return None,
            Some(map) => fields.extend(map.fields().iter().cloned()),
        }
    }
    Some(ProjectionMap::from_fields(fields))
}
