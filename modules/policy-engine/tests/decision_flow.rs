//! End-to-end decision pipeline tests against in-memory sources.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use policy_core::error::DecisionError;
use policy_core::test_support::MemoryStore;
use policy_core::token::{Token, TokenKind};
use policy_engine::cache::{FieldDef, PolicyCache, SchemaCache, SchemaDef};
use policy_engine::engine::{DecisionRequest, EngineError, PolicyDecisionService};
use policy_engine::test_support::{StaticPolicySource, StaticSchemaSource};
use serde_json::{Value, json};
use uuid::Uuid;

fn app_id() -> Uuid {
    Uuid::from_u128(42)
}

fn car_schema() -> SchemaDef {
    SchemaDef {
        name: "car".to_owned(),
        core: false,
        fields: vec![
            FieldDef {
                name: "make".to_owned(),
                default: None,
            },
            FieldDef {
                name: "model".to_owned(),
                default: None,
            },
            FieldDef {
                name: "rating".to_owned(),
                default: Some(json!(0)),
            },
        ],
    }
}

fn service(policy_docs: Vec<Value>, store: MemoryStore) -> PolicyDecisionService {
    let policies = Arc::new(PolicyCache::new(Arc::new(StaticPolicySource::new(
        policy_docs,
    ))));
    let schemas = Arc::new(SchemaCache::new(Arc::new(StaticSchemaSource::new(vec![
        car_schema(),
    ]))));
    PolicyDecisionService::new(policies, schemas, Arc::new(store))
}

fn admin_token() -> Token {
    Token::new("tok-1", TokenKind::User, app_id()).with_property("role", "ADMIN")
}

fn admin_policy() -> Value {
    json!({
        "name": "P1",
        "priority": 0,
        "appId": app_id().to_string(),
        "selection": {"role": {"@eq": "ADMIN"}},
        "config": [{
            "verbs": ["GET"],
            "schema": ["car"],
            "query": {"@eq": {"make": "Ford"}},
            "projection": {"keys": ["make", "model"]}
        }]
    })
}

#[tokio::test]
async fn admin_get_car_yields_one_bucket() {
    let svc = service(vec![admin_policy()], MemoryStore::default());
    let decision = svc
        .decide(&DecisionRequest::new(admin_token(), "GET", "car"))
        .await
        .unwrap();

    assert_eq!(decision.outcome.buckets.len(), 1);
    let bucket = &decision.outcome.buckets[0];
    assert_eq!(bucket.query, json!({"make": "Ford"}));
    assert_eq!(
        bucket.projection.as_ref().unwrap().to_inclusion(),
        json!({"make": 1, "model": 1})
    );
    assert_eq!(bucket.policies, vec!["P1"]);
}

#[tokio::test]
async fn unknown_schema_is_no_rule() {
    let svc = service(vec![admin_policy()], MemoryStore::default());
    let err = svc
        .decide(&DecisionRequest::new(admin_token(), "GET", "bike"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Decision(DecisionError::NoRuleForRequest { .. })
    ));
}

#[tokio::test]
async fn unmatched_token_is_no_policy() {
    let svc = service(vec![admin_policy()], MemoryStore::default());
    let guest = Token::new("tok-2", TokenKind::User, app_id()).with_property("role", "GUEST");
    let err = svc
        .decide(&DecisionRequest::new(guest, "GET", "car"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Decision(DecisionError::NoPolicyForToken)
    ));
    assert_eq!(err.status_code(), 401);
}

#[tokio::test]
async fn failed_conditions_deny() {
    let policy = json!({
        "name": "P1",
        "appId": app_id().to_string(),
        "selection": {"role": {"@eq": "ADMIN"}},
        "env": {"flag": false},
        "config": [{
            "verbs": ["GET"],
            "schema": ["car"],
            "conditions": [{"flag": {"@eq": true}}]
        }]
    });
    let svc = service(vec![policy], MemoryStore::default());
    let err = svc
        .decide(&DecisionRequest::new(admin_token(), "GET", "car"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Decision(DecisionError::ConditionNotFulfilled)
    ));
}

#[tokio::test]
async fn conflicting_caller_filter_is_a_query_violation() {
    let svc = service(vec![admin_policy()], MemoryStore::default());
    let request = DecisionRequest::new(admin_token(), "GET", "car")
        .with_filter(json!({"make": "Opel"}));
    let err = svc.decide(&request).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Decision(DecisionError::QueryViolation { .. })
    ));
}

#[tokio::test]
async fn caller_filter_merges_when_compatible() {
    let svc = service(vec![admin_policy()], MemoryStore::default());
    let request = DecisionRequest::new(admin_token(), "GET", "car")
        .with_filter(json!({"model": "Focus"}));
    let decision = svc.decide(&request).await.unwrap();
    let query = &decision.outcome.buckets[0].query;
    assert_eq!(query["make"], "Ford");
    assert_eq!(query["model"], "Focus");
}

#[tokio::test]
async fn create_resets_fields_outside_the_projection() {
    let policy = json!({
        "name": "P1",
        "appId": app_id().to_string(),
        "selection": {"role": {"@eq": "ADMIN"}},
        "config": [{
            "verbs": ["POST"],
            "schema": ["car"],
            "projection": {"keys": ["make", "model"]}
        }]
    });
    let svc = service(vec![policy], MemoryStore::default());
    let request = DecisionRequest::new(admin_token(), "POST", "car")
        .with_payload(json!({"make": "Ford", "rating": 99, "vin": "x"}));
    let decision = svc.decide(&request).await.unwrap();
    assert_eq!(
        decision.payload.unwrap(),
        json!({"make": "Ford", "rating": 0})
    );
}

#[tokio::test]
async fn update_outside_every_projection_is_a_violation() {
    let policy = json!({
        "name": "P1",
        "appId": app_id().to_string(),
        "selection": {"role": {"@eq": "ADMIN"}},
        "config": [{
            "verbs": ["PUT"],
            "schema": ["car"],
            "projection": {"keys": ["model"]}
        }]
    });
    let svc = service(vec![policy], MemoryStore::default());
    let request = DecisionRequest::new(admin_token(), "PUT", "car")
        .with_payload(json!({"make": "Ford"}));
    let err = svc.decide(&request).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Decision(DecisionError::ProjectionViolation)
    ));
}

#[tokio::test]
async fn store_backed_condition_gates_on_matching_documents() {
    let policy = json!({
        "name": "P1",
        "appId": app_id().to_string(),
        "selection": {"role": {"@eq": "ADMIN"}},
        "config": [{
            "verbs": ["GET"],
            "schema": ["car"],
            "conditions": [{"query.garage": {"open": {"@eq": true}}}]
        }]
    });

    let closed = MemoryStore::default();
    closed.insert("garage", json!({"open": false}));
    let svc = service(vec![policy.clone()], closed);
    assert!(
        svc.decide(&DecisionRequest::new(admin_token(), "GET", "car"))
            .await
            .is_err()
    );

    let open = MemoryStore::default();
    open.insert("garage", json!({"open": true}));
    let svc = service(vec![policy], open);
    assert!(
        svc.decide(&DecisionRequest::new(admin_token(), "GET", "car"))
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn query_only_policies_merge_into_one_bucket() {
    let second = json!({
        "name": "P2",
        "priority": 1,
        "appId": app_id().to_string(),
        "selection": {"role": {"@eq": "ADMIN"}},
        "config": [{
            "verbs": ["GET"],
            "schema": ["car"],
            "query": {"@eq": {"make": "Opel"}}
        }]
    });
    let first = json!({
        "name": "P1",
        "priority": 0,
        "appId": app_id().to_string(),
        "selection": {"role": {"@eq": "ADMIN"}},
        "config": [{
            "verbs": ["GET"],
            "schema": ["car"],
            "query": {"@eq": {"make": "Ford"}}
        }]
    });
    let svc = service(vec![second, first], MemoryStore::default());
    let decision = svc
        .decide(&DecisionRequest::new(admin_token(), "GET", "car"))
        .await
        .unwrap();

    assert_eq!(decision.outcome.buckets.len(), 1);
    let bucket = &decision.outcome.buckets[0];
    assert_eq!(
        bucket.query,
        json!({"$or": [{"make": "Ford"}, {"make": "Opel"}]})
    );
    assert_eq!(bucket.policies, vec!["P1", "P2"]);
}
