#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use chrono::Utc;
use ed25519_dalek::{Signer, SigningKey};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use empowergrid_server::app_state::AppState;
use empowergrid_server::config::EngineConfig;
use empowergrid_server::ledger::{LedgerClient, SimulatedLedger};
use empowergrid_server::oracle::signature::SignatureVerifier;
use empowergrid_server::routes::api_router;
use empowergrid_server::store::{MemoryAuditSink, MemoryStore};

pub struct TestApp {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub router: Router,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_ledger(test_config(), Arc::new(SimulatedLedger::new()))
    }

    pub fn with_ledger(config: EngineConfig, ledger: Arc<dyn LedgerClient>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let state = AppState::build(
            config,
            store.clone(),
            Arc::new(MemoryAuditSink::new()),
            ledger,
        );
        Self {
            router: api_router(state.clone()),
            state,
            store,
        }
    }

    pub async fn send(
        &self,
        method: &str,
        uri: &str,
        actor: Option<(&str, &str)>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some((id, role)) = actor {
            builder = builder.header("x-actor-id", id).header("x-actor-role", role);
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };
        (status, value)
    }

    pub async fn post(&self, uri: &str, actor: (&str, &str), body: Value) -> (StatusCode, Value) {
        self.send("POST", uri, Some(actor), Some(body)).await
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.send("GET", uri, None, None).await
    }
}

pub const OPERATOR: (&str, &str) = ("ops-1", "operator");
pub const ADMIN: (&str, &str) = ("admin-1", "admin");
pub const APPROVER_A: (&str, &str) = ("approver-a", "approver");
pub const APPROVER_B: (&str, &str) = ("approver-b", "approver");

/// Fast retries and polls so failure paths finish quickly.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.poller.enabled = false;
    config.ledger.confirmation_poll_interval_ms = 1;
    config.ledger.confirmation_max_polls = 2;
    config.ledger.request_timeout_ms = 500;
    config.release.condition.backoff_base_ms = 1;
    config.release.condition.backoff_max_ms = 5;
    config
}

pub struct Meter {
    pub source_id: String,
    pub key: SigningKey,
}

impl Meter {
    pub fn new(source_id: &str, seed: u8) -> Self {
        Self {
            source_id: source_id.to_string(),
            key: SigningKey::from_bytes(&[seed; 32]),
        }
    }

    pub fn public_key(&self) -> String {
        hex::encode(self.key.verifying_key().to_bytes())
    }

    pub fn reading(&self, value: f64, confidence: f64, age_secs: i64) -> Value {
        let timestamp = Utc::now().timestamp() - age_secs;
        let payload = SignatureVerifier::signing_payload(&self.source_id, timestamp, value);
        json!({
            "source_id": self.source_id,
            "value": value,
            "confidence": confidence,
            "timestamp": timestamp,
            "signature": hex::encode(self.key.sign(&payload).to_bytes()),
        })
    }
}

pub fn meters(n: u8) -> Vec<Meter> {
    (0..n)
        .map(|i| Meter::new(&format!("meter-{}", i), 40 + i))
        .collect()
}

/// Subscribe an energy feed for `meters` and return its id.
pub async fn subscribe_energy_feed(app: &TestApp, project_id: Uuid, meters: &[Meter]) -> Uuid {
    let sources: Vec<Value> = meters
        .iter()
        .map(|m| json!({ "source_id": m.source_id, "public_key": m.public_key() }))
        .collect();
    let (status, body) = app
        .post(
            "/api/feeds",
            OPERATOR,
            json!({
                "project_id": project_id,
                "address": "meter://array-7",
                "feed_type": "energy_production",
                "update_interval_secs": 60,
                "max_staleness_secs": 300,
                "min_confidence": 0.5,
                "endpoint_url": null,
                "sources": sources,
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    parse_id(&body["data"]["id"])
}

pub async fn register_milestone(app: &TestApp, project_id: Uuid, target_kwh: f64) -> Uuid {
    let (status, body) = app
        .post(
            "/api/milestones",
            OPERATOR,
            json!({
                "project_id": project_id,
                "index": 0,
                "title": "Array commissioning",
                "targets": [{ "feed_type": "energy_production", "target_value": target_kwh }],
                "due_date": null,
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    parse_id(&body["data"]["id"])
}

/// Push one fresh reading per meter.
pub async fn report(app: &TestApp, feed_id: Uuid, meters: &[Meter], values: &[f64], confidence: f64) {
    for (meter, value) in meters.iter().zip(values) {
        let (status, body) = app
            .post(
                &format!("/api/feeds/{}/data-points", feed_id),
                OPERATOR,
                meter.reading(*value, confidence, 0),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{}", body);
    }
}

/// A project with a milestone whose three meters agree on `values`.
pub async fn milestone_with_readings(app: &TestApp, values: &[f64]) -> (Uuid, Uuid) {
    let project_id = Uuid::new_v4();
    let meters = meters(values.len() as u8);
    let feed_id = subscribe_energy_feed(app, project_id, &meters).await;
    let milestone_id = register_milestone(app, project_id, 90.0).await;
    report(app, feed_id, &meters, values, 0.9).await;
    (milestone_id, feed_id)
}

pub async fn create_allocation(app: &TestApp, milestone_id: Uuid, amount: i64) -> Uuid {
    let (status, body) = app
        .post(
            "/api/allocations",
            OPERATOR,
            json!({
                "milestone_id": milestone_id,
                "recipient": "GDEVELOPERWALLET",
                "amount": amount,
                "condition": null,
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    parse_id(&body["data"]["id"])
}

pub fn parse_id(value: &Value) -> Uuid {
    value
        .as_str()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| panic!("expected a uuid, got {}", value))
}
