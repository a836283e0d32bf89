//! Controller API tests with the in-memory provider double: pod-bound
//! auth, registration, duplicate refusal, and idempotent deletion.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, HeaderMap, Request, StatusCode};
use chrono::Utc;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use runner_manager::controller::agent::{Agent, AgentResponse, AgentState};
use runner_manager::controller::manager_api::ManagerClient;
use runner_manager::controller::provider::{AgentIdentity, AgentStore, Capabilities, Provider};
use runner_manager::controller::server::{router, ControllerApiState};
use runner_manager::controller::store::InMemoryAgentStore;
use runner_manager::errors::AppError;
use runner_manager::github::runners::RunnerInstance;

const POD_TOKEN: &str = "pod-token";

struct FakeManager;

#[async_trait]
impl ManagerClient for FakeManager {
    async fn get_registration_token(&self) -> Result<(String, String)> {
        Ok(("REG-TOKEN".into(), "https://github.com/acme/widgets".into()))
    }

    async fn get_runners(&self) -> Result<(i64, HashMap<String, RunnerInstance>)> {
        Ok((0, HashMap::new()))
    }

    async fn delete_runner(&self, _id: i64) -> Result<()> {
        Ok(())
    }
}

/// Provider double: a fixed pod identity authenticated by a static
/// bearer token, agent records in memory.
struct FakeProvider {
    store: Arc<InMemoryAgentStore>,
}

impl FakeProvider {
    fn new() -> Self {
        Self {
            store: Arc::new(InMemoryAgentStore::new()),
        }
    }
}

#[async_trait]
impl Provider for FakeProvider {
    fn state(&self) -> Arc<dyn AgentStore> {
        self.store.clone()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    async fn authenticate(&self, headers: &HeaderMap) -> Result<AgentIdentity, AppError> {
        let authorization = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if authorization != format!("Bearer {POD_TOKEN}") {
            return Err(AppError::Unauthorized("invalid token".into()));
        }

        Ok(AgentIdentity {
            namespace: "ns".into(),
            pod_name: "p1".into(),
            group: "default".into(),
            labels: vec!["self-hosted".into(), "gpu".into()],
        })
    }

    async fn register_agent(
        &self,
        identity: &AgentIdentity,
        host_name: &str,
        reg_token: &str,
        target_url: &str,
        disable_update: Option<bool>,
    ) -> Result<AgentResponse> {
        let agent = Agent::new(identity.agent_id(), host_name.to_string(), Utc::now());
        self.store.insert(agent.clone())?;

        Ok(AgentResponse {
            agent,
            target_url: target_url.to_string(),
            token: reg_token.to_string(),
            group: identity.group.clone(),
            labels: identity.labels.clone(),
            disable_update,
        })
    }

    async fn check_agent(
        &self,
        _agent: &Agent,
        _instance: Option<&RunnerInstance>,
    ) -> Result<()> {
        Ok(())
    }

    async fn terminate_agent(&self, _agent: &Agent) -> Result<()> {
        Ok(())
    }
}

struct TestApp {
    provider: Arc<FakeProvider>,
    state: ControllerApiState,
}

impl TestApp {
    fn new() -> Self {
        let provider = Arc::new(FakeProvider::new());
        let state = ControllerApiState {
            provider: provider.clone(),
            manager: Arc::new(FakeManager),
            registry: prometheus::Registry::new(),
            disable_update: Some(true),
        };
        Self { provider, state }
    }

    fn router(&self) -> axum::Router {
        router(self.state.clone())
    }
}

fn register_request(token: Option<&str>, body: &str) -> Request<Body> {
    let builder = Request::builder()
        .method("POST")
        .uri("/api/v1/agent")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
    let builder = match token {
        Some(token) => builder.header(header::AUTHORIZATION, format!("Bearer {token}")),
        None => builder,
    };
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get_agent_request(id: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(format!("/api/v1/agent/{id}"))
        .header(header::AUTHORIZATION, format!("Bearer {POD_TOKEN}"))
        .body(Body::empty())
        .unwrap()
}

fn delete_agent_request(id: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(format!("/api/v1/agent/{id}"))
        .header(header::AUTHORIZATION, format!("Bearer {POD_TOKEN}"))
        .body(Body::empty())
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn register_returns_the_full_agent_response() {
    let app = TestApp::new();

    let response = app
        .router()
        .oneshot(register_request(Some(POD_TOKEN), "hostName=h1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["agent"]["id"], "ns/p1");
    assert_eq!(body["agent"]["runnerName"], "h1");
    assert_eq!(body["agent"]["state"], "configuring");
    assert_eq!(body["agent"]["runnerID"], Value::Null);
    assert_eq!(body["targetURL"], "https://github.com/acme/widgets");
    assert_eq!(body["token"], "REG-TOKEN");
    assert_eq!(body["group"], "default");
    assert_eq!(body["labels"], serde_json::json!(["self-hosted", "gpu"]));
    assert_eq!(body["disableUpdate"], true);
}

#[tokio::test]
async fn register_requires_pod_auth() {
    let app = TestApp::new();

    let response = app
        .router()
        .oneshot(register_request(None, "hostName=h1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .router()
        .oneshot(register_request(Some("stolen"), "hostName=h1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn register_rejects_an_empty_host_name() {
    let app = TestApp::new();

    let response = app
        .router()
        .oneshot(register_request(Some(POD_TOKEN), ""))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn duplicate_registration_fails_and_preserves_the_record() {
    let app = TestApp::new();

    let response = app
        .router()
        .oneshot(register_request(Some(POD_TOKEN), "hostName=h1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let stored = app.provider.store.get("ns/p1").await.unwrap().unwrap();

    let response = app
        .router()
        .oneshot(register_request(Some(POD_TOKEN), "hostName=h2"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_body(response).await;
    assert!(body["message"]
        .as_str()
        .unwrap()
        .contains("already registered"));

    let unchanged = app.provider.store.get("ns/p1").await.unwrap().unwrap();
    assert_eq!(stored, unchanged);
}

#[tokio::test]
async fn get_agent_returns_the_record_or_404() {
    let app = TestApp::new();
    app.router()
        .oneshot(register_request(Some(POD_TOKEN), "hostName=h1"))
        .await
        .unwrap();

    let response = app
        .router()
        .oneshot(get_agent_request("ns%2Fp1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["runnerName"], "h1");

    let response = app
        .router()
        .oneshot(get_agent_request("ns%2Fabsent"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delete_agent_is_idempotent() {
    let app = TestApp::new();
    app.router()
        .oneshot(register_request(Some(POD_TOKEN), "hostName=h1"))
        .await
        .unwrap();

    let response = app
        .router()
        .oneshot(delete_agent_request("ns%2Fp1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let agent = app.provider.store.get("ns/p1").await.unwrap().unwrap();
    assert_eq!(agent.state, AgentState::Terminating);
    let first_transition = agent.last_transition_time;

    // Repeating the call succeeds without touching the record.
    let response = app
        .router()
        .oneshot(delete_agent_request("ns%2Fp1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let agent = app.provider.store.get("ns/p1").await.unwrap().unwrap();
    assert_eq!(agent.state, AgentState::Terminating);
    assert_eq!(agent.last_transition_time, first_transition);

    let response = app
        .router()
        .oneshot(delete_agent_request("ns%2Fabsent"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn metrics_are_served_without_pod_auth() {
    let app = TestApp::new();

    let response = app
        .router()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
