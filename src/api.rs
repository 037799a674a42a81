//! Control API and the local data-plane routes.
//!
//! The data-plane router is what a local sandbox endpoint
//! (`{base}/sandboxes/{id}`) resolves to, so the gateway can proxy
//! `/{id}/actions` onto `/sandboxes/{id}/actions`. Every data-plane request
//! carries either a key for that sandbox or the gateway's upstream token.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{GatewayError, OrchestratorError};
use crate::executor::{ActionExecutionRequest, ActionExecutionResponse, Observation};
use crate::gateway::ApiKeyStore;
use crate::gateway::headers::{GATEWAY_TOKEN_HEADER, extract_api_key};
use crate::group::{GroupStatus, SandboxAccess, SandboxGroup};
use crate::orchestrator::{CreatedSandbox, Orchestrator};
use crate::sandbox::{SandboxConfig, SandboxId};

/// Groups by name.
pub type GroupRegistry = Arc<RwLock<HashMap<String, Arc<SandboxGroup>>>>;

/// Shared state for the control and data-plane routers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub keys: ApiKeyStore,
    /// Applied when a key request carries no `ttl_secs`.
    pub default_key_ttl: Option<Duration>,
    /// Accepted on data-plane routes in place of a sandbox key.
    pub gateway_token: Option<String>,
    pub groups: GroupRegistry,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, keys: ApiKeyStore) -> Self {
        Self {
            orchestrator,
            keys,
            default_key_ttl: None,
            gateway_token: None,
            groups: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_default_key_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_key_ttl = ttl;
        self
    }

    pub fn with_gateway_token(mut self, token: impl Into<String>) -> Self {
        self.gateway_token = Some(token.into());
        self
    }

    async fn group(&self, name: &str) -> Result<Arc<SandboxGroup>, OrchestratorError> {
        self.groups
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownGroup {
                name: name.to_string(),
            })
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateSandboxRequest {
    #[serde(default)]
    pub name: Option<String>,
    pub config: SandboxConfig,
}

#[derive(Debug, Default, Deserialize)]
pub struct IssueKeyRequest {
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct IssuedKey {
    pub sandbox_id: SandboxId,
    pub api_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
    pub template: SandboxConfig,
}

#[derive(Debug, Deserialize)]
pub struct CreateMemberRequest {
    pub name: String,
}

#[derive(Debug, Serialize)]
struct SandboxUrl {
    sandbox_url: String,
}

pub fn control_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/resources", get(total_resources))
        .route("/sandboxes", post(create_sandbox).get(list_sandboxes))
        .route("/sandboxes/{id}/start", post(start_sandbox))
        .route("/sandboxes/{id}/stop", post(stop_sandbox))
        .route("/sandboxes/{id}/url", get(sandbox_url))
        .route("/sandboxes/{id}/capabilities", get(capabilities))
        .route("/sandboxes/{id}/usage", get(resource_usage))
        .route("/sandboxes/{id}/stats", get(stats))
        .route("/sandboxes/{id}/history", get(history))
        .route("/sandboxes/{id}/keys", post(issue_key))
        .route("/groups", post(create_group))
        .route("/groups/{group}", get(group_status))
        .route("/groups/{group}/end", post(end_group))
        .route("/groups/{group}/sandboxes", post(create_group_member))
        .route("/groups/{group}/sandboxes/{name}/start", post(start_group_member))
        .route("/groups/{group}/sandboxes/{name}/end", post(end_group_member))
        .with_state(state)
}

pub fn data_plane_routes(state: AppState) -> Router {
    Router::new()
        .route("/sandboxes/{id}/actions", post(execute_actions))
        .route("/sandboxes/{id}/actions/{handle}", get(poll_action))
        .route("/sandboxes/{id}/health", get(sandbox_health))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_sandbox_access))
        .with_state(state)
}

/// Admit the gateway's upstream token, or a key bound to the `{id}` in the
/// path.
async fn require_sandbox_access(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
    request: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    let from_gateway = state.gateway_token.as_deref().is_some_and(|expected| {
        request
            .headers()
            .get(GATEWAY_TOKEN_HEADER)
            .is_some_and(|presented| bool::from(presented.as_bytes().ct_eq(expected.as_bytes())))
    });

    if !from_gateway {
        let sandbox_id = params
            .get("id")
            .map(|id| SandboxId::new(id.as_str()))
            .ok_or_else(|| GatewayError::InvalidRequest {
                reason: "missing sandbox id".to_string(),
            })?;
        let key = extract_api_key(request.headers())
            .map(str::to_string)
            .ok_or_else(|| GatewayError::Unauthorized {
                reason: "missing API key".to_string(),
            })?;
        state.keys.authorize(&sandbox_id, &key).await?;
    }

    Ok(next.run(request).await)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn total_resources(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.get_total_resource_stats().await)
}

async fn create_sandbox(
    State(state): State<AppState>,
    Json(request): Json<CreateSandboxRequest>,
) -> Result<(StatusCode, Json<CreatedSandbox>), OrchestratorError> {
    let name = request.name.unwrap_or_else(|| "sandbox".to_string());
    let created = state.orchestrator.create_sandbox(&name, &request.config).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn list_sandboxes(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.list_sandboxes().await)
}

async fn start_sandbox(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SandboxUrl>, OrchestratorError> {
    let sandbox_url = state.orchestrator.start_sandbox(&SandboxId::new(id)).await?;
    Ok(Json(SandboxUrl { sandbox_url }))
}

async fn stop_sandbox(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, OrchestratorError> {
    let sandbox_id = SandboxId::new(id);
    let result = state.orchestrator.stop_sandbox(&sandbox_id).await;
    // A stopped sandbox has no use for its key, whatever the outcome.
    if !matches!(result, Err(OrchestratorError::NotFound { .. })) {
        state.keys.revoke(&sandbox_id).await;
    }
    result.map(|()| StatusCode::NO_CONTENT)
}

async fn sandbox_url(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SandboxUrl>, OrchestratorError> {
    let sandbox_url = state.orchestrator.get_sandbox_url(&SandboxId::new(id)).await?;
    Ok(Json(SandboxUrl { sandbox_url }))
}

async fn capabilities(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, OrchestratorError> {
    let tools = state
        .orchestrator
        .get_sandbox_capabilities(&SandboxId::new(id))
        .await?;
    Ok(Json(serde_json::json!({ "tools": tools })))
}

async fn resource_usage(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, OrchestratorError> {
    Ok(Json(
        state
            .orchestrator
            .get_sandbox_resource_usage(&SandboxId::new(id))
            .await?,
    ))
}

async fn stats(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, OrchestratorError> {
    Ok(Json(
        state.orchestrator.get_sandbox_stats(&SandboxId::new(id)).await?,
    ))
}

async fn history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, OrchestratorError> {
    Ok(Json(
        state.orchestrator.get_sandbox_history(&SandboxId::new(id)).await?,
    ))
}

async fn issue_key(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<IssuedKey>, axum::response::Response> {
    let request: IssueKeyRequest = if body.is_empty() {
        IssueKeyRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| {
            GatewayError::InvalidRequest {
                reason: format!("invalid key request: {}", e),
            }
            .into_response()
        })?
    };

    let sandbox_id = SandboxId::new(id);
    let record = state
        .orchestrator
        .get_sandbox(&sandbox_id)
        .await
        .map_err(IntoResponse::into_response)?;
    if record.state.is_terminal() {
        return Err(OrchestratorError::InvalidState {
            sandbox_id,
            state: record.state,
            operation: "issue key",
        }
        .into_response());
    }

    let ttl = request.ttl_secs.map(Duration::from_secs).or(state.default_key_ttl);
    let api_key = state.keys.issue(&sandbox_id, ttl).await;
    let expires_at = ttl.and_then(|ttl| chrono::Duration::from_std(ttl).ok()).map(|ttl| Utc::now() + ttl);
    tracing::info!(sandbox_id = %sandbox_id, ttl_secs = ?ttl.map(|t| t.as_secs()), "API key issued");

    Ok(Json(IssuedKey {
        sandbox_id,
        api_key,
        expires_at,
    }))
}

async fn create_group(
    State(state): State<AppState>,
    Json(request): Json<CreateGroupRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), OrchestratorError> {
    request.template.compute.validate().map_err(OrchestratorError::from)?;
    let mut groups = state.groups.write().await;
    if groups.contains_key(&request.name) {
        return Err(OrchestratorError::GroupExists { name: request.name });
    }
    let group = SandboxGroup::new(
        request.name.clone(),
        Arc::clone(&state.orchestrator),
        request.template,
    )
    .with_key_store(state.keys.clone(), state.default_key_ttl);
    groups.insert(request.name.clone(), Arc::new(group));
    tracing::info!(group = %request.name, "Sandbox group created");
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "name": request.name }))))
}

async fn group_status(
    State(state): State<AppState>,
    Path(group): Path<String>,
) -> Result<Json<GroupStatus>, OrchestratorError> {
    Ok(Json(state.group(&group).await?.status().await?))
}

/// Stop every member and drop the group, even when some stops fail.
async fn end_group(
    State(state): State<AppState>,
    Path(group): Path<String>,
) -> Result<StatusCode, OrchestratorError> {
    let removed = state.groups.write().await.remove(&group);
    let group = removed.ok_or(OrchestratorError::UnknownGroup { name: group })?;
    group.end_group().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_group_member(
    State(state): State<AppState>,
    Path(group): Path<String>,
    Json(request): Json<CreateMemberRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), OrchestratorError> {
    let sandbox_id = state.group(&group).await?.create_sandbox(&request.name).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "name": request.name, "sandbox_id": sandbox_id })),
    ))
}

async fn start_group_member(
    State(state): State<AppState>,
    Path((group, name)): Path<(String, String)>,
) -> Result<Json<SandboxAccess>, OrchestratorError> {
    Ok(Json(state.group(&group).await?.start_sandbox(&name).await?))
}

async fn end_group_member(
    State(state): State<AppState>,
    Path((group, name)): Path<(String, String)>,
) -> Result<StatusCode, OrchestratorError> {
    state.group(&group).await?.end_sandbox(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn execute_actions(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ActionExecutionRequest>,
) -> Result<Json<ActionExecutionResponse>, OrchestratorError> {
    let observations = state
        .orchestrator
        .execute_actions(&SandboxId::new(id), request)
        .await?;
    Ok(Json(ActionExecutionResponse { observations }))
}

async fn poll_action(
    State(state): State<AppState>,
    Path((id, handle)): Path<(String, Uuid)>,
) -> Result<Json<Observation>, OrchestratorError> {
    Ok(Json(
        state.orchestrator.poll_action(&SandboxId::new(id), handle).await?,
    ))
}

async fn sandbox_health(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, OrchestratorError> {
    let sandbox_id = SandboxId::new(id);
    state.orchestrator.resolve_endpoint(&sandbox_id).await?;
    Ok(Json(serde_json::json!({ "status": "ok", "sandbox_id": sandbox_id })))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use pretty_assertions::assert_eq;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use async_trait::async_trait;

    use super::*;
    use crate::backend::{BackendHandle, LocalBackend, PrepareSpec, RuntimeBackend};
    use crate::error::BackendError;
    use crate::resources::{ComputeSpec, ResourceLedger};
    use crate::tools::ToolDescriptor;

    const GATEWAY_TOKEN: &str = "test-gateway-token";

    fn state_with(backend: Arc<dyn RuntimeBackend>) -> AppState {
        AppState::new(
            Arc::new(Orchestrator::new(
                Arc::new(ResourceLedger::new(ComputeSpec::absolute(4.0, 16.0, 100.0, 10.0))),
                backend,
            )),
            ApiKeyStore::new(),
        )
        .with_gateway_token(GATEWAY_TOKEN)
    }

    fn state() -> AppState {
        state_with(Arc::new(LocalBackend::new("http://127.0.0.1:8000")))
    }

    fn app(state: &AppState) -> Router {
        control_routes(state.clone()).merge(data_plane_routes(state.clone()))
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        call_with(app, method, uri, &[], body).await
    }

    async fn call_with(
        app: &Router,
        method: &str,
        uri: &str,
        headers: &[(&str, &str)],
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn create_and_start(app: &Router, cpu: f64) -> String {
        let (status, created) = call(
            app,
            "POST",
            "/sandboxes",
            Some(json!({ "name": "t", "config": { "compute": { "cpu": cpu } } })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["sandbox_url"], "");
        let id = created["sandbox_id"].as_str().unwrap().to_string();
        let (status, _) = call(app, "POST", &format!("/sandboxes/{}/start", id), None).await;
        assert_eq!(status, StatusCode::OK);
        id
    }

    async fn issue_key(app: &Router, id: &str) -> String {
        let (status, issued) = call(app, "POST", &format!("/sandboxes/{}/keys", id), None).await;
        assert_eq!(status, StatusCode::OK);
        issued["api_key"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_create_start_url() {
        let state = state();
        let app = app(&state);
        let id = create_and_start(&app, 1.0).await;
        let (status, body) = call(&app, "GET", &format!("/sandboxes/{}/url", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body["sandbox_url"],
            format!("http://127.0.0.1:8000/sandboxes/{}", id)
        );
    }

    #[tokio::test]
    async fn test_admission_failure_is_503() {
        let state = state();
        let app = app(&state);
        let (status, body) = call(
            &app,
            "POST",
            "/sandboxes",
            Some(json!({ "config": { "compute": { "cpu": 8.0 } } })),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], "resource_exhausted");
    }

    #[tokio::test]
    async fn test_unknown_sandbox_is_404() {
        let state = state();
        let app = app(&state);
        let (status, body) = call(&app, "GET", "/sandboxes/sbx-missing/stats", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_found");
    }

    #[tokio::test]
    async fn test_execute_actions_and_history() {
        let state = state();
        let app = app(&state);
        let id = create_and_start(&app, 1.0).await;
        let key = issue_key(&app, &id).await;

        let (status, body) = call_with(
            &app,
            "POST",
            &format!("/sandboxes/{}/actions", id),
            &[("x-api-key", key.as_str())],
            Some(json!({ "actions": { "echo": { "args": { "text": "hi" } } } })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["observations"][0]["functionName"], "echo");
        assert_eq!(body["observations"][0]["output"], "hi");
        assert_eq!(body["observations"][0]["stillRunning"], false);

        let (_, history) = call(&app, "GET", &format!("/sandboxes/{}/history", id), None).await;
        assert_eq!(history.as_array().unwrap().len(), 1);

        let (_, stats) = call(&app, "GET", &format!("/sandboxes/{}/stats", id), None).await;
        assert_eq!(stats["successful_actions"], 1);
    }

    #[tokio::test]
    async fn test_actions_on_created_sandbox_conflict() {
        let state = state();
        let app = app(&state);
        let (_, created) = call(
            &app,
            "POST",
            "/sandboxes",
            Some(json!({ "config": { "compute": { "cpu": 1.0 } } })),
        )
        .await;
        let id = created["sandbox_id"].as_str().unwrap();
        let bearer = format!("Bearer {}", issue_key(&app, id).await);
        let (status, _) = call_with(
            &app,
            "POST",
            &format!("/sandboxes/{}/actions", id),
            &[("authorization", bearer.as_str())],
            Some(json!({ "actions": {} })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_issue_key_and_stop_revokes() {
        let state = state();
        let app = app(&state);
        let id = create_and_start(&app, 1.0).await;

        let (status, issued) = call(
            &app,
            "POST",
            &format!("/sandboxes/{}/keys", id),
            Some(json!({ "ttl_secs": 60 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(issued["expires_at"].is_string());
        let key = issued["api_key"].as_str().unwrap().to_string();
        assert_eq!(key.len(), 64);
        assert_eq!(state.keys.active_count().await, 1);

        let (status, _) = call(&app, "POST", &format!("/sandboxes/{}/stop", id), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(state.keys.active_count().await, 0);

        let (status, _) = call(&app, "POST", &format!("/sandboxes/{}/keys", id), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_stop_twice_conflicts() {
        let state = state();
        let app = app(&state);
        let id = create_and_start(&app, 1.0).await;
        call(&app, "POST", &format!("/sandboxes/{}/stop", id), None).await;
        let (status, body) = call(&app, "POST", &format!("/sandboxes/{}/stop", id), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "invalid_state");
    }

    #[tokio::test]
    async fn test_capabilities_and_resources() {
        let state = state();
        let app = app(&state);
        let id = create_and_start(&app, 2.0).await;

        let (status, body) = call(&app, "GET", &format!("/sandboxes/{}/capabilities", id), None).await;
        assert_eq!(status, StatusCode::OK);
        let names: Vec<&str> = body["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"echo"));

        let (_, resources) = call(&app, "GET", "/resources", None).await;
        assert_eq!(resources["allocated"]["cpu"], 2.0);
        assert_eq!(resources["active_sandboxes"], 1);
    }

    #[tokio::test]
    async fn test_sandbox_health_requires_running() {
        let state = state();
        let app = app(&state);
        let id = create_and_start(&app, 1.0).await;
        let gateway = [(GATEWAY_TOKEN_HEADER, GATEWAY_TOKEN)];
        let uri = format!("/sandboxes/{}/health", id);
        let (status, _) = call_with(&app, "GET", &uri, &gateway, None).await;
        assert_eq!(status, StatusCode::OK);
        call(&app, "POST", &format!("/sandboxes/{}/stop", id), None).await;
        let (status, _) = call_with(&app, "GET", &uri, &gateway, None).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_data_plane_rejects_missing_or_foreign_keys() {
        let state = state();
        let app = app(&state);
        let id = create_and_start(&app, 1.0).await;
        let other = create_and_start(&app, 1.0).await;
        let other_key = issue_key(&app, &other).await;
        let uri = format!("/sandboxes/{}/actions", id);
        let body = json!({ "actions": { "execute_command": { "args": { "command": "id" } } } });

        let (status, response) = call(&app, "POST", &uri, Some(body.clone())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(response["code"], "unauthorized");

        let (status, _) = call_with(&app, "POST", &uri, &[("x-api-key", other_key.as_str())], Some(body.clone())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = call_with(
            &app,
            "POST",
            &uri,
            &[(GATEWAY_TOKEN_HEADER, "forged")],
            Some(body),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = call(&app, "GET", &format!("/sandboxes/{}/health", id), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let stats = state.orchestrator.get_sandbox_stats(&SandboxId::new(id)).await.unwrap();
        assert_eq!(stats.successful_actions + stats.failed_actions, 0);
    }

    #[tokio::test]
    async fn test_gateway_token_admits_any_sandbox() {
        let state = state();
        let app = app(&state);
        let id = create_and_start(&app, 1.0).await;
        let (status, body) = call_with(
            &app,
            "POST",
            &format!("/sandboxes/{}/actions", id),
            &[(GATEWAY_TOKEN_HEADER, GATEWAY_TOKEN)],
            Some(json!({ "actions": { "echo": { "args": { "text": "via gateway" } } } })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["observations"][0]["output"], "via gateway");
    }

    #[tokio::test]
    async fn test_data_plane_without_gateway_token_needs_keys() {
        let state = AppState::new(
            Arc::new(Orchestrator::new(
                Arc::new(ResourceLedger::new(ComputeSpec::cpu_only(4.0))),
                Arc::new(LocalBackend::new("http://127.0.0.1:8000")),
            )),
            ApiKeyStore::new(),
        );
        let app = app(&state);
        let id = create_and_start(&app, 1.0).await;
        let (status, _) = call_with(
            &app,
            "GET",
            &format!("/sandboxes/{}/health", id),
            &[(GATEWAY_TOKEN_HEADER, "")],
            None,
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    /// Local backend whose `stop` fails for group members named `b`.
    struct FailingStopBackend {
        inner: LocalBackend,
        failing: tokio::sync::Mutex<Vec<BackendHandle>>,
    }

    #[async_trait]
    impl RuntimeBackend for FailingStopBackend {
        fn name(&self) -> &str {
            "failing-stop"
        }

        async fn prepare(&self, spec: &PrepareSpec) -> Result<BackendHandle, BackendError> {
            let handle = self.inner.prepare(spec).await?;
            if spec.name.ends_with("/b") {
                self.failing.lock().await.push(handle.clone());
            }
            Ok(handle)
        }

        async fn start(&self, handle: &BackendHandle) -> Result<String, BackendError> {
            self.inner.start(handle).await
        }

        async fn stop(&self, handle: &BackendHandle) -> Result<(), BackendError> {
            if self.failing.lock().await.contains(handle) {
                return Err(BackendError::StopFailed {
                    reason: "runtime unavailable".to_string(),
                });
            }
            self.inner.stop(handle).await
        }

        async fn invoke(
            &self,
            handle: &BackendHandle,
            action: &str,
            args: Value,
        ) -> Result<Value, BackendError> {
            self.inner.invoke(handle, action, args).await
        }

        async fn capabilities(&self, handle: &BackendHandle) -> Result<Vec<ToolDescriptor>, BackendError> {
            self.inner.capabilities(handle).await
        }
    }

    async fn create_group(app: &Router, name: &str) {
        let (status, body) = call(
            app,
            "POST",
            "/groups",
            Some(json!({ "name": name, "template": { "compute": { "cpu": 1.0 } } })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["name"], name);
    }

    #[tokio::test]
    async fn test_group_lifecycle_over_http() {
        let state = state();
        let app = app(&state);
        create_group(&app, "crew").await;

        let (status, _) = call(
            &app,
            "POST",
            "/groups",
            Some(json!({ "name": "crew", "template": { "compute": { "cpu": 1.0 } } })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        for name in ["a", "b"] {
            let (status, body) = call(
                &app,
                "POST",
                "/groups/crew/sandboxes",
                Some(json!({ "name": name })),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
            assert!(body["sandbox_id"].as_str().unwrap().starts_with("sbx-"));
        }
        let (status, body) = call(&app, "POST", "/groups/crew/sandboxes", Some(json!({ "name": "a" }))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "duplicate_name");

        let (status, access) = call(&app, "POST", "/groups/crew/sandboxes/a/start", None).await;
        assert_eq!(status, StatusCode::OK);
        let id = access["sandbox_id"].as_str().unwrap().to_string();
        let key = access["api_key"].as_str().unwrap().to_string();
        assert!(access["url"].as_str().unwrap().ends_with(&id));

        // The issued key opens the member's data plane.
        let (status, _) = call_with(
            &app,
            "GET",
            &format!("/sandboxes/{}/health", id),
            &[("x-api-key", key.as_str())],
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(&app, "GET", "/groups/crew", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["members"][0]["name"], "a");
        assert_eq!(body["members"][0]["state"], "RUNNING");
        assert_eq!(body["members"][1]["state"], "CREATED");
        assert_eq!(body["resources"]["live_sandboxes"], 2);

        let (status, _) = call(&app, "POST", "/groups/crew/sandboxes/a/end", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(state.keys.active_count().await, 0);
        let (status, body) = call(&app, "POST", "/groups/crew/sandboxes/a/start", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "unknown_name");

        let (status, _) = call(&app, "POST", "/groups/crew/end", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, body) = call(&app, "GET", "/groups/crew", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "unknown_group");
        assert_eq!(state.orchestrator.get_total_resource_stats().await.allocated.cpu, 0.0);
    }

    #[tokio::test]
    async fn test_end_group_reports_failing_members() {
        let state = state_with(Arc::new(FailingStopBackend {
            inner: LocalBackend::new("http://127.0.0.1:8000"),
            failing: tokio::sync::Mutex::new(Vec::new()),
        }));
        let app = app(&state);
        create_group(&app, "crew").await;
        for name in ["a", "b", "c"] {
            call(&app, "POST", "/groups/crew/sandboxes", Some(json!({ "name": name }))).await;
            let (status, _) = call(&app, "POST", &format!("/groups/crew/sandboxes/{}/start", name), None).await;
            assert_eq!(status, StatusCode::OK);
        }

        let (status, body) = call(&app, "POST", "/groups/crew/end", None).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["code"], "partial_cleanup_failure");
        let details = body["details"].as_object().unwrap();
        assert_eq!(details.keys().collect::<Vec<_>>(), vec!["b"]);
        assert!(details["b"].as_str().unwrap().contains("runtime unavailable"));

        // Every reservation is returned and the group is gone regardless.
        assert_eq!(state.orchestrator.get_total_resource_stats().await.active_sandboxes, 0);
        let (status, _) = call(&app, "GET", "/groups/crew", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_group_with_invalid_template_rejected() {
        let state = state();
        let app = app(&state);
        let (status, body) = call(
            &app,
            "POST",
            "/groups",
            Some(json!({ "name": "bad", "template": { "compute": { "cpu": -1.0 } } })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "invalid_spec");
    }
}
