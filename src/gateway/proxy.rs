//! Authenticated reverse proxy from `/{sandbox_id}/{*path}` to the sandbox's
//! execution endpoint.

use std::sync::{Arc, LazyLock};

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, Method, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use regex::Regex;
use tokio::sync::Semaphore;

use super::headers::{
    GATEWAY_TOKEN_HEADER, extract_api_key, forwardable_request_headers, forwardable_response_headers,
};
use super::keys::ApiKeyStore;
use super::policy::ProxyPolicy;
use super::retry::run_with_retry;
use crate::error::{GatewayError, OrchestratorError, ServerError};
use crate::orchestrator::Orchestrator;
use crate::sandbox::SandboxId;

static SANDBOX_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{4,32}$").expect("valid sandbox id regex"));

/// Syntactic check performed before any lookup.
pub fn validate_sandbox_id(raw: &str) -> Result<SandboxId, GatewayError> {
    if SANDBOX_ID_PATTERN.is_match(raw) {
        Ok(SandboxId::new(raw))
    } else {
        Err(GatewayError::InvalidSandboxId { id: raw.to_string() })
    }
}

/// Split `body` into a stream of `chunk_size` pieces.
fn chunked_body(body: Bytes, chunk_size: usize) -> reqwest::Body {
    if body.is_empty() {
        return reqwest::Body::from(body);
    }
    let chunk_size = chunk_size.max(1);
    let chunks: Vec<Result<Bytes, std::io::Error>> = (0..body.len())
        .step_by(chunk_size)
        .map(|start| Ok(body.slice(start..(start + chunk_size).min(body.len()))))
        .collect();
    reqwest::Body::wrap_stream(futures::stream::iter(chunks))
}

fn describe(err: &reqwest::Error) -> String {
    if err.is_connect() {
        format!("connect error: {}", err)
    } else if err.is_timeout() {
        format!("read timeout: {}", err)
    } else {
        err.to_string()
    }
}

/// Shared gateway state.
#[derive(Clone)]
pub struct Gateway {
    orchestrator: Arc<Orchestrator>,
    keys: ApiKeyStore,
    policy: Arc<ProxyPolicy>,
    client: reqwest::Client,
    permits: Arc<Semaphore>,
    upstream_token: Option<HeaderValue>,
}

impl Gateway {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        keys: ApiKeyStore,
        policy: ProxyPolicy,
    ) -> Result<Self, ServerError> {
        let client = reqwest::Client::builder()
            .connect_timeout(policy.connect_timeout)
            .read_timeout(policy.read_timeout)
            .pool_max_idle_per_host(policy.max_connections)
            .build()
            .map_err(|e| ServerError::StartupFailed {
                name: "gateway".to_string(),
                reason: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            orchestrator,
            keys,
            permits: Arc::new(Semaphore::new(policy.max_connections.max(1))),
            policy: Arc::new(policy),
            client,
            upstream_token: None,
        })
    }

    /// Attach `token` to every forwarded request so local data-plane routes
    /// accept it in place of the client's key.
    pub fn with_upstream_token(mut self, token: &str) -> Result<Self, ServerError> {
        let mut value = HeaderValue::from_str(token).map_err(|e| ServerError::StartupFailed {
            name: "gateway".to_string(),
            reason: format!("invalid upstream token: {}", e),
        })?;
        value.set_sensitive(true);
        self.upstream_token = Some(value);
        Ok(self)
    }

    pub fn policy(&self) -> &ProxyPolicy {
        &self.policy
    }

    /// Free upstream slots right now.
    pub fn available_connections(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn routes(&self) -> Router {
        Router::new()
            .route("/health", get(gateway_health))
            .route("/{sandbox_id}/{*path}", any(proxy_handler))
            .with_state(self.clone())
    }

    /// Authenticate, resolve, and forward one request.
    pub async fn forward(
        &self,
        raw_id: &str,
        path: &str,
        method: Method,
        query: Option<&str>,
        headers: &HeaderMap,
        body: Body,
    ) -> Result<Response, GatewayError> {
        let sandbox_id = validate_sandbox_id(raw_id)?;

        let key = extract_api_key(headers).ok_or_else(|| GatewayError::Unauthorized {
            reason: "missing API key".to_string(),
        })?;
        self.keys.authorize(&sandbox_id, key).await?;

        let endpoint = self
            .orchestrator
            .resolve_endpoint(&sandbox_id)
            .await
            .map_err(|e| match e {
                OrchestratorError::NotRunning { sandbox_id, .. } => GatewayError::NotRunning { sandbox_id },
                _ => GatewayError::NotFound {
                    sandbox_id: sandbox_id.clone(),
                },
            })?;

        let body = self.read_body(headers, body).await?;

        let mut url = format!(
            "{}/{}",
            endpoint.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        if let Some(query) = query {
            url.push('?');
            url.push_str(query);
        }

        let waited = self.policy.connect_timeout;
        let permit = tokio::time::timeout(waited, Arc::clone(&self.permits).acquire_owned())
            .await
            .map_err(|_| GatewayError::ConnectionPoolExhausted { waited })?
            .map_err(|_| GatewayError::ConnectionPoolExhausted { waited })?;

        let mut forward_headers = forwardable_request_headers(headers, &self.policy.filtered_headers);
        if let Some(token) = &self.upstream_token {
            forward_headers.insert(GATEWAY_TOKEN_HEADER, token.clone());
        }
        let chunk_size = self.policy.chunk_size;
        let outcome = run_with_retry(&self.policy.retry_policy(), |_attempt| {
            let request = self
                .client
                .request(method.clone(), &url)
                .headers(forward_headers.clone())
                .body(chunked_body(body.clone(), chunk_size));
            async move { request.send().await.map_err(|e| describe(&e)) }
        })
        .await;
        let upstream = outcome.result?;

        let status = upstream.status();
        tracing::debug!(
            sandbox_id = %sandbox_id,
            method = %method,
            path = path,
            status = status.as_u16(),
            attempts = outcome.attempts,
            "Proxied request"
        );

        let response_headers = forwardable_response_headers(upstream.headers());
        // The slot is held until the response body has been streamed out.
        let stream = upstream.bytes_stream().map(move |chunk| {
            let _slot = &permit;
            chunk
        });

        let mut response = Response::new(Body::from_stream(stream));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }

    async fn read_body(&self, headers: &HeaderMap, body: Body) -> Result<Bytes, GatewayError> {
        let max = self.policy.max_request_size;

        if let Some(declared) = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok())
            && declared > max
        {
            return Err(GatewayError::PayloadTooLarge { size: declared, max });
        }

        let mut stream = body.into_data_stream();
        let mut buffer = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| GatewayError::InvalidRequest {
                reason: format!("failed to read request body: {}", e),
            })?;
            let size = buffer.len() + chunk.len();
            if size > max {
                return Err(GatewayError::PayloadTooLarge { size, max });
            }
            buffer.extend_from_slice(&chunk);
        }
        Ok(buffer.freeze())
    }
}

async fn gateway_health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn proxy_handler(
    State(gateway): State<Gateway>,
    Path((sandbox_id, path)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, GatewayError> {
    gateway
        .forward(&sandbox_id, &path, method, uri.query(), &headers, body)
        .await
        .inspect_err(|e| {
            tracing::debug!(sandbox_id = %sandbox_id, error = %e, "Gateway rejected request");
        })
}
