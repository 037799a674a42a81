//! Error types for sandboxd.

use std::collections::BTreeMap;
use std::time::Duration;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::resources::Dimension;
use crate::sandbox::{SandboxId, SandboxState};

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Admission failures raised by the resource ledger.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LedgerError {
    #[error("Insufficient {dimension} capacity: requested {requested}, available {available}")]
    InsufficientCapacity {
        dimension: Dimension,
        requested: f64,
        available: f64,
    },

    #[error("Sandbox limit of {max} reached")]
    SandboxLimit { max: u32 },

    #[error("Invalid compute spec: {reason}")]
    InvalidSpec { reason: String },
}

/// Failures reported by a runtime backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Backend preparation failed: {reason}")]
    PrepareFailed { reason: String },

    #[error("Backend start failed: {reason}")]
    StartFailed { reason: String },

    #[error("Backend stop failed: {reason}")]
    StopFailed { reason: String },

    #[error("Unknown backend handle: {handle}")]
    UnknownHandle { handle: String },

    #[error("Environment {handle} is not running")]
    NotRunning { handle: String },

    #[error("Tool error: {0}")]
    Tool(#[from] crate::tools::ToolError),
}

/// Control-plane errors returned by the orchestrator, lifecycle, executor
/// and sandbox groups.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Resource exhausted ({dimension}): {reason}")]
    ResourceExhausted { dimension: String, reason: String },

    #[error("Invalid compute spec: {reason}")]
    InvalidSpec { reason: String },

    #[error("Backend failure for sandbox {sandbox_id}: {reason}")]
    Backend {
        sandbox_id: SandboxId,
        reason: String,
    },

    #[error("Sandbox {sandbox_id} not found")]
    NotFound { sandbox_id: SandboxId },

    #[error("Sandbox {sandbox_id} is {state}, cannot {operation}")]
    InvalidState {
        sandbox_id: SandboxId,
        state: SandboxState,
        operation: &'static str,
    },

    #[error("Sandbox {sandbox_id} is not running (state: {state})")]
    NotRunning {
        sandbox_id: SandboxId,
        state: SandboxState,
    },

    #[error("Sandbox name {name} already exists in group")]
    DuplicateName { name: String },

    #[error("Sandbox name {name} not found in group")]
    UnknownName { name: String },

    #[error("Action {handle} not found")]
    UnknownAction { handle: uuid::Uuid },

    #[error("Sandbox group {name} already exists")]
    GroupExists { name: String },

    #[error("Sandbox group {name} not found")]
    UnknownGroup { name: String },

    #[error("Failed to stop {} sandbox(es) cleanly: {}", .details.len(), format_details(.details))]
    PartialCleanupFailure { details: BTreeMap<String, String> },
}

fn format_details(details: &BTreeMap<String, String>) -> String {
    details
        .iter()
        .map(|(name, reason)| format!("{}: {}", name, reason))
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<LedgerError> for OrchestratorError {
    fn from(err: LedgerError) -> Self {
        match &err {
            LedgerError::InsufficientCapacity { dimension, .. } => {
                OrchestratorError::ResourceExhausted {
                    dimension: dimension.to_string(),
                    reason: err.to_string(),
                }
            }
            LedgerError::SandboxLimit { .. } => OrchestratorError::ResourceExhausted {
                dimension: "sandboxes".to_string(),
                reason: err.to_string(),
            },
            LedgerError::InvalidSpec { reason } => OrchestratorError::InvalidSpec {
                reason: reason.clone(),
            },
        }
    }
}

/// Data-plane errors raised by the gateway before or while proxying.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Unauthorized: {reason}")]
    Unauthorized { reason: String },

    #[error("API key for sandbox {sandbox_id} has expired")]
    Expired { sandbox_id: SandboxId },

    #[error("Invalid sandbox id: {id:?}")]
    InvalidSandboxId { id: String },

    #[error("Sandbox {sandbox_id} not found")]
    NotFound { sandbox_id: SandboxId },

    #[error("Sandbox {sandbox_id} has no live endpoint")]
    NotRunning { sandbox_id: SandboxId },

    #[error("Payload too large: {size} bytes exceeds {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("No upstream connection available after {waited:?}")]
    ConnectionPoolExhausted { waited: Duration },

    #[error("Upstream timed out after {attempts} attempt(s) in {elapsed:?}: {last_error}")]
    UpstreamTimeout {
        attempts: u32,
        elapsed: Duration,
        last_error: String,
    },

    #[error("Upstream unreachable after {attempts} attempt(s): {last_error}")]
    UpstreamUnreachable { attempts: u32, last_error: String },

    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },
}

/// HTTP server lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Server {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },
}

fn error_response(status: StatusCode, code: &str, message: String) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message, "code": code })),
    )
        .into_response()
}

impl OrchestratorError {
    pub fn status_code(&self) -> (StatusCode, &'static str) {
        match self {
            OrchestratorError::ResourceExhausted { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "resource_exhausted")
            }
            OrchestratorError::InvalidSpec { .. } => (StatusCode::BAD_REQUEST, "invalid_spec"),
            OrchestratorError::Backend { .. } => (StatusCode::BAD_GATEWAY, "backend_error"),
            OrchestratorError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            OrchestratorError::InvalidState { .. } => (StatusCode::CONFLICT, "invalid_state"),
            OrchestratorError::NotRunning { .. } => (StatusCode::CONFLICT, "not_running"),
            OrchestratorError::DuplicateName { .. } => (StatusCode::CONFLICT, "duplicate_name"),
            OrchestratorError::UnknownName { .. } => (StatusCode::NOT_FOUND, "unknown_name"),
            OrchestratorError::UnknownAction { .. } => (StatusCode::NOT_FOUND, "unknown_action"),
            OrchestratorError::GroupExists { .. } => (StatusCode::CONFLICT, "group_exists"),
            OrchestratorError::UnknownGroup { .. } => (StatusCode::NOT_FOUND, "unknown_group"),
            OrchestratorError::PartialCleanupFailure { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "partial_cleanup_failure")
            }
        }
    }
}

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_code();
        let message = self.to_string();
        match self {
            // Name the members that failed so callers can retry just those.
            OrchestratorError::PartialCleanupFailure { details } => (
                status,
                Json(serde_json::json!({ "error": message, "code": code, "details": details })),
            )
                .into_response(),
            _ => error_response(status, code, message),
        }
    }
}

impl GatewayError {
    pub fn status_code(&self) -> (StatusCode, &'static str) {
        match self {
            GatewayError::Unauthorized { .. } => (StatusCode::UNAUTHORIZED, "unauthorized"),
            GatewayError::Expired { .. } => (StatusCode::UNAUTHORIZED, "expired"),
            GatewayError::InvalidSandboxId { .. } => (StatusCode::BAD_REQUEST, "invalid_sandbox_id"),
            GatewayError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            GatewayError::NotRunning { .. } => (StatusCode::CONFLICT, "not_running"),
            GatewayError::PayloadTooLarge { .. } => (StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large"),
            GatewayError::ConnectionPoolExhausted { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "connection_pool_exhausted")
            }
            GatewayError::UpstreamTimeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "upstream_timeout"),
            GatewayError::UpstreamUnreachable { .. } => {
                (StatusCode::BAD_GATEWAY, "upstream_unreachable")
            }
            GatewayError::InvalidRequest { .. } => (StatusCode::BAD_REQUEST, "invalid_request"),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_code();
        error_response(status, code, self.to_string())
    }
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
