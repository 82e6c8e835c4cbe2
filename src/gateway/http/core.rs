use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use super::ledger::{DEFAULT_PAGE_SIZE, page_bounds};
use super::{
    Account, ApiKeyRecord, ChatCompletion, ChatRequest, Gateway, GatewayError, LedgerError,
    Money, ObservabilitySnapshot, StoreError, TransactionRecord,
};

#[derive(Clone)]
pub struct GatewayHttpState {
    gateway: Arc<Gateway>,
    admin_token: Option<String>,
}

impl GatewayHttpState {
    pub fn new(gateway: Gateway) -> Self {
        Self::from_shared(Arc::new(gateway))
    }

    pub fn from_shared(gateway: Arc<Gateway>) -> Self {
        Self {
            gateway,
            admin_token: None,
        }
    }

    /// Enables the `/admin` routes. Without a token they answer 404.
    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.admin_token = (!token.trim().is_empty()).then_some(token);
        self
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

pub fn router(state: GatewayHttpState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/api/chat", post(handle_chat_completions))
        .route("/admin/accounts/:account_id", get(get_account))
        .route("/admin/accounts/:account_id/credit", post(credit_account))
        .route(
            "/admin/accounts/:account_id/transactions",
            get(list_transactions),
        )
        .route(
            "/admin/accounts/:account_id/keys",
            get(list_keys).post(create_key),
        )
        .route("/admin/accounts/:account_id/keys/:key", delete(delete_key))
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn metrics(State(state): State<GatewayHttpState>) -> Json<ObservabilitySnapshot> {
    Json(state.gateway.observability())
}

fn error_response(
    status: StatusCode,
    kind: &'static str,
    code: &'static str,
    message: impl Into<String>,
) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail {
                message: message.into(),
                kind: kind.to_string(),
                code: code.to_string(),
                details: None,
            },
        }),
    )
}

fn map_gateway_error(
    state: &GatewayHttpState,
    err: &GatewayError,
) -> (StatusCode, Json<ErrorResponse>) {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let details = state
        .gateway
        .environment()
        .exposes_details()
        .then(|| err.details().map(str::to_string))
        .flatten();
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail {
                message: err.public_message(),
                kind: err.error_type().to_string(),
                code: err.code().to_string(),
                details,
            },
        }),
    )
}

fn extract_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let auth = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())?
        .trim()
        .to_string();
    let rest = auth
        .strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))?;
    let token = rest.trim();
    (!token.is_empty()).then(|| token.to_string())
}
