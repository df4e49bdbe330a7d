use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::{error::SecretError, AppState};

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Create ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct CreateResponse {
    pub code: String,
    pub expires_at: i64,
}

pub async fn create_secret(
    State(state): State<AppState>,
    Json(body): Json<CreateRequest>,
) -> Response {
    let service = state.service.clone();
    // redb transactions block; run them on the blocking pool.
    match tokio::task::spawn_blocking(move || service.create(&body.content)).await {
        Ok(Ok(created)) => (
            StatusCode::CREATED,
            Json(CreateResponse {
                code: created.code,
                expires_at: created.expires_at,
            }),
        )
            .into_response(),
        Ok(Err(e)) => error_response(e),
        Err(e) => internal_error(anyhow::anyhow!("create task failed: {e}")),
    }
}

// ── Redeem ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RedeemRequest {
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct RedeemResponse {
    pub content: String,
}

pub async fn redeem_secret(
    State(state): State<AppState>,
    Json(body): Json<RedeemRequest>,
) -> Response {
    let service = state.service.clone();
    match tokio::task::spawn_blocking(move || service.redeem(&body.code)).await {
        Ok(Ok(content)) => Json(RedeemResponse { content }).into_response(),
        Ok(Err(e)) => error_response(e),
        Err(e) => internal_error(anyhow::anyhow!("redeem task failed: {e}")),
    }
}

// ── Prune ─────────────────────────────────────────────────────────────────────

pub async fn prune_secrets(State(state): State<AppState>) -> Response {
    let service = state.service.clone();
    match tokio::task::spawn_blocking(move || service.reap()).await {
        Ok(Ok(n)) => {
            info!(pruned = n, "manual prune");
            Json(json!({"pruned": n})).into_response()
        }
        Ok(Err(e)) => error_response(e),
        Err(e) => internal_error(anyhow::anyhow!("prune task failed: {e}")),
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn error_response(e: SecretError) -> Response {
    match e {
        SecretError::Validation { field, ref reason } => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"error": format!("{field} {reason}"), "field": field})),
        )
            .into_response(),
        SecretError::NotFoundOrExpired => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": e.to_string(), "field": "code"})),
        )
            .into_response(),
        SecretError::CodeSpaceExhausted { .. } | SecretError::Config(_) => {
            internal_error(anyhow::anyhow!(e))
        }
        SecretError::Store(e) => internal_error(e),
    }
}

fn internal_error(e: anyhow::Error) -> Response {
    tracing::error!(error = %e, "internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal server error"})),
    )
        .into_response()
}
