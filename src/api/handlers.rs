use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::errors::AppError;
use crate::tokens::issuance::IssueRequest;
use crate::tokens::validator::ValidationOutcome;
use crate::AppState;

// ── Request / Response DTOs ──────────────────────────────────

#[derive(Serialize)]
pub struct IssueTokenResponse {
    pub token: String,
    pub owner: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ValidateParams {
    pub token: Option<String>,
    #[serde(default, alias = "deviceId")]
    pub device_id: Option<String>,
}

#[derive(Serialize)]
pub struct ValidateTokenResponse {
    pub granted: bool,
    pub owner: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub first_binding: bool,
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
pub struct VersionParams {
    #[serde(alias = "Version")]
    pub version: Option<String>,
}

// ── Handlers ─────────────────────────────────────────────────

/// POST /api/v1/tokens: issue a new token
pub async fn issue_token(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<IssueRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<IssueTokenResponse>), AppError> {
    let result = match payload {
        Ok(Json(req)) => state.issuer.issue(req).await,
        Err(rejection) => {
            tracing::warn!("issue_token: unreadable body: {}", rejection);
            Err(AppError::InvalidInput("body"))
        }
    };

    match result {
        Ok(issued) => {
            state.metrics.record_issued(issued.custom);
            Ok((
                StatusCode::CREATED,
                Json(IssueTokenResponse {
                    token: issued.token,
                    owner: issued.owner,
                    expires_at: issued.expires_at,
                }),
            ))
        }
        Err(e) => {
            state.metrics.record_issue_failure(e.code());
            if matches!(e, AppError::InvalidInput(_) | AppError::DuplicateToken) {
                tracing::info!("issue_token rejected: {}", e);
            }
            Err(e)
        }
    }
}

/// GET /api/v1/tokens/validate?token=..&device_id=..
pub async fn validate_token_query(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ValidateParams>,
) -> Response {
    validate(&state, params).await
}

/// POST /api/v1/tokens/validate with a JSON body
pub async fn validate_token_json(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ValidateParams>, JsonRejection>,
) -> Response {
    match payload {
        Ok(Json(params)) => validate(&state, params).await,
        Err(rejection) => {
            tracing::warn!("validate_token: unreadable body: {}", rejection);
            AppError::InvalidInput("body").into_response()
        }
    }
}

async fn validate(state: &AppState, params: ValidateParams) -> Response {
    let started = Instant::now();
    let result = state
        .validator
        .validate(
            params.token.as_deref().unwrap_or_default(),
            params.device_id.as_deref(),
        )
        .await;

    let label = match &result {
        Ok(outcome) => outcome.label(),
        Err(e) => e.code(),
    };
    state.metrics.record_validation(label, started.elapsed());

    match result {
        Ok(outcome) => outcome_response(outcome),
        Err(e) => e.into_response(),
    }
}

fn outcome_response(outcome: ValidationOutcome) -> Response {
    let (status, code, message) = match outcome {
        ValidationOutcome::Granted(grant) => {
            return (
                StatusCode::OK,
                Json(ValidateTokenResponse {
                    granted: true,
                    owner: grant.owner,
                    expires_at: grant.expires_at,
                    first_binding: grant.first_binding,
                    last_used_at: grant.previous_use,
                }),
            )
                .into_response();
        }
        ValidationOutcome::NotFound => (
            StatusCode::NOT_FOUND,
            "not_found",
            "token not found or not registered",
        ),
        ValidationOutcome::Expired => (StatusCode::UNAUTHORIZED, "expired", "token has expired"),
        ValidationOutcome::DeviceConflict => (
            StatusCode::CONFLICT,
            "device_conflict",
            "token is already registered to another device",
        ),
    };

    let body = Json(json!({
        "granted": false,
        "error": {
            "message": message,
            "type": "authentication_error",
            "code": code,
        }
    }));
    (status, body).into_response()
}

/// GET /api/v1/version?version=..
pub async fn version_check(
    State(state): State<Arc<AppState>>,
    Query(params): Query<VersionParams>,
) -> Response {
    match crate::version::check(params.version.as_deref(), &state.config.current_version) {
        Some(status) => (StatusCode::OK, Json(status)).into_response(),
        None => AppError::InvalidInput("version").into_response(),
    }
}

/// GET /readyz: ready once the store answers
pub async fn readiness_check(State(state): State<Arc<AppState>>) -> StatusCode {
    match state.store.ping().await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            tracing::warn!("readiness check failed: {}", e);
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// GET /metrics: Prometheus text format
pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("metrics rendering failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
