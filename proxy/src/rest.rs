use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use sqlx::PgPool;
use tracing::error;
use uuid::Uuid;

use crate::config::{ConfigCache, ConfigKey, ConfigValue};
use crate::errors::Error;
use crate::forwarder::Forwarder;
use crate::ingest::{self, IngestResponse};
use crate::metrics::{INGEST_LATENCY_SECONDS, REQUESTS_TOTAL, VALIDATION_FAILURES_TOTAL};
use crate::model::error_envelope;
use crate::query;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<ConfigCache>,
    pub forwarder: Arc<Forwarder>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/data", post(ingest_handler))
        .route("/local/devices", get(devices_handler))
        .route("/local/data/current/:device_id", get(current_handler))
        .route("/local/data/history/:device_id", get(history_handler))
        .route(
            "/config/forwarding",
            get(get_forwarding_config).put(put_forwarding_config),
        )
        .route("/health", get(health_handler))
        .with_state(state)
}

/// POST /data — gateway batch ingestion, Ruuvi Cloud compatible.
async fn ingest_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let correlation_id = Uuid::new_v4().to_string();
    REQUESTS_TOTAL.inc();
    let timer = INGEST_LATENCY_SECONDS.start_timer();

    let result = ingest::ingest(
        &state.pool,
        &state.config,
        &state.forwarder,
        &body,
        &correlation_id,
    )
    .await;
    timer.observe_duration();

    let response = match result {
        Ok(IngestResponse::Upstream { status, body }) => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
            (
                status,
                [(header::CONTENT_TYPE, "application/json")],
                body,
            )
                .into_response()
        }
        Ok(IngestResponse::Local(envelope)) => (StatusCode::OK, Json(envelope)).into_response(),
        Err(Error::Validation(message)) => {
            VALIDATION_FAILURES_TOTAL.inc();
            (
                StatusCode::BAD_REQUEST,
                Json(error_envelope("VALIDATION_ERROR", &message)),
            )
                .into_response()
        }
        Err(e) => {
            error!("[{}] Ingestion failed: {}", correlation_id, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(error_envelope("INTERNAL_ERROR", "Internal server error")),
            )
                .into_response()
        }
    };

    with_correlation_id(response, &correlation_id)
}

/// GET /local/devices
async fn devices_handler(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    Ok(Json(query::list_devices(&state.pool).await?))
}

/// GET /local/data/current/{device_id}
async fn current_handler(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(query::current_reading(&state.pool, &device_id).await?))
}

/// GET /local/data/history/{device_id}?start_time&end_time&limit&next_token
async fn history_handler(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let parsed = query::parse_history_params(&device_id, &params)?;
    Ok(Json(query::history(&state.pool, &device_id, parsed).await?))
}

/// GET /config/forwarding
async fn get_forwarding_config(State(state): State<AppState>) -> Json<Value> {
    let enabled = state.config.entry(ConfigKey::ForwardingEnabled).await;
    let endpoint = state.config.entry(ConfigKey::RuuviCloudEndpoint).await;

    Json(json!({
        "forwarding_enabled": enabled.value.as_json(),
        "ruuvi_cloud_endpoint": endpoint.value.as_json(),
        "last_updated": enabled.last_updated,
        "updated_by": enabled.updated_by,
        "is_default": enabled.is_default,
    }))
}

/// PUT /config/forwarding — `{"enabled": bool}`
async fn put_forwarding_config(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let parsed: Value = serde_json::from_slice(&body)
        .map_err(|e| Error::Validation(format!("Invalid JSON in request body: {e}")))?;

    let enabled = parsed
        .get("enabled")
        .and_then(Value::as_bool)
        .ok_or_else(|| Error::Validation("'enabled' must be a boolean".to_string()))?;

    let updated_at = state
        .config
        .set(
            ConfigKey::ForwardingEnabled,
            ConfigValue::Bool(enabled),
            "admin-api",
        )
        .await?;

    Ok(Json(json!({
        "result": "success",
        "forwarding_enabled": enabled,
        "updated_at": updated_at,
    })))
}

async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let breaker = state.forwarder.breaker().snapshot();
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().timestamp(),
        "circuit_breaker": {
            "state": breaker.state.to_string(),
            "consecutive_failures": breaker.consecutive_failures,
        },
    }))
}

fn with_correlation_id(mut response: Response, correlation_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(correlation_id) {
        response.headers_mut().insert("x-correlation-id", value);
    }
    response
}

/// Maps the error taxonomy onto query/config endpoint responses.
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self.0 {
            Error::Validation(message) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", message.clone())
            }
            Error::ConfigValidation { .. } => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                self.0.to_string(),
            ),
            Error::NotFound(what) => (
                StatusCode::NOT_FOUND,
                "DEVICE_NOT_FOUND",
                format!("{what} not found"),
            ),
            other => {
                error!("API error: {}", other);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "Internal server error".to_string(),
                )
            }
        };

        (
            status,
            Json(json!({
                "error": { "code": code, "message": message }
            })),
        )
            .into_response()
    }
}
