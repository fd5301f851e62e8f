//! HTTP API: function registration, invocation, warm-up and pool
//! inspection.

use std::{sync::Arc, time::Instant};

use anyhow::{Context, Result};
use axum::{
    Json,
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bytes::Bytes;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{
    dispatcher::Dispatcher,
    error::InvocationError,
    function::{FunctionId, FunctionMetadata},
    function_store::FunctionStore,
    http_models::{ErrorResponse, FunctionResponse, HealthResponse, MessageResponse, PoolResponse},
};

const FUNCTION_NOT_FOUND: &str = "Function not found";

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<FunctionStore>,
    pub dispatcher: Dispatcher,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(store: Arc<FunctionStore>, dispatcher: Dispatcher) -> Self {
        Self {
            store,
            dispatcher,
            start_time: Instant::now(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/pool", get(pool))
        .route("/functions", post(create_function).get(list_functions))
        .route(
            "/functions/{id}",
            get(get_function)
                .put(update_function)
                .delete(delete_function),
        )
        .route("/functions/{id}/invoke", post(invoke_function))
        .route("/functions/{id}/warmup", post(warmup_function))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API on `addr` until `cancel_token` fires, then drain in-flight
/// requests.
pub async fn run_http_server(
    addr: &str,
    state: AppState,
    cancel_token: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind HTTP server to {}", addr))?;
    info!(addr = %addr, "HTTP server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            cancel_token.cancelled().await;
            info!("HTTP server shutting down");
        })
        .await
        .context("HTTP server error")?;
    Ok(())
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (status, Json(ErrorResponse::new(error))).into_response()
}

fn parse_metadata(body: &[u8]) -> Result<FunctionMetadata, Response> {
    let metadata: FunctionMetadata = serde_json::from_slice(body)
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, format!("Invalid function: {}", e)))?;
    metadata
        .validate()
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, format!("Invalid function: {}", e)))?;
    Ok(metadata)
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse { healthy: true })
}

async fn pool(State(state): State<AppState>) -> impl IntoResponse {
    Json(PoolResponse {
        snapshot: state.dispatcher.pool().snapshot(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

async fn create_function(State(state): State<AppState>, body: Bytes) -> Response {
    let metadata = match parse_metadata(&body) {
        Ok(metadata) => metadata,
        Err(response) => return response,
    };
    match state.store.create(metadata).await {
        Ok(function) => (
            StatusCode::CREATED,
            Json(FunctionResponse {
                msg: "Function created".to_string(),
                function,
            }),
        )
            .into_response(),
        Err(e) => {
            error!(error = ?e, "Failed to create function");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn list_functions(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.list().await)
}

async fn get_function(State(state): State<AppState>, Path(id): Path<FunctionId>) -> Response {
    match state.store.get(id).await {
        Some(function) => Json(function).into_response(),
        None => error_response(StatusCode::NOT_FOUND, FUNCTION_NOT_FOUND),
    }
}

async fn update_function(
    State(state): State<AppState>,
    Path(id): Path<FunctionId>,
    body: Bytes,
) -> Response {
    let metadata = match parse_metadata(&body) {
        Ok(metadata) => metadata,
        Err(response) => return response,
    };
    match state.store.update(id, metadata).await {
        Ok(Some(function)) => Json(FunctionResponse {
            msg: "Function updated".to_string(),
            function,
        })
        .into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, FUNCTION_NOT_FOUND),
        Err(e) => {
            error!(function_id = id, error = ?e, "Failed to update function");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn delete_function(State(state): State<AppState>, Path(id): Path<FunctionId>) -> Response {
    match state.store.delete(id).await {
        Ok(true) => Json(MessageResponse {
            msg: format!("Function with ID {} deleted.", id),
        })
        .into_response(),
        Ok(false) => error_response(StatusCode::NOT_FOUND, FUNCTION_NOT_FOUND),
        Err(e) => {
            error!(function_id = id, error = ?e, "Failed to delete function");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// An empty body is an absent payload; anything else must be one JSON value.
fn parse_payload(body: &[u8]) -> Result<Option<Value>, InvocationError> {
    if body.trim_ascii().is_empty() {
        return Ok(None);
    }
    serde_json::from_slice(body)
        .map(Some)
        .map_err(|e| InvocationError::InvalidRequestPayload {
            reason: e.to_string(),
        })
}

async fn invoke_function(
    State(state): State<AppState>,
    Path(id): Path<FunctionId>,
    body: Bytes,
) -> Result<Json<Value>, InvocationError> {
    let function = state
        .store
        .get(id)
        .await
        .ok_or(InvocationError::FunctionNotFound { function_id: id })?;
    let payload = parse_payload(&body)?;
    let body = state.dispatcher.invoke(&function, payload).await?;
    Ok(Json(body))
}

async fn warmup_function(
    State(state): State<AppState>,
    Path(id): Path<FunctionId>,
) -> Result<(StatusCode, Json<Value>), InvocationError> {
    let function = state
        .store
        .get(id)
        .await
        .ok_or(InvocationError::FunctionNotFound { function_id: id })?;
    let (status, body) = state.dispatcher.warmup(&function).await;
    Ok((status, Json(body)))
}
