/*
 *  Copyright 2025 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! HTTP ingress: `POST /schedules` and `GET /health`.
//!
//! Status mapping: 201 on success, 400 on validation failure, 401 on
//! missing or wrong basic auth, 409 on a duplicate named schedule, 500 on
//! store failure. The health endpoint is unauthenticated and reports the
//! scheduler's counters.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{SchedulerError, SubmitError};
use crate::registry::TaskRegistry;
use crate::request::ScheduleRequest;
use crate::runner::Counters;

/// Shared state of the HTTP surface.
#[derive(Clone)]
pub struct ApiState {
    pub registry: TaskRegistry,
    pub counters: Arc<Counters>,
    /// Basic-auth credentials; `None` disables authentication.
    pub auth: Option<(String, String)>,
}

/// Builds the router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/schedules", post(create_schedule))
        .route("/health", get(health))
        .with_state(state)
}

/// Binds and serves the API until the stop signal fires.
pub async fn serve(
    state: ApiState,
    port: u16,
    cancel: CancellationToken,
) -> Result<(), SchedulerError> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| SchedulerError::Configuration(format!("failed to bind port {}: {}", port, e)))?;

    info!(port, "http api listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| SchedulerError::Configuration(e.to_string()))
}

async fn create_schedule(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !authorized(&state, &headers) {
        return (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"metronome\"")],
            Json(json!({ "error": "authentication required" })),
        )
            .into_response();
    }

    state.counters.record_received();

    let request: ScheduleRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };

    match state.registry.submit(request).await {
        Ok(receipt) => (StatusCode::CREATED, Json(receipt)).into_response(),
        Err(SubmitError::Validation(e)) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
        Err(SubmitError::Duplicate { task_instance }) => error_response(
            StatusCode::CONFLICT,
            format!("schedule '{}' already exists", task_instance),
        ),
        Err(e) => {
            error!("schedule submission failed: {}", e);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
            )
        }
    }
}

async fn health(State(state): State<ApiState>) -> Response {
    let counters = state.counters.snapshot();
    Json(json!({ "status": "ok", "counters": counters })).into_response()
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn authorized(state: &ApiState, headers: &HeaderMap) -> bool {
    let Some((username, password)) = &state.auth else {
        return true;
    };

    let expected = format!("{}:{}", username, password);
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Basic "))
        .and_then(|encoded| BASE64.decode(encoded.as_bytes()).ok())
        .and_then(|decoded| String::from_utf8(decoded).ok())
        .map(|credentials| credentials == expected)
        .unwrap_or(false)
}

/// The OpenAPI description of the HTTP surface, with the request schema
/// derived from the actual types.
pub fn openapi_document() -> serde_json::Value {
    let schema = schemars::schema_for!(ScheduleRequest);
    let schema_value = serde_json::to_value(schema).unwrap_or_else(|_| json!({}));

    json!({
        "openapi": "3.0.3",
        "info": {
            "title": "metronome",
            "description": "Durable message scheduler: accepts schedule requests and republishes payloads to broker topics at the requested time.",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "paths": {
            "/schedules": {
                "post": {
                    "summary": "Create a scheduled task",
                    "requestBody": {
                        "required": true,
                        "content": { "application/json": { "schema": schema_value } }
                    },
                    "responses": {
                        "201": { "description": "Task scheduled" },
                        "400": { "description": "Validation failure" },
                        "401": { "description": "Missing or invalid credentials" },
                        "409": { "description": "Duplicate named schedule" },
                        "500": { "description": "Store failure" }
                    },
                    "security": [ { "basicAuth": [] } ]
                }
            },
            "/health": {
                "get": {
                    "summary": "Liveness and counters",
                    "responses": { "200": { "description": "Service is up" } }
                }
            }
        },
        "components": {
            "securitySchemes": {
                "basicAuth": { "type": "http", "scheme": "basic" }
            }
        }
    })
}
