/*
 * Copyright (C) 2025 The Katalog-sync Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::error::Error;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;

use crate::katalog_sync::daemon::{Daemon, SyncError};
use crate::katalog_sync::logger::log_info;
use crate::katalog_sync::observability::{health, metrics};
use crate::katalog_sync::util::error::with_context;

const COMPONENT: &str = "rpc";

/// Request payload shared by the register and deregister calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub namespace: String,
    #[serde(rename = "podName")]
    pub pod_name: String,
    #[serde(rename = "containerName")]
    pub container_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        let status = match &err {
            SyncError::PodNotFound { .. } => StatusCode::NOT_FOUND,
            SyncError::MisconfiguredSidecar { .. }
            | SyncError::SidecarMissing { .. }
            | SyncError::BadDuration { .. } => StatusCode::BAD_REQUEST,
            SyncError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            SyncError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            SyncError::SyncFailed { .. } | SyncError::NotReady { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        ApiError::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

async fn register(
    State(daemon): State<Arc<Daemon>>,
    Json(request): Json<SyncRequest>,
) -> Result<Json<Value>, ApiError> {
    log_info(
        COMPONENT,
        "Register request",
        &[
            ("namespace", &request.namespace),
            ("pod", &request.pod_name),
            ("container", &request.container_name),
        ],
    );
    let result = daemon
        .register(&request.namespace, &request.pod_name, &request.container_name)
        .await;
    match result {
        Ok(()) => {
            metrics::observe_rpc("register", "success");
            Ok(Json(json!({})))
        }
        Err(err) => {
            metrics::observe_rpc("register", "error");
            Err(ApiError::from(err))
        }
    }
}

async fn deregister(
    State(daemon): State<Arc<Daemon>>,
    Json(request): Json<SyncRequest>,
) -> Result<Json<Value>, ApiError> {
    log_info(
        COMPONENT,
        "Deregister request",
        &[
            ("namespace", &request.namespace),
            ("pod", &request.pod_name),
            ("container", &request.container_name),
        ],
    );
    let result = daemon
        .deregister(&request.namespace, &request.pod_name, &request.container_name)
        .await;
    match result {
        Ok(()) => {
            metrics::observe_rpc("deregister", "success");
            Ok(Json(json!({})))
        }
        Err(err) => {
            metrics::observe_rpc("deregister", "error");
            Err(ApiError::from(err))
        }
    }
}

async fn healthz(State(daemon): State<Arc<Daemon>>) -> Response {
    let report = health::readiness_report(daemon.as_ref()).await;
    let status = if report.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

async fn metrics_handler() -> Response {
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
        .into_response()
}

/// Router for the sidecar-facing RPC surface.
pub fn rpc_router(daemon: Arc<Daemon>) -> Router {
    Router::new()
        .route("/v1/register", post(register))
        .route("/v1/deregister", post(deregister))
        .with_state(daemon)
}

/// Router for the operator-facing metrics and health surface.
pub fn metrics_router(daemon: Arc<Daemon>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .with_state(daemon)
}

pub async fn serve(
    bind_address: &str,
    router: Router,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let listener = TcpListener::bind(bind_address)
        .await
        .map_err(|err| with_context(err, format!("Failed to bind {bind_address}")))?;
    log_info(COMPONENT, "Listening", &[("address", bind_address)]);
    axum::serve(listener, router)
        .await
        .map_err(|err| with_context(err, "Server exited"))?;
    Ok(())
}
