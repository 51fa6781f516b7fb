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
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::sleep;

use crate::katalog_sync::logger::{log_error, log_info};
use crate::katalog_sync::server::{ErrorBody, SyncRequest};
use crate::katalog_sync::util::error::{new_error, with_context};

const COMPONENT: &str = "sidecar";
const RPC_TIMEOUT: Duration = Duration::from_secs(300);

/// Configuration for the per-workload sidecar.
#[derive(Debug, Clone)]
pub struct SidecarConfig {
    /// Daemon RPC endpoint, e.g. `http://127.0.0.1:8501`.
    pub daemon_endpoint: String,
    /// Bind address for the `/ready` probe.
    pub bind_address: String,
    pub namespace: String,
    pub pod_name: String,
    pub container_name: String,
    /// Delay between register/deregister retries.
    pub max_backoff: Duration,
}

/// HTTP client for the daemon's RPC surface.
pub struct DaemonClient {
    client: reqwest::Client,
    base_url: String,
}

impl DaemonClient {
    pub fn new(endpoint: &str) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let client = reqwest::Client::builder()
            // Register blocks on two sweeps plus catalog propagation; the
            // client deadline has to accommodate that.
            .timeout(RPC_TIMEOUT)
            .build()
            .map_err(|err| with_context(err, "Failed to build daemon client"))?;
        Ok(Self {
            client,
            base_url: endpoint.trim_end_matches('/').to_string(),
        })
    }

    async fn call(&self, path: &str, request: &SyncRequest) -> Result<(), Box<dyn Error + Send + Sync>> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(request)
            .send()
            .await
            .map_err(|err| with_context(err, format!("Failed to reach daemon at {}", self.base_url)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let message = response
            .json::<ErrorBody>()
            .await
            .map(|body| body.error)
            .unwrap_or_else(|_| format!("daemon returned {status}"));
        Err(new_error(message))
    }

    pub async fn register(&self, request: &SyncRequest) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.call("/v1/register", request).await
    }

    pub async fn deregister(&self, request: &SyncRequest) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.call("/v1/deregister", request).await
    }
}

async fn ready_probe(State(ready): State<Arc<AtomicBool>>) -> Response {
    if ready.load(Ordering::SeqCst) {
        (StatusCode::OK, "ok").into_response()
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "registering").into_response()
    }
}

fn ready_router(ready: Arc<AtomicBool>) -> Router {
    Router::new().route("/ready", get(ready_probe)).with_state(ready)
}

/// Sidecar lifecycle: register until it sticks, report ready, then
/// deregister on the first termination signal. A second signal aborts a
/// deregister still in flight.
pub async fn run(config: SidecarConfig) -> Result<(), Box<dyn Error + Send + Sync>> {
    let ready = Arc::new(AtomicBool::new(false));

    let listener = TcpListener::bind(&config.bind_address)
        .await
        .map_err(|err| with_context(err, format!("Failed to bind {}", config.bind_address)))?;
    log_info(
        COMPONENT,
        "Serving readiness probe",
        &[("address", &config.bind_address)],
    );
    let probe = ready_router(ready.clone());
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, probe).await {
            log_error(COMPONENT, "Readiness probe server exited", &[("error", &err.to_string())]);
        }
    });

    let client = DaemonClient::new(&config.daemon_endpoint)?;
    let request = SyncRequest {
        namespace: config.namespace.clone(),
        pod_name: config.pod_name.clone(),
        container_name: config.container_name.clone(),
    };

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|err| with_context(err, "Failed to install SIGTERM handler"))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|err| with_context(err, "Failed to install SIGINT handler"))?;

    // Retry registration until it succeeds or we are told to stop.
    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                log_info(COMPONENT, "Got signal to stop while registering, exiting", &[]);
                return Ok(());
            }
            _ = sigint.recv() => {
                log_info(COMPONENT, "Got signal to stop while registering, exiting", &[]);
                return Ok(());
            }
            result = client.register(&request) => match result {
                Ok(()) => break,
                Err(err) => {
                    log_error(
                        COMPONENT,
                        "Error registering with katalog-sync daemon",
                        &[("error", &err.to_string())],
                    );
                    tokio::select! {
                        _ = sigterm.recv() => {
                            log_info(COMPONENT, "Got signal to stop while registering, exiting", &[]);
                            return Ok(());
                        }
                        _ = sigint.recv() => {
                            log_info(COMPONENT, "Got signal to stop while registering, exiting", &[]);
                            return Ok(());
                        }
                        _ = sleep(config.max_backoff) => {}
                    }
                }
            }
        }
    }

    ready.store(true, Ordering::SeqCst);
    log_info(COMPONENT, "Register complete, waiting for signals", &[]);

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
    log_info(COMPONENT, "Got signal to stop, starting deregister", &[]);

    // Retry deregistration; a further signal cancels the attempt.
    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                log_info(COMPONENT, "Second signal received, abandoning deregister", &[]);
                return Ok(());
            }
            _ = sigint.recv() => {
                log_info(COMPONENT, "Second signal received, abandoning deregister", &[]);
                return Ok(());
            }
            result = client.deregister(&request) => match result {
                Ok(()) => return Ok(()),
                Err(err) => {
                    log_error(
                        COMPONENT,
                        "Error deregistering with katalog-sync daemon",
                        &[("error", &err.to_string())],
                    );
                    tokio::select! {
                        _ = sigterm.recv() => {
                            log_info(COMPONENT, "Second signal received, abandoning deregister", &[]);
                            return Ok(());
                        }
                        _ = sigint.recv() => {
                            log_info(COMPONENT, "Second signal received, abandoning deregister", &[]);
                            return Ok(());
                        }
                        _ = sleep(config.max_backoff) => {}
                    }
                }
            }
        }
    }
}
