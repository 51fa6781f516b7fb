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

use clap::{Args, Parser, Subcommand};
use std::time::Duration;

/// Parse a humantime duration argument (`500ms`, `5s`, `1m`).
fn parse_duration_arg(s: &str) -> Result<Duration, String> {
    humantime::parse_duration(s).map_err(|err| err.to_string())
}

/// Sync kubelet-local pods into the node's consul agent.
#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct KatalogSync {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the node-singleton sync daemon
    Daemon(DaemonArgs),

    /// Run the per-workload sidecar
    Sidecar(SidecarArgs),
}

#[derive(Args, Debug)]
pub struct DaemonArgs {
    /// Address for binding the RPC interface for sidecars; unset disables it
    #[arg(long = "bind-address", env = "BIND_ADDRESS")]
    pub bind_address: Option<String>,

    /// Address for binding the metrics and health interface; unset disables it
    #[arg(long = "metrics-bind-address", env = "METRICS_BIND_ADDRESS")]
    pub metrics_bind_address: Option<String>,

    /// Log level (debug, info, warn, error)
    #[arg(long = "log-level", env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long = "log-format", env = "LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// Minimum duration allowed between syncs
    #[arg(
        long = "min-sync-interval",
        env = "MIN_SYNC_INTERVAL",
        default_value = "500ms",
        value_parser = parse_duration_arg
    )]
    pub min_sync_interval: Duration,

    /// Maximum duration allowed between syncs
    #[arg(
        long = "max-sync-interval",
        env = "MAX_SYNC_INTERVAL",
        default_value = "5s",
        value_parser = parse_duration_arg
    )]
    pub max_sync_interval: Duration,

    /// Sync interval for pods without a sync-interval annotation
    #[arg(
        long = "default-sync-interval",
        env = "DEFAULT_SYNC_INTERVAL",
        default_value = "1s",
        value_parser = parse_duration_arg
    )]
    pub default_sync_interval: Duration,

    /// Check TTL for pods without a service-check-ttl annotation
    #[arg(
        long = "default-check-ttl",
        env = "DEFAULT_CHECK_TTL",
        default_value = "10s",
        value_parser = parse_duration_arg
    )]
    pub default_check_ttl: Duration,

    /// How much slack to ensure between sync time and check TTL
    #[arg(
        long = "sync-ttl-buffer-duration",
        env = "SYNC_TTL_BUFFER_DURATION",
        default_value = "10s",
        value_parser = parse_duration_arg
    )]
    pub sync_ttl_buffer_duration: Duration,

    /// Kubelet API endpoint
    #[arg(
        long = "kubelet-api",
        env = "KUBELET_API",
        default_value = "http://localhost:10255/pods"
    )]
    pub kubelet_api: String,

    /// Skip verification of the TLS certificate from the kubelet API
    #[arg(long = "kubelet-api-insecure-skip-verify", env = "KUBELET_API_INSECURE_SKIP_VERIFY")]
    pub kubelet_api_insecure_skip_verify: bool,

    /// Consul agent HTTP endpoint
    #[arg(
        long = "consul-api",
        env = "CONSUL_HTTP_ADDR",
        default_value = "http://127.0.0.1:8500"
    )]
    pub consul_api: String,
}

#[derive(Args, Debug)]
pub struct SidecarArgs {
    /// katalog-sync daemon RPC endpoint
    #[arg(long = "katalog-sync-daemon", env = "KATALOG_SYNC_DAEMON")]
    pub katalog_sync_daemon: String,

    /// Cap on the retry delay while talking to the daemon
    #[arg(
        long = "katalog-sync-daemon-max-backoff",
        env = "KATALOG_SYNC_DAEMON_MAX_BACKOFF",
        default_value = "1s",
        value_parser = parse_duration_arg
    )]
    pub max_backoff: Duration,

    /// Address for binding the readiness probe
    #[arg(long = "bind-address", env = "BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    pub bind_address: String,

    /// Namespace this workload is running in
    #[arg(long = "namespace", env = "NAMESPACE")]
    pub namespace: String,

    /// Pod this workload is running in
    #[arg(long = "pod-name", env = "POD_NAME")]
    pub pod_name: String,

    /// Container the sidecar is running as
    #[arg(long = "container-name", env = "CONTAINER_NAME")]
    pub container_name: String,

    /// Log level (debug, info, warn, error)
    #[arg(long = "log-level", env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long = "log-format", env = "LOG_FORMAT", default_value = "text")]
    pub log_format: String,
}
