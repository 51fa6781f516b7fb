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

use std::sync::Arc;
use std::time::Duration;

use crate::katalog_sync::cli::args::DaemonArgs;
use crate::katalog_sync::cli::commands::init_logging;
use crate::katalog_sync::config::{DaemonConfig, KubeletClientConfig};
use crate::katalog_sync::consul::{ConsulAgent, ConsulCatalog, HttpConsul};
use crate::katalog_sync::daemon::Daemon;
use crate::katalog_sync::k8s::apiserver::{InClusterPatcher, PodStatusPatcher, UnavailablePatcher};
use crate::katalog_sync::kubelet::KubeletClient;
use crate::katalog_sync::logger::{log_error, log_info, log_warn};
use crate::katalog_sync::server;

const COMPONENT: &str = "daemon";
const STARTUP_BACKOFF_FLOOR: Duration = Duration::from_secs(1);
const STARTUP_BACKOFF_CAP: Duration = Duration::from_secs(30);

pub async fn run(args: &DaemonArgs) -> i32 {
    init_logging(&args.log_level, &args.log_format);

    let daemon_config = DaemonConfig {
        min_sync_interval: args.min_sync_interval,
        max_sync_interval: args.max_sync_interval,
        default_sync_interval: args.default_sync_interval,
        default_check_ttl: args.default_check_ttl,
        sync_ttl_buffer: args.sync_ttl_buffer_duration,
    };
    let kubelet_config = KubeletClientConfig {
        api_endpoint: args.kubelet_api.clone(),
        insecure_skip_verify: args.kubelet_api_insecure_skip_verify,
    };

    let kubelet = match KubeletClient::new(&kubelet_config) {
        Ok(client) => Arc::new(client),
        Err(err) => {
            log_error(
                COMPONENT,
                "Unable to create kubelet client",
                &[("error", &err.to_string())],
            );
            return 1;
        }
    };

    let consul = match HttpConsul::new(&args.consul_api) {
        Ok(client) => Arc::new(client),
        Err(err) => {
            log_error(
                COMPONENT,
                "Unable to create consul client",
                &[("error", &err.to_string())],
            );
            return 1;
        }
    };

    // Wait for the local agent to answer before starting the loop, backing
    // off instead of crash-looping against a node that is still coming up.
    let mut backoff = STARTUP_BACKOFF_FLOOR;
    loop {
        match ConsulAgent::node_name(consul.as_ref()).await {
            Ok(node_name) => {
                log_info(COMPONENT, "Connected to consul agent", &[("node", &node_name)]);
                break;
            }
            Err(err) => {
                log_warn(
                    COMPONENT,
                    "Consul agent not available yet, retrying",
                    &[
                        ("error", &err.to_string()),
                        ("backoff", &format!("{backoff:?}")),
                    ],
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(STARTUP_BACKOFF_CAP);
            }
        }
    }

    let patcher: Arc<dyn PodStatusPatcher> = match InClusterPatcher::new() {
        Ok(patcher) => Arc::new(patcher),
        Err(err) => {
            log_warn(
                COMPONENT,
                "In-cluster credentials unavailable, readiness gate patching will fail",
                &[("error", &err.to_string())],
            );
            Arc::new(UnavailablePatcher::new(err.to_string()))
        }
    };

    let daemon = Daemon::new(
        daemon_config,
        kubelet,
        consul.clone() as Arc<dyn ConsulAgent>,
        consul as Arc<dyn ConsulCatalog>,
        patcher,
    );

    if let Some(bind_address) = args.bind_address.clone() {
        let router = server::rpc_router(daemon.clone());
        tokio::spawn(async move {
            if let Err(err) = server::serve(&bind_address, router).await {
                log_error(COMPONENT, "RPC server exited", &[("error", &err.to_string())]);
            }
        });
    }

    if let Some(bind_address) = args.metrics_bind_address.clone() {
        let router = server::metrics_router(daemon.clone());
        tokio::spawn(async move {
            if let Err(err) = server::serve(&bind_address, router).await {
                log_error(COMPONENT, "Metrics server exited", &[("error", &err.to_string())]);
            }
        });
    }

    daemon.run().await;
    0
}
