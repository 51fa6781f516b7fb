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

use std::time::Duration;

/// Configuration for the reconciliation engine.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Minimum spacing between reconciliation sweeps.
    pub min_sync_interval: Duration,
    /// Maximum sleep between reconciliation sweeps.
    pub max_sync_interval: Duration,
    /// Sync interval for pods without a `sync-interval` annotation.
    pub default_sync_interval: Duration,
    /// Check TTL for pods without a `service-check-ttl` annotation.
    pub default_check_ttl: Duration,
    /// Slack required between a pod's sync interval and its check TTL.
    pub sync_ttl_buffer: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            min_sync_interval: Duration::from_millis(500),
            max_sync_interval: Duration::from_secs(5),
            default_sync_interval: Duration::from_secs(1),
            default_check_ttl: Duration::from_secs(10),
            sync_ttl_buffer: Duration::from_secs(10),
        }
    }
}

/// Configuration for the kubelet pod-inventory client.
#[derive(Debug, Clone)]
pub struct KubeletClientConfig {
    /// Kubelet pod listing endpoint.
    pub api_endpoint: String,
    /// Skip verification of the kubelet's TLS certificate.
    pub insecure_skip_verify: bool,
}

impl Default for KubeletClientConfig {
    fn default() -> Self {
        Self {
            api_endpoint: "http://localhost:10255/pods".to_string(),
            insecure_skip_verify: false,
        }
    }
}
