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

use crate::katalog_sync::cli::args::SidecarArgs;
use crate::katalog_sync::cli::commands::init_logging;
use crate::katalog_sync::logger::log_error;
use crate::katalog_sync::sidecar::{self, SidecarConfig};

const COMPONENT: &str = "sidecar";

pub async fn run(args: &SidecarArgs) -> i32 {
    init_logging(&args.log_level, &args.log_format);

    let config = SidecarConfig {
        daemon_endpoint: args.katalog_sync_daemon.clone(),
        bind_address: args.bind_address.clone(),
        namespace: args.namespace.clone(),
        pod_name: args.pod_name.clone(),
        container_name: args.container_name.clone(),
        max_backoff: args.max_backoff,
    };

    match sidecar::run(config).await {
        Ok(()) => 0,
        Err(err) => {
            log_error(COMPONENT, "Sidecar failed", &[("error", &err.to_string())]);
            1
        }
    }
}
