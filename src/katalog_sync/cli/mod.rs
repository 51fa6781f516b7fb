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

pub mod args;
pub mod commands;

use args::{Commands, KatalogSync};

/// Dispatch the parsed CLI, returning the process exit code.
pub async fn run(args: KatalogSync) -> i32 {
    match args.command {
        Commands::Daemon(daemon_args) => commands::daemon::run(&daemon_args).await,
        Commands::Sidecar(sidecar_args) => commands::sidecar::run(&sidecar_args).await,
    }
}
