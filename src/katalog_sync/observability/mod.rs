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

//! Observability primitives for the sync daemon.
//!
//! Metrics follow the Prometheus conventions used across the project:
//! snake_case names prefixed with `katalog_sync`, counters ending with
//! `_total`, and duration histograms ending with `_seconds`, partitioned by
//! a `result` label so sweep failures are visible next to successes.

pub mod health;
pub mod metrics;
