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

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Result of the last sync attempt for one service.
#[derive(Debug, Clone, Default)]
pub struct SyncStatus {
    pub last_updated: Option<Instant>,
    pub last_error: Option<String>,
}

/// Per-service sync results for a pod, materialized lazily as services are
/// first swept. `last_updated` is stamped on success as well as failure;
/// it drives the TTL-halflife throttle.
#[derive(Debug, Default)]
pub struct SyncStatuses {
    inner: Mutex<HashMap<String, SyncStatus>>,
}

impl SyncStatuses {
    /// Record the outcome of a sync attempt for `service`.
    pub fn set_result<E: std::fmt::Display>(&self, service: &str, result: &Result<(), E>) {
        let mut guard = self.inner.lock().expect("sync status lock poisoned");
        let status = guard.entry(service.to_string()).or_default();
        status.last_error = result.as_ref().err().map(|err| err.to_string());
        status.last_updated = Some(Instant::now());
    }

    /// The stored status for `service` (default entry if never swept).
    pub fn status(&self, service: &str) -> SyncStatus {
        let mut guard = self.inner.lock().expect("sync status lock poisoned");
        guard.entry(service.to_string()).or_default().clone()
    }

    /// Whether `service` is due for a TTL refresh: never updated, or the
    /// last update is at least `half_ttl` old.
    pub fn due_for_update(&self, service: &str, half_ttl: Duration) -> bool {
        match self.status(service).last_updated {
            None => true,
            Some(at) => at.elapsed() >= half_ttl,
        }
    }

    /// First recorded error across all services, if any. Iteration order is
    /// unspecified; callers only need to know whether anything is broken.
    pub fn first_error(&self) -> Option<String> {
        let guard = self.inner.lock().expect("sync status lock poisoned");
        guard.values().find_map(|status| status.last_error.clone())
    }

    /// Names of all services whose last sync attempt failed.
    pub fn broken_services(&self) -> Vec<String> {
        let guard = self.inner.lock().expect("sync status lock poisoned");
        let mut names: Vec<String> = guard
            .iter()
            .filter(|(_, status)| status.last_error.is_some())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}
