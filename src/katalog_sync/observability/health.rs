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

use serde::Serialize;

use crate::katalog_sync::daemon::Daemon;

const STATUS_READY: &str = "ready";
const STATUS_DEGRADED: &str = "degraded";
const DETAIL_MAX_LEN: usize = 200;

/// Outcome of probing one of the daemon's upstreams.
#[derive(Clone, Debug, Serialize)]
pub struct UpstreamCheck {
    pub upstream: &'static str,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Aggregate readiness served on `/healthz`. The daemon is ready exactly
/// when every upstream check passed.
#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub checks: Vec<UpstreamCheck>,
}

impl HealthReport {
    pub fn is_ready(&self) -> bool {
        self.status == STATUS_READY
    }
}

/// Clip probe failures to a sane size for a probe response, ending on a
/// char boundary so multibyte errors cannot split.
fn clip_detail(message: String) -> String {
    if message.len() <= DETAIL_MAX_LEN {
        return message;
    }
    let mut cut = DETAIL_MAX_LEN;
    while !message.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &message[..cut])
}

/// Readiness assessment for `/healthz`: probes the kubelet listing and the
/// local consul agent, reporting per-upstream results.
pub async fn readiness_report(daemon: &Daemon) -> HealthReport {
    let mut checks = Vec::new();
    for (upstream, result) in daemon.probe_upstreams().await {
        let detail = result.err().map(clip_detail);
        checks.push(UpstreamCheck {
            upstream,
            ok: detail.is_none(),
            detail,
        });
    }

    let status = if checks.iter().all(|check| check.ok) {
        STATUS_READY
    } else {
        STATUS_DEGRADED
    };

    HealthReport { status, checks }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_detail_keeps_short_messages() {
        let message = "connection refused".to_string();
        assert_eq!(clip_detail(message.clone()), message);
    }

    #[test]
    fn clip_detail_cuts_on_char_boundaries() {
        let message = "é".repeat(DETAIL_MAX_LEN);
        let clipped = clip_detail(message);
        assert!(clipped.ends_with("..."));
        assert!(clipped.len() <= DETAIL_MAX_LEN + 3);
    }
}
