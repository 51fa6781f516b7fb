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

use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_gauge_with_registry, Encoder, HistogramOpts, HistogramVec, IntCounterVec,
    IntGauge, Opts, Registry, TextEncoder,
};

const SYNC_BUCKETS: &[f64] = &[0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 15.0];

/// The daemon's collectors, built together with their registry on first use.
struct Collectors {
    registry: Registry,
    kubelet_sync_total: IntCounterVec,
    kubelet_sync_duration: HistogramVec,
    consul_sync_total: IntCounterVec,
    consul_sync_duration: HistogramVec,
    pods: IntGauge,
    rpc_requests_total: IntCounterVec,
}

static COLLECTORS: OnceLock<Collectors> = OnceLock::new();

fn collectors() -> &'static Collectors {
    COLLECTORS.get_or_init(|| {
        let registry = Registry::new_custom(Some("katalog_sync".to_string()), None)
            .expect("metrics namespace is valid");

        let kubelet_sync_total = register_int_counter_vec_with_registry!(
            Opts::new(
                "kubelet_sync_total",
                "Completed syncs from the kubelet API, partitioned by result",
            ),
            &["result"],
            registry
        )
        .expect("kubelet sync counter");

        let kubelet_sync_duration = register_histogram_vec_with_registry!(
            HistogramOpts::new(
                "kubelet_sync_duration_seconds",
                "Latency of the kubelet fetch phase of a sweep",
            )
            .buckets(SYNC_BUCKETS.to_vec()),
            &["result"],
            registry
        )
        .expect("kubelet sync histogram");

        let consul_sync_total = register_int_counter_vec_with_registry!(
            Opts::new(
                "consul_sync_total",
                "Completed syncs to the consul agent, partitioned by result",
            ),
            &["result"],
            registry
        )
        .expect("consul sync counter");

        let consul_sync_duration = register_histogram_vec_with_registry!(
            HistogramOpts::new(
                "consul_sync_duration_seconds",
                "Latency of the consul sweep phase",
            )
            .buckets(SYNC_BUCKETS.to_vec()),
            &["result"],
            registry
        )
        .expect("consul sync histogram");

        let pods = register_int_gauge_with_registry!(
            Opts::new("pods", "Number of pods currently tracked by the daemon"),
            registry
        )
        .expect("pods gauge");

        let rpc_requests_total = register_int_counter_vec_with_registry!(
            Opts::new(
                "rpc_requests_total",
                "Sidecar RPC requests, partitioned by method and result",
            ),
            &["method", "result"],
            registry
        )
        .expect("rpc request counter");

        Collectors {
            registry,
            kubelet_sync_total,
            kubelet_sync_duration,
            consul_sync_total,
            consul_sync_duration,
            pods,
            rpc_requests_total,
        }
    })
}

pub fn observe_kubelet_sync(result: &str, elapsed: Duration) {
    let collectors = collectors();
    collectors
        .kubelet_sync_total
        .with_label_values(&[result])
        .inc();
    collectors
        .kubelet_sync_duration
        .with_label_values(&[result])
        .observe(elapsed.as_secs_f64());
}

pub fn observe_consul_sync(result: &str, elapsed: Duration) {
    let collectors = collectors();
    collectors
        .consul_sync_total
        .with_label_values(&[result])
        .inc();
    collectors
        .consul_sync_duration
        .with_label_values(&[result])
        .observe(elapsed.as_secs_f64());
}

pub fn set_pods_tracked(count: usize) {
    collectors().pods.set(count as i64);
}

pub fn observe_rpc(method: &str, result: &str) {
    collectors()
        .rpc_requests_total
        .with_label_values(&[method, result])
        .inc();
}

/// Render the registry in the Prometheus text exposition format.
pub fn render() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder
        .encode(&collectors().registry.gather(), &mut buffer)
        .is_err()
    {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
