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

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::katalog_sync::config::DaemonConfig;
use crate::katalog_sync::consul::types::AgentService;
use crate::katalog_sync::daemon::error::SyncError;
use crate::katalog_sync::daemon::status::SyncStatuses;
use crate::katalog_sync::k8s::apiserver::{build_pod_condition_patch, PodStatusPatcher};
use crate::katalog_sync::k8s::pod::{Pod, PodCondition};
use crate::katalog_sync::logger::{log_debug, log_warn};
use crate::katalog_sync::util;

/// Condition type of the readiness gate this daemon completes.
pub const READINESS_GATE_TYPE: &str = "katalog-sync.wish.com/synced";

// Annotation keys, all under the katalog-sync.wish.com/ prefix.
pub const ANNOTATION_SERVICE_NAMES: &str = "katalog-sync.wish.com/service-names";
pub const ANNOTATION_SERVICE_PORT: &str = "katalog-sync.wish.com/service-port";
pub const ANNOTATION_SERVICE_PORT_OVERRIDE: &str = "katalog-sync.wish.com/service-port-";
pub const ANNOTATION_SERVICE_TAGS: &str = "katalog-sync.wish.com/service-tags";
pub const ANNOTATION_SERVICE_TAGS_OVERRIDE: &str = "katalog-sync.wish.com/service-tags-";
pub const ANNOTATION_SERVICE_META: &str = "katalog-sync.wish.com/service-meta";
pub const ANNOTATION_SERVICE_META_OVERRIDE: &str = "katalog-sync.wish.com/service-meta-";
pub const ANNOTATION_SERVICE_HEALTH: &str = "katalog-sync.wish.com/service-health";
pub const ANNOTATION_SERVICE_HEALTH_OVERRIDE: &str = "katalog-sync.wish.com/service-health-";
pub const ANNOTATION_SIDECAR: &str = "katalog-sync.wish.com/sidecar";
pub const ANNOTATION_SYNC_INTERVAL: &str = "katalog-sync.wish.com/sync-interval";
pub const ANNOTATION_SERVICE_CHECK_TTL: &str = "katalog-sync.wish.com/service-check-ttl";
pub const ANNOTATION_CONTAINER_EXCLUDE: &str = "katalog-sync.wish.com/container-exclude";

const COMPONENT: &str = "pod";

/// Cache key for a pod, `namespace/name` with an empty namespace reading as
/// `default`.
pub fn pod_cache_key(namespace: &str, name: &str) -> String {
    let namespace = if namespace.is_empty() { "default" } else { namespace };
    format!("{namespace}/{name}")
}

/// Negotiated state of the pod's sidecar container.
#[derive(Debug, Clone)]
pub struct SidecarState {
    pub container_name: String,
    pub ready: bool,
}

/// A pod under management: the latest kubelet snapshot plus the sync state
/// the daemon layers on top of it.
///
/// The reconciliation loop owns table membership and replaces the snapshot;
/// RPC handlers only flip the sidecar state; the waiter task only flips
/// `initial_sync_done`. Everything else is derived on read.
#[derive(Debug)]
pub struct SyncPod {
    pod: RwLock<Pod>,
    sidecar: Option<Mutex<SidecarState>>,
    pub sync_statuses: SyncStatuses,
    pub check_ttl: Duration,
    pub sync_interval: Duration,
    outstanding_readiness_gate: AtomicBool,
    initial_sync_done: AtomicBool,
    cancel: CancellationToken,
    gate_lock: tokio::sync::Mutex<()>,
}

fn parse_annotation_duration(pod: &Pod, key: &str) -> Result<Option<Duration>, SyncError> {
    match pod.annotation(key) {
        None => Ok(None),
        Some(value) => humantime::parse_duration(value)
            .map(Some)
            .map_err(|err| SyncError::BadDuration {
                annotation: key.to_string(),
                value: value.to_string(),
                detail: err.to_string(),
            }),
    }
}

impl SyncPod {
    /// Build the managed record for a pod snapshot. Fails when the annotated
    /// sidecar container is absent from the container statuses or when a
    /// duration annotation does not parse.
    pub fn new(pod: Pod, config: &DaemonConfig) -> Result<Self, SyncError> {
        // Seed sidecar readiness from the container status so a daemon
        // restart does not force a sidecar re-negotiation.
        let sidecar = match pod.annotation(ANNOTATION_SIDECAR) {
            None => None,
            Some(container_name) => {
                let status = pod
                    .container_statuses()
                    .iter()
                    .find(|status| status.name == container_name)
                    .ok_or_else(|| SyncError::SidecarMissing {
                        container: container_name.to_string(),
                    })?;
                Some(Mutex::new(SidecarState {
                    container_name: container_name.to_string(),
                    ready: status.ready,
                }))
            }
        };

        let outstanding_readiness_gate = pod
            .spec
            .readiness_gates
            .iter()
            .any(|gate| gate.condition_type == READINESS_GATE_TYPE);

        let sync_interval = parse_annotation_duration(&pod, ANNOTATION_SYNC_INTERVAL)?
            .unwrap_or(config.default_sync_interval);
        let mut check_ttl = parse_annotation_duration(&pod, ANNOTATION_SERVICE_CHECK_TTL)?
            .unwrap_or(config.default_check_ttl);

        // The TTL must outlive a sweep by the configured buffer, otherwise
        // checks would flap between refreshes.
        let min_check_ttl = sync_interval + config.sync_ttl_buffer;
        if check_ttl < min_check_ttl {
            check_ttl = min_check_ttl;
        }

        Ok(Self {
            pod: RwLock::new(pod),
            sidecar,
            sync_statuses: SyncStatuses::default(),
            check_ttl,
            sync_interval,
            outstanding_readiness_gate: AtomicBool::new(outstanding_readiness_gate),
            initial_sync_done: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            gate_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Replace the kubelet snapshot with a fresh one.
    pub fn update_pod(&self, pod: Pod) {
        *self.pod.write().expect("pod snapshot lock poisoned") = pod;
    }

    /// Clone of the current kubelet snapshot.
    pub fn snapshot(&self) -> Pod {
        self.pod.read().expect("pod snapshot lock poisoned").clone()
    }

    pub fn cache_key(&self) -> String {
        let pod = self.pod.read().expect("pod snapshot lock poisoned");
        pod_cache_key(pod.namespace(), pod.name())
    }

    pub fn pod_ip(&self) -> String {
        self.pod
            .read()
            .expect("pod snapshot lock poisoned")
            .pod_ip()
            .to_string()
    }

    pub fn has_sidecar(&self) -> bool {
        self.sidecar.is_some()
    }

    pub fn sidecar_state(&self) -> Option<SidecarState> {
        self.sidecar
            .as_ref()
            .map(|state| state.lock().expect("sidecar lock poisoned").clone())
    }

    /// Record the sidecar handshake: the container name the sidecar reports
    /// for itself plus its readiness. No-op when no sidecar is annotated.
    pub fn set_sidecar(&self, container_name: &str, ready: bool) {
        if let Some(state) = self.sidecar.as_ref() {
            let mut guard = state.lock().expect("sidecar lock poisoned");
            guard.container_name = container_name.to_string();
            guard.ready = ready;
        }
    }

    /// Flip only the sidecar readiness, keeping the negotiated name.
    pub fn set_sidecar_ready(&self, ready: bool) {
        if let Some(state) = self.sidecar.as_ref() {
            state.lock().expect("sidecar lock poisoned").ready = ready;
        }
    }

    pub fn outstanding_readiness_gate(&self) -> bool {
        self.outstanding_readiness_gate.load(Ordering::SeqCst)
    }

    pub fn initial_sync_done(&self) -> bool {
        self.initial_sync_done.load(Ordering::SeqCst)
    }

    pub fn set_initial_sync_done(&self, done: bool) {
        self.initial_sync_done.store(done, Ordering::SeqCst);
    }

    /// Token fired when the pod leaves the kubelet inventory; long-polls
    /// and the waiter task hang off it.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Service names from the `service-names` annotation, verbatim.
    pub fn service_names(&self) -> Vec<String> {
        let pod = self.pod.read().expect("pod snapshot lock poisoned");
        util::split_list(pod.annotation(ANNOTATION_SERVICE_NAMES).unwrap_or_default())
    }

    pub fn has_service_name(&self, name: &str) -> bool {
        self.service_names().iter().any(|candidate| candidate == name)
    }

    /// The agent-side identifier for one of this pod's services.
    pub fn service_id(&self, service_name: &str) -> String {
        let pod = self.pod.read().expect("pod snapshot lock poisoned");
        format!(
            "katalog-sync_{}_{}_{}",
            service_name,
            pod.metadata.namespace.clone().unwrap_or_default(),
            pod.name()
        )
    }

    /// Port for a service: per-service annotation, then the shared
    /// annotation, then the first container port in the spec, then -1.
    pub fn port(&self, service_name: &str) -> i32 {
        let pod = self.pod.read().expect("pod snapshot lock poisoned");

        for key in [
            format!("{ANNOTATION_SERVICE_PORT_OVERRIDE}{service_name}"),
            ANNOTATION_SERVICE_PORT.to_string(),
        ] {
            if let Some(value) = pod.annotation(&key) {
                match value.parse::<i32>() {
                    Ok(port) => return port,
                    Err(err) => log_warn(
                        COMPONENT,
                        "Unable to parse port annotation",
                        &[("annotation", &key), ("value", value), ("error", &err.to_string())],
                    ),
                }
            }
        }

        for container in &pod.spec.containers {
            if let Some(port) = container.ports.first() {
                return port.container_port;
            }
        }

        log_warn(
            COMPONENT,
            "No port derivable for service, registering with -1",
            &[("service", service_name), ("pod", pod.name())],
        );
        -1
    }

    /// Tags for a service: per-service annotation wins over the shared one.
    pub fn tags(&self, service_name: &str) -> Vec<String> {
        let pod = self.pod.read().expect("pod snapshot lock poisoned");
        let override_key = format!("{ANNOTATION_SERVICE_TAGS_OVERRIDE}{service_name}");
        if let Some(tags) = pod.annotation(&override_key) {
            return util::split_list(tags);
        }
        if let Some(tags) = pod.annotation(ANNOTATION_SERVICE_TAGS) {
            return util::split_list(tags);
        }
        Vec::new()
    }

    /// User-supplied service metadata (`k:v,k:v`); per-service wins.
    pub fn service_meta(&self, service_name: &str) -> HashMap<String, String> {
        let pod = self.pod.read().expect("pod snapshot lock poisoned");
        let override_key = format!("{ANNOTATION_SERVICE_META_OVERRIDE}{service_name}");
        if let Some(meta) = pod.annotation(&override_key) {
            return util::parse_map(meta);
        }
        if let Some(meta) = pod.annotation(ANNOTATION_SERVICE_META) {
            return util::parse_map(meta);
        }
        HashMap::new()
    }

    /// Fixed health annotation for a service, falling back to `fallback`
    /// when the pod pins no health for it.
    pub fn service_health(&self, service_name: &str, fallback: &str) -> String {
        let pod = self.pod.read().expect("pod snapshot lock poisoned");
        let override_key = format!("{ANNOTATION_SERVICE_HEALTH_OVERRIDE}{service_name}");
        if let Some(health) = pod.annotation(&override_key) {
            return health.to_string();
        }
        if let Some(health) = pod.annotation(ANNOTATION_SERVICE_HEALTH) {
            return health.to_string();
        }
        fallback.to_string()
    }

    /// Containers excluded from the readiness conjunction.
    pub fn container_exclusion(&self) -> HashSet<String> {
        let pod = self.pod.read().expect("pod snapshot lock poisoned");
        match pod.annotation(ANNOTATION_CONTAINER_EXCLUDE) {
            None => HashSet::new(),
            Some(value) => util::split_list(value).into_iter().collect(),
        }
    }

    /// Whether the agent's registered view is structurally stale: the port
    /// or the pod IP differs. Tag and meta drift rides the TTL cycle.
    pub fn has_change(&self, service: &AgentService) -> bool {
        if service.port != self.port(&service.service) {
            return true;
        }
        let pod = self.pod.read().expect("pod snapshot lock poisoned");
        if service.address != pod.pod_ip() {
            return true;
        }
        false
    }

    /// Derive pod readiness and the per-container readiness map.
    ///
    /// A declared-but-unready sidecar and a pod in terminating both read as
    /// not ready with no container map, mirroring how terminating pods are
    /// dropped from service endpoints.
    pub fn ready(&self) -> (bool, Option<BTreeMap<String, bool>>) {
        if let Some(state) = self.sidecar.as_ref() {
            if !state.lock().expect("sidecar lock poisoned").ready {
                return (false, None);
            }
        }

        let pod = self.pod.read().expect("pod snapshot lock poisoned");
        if pod.metadata.deletion_timestamp.is_some() {
            return (false, None);
        }

        let sidecar_name = self
            .sidecar
            .as_ref()
            .map(|state| state.lock().expect("sidecar lock poisoned").container_name.clone());

        let mut exclude = match pod.annotation(ANNOTATION_CONTAINER_EXCLUDE) {
            None => HashSet::new(),
            Some(value) => util::split_list(value).into_iter().collect::<HashSet<String>>(),
        };

        let mut pod_ready = true;
        let mut container_readiness = BTreeMap::new();
        for status in pod.container_statuses() {
            if exclude.remove(&status.name) {
                continue;
            }
            if sidecar_name.as_deref() == Some(status.name.as_str()) {
                continue;
            }
            pod_ready = pod_ready && status.ready;
            container_readiness.insert(status.name.clone(), status.ready);
        }

        if !exclude.is_empty() {
            let missing = exclude.into_iter().collect::<Vec<_>>().join(",");
            log_warn(
                COMPONENT,
                "Some excluded containers not found in pod",
                &[("pod", pod.name()), ("containers", &missing)],
            );
        }

        (pod_ready, Some(container_readiness))
    }

    /// Compute and publish the readiness-gate condition for this pod.
    ///
    /// Serialized per pod; invoked after every sweep and once more by the
    /// waiter task when the initial cluster-wide sync is observed.
    pub async fn handle_readiness_gate(
        &self,
        patcher: &dyn PodStatusPatcher,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let _guard = self.gate_lock.lock().await;

        if !self.outstanding_readiness_gate() {
            return Ok(());
        }

        let snapshot = self.snapshot();
        let existing = snapshot.condition(READINESS_GATE_TYPE).cloned();
        if let Some(condition) = existing.as_ref() {
            if condition.status == "True" {
                self.outstanding_readiness_gate.store(false, Ordering::SeqCst);
                return Ok(());
            }
        }

        let (ready, readiness_map) = self.ready();
        let (status, reason, message) = if ready {
            let broken = self.sync_statuses.broken_services();
            if !broken.is_empty() {
                (
                    "False",
                    "Not all services synced to consul",
                    format!(
                        "The following services haven't been synced to consul yet: [{}]",
                        broken.join(", ")
                    ),
                )
            } else if !self.initial_sync_done() {
                (
                    "False",
                    "Not synced to remote consul",
                    "State synced to local consul, waiting on sync to remote consul".to_string(),
                )
            } else {
                ("True", "Done", "Done".to_string())
            }
        } else {
            (
                "False",
                "Not all containers are ready",
                serde_json::to_string_pretty(&readiness_map).unwrap_or_else(|_| "null".to_string()),
            )
        };

        let condition = PodCondition {
            condition_type: READINESS_GATE_TYPE.to_string(),
            status: status.to_string(),
            last_transition_time: existing.and_then(|condition| condition.last_transition_time),
            reason: Some(reason.to_string()),
            message: Some(message),
        };

        log_debug(
            COMPONENT,
            "Publishing readiness gate condition",
            &[
                ("pod", &self.cache_key()),
                ("status", &condition.status),
                ("reason", condition.reason.as_deref().unwrap_or_default()),
            ],
        );

        let patch = build_pod_condition_patch(&snapshot, &condition);
        patcher
            .patch_pod_status(snapshot.namespace(), snapshot.name(), &patch)
            .await
    }
}
