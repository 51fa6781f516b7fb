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

pub mod error;
pub mod pod;
pub mod status;

pub use error::SyncError;
pub use pod::{pod_cache_key, SyncPod};

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::katalog_sync::config::DaemonConfig;
use crate::katalog_sync::consul::types::{
    AgentServiceCheck, AgentServiceRegistration, CatalogNode, QueryOptions, HEALTH_CRITICAL,
    HEALTH_PASSING,
};
use crate::katalog_sync::consul::{ConsulAgent, ConsulCatalog};
use crate::katalog_sync::k8s::apiserver::PodStatusPatcher;
use crate::katalog_sync::kubelet::PodSource;
use crate::katalog_sync::logger::{log_debug, log_error, log_info, log_warn};
use crate::katalog_sync::observability::metrics;

// Consul service metadata published on every registration.
pub const META_SOURCE_KEY: &str = "external-source";
pub const META_SOURCE_VALUE: &str = "kubernetes";
pub const META_SYNC_SOURCE_KEY: &str = "external-sync-source";
pub const META_SYNC_SOURCE_VALUE: &str = "katalog-sync";
pub const META_K8S_LINK_KEY: &str = "external-k8s-link";
pub const META_K8S_NAMESPACE_KEY: &str = "external-k8s-namespace";
pub const META_K8S_POD_KEY: &str = "external-k8s-pod";

const COMPONENT: &str = "sync-loop";
const WAITER_RETRY: Duration = Duration::from_secs(1);

pub type SyncResult = Result<(), SyncError>;

type SyncWaiter = oneshot::Sender<SyncResult>;

/// The node-singleton reconciliation engine: drives the local consul agent
/// toward the kubelet pod inventory and answers sidecar RPCs.
pub struct Daemon {
    config: DaemonConfig,
    kubelet: Arc<dyn PodSource>,
    agent: Arc<dyn ConsulAgent>,
    catalog: Arc<dyn ConsulCatalog>,
    patcher: Arc<dyn PodStatusPatcher>,
    pods: RwLock<HashMap<String, Arc<SyncPod>>>,
    sync_tx: mpsc::UnboundedSender<SyncWaiter>,
    sync_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<SyncWaiter>>>,
}

impl Daemon {
    pub fn new(
        config: DaemonConfig,
        kubelet: Arc<dyn PodSource>,
        agent: Arc<dyn ConsulAgent>,
        catalog: Arc<dyn ConsulCatalog>,
        patcher: Arc<dyn PodStatusPatcher>,
    ) -> Arc<Self> {
        let (sync_tx, sync_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            config,
            kubelet,
            agent,
            catalog,
            patcher,
            pods: RwLock::new(HashMap::new()),
            sync_tx,
            sync_rx: std::sync::Mutex::new(Some(sync_rx)),
        })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Enqueue a sync request and wait for the sweep that serves it.
    /// Arbitrarily many concurrent triggers coalesce into a single sweep.
    pub async fn trigger_sync(&self) -> SyncResult {
        let (tx, rx) = oneshot::channel();
        self.sync_tx.send(tx).map_err(|_| SyncError::Cancelled)?;
        rx.await.map_err(|_| SyncError::Cancelled)?
    }

    /// The reconciliation loop. Single writer of table membership; runs
    /// until process exit.
    pub async fn run(self: Arc<Self>) {
        let mut sync_rx = self
            .sync_rx
            .lock()
            .expect("sync receiver lock poisoned")
            .take()
            .expect("daemon run() started twice");

        let sleep = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(sleep);
        let mut waiters: Vec<SyncWaiter> = Vec::new();
        let mut last_run: Option<Instant> = None;

        loop {
            tokio::select! {
                () = &mut sleep => {
                    let started = Instant::now();
                    let result = self.do_sweep().await;
                    let elapsed = started.elapsed();
                    match result.as_ref() {
                        Ok(()) => log_info(
                            COMPONENT,
                            "Sync completed",
                            &[("duration", &format!("{elapsed:?}"))],
                        ),
                        Err(err) => log_error(
                            COMPONENT,
                            "Sync completed with error",
                            &[("duration", &format!("{elapsed:?}")), ("error", &err.to_string())],
                        ),
                    }
                    for waiter in waiters.drain(..) {
                        let _ = waiter.send(result.clone());
                    }
                    let sleep_time = self.calculate_sleep_time().await;
                    log_debug(COMPONENT, "Sleeping", &[("duration", &format!("{sleep_time:?}"))]);
                    sleep.as_mut().reset(Instant::now() + sleep_time);
                    last_run = Some(Instant::now());
                }
                received = sync_rx.recv() => {
                    let Some(waiter) = received else {
                        // All senders gone; nothing can trigger us anymore.
                        return;
                    };
                    waiters.push(waiter);
                    let due = match last_run {
                        None => true,
                        Some(at) => at.elapsed() > self.config.min_sync_interval,
                    };
                    if due {
                        sleep.as_mut().reset(Instant::now());
                    }
                }
            }
        }
    }

    /// One reconciliation sweep: refresh the pod table from the kubelet,
    /// then drive the agent toward it. A kubelet failure is logged and
    /// counted but the consul pass still runs on the last-known table.
    async fn do_sweep(&self) -> SyncResult {
        let started = Instant::now();
        match self.fetch_k8s().await {
            Ok(()) => metrics::observe_kubelet_sync("success", started.elapsed()),
            Err(err) => {
                metrics::observe_kubelet_sync("error", started.elapsed());
                log_error(
                    COMPONENT,
                    "Error fetching state from kubelet",
                    &[("error", &err.to_string())],
                );
            }
        }

        let started = Instant::now();
        let result = self.sync_consul().await;
        match result.as_ref() {
            Ok(()) => metrics::observe_consul_sync("success", started.elapsed()),
            Err(_) => metrics::observe_consul_sync("error", started.elapsed()),
        }
        result
    }

    /// Sleep until the next sweep: the smallest per-pod sync interval that
    /// exceeds the configured minimum, never above the configured maximum.
    async fn calculate_sleep_time(&self) -> Duration {
        let mut sleep_duration = self.config.max_sync_interval;
        for pod in self.pods.read().await.values() {
            if pod.sync_interval < sleep_duration && pod.sync_interval > self.config.min_sync_interval {
                sleep_duration = pod.sync_interval;
            }
        }
        sleep_duration
    }

    /// Refresh the local pod table from the kubelet inventory. Only pods in
    /// the Running phase carrying the service-names annotation are tracked.
    async fn fetch_k8s(&self) -> SyncResult {
        let pod_list = self
            .kubelet
            .get_pod_list()
            .await
            .map_err(|err| SyncError::upstream("kubelet", err))?;

        let mut gate_pods: Vec<Arc<SyncPod>> = Vec::new();
        {
            let mut table = self.pods.write().await;
            let mut new_keys = HashSet::new();

            for k8s_pod in pod_list.items {
                if k8s_pod.annotation(pod::ANNOTATION_SERVICE_NAMES).is_none() {
                    continue;
                }
                if k8s_pod.phase() != "Running" {
                    continue;
                }

                let key = pod_cache_key(k8s_pod.namespace(), k8s_pod.name());
                new_keys.insert(key.clone());
                if let Some(existing) = table.get(&key) {
                    existing.update_pod(k8s_pod);
                    gate_pods.push(existing.clone());
                } else {
                    match SyncPod::new(k8s_pod, &self.config) {
                        Ok(sync_pod) => {
                            let sync_pod = Arc::new(sync_pod);
                            table.insert(key, sync_pod.clone());
                            if sync_pod.outstanding_readiness_gate() {
                                self.spawn_waiter(sync_pod.clone());
                            }
                            gate_pods.push(sync_pod);
                        }
                        Err(err) => log_error(
                            COMPONENT,
                            "Error creating local state for pod",
                            &[("error", &err.to_string())],
                        ),
                    }
                }
            }

            // Drop pods that left the inventory, cancelling their waiters
            // and any long-polls hanging off them.
            table.retain(|key, sync_pod| {
                if new_keys.contains(key) {
                    true
                } else {
                    sync_pod.cancel();
                    false
                }
            });
            metrics::set_pods_tracked(table.len());
        }

        for sync_pod in gate_pods {
            if let Err(err) = sync_pod.handle_readiness_gate(self.patcher.as_ref()).await {
                log_error(
                    COMPONENT,
                    "Error handling readiness gate",
                    &[("pod", &sync_pod.cache_key()), ("error", &err.to_string())],
                );
            }
        }

        Ok(())
    }

    /// Drive the agent's registry toward the local pod table: register new
    /// or structurally changed services, refresh TTLs past their halflife,
    /// then deregister services we own whose pod (or service name) is gone.
    async fn sync_consul(&self) -> SyncResult {
        let consul_services = self
            .agent
            .services()
            .await
            .map_err(|err| SyncError::upstream("consul agent", err))?;

        let table: HashMap<String, Arc<SyncPod>> = self.pods.read().await.clone();

        for sync_pod in table.values() {
            let (ready, container_readiness) = sync_pod.ready();
            let status = if ready { HEALTH_PASSING } else { HEALTH_CRITICAL };
            let notes = serde_json::to_string_pretty(&container_readiness)
                .unwrap_or_else(|_| "null".to_string());

            for service_name in sync_pod.service_names() {
                let service_id = sync_pod.service_id(&service_name);
                let existing = consul_services.get(&service_id);

                match existing {
                    Some(service) if !sync_pod.has_change(service) => {
                        // Past the halflife of the TTL we refresh the check;
                        // inside it we skip to keep agent traffic bounded.
                        if sync_pod
                            .sync_statuses
                            .due_for_update(&service_name, sync_pod.check_ttl / 2)
                        {
                            let result = self
                                .agent
                                .update_ttl(
                                    &service_id,
                                    &notes,
                                    &sync_pod.service_health(&service_name, status),
                                )
                                .await;
                            sync_pod.sync_statuses.set_result(&service_name, &result);
                        }
                    }
                    _ => {
                        let mut meta = HashMap::from([
                            (META_SOURCE_KEY.to_string(), META_SOURCE_VALUE.to_string()),
                            (
                                META_SYNC_SOURCE_KEY.to_string(),
                                META_SYNC_SOURCE_VALUE.to_string(),
                            ),
                            (META_K8S_LINK_KEY.to_string(), sync_pod.cache_key()),
                            (
                                META_K8S_NAMESPACE_KEY.to_string(),
                                sync_pod.snapshot().namespace().to_string(),
                            ),
                            (
                                META_K8S_POD_KEY.to_string(),
                                sync_pod.snapshot().name().to_string(),
                            ),
                        ]);
                        // User metadata never overrides the base keys.
                        for (key, value) in sync_pod.service_meta(&service_name) {
                            meta.entry(key).or_insert(value);
                        }

                        let registration = AgentServiceRegistration {
                            id: service_id.clone(),
                            name: service_name.clone(),
                            tags: sync_pod.tags(&service_name),
                            port: sync_pod.port(&service_name),
                            address: sync_pod.pod_ip(),
                            meta,
                            check: AgentServiceCheck {
                                check_id: service_id,
                                ttl: crate::katalog_sync::util::format_ttl(sync_pod.check_ttl),
                                status: sync_pod.service_health(&service_name, status),
                                notes: notes.clone(),
                            },
                        };
                        let result = self.agent.service_register(&registration).await;
                        sync_pod.sync_statuses.set_result(&service_name, &result);
                    }
                }
            }
        }

        // Deregister leftovers, but only services this daemon owns; other
        // registrants on the same agent are never touched.
        for service in consul_services.values() {
            if service.meta.get(META_SYNC_SOURCE_KEY).map(String::as_str)
                != Some(META_SYNC_SOURCE_VALUE)
            {
                continue;
            }

            let link = service
                .meta
                .get(META_K8S_LINK_KEY)
                .map(String::as_str)
                .unwrap_or_default();
            if let Some(sync_pod) = table.get(link) {
                if sync_pod.has_service_name(&service.service) {
                    continue;
                }
            }

            self.agent
                .service_deregister(&service.id)
                .await
                .map_err(|err| SyncError::upstream("consul agent", err))?;
        }

        Ok(())
    }

    /// Background task for a pod with an outstanding readiness gate: wait
    /// for the first cluster-wide sync, then mark it and republish the gate.
    fn spawn_waiter(&self, sync_pod: Arc<SyncPod>) {
        let agent = self.agent.clone();
        let catalog = self.catalog.clone();
        let patcher = self.patcher.clone();
        tokio::spawn(async move {
            wait_pod(agent, catalog, patcher, sync_pod).await;
        });
    }

    async fn pod_for(&self, namespace: &str, pod_name: &str) -> Result<Arc<SyncPod>, SyncError> {
        let key = pod_cache_key(namespace, pod_name);
        self.pods
            .read()
            .await
            .get(&key)
            .cloned()
            .ok_or(SyncError::PodNotFound { key })
    }

    /// Sidecar registration handshake. Returns only after two sweeps have
    /// run (one to observe the pod, one to observe the sidecar-ready flip)
    /// and the registration has been seen cluster-wide at least once.
    pub async fn register(
        &self,
        namespace: &str,
        pod_name: &str,
        container_name: &str,
    ) -> SyncResult {
        self.trigger_sync().await?;

        let sync_pod = self.pod_for(namespace, pod_name).await?;
        if !sync_pod.has_sidecar() {
            return Err(SyncError::MisconfiguredSidecar {
                key: pod_cache_key(namespace, pod_name),
            });
        }
        sync_pod.set_sidecar(container_name, true);

        self.trigger_sync().await?;

        if let Some(detail) = sync_pod.sync_statuses.first_error() {
            return Err(SyncError::SyncFailed { detail });
        }

        let node_name = self
            .agent
            .node_name()
            .await
            .map_err(|err| SyncError::upstream("consul agent", err))?;
        wait_registered(self.catalog.as_ref(), &sync_pod, &node_name).await?;

        if sync_pod.ready().0 {
            Ok(())
        } else {
            Err(SyncError::NotReady {
                detail: sync_pod.sync_statuses.first_error().unwrap_or_default(),
            })
        }
    }

    /// Sidecar deregistration handshake; idempotent counterpart of
    /// [`Daemon::register`].
    pub async fn deregister(
        &self,
        namespace: &str,
        pod_name: &str,
        _container_name: &str,
    ) -> SyncResult {
        self.trigger_sync().await?;

        let sync_pod = self.pod_for(namespace, pod_name).await?;
        if !sync_pod.has_sidecar() {
            return Err(SyncError::MisconfiguredSidecar {
                key: pod_cache_key(namespace, pod_name),
            });
        }
        sync_pod.set_sidecar_ready(false);

        self.trigger_sync().await?;

        if let Some(detail) = sync_pod.sync_statuses.first_error() {
            return Err(SyncError::SyncFailed { detail });
        }

        let node_name = self
            .agent
            .node_name()
            .await
            .map_err(|err| SyncError::upstream("consul agent", err))?;
        wait_deregistered(self.catalog.as_ref(), self.agent.as_ref(), &sync_pod, &node_name).await?;

        if !sync_pod.ready().0 {
            Ok(())
        } else {
            Err(SyncError::NotReady {
                detail: "pod still derives ready after deregistration".to_string(),
            })
        }
    }

    /// Read-only view of the pod table, for diagnostics and tests.
    pub async fn pod(&self, namespace: &str, pod_name: &str) -> Option<Arc<SyncPod>> {
        let key = pod_cache_key(namespace, pod_name);
        self.pods.read().await.get(&key).cloned()
    }

    pub async fn pod_count(&self) -> usize {
        self.pods.read().await.len()
    }

    /// Probe the daemon's upstreams; feeds the health report.
    pub async fn probe_upstreams(&self) -> Vec<(&'static str, Result<(), String>)> {
        let kubelet = self
            .kubelet
            .get_pod_list()
            .await
            .map(|_| ())
            .map_err(|err| err.to_string());
        let agent = self
            .agent
            .services()
            .await
            .map(|_| ())
            .map_err(|err| err.to_string());
        vec![("kubelet", kubelet), ("consul_agent", agent)]
    }
}

/// Blocking-index poll of the catalog's node entry until `predicate` holds.
/// Each iteration either returns on cancellation or blocks on the server
/// until the catalog index advances past the last observed one.
pub async fn node_do_until<F, Fut>(
    catalog: &dyn ConsulCatalog,
    cancel: &CancellationToken,
    node_name: &str,
    mut opts: QueryOptions,
    predicate: F,
) -> SyncResult
where
    F: Fn(Option<CatalogNode>) -> Fut,
    Fut: Future<Output = bool>,
{
    loop {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            response = catalog.node(node_name, &opts) => response,
        };
        let (catalog_node, meta) =
            response.map_err(|err| SyncError::upstream("consul catalog", err))?;
        opts.wait_index = meta.last_index;
        if predicate(catalog_node).await {
            return Ok(());
        }
    }
}

fn stale_cached_query() -> QueryOptions {
    QueryOptions {
        allow_stale: true,
        use_cache: true,
        wait_index: 0,
    }
}

/// Wait until every expected service id for the pod is present on the
/// node's catalog entry.
async fn wait_registered(
    catalog: &dyn ConsulCatalog,
    sync_pod: &SyncPod,
    node_name: &str,
) -> SyncResult {
    let expected: Vec<String> = sync_pod
        .service_names()
        .iter()
        .map(|name| sync_pod.service_id(name))
        .collect();
    node_do_until(
        catalog,
        &sync_pod.cancel_token(),
        node_name,
        stale_cached_query(),
        |catalog_node| {
            let expected = &expected;
            async move {
                let Some(catalog_node) = catalog_node else {
                    return false;
                };
                expected
                    .iter()
                    .all(|id| catalog_node.services.contains_key(id))
            }
        },
    )
    .await
}

/// Wait until every expected service id still present on the node has
/// stopped passing. Services with a pinned health never turn critical, so
/// they are not waited on; a failing health lookup reads as not-yet.
async fn wait_deregistered(
    catalog: &dyn ConsulCatalog,
    agent: &dyn ConsulAgent,
    sync_pod: &SyncPod,
    node_name: &str,
) -> SyncResult {
    node_do_until(
        catalog,
        &sync_pod.cancel_token(),
        node_name,
        stale_cached_query(),
        |catalog_node| async move {
            let Some(catalog_node) = catalog_node else {
                return true;
            };
            for service_name in sync_pod.service_names() {
                let service_id = sync_pod.service_id(&service_name);
                if !catalog_node.services.contains_key(&service_id) {
                    continue;
                }
                match agent.agent_health_service_by_id(&service_id).await {
                    Ok(health) => {
                        if sync_pod.service_health(&service_name, "").is_empty()
                            && health == HEALTH_PASSING
                        {
                            return false;
                        }
                    }
                    Err(_) => return false,
                }
            }
            true
        },
    )
    .await
}

/// Waiter task body: poll the catalog until the pod's services have been
/// observed cluster-wide, then mark the initial sync and republish the
/// readiness gate. Exits when the pod is cancelled.
async fn wait_pod(
    agent: Arc<dyn ConsulAgent>,
    catalog: Arc<dyn ConsulCatalog>,
    patcher: Arc<dyn PodStatusPatcher>,
    sync_pod: Arc<SyncPod>,
) {
    let cancel = sync_pod.cancel_token();
    let mut synced_remotely = false;
    loop {
        if cancel.is_cancelled() {
            return;
        }
        if !synced_remotely {
            let node_name = match agent.node_name().await {
                Ok(name) => name,
                Err(err) => {
                    log_debug(
                        COMPONENT,
                        "Waiter could not resolve node name, retrying",
                        &[("pod", &sync_pod.cache_key()), ("error", &err.to_string())],
                    );
                    if !sleep_unless_cancelled(&cancel, WAITER_RETRY).await {
                        return;
                    }
                    continue;
                }
            };
            match wait_registered(catalog.as_ref(), &sync_pod, &node_name).await {
                Ok(()) => synced_remotely = true,
                Err(SyncError::Cancelled) => return,
                Err(err) => {
                    log_debug(
                        COMPONENT,
                        "Waiter catalog poll failed, retrying",
                        &[("pod", &sync_pod.cache_key()), ("error", &err.to_string())],
                    );
                    if !sleep_unless_cancelled(&cancel, WAITER_RETRY).await {
                        return;
                    }
                    continue;
                }
            }
        }
        if sync_pod.ready().0 {
            sync_pod.set_initial_sync_done(true);
            // Republish the gate now instead of waiting on the next sweep.
            if let Err(err) = sync_pod.handle_readiness_gate(patcher.as_ref()).await {
                log_warn(
                    COMPONENT,
                    "Error handling readiness gate after initial sync",
                    &[("pod", &sync_pod.cache_key()), ("error", &err.to_string())],
                );
            }
            return;
        }
        if !sleep_unless_cancelled(&cancel, WAITER_RETRY).await {
            return;
        }
    }
}

/// Sleep for `duration`, returning false if the token fired first.
async fn sleep_unless_cancelled(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::katalog_sync::consul::types::AgentService;
    use crate::katalog_sync::daemon::pod::{
        ANNOTATION_SERVICE_NAMES, ANNOTATION_SERVICE_PORT, ANNOTATION_SYNC_INTERVAL,
    };
    use crate::katalog_sync::test_support::{
        container_status, running_pod, test_daemon_config, FakeConsul, FakeKubelet, FakePatcher,
    };

    fn new_daemon(
        config: DaemonConfig,
    ) -> (Arc<Daemon>, Arc<FakeKubelet>, Arc<FakeConsul>, Arc<FakePatcher>) {
        let kubelet = Arc::new(FakeKubelet::default());
        let consul = Arc::new(FakeConsul::default());
        let patcher = Arc::new(FakePatcher::default());
        let daemon = Daemon::new(
            config,
            kubelet.clone(),
            consul.clone() as Arc<dyn ConsulAgent>,
            consul.clone() as Arc<dyn ConsulCatalog>,
            patcher.clone(),
        );
        (daemon, kubelet, consul, patcher)
    }

    fn owned_service(id: &str, service: &str, link: &str, port: i32, address: &str) -> AgentService {
        AgentService {
            id: id.to_string(),
            service: service.to_string(),
            port,
            address: address.to_string(),
            meta: HashMap::from([
                (META_SYNC_SOURCE_KEY.to_string(), META_SYNC_SOURCE_VALUE.to_string()),
                (META_K8S_LINK_KEY.to_string(), link.to_string()),
            ]),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn pods_without_service_names_are_ignored() {
        let (daemon, kubelet, consul, _) = new_daemon(test_daemon_config());
        kubelet.set_pods(vec![running_pod(
            "default",
            "plain",
            &[],
            vec![container_status("app", true)],
        )]);

        daemon.do_sweep().await.expect("sweep");
        assert_eq!(daemon.pod_count().await, 0);
        assert!(consul.registrations().is_empty());
        assert!(consul.deregistrations().is_empty());
    }

    #[tokio::test]
    async fn non_running_pods_are_ignored() {
        let (daemon, kubelet, consul, _) = new_daemon(test_daemon_config());
        let mut pod = running_pod(
            "default",
            "pending",
            &[(ANNOTATION_SERVICE_NAMES, "a")],
            vec![],
        );
        pod.status.as_mut().unwrap().phase = Some("Pending".to_string());
        kubelet.set_pods(vec![pod]);

        daemon.do_sweep().await.expect("sweep");
        assert_eq!(daemon.pod_count().await, 0);
        assert!(consul.registrations().is_empty());
    }

    #[tokio::test]
    async fn annotated_pod_registers_every_service() {
        let (daemon, kubelet, consul, _) = new_daemon(test_daemon_config());
        kubelet.set_pods(vec![running_pod(
            "default",
            "x",
            &[
                (ANNOTATION_SERVICE_NAMES, "a,b"),
                (ANNOTATION_SERVICE_PORT, "8080"),
            ],
            vec![container_status("app1", true), container_status("app2", true)],
        )]);

        daemon.do_sweep().await.expect("sweep");

        assert_eq!(
            consul.service_ids(),
            vec![
                "katalog-sync_a_default_x".to_string(),
                "katalog-sync_b_default_x".to_string(),
            ]
        );
        let registrations = consul.registrations();
        assert_eq!(registrations.len(), 2);
        for registration in &registrations {
            assert_eq!(registration.port, 8080);
            assert_eq!(registration.address, "10.0.0.8");
            assert_eq!(registration.check.status, HEALTH_PASSING);
            // default 10s TTL is raised to default interval + buffer
            assert_eq!(registration.check.ttl, "11s");
            assert_eq!(
                registration.meta.get(META_SOURCE_KEY).map(String::as_str),
                Some("kubernetes")
            );
            assert_eq!(
                registration.meta.get(META_SYNC_SOURCE_KEY).map(String::as_str),
                Some("katalog-sync")
            );
            assert_eq!(
                registration.meta.get(META_K8S_NAMESPACE_KEY).map(String::as_str),
                Some("default")
            );
            assert_eq!(
                registration.meta.get(META_K8S_POD_KEY).map(String::as_str),
                Some("x")
            );
            assert_eq!(
                registration.meta.get(META_K8S_LINK_KEY).map(String::as_str),
                Some("default/x")
            );
            assert!(registration.check.notes.contains("\"app1\": true"));
        }
    }

    #[tokio::test]
    async fn per_service_port_override_wins() {
        let (daemon, kubelet, consul, _) = new_daemon(test_daemon_config());
        kubelet.set_pods(vec![running_pod(
            "default",
            "x",
            &[
                (ANNOTATION_SERVICE_NAMES, "a,b"),
                (ANNOTATION_SERVICE_PORT, "8080"),
                ("katalog-sync.wish.com/service-port-a", "8081"),
            ],
            vec![container_status("app", true)],
        )]);

        daemon.do_sweep().await.expect("sweep");

        assert_eq!(consul.service("katalog-sync_a_default_x").unwrap().port, 8081);
        assert_eq!(consul.service("katalog-sync_b_default_x").unwrap().port, 8080);
    }

    #[tokio::test]
    async fn removed_pod_is_deregistered_but_foreign_services_survive() {
        let (daemon, kubelet, consul, _) = new_daemon(test_daemon_config());
        consul.seed_service(
            AgentService {
                id: "someone-elses-service".to_string(),
                service: "legacy".to_string(),
                meta: HashMap::from([(
                    META_SYNC_SOURCE_KEY.to_string(),
                    "other-tool".to_string(),
                )]),
                ..Default::default()
            },
            HEALTH_PASSING,
        );
        kubelet.set_pods(vec![running_pod(
            "default",
            "x",
            &[(ANNOTATION_SERVICE_NAMES, "a,b")],
            vec![container_status("app", true)],
        )]);
        daemon.do_sweep().await.expect("sweep");
        assert_eq!(daemon.pod_count().await, 1);

        kubelet.set_pods(vec![]);
        daemon.do_sweep().await.expect("sweep");

        assert_eq!(daemon.pod_count().await, 0);
        let mut deregistered = consul.deregistrations();
        deregistered.sort();
        assert_eq!(
            deregistered,
            vec![
                "katalog-sync_a_default_x".to_string(),
                "katalog-sync_b_default_x".to_string(),
            ]
        );
        assert_eq!(consul.service_ids(), vec!["someone-elses-service".to_string()]);
    }

    #[tokio::test]
    async fn unowned_services_are_never_deregistered() {
        let (daemon, _, consul, _) = new_daemon(test_daemon_config());
        consul.seed_service(
            AgentService {
                id: "unmarked".to_string(),
                service: "legacy".to_string(),
                ..Default::default()
            },
            HEALTH_PASSING,
        );

        daemon.do_sweep().await.expect("sweep");
        assert!(consul.deregistrations().is_empty());
        assert_eq!(consul.service_ids(), vec!["unmarked".to_string()]);
    }

    #[tokio::test]
    async fn ttl_updates_throttled_to_check_ttl_halflife() {
        let (daemon, kubelet, consul, _) = new_daemon(test_daemon_config());
        consul.seed_service(
            owned_service(
                "katalog-sync_a_default_x",
                "a",
                "default/x",
                -1,
                "10.0.0.8",
            ),
            HEALTH_PASSING,
        );
        kubelet.set_pods(vec![running_pod(
            "default",
            "x",
            &[(ANNOTATION_SERVICE_NAMES, "a")],
            vec![container_status("app", true)],
        )]);

        daemon.do_sweep().await.expect("sweep");
        daemon.do_sweep().await.expect("sweep");

        assert_eq!(
            consul.ttl_updates().len(),
            1,
            "consecutive sweeps inside checkTTL/2 must coalesce to one update"
        );
        assert!(consul.registrations().is_empty(), "no structural change, no re-register");
    }

    #[tokio::test]
    async fn structural_change_forces_reregistration() {
        let (daemon, kubelet, consul, _) = new_daemon(test_daemon_config());
        consul.seed_service(
            owned_service(
                "katalog-sync_a_default_x",
                "a",
                "default/x",
                8080,
                "10.0.0.99",
            ),
            HEALTH_PASSING,
        );
        kubelet.set_pods(vec![running_pod(
            "default",
            "x",
            &[
                (ANNOTATION_SERVICE_NAMES, "a"),
                (ANNOTATION_SERVICE_PORT, "8080"),
            ],
            vec![container_status("app", true)],
        )]);

        daemon.do_sweep().await.expect("sweep");

        assert_eq!(consul.registrations().len(), 1, "address drift re-registers");
        assert!(consul.ttl_updates().is_empty());
        assert_eq!(
            consul.service("katalog-sync_a_default_x").unwrap().address,
            "10.0.0.8"
        );
    }

    #[tokio::test]
    async fn terminating_pod_reports_critical() {
        let (daemon, kubelet, consul, _) = new_daemon(test_daemon_config());
        consul.seed_service(
            owned_service(
                "katalog-sync_a_default_x",
                "a",
                "default/x",
                -1,
                "10.0.0.8",
            ),
            HEALTH_PASSING,
        );
        let mut pod = running_pod(
            "default",
            "x",
            &[(ANNOTATION_SERVICE_NAMES, "a")],
            vec![container_status("app", true)],
        );
        pod.metadata.deletion_timestamp = Some("2025-06-01T00:00:00Z".to_string());
        kubelet.set_pods(vec![pod]);

        daemon.do_sweep().await.expect("sweep");

        let updates = consul.ttl_updates();
        assert_eq!(updates.len(), 1);
        let (_, output, status) = &updates[0];
        assert_eq!(status, HEALTH_CRITICAL);
        assert_eq!(output, "null");
    }

    #[tokio::test]
    async fn kubelet_failure_keeps_syncing_last_known_table() {
        let (daemon, kubelet, _consul, _) = new_daemon(test_daemon_config());
        kubelet.set_pods(vec![running_pod(
            "default",
            "x",
            &[(ANNOTATION_SERVICE_NAMES, "a")],
            vec![container_status("app", true)],
        )]);
        daemon.do_sweep().await.expect("sweep");
        assert_eq!(daemon.pod_count().await, 1);

        kubelet.fail_with("connection refused");
        daemon.do_sweep().await.expect("stale table is acceptable for a cycle");
        assert_eq!(daemon.pod_count().await, 1, "table survives a kubelet outage");
    }

    #[tokio::test]
    async fn agent_listing_failure_aborts_the_sweep() {
        let (daemon, kubelet, consul, _) = new_daemon(test_daemon_config());
        kubelet.set_pods(vec![running_pod(
            "default",
            "x",
            &[(ANNOTATION_SERVICE_NAMES, "a")],
            vec![container_status("app", true)],
        )]);
        consul.fail_services_with("agent down");

        let err = daemon.do_sweep().await.expect_err("sweep must fail");
        assert!(matches!(err, SyncError::Upstream { .. }), "got {err:?}");
        assert!(consul.registrations().is_empty());
    }

    #[tokio::test]
    async fn sleep_time_is_smallest_interval_above_the_minimum() {
        let config = DaemonConfig::default();
        let (daemon, kubelet, _, _) = new_daemon(config.clone());

        assert_eq!(
            daemon.calculate_sleep_time().await,
            config.max_sync_interval,
            "no pods: sleep the maximum"
        );

        kubelet.set_pods(vec![
            running_pod(
                "default",
                "fast",
                &[
                    (ANNOTATION_SERVICE_NAMES, "a"),
                    (ANNOTATION_SYNC_INTERVAL, "300ms"),
                ],
                vec![container_status("app", true)],
            ),
            running_pod(
                "default",
                "medium",
                &[
                    (ANNOTATION_SERVICE_NAMES, "b"),
                    (ANNOTATION_SYNC_INTERVAL, "2s"),
                ],
                vec![container_status("app", true)],
            ),
            running_pod(
                "default",
                "slow",
                &[
                    (ANNOTATION_SERVICE_NAMES, "c"),
                    (ANNOTATION_SYNC_INTERVAL, "7s"),
                ],
                vec![container_status("app", true)],
            ),
        ]);
        daemon.fetch_k8s().await.expect("fetch");

        assert_eq!(
            daemon.calculate_sleep_time().await,
            Duration::from_secs(2),
            "300ms is under the minimum and 7s is over the maximum"
        );
    }

    #[tokio::test]
    async fn pinned_service_health_overrides_derived_status() {
        let (daemon, kubelet, consul, _) = new_daemon(test_daemon_config());
        consul.seed_service(
            owned_service(
                "katalog-sync_a_default_x",
                "a",
                "default/x",
                -1,
                "10.0.0.8",
            ),
            HEALTH_PASSING,
        );
        kubelet.set_pods(vec![running_pod(
            "default",
            "x",
            &[
                (ANNOTATION_SERVICE_NAMES, "a"),
                ("katalog-sync.wish.com/service-health-a", "warning"),
            ],
            vec![container_status("app", true)],
        )]);

        daemon.do_sweep().await.expect("sweep");

        let updates = consul.ttl_updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].2, "warning", "pinned health wins over derived passing");
    }

    #[tokio::test]
    async fn user_meta_never_overrides_base_meta() {
        let (daemon, kubelet, consul, _) = new_daemon(test_daemon_config());
        kubelet.set_pods(vec![running_pod(
            "default",
            "x",
            &[
                (ANNOTATION_SERVICE_NAMES, "a"),
                (
                    "katalog-sync.wish.com/service-meta",
                    "external-sync-source:spoofed,team:web",
                ),
            ],
            vec![container_status("app", true)],
        )]);

        daemon.do_sweep().await.expect("sweep");

        let registration = &consul.registrations()[0];
        assert_eq!(
            registration.meta.get(META_SYNC_SOURCE_KEY).map(String::as_str),
            Some("katalog-sync"),
            "base metadata wins over user metadata"
        );
        assert_eq!(registration.meta.get("team").map(String::as_str), Some("web"));
    }
}
