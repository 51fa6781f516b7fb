#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::error::Error;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::katalog_sync::config::DaemonConfig;
use crate::katalog_sync::consul::types::{
    AgentService, AgentServiceRegistration, CatalogNode, QueryMeta, QueryOptions, HEALTH_CRITICAL,
};
use crate::katalog_sync::consul::{ConsulAgent, ConsulCatalog};
use crate::katalog_sync::k8s::apiserver::PodStatusPatcher;
use crate::katalog_sync::k8s::pod::{
    ContainerStatus, ObjectMeta, Pod, PodList, PodReadinessGate, PodSpec, PodStatus,
};
use crate::katalog_sync::kubelet::PodSource;
use crate::katalog_sync::util::error::new_error;

/// Daemon configuration tuned for tests: triggers always fire immediately
/// and the background timer stays out of the way.
pub fn test_daemon_config() -> DaemonConfig {
    DaemonConfig {
        min_sync_interval: Duration::ZERO,
        max_sync_interval: Duration::from_secs(3600),
        ..DaemonConfig::default()
    }
}

pub fn container_status(name: &str, ready: bool) -> ContainerStatus {
    ContainerStatus {
        name: name.to_string(),
        ready,
        ..Default::default()
    }
}

/// Build a Running pod snapshot with the given annotations and container
/// statuses, shaped like the kubelet `/pods` payload.
pub fn running_pod(
    namespace: &str,
    name: &str,
    annotations: &[(&str, &str)],
    statuses: Vec<ContainerStatus>,
) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("uid-{namespace}-{name}")),
            annotations: annotations
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
            ..Default::default()
        },
        spec: PodSpec::default(),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            pod_ip: Some("10.0.0.8".to_string()),
            container_statuses: statuses,
            ..Default::default()
        }),
    }
}

pub fn with_readiness_gate(mut pod: Pod) -> Pod {
    pod.spec.readiness_gates = vec![PodReadinessGate {
        condition_type: crate::katalog_sync::daemon::pod::READINESS_GATE_TYPE.to_string(),
    }];
    pod
}

/// In-memory kubelet: serves whatever pod list was last installed, or a
/// configured error.
#[derive(Default)]
pub struct FakeKubelet {
    pods: Mutex<Vec<Pod>>,
    fail_with: Mutex<Option<String>>,
}

impl FakeKubelet {
    pub fn set_pods(&self, pods: Vec<Pod>) {
        *self.pods.lock().unwrap() = pods;
    }

    pub fn fail_with(&self, message: &str) {
        *self.fail_with.lock().unwrap() = Some(message.to_string());
    }

    pub fn recover(&self) {
        *self.fail_with.lock().unwrap() = None;
    }
}

#[async_trait]
impl PodSource for FakeKubelet {
    async fn get_pod_list(&self) -> Result<PodList, Box<dyn Error + Send + Sync>> {
        if let Some(message) = self.fail_with.lock().unwrap().clone() {
            return Err(new_error(message));
        }
        Ok(PodList {
            items: self.pods.lock().unwrap().clone(),
        })
    }
}

/// In-memory consul: an agent registry that doubles as the cluster catalog,
/// with immediate "gossip" and recorded operations for assertions.
pub struct FakeConsul {
    pub node: String,
    services: Mutex<HashMap<String, AgentService>>,
    health: Mutex<HashMap<String, String>>,
    registrations: Mutex<Vec<AgentServiceRegistration>>,
    ttl_updates: Mutex<Vec<(String, String, String)>>,
    deregistrations: Mutex<Vec<String>>,
    catalog_index: AtomicU64,
    fail_services_with: Mutex<Option<String>>,
    fail_register_with: Mutex<Option<String>>,
    services_calls: AtomicU64,
}

impl Default for FakeConsul {
    fn default() -> Self {
        Self {
            node: "node-1".to_string(),
            services: Mutex::new(HashMap::new()),
            health: Mutex::new(HashMap::new()),
            registrations: Mutex::new(Vec::new()),
            ttl_updates: Mutex::new(Vec::new()),
            deregistrations: Mutex::new(Vec::new()),
            catalog_index: AtomicU64::new(1),
            fail_services_with: Mutex::new(None),
            fail_register_with: Mutex::new(None),
            services_calls: AtomicU64::new(0),
        }
    }
}

impl FakeConsul {
    /// Pre-populate a service, as if a previous daemon run (or another
    /// registrant) had created it.
    pub fn seed_service(&self, service: AgentService, health: &str) {
        self.health
            .lock()
            .unwrap()
            .insert(service.id.clone(), health.to_string());
        self.services
            .lock()
            .unwrap()
            .insert(service.id.clone(), service);
    }

    pub fn fail_services_with(&self, message: &str) {
        *self.fail_services_with.lock().unwrap() = Some(message.to_string());
    }

    pub fn fail_register_with(&self, message: &str) {
        *self.fail_register_with.lock().unwrap() = Some(message.to_string());
    }

    pub fn recover_register(&self) {
        *self.fail_register_with.lock().unwrap() = None;
    }

    /// Number of agent service listings served; one per consul sweep.
    pub fn services_calls(&self) -> u64 {
        self.services_calls.load(Ordering::SeqCst)
    }

    pub fn service(&self, id: &str) -> Option<AgentService> {
        self.services.lock().unwrap().get(id).cloned()
    }

    pub fn service_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.services.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn registrations(&self) -> Vec<AgentServiceRegistration> {
        self.registrations.lock().unwrap().clone()
    }

    pub fn ttl_updates(&self) -> Vec<(String, String, String)> {
        self.ttl_updates.lock().unwrap().clone()
    }

    pub fn deregistrations(&self) -> Vec<String> {
        self.deregistrations.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConsulAgent for FakeConsul {
    async fn services(&self) -> Result<HashMap<String, AgentService>, Box<dyn Error + Send + Sync>> {
        self.services_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.fail_services_with.lock().unwrap().clone() {
            return Err(new_error(message));
        }
        Ok(self.services.lock().unwrap().clone())
    }

    async fn service_register(
        &self,
        registration: &AgentServiceRegistration,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        if let Some(message) = self.fail_register_with.lock().unwrap().clone() {
            return Err(new_error(message));
        }
        self.registrations.lock().unwrap().push(registration.clone());
        self.health
            .lock()
            .unwrap()
            .insert(registration.check.check_id.clone(), registration.check.status.clone());
        self.services.lock().unwrap().insert(
            registration.id.clone(),
            AgentService {
                id: registration.id.clone(),
                service: registration.name.clone(),
                tags: registration.tags.clone(),
                meta: registration.meta.clone(),
                port: registration.port,
                address: registration.address.clone(),
            },
        );
        self.catalog_index.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn service_deregister(&self, service_id: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.deregistrations.lock().unwrap().push(service_id.to_string());
        self.services.lock().unwrap().remove(service_id);
        self.health.lock().unwrap().remove(service_id);
        self.catalog_index.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update_ttl(
        &self,
        check_id: &str,
        output: &str,
        status: &str,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.ttl_updates
            .lock()
            .unwrap()
            .push((check_id.to_string(), output.to_string(), status.to_string()));
        self.health
            .lock()
            .unwrap()
            .insert(check_id.to_string(), status.to_string());
        Ok(())
    }

    async fn node_name(&self) -> Result<String, Box<dyn Error + Send + Sync>> {
        Ok(self.node.clone())
    }

    async fn agent_health_service_by_id(
        &self,
        service_id: &str,
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        Ok(self
            .health
            .lock()
            .unwrap()
            .get(service_id)
            .cloned()
            .unwrap_or_else(|| HEALTH_CRITICAL.to_string()))
    }
}

#[async_trait]
impl ConsulCatalog for FakeConsul {
    async fn node(
        &self,
        node: &str,
        _opts: &QueryOptions,
    ) -> Result<(Option<CatalogNode>, QueryMeta), Box<dyn Error + Send + Sync>> {
        // Stand in for blocking-query latency; also keeps tight predicate
        // loops from starving a current-thread test runtime.
        tokio::time::sleep(Duration::from_millis(1)).await;
        let meta = QueryMeta {
            last_index: self.catalog_index.load(Ordering::SeqCst),
        };
        if node != self.node {
            return Ok((None, meta));
        }
        let catalog_node = CatalogNode {
            node: crate::katalog_sync::consul::types::Node {
                node: self.node.clone(),
                address: "127.0.0.1".to_string(),
            },
            services: self.services.lock().unwrap().clone(),
        };
        Ok((Some(catalog_node), meta))
    }
}

/// Records status patches instead of talking to an apiserver.
#[derive(Default)]
pub struct FakePatcher {
    patches: Mutex<Vec<(String, String, Value)>>,
    fail_with: Mutex<Option<String>>,
}

impl FakePatcher {
    pub fn patches(&self) -> Vec<(String, String, Value)> {
        self.patches.lock().unwrap().clone()
    }

    pub fn last_condition(&self) -> Option<Value> {
        self.patches
            .lock()
            .unwrap()
            .last()
            .and_then(|(_, _, patch)| patch["status"]["conditions"].get(0).cloned())
    }

    pub fn fail_with(&self, message: &str) {
        *self.fail_with.lock().unwrap() = Some(message.to_string());
    }
}

#[async_trait]
impl PodStatusPatcher for FakePatcher {
    async fn patch_pod_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        if let Some(message) = self.fail_with.lock().unwrap().clone() {
            return Err(new_error(message));
        }
        self.patches
            .lock()
            .unwrap()
            .push((namespace.to_string(), name.to_string(), patch.clone()));
        Ok(())
    }
}
