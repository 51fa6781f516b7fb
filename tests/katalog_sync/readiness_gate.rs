use std::sync::Arc;
use std::time::Duration;

use katalog_sync::katalog_sync::consul::{ConsulAgent, ConsulCatalog};
use katalog_sync::katalog_sync::daemon::Daemon;
use katalog_sync::katalog_sync::k8s::pod::PodCondition;
use katalog_sync::katalog_sync::test_support::{
    container_status, running_pod, test_daemon_config, with_readiness_gate, FakeConsul,
    FakeKubelet, FakePatcher,
};

const SERVICE_NAMES: &str = "katalog-sync.wish.com/service-names";
const SIDECAR: &str = "katalog-sync.wish.com/sidecar";
const GATE_TYPE: &str = "katalog-sync.wish.com/synced";
const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

fn new_daemon() -> (Arc<Daemon>, Arc<FakeKubelet>, Arc<FakeConsul>, Arc<FakePatcher>) {
    let kubelet = Arc::new(FakeKubelet::default());
    let consul = Arc::new(FakeConsul::default());
    let patcher = Arc::new(FakePatcher::default());
    let daemon = Daemon::new(
        test_daemon_config(),
        kubelet.clone(),
        consul.clone() as Arc<dyn ConsulAgent>,
        consul.clone() as Arc<dyn ConsulCatalog>,
        patcher.clone(),
    );
    (daemon, kubelet, consul, patcher)
}

async fn wait_for_condition<F>(what: &str, mut predicate: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + SETTLE_TIMEOUT;
    loop {
        if predicate() {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn gate_turns_true_after_cluster_wide_sync() {
    let (daemon, kubelet, _, patcher) = new_daemon();
    kubelet.set_pods(vec![with_readiness_gate(running_pod(
        "default",
        "web-0",
        &[(SERVICE_NAMES, "a")],
        vec![container_status("app", true)],
    ))]);
    tokio::spawn(daemon.clone().run());

    daemon.trigger_sync().await.expect("sweep");

    // The waiter observes the catalog, marks the initial sync, and
    // republishes the gate without waiting for the next sweep.
    wait_for_condition("gate condition True", || {
        patcher
            .last_condition()
            .is_some_and(|condition| condition["status"] == "True")
    })
    .await;

    let condition = patcher.last_condition().expect("condition published");
    assert_eq!(condition["type"], GATE_TYPE);
    assert_eq!(condition["reason"], "Done");

    let pod = daemon.pod("default", "web-0").await.expect("pod tracked");
    assert!(pod.initial_sync_done());
}

#[tokio::test]
async fn gate_reports_unready_containers() {
    let (daemon, kubelet, _, patcher) = new_daemon();
    kubelet.set_pods(vec![with_readiness_gate(running_pod(
        "default",
        "web-0",
        &[(SERVICE_NAMES, "a")],
        vec![container_status("app", false)],
    ))]);
    tokio::spawn(daemon.clone().run());

    daemon.trigger_sync().await.expect("sweep");

    let condition = patcher.last_condition().expect("condition published");
    assert_eq!(condition["status"], "False");
    assert_eq!(condition["reason"], "Not all containers are ready");
    assert!(
        condition["message"].as_str().unwrap_or_default().contains("\"app\": false"),
        "message carries the readiness map: {condition}"
    );
}

#[tokio::test]
async fn gate_reports_unready_sidecar() {
    let (daemon, kubelet, _, patcher) = new_daemon();
    kubelet.set_pods(vec![with_readiness_gate(running_pod(
        "default",
        "web-0",
        &[(SERVICE_NAMES, "a"), (SIDECAR, "katalog-sync-sidecar")],
        vec![
            container_status("app", true),
            container_status("katalog-sync-sidecar", false),
        ],
    ))]);
    tokio::spawn(daemon.clone().run());

    daemon.trigger_sync().await.expect("sweep");

    let condition = patcher.last_condition().expect("condition published");
    assert_eq!(condition["status"], "False");
    assert_eq!(condition["reason"], "Not all containers are ready");
}

#[tokio::test]
async fn gate_reports_broken_services_then_recovers() {
    let (daemon, kubelet, consul, patcher) = new_daemon();
    consul.fail_register_with("registration refused");
    kubelet.set_pods(vec![with_readiness_gate(running_pod(
        "default",
        "web-0",
        &[(SERVICE_NAMES, "a")],
        vec![container_status("app", true)],
    ))]);
    tokio::spawn(daemon.clone().run());

    // First sweep records the per-service failure; the following sweep's
    // gate pass reflects it.
    daemon.trigger_sync().await.expect("sweep");
    daemon.trigger_sync().await.expect("sweep");

    let condition = patcher.last_condition().expect("condition published");
    assert_eq!(condition["status"], "False");
    assert_eq!(condition["reason"], "Not all services synced to consul");
    assert!(
        condition["message"].as_str().unwrap_or_default().contains("a"),
        "broken service named in message: {condition}"
    );

    consul.recover_register();
    daemon.trigger_sync().await.expect("sweep");

    wait_for_condition("gate condition True after recovery", || {
        patcher
            .last_condition()
            .is_some_and(|condition| condition["status"] == "True")
    })
    .await;
}

#[tokio::test]
async fn observed_true_condition_clears_the_outstanding_gate() {
    let (daemon, kubelet, _, patcher) = new_daemon();
    let pod = with_readiness_gate(running_pod(
        "default",
        "web-0",
        &[(SERVICE_NAMES, "a")],
        vec![container_status("app", true)],
    ));
    kubelet.set_pods(vec![pod.clone()]);
    tokio::spawn(daemon.clone().run());

    daemon.trigger_sync().await.expect("sweep");
    wait_for_condition("gate condition True", || {
        patcher
            .last_condition()
            .is_some_and(|condition| condition["status"] == "True")
    })
    .await;

    // The kubelet now reports the condition; the next pass notices and
    // stops patching.
    let mut updated = pod;
    updated.status.as_mut().unwrap().conditions = vec![PodCondition {
        condition_type: GATE_TYPE.to_string(),
        status: "True".to_string(),
        last_transition_time: None,
        reason: Some("Done".to_string()),
        message: Some("Done".to_string()),
    }];
    kubelet.set_pods(vec![updated]);
    daemon.trigger_sync().await.expect("sweep");

    let tracked = daemon.pod("default", "web-0").await.expect("pod tracked");
    assert!(!tracked.outstanding_readiness_gate());

    let patches_before = patcher.patches().len();
    daemon.trigger_sync().await.expect("sweep");
    assert_eq!(
        patcher.patches().len(),
        patches_before,
        "a completed gate is not patched again"
    );
}

#[tokio::test]
async fn pods_without_a_gate_are_never_patched() {
    let (daemon, kubelet, _, patcher) = new_daemon();
    kubelet.set_pods(vec![running_pod(
        "default",
        "web-0",
        &[(SERVICE_NAMES, "a")],
        vec![container_status("app", true)],
    )]);
    tokio::spawn(daemon.clone().run());

    daemon.trigger_sync().await.expect("sweep");
    daemon.trigger_sync().await.expect("sweep");

    assert!(patcher.patches().is_empty());
}
