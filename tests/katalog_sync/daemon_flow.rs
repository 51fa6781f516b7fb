use std::sync::Arc;
use std::time::Duration;

use katalog_sync::katalog_sync::consul::{ConsulAgent, ConsulCatalog};
use katalog_sync::katalog_sync::daemon::{Daemon, SyncError};
use katalog_sync::katalog_sync::test_support::{
    container_status, running_pod, test_daemon_config, FakeConsul, FakeKubelet, FakePatcher,
};

const SERVICE_NAMES: &str = "katalog-sync.wish.com/service-names";
const SIDECAR: &str = "katalog-sync.wish.com/sidecar";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

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

#[tokio::test]
async fn register_handshake_completes_end_to_end() {
    let (daemon, kubelet, consul, _) = new_daemon();
    kubelet.set_pods(vec![running_pod(
        "default",
        "web-0",
        &[(SERVICE_NAMES, "a"), (SIDECAR, "katalog-sync-sidecar")],
        vec![
            container_status("app", true),
            container_status("katalog-sync-sidecar", false),
        ],
    )]);
    tokio::spawn(daemon.clone().run());

    tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        daemon.register("default", "web-0", "katalog-sync-sidecar"),
    )
    .await
    .expect("register must not hang")
    .expect("register succeeds");

    // The registration is on the agent and visible via the catalog.
    assert!(consul.service("katalog-sync_a_default_web-0").is_some());
    let pod = daemon.pod("default", "web-0").await.expect("pod tracked");
    let sidecar = pod.sidecar_state().expect("sidecar negotiated");
    assert!(sidecar.ready);
    assert_eq!(sidecar.container_name, "katalog-sync-sidecar");
    assert!(pod.ready().0);
}

#[tokio::test]
async fn register_fails_for_unknown_pod() {
    let (daemon, _, _, _) = new_daemon();
    tokio::spawn(daemon.clone().run());

    let err = tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        daemon.register("default", "ghost", "katalog-sync-sidecar"),
    )
    .await
    .expect("register must not hang")
    .expect_err("unknown pod fails");
    assert!(matches!(err, SyncError::PodNotFound { .. }), "got {err:?}");
}

#[tokio::test]
async fn register_fails_without_sidecar_annotation() {
    let (daemon, kubelet, _, _) = new_daemon();
    kubelet.set_pods(vec![running_pod(
        "default",
        "web-0",
        &[(SERVICE_NAMES, "a")],
        vec![container_status("app", true)],
    )]);
    tokio::spawn(daemon.clone().run());

    let err = tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        daemon.register("default", "web-0", "katalog-sync-sidecar"),
    )
    .await
    .expect("register must not hang")
    .expect_err("misconfigured pod fails");
    assert!(matches!(err, SyncError::MisconfiguredSidecar { .. }), "got {err:?}");

    let pod = daemon.pod("default", "web-0").await.expect("pod tracked");
    assert!(pod.sidecar_state().is_none(), "no sidecar state invented");
}

#[tokio::test]
async fn register_surfaces_per_service_sync_errors() {
    let (daemon, kubelet, consul, _) = new_daemon();
    consul.fail_register_with("agent rejected the registration");
    kubelet.set_pods(vec![running_pod(
        "default",
        "web-0",
        &[(SERVICE_NAMES, "a"), (SIDECAR, "katalog-sync-sidecar")],
        vec![
            container_status("app", true),
            container_status("katalog-sync-sidecar", true),
        ],
    )]);
    tokio::spawn(daemon.clone().run());

    let err = tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        daemon.register("default", "web-0", "katalog-sync-sidecar"),
    )
    .await
    .expect("register must not hang")
    .expect_err("register surfaces the stored sync error");
    match err {
        SyncError::SyncFailed { detail } => {
            assert!(detail.contains("agent rejected the registration"), "got {detail}")
        }
        other => panic!("expected SyncFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn deregister_handshake_is_idempotent() {
    let (daemon, kubelet, consul, _) = new_daemon();
    kubelet.set_pods(vec![running_pod(
        "default",
        "web-0",
        &[(SERVICE_NAMES, "a"), (SIDECAR, "katalog-sync-sidecar")],
        vec![
            container_status("app", true),
            container_status("katalog-sync-sidecar", false),
        ],
    )]);
    tokio::spawn(daemon.clone().run());

    tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        daemon.register("default", "web-0", "katalog-sync-sidecar"),
    )
    .await
    .expect("register must not hang")
    .expect("register succeeds");

    for _ in 0..2 {
        tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            daemon.deregister("default", "web-0", "katalog-sync-sidecar"),
        )
        .await
        .expect("deregister must not hang")
        .expect("deregister succeeds");
    }

    let pod = daemon.pod("default", "web-0").await.expect("pod tracked");
    assert!(!pod.ready().0, "sidecar flip keeps the pod unready");
    // Not passing anywhere in the catalog view.
    let health = consul
        .agent_health_service_by_id("katalog-sync_a_default_web-0")
        .await
        .expect("health lookup");
    assert_ne!(health, "passing");
}

#[tokio::test(start_paused = true)]
async fn concurrent_triggers_coalesce_into_few_sweeps() {
    let (daemon, kubelet, consul, _) = new_daemon();
    kubelet.set_pods(vec![running_pod(
        "default",
        "web-0",
        &[(SERVICE_NAMES, "a")],
        vec![container_status("app", true)],
    )]);
    tokio::spawn(daemon.clone().run());

    let mut handles = Vec::new();
    for _ in 0..10 {
        let daemon = daemon.clone();
        handles.push(tokio::spawn(async move { daemon.trigger_sync().await }));
    }
    for handle in handles {
        handle
            .await
            .expect("trigger task")
            .expect("coalesced sweep succeeds");
    }

    let sweeps = consul.services_calls();
    assert!(sweeps >= 1, "at least one sweep served the triggers");
    assert!(
        sweeps < 10,
        "10 concurrent triggers must coalesce, saw {sweeps} sweeps"
    );
}
