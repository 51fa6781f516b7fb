use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use katalog_sync::katalog_sync::consul::{ConsulAgent, ConsulCatalog};
use katalog_sync::katalog_sync::daemon::Daemon;
use katalog_sync::katalog_sync::server;
use katalog_sync::katalog_sync::sidecar::DaemonClient;
use katalog_sync::katalog_sync::server::SyncRequest;
use katalog_sync::katalog_sync::test_support::{
    container_status, running_pod, test_daemon_config, FakeConsul, FakeKubelet, FakePatcher,
};

const SERVICE_NAMES: &str = "katalog-sync.wish.com/service-names";
const SIDECAR: &str = "katalog-sync.wish.com/sidecar";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

async fn serve(daemon: Arc<Daemon>) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    let router = server::rpc_router(daemon);
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    addr
}

async fn serve_metrics(daemon: Arc<Daemon>) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    let router = server::metrics_router(daemon);
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    addr
}

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
async fn sidecar_client_registers_and_deregisters_over_http() {
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
    let addr = serve(daemon.clone()).await;

    let client = DaemonClient::new(&format!("http://{addr}")).expect("client");
    let request = SyncRequest {
        namespace: "default".to_string(),
        pod_name: "web-0".to_string(),
        container_name: "katalog-sync-sidecar".to_string(),
    };

    tokio::time::timeout(HANDSHAKE_TIMEOUT, client.register(&request))
        .await
        .expect("register must not hang")
        .expect("register succeeds over the wire");
    assert!(consul.service("katalog-sync_a_default_web-0").is_some());

    tokio::time::timeout(HANDSHAKE_TIMEOUT, client.deregister(&request))
        .await
        .expect("deregister must not hang")
        .expect("deregister succeeds over the wire");
}

#[tokio::test]
async fn register_error_is_carried_in_the_response_body() {
    let (daemon, _, _, _) = new_daemon();
    tokio::spawn(daemon.clone().run());
    let addr = serve(daemon.clone()).await;

    let client = DaemonClient::new(&format!("http://{addr}")).expect("client");
    let request = SyncRequest {
        namespace: "default".to_string(),
        pod_name: "ghost".to_string(),
        container_name: "katalog-sync-sidecar".to_string(),
    };

    let err = tokio::time::timeout(HANDSHAKE_TIMEOUT, client.register(&request))
        .await
        .expect("register must not hang")
        .expect_err("unknown pod errors");
    assert!(
        err.to_string().contains("Unable to find pod"),
        "daemon error text reaches the sidecar: {err}"
    );
}

#[tokio::test]
async fn metrics_and_health_are_exposed() {
    let (daemon, kubelet, _, _) = new_daemon();
    kubelet.set_pods(vec![running_pod(
        "default",
        "web-0",
        &[(SERVICE_NAMES, "a")],
        vec![container_status("app", true)],
    )]);
    tokio::spawn(daemon.clone().run());
    daemon.trigger_sync().await.expect("sweep");
    let addr = serve_metrics(daemon.clone()).await;

    let health = reqwest::get(format!("http://{addr}/healthz"))
        .await
        .expect("healthz request");
    assert!(health.status().is_success());
    let report = health.json::<serde_json::Value>().await.expect("health body");
    assert_eq!(report["status"], "ready");

    let metrics = reqwest::get(format!("http://{addr}/metrics"))
        .await
        .expect("metrics request")
        .text()
        .await
        .expect("metrics body");
    assert!(metrics.contains("katalog_sync_consul_sync_total"));
}

#[tokio::test]
async fn degraded_upstream_flips_health() {
    let (daemon, _, consul, _) = new_daemon();
    consul.fail_services_with("agent down");
    let addr = serve_metrics(daemon.clone()).await;

    let health = reqwest::get(format!("http://{addr}/healthz"))
        .await
        .expect("healthz request");
    assert_eq!(health.status().as_u16(), 503);
    let report = health.json::<serde_json::Value>().await.expect("health body");
    assert_eq!(report["status"], "degraded");
}
