//! Integration tests for the client library against a real daemon server.
//!
//! Tests CAN use `.unwrap()` and `.expect()`; production code is checked
//! through assertions.

use std::path::PathBuf;
use std::time::Duration;

use rfmux_cli::{
    run_with_lease, ClientConfig, ClientError, DaemonClient, EventWatcher, LaunchRequest,
    WatchEvent,
};
use rfmux_core::{Device, DeviceRegistry, OwnerId, ReleaseReason, SweepEvent, SweepState};
use rfmux_protocol::{FailureReason, RawFrequency};
use rfmuxd::config::{CaptureConfig, SweepConfig};
use rfmuxd::events::EventBridge;
use rfmuxd::lease::{spawn_lease_manager, LeaseHandle};
use rfmuxd::server::{DaemonServer, Services};
use rfmuxd::sweep::spawn_sweep_engine;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

const SOCKET_WAIT_TIMEOUT: Duration = Duration::from_millis(500);
const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Test Helpers
// ============================================================================

struct TestDaemon {
    config: ClientConfig,
    leases: LeaseHandle,
    cancel_token: CancellationToken,
    temp_dir: TempDir,
}

impl TestDaemon {
    async fn spawn() -> Self {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let socket_path = temp_dir.path().join("rfmux.sock");

        let devices = DeviceRegistry::new();
        let leases = spawn_lease_manager(devices.clone(), Duration::from_millis(100));
        let bridge = EventBridge::new();
        let sweep = spawn_sweep_engine(mock_sweep_config(), leases.clone(), bridge.clone());
        let cancel_token = CancellationToken::new();

        let server = DaemonServer::new(
            socket_path.clone(),
            Services {
                leases: leases.clone(),
                sweep,
                bridge,
                devices,
            },
            cancel_token.clone(),
        );
        tokio::spawn(async move {
            let _ = server.run().await;
        });

        let start = Instant::now();
        while !socket_path.exists() {
            assert!(start.elapsed() < SOCKET_WAIT_TIMEOUT, "socket never appeared");
            sleep(Duration::from_millis(10)).await;
        }

        Self {
            config: config_for(socket_path),
            leases,
            cancel_token,
            temp_dir,
        }
    }

    async fn client(&self) -> DaemonClient {
        DaemonClient::connect(&self.config).await.unwrap()
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

fn config_for(socket_path: PathBuf) -> ClientConfig {
    ClientConfig {
        socket_path,
        request_timeout: Duration::from_secs(5),
        retry_initial_delay: Duration::from_millis(20),
        retry_max_delay: Duration::from_millis(200),
        ..Default::default()
    }
}

fn mock_sweep_config() -> SweepConfig {
    SweepConfig {
        startup_grace_ms: 200,
        kill_grace_ms: 500,
        capture: CaptureConfig {
            program: "sh".to_string(),
            process_name: Some("rfmux-cli-test-none".to_string()),
            prefix_args: vec![
                "-c".to_string(),
                "while true; do echo '2024-03-01, 12:00:00.0, 905000000, 925000000, 1000000.00, 20, -60.0, -30.5'; sleep 0.05; done"
                    .to_string(),
                "mock-capture".to_string(),
            ],
            ..CaptureConfig::default()
        },
        ..SweepConfig::default()
    }
}

async fn next(rx: &mut mpsc::UnboundedReceiver<WatchEvent>) -> WatchEvent {
    timeout(EVENT_TIMEOUT, rx.recv())
        .await
        .expect("watch event in time")
        .expect("watcher channel open")
}

fn launch(tool: &str, script: &str) -> LaunchRequest {
    LaunchRequest {
        tool_name: tool.to_string(),
        device: "sdr".to_string(),
        program: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
    }
}

// ============================================================================
// Request Client
// ============================================================================

#[tokio::test]
async fn test_lease_requests() {
    let daemon = TestDaemon::spawn().await;
    let mut client_a = daemon.client().await;
    let mut client_b = daemon.client().await;

    let reply = client_a.acquire_lease("toolA", "hackrf", None).await.unwrap();
    assert_eq!(reply.device, "sdr");
    assert_eq!(reply.owner, Some(OwnerId::new("toolA")));

    match client_b.acquire_lease("toolB", "sdr", None).await {
        Err(ClientError::LeaseDenied { owner, .. }) => assert_eq!(owner, Some(OwnerId::new("toolA"))),
        other => panic!("expected LeaseDenied, got {other:?}"),
    }

    let leases = client_b.list_leases().await.unwrap();
    assert_eq!(leases.len(), 1);
    assert_eq!(leases[0].device, Device::Sdr);

    client_b.force_release("sdr").await.unwrap();
    assert!(client_a.list_leases().await.unwrap().is_empty());

    match client_a.acquire_lease("toolA", "lora", None).await {
        Err(ClientError::Lease(message)) => assert!(message.contains("lora")),
        other => panic!("expected Lease error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_sweep_requests() {
    let daemon = TestDaemon::spawn().await;
    let mut client = daemon.client().await;

    let reply = client.start_sweep(Vec::new(), 10.0).await.unwrap();
    assert!(!reply.success);
    assert_eq!(reply.reason, Some(FailureReason::Validation));

    let reply = client
        .start_sweep(vec![RawFrequency::Value(915.0)], 10.0)
        .await
        .unwrap();
    assert!(reply.success, "{:?}", reply.message);

    let start = Instant::now();
    loop {
        let status = client.sweep_status().await.unwrap();
        if status.state() == SweepState::Running && status.buffered_lines > 0 {
            break;
        }
        assert!(start.elapsed() < EVENT_TIMEOUT, "sweep never ran: {status:?}");
        sleep(Duration::from_millis(20)).await;
    }

    let lines = client.drain_capture(Some(1)).await.unwrap();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].power_dbm, -30.5);

    let reply = client.emergency_stop().await.unwrap();
    assert!(reply.success);
    assert_eq!(reply.status.state(), SweepState::Idle);
    assert!(reply.orphans_terminated.is_some());

    client.ping(1).await.unwrap();
    client.disconnect().await.unwrap();
}

// ============================================================================
// Launcher
// ============================================================================

#[tokio::test]
async fn test_launcher_holds_lease_while_running() {
    let daemon = TestDaemon::spawn().await;
    let config = daemon.config.clone();

    let task = tokio::spawn(async move {
        run_with_lease(&config, &launch("kismet-sdr", "sleep 0.5; exit 4")).await
    });

    let start = Instant::now();
    while daemon.leases.current_owner(Device::Sdr).await.is_none() {
        assert!(start.elapsed() < EVENT_TIMEOUT, "lease never acquired");
        sleep(Duration::from_millis(10)).await;
    }
    let lease = daemon.leases.get(Device::Sdr).await.unwrap();
    assert_eq!(lease.owner, OwnerId::new("kismet-sdr"));
    assert!(lease.owner_process.is_some());

    let status = timeout(EVENT_TIMEOUT, task).await.unwrap().unwrap().unwrap();
    assert_eq!(status.code(), Some(4));
    assert!(daemon.leases.current_owner(Device::Sdr).await.is_none());
}

#[tokio::test]
async fn test_launcher_stops_tool_when_lease_force_released() {
    let daemon = TestDaemon::spawn().await;
    let config = daemon.config.clone();
    let started = daemon.temp_dir.path().join("started");
    let script = format!("touch '{}'; sleep 3; exit 0", started.display());

    let task = tokio::spawn(async move { run_with_lease(&config, &launch("toolA", &script)).await });

    // The tool only starts once its lease is being watched
    let start = Instant::now();
    while !started.exists() {
        assert!(start.elapsed() < EVENT_TIMEOUT, "tool never started");
        sleep(Duration::from_millis(10)).await;
    }

    let evicted = daemon.leases.force_release(Device::Sdr).await.unwrap();
    assert_eq!(evicted.map(|lease| lease.owner), Some(OwnerId::new("toolA")));
    let granted = daemon
        .leases
        .acquire(OwnerId::new("toolB"), Device::Sdr, None)
        .await
        .unwrap();
    assert!(granted.granted);

    let result = timeout(Duration::from_millis(1500), task)
        .await
        .expect("launcher should stop its tool once evicted")
        .unwrap();
    assert!(
        matches!(
            result,
            Err(ClientError::LeaseRevoked {
                ref device,
                reason: Some(ReleaseReason::Forced),
            }) if device == "sdr"
        ),
        "got {result:?}"
    );

    // The new holder keeps the device
    assert_eq!(
        daemon.leases.current_owner(Device::Sdr).await,
        Some(OwnerId::new("toolB"))
    );
}

#[tokio::test]
async fn test_launcher_denied_when_held() {
    let daemon = TestDaemon::spawn().await;
    daemon
        .leases
        .acquire(OwnerId::new("sweep"), Device::Sdr, None)
        .await
        .unwrap();

    let marker = daemon.temp_dir.path().join("ran");
    let script = format!("touch '{}'", marker.display());
    let result = run_with_lease(&daemon.config, &launch("toolB", &script)).await;

    assert!(matches!(result, Err(ClientError::LeaseDenied { .. })));
    assert!(!marker.exists(), "tool must not run without the lease");
}

#[tokio::test]
async fn test_launcher_releases_when_spawn_fails() {
    let daemon = TestDaemon::spawn().await;
    let request = LaunchRequest {
        program: "/nonexistent/rfmux-tool".to_string(),
        ..launch("toolC", "")
    };

    let result = run_with_lease(&daemon.config, &request).await;

    assert!(matches!(result, Err(ClientError::Launch { .. })));
    assert!(daemon.leases.current_owner(Device::Sdr).await.is_none());
}

// ============================================================================
// Watcher
// ============================================================================

#[tokio::test]
async fn test_watcher_streams_events() {
    let daemon = TestDaemon::spawn().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let cancel_token = CancellationToken::new();
    let watcher = EventWatcher::new(daemon.config.clone(), tx, cancel_token.clone());
    let task = tokio::spawn(async move { watcher.run().await });

    assert!(matches!(next(&mut rx).await, WatchEvent::Connected { .. }));
    assert!(matches!(
        next(&mut rx).await,
        WatchEvent::Event(SweepEvent::Status { ref status }) if status.state() == SweepState::Idle
    ));

    let mut client = daemon.client().await;
    client
        .start_sweep(vec![RawFrequency::Value(915.0)], 10.0)
        .await
        .unwrap();

    let start = Instant::now();
    loop {
        if let WatchEvent::Event(SweepEvent::SweepData { line, .. }) = next(&mut rx).await {
            assert_eq!(line.power_dbm, -30.5);
            break;
        }
        assert!(start.elapsed() < EVENT_TIMEOUT);
    }

    client.stop_sweep().await.unwrap();
    cancel_token.cancel();
    timeout(EVENT_TIMEOUT, task).await.unwrap().unwrap();
}
