//! Integration tests for the Unix socket server.
//!
//! These tests verify the DaemonServer works correctly as a complete system,
//! testing connection handling, protocol negotiation, lease and sweep
//! requests, live-event subscriptions and graceful shutdown.
//!
//! Tests CAN use `.unwrap()` and `.expect()`; production code is checked
//! through assertions.

use std::path::PathBuf;
use std::time::Duration;

use rfmux_core::{Device, DeviceRegistry, OwnerId, ReleaseReason, SweepEvent, SweepState};
use rfmux_protocol::{
    ClientMessage, DaemonMessage, FailureReason, MessageType, ProtocolVersion, RawFrequency,
};
use rfmuxd::config::{CaptureConfig, SweepConfig};
use rfmuxd::events::EventBridge;
use rfmuxd::lease::{spawn_lease_manager, LeaseHandle};
use rfmuxd::server::{DaemonServer, Services};
use rfmuxd::sweep::spawn_sweep_engine;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Constants
// ============================================================================

/// Maximum time to wait for server socket to appear
const SOCKET_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Interval between socket existence checks
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Grace period for server shutdown
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_millis(100);

/// Upper bound for a single reply
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Test Helpers
// ============================================================================

/// Test server context that manages server lifecycle and cleanup.
struct TestServer {
    socket_path: PathBuf,
    cancel_token: CancellationToken,
    leases: LeaseHandle,
    _temp_dir: TempDir, // Keep alive for RAII cleanup
}

impl TestServer {
    /// Spawns a server whose sweep engine runs a silent mock capture.
    async fn spawn() -> Self {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let socket_path = temp_dir.path().join("test.sock");

        let devices = DeviceRegistry::new();
        let leases = spawn_lease_manager(devices.clone(), Duration::from_secs(60));
        let bridge = EventBridge::new();
        let sweep = spawn_sweep_engine(mock_sweep_config(), leases.clone(), bridge.clone());
        let cancel_token = CancellationToken::new();

        let services = Services {
            leases: leases.clone(),
            sweep,
            bridge,
            devices,
        };
        let server = DaemonServer::new(socket_path.clone(), services, cancel_token.clone());

        // Spawn server in background
        tokio::spawn(async move {
            let _ = server.run().await;
        });

        // Wait for socket to be ready with timeout
        let start = tokio::time::Instant::now();
        while start.elapsed() < SOCKET_WAIT_TIMEOUT {
            if socket_path.exists() {
                break;
            }
            sleep(SOCKET_POLL_INTERVAL).await;
        }

        // Fail fast if socket didn't appear
        assert!(
            socket_path.exists(),
            "Server socket did not appear within {SOCKET_WAIT_TIMEOUT:?}"
        );

        TestServer {
            socket_path,
            cancel_token,
            leases,
            _temp_dir: temp_dir,
        }
    }

    /// Creates a client connection to the server.
    async fn connect(&self) -> TestClient {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .expect("connect to server");
        TestClient::new(stream)
    }

    /// Connects and completes the handshake.
    async fn connect_ready(&self) -> TestClient {
        let mut client = self.connect().await;
        client.handshake(None).await;
        client
    }

    /// Shuts down the server gracefully.
    async fn shutdown(self) {
        self.cancel_token.cancel();
        sleep(SHUTDOWN_GRACE_PERIOD).await;
    }
}

fn mock_sweep_config() -> SweepConfig {
    SweepConfig {
        startup_grace_ms: 200,
        kill_grace_ms: 500,
        capture: CaptureConfig {
            program: "sh".to_string(),
            process_name: Some("rfmux-server-test-none".to_string()),
            prefix_args: vec![
                "-c".to_string(),
                "exec sleep 30".to_string(),
                "mock-capture".to_string(),
            ],
            ..CaptureConfig::default()
        },
        ..SweepConfig::default()
    }
}

/// Test client connection with protocol helpers.
struct TestClient {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: tokio::net::unix::OwnedWriteHalf,
}

impl TestClient {
    fn new(stream: UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    /// Sends a message to the server.
    async fn send(&mut self, msg: ClientMessage) {
        let json = serde_json::to_string(&msg).unwrap();
        self.send_raw(&json).await;
    }

    /// Sends one raw line.
    async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    /// Receives a message from the server.
    async fn recv(&mut self) -> DaemonMessage {
        let mut line = String::new();
        timeout(RECV_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("reply in time")
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }

    /// Sends a request and returns the reply.
    async fn request(&mut self, msg: ClientMessage) -> DaemonMessage {
        self.send(msg).await;
        self.recv().await
    }

    /// Performs handshake with optional client ID.
    async fn handshake(&mut self, client_id: Option<String>) -> String {
        match self.request(ClientMessage::connect(client_id)).await {
            DaemonMessage::Connected { client_id, .. } => client_id,
            other => panic!("Expected Connected, got {other:?}"),
        }
    }

    /// Performs handshake with a specific protocol version.
    async fn handshake_with_version(&mut self, version: ProtocolVersion) -> DaemonMessage {
        let msg = ClientMessage {
            protocol_version: version,
            message: MessageType::Connect { client_id: None },
        };
        self.request(msg).await
    }
}

// ============================================================================
// Connection Tests
// ============================================================================

#[tokio::test]
async fn test_handshake_success() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    match client
        .request(ClientMessage::connect(Some("test-client".to_string())))
        .await
    {
        DaemonMessage::Connected {
            protocol_version,
            client_id,
        } => {
            assert_eq!(protocol_version, ProtocolVersion::CURRENT);
            assert_eq!(client_id, "test-client");
        }
        other => panic!("Expected Connected, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_handshake_auto_assigns_client_id() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    let client_id = client.handshake(None).await;
    assert!(client_id.starts_with("client-"), "got {client_id}");

    server.shutdown().await;
}

#[tokio::test]
async fn test_handshake_version_mismatch() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    match client.handshake_with_version(ProtocolVersion::new(2, 0)).await {
        DaemonMessage::Rejected {
            reason,
            protocol_version,
        } => {
            assert!(reason.contains("not compatible"), "got: {reason}");
            assert_eq!(protocol_version, ProtocolVersion::CURRENT);
        }
        other => panic!("Expected Rejected, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_wrong_message_before_handshake() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    match client.request(ClientMessage::list_leases()).await {
        DaemonMessage::Error { message, code } => {
            assert!(message.contains("Expected Connect"), "got: {message}");
            assert_eq!(code, Some(FailureReason::Protocol));
        }
        other => panic!("Expected Error, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_connect_rejected() {
    let server = TestServer::spawn().await;
    let mut client = server.connect_ready().await;

    match client.request(ClientMessage::connect(None)).await {
        DaemonMessage::Error { message, .. } => {
            assert!(message.contains("Already connected"), "got: {message}");
        }
        other => panic!("Expected Error, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_malformed_message_keeps_connection() {
    let server = TestServer::spawn().await;
    let mut client = server.connect_ready().await;

    client.send_raw("{not json").await;
    match client.recv().await {
        DaemonMessage::Error { message, code } => {
            assert!(message.contains("Malformed message"), "got: {message}");
            assert_eq!(code, Some(FailureReason::Protocol));
        }
        other => panic!("Expected Error, got {other:?}"),
    }

    // Still usable
    match client.request(ClientMessage::ping(7)).await {
        DaemonMessage::Pong { seq } => assert_eq!(seq, 7),
        other => panic!("Expected Pong, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_oversized_line_closes_connection() {
    let server = TestServer::spawn().await;
    let mut client = server.connect_ready().await;

    // Just over 1 MiB and no newline: the daemon must give up rather than buffer forever
    let payload = vec![b'x'; 1_048_576 + 64];
    let _ = client.writer.write_all(&payload).await;
    let _ = client.writer.flush().await;

    let mut line = String::new();
    let read = timeout(RECV_TIMEOUT, client.reader.read_line(&mut line))
        .await
        .expect("daemon should drop the connection");
    assert!(matches!(read, Ok(0) | Err(_)), "got {read:?} / {line}");

    // Other clients are unaffected
    let mut other = server.connect_ready().await;
    assert!(matches!(
        other.request(ClientMessage::ping(1)).await,
        DaemonMessage::Pong { seq: 1 }
    ));

    server.shutdown().await;
}

#[tokio::test]
async fn test_ping_pong() {
    let server = TestServer::spawn().await;
    let mut client = server.connect_ready().await;

    match client.request(ClientMessage::ping(42)).await {
        DaemonMessage::Pong { seq } => {
            assert_eq!(seq, 42, "Pong seq should match ping seq");
        }
        other => panic!("Expected Pong, got {other:?}"),
    }

    server.shutdown().await;
}

// ============================================================================
// Lease Tests
// ============================================================================

#[tokio::test]
async fn test_lease_conflict_between_tools() {
    let server = TestServer::spawn().await;
    let mut tool_a = server.connect_ready().await;
    let mut tool_b = server.connect_ready().await;

    match tool_a
        .request(ClientMessage::acquire_lease("toolA", "sdr", None))
        .await
    {
        DaemonMessage::Lease {
            success,
            device,
            owner,
            ..
        } => {
            assert!(success);
            assert_eq!(device, "sdr");
            assert_eq!(owner, Some(OwnerId::new("toolA")));
        }
        other => panic!("Expected Lease, got {other:?}"),
    }

    match tool_b
        .request(ClientMessage::acquire_lease("toolB", "hackrf", None))
        .await
    {
        DaemonMessage::Lease {
            success,
            owner,
            reason,
            message,
            ..
        } => {
            assert!(!success);
            assert_eq!(owner, Some(OwnerId::new("toolA")));
            assert_eq!(reason, Some(FailureReason::LeaseConflict));
            assert!(message.unwrap().contains("toolA"));
        }
        other => panic!("Expected Lease, got {other:?}"),
    }

    // toolB cannot release what it does not hold
    match tool_b
        .request(ClientMessage::release_lease("toolB", "sdr"))
        .await
    {
        DaemonMessage::Lease { success, reason, .. } => {
            assert!(!success);
            assert_eq!(reason, Some(FailureReason::LeaseConflict));
        }
        other => panic!("Expected Lease, got {other:?}"),
    }

    match tool_a
        .request(ClientMessage::release_lease("toolA", "sdr"))
        .await
    {
        DaemonMessage::Lease { success, owner, .. } => {
            assert!(success);
            assert!(owner.is_none());
        }
        other => panic!("Expected Lease, got {other:?}"),
    }

    match tool_b
        .request(ClientMessage::acquire_lease("toolB", "sdr", None))
        .await
    {
        DaemonMessage::Lease { success, .. } => assert!(success),
        other => panic!("Expected Lease, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_release_free_device_is_ok() {
    let server = TestServer::spawn().await;
    let mut client = server.connect_ready().await;

    match client
        .request(ClientMessage::release_lease("toolA", "wifi"))
        .await
    {
        DaemonMessage::Lease {
            success, device, ..
        } => {
            assert!(success);
            assert_eq!(device, "wifi_adapter");
        }
        other => panic!("Expected Lease, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_unknown_device_is_validation_failure() {
    let server = TestServer::spawn().await;
    let mut client = server.connect_ready().await;

    match client
        .request(ClientMessage::acquire_lease("toolA", "lora", None))
        .await
    {
        DaemonMessage::Lease {
            success, reason, ..
        } => {
            assert!(!success);
            assert_eq!(reason, Some(FailureReason::Validation));
        }
        other => panic!("Expected Lease, got {other:?}"),
    }

    match client
        .request(ClientMessage::acquire_lease("  ", "sdr", None))
        .await
    {
        DaemonMessage::Lease {
            success, reason, ..
        } => {
            assert!(!success);
            assert_eq!(reason, Some(FailureReason::Validation));
        }
        other => panic!("Expected Lease, got {other:?}"),
    }

    assert!(server.leases.leases().await.is_empty());
    server.shutdown().await;
}

#[tokio::test]
async fn test_force_release_and_list() {
    let server = TestServer::spawn().await;
    let mut client = server.connect_ready().await;

    client
        .request(ClientMessage::acquire_lease("kismet", "wifi_adapter", None))
        .await;
    client
        .request(ClientMessage::acquire_lease("btle", "bluetooth", None))
        .await;

    match client.request(ClientMessage::list_leases()).await {
        DaemonMessage::LeaseList { leases } => {
            assert_eq!(leases.len(), 2);
            assert_eq!(leases[0].device, Device::WifiAdapter);
            assert_eq!(leases[0].owner, OwnerId::new("kismet"));
        }
        other => panic!("Expected LeaseList, got {other:?}"),
    }

    match client
        .request(ClientMessage::force_release("wifi_adapter"))
        .await
    {
        DaemonMessage::Lease { success, .. } => assert!(success),
        other => panic!("Expected Lease, got {other:?}"),
    }

    assert!(server.leases.current_owner(Device::WifiAdapter).await.is_none());
    assert_eq!(
        server.leases.current_owner(Device::BluetoothRadio).await,
        Some(OwnerId::new("btle"))
    );

    server.shutdown().await;
}

#[tokio::test]
async fn test_watch_lease_pushes_revocation() {
    let server = TestServer::spawn().await;
    let mut holder = server.connect_ready().await;
    let mut admin = server.connect_ready().await;

    holder
        .request(ClientMessage::acquire_lease("rtl433", "sdr", None))
        .await;
    match holder
        .request(ClientMessage::watch_lease("rtl433", "hackrf"))
        .await
    {
        DaemonMessage::Lease { success, owner, .. } => {
            assert!(success);
            assert_eq!(owner, Some(OwnerId::new("rtl433")));
        }
        other => panic!("Expected Lease, got {other:?}"),
    }

    admin.request(ClientMessage::force_release("sdr")).await;

    match holder.recv().await {
        DaemonMessage::LeaseRevoked {
            device,
            owner,
            reason,
        } => {
            assert_eq!(device, "sdr");
            assert_eq!(owner, OwnerId::new("rtl433"));
            assert_eq!(reason, Some(ReleaseReason::Forced));
        }
        other => panic!("Expected LeaseRevoked, got {other:?}"),
    }

    // The watch is one-shot; the connection keeps serving requests
    match holder.request(ClientMessage::ping(7)).await {
        DaemonMessage::Pong { seq } => assert_eq!(seq, 7),
        other => panic!("Expected Pong, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_watch_lease_requires_ownership() {
    let server = TestServer::spawn().await;
    let mut client = server.connect_ready().await;

    match client
        .request(ClientMessage::watch_lease("rtl433", "sdr"))
        .await
    {
        DaemonMessage::Lease {
            success, reason, ..
        } => {
            assert!(!success);
            assert_eq!(reason, Some(FailureReason::Validation));
        }
        other => panic!("Expected Lease, got {other:?}"),
    }

    client
        .request(ClientMessage::acquire_lease("kismet", "sdr", None))
        .await;
    match client
        .request(ClientMessage::watch_lease("rtl433", "sdr"))
        .await
    {
        DaemonMessage::Lease {
            success,
            owner,
            reason,
            ..
        } => {
            assert!(!success);
            assert_eq!(owner, Some(OwnerId::new("kismet")));
            assert_eq!(reason, Some(FailureReason::LeaseConflict));
        }
        other => panic!("Expected Lease, got {other:?}"),
    }

    server.shutdown().await;
}

// ============================================================================
// Sweep Tests
// ============================================================================

#[tokio::test]
async fn test_start_sweep_validation() {
    let server = TestServer::spawn().await;
    let mut client = server.connect_ready().await;

    let invalid = [
        ClientMessage::start_sweep(Vec::new(), 10.0),
        ClientMessage::start_sweep(vec![RawFrequency::Value(2405.0)], 0.0),
        ClientMessage::start_sweep(vec![RawFrequency::Value(7000.0)], 10.0),
    ];

    for msg in invalid {
        match client.request(msg).await {
            DaemonMessage::Sweep {
                success,
                reason,
                status,
                ..
            } => {
                assert!(!success);
                assert_eq!(reason, Some(FailureReason::Validation));
                assert_eq!(status.state(), SweepState::Idle);
            }
            other => panic!("Expected Sweep, got {other:?}"),
        }
    }

    assert!(server.leases.current_owner(Device::Sdr).await.is_none());
    server.shutdown().await;
}

#[tokio::test]
async fn test_start_and_stop_sweep() {
    let server = TestServer::spawn().await;
    let mut client = server.connect_ready().await;

    match client
        .request(ClientMessage::start_sweep(
            vec![RawFrequency::Range {
                start: 2400.0,
                stop: 2410.0,
            }],
            10.0,
        ))
        .await
    {
        DaemonMessage::Sweep {
            success, status, ..
        } => {
            assert!(success);
            assert_eq!(status.state(), SweepState::Starting);
            assert_eq!(status.cycle.target_count, 1);
        }
        other => panic!("Expected Sweep, got {other:?}"),
    }

    // A second tool sees the SDR as taken
    match client
        .request(ClientMessage::acquire_lease("toolA", "sdr", None))
        .await
    {
        DaemonMessage::Lease {
            success, owner, ..
        } => {
            assert!(!success);
            assert_eq!(owner, Some(OwnerId::new("sweep")));
        }
        other => panic!("Expected Lease, got {other:?}"),
    }

    match client
        .request(ClientMessage::start_sweep(vec![RawFrequency::Value(915.0)], 10.0))
        .await
    {
        DaemonMessage::Sweep {
            success, reason, ..
        } => {
            assert!(!success);
            assert_eq!(reason, Some(FailureReason::AlreadyRunning));
        }
        other => panic!("Expected Sweep, got {other:?}"),
    }

    match client.request(ClientMessage::stop_sweep()).await {
        DaemonMessage::Sweep {
            success, status, ..
        } => {
            assert!(success);
            assert_eq!(status.state(), SweepState::Idle);
        }
        other => panic!("Expected Sweep, got {other:?}"),
    }

    assert!(server.leases.current_owner(Device::Sdr).await.is_none());
    server.shutdown().await;
}

#[tokio::test]
async fn test_sweep_blocked_by_tool_lease() {
    let server = TestServer::spawn().await;
    let mut client = server.connect_ready().await;

    client
        .request(ClientMessage::acquire_lease("toolA", "sdr", None))
        .await;

    match client
        .request(ClientMessage::start_sweep(vec![RawFrequency::Value(2405.0)], 10.0))
        .await
    {
        DaemonMessage::Sweep {
            success,
            reason,
            message,
            ..
        } => {
            assert!(!success);
            assert_eq!(reason, Some(FailureReason::LeaseConflict));
            assert!(message.unwrap().contains("toolA"));
        }
        other => panic!("Expected Sweep, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_status_emergency_stop_and_drain() {
    let server = TestServer::spawn().await;
    let mut client = server.connect_ready().await;

    match client.request(ClientMessage::sweep_status()).await {
        DaemonMessage::SweepStatus { status } => {
            assert_eq!(status.state(), SweepState::Idle);
            assert!(status.lease_owner.is_none());
        }
        other => panic!("Expected SweepStatus, got {other:?}"),
    }

    match client.request(ClientMessage::emergency_stop()).await {
        DaemonMessage::Sweep {
            success,
            status,
            orphans_terminated,
            ..
        } => {
            assert!(success);
            assert_eq!(status.state(), SweepState::Idle);
            assert_eq!(orphans_terminated, Some(0));
        }
        other => panic!("Expected Sweep, got {other:?}"),
    }

    match client.request(ClientMessage::drain_capture(Some(10))).await {
        DaemonMessage::CaptureData { lines } => assert!(lines.is_empty()),
        other => panic!("Expected CaptureData, got {other:?}"),
    }

    server.shutdown().await;
}

// ============================================================================
// Subscription Tests
// ============================================================================

#[tokio::test]
async fn test_subscribe_receives_status_events() {
    let server = TestServer::spawn().await;
    let mut watcher = server.connect_ready().await;
    let mut control = server.connect_ready().await;

    watcher.send(ClientMessage::subscribe()).await;
    match watcher.recv().await {
        DaemonMessage::Event {
            event: SweepEvent::Status { status },
        } => assert_eq!(status.state(), SweepState::Idle),
        other => panic!("Expected initial status event, got {other:?}"),
    }

    control
        .request(ClientMessage::start_sweep(vec![RawFrequency::Value(915.0)], 10.0))
        .await;

    match watcher.recv().await {
        DaemonMessage::Event {
            event: SweepEvent::Status { status },
        } => assert_eq!(status.state(), SweepState::Starting),
        other => panic!("Expected status event, got {other:?}"),
    }

    control.request(ClientMessage::stop_sweep()).await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_validation_error_reaches_subscribers() {
    let server = TestServer::spawn().await;
    let mut watcher = server.connect_ready().await;
    let mut control = server.connect_ready().await;

    watcher.send(ClientMessage::subscribe()).await;
    watcher.recv().await;

    control
        .request(ClientMessage::start_sweep(Vec::new(), 10.0))
        .await;

    match watcher.recv().await {
        DaemonMessage::Event {
            event: SweepEvent::Error { recoverable, .. },
        } => assert!(!recoverable),
        other => panic!("Expected error event, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_unsubscribe_stops_events() {
    let server = TestServer::spawn().await;
    let mut watcher = server.connect_ready().await;
    let mut control = server.connect_ready().await;

    watcher.send(ClientMessage::subscribe()).await;
    watcher.recv().await;
    watcher.send(ClientMessage::unsubscribe()).await;
    // Round trip so the unsubscribe is processed first
    watcher.request(ClientMessage::ping(0)).await;

    control
        .request(ClientMessage::start_sweep(Vec::new(), 10.0))
        .await;

    // The next thing the watcher sees is its own pong, not an event
    match watcher.request(ClientMessage::ping(1)).await {
        DaemonMessage::Pong { seq } => assert_eq!(seq, 1),
        other => panic!("Expected Pong, got {other:?}"),
    }

    server.shutdown().await;
}

// ============================================================================
// Graceful Shutdown Tests
// ============================================================================

#[tokio::test]
async fn test_graceful_shutdown() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    client.handshake(None).await;

    let socket_path = server.socket_path.clone();

    server.cancel_token.cancel();
    sleep(SHUTDOWN_GRACE_PERIOD).await;

    assert!(
        !socket_path.exists(),
        "Socket file should be removed after shutdown"
    );
}

#[tokio::test]
async fn test_multiple_clients_concurrent() {
    let server = TestServer::spawn().await;

    let mut handles = Vec::new();
    for i in 0..5 {
        let socket_path = server.socket_path.clone();
        let handle = tokio::spawn(async move {
            let stream = UnixStream::connect(&socket_path).await.unwrap();
            let mut client = TestClient::new(stream);

            let id = client.handshake(Some(format!("concurrent-{i}"))).await;
            assert_eq!(id, format!("concurrent-{i}"));

            match client
                .request(ClientMessage::acquire_lease(&format!("tool{i}"), "sdr", None))
                .await
            {
                DaemonMessage::Lease { success, .. } => success,
                other => panic!("Expected Lease, got {other:?}"),
            }
        });
        handles.push(handle);
    }

    let mut granted = 0;
    for handle in handles {
        if handle.await.expect("concurrent client task should succeed") {
            granted += 1;
        }
    }
    assert_eq!(granted, 1, "exactly one tool gets the SDR");

    server.shutdown().await;
}
