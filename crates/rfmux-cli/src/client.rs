//! Request/response client for the rfmux daemon.
//!
//! This module provides the `DaemonClient` which handles:
//! - Connection to the daemon via Unix socket
//! - The versioned `connect` handshake
//! - Typed wrappers for every lease and sweep request
//! - [`LeaseWatch`]: a connection parked on a held lease, waiting for
//!   the daemon to say it is gone
//!
//! Long-lived event streams live in [`crate::watch`].
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::path::PathBuf;
use std::time::Duration;

use rfmux_core::{CaptureLine, Lease, OwnerId, ReleaseReason, SweepStatus};
use rfmux_protocol::{ClientMessage, DaemonMessage, FailureReason, ProtocolVersion, RawFrequency};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};

/// Default daemon socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/rfmux.sock";

/// Environment variable overriding the socket path.
pub const SOCKET_ENV: &str = "RFMUX_SOCKET";

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for daemon clients.
///
/// Controls the socket path, the per-request timeout and the reconnect
/// policy used by [`crate::watch::EventWatcher`].
///
/// # Example
///
/// ```rust
/// use rfmux_cli::client::ClientConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig {
///     socket_path: std::path::PathBuf::from("/tmp/my-rfmux.sock"),
///     retry_initial_delay: Duration::from_millis(500),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Path to the Unix socket where the daemon listens.
    pub socket_path: PathBuf,

    /// How long to wait for a single reply.
    pub request_timeout: Duration,

    /// Initial delay before first retry after connection failure.
    pub retry_initial_delay: Duration,

    /// Maximum delay between retry attempts.
    pub retry_max_delay: Duration,

    /// Multiplier for exponential backoff (e.g., 2.0 doubles delay each retry).
    pub retry_multiplier: f64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            request_timeout: Duration::from_secs(30),
            retry_initial_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
            retry_multiplier: 2.0,
        }
    }
}

impl ClientConfig {
    /// Default configuration with `RFMUX_SOCKET` applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(socket) = std::env::var(SOCKET_ENV) {
            if !socket.trim().is_empty() {
                config.socket_path = PathBuf::from(socket);
            }
        }
        config
    }

    /// Next reconnect delay after `current`, capped at `retry_max_delay`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        let next_ms = (current.as_millis() as f64 * self.retry_multiplier) as u64;
        Duration::from_millis(next_ms).min(self.retry_max_delay)
    }
}

// ============================================================================
// Reply Types
// ============================================================================

/// Successful reply to a lease request.
#[derive(Debug, Clone, PartialEq)]
pub struct LeaseReply {
    /// Canonical device name
    pub device: String,
    /// Holder after the operation
    pub owner: Option<OwnerId>,
}

/// Reply to a sweep control request.
#[derive(Debug, Clone)]
pub struct SweepReply {
    pub success: bool,
    pub reason: Option<FailureReason>,
    pub message: Option<String>,
    pub status: SweepStatus,
    pub orphans_terminated: Option<usize>,
}

// ============================================================================
// Daemon Client
// ============================================================================

/// A handshaken connection to the daemon.
///
/// Requests are strictly sequential: each call writes one message and
/// reads the next reply. Live events are not subscribed on this
/// connection; use [`crate::watch::EventWatcher`] for those.
///
/// # Example
///
/// ```rust,no_run
/// use rfmux_cli::client::{ClientConfig, DaemonClient};
///
/// # async fn example() -> rfmux_cli::Result<()> {
/// let mut client = DaemonClient::connect(&ClientConfig::from_env()).await?;
/// let status = client.sweep_status().await?;
/// println!("sweep is {}", status.state());
/// # Ok(())
/// # }
/// ```
pub struct DaemonClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    client_id: String,
    request_timeout: Duration,
}

impl DaemonClient {
    /// Connects to the daemon and performs the handshake.
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        Self::connect_as(config, None).await
    }

    /// Connects with an explicit client id.
    pub async fn connect_as(config: &ClientConfig, client_id: Option<String>) -> Result<Self> {
        let stream = UnixStream::connect(&config.socket_path)
            .await
            .map_err(|source| ClientError::Connect {
                path: config.socket_path.clone(),
                source,
            })?;

        let (reader, writer) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(reader),
            writer,
            client_id: String::new(),
            request_timeout: config.request_timeout,
        };

        let reply = client.request(ClientMessage::connect(client_id)).await?;
        client.client_id = check_handshake(reply)?;
        info!(client_id = %client.client_id, "Connected to daemon");
        Ok(client)
    }

    /// Client id assigned by the daemon.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Sends one message and waits for its reply.
    ///
    /// Daemon `error` replies are turned into [`ClientError::Daemon`].
    pub async fn request(&mut self, message: ClientMessage) -> Result<DaemonMessage> {
        send_message(&mut self.writer, &message).await?;

        let reply = timeout(self.request_timeout, self.read_reply())
            .await
            .map_err(|_| ClientError::Timeout)??;

        match reply {
            DaemonMessage::Error { message, code } => {
                warn!(error_message = %message, error_code = ?code, "Received error from daemon");
                Err(ClientError::Daemon { message, code })
            }
            other => Ok(other),
        }
    }

    async fn read_reply(&mut self) -> Result<DaemonMessage> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line).await? == 0 {
                return Err(ClientError::Closed);
            }
            let message: DaemonMessage = serde_json::from_str(line.trim())?;
            // Only subscribers and lease watchers get pushes; skip any stragglers
            match &message {
                DaemonMessage::Event { event } => {
                    debug!(event = event.name(), "Skipping event on request connection");
                }
                DaemonMessage::LeaseRevoked { device, .. } => {
                    debug!(device, "Skipping lease revocation on request connection");
                }
                _ => return Ok(message),
            }
        }
    }

    // ========================================================================
    // Leases
    // ========================================================================

    /// Acquires `device` for `tool_name`.
    ///
    /// With `pid` set, the daemon reaps the lease when that process exits.
    pub async fn acquire_lease(&mut self, tool_name: &str, device: &str, pid: Option<u32>) -> Result<LeaseReply> {
        let reply = self
            .request(ClientMessage::acquire_lease(tool_name, device, pid))
            .await?;
        lease_reply(reply)
    }

    /// Releases `device` if `tool_name` holds it.
    pub async fn release_lease(&mut self, tool_name: &str, device: &str) -> Result<LeaseReply> {
        let reply = self
            .request(ClientMessage::release_lease(tool_name, device))
            .await?;
        lease_reply(reply)
    }

    /// Turns this connection into a watch on a lease `tool_name` holds.
    ///
    /// Fails like a lease request when `tool_name` does not hold `device`.
    pub async fn watch_lease(mut self, tool_name: &str, device: &str) -> Result<LeaseWatch> {
        let reply = self
            .request(ClientMessage::watch_lease(tool_name, device))
            .await?;
        let LeaseReply { device, owner } = lease_reply(reply)?;
        Ok(LeaseWatch {
            lines: self.reader.lines(),
            writer: self.writer,
            owner: owner.unwrap_or_else(|| OwnerId::new(tool_name)),
            device,
            seq: 0,
        })
    }

    /// Evicts whoever holds `device`.
    pub async fn force_release(&mut self, device: &str) -> Result<LeaseReply> {
        let reply = self.request(ClientMessage::force_release(device)).await?;
        lease_reply(reply)
    }

    pub async fn list_leases(&mut self) -> Result<Vec<Lease>> {
        match self.request(ClientMessage::list_leases()).await? {
            DaemonMessage::LeaseList { leases } => Ok(leases),
            other => Err(unexpected("lease_list", &other)),
        }
    }

    // ========================================================================
    // Sweep
    // ========================================================================

    pub async fn start_sweep(&mut self, frequencies: Vec<RawFrequency>, cycle_time_sec: f64) -> Result<SweepReply> {
        let reply = self
            .request(ClientMessage::start_sweep(frequencies, cycle_time_sec))
            .await?;
        sweep_reply(reply)
    }

    pub async fn stop_sweep(&mut self) -> Result<SweepReply> {
        let reply = self.request(ClientMessage::stop_sweep()).await?;
        sweep_reply(reply)
    }

    /// Stops the sweep and kills orphaned capture processes.
    pub async fn emergency_stop(&mut self) -> Result<SweepReply> {
        let reply = self.request(ClientMessage::emergency_stop()).await?;
        sweep_reply(reply)
    }

    pub async fn sweep_status(&mut self) -> Result<SweepStatus> {
        match self.request(ClientMessage::sweep_status()).await? {
            DaemonMessage::SweepStatus { status } => Ok(*status),
            other => Err(unexpected("sweep_status", &other)),
        }
    }

    /// Takes up to `limit` buffered capture lines, oldest first.
    pub async fn drain_capture(&mut self, limit: Option<usize>) -> Result<Vec<CaptureLine>> {
        match self.request(ClientMessage::drain_capture(limit)).await? {
            DaemonMessage::CaptureData { lines } => Ok(lines),
            other => Err(unexpected("capture_data", &other)),
        }
    }

    /// Round-trips a ping and returns the latency.
    pub async fn ping(&mut self, seq: u64) -> Result<Duration> {
        let start = std::time::Instant::now();
        match self.request(ClientMessage::ping(seq)).await? {
            DaemonMessage::Pong { seq: echoed } if echoed == seq => Ok(start.elapsed()),
            other => Err(unexpected("pong", &other)),
        }
    }

    /// Tells the daemon we are leaving and closes the connection.
    pub async fn disconnect(mut self) -> Result<()> {
        send_message(&mut self.writer, &ClientMessage::disconnect()).await?;
        self.writer.shutdown().await?;
        Ok(())
    }
}

// ============================================================================
// Lease Watch
// ============================================================================

/// A held lease ended while it was being watched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revocation {
    pub device: String,
    pub owner: OwnerId,
    /// Unknown when the daemon lost track of its lease events
    pub reason: Option<ReleaseReason>,
}

impl From<Revocation> for ClientError {
    fn from(revocation: Revocation) -> Self {
        ClientError::LeaseRevoked {
            device: revocation.device,
            reason: revocation.reason,
        }
    }
}

/// Connection dedicated to one watched lease.
///
/// Created by [`DaemonClient::watch_lease`]. Dropping it closes the
/// connection.
pub struct LeaseWatch {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    device: String,
    owner: OwnerId,
    seq: u64,
}

impl LeaseWatch {
    /// Canonical name of the watched device.
    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    /// Waits until the daemon reports the lease gone.
    ///
    /// Pings every `keepalive` so the daemon does not drop the connection
    /// as idle. A closed connection is returned as [`ClientError::Closed`];
    /// without the daemon there is no lease either.
    pub async fn revoked(&mut self, keepalive: Duration) -> Result<Revocation> {
        let mut ticker = interval_at(Instant::now() + keepalive, keepalive);
        loop {
            tokio::select! {
                line = self.lines.next_line() => {
                    let Some(line) = line? else {
                        return Err(ClientError::Closed);
                    };
                    match serde_json::from_str::<DaemonMessage>(line.trim())? {
                        DaemonMessage::LeaseRevoked { device, owner, reason } => {
                            return Ok(Revocation { device, owner, reason });
                        }
                        DaemonMessage::Pong { .. } => {}
                        other => debug!(message = ?other, "Ignoring message on lease watch"),
                    }
                }
                _ = ticker.tick() => {
                    self.seq += 1;
                    send_message(&mut self.writer, &ClientMessage::ping(self.seq)).await?;
                }
            }
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Writes one newline-delimited JSON message.
pub(crate) async fn send_message<W: AsyncWriteExt + Unpin>(writer: &mut W, message: &ClientMessage) -> Result<()> {
    let json = serde_json::to_string(message)?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    debug!(message_type = ?message.message, "Sent message to daemon");
    Ok(())
}

/// Validates the reply to `connect` and returns the assigned client id.
pub(crate) fn check_handshake(reply: DaemonMessage) -> Result<String> {
    match reply {
        DaemonMessage::Connected {
            protocol_version,
            client_id,
        } => {
            if !ProtocolVersion::CURRENT.is_compatible_with(&protocol_version) {
                return Err(ClientError::VersionMismatch {
                    client_version: ProtocolVersion::CURRENT.to_string(),
                    daemon_version: protocol_version.to_string(),
                });
            }
            Ok(client_id)
        }
        DaemonMessage::Rejected { reason, .. } => Err(ClientError::Rejected(reason)),
        other => Err(unexpected("connected", &other)),
    }
}

fn lease_reply(reply: DaemonMessage) -> Result<LeaseReply> {
    match reply {
        DaemonMessage::Lease {
            success: true,
            device,
            owner,
            ..
        } => Ok(LeaseReply { device, owner }),
        DaemonMessage::Lease {
            device,
            owner,
            reason: Some(FailureReason::LeaseConflict),
            ..
        } => Err(ClientError::LeaseDenied { device, owner }),
        DaemonMessage::Lease {
            device, message, ..
        } => Err(ClientError::Lease(
            message.unwrap_or_else(|| format!("request for {device} failed")),
        )),
        other => Err(unexpected("lease", &other)),
    }
}

fn sweep_reply(reply: DaemonMessage) -> Result<SweepReply> {
    match reply {
        DaemonMessage::Sweep {
            success,
            reason,
            message,
            status,
            orphans_terminated,
        } => Ok(SweepReply {
            success,
            reason,
            message,
            status: *status,
            orphans_terminated,
        }),
        other => Err(unexpected("sweep", &other)),
    }
}

fn unexpected(expected: &str, got: &DaemonMessage) -> ClientError {
    ClientError::ProtocolError(format!("expected {expected} reply, got {got:?}"))
}

// ============================================================================
// Tests
// ============================================================================
