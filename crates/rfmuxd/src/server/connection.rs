//! Connection handler for individual client connections.
//!
//! Each client connection gets its own `ConnectionHandler` that:
//! - Performs protocol version negotiation
//! - Parses incoming messages
//! - Routes lease requests to the lease manager and sweep requests to
//!   the sweep engine
//! - Forwards live sweep events to subscribed clients
//! - Tells lease watchers when their lease is taken away
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Connection errors are logged and result in graceful disconnect

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use rfmux_core::{Device, OwnerId, ReleaseReason, SweepEvent, SweepStatus};
use rfmux_protocol::{
    parse_cycle_time, parse_targets, ClientMessage, DaemonMessage, FailureReason, MessageType,
    ProtocolVersion, RawFrequency,
};

use super::{Services, MAX_SUBSCRIBERS};
use crate::events::{EventBridge, SinkId, DEFAULT_SUBSCRIBER_CAPACITY};
use crate::lease::{LeaseError, LeaseEvent, LeaseHandle};

/// Writer half shared between request replies and the event forwarder
pub type SharedWriter = Arc<Mutex<BufWriter<OwnedWriteHalf>>>;

/// A live-event subscription.
pub struct Subscriber {
    sink: SinkId,
    forwarder: JoinHandle<()>,
}

impl Subscriber {
    /// Unregisters the sink and stops the forwarder.
    pub fn close(self, bridge: &EventBridge) {
        bridge.unregister(self.sink);
        self.forwarder.abort();
    }
}

/// Type alias for the subscribers map
pub type SubscribersMap = Arc<RwLock<HashMap<String, Subscriber>>>;

/// Maximum message size (1 MB)
const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Read timeout for idle connections (5 minutes)
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Write timeout (10 seconds)
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Unique identifier for this connection
type ClientId = String;

/// Connection handler for a single client.
pub struct ConnectionHandler {
    reader: BufReader<OwnedReadHalf>,

    /// Buffered writer (shared with the event forwarder)
    writer: SharedWriter,

    services: Services,

    subscribers: SubscribersMap,

    /// Lease watch tasks; aborted when the connection goes away
    lease_watches: Vec<JoinHandle<()>>,

    /// Unique client identifier (assigned after handshake)
    client_id: Option<ClientId>,

    connection_number: u64,
}

impl ConnectionHandler {
    pub fn new(
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        services: Services,
        subscribers: SubscribersMap,
        connection_number: u64,
    ) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer: Arc::new(Mutex::new(BufWriter::new(writer))),
            services,
            subscribers,
            lease_watches: Vec::new(),
            client_id: None,
            connection_number,
        }
    }

    /// Runs the connection handler.
    ///
    /// Performs the handshake then enters the message processing loop.
    /// Returns the client id once the connection closes.
    pub async fn run(mut self) -> Option<ClientId> {
        debug!(connection = self.connection_number, "New client connected");

        match timeout(READ_TIMEOUT, self.handle_handshake()).await {
            Ok(Ok(())) => {
                info!(client_id = ?self.client_id, "Client handshake completed");
            }
            Ok(Err(e)) => {
                warn!(
                    connection = self.connection_number,
                    error = %e,
                    "Handshake failed"
                );
                return None;
            }
            Err(_) => {
                warn!(connection = self.connection_number, "Handshake timed out");
                return None;
            }
        }

        let client_id = self.client_id.clone();

        if let Err(e) = self.process_messages().await {
            debug!(
                client_id = ?self.client_id,
                error = %e,
                "Connection closed"
            );
        }

        info!(client_id = ?self.client_id, "Client disconnected");
        client_id
    }

    /// Expects a `Connect` message, validates the protocol version, and
    /// responds with `Connected` or `Rejected`.
    async fn handle_handshake(&mut self) -> Result<(), ConnectionError> {
        let msg = self.read_message().await?;

        let client_version = msg.protocol_version;
        if !client_version.is_compatible_with(&ProtocolVersion::CURRENT) {
            warn!(
                client_version = %client_version,
                server_version = %ProtocolVersion::CURRENT,
                "Protocol version mismatch"
            );

            self.send_message(DaemonMessage::rejected(&format!(
                "Protocol version {} not compatible with server version {}",
                client_version,
                ProtocolVersion::CURRENT
            )))
            .await?;

            return Err(ConnectionError::VersionMismatch {
                client: client_version,
                server: ProtocolVersion::CURRENT,
            });
        }

        match msg.message {
            MessageType::Connect { client_id } => {
                let assigned_id = client_id
                    .filter(|id| !id.trim().is_empty())
                    .unwrap_or_else(|| format!("client-{}", self.connection_number));

                self.client_id = Some(assigned_id.clone());
                self.send_message(DaemonMessage::connected(assigned_id))
                    .await?;
                Ok(())
            }
            other => {
                self.send_message(DaemonMessage::error_with_code(
                    "Expected Connect message for handshake",
                    FailureReason::Protocol,
                ))
                .await?;

                Err(ConnectionError::UnexpectedMessage(format!("{other:?}")))
            }
        }
    }

    /// Reads and processes messages until the connection closes or an
    /// unrecoverable error occurs. Malformed messages are answered with a
    /// protocol error and skipped.
    async fn process_messages(&mut self) -> Result<(), ConnectionError> {
        loop {
            let msg = match timeout(READ_TIMEOUT, self.read_message()).await {
                Ok(Ok(msg)) => msg,
                Ok(Err(ConnectionError::Eof)) => {
                    debug!(client_id = ?self.client_id, "Client sent EOF");
                    return Ok(());
                }
                Ok(Err(ConnectionError::ParseError(e))) => {
                    debug!(client_id = ?self.client_id, error = %e, "Malformed message");
                    self.send_message(DaemonMessage::error_with_code(
                        &format!("Malformed message: {e}"),
                        FailureReason::Protocol,
                    ))
                    .await?;
                    continue;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    debug!(client_id = ?self.client_id, "Connection timed out");
                    return Err(ConnectionError::Timeout);
                }
            };

            if let Err(e) = self.handle_message(msg).await {
                match e {
                    ConnectionError::Eof => return Ok(()),
                    e => return Err(e),
                }
            }
        }
    }

    /// Handles a single client message.
    async fn handle_message(&mut self, msg: ClientMessage) -> Result<(), ConnectionError> {
        match msg.message {
            MessageType::Connect { .. } => {
                self.send_message(DaemonMessage::error_with_code(
                    "Already connected",
                    FailureReason::Protocol,
                ))
                .await?;
            }

            MessageType::AcquireLease {
                tool_name,
                device,
                pid,
            } => {
                let reply = self.handle_acquire(&tool_name, &device, pid).await;
                self.send_message(reply).await?;
            }

            MessageType::ReleaseLease { tool_name, device } => {
                let reply = self.handle_release(&tool_name, &device).await;
                self.send_message(reply).await?;
            }

            MessageType::ForceRelease { device } => {
                let reply = self.handle_force_release(&device).await;
                self.send_message(reply).await?;
            }

            MessageType::ListLeases => {
                let leases = self.services.leases.leases().await;
                self.send_message(DaemonMessage::lease_list(leases)).await?;
            }

            MessageType::WatchLease { tool_name, device } => {
                let reply = self.handle_watch_lease(&tool_name, &device).await;
                self.send_message(reply).await?;
            }

            MessageType::StartSweep {
                frequencies,
                cycle_time_sec,
            } => {
                let reply = self.handle_start_sweep(&frequencies, cycle_time_sec).await;
                self.send_message(reply).await?;
            }

            MessageType::StopSweep => {
                let reply = match self.services.sweep.stop().await {
                    Ok(status) => DaemonMessage::sweep_ok(status),
                    Err(e) => DaemonMessage::sweep_failed(
                        e.failure_reason(),
                        e.to_string(),
                        SweepStatus::unavailable(e.to_string()),
                    ),
                };
                self.send_message(reply).await?;
            }

            MessageType::EmergencyStop => {
                warn!(client_id = ?self.client_id, "Emergency stop requested");
                let reply = match self.services.sweep.emergency_stop().await {
                    Ok(report) => {
                        DaemonMessage::emergency_stopped(report.status, report.orphans_terminated)
                    }
                    Err(e) => DaemonMessage::sweep_failed(
                        e.failure_reason(),
                        e.to_string(),
                        SweepStatus::unavailable(e.to_string()),
                    ),
                };
                self.send_message(reply).await?;
            }

            MessageType::SweepStatus => {
                let status = self.services.sweep.status().await;
                self.send_message(DaemonMessage::sweep_status(status)).await?;
            }

            MessageType::DrainCapture { limit } => {
                let lines = self.services.sweep.drain(limit).await;
                self.send_message(DaemonMessage::capture_data(lines)).await?;
            }

            MessageType::Subscribe => {
                self.handle_subscribe().await?;
            }

            MessageType::Unsubscribe => {
                if let Some(ref client_id) = self.client_id {
                    let removed = self.subscribers.write().await.remove(client_id);
                    if let Some(subscriber) = removed {
                        subscriber.close(&self.services.bridge);
                    }
                }
                debug!(client_id = ?self.client_id, "Client unsubscribed from events");
            }

            MessageType::Ping { seq } => {
                self.send_message(DaemonMessage::pong(seq)).await?;
            }

            MessageType::Disconnect => {
                debug!(client_id = ?self.client_id, "Client requested disconnect");
                return Err(ConnectionError::Eof);
            }
        }

        Ok(())
    }

    // ========================================================================
    // Lease Requests
    // ========================================================================

    async fn handle_acquire(&self, tool_name: &str, device_name: &str, pid: Option<u32>) -> DaemonMessage {
        let (owner, device) = match self.resolve_request(tool_name, device_name) {
            Ok(pair) => pair,
            Err(reply) => return reply,
        };

        match self.services.leases.acquire(owner.clone(), device, pid).await {
            Ok(result) if result.granted => {
                info!(client_id = ?self.client_id, owner = %owner, %device, "Lease granted");
                DaemonMessage::lease_ok(device.name(), Some(owner))
            }
            Ok(result) => {
                let message = match &result.current_owner {
                    Some(holder) => format!("{device} is held by {holder}"),
                    None => format!("{device} is not available"),
                };
                DaemonMessage::lease_failed(
                    device.name(),
                    result.current_owner,
                    FailureReason::LeaseConflict,
                    message,
                )
            }
            Err(e) => lease_error_reply(device.name(), &e),
        }
    }

    async fn handle_release(&self, tool_name: &str, device_name: &str) -> DaemonMessage {
        let (owner, device) = match self.resolve_request(tool_name, device_name) {
            Ok(pair) => pair,
            Err(reply) => return reply,
        };

        match self.services.leases.release(owner.clone(), device).await {
            Ok(true) => DaemonMessage::lease_ok(device.name(), None),
            Ok(false) => match self.services.leases.current_owner(device).await {
                Some(holder) => DaemonMessage::lease_failed(
                    device.name(),
                    Some(holder.clone()),
                    FailureReason::LeaseConflict,
                    format!("{device} is held by {holder}, not {owner}"),
                ),
                None => DaemonMessage::lease_ok(device.name(), None),
            },
            Err(e) => lease_error_reply(device.name(), &e),
        }
    }

    async fn handle_force_release(&self, device_name: &str) -> DaemonMessage {
        let device = match self.services.devices.resolve(device_name) {
            Ok(device) => device,
            Err(e) => {
                return DaemonMessage::lease_failed(
                    device_name,
                    None,
                    FailureReason::Validation,
                    e.to_string(),
                )
            }
        };

        match self.services.leases.force_release(device).await {
            Ok(evicted) => {
                if let Some(lease) = &evicted {
                    warn!(client_id = ?self.client_id, %device, owner = %lease.owner, "Lease force-released");
                }
                DaemonMessage::lease_ok(device.name(), None)
            }
            Err(e) => lease_error_reply(device.name(), &e),
        }
    }

    /// Registers a one-shot revocation push for a lease this owner holds.
    ///
    /// The event stream is subscribed before ownership is checked, so a
    /// release racing the watch request is never missed.
    async fn handle_watch_lease(&mut self, tool_name: &str, device_name: &str) -> DaemonMessage {
        let (owner, device) = match self.resolve_request(tool_name, device_name) {
            Ok(pair) => pair,
            Err(reply) => return reply,
        };

        let events = self.services.leases.subscribe();
        match self.services.leases.current_owner(device).await {
            Some(holder) if holder == owner => {
                let client_id = self.client_id.clone().unwrap_or_default();
                let watch = spawn_lease_watch(
                    client_id,
                    Arc::clone(&self.writer),
                    self.services.leases.clone(),
                    events,
                    device,
                    owner.clone(),
                );
                self.lease_watches.retain(|w| !w.is_finished());
                self.lease_watches.push(watch);
                debug!(client_id = ?self.client_id, owner = %owner, %device, "Watching lease");
                DaemonMessage::lease_ok(device.name(), Some(owner))
            }
            Some(holder) => DaemonMessage::lease_failed(
                device.name(),
                Some(holder.clone()),
                FailureReason::LeaseConflict,
                format!("{device} is held by {holder}, not {owner}"),
            ),
            None => DaemonMessage::lease_failed(
                device.name(),
                None,
                FailureReason::Validation,
                format!("{owner} does not hold {device}"),
            ),
        }
    }

    /// Validates the owner id and device name of a lease request.
    fn resolve_request(&self, tool_name: &str, device_name: &str) -> Result<(OwnerId, Device), DaemonMessage> {
        let device = self.services.devices.resolve(device_name).map_err(|e| {
            DaemonMessage::lease_failed(device_name, None, FailureReason::Validation, e.to_string())
        })?;
        let owner = OwnerId::parse(tool_name).map_err(|e| {
            DaemonMessage::lease_failed(device.name(), None, FailureReason::Validation, e.to_string())
        })?;
        Ok((owner, device))
    }

    // ========================================================================
    // Sweep Requests
    // ========================================================================

    async fn handle_start_sweep(&self, frequencies: &[RawFrequency], cycle_time_sec: f64) -> DaemonMessage {
        let parsed = parse_targets(frequencies)
            .and_then(|targets| Ok((targets, parse_cycle_time(cycle_time_sec)?)));

        let (targets, dwell) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(client_id = ?self.client_id, error = %e, "Rejected sweep request");
                self.services
                    .bridge
                    .emit(&SweepEvent::error(e.to_string(), false));
                return DaemonMessage::sweep_failed(
                    FailureReason::Validation,
                    e.to_string(),
                    self.services.sweep.status().await,
                );
            }
        };

        match self.services.sweep.start(targets, dwell).await {
            Ok(status) => DaemonMessage::sweep_ok(status),
            Err(e) => DaemonMessage::sweep_failed(
                e.failure_reason(),
                e.to_string(),
                self.services.sweep.status().await,
            ),
        }
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    async fn handle_subscribe(&mut self) -> Result<(), ConnectionError> {
        let client_id = match &self.client_id {
            Some(id) => id.clone(),
            None => {
                self.send_message(DaemonMessage::error("Must connect before subscribing"))
                    .await?;
                return Ok(());
            }
        };

        {
            let mut subs = self.subscribers.write().await;

            if subs.contains_key(&client_id) {
                debug!(client_id = %client_id, "Client already subscribed");
            } else {
                if subs.len() >= MAX_SUBSCRIBERS {
                    drop(subs);
                    self.send_message(DaemonMessage::error_with_code(
                        &format!("Too many subscribers (max: {MAX_SUBSCRIBERS})"),
                        FailureReason::Unavailable,
                    ))
                    .await?;
                    return Ok(());
                }

                let (sink, events) = self.services.bridge.subscribe(DEFAULT_SUBSCRIBER_CAPACITY);
                let forwarder = spawn_forwarder(client_id.clone(), Arc::clone(&self.writer), events);
                subs.insert(client_id.clone(), Subscriber { sink, forwarder });
                debug!(client_id = %client_id, "Client subscribed to events");
            }
        }

        // Initial state so the client does not wait for the next change
        let status = self.services.sweep.status().await;
        self.send_message(DaemonMessage::event(SweepEvent::status(status)))
            .await
    }

    // ========================================================================
    // Wire I/O
    // ========================================================================

    async fn read_message(&mut self) -> Result<ClientMessage, ConnectionError> {
        // Room for the payload plus its newline, never more
        let limit = MAX_MESSAGE_SIZE as u64 + 1;
        let mut line = String::new();
        let bytes_read = (&mut self.reader)
            .take(limit)
            .read_line(&mut line)
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        if bytes_read == 0 {
            return Err(ConnectionError::Eof);
        }

        if bytes_read as u64 == limit && !line.ends_with('\n') {
            return Err(ConnectionError::MessageTooLarge {
                size: bytes_read,
                max: MAX_MESSAGE_SIZE,
            });
        }

        let msg: ClientMessage = serde_json::from_str(&line)
            .map_err(|e| ConnectionError::ParseError(e.to_string()))?;

        debug!(
            client_id = ?self.client_id,
            message_type = ?std::mem::discriminant(&msg.message),
            "Received message"
        );

        Ok(msg)
    }

    async fn send_message(&self, msg: DaemonMessage) -> Result<(), ConnectionError> {
        write_message(&self.writer, &msg).await
    }

    /// Returns the client ID (if connected).
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }
}

fn lease_error_reply(device: &str, err: &LeaseError) -> DaemonMessage {
    let reason = match err {
        LeaseError::UnknownDevice(_) => FailureReason::Validation,
        LeaseError::Held { .. } => FailureReason::LeaseConflict,
        LeaseError::ChannelClosed => FailureReason::Unavailable,
    };
    DaemonMessage::lease_failed(device, None, reason, err.to_string())
}

/// Writes one newline-terminated JSON message.
async fn write_message(writer: &SharedWriter, msg: &DaemonMessage) -> Result<(), ConnectionError> {
    let json =
        serde_json::to_string(msg).map_err(|e| ConnectionError::ParseError(e.to_string()))?;

    let mut writer = writer.lock().await;
    match timeout(WRITE_TIMEOUT, async {
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok::<(), std::io::Error>(())
    })
    .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ConnectionError::Io(e.to_string())),
        Err(_) => Err(ConnectionError::WriteTimeout),
    }
}

/// Copies bridge events to the client until either side goes away.
fn spawn_forwarder(
    client_id: ClientId,
    writer: SharedWriter,
    mut events: mpsc::Receiver<SweepEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let Err(e) = write_message(&writer, &DaemonMessage::event(event)).await {
                debug!(client_id = %client_id, error = %e, "Stopped forwarding events");
                break;
            }
        }
    })
}

/// Pushes `lease_revoked` once `owner` stops holding `device`, then exits.
fn spawn_lease_watch(
    client_id: ClientId,
    writer: SharedWriter,
    leases: LeaseHandle,
    mut events: broadcast::Receiver<LeaseEvent>,
    device: Device,
    owner: OwnerId,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let reason = loop {
            match events.recv().await {
                Ok(LeaseEvent::Released {
                    device: released,
                    owner: holder,
                    reason,
                }) if released == device && holder == owner => break Some(reason),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!(client_id = %client_id, skipped, "Lease watch lagged, rechecking owner");
                    if leases.current_owner(device).await.as_ref() != Some(&owner) {
                        break None;
                    }
                }
                Err(RecvError::Closed) => break Some(ReleaseReason::Shutdown),
            }
        };

        info!(client_id = %client_id, owner = %owner, %device, ?reason, "Notifying lease watcher");
        let push = DaemonMessage::lease_revoked(device.name(), owner, reason);
        if let Err(e) = write_message(&writer, &push).await {
            debug!(client_id = %client_id, error = %e, "Lease watcher already gone");
        }
    })
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        for watch in &self.lease_watches {
            watch.abort();
        }
    }
}

/// Errors that can occur during connection handling.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Protocol version mismatch: client {client}, server {server}")]
    VersionMismatch {
        client: ProtocolVersion,
        server: ProtocolVersion,
    },

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection closed")]
    Eof,

    #[error("Read timeout")]
    Timeout,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}
