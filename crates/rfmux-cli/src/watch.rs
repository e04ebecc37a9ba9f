//! Live sweep event stream with automatic reconnection.
//!
//! This module provides the `EventWatcher` which handles:
//! - Connection to the daemon via Unix socket
//! - Automatic reconnection with exponential backoff
//! - Subscribing and forwarding sweep events to the caller
//!
//! The daemon does not replay missed events, so every (re)connect starts
//! with a fresh `status` event that the caller can use to resynchronise.
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use rfmux_core::SweepEvent;
use rfmux_protocol::{ClientMessage, DaemonMessage};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{check_handshake, send_message, ClientConfig};
use crate::error::{ClientError, Result};

/// What the watcher reports to its consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    /// Handshake and subscription done
    Connected { client_id: String },
    /// A live event from the daemon
    Event(SweepEvent),
    /// The connection dropped; a reconnect follows unless cancelled
    Disconnected,
}

// ============================================================================
// Event Watcher
// ============================================================================

/// Keeps a subscription to the daemon's live event channel open.
///
/// # Connection Lifecycle
///
/// 1. Client attempts to connect to the Unix socket
/// 2. On success, sends `connect` and waits for `connected`
/// 3. Sends `subscribe` to receive live events
/// 4. Reads messages in a loop, forwarding events to the consumer
/// 5. On disconnect, notifies the consumer and retries with exponential backoff
///
/// # Example
///
/// ```rust,no_run
/// use rfmux_cli::client::ClientConfig;
/// use rfmux_cli::watch::EventWatcher;
/// use tokio::sync::mpsc;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() {
/// let (tx, mut rx) = mpsc::unbounded_channel();
/// let watcher = EventWatcher::new(ClientConfig::from_env(), tx, CancellationToken::new());
/// tokio::spawn(async move { watcher.run().await });
///
/// while let Some(event) = rx.recv().await {
///     println!("{event:?}");
/// }
/// # }
/// ```
pub struct EventWatcher {
    config: ClientConfig,

    /// Channel to send events to the consumer.
    event_tx: mpsc::UnboundedSender<WatchEvent>,

    cancel_token: CancellationToken,
}

impl EventWatcher {
    #[must_use]
    pub fn new(
        config: ClientConfig,
        event_tx: mpsc::UnboundedSender<WatchEvent>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            config,
            event_tx,
            cancel_token,
        }
    }

    /// Main loop that maintains the subscription.
    ///
    /// Runs until the cancellation token is triggered or the consumer
    /// drops its receiver.
    pub async fn run(&self) {
        info!(
            socket_path = %self.config.socket_path.display(),
            "Event watcher starting"
        );

        loop {
            if self.cancel_token.is_cancelled() || self.event_tx.is_closed() {
                info!("Event watcher shutting down");
                return;
            }

            match self.connect_with_retry().await {
                Ok(stream) => {
                    if let Err(e) = self.handle_connection(stream).await {
                        warn!(error = %e, "Connection ended with error");
                    }
                    let _ = self.event_tx.send(WatchEvent::Disconnected);
                }
                Err(e) => {
                    if !self.cancel_token.is_cancelled() {
                        error!(error = %e, "Failed to connect to daemon");
                    }
                }
            }
        }
    }

    /// Connects with exponential backoff until successful or cancelled.
    async fn connect_with_retry(&self) -> Result<UnixStream> {
        let mut delay = self.config.retry_initial_delay;
        let mut attempt = 0u32;

        loop {
            attempt = attempt.saturating_add(1);

            debug!(
                attempt,
                socket_path = %self.config.socket_path.display(),
                "Attempting to connect to daemon"
            );

            if !self.config.socket_path.exists() {
                if attempt == 1 {
                    warn!(
                        socket_path = %self.config.socket_path.display(),
                        "Daemon socket not found, will retry"
                    );
                }
            } else {
                match UnixStream::connect(&self.config.socket_path).await {
                    Ok(stream) => {
                        debug!(attempt, "Connection successful");
                        return Ok(stream);
                    }
                    Err(e) => {
                        debug!(attempt, error = %e, "Connection attempt failed");
                    }
                }
            }

            tokio::select! {
                _ = sleep(delay) => {
                    delay = self.config.next_delay(delay);
                }
                _ = self.cancel_token.cancelled() => {
                    info!("Connection retry cancelled");
                    return Err(ClientError::Cancelled);
                }
            }
        }
    }

    /// Handshakes, subscribes and forwards messages until disconnect.
    async fn handle_connection(&self, stream: UnixStream) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        send_message(&mut writer, &ClientMessage::connect(None)).await?;

        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(ClientError::Closed);
        }
        let client_id = check_handshake(serde_json::from_str(line.trim())?)?;
        info!(client_id, "Handshake complete");

        send_message(&mut writer, &ClientMessage::subscribe()).await?;
        let _ = self.event_tx.send(WatchEvent::Connected { client_id });

        loop {
            line.clear();
            tokio::select! {
                read_result = reader.read_line(&mut line) => {
                    match read_result {
                        Ok(0) => {
                            info!("Daemon closed connection");
                            return Ok(());
                        }
                        Ok(_) => {
                            // Don't disconnect on a single bad line
                            if let Err(e) = self.handle_message(line.trim()) {
                                warn!(error = %e, line = %line.trim(), "Failed to handle message");
                            }
                        }
                        Err(e) => return Err(ClientError::Io(e)),
                    }
                }

                _ = self.cancel_token.cancelled() => {
                    debug!("Watch loop cancelled");
                    let _ = send_message(&mut writer, &ClientMessage::disconnect()).await;
                    return Ok(());
                }
            }
        }
    }

    /// Handles a single message from the daemon.
    fn handle_message(&self, line: &str) -> Result<()> {
        let message: DaemonMessage = serde_json::from_str(line)?;

        match message {
            DaemonMessage::Event { event } => {
                let _ = self.event_tx.send(WatchEvent::Event(event));
            }
            DaemonMessage::Error { message, code } => {
                warn!(error_message = %message, error_code = ?code, "Received error from daemon");
            }
            other => {
                debug!(message = ?other, "Ignoring non-event message");
            }
        }

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
