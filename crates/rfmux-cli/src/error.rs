//! Error types for the rfmux client library.
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::io;
use std::path::PathBuf;

use rfmux_core::{OwnerId, ReleaseReason};
use rfmux_protocol::FailureReason;
use thiserror::Error;

// ============================================================================
// Client Error Type
// ============================================================================

/// Errors that can occur while talking to the rfmux daemon.
///
/// Connection errors carry the socket path so the user can tell whether
/// the daemon is running somewhere else.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Could not reach the daemon socket.
    #[error("Failed to connect to daemon at {path}: {source} (is rfmuxd running?)")]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The daemon refused the handshake.
    #[error("Daemon rejected connection: {0}")]
    Rejected(String),

    /// Protocol version mismatch with daemon
    #[error("Protocol version mismatch (client: {client_version}, daemon: {daemon_version})")]
    VersionMismatch {
        client_version: String,
        daemon_version: String,
    },

    /// The daemon answered with something other than the expected reply.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// The daemon answered with an `error` message.
    #[error("Daemon error: {message}")]
    Daemon {
        message: String,
        code: Option<FailureReason>,
    },

    /// The device is held by someone else.
    #[error("{device} is held by {}", .owner.as_ref().map(OwnerId::as_str).unwrap_or("another tool"))]
    LeaseDenied {
        device: String,
        owner: Option<OwnerId>,
    },

    /// A lease request failed for a reason other than a conflict.
    #[error("Lease request failed: {0}")]
    Lease(String),

    /// A held lease was taken away (force-release, daemon shutdown).
    #[error("Lease on {device} was revoked{}", .reason.map(|r| format!(" ({r})")).unwrap_or_default())]
    LeaseRevoked {
        device: String,
        reason: Option<ReleaseReason>,
    },

    /// The launched command could not be started.
    #[error("Failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The daemon closed the connection.
    #[error("Daemon closed the connection")]
    Closed,

    /// No reply within the request timeout.
    #[error("Timed out waiting for the daemon")]
    Timeout,

    /// Cancelled before the operation finished.
    #[error("Cancelled")]
    Cancelled,

    /// I/O error passthrough.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON parse error passthrough.
    #[error("Failed to parse message: {0}")]
    ParseError(#[from] serde_json::Error),
}

impl ClientError {
    /// Failure reason reported by the daemon, when there was one.
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            Self::Daemon { code, .. } => *code,
            Self::LeaseDenied { .. } => Some(FailureReason::LeaseConflict),
            _ => None,
        }
    }
}

/// Convenience Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

// ============================================================================
// Tests
// ============================================================================
