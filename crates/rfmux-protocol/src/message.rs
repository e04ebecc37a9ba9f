//! Protocol message types for daemon communication.
//!
//! Messages are newline-delimited JSON objects tagged by `type`. The web
//! layer maps them 1:1 onto HTTP routes; [`FailureReason::http_status`]
//! gives the status code to use for each failure.

use crate::parse::RawFrequency;
use crate::version::ProtocolVersion;
use rfmux_core::{CaptureLine, Lease, OwnerId, ReleaseReason, SweepEvent, SweepStatus};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Message types that can be sent by clients to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageType {
    /// Client handshake/connection request
    Connect {
        #[serde(skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },

    /// Claim exclusive use of a device
    AcquireLease {
        tool_name: String,
        device: String,
        /// PID of the owning process; the lease is reaped when it dies
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
    },

    /// Give a device back (no-op unless `tool_name` holds it)
    ReleaseLease { tool_name: String, device: String },

    /// Administrative override: evict whoever holds the device
    ForceRelease { device: String },

    /// Request all current leases
    ListLeases,

    /// Ask to be told when `tool_name` loses its lease on `device`.
    ///
    /// Answered with a `lease` reply; on success a single `lease_revoked`
    /// push follows once the lease ends for any reason.
    WatchLease { tool_name: String, device: String },

    /// Start a frequency-cycling sweep on the SDR
    StartSweep {
        frequencies: Vec<RawFrequency>,
        cycle_time_sec: f64,
    },

    /// Stop the sweep and release the SDR
    StopSweep,

    /// Stop the sweep and also kill orphaned capture processes
    EmergencyStop,

    /// Request the current sweep status
    SweepStatus,

    /// Take buffered capture lines (oldest first)
    DrainCapture {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
    },

    /// Start receiving live sweep events
    Subscribe,

    /// Stop receiving live sweep events
    Unsubscribe,

    /// Ping to check connection
    Ping { seq: u64 },

    /// Client disconnecting gracefully
    Disconnect,
}

/// Messages sent from client to daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    pub protocol_version: ProtocolVersion,

    #[serde(flatten)]
    pub message: MessageType,
}

impl ClientMessage {
    /// Creates a new client message with current protocol version.
    pub fn new(message: MessageType) -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
            message,
        }
    }

    pub fn connect(client_id: Option<String>) -> Self {
        Self::new(MessageType::Connect { client_id })
    }

    pub fn acquire_lease(tool_name: &str, device: &str, pid: Option<u32>) -> Self {
        Self::new(MessageType::AcquireLease {
            tool_name: tool_name.to_string(),
            device: device.to_string(),
            pid,
        })
    }

    pub fn release_lease(tool_name: &str, device: &str) -> Self {
        Self::new(MessageType::ReleaseLease {
            tool_name: tool_name.to_string(),
            device: device.to_string(),
        })
    }

    pub fn force_release(device: &str) -> Self {
        Self::new(MessageType::ForceRelease {
            device: device.to_string(),
        })
    }

    pub fn list_leases() -> Self {
        Self::new(MessageType::ListLeases)
    }

    pub fn watch_lease(tool_name: &str, device: &str) -> Self {
        Self::new(MessageType::WatchLease {
            tool_name: tool_name.to_string(),
            device: device.to_string(),
        })
    }

    pub fn start_sweep(frequencies: Vec<RawFrequency>, cycle_time_sec: f64) -> Self {
        Self::new(MessageType::StartSweep {
            frequencies,
            cycle_time_sec,
        })
    }

    pub fn stop_sweep() -> Self {
        Self::new(MessageType::StopSweep)
    }

    pub fn emergency_stop() -> Self {
        Self::new(MessageType::EmergencyStop)
    }

    pub fn sweep_status() -> Self {
        Self::new(MessageType::SweepStatus)
    }

    pub fn drain_capture(limit: Option<usize>) -> Self {
        Self::new(MessageType::DrainCapture { limit })
    }

    pub fn subscribe() -> Self {
        Self::new(MessageType::Subscribe)
    }

    pub fn unsubscribe() -> Self {
        Self::new(MessageType::Unsubscribe)
    }

    pub fn ping(seq: u64) -> Self {
        Self::new(MessageType::Ping { seq })
    }

    pub fn disconnect() -> Self {
        Self::new(MessageType::Disconnect)
    }
}

// ============================================================================
// Failure Reasons
// ============================================================================

/// Machine-classifiable failure reason attached to unsuccessful replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Malformed or out-of-range input; nothing changed
    Validation,
    /// Device held by another owner
    LeaseConflict,
    /// A sweep session is already active
    AlreadyRunning,
    /// The capture process could not be spawned
    SpawnFailed,
    /// The capture process reported a fatal fault
    CaptureFault,
    /// The daemon component is shutting down or gone
    Unavailable,
    /// Wire-level problem (unexpected message, bad JSON)
    Protocol,
}

impl FailureReason {
    /// HTTP status the web layer should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation | Self::Protocol => 400,
            Self::LeaseConflict | Self::AlreadyRunning => 409,
            Self::SpawnFailed | Self::CaptureFault => 500,
            Self::Unavailable => 503,
        }
    }

    /// Returns the wire code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::LeaseConflict => "lease_conflict",
            Self::AlreadyRunning => "already_running",
            Self::SpawnFailed => "spawn_failed",
            Self::CaptureFault => "capture_fault",
            Self::Unavailable => "unavailable",
            Self::Protocol => "protocol",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

// ============================================================================
// Daemon Messages
// ============================================================================

/// Messages sent from daemon to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonMessage {
    /// Connection accepted
    Connected {
        protocol_version: ProtocolVersion,
        client_id: String,
    },

    /// Connection rejected (version mismatch, etc.)
    Rejected {
        reason: String,
        protocol_version: ProtocolVersion,
    },

    /// Reply to acquire / release / force-release
    Lease {
        success: bool,
        device: String,
        /// Current holder after the operation (the conflicting owner on failure)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        owner: Option<OwnerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<FailureReason>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// All current leases
    LeaseList { leases: Vec<Lease> },

    /// A watched lease ended (lease watchers only)
    LeaseRevoked {
        device: String,
        owner: OwnerId,
        /// `None` when the daemon lost track of why (lagged event stream)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<ReleaseReason>,
    },

    /// Reply to start / stop / emergency stop
    Sweep {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<FailureReason>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        status: Box<SweepStatus>,
        /// Orphaned capture processes killed (emergency stop only)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        orphans_terminated: Option<usize>,
    },

    /// Current sweep status (always answered, best effort)
    SweepStatus { status: Box<SweepStatus> },

    /// Buffered capture lines
    CaptureData { lines: Vec<CaptureLine> },

    /// Live sweep event (subscribers only)
    Event { event: SweepEvent },

    /// Pong response to ping
    Pong { seq: u64 },

    /// Error response
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<FailureReason>,
    },
}

impl DaemonMessage {
    pub fn connected(client_id: String) -> Self {
        Self::Connected {
            protocol_version: ProtocolVersion::CURRENT,
            client_id,
        }
    }

    pub fn rejected(reason: &str) -> Self {
        Self::Rejected {
            reason: reason.to_string(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    /// Successful lease operation; `owner` is the holder afterwards.
    pub fn lease_ok(device: &str, owner: Option<OwnerId>) -> Self {
        Self::Lease {
            success: true,
            device: device.to_string(),
            owner,
            reason: None,
            message: None,
        }
    }

    /// Failed lease operation.
    pub fn lease_failed(
        device: &str,
        owner: Option<OwnerId>,
        reason: FailureReason,
        message: impl Into<String>,
    ) -> Self {
        Self::Lease {
            success: false,
            device: device.to_string(),
            owner,
            reason: Some(reason),
            message: Some(message.into()),
        }
    }

    pub fn lease_list(leases: Vec<Lease>) -> Self {
        Self::LeaseList { leases }
    }

    pub fn lease_revoked(device: &str, owner: OwnerId, reason: Option<ReleaseReason>) -> Self {
        Self::LeaseRevoked {
            device: device.to_string(),
            owner,
            reason,
        }
    }

    pub fn sweep_ok(status: SweepStatus) -> Self {
        Self::Sweep {
            success: true,
            reason: None,
            message: None,
            status: Box::new(status),
            orphans_terminated: None,
        }
    }

    pub fn sweep_failed(reason: FailureReason, message: impl Into<String>, status: SweepStatus) -> Self {
        Self::Sweep {
            success: false,
            reason: Some(reason),
            message: Some(message.into()),
            status: Box::new(status),
            orphans_terminated: None,
        }
    }

    pub fn emergency_stopped(status: SweepStatus, orphans_terminated: usize) -> Self {
        Self::Sweep {
            success: true,
            reason: None,
            message: None,
            status: Box::new(status),
            orphans_terminated: Some(orphans_terminated),
        }
    }

    pub fn sweep_status(status: SweepStatus) -> Self {
        Self::SweepStatus {
            status: Box::new(status),
        }
    }

    pub fn capture_data(lines: Vec<CaptureLine>) -> Self {
        Self::CaptureData { lines }
    }

    pub fn event(event: SweepEvent) -> Self {
        Self::Event { event }
    }

    pub fn pong(seq: u64) -> Self {
        Self::Pong { seq }
    }

    pub fn error(message: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: None,
        }
    }

    pub fn error_with_code(message: &str, code: FailureReason) -> Self {
        Self::Error {
            message: message.to_string(),
            code: Some(code),
        }
    }
}
