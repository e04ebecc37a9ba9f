//! Device leases and lease owners.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::device::Device;
use crate::error::{DomainError, DomainResult};

// ============================================================================
// Owner Identity
// ============================================================================

/// Identifier of a lease owner (a tool module name such as `kismet`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

/// Maximum length accepted for an owner id.
pub const MAX_OWNER_ID_LEN: usize = 128;

impl OwnerId {
    /// Creates an owner id without validation.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Creates an owner id from untrusted input.
    ///
    /// Rejects empty (after trimming) and overly long identifiers.
    pub fn parse(id: &str) -> DomainResult<Self> {
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(DomainError::InvalidOwner {
                reason: "owner id must not be empty".to_string(),
            });
        }
        if trimmed.len() > MAX_OWNER_ID_LEN {
            return Err(DomainError::InvalidOwner {
                reason: format!("owner id longer than {MAX_OWNER_ID_LEN} bytes"),
            });
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for OwnerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for OwnerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ============================================================================
// Owner Process
// ============================================================================

/// The OS process backing a lease owner, when the owner reported one.
///
/// The start time is captured at acquire so a recycled PID is not
/// mistaken for the original owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerProcess {
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<u64>,
}

impl OwnerProcess {
    /// Records the process, reading its start time from procfs.
    pub fn capture(pid: u32) -> Self {
        Self {
            pid,
            start_time: read_process_start_time(pid),
        }
    }

    /// Checks whether the owner process is still running.
    pub fn is_alive(&self) -> bool {
        let Some(expected) = self.start_time else {
            let exists = procfs::process::Process::new(self.pid as i32).is_ok();
            debug!(pid = self.pid, exists, "is_alive: no start_time, checking procfs only");
            return exists;
        };

        match read_process_start_time(self.pid) {
            Some(current) => {
                if current != expected {
                    debug!(
                        pid = self.pid,
                        expected,
                        current,
                        "is_alive: start time mismatch - PID reused"
                    );
                }
                current == expected
            }
            None => false,
        }
    }
}

fn read_process_start_time(pid: u32) -> Option<u64> {
    let process = procfs::process::Process::new(pid as i32).ok()?;
    let stat = process.stat().ok()?;
    Some(stat.starttime)
}

// ============================================================================
// Lease
// ============================================================================

/// An exclusive, revocable claim on a device by one named owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub device: Device,
    pub owner: OwnerId,
    pub acquired_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_process: Option<OwnerProcess>,
}

impl Lease {
    /// Creates a lease acquired now.
    pub fn new(device: Device, owner: OwnerId) -> Self {
        Self {
            device,
            owner,
            acquired_at: Utc::now(),
            owner_process: None,
        }
    }

    /// Attaches the owner's OS process.
    #[must_use]
    pub fn with_owner_process(mut self, process: OwnerProcess) -> Self {
        self.owner_process = Some(process);
        self
    }

    /// Returns true if `owner` holds this lease.
    pub fn is_held_by(&self, owner: &OwnerId) -> bool {
        &self.owner == owner
    }

    /// How long the lease has been held.
    pub fn held_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.acquired_at)
    }
}

/// Outcome of an acquire call.
///
/// A conflict is a normal outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquireResult {
    pub granted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_owner: Option<OwnerId>,
}

impl AcquireResult {
    /// The caller now holds the device.
    pub fn granted() -> Self {
        Self {
            granted: true,
            current_owner: None,
        }
    }

    /// The device is held by `owner`.
    pub fn conflict(owner: OwnerId) -> Self {
        Self {
            granted: false,
            current_owner: Some(owner),
        }
    }
}

/// Reason why a lease ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    /// The owner released it.
    Explicit,

    /// An administrator force-released it.
    Forced,

    /// The owner process died without releasing.
    OwnerExited,

    /// The daemon is shutting down.
    Shutdown,
}

impl fmt::Display for ReleaseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Explicit => write!(f, "released by owner"),
            Self::Forced => write!(f, "force-released"),
            Self::OwnerExited => write!(f, "owner process exited"),
            Self::Shutdown => write!(f, "daemon shutdown"),
        }
    }
}
