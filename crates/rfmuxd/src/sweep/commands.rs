//! Sweep actor commands, errors and internal messages.

use std::time::Duration;

use rfmux_core::{CaptureLine, DomainError, FrequencyTarget, OwnerId, SweepState, SweepStatus};
use rfmux_protocol::FailureReason;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::lease::LeaseError;

// ============================================================================
// Sweep Commands
// ============================================================================

/// Commands sent to the sweep actor.
#[derive(Debug)]
pub enum SweepCommand {
    /// Begin a session on `targets`, dwelling `dwell` on each.
    ///
    /// # Errors
    /// See [`SweepError`]; every failure also emits an `error` event.
    Start {
        targets: Vec<FrequencyTarget>,
        dwell: Duration,
        respond_to: oneshot::Sender<Result<SweepStatus, SweepError>>,
    },

    /// End the session. Always succeeds.
    Stop {
        respond_to: oneshot::Sender<SweepStatus>,
    },

    /// `Stop` plus orphan cleanup.
    EmergencyStop {
        respond_to: oneshot::Sender<EmergencyStopReport>,
    },

    Status {
        respond_to: oneshot::Sender<SweepStatus>,
    },

    /// Take up to `limit` buffered capture lines, oldest first.
    Drain {
        limit: Option<usize>,
        respond_to: oneshot::Sender<Vec<CaptureLine>>,
    },
}

/// Result of an emergency stop.
#[derive(Debug, Clone)]
pub struct EmergencyStopReport {
    pub status: SweepStatus,
    pub orphans_terminated: usize,
}

// ============================================================================
// Sweep Errors
// ============================================================================

/// Why a sweep could not be started.
#[derive(Debug, Error)]
pub enum SweepError {
    #[error("invalid sweep request: {0}")]
    Validation(#[from] DomainError),

    #[error("a sweep is already {0}")]
    AlreadyActive(SweepState),

    #[error("SDR is leased by {owner}")]
    LeaseConflict { owner: OwnerId },

    #[error("lease manager error: {0}")]
    Lease(LeaseError),

    #[error("capture process failed to start: {0}")]
    Spawn(String),

    #[error("sweep engine unavailable")]
    ChannelClosed,
}

impl SweepError {
    /// Wire classification for this error.
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            Self::Validation(_) => FailureReason::Validation,
            Self::AlreadyActive(_) => FailureReason::AlreadyRunning,
            Self::LeaseConflict { .. } => FailureReason::LeaseConflict,
            Self::Spawn(_) => FailureReason::SpawnFailed,
            Self::Lease(_) | Self::ChannelClosed => FailureReason::Unavailable,
        }
    }
}

impl From<LeaseError> for SweepError {
    fn from(err: LeaseError) -> Self {
        match err {
            LeaseError::Held { owner, .. } => Self::LeaseConflict { owner },
            other => Self::Lease(other),
        }
    }
}

// ============================================================================
// Timer Messages
// ============================================================================

/// What a session timer fired for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerSignal {
    /// Move to the next frequency target
    Dwell,
    /// Startup grace elapsed
    StartupGrace,
    /// Periodic liveness / no-data check
    HealthCheck,
    /// Recovery backoff elapsed
    Respawn,
}

/// A timer firing, tagged with the session that armed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerMessage {
    pub session: u64,
    pub signal: TimerSignal,
}
