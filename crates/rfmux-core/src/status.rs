//! Sweep health state machine and status snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::frequency::FrequencyTarget;
use crate::lease::OwnerId;

// ============================================================================
// Sweep State
// ============================================================================

/// Lifecycle state of the sweep engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepState {
    /// No session; the SDR lease is not held by the engine
    #[default]
    Idle,
    /// Lease held, capture process spawned, not yet confirmed
    Starting,
    /// Capture process confirmed alive or producing data
    Running,
    /// Restarting the capture process after a transient fault
    Recovering,
    /// Session ended on a fatal fault; lease released
    Error,
}

impl SweepState {
    /// Returns true if the transition `self -> next` is part of the
    /// state machine.
    ///
    /// Any state may return to `Idle` (stop always succeeds).
    pub fn can_transition_to(&self, next: SweepState) -> bool {
        use SweepState::*;
        match (self, next) {
            (_, Idle) => true,
            (Idle | Error, Starting) => true,
            (Starting, Running) => true,
            (Starting | Running, Recovering) => true,
            (Recovering, Running) => true,
            (Starting | Running | Recovering, Error) => true,
            _ => false,
        }
    }

    /// Returns true while a session holds the lease.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Recovering)
    }

    /// Returns a lowercase label for display.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Recovering => "recovering",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for SweepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Liveness of the capture process as observed by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessHealth {
    #[default]
    Stopped,
    Starting,
    Healthy,
    /// Alive but silent past the no-data timeout
    Unresponsive,
}

impl fmt::Display for ProcessHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Healthy => "healthy",
            Self::Unresponsive => "unresponsive",
        };
        write!(f, "{label}")
    }
}

// ============================================================================
// Snapshots
// ============================================================================

/// Health of the sweep engine. Exactly one exists per engine.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HealthStatus {
    pub state: SweepState,
    pub process_health: ProcessHealth,
    pub last_data_received_at: Option<DateTime<Utc>>,
    pub recovery_attempts: u32,
    pub last_recovery_at: Option<DateTime<Utc>>,
    /// Human-readable reason of the most recent fault
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl HealthStatus {
    /// The clean baseline every subsystem returns to.
    pub fn idle() -> Self {
        Self::default()
    }
}

/// Position of the frequency cycler.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CycleSnapshot {
    pub current_index: usize,
    pub dwell_ms: u64,
    pub cycle_started_at: Option<DateTime<Utc>>,
    pub target_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_target: Option<FrequencyTarget>,
}

/// Everything a status query returns.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SweepStatus {
    pub health: HealthStatus,
    pub cycle: CycleSnapshot,
    pub buffered_lines: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_owner: Option<OwnerId>,
}

impl SweepStatus {
    /// Best-effort snapshot used when the engine cannot be reached.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            health: HealthStatus {
                last_error: Some(reason.into()),
                ..HealthStatus::idle()
            },
            ..Self::default()
        }
    }

    /// Shorthand for `health.state`.
    pub fn state(&self) -> SweepState {
        self.health.state
    }
}
