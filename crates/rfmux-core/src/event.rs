//! Events streamed to live sweep consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::capture::CaptureLine;
use crate::frequency::FrequencyTarget;
use crate::status::SweepStatus;

/// A state change pushed to subscribers.
///
/// Subscribers only see events emitted after they register; there is no
/// replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SweepEvent {
    /// The engine's state or cycle position changed
    Status { status: Box<SweepStatus> },

    /// A capture line was parsed
    SweepData {
        line: CaptureLine,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<FrequencyTarget>,
    },

    /// A fault or rejected request
    Error {
        message: String,
        /// Whether the engine is retrying on its own
        recoverable: bool,
    },

    /// Keep-alive for long-lived streams
    Heartbeat { timestamp: DateTime<Utc> },
}

impl SweepEvent {
    pub fn status(status: SweepStatus) -> Self {
        Self::Status {
            status: Box::new(status),
        }
    }

    pub fn error(message: impl Into<String>, recoverable: bool) -> Self {
        Self::Error {
            message: message.into(),
            recoverable,
        }
    }

    pub fn heartbeat() -> Self {
        Self::Heartbeat {
            timestamp: Utc::now(),
        }
    }

    /// Returns the event name used on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::SweepData { .. } => "sweep_data",
            Self::Error { .. } => "error",
            Self::Heartbeat { .. } => "heartbeat",
        }
    }
}
