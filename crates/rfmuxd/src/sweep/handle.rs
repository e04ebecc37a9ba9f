//! Client interface for interacting with the SweepActor.

use std::time::Duration;

use rfmux_core::{CaptureLine, FrequencyTarget, SweepStatus};
use tokio::sync::{mpsc, oneshot};

use super::commands::{EmergencyStopReport, SweepCommand, SweepError};

/// Handle for controlling the sweep engine.
///
/// Cheap to clone. The engine shuts down (tearing down any session) once
/// every handle is dropped.
#[derive(Clone)]
pub struct SweepHandle {
    sender: mpsc::Sender<SweepCommand>,
}

impl SweepHandle {
    pub fn new(sender: mpsc::Sender<SweepCommand>) -> Self {
        Self { sender }
    }

    /// Start a sweep.
    ///
    /// # Errors
    ///
    /// - `SweepError::Validation` for empty targets or a zero dwell
    /// - `SweepError::AlreadyActive` if a session is running
    /// - `SweepError::LeaseConflict` if another tool holds the SDR
    /// - `SweepError::Spawn` if the capture process does not start
    /// - `SweepError::ChannelClosed` if the engine has shut down
    pub async fn start(
        &self,
        targets: Vec<FrequencyTarget>,
        dwell: Duration,
    ) -> Result<SweepStatus, SweepError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(SweepCommand::Start {
                targets,
                dwell,
                respond_to: tx,
            })
            .await
            .map_err(|_| SweepError::ChannelClosed)?;

        rx.await.map_err(|_| SweepError::ChannelClosed)?
    }

    /// Stop the sweep and release the SDR.
    ///
    /// # Errors
    ///
    /// Only `SweepError::ChannelClosed`.
    pub async fn stop(&self) -> Result<SweepStatus, SweepError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(SweepCommand::Stop { respond_to: tx })
            .await
            .map_err(|_| SweepError::ChannelClosed)?;

        rx.await.map_err(|_| SweepError::ChannelClosed)
    }

    /// Stop and kill orphaned capture processes.
    ///
    /// # Errors
    ///
    /// Only `SweepError::ChannelClosed`.
    pub async fn emergency_stop(&self) -> Result<EmergencyStopReport, SweepError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(SweepCommand::EmergencyStop { respond_to: tx })
            .await
            .map_err(|_| SweepError::ChannelClosed)?;

        rx.await.map_err(|_| SweepError::ChannelClosed)
    }

    /// Current status snapshot.
    ///
    /// Never fails: if the engine cannot be reached an `unavailable`
    /// snapshot is returned.
    pub async fn status(&self) -> SweepStatus {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(SweepCommand::Status { respond_to: tx })
            .await
            .is_err()
        {
            return SweepStatus::unavailable("sweep engine unavailable");
        }

        rx.await
            .unwrap_or_else(|_| SweepStatus::unavailable("sweep engine unavailable"))
    }

    /// Take buffered capture lines. Empty if the engine is gone.
    pub async fn drain(&self, limit: Option<usize>) -> Vec<CaptureLine> {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(SweepCommand::Drain {
                limit,
                respond_to: tx,
            })
            .await
            .is_err()
        {
            return Vec::new();
        }

        rx.await.unwrap_or_default()
    }

    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }
}
