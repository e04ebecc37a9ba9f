//! Drop-based lease release for in-process tool modules.

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use rfmux_core::{Device, OwnerId};

use super::commands::{LeaseCommand, LeaseError};

/// A held lease that is released when the guard is dropped.
///
/// Dropping cannot await, so the release is queued with `try_send`; if
/// the command queue is full it is handed to a spawned task on the
/// current runtime. Use [`release`](Self::release) to release and wait
/// for confirmation.
#[derive(Debug)]
pub struct LeaseGuard {
    sender: mpsc::Sender<LeaseCommand>,
    owner: OwnerId,
    device: Device,
    released: bool,
}

impl LeaseGuard {
    pub(crate) fn new(sender: mpsc::Sender<LeaseCommand>, owner: OwnerId, device: Device) -> Self {
        Self {
            sender,
            owner,
            device,
            released: false,
        }
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Releases the lease and waits for the manager to confirm.
    ///
    /// Returns `false` if the lease was already gone (force-released or
    /// reaped).
    pub async fn release(mut self) -> Result<bool, LeaseError> {
        self.released = true;
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(LeaseCommand::Release {
                owner: self.owner.clone(),
                device: self.device,
                respond_to: tx,
            })
            .await
            .map_err(|_| LeaseError::ChannelClosed)?;

        rx.await.map_err(|_| LeaseError::ChannelClosed)?
    }

    /// Drops the guard without releasing.
    ///
    /// Used when the lease is known to be gone already.
    pub fn forget(mut self) {
        self.released = true;
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let (tx, _rx) = oneshot::channel();
        let cmd = LeaseCommand::Release {
            owner: self.owner.clone(),
            device: self.device,
            respond_to: tx,
        };

        match self.sender.try_send(cmd) {
            Ok(()) => {
                debug!(device = %self.device, owner = %self.owner, "Lease guard dropped, release queued");
            }
            Err(mpsc::error::TrySendError::Full(cmd)) => {
                match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        let sender = self.sender.clone();
                        runtime.spawn(async move {
                            let _ = sender.send(cmd).await;
                        });
                    }
                    Err(_) => {
                        warn!(
                            device = %self.device,
                            owner = %self.owner,
                            "Lease guard dropped outside runtime with full queue; lease left to reaper"
                        );
                    }
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(device = %self.device, "Lease guard dropped after manager shutdown");
            }
        }
    }
}
