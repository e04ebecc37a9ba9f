//! Client interface for interacting with the LeaseActor.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Channel errors are mapped to `LeaseError::ChannelClosed`

use tokio::sync::{broadcast, mpsc, oneshot};

use rfmux_core::{AcquireResult, Device, Lease, OwnerId};

use super::commands::{LeaseCommand, LeaseError, LeaseEvent};
use super::guard::LeaseGuard;

/// Handle for interacting with the lease actor.
///
/// Cheap to clone; every tool module gets its own copy.
#[derive(Clone)]
pub struct LeaseHandle {
    sender: mpsc::Sender<LeaseCommand>,
    event_sender: broadcast::Sender<LeaseEvent>,
}

impl LeaseHandle {
    pub fn new(
        sender: mpsc::Sender<LeaseCommand>,
        event_sender: broadcast::Sender<LeaseEvent>,
    ) -> Self {
        Self {
            sender,
            event_sender,
        }
    }

    /// Claim a device.
    ///
    /// A device held by another owner yields `granted: false` with the
    /// current owner. `pid` enables reaping if the owner process dies.
    ///
    /// # Errors
    ///
    /// - `LeaseError::UnknownDevice` if the device is not arbitrated
    /// - `LeaseError::ChannelClosed` if the actor has shut down
    pub async fn acquire(
        &self,
        owner: OwnerId,
        device: Device,
        pid: Option<u32>,
    ) -> Result<AcquireResult, LeaseError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(LeaseCommand::Acquire {
                owner,
                device,
                pid,
                respond_to: tx,
            })
            .await
            .map_err(|_| LeaseError::ChannelClosed)?;

        rx.await.map_err(|_| LeaseError::ChannelClosed)?
    }

    /// Claim a device and wrap the lease in a guard that releases it on
    /// drop.
    ///
    /// # Errors
    ///
    /// - `LeaseError::Held` if another owner holds the device
    /// - otherwise as [`acquire`](Self::acquire)
    pub async fn acquire_guard(
        &self,
        owner: OwnerId,
        device: Device,
        pid: Option<u32>,
    ) -> Result<LeaseGuard, LeaseError> {
        let result = self.acquire(owner.clone(), device, pid).await?;
        match result.current_owner {
            Some(holder) if !result.granted => Err(LeaseError::Held {
                device,
                owner: holder,
            }),
            _ => Ok(LeaseGuard::new(self.sender.clone(), owner, device)),
        }
    }

    /// Give a device back. Returns `false` if `owner` did not hold it.
    ///
    /// # Errors
    ///
    /// - `LeaseError::UnknownDevice` if the device is not arbitrated
    /// - `LeaseError::ChannelClosed` if the actor has shut down
    pub async fn release(&self, owner: OwnerId, device: Device) -> Result<bool, LeaseError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(LeaseCommand::Release {
                owner,
                device,
                respond_to: tx,
            })
            .await
            .map_err(|_| LeaseError::ChannelClosed)?;

        rx.await.map_err(|_| LeaseError::ChannelClosed)?
    }

    /// Evict whoever holds a device. Returns the evicted lease, if any.
    ///
    /// # Errors
    ///
    /// - `LeaseError::UnknownDevice` if the device is not arbitrated
    /// - `LeaseError::ChannelClosed` if the actor has shut down
    pub async fn force_release(&self, device: Device) -> Result<Option<Lease>, LeaseError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(LeaseCommand::ForceRelease {
                device,
                respond_to: tx,
            })
            .await
            .map_err(|_| LeaseError::ChannelClosed)?;

        rx.await.map_err(|_| LeaseError::ChannelClosed)?
    }

    /// Get the lease on a device.
    ///
    /// Returns `None` if the device is free or the actor is gone.
    pub async fn get(&self, device: Device) -> Option<Lease> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(LeaseCommand::Get {
                device,
                respond_to: tx,
            })
            .await
            .ok()?;

        rx.await.ok()?
    }

    /// Returns the owner currently holding a device.
    pub async fn current_owner(&self, device: Device) -> Option<OwnerId> {
        self.get(device).await.map(|lease| lease.owner)
    }

    /// Get all leases, ordered by device.
    ///
    /// Returns an empty vector if the actor is gone.
    pub async fn leases(&self) -> Vec<Lease> {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(LeaseCommand::GetAll { respond_to: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }

        rx.await.unwrap_or_default()
    }

    /// Release every lease. Returns how many were released.
    pub async fn release_all(&self) -> usize {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(LeaseCommand::ReleaseAll { respond_to: tx })
            .await
            .is_err()
        {
            return 0;
        }

        rx.await.unwrap_or(0)
    }

    /// Trigger reaping of leases held by dead processes.
    ///
    /// Fire-and-forget.
    pub async fn reap_dead_owners(&self) {
        let _ = self.sender.send(LeaseCommand::ReapDeadOwners).await;
    }

    /// Subscribe to lease events.
    pub fn subscribe(&self) -> broadcast::Receiver<LeaseEvent> {
        self.event_sender.subscribe()
    }

    /// Returns `true` while the command channel is open.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }
}
