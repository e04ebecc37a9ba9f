//! Lease actor - owns the device → lease map and processes commands.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Reply send failures are ignored (the caller went away)
//! - Event publish failures are ignored (no subscribers)

use std::collections::BTreeMap;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use rfmux_core::{AcquireResult, Device, DeviceRegistry, Lease, OwnerId, OwnerProcess};

use super::commands::{LeaseCommand, LeaseError, LeaseEvent, ReleaseReason};

/// The lease actor - single owner of all lease state.
///
/// A `BTreeMap` keyed by device enforces at most one lease per device
/// and keeps snapshots in device order.
pub struct LeaseActor {
    receiver: mpsc::Receiver<LeaseCommand>,

    /// Devices this manager arbitrates
    devices: DeviceRegistry,

    leases: BTreeMap<Device, Lease>,

    event_publisher: broadcast::Sender<LeaseEvent>,
}

impl LeaseActor {
    pub fn new(
        receiver: mpsc::Receiver<LeaseCommand>,
        event_publisher: broadcast::Sender<LeaseEvent>,
        devices: DeviceRegistry,
    ) -> Self {
        Self {
            receiver,
            devices,
            leases: BTreeMap::new(),
            event_publisher,
        }
    }

    /// Runs the actor event loop until every sender is dropped.
    pub async fn run(mut self) {
        info!(devices = ?self.devices.devices(), "Lease manager starting");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!(leases = self.leases.len(), "Lease manager stopped");
    }

    fn handle_command(&mut self, cmd: LeaseCommand) {
        match cmd {
            LeaseCommand::Acquire {
                owner,
                device,
                pid,
                respond_to,
            } => {
                let result = self.handle_acquire(owner, device, pid);
                let _ = respond_to.send(result);
            }
            LeaseCommand::Release {
                owner,
                device,
                respond_to,
            } => {
                let result = self.handle_release(&owner, device);
                let _ = respond_to.send(result);
            }
            LeaseCommand::ForceRelease { device, respond_to } => {
                let result = self.handle_force_release(device);
                let _ = respond_to.send(result);
            }
            LeaseCommand::Get { device, respond_to } => {
                let _ = respond_to.send(self.leases.get(&device).cloned());
            }
            LeaseCommand::GetAll { respond_to } => {
                let _ = respond_to.send(self.leases.values().cloned().collect());
            }
            LeaseCommand::ReleaseAll { respond_to } => {
                let _ = respond_to.send(self.handle_release_all());
            }
            LeaseCommand::ReapDeadOwners => {
                self.handle_reap_dead_owners();
            }
        }
    }

    // ========================================================================
    // Command Handlers
    // ========================================================================

    fn ensure_arbitrated(&self, device: Device) -> Result<(), LeaseError> {
        if self.devices.contains(device) {
            Ok(())
        } else {
            Err(LeaseError::UnknownDevice(device))
        }
    }

    fn handle_acquire(
        &mut self,
        owner: OwnerId,
        device: Device,
        pid: Option<u32>,
    ) -> Result<AcquireResult, LeaseError> {
        self.ensure_arbitrated(device)?;

        if let Some(existing) = self.leases.get_mut(&device) {
            if !existing.is_held_by(&owner) {
                debug!(
                    device = %device,
                    requested_by = %owner,
                    held_by = %existing.owner,
                    "Lease conflict"
                );
                return Ok(AcquireResult::conflict(existing.owner.clone()));
            }

            // Re-acquire keeps the original acquired_at; a newly reported
            // PID replaces the old one.
            if let Some(pid) = pid {
                if existing.owner_process.as_ref().map(|p| p.pid) != Some(pid) {
                    existing.owner_process = Some(OwnerProcess::capture(pid));
                }
            }
            debug!(device = %device, owner = %owner, "Lease re-acquired by holder");
            return Ok(AcquireResult::granted());
        }

        let mut lease = Lease::new(device, owner);
        if let Some(pid) = pid {
            lease = lease.with_owner_process(OwnerProcess::capture(pid));
        }

        info!(device = %device, owner = %lease.owner, pid = ?pid, "Lease acquired");
        self.leases.insert(device, lease.clone());
        let _ = self.event_publisher.send(LeaseEvent::Acquired { lease });

        Ok(AcquireResult::granted())
    }

    fn handle_release(&mut self, owner: &OwnerId, device: Device) -> Result<bool, LeaseError> {
        self.ensure_arbitrated(device)?;

        match self.leases.get(&device) {
            Some(lease) if lease.is_held_by(owner) => {
                self.remove_lease(device, ReleaseReason::Explicit);
                Ok(true)
            }
            Some(lease) => {
                debug!(
                    device = %device,
                    requested_by = %owner,
                    held_by = %lease.owner,
                    "Release ignored: not the holder"
                );
                Ok(false)
            }
            None => Ok(false),
        }
    }

    fn handle_force_release(&mut self, device: Device) -> Result<Option<Lease>, LeaseError> {
        self.ensure_arbitrated(device)?;
        Ok(self.remove_lease(device, ReleaseReason::Forced))
    }

    fn handle_release_all(&mut self) -> usize {
        let devices: Vec<Device> = self.leases.keys().copied().collect();
        for device in &devices {
            self.remove_lease(*device, ReleaseReason::Shutdown);
        }
        devices.len()
    }

    fn handle_reap_dead_owners(&mut self) {
        let dead: Vec<Device> = self
            .leases
            .iter()
            .filter_map(|(device, lease)| {
                let process = lease.owner_process.as_ref()?;
                if process.is_alive() {
                    None
                } else {
                    Some(*device)
                }
            })
            .collect();

        if dead.is_empty() {
            debug!("No leases held by dead owners");
            return;
        }

        for device in dead {
            self.remove_lease(device, ReleaseReason::OwnerExited);
        }
    }

    /// Removes a lease and publishes the release event.
    fn remove_lease(&mut self, device: Device, reason: ReleaseReason) -> Option<Lease> {
        let lease = self.leases.remove(&device)?;

        if reason == ReleaseReason::Explicit {
            info!(device = %device, owner = %lease.owner, "Lease released");
        } else {
            // Use warn! so evictions show up without RUST_LOG=debug
            warn!(
                device = %device,
                owner = %lease.owner,
                reason = %reason,
                held_secs = lease.held_for(chrono::Utc::now()).num_seconds(),
                "Lease removed"
            );
        }

        let _ = self.event_publisher.send(LeaseEvent::Released {
            device,
            owner: lease.owner.clone(),
            reason,
        });

        Some(lease)
    }

    // ========================================================================
    // Accessors (for testing)
    // ========================================================================

    #[cfg(test)]
    pub fn lease_count(&self) -> usize {
        self.leases.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    fn create_actor() -> (LeaseActor, broadcast::Receiver<LeaseEvent>) {
        let (_cmd_tx, cmd_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = broadcast::channel(16);
        let actor = LeaseActor::new(cmd_rx, event_tx, DeviceRegistry::new());
        (actor, event_rx)
    }

    fn acquire(actor: &mut LeaseActor, owner: &str, device: Device) -> oneshot::Receiver<Result<AcquireResult, LeaseError>> {
        let (tx, rx) = oneshot::channel();
        actor.handle_command(LeaseCommand::Acquire {
            owner: OwnerId::new(owner),
            device,
            pid: None,
            respond_to: tx,
        });
        rx
    }

    #[tokio::test]
    async fn test_acquire_free_device() {
        let (mut actor, mut event_rx) = create_actor();

        let result = acquire(&mut actor, "toolA", Device::Sdr).await.unwrap().unwrap();
        assert!(result.granted);
        assert_eq!(actor.lease_count(), 1);

        let event = event_rx.try_recv().unwrap();
        assert!(matches!(event, LeaseEvent::Acquired { lease } if lease.device == Device::Sdr));
    }

    #[tokio::test]
    async fn test_acquire_conflict_reports_owner() {
        let (mut actor, _) = create_actor();

        acquire(&mut actor, "toolA", Device::Sdr).await.unwrap().unwrap();
        let result = acquire(&mut actor, "toolB", Device::Sdr).await.unwrap().unwrap();

        assert!(!result.granted);
        assert_eq!(result.current_owner, Some(OwnerId::new("toolA")));
        assert_eq!(actor.lease_count(), 1);
    }

    #[tokio::test]
    async fn test_reacquire_keeps_acquired_at() {
        let (mut actor, mut event_rx) = create_actor();

        acquire(&mut actor, "toolA", Device::Sdr).await.unwrap().unwrap();
        let first = actor.leases.get(&Device::Sdr).unwrap().acquired_at;
        let _ = event_rx.try_recv();

        let result = acquire(&mut actor, "toolA", Device::Sdr).await.unwrap().unwrap();
        assert!(result.granted);
        assert_eq!(actor.leases.get(&Device::Sdr).unwrap().acquired_at, first);

        // No second Acquired event
        assert!(event_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_release_by_non_holder_is_noop() {
        let (mut actor, _) = create_actor();
        acquire(&mut actor, "toolA", Device::Sdr).await.unwrap().unwrap();

        let (tx, rx) = oneshot::channel();
        actor.handle_command(LeaseCommand::Release {
            owner: OwnerId::new("toolB"),
            device: Device::Sdr,
            respond_to: tx,
        });

        assert!(!rx.await.unwrap().unwrap());
        assert_eq!(actor.lease_count(), 1);
    }

    #[tokio::test]
    async fn test_release_frees_device() {
        let (mut actor, mut event_rx) = create_actor();
        acquire(&mut actor, "toolA", Device::Sdr).await.unwrap().unwrap();
        let _ = event_rx.try_recv();

        let (tx, rx) = oneshot::channel();
        actor.handle_command(LeaseCommand::Release {
            owner: OwnerId::new("toolA"),
            device: Device::Sdr,
            respond_to: tx,
        });
        assert!(rx.await.unwrap().unwrap());

        let event = event_rx.try_recv().unwrap();
        assert!(matches!(
            event,
            LeaseEvent::Released {
                reason: ReleaseReason::Explicit,
                ..
            }
        ));

        let result = acquire(&mut actor, "toolB", Device::Sdr).await.unwrap().unwrap();
        assert!(result.granted);
    }

    #[tokio::test]
    async fn test_force_release_evicts_holder() {
        let (mut actor, mut event_rx) = create_actor();
        acquire(&mut actor, "toolA", Device::WifiAdapter).await.unwrap().unwrap();
        let _ = event_rx.try_recv();

        let (tx, rx) = oneshot::channel();
        actor.handle_command(LeaseCommand::ForceRelease {
            device: Device::WifiAdapter,
            respond_to: tx,
        });

        let evicted = rx.await.unwrap().unwrap().unwrap();
        assert_eq!(evicted.owner, OwnerId::new("toolA"));
        assert_eq!(actor.lease_count(), 0);

        let event = event_rx.try_recv().unwrap();
        assert!(matches!(
            event,
            LeaseEvent::Released {
                reason: ReleaseReason::Forced,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_force_release_free_device_succeeds() {
        let (mut actor, _) = create_actor();

        let (tx, rx) = oneshot::channel();
        actor.handle_command(LeaseCommand::ForceRelease {
            device: Device::Sdr,
            respond_to: tx,
        });

        assert!(rx.await.unwrap().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_device_rejected() {
        let (_cmd_tx, cmd_rx) = mpsc::channel(16);
        let (event_tx, _) = broadcast::channel(16);
        let mut actor = LeaseActor::new(
            cmd_rx,
            event_tx,
            DeviceRegistry::with_devices([Device::Sdr]),
        );

        let result = acquire(&mut actor, "toolA", Device::BluetoothRadio).await.unwrap();
        assert!(matches!(
            result,
            Err(LeaseError::UnknownDevice(Device::BluetoothRadio))
        ));
        assert_eq!(actor.lease_count(), 0);
    }

    #[tokio::test]
    async fn test_release_all() {
        let (mut actor, _) = create_actor();
        for device in Device::ALL {
            acquire(&mut actor, "toolA", device).await.unwrap().unwrap();
        }

        let (tx, rx) = oneshot::channel();
        actor.handle_command(LeaseCommand::ReleaseAll { respond_to: tx });

        assert_eq!(rx.await.unwrap(), 3);
        assert_eq!(actor.lease_count(), 0);
    }

    #[tokio::test]
    async fn test_get_all_ordered_by_device() {
        let (mut actor, _) = create_actor();
        acquire(&mut actor, "bt-tool", Device::BluetoothRadio).await.unwrap().unwrap();
        acquire(&mut actor, "sdr-tool", Device::Sdr).await.unwrap().unwrap();

        let (tx, rx) = oneshot::channel();
        actor.handle_command(LeaseCommand::GetAll { respond_to: tx });

        let leases = rx.await.unwrap();
        let devices: Vec<Device> = leases.iter().map(|l| l.device).collect();
        assert_eq!(devices, vec![Device::Sdr, Device::BluetoothRadio]);
    }

    #[tokio::test]
    async fn test_reap_dead_owner() {
        let (mut actor, mut event_rx) = create_actor();

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();

        let (tx, rx) = oneshot::channel();
        actor.handle_command(LeaseCommand::Acquire {
            owner: OwnerId::new("crashed-tool"),
            device: Device::Sdr,
            pid: Some(dead_pid),
            respond_to: tx,
        });
        rx.await.unwrap().unwrap();

        let (tx, rx) = oneshot::channel();
        actor.handle_command(LeaseCommand::Acquire {
            owner: OwnerId::new("live-tool"),
            device: Device::WifiAdapter,
            pid: Some(std::process::id()),
            respond_to: tx,
        });
        rx.await.unwrap().unwrap();
        let _ = event_rx.try_recv();
        let _ = event_rx.try_recv();

        actor.handle_command(LeaseCommand::ReapDeadOwners);

        assert_eq!(actor.lease_count(), 1);
        assert!(actor.leases.contains_key(&Device::WifiAdapter));
        let event = event_rx.try_recv().unwrap();
        assert!(matches!(
            event,
            LeaseEvent::Released {
                device: Device::Sdr,
                reason: ReleaseReason::OwnerExited,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_reap_ignores_leases_without_pid() {
        let (mut actor, _) = create_actor();
        acquire(&mut actor, "toolA", Device::Sdr).await.unwrap().unwrap();

        actor.handle_command(LeaseCommand::ReapDeadOwners);
        assert_eq!(actor.lease_count(), 1);
    }
}
