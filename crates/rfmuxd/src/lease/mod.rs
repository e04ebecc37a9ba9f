//! Device lease manager using the actor pattern.
//!
//! The lease manager is the single source of truth for which tool owns
//! which physical device. Every tool module (the sweep engine included)
//! goes through it before touching hardware.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌──────────────────┐
//! │  Tool modules   │────▶│   LeaseActor    │────▶│ Broadcast Channel│
//! └─────────────────┘     └─────────────────┘     └──────────────────┘
//!         │                       │                       │
//!         │   LeaseCommand        │   LeaseEvent          │
//!         │   (mpsc channel)      │   (broadcast)         │
//!         ▼                       ▼                       ▼
//!   acquire/release        BTreeMap<Device,        evicted owners
//!                               Lease>             self-stop
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()` or `.expect()` in production code
//! - Channel operations handle closure gracefully

use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::debug;

use rfmux_core::DeviceRegistry;

mod actor;
mod commands;
mod guard;
mod handle;

pub use actor::LeaseActor;
pub use commands::{LeaseCommand, LeaseError, LeaseEvent, ReleaseReason};
pub use guard::LeaseGuard;
pub use handle::LeaseHandle;

/// Channel buffer sizes
const COMMAND_BUFFER: usize = 100;
const EVENT_BUFFER: usize = 100;

/// Default interval between dead-owner sweeps.
pub const DEFAULT_REAPER_INTERVAL: Duration = Duration::from_secs(5);

/// Spawn the lease actor and its reaper task, returning a handle.
///
/// # Example
///
/// ```no_run
/// use rfmux_core::{Device, DeviceRegistry, OwnerId};
/// use rfmuxd::lease::{spawn_lease_manager, DEFAULT_REAPER_INTERVAL};
///
/// #[tokio::main]
/// async fn main() {
///     let leases = spawn_lease_manager(DeviceRegistry::new(), DEFAULT_REAPER_INTERVAL);
///     let result = leases.acquire(OwnerId::new("kismet"), Device::WifiAdapter, None).await;
/// }
/// ```
pub fn spawn_lease_manager(devices: DeviceRegistry, reaper_interval: Duration) -> LeaseHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, _) = broadcast::channel(EVENT_BUFFER);

    let actor = LeaseActor::new(cmd_rx, event_tx.clone(), devices);
    tokio::spawn(actor.run());

    let handle = LeaseHandle::new(cmd_tx.clone(), event_tx);

    spawn_reaper_task(cmd_tx, reaper_interval);

    handle
}

/// Spawn a background task that periodically reaps leases of dead owners.
fn spawn_reaper_task(sender: mpsc::Sender<LeaseCommand>, period: Duration) {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            if sender.send(LeaseCommand::ReapDeadOwners).await.is_err() {
                debug!("Reaper task stopping: lease channel closed");
                break;
            }
        }
    });
}
