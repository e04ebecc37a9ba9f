//! SDR sweep engine using the actor pattern.
//!
//! The engine holds the SDR lease for the duration of a sweep, runs the
//! external capture program on the current frequency target, restarts it
//! on each dwell tick and on transient faults, and publishes status,
//! data and errors through the [`EventBridge`](crate::events::EventBridge).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐ SweepCommand ┌──────────────┐  SweepEvent  ┌─────────────┐
//! │ SweepHandle  │─────────────▶│  SweepActor  │─────────────▶│ EventBridge │
//! └──────────────┘  (mpsc)      └──────────────┘              └─────────────┘
//!                                 ▲    ▲     ▲
//!                 ProcessEvent ───┘    │     └─── LeaseEvent
//!                 (run-tagged)   TimerMessage     (force-release)
//!                               (session-tagged)
//! ```
//!
//! State machine:
//!
//! ```text
//! Idle ──start──▶ Starting ──data / grace──▶ Running
//!                    │                        │  ▲
//!                    └──transient fault──▶ Recovering
//!   any active state ──fatal / budget spent──▶ Error
//!   any state ──stop──▶ Idle
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()` or `.expect()` in production code
//! - Channel operations handle closure gracefully

use tokio::sync::mpsc;

use crate::config::SweepConfig;
use crate::events::EventBridge;
use crate::lease::LeaseHandle;

mod actor;
mod buffer;
mod commands;
mod cycler;
pub mod hackrf;
mod handle;
mod health;
mod schedule;
mod supervisor;

pub use actor::SweepActor;
pub use buffer::CaptureBuffer;
pub use commands::{EmergencyStopReport, SweepCommand, SweepError, TimerMessage, TimerSignal};
pub use cycler::FrequencyCycler;
pub use handle::SweepHandle;
pub use health::{Classification, ClassifierRule, HealthClassifier, HealthTracker, Severity};
pub use schedule::ScheduledTask;
pub use supervisor::{
    CleanupReport, ExitInfo, ProcessEvent, ProcessSupervisor, RunId, SupervisorError,
};

/// Command channel buffer size
const COMMAND_BUFFER: usize = 32;

/// Spawn the sweep actor, returning a handle.
///
/// The actor runs a baseline reset first: orphaned capture processes are
/// terminated and any stale SDR lease under the engine's owner id is
/// released.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use rfmux_core::{DeviceRegistry, FrequencyTarget, FrequencyUnit};
/// use rfmuxd::config::SweepConfig;
/// use rfmuxd::events::EventBridge;
/// use rfmuxd::lease::{spawn_lease_manager, DEFAULT_REAPER_INTERVAL};
/// use rfmuxd::sweep::spawn_sweep_engine;
///
/// #[tokio::main]
/// async fn main() {
///     let leases = spawn_lease_manager(DeviceRegistry::new(), DEFAULT_REAPER_INTERVAL);
///     let sweep = spawn_sweep_engine(SweepConfig::default(), leases, EventBridge::new());
///     let target = FrequencyTarget::new(2405.0, FrequencyUnit::MHz).unwrap();
///     let status = sweep.start(vec![target], Duration::from_secs(10)).await;
/// }
/// ```
pub fn spawn_sweep_engine(
    config: SweepConfig,
    leases: LeaseHandle,
    bridge: EventBridge,
) -> SweepHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);

    let actor = SweepActor::new(cmd_rx, config, leases, bridge);
    tokio::spawn(actor.run());

    SweepHandle::new(cmd_tx)
}
