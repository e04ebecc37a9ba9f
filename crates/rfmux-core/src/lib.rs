//! rfmux Core - Shared types for RF device arbitration and SDR sweeps
//!
//! This crate provides the domain types shared between the daemon
//! (rfmuxd), the wire protocol and the client library.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod capture;
pub mod device;
pub mod error;
pub mod event;
pub mod frequency;
pub mod lease;
pub mod status;

// Re-exports for convenience
pub use capture::CaptureLine;
pub use device::{Device, DeviceRegistry};
pub use error::{DomainError, DomainResult};
pub use event::SweepEvent;
pub use frequency::{FrequencyTarget, FrequencyUnit, SDR_MAX_HZ, SDR_MIN_HZ};
pub use lease::{AcquireResult, Lease, OwnerId, OwnerProcess, ReleaseReason};
pub use status::{CycleSnapshot, HealthStatus, ProcessHealth, SweepState, SweepStatus};
