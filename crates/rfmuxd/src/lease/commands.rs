//! Lease actor commands, errors, and events.
//!
//! - `LeaseCommand`: Commands sent to the actor
//! - `LeaseError`: Errors that can occur during lease operations
//! - `LeaseEvent`: Events published by the lease manager for subscribers

pub use rfmux_core::ReleaseReason;
use rfmux_core::{AcquireResult, Device, Lease, OwnerId};
use thiserror::Error;
use tokio::sync::oneshot;

// ============================================================================
// Lease Commands
// ============================================================================

/// Commands sent to the lease actor.
///
/// Each command carries a oneshot channel for the response. The actor
/// processes commands one at a time, which is what makes acquire atomic
/// with respect to concurrent callers.
#[derive(Debug)]
pub enum LeaseCommand {
    /// Claim a device for `owner`.
    ///
    /// A conflict is reported as `AcquireResult { granted: false, .. }`,
    /// not as an error.
    ///
    /// # Errors
    /// - `LeaseError::UnknownDevice` if the device is not arbitrated
    Acquire {
        owner: OwnerId,
        device: Device,
        /// Owner process to watch; the lease is reaped when it dies
        pid: Option<u32>,
        respond_to: oneshot::Sender<Result<AcquireResult, LeaseError>>,
    },

    /// Give a device back. Replies `true` if a lease was removed, `false`
    /// if `owner` did not hold it.
    ///
    /// # Errors
    /// - `LeaseError::UnknownDevice` if the device is not arbitrated
    Release {
        owner: OwnerId,
        device: Device,
        respond_to: oneshot::Sender<Result<bool, LeaseError>>,
    },

    /// Evict whoever holds the device. Replies with the evicted lease.
    ///
    /// # Errors
    /// - `LeaseError::UnknownDevice` if the device is not arbitrated
    ForceRelease {
        device: Device,
        respond_to: oneshot::Sender<Result<Option<Lease>, LeaseError>>,
    },

    /// Get the lease on one device.
    Get {
        device: Device,
        respond_to: oneshot::Sender<Option<Lease>>,
    },

    /// Get all leases, ordered by device.
    GetAll {
        respond_to: oneshot::Sender<Vec<Lease>>,
    },

    /// Release every lease (daemon shutdown). Replies with the count.
    ReleaseAll { respond_to: oneshot::Sender<usize> },

    /// Release leases whose owner process has died.
    ///
    /// Fire-and-forget command used by the reaper task.
    ReapDeadOwners,
}

// ============================================================================
// Lease Errors
// ============================================================================

/// Errors that can occur during lease operations.
#[derive(Debug, Clone, Error)]
pub enum LeaseError {
    /// The device is not part of this manager's registry.
    #[error("device not arbitrated: {0}")]
    UnknownDevice(Device),

    /// The device is held by someone else.
    ///
    /// Only returned by APIs that cannot express a conflict as a value
    /// (guard acquisition).
    #[error("{device} is held by {owner}")]
    Held { device: Device, owner: OwnerId },

    /// The response channel was closed before receiving a response.
    ///
    /// This typically indicates the actor was shut down.
    #[error("response channel closed")]
    ChannelClosed,
}

// ============================================================================
// Lease Events
// ============================================================================

/// Events published by the lease manager.
///
/// Evicted owners watch for `Released { reason: Forced, .. }` on their own
/// leases to self-stop.
#[derive(Debug, Clone)]
pub enum LeaseEvent {
    /// A device was claimed (not sent for idempotent re-acquires).
    Acquired { lease: Lease },

    /// A lease ended.
    Released {
        device: Device,
        owner: OwnerId,
        reason: ReleaseReason,
    },
}
