//! rfmux client library
//!
//! Used by the `rfmux` CLI and by tool modules that need to talk to the
//! daemon:
//!
//! 1. **`client`**: one-shot request/response connection (leases, sweep control)
//! 2. **`watch`**: long-lived live-event subscription with reconnect backoff
//! 3. **`launcher`**: runs an external tool while holding a device lease,
//!    killing it if the lease is revoked

pub mod client;
pub mod error;
pub mod launcher;
pub mod watch;

pub use client::{ClientConfig, DaemonClient, LeaseReply, LeaseWatch, Revocation, SweepReply};
pub use error::{ClientError, Result};
pub use launcher::{run_with_lease, LaunchRequest};
pub use watch::{EventWatcher, WatchEvent};
