//! Run an external tool while holding a device lease.
//!
//! The lease is acquired with the launcher's own PID, so if the launcher
//! dies without releasing, the daemon's reaper frees the device. The
//! acquiring connection stays open as a [`LeaseWatch`] for as long as the
//! tool runs: when the daemon takes the lease away (force-release, daemon
//! shutdown) or the connection drops, the tool is killed so it never
//! drives a device someone else now owns.
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::future::Future;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::client::{ClientConfig, DaemonClient, LeaseWatch};
use crate::error::{ClientError, Result};

/// Ping interval on the watch connection; well under the daemon's idle timeout.
const WATCH_KEEPALIVE: Duration = Duration::from_secs(60);

/// A tool to run under a lease.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    /// Lease owner name
    pub tool_name: String,
    /// Device name or alias (`sdr`, `wifi`, ...)
    pub device: String,
    pub program: String,
    pub args: Vec<String>,
}

/// Acquires the lease, runs the tool to completion and releases.
///
/// Ctrl-C while the tool runs kills it; the lease is released either way.
///
/// # Errors
///
/// [`ClientError::LeaseDenied`] if another owner holds the device, and
/// [`ClientError::Launch`] if the program cannot be started. If the lease
/// is revoked while the tool runs, the tool is killed and
/// [`ClientError::LeaseRevoked`] is returned ([`ClientError::Closed`] if
/// the daemon went away). A failed release is logged, not returned, since
/// the tool already ran.
pub async fn run_with_lease(config: &ClientConfig, request: &LaunchRequest) -> Result<ExitStatus> {
    let mut watch = acquire(config, request).await?;
    let device = watch.device().to_string();

    let lease_lost = async {
        match watch.revoked(WATCH_KEEPALIVE).await {
            Ok(revocation) => ClientError::from(revocation),
            Err(e) => e,
        }
    };
    let outcome = run_tool(request, lease_lost).await;
    drop(watch);

    if matches!(outcome, Err(ClientError::LeaseRevoked { .. } | ClientError::Closed)) {
        return outcome;
    }

    if let Err(e) = release(config, &request.tool_name, &device).await {
        warn!(
            tool = %request.tool_name,
            device,
            error = %e,
            "Failed to release lease; the daemon will reap it"
        );
    }

    outcome
}

/// Acquires the lease and keeps the connection as a watch on it.
async fn acquire(config: &ClientConfig, request: &LaunchRequest) -> Result<LeaseWatch> {
    let mut client = DaemonClient::connect(config).await?;
    let reply = client
        .acquire_lease(&request.tool_name, &request.device, Some(std::process::id()))
        .await?;
    info!(tool = %request.tool_name, device = %reply.device, "Lease acquired");

    match client.watch_lease(&request.tool_name, &reply.device).await {
        Ok(watch) => Ok(watch),
        Err(e) => {
            // Revoked between acquire and watch; make sure nothing is left behind
            debug!(error = %e, "Lease watch refused");
            if let Err(release_error) = release(config, &request.tool_name, &reply.device).await {
                debug!(error = %release_error, "Release after refused watch failed");
            }
            Err(e)
        }
    }
}

async fn release(config: &ClientConfig, tool_name: &str, device: &str) -> Result<()> {
    let mut client = DaemonClient::connect(config).await?;
    client.release_lease(tool_name, device).await?;
    info!(tool = tool_name, device, "Lease released");
    client.disconnect().await
}

/// Runs the tool until it exits, Ctrl-C, or `lease_lost` resolves.
async fn run_tool<F>(request: &LaunchRequest, lease_lost: F) -> Result<ExitStatus>
where
    F: Future<Output = ClientError>,
{
    let mut child = Command::new(&request.program)
        .args(&request.args)
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ClientError::Launch {
            program: request.program.clone(),
            source,
        })?;

    tokio::select! {
        status = child.wait() => Ok(status?),
        _ = tokio::signal::ctrl_c() => {
            info!(program = %request.program, "Interrupted, stopping tool");
            child.kill().await?;
            Ok(child.wait().await?)
        }
        error = lease_lost => {
            warn!(program = %request.program, error = %error, "Lease lost, stopping tool");
            child.kill().await?;
            Err(error)
        }
    }
}
