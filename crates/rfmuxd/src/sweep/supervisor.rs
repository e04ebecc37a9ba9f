//! Spawning, watching and terminating the external capture process.
//!
//! One process at a time. Each spawn gets a [`RunId`] that tags every
//! event it produces, so the sweep actor can drop late events from a
//! process it has already replaced.
//!
//! # Event delivery
//!
//! - stdout lines are forwarded with `try_send`; when the queue is full
//!   they are dropped and counted
//! - stderr lines and the exit event are always delivered
//! - the exit event is sent after both readers hit EOF (bounded wait), so
//!   the last stderr line is seen before the exit it explains

use std::ffi::OsStr;
use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sysinfo::{Pid, Signal, System};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// How long the waiter lets the output readers finish after exit.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Extra slack on top of the kill grace before `kill` gives up waiting.
const KILL_WAIT_SLACK: Duration = Duration::from_secs(2);

/// Pause between SIGTERM and SIGKILL during orphan cleanup.
const CLEANUP_GRACE: Duration = Duration::from_millis(500);

// ============================================================================
// Events
// ============================================================================

/// Identifies one spawned process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunId(pub u64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exited with code {code}"),
            (None, Some(signal)) => write!(f, "killed by signal {signal}"),
            (None, None) => write!(f, "exited with unknown status"),
        }
    }
}

/// Output and lifecycle notifications from the supervised process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Stdout { run: RunId, line: String },
    Stderr { run: RunId, line: String },
    Exited { run: RunId, exit: ExitInfo },
}

impl ProcessEvent {
    pub fn run(&self) -> RunId {
        match self {
            Self::Stdout { run, .. } | Self::Stderr { run, .. } | Self::Exited { run, .. } => *run,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Outcome of an orphan sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Matching processes found
    pub found: usize,
    /// Processes that are gone afterwards (including ones that died on
    /// their own)
    pub terminated: usize,
    /// Processes still alive after SIGKILL
    pub failed: usize,
}

// ============================================================================
// Supervisor
// ============================================================================

struct RunningProcess {
    run: RunId,
    pid: Option<u32>,
    /// Dropping or firing this makes the waiter terminate the child
    stop_tx: Option<oneshot::Sender<()>>,
    /// Fires once the child has been reaped
    exited_rx: oneshot::Receiver<()>,
}

pub struct ProcessSupervisor {
    events: mpsc::Sender<ProcessEvent>,
    process_name: String,
    kill_grace: Duration,
    next_run: u64,
    current: Option<RunningProcess>,
    dropped_stdout: Arc<AtomicU64>,
}

impl ProcessSupervisor {
    /// `process_name` is what [`cleanup`](Self::cleanup) matches orphans
    /// against.
    pub fn new(events: mpsc::Sender<ProcessEvent>, process_name: impl Into<String>, kill_grace: Duration) -> Self {
        Self {
            events,
            process_name: process_name.into(),
            kill_grace,
            next_run: 0,
            current: None,
            dropped_stdout: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn current_run(&self) -> Option<RunId> {
        self.current.as_ref().map(|p| p.run)
    }

    pub fn current_pid(&self) -> Option<u32> {
        self.current.as_ref().and_then(|p| p.pid)
    }

    pub fn is_running(&self) -> bool {
        self.current.is_some()
    }

    /// Stdout lines dropped because the event queue was full.
    pub fn dropped_stdout(&self) -> u64 {
        self.dropped_stdout.load(Ordering::Relaxed)
    }

    /// Spawns `program` with an argument vector. Any current process is
    /// killed first.
    pub async fn spawn(&mut self, program: &str, args: &[String]) -> Result<RunId, SupervisorError> {
        self.kill().await;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                program: program.to_string(),
                source,
            })?;

        self.next_run += 1;
        let run = RunId(self.next_run);
        let pid = child.id();

        let stdout_task = child.stdout.take().map(|out| {
            spawn_stdout_reader(run, out, self.events.clone(), Arc::clone(&self.dropped_stdout))
        });
        let stderr_task = child
            .stderr
            .take()
            .map(|err| spawn_stderr_reader(run, err, self.events.clone()));

        let (stop_tx, stop_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = oneshot::channel();

        tokio::spawn(wait_for_exit(
            run,
            child,
            stop_rx,
            exited_tx,
            [stdout_task, stderr_task],
            self.events.clone(),
            self.kill_grace,
        ));

        info!(%run, pid = ?pid, program, ?args, "Capture process spawned");

        self.current = Some(RunningProcess {
            run,
            pid,
            stop_tx: Some(stop_tx),
            exited_rx,
        });

        Ok(run)
    }

    /// Forgets the current process after its exit event was observed.
    ///
    /// Returns false if `run` is not the current process.
    pub fn mark_exited(&mut self, run: RunId) -> bool {
        if self.current_run() == Some(run) {
            self.current = None;
            true
        } else {
            false
        }
    }

    /// Terminates the current process: SIGTERM, then SIGKILL after the
    /// grace window. Returns the run that was stopped.
    ///
    /// Its exit event is still delivered; the caller should treat it as
    /// stale.
    pub async fn kill(&mut self) -> Option<RunId> {
        let mut process = self.current.take()?;

        if let Some(stop_tx) = process.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        let wait = self.kill_grace + KILL_WAIT_SLACK;
        if timeout(wait, &mut process.exited_rx).await.is_err() {
            warn!(run = %process.run, pid = ?process.pid, "Capture process did not confirm exit");
        } else {
            debug!(run = %process.run, "Capture process stopped");
        }

        Some(process.run)
    }

    /// Terminates stray processes named like the capture program that are
    /// not the tracked one. Processes that are already gone count as
    /// terminated.
    pub async fn cleanup(&self) -> CleanupReport {
        let name = self.process_name.clone();
        let mut exclude = vec![std::process::id()];
        exclude.extend(self.current_pid());

        match tokio::task::spawn_blocking(move || terminate_orphans(&name, &exclude)).await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "Orphan cleanup task failed");
                CleanupReport::default()
            }
        }
    }
}

// ============================================================================
// Tasks
// ============================================================================

fn spawn_stdout_reader<R>(
    run: RunId,
    stream: R,
    events: mpsc::Sender<ProcessEvent>,
    dropped: Arc<AtomicU64>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();

        while let Some(line) = read_line_lossy(&mut reader, &mut buf).await {
            match events.try_send(ProcessEvent::Stdout { run, line }) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }
    })
}

fn spawn_stderr_reader<R>(run: RunId, stream: R, events: mpsc::Sender<ProcessEvent>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();

        while let Some(line) = read_line_lossy(&mut reader, &mut buf).await {
            if events.send(ProcessEvent::Stderr { run, line }).await.is_err() {
                break;
            }
        }
    })
}

/// Reads one `\n`-terminated line, decoding invalid UTF-8 lossily.
/// Returns `None` at EOF or on a read error.
async fn read_line_lossy<R>(reader: &mut BufReader<R>, buf: &mut Vec<u8>) -> Option<String>
where
    R: AsyncRead + Unpin,
{
    buf.clear();
    match reader.read_until(b'\n', buf).await {
        Ok(0) => None,
        Ok(_) => {
            let line = String::from_utf8_lossy(buf);
            Some(line.trim_end_matches(['\r', '\n']).to_string())
        }
        Err(e) => {
            debug!(error = %e, "Capture output read failed");
            None
        }
    }
}

async fn wait_for_exit(
    run: RunId,
    mut child: Child,
    stop_rx: oneshot::Receiver<()>,
    exited_tx: oneshot::Sender<()>,
    readers: [Option<JoinHandle<()>>; 2],
    events: mpsc::Sender<ProcessEvent>,
    kill_grace: Duration,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = stop_rx => None,
    };
    let outcome = match exited {
        Some(status) => status,
        None => terminate(&mut child, kill_grace).await,
    };

    let _ = exited_tx.send(());

    let mut readers: Vec<JoinHandle<()>> = readers.into_iter().flatten().collect();
    let drain = async {
        for reader in readers.iter_mut() {
            let _ = reader.await;
        }
    };
    if timeout(READER_DRAIN_TIMEOUT, drain).await.is_err() {
        debug!(%run, "Output readers still open after exit, aborting");
        for reader in &readers {
            reader.abort();
        }
    }

    let exit = match outcome {
        Ok(status) => ExitInfo::from_status(status),
        Err(e) => {
            warn!(%run, error = %e, "Failed to collect capture process status");
            ExitInfo::unknown()
        }
    };

    debug!(%run, %exit, "Capture process exited");
    let _ = events.send(ProcessEvent::Exited { run, exit }).await;
}

async fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: kill(2) on a child we spawned and have not reaped yet
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }

    match timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(pid = ?child.id(), "Capture process ignored SIGTERM, sending SIGKILL");
            child.kill().await?;
            child.wait().await
        }
    }
}

// ============================================================================
// Orphan Cleanup
// ============================================================================

fn terminate_orphans(name: &str, exclude: &[u32]) -> CleanupReport {
    let mut system = System::new();
    system.refresh_all();

    let target = OsStr::new(name);
    let orphans: Vec<Pid> = system
        .processes()
        .iter()
        .filter(|(pid, _)| !exclude.contains(&pid.as_u32()))
        .filter(|(_, process)| {
            process.name() == target
                || process
                    .exe()
                    .and_then(|exe| exe.file_name())
                    .is_some_and(|file| file == target)
        })
        .map(|(pid, _)| *pid)
        .collect();

    let mut report = CleanupReport {
        found: orphans.len(),
        ..CleanupReport::default()
    };
    if orphans.is_empty() {
        return report;
    }

    for pid in &orphans {
        if let Some(process) = system.process(*pid) {
            warn!(pid = pid.as_u32(), name, "Terminating orphaned capture process");
            if process.kill_with(Signal::Term).is_none() {
                process.kill();
            }
        }
    }

    std::thread::sleep(CLEANUP_GRACE);
    system.refresh_all();

    for pid in &orphans {
        match system.process(*pid) {
            None => report.terminated += 1,
            Some(process) => {
                process.kill();
                report.failed += 1;
            }
        }
    }

    if report.failed > 0 {
        // Give SIGKILL a moment, then recount
        std::thread::sleep(CLEANUP_GRACE);
        system.refresh_all();
        let still_alive = orphans.iter().filter(|pid| system.process(**pid).is_some()).count();
        report.terminated = report.found - still_alive;
        report.failed = still_alive;
    }

    info!(
        name,
        found = report.found,
        terminated = report.terminated,
        failed = report.failed,
        "Orphan cleanup finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor(name: &str) -> (ProcessSupervisor, mpsc::Receiver<ProcessEvent>) {
        let (tx, rx) = mpsc::channel(64);
        (
            ProcessSupervisor::new(tx, name, Duration::from_millis(500)),
            rx,
        )
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".into(), script.into(), "mock-capture".into()]
    }

    #[tokio::test]
    async fn test_output_then_exit_in_order() {
        let (mut sup, mut rx) = supervisor("rfmux-test-none");
        let run = sup
            .spawn("sh", &sh("echo out; echo err >&2; exit 3"))
            .await
            .unwrap();

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        loop {
            match rx.recv().await.unwrap() {
                ProcessEvent::Stdout { line, .. } => stdout.push(line),
                ProcessEvent::Stderr { line, .. } => stderr.push(line),
                ProcessEvent::Exited { run: exited, exit } => {
                    assert_eq!(exited, run);
                    assert_eq!(exit.code, Some(3));
                    break;
                }
            }
        }
        assert_eq!(stdout, vec!["out"]);
        assert_eq!(stderr, vec!["err"]);
    }

    #[tokio::test]
    async fn test_kill_escalates_to_sigkill() {
        let (mut sup, mut rx) = supervisor("rfmux-test-none");
        let run = sup
            .spawn("sh", &sh("trap '' TERM; echo ready; while :; do sleep 1; done"))
            .await
            .unwrap();

        assert!(matches!(rx.recv().await, Some(ProcessEvent::Stdout { .. })));
        assert_eq!(sup.kill().await, Some(run));
        assert!(!sup.is_running());

        loop {
            if let Some(ProcessEvent::Exited { exit, .. }) = rx.recv().await {
                assert_eq!(exit.signal, Some(libc::SIGKILL));
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let (mut sup, _rx) = supervisor("rfmux-test-none");
        let result = sup.spawn("/nonexistent/rfmux-capture", &[]).await;
        assert!(matches!(result, Err(SupervisorError::Spawn { .. })));
        assert!(sup.current_run().is_none());
    }

    #[tokio::test]
    async fn test_run_ids_increase() {
        let (mut sup, _rx) = supervisor("rfmux-test-none");
        let first = sup.spawn("sh", &sh("exec sleep 5")).await.unwrap();
        let second = sup.spawn("sh", &sh("exec sleep 5")).await.unwrap();

        assert!(second > first);
        assert_eq!(sup.current_run(), Some(second));
        sup.kill().await;
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_lossy() {
        let (mut sup, mut rx) = supervisor("rfmux-test-none");
        sup.spawn("sh", &sh("printf 'a\\377b\\n'")).await.unwrap();

        match rx.recv().await {
            Some(ProcessEvent::Stdout { line, .. }) => assert_eq!(line, "a\u{FFFD}b"),
            other => panic!("Expected stdout line, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cleanup_without_orphans() {
        let (sup, _rx) = supervisor("rfmux-no-such-process");
        assert_eq!(sup.cleanup().await, CleanupReport::default());
    }

    #[test]
    fn test_exit_info_display() {
        let exit = ExitInfo {
            code: Some(1),
            signal: None,
        };
        assert_eq!(exit.to_string(), "exited with code 1");
        let exit = ExitInfo {
            code: None,
            signal: Some(9),
        };
        assert_eq!(exit.to_string(), "killed by signal 9");
    }
}
