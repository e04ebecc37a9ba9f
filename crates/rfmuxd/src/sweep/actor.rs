//! Sweep actor - owns the capture session and its health state machine.
//!
//! One task owns the supervisor, cycler, buffer and health tracker, so
//! every state transition is serialised without locks. Besides commands
//! the actor selects over three internal sources:
//!
//! - process events, tagged with a [`RunId`]
//! - timer messages, tagged with a session id
//! - lease events, used to notice a force-released SDR
//!
//! Commands get priority. Events from a replaced process or an ended
//! session are discarded.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Reply send failures are ignored (the caller went away)
//! - Lease manager failures degrade to warnings; stop always succeeds

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use rfmux_core::{
    Device, FrequencyTarget, OwnerId, ProcessHealth, SweepEvent, SweepState, SweepStatus,
};

use super::buffer::CaptureBuffer;
use super::commands::{EmergencyStopReport, SweepCommand, SweepError, TimerMessage, TimerSignal};
use super::cycler::FrequencyCycler;
use super::hackrf;
use super::health::{HealthClassifier, HealthTracker};
use super::schedule::ScheduledTask;
use super::supervisor::{CleanupReport, ExitInfo, ProcessEvent, ProcessSupervisor, RunId};
use crate::config::SweepConfig;
use crate::events::EventBridge;
use crate::lease::{LeaseEvent, LeaseGuard, LeaseHandle};

/// Process event queue depth. Stdout is dropped when full.
const PROCESS_EVENT_BUFFER: usize = 256;
const TIMER_BUFFER: usize = 32;

/// State that exists only while a sweep is active.
struct Session {
    id: u64,
    lease: LeaseGuard,
    dwell_timer: Option<ScheduledTask>,
    startup_timer: Option<ScheduledTask>,
    respawn_timer: Option<ScheduledTask>,
    health_timer: ScheduledTask,
    /// Most recent transient stderr line, attached to the next exit reason
    last_stderr: Option<String>,
    process_started_at: Instant,
    last_data_at: Option<Instant>,
}

impl Session {
    fn armed_timers(&self) -> usize {
        [
            self.dwell_timer.as_ref(),
            self.startup_timer.as_ref(),
            self.respawn_timer.as_ref(),
            Some(&self.health_timer),
        ]
        .into_iter()
        .flatten()
        .filter(|task| !task.is_finished())
        .count()
    }
}

/// The sweep actor.
pub struct SweepActor {
    receiver: mpsc::Receiver<SweepCommand>,

    config: SweepConfig,
    owner: OwnerId,

    leases: LeaseHandle,
    /// `None` once the lease manager's event channel has closed
    lease_events: Option<broadcast::Receiver<LeaseEvent>>,

    bridge: EventBridge,

    supervisor: ProcessSupervisor,
    process_rx: mpsc::Receiver<ProcessEvent>,

    timer_tx: mpsc::Sender<TimerMessage>,
    timer_rx: mpsc::Receiver<TimerMessage>,

    classifier: HealthClassifier,
    health: HealthTracker,
    cycler: FrequencyCycler,
    buffer: CaptureBuffer,

    session: Option<Session>,
    next_session: u64,
}

impl SweepActor {
    pub fn new(
        receiver: mpsc::Receiver<SweepCommand>,
        config: SweepConfig,
        leases: LeaseHandle,
        bridge: EventBridge,
    ) -> Self {
        let (process_tx, process_rx) = mpsc::channel(PROCESS_EVENT_BUFFER);
        let (timer_tx, timer_rx) = mpsc::channel(TIMER_BUFFER);

        let supervisor = ProcessSupervisor::new(
            process_tx,
            config.capture.process_name(),
            config.kill_grace(),
        );

        Self {
            receiver,
            owner: config.owner(),
            lease_events: Some(leases.subscribe()),
            leases,
            bridge,
            supervisor,
            process_rx,
            timer_tx,
            timer_rx,
            classifier: HealthClassifier::with_default_rules(),
            health: HealthTracker::new(),
            cycler: FrequencyCycler::new(),
            buffer: CaptureBuffer::new(config.buffer_capacity),
            session: None,
            next_session: 0,
            config,
        }
    }

    /// Runs the actor until every handle is dropped, then tears down any
    /// active session.
    pub async fn run(mut self) {
        info!(
            owner = %self.owner,
            program = %self.config.capture.program,
            "Sweep engine starting"
        );

        self.reset_baseline().await;

        loop {
            tokio::select! {
                biased;

                cmd = self.receiver.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },

                Some(event) = self.process_rx.recv() => {
                    self.handle_process_event(event).await;
                }

                Some(msg) = self.timer_rx.recv() => {
                    self.handle_timer(msg).await;
                }

                event = next_lease_event(&mut self.lease_events) => {
                    self.handle_lease_event(event).await;
                }
            }
        }

        self.teardown(false).await;
        info!("Sweep engine stopped");
    }

    async fn handle_command(&mut self, cmd: SweepCommand) {
        match cmd {
            SweepCommand::Start {
                targets,
                dwell,
                respond_to,
            } => {
                let result = self.handle_start(targets, dwell).await;
                if let Err(e) = &result {
                    warn!(error = %e, "Sweep start rejected");
                    self.emit(SweepEvent::error(e.to_string(), false));
                }
                let _ = respond_to.send(result);
            }
            SweepCommand::Stop { respond_to } => {
                let status = self.handle_stop().await;
                let _ = respond_to.send(status);
            }
            SweepCommand::EmergencyStop { respond_to } => {
                let report = self.handle_emergency_stop().await;
                let _ = respond_to.send(report);
            }
            SweepCommand::Status { respond_to } => {
                let _ = respond_to.send(self.status());
            }
            SweepCommand::Drain { limit, respond_to } => {
                let _ = respond_to.send(self.buffer.drain(limit));
            }
        }
    }

    // ========================================================================
    // Command Handlers
    // ========================================================================

    async fn handle_start(
        &mut self,
        targets: Vec<FrequencyTarget>,
        dwell: std::time::Duration,
    ) -> Result<SweepStatus, SweepError> {
        let state = self.health.state();
        if self.session.is_some() || state.is_active() {
            return Err(SweepError::AlreadyActive(state));
        }

        self.cycler.configure(targets, dwell);
        let first = match self.cycler.start() {
            Ok(target) => target,
            Err(e) => {
                self.cycler.reset();
                return Err(e.into());
            }
        };

        let lease = match self
            .leases
            .acquire_guard(self.owner.clone(), Device::Sdr, None)
            .await
        {
            Ok(lease) => lease,
            Err(e) => {
                self.cycler.reset();
                return Err(e.into());
            }
        };

        self.health.begin_start();
        self.buffer.clear();

        if let Err(reason) = self.spawn_capture(&first).await {
            self.cycler.reset();
            if let Err(e) = lease.release().await {
                warn!(error = %e, "Failed to release SDR lease after spawn failure");
            }
            self.health.fail(reason.clone());
            self.emit_status();
            return Err(SweepError::Spawn(reason));
        }

        self.next_session += 1;
        let id = self.next_session;

        let startup_timer = ScheduledTask::once(
            self.config.startup_grace(),
            self.timer_tx.clone(),
            TimerMessage {
                session: id,
                signal: TimerSignal::StartupGrace,
            },
        );
        let health_timer = ScheduledTask::repeating(
            self.config.health_check_interval(),
            self.timer_tx.clone(),
            move || TimerMessage {
                session: id,
                signal: TimerSignal::HealthCheck,
            },
        );
        let dwell_timer = (self.cycler.len() > 1).then(|| {
            ScheduledTask::repeating(dwell, self.timer_tx.clone(), move || TimerMessage {
                session: id,
                signal: TimerSignal::Dwell,
            })
        });

        self.session = Some(Session {
            id,
            lease,
            dwell_timer,
            startup_timer: Some(startup_timer),
            respawn_timer: None,
            health_timer,
            last_stderr: None,
            process_started_at: Instant::now(),
            last_data_at: None,
        });

        info!(
            session = id,
            targets = self.cycler.len(),
            dwell_ms = dwell.as_millis() as u64,
            first_mhz = first.mhz(),
            "Sweep started"
        );

        self.emit_status();
        Ok(self.status())
    }

    async fn handle_stop(&mut self) -> SweepStatus {
        self.stop_session(false).await.0
    }

    async fn handle_emergency_stop(&mut self) -> EmergencyStopReport {
        let (status, report) = self.stop_session(true).await;

        warn!(
            found = report.found,
            terminated = report.terminated,
            failed = report.failed,
            "Emergency stop"
        );

        EmergencyStopReport {
            status,
            orphans_terminated: report.terminated,
        }
    }

    /// Tears the session down and returns to `Idle`.
    async fn stop_session(&mut self, reap_orphans: bool) -> (SweepStatus, CleanupReport) {
        let previous = self.health.state();

        let report = self.teardown(reap_orphans).await;
        self.health.reset();

        if previous != SweepState::Idle {
            info!(from = %previous, "Sweep stopped");
            self.emit_status();
        }

        (self.status(), report)
    }

    fn status(&self) -> SweepStatus {
        SweepStatus {
            health: self.health.status().clone(),
            cycle: self.cycler.snapshot(),
            buffered_lines: self.buffer.len(),
            lease_owner: self.session.as_ref().map(|s| s.lease.owner().clone()),
        }
    }

    // ========================================================================
    // Process Events
    // ========================================================================

    async fn handle_process_event(&mut self, event: ProcessEvent) {
        if self.supervisor.current_run() != Some(event.run()) {
            trace!(run = %event.run(), "Discarding event from replaced capture process");
            return;
        }

        match event {
            ProcessEvent::Stdout { line, .. } => self.handle_stdout(&line),
            ProcessEvent::Stderr { line, .. } => self.handle_stderr(&line).await,
            ProcessEvent::Exited { run, exit } => self.handle_exit(run, exit).await,
        }
    }

    fn handle_stdout(&mut self, raw: &str) {
        let Some(line) = hackrf::parse_line(raw) else {
            trace!(line = raw, "Ignoring non-data capture output");
            return;
        };
        let Some(session) = self.session.as_mut() else {
            return;
        };

        session.last_data_at = Some(Instant::now());
        self.health.record_data(Utc::now());
        self.buffer.push(line);

        if self.health.state() == SweepState::Starting && self.health.mark_running() {
            self.emit_status();
        }

        self.emit(SweepEvent::SweepData {
            line,
            target: self.cycler.current_target(),
        });
    }

    async fn handle_stderr(&mut self, line: &str) {
        let classification = self.classifier.classify_line(line);

        if classification.is_fatal() {
            error!(reason = %classification.reason, "Fatal capture fault");
            self.fail(classification.reason).await;
            return;
        }

        debug!(line, "Capture stderr");
        if let Some(session) = self.session.as_mut() {
            session.last_stderr = Some(classification.reason);
        }
    }

    async fn handle_exit(&mut self, run: RunId, exit: ExitInfo) {
        self.supervisor.mark_exited(run);

        let Some(session) = self.session.as_ref() else {
            return;
        };

        let classification = self.classifier.classify_exit(&exit);
        if classification.is_fatal() {
            error!(%run, reason = %classification.reason, "Capture process cannot run");
            self.fail(classification.reason).await;
            return;
        }

        let reason = match &session.last_stderr {
            Some(stderr) => format!("{} ({stderr})", classification.reason),
            None => classification.reason,
        };
        self.recover(reason).await;
    }

    // ========================================================================
    // Timers
    // ========================================================================

    async fn handle_timer(&mut self, msg: TimerMessage) {
        match &self.session {
            Some(session) if session.id == msg.session => {}
            _ => {
                trace!(session = msg.session, signal = ?msg.signal, "Discarding stale timer");
                return;
            }
        }

        match msg.signal {
            TimerSignal::StartupGrace => self.handle_startup_grace(),
            TimerSignal::HealthCheck => self.handle_health_check().await,
            TimerSignal::Respawn => self.handle_respawn().await,
            TimerSignal::Dwell => self.handle_dwell().await,
        }
    }

    fn handle_startup_grace(&mut self) {
        if self.health.state() == SweepState::Starting
            && self.supervisor.is_running()
            && self.health.mark_running()
        {
            debug!("Capture process survived startup grace");
            self.emit_status();
        }
    }

    async fn handle_health_check(&mut self) {
        if self.health.state() != SweepState::Running {
            return;
        }
        let Some(session) = self.session.as_ref() else {
            return;
        };

        let silent_for = session
            .last_data_at
            .unwrap_or(session.process_started_at)
            .elapsed();
        if silent_for < self.config.no_data_timeout() {
            return;
        }

        warn!(silent_ms = silent_for.as_millis() as u64, "Capture process unresponsive");
        self.health.set_process_health(ProcessHealth::Unresponsive);
        self.recover(format!("no capture data for {}s", silent_for.as_secs()))
            .await;
    }

    async fn handle_respawn(&mut self) {
        if self.health.state() != SweepState::Recovering {
            return;
        }
        let Some(target) = self.cycler.current_target() else {
            self.fail("no frequency target to resume".to_string()).await;
            return;
        };

        match self.spawn_capture(&target).await {
            Ok(run) => {
                if let Some(session) = self.session.as_mut() {
                    session.respawn_timer = None;
                    session.last_stderr = None;
                    session.process_started_at = Instant::now();
                    session.last_data_at = None;
                }
                self.health.mark_recovered();
                info!(%run, attempt = self.health.attempts(), "Capture process restarted");
                self.emit_status();
            }
            Err(reason) => self.fail(reason).await,
        }
    }

    async fn handle_dwell(&mut self) {
        let Some(target) = self.cycler.tick() else {
            return;
        };

        if matches!(self.health.state(), SweepState::Starting | SweepState::Running) {
            debug!(target_mhz = target.mhz(), "Retuning capture process");
            if let Err(reason) = self.spawn_capture(&target).await {
                self.fail(reason).await;
                return;
            }
            if let Some(session) = self.session.as_mut() {
                session.last_stderr = None;
                session.process_started_at = Instant::now();
                session.last_data_at = None;
            }
        }

        self.emit_status();
    }

    // ========================================================================
    // Lease Events
    // ========================================================================

    /// `None` means events were missed and the lease must be re-checked.
    async fn handle_lease_event(&mut self, event: Option<LeaseEvent>) {
        let Some(session) = self.session.as_ref() else {
            return;
        };

        let affects_us = match &event {
            Some(LeaseEvent::Released { device, owner, .. }) => {
                *device == Device::Sdr && owner == session.lease.owner()
            }
            Some(LeaseEvent::Acquired { .. }) => false,
            None => true,
        };
        if !affects_us {
            return;
        }

        // A release from an earlier session can arrive late
        if self.leases.current_owner(Device::Sdr).await.as_ref() == Some(&self.owner) {
            return;
        }

        self.handle_lease_revoked().await;
    }

    async fn handle_lease_revoked(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        warn!(session = session.id, "SDR lease revoked, stopping sweep");

        session.lease.forget();
        self.supervisor.kill().await;
        self.cycler.reset();
        self.buffer.clear();
        self.health.reset();

        self.emit_status();
        self.emit(SweepEvent::error(
            "SDR lease was force-released; sweep stopped",
            false,
        ));
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    async fn spawn_capture(&mut self, target: &FrequencyTarget) -> Result<RunId, String> {
        let args = hackrf::build_args(&self.config.capture, target);
        self.supervisor
            .spawn(&self.config.capture.program, &args)
            .await
            .map_err(|e| e.to_string())
    }

    /// Restarts after a transient fault, or fails once the budget is spent.
    async fn recover(&mut self, reason: String) {
        if !matches!(
            self.health.state(),
            SweepState::Starting | SweepState::Running
        ) {
            return;
        }

        self.supervisor.kill().await;
        let report = self.supervisor.cleanup().await;
        if report.found > 0 {
            warn!(terminated = report.terminated, "Removed stray capture processes");
        }

        let max = self.config.max_recovery_attempts;
        let used = self.health.attempts();
        if used >= max {
            self.fail(format!(
                "recovery budget exhausted after {used} attempts: {reason}"
            ))
            .await;
            return;
        }

        let Some(attempt) = self.health.begin_recovery(reason.clone()) else {
            return;
        };
        let delay = self.config.backoff.delay(attempt);

        warn!(
            attempt,
            max,
            delay_ms = delay.as_millis() as u64,
            reason = %reason,
            "Capture fault, scheduling restart"
        );

        if let Some(session) = self.session.as_mut() {
            session.startup_timer = None;
            session.respawn_timer = Some(ScheduledTask::once(
                delay,
                self.timer_tx.clone(),
                TimerMessage {
                    session: session.id,
                    signal: TimerSignal::Respawn,
                },
            ));
        }

        self.emit_status();
        self.emit(SweepEvent::error(
            format!("capture fault (attempt {attempt}/{max}): {reason}"),
            true,
        ));
    }

    /// Ends the session in `Error`.
    async fn fail(&mut self, reason: String) {
        self.teardown(false).await;
        if self.health.fail(reason.clone()) {
            error!(reason = %reason, "Sweep failed");
        }
        self.emit_status();
        self.emit(SweepEvent::error(reason, false));
    }

    /// Kills the process, cancels timers, resets the cycler, clears the
    /// buffer and releases the lease. Health is left to the caller.
    ///
    /// With `reap_orphans`, stray capture processes are terminated before
    /// the lease goes, so nothing started by the next SDR holder is hit.
    async fn teardown(&mut self, reap_orphans: bool) -> CleanupReport {
        let session = self.session.take();
        self.supervisor.kill().await;
        let report = if reap_orphans {
            self.supervisor.cleanup().await
        } else {
            CleanupReport::default()
        };
        self.cycler.reset();
        self.buffer.clear();

        if let Some(session) = session {
            let id = session.id;
            debug!(session = id, timers = session.armed_timers(), "Tearing down sweep session");
            let Session { lease, .. } = session;
            match lease.release().await {
                Ok(true) => debug!(session = id, "SDR lease released"),
                Ok(false) => debug!(session = id, "SDR lease was already gone"),
                Err(e) => warn!(session = id, error = %e, "Failed to release SDR lease"),
            }
        }

        report
    }

    /// Baseline reset run once at engine start.
    async fn reset_baseline(&mut self) {
        let report = self.supervisor.cleanup().await;
        if report.found > 0 {
            warn!(
                found = report.found,
                terminated = report.terminated,
                "Terminated orphaned capture processes"
            );
        }

        match self.leases.release(self.owner.clone(), Device::Sdr).await {
            Ok(true) => info!(owner = %self.owner, "Released stale SDR lease"),
            Ok(false) => {}
            Err(e) => debug!(error = %e, "Could not clear SDR lease at startup"),
        }

        self.cycler.reset();
        self.buffer.clear();
        self.health.reset();
    }

    fn emit(&self, event: SweepEvent) {
        self.bridge.emit(&event);
    }

    fn emit_status(&self) {
        self.emit(SweepEvent::status(self.status()));
    }

    #[cfg(test)]
    fn session_id(&self) -> Option<u64> {
        self.session.as_ref().map(|s| s.id)
    }

    #[cfg(test)]
    fn has_dwell_timer(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.dwell_timer.is_some())
    }

    #[cfg(test)]
    fn has_respawn_timer(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.respawn_timer.is_some())
    }
}

/// Next lease event. Pends forever once the channel has closed.
///
/// A lagged receiver yields `None` so the caller re-checks the lease.
async fn next_lease_event(
    events: &mut Option<broadcast::Receiver<LeaseEvent>>,
) -> Option<LeaseEvent> {
    let Some(rx) = events.as_mut() else {
        return std::future::pending().await;
    };

    match rx.recv().await {
        Ok(event) => Some(event),
        Err(broadcast::error::RecvError::Lagged(missed)) => {
            warn!(missed, "Sweep engine lagged behind lease events");
            None
        }
        Err(broadcast::error::RecvError::Closed) => {
            debug!("Lease event channel closed");
            *events = None;
            std::future::pending().await
        }
    }
}
