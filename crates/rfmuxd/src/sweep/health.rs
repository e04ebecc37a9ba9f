//! Capture fault classification and the sweep health state machine.
//!
//! Classification is a table of regex rules checked in order; the first
//! match decides. Anything unmatched is transient.

use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use rfmux_core::{HealthStatus, ProcessHealth, SweepState};
use tracing::{debug, info, warn};

use super::supervisor::ExitInfo;

// ============================================================================
// Classification
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Retrying will not help; end the session
    Fatal,
    /// Worth a restart
    Transient,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub severity: Severity,
    pub reason: String,
}

impl Classification {
    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Fatal
    }
}

/// One row of the rule table.
#[derive(Debug, Clone)]
pub struct ClassifierRule {
    pattern: Regex,
    severity: Severity,
    reason: String,
}

impl ClassifierRule {
    /// Builds a case-insensitive rule.
    pub fn new(pattern: &str, severity: Severity, reason: impl Into<String>) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: RegexBuilder::new(pattern).case_insensitive(true).build()?,
            severity,
            reason: reason.into(),
        })
    }
}

/// Built-in fatal patterns for HackRF-class hardware.
const DEFAULT_FATAL_RULES: &[(&str, &str)] = &[
    (
        r"no hackrf boards found|hackrf_open\(\) failed|HACKRF_ERROR_NOT_FOUND|device not found|no such device",
        "SDR hardware not found",
    ),
    (
        r"resource busy|HACKRF_ERROR_BUSY|device busy",
        "SDR device busy",
    ),
    (
        r"permission denied|access denied|LIBUSB_ERROR_ACCESS|operation not permitted",
        "permission denied opening SDR",
    ),
    (
        r"libusb_init|LIBUSB_ERROR|usb error|usb transfer|failed to initiali[sz]e",
        "USB / initialisation failure",
    ),
];

/// Exit codes the shell reserves for "found but not executable" and
/// "not found".
const EXIT_NOT_EXECUTABLE: i32 = 126;
const EXIT_NOT_FOUND: i32 = 127;

#[derive(Debug, Clone)]
pub struct HealthClassifier {
    rules: Vec<ClassifierRule>,
}

impl HealthClassifier {
    pub fn new(rules: Vec<ClassifierRule>) -> Self {
        Self { rules }
    }

    /// Classifier loaded with the built-in fatal rules.
    pub fn with_default_rules() -> Self {
        let rules = DEFAULT_FATAL_RULES
            .iter()
            .filter_map(|(pattern, reason)| {
                ClassifierRule::new(pattern, Severity::Fatal, *reason)
                    .map_err(|e| warn!(pattern, error = %e, "Skipping invalid classifier rule"))
                    .ok()
            })
            .collect();
        Self::new(rules)
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Classifies one stderr line.
    pub fn classify_line(&self, line: &str) -> Classification {
        for rule in &self.rules {
            if rule.pattern.is_match(line) {
                return Classification {
                    severity: rule.severity,
                    reason: format!("{}: {}", rule.reason, line.trim()),
                };
            }
        }
        Classification {
            severity: Severity::Transient,
            reason: line.trim().to_string(),
        }
    }

    /// Classifies a process exit.
    pub fn classify_exit(&self, exit: &ExitInfo) -> Classification {
        match exit.code {
            Some(EXIT_NOT_EXECUTABLE) => Classification {
                severity: Severity::Fatal,
                reason: "capture executable is not runnable (exit 126)".to_string(),
            },
            Some(EXIT_NOT_FOUND) => Classification {
                severity: Severity::Fatal,
                reason: "capture executable not found (exit 127)".to_string(),
            },
            _ => Classification {
                severity: Severity::Transient,
                reason: format!("capture process {exit}"),
            },
        }
    }
}

impl Default for HealthClassifier {
    fn default() -> Self {
        Self::with_default_rules()
    }
}

// ============================================================================
// State Machine
// ============================================================================

/// Owns the engine's [`HealthStatus`] and applies only documented
/// transitions.
#[derive(Debug, Default)]
pub struct HealthTracker {
    status: HealthStatus,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> &HealthStatus {
        &self.status
    }

    pub fn state(&self) -> SweepState {
        self.status.state
    }

    pub fn attempts(&self) -> u32 {
        self.status.recovery_attempts
    }

    fn transition(&mut self, next: SweepState) -> bool {
        let current = self.status.state;
        if !current.can_transition_to(next) {
            warn!(from = %current, to = %next, "Rejected sweep state transition");
            return false;
        }
        if current != next {
            info!(from = %current, to = %next, "Sweep state changed");
        }
        self.status.state = next;
        true
    }

    /// `Idle|Error → Starting`. Clears the previous session's counters.
    pub fn begin_start(&mut self) -> bool {
        if !self.transition(SweepState::Starting) {
            return false;
        }
        self.status = HealthStatus {
            state: SweepState::Starting,
            process_health: ProcessHealth::Starting,
            ..HealthStatus::idle()
        };
        true
    }

    /// `Starting → Running`.
    pub fn mark_running(&mut self) -> bool {
        if !self.transition(SweepState::Running) {
            return false;
        }
        if self.status.process_health == ProcessHealth::Starting {
            self.status.process_health = ProcessHealth::Healthy;
        }
        true
    }

    /// `Starting|Running → Recovering`. Returns the new attempt number.
    pub fn begin_recovery(&mut self, reason: impl Into<String>) -> Option<u32> {
        if !self.transition(SweepState::Recovering) {
            return None;
        }
        self.status.recovery_attempts += 1;
        self.status.last_recovery_at = Some(Utc::now());
        self.status.last_error = Some(reason.into());
        self.status.process_health = ProcessHealth::Stopped;
        Some(self.status.recovery_attempts)
    }

    /// `Recovering → Running` once the replacement process is up.
    pub fn mark_recovered(&mut self) -> bool {
        if !self.transition(SweepState::Running) {
            return false;
        }
        self.status.process_health = ProcessHealth::Starting;
        true
    }

    /// `Starting|Running|Recovering → Error`.
    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        if !self.transition(SweepState::Error) {
            return false;
        }
        self.status.last_error = Some(reason.into());
        self.status.process_health = ProcessHealth::Stopped;
        true
    }

    /// `* → Idle` with a clean baseline.
    pub fn reset(&mut self) {
        self.transition(SweepState::Idle);
        self.status = HealthStatus::idle();
    }

    pub fn record_data(&mut self, at: DateTime<Utc>) {
        self.status.last_data_received_at = Some(at);
        if self.status.process_health != ProcessHealth::Healthy {
            debug!("Capture data flowing");
        }
        self.status.process_health = ProcessHealth::Healthy;
    }

    pub fn set_process_health(&mut self, health: ProcessHealth) {
        self.status.process_health = health;
    }
}
