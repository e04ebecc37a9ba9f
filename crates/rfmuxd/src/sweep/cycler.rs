//! Round-robin over the configured frequency targets.
//!
//! The cycler only holds position; the sweep actor owns the dwell timer
//! and calls [`FrequencyCycler::tick`] when it fires.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rfmux_core::{CycleSnapshot, DomainError, DomainResult, FrequencyTarget};

#[derive(Debug, Default)]
pub struct FrequencyCycler {
    targets: Vec<FrequencyTarget>,
    dwell: Duration,
    current_index: usize,
    cycle_started_at: Option<DateTime<Utc>>,
}

impl FrequencyCycler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores targets and dwell. Problems are reported by [`start`](Self::start).
    pub fn configure(&mut self, targets: Vec<FrequencyTarget>, dwell: Duration) {
        self.targets = targets;
        self.dwell = dwell;
        self.current_index = 0;
        self.cycle_started_at = None;
    }

    /// Resets to the first target and marks the cycle as started.
    ///
    /// # Errors
    ///
    /// `EmptyTargets` without targets, `InvalidDwell` for a zero dwell.
    pub fn start(&mut self) -> DomainResult<FrequencyTarget> {
        let first = self.targets.first().copied().ok_or(DomainError::EmptyTargets)?;
        if self.dwell.is_zero() {
            return Err(DomainError::dwell(0, "dwell must be positive"));
        }
        self.current_index = 0;
        self.cycle_started_at = Some(Utc::now());
        Ok(first)
    }

    /// Advances to the next target, wrapping around. Returns the new target.
    pub fn tick(&mut self) -> Option<FrequencyTarget> {
        if self.targets.is_empty() || self.cycle_started_at.is_none() {
            return None;
        }
        self.current_index = (self.current_index + 1) % self.targets.len();
        self.targets.get(self.current_index).copied()
    }

    pub fn current_target(&self) -> Option<FrequencyTarget> {
        self.cycle_started_at?;
        self.targets.get(self.current_index).copied()
    }

    /// Clears targets and position.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn dwell(&self) -> Duration {
        self.dwell
    }

    pub fn snapshot(&self) -> CycleSnapshot {
        CycleSnapshot {
            current_index: self.current_index,
            dwell_ms: u64::try_from(self.dwell.as_millis()).unwrap_or(u64::MAX),
            cycle_started_at: self.cycle_started_at,
            target_count: self.targets.len(),
            current_target: self.current_target(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rfmux_core::FrequencyUnit;

    fn targets(mhz: &[f64]) -> Vec<FrequencyTarget> {
        mhz.iter()
            .map(|v| FrequencyTarget::new(*v, FrequencyUnit::MHz).unwrap())
            .collect()
    }

    #[test]
    fn test_round_robin_with_wraparound() {
        let mut cycler = FrequencyCycler::new();
        cycler.configure(targets(&[100.0, 200.0, 300.0]), Duration::from_secs(1));
        assert_eq!(cycler.start().unwrap().mhz(), 100.0);

        let visited: Vec<f64> = (0..5).filter_map(|_| cycler.tick()).map(|t| t.mhz()).collect();
        assert_eq!(visited, vec![200.0, 300.0, 100.0, 200.0, 300.0]);
        assert_eq!(cycler.snapshot().current_index, 2);
    }

    #[test]
    fn test_start_resets_index() {
        let mut cycler = FrequencyCycler::new();
        cycler.configure(targets(&[100.0, 200.0]), Duration::from_secs(1));
        cycler.start().unwrap();
        cycler.tick();

        cycler.start().unwrap();
        assert_eq!(cycler.snapshot().current_index, 0);
    }

    #[test]
    fn test_empty_targets_fail_at_start() {
        let mut cycler = FrequencyCycler::new();
        cycler.configure(Vec::new(), Duration::from_secs(1));
        assert_eq!(cycler.start(), Err(DomainError::EmptyTargets));
        assert!(cycler.tick().is_none());
    }

    #[test]
    fn test_zero_dwell_fails_at_start() {
        let mut cycler = FrequencyCycler::new();
        cycler.configure(targets(&[100.0]), Duration::ZERO);
        assert!(matches!(cycler.start(), Err(DomainError::InvalidDwell { .. })));
    }

    #[test]
    fn test_single_target_stays_put() {
        let mut cycler = FrequencyCycler::new();
        cycler.configure(targets(&[2405.0]), Duration::from_secs(10));
        cycler.start().unwrap();

        assert_eq!(cycler.tick().unwrap().mhz(), 2405.0);
        assert_eq!(cycler.snapshot().current_index, 0);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut cycler = FrequencyCycler::new();
        cycler.configure(targets(&[100.0, 200.0]), Duration::from_secs(5));
        cycler.start().unwrap();
        cycler.reset();

        let snapshot = cycler.snapshot();
        assert_eq!(snapshot.target_count, 0);
        assert_eq!(snapshot.dwell_ms, 0);
        assert!(snapshot.current_target.is_none());
        assert!(snapshot.cycle_started_at.is_none());
    }
}
