//! Parsing sweep control requests into domain values.
//!
//! Web consumers send frequencies as a mixed list of plain numbers and
//! `{start, stop}` ranges, both in MHz, plus a cycle time in seconds.

use std::time::Duration;

use rfmux_core::{DomainError, DomainResult, FrequencyTarget, FrequencyUnit};
use serde::{Deserialize, Serialize};

/// Shortest accepted dwell per frequency.
pub const MIN_CYCLE_TIME_SECS: f64 = 1.0;

/// Longest accepted dwell per frequency (one hour).
pub const MAX_CYCLE_TIME_SECS: f64 = 3600.0;

/// A frequency entry as sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawFrequency {
    /// Centre frequency in MHz
    Value(f64),
    /// Range in MHz; the sweep dwells on its midpoint
    Range { start: f64, stop: f64 },
}

impl RawFrequency {
    /// Converts to a target, interpreting numbers in `unit`.
    pub fn to_target(&self, unit: FrequencyUnit) -> DomainResult<FrequencyTarget> {
        match *self {
            Self::Value(value) => FrequencyTarget::new(value, unit),
            Self::Range { start, stop } => FrequencyTarget::from_range(start, stop, unit),
        }
    }
}

impl From<f64> for RawFrequency {
    fn from(value: f64) -> Self {
        Self::Value(value)
    }
}

/// Converts a frequency list (MHz) into ordered targets.
///
/// # Errors
///
/// `DomainError::EmptyTargets` for an empty list, or the first invalid
/// entry's error.
pub fn parse_targets(raw: &[RawFrequency]) -> DomainResult<Vec<FrequencyTarget>> {
    if raw.is_empty() {
        return Err(DomainError::EmptyTargets);
    }
    raw.iter().map(|f| f.to_target(FrequencyUnit::MHz)).collect()
}

/// Converts a cycle time in seconds into a dwell duration.
///
/// # Errors
///
/// `DomainError::InvalidDwell` when outside
/// [`MIN_CYCLE_TIME_SECS`]..=[`MAX_CYCLE_TIME_SECS`].
pub fn parse_cycle_time(cycle_time_sec: f64) -> DomainResult<Duration> {
    if !cycle_time_sec.is_finite() {
        return Err(DomainError::dwell(cycle_time_sec, "must be a finite number"));
    }
    if !(MIN_CYCLE_TIME_SECS..=MAX_CYCLE_TIME_SECS).contains(&cycle_time_sec) {
        return Err(DomainError::dwell(
            cycle_time_sec,
            format!("must be between {MIN_CYCLE_TIME_SECS} and {MAX_CYCLE_TIME_SECS} seconds"),
        ));
    }
    Ok(Duration::from_secs_f64(cycle_time_sec))
}
