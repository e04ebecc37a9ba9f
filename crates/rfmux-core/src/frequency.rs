//! Frequency targets for SDR sweeps.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{DomainError, DomainResult};

/// Lowest centre frequency the SDR can tune (1 MHz).
pub const SDR_MIN_HZ: u64 = 1_000_000;

/// Highest centre frequency the SDR can tune (6 GHz).
pub const SDR_MAX_HZ: u64 = 6_000_000_000;

/// Unit a frequency was specified in. Retained for display only; the
/// canonical value is always stored in Hz.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FrequencyUnit {
    #[serde(rename = "Hz")]
    Hz,
    #[serde(rename = "kHz")]
    KHz,
    #[default]
    #[serde(rename = "MHz")]
    MHz,
    #[serde(rename = "GHz")]
    GHz,
}

impl FrequencyUnit {
    /// Number of Hz in one unit.
    pub fn multiplier(&self) -> f64 {
        match self {
            Self::Hz => 1.0,
            Self::KHz => 1e3,
            Self::MHz => 1e6,
            Self::GHz => 1e9,
        }
    }

    /// Returns the unit symbol.
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Hz => "Hz",
            Self::KHz => "kHz",
            Self::MHz => "MHz",
            Self::GHz => "GHz",
        }
    }
}

impl fmt::Display for FrequencyUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

/// One centre frequency the sweep dwells on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrequencyTarget {
    pub value_hz: u64,
    #[serde(default)]
    pub unit: FrequencyUnit,
}

impl FrequencyTarget {
    /// Creates a target from a value expressed in `unit`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidFrequency` for non-finite, non-positive
    /// or out-of-range values.
    pub fn new(value: f64, unit: FrequencyUnit) -> DomainResult<Self> {
        if !value.is_finite() {
            return Err(DomainError::frequency(value, "must be a finite number"));
        }
        if value <= 0.0 {
            return Err(DomainError::frequency(value, "must be positive"));
        }

        let hz = (value * unit.multiplier()).round();
        if hz < SDR_MIN_HZ as f64 || hz > SDR_MAX_HZ as f64 {
            return Err(DomainError::frequency(
                format!("{value} {unit}"),
                format!(
                    "outside tunable range {}-{} MHz",
                    SDR_MIN_HZ / 1_000_000,
                    SDR_MAX_HZ / 1_000_000
                ),
            ));
        }

        Ok(Self {
            value_hz: hz as u64,
            unit,
        })
    }

    /// Creates a target at the midpoint of a `start..=stop` range.
    ///
    /// # Errors
    ///
    /// Fails if either bound is invalid or `stop < start`.
    pub fn from_range(start: f64, stop: f64, unit: FrequencyUnit) -> DomainResult<Self> {
        if !start.is_finite() || !stop.is_finite() {
            return Err(DomainError::frequency(
                format!("{start}-{stop}"),
                "range bounds must be finite numbers",
            ));
        }
        if stop < start {
            return Err(DomainError::frequency(
                format!("{start}-{stop}"),
                "range stop must not be below start",
            ));
        }
        Self::new((start + stop) / 2.0, unit)
    }

    /// Returns the value expressed in the target's own unit.
    pub fn value(&self) -> f64 {
        self.value_hz as f64 / self.unit.multiplier()
    }

    /// Returns the value in MHz.
    pub fn mhz(&self) -> f64 {
        self.value_hz as f64 / 1e6
    }
}

impl fmt::Display for FrequencyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value(), self.unit)
    }
}
