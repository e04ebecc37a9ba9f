//! Parsed capture output.

use serde::{Deserialize, Serialize};

/// One measurement parsed from the capture process output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CaptureLine {
    /// Frequency of the strongest bin in the sweep row
    pub frequency_hz: u64,
    /// Power of that bin
    pub power_dbm: f64,
    /// Capture time, milliseconds since the Unix epoch
    pub timestamp_ms: i64,
}

impl CaptureLine {
    pub fn new(frequency_hz: u64, power_dbm: f64, timestamp_ms: i64) -> Self {
        Self {
            frequency_hz,
            power_dbm,
            timestamp_ms,
        }
    }

    /// Returns the frequency in MHz.
    pub fn mhz(&self) -> f64 {
        self.frequency_hz as f64 / 1e6
    }
}
