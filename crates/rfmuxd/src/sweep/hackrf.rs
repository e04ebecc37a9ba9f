//! `hackrf_sweep` command line and output format.
//!
//! Output rows look like:
//!
//! ```text
//! 2024-03-01, 12:00:00.123456, 2395000000, 2400000000, 1000000.00, 20, -71.2, -69.8, -70.4, -72.0, -68.9
//! ```
//!
//! date, time, low Hz, high Hz, bin width Hz, sample count, then one dB
//! value per bin.

use chrono::{Local, NaiveDateTime, TimeZone, Utc};
use rfmux_core::{CaptureLine, FrequencyTarget};

use crate::config::CaptureConfig;

const HZ_PER_MHZ: u64 = 1_000_000;

/// Builds the argument vector for sweeping the window around `target`.
pub fn build_args(config: &CaptureConfig, target: &FrequencyTarget) -> Vec<String> {
    let half_span = config.span_hz / 2;
    let lo_mhz = target.value_hz.saturating_sub(half_span) / HZ_PER_MHZ;
    let mut hi_mhz = target.value_hz.saturating_add(half_span).div_ceil(HZ_PER_MHZ);
    if hi_mhz <= lo_mhz {
        hi_mhz = lo_mhz + 1;
    }

    let mut args = config.prefix_args.clone();
    args.extend([
        "-f".to_string(),
        format!("{lo_mhz}:{hi_mhz}"),
        "-l".to_string(),
        config.lna_gain_db.to_string(),
        "-g".to_string(),
        config.vga_gain_db.to_string(),
        "-w".to_string(),
        config.bin_width_hz.to_string(),
    ]);
    args
}

/// Parses one output row into its strongest bin.
///
/// Returns `None` for anything that is not a data row.
pub fn parse_line(line: &str) -> Option<CaptureLine> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    let [date, time, hz_low, _hz_high, bin_width, _samples, bins @ ..] = fields.as_slice() else {
        return None;
    };
    if bins.is_empty() {
        return None;
    }

    let hz_low: u64 = hz_low.parse().ok()?;
    let bin_width: f64 = bin_width.parse().ok()?;
    if !bin_width.is_finite() || bin_width <= 0.0 {
        return None;
    }

    let (peak_index, peak_db) = bins
        .iter()
        .enumerate()
        .filter_map(|(i, v)| v.parse::<f64>().ok().filter(|db| db.is_finite()).map(|db| (i, db)))
        .max_by(|a, b| a.1.total_cmp(&b.1))?;

    let offset = bin_width * (peak_index as f64 + 0.5);
    let frequency_hz = hz_low.saturating_add(offset.round() as u64);

    Some(CaptureLine::new(frequency_hz, peak_db, row_timestamp_ms(date, time)))
}

// Rows carry local wall-clock time; fall back to now when it does not parse.
fn row_timestamp_ms(date: &str, time: &str) -> i64 {
    NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .and_then(|naive| Local.from_local_datetime(&naive).single())
        .map(|dt| dt.timestamp_millis())
        .unwrap_or_else(|| Utc::now().timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rfmux_core::FrequencyUnit;

    #[test]
    fn test_args_window_around_target() {
        let target = FrequencyTarget::new(2405.0, FrequencyUnit::MHz).unwrap();
        let args = build_args(&CaptureConfig::default(), &target);

        assert_eq!(
            args,
            vec!["-f", "2395:2415", "-l", "32", "-g", "20", "-w", "500000"]
        );
    }

    #[test]
    fn test_args_keep_prefix_and_round_outwards() {
        let config = CaptureConfig {
            prefix_args: vec!["-1".into()],
            span_hz: 3_000_000,
            ..CaptureConfig::default()
        };
        let target = FrequencyTarget::new(915.5, FrequencyUnit::MHz).unwrap();
        let args = build_args(&config, &target);

        assert_eq!(args.first().map(String::as_str), Some("-1"));
        assert_eq!(args.get(2).map(String::as_str), Some("914:917"));
    }

    #[test]
    fn test_parse_picks_peak_bin() {
        let row = "2024-03-01, 12:00:00.123456, 2400000000, 2405000000, 1000000.00, 20, -71.2, -42.5, -70.4";
        let line = parse_line(row).unwrap();

        assert_eq!(line.frequency_hz, 2_401_500_000);
        assert_eq!(line.power_dbm, -42.5);
        assert!(line.timestamp_ms > 0);
    }

    #[test]
    fn test_parse_rejects_non_data() {
        assert!(parse_line("").is_none());
        assert!(parse_line("call hackrf_sample_rate_set(20.000 MHz)").is_none());
        assert!(parse_line("a, b, c, d, e, f").is_none());
        assert!(parse_line("2024-03-01, 12:00:00, x, 1, 1000, 20, -50").is_none());
        assert!(parse_line("2024-03-01, 12:00:00, 1, 1, 0, 20, -50").is_none());
    }

    #[test]
    fn test_parse_skips_unparseable_bins() {
        let row = "2024-03-01, 12:00:00, 100000000, 101000000, 500000, 10, nan, garbage, -60.0";
        let line = parse_line(row).unwrap();
        assert_eq!(line.frequency_hz, 101_250_000);
        assert_eq!(line.power_dbm, -60.0);
    }

    #[test]
    fn test_bad_timestamp_falls_back_to_now() {
        let before = Utc::now().timestamp_millis();
        let line = parse_line("yesterday, noon, 100000000, 101000000, 500000, 10, -60.0").unwrap();
        assert!(line.timestamp_ms >= before);
    }
}
