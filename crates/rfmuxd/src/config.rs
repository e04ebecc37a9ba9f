//! Daemon configuration.
//!
//! Loaded from TOML with precedence: `RFMUX_CONFIG` file, then
//! `<config_dir>/rfmux/config.toml`, then built-in defaults. The socket
//! path can be overridden with `RFMUX_SOCKET`. Every field has a default,
//! so a partial file is fine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rfmux_core::{Device, DeviceRegistry, OwnerId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "RFMUX_CONFIG";

/// Environment variable overriding the socket path.
pub const SOCKET_ENV: &str = "RFMUX_SOCKET";

/// Default Unix socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/rfmux.sock";

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// Daemon Config
// ============================================================================

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub socket_path: String,

    /// Interval between `heartbeat` events on the live channel
    pub heartbeat_interval_secs: u64,

    /// Interval between dead-owner lease sweeps
    pub reaper_interval_secs: u64,

    /// Devices the lease manager arbitrates
    pub devices: Vec<Device>,

    pub sweep: SweepConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: DEFAULT_SOCKET_PATH.to_string(),
            heartbeat_interval_secs: 15,
            reaper_interval_secs: 5,
            devices: Device::ALL.to_vec(),
            sweep: SweepConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Loads configuration from the usual locations and applies
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// A file named by `RFMUX_CONFIG` must exist and parse. The default
    /// location is optional but must parse when present.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = if let Ok(path) = std::env::var(CONFIG_ENV) {
            Self::from_file(path)?
        } else {
            match default_config_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => {
                    debug!("No config file found, using defaults");
                    Self::default()
                }
            }
        };

        if let Ok(socket) = std::env::var(SOCKET_ENV) {
            config.socket_path = socket;
        }

        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        info!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    /// Parses and validates TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.socket_path.trim().is_empty() {
            return Err(ConfigError::Invalid("socket_path must not be empty".into()));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat_interval_secs must be positive".into(),
            ));
        }
        if self.reaper_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "reaper_interval_secs must be positive".into(),
            ));
        }
        if self.devices.is_empty() {
            return Err(ConfigError::Invalid("devices must not be empty".into()));
        }
        if !self.devices.contains(&Device::Sdr) {
            return Err(ConfigError::Invalid(
                "the sweep engine needs the sdr device to be arbitrated".into(),
            ));
        }
        self.sweep.validate()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn device_registry(&self) -> DeviceRegistry {
        DeviceRegistry::with_devices(self.devices.iter().copied())
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("rfmux").join("config.toml"))
}

// ============================================================================
// Sweep Config
// ============================================================================

/// Sweep engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Owner id the engine uses for the SDR lease
    pub owner_id: String,

    /// Capture lines kept in the ring buffer
    pub buffer_capacity: usize,

    /// SIGTERM → SIGKILL escalation window
    pub kill_grace_ms: u64,

    /// How long a fresh process may stay silent before it counts as started
    pub startup_grace_ms: u64,

    pub health_check_interval_ms: u64,

    /// Silence after which a running process is considered hung
    pub no_data_timeout_ms: u64,

    pub max_recovery_attempts: u32,

    pub backoff: BackoffConfig,

    pub capture: CaptureConfig,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            owner_id: "sweep".to_string(),
            buffer_capacity: 4096,
            kill_grace_ms: 2_000,
            startup_grace_ms: 3_000,
            health_check_interval_ms: 1_000,
            no_data_timeout_ms: 15_000,
            max_recovery_attempts: 3,
            backoff: BackoffConfig::default(),
            capture: CaptureConfig::default(),
        }
    }
}

impl SweepConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        OwnerId::parse(&self.owner_id)
            .map_err(|e| ConfigError::Invalid(format!("sweep.owner_id: {e}")))?;
        if self.buffer_capacity == 0 {
            return Err(ConfigError::Invalid(
                "sweep.buffer_capacity must be positive".into(),
            ));
        }
        if self.health_check_interval_ms == 0 || self.no_data_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "sweep health check interval and no-data timeout must be positive".into(),
            ));
        }
        self.backoff.validate()?;
        self.capture.validate()
    }

    pub fn owner(&self) -> OwnerId {
        OwnerId::new(self.owner_id.trim())
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn no_data_timeout(&self) -> Duration {
        Duration::from_millis(self.no_data_timeout_ms)
    }
}

// ============================================================================
// Backoff
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// base × attempt
    Linear,
    /// base × 2^(attempt-1)
    Exponential,
}

/// Delay before each recovery respawn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub strategy: BackoffStrategy,
    pub base_ms: u64,
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_ms: 1_000,
            max_ms: 30_000,
        }
    }
}

impl BackoffConfig {
    /// Delay for the given recovery attempt (1-based), capped at `max_ms`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let ms = match self.strategy {
            BackoffStrategy::Linear => self.base_ms.saturating_mul(u64::from(attempt)),
            BackoffStrategy::Exponential => {
                let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
                self.base_ms.saturating_mul(factor)
            }
        };
        Duration::from_millis(ms.min(self.max_ms))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_ms < self.base_ms {
            return Err(ConfigError::Invalid(
                "sweep.backoff.max_ms must be >= base_ms".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Capture Process
// ============================================================================

/// The external capture program and its tuning arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Executable to spawn (looked up in PATH)
    pub program: String,

    /// Name used to find orphaned instances; defaults to the program's
    /// file name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_name: Option<String>,

    /// Arguments placed before the generated tuning arguments
    pub prefix_args: Vec<String>,

    pub lna_gain_db: u32,
    pub vga_gain_db: u32,
    pub bin_width_hz: u64,

    /// Width of the window swept around each target
    pub span_hz: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            program: "hackrf_sweep".to_string(),
            process_name: None,
            prefix_args: Vec::new(),
            lna_gain_db: 32,
            vga_gain_db: 20,
            bin_width_hz: 500_000,
            span_hz: 20_000_000,
        }
    }
}

impl CaptureConfig {
    /// Process name to match when cleaning up orphans.
    pub fn process_name(&self) -> String {
        if let Some(name) = &self.process_name {
            return name.clone();
        }
        Path::new(&self.program)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.clone())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.program.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "sweep.capture.program must not be empty".into(),
            ));
        }
        // hackrf_sweep: LNA 0-40 dB, VGA 0-62 dB
        if self.lna_gain_db > 40 || self.vga_gain_db > 62 {
            return Err(ConfigError::Invalid(
                "sweep.capture gains out of range (lna 0-40, vga 0-62)".into(),
            ));
        }
        if self.bin_width_hz == 0 || self.span_hz == 0 {
            return Err(ConfigError::Invalid(
                "sweep.capture bin_width_hz and span_hz must be positive".into(),
            ));
        }
        Ok(())
    }
}
