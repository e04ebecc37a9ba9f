//! Arbitrable physical devices.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{DomainError, DomainResult};

/// A physical RF/network device that tool modules compete for.
///
/// The set is fixed at compile time. Each variant accepts a few
/// hardware-specific aliases so tools can keep using the names they
/// already know (`hackrf`, `alfa`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    /// Software-defined radio (HackRF class)
    #[serde(alias = "hackrf")]
    Sdr,

    /// External WiFi adapter used for monitor-mode capture
    #[serde(alias = "wifi", alias = "alfa")]
    WifiAdapter,

    /// Bluetooth radio
    #[serde(alias = "bluetooth", alias = "bt")]
    BluetoothRadio,
}

impl Device {
    /// Every arbitrable device, in display order.
    pub const ALL: [Device; 3] = [Device::Sdr, Device::WifiAdapter, Device::BluetoothRadio];

    /// Returns the canonical wire name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sdr => "sdr",
            Self::WifiAdapter => "wifi_adapter",
            Self::BluetoothRadio => "bluetooth_radio",
        }
    }

    /// Returns a descriptive label for the device.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Sdr => "Software-defined radio",
            Self::WifiAdapter => "WiFi adapter",
            Self::BluetoothRadio => "Bluetooth radio",
        }
    }

    /// Parses a device from its wire name or one of its aliases.
    ///
    /// Matching is case-insensitive and treats `-` like `_`.
    pub fn from_name(name: &str) -> Option<Self> {
        let normalized = name.trim().to_lowercase().replace('-', "_");
        match normalized.as_str() {
            "sdr" | "hackrf" => Some(Self::Sdr),
            "wifi_adapter" | "wifi" | "alfa" => Some(Self::WifiAdapter),
            "bluetooth_radio" | "bluetooth" | "bt" => Some(Self::BluetoothRadio),
            _ => None,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Device {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| DomainError::UnknownDevice {
            name: s.to_string(),
        })
    }
}

// ============================================================================
// Device Registry
// ============================================================================

/// The set of devices a lease manager arbitrates.
///
/// Defaults to every [`Device`]. Deployments without, say, a Bluetooth
/// radio can narrow the set so leases for it are rejected up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRegistry {
    devices: Vec<Device>,
}

impl DeviceRegistry {
    /// Creates a registry containing every known device.
    pub fn new() -> Self {
        Self {
            devices: Device::ALL.to_vec(),
        }
    }

    /// Creates a registry restricted to the given devices.
    ///
    /// Duplicates are removed and the order is normalized.
    pub fn with_devices(devices: impl IntoIterator<Item = Device>) -> Self {
        let mut devices: Vec<Device> = devices.into_iter().collect();
        devices.sort();
        devices.dedup();
        Self { devices }
    }

    /// Returns the registered devices.
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Returns true if the device is arbitrated by this registry.
    pub fn contains(&self, device: Device) -> bool {
        self.devices.contains(&device)
    }

    /// Resolves a device name, rejecting names that are unknown or not
    /// part of this registry.
    pub fn resolve(&self, name: &str) -> DomainResult<Device> {
        let device: Device = name.parse()?;
        if self.contains(device) {
            Ok(device)
        } else {
            Err(DomainError::UnknownDevice {
                name: name.to_string(),
            })
        }
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
