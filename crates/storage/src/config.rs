//! Driver configuration management

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::session::WritePolicy;

/// SanDisk Cruzer flash drive, the identity this driver claims by default.
pub const DEFAULT_VENDOR_ID: u16 = 0x0781;
pub const DEFAULT_PRODUCT_ID: u16 = 0x5567;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(default)]
    pub device: DeviceMatch,
    #[serde(default)]
    pub transfer: TransferSettings,
    #[serde(default = "DriverConfig::default_log_level")]
    pub log_level: String,
}

/// The fixed (vendor, product) identity this driver binds to. Devices not
/// matching are ignored.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DeviceMatch {
    #[serde(default = "DeviceMatch::default_vendor_id")]
    pub vendor_id: u16,
    #[serde(default = "DeviceMatch::default_product_id")]
    pub product_id: u16,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TransferSettings {
    /// Bulk transfer timeout in milliseconds; zero waits indefinitely.
    #[serde(default = "TransferSettings::default_timeout_ms")]
    pub timeout_ms: u64,
    /// Wait for write completions instead of returning at submission.
    #[serde(default)]
    pub write_blocking: bool,
}

impl Default for DeviceMatch {
    fn default() -> Self {
        Self {
            vendor_id: Self::default_vendor_id(),
            product_id: Self::default_product_id(),
        }
    }
}

impl DeviceMatch {
    fn default_vendor_id() -> u16 {
        DEFAULT_VENDOR_ID
    }

    fn default_product_id() -> u16 {
        DEFAULT_PRODUCT_ID
    }
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            timeout_ms: Self::default_timeout_ms(),
            write_blocking: false,
        }
    }
}

impl TransferSettings {
    fn default_timeout_ms() -> u64 {
        5000
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            device: DeviceMatch::default(),
            transfer: TransferSettings::default(),
            log_level: Self::default_log_level(),
        }
    }
}

impl DriverConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }

    /// Default config file location, `<config dir>/usbstor/config.toml`.
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usbstor").join("config.toml")
        } else {
            PathBuf::from("/etc/usbstor/config.toml")
        }
    }

    /// Load configuration from `path`, or from the default location.
    ///
    /// A missing file yields the defaults; a malformed one is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path)?;
        toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn write_policy(&self) -> WritePolicy {
        if self.transfer.write_blocking {
            WritePolicy::Blocking
        } else {
            WritePolicy::FireAndForget
        }
    }
}
