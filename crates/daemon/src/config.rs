//! Daemon configuration management

use crate::bridge::BridgeOptions;
use crate::preflight::PreflightOptions;
use crate::tap;
use crate::usb::{APPLE_VENDOR_ID, NCM_PRODUCT_ID};
use anyhow::{Context, Result, anyhow};
use ncm::{MAX_BLOCK_LEN, MAX_FRAME_LEN};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_MIN_USBMUXD_VERSION: &str = "1.1.1-56-g360619c";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub daemon: DaemonSettings,
    #[serde(default)]
    pub usb: UsbSettings,
    #[serde(default)]
    pub network: NetworkSettings,
    #[serde(default)]
    pub telemetry: TelemetrySettings,
    #[serde(default)]
    pub preflight: PreflightSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSettings {
    #[serde(default = "DaemonSettings::default_log_level")]
    pub log_level: String,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

impl DaemonSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    #[serde(default = "UsbSettings::default_vendor_id")]
    pub vendor_id: u16,
    #[serde(default = "UsbSettings::default_product_ids")]
    pub product_ids: Vec<u16>,
    /// Seconds between device scans
    #[serde(default = "UsbSettings::default_scan_interval")]
    pub scan_interval_secs: u64,
    /// Bulk transfer poll granularity; bounds how long Close takes
    #[serde(default = "UsbSettings::default_transfer_timeout")]
    pub transfer_timeout_ms: u64,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            vendor_id: Self::default_vendor_id(),
            product_ids: Self::default_product_ids(),
            scan_interval_secs: Self::default_scan_interval(),
            transfer_timeout_ms: Self::default_transfer_timeout(),
        }
    }
}

impl UsbSettings {
    fn default_vendor_id() -> u16 {
        APPLE_VENDOR_ID
    }

    fn default_product_ids() -> Vec<u16> {
        vec![NCM_PRODUCT_ID]
    }

    fn default_scan_interval() -> u64 {
        5
    }

    fn default_transfer_timeout() -> u64 {
        500
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// TAP name of the first device
    #[serde(default = "NetworkSettings::default_interface_name")]
    pub interface_name: String,
    /// Pack queued frames into one NTB
    #[serde(default)]
    pub batch_frames: bool,
    #[serde(default = "NetworkSettings::default_max_ntb_size")]
    pub max_ntb_size: usize,
    #[serde(default = "NetworkSettings::default_resync")]
    pub resync: bool,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            interface_name: Self::default_interface_name(),
            batch_frames: false,
            max_ntb_size: Self::default_max_ntb_size(),
            resync: Self::default_resync(),
        }
    }
}

impl NetworkSettings {
    fn default_interface_name() -> String {
        "iphone".to_string()
    }

    fn default_max_ntb_size() -> usize {
        16 * 1024
    }

    fn default_resync() -> bool {
        true
    }

    pub fn bridge_options(&self) -> BridgeOptions {
        BridgeOptions {
            batch_frames: self.batch_frames,
            max_ntb_size: self.max_ntb_size,
            resync: self.resync,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySettings {
    /// Port of the /metrics endpoint, disabled when unset
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "TelemetrySettings::default_bind_addr")]
    pub bind_addr: String,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            port: None,
            bind_addr: Self::default_bind_addr(),
        }
    }
}

impl TelemetrySettings {
    fn default_bind_addr() -> String {
        "0.0.0.0".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightSettings {
    #[serde(default = "PreflightSettings::default_min_usbmuxd_version")]
    pub min_usbmuxd_version: String,
    #[serde(default)]
    pub skip_usbmuxd_check: bool,
}

impl Default for PreflightSettings {
    fn default() -> Self {
        Self {
            min_usbmuxd_version: Self::default_min_usbmuxd_version(),
            skip_usbmuxd_check: false,
        }
    }
}

impl PreflightSettings {
    fn default_min_usbmuxd_version() -> String {
        DEFAULT_MIN_USBMUXD_VERSION.to_string()
    }

    pub fn options(&self) -> Result<PreflightOptions> {
        let min_usbmuxd_version = Version::parse(&self.min_usbmuxd_version)
            .with_context(|| format!("Invalid min_usbmuxd_version '{}'", self.min_usbmuxd_version))?;
        Ok(PreflightOptions {
            min_usbmuxd_version,
            skip_usbmuxd_check: self.skip_usbmuxd_check,
        })
    }
}

impl DaemonConfig {
    /// Load configuration from `path`, or from the standard locations
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref())
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/cdc-ncm/daemon.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: DaemonConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration, or defaults plus the reason loading failed
    ///
    /// Runs before logging is set up, so the caller reports the error.
    pub fn load_or_default(path: Option<PathBuf>) -> (Self, Option<anyhow::Error>) {
        match Self::load(path) {
            Ok(config) => (config, None),
            Err(e) => (Self::default(), Some(e)),
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("cdc-ncm").join("daemon.toml")
        } else {
            PathBuf::from(".config/cdc-ncm/daemon.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.daemon.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.daemon.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.usb.product_ids.is_empty() {
            return Err(anyhow!("usb.product_ids must not be empty"));
        }
        if self.usb.scan_interval_secs == 0 {
            return Err(anyhow!("usb.scan_interval_secs must be at least 1"));
        }
        if self.usb.transfer_timeout_ms == 0 {
            return Err(anyhow!("usb.transfer_timeout_ms must be at least 1"));
        }

        tap::validate_name(&self.network.interface_name)?;

        let smallest = ncm::block_len([MAX_FRAME_LEN]);
        let largest = MAX_BLOCK_LEN;
        if !(smallest..=largest).contains(&self.network.max_ntb_size) {
            return Err(anyhow!(
                "network.max_ntb_size {} must be between {} and {}",
                self.network.max_ntb_size,
                smallest,
                largest
            ));
        }

        self.telemetry
            .bind_addr
            .parse::<IpAddr>()
            .with_context(|| format!("Invalid telemetry.bind_addr '{}'", self.telemetry.bind_addr))?;

        self.preflight.options()?;

        Ok(())
    }
}
