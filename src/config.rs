use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::desk::connection::ConnectionSettings;
use crate::desk::identity::IdentityCache;
use crate::desk::motion::{MotionSettings, DEFAULT_RESEND_INTERVAL};
use crate::desk::protocol::{self, DEFAULT_HEIGHT_TOLERANCE_MM};
use crate::desk::transport::Capabilities;

/// Configuration for the desk motion controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bluetooth address of the desk
    pub desk_address: Option<String>,

    /// Arrival tolerance in millimeters
    pub height_tolerance_mm: f64,

    pub scan_timeout_secs: u64,

    pub connect_timeout_secs: u64,

    /// Connect attempts after discovery, and reconnect rounds after a drop
    pub connect_attempts: u32,

    pub retry_backoff_secs: u64,

    /// Height notifications between repeated move commands
    pub resend_interval: u8,

    /// Also stop through the reference-input characteristic.
    /// Unset means: whatever the platform supports.
    pub reference_input_stop: Option<bool>,

    /// Remember the desk between runs to skip scanning
    pub cache_device: bool,

    /// Named heights in millimeters
    pub presets: BTreeMap<String, f64>,
}

impl Default for Config {
    fn default() -> Self {
        let mut presets = BTreeMap::new();
        presets.insert("sit".to_string(), 720.0); // 72.0 cm - typical sitting height
        presets.insert("stand".to_string(), 1100.0); // 110.0 cm - standing height

        Self {
            desk_address: None,
            height_tolerance_mm: DEFAULT_HEIGHT_TOLERANCE_MM,
            scan_timeout_secs: 5,
            connect_timeout_secs: 20,
            connect_attempts: 3,
            retry_backoff_secs: 3,
            resend_interval: DEFAULT_RESEND_INTERVAL,
            reference_input_stop: None,
            cache_device: true,
            presets,
        }
    }
}

impl Config {
    /// Get the configuration directory path (~/.desk-control)
    pub fn config_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not find home directory")?;
        Ok(home.join(".desk-control"))
    }

    /// Get the configuration file path (~/.desk-control/config)
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config"))
    }

    /// Get the cached desk identity path (~/.desk-control/device.json)
    pub fn cache_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("device.json"))
    }

    /// Load configuration from file, or create default if not exists
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(config_file: &Path) -> Result<Self> {
        if config_file.exists() {
            let content =
                fs::read_to_string(config_file).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&content).context("Failed to parse config file")?;
            Ok(config)
        } else {
            log::info!("Config file not found, creating default");
            let config = Config::default();
            config.save_to(config_file)?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, config_file: &Path) -> Result<()> {
        // Create directory if it doesn't exist
        if let Some(config_dir) = config_file.parent() {
            if !config_dir.exists() {
                fs::create_dir_all(config_dir).context("Failed to create config directory")?;
            }
        }

        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(config_file, content).context("Failed to write config file")?;

        log::info!("Configuration saved to {:?}", config_file);
        Ok(())
    }

    /// Get height for a named preset
    pub fn get_preset(&self, name: &str) -> Option<f64> {
        self.presets.get(name).copied()
    }

    /// Set height for a named preset, clamped to the desk range
    pub fn set_preset(&mut self, name: &str, height_mm: f64) {
        self.presets
            .insert(name.to_string(), protocol::clamp_mm(height_mm));
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            address: self.desk_address.clone(),
            scan_timeout: Duration::from_secs(self.scan_timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            attempts: self.connect_attempts,
            backoff: Duration::from_secs(self.retry_backoff_secs),
            auto_reconnect: true,
        }
    }

    pub fn motion_settings(&self, capabilities: Capabilities) -> MotionSettings {
        MotionSettings {
            tolerance_raw: protocol::tolerance_raw(self.height_tolerance_mm),
            resend_interval: self.resend_interval,
            reference_input_stop: self
                .reference_input_stop
                .unwrap_or(capabilities.reference_input),
        }
    }

    pub fn identity_cache(&self) -> Result<IdentityCache> {
        if self.cache_device {
            Ok(IdentityCache::new(Self::cache_file()?))
        } else {
            Ok(IdentityCache::disabled())
        }
    }
}
