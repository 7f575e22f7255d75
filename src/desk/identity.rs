use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// A desk as the transport knows it: an opaque backend handle plus the
/// address it was discovered under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub address: String,
    /// Backend-specific peripheral handle; `Null` when only the address is known.
    #[serde(default)]
    pub handle: serde_json::Value,
}

impl DeviceIdentity {
    pub fn new(address: impl Into<String>, handle: serde_json::Value) -> Self {
        Self {
            address: address.into(),
            handle,
        }
    }
}

/// Single-entry, address-keyed store for the last connected desk.
///
/// Purely an optimisation over scanning, so nothing here ever fails:
/// unreadable or mismatching entries read as a miss and write failures are
/// logged and dropped.
#[derive(Debug, Clone)]
pub struct IdentityCache {
    path: Option<PathBuf>,
}

impl IdentityCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// A cache that never holds anything. Used where device handles cannot be
    /// rehydrated across runs.
    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.path.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn load(&self, address: &str) -> Option<DeviceIdentity> {
        let path = self.path.as_ref()?;
        let content = fs::read_to_string(path).ok()?;
        let identity: DeviceIdentity = match serde_json::from_str(&content) {
            Ok(identity) => identity,
            Err(e) => {
                log::debug!("Ignoring unreadable device cache {:?}: {}", path, e);
                return None;
            }
        };

        if identity.address.eq_ignore_ascii_case(address) {
            log::debug!("Device cache hit for {}", address);
            Some(identity)
        } else {
            log::debug!(
                "Device cache holds {} but {} was requested",
                identity.address,
                address
            );
            None
        }
    }

    pub fn store(&self, identity: &DeviceIdentity) {
        let Some(path) = self.path.as_ref() else {
            return;
        };

        if let Err(e) = write_atomically(path, identity) {
            log::warn!("Failed to cache desk identity at {:?}: {}", path, e);
        } else {
            log::info!("Cached desk identity for {}", identity.address);
        }
    }

    pub fn invalidate(&self) {
        let Some(path) = self.path.as_ref() else {
            return;
        };

        match fs::remove_file(path) {
            Ok(()) => log::info!("Removed cached desk identity"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to remove desk cache {:?}: {}", path, e),
        }
    }
}

fn write_atomically(path: &Path, identity: &DeviceIdentity) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let content = serde_json::to_string_pretty(identity)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)
}
