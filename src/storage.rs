use crate::error::{Error, Result};
use crate::peer::HardwareAddress;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Persistence for what this device learns about itself.
pub trait SettingsStore: Send + Sync {
    fn load_own_address(&self) -> Option<HardwareAddress>;
    fn save_own_address(&self, address: &HardwareAddress) -> Result<()>;
}

// On-disk format. Only one field for now, but kept as an object so it can grow.
#[derive(Serialize, Deserialize, Default)]
struct StoredSettings {
    own_address: Option<HardwareAddress>,
}

/// Stores settings as pretty-printed JSON in a single file.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read(&self) -> StoredSettings {
        if !self.path.exists() {
            return StoredSettings::default();
        }

        match fs::read_to_string(&self.path) {
            Ok(content) => match serde_json::from_str::<StoredSettings>(&content) {
                Ok(settings) => settings,
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), "Failed to parse settings: {}", e);
                    StoredSettings::default()
                }
            },
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "Failed to read settings file: {}", e);
                StoredSettings::default()
            }
        }
    }
}

impl SettingsStore for JsonFileStore {
    fn load_own_address(&self) -> Option<HardwareAddress> {
        self.read().own_address.filter(HardwareAddress::is_valid)
    }

    fn save_own_address(&self, address: &HardwareAddress) -> Result<()> {
        let mut settings = self.read();
        settings.own_address = Some(address.clone());

        // Ensure directory exists
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(&settings)?;
        fs::write(&self.path, json)
            .map_err(|e| Error::Storage(format!("{}: {}", self.path.display(), e)))?;
        tracing::info!(path = %self.path.display(), %address, "Saved own address");
        Ok(())
    }
}

/// Keeps settings in memory only.
#[derive(Default)]
pub struct MemoryStore {
    own_address: Mutex<Option<HardwareAddress>>,
}

impl MemoryStore {
    pub fn with_address(address: HardwareAddress) -> Self {
        Self {
            own_address: Mutex::new(Some(address)),
        }
    }
}

impl SettingsStore for MemoryStore {
    fn load_own_address(&self) -> Option<HardwareAddress> {
        self.own_address.lock().clone()
    }

    fn save_own_address(&self, address: &HardwareAddress) -> Result<()> {
        *self.own_address.lock() = Some(address.clone());
        Ok(())
    }
}
