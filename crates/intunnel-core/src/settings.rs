//! Persistent user settings
//!
//! Uses JSON file storage in ~/.config/intunnel/settings.json

use crate::error::{Error, Result};
use crate::exposure::ExposureMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Stored settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Last exposure mode picked by the user (restored, never auto-started)
    pub exposure_mode: ExposureMode,
    /// Compatibility flag forwarded to the host's terminal UI
    pub force_classic_terminal: bool,
}

/// Settings store with file persistence
pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<Settings>,
}

impl SettingsStore {
    /// Open the store at the default location
    pub fn new() -> Result<Self> {
        let path = Self::default_path()?;
        Self::with_path(path)
    }

    /// Open the store at a specific path
    ///
    /// A missing file yields defaults; an unreadable one is logged and replaced.
    pub fn with_path(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let data = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            match serde_json::from_str(&contents) {
                Ok(data) => {
                    info!("Loaded settings from {:?}", path);
                    data
                }
                Err(e) => {
                    warn!("Failed to parse settings, starting fresh: {}", e);
                    Settings::default()
                }
            }
        } else {
            debug!("No existing settings, using defaults");
            Settings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    /// Get the default settings path (~/.config/intunnel/settings.json)
    fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or(Error::NoConfigDir)?;
        Ok(config_dir.join("intunnel").join("settings.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self) -> Settings {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply `change` and write the result to disk if anything changed
    pub fn update(&self, change: impl FnOnce(&mut Settings)) -> Result<()> {
        let json = {
            let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
            let before = data.clone();
            change(&mut data);
            if *data == before {
                return Ok(());
            }
            serde_json::to_string_pretty(&*data)?
        };
        std::fs::write(&self.path, json)?;
        debug!("Saved settings to {:?}", self.path);
        Ok(())
    }

    pub fn set_exposure_mode(&self, mode: ExposureMode) -> Result<()> {
        self.update(|s| s.exposure_mode = mode)
    }

    pub fn set_force_classic_terminal(&self, enabled: bool) -> Result<()> {
        self.update(|s| s.force_classic_terminal = enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_when_missing() {
        let dir = tempdir().unwrap();
        let store = SettingsStore::with_path(dir.path().join("settings.json")).unwrap();
        assert_eq!(store.get(), Settings::default());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_settings_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        {
            let store = SettingsStore::with_path(path.clone()).unwrap();
            store.set_exposure_mode(ExposureMode::Tailscale).unwrap();
            store.set_force_classic_terminal(true).unwrap();
        }

        let store = SettingsStore::with_path(path).unwrap();
        let settings = store.get();
        assert_eq!(settings.exposure_mode, ExposureMode::Tailscale);
        assert!(settings.force_classic_terminal);
    }

    #[test]
    fn test_corrupt_file_starts_fresh() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = SettingsStore::with_path(path).unwrap();
        assert_eq!(store.get(), Settings::default());
    }

    #[test]
    fn test_unchanged_update_skips_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let store = SettingsStore::with_path(path.clone()).unwrap();
        store.set_force_classic_terminal(false).unwrap();
        assert!(!path.exists());
    }
}
