//! Daemon configuration file

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;
use tt_core::constants::persistence as persist_const;
use tt_core::ZoneConfig;
use tt_error::{Result, ThermotuneError};

/// Largest accepted config file (1 MB)
const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;

const DEFAULT_TICK_INTERVAL_MS: u64 = 60_000;
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 1_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Zone state directory; platform data dir when unset
    pub state_dir: Option<PathBuf>,
    /// Wall-clock `Tick` interval, 0 disables ticks
    pub tick_interval_ms: u64,
    pub save_debounce_ms: u64,
    /// How often due saves are written
    pub flush_interval_ms: u64,
    pub zones: Vec<ZoneConfig>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_dir: None,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            save_debounce_ms: persist_const::SAVE_DEBOUNCE_MS,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            zones: Vec::new(),
        }
    }
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let size = fs::metadata(path)
            .map_err(|e| ThermotuneError::FileRead { path: path.to_path_buf(), source: e })?
            .len();
        if size > MAX_CONFIG_FILE_SIZE {
            return Err(ThermotuneError::FileTooLarge {
                path: path.to_path_buf(),
                size,
                max_size: MAX_CONFIG_FILE_SIZE,
            });
        }

        let content = fs::read_to_string(path)
            .map_err(|e| ThermotuneError::FileRead { path: path.to_path_buf(), source: e })?;
        let config: DaemonConfig = serde_json::from_str(&content)
            .map_err(|e| ThermotuneError::config(format!("Failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;

        debug!("Loaded daemon config from {:?} ({} zones)", path, config.zones.len());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.flush_interval_ms == 0 {
            return Err(ThermotuneError::invalid_config("flush_interval_ms", "must be positive"));
        }
        for zone in &self.zones {
            zone.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tt_core::HeatingType;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: DaemonConfig = serde_json::from_str(
            r#"{"zones": [{"id": "living", "heating_type": "floor_hydronic", "auto_apply": true}]}"#,
        )
        .unwrap();
        assert_eq!(config.tick_interval_ms, DEFAULT_TICK_INTERVAL_MS);
        assert_eq!(config.zones.len(), 1);
        assert_eq!(config.zones[0].heating_type, HeatingType::FloorHydronic);
        assert!(config.zones[0].auto_apply);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_rejects_bad_zone_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("thermotune.json");
        fs::write(&path, r#"{"zones": [{"id": "../etc"}]}"#).unwrap();
        assert!(matches!(DaemonConfig::load(&path), Err(ThermotuneError::InvalidZoneId(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            DaemonConfig::load(&dir.path().join("absent.json")),
            Err(ThermotuneError::FileRead { .. })
        ));
    }
}
