//! saved global settings (warning levels, alarm, display schedule)

use crate::domain::GlobalSettings;

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

/// settings shared by the writer (the only mutator) and the sampler
pub type SharedSettings = Arc<RwLock<GlobalSettings>>;

pub fn shared(settings: GlobalSettings) -> SharedSettings {
    Arc::new(RwLock::new(settings))
}

/// read the settings file; missing or corrupt files give defaults
pub fn load_or_default(path: &Path) -> GlobalSettings {
    if !path.exists() {
        tracing::info!("No saved settings at {} - using defaults", path.display());
        return GlobalSettings::default();
    }
    match std::fs::read_to_string(path).map_err(anyhow::Error::from).and_then(|s| Ok(toml::from_str(&s)?)) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Could not load settings from {}: {} - using defaults", path.display(), e);
            GlobalSettings::default()
        }
    }
}

pub fn save(path: &Path, settings: &GlobalSettings) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, toml::to_string(settings)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AlarmSong, ClockTime, DisplaySchedule, Thresholds};

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.toml");
        let settings = GlobalSettings {
            thresholds: Thresholds { co2: 900, humidity_low: 25, humidity_high: 55, temp_low: -5, temp_high: 30 },
            alarm: AlarmSong::StarTrek,
            display: DisplaySchedule {
                on: ClockTime::new(7, 30).unwrap(),
                off: ClockTime::new(22, 0).unwrap(),
            },
        };
        save(&path, &settings).unwrap();
        assert_eq!(load_or_default(&path), settings);
    }

    #[test]
    fn test_missing_or_corrupt_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        assert_eq!(load_or_default(&path), GlobalSettings::default());

        std::fs::write(&path, "thresholds = 12").unwrap();
        assert_eq!(load_or_default(&path), GlobalSettings::default());
    }
}
