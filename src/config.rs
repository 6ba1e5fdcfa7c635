//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `host.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - ServerConfig: listen address and the dashboard page.
//!     - PollingConfig: sensor tick and co2 read cadence.
//!     - StorageConfig: where the readings log and saved settings live.
//!     - BuzzerConfig: alarm GPIO (hardware builds only).
//!     - LoggingConfig: tracing level and per-tick sensor output.
//!
//! ==============================================================================

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// persisted readings are taken every 5 s; the tick must divide it
const PERSIST_PERIOD_MS: u64 = 5_000;

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct HostConfig {
    pub server: ServerConfig,
    pub polling: PollingConfig,
    pub storage: StorageConfig,
    pub buzzer: BuzzerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// dashboard HTML; an embedded page is served when missing
    pub page: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PollingConfig {
    pub interval_ms: u64,
    pub co2_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub dir: PathBuf,
    pub readings_file: String,
    pub settings_file: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BuzzerConfig {
    pub gpio_pin: u8,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub show_sensor_data: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".to_string(), page: PathBuf::from("web").join("main.html") }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self { interval_ms: 1_000, co2_interval_ms: 5_000 }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("log"),
            readings_file: "readings.rws".to_string(),
            settings_file: "settings.toml".to_string(),
        }
    }
}

impl Default for BuzzerConfig {
    fn default() -> Self {
        Self { gpio_pin: 17 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), show_sensor_data: false }
    }
}

impl StorageConfig {
    pub fn readings_path(&self) -> PathBuf {
        self.dir.join(&self.readings_file)
    }

    pub fn settings_path(&self) -> PathBuf {
        self.dir.join(&self.settings_file)
    }
}

impl HostConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("Failed to read config file: {}", e))?;

        let config: HostConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;

        Ok(config.validated())
    }

    /// Load with default fallback
    pub fn load_or_default() -> Self {
        let paths = [
            PathBuf::from("config").join("host.toml"),
            PathBuf::from("..").join("config").join("host.toml"),
        ];

        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(config) => {
                        tracing::info!("[CONFIG] Loaded from {}", path.display());
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("[CONFIG] Failed to load {}: {}", path.display(), e);
                    }
                }
            }
        }

        tracing::warn!("[CONFIG] No config file found - using defaults");
        Self::default()
    }

    /// fix values the monitor cannot run with
    fn validated(mut self) -> Self {
        let interval = self.polling.interval_ms;
        if interval == 0 || PERSIST_PERIOD_MS % interval != 0 {
            tracing::warn!(
                "[CONFIG] polling.interval_ms = {} does not divide {}; using 1000",
                interval, PERSIST_PERIOD_MS
            );
            self.polling.interval_ms = PollingConfig::default().interval_ms;
        }
        if self.polling.co2_interval_ms == 0 {
            self.polling.co2_interval_ms = PollingConfig::default().co2_interval_ms;
        }
        self
    }

    /// Log configuration summary
    pub fn print_summary(&self) {
        tracing::info!("┌─────────────────────────────────────────┐");
        tracing::info!("│           HOST CONFIGURATION            │");
        tracing::info!("├─────────────────────────────────────────┤");
        tracing::info!("│ Bind: {}", self.server.bind);
        tracing::info!("│ Page: {}", self.server.page.display());
        tracing::info!("│ Tick: {} ms (co2 every {} ms)", self.polling.interval_ms, self.polling.co2_interval_ms);
        tracing::info!("│ Readings: {}", self.storage.readings_path().display());
        tracing::info!("│ Settings: {}", self.storage.settings_path().display());
        tracing::info!("│ Log Level: {}", self.logging.level);
        tracing::info!("└─────────────────────────────────────────┘");
    }
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: HostConfig = toml::from_str(
            r#"
            [server]
            bind = "127.0.0.1:9000"

            [logging]
            show_sensor_data = true
            "#,
        )
        .unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:9000");
        assert_eq!(config.server.page, PathBuf::from("web/main.html"));
        assert_eq!(config.polling.interval_ms, 1_000);
        assert_eq!(config.logging.level, "info");
        assert!(config.logging.show_sensor_data);
        assert_eq!(config.storage.readings_path(), PathBuf::from("log/readings.rws"));
    }

    #[test]
    fn test_interval_must_divide_persist_period() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.toml");

        std::fs::write(&path, "[polling]\ninterval_ms = 2500\n").unwrap();
        assert_eq!(HostConfig::load(&path).unwrap().polling.interval_ms, 2_500);

        std::fs::write(&path, "[polling]\ninterval_ms = 3000\n").unwrap();
        assert_eq!(HostConfig::load(&path).unwrap().polling.interval_ms, 1_000);

        std::fs::write(&path, "[polling]\ninterval_ms = 0\nco2_interval_ms = 0\n").unwrap();
        let config = HostConfig::load(&path).unwrap();
        assert_eq!(config.polling.interval_ms, 1_000);
        assert_eq!(config.polling.co2_interval_ms, 5_000);
    }

    #[test]
    fn test_unparsable_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.toml");
        std::fs::write(&path, "[polling\n").unwrap();
        assert!(HostConfig::load(&path).is_err());
        assert!(HostConfig::load(dir.path().join("missing.toml")).is_err());
    }
}
