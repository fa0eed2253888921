use config::{Config, File};
pub use config::ConfigError;
use serde::Deserialize;

use crate::grid::{EngineSettings, GridConfig, PaperConfig};

/// Main configuration struct
#[derive(Debug, Deserialize)]
pub struct Settings {
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
    /// Health check, retry and shutdown settings shared by every engine
    #[serde(default)]
    pub engine: EngineSettings,
    /// One entry per symbol, in start order
    #[serde(default)]
    pub grids: Vec<GridConfig>,
    /// Simulated markets for paper mode
    #[serde(default)]
    pub paper: PaperConfig,
}

#[derive(Debug, Deserialize)]
pub struct LogConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    /// Load settings from a configuration file
    pub fn new(config_path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(config_path))
            // Environment overrides the file
            // e.g. APP__ENGINE__HEALTH_CHECK_INTERVAL_SECS=5
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    #[test]
    fn test_settings_from_toml() {
        let toml = r#"
            [log]
            level = "debug"

            [engine]
            health_check_interval_secs = 30

            [[grids]]
            symbol = "BTC"
            spacing = 100.0
            order_value = 20.0
            grid_levels = 5
            leverage = 20

            [paper]
            step_interval_ms = 250

            [[paper.markets]]
            symbol = "BTC"
            start_price = 50000.0
        "#;

        let settings: Settings = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(settings.log.level, "debug");
        assert_eq!(settings.engine.health_check_interval_secs, 30);
        assert_eq!(settings.engine.completeness_threshold, 0.8);
        assert_eq!(settings.grids.len(), 1);
        assert_eq!(settings.grids[0].grid_levels, 5);
        assert_eq!(settings.paper.step_interval_ms, 250);
        assert_eq!(settings.paper.markets[0].start_price, 50000.0);
    }

    #[test]
    fn test_settings_defaults() {
        let settings: Settings = Config::builder()
            .add_source(File::from_str("", FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(settings.log.level, "info");
        assert!(settings.grids.is_empty());
        assert_eq!(settings.engine.shutdown_grace_secs, 10);
    }
}
