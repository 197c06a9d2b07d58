//! Persistent application configuration
//!
//! Stores device selection, sample rate, and measurement tuning in a JSON
//! file at `%APPDATA%/latencytester/config.json` (Windows) or the platform
//! equivalent.

use latencytester_core::audio::duplex::DuplexConfig;
use latencytester_core::audio::echo::EchoConfig;
use latencytester_core::audio::engine::CpalConfig;
use latencytester_core::audio::loopback::LoopbackConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Persistent application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Input/output device selection (None = system default)
    #[serde(default)]
    pub devices: CpalConfig,
    /// Stream pairing
    #[serde(default)]
    pub duplex: DuplexConfig,
    /// Probe and analyzer tuning
    #[serde(default)]
    pub echo: EchoConfig,
    /// Synthetic path used with `--simulate`
    #[serde(default)]
    pub loopback: LoopbackConfig,
}

impl AppConfig {
    /// Config file path: `<data_dir>/latencytester/config.json`
    pub fn path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("latencytester")
            .join("config.json")
    }

    /// Load config from the default path, falling back to defaults on any error
    pub fn load() -> Self {
        Self::load_from(&Self::path())
    }

    /// Load config from `path`, falling back to defaults on any error
    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => {
                    tracing::info!(path = %path.display(), "Loaded config from disk");
                    config
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to parse config, using defaults");
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!(path = %path.display(), "No config file found, using defaults");
                Self::default()
            }
        }
    }

    /// Save config to disk, creating parent directories if needed
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!(path = %path.display(), "Config saved to disk");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use latencytester_core::audio::duplex::Leader;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.devices.input_device, None);
        assert_eq!(config.devices.sample_rate, None);
        assert_eq!(config.duplex.leader, Leader::Output);
        assert_eq!(config.echo.probe_length, 2048);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let json = r#"{"devices": {"input_device": "Line In"}, "echo": {"max_iterations": 20}}"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.devices.input_device, Some("Line In".to_string()));
        assert_eq!(config.devices.output_device, None);
        assert_eq!(config.echo.analyzer.max_iterations, 20);
        assert_eq!(config.echo.analyzer.required_measurements, 5);
        assert_eq!(config.loopback, LoopbackConfig::default());
    }

    #[test]
    fn test_empty_json_uses_defaults() {
        let config: AppConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_unreadable_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();
        assert_eq!(AppConfig::load_from(&path), AppConfig::default());
        assert_eq!(
            AppConfig::load_from(&dir.path().join("missing.json")),
            AppConfig::default()
        );
    }

    #[test]
    fn test_path_ends_with_app_dir() {
        let path = AppConfig::path();
        assert!(path.ends_with("latencytester/config.json"));
    }
}
