//! # Configuration Management
//!
//! Host-side settings loaded from `ttl-reader.toml`. These are the knobs that
//! never change while the device runs; everything the user edits at run time
//! (pixel clocks, borders, manual timing, bank) lives in the configuration
//! store instead.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Default config file, looked up in the working directory.
pub const CONFIG_FILE: &str = "ttl-reader.toml";

/// Application configuration loaded from ttl-reader.toml
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub hardware: HardwareConfig,
    pub capture: CaptureConfig,
    /// Synthetic source used by the development binary
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HardwareConfig {
    /// Sampler system clock in Hz; all dividers are derived from it
    pub system_clock_hz: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Keep the border auto-adjuster running continuously from start-up
    pub auto_adjust_always_on: bool,
    /// File backing the configuration store
    pub store_path: String,
    /// Pause per frame while nothing is captured
    pub idle_pause_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Preset name of the synthetic source, e.g. "CGA 640x200@60Hz"
    pub preset: String,
    /// Output frames to run before exiting (0 = forever)
    pub frames: u64,
    /// Output frames with the cable unplugged before the source appears
    pub connect_after_frames: u64,
    /// Print a preview every this many output frames
    pub preview_every: u64,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        HardwareConfig {
            system_clock_hz: 270_000_000,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            auto_adjust_always_on: false,
            store_path: "ttl-reader-store.json".to_string(),
            idle_pause_ms: 16,
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            preset: "CGA 640x200@60Hz".to_string(),
            frames: 600,
            connect_after_frames: 60,
            preview_every: 120,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            hardware: HardwareConfig::default(),
            capture: CaptureConfig::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

impl CaptureConfig {
    pub fn idle_pause(&self) -> Duration {
        Duration::from_millis(self.idle_pause_ms)
    }
}

impl Config {
    /// Load configuration from ttl-reader.toml
    /// Falls back to default configuration if file doesn't exist or is invalid
    pub fn load() -> Self {
        Self::load_from_path(CONFIG_FILE)
    }

    /// Load configuration from specified path
    /// Falls back to default configuration if file doesn't exist or is invalid
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Self {
        match fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str::<Config>(&contents) {
                Ok(config) => {
                    log::info!(
                        "Loaded configuration from {} (clock {} Hz)",
                        path.as_ref().display(),
                        config.hardware.system_clock_hz
                    );
                    config
                }
                Err(e) => {
                    log::warn!("Invalid config file format: {}", e);
                    log::warn!("Using default configuration");
                    Self::default()
                }
            },
            Err(_) => {
                log::info!("No config file found, using default configuration");
                Self::default()
            }
        }
    }

    /// Save current configuration to `path`
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(&path, contents)?;
        log::info!("Configuration saved to {}", path.as_ref().display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.hardware.system_clock_hz, 270_000_000);
        assert!(!config.capture.auto_adjust_always_on);
        assert_eq!(config.capture.idle_pause(), Duration::from_millis(16));
        assert_eq!(config.simulation.preset, "CGA 640x200@60Hz");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let parsed: Config = toml::from_str(
            "[capture]\nauto_adjust_always_on = true\n\n[simulation]\npreset = \"MDA 720x350@50Hz\"\n",
        )
        .unwrap();
        assert!(parsed.capture.auto_adjust_always_on);
        assert_eq!(parsed.capture.store_path, "ttl-reader-store.json");
        assert_eq!(parsed.simulation.preset, "MDA 720x350@50Hz");
        assert_eq!(parsed.hardware.system_clock_hz, 270_000_000);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut config = Config::default();
        config.hardware.system_clock_hz = 250_000_000;
        config.save(&path).unwrap();
        assert_eq!(Config::load_from_path(&path), config);
    }

    #[test]
    fn test_load_nonexistent_file() {
        let config = Config::load_from_path("/nonexistent/path");
        // Should fallback to default
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_malformed_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "hardware = 3").unwrap();
        assert_eq!(Config::load_from_path(&path), Config::default());
    }
}
