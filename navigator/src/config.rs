use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{info, warn};

/// Device configuration, merged over defaults from an optional JSON file.
/// Unknown keys are ignored so older and newer config files both load.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub assets_folder: PathBuf,
    pub database_path: PathBuf,
    pub settings_path: PathBuf,
    pub status_path: PathBuf,
    pub api_base_url: String,
    pub default_zoom: u8,
    pub min_zoom: u8,
    pub max_zoom: u8,
    /// Seconds between e-paper refreshes.
    pub display_update_interval: u64,
    /// Seconds between full backend syncs.
    pub sync_interval: u64,
    /// Seconds between periodic logbook entries while a trip is active.
    pub logbook_interval: u64,
    pub gnss_port: String,
    pub gnss_baud: u32,
    pub display_width: u32,
    pub display_height: u32,
    /// [lat, lon] used before the first fix.
    pub fallback_coordinates: [f64; 2],
    pub mbtiles_settings: MbtilesSettings,
    pub button_pins: ButtonPins,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct MbtilesSettings {
    pub max_open_files: usize,
    /// Seconds an idle archive stays open.
    pub cache_timeout: u64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ButtonPins {
    pub up: u8,
    pub down: u8,
    pub left: u8,
    pub right: u8,
    pub center: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            assets_folder: PathBuf::from("/opt/elcano/assets"),
            database_path: PathBuf::from("/opt/elcano/navigation.db"),
            settings_path: PathBuf::from("/opt/elcano/settings.ini"),
            status_path: PathBuf::from("/opt/elcano/status.ini"),
            api_base_url: "https://api.elcanonav.com".to_string(),
            default_zoom: 14,
            min_zoom: 8,
            max_zoom: 18,
            display_update_interval: 5,
            sync_interval: 300,
            logbook_interval: 60,
            gnss_port: "/dev/ttyAMA0".to_string(),
            gnss_baud: 9600,
            display_width: 800,
            display_height: 480,
            fallback_coordinates: [52.3676, 4.9041],
            mbtiles_settings: MbtilesSettings::default(),
            button_pins: ButtonPins::default(),
        }
    }
}

impl Default for MbtilesSettings {
    fn default() -> Self {
        Self {
            max_open_files: 3,
            cache_timeout: 300,
        }
    }
}

impl Default for ButtonPins {
    fn default() -> Self {
        Self {
            up: 2,
            down: 3,
            left: 4,
            right: 17,
            center: 27,
        }
    }
}

fn env_u64(get: &dyn Fn(&str) -> Option<String>, name: &str, current: u64, min: u64, max: u64) -> u64 {
    get(name)
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(current)
        .clamp(min, max)
}

impl Config {
    /// Load from a JSON file; a missing or malformed file is never fatal.
    /// `ELCANO_*` environment variables override the file on top.
    pub fn load(path: &Path) -> Self {
        let mut config = match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<Config>(&raw) {
                Ok(config) => {
                    info!(config = %path.display(), "loaded configuration");
                    config
                }
                Err(err) => {
                    warn!(config = %path.display(), error = %err, "bad config file, using defaults");
                    Config::default()
                }
            },
            Err(err) => {
                warn!(config = %path.display(), error = %err, "no config file, using defaults");
                Config::default()
            }
        };
        config.apply_env_overrides(&|name| std::env::var(name).ok());
        config
    }

    /// Layer environment overrides over whatever the file provided. The
    /// lookup is injected so tests don't have to mutate process state.
    fn apply_env_overrides(&mut self, get: &dyn Fn(&str) -> Option<String>) {
        if let Some(v) = get("ELCANO_ASSETS_FOLDER") {
            self.assets_folder = PathBuf::from(v);
        }
        if let Some(v) = get("ELCANO_DATABASE_PATH") {
            self.database_path = PathBuf::from(v);
        }
        if let Some(v) = get("ELCANO_API_BASE_URL") {
            self.api_base_url = v;
        }
        if let Some(v) = get("ELCANO_GNSS_PORT") {
            self.gnss_port = v;
        }
        self.display_update_interval = env_u64(
            get,
            "ELCANO_DISPLAY_UPDATE_INTERVAL",
            self.display_update_interval,
            1,
            3_600,
        );
        self.sync_interval = env_u64(get, "ELCANO_SYNC_INTERVAL", self.sync_interval, 30, 86_400);
        self.logbook_interval =
            env_u64(get, "ELCANO_LOGBOOK_INTERVAL", self.logbook_interval, 5, 3_600);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults_for_missing_keys() {
        let config: Config =
            serde_json::from_str(r#"{"default_zoom": 11, "sync_interval": 120}"#).unwrap();
        assert_eq!(config.default_zoom, 11);
        assert_eq!(config.sync_interval, 120);
        assert_eq!(config.min_zoom, 8);
        assert_eq!(config.display_width, 800);
        assert_eq!(config.button_pins.center, 27);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let config: Config = serde_json::from_str(
            r#"{"default_zoom": 9, "future_feature": {"nested": true}, "extra": 1}"#,
        )
        .unwrap();
        assert_eq!(config.default_zoom, 9);
    }

    #[test]
    fn nested_sections_merge() {
        let config: Config = serde_json::from_str(
            r#"{"mbtiles_settings": {"max_open_files": 5}, "button_pins": {"up": 21}}"#,
        )
        .unwrap();
        assert_eq!(config.mbtiles_settings.max_open_files, 5);
        assert_eq!(config.mbtiles_settings.cache_timeout, 300);
        assert_eq!(config.button_pins.up, 21);
        assert_eq!(config.button_pins.down, 3);
    }

    #[test]
    fn unreadable_file_falls_back_to_defaults() {
        let config = Config::load(Path::new("/nonexistent/navigation_config.json"));
        assert_eq!(config.default_zoom, 14);
    }

    #[test]
    fn env_overrides_beat_file_values() {
        let mut config = Config::default();
        config.apply_env_overrides(&|name| match name {
            "ELCANO_SYNC_INTERVAL" => Some("120".to_string()),
            "ELCANO_GNSS_PORT" => Some("/dev/ttyUSB0".to_string()),
            "ELCANO_ASSETS_FOLDER" => Some("/mnt/charts".to_string()),
            _ => None,
        });

        assert_eq!(config.sync_interval, 120);
        assert_eq!(config.gnss_port, "/dev/ttyUSB0");
        assert_eq!(config.assets_folder, PathBuf::from("/mnt/charts"));
        // Untouched keys keep their values.
        assert_eq!(config.logbook_interval, 60);
        assert_eq!(config.api_base_url, "https://api.elcanonav.com");
    }

    #[test]
    fn env_overrides_clamp_and_ignore_garbage() {
        let mut config = Config::default();
        config.apply_env_overrides(&|name| match name {
            "ELCANO_LOGBOOK_INTERVAL" => Some("1".to_string()),
            "ELCANO_SYNC_INTERVAL" => Some("9999999".to_string()),
            "ELCANO_DISPLAY_UPDATE_INTERVAL" => Some("not a number".to_string()),
            _ => None,
        });

        assert_eq!(config.logbook_interval, 5);
        assert_eq!(config.sync_interval, 86_400);
        assert_eq!(config.display_update_interval, 5);
    }
}
