//! RdpClipGuard - User settings module
//!
//! Manages application configuration, persisted as JSON in the per-user
//! config directory

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::diagnostics::recorder::{DEFAULT_BASE_NAME, DEFAULT_RETENTION};
use crate::diagnostics::Role;
use crate::process::DEFAULT_HELPER_PROCESS;

/// Application folder name under the config/data directories
pub const APP_DIR_NAME: &str = "RdpClipGuard";

const MIN_INTERVAL_MS: u64 = 100;

/// Global settings instance
static SETTINGS: Lazy<RwLock<Settings>> = Lazy::new(|| RwLock::new(Settings::default()));

/// Settings error type
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid settings file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid setting: {0}")]
    Invalid(String),
}

/// Role selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RoleSetting {
    /// Detect from the current session
    #[default]
    Auto,
    Local,
    Remote,
}

impl RoleSetting {
    pub fn resolve(&self) -> Role {
        match self {
            RoleSetting::Auto => Role::detect(),
            RoleSetting::Local => Role::Local,
            RoleSetting::Remote => Role::Remote,
        }
    }
}

/// User settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Clipboard polling interval
    pub poll_interval_ms: u64,
    /// Bound on a single clipboard read
    pub read_timeout_ms: u64,
    /// Copies between scheduled resets
    pub reset_threshold: u64,
    /// Executable name of the redirection helper
    pub helper_process: String,
    /// Wait after kill and after relaunch
    pub settle_delay_ms: u64,
    /// Start in diagnostic mode
    pub diagnostics_enabled: bool,
    /// Session log directory override
    pub log_dir: Option<PathBuf>,
    /// Base name of session log files
    pub log_base_name: String,
    /// Session log files kept
    pub log_retention: usize,
    pub role: RoleSetting,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            read_timeout_ms: 2000,
            reset_threshold: 7,
            helper_process: DEFAULT_HELPER_PROCESS.to_string(),
            settle_delay_ms: 500,
            diagnostics_enabled: false,
            log_dir: None,
            log_base_name: DEFAULT_BASE_NAME.to_string(),
            log_retention: DEFAULT_RETENTION,
            role: RoleSetting::Auto,
        }
    }
}

impl Settings {
    /// Load settings from `path`.
    ///
    /// A missing file yields defaults; an unreadable or invalid one yields
    /// defaults with a warning.
    pub fn load_from(path: &Path) -> Self {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Settings::default(),
            Err(e) => {
                log::warn!("Failed to read settings {:?}: {}, using defaults", path, e);
                return Settings::default();
            }
        };

        let parsed = serde_json::from_str::<Settings>(&content)
            .map_err(SettingsError::from)
            .and_then(|settings| settings.validate().map(|_| settings));
        match parsed {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Ignoring settings {:?}: {}", path, e);
                Settings::default()
            }
        }
    }

    /// Save settings to `path`
    pub fn save_to(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.reset_threshold == 0 {
            return Err(SettingsError::Invalid("reset_threshold must be at least 1".into()));
        }
        if self.poll_interval_ms < MIN_INTERVAL_MS || self.read_timeout_ms < MIN_INTERVAL_MS {
            return Err(SettingsError::Invalid(format!(
                "poll_interval_ms and read_timeout_ms must be at least {}",
                MIN_INTERVAL_MS
            )));
        }
        if self.log_retention == 0 {
            return Err(SettingsError::Invalid("log_retention must be at least 1".into()));
        }
        if self.helper_process.trim().is_empty() {
            return Err(SettingsError::Invalid("helper_process must not be empty".into()));
        }
        if self.log_base_name.trim().is_empty() {
            return Err(SettingsError::Invalid("log_base_name must not be empty".into()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Session log directory: override, else `<data_local_dir>/RdpClipGuard/logs`
    pub fn resolved_log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(APP_DIR_NAME)
                .join("logs")
        })
    }
}

/// Location of the settings file
pub fn settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
        .join("settings.json")
}

/// Get current settings
pub fn get_settings() -> Settings {
    SETTINGS.read().clone()
}

/// Update settings (validated, then persisted)
pub fn update_settings(settings: Settings) -> Result<(), SettingsError> {
    settings.validate()?;
    settings.save_to(&settings_path())?;
    *SETTINGS.write() = settings;
    Ok(())
}

/// Initialize settings (load from disk)
pub fn init_settings() {
    let path = settings_path();
    let settings = Settings::load_from(&path);
    *SETTINGS.write() = settings;
    log::info!("Settings initialized from {:?}", path);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_constants() {
        let settings = Settings::default();
        assert_eq!(settings.poll_interval(), Duration::from_secs(2));
        assert_eq!(settings.read_timeout(), Duration::from_secs(2));
        assert_eq!(settings.settle_delay(), Duration::from_millis(500));
        assert_eq!(settings.reset_threshold, 7);
        assert_eq!(settings.helper_process, "rdpclip.exe");
        assert_eq!(settings.log_retention, 5);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{ "reset_threshold": 3, "role": "remote" }"#).unwrap();

        let settings = Settings::load_from(&path);
        assert_eq!(settings.reset_threshold, 3);
        assert_eq!(settings.role, RoleSetting::Remote);
        assert_eq!(settings.role.resolve(), Role::Remote);
        assert_eq!(settings.poll_interval_ms, 2000);
    }

    #[test]
    fn invalid_or_missing_files_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("none.json");
        assert_eq!(Settings::load_from(&missing), Settings::default());

        let garbage = dir.path().join("garbage.json");
        fs::write(&garbage, "not json").unwrap();
        assert_eq!(Settings::load_from(&garbage), Settings::default());

        let zero = dir.path().join("zero.json");
        fs::write(&zero, r#"{ "reset_threshold": 0 }"#).unwrap();
        assert_eq!(Settings::load_from(&zero), Settings::default());
    }

    #[test]
    fn save_then_load_preserves_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let settings = Settings {
            diagnostics_enabled: true,
            log_dir: Some(dir.path().join("logs")),
            ..Settings::default()
        };
        settings.save_to(&path).unwrap();
        assert_eq!(Settings::load_from(&path), settings);
        assert_eq!(settings.resolved_log_dir(), dir.path().join("logs"));
    }

    #[test]
    fn validation_rejects_unusable_values() {
        let fast = Settings {
            poll_interval_ms: 10,
            ..Settings::default()
        };
        assert!(matches!(fast.validate(), Err(SettingsError::Invalid(_))));

        let no_retention = Settings {
            log_retention: 0,
            ..Settings::default()
        };
        assert!(no_retention.validate().is_err());

        let no_helper = Settings {
            helper_process: " ".into(),
            ..Settings::default()
        };
        assert!(no_helper.validate().is_err());
    }
}
