//! RdpClipGuard - Command handlers
//!
//! Operations exposed to a host shell (tray, service wrapper, CLI)

use serde::{Deserialize, Serialize};

use crate::config::{self, RoleSetting, Settings};
use crate::guard::GuardStatus;
use crate::process::{HelperProcessHealth, RemediationOutcome, RemediationReport};

/// Command execution result
#[derive(Debug, Serialize)]
pub struct CommandResult<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> CommandResult<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

const NOT_RUNNING: &str = "Guard is not running";

/// Get counters and the status line
#[derive(Debug, Serialize)]
pub struct StatusView {
    pub status: GuardStatus,
    pub text: String,
}

pub fn get_status() -> CommandResult<StatusView> {
    match crate::guard_instance() {
        Some(guard) => {
            let status = guard.status();
            let text = status.to_string();
            CommandResult::ok(StatusView { status, text })
        }
        None => CommandResult::err(NOT_RUNNING.to_string()),
    }
}

/// Sample the helper process now
pub fn get_health() -> CommandResult<HelperProcessHealth> {
    match crate::guard_instance() {
        Some(guard) => CommandResult::ok(guard.health()),
        None => CommandResult::err(NOT_RUNNING.to_string()),
    }
}

/// Kill and relaunch the helper now
pub fn trigger_reset() -> CommandResult<RemediationReport> {
    let Some(guard) = crate::guard_instance() else {
        return CommandResult::err(NOT_RUNNING.to_string());
    };
    match guard.trigger_reset() {
        RemediationOutcome::Completed(report) => CommandResult::ok(report),
        RemediationOutcome::Coalesced => {
            CommandResult::err("A reset is already in progress".to_string())
        }
        RemediationOutcome::Failed(e) => CommandResult::err(format!("Reset failed: {}", e)),
    }
}

/// Start a diagnostic session; returns the session file path
pub fn enable_diagnostics() -> CommandResult<String> {
    let Some(guard) = crate::guard_instance() else {
        return CommandResult::err(NOT_RUNNING.to_string());
    };
    if let Err(e) = guard.enable_diagnostics() {
        return CommandResult::err(format!("Failed to start diagnostic session: {}", e));
    }
    match guard.session_path() {
        Some(path) => CommandResult::ok(path.display().to_string()),
        None => CommandResult::err("Diagnostic session closed unexpectedly".to_string()),
    }
}

/// End the diagnostic session
pub fn disable_diagnostics() -> CommandResult<bool> {
    match crate::guard_instance() {
        Some(guard) => {
            guard.disable_diagnostics();
            CommandResult::ok(true)
        }
        None => CommandResult::err(NOT_RUNNING.to_string()),
    }
}

/// Get current settings
pub fn get_settings() -> CommandResult<Settings> {
    CommandResult::ok(config::get_settings())
}

/// Settings update request
#[derive(Debug, Default, Deserialize)]
pub struct SettingsUpdate {
    pub poll_interval_ms: Option<u64>,
    pub read_timeout_ms: Option<u64>,
    pub reset_threshold: Option<u64>,
    pub settle_delay_ms: Option<u64>,
    pub diagnostics_enabled: Option<bool>,
    pub log_retention: Option<usize>,
    pub role: Option<String>,
}

/// Apply `updates` on top of `settings`
pub fn apply_update(mut settings: Settings, updates: SettingsUpdate) -> Result<Settings, String> {
    if let Some(ms) = updates.poll_interval_ms {
        settings.poll_interval_ms = ms;
    }
    if let Some(ms) = updates.read_timeout_ms {
        settings.read_timeout_ms = ms;
    }
    if let Some(threshold) = updates.reset_threshold {
        settings.reset_threshold = threshold;
    }
    if let Some(ms) = updates.settle_delay_ms {
        settings.settle_delay_ms = ms;
    }
    if let Some(enabled) = updates.diagnostics_enabled {
        settings.diagnostics_enabled = enabled;
    }
    if let Some(retention) = updates.log_retention {
        settings.log_retention = retention;
    }
    if let Some(role) = updates.role {
        settings.role = match role.to_lowercase().as_str() {
            "auto" => RoleSetting::Auto,
            "local" => RoleSetting::Local,
            "remote" => RoleSetting::Remote,
            other => return Err(format!("Unknown role: {}", other)),
        };
    }
    settings.validate().map_err(|e| e.to_string())?;
    Ok(settings)
}

/// Update settings
///
/// The diagnostics flag takes effect immediately; engine timings and
/// thresholds apply on next start.
pub fn update_settings(updates: SettingsUpdate) -> CommandResult<Settings> {
    let toggle = updates.diagnostics_enabled;
    let settings = match apply_update(config::get_settings(), updates) {
        Ok(settings) => settings,
        Err(e) => return CommandResult::err(e),
    };

    if let Err(e) = config::update_settings(settings.clone()) {
        return CommandResult::err(format!("Failed to save settings: {}", e));
    }

    if let (Some(enabled), Some(guard)) = (toggle, crate::guard_instance()) {
        if enabled {
            if let Err(e) = guard.enable_diagnostics() {
                log::error!("Failed to start diagnostic session: {}", e);
                return CommandResult::err(format!("Failed to start diagnostic session: {}", e));
            }
        } else {
            guard.disable_diagnostics();
        }
    }

    log::info!("Settings updated");
    CommandResult::ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_update_keeps_other_fields() {
        let updates = SettingsUpdate {
            reset_threshold: Some(3),
            role: Some("Remote".into()),
            ..Default::default()
        };
        let settings = apply_update(Settings::default(), updates).unwrap();
        assert_eq!(settings.reset_threshold, 3);
        assert_eq!(settings.role, RoleSetting::Remote);
        assert_eq!(settings.poll_interval_ms, 2000);
    }

    #[test]
    fn invalid_update_is_rejected() {
        let zero = SettingsUpdate {
            reset_threshold: Some(0),
            ..Default::default()
        };
        assert!(apply_update(Settings::default(), zero).is_err());

        let role = SettingsUpdate {
            role: Some("server".into()),
            ..Default::default()
        };
        assert_eq!(
            apply_update(Settings::default(), role).unwrap_err(),
            "Unknown role: server"
        );
    }

    #[test]
    fn command_result_shapes() {
        let ok = CommandResult::ok(5);
        assert!(ok.success && ok.error.is_none());
        let err: CommandResult<i32> = CommandResult::err("nope".into());
        assert!(!err.success && err.data.is_none());

        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["error"], "nope");
    }

    #[test]
    fn get_settings_always_succeeds() {
        assert!(get_settings().success);
    }
}
