//! RdpClipGuard - Configuration module

pub mod settings;

pub use settings::{
    get_settings, init_settings, settings_path, update_settings, RoleSetting, Settings,
    SettingsError,
};
