//! RdpClipGuard - RDP clipboard redirection watchdog
//!
//! Detects when the clipboard redirection helper (rdpclip.exe) stops
//! carrying copies across a remote desktop session and restarts it,
//! recording what it saw in optional diagnostic session logs.

pub mod clipboard;
pub mod commands;
pub mod config;
pub mod diagnostics;
pub mod guard;
pub mod process;

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use clipboard::SystemClipboard;
use config::init_settings;
use guard::{ClipGuard, GuardConfig};
use process::SystemProcessHost;

/// Command-line flag that starts in diagnostic mode
pub const DIAGNOSTIC_FLAG: &str = "--diagnostic";

/// Global guard instance
static GUARD: Lazy<Mutex<Option<Arc<ClipGuard>>>> = Lazy::new(|| Mutex::new(None));

/// The running guard, if any
pub fn guard_instance() -> Option<Arc<ClipGuard>> {
    GUARD.lock().clone()
}

fn install_guard(guard: Arc<ClipGuard>) {
    *GUARD.lock() = Some(guard);
}

fn take_guard() -> Option<Arc<ClipGuard>> {
    GUARD.lock().take()
}

/// Application main entry point
pub fn run() {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    log::info!("RdpClipGuard {} starting...", env!("CARGO_PKG_VERSION"));

    init_settings();
    let settings = config::get_settings();
    let diagnostic_flag = std::env::args().any(|arg| arg == DIAGNOSTIC_FLAG);

    let guard = Arc::new(ClipGuard::new(
        GuardConfig::from(&settings),
        Arc::new(SystemClipboard::new()),
        Arc::new(SystemProcessHost::new()),
    ));
    guard.set_status_sink(|status| log::info!("[Guard] {}", status));
    install_guard(Arc::clone(&guard));
    guard.start();

    if settings.diagnostics_enabled || diagnostic_flag {
        match guard.enable_diagnostics() {
            Ok(()) => {
                if let Some(path) = guard.session_path() {
                    log::info!("[Guard] Diagnostic session: {:?}", path);
                }
            }
            Err(e) => log::error!("[Guard] Failed to start diagnostic session: {}", e),
        }
    }

    log::info!("RdpClipGuard initialized successfully, press Ctrl+C to exit");
    wait_for_shutdown_signal();

    log::info!("RdpClipGuard shutting down...");
    if let Some(guard) = take_guard() {
        guard.shutdown();
    }
}

fn wait_for_shutdown_signal() {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to build signal runtime: {}", e);
            return;
        }
    };
    if let Err(e) = runtime.block_on(tokio::signal::ctrl_c()) {
        log::error!("Failed to wait for Ctrl+C: {}", e);
    }
}
