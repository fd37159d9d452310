//! RdpClipGuard - Helper process health model
//!
//! Restart policy lives in [`needs_restart`] and nowhere else.

use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;

/// Handle count above which the helper is considered leaking
pub const HANDLE_COUNT_THRESHOLD: u32 = 1000;
/// Working set (MB) above which the helper is considered bloated
pub const WORKING_SET_THRESHOLD_MB: u64 = 50;

/// One health sample of the redirection helper
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HelperProcessHealth {
    pub running: bool,
    pub responding: bool,
    pub pid: u32,
    pub start_time: Option<DateTime<Local>>,
    pub working_set_mb: u64,
    pub private_mem_mb: u64,
    pub handle_count: u32,
    pub thread_count: u32,
    pub uptime: Duration,
}

impl HelperProcessHealth {
    /// Sample for a helper that is not running; every metric zeroed
    pub fn not_running() -> Self {
        Self::default()
    }

    pub fn suspicious_handles(&self) -> bool {
        self.handle_count > HANDLE_COUNT_THRESHOLD
    }

    pub fn high_memory(&self) -> bool {
        self.working_set_mb > WORKING_SET_THRESHOLD_MB
    }

    pub fn unhealthy(&self) -> bool {
        !self.running || !self.responding
    }

    /// Reasons a restart is recommended, empty when healthy
    pub fn restart_reasons(&self) -> Vec<&'static str> {
        let mut reasons = Vec::new();
        if !self.running {
            reasons.push("not running");
        }
        if !self.responding {
            reasons.push("not responding");
        }
        if self.suspicious_handles() {
            reasons.push("handle count above threshold");
        }
        if self.high_memory() {
            reasons.push("working set above threshold");
        }
        reasons
    }

    /// Single-line summary for log records
    pub fn summary(&self) -> String {
        if !self.running {
            return "not running".to_string();
        }
        let mut line = format!(
            "PID={} Responding={} WorkingSet={}MB Private={}MB Handles={} Threads={} Uptime={}",
            self.pid,
            self.responding,
            self.working_set_mb,
            self.private_mem_mb,
            self.handle_count,
            self.thread_count,
            format_uptime(self.uptime),
        );
        if self.suspicious_handles() {
            line.push_str(" [SUSPICIOUS HANDLES]");
        }
        if self.high_memory() {
            line.push_str(" [HIGH MEMORY]");
        }
        line
    }
}

/// Restart recommendation. Pure: depends only on the sample.
pub fn needs_restart(health: &HelperProcessHealth) -> bool {
    health.unhealthy() || health.suspicious_handles() || health.high_memory()
}

/// Format a duration as `HH:MM:SS`
pub fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}
