//! RdpClipGuard - Remediation engine
//!
//! Kill-and-relaunch of the redirection helper. One remediation at a time:
//! a request arriving while another runs is dropped, not queued.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use super::health::HelperProcessHealth;
use super::probe::{HealthProbe, ProcessHost};
use crate::clipboard::monitor::panic_message;

/// Wait after termination and after relaunch
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Why a remediation was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResetReason {
    /// Copy counter reached a multiple of the reset threshold
    Scheduled,
    /// Health probe recommended a restart
    Unhealthy,
    /// Clipboard read timed out or failed
    ClipboardInaccessible,
    /// Requested by the user
    Manual,
}

impl fmt::Display for ResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResetReason::Scheduled => "scheduled",
            ResetReason::Unhealthy => "helper unhealthy",
            ResetReason::ClipboardInaccessible => "clipboard inaccessible",
            ResetReason::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// What one remediation did
#[derive(Debug, Clone, Serialize)]
pub struct RemediationReport {
    pub reason: ResetReason,
    pub instances_found: usize,
    pub terminated: usize,
    pub termination_failures: Vec<String>,
    pub relaunched_pid: Option<u32>,
    pub launch_error: Option<String>,
    pub health_after: HelperProcessHealth,
    /// Helper running and responding after the relaunch
    pub recovered: bool,
    pub duration: Duration,
}

impl RemediationReport {
    pub fn summary(&self) -> String {
        let mut line = format!(
            "Reset ({}): found {}, terminated {}",
            self.reason, self.instances_found, self.terminated
        );
        if !self.termination_failures.is_empty() {
            line.push_str(&format!(", {} failed to terminate", self.termination_failures.len()));
        }
        match (self.relaunched_pid, &self.launch_error) {
            (Some(pid), _) => line.push_str(&format!(", relaunched PID {}", pid)),
            (None, Some(e)) => line.push_str(&format!(", relaunch failed: {}", e)),
            (None, None) => {}
        }
        line.push_str(if self.recovered { ", recovered" } else { ", NOT recovered" });
        line.push_str(&format!(" in {}ms", self.duration.as_millis()));
        line
    }
}

/// Result of a remediation request
#[derive(Debug, Clone)]
pub enum RemediationOutcome {
    Completed(RemediationReport),
    /// Another remediation was already running
    Coalesced,
    /// The sequence aborted unexpectedly
    Failed(String),
}

/// Serialized kill-and-relaunch of the helper
pub struct RemediationEngine {
    host: Arc<dyn ProcessHost>,
    probe: HealthProbe,
    helper_name: String,
    settle_delay: Duration,
    lock: Mutex<()>,
    completed_runs: AtomicU64,
}

impl RemediationEngine {
    pub fn new(host: Arc<dyn ProcessHost>, helper_name: impl Into<String>, settle_delay: Duration) -> Self {
        Self {
            probe: HealthProbe::new(Arc::clone(&host)),
            host,
            helper_name: helper_name.into(),
            settle_delay,
            lock: Mutex::new(()),
            completed_runs: AtomicU64::new(0),
        }
    }

    pub fn helper_name(&self) -> &str {
        &self.helper_name
    }

    /// A remediation is in progress
    pub fn is_busy(&self) -> bool {
        self.lock.is_locked()
    }

    /// Number of kill/relaunch sequences that ran to the end
    pub fn completed_runs(&self) -> u64 {
        self.completed_runs.load(Ordering::SeqCst)
    }

    /// Kill every helper instance, relaunch one, and verify.
    ///
    /// Never panics or returns an error; failures are in the outcome.
    pub fn reset(&self, reason: ResetReason) -> RemediationOutcome {
        let Some(_guard) = self.lock.try_lock() else {
            log::info!("[Remediation] Reset ({}) dropped: another reset is in progress", reason);
            return RemediationOutcome::Coalesced;
        };

        log::info!("[Remediation] Starting reset of {} ({})", self.helper_name, reason);
        match panic::catch_unwind(AssertUnwindSafe(|| self.run_sequence(reason))) {
            Ok(report) => {
                self.completed_runs.fetch_add(1, Ordering::SeqCst);
                log::info!("[Remediation] {}", report.summary());
                RemediationOutcome::Completed(report)
            }
            Err(payload) => {
                let message = panic_message(&payload);
                log::error!("[Remediation] Reset aborted: {}", message);
                RemediationOutcome::Failed(message)
            }
        }
    }

    fn run_sequence(&self, reason: ResetReason) -> RemediationReport {
        let started = Instant::now();

        let pids = self.host.find_by_name(&self.helper_name);
        let mut terminated = 0;
        let mut termination_failures = Vec::new();
        for &pid in &pids {
            // One failure must not stop the others
            match self.host.terminate(pid) {
                Ok(()) => {
                    log::debug!("[Remediation] Terminated PID {}", pid);
                    terminated += 1;
                }
                Err(e) => {
                    log::warn!("[Remediation] {}", e);
                    termination_failures.push(e.to_string());
                }
            }
        }

        thread::sleep(self.settle_delay);

        let (relaunched_pid, launch_error) = match self.host.launch_hidden(&self.helper_name) {
            Ok(pid) => (Some(pid), None),
            Err(e) => {
                log::error!("[Remediation] {}", e);
                (None, Some(e.to_string()))
            }
        };

        thread::sleep(self.settle_delay);

        let health_after = self.probe.probe(&self.helper_name);
        let recovered = !health_after.unhealthy();

        RemediationReport {
            reason,
            instances_found: pids.len(),
            terminated,
            termination_failures,
            relaunched_pid,
            launch_error,
            health_after,
            recovered,
            duration: started.elapsed(),
        }
    }
}
