//! RdpClipGuard - Detection and remediation engine
//!
//! Wires the strategies together: a clipboard change consults the health
//! probe, an unhealthy helper or a due schedule invokes remediation, and
//! everything is recorded through the diagnostics sink. Nothing here
//! propagates errors into the monitoring loop.

pub mod status;

use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Local;
use parking_lot::{Mutex, RwLock};

use crate::clipboard::{
    ClipboardEvent, ClipboardListener, ClipboardMonitor, ClipboardSource, PollEvent, PollOutcome,
};
use crate::config::Settings;
use crate::diagnostics::{cleanup_sessions, DiagnosticRecorder, Diagnostics, RecorderError, Role};
use crate::process::{
    needs_restart, HealthProbe, HelperProcessHealth, ProcessHost, RemediationEngine,
    RemediationOutcome, ResetReason,
};

pub use status::GuardStatus;

/// Receiver of the status string
pub type StatusSink = Arc<dyn Fn(&str) + Send + Sync>;

const PREVIEW_LEN: usize = 40;

/// Engine parameters
#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub poll_interval: Duration,
    pub read_timeout: Duration,
    pub reset_threshold: u64,
    pub helper_process: String,
    pub settle_delay: Duration,
    pub log_dir: PathBuf,
    pub log_base_name: String,
    pub log_retention: usize,
    pub role: Role,
}

impl From<&Settings> for GuardConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            poll_interval: settings.poll_interval(),
            read_timeout: settings.read_timeout(),
            reset_threshold: settings.reset_threshold,
            helper_process: settings.helper_process.clone(),
            settle_delay: settings.settle_delay(),
            log_dir: settings.resolved_log_dir(),
            log_base_name: settings.log_base_name.clone(),
            log_retention: settings.log_retention,
            role: settings.role.resolve(),
        }
    }
}

/// Clipboard guard
pub struct ClipGuard {
    inner: Arc<GuardInner>,
}

struct GuardInner {
    config: GuardConfig,
    probe: HealthProbe,
    remediation: RemediationEngine,
    diagnostics: Diagnostics,
    monitor: ClipboardMonitor,
    listener: ClipboardListener,
    status: Mutex<GuardStatus>,
    status_sink: RwLock<Option<StatusSink>>,
    /// Serializes diagnostic mode changes
    mode_lock: Mutex<()>,
}

impl ClipGuard {
    pub fn new(config: GuardConfig, source: Arc<dyn ClipboardSource>, host: Arc<dyn ProcessHost>) -> Self {
        let monitor = ClipboardMonitor::new(
            Arc::clone(&source),
            config.poll_interval,
            config.read_timeout,
            config.reset_threshold,
        );
        let listener = ClipboardListener::new(source, config.read_timeout);
        let remediation =
            RemediationEngine::new(Arc::clone(&host), config.helper_process.clone(), config.settle_delay);

        Self {
            inner: Arc::new(GuardInner {
                probe: HealthProbe::new(host),
                remediation,
                diagnostics: Diagnostics::new(),
                monitor,
                listener,
                status: Mutex::new(GuardStatus::default()),
                status_sink: RwLock::new(None),
                mode_lock: Mutex::new(()),
                config,
            }),
        }
    }

    /// Register the host callback for status changes
    pub fn set_status_sink<F>(&self, sink: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.inner.status_sink.write() = Some(Arc::new(sink));
    }

    /// Start the polling strategy
    pub fn start(&self) {
        let inner = &self.inner;
        inner.diagnostics.info(&format!(
            "Monitoring {} every {}ms (reset every {} copies, role {})",
            inner.config.helper_process,
            inner.config.poll_interval.as_millis(),
            inner.config.reset_threshold,
            inner.config.role
        ));
        inner.record_health();

        let weak: Weak<GuardInner> = Arc::downgrade(&self.inner);
        inner.monitor.start(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_poll(event);
            }
        });
        inner.emit_status();
    }

    /// Stop polling and close diagnostics. Safe to call repeatedly.
    pub fn shutdown(&self) {
        self.inner.monitor.stop();
        self.disable_diagnostics();
    }

    /// Run one polling tick on the calling thread
    pub fn poll_once(&self) {
        let event = self.inner.monitor.tick();
        self.inner.handle_poll(event);
    }

    /// Enter diagnostic mode: open a session file and start the event
    /// strategy. No-op when already enabled.
    pub fn enable_diagnostics(&self) -> Result<(), RecorderError> {
        let inner = &self.inner;
        let _mode = inner.mode_lock.lock();
        if inner.diagnostics.is_recording() {
            return Ok(());
        }

        let config = &inner.config;
        let recorder = DiagnosticRecorder::create(
            &config.log_dir,
            &config.log_base_name,
            config.role,
            &config.helper_process,
        )?;
        inner.diagnostics.attach(recorder);

        let removed = cleanup_sessions(&config.log_dir, &config.log_base_name, config.log_retention);
        if removed > 0 {
            inner.diagnostics.diag(&format!("Removed {} old session file(s)", removed));
        }

        inner.diagnostics.section("INITIAL STATE");
        inner.record_health();
        inner.diagnostics.diag(&format!(
            "Copies so far: {}, resets so far: {}",
            inner.monitor.copy_count(),
            inner.remediation.completed_runs()
        ));
        inner.diagnostics.section("EVENTS");

        let weak: Weak<GuardInner> = Arc::downgrade(&self.inner);
        let started = inner.listener.start(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_event(event);
            }
        });
        match started {
            Ok(()) => inner.diagnostics.ok("Clipboard event listener registered"),
            Err(e) => inner
                .diagnostics
                .warn(&format!("Clipboard event listener unavailable: {}", e)),
        }

        inner.status.lock().diagnostics = true;
        inner.emit_status();
        Ok(())
    }

    /// Leave diagnostic mode. No-op when already disabled.
    pub fn disable_diagnostics(&self) {
        let inner = &self.inner;
        let _mode = inner.mode_lock.lock();
        if !inner.diagnostics.is_recording() {
            return;
        }

        inner.listener.stop();
        inner.diagnostics.info("Diagnostic mode disabled");
        if let Some(path) = inner.diagnostics.detach() {
            log::info!("[Guard] Diagnostic session saved to {:?}", path);
        }

        inner.status.lock().diagnostics = false;
        inner.emit_status();
    }

    pub fn diagnostics_enabled(&self) -> bool {
        self.inner.diagnostics.is_recording()
    }

    pub fn session_path(&self) -> Option<PathBuf> {
        self.inner.diagnostics.session_path()
    }

    /// Manual reset, serialized with scheduled ones
    pub fn trigger_reset(&self) -> RemediationOutcome {
        let inner = &self.inner;
        inner.diagnostics.info("Manual reset requested");
        inner.monitor.pause();
        let outcome = inner.remediate(ResetReason::Manual);
        inner.monitor.resume();
        outcome
    }

    /// Fresh health sample of the helper
    pub fn health(&self) -> HelperProcessHealth {
        self.inner.probe.probe(&self.inner.config.helper_process)
    }

    pub fn status(&self) -> GuardStatus {
        self.inner.status.lock().clone()
    }

    pub fn status_text(&self) -> String {
        self.status().to_string()
    }

    pub fn copy_count(&self) -> u64 {
        self.inner.monitor.copy_count()
    }

    pub fn reset_count(&self) -> u64 {
        self.inner.remediation.completed_runs()
    }

    pub fn config(&self) -> &GuardConfig {
        &self.inner.config
    }
}

impl Drop for ClipGuard {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl GuardInner {
    fn handle_poll(&self, event: PollEvent) {
        match event.outcome {
            PollOutcome::Inaccessible => {
                self.diagnostics.warn(&format!(
                    "Clipboard inaccessible (read failed or exceeded {}ms)",
                    self.config.read_timeout.as_millis()
                ));
                self.set_message(format!("Clipboard inaccessible at {}", Local::now().format("%H:%M:%S")));
                self.remediate(ResetReason::ClipboardInaccessible);
            }
            PollOutcome::NoText | PollOutcome::Unchanged => {}
            PollOutcome::Changed(change) => {
                let (hash, preview) = event
                    .snapshot
                    .as_ref()
                    .map(|s| {
                        (
                            s.content_hash.clone().unwrap_or_else(|| "-".to_string()),
                            s.preview(PREVIEW_LEN),
                        )
                    })
                    .unwrap_or_else(|| ("-".to_string(), String::new()));
                self.diagnostics.info(&format!(
                    "Copy #{} detected | seq={} | hash={} | len={} | \"{}\"",
                    change.copy_count,
                    change.sequence_number,
                    hash,
                    change.text.chars().count(),
                    preview
                ));
                if change.signal_missing {
                    self.diagnostics.warn(&format!(
                        "Text changed but OS signal missing (sequence {} unchanged)",
                        change.sequence_number
                    ));
                }

                self.status.lock().copies = change.copy_count;
                self.emit_status();

                let health = self.record_health();
                if needs_restart(&health) {
                    self.diagnostics.warn(&format!(
                        "Helper needs restart: {}",
                        health.restart_reasons().join(", ")
                    ));
                    self.remediate(ResetReason::Unhealthy);
                } else if change.reset_due {
                    self.diagnostics.info(&format!(
                        "Scheduled reset after {} copies",
                        change.copy_count
                    ));
                    self.remediate(ResetReason::Scheduled);
                }
            }
        }
    }

    fn handle_event(&self, event: ClipboardEvent) {
        let snapshot = &event.snapshot;
        let line = format!(
            "Clipboard event: {} | seq={} | hash={} | len={} | formats=[{}] | latency={}ms",
            event.kind.describe(),
            snapshot.sequence_number,
            snapshot.content_hash.as_deref().unwrap_or("-"),
            snapshot.text_len(),
            snapshot.format_list(),
            event.latency.as_millis()
        );
        if event.kind.is_anomaly() {
            self.diagnostics.warn(&line);
        } else {
            self.diagnostics.diag(&line);
        }
    }

    fn remediate(&self, reason: ResetReason) -> RemediationOutcome {
        let outcome = self.remediation.reset(reason);
        match &outcome {
            RemediationOutcome::Completed(report) => {
                for failure in &report.termination_failures {
                    self.diagnostics.warn(failure);
                }
                if report.recovered {
                    self.diagnostics.ok(&report.summary());
                    self.diagnostics
                        .diag(&format!("Health after reset: {}", report.health_after.summary()));
                    self.set_message(format!(
                        "Last reset {} ({})",
                        Local::now().format("%H:%M:%S"),
                        reason
                    ));
                } else {
                    self.diagnostics.error(&report.summary());
                    self.set_message(format!("Reset failed ({})", reason));
                }
                self.status.lock().resets = self.remediation.completed_runs();
                self.emit_status();
            }
            RemediationOutcome::Coalesced => {
                self.diagnostics.info(&format!(
                    "Reset ({}) skipped: another reset in progress",
                    reason
                ));
            }
            RemediationOutcome::Failed(message) => {
                self.diagnostics
                    .error(&format!("Reset ({}) aborted: {}", reason, message));
                self.set_message(format!("Reset error: {}", message));
            }
        }
        outcome
    }

    fn record_health(&self) -> HelperProcessHealth {
        let health = self.probe.probe(&self.config.helper_process);
        self.diagnostics
            .diag(&format!("{} health: {}", self.config.helper_process, health.summary()));
        health
    }

    fn set_message(&self, message: String) {
        self.status.lock().last_message = Some(message);
        self.emit_status();
    }

    fn emit_status(&self) {
        let text = self.status.lock().to_string();
        let sink = self.status_sink.read().clone();
        if let Some(sink) = sink {
            sink(&text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipboard::{ChangeKind, ClipboardError, ClipboardFormat, ClipboardSnapshot};
    use crate::process::probe::tests::{sample, FakeHost};
    use std::collections::VecDeque;
    use std::fs;
    use std::time::Instant;

    /// Serves queued reads; `None` simulates a timed-out read
    struct QueuedClipboard {
        reads: Mutex<VecDeque<Option<String>>>,
        sequence: Mutex<u32>,
    }

    impl QueuedClipboard {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                reads: Mutex::new(VecDeque::new()),
                sequence: Mutex::new(0),
            })
        }

        fn push(&self, read: Option<&str>) {
            self.reads.lock().push_back(read.map(str::to_string));
            *self.sequence.lock() += 1;
        }
    }

    impl ClipboardSource for QueuedClipboard {
        fn sequence_number(&self) -> u32 {
            *self.sequence.lock()
        }
        fn enumerate_formats(&self) -> Vec<ClipboardFormat> {
            Vec::new()
        }
        fn read_text(&self) -> Result<String, ClipboardError> {
            match self.reads.lock().pop_front().flatten() {
                Some(text) => Ok(text),
                None => Err(ClipboardError::Timeout(Duration::from_secs(2))),
            }
        }
    }

    fn healthy_host() -> Arc<FakeHost> {
        let host = FakeHost::default();
        host.processes.lock().insert(10, sample(10));
        Arc::new(host)
    }

    fn config(log_dir: PathBuf) -> GuardConfig {
        GuardConfig {
            poll_interval: Duration::from_secs(60),
            read_timeout: Duration::from_secs(1),
            reset_threshold: 7,
            helper_process: "rdpclip.exe".into(),
            settle_delay: Duration::ZERO,
            log_dir,
            log_base_name: "rdpclip_diag".into(),
            log_retention: 5,
            role: Role::Local,
        }
    }

    #[test]
    fn seventh_distinct_copy_triggers_exactly_one_reset() {
        let dir = tempfile::tempdir().unwrap();
        let clipboard = QueuedClipboard::new();
        let guard = ClipGuard::new(config(dir.path().to_path_buf()), clipboard.clone(), healthy_host());

        for text in ["a", "b", "c", "d", "e", "f"] {
            clipboard.push(Some(text));
            guard.poll_once();
        }
        assert_eq!(guard.copy_count(), 6);
        assert_eq!(guard.reset_count(), 0);

        clipboard.push(Some("g"));
        guard.poll_once();
        assert_eq!(guard.copy_count(), 7);
        assert_eq!(guard.reset_count(), 1);

        let status = guard.status();
        assert_eq!(status.copies, 7);
        assert_eq!(status.resets, 1);
    }

    #[test]
    fn duplicate_reads_do_not_count() {
        let dir = tempfile::tempdir().unwrap();
        let clipboard = QueuedClipboard::new();
        let guard = ClipGuard::new(config(dir.path().to_path_buf()), clipboard.clone(), healthy_host());

        for text in ["a", "a", "a", "b", "b", "a"] {
            clipboard.push(Some(text));
            guard.poll_once();
        }
        assert_eq!(guard.copy_count(), 3);
        assert_eq!(guard.reset_count(), 0);
    }

    #[test]
    fn failed_read_always_triggers_reset() {
        let dir = tempfile::tempdir().unwrap();
        let clipboard = QueuedClipboard::new();
        let guard = ClipGuard::new(config(dir.path().to_path_buf()), clipboard.clone(), healthy_host());

        clipboard.push(None);
        guard.poll_once();
        assert_eq!(guard.copy_count(), 0);
        assert_eq!(guard.reset_count(), 1);

        for text in ["x", "y"] {
            clipboard.push(Some(text));
            guard.poll_once();
        }
        clipboard.push(None);
        guard.poll_once();
        assert_eq!(guard.copy_count(), 2);
        assert_eq!(guard.reset_count(), 2);
        assert!(guard.status_text().contains("Resets: 2"));
    }

    #[test]
    fn unhealthy_helper_is_reset_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let host = FakeHost::default();
        let mut leaking = sample(10);
        leaking.handle_count = 4000;
        host.processes.lock().insert(10, leaking);

        let clipboard = QueuedClipboard::new();
        let guard = ClipGuard::new(config(dir.path().to_path_buf()), clipboard.clone(), Arc::new(host));

        clipboard.push(Some("copied"));
        guard.poll_once();
        assert_eq!(guard.reset_count(), 1);
        // Relaunched helper is healthy
        assert!(guard.health().running);
        assert_eq!(guard.health().handle_count, 250);
    }

    #[test]
    fn manual_trigger_runs_reset() {
        let dir = tempfile::tempdir().unwrap();
        let guard = ClipGuard::new(config(dir.path().to_path_buf()), QueuedClipboard::new(), healthy_host());

        let outcome = guard.trigger_reset();
        assert!(matches!(outcome, RemediationOutcome::Completed(ref r) if r.recovered));
        assert_eq!(guard.reset_count(), 1);
        assert!(guard.status_text().contains("(manual)"));
    }

    #[test]
    fn diagnostics_toggle_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let guard = ClipGuard::new(config(dir.path().to_path_buf()), QueuedClipboard::new(), healthy_host());

        guard.disable_diagnostics();
        guard.enable_diagnostics().unwrap();
        let first = guard.session_path().expect("session file");
        guard.enable_diagnostics().unwrap();
        assert_eq!(guard.session_path(), Some(first.clone()));
        assert!(guard.status_text().contains("Diagnostics: on"));

        guard.disable_diagnostics();
        guard.disable_diagnostics();
        assert!(!guard.diagnostics_enabled());
        assert!(guard.status_text().contains("Diagnostics: off"));

        let sessions = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(sessions, 1);
        let content = fs::read_to_string(first).unwrap();
        assert!(content.contains("INITIAL STATE"));
        assert!(content.contains("rdpclip.exe health: PID=10"));
        assert_eq!(content.matches("SESSION END").count(), 1);
    }

    #[test]
    fn each_diagnostic_session_gets_its_own_file() {
        let dir = tempfile::tempdir().unwrap();
        let guard = ClipGuard::new(config(dir.path().to_path_buf()), QueuedClipboard::new(), healthy_host());

        guard.enable_diagnostics().unwrap();
        let first = guard.session_path().unwrap();
        guard.disable_diagnostics();
        guard.enable_diagnostics().unwrap();
        let second = guard.session_path().unwrap();
        guard.disable_diagnostics();

        assert_ne!(first, second);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 2);
        for path in [first, second] {
            let content = fs::read_to_string(path).unwrap();
            assert_eq!(content.matches("RDP CLIPBOARD DIAGNOSTIC SESSION").count(), 1);
            assert_eq!(content.matches("SESSION END").count(), 1);
        }
    }

    #[test]
    fn session_records_polls_events_and_resets() {
        let dir = tempfile::tempdir().unwrap();
        let clipboard = QueuedClipboard::new();
        let guard = ClipGuard::new(config(dir.path().to_path_buf()), clipboard.clone(), healthy_host());
        guard.enable_diagnostics().unwrap();
        let path = guard.session_path().unwrap();

        clipboard.push(Some("hello"));
        guard.poll_once();
        clipboard.push(None);
        guard.poll_once();

        let now = Local::now();
        guard.inner.handle_event(ClipboardEvent {
            snapshot: ClipboardSnapshot::new(143, Some("hello".into()), vec![ClipboardFormat::new(8, "CF_DIB")], now),
            kind: ChangeKind::NonTextChange,
            latency: Instant::now().elapsed(),
        });
        guard.inner.handle_event(ClipboardEvent {
            snapshot: ClipboardSnapshot::new(143, Some("other".into()), Vec::new(), now),
            kind: ChangeKind::SignalMissing,
            latency: Duration::from_millis(3),
        });
        guard.shutdown();

        let content = fs::read_to_string(path).unwrap();
        assert!(content.contains("[INFO] Copy #1 detected"));
        assert!(content.contains("[WARN] Clipboard inaccessible"));
        assert!(content.contains("[OK] Reset (clipboard inaccessible)"));
        assert!(content.contains("[DIAG] Clipboard event: non-text change | seq=143"));
        assert!(content.contains("formats=[8:CF_DIB]"));
        assert!(content.contains("[WARN] Clipboard event: text changed but OS signal missing"));
    }

    #[test]
    fn status_sink_receives_updates() {
        let dir = tempfile::tempdir().unwrap();
        let clipboard = QueuedClipboard::new();
        let guard = ClipGuard::new(config(dir.path().to_path_buf()), clipboard.clone(), healthy_host());
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = Arc::clone(&seen);
        guard.set_status_sink(move |text| sink.lock().push(text.to_string()));

        clipboard.push(Some("one"));
        guard.poll_once();

        let seen = seen.lock();
        assert!(seen.iter().any(|s| s.starts_with("Copies: 1 | Resets: 0")));
    }

    #[test]
    fn background_start_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path().to_path_buf());
        cfg.poll_interval = Duration::from_millis(20);
        let clipboard = QueuedClipboard::new();
        clipboard.push(Some("bg"));
        let guard = ClipGuard::new(cfg, clipboard, healthy_host());

        guard.start();
        let deadline = Instant::now() + Duration::from_secs(2);
        while guard.copy_count() == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        guard.shutdown();
        guard.shutdown();
        assert_eq!(guard.copy_count(), 1);
    }
}
