//! RdpClipGuard - Clipboard polling module
//!
//! Periodically reads clipboard text and feeds the change detector. This is
//! the always-on strategy; it only sees text.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Local;
use parking_lot::Mutex;

use super::detector::{DetectorState, PollOutcome};
use super::models::ClipboardSnapshot;
use super::native::ClipboardSource;
use super::reader::read_text_bounded;

/// Default polling interval
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Default bound on a single clipboard read
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Result of one polling tick
#[derive(Debug, Clone)]
pub struct PollEvent {
    pub outcome: PollOutcome,
    /// Present for counted text changes
    pub snapshot: Option<ClipboardSnapshot>,
}

/// One observation step, shared with the polling thread
struct Poller {
    source: Arc<dyn ClipboardSource>,
    state: Mutex<DetectorState>,
    read_timeout: Duration,
}

impl Poller {
    fn tick(&self) -> PollEvent {
        let sequence_before = self.source.sequence_number();
        let read = read_text_bounded(&self.source, self.read_timeout);
        let sequence_after = self.source.sequence_number();
        let outcome = self
            .state
            .lock()
            .observe_read(read, sequence_before, sequence_after);

        let snapshot = match &outcome {
            PollOutcome::Changed(change) => Some(ClipboardSnapshot::new(
                change.sequence_number,
                Some(change.text.clone()),
                Vec::new(),
                Local::now(),
            )),
            _ => None,
        };

        PollEvent { outcome, snapshot }
    }
}

/// Clipboard polling monitor
pub struct ClipboardMonitor {
    /// Whether running
    running: Arc<AtomicBool>,
    /// Whether paused (used while a remediation is in progress)
    paused: Arc<AtomicBool>,
    poll_interval: Duration,
    poller: Arc<Poller>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ClipboardMonitor {
    /// Create a new monitor
    pub fn new(
        source: Arc<dyn ClipboardSource>,
        poll_interval: Duration,
        read_timeout: Duration,
        reset_threshold: u64,
    ) -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            paused: Arc::new(AtomicBool::new(false)),
            poll_interval,
            poller: Arc::new(Poller {
                source,
                state: Mutex::new(DetectorState::new(reset_threshold)),
                read_timeout,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Start polling
    ///
    /// callback: called with the outcome of every tick
    pub fn start<F>(&self, callback: F)
    where
        F: Fn(PollEvent) + Send + 'static,
    {
        if self.running.swap(true, Ordering::SeqCst) {
            log::warn!("[Monitor] Clipboard monitor is already running");
            return;
        }

        let running = Arc::clone(&self.running);
        let paused = Arc::clone(&self.paused);
        let poller = Arc::clone(&self.poller);
        let interval = self.poll_interval;

        let spawned = thread::Builder::new()
            .name("clipboard-poll".into())
            .spawn(move || {
                log::info!("[Monitor] Clipboard polling started with {}ms interval", interval.as_millis());

                while running.load(Ordering::SeqCst) {
                    if !paused.load(Ordering::SeqCst) {
                        let result = panic::catch_unwind(AssertUnwindSafe(|| {
                            callback(poller.tick());
                        }));
                        if let Err(payload) = result {
                            log::error!("[Monitor] Detection tick panicked: {}", panic_message(&payload));
                        }
                    }
                    // Woken early by stop()
                    thread::park_timeout(interval);
                }

                log::info!("[Monitor] Clipboard polling stopped");
            });

        match spawned {
            Ok(handle) => *self.worker.lock() = Some(handle),
            Err(e) => {
                log::error!("[Monitor] Failed to spawn polling thread: {}", e);
                self.running.store(false, Ordering::SeqCst);
            }
        }
    }

    /// Stop polling. Safe to call repeatedly.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().take() {
            handle.thread().unpark();
        }
    }

    /// Pause polling
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Resume polling
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run one observation on the calling thread
    pub fn tick(&self) -> PollEvent {
        self.poller.tick()
    }

    /// CopyCounter value
    pub fn copy_count(&self) -> u64 {
        self.poller.state.lock().copy_count()
    }
}

impl Drop for ClipboardMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Extract a readable message from a panic payload
pub(crate) fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
