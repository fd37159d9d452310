//! RdpClipGuard - Diagnostics module
//!
//! Every record goes to the process log; while diagnostic mode is on it is
//! also appended to the active session file.

pub mod recorder;
pub mod role;

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;

pub use recorder::{cleanup_sessions, Category, DiagnosticRecorder, RecorderError};
pub use role::Role;

/// Record sink shared by the polling, event and remediation paths
#[derive(Default)]
pub struct Diagnostics {
    recorder: RwLock<Option<Arc<DiagnosticRecorder>>>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit one record
    pub fn record(&self, category: Option<Category>, message: &str) {
        match category {
            Some(Category::Error) => log::error!("[Diagnostics] {}", message),
            Some(Category::Warn) => log::warn!("[Diagnostics] {}", message),
            Some(Category::Diag) => log::debug!("[Diagnostics] {}", message),
            Some(Category::Info) | Some(Category::Ok) | None => {
                log::info!("[Diagnostics] {}", message)
            }
        }
        if let Some(recorder) = self.recorder.read().as_ref() {
            recorder.record(category, message);
        }
    }

    pub fn info(&self, message: &str) {
        self.record(Some(Category::Info), message);
    }

    pub fn ok(&self, message: &str) {
        self.record(Some(Category::Ok), message);
    }

    pub fn warn(&self, message: &str) {
        self.record(Some(Category::Warn), message);
    }

    pub fn error(&self, message: &str) {
        self.record(Some(Category::Error), message);
    }

    pub fn diag(&self, message: &str) {
        self.record(Some(Category::Diag), message);
    }

    /// Section header; only meaningful in the session file
    pub fn section(&self, title: &str) {
        if let Some(recorder) = self.recorder.read().as_ref() {
            recorder.section(title);
        }
    }

    /// Route records to `recorder` from now on, closing any previous session
    pub fn attach(&self, recorder: DiagnosticRecorder) {
        let previous = self.recorder.write().replace(Arc::new(recorder));
        if let Some(previous) = previous {
            previous.close();
        }
    }

    /// Stop writing to the session file and close it
    pub fn detach(&self) -> Option<PathBuf> {
        let recorder = self.recorder.write().take()?;
        recorder.close();
        Some(recorder.path().to_path_buf())
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.read().is_some()
    }

    pub fn session_path(&self) -> Option<PathBuf> {
        self.recorder
            .read()
            .as_ref()
            .map(|recorder| recorder.path().to_path_buf())
    }
}
