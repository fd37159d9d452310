//! RdpClipGuard - Clipboard module
//!
//! Native clipboard access and the two change-detection strategies

pub mod detector;
pub mod listener;
pub mod models;
pub mod monitor;
pub mod native;
pub mod reader;

pub use detector::{ChangeKind, DetectorState, PollOutcome, TextChange};
pub use listener::{ClipboardEvent, ClipboardListener, EventWatcher};
pub use models::{short_hash, ClipboardFormat, ClipboardSnapshot};
pub use monitor::{ClipboardMonitor, PollEvent};
pub use native::{ClipboardError, ClipboardSource, SystemClipboard};
