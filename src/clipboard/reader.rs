//! RdpClipGuard - Bounded clipboard reads
//!
//! The clipboard can be held open indefinitely by another application, so
//! every text read runs on a short-lived worker thread and is abandoned
//! once the timeout elapses.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::native::{ClipboardError, ClipboardSource};

/// Read clipboard text with a hard timeout.
///
/// Returns `None` when the read times out or the clipboard cannot be
/// accessed. A worker that outlives the timeout is detached; its result is
/// dropped with the channel.
pub fn read_text_bounded(source: &Arc<dyn ClipboardSource>, timeout: Duration) -> Option<String> {
    match try_read_text_bounded(source, timeout) {
        Ok(text) => Some(text),
        Err(e) => {
            log::debug!("[Reader] Clipboard read failed: {}", e);
            None
        }
    }
}

/// Like [`read_text_bounded`] but keeps the failure reason
pub fn try_read_text_bounded(
    source: &Arc<dyn ClipboardSource>,
    timeout: Duration,
) -> Result<String, ClipboardError> {
    let (tx, rx) = mpsc::sync_channel(1);
    let source = Arc::clone(source);

    thread::Builder::new()
        .name("clipboard-read".into())
        .spawn(move || {
            let _ = tx.send(source.read_text());
        })
        .map_err(|e| ClipboardError::Unavailable(format!("failed to spawn reader: {}", e)))?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(ClipboardError::Timeout(timeout)),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(ClipboardError::Unavailable(
            "reader thread exited without a result".into(),
        )),
    }
}
