//! RdpClipGuard - Event-driven clipboard listener
//!
//! Diagnostic-mode strategy. A hidden message-only window receives the OS
//! clipboard broadcast; each notification is turned into a full snapshot
//! (sequence number, formats, text) and classified against the previous one.
//! Sees every change kind, including images and file lists.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Local;
use parking_lot::Mutex;

use super::detector::{ChangeKind, EventTracker};
use super::models::ClipboardSnapshot;
use super::monitor::panic_message;
use super::native::{ClipboardError, ClipboardSource};
use super::reader::read_text_bounded;

/// A classified clipboard notification
#[derive(Debug, Clone)]
pub struct ClipboardEvent {
    pub snapshot: ClipboardSnapshot,
    pub kind: ChangeKind,
    /// Time from OS notification to finished snapshot
    pub latency: Duration,
}

/// Builds and classifies snapshots for incoming notifications
pub struct EventWatcher {
    source: Arc<dyn ClipboardSource>,
    tracker: Mutex<EventTracker>,
    read_timeout: Duration,
}

impl EventWatcher {
    pub fn new(source: Arc<dyn ClipboardSource>, read_timeout: Duration) -> Self {
        Self {
            source,
            tracker: Mutex::new(EventTracker::new()),
            read_timeout,
        }
    }

    /// Handle one notification delivered at `notified_at`
    pub fn process_notification(&self, notified_at: Instant) -> ClipboardEvent {
        let sequence_before = self.source.sequence_number();
        let formats = self.source.enumerate_formats();
        let text = read_text_bounded(&self.source, self.read_timeout);
        let sequence_after = self.source.sequence_number();
        let snapshot = ClipboardSnapshot::new(sequence_after, text, formats, Local::now());
        let kind = self.tracker.lock().track_read(&snapshot, sequence_before);

        ClipboardEvent {
            snapshot,
            kind,
            latency: notified_at.elapsed(),
        }
    }

    /// Start a fresh baseline
    pub fn reset(&self) {
        self.tracker.lock().reset();
    }
}

/// Clipboard change listener
///
/// Owns the OS subscription and the thread that consumes its notifications.
pub struct ClipboardListener {
    watcher: Arc<EventWatcher>,
    subscription: Mutex<Option<platform::Subscription>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl ClipboardListener {
    pub fn new(source: Arc<dyn ClipboardSource>, read_timeout: Duration) -> Self {
        Self {
            watcher: Arc::new(EventWatcher::new(source, read_timeout)),
            subscription: Mutex::new(None),
            consumer: Mutex::new(None),
        }
    }

    pub fn watcher(&self) -> &Arc<EventWatcher> {
        &self.watcher
    }

    pub fn is_active(&self) -> bool {
        self.subscription.lock().is_some()
    }

    /// Subscribe to OS notifications and start delivering events.
    /// Starting an active listener is a no-op.
    pub fn start<F>(&self, callback: F) -> Result<(), ClipboardError>
    where
        F: Fn(ClipboardEvent) + Send + 'static,
    {
        let mut subscription = self.subscription.lock();
        if subscription.is_some() {
            return Ok(());
        }
        // A new session never compares against the previous one
        self.watcher.reset();

        let (tx, rx) = mpsc::channel::<Instant>();
        *subscription = Some(platform::subscribe(tx)?);

        let watcher = Arc::clone(&self.watcher);
        let consumer = thread::Builder::new()
            .name("clipboard-events".into())
            .spawn(move || {
                // Ends when the subscription drops its sender
                for notified_at in rx {
                    let result = panic::catch_unwind(AssertUnwindSafe(|| {
                        callback(watcher.process_notification(notified_at));
                    }));
                    if let Err(payload) = result {
                        log::error!("[Listener] Event handling panicked: {}", panic_message(&payload));
                    }
                }
                log::debug!("[Listener] Event consumer exited");
            })
            .map_err(|e| ClipboardError::Listener(format!("failed to spawn consumer: {}", e)))?;

        *self.consumer.lock() = Some(consumer);
        log::info!("[Listener] Clipboard change listener registered");
        Ok(())
    }

    /// Unsubscribe. Safe to call repeatedly and from drop.
    pub fn stop(&self) {
        if let Some(mut subscription) = self.subscription.lock().take() {
            subscription.stop();
            log::info!("[Listener] Clipboard change listener removed");
        }
        // Detach: the consumer may be inside a bounded read
        self.consumer.lock().take();
    }
}

impl Drop for ClipboardListener {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(windows)]
mod platform {
    use std::cell::RefCell;
    use std::sync::mpsc::{self, Sender};
    use std::thread::{self, JoinHandle};
    use std::time::Instant;

    use windows::core::w;
    use windows::Win32::Foundation::{HWND, LPARAM, LRESULT, WPARAM};
    use windows::Win32::System::LibraryLoader::GetModuleHandleW;
    use windows::Win32::UI::WindowsAndMessaging::{
        CreateWindowExW, DefWindowProcW, DestroyWindow, DispatchMessageW, GetMessageW,
        PostMessageW, PostQuitMessage, RegisterClassW, TranslateMessage, HWND_MESSAGE, MSG,
        WINDOW_EX_STYLE, WINDOW_STYLE, WM_CLIPBOARDUPDATE, WM_CLOSE, WM_DESTROY, WNDCLASSW,
    };

    use crate::clipboard::native::{
        register_change_listener, unregister_change_listener, ClipboardError,
    };

    thread_local! {
        /// Notification sink for the window living on this thread
        static NOTIFY: RefCell<Option<Sender<Instant>>> = const { RefCell::new(None) };
    }

    /// Message-only window subscribed to clipboard broadcasts
    pub struct Subscription {
        /// HWND stored as an integer so the handle can cross threads
        hwnd: isize,
        thread: Option<JoinHandle<()>>,
    }

    impl Subscription {
        pub fn stop(&mut self) {
            let Some(thread) = self.thread.take() else {
                return;
            };
            unsafe {
                let _ = PostMessageW(HWND(self.hwnd as *mut _), WM_CLOSE, WPARAM(0), LPARAM(0));
            }
            if thread.join().is_err() {
                log::warn!("[Listener] Message loop thread panicked");
            }
        }
    }

    impl Drop for Subscription {
        fn drop(&mut self) {
            self.stop();
        }
    }

    pub fn subscribe(tx: Sender<Instant>) -> Result<Subscription, ClipboardError> {
        let (ready_tx, ready_rx) = mpsc::channel::<Result<isize, ClipboardError>>();

        let thread = thread::Builder::new()
            .name("clipboard-listener".into())
            .spawn(move || {
                NOTIFY.with(|n| *n.borrow_mut() = Some(tx));

                let hwnd = match create_message_window() {
                    Ok(hwnd) => hwnd,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if !register_change_listener(hwnd) {
                    unsafe {
                        let _ = DestroyWindow(hwnd);
                    }
                    let _ = ready_tx.send(Err(ClipboardError::Listener(
                        "AddClipboardFormatListener failed".into(),
                    )));
                    return;
                }
                let _ = ready_tx.send(Ok(hwnd.0 as isize));

                let mut msg = MSG::default();
                unsafe {
                    while GetMessageW(&mut msg, None, 0, 0).0 > 0 {
                        let _ = TranslateMessage(&msg);
                        DispatchMessageW(&msg);
                    }
                }

                // Dropping the sender ends the consumer thread
                NOTIFY.with(|n| n.borrow_mut().take());
            })
            .map_err(|e| ClipboardError::Listener(format!("failed to spawn message loop: {}", e)))?;

        let hwnd = ready_rx
            .recv()
            .map_err(|_| ClipboardError::Listener("message loop exited during setup".into()))??;

        Ok(Subscription {
            hwnd,
            thread: Some(thread),
        })
    }

    fn create_message_window() -> Result<HWND, ClipboardError> {
        unsafe {
            let instance =
                GetModuleHandleW(None).map_err(|e| ClipboardError::Listener(e.to_string()))?;
            let class_name = w!("RdpClipGuardListener");

            let wc = WNDCLASSW {
                lpfnWndProc: Some(wndproc),
                hInstance: instance.into(),
                lpszClassName: class_name,
                ..Default::default()
            };
            // Zero when the class survives from an earlier subscription
            RegisterClassW(&wc);

            CreateWindowExW(
                WINDOW_EX_STYLE::default(),
                class_name,
                w!("RdpClipGuard clipboard listener"),
                WINDOW_STYLE::default(),
                0,
                0,
                0,
                0,
                HWND_MESSAGE,
                None,
                instance,
                None,
            )
            .map_err(|e| ClipboardError::Listener(e.to_string()))
        }
    }

    unsafe extern "system" fn wndproc(hwnd: HWND, msg: u32, wparam: WPARAM, lparam: LPARAM) -> LRESULT {
        match msg {
            WM_CLIPBOARDUPDATE => {
                NOTIFY.with(|n| {
                    if let Some(tx) = n.borrow().as_ref() {
                        let _ = tx.send(Instant::now());
                    }
                });
                LRESULT(0)
            }
            WM_CLOSE => {
                unregister_change_listener(hwnd);
                let _ = DestroyWindow(hwnd);
                LRESULT(0)
            }
            WM_DESTROY => {
                PostQuitMessage(0);
                LRESULT(0)
            }
            _ => DefWindowProcW(hwnd, msg, wparam, lparam),
        }
    }
}

#[cfg(not(windows))]
mod platform {
    use std::sync::mpsc::Sender;
    use std::time::Instant;

    use crate::clipboard::native::ClipboardError;

    pub struct Subscription;

    impl Subscription {
        pub fn stop(&mut self) {}
    }

    pub fn subscribe(_tx: Sender<Instant>) -> Result<Subscription, ClipboardError> {
        Err(ClipboardError::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipboard::models::ClipboardFormat;

    /// Clipboard whose state tests set directly
    struct FakeClipboard {
        state: Mutex<(u32, Option<String>, Vec<ClipboardFormat>)>,
    }

    impl FakeClipboard {
        fn new() -> Self {
            Self {
                state: Mutex::new((0, None, Vec::new())),
            }
        }

        fn set(&self, sequence: u32, text: Option<&str>, formats: Vec<ClipboardFormat>) {
            *self.state.lock() = (sequence, text.map(str::to_string), formats);
        }
    }

    impl ClipboardSource for FakeClipboard {
        fn sequence_number(&self) -> u32 {
            self.state.lock().0
        }
        fn enumerate_formats(&self) -> Vec<ClipboardFormat> {
            self.state.lock().2.clone()
        }
        fn read_text(&self) -> Result<String, ClipboardError> {
            self.state
                .lock()
                .1
                .clone()
                .ok_or_else(|| ClipboardError::Unavailable("locked".into()))
        }
    }

    #[test]
    fn notifications_capture_non_text_changes() {
        let clipboard = Arc::new(FakeClipboard::new());
        let source: Arc<dyn ClipboardSource> = clipboard.clone();
        let watcher = EventWatcher::new(source, Duration::from_secs(1));

        clipboard.set(142, Some("report"), vec![ClipboardFormat::new(13, "CF_UNICODETEXT")]);
        let baseline = watcher.process_notification(Instant::now());
        assert_eq!(baseline.kind, ChangeKind::Baseline);
        assert_eq!(baseline.snapshot.sequence_number, 142);

        // An image copied on top keeps the text but bumps the sequence
        clipboard.set(
            143,
            Some("report"),
            vec![
                ClipboardFormat::new(13, "CF_UNICODETEXT"),
                ClipboardFormat::new(8, "CF_DIB"),
            ],
        );
        let image = watcher.process_notification(Instant::now());
        assert_eq!(image.kind, ChangeKind::NonTextChange);
        assert_eq!(image.snapshot.formats.len(), 2);
        assert!(!image.kind.is_anomaly());
    }

    #[test]
    fn text_change_without_sequence_bump_is_anomaly() {
        let clipboard = Arc::new(FakeClipboard::new());
        let source: Arc<dyn ClipboardSource> = clipboard.clone();
        let watcher = EventWatcher::new(source, Duration::from_secs(1));

        clipboard.set(142, Some("one"), Vec::new());
        watcher.process_notification(Instant::now());
        clipboard.set(142, Some("two"), Vec::new());
        let event = watcher.process_notification(Instant::now());

        assert_eq!(event.kind, ChangeKind::SignalMissing);
        assert!(event.kind.is_anomaly());
    }

    #[test]
    fn image_copied_over_text_is_non_text() {
        let clipboard = Arc::new(FakeClipboard::new());
        let source: Arc<dyn ClipboardSource> = clipboard.clone();
        let watcher = EventWatcher::new(source, Duration::from_secs(1));

        clipboard.set(142, Some("report"), vec![ClipboardFormat::new(13, "CF_UNICODETEXT")]);
        watcher.process_notification(Instant::now());

        // The image replaces the text formats entirely
        clipboard.set(
            143,
            Some(""),
            vec![ClipboardFormat::new(8, "CF_DIB"), ClipboardFormat::new(2, "CF_BITMAP")],
        );
        let event = watcher.process_notification(Instant::now());
        assert_eq!(event.kind, ChangeKind::NonTextChange);
        assert_eq!(event.snapshot.format_list(), "8:CF_DIB, 2:CF_BITMAP");
    }

    /// Copy lands while the text read is in flight
    struct RacingClipboard {
        sequence: Mutex<u32>,
        text: Mutex<String>,
        copy_on_read: Mutex<Option<String>>,
    }

    impl ClipboardSource for RacingClipboard {
        fn sequence_number(&self) -> u32 {
            *self.sequence.lock()
        }
        fn enumerate_formats(&self) -> Vec<ClipboardFormat> {
            Vec::new()
        }
        fn read_text(&self) -> Result<String, ClipboardError> {
            if let Some(text) = self.copy_on_read.lock().take() {
                *self.sequence.lock() += 1;
                *self.text.lock() = text;
            }
            Ok(self.text.lock().clone())
        }
    }

    #[test]
    fn copy_during_read_is_not_a_missed_signal() {
        let clipboard = Arc::new(RacingClipboard {
            sequence: Mutex::new(10),
            text: Mutex::new("a".into()),
            copy_on_read: Mutex::new(None),
        });
        let source: Arc<dyn ClipboardSource> = clipboard.clone();
        let watcher = EventWatcher::new(source, Duration::from_secs(1));
        assert_eq!(watcher.process_notification(Instant::now()).kind, ChangeKind::Baseline);

        *clipboard.copy_on_read.lock() = Some("b".into());
        let event = watcher.process_notification(Instant::now());
        assert_eq!(event.kind, ChangeKind::TextChanged);
        assert_eq!(event.snapshot.sequence_number, 11);

        // The notification for that copy arrives afterwards
        let next = watcher.process_notification(Instant::now());
        assert_eq!(next.kind, ChangeKind::Duplicate);
    }

    #[test]
    fn restarting_listener_starts_new_baseline() {
        let clipboard = Arc::new(FakeClipboard::new());
        let source: Arc<dyn ClipboardSource> = clipboard.clone();
        let listener = ClipboardListener::new(source, Duration::from_secs(1));

        clipboard.set(7, Some("before"), Vec::new());
        listener.watcher().process_notification(Instant::now());

        // Subscription may be unsupported here; the baseline resets either way
        let _ = listener.start(|_| {});
        listener.stop();

        clipboard.set(7, Some("after"), Vec::new());
        let event = listener.watcher().process_notification(Instant::now());
        assert_eq!(event.kind, ChangeKind::Baseline);
    }

    #[test]
    fn unreadable_text_is_reported() {
        let clipboard = Arc::new(FakeClipboard::new());
        let source: Arc<dyn ClipboardSource> = clipboard.clone();
        let watcher = EventWatcher::new(source, Duration::from_secs(1));

        clipboard.set(5, None, Vec::new());
        let event = watcher.process_notification(Instant::now());
        assert_eq!(event.kind, ChangeKind::Unreadable);
        assert!(event.snapshot.content_hash.is_none());
    }

    #[test]
    fn stop_is_idempotent_without_start() {
        let listener = ClipboardListener::new(Arc::new(FakeClipboard::new()), Duration::from_secs(1));
        assert!(!listener.is_active());
        listener.stop();
        listener.stop();
        assert!(!listener.is_active());
    }
}
