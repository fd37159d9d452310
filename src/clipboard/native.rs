//! RdpClipGuard - Native clipboard interface
//!
//! Thin typed wrapper over the platform clipboard: sequence number,
//! format enumeration, text read and change-listener registration.

use std::time::Duration;

use arboard::Clipboard;

use super::models::ClipboardFormat;

/// Clipboard error type
#[derive(Debug, thiserror::Error)]
pub enum ClipboardError {
    #[error("Clipboard unavailable: {0}")]
    Unavailable(String),
    #[error("Clipboard read timed out after {0:?}")]
    Timeout(Duration),
    #[error("Clipboard listener error: {0}")]
    Listener(String),
    #[error("Clipboard change notifications are not supported on this platform")]
    Unsupported,
}

/// Source of clipboard state
///
/// The system implementation talks to the OS; tests inject scripted fakes.
pub trait ClipboardSource: Send + Sync {
    /// Counter the OS bumps on every clipboard mutation of any kind
    fn sequence_number(&self) -> u32;

    /// Formats currently offered, in enumeration order.
    /// Empty when the clipboard cannot be opened.
    fn enumerate_formats(&self) -> Vec<ClipboardFormat>;

    /// Current clipboard text. `Ok("")` when the clipboard holds no text.
    fn read_text(&self) -> Result<String, ClipboardError>;
}

/// Start of the registered (custom) clipboard format range
pub const CUSTOM_FORMAT_FIRST: u32 = 0xC000;

const PRIVATE_FORMAT_FIRST: u32 = 0x0200;
const PRIVATE_FORMAT_LAST: u32 = 0x02FF;
const GDIOBJ_FORMAT_FIRST: u32 = 0x0300;
const GDIOBJ_FORMAT_LAST: u32 = 0x03FF;

/// Standard clipboard formats
static WELL_KNOWN_FORMATS: &[(u32, &str)] = &[
    (1, "CF_TEXT"),
    (2, "CF_BITMAP"),
    (3, "CF_METAFILEPICT"),
    (4, "CF_SYLK"),
    (5, "CF_DIF"),
    (6, "CF_TIFF"),
    (7, "CF_OEMTEXT"),
    (8, "CF_DIB"),
    (9, "CF_PALETTE"),
    (10, "CF_PENDATA"),
    (11, "CF_RIFF"),
    (12, "CF_WAVE"),
    (13, "CF_UNICODETEXT"),
    (14, "CF_ENHMETAFILE"),
    (15, "CF_HDROP"),
    (16, "CF_LOCALE"),
    (17, "CF_DIBV5"),
    (0x0080, "CF_OWNERDISPLAY"),
    (0x0081, "CF_DSPTEXT"),
    (0x0082, "CF_DSPBITMAP"),
    (0x0083, "CF_DSPMETAFILEPICT"),
    (0x008E, "CF_DSPENHMETAFILE"),
];

/// Look up a standard format name
pub fn well_known_format_name(id: u32) -> Option<&'static str> {
    WELL_KNOWN_FORMATS
        .iter()
        .find(|(known, _)| *known == id)
        .map(|(_, name)| *name)
}

/// Resolve a format id to a display name.
///
/// `lookup_custom` is only consulted for registered formats (>= 0xC000).
pub fn describe_format<F>(id: u32, lookup_custom: F) -> String
where
    F: FnOnce(u32) -> Option<String>,
{
    if let Some(name) = well_known_format_name(id) {
        return name.to_string();
    }
    match id {
        PRIVATE_FORMAT_FIRST..=PRIVATE_FORMAT_LAST => {
            format!("CF_PRIVATE+{}", id - PRIVATE_FORMAT_FIRST)
        }
        GDIOBJ_FORMAT_FIRST..=GDIOBJ_FORMAT_LAST => {
            format!("CF_GDIOBJ+{}", id - GDIOBJ_FORMAT_FIRST)
        }
        id if id >= CUSTOM_FORMAT_FIRST => {
            lookup_custom(id).unwrap_or_else(|| format!("Custom_0x{:04X}", id))
        }
        id => format!("Unknown_{}", id),
    }
}

/// OS-backed clipboard source
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClipboard;

impl SystemClipboard {
    pub fn new() -> Self {
        Self
    }
}

impl ClipboardSource for SystemClipboard {
    fn sequence_number(&self) -> u32 {
        platform::sequence_number()
    }

    fn enumerate_formats(&self) -> Vec<ClipboardFormat> {
        platform::enumerate_formats()
    }

    fn read_text(&self) -> Result<String, ClipboardError> {
        // New instance per read so each worker thread owns its handle
        let mut clipboard =
            Clipboard::new().map_err(|e| ClipboardError::Unavailable(e.to_string()))?;
        match clipboard.get_text() {
            Ok(text) => Ok(text),
            Err(arboard::Error::ContentNotAvailable) => Ok(String::new()),
            Err(e) => Err(ClipboardError::Unavailable(e.to_string())),
        }
    }
}

#[cfg(windows)]
pub use platform::{register_change_listener, unregister_change_listener};

#[cfg(windows)]
mod platform {
    use clipboard_win::{raw, Clipboard};
    use windows::Win32::Foundation::HWND;
    use windows::Win32::System::DataExchange::{
        AddClipboardFormatListener, GetClipboardSequenceNumber, RemoveClipboardFormatListener,
    };

    use super::{describe_format, ClipboardFormat};

    /// Attempts made to open a clipboard held by another application
    const OPEN_ATTEMPTS: usize = 5;

    pub fn sequence_number() -> u32 {
        unsafe { GetClipboardSequenceNumber() }
    }

    pub fn enumerate_formats() -> Vec<ClipboardFormat> {
        // Guard closes the clipboard on every exit path
        let _guard = match Clipboard::new_attempts(OPEN_ATTEMPTS) {
            Ok(guard) => guard,
            Err(e) => {
                log::debug!("[Clipboard] Could not open clipboard for enumeration: {}", e);
                return Vec::new();
            }
        };

        raw::EnumFormats::new()
            .map(|id| ClipboardFormat::new(id, describe_format(id, raw::format_name_big)))
            .collect()
    }

    /// Subscribe a window to WM_CLIPBOARDUPDATE broadcasts
    pub fn register_change_listener(hwnd: HWND) -> bool {
        unsafe { AddClipboardFormatListener(hwnd).is_ok() }
    }

    /// Unsubscribe a window from clipboard broadcasts
    pub fn unregister_change_listener(hwnd: HWND) -> bool {
        unsafe { RemoveClipboardFormatListener(hwnd).is_ok() }
    }
}

#[cfg(not(windows))]
mod platform {
    use super::ClipboardFormat;

    // No portable sequence counter; the event strategy is Windows-only.
    pub fn sequence_number() -> u32 {
        0
    }

    pub fn enumerate_formats() -> Vec<ClipboardFormat> {
        Vec::new()
    }
}
