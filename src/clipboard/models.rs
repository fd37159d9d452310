//! RdpClipGuard - Clipboard data models
//!
//! Defines the immutable snapshot produced for every detected clipboard change

use chrono::{DateTime, Local};
use serde::Serialize;

/// Length of the short content hash used for cross-machine comparison
pub const SHORT_HASH_LEN: usize = 8;

/// A clipboard format offered by the current clipboard owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClipboardFormat {
    /// Numeric format identifier
    pub id: u32,
    /// Human-readable name (well-known table or registered name)
    pub name: String,
}

impl ClipboardFormat {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self { id, name: name.into() }
    }
}

/// Clipboard state snapshot
///
/// Built fresh for every detected change and never mutated afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct ClipboardSnapshot {
    /// OS clipboard sequence number at observation time
    pub sequence_number: u32,
    /// Text content, if text could be read
    pub text_content: Option<String>,
    /// First 8 hex chars of the content digest; present iff text is non-empty
    pub content_hash: Option<String>,
    /// Formats offered, in enumeration order
    pub formats: Vec<ClipboardFormat>,
    /// Observation time
    pub observed_at: DateTime<Local>,
}

impl ClipboardSnapshot {
    /// Create a snapshot, deriving the content hash from the text
    pub fn new(
        sequence_number: u32,
        text_content: Option<String>,
        formats: Vec<ClipboardFormat>,
        observed_at: DateTime<Local>,
    ) -> Self {
        let content_hash = text_content
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(short_hash);
        Self {
            sequence_number,
            text_content,
            content_hash,
            formats,
            observed_at,
        }
    }

    /// Length of the text content in characters (0 when absent)
    pub fn text_len(&self) -> usize {
        self.text_content
            .as_deref()
            .map(|t| t.chars().count())
            .unwrap_or(0)
    }

    /// Formats rendered as `id:name` pairs for log lines
    pub fn format_list(&self) -> String {
        if self.formats.is_empty() {
            return "(none)".to_string();
        }
        self.formats
            .iter()
            .map(|f| format!("{}:{}", f.id, f.name))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Truncated preview of the text for log lines
    pub fn preview(&self, max_len: usize) -> String {
        let Some(text) = self.text_content.as_deref() else {
            return "(no text)".to_string();
        };
        let flat: String = text
            .chars()
            .map(|c| if c.is_control() { ' ' } else { c })
            .collect();
        let flat = flat.trim();
        if flat.chars().count() <= max_len {
            flat.to_string()
        } else {
            let truncated: String = flat.chars().take(max_len).collect();
            format!("{}...", truncated)
        }
    }
}

/// Compute the short content hash (first 8 hex chars of a 256-bit BLAKE3 digest)
///
/// Used only for equality comparison between the two machines' logs.
pub fn short_hash(text: &str) -> String {
    let digest = blake3::hash(text.as_bytes());
    let mut hex = digest.to_hex().to_string();
    hex.truncate(SHORT_HASH_LEN);
    hex
}
