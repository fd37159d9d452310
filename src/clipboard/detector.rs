//! RdpClipGuard - Change detection state
//!
//! Owns the copy counter and last-seen clipboard state for both detection
//! strategies. No globals: each strategy holds its own instance behind a lock.

use super::models::ClipboardSnapshot;

/// Default number of copies between scheduled resets
pub const DEFAULT_RESET_THRESHOLD: u64 = 7;

/// Result of one polling observation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Read timed out or failed; the helper is suspected
    Inaccessible,
    /// Clipboard holds no text (image, files, or empty)
    NoText,
    /// Same text as the previous observation
    Unchanged,
    /// New distinct text
    Changed(TextChange),
}

/// A counted text change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChange {
    /// Copy counter after this change
    pub copy_count: u64,
    /// The counter reached a multiple of the reset threshold
    pub reset_due: bool,
    /// Text changed while the OS sequence number did not
    pub signal_missing: bool,
    /// Sequence number read with this observation
    pub sequence_number: u32,
    pub text: String,
}

/// Polling strategy state: CopyCounter plus last-seen values
#[derive(Debug)]
pub struct DetectorState {
    copy_count: u64,
    last_text: Option<String>,
    last_sequence: Option<u32>,
    reset_threshold: u64,
}

impl DetectorState {
    pub fn new(reset_threshold: u64) -> Self {
        Self {
            copy_count: 0,
            last_text: None,
            last_sequence: None,
            reset_threshold: reset_threshold.max(1),
        }
    }

    /// Number of distinct text changes observed so far
    pub fn copy_count(&self) -> u64 {
        self.copy_count
    }

    pub fn reset_threshold(&self) -> u64 {
        self.reset_threshold
    }

    /// Fold one polled read into the state, with a single sequence number
    /// standing for both sides of the read.
    pub fn observe(&mut self, read: Option<String>, sequence_number: u32) -> PollOutcome {
        self.observe_read(read, sequence_number, sequence_number)
    }

    /// Fold one polled read into the state.
    ///
    /// `read` is `None` when the bounded read failed. The sequence number is
    /// sampled before and after the read; a copy landing in between moves
    /// `sequence_after`. A sequence number of 0 means the platform has no
    /// counter and disables missed-signal checks.
    pub fn observe_read(
        &mut self,
        read: Option<String>,
        sequence_before: u32,
        sequence_after: u32,
    ) -> PollOutcome {
        let previous_sequence = self.last_sequence.replace(sequence_after);

        let Some(text) = read else {
            return PollOutcome::Inaccessible;
        };
        if text.is_empty() {
            return PollOutcome::NoText;
        }
        if self.last_text.as_deref() == Some(text.as_str()) {
            return PollOutcome::Unchanged;
        }

        // A->B->A counts twice: every redirection matters, not novelty
        let signal_missing = self.last_text.is_some()
            && sequence_after != 0
            && previous_sequence == Some(sequence_before)
            && previous_sequence == Some(sequence_after);

        self.copy_count += 1;
        self.last_text = Some(text.clone());

        PollOutcome::Changed(TextChange {
            copy_count: self.copy_count,
            reset_due: self.copy_count % self.reset_threshold == 0,
            signal_missing,
            sequence_number: sequence_after,
            text,
        })
    }
}

impl Default for DetectorState {
    fn default() -> Self {
        Self::new(DEFAULT_RESET_THRESHOLD)
    }
}

/// Classification of an event-driven clipboard notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// First notification of the session
    Baseline,
    /// Sequence number and text both changed
    TextChanged,
    /// Sequence number changed, text did not (image, file list, ...)
    NonTextChange,
    /// Text changed but the sequence number did not: the OS signal was missed
    SignalMissing,
    /// Neither changed
    Duplicate,
    /// Text could not be read within the timeout
    Unreadable,
}

impl ChangeKind {
    pub fn describe(&self) -> &'static str {
        match self {
            ChangeKind::Baseline => "baseline",
            ChangeKind::TextChanged => "text change",
            ChangeKind::NonTextChange => "non-text change",
            ChangeKind::SignalMissing => "text changed but OS signal missing",
            ChangeKind::Duplicate => "duplicate notification",
            ChangeKind::Unreadable => "clipboard unreadable",
        }
    }

    /// Kinds that indicate a defect rather than normal traffic
    pub fn is_anomaly(&self) -> bool {
        matches!(self, ChangeKind::SignalMissing | ChangeKind::Unreadable)
    }
}

/// Classify a change from previous/current sequence numbers and text hashes
pub fn classify_change(
    previous_sequence: Option<u32>,
    previous_hash: Option<&str>,
    sequence_number: u32,
    hash: Option<&str>,
) -> ChangeKind {
    let Some(previous_sequence) = previous_sequence else {
        return ChangeKind::Baseline;
    };
    classify(previous_sequence != sequence_number, previous_hash, hash)
}

fn classify(sequence_changed: bool, previous_hash: Option<&str>, hash: Option<&str>) -> ChangeKind {
    // No text now (image, file list): whatever changed, it was not text
    if sequence_changed && hash.is_none() {
        return ChangeKind::NonTextChange;
    }
    let text_changed = previous_hash != hash;

    match (sequence_changed, text_changed) {
        (true, true) => ChangeKind::TextChanged,
        (true, false) => ChangeKind::NonTextChange,
        (false, true) => ChangeKind::SignalMissing,
        (false, false) => ChangeKind::Duplicate,
    }
}

/// Event strategy state: last sequence number and text hash seen
#[derive(Debug, Default)]
pub struct EventTracker {
    last_sequence: Option<u32>,
    last_hash: Option<String>,
}

impl EventTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify a snapshot and remember it as the new baseline
    pub fn track(&mut self, snapshot: &ClipboardSnapshot) -> ChangeKind {
        self.track_read(snapshot, snapshot.sequence_number)
    }

    /// Classify a snapshot whose sequence number was sampled after the text
    /// read, `sequence_before` being the sample taken before it.
    ///
    /// A snapshot without text content means the read failed; only its
    /// sequence number is remembered.
    pub fn track_read(&mut self, snapshot: &ClipboardSnapshot, sequence_before: u32) -> ChangeKind {
        let previous = self.last_sequence.replace(snapshot.sequence_number);
        if snapshot.text_content.is_none() {
            return ChangeKind::Unreadable;
        }

        let previous_hash = std::mem::replace(&mut self.last_hash, snapshot.content_hash.clone());
        let Some(previous) = previous else {
            return ChangeKind::Baseline;
        };
        let sequence_changed = previous != sequence_before || previous != snapshot.sequence_number;
        classify(
            sequence_changed,
            previous_hash.as_deref(),
            snapshot.content_hash.as_deref(),
        )
    }

    /// Forget the previous snapshot; the next one is a baseline
    pub fn reset(&mut self) {
        self.last_sequence = None;
        self.last_hash = None;
    }
}
