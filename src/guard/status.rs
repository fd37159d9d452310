//! RdpClipGuard - Aggregate status surfaced to the host UI

use std::fmt;

use serde::Serialize;

/// Counters and the latest notable message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GuardStatus {
    pub copies: u64,
    pub resets: u64,
    pub diagnostics: bool,
    pub last_message: Option<String>,
}

impl fmt::Display for GuardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Copies: {} | Resets: {} | Diagnostics: {}",
            self.copies,
            self.resets,
            if self.diagnostics { "on" } else { "off" }
        )?;
        if let Some(message) = &self.last_message {
            write!(f, " | {}", message)?;
        }
        Ok(())
    }
}
