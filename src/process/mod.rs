//! RdpClipGuard - Redirection helper process module
//!
//! Health probing and remediation of the clipboard redirection helper

pub mod health;
pub mod probe;
pub mod remediation;

pub use health::{needs_restart, HelperProcessHealth};
pub use probe::{HealthProbe, ProcessError, ProcessHost, SystemProcessHost, DEFAULT_HELPER_PROCESS};
pub use remediation::{RemediationEngine, RemediationOutcome, RemediationReport, ResetReason};
