//! RdpClipGuard - Session role detection

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which side of the RDP session this process runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Controller machine (the RDP client side)
    Local,
    /// Controlled machine (inside the RDP session)
    Remote,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Local => "LOCAL",
            Role::Remote => "REMOTE",
        }
    }

    /// Detect the role from whether this process runs inside a remote session
    pub fn detect() -> Self {
        if platform::is_remote_session() {
            Role::Remote
        } else {
            Role::Local
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(windows)]
mod platform {
    use windows::Win32::UI::WindowsAndMessaging::{GetSystemMetrics, SM_REMOTESESSION};

    pub fn is_remote_session() -> bool {
        unsafe { GetSystemMetrics(SM_REMOTESESSION) != 0 }
    }
}

#[cfg(not(windows))]
mod platform {
    pub fn is_remote_session() -> bool {
        false
    }
}
