//! RdpClipGuard - Process health probe
//!
//! Looks up the redirection helper by name and samples its metrics. The
//! process can exit between lookup and sampling; that resolves to
//! "not running", never to an error.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, TimeZone};
use parking_lot::Mutex;
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};

use super::health::HelperProcessHealth;

/// Executable name of the RDP clipboard redirection helper
pub const DEFAULT_HELPER_PROCESS: &str = "rdpclip.exe";

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Process error type
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Process {0} not found")]
    NotFound(u32),
    #[error("Failed to terminate process {0}")]
    TerminateFailed(u32),
    #[error("Failed to launch {name}: {reason}")]
    LaunchFailed { name: String, reason: String },
}

/// Raw metrics of one live process
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSample {
    pub pid: u32,
    pub start_time: Option<DateTime<Local>>,
    pub working_set_bytes: u64,
    pub private_bytes: u64,
    pub handle_count: u32,
    pub thread_count: u32,
    pub responding: bool,
    pub uptime: Duration,
}

/// Operating-system process table
///
/// The system implementation wraps sysinfo and Win32; tests inject fakes.
pub trait ProcessHost: Send + Sync {
    /// PIDs of all processes whose executable matches `name` (case-insensitive)
    fn find_by_name(&self, name: &str) -> Vec<u32>;

    /// Live metrics, or `None` if the process is gone
    fn sample(&self, pid: u32) -> Option<ProcessSample>;

    /// Terminate one process
    fn terminate(&self, pid: u32) -> Result<(), ProcessError>;

    /// Launch `name` with a hidden window, returning the new PID
    fn launch_hidden(&self, name: &str) -> Result<u32, ProcessError>;
}

/// Health probe over a process host
#[derive(Clone)]
pub struct HealthProbe {
    host: Arc<dyn ProcessHost>,
}

impl HealthProbe {
    pub fn new(host: Arc<dyn ProcessHost>) -> Self {
        Self { host }
    }

    /// Sample the first process named `process_name`
    pub fn probe(&self, process_name: &str) -> HelperProcessHealth {
        let Some(pid) = self.host.find_by_name(process_name).into_iter().next() else {
            return HelperProcessHealth::not_running();
        };

        match self.host.sample(pid) {
            Some(sample) => health_from_sample(&sample),
            None => {
                log::debug!("[Probe] {} (PID {}) exited before it could be sampled", process_name, pid);
                HelperProcessHealth::not_running()
            }
        }
    }
}

/// Convert raw metrics into a health sample
pub fn health_from_sample(sample: &ProcessSample) -> HelperProcessHealth {
    HelperProcessHealth {
        running: true,
        responding: sample.responding,
        pid: sample.pid,
        start_time: sample.start_time,
        working_set_mb: sample.working_set_bytes / BYTES_PER_MB,
        private_mem_mb: sample.private_bytes / BYTES_PER_MB,
        handle_count: sample.handle_count,
        thread_count: sample.thread_count,
        uptime: sample.uptime,
    }
}

/// Process host backed by sysinfo, with Win32 for the metrics sysinfo lacks
pub struct SystemProcessHost {
    system: Mutex<System>,
}

impl SystemProcessHost {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemProcessHost {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessHost for SystemProcessHost {
    fn find_by_name(&self, name: &str) -> Vec<u32> {
        let mut system = self.system.lock();
        system.refresh_processes(ProcessesToUpdate::All, true);

        let mut pids: Vec<u32> = system
            .processes()
            .iter()
            .filter(|(_, process)| process.name().to_string_lossy().eq_ignore_ascii_case(name))
            .map(|(pid, _)| pid.as_u32())
            .collect();
        pids.sort_unstable();
        pids
    }

    fn sample(&self, pid: u32) -> Option<ProcessSample> {
        let mut system = self.system.lock();
        let sys_pid = Pid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);

        let process = system.process(sys_pid)?;
        if matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead) {
            return None;
        }

        let start_time = Local.timestamp_opt(process.start_time() as i64, 0).single();
        let native = platform::native_metrics(pid);

        Some(ProcessSample {
            pid,
            start_time,
            working_set_bytes: process.memory(),
            // Private usage only comes from native metrics
            private_bytes: native.private_bytes.unwrap_or(0),
            handle_count: native.handle_count,
            thread_count: native.thread_count,
            responding: native
                .responding
                .unwrap_or(!matches!(process.status(), ProcessStatus::Stop)),
            uptime: Duration::from_secs(process.run_time()),
        })
    }

    fn terminate(&self, pid: u32) -> Result<(), ProcessError> {
        let mut system = self.system.lock();
        let sys_pid = Pid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);

        let process = system.process(sys_pid).ok_or(ProcessError::NotFound(pid))?;
        if process.kill() {
            Ok(())
        } else {
            Err(ProcessError::TerminateFailed(pid))
        }
    }

    fn launch_hidden(&self, name: &str) -> Result<u32, ProcessError> {
        platform::launch_hidden(name)
    }
}

/// Metrics only available through native APIs
#[derive(Debug, Default)]
struct NativeMetrics {
    private_bytes: Option<u64>,
    handle_count: u32,
    thread_count: u32,
    responding: Option<bool>,
}

#[cfg(windows)]
mod platform {
    use std::ffi::c_void;

    use windows::core::{PCWSTR, PWSTR};
    use windows::Win32::Foundation::{CloseHandle, BOOL, HANDLE, HWND, LPARAM};
    use windows::Win32::System::Diagnostics::ToolHelp::{
        CreateToolhelp32Snapshot, Process32FirstW, Process32NextW, PROCESSENTRY32W,
        TH32CS_SNAPPROCESS,
    };
    use windows::Win32::System::ProcessStatus::{
        GetProcessMemoryInfo, PROCESS_MEMORY_COUNTERS, PROCESS_MEMORY_COUNTERS_EX,
    };
    use windows::Win32::System::Threading::{
        CreateProcessW, GetProcessHandleCount, OpenProcess, PROCESS_CREATION_FLAGS,
        PROCESS_INFORMATION, PROCESS_QUERY_INFORMATION, PROCESS_VM_READ, STARTF_USESHOWWINDOW,
        STARTUPINFOW,
    };
    use windows::Win32::UI::WindowsAndMessaging::{
        EnumWindows, GetWindowThreadProcessId, IsHungAppWindow, SW_HIDE,
    };

    use super::{NativeMetrics, ProcessError};

    pub fn native_metrics(pid: u32) -> NativeMetrics {
        let mut metrics = NativeMetrics {
            thread_count: thread_count(pid).unwrap_or(0),
            responding: Some(windows_responding(pid)),
            ..Default::default()
        };

        unsafe {
            let Ok(handle) = OpenProcess(PROCESS_QUERY_INFORMATION | PROCESS_VM_READ, false, pid) else {
                return metrics;
            };

            let mut handles = 0u32;
            if GetProcessHandleCount(handle, &mut handles).is_ok() {
                metrics.handle_count = handles;
            }

            let mut counters = PROCESS_MEMORY_COUNTERS_EX {
                cb: std::mem::size_of::<PROCESS_MEMORY_COUNTERS_EX>() as u32,
                ..Default::default()
            };
            if GetProcessMemoryInfo(
                handle,
                &mut counters as *mut PROCESS_MEMORY_COUNTERS_EX as *mut PROCESS_MEMORY_COUNTERS,
                counters.cb,
            )
            .is_ok()
            {
                metrics.private_bytes = Some(counters.PrivateUsage as u64);
            }

            let _ = CloseHandle(handle);
        }
        metrics
    }

    fn thread_count(pid: u32) -> Option<u32> {
        unsafe {
            let snapshot: HANDLE = CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0).ok()?;
            let mut entry = PROCESSENTRY32W {
                dwSize: std::mem::size_of::<PROCESSENTRY32W>() as u32,
                ..Default::default()
            };

            let mut found = None;
            if Process32FirstW(snapshot, &mut entry).is_ok() {
                loop {
                    if entry.th32ProcessID == pid {
                        found = Some(entry.cntThreads);
                        break;
                    }
                    if Process32NextW(snapshot, &mut entry).is_err() {
                        break;
                    }
                }
            }
            let _ = CloseHandle(snapshot);
            found
        }
    }

    struct HungSearch {
        pid: u32,
        windows: u32,
        hung: bool,
    }

    unsafe extern "system" fn inspect_window(hwnd: HWND, lparam: LPARAM) -> BOOL {
        let search = &mut *(lparam.0 as *mut HungSearch);
        let mut owner = 0u32;
        GetWindowThreadProcessId(hwnd, Some(&mut owner as *mut u32));
        if owner == search.pid {
            search.windows += 1;
            if IsHungAppWindow(hwnd).as_bool() {
                search.hung = true;
                return BOOL(0);
            }
        }
        BOOL(1)
    }

    /// A process without top-level windows counts as responding
    fn windows_responding(pid: u32) -> bool {
        let mut search = HungSearch {
            pid,
            windows: 0,
            hung: false,
        };
        unsafe {
            let _ = EnumWindows(
                Some(inspect_window),
                LPARAM(&mut search as *mut HungSearch as isize),
            );
        }
        if search.windows == 0 {
            return true;
        }
        !search.hung
    }

    pub fn launch_hidden(name: &str) -> Result<u32, ProcessError> {
        let mut command_line: Vec<u16> = name.encode_utf16().chain(std::iter::once(0)).collect();
        let startup = STARTUPINFOW {
            cb: std::mem::size_of::<STARTUPINFOW>() as u32,
            dwFlags: STARTF_USESHOWWINDOW,
            wShowWindow: SW_HIDE.0 as u16,
            ..Default::default()
        };
        let mut info = PROCESS_INFORMATION::default();

        unsafe {
            CreateProcessW(
                PCWSTR::null(),
                PWSTR(command_line.as_mut_ptr()),
                None,
                None,
                false,
                PROCESS_CREATION_FLAGS(0),
                None::<*const c_void>,
                PCWSTR::null(),
                &startup,
                &mut info,
            )
            .map_err(|e| ProcessError::LaunchFailed {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

            let _ = CloseHandle(info.hThread);
            let _ = CloseHandle(info.hProcess);
        }
        Ok(info.dwProcessId)
    }
}

#[cfg(not(windows))]
mod platform {
    use std::process::{Command, Stdio};

    use super::{NativeMetrics, ProcessError};

    pub fn native_metrics(_pid: u32) -> NativeMetrics {
        NativeMetrics::default()
    }

    pub fn launch_hidden(name: &str) -> Result<u32, ProcessError> {
        Command::new(name)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map(|child| child.id())
            .map_err(|e| ProcessError::LaunchFailed {
                name: name.to_string(),
                reason: e.to_string(),
            })
    }
}
