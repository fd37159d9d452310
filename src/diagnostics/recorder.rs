//! RdpClipGuard - Diagnostic session recorder
//!
//! Append-only, one file per session, named after the session start so the
//! logs of the LOCAL and REMOTE machines can be laid side by side. Every
//! write is best-effort: a locked or unwritable file never reaches the
//! caller.
//!
//! Line format: `[HH:mm:ss.fff] [CATEGORY] message`, category optional.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Local, NaiveDateTime};
use parking_lot::Mutex;
use sysinfo::System;
use uuid::Uuid;

use super::role::Role;
use crate::process::health::format_uptime;

/// Decorative line wrapped around section headers
pub const SEPARATOR: &str = "================================================================";
/// Default base name of session files
pub const DEFAULT_BASE_NAME: &str = "rdpclip_diag";
/// Default number of session files kept
pub const DEFAULT_RETENTION: usize = 5;

const FILE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";
const LINE_TIMESTAMP_FORMAT: &str = "%H:%M:%S%.3f";
const FULL_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";
const MAX_NAME_ATTEMPTS: u32 = 60;

/// Recorder error type
#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Record category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Warn,
    Error,
    Info,
    Ok,
    Diag,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Warn => "WARN",
            Category::Error => "ERROR",
            Category::Info => "INFO",
            Category::Ok => "OK",
            Category::Diag => "DIAG",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Format one record line
pub fn format_line(at: &DateTime<Local>, category: Option<Category>, message: &str) -> String {
    let time = at.format(LINE_TIMESTAMP_FORMAT);
    match category {
        Some(category) => format!("[{}] [{}] {}", time, category, message),
        None => format!("[{}] {}", time, message),
    }
}

/// Session file name: `<base>_<yyyy-MM-dd_HH-mm-ss>.log`
pub fn session_file_name(base: &str, started_at: &DateTime<Local>) -> String {
    format!("{}_{}.log", base, started_at.format(FILE_TIMESTAMP_FORMAT))
}

/// Create a session file that did not exist before. Names have one-second
/// resolution, so a taken name moves the stamp forward a second at a time.
fn open_session_file(dir: &Path, base: &str, started_at: &DateTime<Local>) -> Result<(PathBuf, File), RecorderError> {
    let mut stamp = *started_at;
    let mut attempts = 0;
    loop {
        let path = dir.join(session_file_name(base, &stamp));
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && attempts < MAX_NAME_ATTEMPTS => {
                attempts += 1;
                stamp += chrono::Duration::seconds(1);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Recover the session start from a file name produced by [`session_file_name`]
pub fn parse_session_time(base: &str, file_name: &str) -> Option<NaiveDateTime> {
    let stamp = file_name
        .strip_prefix(base)?
        .strip_prefix('_')?
        .strip_suffix(".log")?;
    NaiveDateTime::parse_from_str(stamp, FILE_TIMESTAMP_FORMAT).ok()
}

/// Delete all but the `keep` most recent session files in `dir`.
///
/// Returns the number of files deleted. Files that do not match the naming
/// pattern are left alone; deletion failures are skipped.
pub fn cleanup_sessions(dir: &Path, base: &str, keep: usize) -> usize {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::debug!("[Recorder] Cannot list {:?} for cleanup: {}", dir, e);
            return 0;
        }
    };

    let mut sessions: Vec<(NaiveDateTime, PathBuf)> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let name = entry.file_name();
            let started = parse_session_time(base, name.to_str()?)?;
            Some((started, entry.path()))
        })
        .collect();

    // Newest first
    sessions.sort_by(|a, b| b.0.cmp(&a.0));

    let mut deleted = 0;
    for (_, path) in sessions.into_iter().skip(keep) {
        match fs::remove_file(&path) {
            Ok(()) => deleted += 1,
            Err(e) => log::debug!("[Recorder] Could not delete old session {:?}: {}", path, e),
        }
    }
    deleted
}

/// One diagnostic session file
pub struct DiagnosticRecorder {
    role: Role,
    session_id: Uuid,
    started_at: DateTime<Local>,
    path: PathBuf,
    file: Mutex<Option<File>>,
    records: AtomicU64,
}

impl DiagnosticRecorder {
    /// Create the session file in `dir` and write the header block
    pub fn create(dir: &Path, base: &str, role: Role, helper_name: &str) -> Result<Self, RecorderError> {
        fs::create_dir_all(dir)?;

        let started_at = Local::now();
        let (path, file) = open_session_file(dir, base, &started_at)?;

        let recorder = Self {
            role,
            session_id: Uuid::new_v4(),
            started_at,
            path,
            file: Mutex::new(Some(file)),
            records: AtomicU64::new(0),
        };
        recorder.write_header(helper_name);

        log::info!("[Recorder] Diagnostic session started: {:?}", recorder.path);
        Ok(recorder)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Records appended so far (header and trailer excluded)
    pub fn record_count(&self) -> u64 {
        self.records.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.file.lock().is_none()
    }

    /// Append one record line
    pub fn record(&self, category: Option<Category>, message: &str) {
        let line = format_line(&Local::now(), category, message);
        if self.write_lines(&[line]) {
            self.records.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Append a section header wrapped in separator lines
    pub fn section(&self, title: &str) {
        self.write_lines(&[SEPARATOR.to_string(), title.to_string(), SEPARATOR.to_string()]);
    }

    /// Write the trailer block and release the file. Idempotent.
    pub fn close(&self) {
        let ended_at = Local::now();
        let duration = (ended_at - self.started_at).to_std().unwrap_or_default();

        let trailer = vec![
            SEPARATOR.to_string(),
            "SESSION END".to_string(),
            SEPARATOR.to_string(),
            format!("End time:        {}", ended_at.format(FULL_TIMESTAMP_FORMAT)),
            format!("Duration:        {}", format_uptime(duration)),
            format!("Records:         {}", self.record_count()),
            SEPARATOR.to_string(),
        ];

        let mut guard = self.file.lock();
        let Some(mut file) = guard.take() else {
            return;
        };
        if let Err(e) = write_all_lines(&mut file, &trailer) {
            log::debug!("[Recorder] Failed to write trailer: {}", e);
        }
        log::info!("[Recorder] Diagnostic session closed: {:?}", self.path);
    }

    fn write_header(&self, helper_name: &str) {
        let os_version = System::long_os_version().unwrap_or_else(|| "unknown".to_string());
        let machine = System::host_name().unwrap_or_else(|| "unknown".to_string());

        self.write_lines(&[
            SEPARATOR.to_string(),
            "RDP CLIPBOARD DIAGNOSTIC SESSION".to_string(),
            SEPARATOR.to_string(),
            format!("Role:            {}", self.role),
            format!("Session ID:      {}", self.session_id),
            format!("Session start:   {}", self.started_at.format(FULL_TIMESTAMP_FORMAT)),
            format!("Machine:         {}", machine),
            format!("OS version:      {}", os_version),
            format!(
                "Runtime:         {} {} (PID {})",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION"),
                std::process::id()
            ),
            format!("Helper process:  {}", helper_name),
            SEPARATOR.to_string(),
        ]);
    }

    /// Write lines under the session lock; false when nothing was written
    fn write_lines(&self, lines: &[String]) -> bool {
        let mut guard = self.file.lock();
        let Some(file) = guard.as_mut() else {
            return false;
        };
        match write_all_lines(file, lines) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("[Recorder] Write to {:?} failed: {}", self.path, e);
                false
            }
        }
    }
}

impl Drop for DiagnosticRecorder {
    fn drop(&mut self) {
        self.close();
    }
}

fn write_all_lines(file: &mut File, lines: &[String]) -> std::io::Result<()> {
    let mut buf = String::new();
    for line in lines {
        buf.push_str(line);
        buf.push_str("\r\n");
    }
    file.write_all(buf.as_bytes())?;
    file.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;
    use std::thread;

    fn at(h: u32, m: u32, s: u32, ms: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2026, 3, 9, h, m, s)
            .single()
            .unwrap()
            + chrono::Duration::milliseconds(ms as i64)
    }

    #[test]
    fn line_format_with_and_without_category() {
        let t = at(9, 5, 7, 42);
        assert_eq!(
            format_line(&t, Some(Category::Warn), "clipboard locked"),
            "[09:05:07.042] [WARN] clipboard locked"
        );
        assert_eq!(format_line(&t, None, "plain"), "[09:05:07.042] plain");
        assert_eq!(
            format_line(&t, Some(Category::Diag), "x"),
            "[09:05:07.042] [DIAG] x"
        );
    }

    #[test]
    fn session_names_round_trip() {
        let t = at(14, 30, 0, 0);
        let name = session_file_name("rdpclip_diag", &t);
        assert_eq!(name, "rdpclip_diag_2026-03-09_14-30-00.log");
        assert_eq!(
            parse_session_time("rdpclip_diag", &name),
            Some(t.naive_local())
        );
        assert!(parse_session_time("rdpclip_diag", "other_2026-03-09_14-30-00.log").is_none());
        assert!(parse_session_time("rdpclip_diag", "rdpclip_diag_garbage.log").is_none());
    }

    #[test]
    fn cleanup_keeps_newest_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let base = "rdpclip_diag";
        let keep = 5;
        let extra = 3;

        let mut names = Vec::new();
        for i in 0..(keep + extra) {
            let name = session_file_name(base, &at(10, i as u32, 0, 0));
            fs::write(dir.path().join(&name), "x").unwrap();
            names.push(name);
        }
        fs::write(dir.path().join("unrelated.txt"), "keep me").unwrap();

        let deleted = cleanup_sessions(dir.path(), base, keep);
        assert_eq!(deleted, extra);

        for (i, name) in names.iter().enumerate() {
            assert_eq!(dir.path().join(name).exists(), i >= extra, "{}", name);
        }
        assert!(dir.path().join("unrelated.txt").exists());
    }

    #[test]
    fn cleanup_with_fewer_files_deletes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(session_file_name("d", &at(1, 0, 0, 0))), "x").unwrap();
        assert_eq!(cleanup_sessions(dir.path(), "d", 5), 0);
        assert_eq!(cleanup_sessions(&dir.path().join("missing"), "d", 5), 0);
    }

    #[test]
    fn session_has_header_records_and_trailer() {
        let dir = tempfile::tempdir().unwrap();
        let recorder =
            DiagnosticRecorder::create(dir.path(), "rdpclip_diag", Role::Remote, "rdpclip.exe").unwrap();
        recorder.record(Some(Category::Info), "first");
        recorder.section("HEALTH");
        recorder.record(None, "second");
        let path = recorder.path().to_path_buf();
        recorder.close();
        recorder.close();
        recorder.record(Some(Category::Error), "after close");

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with(SEPARATOR));
        assert!(content.contains("Role:            REMOTE"));
        assert!(content.contains("Helper process:  rdpclip.exe"));
        assert!(content.contains("] [INFO] first\r\n"));
        assert!(content.contains(&format!("{}\r\nHEALTH\r\n{}", SEPARATOR, SEPARATOR)));
        assert!(content.contains("Records:         2"));
        assert_eq!(content.matches("SESSION END").count(), 1);
        assert!(!content.contains("after close"));
        assert!(recorder.is_closed());
    }

    #[test]
    fn sessions_in_same_second_get_own_files() {
        let dir = tempfile::tempdir().unwrap();
        let first = DiagnosticRecorder::create(dir.path(), "d", Role::Local, "rdpclip.exe").unwrap();
        first.close();
        let second = DiagnosticRecorder::create(dir.path(), "d", Role::Local, "rdpclip.exe").unwrap();
        second.close();
        let third = DiagnosticRecorder::create(dir.path(), "d", Role::Local, "rdpclip.exe").unwrap();
        third.close();

        assert_ne!(first.path(), second.path());
        assert_ne!(second.path(), third.path());
        for recorder in [&first, &second, &third] {
            let content = fs::read_to_string(recorder.path()).unwrap();
            assert_eq!(content.matches("RDP CLIPBOARD DIAGNOSTIC SESSION").count(), 1);
            assert_eq!(content.matches("SESSION END").count(), 1);
            let name = recorder.path().file_name().unwrap().to_str().unwrap();
            assert!(parse_session_time("d", name).is_some());
        }
    }

    #[test]
    fn concurrent_writers_never_split_lines() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(
            DiagnosticRecorder::create(dir.path(), "d", Role::Local, "rdpclip.exe").unwrap(),
        );

        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let recorder = Arc::clone(&recorder);
                thread::spawn(move || {
                    for i in 0..50 {
                        recorder.record(Some(Category::Diag), &format!("worker-{} line-{} end", worker, i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        recorder.close();

        let content = fs::read_to_string(recorder.path()).unwrap();
        let records: Vec<_> = content.lines().filter(|l| l.contains("[DIAG]")).collect();
        assert_eq!(records.len(), 200);
        assert!(records.iter().all(|l| l.ends_with(" end")));
        assert_eq!(recorder.record_count(), 200);
    }
}
