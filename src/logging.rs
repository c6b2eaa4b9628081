//! Debug log file so session traffic can be inspected without corrupting annotation output.
//!
//! The log rotates into a single `.1` backup once it passes the size cap.

use crate::config::EvalConfig;
use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

const DEBUG_LOG_CAP_BYTES: u64 = 5 * 1024 * 1024;
const DEBUG_LOG_ENV: &str = "SMLEVAL_DEBUG_LOG";

/// How much the debug log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
enum LogLevel {
    Off = 0,
    Events = 1,
    /// Events plus submitted code and interpreter replies.
    Content = 2,
}

impl LogLevel {
    fn from_config(config: &EvalConfig) -> Self {
        if config.no_logs || !(config.logs || config.log_timings) {
            Self::Off
        } else if config.log_content {
            Self::Content
        } else {
            Self::Events
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            2 => Self::Content,
            1 => Self::Events,
            _ => Self::Off,
        }
    }
}

static LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Off as u8);
static SINK: OnceLock<Mutex<Option<DebugLog>>> = OnceLock::new();

/// Path to the debug log file.
#[must_use]
pub fn log_file_path() -> PathBuf {
    env::var_os(DEBUG_LOG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| env::temp_dir().join("smleval_debug.log"))
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".1");
    PathBuf::from(name)
}

fn open_append(path: &Path) -> Option<File> {
    OpenOptions::new().create(true).append(true).open(path).ok()
}

struct DebugLog {
    path: PathBuf,
    file: File,
    cap: u64,
    size: u64,
}

impl DebugLog {
    fn open(path: PathBuf, cap: u64) -> Option<Self> {
        let file = open_append(&path)?;
        let size = file.metadata().map(|meta| meta.len()).unwrap_or(0);
        let mut log = Self {
            path,
            file,
            cap,
            size,
        };
        if log.size > cap {
            log.rotate();
        }
        Some(log)
    }

    /// Move the current file to `<path>.1` and start a fresh one.
    fn rotate(&mut self) {
        let _ = fs::rename(&self.path, backup_path(&self.path));
        if let Some(file) = open_append(&self.path) {
            self.file = file;
            self.size = 0;
        }
    }

    fn append(&mut self, line: &str) {
        let len = line.len() as u64;
        if self.size > 0 && self.size + len > self.cap {
            self.rotate();
        }
        if self.file.write_all(line.as_bytes()).is_ok() {
            self.size += len;
        }
    }
}

/// Lock the log sink, recovering from poison without logging.
fn sink() -> MutexGuard<'static, Option<DebugLog>> {
    SINK.get_or_init(|| Mutex::new(None))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

fn set_level(level: LogLevel) {
    LEVEL.store(level as u8, Ordering::Relaxed);
    let log = (level != LogLevel::Off)
        .then(|| DebugLog::open(log_file_path(), DEBUG_LOG_CAP_BYTES))
        .flatten();
    *sink() = log;
}

fn current_level() -> LogLevel {
    LogLevel::from_u8(LEVEL.load(Ordering::Relaxed))
}

/// Configure the debug log from the logging flags; `--no-logs` overrides the others.
pub fn init_logging(config: &EvalConfig) {
    set_level(LogLevel::from_config(config));
}

fn write_entry(msg: &str) {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|since| since.as_millis())
        .unwrap_or(0);
    if let Some(log) = sink().as_mut() {
        log.append(&format!("[{millis}] {msg}\n"));
    }
}

/// Record a session event.
pub fn log_debug(msg: &str) {
    if current_level() >= LogLevel::Events {
        write_entry(msg);
    }
}

/// Record a line carrying user code or interpreter output; needs `--log-content`.
pub fn log_debug_content(msg: &str) {
    if current_level() >= LogLevel::Content {
        write_entry(msg);
    }
}
