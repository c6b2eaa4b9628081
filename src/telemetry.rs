//! Optional JSON trace of session startup and evaluation timings.

use crate::config::EvalConfig;
use crate::log_debug;
use anyhow::{Context, Result};
use std::env;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use tracing_subscriber::fmt::time::UtcTime;

const TRACE_LOG_ENV: &str = "SMLEVAL_TRACE_LOG";

static SUBSCRIBER_INSTALLED: OnceLock<bool> = OnceLock::new();

pub(crate) fn trace_file_path() -> PathBuf {
    env::var_os(TRACE_LOG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| env::temp_dir().join("smleval_trace.jsonl"))
}

fn timings_requested(config: &EvalConfig) -> bool {
    config.log_timings && !config.no_logs
}

fn open_trace_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open trace file {}", path.display()))
}

fn install_json_subscriber(file: File) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .json()
        .flatten_event(true)
        .with_target(false)
        .with_timer(UtcTime::rfc_3339())
        .with_writer(Mutex::new(file))
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("a global tracing subscriber is already installed")
}

/// Install the JSON trace subscriber when `--log-timings` is set.
///
/// Runs at most once per process; returns whether the subscriber is active.
/// Failures are written to the debug log rather than aborting the run.
pub fn init_tracing(config: &EvalConfig) -> bool {
    if !timings_requested(config) {
        return false;
    }
    *SUBSCRIBER_INSTALLED.get_or_init(|| {
        let path = trace_file_path();
        match open_trace_file(&path).and_then(install_json_subscriber) {
            Ok(()) => {
                log_debug(&format!("timing trace: {}", path.display()));
                true
            }
            Err(err) => {
                log_debug(&format!("timing trace disabled: {err:#}"));
                false
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use rstest::rstest;

    #[rstest]
    #[case(&[], false)]
    #[case(&["--logs"], false)]
    #[case(&["--log-timings"], true)]
    #[case(&["--log-timings", "--no-logs"], false)]
    fn timings_need_the_timing_flag(#[case] flags: &[&str], #[case] expected: bool) {
        let mut argv = vec!["smleval"];
        argv.extend_from_slice(flags);
        assert_eq!(timings_requested(&EvalConfig::parse_from(argv)), expected);
    }

    #[test]
    fn disabled_trace_installs_nothing() {
        let config = EvalConfig::parse_from(["smleval", "--logs"]);
        assert!(!init_tracing(&config));
        assert!(SUBSCRIBER_INSTALLED.get().is_none());
    }

    #[test]
    fn unwritable_trace_path_is_reported() {
        let missing_dir = env::temp_dir().join("smleval-no-such-dir").join("trace.jsonl");
        assert!(open_trace_file(&missing_dir).is_err());
    }
}
