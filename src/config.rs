//! Configuration surface: CLI flags, the persisted `config.toml`, and the resolved settings.
//!
//! CLI flags always win over persisted values; persisted values win over defaults.

use crate::reply::{ReplyRules, DEFAULT_ERROR_PATTERN, DEFAULT_PROMPT_PATTERN};
use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_SML_CMD: &str = "sml";
pub const DEFAULT_SESSION_BUFFER_NAME: &str = "*sml*";
pub const DEFAULT_OVERLAY_DISMISS_DELAY_SECS: f64 = 10.0;
pub const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_EVAL_TIMEOUT_MS: u64 = 2000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

const CONFIG_FILE: &str = "config.toml";
const CONFIG_DIR_ENV: &str = "SMLEVAL_CONFIG_DIR";

#[derive(Debug, Parser, Clone)]
pub struct EvalConfig {
    /// Interpreter executable (looked up on PATH, used literally if not found)
    #[arg(long = "sml-cmd", env = "SMLEVAL_SML_CMD")]
    pub sml_cmd: Option<String>,

    /// Extra interpreter arguments, shell-quoted
    #[arg(long = "sml-args", env = "SMLEVAL_SML_ARGS")]
    pub sml_args: Option<String>,

    /// Print the interpreter transcript when a session starts
    #[arg(long = "show-session-on-start", value_name = "BOOL")]
    pub show_session_on_start: Option<bool>,

    /// Seconds before a result annotation is dismissed
    #[arg(long = "overlay-dismiss-delay", value_name = "SECS")]
    pub overlay_dismiss_delay: Option<f64>,

    /// Reduce `val x = v : t` replies to just `v`
    #[arg(long = "only-show-value", value_name = "BOOL")]
    pub only_show_value: Option<bool>,

    /// Display name of the interpreter session
    #[arg(long = "session-buffer-name")]
    pub session_buffer_name: Option<String>,

    /// Highlight the session transcript
    #[arg(long = "session-font-lock", value_name = "BOOL")]
    pub session_font_lock: Option<bool>,

    /// Highlight result annotations
    #[arg(long = "overlay-font-lock", value_name = "BOOL")]
    pub overlay_font_lock: Option<bool>,

    /// Regex matching the interpreter's ready prompt
    #[arg(long = "prompt-pattern", env = "SMLEVAL_PROMPT_PATTERN")]
    pub prompt_pattern: Option<String>,

    /// Regex matching interpreter error lines
    #[arg(long = "error-pattern")]
    pub error_pattern: Option<String>,

    /// How long to wait for the first prompt after starting the interpreter (ms)
    #[arg(long = "startup-timeout-ms", default_value_t = DEFAULT_STARTUP_TIMEOUT_MS)]
    pub startup_timeout_ms: u64,

    /// How long to wait for the prompt after submitting code (ms)
    #[arg(long = "eval-timeout-ms", default_value_t = DEFAULT_EVAL_TIMEOUT_MS)]
    pub eval_timeout_ms: u64,

    /// Longest single wait between prompt checks (ms)
    #[arg(long = "poll-interval-ms", default_value_t = DEFAULT_POLL_INTERVAL_MS)]
    pub poll_interval_ms: u64,

    /// Persisted config file (defaults to ~/.config/smleval/config.toml)
    #[arg(long = "config")]
    pub config_file: Option<PathBuf>,

    /// Write a debug log to the temp dir
    #[arg(long = "logs", action = ArgAction::SetTrue)]
    pub logs: bool,

    /// Also record evaluation timings as a JSON trace
    #[arg(long = "log-timings", action = ArgAction::SetTrue)]
    pub log_timings: bool,

    /// Disable all logging, overriding other log flags
    #[arg(long = "no-logs", action = ArgAction::SetTrue)]
    pub no_logs: bool,

    /// Include submitted code and interpreter output in the debug log
    #[arg(long = "log-content", action = ArgAction::SetTrue)]
    pub log_content: bool,
}

/// Values read from `config.toml`; every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UserConfig {
    pub sml_cmd: Option<String>,
    pub sml_args: Option<Vec<String>>,
    pub show_session_on_start: Option<bool>,
    pub overlay_dismiss_delay: Option<f64>,
    pub only_show_value: Option<bool>,
    pub session_buffer_name: Option<String>,
    pub enable_session_font_lock: Option<bool>,
    pub enable_overlay_font_lock: Option<bool>,
    pub prompt_pattern: Option<String>,
    pub error_pattern: Option<String>,
}

/// Timeouts governing session startup and reply waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTiming {
    pub startup_timeout: Duration,
    pub eval_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_millis(DEFAULT_STARTUP_TIMEOUT_MS),
            eval_timeout: Duration::from_millis(DEFAULT_EVAL_TIMEOUT_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

/// Fully resolved, validated settings.
#[derive(Debug, Clone)]
pub struct EvalSettings {
    pub sml_cmd: String,
    pub sml_args: Vec<String>,
    pub show_session_on_start: bool,
    pub overlay_dismiss_delay: Duration,
    pub session_buffer_name: String,
    pub session_font_lock: bool,
    pub overlay_font_lock: bool,
    pub reply: ReplyRules,
    pub timing: SessionTiming,
}

fn config_dir() -> Option<PathBuf> {
    if let Ok(dir) = env::var(CONFIG_DIR_ENV) {
        let trimmed = dir.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }
    dirs::config_dir().map(|dir| dir.join("smleval"))
}

/// Default location of the persisted config file.
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join(CONFIG_FILE))
}

/// Parse persisted config from TOML text.
///
/// # Errors
///
/// Returns an error for malformed TOML, wrong value types, or unknown keys.
pub fn parse_user_config(contents: &str) -> Result<UserConfig> {
    toml::from_str(contents).context("invalid smleval config")
}

/// Load the persisted config.
///
/// A missing file at the default location yields defaults; a missing file that was
/// named explicitly is an error.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_user_config(explicit: Option<&Path>) -> Result<UserConfig> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => match config_file_path() {
            Some(path) if path.exists() => path,
            _ => return Ok(UserConfig::default()),
        },
    };
    let contents = fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    parse_user_config(&contents).with_context(|| format!("in {}", path.display()))
}

fn compile_pattern(kind: &str, raw: &str) -> Result<Regex> {
    RegexBuilder::new(raw)
        .multi_line(true)
        .build()
        .with_context(|| format!("invalid {kind} regex: {raw}"))
}

impl EvalConfig {
    /// Merge CLI flags over `user` and validate the result.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid regexes, unparsable interpreter arguments,
    /// a dismiss delay that is negative, non-finite or too large, or a zero evaluation timeout.
    pub fn resolve(&self, user: &UserConfig) -> Result<EvalSettings> {
        let sml_cmd = self
            .sml_cmd
            .clone()
            .or_else(|| user.sml_cmd.clone())
            .unwrap_or_else(|| DEFAULT_SML_CMD.to_string());
        let sml_args = match &self.sml_args {
            Some(raw) => shell_words::split(raw)
                .with_context(|| format!("invalid --sml-args: {raw}"))?,
            None => user.sml_args.clone().unwrap_or_default(),
        };

        let dismiss_secs = self
            .overlay_dismiss_delay
            .or(user.overlay_dismiss_delay)
            .unwrap_or(DEFAULT_OVERLAY_DISMISS_DELAY_SECS);
        let overlay_dismiss_delay = Duration::try_from_secs_f64(dismiss_secs)
            .with_context(|| format!("invalid overlay dismiss delay {dismiss_secs}s"))?;
        if self.eval_timeout_ms == 0 {
            bail!("--eval-timeout-ms must be greater than zero");
        }

        let prompt_raw = self
            .prompt_pattern
            .as_deref()
            .or(user.prompt_pattern.as_deref())
            .unwrap_or(DEFAULT_PROMPT_PATTERN);
        let error_raw = self
            .error_pattern
            .as_deref()
            .or(user.error_pattern.as_deref())
            .unwrap_or(DEFAULT_ERROR_PATTERN);

        Ok(EvalSettings {
            sml_cmd,
            sml_args,
            show_session_on_start: self
                .show_session_on_start
                .or(user.show_session_on_start)
                .unwrap_or(false),
            overlay_dismiss_delay,
            session_buffer_name: self
                .session_buffer_name
                .clone()
                .or_else(|| user.session_buffer_name.clone())
                .unwrap_or_else(|| DEFAULT_SESSION_BUFFER_NAME.to_string()),
            session_font_lock: self
                .session_font_lock
                .or(user.enable_session_font_lock)
                .unwrap_or(true),
            overlay_font_lock: self
                .overlay_font_lock
                .or(user.enable_overlay_font_lock)
                .unwrap_or(true),
            reply: ReplyRules {
                prompt: compile_pattern("prompt", prompt_raw)?,
                error: compile_pattern("error", error_raw)?,
                only_show_value: self
                    .only_show_value
                    .or(user.only_show_value)
                    .unwrap_or(true),
            },
            timing: SessionTiming {
                startup_timeout: Duration::from_millis(self.startup_timeout_ms),
                eval_timeout: Duration::from_millis(self.eval_timeout_ms),
                poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            },
        })
    }
}
