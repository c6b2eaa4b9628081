//! Request/reply correlation between submitted code and the interpreter's prompt.
//!
//! Each evaluation records the output high-water mark before writing, then waits
//! for the prompt to reappear after that mark. Prompt detection is a regex search
//! over interpreter output: a reply that itself prints text matching the prompt
//! pattern ends the wait early and the reply is cut at that point.

use crate::config::SessionTiming;
use crate::reply::{EvalResult, ReplyRules};
use crate::session::{EvalReply, OutputBuffer, ProcessLauncher, Session, Startup};
use crate::{log_debug, log_debug_content};
use regex::Regex;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Statement terminator appended to fragments that lack one.
pub const STATEMENT_TERMINATOR: char = ';';

/// Transcript lines carried in [`EvalError::Exited`].
const EXIT_TAIL_LINES: usize = 3;

/// Failures that end a single evaluation request.
///
/// Only [`EvalError::Exited`] discards the session; after the others it stays
/// usable for the next request.
#[derive(Debug)]
pub enum EvalError {
    /// The interpreter did not show its first prompt in time.
    StartupTimeout { waited: Duration },
    /// The interpreter exited before its first prompt; `output` is the transcript tail.
    Exited { output: String },
    /// Another evaluation is still waiting on this session.
    Busy,
    /// The interpreter process could not be started.
    Spawn(anyhow::Error),
    /// Writing to the interpreter failed.
    Io(anyhow::Error),
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StartupTimeout { waited } => write!(
                f,
                "interpreter did not show a prompt within {}ms",
                waited.as_millis()
            ),
            Self::Exited { output } if output.is_empty() => {
                write!(f, "interpreter exited before showing a prompt")
            }
            Self::Exited { output } => {
                write!(f, "interpreter exited before showing a prompt: {output}")
            }
            Self::Busy => write!(f, "an evaluation is already in progress for this session"),
            Self::Spawn(err) => write!(f, "failed to start interpreter: {err:#}"),
            Self::Io(err) => write!(f, "failed to send code to interpreter: {err:#}"),
        }
    }
}

impl std::error::Error for EvalError {}

/// Append the statement terminator unless present (ignoring trailing whitespace), then a newline.
#[must_use]
pub fn normalize_code(code: &str) -> String {
    let trimmed = code.trim_end();
    let mut normalized = String::with_capacity(trimmed.len() + 2);
    normalized.push_str(trimmed);
    if !trimmed.ends_with(STATEMENT_TERMINATOR) {
        normalized.push(STATEMENT_TERMINATOR);
    }
    normalized.push('\n');
    normalized
}

/// Owns at most one interpreter session and runs evaluations against it.
pub struct InteractiveEvaluator<L: ProcessLauncher> {
    launcher: L,
    session_name: String,
    prompt: Regex,
    rules: ReplyRules,
    timing: SessionTiming,
    session: Option<Arc<Session<L::Process>>>,
}

impl<L: ProcessLauncher> InteractiveEvaluator<L> {
    pub fn new(launcher: L, session_name: &str, rules: ReplyRules, timing: SessionTiming) -> Self {
        Self {
            launcher,
            session_name: session_name.to_string(),
            prompt: rules.prompt.clone(),
            rules,
            timing,
            session: None,
        }
    }

    #[must_use]
    pub fn rules(&self) -> &ReplyRules {
        &self.rules
    }

    /// The current session, if one has been started and is still alive.
    #[must_use]
    pub fn current_session(&self) -> Option<Arc<Session<L::Process>>> {
        self.session
            .as_ref()
            .filter(|session| session.is_alive())
            .cloned()
    }

    /// Return a live session whose first prompt has been seen, starting one if needed.
    ///
    /// A session that misses its startup window is kept and re-awaited on the next call.
    ///
    /// # Errors
    ///
    /// Returns [`EvalError::Spawn`] if the interpreter cannot be launched,
    /// [`EvalError::Exited`] if it dies before prompting and
    /// [`EvalError::StartupTimeout`] if no prompt appears in time.
    pub fn ensure_session(&mut self) -> Result<Arc<Session<L::Process>>, EvalError> {
        let session = match self.current_session() {
            Some(session) => session,
            None => {
                if self.session.take().is_some() {
                    log_debug(&format!(
                        "session {}: interpreter exited; starting a new one",
                        self.session_name
                    ));
                }
                let output = OutputBuffer::new();
                let process = self
                    .launcher
                    .launch(output.clone())
                    .map_err(EvalError::Spawn)?;
                let session = Arc::new(Session::new(
                    &self.session_name,
                    process,
                    output,
                    self.prompt.clone(),
                ));
                self.session = Some(Arc::clone(&session));
                session
            }
        };

        if session.is_ready() {
            return Ok(session);
        }
        let started = Instant::now();
        match session.await_first_prompt(self.timing.startup_timeout, self.timing.poll_interval) {
            Startup::Ready => {
                tracing::info!(
                    session = %self.session_name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "interpreter ready"
                );
                Ok(session)
            }
            Startup::Exited => {
                self.session = None;
                Err(EvalError::Exited {
                    output: session.transcript_tail(EXIT_TAIL_LINES),
                })
            }
            Startup::TimedOut => {
                log_debug(&format!(
                    "session {}: no prompt within {}ms",
                    self.session_name,
                    self.timing.startup_timeout.as_millis()
                ));
                Err(EvalError::StartupTimeout {
                    waited: self.timing.startup_timeout,
                })
            }
        }
    }

    /// Submit `code` and return the interpreter output produced in response.
    ///
    /// Hitting the evaluation timeout is not an error: the reply holds whatever
    /// arrived and is flagged `timed_out`.
    ///
    /// # Errors
    ///
    /// Returns [`EvalError::Busy`] if another evaluation is outstanding on the
    /// session and [`EvalError::Io`] if the code cannot be written.
    pub fn evaluate(
        &self,
        session: &Session<L::Process>,
        code: &str,
    ) -> Result<EvalReply, EvalError> {
        let _in_flight = session.begin_request().ok_or(EvalError::Busy)?;
        let normalized = normalize_code(code);
        let output = session.output();

        let start = output.end();
        log_debug_content(&format!("session {}: sending {normalized:?}", session.name()));
        session.write_input(&normalized).map_err(EvalError::Io)?;

        let started = Instant::now();
        let seen = output.wait_for_pattern(
            start,
            session.prompt(),
            self.timing.eval_timeout,
            self.timing.poll_interval,
        );
        let raw = output.slice_from(start);
        let end = start + raw.len();
        if !seen {
            log_debug(&format!(
                "session {}: prompt did not return within {}ms; returning partial reply",
                session.name(),
                self.timing.eval_timeout.as_millis()
            ));
        }
        tracing::info!(
            session = %session.name(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            reply_bytes = raw.len(),
            timed_out = !seen,
            "evaluation finished"
        );
        log_debug_content(&format!("session {}: reply {raw:?}", session.name()));
        Ok(EvalReply {
            raw,
            start,
            end,
            timed_out: !seen,
        })
    }

    /// Clean a raw reply per the configured prompt, error, and value-only rules.
    #[must_use]
    pub fn extract_result(&self, raw: &str) -> EvalResult {
        self.rules.extract(raw)
    }

    /// Ensure a session, evaluate `code`, and clean the reply.
    ///
    /// # Errors
    ///
    /// Propagates errors from [`Self::ensure_session`] and [`Self::evaluate`].
    pub fn eval_and_extract(&mut self, code: &str) -> Result<EvalResult, EvalError> {
        let session = self.ensure_session()?;
        let reply = self.evaluate(&session, code)?;
        Ok(self.extract_result(&reply.raw))
    }

    /// Drop the session; the process manager terminates the interpreter.
    pub fn shutdown(&mut self) {
        if let Some(session) = self.session.take() {
            log_debug(&format!("session {}: shutting down", session.name()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reply::{ResultKind, DEFAULT_ERROR_PATTERN, DEFAULT_PROMPT_PATTERN};
    use crate::session::test_support::FakeLauncher;
    use proptest::prelude::*;
    use regex::RegexBuilder;
    use std::thread;

    fn rules(only_show_value: bool) -> ReplyRules {
        ReplyRules {
            prompt: RegexBuilder::new(DEFAULT_PROMPT_PATTERN)
                .multi_line(true)
                .build()
                .unwrap(),
            error: Regex::new(DEFAULT_ERROR_PATTERN).unwrap(),
            only_show_value,
        }
    }

    fn fast_timing() -> SessionTiming {
        SessionTiming {
            startup_timeout: Duration::from_millis(300),
            eval_timeout: Duration::from_millis(300),
            poll_interval: Duration::from_millis(20),
        }
    }

    fn evaluator(launcher: FakeLauncher) -> InteractiveEvaluator<FakeLauncher> {
        InteractiveEvaluator::new(launcher, "*sml*", rules(true), fast_timing())
    }

    #[test]
    fn normalize_appends_terminator_and_newline() {
        assert_eq!(normalize_code("1 + 1"), "1 + 1;\n");
        assert_eq!(normalize_code("1 + 1;"), "1 + 1;\n");
        assert_eq!(normalize_code("val x = 3;  \n\t"), "val x = 3;\n");
        assert_eq!(normalize_code("fun f x = x  \n"), "fun f x = x;\n");
    }

    proptest! {
        #[test]
        fn normalize_adds_exactly_one_terminator(code in "[a-z0-9 +*()=]{0,24}[ \t\n]{0,3}") {
            let normalized = normalize_code(&code);
            let trimmed = code.trim_end();
            prop_assert!(normalized.ends_with(";\n"));
            if trimmed.ends_with(';') {
                prop_assert_eq!(normalized, format!("{trimmed}\n"));
            } else {
                prop_assert_eq!(normalized, format!("{trimmed};\n"));
            }
        }
    }

    #[test]
    fn end_to_end_evaluation_yields_value() {
        let launcher = FakeLauncher::sml();
        let writes = Arc::clone(&launcher.writes);
        let mut evaluator = evaluator(launcher);

        let session = evaluator.ensure_session().unwrap();
        assert!(session.is_ready());
        let reply = evaluator.evaluate(&session, "1 + 1").unwrap();
        assert!(!reply.timed_out);
        assert!(reply.raw.contains("val it = 2 : int"));
        assert!(reply.raw.ends_with("- "));
        assert_eq!(writes.lock().unwrap().as_slice(), ["1 + 1;\n"]);

        let result = evaluator.extract_result(&reply.raw);
        assert_eq!(result.text, "2");
        assert_eq!(result.kind, ResultKind::Value);
    }

    #[test]
    fn sessions_are_reused_across_requests() {
        let launcher = FakeLauncher::sml();
        let launches = Arc::clone(&launcher.launches);
        let mut evaluator = evaluator(launcher);
        let first = evaluator.ensure_session().unwrap();
        let second = evaluator.ensure_session().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*launches.lock().unwrap(), 1);
    }

    #[test]
    fn reply_markers_never_overlap_previous_reply() {
        let mut evaluator = evaluator(FakeLauncher::sml());
        let session = evaluator.ensure_session().unwrap();
        let mut previous_end = session.output().end();
        for code in ["1 + 1", "val x = 3", "1 + 1;", "raise Fail \"boom\""] {
            let reply = evaluator.evaluate(&session, code).unwrap();
            assert!(reply.start >= previous_end);
            assert!(!reply.raw.contains("Standard ML of New Jersey"));
            previous_end = reply.end;
        }
    }

    #[test]
    fn silent_interpreter_times_out_softly() {
        let launcher = FakeLauncher {
            banner: Some("- ".to_string()),
            ..FakeLauncher::silent()
        };
        let evaluator_timing = fast_timing();
        let mut evaluator = evaluator(launcher);
        let session = evaluator.ensure_session().unwrap();

        let started = Instant::now();
        let reply = evaluator.evaluate(&session, "fun loop () = loop ()").unwrap();
        let elapsed = started.elapsed();
        assert!(reply.timed_out);
        assert_eq!(reply.raw, "");
        assert!(elapsed >= evaluator_timing.eval_timeout);
        assert!(elapsed < evaluator_timing.eval_timeout + Duration::from_millis(500));
    }

    #[test]
    fn partial_output_is_returned_on_timeout() {
        let launcher = FakeLauncher {
            script: Arc::new(|_: &str| Some("val big = ".to_string())),
            ..FakeLauncher::sml()
        };
        let mut evaluator = evaluator(launcher);
        let session = evaluator.ensure_session().unwrap();
        let reply = evaluator.evaluate(&session, "big").unwrap();
        assert!(reply.timed_out);
        assert_eq!(reply.raw, "val big = ");
    }

    #[test]
    fn startup_timeout_keeps_session_for_retry() {
        let mut evaluator = evaluator(FakeLauncher::silent());
        let Err(err) = evaluator.ensure_session() else {
            panic!("silent interpreter should time out");
        };
        assert!(matches!(err, EvalError::StartupTimeout { .. }));

        let pending = evaluator.current_session().expect("session retained");
        pending.output().append("Standard ML\n- ");
        let ready = evaluator.ensure_session().unwrap();
        assert!(Arc::ptr_eq(&pending, &ready));
        assert_eq!(evaluator.launcher.launch_count(), 1);
    }

    #[test]
    fn interpreter_exit_during_startup_is_reported_promptly() {
        let mut evaluator = InteractiveEvaluator::new(
            FakeLauncher::missing_binary(),
            "*sml*",
            rules(true),
            SessionTiming {
                startup_timeout: Duration::from_secs(5),
                ..fast_timing()
            },
        );
        let started = Instant::now();
        let Err(err) = evaluator.ensure_session() else {
            panic!("a dead interpreter cannot become ready");
        };
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(matches!(err, EvalError::Exited { .. }));
        assert!(err.to_string().contains("execvp failed: No such file"));
        assert!(evaluator.session.is_none());

        let Err(again) = evaluator.ensure_session() else {
            panic!("relaunching the same missing binary fails again");
        };
        assert!(matches!(again, EvalError::Exited { .. }));
        assert_eq!(evaluator.launcher.launch_count(), 2);
    }

    #[test]
    fn dead_session_is_replaced() {
        let mut evaluator = evaluator(FakeLauncher::sml());
        let first = evaluator.ensure_session().unwrap();
        // Simulate the process manager reaping the interpreter.
        if let Some(slot) = evaluator.session.as_mut() {
            let fresh_output = OutputBuffer::new();
            let mut process = evaluator.launcher.launch(fresh_output.clone()).unwrap();
            process.alive = false;
            let prompt = evaluator.prompt.clone();
            *slot = Arc::new(Session::new("*sml*", process, fresh_output, prompt));
        }
        let second = evaluator.ensure_session().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.is_alive());
    }

    #[test]
    fn concurrent_evaluation_is_rejected() {
        let launcher = FakeLauncher {
            delay: Duration::from_millis(150),
            ..FakeLauncher::sml()
        };
        let mut evaluator = evaluator(launcher);
        let session = evaluator.ensure_session().unwrap();
        let evaluator = Arc::new(evaluator);

        let background = {
            let evaluator = Arc::clone(&evaluator);
            let session = Arc::clone(&session);
            thread::spawn(move || evaluator.evaluate(&session, "1 + 1"))
        };
        thread::sleep(Duration::from_millis(40));
        let second = evaluator.evaluate(&session, "1 + 1");
        assert!(matches!(second, Err(EvalError::Busy)));

        let first = background.join().unwrap().unwrap();
        assert!(first.raw.contains("val it = 2 : int"));
        assert!(evaluator.evaluate(&session, "1 + 1").is_ok());
    }

    #[test]
    fn write_failure_surfaces_as_io_error_and_releases_session() {
        let mut evaluator = evaluator(FakeLauncher::sml());
        let session = evaluator.ensure_session().unwrap();
        {
            let mut process = session.process_for_tests();
            process.fail_writes = true;
        }
        assert!(matches!(
            evaluator.evaluate(&session, "1 + 1"),
            Err(EvalError::Io(_))
        ));
        session.process_for_tests().fail_writes = false;
        assert!(evaluator.evaluate(&session, "1 + 1").is_ok());
    }

    #[test]
    fn error_reply_is_tagged_in_value_mode() {
        let mut evaluator = evaluator(FakeLauncher::sml());
        let result = evaluator.eval_and_extract("raise Fail \"boom\"").unwrap();
        assert_eq!(result.kind, ResultKind::Error);
        assert!(result.text.contains("uncaught exception Fail"));
    }
}
