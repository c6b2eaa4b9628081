//! Interpreter sessions: one live process, its append-only output and the prompt ending a reply.

use crate::{lock_or_recover, log_debug};
use anyhow::Result;
use crossbeam_channel::{bounded, Receiver, Sender};
use regex::Regex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Append-only record of everything the interpreter has written since the session started.
///
/// Clones share storage: the PTY reader appends while the evaluator waits on the
/// same buffer. Positions are byte offsets and only ever grow.
#[derive(Clone, Default)]
pub struct OutputBuffer {
    inner: Arc<BufferInner>,
}

struct BufferInner {
    text: Mutex<String>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl Default for BufferInner {
    fn default() -> Self {
        // One pending wake is enough: the waiter re-reads the whole tail.
        let (wake_tx, wake_rx) = bounded(1);
        Self {
            text: Mutex::new(String::new()),
            wake_tx,
            wake_rx,
        }
    }
}

impl OutputBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append interpreter output and wake the waiter, if any.
    pub fn append(&self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        lock_or_recover(&self.inner.text, "OutputBuffer::append").push_str(chunk);
        let _ = self.inner.wake_tx.try_send(());
    }

    /// Current end-of-buffer position.
    #[must_use]
    pub fn end(&self) -> usize {
        lock_or_recover(&self.inner.text, "OutputBuffer::end").len()
    }

    /// Everything appended at or after `marker`.
    #[must_use]
    pub fn slice_from(&self, marker: usize) -> String {
        let text = lock_or_recover(&self.inner.text, "OutputBuffer::slice_from");
        text.get(marker..).unwrap_or_default().to_string()
    }

    #[must_use]
    pub fn contents(&self) -> String {
        lock_or_recover(&self.inner.text, "OutputBuffer::contents").clone()
    }

    fn matches_after(&self, marker: usize, pattern: &Regex) -> bool {
        let text = lock_or_recover(&self.inner.text, "OutputBuffer::wait_for_pattern");
        text.get(marker..).is_some_and(|tail| pattern.is_match(tail))
    }

    /// Block until `pattern` matches output at or after `marker`, or `timeout` elapses.
    ///
    /// Wakes on every append; `max_slice` caps a single park so a missed
    /// wake costs at most one slice. Returns whether the pattern was seen.
    pub fn wait_for_pattern(
        &self,
        marker: usize,
        pattern: &Regex,
        timeout: Duration,
        max_slice: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.matches_after(marker, pattern) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let _ = self.inner.wake_rx.recv_timeout((deadline - now).min(max_slice));
        }
    }
}

/// Handle to a running interpreter, as seen by the evaluator.
///
/// The process manager owns the child; the session only writes input and asks
/// whether it is still alive.
pub trait InteractiveProcess: Send {
    /// Write raw text to the interpreter's input.
    ///
    /// # Errors
    ///
    /// Returns an error if the interpreter's input can no longer be written.
    fn write_input(&mut self, text: &str) -> Result<()>;

    fn is_alive(&self) -> bool;
}

/// Starts interpreter processes that stream their output into a session buffer.
pub trait ProcessLauncher {
    type Process: InteractiveProcess;

    /// Spawn a new interpreter wired to append its output into `output`.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be started.
    fn launch(&self, output: OutputBuffer) -> Result<Self::Process>;
}

/// Raw interpreter output produced in response to one submitted fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalReply {
    /// Output from the high-water mark to the buffer end when the wait finished.
    pub raw: String,
    /// High-water mark captured before the fragment was written.
    pub start: usize,
    /// Buffer end at the moment the reply was sliced.
    pub end: usize,
    /// The prompt never reappeared; `raw` is whatever arrived in time.
    pub timed_out: bool,
}

/// How the wait for an interpreter's first prompt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Startup {
    Ready,
    TimedOut,
    /// The process died before printing a prompt.
    Exited,
}

/// One interpreter process plus its accumulated output.
pub struct Session<P> {
    name: String,
    process: Mutex<P>,
    output: OutputBuffer,
    prompt: Regex,
    ready: AtomicBool,
    in_flight: AtomicBool,
}

impl<P> fmt::Debug for Session<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("ready", &self.ready.load(Ordering::Relaxed))
            .field("in_flight", &self.in_flight.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<P: InteractiveProcess> Session<P> {
    pub(crate) fn new(name: &str, process: P, output: OutputBuffer, prompt: Regex) -> Self {
        Self {
            name: name.to_string(),
            process: Mutex::new(process),
            output,
            prompt,
            ready: AtomicBool::new(false),
            in_flight: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn output(&self) -> &OutputBuffer {
        &self.output
    }

    #[must_use]
    pub fn prompt(&self) -> &Regex {
        &self.prompt
    }

    /// Full interpreter transcript, including the startup banner.
    #[must_use]
    pub fn transcript(&self) -> String {
        self.output.contents()
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        lock_or_recover(&self.process, "Session::is_alive").is_alive()
    }

    /// Whether the first prompt has been observed.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Last `lines` non-empty transcript lines, oldest first.
    #[must_use]
    pub fn transcript_tail(&self, lines: usize) -> String {
        let transcript = self.output.contents();
        let mut tail: Vec<&str> = transcript
            .lines()
            .rev()
            .map(str::trim_end)
            .filter(|line| !line.is_empty())
            .take(lines)
            .collect();
        tail.reverse();
        tail.join("\n")
    }

    /// Wait for the interpreter's first prompt anywhere in the transcript.
    ///
    /// Gives up early once the process has exited, after one more slice for
    /// its last output to land in the buffer.
    pub(crate) fn await_first_prompt(&self, timeout: Duration, max_slice: Duration) -> Startup {
        if self.is_ready() {
            return Startup::Ready;
        }
        let deadline = Instant::now() + timeout;
        loop {
            let slice = deadline.saturating_duration_since(Instant::now()).min(max_slice);
            if self.output.wait_for_pattern(0, &self.prompt, slice, slice) {
                self.ready.store(true, Ordering::Release);
                return Startup::Ready;
            }
            if !self.is_alive() {
                thread::sleep(max_slice);
                log_debug(&format!("session {}: interpreter exited during startup", self.name));
                return Startup::Exited;
            }
            if Instant::now() >= deadline {
                return Startup::TimedOut;
            }
        }
    }

    pub(crate) fn write_input(&self, text: &str) -> Result<()> {
        lock_or_recover(&self.process, "Session::write_input").write_input(text)
    }

    #[cfg(test)]
    pub(crate) fn process_for_tests(&self) -> std::sync::MutexGuard<'_, P> {
        lock_or_recover(&self.process, "Session::process_for_tests")
    }

    /// Claim the session for one evaluation; `None` if another is outstanding.
    pub(crate) fn begin_request(&self) -> Option<InFlightGuard<'_>> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log_debug(&format!("session {}: evaluation already in flight", self.name));
            return None;
        }
        Some(InFlightGuard {
            flag: &self.in_flight,
        })
    }
}

/// Releases the single-flight claim on drop, including early-error paths.
pub(crate) struct InFlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::FakeLauncher;
    use super::*;
    use std::thread;

    fn prompt() -> Regex {
        Regex::new("(?m)^- ").unwrap()
    }

    #[test]
    fn slice_from_returns_only_output_after_marker() {
        let buffer = OutputBuffer::new();
        buffer.append("val x = 1 : int\n- ");
        let marker = buffer.end();
        buffer.append("val it = 2 : int\n- ");
        assert_eq!(buffer.slice_from(marker), "val it = 2 : int\n- ");
        assert_eq!(buffer.slice_from(buffer.end() + 10), "");
    }

    #[test]
    fn wait_for_pattern_ignores_prompts_before_marker() {
        let buffer = OutputBuffer::new();
        buffer.append("- ");
        let marker = buffer.end();
        let seen = buffer.wait_for_pattern(
            marker,
            &prompt(),
            Duration::from_millis(50),
            Duration::from_millis(10),
        );
        assert!(!seen);
    }

    #[test]
    fn wait_for_pattern_wakes_on_append_from_another_thread() {
        let buffer = OutputBuffer::new();
        let writer = buffer.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            writer.append("val it = 2 : int\n- ");
        });
        let start = Instant::now();
        let seen = buffer.wait_for_pattern(
            0,
            &prompt(),
            Duration::from_secs(2),
            Duration::from_millis(100),
        );
        handle.join().unwrap();
        assert!(seen);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn single_flight_guard_rejects_second_request_until_released() {
        let launcher = FakeLauncher::sml();
        let output = OutputBuffer::new();
        let process = launcher.launch(output.clone()).unwrap();
        let session = Session::new("*sml*", process, output, prompt());

        let first = session.begin_request();
        assert!(first.is_some());
        assert!(session.begin_request().is_none());
        drop(first);
        assert!(session.begin_request().is_some());
    }

    #[test]
    fn await_first_prompt_marks_session_ready() {
        let launcher = FakeLauncher::sml();
        let output = OutputBuffer::new();
        let process = launcher.launch(output.clone()).unwrap();
        let session = Session::new("*sml*", process, output, prompt());
        assert!(!session.is_ready());
        let startup =
            session.await_first_prompt(Duration::from_millis(100), Duration::from_millis(10));
        assert_eq!(startup, Startup::Ready);
        assert!(session.is_ready());
        assert!(session.transcript().starts_with("Standard ML of New Jersey"));
    }

    #[test]
    fn await_first_prompt_stops_when_the_process_exits() {
        let launcher = FakeLauncher::missing_binary();
        let output = OutputBuffer::new();
        let process = launcher.launch(output.clone()).unwrap();
        let session = Session::new("*sml*", process, output, prompt());

        let started = Instant::now();
        let startup = session.await_first_prompt(Duration::from_secs(5), Duration::from_millis(10));
        assert_eq!(startup, Startup::Exited);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!session.is_ready());
        assert!(session.transcript_tail(2).contains("execvp failed"));
    }

    #[test]
    fn transcript_tail_skips_blank_lines() {
        let output = OutputBuffer::new();
        output.append("Standard ML\n\nline one\r\nline two\n\n");
        let process = FakeLauncher::silent().launch(output.clone()).unwrap();
        let session = Session::new("*sml*", process, output, prompt());
        assert_eq!(session.transcript_tail(2), "line one\nline two");
        assert_eq!(session.transcript_tail(0), "");
    }

    #[test]
    fn debug_output_names_the_session() {
        let launcher = FakeLauncher::sml();
        let output = OutputBuffer::new();
        let process = launcher.launch(output.clone()).unwrap();
        let session = Session::new("*sml*", process, output, prompt());
        let rendered = format!("{session:?}");
        assert!(rendered.contains("\"*sml*\""));
        assert!(rendered.contains("ready: false"));
    }
}
