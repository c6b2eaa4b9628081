//! User-facing evaluation commands over an in-memory text buffer.
//!
//! Positions are character offsets. Every command clears the annotations in
//! its region, evaluates the region text, and annotates the region end.

use crate::annotation::{annotate, highlighter_for, Annotation, AnnotationSink, Highlighter};
use crate::evaluator::{EvalError, InteractiveEvaluator};
use crate::log_debug;
use crate::reply::{EvalResult, ResultKind};
use crate::session::ProcessLauncher;
use anyhow::{Context, Result};
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

/// Source text the commands read regions from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EditBuffer {
    text: String,
}

impl EditBuffer {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// Read a whole file into a buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read as UTF-8.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Ok(Self { text })
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn len_chars(&self) -> usize {
        self.text.chars().count()
    }

    fn byte_offset(&self, pos: usize) -> usize {
        self.text
            .char_indices()
            .nth(pos)
            .map_or(self.text.len(), |(idx, _)| idx)
    }

    /// Order `start`/`end` and clamp both to the buffer.
    #[must_use]
    pub fn bounds(&self, start: usize, end: usize) -> (usize, usize) {
        let len = self.len_chars();
        let (low, high) = if start <= end { (start, end) } else { (end, start) };
        (low.min(len), high.min(len))
    }

    /// Text between two positions, in either order.
    #[must_use]
    pub fn slice(&self, start: usize, end: usize) -> &str {
        let (start, end) = self.bounds(start, end);
        let from = self.byte_offset(start);
        let to = self.byte_offset(end);
        self.text.get(from..to).unwrap_or("")
    }

    /// Start and end (exclusive of the newline) of the line containing `pos`.
    #[must_use]
    pub fn line_bounds(&self, pos: usize) -> (usize, usize) {
        let chars: Vec<char> = self.text.chars().collect();
        let pos = pos.min(chars.len());
        let start = chars[..pos]
            .iter()
            .rposition(|ch| *ch == '\n')
            .map_or(0, |idx| idx + 1);
        let end = chars[pos..]
            .iter()
            .position(|ch| *ch == '\n')
            .map_or(chars.len(), |idx| pos + idx);
        (start, end)
    }

    /// Append `line` plus a newline; returns the appended line's bounds.
    pub fn push_line(&mut self, line: &str) -> (usize, usize) {
        let start = self.len_chars();
        self.text.push_str(line);
        let end = start + line.chars().count();
        self.text.push('\n');
        (start, end)
    }

    /// Position of the first character of 1-based `line`.
    #[must_use]
    pub fn line_start(&self, line: usize) -> Option<usize> {
        match line {
            0 => None,
            1 => Some(0),
            _ => self
                .text
                .chars()
                .enumerate()
                .filter(|(_, ch)| *ch == '\n')
                .nth(line - 2)
                .map(|(idx, _)| idx + 1),
        }
    }
}

/// What a command did with its region.
#[derive(Debug)]
pub enum CommandOutcome {
    Evaluated(EvalResult),
    Failed(EvalError),
}

impl CommandOutcome {
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Binds an evaluator to the sink its results are shown in.
pub struct Commands<L: ProcessLauncher, S: AnnotationSink> {
    evaluator: InteractiveEvaluator<L>,
    sink: S,
    highlighter: Box<dyn Highlighter>,
    dismiss_delay: Duration,
}

impl<L: ProcessLauncher, S: AnnotationSink> Commands<L, S> {
    pub fn new(
        evaluator: InteractiveEvaluator<L>,
        sink: S,
        overlay_font_lock: bool,
        dismiss_delay: Duration,
    ) -> Self {
        Self {
            evaluator,
            sink,
            highlighter: highlighter_for(overlay_font_lock),
            dismiss_delay,
        }
    }

    #[must_use]
    pub fn evaluator(&self) -> &InteractiveEvaluator<L> {
        &self.evaluator
    }

    pub fn evaluator_mut(&mut self) -> &mut InteractiveEvaluator<L> {
        &mut self.evaluator
    }

    #[must_use]
    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Evaluate the text between `start` and `end` and annotate the region end.
    ///
    /// Evaluation failures are annotated in the error style and returned as
    /// [`CommandOutcome::Failed`]; they do not end the session.
    ///
    /// # Errors
    ///
    /// Returns an error only if the sink cannot render the annotation.
    pub fn evaluate_region(
        &mut self,
        buffer: &EditBuffer,
        start: usize,
        end: usize,
    ) -> io::Result<CommandOutcome> {
        let (start, end) = buffer.bounds(start, end);
        self.sink.clear_range(start, end);
        let outcome = match self.evaluator.eval_and_extract(buffer.slice(start, end)) {
            Ok(result) => CommandOutcome::Evaluated(result),
            Err(err) => {
                log_debug(&format!("evaluation of {start}..{end} failed: {err}"));
                CommandOutcome::Failed(err)
            }
        };
        let annotation = match &outcome {
            CommandOutcome::Evaluated(result) => {
                annotate(result, end, self.highlighter.as_ref(), self.dismiss_delay)
            }
            CommandOutcome::Failed(err) => Annotation {
                position: end,
                text: err.to_string(),
                kind: ResultKind::Error,
                expires_after: self.dismiss_delay,
            },
        };
        self.sink.place(annotation)?;
        Ok(outcome)
    }

    /// Evaluate the line containing `pos`.
    ///
    /// # Errors
    ///
    /// See [`Self::evaluate_region`].
    pub fn evaluate_line(&mut self, buffer: &EditBuffer, pos: usize) -> io::Result<CommandOutcome> {
        let (start, end) = buffer.line_bounds(pos);
        self.evaluate_region(buffer, start, end)
    }

    /// Evaluate the whole buffer.
    ///
    /// # Errors
    ///
    /// See [`Self::evaluate_region`].
    pub fn evaluate_buffer(&mut self, buffer: &EditBuffer) -> io::Result<CommandOutcome> {
        self.evaluate_region(buffer, 0, buffer.len_chars())
    }

    /// Read `path` and evaluate its contents as one buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or the annotation cannot be rendered.
    pub fn evaluate_file(&mut self, path: &Path) -> Result<CommandOutcome> {
        let buffer = EditBuffer::from_file(path)?;
        Ok(self.evaluate_buffer(&buffer)?)
    }
}
