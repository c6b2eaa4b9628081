//! Transient result annotations and the highlighting applied to them.

use crate::reply::{EvalResult, ResultKind};
use crossterm::style::{StyledContent, Stylize};
use regex::Regex;
use std::env;
use std::io::{self, Write};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// A styled, auto-expiring note attached to a buffer position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    /// Character offset the annotation is anchored after.
    pub position: usize,
    /// Display text, possibly carrying ANSI styling.
    pub text: String,
    pub kind: ResultKind,
    pub expires_after: Duration,
}

/// Where evaluation results are shown.
pub trait AnnotationSink {
    /// Show `annotation`; it should disappear after `expires_after`.
    ///
    /// # Errors
    ///
    /// Returns an error if the annotation cannot be rendered.
    fn place(&mut self, annotation: Annotation) -> io::Result<()>;

    /// Remove annotations anchored in `start..=end`.
    fn clear_range(&mut self, start: usize, end: usize);
}

/// Turns plain interpreter text into a styled string for display.
pub trait Highlighter {
    fn highlight(&self, text: &str) -> String;
}

/// Leaves text untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainHighlighter;

impl Highlighter for PlainHighlighter {
    fn highlight(&self, text: &str) -> String {
        text.to_string()
    }
}

const SML_KEYWORDS: &str = concat!(
    r"\b(val|fun|fn|let|in|end|if|then|else|case|of|datatype|type|structure|signature",
    r"|struct|sig|functor|open|local|raise|handle|andalso|orelse|rec|and|exception|where|with)\b",
);

fn keyword_regex() -> &'static Regex {
    static KEYWORDS: OnceLock<Regex> = OnceLock::new();
    KEYWORDS.get_or_init(|| Regex::new(SML_KEYWORDS).expect("keyword pattern is valid"))
}

/// Bold-magenta SML keywords, everything else unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct SmlHighlighter;

impl Highlighter for SmlHighlighter {
    fn highlight(&self, text: &str) -> String {
        keyword_regex()
            .replace_all(text, |caps: &regex::Captures<'_>| {
                caps[0].to_string().magenta().bold().to_string()
            })
            .into_owned()
    }
}

/// Whether output to a stream should carry ANSI styling.
///
/// Honors `NO_COLOR` and `TERM=dumb`; non-terminal streams are never styled.
#[must_use]
pub fn color_enabled(stream_is_tty: bool) -> bool {
    color_enabled_with(
        stream_is_tty,
        env::var_os("NO_COLOR").is_some(),
        env::var("TERM").ok().as_deref(),
    )
}

fn color_enabled_with(stream_is_tty: bool, no_color: bool, term: Option<&str>) -> bool {
    stream_is_tty && !no_color && term != Some("dumb")
}

/// Pick the highlighter for a font-lock setting.
#[must_use]
pub fn highlighter_for(font_lock: bool) -> Box<dyn Highlighter> {
    if font_lock {
        Box::new(SmlHighlighter)
    } else {
        Box::new(PlainHighlighter)
    }
}

/// Build the annotation for a cleaned result at `position`.
#[must_use]
pub fn annotate(
    result: &EvalResult,
    position: usize,
    highlighter: &dyn Highlighter,
    expires_after: Duration,
) -> Annotation {
    let text = match result.kind {
        ResultKind::Value => highlighter.highlight(&result.text),
        ResultKind::Error => result.text.clone(),
    };
    Annotation {
        position,
        text,
        kind: result.kind,
        expires_after,
    }
}

#[derive(Debug, Clone)]
struct LiveAnnotation {
    annotation: Annotation,
    expires_at: Instant,
}

/// In-memory annotation layer: tracks what is visible and drops expired entries.
#[derive(Debug, Default)]
pub struct AnnotationLayer {
    live: Vec<LiveAnnotation>,
}

impl AnnotationLayer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Annotations still visible at `now`.
    #[must_use]
    pub fn visible_at(&self, now: Instant) -> Vec<&Annotation> {
        self.live
            .iter()
            .filter(|entry| entry.expires_at > now)
            .map(|entry| &entry.annotation)
            .collect()
    }

    /// Forget annotations whose delay has passed; returns how many were removed.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.live.len();
        self.live.retain(|entry| entry.expires_at > now);
        before - self.live.len()
    }

    fn insert(&mut self, annotation: Annotation, now: Instant) {
        self.sweep(now);
        let expires_at = now + annotation.expires_after;
        self.live.push(LiveAnnotation {
            annotation,
            expires_at,
        });
    }

    fn remove_range(&mut self, start: usize, end: usize) {
        self.live
            .retain(|entry| !(start..=end).contains(&entry.annotation.position));
    }
}

impl AnnotationSink for AnnotationLayer {
    fn place(&mut self, annotation: Annotation) -> io::Result<()> {
        self.insert(annotation, Instant::now());
        Ok(())
    }

    fn clear_range(&mut self, start: usize, end: usize) {
        self.remove_range(start, end);
    }
}

/// Prints each annotation as a `=> value` / `!! error` line.
pub struct TerminalSink<W: Write> {
    out: W,
    styled: bool,
    layer: AnnotationLayer,
}

impl<W: Write> TerminalSink<W> {
    pub fn new(out: W, styled: bool) -> Self {
        Self {
            out,
            styled,
            layer: AnnotationLayer::new(),
        }
    }

    #[must_use]
    pub fn layer(&self) -> &AnnotationLayer {
        &self.layer
    }

    pub fn layer_mut(&mut self) -> &mut AnnotationLayer {
        &mut self.layer
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn marker(&self, kind: ResultKind) -> String {
        let marker: StyledContent<&str> = match kind {
            ResultKind::Value => "=>".green(),
            ResultKind::Error => "!!".red().bold(),
        };
        if self.styled {
            marker.to_string()
        } else {
            marker.content().to_string()
        }
    }

    /// Print a one-off notice (startup timeouts, busy sessions) in the error style.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to the output fails.
    pub fn notice(&mut self, message: &str) -> io::Result<()> {
        let marker = self.marker(ResultKind::Error);
        writeln!(self.out, "{marker} {message}")?;
        self.out.flush()
    }
}

impl<W: Write> AnnotationSink for TerminalSink<W> {
    fn place(&mut self, annotation: Annotation) -> io::Result<()> {
        let marker = self.marker(annotation.kind);
        let text = if self.styled {
            annotation.text.clone()
        } else {
            strip_styling(&annotation.text)
        };
        writeln!(self.out, "{marker} {text}")?;
        self.out.flush()?;
        self.layer.place(annotation)
    }

    fn clear_range(&mut self, start: usize, end: usize) {
        self.layer.clear_range(start, end);
    }
}

fn strip_styling(text: &str) -> String {
    String::from_utf8_lossy(&strip_ansi_escapes::strip(text)).into_owned()
}
