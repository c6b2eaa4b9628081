//! Reply cleanup: strip prompt lines, optionally reduce to the echoed value, classify errors.
//!
//! Value extraction reads a single-line `val <name> = <value> : <type>` echo.
//! Multi-line echoes (records or datatypes the interpreter wraps) fall back to the
//! full cleaned text instead of being partially parsed.

use regex::Regex;
use std::sync::OnceLock;

/// Default interpreter prompt: a line that begins with a dash and a space.
pub const DEFAULT_PROMPT_PATTERN: &str = "^- ";

/// Default error-line pattern for SML/NJ compile errors and uncaught exceptions.
pub const DEFAULT_ERROR_PATTERN: &str = r"^.*(Error:|uncaught exception)";

const VALUE_ECHO_PATTERN: &str = r"(?m)^val[ \t]+[^\s=]+[ \t]*=[ \t]*(.+)[ \t]+:[ \t]+\S.*$";

fn value_echo_regex() -> &'static Regex {
    static VALUE_ECHO: OnceLock<Regex> = OnceLock::new();
    VALUE_ECHO.get_or_init(|| Regex::new(VALUE_ECHO_PATTERN).expect("value echo pattern is valid"))
}

/// How a cleaned reply should be styled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    Value,
    Error,
}

/// Cleaned interpreter reply ready for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalResult {
    pub text: String,
    pub kind: ResultKind,
}

impl EvalResult {
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.kind == ResultKind::Error
    }
}

/// Patterns that decide how a raw reply is cleaned and classified.
#[derive(Debug, Clone)]
pub struct ReplyRules {
    pub prompt: Regex,
    pub error: Regex,
    pub only_show_value: bool,
}

impl ReplyRules {
    /// Drop every line the prompt pattern matches, then trim what remains.
    #[must_use]
    pub fn strip_prompt_lines(&self, raw: &str) -> String {
        raw.lines()
            .filter(|line| !self.prompt.is_match(line))
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    }

    /// Whether any line of the reply matches the interpreter error pattern.
    #[must_use]
    pub fn is_error_reply(&self, raw: &str) -> bool {
        raw.lines().any(|line| self.error.is_match(line))
    }

    /// Turn a raw reply into display text tagged as a value or an error.
    #[must_use]
    pub fn extract(&self, raw: &str) -> EvalResult {
        let cleaned = self.strip_prompt_lines(raw);
        let kind = if self.is_error_reply(raw) {
            ResultKind::Error
        } else {
            ResultKind::Value
        };
        let text = if self.only_show_value {
            extract_value(&cleaned).map_or(cleaned.clone(), str::to_string)
        } else {
            cleaned
        };
        EvalResult { text, kind }
    }
}

/// The `<value>` capture of the first `val <name> = <value> : <type>` echo line.
#[must_use]
pub fn extract_value(cleaned: &str) -> Option<&str> {
    value_echo_regex()
        .captures(cleaned)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn rules(only_show_value: bool) -> ReplyRules {
        ReplyRules {
            prompt: Regex::new(DEFAULT_PROMPT_PATTERN).unwrap(),
            error: Regex::new(DEFAULT_ERROR_PATTERN).unwrap(),
            only_show_value,
        }
    }

    #[test]
    fn prompt_only_reply_is_empty() {
        let result = rules(true).extract("- \n- ");
        assert_eq!(result.text, "");
        assert_eq!(result.kind, ResultKind::Value);
    }

    #[test]
    fn value_only_mode_keeps_the_value() {
        let result = rules(true).extract("val it = 42 : int\n- ");
        assert_eq!(result.text, "42");
        assert!(!result.is_error());
    }

    #[test]
    fn full_mode_keeps_the_echo_without_prompt() {
        let result = rules(false).extract("val it = 42 : int\n- ");
        assert_eq!(result.text, "val it = 42 : int");
    }

    #[rstest]
    #[case("val x = \"a : b\" : string\n- ", "\"a : b\"")]
    #[case("val f = fn : int -> int\n- ", "fn")]
    #[case("val xs = [1,2,3] : int list\n- ", "[1,2,3]")]
    #[case("val it = (1,true) : int * bool\n- ", "(1,true)")]
    #[case("datatype t = A | B\n- ", "datatype t = A | B")]
    fn value_extraction_cases(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(rules(true).extract(raw).text, expected);
    }

    #[test]
    fn multi_line_echo_is_not_partially_parsed() {
        let raw = "val r =\n  {a=1, b=2} : {a:int, b:int}\n- ";
        assert_eq!(
            rules(true).extract(raw).text,
            "val r =\n  {a=1, b=2} : {a:int, b:int}"
        );
    }

    #[rstest]
    #[case(true)]
    #[case(false)]
    fn error_replies_are_classified_in_either_mode(#[case] only_show_value: bool) {
        let raw = "stdIn:1.2-1.5 Error: unbound variable or constructor: foo\n- ";
        let result = rules(only_show_value).extract(raw);
        assert!(result.is_error());
        assert_eq!(
            result.text,
            "stdIn:1.2-1.5 Error: unbound variable or constructor: foo"
        );
    }

    #[test]
    fn uncaught_exception_is_an_error() {
        let raw = "\nuncaught exception Fail [Fail: boom]\n  raised at: stdIn:1.2-1.16\n- ";
        let result = rules(true).extract(raw);
        assert!(result.is_error());
        assert!(result.text.starts_with("uncaught exception Fail"));
    }
}
