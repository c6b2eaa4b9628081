//! Line-at-a-time loop that keeps one interpreter session across fragments.

use crate::CliCommands;
use anyhow::Result;
use crossterm::tty::IsTty;
use smleval::commands::{CommandOutcome, EditBuffer};
use smleval::log_debug;
use std::io::{self, BufRead, Write};
use std::time::Instant;

const REPL_PROMPT: &str = "sml> ";
const QUIT_COMMAND: &str = ":quit";

/// Evaluate each non-empty stdin line until EOF or `:quit`.
///
/// Failures are shown and the loop continues; a session that missed its
/// startup window is retried on the next line.
pub(crate) fn run(commands: &mut CliCommands) -> Result<()> {
    let stdin = io::stdin();
    let interactive = stdin.is_tty();
    let mut history = EditBuffer::default();
    let mut line = String::new();
    loop {
        if interactive {
            let mut out = io::stdout();
            write!(out, "{REPL_PROMPT}")?;
            out.flush()?;
        }
        line.clear();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let fragment = line.trim();
        if fragment.is_empty() {
            continue;
        }
        if fragment == QUIT_COMMAND {
            break;
        }
        let (start, end) = history.push_line(fragment);
        if let CommandOutcome::Failed(err) = commands.evaluate_region(&history, start, end)? {
            log_debug(&format!("repl: {err}"));
        }
        commands.sink_mut().layer_mut().sweep(Instant::now());
    }
    Ok(())
}
