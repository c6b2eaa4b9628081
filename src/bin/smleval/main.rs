//! smleval: evaluate Standard ML in a long-lived interpreter.
//!
//! Starts the interpreter under a PTY on first use, sends each fragment to its
//! prompt, and prints the cleaned reply as `=> value` or `!! error`.

mod cli;
mod repl;

use anyhow::{anyhow, Result};
use clap::Parser;
use crossterm::tty::IsTty;
use smleval::annotation::{color_enabled, highlighter_for, TerminalSink};
use smleval::commands::{CommandOutcome, Commands, EditBuffer};
use smleval::config::{load_user_config, EvalSettings};
use smleval::pty_session::PtyLauncher;
use smleval::{init_logging, init_tracing, log_debug, log_file_path, InteractiveEvaluator};
use std::io::{self, Stdout, Write};
use std::process::ExitCode;

use crate::cli::{Cli, Command};

pub(crate) type CliCommands = Commands<PtyLauncher, TerminalSink<Stdout>>;

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(&cli.config);
    init_tracing(&cli.config);
    log_debug("=== smleval started ===");
    log_debug(&format!("Log file: {:?}", log_file_path()));

    let user = load_user_config(cli.config.config_file.as_deref())?;
    let settings = cli.config.resolve(&user)?;
    log_debug(&format!(
        "interpreter: {} {:?}",
        settings.sml_cmd, settings.sml_args
    ));

    let styled = color_enabled(io::stdout().is_tty());
    let mut commands = build_commands(&settings, styled);
    if settings.show_session_on_start {
        show_session(&mut commands, &settings, styled)?;
    }

    let outcome = match &cli.command {
        Command::Eval { code } => commands.evaluate_buffer(&EditBuffer::new(code.as_str()))?,
        Command::EvalFile { path } => commands.evaluate_file(path)?,
        Command::EvalLine { path, line } => {
            let buffer = EditBuffer::from_file(path)?;
            let pos = buffer
                .line_start(*line)
                .ok_or_else(|| anyhow!("{} has no line {line}", path.display()))?;
            commands.evaluate_line(&buffer, pos)?
        }
        Command::EvalRegion { path, start, end } => {
            let buffer = EditBuffer::from_file(path)?;
            commands.evaluate_region(&buffer, *start, *end)?
        }
        Command::Repl => {
            repl::run(&mut commands)?;
            commands.evaluator_mut().shutdown();
            return Ok(ExitCode::SUCCESS);
        }
    };
    commands.evaluator_mut().shutdown();
    Ok(exit_code(&outcome))
}

fn build_commands(settings: &EvalSettings, styled: bool) -> CliCommands {
    let launcher = PtyLauncher::new(&settings.sml_cmd, settings.sml_args.clone());
    let evaluator = InteractiveEvaluator::new(
        launcher,
        &settings.session_buffer_name,
        settings.reply.clone(),
        settings.timing,
    );
    Commands::new(
        evaluator,
        TerminalSink::new(io::stdout(), styled),
        settings.overlay_font_lock && styled,
        settings.overlay_dismiss_delay,
    )
}

/// Start the session up front and print what the interpreter showed so far.
fn show_session(commands: &mut CliCommands, settings: &EvalSettings, styled: bool) -> Result<()> {
    match commands.evaluator_mut().ensure_session() {
        Ok(session) => {
            let highlighter = highlighter_for(settings.session_font_lock && styled);
            let transcript = session.transcript();
            let mut out = io::stdout().lock();
            writeln!(out, "[{}]", session.name())?;
            writeln!(out, "{}", highlighter.highlight(transcript.trim_end()))?;
            out.flush()?;
        }
        Err(err) => commands.sink_mut().notice(&err.to_string())?,
    }
    Ok(())
}

fn exit_code(outcome: &CommandOutcome) -> ExitCode {
    match outcome {
        CommandOutcome::Evaluated(result) if !result.is_error() => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    }
}
