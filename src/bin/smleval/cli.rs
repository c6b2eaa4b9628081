use clap::{Parser, Subcommand};
use smleval::config::EvalConfig;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    about = "smleval: evaluate Standard ML in a persistent interpreter session",
    author,
    version
)]
pub(crate) struct Cli {
    #[command(flatten)]
    pub(crate) config: EvalConfig,

    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Evaluate a code fragment
    Eval {
        /// Code to send, e.g. "1 + 1"
        code: String,
    },

    /// Evaluate a whole file
    EvalFile { path: PathBuf },

    /// Evaluate one line of a file
    EvalLine {
        path: PathBuf,
        /// 1-based line number
        line: usize,
    },

    /// Evaluate a character range of a file
    EvalRegion {
        path: PathBuf,
        /// Start offset in characters
        start: usize,
        /// End offset in characters
        end: usize,
    },

    /// Read fragments from stdin, one per line, and evaluate them in one session
    Repl,
}
