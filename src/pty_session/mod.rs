//! PTY host for the interpreter so it prompts exactly as it would in a terminal.

mod io;
mod pty;

pub use pty::{resolve_command, PtyInterpreter, PtyLauncher};
