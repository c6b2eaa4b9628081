//! Shared smleval library so the CLI and embedders drive interpreter sessions the same way.

pub mod annotation;
pub mod commands;
pub mod config;
pub mod evaluator;
mod lock;
mod logging;
mod process_signal;
pub mod pty_session;
pub mod reply;
pub mod session;
mod telemetry;

pub use evaluator::{EvalError, InteractiveEvaluator};
pub(crate) use lock::lock_or_recover;
pub use logging::{init_logging, log_debug, log_debug_content, log_file_path};
pub use reply::{EvalResult, ResultKind};
pub use session::{EvalReply, OutputBuffer, Session};
pub use telemetry::init_tracing;
