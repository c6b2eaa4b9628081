//! Signal delivery for interpreter teardown.
//!
//! The interpreter runs as a session leader (`setsid()` in the PTY child), so
//! signalling `-pid` also reaches anything it forked, such as a heap-image
//! loader wrapper script.

use std::io;

/// Outcome of a single `kill(2)` attempt, captured before errno can change.
fn kill_target(target: i32, signal: i32) -> io::Result<()> {
    // SAFETY: kill takes plain integers; errno is read immediately after the call.
    if unsafe { libc::kill(target, signal) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn is_no_such_process(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ESRCH)
}

/// Send `signal` to the interpreter's process group, falling back to the bare pid.
///
/// When `already_gone_is_ok` is set an `ESRCH` on the direct pid counts as success,
/// which is what shutdown paths want after the child has exited on its own.
pub(crate) fn signal_interpreter(
    pid: i32,
    signal: i32,
    already_gone_is_ok: bool,
) -> io::Result<()> {
    if pid <= 0 {
        return Ok(());
    }
    let group_err = match kill_target(-pid, signal) {
        Ok(()) => return Ok(()),
        Err(err) => err,
    };
    match kill_target(pid, signal) {
        Ok(()) => Ok(()),
        Err(pid_err) if already_gone_is_ok && is_no_such_process(&pid_err) => Ok(()),
        Err(pid_err) => Err(io::Error::new(
            pid_err.kind(),
            format!("signal {signal} to group -{pid} failed: {group_err}; to pid {pid}: {pid_err}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unused_pid() -> i32 {
        let mut candidate = i32::MAX;
        for _ in 0..1000 {
            if matches!(kill_target(candidate, 0), Err(ref err) if is_no_such_process(err)) {
                return candidate;
            }
            candidate -= 1;
        }
        panic!("no unused pid found for signal tests");
    }

    #[test]
    fn non_positive_pid_is_a_no_op() {
        assert!(signal_interpreter(0, libc::SIGTERM, false).is_ok());
        assert!(signal_interpreter(-4, libc::SIGTERM, false).is_ok());
    }

    #[test]
    fn missing_pid_is_only_ok_when_requested() {
        let missing = unused_pid();
        assert!(signal_interpreter(missing, libc::SIGTERM, true).is_ok());
        let err = signal_interpreter(missing, libc::SIGTERM, false).unwrap_err();
        assert!(err.to_string().contains(&format!("pid {missing}")));
    }
}
