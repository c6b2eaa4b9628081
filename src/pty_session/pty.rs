//! Interpreter process lifecycle under a pseudo-terminal.
//!
//! The child gets a fresh session and controlling terminal with echo turned off,
//! so the output stream carries only what the interpreter itself prints.

use crate::log_debug;
use crate::process_signal::signal_interpreter;
use crate::session::{InteractiveProcess, OutputBuffer, ProcessLauncher};
use anyhow::{anyhow, Context, Result};
use std::env;
use std::ffi::CString;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::io::{spawn_reader_thread, write_all};

const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);
const PTY_ROWS: u16 = 24;
const PTY_COLS: u16 = 200;

/// Resolve `name` against `PATH`, falling back to the literal name when nothing matches.
#[must_use]
pub fn resolve_command(name: &str) -> String {
    if name.contains('/') {
        return name.to_string();
    }
    let Some(paths) = env::var_os("PATH") else {
        return name.to_string();
    };
    env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
        .map(|found| found.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string())
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Spawns interpreters under a PTY in a fixed working directory.
#[derive(Debug, Clone)]
pub struct PtyLauncher {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub term_value: String,
}

impl PtyLauncher {
    #[must_use]
    pub fn new(command: &str, args: Vec<String>) -> Self {
        Self {
            command: resolve_command(command),
            args,
            working_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            term_value: "dumb".to_string(),
        }
    }
}

impl ProcessLauncher for PtyLauncher {
    type Process = PtyInterpreter;

    fn launch(&self, output: OutputBuffer) -> Result<PtyInterpreter> {
        log_debug(&format!(
            "launching interpreter {} {:?} in {}",
            self.command,
            self.args,
            self.working_dir.display()
        ));
        PtyInterpreter::spawn(
            &self.command,
            &self.working_dir,
            &self.args,
            &self.term_value,
            output,
        )
    }
}

/// A running interpreter whose PTY output is streamed into an [`OutputBuffer`].
pub struct PtyInterpreter {
    master_fd: RawFd,
    child_pid: i32,
    reader: Option<thread::JoinHandle<()>>,
    stop_reader: Arc<AtomicBool>,
}

impl PtyInterpreter {
    /// Fork the interpreter under a new PTY and start forwarding its output.
    ///
    /// # Errors
    ///
    /// Returns an error if argument conversion, PTY allocation, or fork fails.
    pub fn spawn(
        command: &str,
        working_dir: &Path,
        args: &[String],
        term_value: &str,
        output: OutputBuffer,
    ) -> Result<Self> {
        let cwd = CString::new(working_dir.to_string_lossy().as_bytes()).with_context(|| {
            format!("working directory contains NUL byte: {}", working_dir.display())
        })?;
        let term = CString::new(term_value)
            .or_else(|_| CString::new("dumb"))
            .map_err(|_| anyhow!("TERM fallback contains an interior NUL byte"))?;
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(
            CString::new(command)
                .with_context(|| format!("interpreter command contains NUL byte: {command}"))?,
        );
        for arg in args {
            argv.push(
                CString::new(arg.as_str())
                    .with_context(|| format!("interpreter arg contains NUL byte: {arg}"))?,
            );
        }

        // SAFETY: argv/cwd/term are valid CStrings; the returned master fd is owned by Self.
        let (master_fd, child_pid) = unsafe { spawn_pty_child(&argv, &cwd, &term)? };
        if let Err(err) = set_nonblocking(master_fd) {
            // SAFETY: the child and fd belong to this half-built session.
            unsafe {
                let _ = signal_interpreter(child_pid, libc::SIGKILL, true);
                close_fd(master_fd);
            }
            return Err(err);
        }
        let stop_reader = Arc::new(AtomicBool::new(false));
        let reader = spawn_reader_thread(master_fd, output, Arc::clone(&stop_reader));
        Ok(Self {
            master_fd,
            child_pid,
            reader: Some(reader),
            stop_reader,
        })
    }
}

impl InteractiveProcess for PtyInterpreter {
    fn write_input(&mut self, text: &str) -> Result<()> {
        write_all(self.master_fd, text.as_bytes())
    }

    fn is_alive(&self) -> bool {
        if self.child_pid < 0 {
            return false;
        }
        let mut status = 0;
        // SAFETY: child_pid is owned by this session; WNOHANG only inspects state.
        let ret = unsafe { libc::waitpid(self.child_pid, &mut status, libc::WNOHANG) };
        ret == 0
    }
}

impl Drop for PtyInterpreter {
    fn drop(&mut self) {
        shutdown_interpreter(self.master_fd, self.child_pid);
        // The fd number must not be reused while the reader can still read it.
        self.stop_reader.store(true, Ordering::Release);
        if let Some(reader) = self.reader.take() {
            if let Err(err) = reader.join() {
                log_debug(&format!("PTY reader thread panicked during shutdown: {err:?}"));
            }
        }
        // SAFETY: master_fd is owned by this session and the reader has exited.
        unsafe { close_fd(self.master_fd) };
    }
}

fn shutdown_interpreter(master_fd: RawFd, child_pid: i32) {
    if child_pid <= 0 {
        return;
    }
    // Ctrl-D at an empty prompt ends an SML/NJ session.
    if let Err(err) = write_all(master_fd, b"\x04") {
        log_debug(&format!("failed to send EOF to interpreter: {err:#}"));
    }
    if wait_for_exit(child_pid, SHUTDOWN_GRACE) {
        return;
    }
    if let Err(err) = signal_interpreter(child_pid, libc::SIGTERM, true) {
        log_debug(&format!("SIGTERM to interpreter failed: {err}"));
    }
    if wait_for_exit(child_pid, SHUTDOWN_GRACE) {
        return;
    }
    if let Err(err) = signal_interpreter(child_pid, libc::SIGKILL, true) {
        log_debug(&format!("SIGKILL to interpreter failed: {err}"));
    }
    let mut status = 0;
    // SAFETY: reaping our own child after SIGKILL.
    if unsafe { libc::waitpid(child_pid, &mut status, 0) } < 0 {
        log_debug(&format!(
            "waitpid after SIGKILL failed: {}",
            io::Error::last_os_error()
        ));
    }
}

/// Poll for child exit until `timeout`; true once the child is reaped or gone.
fn wait_for_exit(child_pid: i32, timeout: Duration) -> bool {
    let start = Instant::now();
    let mut status = 0;
    while start.elapsed() < timeout {
        // SAFETY: child_pid is owned by this session; WNOHANG only inspects state.
        let result = unsafe { libc::waitpid(child_pid, &mut status, libc::WNOHANG) };
        if result != 0 {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

/// Allocate a PTY and fork the interpreter onto its slave side.
///
/// # Safety
///
/// `argv` must be non-empty. The caller owns the returned master fd and child pid.
unsafe fn spawn_pty_child(
    argv: &[CString],
    working_dir: &CString,
    term_value: &CString,
) -> Result<(RawFd, i32)> {
    let mut master_fd: RawFd = -1;
    let mut slave_fd: RawFd = -1;
    let mut winsize = libc::winsize {
        ws_row: PTY_ROWS,
        ws_col: PTY_COLS,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };

    if libc::openpty(
        &mut master_fd,
        &mut slave_fd,
        ptr::null_mut(),
        ptr::null_mut(),
        &mut winsize,
    ) != 0
    {
        return Err(errno_error("openpty failed"));
    }
    set_cloexec(master_fd)?;
    set_cloexec(slave_fd)?;

    let pid = libc::fork();
    if pid < 0 {
        close_fd(master_fd);
        close_fd(slave_fd);
        return Err(errno_error("fork failed"));
    }
    if pid == 0 {
        child_exec(master_fd, slave_fd, argv, working_dir, term_value);
    }

    close_fd(slave_fd);
    Ok((master_fd, pid))
}

/// Child-side setup after fork; never returns.
///
/// # Safety
///
/// Must only be called in the forked child.
unsafe fn child_exec(
    master_fd: RawFd,
    slave_fd: RawFd,
    argv: &[CString],
    working_dir: &CString,
    term_value: &CString,
) -> ! {
    let fail = |context: &str| -> ! {
        let err = io::Error::last_os_error();
        let msg = format!("interpreter {context} failed: {err}\n");
        let _ = libc::write(
            libc::STDERR_FILENO,
            msg.as_ptr() as *const libc::c_void,
            msg.len(),
        );
        libc::_exit(127);
    };

    close_fd(master_fd);
    if libc::setsid() == -1 {
        fail("setsid");
    }
    if libc::ioctl(slave_fd, libc::TIOCSCTTY as libc::c_ulong, 0) == -1 {
        fail("ioctl(TIOCSCTTY)");
    }
    disable_echo(slave_fd);
    if libc::dup2(slave_fd, libc::STDIN_FILENO) < 0
        || libc::dup2(slave_fd, libc::STDOUT_FILENO) < 0
        || libc::dup2(slave_fd, libc::STDERR_FILENO) < 0
    {
        fail("dup2");
    }
    if slave_fd > libc::STDERR_FILENO {
        close_fd(slave_fd);
    }
    if libc::chdir(working_dir.as_ptr()) != 0 {
        fail("chdir");
    }
    let term_key = b"TERM\0";
    if libc::setenv(
        term_key.as_ptr() as *const libc::c_char,
        term_value.as_ptr(),
        1,
    ) != 0
    {
        fail("setenv(TERM)");
    }

    let mut argv_ptrs: Vec<*const libc::c_char> = argv.iter().map(|s| s.as_ptr()).collect();
    argv_ptrs.push(ptr::null());
    libc::execvp(argv_ptrs[0], argv_ptrs.as_ptr());
    fail("execvp");
}

/// Turn off terminal echo so submitted code is not mirrored into the reply.
unsafe fn disable_echo(fd: RawFd) {
    let mut termios: libc::termios = std::mem::zeroed();
    if libc::tcgetattr(fd, &mut termios) != 0 {
        return;
    }
    termios.c_lflag &= !(libc::ECHO | libc::ECHONL);
    let _ = libc::tcsetattr(fd, libc::TCSANOW, &termios);
}

/// OR `flag` into a descriptor's flag word read with `get` and written with `set`.
fn add_fd_flag(
    fd: RawFd,
    get: libc::c_int,
    set: libc::c_int,
    flag: libc::c_int,
    name: &str,
) -> Result<()> {
    // SAFETY: fcntl only reads and updates flag words on a descriptor the caller owns.
    let current = unsafe { libc::fcntl(fd, get) };
    if current < 0 {
        return Err(errno_error(&format!("reading flags before setting {name}")));
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, set, current | flag) } < 0 {
        return Err(errno_error(&format!("setting {name}")));
    }
    Ok(())
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    add_fd_flag(fd, libc::F_GETFL, libc::F_SETFL, libc::O_NONBLOCK, "O_NONBLOCK")
}

fn set_cloexec(fd: RawFd) -> Result<()> {
    add_fd_flag(fd, libc::F_GETFD, libc::F_SETFD, libc::FD_CLOEXEC, "FD_CLOEXEC")
}

fn errno_error(context: &str) -> anyhow::Error {
    anyhow!("{context}: {}", io::Error::last_os_error())
}

/// Close a file descriptor while ignoring errors.
///
/// # Safety
///
/// `fd` must be an open descriptor owned by the caller, or negative.
unsafe fn close_fd(fd: RawFd) {
    if fd >= 0 {
        let _ = libc::close(fd);
    }
}
