//! PTY read/write loops that turn raw terminal bytes into plain interpreter text.

use crate::session::OutputBuffer;
use crate::{log_debug, log_debug_content};
use anyhow::{anyhow, Result};
use std::io::{self, ErrorKind};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub(super) fn should_retry_read_error(err: &io::Error) -> bool {
    err.kind() == ErrorKind::Interrupted || err.kind() == ErrorKind::WouldBlock
}

/// Start of a trailing CSI sequence whose final byte has not arrived yet.
fn incomplete_escape_start(bytes: &[u8]) -> Option<usize> {
    let esc = bytes.iter().rposition(|b| *b == 0x1b)?;
    match bytes.get(esc + 1) {
        None => Some(esc),
        Some(b'[') => {
            let params = bytes.get(esc + 2..).unwrap_or(&[]);
            let terminated = params.iter().any(|b| (0x40..=0x7e).contains(b));
            (!terminated).then_some(esc)
        }
        Some(_) => None,
    }
}

/// Accumulates PTY bytes and releases complete UTF-8 text with escapes and `\r` removed.
#[derive(Default)]
pub(super) struct TextDecoder {
    pending: Vec<u8>,
}

impl TextDecoder {
    pub(super) fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let complete = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            Err(err) if err.error_len().is_none() => err.valid_up_to(),
            Err(_) => self.pending.len(),
        };
        let complete = incomplete_escape_start(&self.pending[..complete]).unwrap_or(complete);
        let tail = self.pending.split_off(complete);
        let head = std::mem::replace(&mut self.pending, tail);
        let plain = strip_ansi_escapes::strip(&head);
        String::from_utf8_lossy(&plain).replace('\r', "")
    }
}

/// Read from the non-blocking PTY master and append decoded text to `output`.
///
/// Runs until the slave side closes or `stop` is set. The owner must join the
/// thread before closing `master_fd`.
pub(super) fn spawn_reader_thread(
    master_fd: RawFd,
    output: OutputBuffer,
    stop: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut buffer = [0u8; 4096];
        let mut decoder = TextDecoder::default();
        while !stop.load(Ordering::Acquire) {
            // SAFETY: master_fd is a valid PTY fd owned by the session, and buffer is writable.
            let n = unsafe {
                libc::read(
                    master_fd,
                    buffer.as_mut_ptr() as *mut libc::c_void,
                    buffer.len(),
                )
            };
            if n > 0 {
                let text = decoder.push(buffer.get(..n as usize).unwrap_or(&[]));
                if !text.is_empty() {
                    log_debug_content(&format!("PTY output: {text:?}"));
                    output.append(&text);
                }
                continue;
            }
            if n == 0 {
                break;
            }
            let err = io::Error::last_os_error();
            if should_retry_read_error(&err) {
                thread::sleep(Duration::from_millis(10));
                continue;
            }
            // EIO is how Linux reports that the slave side closed.
            if err.raw_os_error() != Some(libc::EIO) {
                log_debug(&format!("PTY read error: {err}"));
            }
            break;
        }
    })
}

fn try_write(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    if data.is_empty() {
        return Ok(0);
    }
    // SAFETY: fd is the PTY master and data is a live slice.
    let written = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
    if written < 0 {
        return Err(io::Error::last_os_error());
    }
    if written == 0 {
        return Err(io::Error::new(ErrorKind::WriteZero, "PTY write returned 0"));
    }
    Ok(written as usize)
}

/// Write the entire buffer to the PTY master, retrying short and would-block writes.
pub(super) fn write_all(fd: RawFd, mut data: &[u8]) -> Result<()> {
    while !data.is_empty() {
        let written = match try_write(fd, data) {
            Ok(written) => written,
            Err(err) if should_retry_read_error(&err) => {
                thread::sleep(Duration::from_millis(1));
                continue;
            }
            Err(err) if err.kind() == ErrorKind::WriteZero => {
                return Err(anyhow!("PTY write returned 0"));
            }
            Err(err) => return Err(anyhow!("PTY write failed: {err}")),
        };
        data = data.get(written..).unwrap_or(&[]);
    }
    Ok(())
}
