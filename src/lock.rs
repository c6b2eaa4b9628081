//! Poison-tolerant locking so a panicking reader thread cannot wedge a session buffer.

use std::sync::{Mutex, MutexGuard};

pub(crate) fn lock_or_recover<'a, T>(lock: &'a Mutex<T>, context: &str) -> MutexGuard<'a, T> {
    lock.lock().unwrap_or_else(|poisoned| {
        crate::log_debug(&format!("Mutex poisoned in {context}; recovering"));
        poisoned.into_inner()
    })
}
