//! POSIX advisory locking for `metadata.json`, with timed polling.
//!
//! `flock(2)` doesn't support a timeout directly, so we poll with
//! `LOCK_NB` on a sleep loop, exactly as the spec (section 4.1, section 9)
//! calls for: a `warningMs` after which one "holding too long" message is
//! logged, and a `timeoutMs` after which acquisition fails.

use std::fs::File;
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};

/// How often the non-blocking `flock` attempt is retried while waiting.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Lock mode requested on a repository metadata file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// `LOCK_SH` — multiple readers may hold this concurrently.
    Shared,
    /// `LOCK_EX` — exclusive; only one holder at a time.
    Exclusive,
}

impl Mode {
    const fn flag(self) -> libc::c_int {
        match self {
            Self::Shared => libc::LOCK_SH,
            Self::Exclusive => libc::LOCK_EX,
        }
    }
}

/// A held advisory lock. Released (`flock(LOCK_UN)`) on drop.
#[derive(Debug)]
pub struct Guard<'a> {
    file: &'a File,
}

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

/// Timing configuration for lock acquisition, mirroring the administrator
/// config's `repositoryMetadataLockTimings`.
#[derive(Debug, Clone, Copy)]
pub struct Timings {
    /// Elapsed time after which a "holding too long" warning is logged once.
    pub warning_ms: u64,
    /// Elapsed time after which acquisition fails.
    pub timeout_ms: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self { warning_ms: 1_000, timeout_ms: 10_000 }
    }
}

/// Acquires `mode` on `file`, polling until success, `timings.timeout_ms`
/// elapses, or a non-`EWOULDBLOCK` error occurs.
pub fn acquire(file: &File, mode: Mode, timings: Timings) -> crate::Result<Guard<'_>> {
    let start = Instant::now();
    let mut warned = false;

    loop {
        let ret = unsafe { libc::flock(file.as_raw_fd(), mode.flag() | libc::LOCK_NB) };
        if ret == 0 {
            return Ok(Guard { file });
        }

        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EWOULDBLOCK) {
            return Err(err.into());
        }

        let elapsed = start.elapsed();
        if elapsed >= Duration::from_millis(timings.timeout_ms) {
            return Err(crate::Error::LockTimeout(timings.timeout_ms));
        }
        if !warned && elapsed >= Duration::from_millis(timings.warning_ms) {
            tracing::warn!(
                mode = ?mode,
                elapsed_ms = elapsed.as_millis() as u64,
                "holding too long waiting for repository metadata lock"
            );
            warned = true;
        }

        std::thread::sleep(POLL_INTERVAL);
    }
}
