//! Signal proxy installed by step 14 of the bundle assembler: forwards every
//! catchable signal except `SIGCHLD` and `SIGPIPE` to the `runc` child. If
//! the forward fails with `ESRCH` (the child is already gone), the handler
//! restores the signal's default disposition and re-raises it against
//! itself, so Sarus dies the same way it would have without the proxy.

#![allow(unsafe_code)]

use std::sync::atomic::{AtomicI32, Ordering};

use crate::error::Result;

static PROXY_TARGET: AtomicI32 = AtomicI32::new(0);

/// Signals not forwarded: `SIGCHLD` (Sarus needs its own delivery to reap
/// the child) and `SIGPIPE` (a broken stdout/stderr pipe on Sarus's side is
/// not the container's problem). `SIGKILL`/`SIGSTOP` are uncatchable and
/// excluded for that reason.
const EXCLUDED: [i32; 4] = [libc::SIGCHLD, libc::SIGPIPE, libc::SIGKILL, libc::SIGSTOP];

/// Installs the proxy for `child_pid`, meant to be called as the
/// `fork_exec_wait` `post_fork` hook.
pub fn install_signal_proxy(child_pid: i32) {
    PROXY_TARGET.store(child_pid, Ordering::SeqCst);
    for signum in 1..=31 {
        if EXCLUDED.contains(&signum) {
            continue;
        }
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = proxy_handler as usize;
            action.sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&raw mut action.sa_mask);
            libc::sigaction(signum, &raw const action, std::ptr::null_mut());
        }
    }
}

extern "C" fn proxy_handler(signum: libc::c_int) {
    let target = PROXY_TARGET.load(Ordering::SeqCst);
    if target == 0 {
        return;
    }
    let ret = unsafe { libc::kill(target, signum) };
    if ret != 0 {
        let errno = unsafe { *libc::__errno_location() };
        if errno == libc::ESRCH {
            restore_default_and_reraise(signum);
        }
    }
}

fn restore_default_and_reraise(signum: libc::c_int) {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&raw mut action.sa_mask);
        libc::sigaction(signum, &raw const action, std::ptr::null_mut());
        libc::raise(signum);
    }
}

/// Tears down the proxy once the child has been reaped, so a stray later
/// signal doesn't try to forward to a recycled pid.
pub fn teardown() -> Result<()> {
    PROXY_TARGET.store(0, Ordering::SeqCst);
    Ok(())
}
