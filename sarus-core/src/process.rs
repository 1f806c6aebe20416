//! Process and privilege primitives shared across the bundle assembler and
//! the FS/process primitives layer (spec section 2, section 9).
//!
//! `fork`-`exec`-`wait` with pre-exec (in the child, after `fork` before
//! `exec`) and post-fork (in the parent, given the child's pid) hooks — the
//! target-language translation of the source's RAII pre-exec/post-fork
//! helper (spec section 9).

#![allow(unsafe_code)]

use std::ffi::CString;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use crate::error::{Error, Result};

/// Outcome of waiting on a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Code(i32),
    Signaled(i32),
}

impl ExitStatus {
    pub const fn success(self) -> bool {
        matches!(self, Self::Code(0))
    }

    pub const fn code(self) -> Option<i32> {
        match self {
            Self::Code(c) => Some(c),
            Self::Signaled(_) => None,
        }
    }
}

/// `fork`s, runs `pre_exec` in the child before `execvp`, then `exec`s
/// `program` with `args`. In the parent, runs `post_fork(child_pid)`
/// immediately after `fork` returns (used to install the signal proxy),
/// then waits for the child and returns its exit status.
///
/// # Safety
///
/// `pre_exec` must only perform async-signal-safe operations: it runs in
/// the child between `fork` and `exec`, where the C runtime is in an
/// unspecified state for anything beyond raw syscalls.
pub unsafe fn fork_exec_wait(
    program: &Path,
    args: &[String],
    env: &[(String, String)],
    pre_exec: impl FnOnce() -> Result<()>,
    post_fork: impl FnOnce(i32),
) -> Result<ExitStatus> {
    let pid = unsafe { libc::fork() };
    match pid {
        -1 => Err(std::io::Error::last_os_error().into()),
        0 => {
            if let Err(e) = pre_exec() {
                eprintln!("sarus: pre-exec setup failed: {e}");
                unsafe { libc::_exit(127) };
            }
            match exec(program, args, env) {
                Ok(never) => match never {},
                Err(e) => {
                    eprintln!("sarus: exec of '{}' failed: {e}", program.display());
                    unsafe { libc::_exit(126) };
                }
            }
        }
        child => {
            post_fork(child);
            wait(child)
        }
    }
}

/// Never actually returns on success; the type expresses that at the type
/// level so callers can `match` exhaustively on the error path only.
enum Never {}

fn exec(program: &Path, args: &[String], env: &[(String, String)]) -> Result<Never> {
    let c_program = CString::new(program.as_os_str().as_encoded_bytes())
        .map_err(|_| Error::invariant("program path contains a NUL byte"))?;
    let mut c_args: Vec<CString> = vec![c_program.clone()];
    for a in args {
        c_args.push(CString::new(a.as_str()).map_err(|_| Error::invariant("argument contains a NUL byte"))?);
    }
    let mut argv: Vec<*const libc::c_char> = c_args.iter().map(|c| c.as_ptr()).collect();
    argv.push(std::ptr::null());

    let c_env: Vec<CString> = env
        .iter()
        .map(|(k, v)| CString::new(format!("{k}={v}")).map_err(|_| Error::invariant("environment value contains a NUL byte")))
        .collect::<Result<_>>()?;
    let mut envp: Vec<*const libc::c_char> = c_env.iter().map(|c| c.as_ptr()).collect();
    envp.push(std::ptr::null());

    unsafe {
        libc::execve(c_program.as_ptr(), argv.as_ptr(), envp.as_ptr());
    }
    Err(std::io::Error::last_os_error().into())
}

fn wait(pid: i32) -> Result<ExitStatus> {
    let mut status: libc::c_int = 0;
    loop {
        let ret = unsafe { libc::waitpid(pid, &raw mut status, 0) };
        if ret == -1 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err.into());
        }
        break;
    }
    if libc::WIFEXITED(status) {
        Ok(ExitStatus::Code(libc::WEXITSTATUS(status)))
    } else {
        Ok(ExitStatus::Signaled(libc::WTERMSIG(status)))
    }
}

/// Installs `PR_SET_PDEATHSIG(SIGHUP)` in the calling process (meant to be
/// used inside a `fork_exec_wait` `pre_exec` closure) and then re-checks
/// that the parent is still alive, to close the race where the parent died
/// between `fork` and the `prctl` call.
pub fn die_with_parent_on_hup() -> Result<()> {
    let ppid_before = unsafe { libc::getppid() };
    let ret = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGHUP) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    if unsafe { libc::getppid() } != ppid_before {
        // Parent already exited (reparented to init); die now.
        unsafe { libc::raise(libc::SIGHUP) };
    }
    Ok(())
}

/// Switches the real/effective/saved uid and gid, sets supplementary
/// groups, sets `fsuid`, and sets no-new-privileges. Order matters: gid
/// must change before uid (dropping uid first would remove the privilege
/// needed to change gid).
pub fn drop_privileges_to(uid: u32, gid: u32, supplementary: &[u32]) -> Result<()> {
    let ret = unsafe { libc::setgroups(supplementary.len(), supplementary.as_ptr()) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    if unsafe { libc::setresgid(gid, gid, gid) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    if unsafe { libc::setresuid(uid, uid, uid) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    unsafe {
        libc::setfsuid(uid as libc::uid_t);
    }
    if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

/// Reversible identity switch: saves the current real/effective/saved ids
/// so a later `restore` can put them back. Used around a single
/// unprivileged sub-operation (e.g. `verifyThatImageIsAvailable`) by a SUID
/// binary that needs to regain privilege afterward.
#[derive(Debug, Clone, Copy)]
pub struct SavedIdentity {
    ruid: u32,
    euid: u32,
    suid: u32,
    rgid: u32,
    egid: u32,
    sgid: u32,
}

impl SavedIdentity {
    /// Captures the current ids and switches the effective uid/gid to
    /// `uid`/`gid`, keeping the real/saved ids so privilege can be
    /// regained.
    pub fn switch_to(uid: u32, gid: u32) -> Result<Self> {
        let mut ruid = 0;
        let mut euid = 0;
        let mut suid = 0;
        let mut rgid = 0;
        let mut egid = 0;
        let mut sgid = 0;
        unsafe {
            libc::getresuid(&raw mut ruid, &raw mut euid, &raw mut suid);
            libc::getresgid(&raw mut rgid, &raw mut egid, &raw mut sgid);
        }
        if unsafe { libc::setresgid(rgid, gid, sgid) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        if unsafe { libc::setresuid(ruid, uid, suid) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(Self { ruid, euid, suid, rgid, egid, sgid })
    }

    /// Restores the identity captured by [`switch_to`](Self::switch_to).
    pub fn restore(self) -> Result<()> {
        if unsafe { libc::setresgid(self.rgid, self.egid, self.sgid) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        if unsafe { libc::setresuid(self.ruid, self.euid, self.suid) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }
}

/// Sets the process's CPU affinity mask.
pub fn set_cpu_affinity(cpus: &[usize]) -> Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for &cpu in cpus {
            libc::CPU_SET(cpu, &mut set);
        }
        if libc::sched_setaffinity(0, size_of::<libc::cpu_set_t>(), &raw const set) != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
    }
    Ok(())
}

/// Reads back the process's current CPU affinity mask as a sorted list of
/// CPU indices, for snapshotting into `Config.cpu_affinity`.
pub fn get_cpu_affinity() -> Result<Vec<usize>> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        if libc::sched_getaffinity(0, size_of::<libc::cpu_set_t>(), &raw mut set) != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok((0..libc::CPU_SETSIZE as usize).filter(|&cpu| libc::CPU_ISSET(cpu, &set)).collect())
    }
}

/// Sets the UTS hostname.
pub fn set_hostname(name: &str) -> Result<()> {
    let ret = unsafe { libc::sethostname(name.as_ptr().cast(), name.len()) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

/// Copies `src` to `dst`, then `chown`s `dst` to `(uid, gid)` and restores
/// `src`'s permission bits.
pub fn copy_with_ownership(src: &Path, dst: &Path, uid: u32, gid: u32) -> Result<()> {
    std::fs::copy(src, dst)?;
    let mode = std::fs::metadata(src)?.mode();
    std::fs::set_permissions(dst, std::fs::Permissions::from_mode(mode))?;
    chown(dst, uid, gid)
}

fn chown(path: &Path, uid: u32, gid: u32) -> Result<()> {
    let c_path = CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| Error::invariant("path contains a NUL byte"))?;
    let ret = unsafe { libc::chown(c_path.as_ptr(), uid, gid) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}
