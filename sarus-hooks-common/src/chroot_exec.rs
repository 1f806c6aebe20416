//! `fork`/`chroot`/drop-privileges helper shared by the hooks that need to
//! run a tool inside the container's rootfs as the container's user (the
//! glibc hook's in-container `ldd --version`, the SSH hook's dropbear
//! invocation).

#![allow(unsafe_code)]

use std::io::Read;
use std::os::fd::FromRawFd;
use std::path::Path;

use sarus_core::error::Result;
use sarus_core::process::{self, ExitStatus};

fn chroot_and_drop(rootfs: &Path, uid: u32, gid: u32) -> Result<()> {
    let c_rootfs = std::ffi::CString::new(rootfs.as_os_str().as_encoded_bytes())
        .map_err(|_| sarus_core::error::Error::invariant("rootfs path contains a NUL byte"))?;
    if unsafe { libc::chroot(c_rootfs.as_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    if unsafe { libc::chdir(c"/".as_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    process::drop_privileges_to(uid, gid, &[])
}

/// Runs `program` inside `rootfs` as `(uid, gid)`, inheriting stdio.
pub fn run_in_rootfs(rootfs: &Path, uid: u32, gid: u32, program: &Path, args: &[String]) -> Result<ExitStatus> {
    let rootfs = rootfs.to_path_buf();
    let program = program.to_path_buf();
    unsafe {
        process::fork_exec_wait(
            &program,
            args,
            &[],
            move || chroot_and_drop(&rootfs, uid, gid),
            |_child| {},
        )
    }
}

/// Runs `program` inside `rootfs` as `(uid, gid)`, capturing its stdout.
/// Used for short-output invocations (`ldd --version`) where inheriting the
/// caller's stdout would be wrong.
pub fn run_in_rootfs_capturing(
    rootfs: &Path,
    uid: u32,
    gid: u32,
    program: &Path,
    args: &[String],
) -> Result<(ExitStatus, Vec<u8>)> {
    let mut fds = [0i32; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    let (read_fd, write_fd) = (fds[0], fds[1]);

    let rootfs = rootfs.to_path_buf();
    let program = program.to_path_buf();

    let status = unsafe {
        process::fork_exec_wait(
            &program,
            args,
            &[],
            move || {
                unsafe {
                    libc::close(read_fd);
                    if libc::dup2(write_fd, 1) < 0 {
                        return Err(std::io::Error::last_os_error().into());
                    }
                    libc::close(write_fd);
                }
                chroot_and_drop(&rootfs, uid, gid)
            },
            |_child| {
                unsafe {
                    libc::close(write_fd);
                }
            },
        )?
    };

    let mut buf = Vec::new();
    let mut file = unsafe { std::fs::File::from_raw_fd(read_fd) };
    file.read_to_end(&mut buf)?;
    Ok((status, buf))
}
