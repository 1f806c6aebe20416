//! FS/process primitives: bind/overlay/tmpfs/loop mounts (spec section 2).

use std::ffi::CString;
use std::path::Path;

use crate::error::{Error, Result};

fn cstr(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| Error::invariant(format!("path '{}' contains a NUL byte", path.display())))
}

fn do_mount(
    source: Option<&Path>,
    target: &Path,
    fstype: Option<&str>,
    flags: libc::c_ulong,
    data: Option<&str>,
) -> Result<()> {
    let c_source = source.map(cstr).transpose()?;
    let c_target = cstr(target)?;
    let c_fstype = fstype
        .map(|s| CString::new(s).map_err(|_| Error::invalid("fstype", "contains interior NUL")))
        .transpose()?;
    let c_data = data
        .map(|s| CString::new(s).map_err(|_| Error::invalid("mount data", "contains interior NUL")))
        .transpose()?;

    let ret = unsafe {
        libc::mount(
            c_source.as_ref().map_or(std::ptr::null(), |c| c.as_ptr()),
            c_target.as_ptr(),
            c_fstype.as_ref().map_or(std::ptr::null(), |c| c.as_ptr()),
            flags,
            c_data.as_ref().map_or(std::ptr::null(), |c| c.as_ptr().cast()),
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

/// `mount(2)` a bind mount of `source` at `target` with the given flags
/// (already composed by [`crate::mount::MountFlags`]).
pub fn bind_mount(source: &Path, target: &Path, flags: i32) -> Result<()> {
    do_mount(Some(source), target, None, libc::MS_BIND as libc::c_ulong, None)?;
    let propagation = flags as libc::c_ulong & !(libc::MS_BIND as libc::c_ulong);
    if propagation != 0 {
        remount(target, propagation)?;
    }
    Ok(())
}

/// Re-mounts `target` with additional `flags` (e.g. to apply `MS_RDONLY`
/// after a bind mount, which the kernel ignores on the initial bind).
pub fn remount(target: &Path, flags: libc::c_ulong) -> Result<()> {
    do_mount(None, target, None, libc::MS_REMOUNT | flags, None)
}

/// Mounts a tmpfs (or ramfs) at `target`.
pub fn mount_tmpfs(target: &Path, fstype: &str, flags: libc::c_ulong, options: Option<&str>) -> Result<()> {
    do_mount(None, target, Some(fstype), flags, options)
}

/// Loop-mounts `image` (a squashfs file) read-only at `target`.
pub fn loop_mount_squashfs(image: &Path, target: &Path) -> Result<()> {
    do_mount(Some(image), target, Some("squashfs"), (libc::MS_RDONLY) as libc::c_ulong, None)
}

/// Mounts an overlayfs at `target` composed from `lower` (read-only),
/// `upper`, and `work`.
pub fn mount_overlay(lower: &Path, upper: &Path, work: &Path, target: &Path) -> Result<()> {
    let options = format!(
        "lowerdir={},upperdir={},workdir={}",
        lower.display(),
        upper.display(),
        work.display()
    );
    do_mount(None, target, Some("overlay"), 0, Some(&options))
}

/// Recursively makes the mount at `target` private (`MS_PRIVATE | MS_REC`),
/// or slave (`MS_SLAVE | MS_REC`) when `slave` is set — used after
/// `unshare(CLONE_NEWNS)` so later mounts don't propagate to the host, and
/// after mounting the bundle tmpfs for the same reason.
pub fn remount_propagation(target: &Path, slave: bool) -> Result<()> {
    let mode = if slave { libc::MS_SLAVE } else { libc::MS_PRIVATE };
    do_mount(None, target, None, (mode | libc::MS_REC) as libc::c_ulong, None)
}

/// Unmounts `target`, lazily if `lazy` is set (`MNT_DETACH`).
pub fn unmount(target: &Path, lazy: bool) -> Result<()> {
    let c_target = cstr(target)?;
    let flags = if lazy { libc::MNT_DETACH } else { 0 };
    let ret = unsafe { libc::umount2(c_target.as_ptr(), flags) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

/// `unshare(CLONE_NEWNS)` — enters a new mount namespace.
pub fn unshare_mount_namespace() -> Result<()> {
    if unsafe { libc::unshare(libc::CLONE_NEWNS) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

/// Copies a regular file from `src` to `dst`, creating parent directories
/// as needed and preserving `src`'s mode bits.
pub fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(src, dst)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_file_creates_parent_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src.txt");
        std::fs::write(&src, b"hello").unwrap();
        let dst = tmp.path().join("nested/dir/dst.txt");
        copy_file(&src, &dst).unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"hello");
    }
}
