//! "Path is untamperable" checks (spec section 4.4).

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

const GROUP_OR_WORLD_WRITABLE: u32 = 0o022;

/// Recursively verifies that `path` and every ancestor up to `/` are owned
/// by uid 0 and not group- or world-writable; if `path` is a directory, the
/// same property must hold on its entire subtree.
///
/// Called on the `mksquashfs` and `runc` binaries, and on every configured
/// OCI hook binary, before any of them is invoked — so that a subverted
/// helper can't be smuggled in via a writable hooks directory.
pub fn check_that_path_is_untamperable(path: &Path) -> Result<()> {
    check_ancestors(path)?;
    check_subtree(path)
}

fn check_ancestors(path: &Path) -> Result<()> {
    check_one(path)?;
    let mut current = path.to_path_buf();
    while let Some(parent) = current.parent() {
        if parent.as_os_str().is_empty() {
            break;
        }
        check_one(parent)?;
        if parent == Path::new("/") {
            break;
        }
        current = parent.to_path_buf();
    }
    Ok(())
}

fn check_subtree(path: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if !meta.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let child = entry.path();
        check_one(&child)?;
        if entry.file_type()?.is_dir() {
            check_subtree(&child)?;
        }
    }
    Ok(())
}

fn check_one(path: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(path)?;
    let uid = meta.uid();
    let gid = meta.gid();
    let mode = meta.mode();

    if uid != 0 {
        return Err(tampered(path, uid, gid, mode));
    }
    if mode & GROUP_OR_WORLD_WRITABLE != 0 {
        return Err(tampered(path, uid, gid, mode));
    }
    Ok(())
}

fn tampered(path: &Path, uid: u32, gid: u32, perms: u32) -> Error {
    Error::policy(format!(
        "path '{}' is tampered: uid={uid} gid={gid} perms={perms:o} (must be uid 0, not group/world-writable)",
        path.display()
    ))
}

/// Resolves `destination` (relative to `rootfs`, with leading `/` stripped)
/// to its realpath, confining the result to stay within `rootfs` even if
/// intermediate components are symlinks pointing outside it.
///
/// Used before performing a custom or device bind mount so that a symlink
/// inside the image can't be used to escape the container's rootfs.
pub fn confine_to_rootfs(rootfs: &Path, destination: &Path) -> Result<PathBuf> {
    let relative = destination.strip_prefix("/").unwrap_or(destination);
    let mut resolved = rootfs.to_path_buf();

    for component in relative.components() {
        use std::path::Component;
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                if let Ok(target) = fs::read_link(&resolved) {
                    resolved.pop();
                    let target = if target.is_absolute() {
                        rootfs.join(target.strip_prefix("/").unwrap_or(&target))
                    } else {
                        resolved.join(target)
                    };
                    resolved = target;
                }
            }
            Component::ParentDir => {
                resolved.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
        if !resolved.starts_with(rootfs) {
            return Err(Error::policy(format!(
                "destination '{}' resolves outside the rootfs",
                destination.display()
            )));
        }
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn world_writable_file_is_rejected() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o666)).unwrap();
        // Ownership in the sandbox is the test runner's uid, not 0, so this
        // always fails the uid check too -- either way it must be Err.
        assert!(check_that_path_is_untamperable(tmp.path()).is_err());
    }

    #[test]
    fn confine_rejects_escaping_symlink() {
        let tmp = tempfile::tempdir().unwrap();
        let rootfs = tmp.path();
        std::os::unix::fs::symlink("/etc", rootfs.join("escape")).unwrap();
        let err = confine_to_rootfs(rootfs, Path::new("/escape/passwd")).unwrap_err();
        assert!(matches!(err.kind, crate::error::Kind::PolicyViolation(_)));
    }

    #[test]
    fn confine_keeps_plain_path_inside_rootfs() {
        let tmp = tempfile::tempdir().unwrap();
        let rootfs = tmp.path();
        fs::create_dir_all(rootfs.join("a/b")).unwrap();
        let resolved = confine_to_rootfs(rootfs, Path::new("/a/b")).unwrap();
        assert_eq!(resolved, rootfs.join("a/b"));
    }
}
