//! Per-family host-library injection algorithm (spec section 4.9).

use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use sarus_core::error::{Error, Result};
use sarus_hooks_common::ldcache::CacheEntry;

use crate::version::{classify, family_name, is_newer, parse_version, Compat, CompatibilityMode, LibVersion};

const COMMON_LD_PATHS: [&str; 4] = ["/lib", "/lib64", "/usr/lib", "/usr/lib64"];

/// Injects `host_lib` into the container rootfs, consulting `container_libs`
/// (the container's already-enumerated dynamic-linker cache entries) for
/// same-family siblings. `must_inject` is the MPI_LIBS rule that a missing
/// family is always an error-free injection (true for MPI_LIBS, false for
/// MPI_DEPENDENCY_LIBS, where a missing family is only injected if needed —
/// which, since nothing in the container references it yet, also reduces to
/// "inject fresh").
pub fn inject(rootfs: &Path, host_lib: &Path, container_libs: &[CacheEntry], mode: CompatibilityMode) -> Result<()> {
    let basename = host_lib
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::invalid("MPI_LIBS", "library path has no filename"))?;
    let family = family_name(basename).ok_or_else(|| Error::invalid(basename, "not a shared library name"))?;

    let siblings: Vec<&CacheEntry> = container_libs
        .iter()
        .filter(|e| e.path.file_name().and_then(|n| n.to_str()).is_some_and(|n| family_name(n) == Some(family)))
        .collect();

    if siblings.is_empty() {
        inject_new_file(rootfs, host_lib, basename, family)?;
        return Ok(());
    }

    let Some(host_version) = parse_version(basename, family) else {
        // Host lib itself carries no comparable version; fall back to exact
        // filename match only.
        if let Some(exact) = siblings.iter().find(|e| e.path.file_name().and_then(|n| n.to_str()) == Some(basename)) {
            bind_over(rootfs, host_lib, &exact.path)?;
        } else {
            inject_new_file(rootfs, host_lib, basename, family)?;
        }
        return Ok(());
    };

    let mut equal = Vec::new();
    let mut compatible = Vec::new();
    let mut incompatible = Vec::new();

    for sibling in &siblings {
        let Some(basename) = sibling.path.file_name().and_then(|n| n.to_str()) else { continue };
        let Some(version) = parse_version(basename, family) else { continue };
        match classify(&host_version, &version, mode) {
            Compat::Equal => equal.push((*sibling, version)),
            Compat::Compatible => compatible.push((*sibling, version)),
            Compat::Incompatible => incompatible.push((*sibling, version)),
        }
    }

    let retarget_symlink_chain = incompatible.is_empty();

    if let Some((target, _)) = equal.first() {
        bind_over(rootfs, host_lib, &target.path)?;
    } else if let Some((target, _)) = compatible.iter().max_by(|a, b| a.1.components.cmp(&b.1.components)) {
        bind_over(rootfs, host_lib, &target.path)?;
    } else if !incompatible.is_empty() {
        let all_newer = incompatible.iter().all(|(_, v)| is_newer(&host_version, v));
        if all_newer {
            tracing::warn!(family, "container only has newer-than-host siblings; injecting host lib alongside them");
            inject_new_file(rootfs, host_lib, basename, family)?;
        } else {
            return Err(Error::policy(format!(
                "host library '{basename}' is ABI-incompatible with one or more container siblings of family '{family}'"
            )));
        }
    }

    if retarget_symlink_chain {
        rewrite_symlink_chain(rootfs, host_lib, basename, family, &host_version)?;
    }

    Ok(())
}

fn bind_over(rootfs: &Path, host_lib: &Path, container_relative: &Path) -> Result<()> {
    let destination = rootfs.join(container_relative.strip_prefix("/").unwrap_or(container_relative));
    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent)?;
    }
    sarus_core::fs_ops::bind_mount(host_lib, &destination, libc::MS_RDONLY as i32)
}

fn inject_new_file(rootfs: &Path, host_lib: &Path, basename: &str, family: &str) -> Result<()> {
    let destination = rootfs.join("lib64").join(basename);
    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&destination, [])?;
    sarus_core::fs_ops::bind_mount(host_lib, &destination, libc::MS_RDONLY as i32)?;

    if let Some(version) = parse_version(basename, family) {
        build_minimal_chain(&destination, family, &version)?;
    }
    Ok(())
}

/// Creates `libX.so -> libX.so.A -> libX.so.A.B -> ... -> destination`
/// inside `destination`'s directory.
fn build_minimal_chain(destination: &Path, family: &str, version: &LibVersion) -> Result<()> {
    let dir = destination.parent().ok_or_else(|| Error::invariant("injected library has no parent directory"))?;
    let mut prev_name = destination.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string();
    for take in (0..version.components.len()).rev() {
        let link_name = if take == 0 {
            format!("{family}.so")
        } else {
            let suffix = version.components[..take].iter().map(u64::to_string).collect::<Vec<_>>().join(".");
            format!("{family}.so.{suffix}")
        };
        if link_name == prev_name {
            continue;
        }
        let link_path = dir.join(&link_name);
        let _ = std::fs::remove_file(&link_path);
        symlink(&prev_name, &link_path)?;
        prev_name = link_name;
    }
    Ok(())
}

/// Re-points the full symlink chain at `destination`, or leaves the
/// existing rootlink alone if one is present under a common ld path and the
/// chain isn't being retargeted (caller only invokes this when retargeting
/// is warranted).
fn rewrite_symlink_chain(rootfs: &Path, _host_lib: &Path, basename: &str, family: &str, version: &LibVersion) -> Result<()> {
    let destination = find_destination(rootfs, basename).unwrap_or_else(|| rootfs.join("lib64").join(basename));
    build_minimal_chain(&destination, family, version)?;

    for common in COMMON_LD_PATHS {
        let rootlink = rootfs.join(common.trim_start_matches('/')).join(format!("{family}.so"));
        if rootlink.parent().is_some_and(Path::exists) {
            let _ = std::fs::remove_file(&rootlink);
            let target_name = destination.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            let _ = symlink(target_name, &rootlink);
        }
    }
    Ok(())
}

fn find_destination(rootfs: &Path, basename: &str) -> Option<PathBuf> {
    for common in COMMON_LD_PATHS {
        let candidate = rootfs.join(common.trim_start_matches('/')).join(basename);
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_destination_checks_common_ld_paths() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("lib64")).unwrap();
        std::fs::write(tmp.path().join("lib64/libmpi.so.12"), []).unwrap();
        assert_eq!(find_destination(tmp.path(), "libmpi.so.12"), Some(tmp.path().join("lib64/libmpi.so.12")));
        assert_eq!(find_destination(tmp.path(), "libmissing.so.1"), None);
    }

    #[test]
    fn build_minimal_chain_creates_full_link_sequence() {
        let tmp = tempfile::tempdir().unwrap();
        let destination = tmp.path().join("libmpi.so.12.0.3");
        std::fs::write(&destination, []).unwrap();
        let version = LibVersion { components: vec![12, 0, 3] };
        build_minimal_chain(&destination, "libmpi", &version).unwrap();
        assert!(tmp.path().join("libmpi.so").is_symlink());
        assert!(tmp.path().join("libmpi.so.12").is_symlink());
        assert!(tmp.path().join("libmpi.so.12.0").is_symlink());
    }
}
