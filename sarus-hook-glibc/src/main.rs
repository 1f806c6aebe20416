//! OCI `createContainer` hook: replaces the container's glibc with the
//! host's when the host's ABI is newer, so host MPI/network libraries that
//! get bind-mounted in by other hooks can actually be loaded (spec section
//! 4.8).

use std::path::{Path, PathBuf};

use regex::Regex;
use tracing_subscriber::EnvFilter;

use sarus_core::error::{Error, Result};
use sarus_hooks_common::chroot_exec::run_in_rootfs_capturing;
use sarus_hooks_common::ldcache::{self, CacheEntry};
use sarus_hooks_common::state::ContainerState;

fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();
    match run() {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            std::process::ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let state = ContainerState::from_stdin()?;
    sarus_hooks_common::timestamp::record_from_env()?;
    let rootfs = state.bundle.join("rootfs");

    if !rootfs.join("etc/ld.so.cache").exists() {
        tracing::info!("container has no ld.so.cache, assuming no glibc; skipping");
        return Ok(());
    }

    let ldconfig_path = env_path("LDCONFIG_PATH")?;
    let ldd_path = env_path("LDD_PATH")?;
    let readelf_path = env_path("READELF_PATH")?;
    let glibc_libs = env_list("GLIBC_LIBS")?;

    let entries = ldcache::list_cache(&ldconfig_path, &rootfs)?;
    let elf64: Vec<CacheEntry> = entries.into_iter().filter(|e| is_elf64(&readelf_path, &rootfs.join(strip_root(&e.path)))).collect();

    let Some(container_libc) = ldcache::find_libc(&elf64) else {
        tracing::info!("no container libc found (32-bit only?); skipping");
        return Ok(());
    };

    let host_libc = glibc_libs
        .iter()
        .find(|p| p.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.starts_with("libc.") || n.starts_with("libc-")))
        .ok_or_else(|| Error::invalid("GLIBC_LIBS", "no host libc found among GLIBC_LIBS"))?;

    let (uid, gid) = container_user(&state)?;

    let host_version = ldd_version(&ldd_path, None, 0, 0)?;
    let container_version = ldd_version(&ldd_path, Some(&rootfs), uid, gid)?;

    if container_version >= host_version {
        tracing::info!(?container_version, ?host_version, "container glibc is already new enough; skipping");
        return Ok(());
    }

    let host_soname = soname(&readelf_path, host_libc)?;
    let container_soname = soname(&readelf_path, &container_libc.path)?;
    if host_soname != container_soname {
        return Err(Error::policy(format!(
            "host libc SONAME '{host_soname}' does not match container libc SONAME '{container_soname}'"
        )));
    }

    for host_lib in &glibc_libs {
        let basename = host_lib
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::invalid("GLIBC_LIBS", "library path has no filename"))?;
        let target = elf64.iter().find(|e| e.path.file_name().and_then(|n| n.to_str()) == Some(basename));
        let destination = match target {
            Some(entry) => rootfs.join(strip_root(&entry.path)),
            None => rootfs.join("lib64").join(basename),
        };
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if !destination.exists() {
            std::fs::write(&destination, [])?;
        }
        sarus_core::fs_ops::bind_mount(host_lib, &destination, libc::MS_RDONLY as i32)?;
    }

    Ok(())
}

fn env_path(key: &str) -> Result<PathBuf> {
    std::env::var(key).map(PathBuf::from).map_err(|_| Error::invalid(key, "environment variable not set"))
}

fn env_list(key: &str) -> Result<Vec<PathBuf>> {
    let value = std::env::var(key).map_err(|_| Error::invalid(key, "environment variable not set"))?;
    Ok(value.split(':').filter(|s| !s.is_empty()).map(PathBuf::from).collect())
}

fn strip_root(path: &Path) -> &Path {
    path.strip_prefix("/").unwrap_or(path)
}

fn container_user(state: &ContainerState) -> Result<(u32, u32)> {
    let data = std::fs::read_to_string(state.config_path())?;
    let doc: serde_json::Value =
        serde_json::from_str(&data).map_err(|e| Error::invalid(state.config_path().display().to_string(), e.to_string()))?;
    let uid = doc.pointer("/process/user/uid").and_then(serde_json::Value::as_u64).unwrap_or(0) as u32;
    let gid = doc.pointer("/process/user/gid").and_then(serde_json::Value::as_u64).unwrap_or(0) as u32;
    Ok((uid, gid))
}

fn is_elf64(readelf_path: &Path, path: &Path) -> bool {
    let Ok(output) = std::process::Command::new(readelf_path).arg("-h").arg(path).output() else { return false };
    String::from_utf8_lossy(&output.stdout).lines().any(|l| l.contains("Class:") && l.contains("ELF64"))
}

fn soname(readelf_path: &Path, path: &Path) -> Result<String> {
    let output = std::process::Command::new(readelf_path).arg("-d").arg(path).output()?;
    let text = String::from_utf8_lossy(&output.stdout);
    for line in text.lines() {
        if line.contains("SONAME") {
            if let (Some(start), Some(end)) = (line.find('['), line.find(']')) {
                return Ok(line[start + 1..end].to_string());
            }
        }
    }
    Err(Error::invariant(format!("no SONAME found in '{}'", path.display())))
}

/// A parsed `MAJOR.MINOR` glibc version, ordered the natural way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct GlibcVersion {
    major: u32,
    minor: u32,
}

/// Runs `ldd --version`, either on the host (`rootfs = None`) or inside the
/// container's rootfs as `(uid, gid)`, and parses `ldd (...) MAJOR.MINOR`
/// from the first line.
fn ldd_version(ldd_path: &Path, rootfs: Option<&Path>, uid: u32, gid: u32) -> Result<GlibcVersion> {
    let stdout = match rootfs {
        None => {
            let output = std::process::Command::new(ldd_path).arg("--version").output()?;
            String::from_utf8_lossy(&output.stdout).into_owned()
        }
        Some(rootfs) => {
            let args = vec!["--version".to_string()];
            let (_, bytes) = run_in_rootfs_capturing(rootfs, uid, gid, ldd_path, &args)?;
            String::from_utf8_lossy(&bytes).into_owned()
        }
    };
    parse_ldd_version(&stdout)
}

fn parse_ldd_version(stdout: &str) -> Result<GlibcVersion> {
    let first_line = stdout.lines().next().ok_or_else(|| Error::invariant("empty `ldd --version` output"))?;
    let re = Regex::new(r"(\d+)\.(\d+)\s*$").map_err(|e| Error::invariant(e.to_string()))?;
    let caps = re
        .captures(first_line)
        .ok_or_else(|| Error::invariant(format!("could not parse glibc version from '{first_line}'")))?;
    Ok(GlibcVersion {
        major: caps[1].parse().unwrap_or(0),
        minor: caps[2].parse().unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ldd_version_line() {
        let stdout = "ldd (Ubuntu GLIBC 2.35-0ubuntu3.4) 2.35\nCopyright (C) 2022 Free Software Foundation, Inc.\n";
        let version = parse_ldd_version(stdout).unwrap();
        assert_eq!(version, GlibcVersion { major: 2, minor: 35 });
    }

    #[test]
    fn version_ordering_compares_major_then_minor() {
        assert!(GlibcVersion { major: 2, minor: 31 } < GlibcVersion { major: 2, minor: 35 });
        assert!(GlibcVersion { major: 2, minor: 35 } >= GlibcVersion { major: 2, minor: 31 });
    }
}
