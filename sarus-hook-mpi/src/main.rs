//! OCI `createContainer` hook: replaces or augments the container's MPI
//! libraries with host ones when their ABI allows it, so a host-built MPI
//! application can run against the host's network fabric (spec section 4.9).

mod inject;
mod version;

use std::path::{Path, PathBuf};

use tracing_subscriber::EnvFilter;

use sarus_core::error::{Error, Result};
use sarus_core::fs_ops;
use sarus_hooks_common::ldcache;
use sarus_hooks_common::state::ContainerState;

use version::CompatibilityMode;

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

    let mpi_libs = env_list("MPI_LIBS")?;
    if mpi_libs.is_empty() {
        return Err(Error::invalid("MPI_LIBS", "must name at least one host MPI library"));
    }
    let dependency_libs = env_list_optional("MPI_DEPENDENCY_LIBS");
    let bind_mounts = env_list_optional("BIND_MOUNTS");
    let mode = CompatibilityMode::parse(&std::env::var("MPI_COMPATIBILITY_MODE").unwrap_or_default());
    let ldconfig_path = env_path("LDCONFIG_PATH")?;

    let container_libs = ldcache::list_cache(&ldconfig_path, &rootfs)?;

    for host_lib in &mpi_libs {
        inject::inject(&rootfs, host_lib, &container_libs, mode)
            .map_err(|e| e.trace(format!("injecting MPI library '{}'", host_lib.display())))?;
    }

    for host_lib in &dependency_libs {
        inject::inject(&rootfs, host_lib, &container_libs, mode)
            .map_err(|e| e.trace(format!("injecting MPI dependency library '{}'", host_lib.display())))?;
    }

    for mount in &bind_mounts {
        bind_into_rootfs(&rootfs, mount)?;
    }

    if !mpi_libs.is_empty() || !dependency_libs.is_empty() {
        refresh_cache(&ldconfig_path, &rootfs)?;
    }

    Ok(())
}

/// Parses a `host:container` or bare `path` entry from `BIND_MOUNTS` and
/// bind-mounts it directly into the rootfs (no device/mount-band policy
/// applies here; these are operator-configured, not user-configured).
fn bind_into_rootfs(rootfs: &Path, entry: &Path) -> Result<()> {
    let text = entry.to_string_lossy();
    let (source, dest) = match text.split_once(':') {
        Some((s, d)) => (PathBuf::from(s), PathBuf::from(d)),
        None => (entry.to_path_buf(), entry.to_path_buf()),
    };
    let destination = rootfs.join(dest.strip_prefix("/").unwrap_or(&dest));
    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if source.is_dir() {
        std::fs::create_dir_all(&destination)?;
    } else if !destination.exists() {
        std::fs::write(&destination, [])?;
    }
    fs_ops::bind_mount(&source, &destination, libc::MS_RDONLY as i32)
}

fn refresh_cache(ldconfig_path: &Path, rootfs: &Path) -> Result<()> {
    let status = std::process::Command::new(ldconfig_path).arg("-r").arg(rootfs).status()?;
    if !status.success() {
        return Err(Error::external_tool(format!("{} -r {}", ldconfig_path.display(), rootfs.display()), status.code().unwrap_or(-1)));
    }
    Ok(())
}

fn env_path(key: &str) -> Result<PathBuf> {
    std::env::var(key).map(PathBuf::from).map_err(|_| Error::invalid(key, "environment variable not set"))
}

fn env_list(key: &str) -> Result<Vec<PathBuf>> {
    let value = std::env::var(key).map_err(|_| Error::invalid(key, "environment variable not set"))?;
    let libs: Vec<PathBuf> = value.split(':').filter(|s| !s.is_empty()).map(PathBuf::from).collect();
    if libs.is_empty() {
        return Err(Error::invalid(key, "must name at least one library"));
    }
    Ok(libs)
}

fn env_list_optional(key: &str) -> Vec<PathBuf> {
    std::env::var(key).map(|v| v.split(':').filter(|s| !s.is_empty()).map(PathBuf::from).collect()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_mounts_entry_splits_host_and_container_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("host-lib");
        std::fs::write(&source, []).unwrap();
        let entry_text = format!("{}:/opt/container-lib", source.display());
        let entry = PathBuf::from(&entry_text);
        let text = entry.to_string_lossy();
        let (parsed_source, parsed_dest) = text.split_once(':').unwrap();
        assert_eq!(parsed_source, source.to_string_lossy());
        assert_eq!(parsed_dest, "/opt/container-lib");
    }

    #[test]
    fn env_list_optional_is_empty_when_unset() {
        std::env::remove_var("MPI_DEPENDENCY_LIBS_TEST_UNSET");
        assert!(env_list_optional("MPI_DEPENDENCY_LIBS_TEST_UNSET").is_empty());
    }
}
