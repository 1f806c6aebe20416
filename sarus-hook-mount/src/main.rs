//! OCI `createContainer` hook: injects bind and device mounts declared on
//! its own CLI, then whitelists each device in the container's devices
//! cgroup (spec section 4.7).

use std::path::Path;

use clap::Parser;
use regex::Regex;
use tracing_subscriber::EnvFilter;

use sarus_core::device::parse_device;
use sarus_core::error::{Error, Result};
use sarus_core::mount::{parse_mount, Band, DestinationPolicy};
use sarus_hooks_common::state::ContainerState;
use sarus_hooks_common::{amdgpu, cgroup::DevicesCgroup, ldcache, timestamp};

#[derive(Parser, Debug)]
#[command(name = "sarus-hook-mount")]
struct Cli {
    /// `type=bind,src=..,dst=..[,readonly]`-style mount maps.
    #[arg(long = "mount")]
    mounts: Vec<String>,

    /// `source[:destination[:access]]` device specs.
    #[arg(long = "device")]
    devices: Vec<String>,

    /// Comma-separated render-node indices to expose via `/dev/kfd` +
    /// `/dev/dri/renderD<N>` (empty means "all visible").
    #[arg(long = "amdgpu-visible-devices")]
    amdgpu_visible_devices: Option<String>,
}

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
    let cli = Cli::parse();
    let state = ContainerState::from_stdin()?;
    timestamp::record_from_env()?;

    join_mount_namespace(state.pid)?;

    let container_env = read_container_environment(&state)?;
    let fi_provider_path = resolve_fi_provider_path(&state, &container_env)?;

    for raw in &cli.mounts {
        let substituted = raw.replace("<FI_PROVIDER_PATH>", &fi_provider_path);
        let pairs = parse_map(&substituted);
        let mount = parse_mount(&pairs, Band::Site, &DestinationPolicy::default())?;
        if let Some(parent) = mount.destination.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if !mount.destination.exists() {
            if mount.source.is_dir() {
                std::fs::create_dir_all(&mount.destination)?;
            } else {
                std::fs::write(&mount.destination, [])?;
            }
        }
        sarus_core::fs_ops::bind_mount(&mount.source, &mount.destination, mount.flags)?;
    }

    if !cli.devices.is_empty() {
        let cgroup = DevicesCgroup::discover(state.pid)?;
        for spec in &cli.devices {
            let device = parse_device(spec)?;
            if let Some(parent) = device.mount.destination.parent() {
                std::fs::create_dir_all(parent)?;
            }
            if !device.mount.destination.exists() {
                std::fs::write(&device.mount.destination, [])?;
            }
            sarus_core::fs_ops::bind_mount(&device.mount.source, &device.mount.destination, device.mount.flags)?;
            cgroup.allow(device.device_type.letter(), device.major, device.minor, &device.access.string())?;
        }
    }

    if let Some(visible) = &cli.amdgpu_visible_devices {
        let indices: Vec<u32> = visible.split(',').filter(|s| !s.is_empty()).filter_map(|s| s.parse().ok()).collect();
        let cgroup = DevicesCgroup::discover(state.pid)?;
        if let Some(devices) = amdgpu::discover(Path::new("/dev/kfd"), Path::new("/dev/dri"), &indices) {
            for source in std::iter::once(devices.kfd.clone()).chain(devices.render_nodes) {
                let device = parse_device(&source.to_string_lossy())?;
                if let Some(parent) = device.mount.destination.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                if !device.mount.destination.exists() {
                    std::fs::write(&device.mount.destination, [])?;
                }
                sarus_core::fs_ops::bind_mount(&device.mount.source, &device.mount.destination, device.mount.flags)?;
                cgroup.allow(device.device_type.letter(), device.major, device.minor, &device.access.string())?;
            }
        }
    }

    if let Ok(ldconfig_path) = std::env::var("LDCONFIG_PATH") {
        let status = std::process::Command::new(&ldconfig_path)
            .arg("-r")
            .arg(&state.bundle.join("rootfs"))
            .status()?;
        if !status.success() {
            return Err(Error::external_tool(ldconfig_path, status.code().unwrap_or(-1)));
        }
    }

    Ok(())
}

fn join_mount_namespace(pid: i32) -> Result<()> {
    let ns_path = format!("/proc/{pid}/ns/mnt");
    let file = std::fs::File::open(&ns_path)?;
    use std::os::fd::AsRawFd;
    let ret = unsafe { libc::setns(file.as_raw_fd(), libc::CLONE_NEWNS) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

fn read_container_environment(state: &ContainerState) -> Result<Vec<(String, String)>> {
    let data = std::fs::read_to_string(state.config_path())?;
    let doc: serde_json::Value =
        serde_json::from_str(&data).map_err(|e| Error::invalid(state.config_path().display().to_string(), e.to_string()))?;
    let env = doc
        .pointer("/process/env")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .filter_map(|s| s.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())))
                .collect()
        })
        .unwrap_or_default();
    Ok(env)
}

/// Resolves the `<FI_PROVIDER_PATH>` substitution per the three-tier
/// fallback: container env, then a libfabric scan of the dynamic-linker
/// cache, then `/usr/lib`.
fn resolve_fi_provider_path(state: &ContainerState, env: &[(String, String)]) -> Result<String> {
    if let Some((_, value)) = env.iter().find(|(k, _)| k == "FI_PROVIDER_PATH") {
        if !value.is_empty() {
            return Ok(value.clone());
        }
    }

    let rootfs = state.bundle.join("rootfs");
    let ldconfig_path = std::env::var("LDCONFIG_PATH").unwrap_or_else(|_| "/sbin/ldconfig".into());
    if let Ok(entries) = ldcache::list_cache(Path::new(&ldconfig_path), &rootfs) {
        let pattern = Regex::new(r"^libfabric\.so(\.\d+)+$").map_err(|e| Error::invariant(e.to_string()))?;
        if let Some(path) = ldcache::find_by_basename_pattern(&entries, &pattern) {
            if let Some(dir) = path.parent() {
                return Ok(dir.join("libfabric").to_string_lossy().into_owned());
            }
        }
    }

    Ok("/usr/lib".to_string())
}

/// Splits a `key=value,key=value` map into pairs; a bare `key` (no `=`)
/// yields an empty value, as `readonly` is written without one.
fn parse_map(s: &str) -> Vec<(String, String)> {
    s.split(',')
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (part.to_string(), String::new()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_map_splits_key_value_pairs() {
        let pairs = parse_map("type=bind,src=/a,dst=/b,readonly");
        assert_eq!(
            pairs,
            vec![
                ("type".to_string(), "bind".to_string()),
                ("src".to_string(), "/a".to_string()),
                ("dst".to_string(), "/b".to_string()),
                ("readonly".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn fi_provider_path_prefers_container_env() {
        let state = ContainerState::from_str(
            r#"{"ociVersion":"1.0.0","id":"x","status":"created","pid":1,"bundle":"/tmp/bundle"}"#,
        )
        .unwrap();
        let env = vec![("FI_PROVIDER_PATH".to_string(), "/custom/path".to_string())];
        assert_eq!(resolve_fi_provider_path(&state, &env).unwrap(), "/custom/path");
    }
}
