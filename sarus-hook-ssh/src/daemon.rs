//! `start-ssh-daemon` mode (spec section 4.10): runs as root, at
//! `createContainer` to set up and start the in-container Dropbear daemon,
//! and at `poststop` (signalled by `state.status == "stopped"`) to tear it
//! down.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use sarus_core::error::{Error, Result};
use sarus_core::process;
use sarus_hooks_common::state::ContainerState;

use crate::keys;

/// Environment and annotation knobs recognized by this mode.
struct Settings {
    hook_base_dir: PathBuf,
    passwd_file: PathBuf,
    dropbear_dir: PathBuf,
    join_namespaces: bool,
    overlay_mount_home_ssh: bool,
}

impl Settings {
    fn from_env() -> Result<Self> {
        Ok(Self {
            hook_base_dir: env_path_or("HOOK_BASE_DIR", "/var/sarus")?,
            passwd_file: env_path_or("PASSWD_FILE", "/etc/passwd")?,
            dropbear_dir: env_path_or("DROPBEAR_DIR", "/opt/sarus/dropbear")?,
            join_namespaces: std::env::var("JOIN_NAMESPACES").map(|v| v != "false").unwrap_or(true),
            overlay_mount_home_ssh: std::env::var("OVERLAY_MOUNT_HOME_SSH").map(|v| v != "false").unwrap_or(true),
        })
    }
}

fn env_path_or(key: &str, default: &str) -> Result<PathBuf> {
    Ok(std::env::var(key).map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(default)))
}

pub fn run(state: &ContainerState) -> Result<()> {
    sarus_hooks_common::timestamp::record_from_env()?;
    if state.status == "stopped" {
        return teardown(state);
    }
    setup(state)
}

fn setup(state: &ContainerState) -> Result<()> {
    let settings = Settings::from_env()?;

    if settings.join_namespaces {
        join_namespaces(state.pid)?;
    }

    let port = pick_port(state)?;
    let rootfs = state.bundle.join("rootfs");
    let container_env = read_container_environment(state)?;
    let (uid, gid) = container_user(state)?;

    let home = container_home_dir(&rootfs, uid)?;
    let ssh_dir_relative = Path::new(&home).join(".ssh");
    let ssh_dir = rootfs.join(ssh_dir_relative.strip_prefix("/").unwrap_or(&ssh_dir_relative));

    let bin_dir = rootfs.join("opt/oci-hooks/ssh/dropbear/bin");
    fs::create_dir_all(&bin_dir)?;
    for tool in ["dbclient", "dropbear"] {
        process::copy_with_ownership(&settings.dropbear_dir.join(tool), &bin_dir.join(tool), 0, 0)?;
        fs::set_permissions(bin_dir.join(tool), fs::Permissions::from_mode(0o755))?;
    }

    if settings.overlay_mount_home_ssh {
        overlay_mount_ssh_dir(&ssh_dir)?;
    } else {
        fs::create_dir_all(&ssh_dir)?;
    }

    let keys_dir = keys::keys_dir(&settings.hook_base_dir, &settings.passwd_file)?;
    if !keys::has_all_keys(&keys_dir) {
        return Err(Error::invariant(format!("incomplete SSH key set under '{}'; run keygen first", keys_dir.display())));
    }
    for file in keys::KEY_FILES {
        process::copy_with_ownership(&keys_dir.join(file), &ssh_dir.join(file), uid, gid)?;
    }
    if let Some(extra_key_path) = state.annotations.get("com.hooks.ssh.authorize_ssh_key") {
        let extra_key = fs::read_to_string(extra_key_path)?;
        let authorized_keys = ssh_dir.join("authorized_keys");
        let mut existing = fs::read_to_string(&authorized_keys).unwrap_or_default();
        if !existing.ends_with('\n') && !existing.is_empty() {
            existing.push('\n');
        }
        existing.push_str(extra_key.trim());
        existing.push('\n');
        fs::write(&authorized_keys, existing)?;
    }

    patch_passwd_shells(&rootfs)?;
    write_environment_file(&rootfs, &container_env)?;
    write_profile_script(&rootfs)?;
    write_ssh_wrapper(&rootfs, port)?;

    start_dropbear(state, &rootfs, uid, gid, port, &keys_dir)?;

    Ok(())
}

fn join_namespaces(pid: i32) -> Result<()> {
    for ns in ["mnt", "pid"] {
        let ns_path = format!("/proc/{pid}/ns/{ns}");
        let file = fs::File::open(&ns_path)?;
        use std::os::fd::AsRawFd;
        let ns_flag = if ns == "mnt" { libc::CLONE_NEWNS } else { libc::CLONE_NEWPID };
        if unsafe { libc::setns(file.as_raw_fd(), ns_flag) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
    }
    Ok(())
}

fn pick_port(state: &ContainerState) -> Result<u16> {
    if let Some(value) = state.annotations.get("com.hooks.ssh.port") {
        return value.parse().map_err(|_| Error::invalid("com.hooks.ssh.port", "not a valid port number"));
    }
    if let Ok(value) = std::env::var("SERVER_PORT") {
        return value.parse().map_err(|_| Error::invalid("SERVER_PORT", "not a valid port number"));
    }
    if let Ok(value) = std::env::var("SERVER_PORT_DEFAULT") {
        return value.parse().map_err(|_| Error::invalid("SERVER_PORT_DEFAULT", "not a valid port number"));
    }
    Err(Error::invalid("ssh port", "none of com.hooks.ssh.port, SERVER_PORT, SERVER_PORT_DEFAULT is set"))
}

fn container_user(state: &ContainerState) -> Result<(u32, u32)> {
    let data = fs::read_to_string(state.config_path())?;
    let doc: serde_json::Value =
        serde_json::from_str(&data).map_err(|e| Error::invalid(state.config_path().display().to_string(), e.to_string()))?;
    let uid = doc.pointer("/process/user/uid").and_then(serde_json::Value::as_u64).unwrap_or(0) as u32;
    let gid = doc.pointer("/process/user/gid").and_then(serde_json::Value::as_u64).unwrap_or(0) as u32;
    Ok((uid, gid))
}

fn read_container_environment(state: &ContainerState) -> Result<Vec<(String, String)>> {
    let data = fs::read_to_string(state.config_path())?;
    let doc: serde_json::Value =
        serde_json::from_str(&data).map_err(|e| Error::invalid(state.config_path().display().to_string(), e.to_string()))?;
    Ok(doc
        .pointer("/process/env")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .filter_map(|s| s.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())))
                .collect()
        })
        .unwrap_or_default())
}

/// Finds the invoking uid's home directory in the container's `/etc/passwd`;
/// errors if it is missing, empty, or `/nonexistent`.
fn container_home_dir(rootfs: &Path, uid: u32) -> Result<String> {
    let data = fs::read_to_string(rootfs.join("etc/passwd"))?;
    for line in data.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 6 {
            continue;
        }
        if fields[2].parse::<u32>().ok() == Some(uid) {
            let home = fields[5];
            if home.is_empty() || home == "/nonexistent" {
                return Err(Error::invariant(format!("container user {uid} has no usable home directory ('{home}')")));
            }
            return Ok(home.to_string());
        }
    }
    Err(Error::invariant(format!("no /etc/passwd entry for uid {uid} in container")))
}

fn overlay_mount_ssh_dir(ssh_dir: &Path) -> Result<()> {
    let parent = ssh_dir.parent().ok_or_else(|| Error::invariant("ssh directory has no parent"))?;
    fs::create_dir_all(parent)?;
    if !ssh_dir.exists() {
        fs::create_dir_all(ssh_dir)?;
    }
    let overlay_base = parent.join(".ssh-overlay");
    let upper = overlay_base.join("upper");
    let work = overlay_base.join("work");
    fs::create_dir_all(&upper)?;
    fs::create_dir_all(&work)?;
    sarus_core::fs_ops::mount_overlay(ssh_dir, &upper, &work, ssh_dir)
}

/// Rewrites any `/etc/passwd` entry whose login shell doesn't exist inside
/// the container to `/bin/sh`.
fn patch_passwd_shells(rootfs: &Path) -> Result<()> {
    let passwd_path = rootfs.join("etc/passwd");
    let data = fs::read_to_string(&passwd_path)?;
    let mut changed = false;
    let mut patched_lines = Vec::new();
    for line in data.lines() {
        let mut fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 7 {
            patched_lines.push(line.to_string());
            continue;
        }
        let shell = fields[6];
        let shell_relative = shell.strip_prefix('/').unwrap_or(shell);
        if !shell.is_empty() && !rootfs.join(shell_relative).exists() {
            fields[6] = "/bin/sh";
            changed = true;
        }
        patched_lines.push(fields.join(":"));
    }
    if changed {
        fs::write(&passwd_path, patched_lines.join("\n") + "\n")?;
    }
    Ok(())
}

fn write_environment_file(rootfs: &Path, env: &[(String, String)]) -> Result<()> {
    let mut contents = String::new();
    for (key, value) in env {
        contents.push_str(&format!("export {key}=\"{value}\"\n"));
    }
    let path = rootfs.join("opt/oci-hooks/ssh/dropbear/environment");
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, contents)?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o644))?;
    Ok(())
}

fn write_profile_script(rootfs: &Path) -> Result<()> {
    let contents = "if [ -n \"$SSH_CONNECTION\" ]; then\n    . /opt/oci-hooks/ssh/dropbear/environment\nfi\n";
    let path = rootfs.join("etc/profile.d/ssh-hook.sh");
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, contents)?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o644))?;
    Ok(())
}

fn write_ssh_wrapper(rootfs: &Path, port: u16) -> Result<()> {
    let contents = format!("#!/bin/sh\n/opt/oci-hooks/ssh/dropbear/bin/dbclient -y -p {port} $*\n");
    let path = rootfs.join("usr/bin/ssh");
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, contents)?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
    Ok(())
}

fn start_dropbear(state: &ContainerState, rootfs: &Path, uid: u32, gid: u32, port: u16, keys_dir: &Path) -> Result<()> {
    let host_key_in_keys_dir = keys_dir.join("dropbear_ecdsa_host_key");
    let container_keydir = Path::new("/opt/oci-hooks/ssh/dropbear/keys");
    let container_host_key = rootfs.join(container_keydir.strip_prefix("/").unwrap_or(container_keydir)).join("dropbear_ecdsa_host_key");
    if let Some(parent) = container_host_key.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(&host_key_in_keys_dir, &container_host_key)?;

    let pidfile_container = state
        .annotations
        .get("com.hooks.ssh.pidfile_container")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/opt/oci-hooks/ssh/dropbear/dropbear.pid"));
    let pidfile_host_path = rootfs.join(pidfile_container.strip_prefix("/").unwrap_or(&pidfile_container));
    if let Some(parent) = pidfile_host_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let args = vec![
        "-E".to_string(),
        "-r".to_string(),
        container_keydir.join("dropbear_ecdsa_host_key").to_string_lossy().into_owned(),
        "-p".to_string(),
        port.to_string(),
        "-P".to_string(),
        pidfile_container.to_string_lossy().into_owned(),
    ];
    let dropbear_path = PathBuf::from("/opt/oci-hooks/ssh/dropbear/bin/dropbear");
    let rootfs_owned = rootfs.to_path_buf();

    unsafe {
        process::fork_exec_wait(
            &dropbear_path,
            &args,
            &[],
            move || {
                let c_rootfs = std::ffi::CString::new(rootfs_owned.as_os_str().as_encoded_bytes())
                    .map_err(|_| Error::invariant("rootfs path contains a NUL byte"))?;
                if libc::chroot(c_rootfs.as_ptr()) != 0 {
                    return Err(std::io::Error::last_os_error().into());
                }
                if libc::chdir(c"/".as_ptr()) != 0 {
                    return Err(std::io::Error::last_os_error().into());
                }
                process::drop_privileges_to(uid, gid, &[])
            },
            |_child| {},
        )?
    };

    if let Some(pidfile_host) = state.annotations.get("com.hooks.ssh.pidfile_host") {
        let pid_contents = fs::read_to_string(&pidfile_host_path)?;
        fs::write(pidfile_host, pid_contents)?;
    }

    Ok(())
}

fn teardown(state: &ContainerState) -> Result<()> {
    let Some(pidfile_host) = state.annotations.get("com.hooks.ssh.pidfile_host") else {
        tracing::info!("no com.hooks.ssh.pidfile_host annotation; nothing to tear down");
        return Ok(());
    };
    let contents = fs::read_to_string(pidfile_host)?;
    let pid: i32 = contents.trim().parse().map_err(|_| Error::invariant(format!("'{pidfile_host}' does not contain a pid")))?;

    let group_result = unsafe { libc::kill(-pid, libc::SIGTERM) };
    let pid_result = unsafe { libc::kill(pid, libc::SIGTERM) };
    if group_result != 0 && pid_result != 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    let _ = fs::remove_file(pidfile_host);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_home_dir_rejects_nonexistent_home() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("etc")).unwrap();
        fs::write(tmp.path().join("etc/passwd"), "alice:x:1000:1000:Alice:/nonexistent:/bin/sh\n").unwrap();
        assert!(container_home_dir(tmp.path(), 1000).is_err());
    }

    #[test]
    fn container_home_dir_returns_home_field() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("etc")).unwrap();
        fs::write(tmp.path().join("etc/passwd"), "alice:x:1000:1000:Alice:/home/alice:/bin/sh\n").unwrap();
        assert_eq!(container_home_dir(tmp.path(), 1000).unwrap(), "/home/alice");
    }

    #[test]
    fn patch_passwd_shells_rewrites_missing_shell() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("etc")).unwrap();
        fs::create_dir_all(tmp.path().join("bin")).unwrap();
        fs::write(tmp.path().join("bin/sh"), []).unwrap();
        fs::write(tmp.path().join("etc/passwd"), "alice:x:1000:1000:Alice:/home/alice:/bin/zsh\n").unwrap();
        patch_passwd_shells(tmp.path()).unwrap();
        let data = fs::read_to_string(tmp.path().join("etc/passwd")).unwrap();
        assert!(data.contains("alice:x:1000:1000:Alice:/home/alice:/bin/sh"));
    }
}
