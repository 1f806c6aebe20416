//! `keygen` / `check-user-has-sshkeys` modes (spec section 4.10): both run
//! as the invoking user, never as root.

use std::fs;
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use sarus_core::error::{Error, Result};

/// The three files every SSH key set is made of.
pub const KEY_FILES: [&str; 3] = ["dropbear_ecdsa_host_key", "id_dropbear", "authorized_keys"];

/// Resolves `<HOOK_BASE_DIR>/<user>/.oci-hooks/ssh/keys` for the invoking
/// user, looking their username up by uid in `passwd_file`.
pub fn keys_dir(hook_base_dir: &Path, passwd_file: &Path) -> Result<PathBuf> {
    let uid = unsafe { libc::getuid() };
    let username = username_for_uid(passwd_file, uid)?;
    Ok(hook_base_dir.join(username).join(".oci-hooks/ssh/keys"))
}

/// Parses `passwd_file` (`name:x:uid:gid:gecos:home:shell` lines) for the
/// entry matching `uid`.
pub fn username_for_uid(passwd_file: &Path, uid: u32) -> Result<String> {
    let data = fs::read_to_string(passwd_file)?;
    for line in data.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 3 {
            continue;
        }
        if fields[2].parse::<u32>().ok() == Some(uid) {
            return Ok(fields[0].to_string());
        }
    }
    Err(Error::invariant(format!("no passwd entry for uid {uid} in '{}'", passwd_file.display())))
}

/// Regenerates the key set under `keys_dir`, holding an exclusive lockfile
/// for the duration. Refuses to clobber an existing, complete key set
/// unless `overwrite` is set.
pub fn keygen(keys_dir: &Path, dropbearkey_path: &Path, overwrite: bool) -> Result<()> {
    fs::create_dir_all(keys_dir)?;
    let lock_path = keys_dir.join(".lock");
    let lock_file = fs::OpenOptions::new().create(true).write(true).open(&lock_path)?;
    let ret = unsafe { libc::flock(lock_file.as_raw_fd(), libc::LOCK_EX) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    let already_complete = KEY_FILES.iter().all(|f| keys_dir.join(f).exists());
    if already_complete && !overwrite {
        let result = Err(Error::policy(format!(
            "SSH keys already exist under '{}'; pass --overwrite to regenerate",
            keys_dir.display()
        )));
        unsafe { libc::flock(lock_file.as_raw_fd(), libc::LOCK_UN) };
        return result;
    }

    let result = generate(keys_dir, dropbearkey_path);
    unsafe { libc::flock(lock_file.as_raw_fd(), libc::LOCK_UN) };
    result
}

fn generate(keys_dir: &Path, dropbearkey_path: &Path) -> Result<()> {
    let host_key = keys_dir.join("dropbear_ecdsa_host_key");
    let client_key = keys_dir.join("id_dropbear");
    let authorized_keys = keys_dir.join("authorized_keys");

    let _ = fs::remove_file(&host_key);
    run_dropbearkey(dropbearkey_path, &["-t", "ecdsa", "-f"], &host_key)?;

    let _ = fs::remove_file(&client_key);
    run_dropbearkey(dropbearkey_path, &["-t", "ecdsa", "-f"], &client_key)?;

    let output = std::process::Command::new(dropbearkey_path).arg("-y").arg("-f").arg(&client_key).output()?;
    if !output.status.success() {
        return Err(Error::external_tool(format!("{} -y -f {}", dropbearkey_path.display(), client_key.display()), output.status.code().unwrap_or(-1)));
    }
    let public_key = extract_public_key(&String::from_utf8_lossy(&output.stdout))
        .ok_or_else(|| Error::invariant("dropbearkey -y produced no public key line"))?;
    fs::write(&authorized_keys, format!("{public_key}\n"))?;
    fs::set_permissions(&authorized_keys, fs::Permissions::from_mode(0o644))?;

    Ok(())
}

fn run_dropbearkey(dropbearkey_path: &Path, flags: &[&str], key_path: &Path) -> Result<()> {
    let status = std::process::Command::new(dropbearkey_path).args(flags).arg(key_path).status()?;
    if !status.success() {
        return Err(Error::external_tool(format!("{} {:?} {}", dropbearkey_path.display(), flags, key_path.display()), status.code().unwrap_or(-1)));
    }
    Ok(())
}

/// Extracts the `ssh-...` public key line from `dropbearkey -y` output.
fn extract_public_key(stdout: &str) -> Option<String> {
    stdout.lines().find(|l| l.starts_with("ssh-")).map(str::to_string)
}

/// `true` if all three key files are present.
pub fn has_all_keys(keys_dir: &Path) -> bool {
    KEY_FILES.iter().all(|f| keys_dir.join(f).exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_public_key_line() {
        let stdout = "Public key portion is:\nssh-ed25519 AAAAC3Nz dropbear@host\nFingerprint: md5 00:11\n";
        assert_eq!(extract_public_key(stdout), Some("ssh-ed25519 AAAAC3Nz dropbear@host".to_string()));
    }

    #[test]
    fn resolves_username_from_passwd_file() {
        let tmp = tempfile::tempdir().unwrap();
        let passwd = tmp.path().join("passwd");
        std::fs::write(&passwd, "root:x:0:0:root:/root:/bin/bash\nalice:x:1000:1000:Alice:/home/alice:/bin/bash\n").unwrap();
        assert_eq!(username_for_uid(&passwd, 1000).unwrap(), "alice");
        assert!(username_for_uid(&passwd, 9999).is_err());
    }

    #[test]
    fn has_all_keys_requires_every_file() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("dropbear_ecdsa_host_key"), []).unwrap();
        assert!(!has_all_keys(tmp.path()));
        std::fs::write(tmp.path().join("id_dropbear"), []).unwrap();
        std::fs::write(tmp.path().join("authorized_keys"), []).unwrap();
        assert!(has_all_keys(tmp.path()));
    }
}
