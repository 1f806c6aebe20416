//! Multi-mode OCI hook binary dispatched on `argv[1]` (spec section 4.10):
//! `keygen`, `check-user-has-sshkeys` (both run as the invoking user), and
//! `start-ssh-daemon` (the actual OCI hook entry point, run as root).

mod daemon;
mod keys;

use std::path::PathBuf;

use tracing_subscriber::EnvFilter;

use sarus_core::error::{Error, Result};
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
    let args: Vec<String> = std::env::args().collect();
    let mode = args.get(1).map(String::as_str).ok_or_else(|| Error::invalid("argv[1]", "missing mode"))?;

    match mode {
        "keygen" => run_keygen(&args[2..]),
        "check-user-has-sshkeys" => run_check_has_sshkeys(),
        "start-ssh-daemon" => {
            let state = ContainerState::from_stdin()?;
            daemon::run(&state)
        }
        other => Err(Error::invalid("argv[1]", format!("unknown mode '{other}'"))),
    }
}

fn run_keygen(rest: &[String]) -> Result<()> {
    let overwrite = rest.iter().any(|a| a == "--overwrite");
    let hook_base_dir = env_path_or("HOOK_BASE_DIR", "/var/sarus");
    let passwd_file = env_path_or("PASSWD_FILE", "/etc/passwd");
    let dropbearkey_path = env_path_or("DROPBEARKEY_PATH", "/usr/bin/dropbearkey");

    let keys_dir = keys::keys_dir(&hook_base_dir, &passwd_file)?;
    keys::keygen(&keys_dir, &dropbearkey_path, overwrite)
}

fn run_check_has_sshkeys() -> Result<()> {
    let hook_base_dir = env_path_or("HOOK_BASE_DIR", "/var/sarus");
    let passwd_file = env_path_or("PASSWD_FILE", "/etc/passwd");
    let keys_dir = keys::keys_dir(&hook_base_dir, &passwd_file)?;
    if keys::has_all_keys(&keys_dir) {
        Ok(())
    } else {
        Err(Error::policy(format!("incomplete SSH key set under '{}'", keys_dir.display())))
    }
}

fn env_path_or(key: &str, default: &str) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(default))
}
