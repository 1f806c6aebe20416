//! OCI `createContainer` hook: cross-rank rendezvous over a shared
//! filesystem, for Slurm job steps launching one container per rank (spec
//! section 4.11).

use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use sarus_core::error::{Error, Result};
use sarus_core::process;
use sarus_hooks_common::state::ContainerState;

/// Poll interval for the arrival/departure spin loops.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

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

struct SlurmStep {
    job_id: String,
    step_id: String,
    ntasks: u32,
    procid: u32,
}

fn run() -> Result<()> {
    let state = ContainerState::from_stdin()?;
    sarus_hooks_common::timestamp::record_from_env()?;
    let env = read_container_environment(&state)?;

    let Some(step) = parse_slurm_step(&env) else {
        tracing::info!("Slurm environment incomplete; slurm-global-sync disabled for this container");
        return Ok(());
    };

    let (uid, gid) = container_user(&state)?;
    process::drop_privileges_to(uid, gid, &[])?;

    let hook_base_dir = env_path_or("HOOK_BASE_DIR", "/var/sarus");
    let passwd_file = env_path_or("PASSWD_FILE", "/etc/passwd");
    let username = username_for_uid(&passwd_file, uid)?;

    let sync_dir = hook_base_dir
        .join(username)
        .join(".oci-hooks/slurm-global-sync")
        .join(format!("jobid-{}-stepid-{}", step.job_id, step.step_id));
    let arrival_dir = sync_dir.join("arrival");
    let departure_dir = sync_dir.join("departure");
    std::fs::create_dir_all(&arrival_dir)?;
    std::fs::create_dir_all(&departure_dir)?;

    std::fs::write(arrival_dir.join(format!("slurm-procid-{}", step.procid)), [])?;
    spin_until_count(&arrival_dir, step.ntasks)?;

    std::fs::write(departure_dir.join(format!("slurm-procid-{}", step.procid)), [])?;
    if step.procid == 0 {
        spin_until_count(&departure_dir, step.ntasks)?;
        let _ = std::fs::remove_dir_all(&sync_dir);
    }

    Ok(())
}

fn spin_until_count(dir: &Path, target: u32) -> Result<()> {
    loop {
        let count = std::fs::read_dir(dir)?.count() as u32;
        if count >= target {
            return Ok(());
        }
        sleep(POLL_INTERVAL);
    }
}

fn parse_slurm_step(env: &[(String, String)]) -> Option<SlurmStep> {
    let lookup = |key: &str| env.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone());
    Some(SlurmStep {
        job_id: lookup("SLURM_JOB_ID")?,
        step_id: lookup("SLURM_STEPID")?,
        ntasks: lookup("SLURM_NTASKS")?.parse().ok()?,
        procid: lookup("SLURM_PROCID")?.parse().ok()?,
    })
}

fn read_container_environment(state: &ContainerState) -> Result<Vec<(String, String)>> {
    let data = std::fs::read_to_string(state.config_path())?;
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

fn container_user(state: &ContainerState) -> Result<(u32, u32)> {
    let data = std::fs::read_to_string(state.config_path())?;
    let doc: serde_json::Value =
        serde_json::from_str(&data).map_err(|e| Error::invalid(state.config_path().display().to_string(), e.to_string()))?;
    let uid = doc.pointer("/process/user/uid").and_then(serde_json::Value::as_u64).unwrap_or(0) as u32;
    let gid = doc.pointer("/process/user/gid").and_then(serde_json::Value::as_u64).unwrap_or(0) as u32;
    Ok((uid, gid))
}

fn username_for_uid(passwd_file: &Path, uid: u32) -> Result<String> {
    let data = std::fs::read_to_string(passwd_file)?;
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

fn env_path_or(key: &str, default: &str) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(default))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_complete_slurm_step() {
        let env = vec![
            ("SLURM_JOB_ID".to_string(), "1234".to_string()),
            ("SLURM_STEPID".to_string(), "0".to_string()),
            ("SLURM_NTASKS".to_string(), "4".to_string()),
            ("SLURM_PROCID".to_string(), "2".to_string()),
        ];
        let step = parse_slurm_step(&env).unwrap();
        assert_eq!(step.job_id, "1234");
        assert_eq!(step.ntasks, 4);
        assert_eq!(step.procid, 2);
    }

    #[test]
    fn missing_var_disables_sync() {
        let env = vec![("SLURM_JOB_ID".to_string(), "1234".to_string())];
        assert!(parse_slurm_step(&env).is_none());
    }

    #[test]
    fn spin_until_count_returns_once_target_reached() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("slurm-procid-0"), []).unwrap();
        std::fs::write(tmp.path().join("slurm-procid-1"), []).unwrap();
        spin_until_count(tmp.path(), 2).unwrap();
    }
}
