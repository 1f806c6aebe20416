//! Thin CLI entry point for the bundle assembler: reads a serialized
//! [`sarus_core::config::Config`] produced by the (out-of-scope) `sarus run`
//! front end and drives the fourteen-step pipeline.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sarus-runtime", about = "Assembles and runs an OCI bundle for a resolved container request")]
struct Cli {
    /// Path to a JSON file describing the resolved run request.
    #[arg(long)]
    config: PathBuf,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();

    match run(&cli) {
        Ok(status) => match status.code() {
            Some(code) => ExitCode::from(code as u8),
            None => ExitCode::FAILURE,
        },
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> sarus_core::Result<sarus_core::process::ExitStatus> {
    let data = std::fs::read_to_string(&cli.config)?;
    let request: RunRequest = serde_json::from_str(&data)
        .map_err(|e| sarus_core::Error::invalid(cli.config.display().to_string(), e.to_string()))?;
    let config = request.into_config()?;
    let assembled = sarus_core::runtime::assemble_and_run(&config)?;
    Ok(assembled.exit_status)
}

/// The on-disk shape handed to this binary by the (out-of-scope) CLI front
/// end. Kept deliberately minimal: it names only what can't be recomputed
/// from the administrator config and the image store.
#[derive(serde::Deserialize)]
struct RunRequest {
    admin_config_path: PathBuf,
    squashfs_path: PathBuf,
    bundle_dir: PathBuf,
    uid: u32,
    gid: u32,
    #[serde(default)]
    supplementary_gids: Vec<u32>,
    #[serde(default)]
    entrypoint: Vec<String>,
    #[serde(default)]
    cmd: Vec<String>,
    #[serde(default)]
    user_args: Vec<String>,
    reference: String,
    #[serde(default)]
    tty: bool,
    #[serde(default)]
    init: bool,
    workdir: Option<String>,
    container_name: Option<String>,
}

impl RunRequest {
    fn into_config(self) -> sarus_core::Result<sarus_core::Config> {
        let admin = sarus_core::AdministratorConfig::load(&self.admin_config_path)?;
        let reference = sarus_store::Reference::parse(&self.reference)?;
        let host_environment: Vec<(String, String)> = std::env::vars().collect();

        Ok(sarus_core::Config {
            user: sarus_core::UserIdentity {
                uid: self.uid,
                gid: self.gid,
                supplementary_gids: self.supplementary_gids,
            },
            reference,
            squashfs_path: self.squashfs_path,
            bundle_dir: self.bundle_dir,
            mounts: Vec::new(),
            device_mounts: Vec::new(),
            entrypoint: self.entrypoint,
            cmd: self.cmd,
            user_args: self.user_args,
            host_environment,
            environment: sarus_core::EnvironmentRules::default(),
            flags: sarus_core::Flags { init: self.init, ..Default::default() },
            tty: self.tty,
            annotations: Default::default(),
            container_name: self.container_name,
            cpu_affinity: sarus_core::process::get_cpu_affinity().unwrap_or_default(),
            use_centralized_repository: admin.has_centralized_repository(),
            workdir: self.workdir,
            admin,
        })
    }
}
