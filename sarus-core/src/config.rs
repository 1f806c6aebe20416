//! The `Config` object threaded through the runtime assembly pipeline, and
//! the administrator's `sarus.json` it is partly derived from (spec
//! sections 3, 6).

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::device::DeviceMount;
use crate::mount::Mount;
use sarus_store::Reference;

/// User identity a container runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub uid: u32,
    pub gid: u32,
    pub supplementary_gids: Vec<u32>,
}

/// Environment splice rules layered on top of the host environment (spec
/// section 4.5/6: `environment.{set,prepend,append,unset}`).
#[derive(Debug, Clone, Default)]
pub struct EnvironmentRules {
    pub set: Vec<(String, String)>,
    pub prepend: Vec<(String, String)>,
    pub append: Vec<(String, String)>,
    pub unset: Vec<String>,
}

/// Feature flags a `run` invocation may enable.
#[derive(Debug, Clone, Default)]
pub struct Flags {
    pub pid_private: bool,
    pub ssh: bool,
    pub mpi: bool,
    pub glibc: bool,
    pub tty: bool,
    pub init: bool,
}

/// Everything the bundle assembler needs for one `run` invocation. Built by
/// the (out-of-scope) CLI layer and handed to the pipeline whole.
#[derive(Debug, Clone)]
pub struct Config {
    pub user: UserIdentity,
    pub reference: Reference,
    pub squashfs_path: PathBuf,
    pub bundle_dir: PathBuf,
    pub mounts: Vec<Mount>,
    pub device_mounts: Vec<DeviceMount>,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub user_args: Vec<String>,
    pub host_environment: Vec<(String, String)>,
    pub environment: EnvironmentRules,
    pub flags: Flags,
    pub tty: bool,
    pub annotations: BTreeMap<String, String>,
    pub container_name: Option<String>,
    pub cpu_affinity: Vec<usize>,
    pub use_centralized_repository: bool,
    pub workdir: Option<String>,
    pub admin: AdministratorConfig,
}

/// `containersPolicy` sub-object.
#[derive(Debug, Clone, Deserialize)]
pub struct ContainersPolicy {
    pub path: PathBuf,
    pub enforce: bool,
}

/// `userMounts` sub-object.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserMountsPolicy {
    #[serde(default, rename = "notAllowedPrefixesOfPath")]
    pub not_allowed_prefixes_of_path: Vec<PathBuf>,
    #[serde(default, rename = "notAllowedPaths")]
    pub not_allowed_paths: Vec<PathBuf>,
}

/// `environment` sub-object of `sarus.json`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvironmentConfig {
    #[serde(default)]
    pub set: BTreeMap<String, String>,
    #[serde(default)]
    pub prepend: BTreeMap<String, String>,
    #[serde(default)]
    pub append: BTreeMap<String, String>,
    #[serde(default)]
    pub unset: Vec<String>,
}

/// A site mount declared in `sarus.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct SiteMount {
    #[serde(rename = "type")]
    pub mount_type: String,
    pub source: PathBuf,
    pub destination: PathBuf,
    #[serde(default)]
    pub flags: Vec<String>,
}

/// A site device declared in `sarus.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct SiteDevice {
    pub source: PathBuf,
    pub destination: Option<PathBuf>,
    pub access: Option<String>,
}

/// `repositoryMetadataLockTimings` sub-object.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct LockTimingsConfig {
    #[serde(rename = "timeoutMs")]
    pub timeout_ms: u64,
    #[serde(rename = "warningMs")]
    pub warning_ms: u64,
}

impl Default for LockTimingsConfig {
    fn default() -> Self {
        let t = sarus_store::LockTimings::default();
        Self { timeout_ms: t.timeout_ms, warning_ms: t.warning_ms }
    }
}

/// The deserialized shape of `sarus.json` — every key named in spec
/// section 6, with administrator-schema *validation* explicitly out of
/// scope (only shape deserialization happens here).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdministratorConfig {
    #[serde(default = "default_true")]
    pub security_checks: bool,
    pub oci_bundle_dir: PathBuf,
    #[serde(default = "default_rootfs_folder")]
    pub rootfs_folder: String,
    pub prefix_dir: PathBuf,
    pub hooks_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub local_repository_base_dir: PathBuf,
    pub centralized_repository_dir: Option<PathBuf>,
    #[serde(default = "default_ram_fs")]
    pub ram_filesystem_type: String,
    pub mksquashfs_path: PathBuf,
    #[serde(default)]
    pub mksquashfs_options: Vec<String>,
    pub init_path: Option<PathBuf>,
    pub runc_path: PathBuf,
    pub skopeo_path: PathBuf,
    pub umoci_path: PathBuf,
    pub containers_policy: Option<ContainersPolicy>,
    #[serde(rename = "containersRegistries.dPath")]
    pub containers_registries_d_path: Option<PathBuf>,
    pub seccomp_profile: Option<PathBuf>,
    pub apparmor_profile: Option<String>,
    pub selinux_label: Option<String>,
    pub selinux_mount_label: Option<String>,
    #[serde(default)]
    pub site_mounts: Vec<SiteMount>,
    #[serde(default)]
    pub site_devices: Vec<SiteDevice>,
    #[serde(default)]
    pub user_mounts: UserMountsPolicy,
    #[serde(default)]
    pub environment: EnvironmentConfig,
    #[serde(default = "default_mpi_type")]
    pub default_mpi_type: String,
    #[serde(default)]
    pub repository_metadata_lock_timings: LockTimingsConfig,
    #[serde(default)]
    pub enable_pm_ix_v3_support: bool,
}

fn default_true() -> bool {
    true
}
fn default_rootfs_folder() -> String {
    "rootfs".into()
}
fn default_ram_fs() -> String {
    "tmpfs".into()
}
fn default_mpi_type() -> String {
    "mpich".into()
}

impl AdministratorConfig {
    /// Parses `sarus.json` from disk.
    pub fn load(path: &std::path::Path) -> crate::error::Result<Self> {
        let data = std::fs::read_to_string(path)?;
        serde_json::from_str(&data)
            .map_err(|e| crate::error::Error::invalid(path.display().to_string(), e.to_string()))
    }

    /// Whether `centralizedRepositoryDir` was configured, enabling
    /// centralized-repository mode.
    pub const fn has_centralized_repository(&self) -> bool {
        self.centralized_repository_dir.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_document_with_defaults() {
        let json = serde_json::json!({
            "ociBundleDir": "/var/sarus/bundle",
            "prefixDir": "/opt/sarus",
            "hooksDir": "/opt/sarus/hooks",
            "tempDir": "/tmp",
            "localRepositoryBaseDir": "/home",
            "mksquashfsPath": "/usr/bin/mksquashfs",
            "runcPath": "/usr/bin/runc",
            "skopeoPath": "/usr/bin/skopeo",
            "umociPath": "/usr/bin/umoci",
        });
        let admin: AdministratorConfig = serde_json::from_value(json).unwrap();
        assert!(admin.security_checks);
        assert_eq!(admin.rootfs_folder, "rootfs");
        assert_eq!(admin.ram_filesystem_type, "tmpfs");
        assert!(!admin.has_centralized_repository());
    }
}
