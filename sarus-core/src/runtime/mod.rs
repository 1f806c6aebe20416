//! The runtime bundle assembler: the fourteen-step, strictly sequential
//! pipeline that turns a resolved [`Config`] into a running container (spec
//! section 4.6). This is the centerpiece of the crate — everything else
//! (mount/device parsing, the fd handler, the OCI config synthesizer, the
//! security checks) exists to be consumed here.

mod signal_proxy;

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::{info, instrument};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::fd::FdHandler;
use crate::{fs_ops, hooks, oci_config, process, security};

pub use signal_proxy::install_signal_proxy;

/// What [`assemble_and_run`] produced: the runc exit status plus the paths
/// it left behind, for callers (tests, the CLI) that want to inspect the
/// bundle post-mortem.
#[derive(Debug)]
pub struct Assembled {
    pub bundle_dir: PathBuf,
    pub rootfs: PathBuf,
    pub exit_status: process::ExitStatus,
}

struct Layout {
    bundle_dir: PathBuf,
    overlay_dir: PathBuf,
    lower: PathBuf,
    upper: PathBuf,
    work: PathBuf,
    rootfs: PathBuf,
}

impl Layout {
    fn new(bundle_dir: &Path) -> Self {
        let overlay_dir = bundle_dir.join("overlay");
        Self {
            bundle_dir: bundle_dir.to_path_buf(),
            lower: overlay_dir.join("rootfs-lower"),
            upper: overlay_dir.join("rootfs-upper"),
            work: overlay_dir.join("rootfs-work"),
            rootfs: bundle_dir.join(&config_rootfs_folder()),
            overlay_dir,
        }
    }
}

// `rootfsFolder` defaults to "rootfs"; the administrator config carries the
// configured value, but the overlay target name is fixed for the lifetime of
// one assembly, so Layout is built from Config::admin.rootfs_folder directly
// in `new_layout` below rather than this free function (kept only for the
// default when a Layout is built in tests without a full Config).
fn config_rootfs_folder() -> String {
    "rootfs".into()
}

fn new_layout(config: &Config) -> Layout {
    let mut layout = Layout::new(&config.bundle_dir);
    layout.rootfs = config.bundle_dir.join(&config.admin.rootfs_folder);
    layout
}

/// Runs the full fourteen-step pipeline and execs `runc`, returning once the
/// container has exited. No step may be skipped or reordered: a partial
/// failure before step 4 leaves only the unshared mount namespace behind
/// (it dies with the process); failures after step 4 rely on the tmpfs
/// bundle being garbage-collected on namespace teardown.
#[instrument(skip_all, fields(bundle = %config.bundle_dir.display()))]
pub fn assemble_and_run(config: &Config) -> Result<Assembled> {
    let layout = new_layout(config);

    clear_environment(config)?;
    isolate_mount_namespace()?;
    mount_bundle_tmpfs(config, &layout)?;
    compose_image_overlay(config, &layout)?;
    mount_dev_tmpfs(&layout)?;
    stage_etc(config, &layout)?;
    mount_init_program(config, &layout)?;
    let hooks = load_enabled_hooks(config, &layout)?;
    perform_custom_mounts(config, &layout)?;
    perform_extra_mounts(config, &layout)?;
    perform_device_mounts(config, &layout)?;
    remount_rootfs_nosuid(&layout)?;
    let fd_outcome = apply_fd_discipline(config)?;
    write_bundle_config(config, &layout, &hooks)?;
    let exit_status = exec_runc(config, &layout, fd_outcome.extra_file_descriptors)?;

    Ok(Assembled { bundle_dir: layout.bundle_dir, rootfs: layout.rootfs, exit_status })
}

/// Step 1: the host environment was already snapshotted into
/// `Config.host_environment` by the (out-of-scope) CLI layer; empty the
/// process environment so nothing leaks into `runc`'s inherited env block.
fn clear_environment(config: &Config) -> Result<()> {
    info!(vars = config.host_environment.len(), "clearing process environment");
    for (key, _) in std::env::vars() {
        // SAFETY: single-threaded at this point in the pipeline (step 1,
        // before any fork).
        unsafe {
            std::env::remove_var(key);
        }
    }
    Ok(())
}

/// Step 2: `unshare(CLONE_NEWNS)`, then remount `/` `MS_SLAVE|MS_REC` so
/// later mounts don't propagate to the host.
fn isolate_mount_namespace() -> Result<()> {
    fs_ops::unshare_mount_namespace().map_err(|e| e.trace("unshare(CLONE_NEWNS)"))?;
    fs_ops::remount_propagation(Path::new("/"), true).map_err(|e| e.trace("remount / as MS_SLAVE|MS_REC"))?;
    Ok(())
}

/// Step 3: ram/tmpfs on the bundle dir, re-privatized, `chmod 0755` so the
/// untamperable check later passes on everything under it.
fn mount_bundle_tmpfs(config: &Config, layout: &Layout) -> Result<()> {
    std::fs::create_dir_all(&layout.bundle_dir)?;
    let flags = (libc::MS_NOSUID | libc::MS_NODEV) as libc::c_ulong;
    fs_ops::mount_tmpfs(&layout.bundle_dir, &config.admin.ram_filesystem_type, flags, None)
        .map_err(|e| e.trace("mount bundle tmpfs"))?;
    fs_ops::remount_propagation(&layout.bundle_dir, true)?;
    std::fs::set_permissions(&layout.bundle_dir, std::fs::Permissions::from_mode(0o755))?;
    Ok(())
}

/// Step 4: `overlay/rootfs-{lower,upper,work}`; loop-mount the squashfs
/// image read-only at `lower`; overlay-mount `lower+upper+work` at
/// `rootfs`. Upper and work are left user-owned (the process is still
/// running as the unprivileged user at this point).
fn compose_image_overlay(config: &Config, layout: &Layout) -> Result<()> {
    std::fs::create_dir_all(&layout.lower)?;
    std::fs::create_dir_all(&layout.upper)?;
    std::fs::create_dir_all(&layout.work)?;
    std::fs::create_dir_all(&layout.rootfs)?;

    fs_ops::loop_mount_squashfs(&config.squashfs_path, &layout.lower)
        .map_err(|e| e.trace("loop-mount squashfs image"))?;
    fs_ops::mount_overlay(&layout.lower, &layout.upper, &layout.work, &layout.rootfs)
        .map_err(|e| e.trace("overlay-mount rootfs"))?;

    chown_user(&layout.upper, config)?;
    chown_user(&layout.work, config)?;
    Ok(())
}

fn chown_user(path: &Path, config: &Config) -> Result<()> {
    let c_path = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| Error::invariant("path contains a NUL byte"))?;
    let ret = unsafe { libc::chown(c_path.as_ptr(), config.user.uid, config.user.gid) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

/// Step 5: `/dev` tmpfs inside the rootfs.
fn mount_dev_tmpfs(layout: &Layout) -> Result<()> {
    let dev = layout.rootfs.join("dev");
    std::fs::create_dir_all(&dev)?;
    let flags = (libc::MS_NOSUID | libc::MS_STRICTATIME) as libc::c_ulong;
    fs_ops::mount_tmpfs(&dev, "tmpfs", flags, Some("mode=755,size=65536k"))
        .map_err(|e| e.trace("mount /dev tmpfs"))
}

/// Step 6: copy host `/etc/hosts` and `/etc/resolv.conf` in; overwrite
/// `nsswitch.conf`/`passwd`/`group` with Sarus-packaged copies regardless of
/// what the image shipped.
fn stage_etc(config: &Config, layout: &Layout) -> Result<()> {
    let etc = layout.rootfs.join("etc");
    std::fs::create_dir_all(&etc)?;

    for name in ["hosts", "resolv.conf"] {
        let host_path = Path::new("/etc").join(name);
        if host_path.exists() {
            fs_ops::copy_file(&host_path, &etc.join(name)).map_err(|e| e.trace_in("stage_etc", name))?;
        }
    }

    for name in ["nsswitch.conf", "passwd", "group"] {
        let packaged = config.admin.prefix_dir.join("etc").join(name);
        if packaged.exists() {
            fs_ops::copy_file(&packaged, &etc.join(name)).map_err(|e| e.trace_in("stage_etc", name))?;
        }
    }
    Ok(())
}

/// Step 7: if `--init` is set, bind-mount `initPath` over `rootfs/dev/init`.
fn mount_init_program(config: &Config, layout: &Layout) -> Result<()> {
    if !config.flags.init {
        return Ok(());
    }
    let init_path = config
        .admin
        .init_path
        .as_ref()
        .ok_or_else(|| Error::invalid("--init", "no initPath configured in sarus.json"))?;
    let target = layout.rootfs.join("dev/init");
    std::fs::write(&target, [])?;
    fs_ops::bind_mount(init_path, &target, libc::MS_RDONLY as i32).map_err(|e| e.trace("bind-mount init program"))
}

fn load_enabled_hooks(config: &Config, _layout: &Layout) -> Result<Vec<hooks::OciHook>> {
    let all = hooks::load_hooks(&config.admin.hooks_dir)?;
    if config.admin.security_checks {
        for hook in &all {
            security::check_that_path_is_untamperable(&hook.hook.path)
                .map_err(|e| e.trace_in("load_enabled_hooks", hook.hook.path.display().to_string()))?;
        }
    }
    let has_bind_mounts = !config.mounts.is_empty();
    let command: Vec<String> = config.cmd.iter().chain(config.user_args.iter()).cloned().collect();
    all.into_iter()
        .map(|h| {
            let enabled = h.condition.matches(&config.annotations, &command, has_bind_mounts)?;
            Ok((h, enabled))
        })
        .collect::<Result<Vec<_>>>()
        .map(|pairs| pairs.into_iter().filter(|(_, enabled)| *enabled).map(|(h, _)| h).collect())
}

/// Step 8: perform each configured mount, site mounts first then user
/// mounts, each confined to the rootfs via symlink-safe realpath resolution.
fn perform_custom_mounts(config: &Config, layout: &Layout) -> Result<()> {
    for mount in &config.mounts {
        let target = security::confine_to_rootfs(&layout.rootfs, &mount.destination)
            .map_err(|e| e.trace_in("perform_custom_mounts", mount.destination.display().to_string()))?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if !target.exists() {
            if mount.source.is_dir() {
                std::fs::create_dir_all(&target)?;
            } else {
                std::fs::write(&target, [])?;
            }
        }
        fs_ops::bind_mount(&mount.source, &target, mount.flags)
            .map_err(|e| e.trace_in("perform_custom_mounts", mount.destination.display().to_string()))?;
    }
    Ok(())
}

/// Step 9: PMIx-v3 / Slurm spool extra mounts, skipping anything that is
/// equal-to-or-a-child-of the PMIx server tempdir (it's already reachable
/// through that mount).
fn perform_extra_mounts(config: &Config, layout: &Layout) -> Result<()> {
    if !config.admin.enable_pm_ix_v3_support {
        return Ok(());
    }
    let env = |key: &str| config.host_environment.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone());

    let server_tmpdir = env("PMIX_SERVER_TMPDIR").map(PathBuf::from);
    let mut extra: Vec<PathBuf> = Vec::new();

    if let (Some(job), Some(step)) = (env("SLURM_JOB_ID"), env("SLURM_STEPID")) {
        if config.admin.default_mpi_type.starts_with("pmix") {
            extra.push(PathBuf::from(format!("/tmp/pmix.{job}.{step}")));
            extra.push(PathBuf::from(format!("/tmp/spmix_appdir_{job}_{step}")));
        }
    }

    for path in extra {
        if let Some(server) = &server_tmpdir {
            if &path == server || path.starts_with(server) {
                continue;
            }
        }
        if !path.exists() {
            continue;
        }
        let target = security::confine_to_rootfs(&layout.rootfs, &path)?;
        std::fs::create_dir_all(&target)?;
        fs_ops::bind_mount(&path, &target, (libc::MS_REC | libc::MS_PRIVATE) as i32)
            .map_err(|e| e.trace_in("perform_extra_mounts", path.display().to_string()))?;
    }
    Ok(())
}

/// Step 10: bind-mount each device node into the rootfs. Cgroup
/// whitelisting is deferred to `runc` via the config.json devices-cgroup
/// section (section 4.5) rather than done here.
fn perform_device_mounts(config: &Config, layout: &Layout) -> Result<()> {
    for device in &config.device_mounts {
        let target = security::confine_to_rootfs(&layout.rootfs, &device.mount.destination)
            .map_err(|e| e.trace_in("perform_device_mounts", device.mount.destination.display().to_string()))?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if !target.exists() {
            std::fs::write(&target, [])?;
        }
        fs_ops::bind_mount(&device.mount.source, &target, device.mount.flags)
            .map_err(|e| e.trace_in("perform_device_mounts", device.mount.destination.display().to_string()))?;
    }
    Ok(())
}

/// Step 11: remount the rootfs `MS_NOSUID`.
fn remount_rootfs_nosuid(layout: &Layout) -> Result<()> {
    fs_ops::remount(&layout.rootfs, libc::MS_NOSUID as libc::c_ulong).map_err(|e| e.trace("remount rootfs MS_NOSUID"))
}

/// Step 12: preserve `PMI_FD`, then close/compact the fd table.
fn apply_fd_discipline(config: &Config) -> Result<crate::fd::Outcome> {
    let mut handler = FdHandler::new();
    handler.preserve_pmi_fd(&config.host_environment);
    handler.apply().map_err(|e| e.trace("apply fd discipline"))
}

/// Step 13: synthesize and write `config.json`.
fn write_bundle_config(config: &Config, layout: &Layout, hooks: &[hooks::OciHook]) -> Result<()> {
    let spec = oci_config::build_spec(config, &layout.rootfs, hooks).map_err(|e| e.trace("build OCI spec"))?;
    let rendered = oci_config::render(&spec).map_err(|e| e.trace("render OCI spec"))?;
    std::fs::write(layout.bundle_dir.join("config.json"), rendered)?;
    Ok(())
}

/// Step 14: `chdir(bundle)`, then `fork-exec-wait runc run --preserve-fds N
/// <id>`. The child sets `PR_SET_PDEATHSIG=SIGHUP`; the parent installs a
/// signal proxy while the child runs.
fn exec_runc(config: &Config, layout: &Layout, preserve_fds: u32) -> Result<process::ExitStatus> {
    std::env::set_current_dir(&layout.bundle_dir)?;

    if config.admin.security_checks {
        security::check_that_path_is_untamperable(&config.admin.runc_path)
            .map_err(|e| e.trace("runc binary untamperable check"))?;
    }

    let container_id = config.container_name.clone().unwrap_or_else(|| config.reference.normalize());
    let args = vec!["run".to_string(), "--preserve-fds".to_string(), preserve_fds.to_string(), container_id];
    let env: Vec<(String, String)> = Vec::new();

    // SAFETY: `pre_exec` only performs async-signal-safe raw syscalls
    // (prctl, getppid, raise).
    unsafe {
        process::fork_exec_wait(
            &config.admin.runc_path,
            &args,
            &env,
            || process::die_with_parent_on_hup(),
            |child_pid| install_signal_proxy(child_pid),
        )
    }
}
