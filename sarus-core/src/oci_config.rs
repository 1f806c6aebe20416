//! OCI runtime-spec `config.json` synthesis (spec section 4.5).
//!
//! Builds the document the external OCI runtime reads to start the
//! container. Sarus performs the actual mounts itself (section 4.6); the
//! `mounts` entries here exist only to inform the runtime of what's already
//! in place. Rendered with 4-space indentation because round-trip tests
//! pin the exact bytes.

use std::collections::BTreeMap;

use oci_spec::runtime::{
    HookBuilder, Hooks, HooksBuilder, LinuxBuilder, LinuxDeviceBuilder, LinuxDeviceCgroupBuilder,
    LinuxDeviceType, LinuxResourcesBuilder, MountBuilder, ProcessBuilder, RootBuilder, Spec,
    SpecBuilder,
};

use crate::config::Config;
use crate::device::DeviceMount;
use crate::error::{Error, Result};
use crate::hooks::{HookStage, OciHook};
use crate::mount::Mount;

/// Builds the full runtime-spec document for `config`, referencing the
/// already-assembled rootfs and the resolved set of enabled hooks.
pub fn build_spec(config: &Config, rootfs: &std::path::Path, hooks: &[OciHook]) -> Result<Spec> {
    let process = ProcessBuilder::default()
        .terminal(config.tty)
        .user(
            oci_spec::runtime::UserBuilder::default()
                .uid(config.user.uid)
                .gid(config.user.gid)
                .additional_gids(config.user.supplementary_gids.clone())
                .build()
                .map_err(|e| Error::invariant(e.to_string()))?,
        )
        .args(process_args(config))
        .env(process_env(config))
        .cwd(config.workdir.clone().unwrap_or_else(|| "/".into()))
        .no_new_privileges(true)
        .build()
        .map_err(|e| Error::invariant(e.to_string()))?;

    let root = RootBuilder::default()
        .path(rootfs.to_path_buf())
        .readonly(false)
        .build()
        .map_err(|e| Error::invariant(e.to_string()))?;

    let mounts = config
        .mounts
        .iter()
        .map(mount_to_oci)
        .chain(config.device_mounts.iter().map(|d| mount_to_oci(&d.mount)))
        .collect::<Result<Vec<_>>>()?;

    let linux = LinuxBuilder::default()
        .devices(device_specs(config)?)
        .resources(
            LinuxResourcesBuilder::default()
                .devices(device_cgroup_rules(config)?)
                .build()
                .map_err(|e| Error::invariant(e.to_string()))?,
        )
        .build()
        .map_err(|e| Error::invariant(e.to_string()))?;

    let mut builder = SpecBuilder::default()
        .version("1.0.0")
        .process(process)
        .root(root)
        .mounts(mounts)
        .linux(linux)
        .annotations(config.annotations.clone());

    if !hooks.is_empty() {
        builder = builder.hooks(hooks_section(hooks)?);
    }

    builder.build().map_err(|e| Error::invariant(e.to_string()))
}

/// Serializes `spec` to a pretty-printed, 4-space-indented JSON string.
pub fn render(spec: &Spec) -> Result<String> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    serde::Serialize::serialize(spec, &mut ser).map_err(|e| Error::invariant(e.to_string()))?;
    String::from_utf8(buf).map_err(|e| Error::invariant(e.to_string()))
}

/// Entrypoint + cmd override logic matching Docker's semantics: if the user
/// supplied their own command, it replaces cmd but not entrypoint; if they
/// supplied nothing, entrypoint + cmd from the image are used verbatim.
fn process_args(config: &Config) -> Vec<String> {
    let mut args = config.entrypoint.clone();
    if !config.user_args.is_empty() {
        args.extend(config.user_args.iter().cloned());
    } else {
        args.extend(config.cmd.iter().cloned());
    }
    args
}

/// Merges host + user environment per `Config`'s splice rules: start from
/// host env, drop `unset`, apply `set` (override), then `prepend`/`append`
/// to any already-set value (or set it if absent).
fn process_env(config: &Config) -> Vec<String> {
    let mut merged: BTreeMap<String, String> = config.host_environment.iter().cloned().collect();
    for key in &config.environment.unset {
        merged.remove(key);
    }
    for (key, value) in &config.environment.set {
        merged.insert(key.clone(), value.clone());
    }
    for (key, prefix) in &config.environment.prepend {
        merged
            .entry(key.clone())
            .and_modify(|v| *v = format!("{prefix}{v}"))
            .or_insert_with(|| prefix.clone());
    }
    for (key, suffix) in &config.environment.append {
        merged
            .entry(key.clone())
            .and_modify(|v| v.push_str(suffix))
            .or_insert_with(|| suffix.clone());
    }
    merged.into_iter().map(|(k, v)| format!("{k}={v}")).collect()
}

fn mount_to_oci(mount: &Mount) -> Result<oci_spec::runtime::Mount> {
    MountBuilder::default()
        .destination(mount.destination.clone())
        .typ("bind")
        .source(mount.source.clone())
        .options(vec!["bind".to_string()])
        .build()
        .map_err(|e| Error::invariant(e.to_string()))
}

fn device_specs(config: &Config) -> Result<Vec<oci_spec::runtime::LinuxDevice>> {
    config
        .device_mounts
        .iter()
        .map(|d: &DeviceMount| {
            let typ = match d.device_type {
                crate::device::DeviceType::Char => LinuxDeviceType::C,
                crate::device::DeviceType::Block => LinuxDeviceType::B,
            };
            LinuxDeviceBuilder::default()
                .path(d.mount.destination.clone())
                .typ(typ)
                .major(i64::from(d.major))
                .minor(i64::from(d.minor))
                .build()
                .map_err(|e| Error::invariant(e.to_string()))
        })
        .collect()
}

/// Builds the devices-cgroup allow-list: a leading deny-all, then one allow
/// rule per configured device matching its access string.
fn device_cgroup_rules(config: &Config) -> Result<Vec<oci_spec::runtime::LinuxDeviceCgroup>> {
    let mut rules = Vec::with_capacity(1 + config.device_mounts.len());
    rules.push(
        LinuxDeviceCgroupBuilder::default()
            .allow(false)
            .access("rwm")
            .build()
            .map_err(|e| Error::invariant(e.to_string()))?,
    );
    for d in &config.device_mounts {
        let typ = match d.device_type {
            crate::device::DeviceType::Char => LinuxDeviceType::C,
            crate::device::DeviceType::Block => LinuxDeviceType::B,
        };
        rules.push(
            LinuxDeviceCgroupBuilder::default()
                .allow(true)
                .typ(typ)
                .major(i64::from(d.major))
                .minor(i64::from(d.minor))
                .access(d.access.string())
                .build()
                .map_err(|e| Error::invariant(e.to_string()))?,
        );
    }
    Ok(rules)
}

fn hooks_section(hooks: &[OciHook]) -> Result<Hooks> {
    let mut builder = HooksBuilder::default();
    for stage in [
        HookStage::Prestart,
        HookStage::CreateRuntime,
        HookStage::CreateContainer,
        HookStage::StartContainer,
        HookStage::Poststart,
        HookStage::Poststop,
    ] {
        let entries: Vec<oci_spec::runtime::Hook> = hooks
            .iter()
            .filter(|h| h.stages.contains(&stage))
            .map(|h| {
                HookBuilder::default()
                    .path(h.hook.path.clone())
                    .args(h.hook.args.clone())
                    .env(h.hook.env.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>())
                    .build()
                    .map_err(|e| Error::invariant(e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        if entries.is_empty() {
            continue;
        }
        builder = stage.assign(builder, entries);
    }
    builder.build().map_err(|e| Error::invariant(e.to_string()))
}
