//! Core library: everything needed to assemble and launch an OCI bundle for
//! an unprivileged-user container, short of the hook binaries themselves
//! (which live in their own crates so they can be installed standalone into
//! an administrator's `hooksDir`).

pub mod config;
pub mod device;
pub mod error;
pub mod fd;
pub mod fs_ops;
pub mod hooks;
pub mod mount;
pub mod oci_config;
pub mod process;
pub mod runtime;
pub mod security;

pub use config::{AdministratorConfig, Config, EnvironmentRules, Flags, UserIdentity};
pub use device::{Access, DeviceMount, DeviceType};
pub use error::{Error, Kind, Result};
pub use hooks::{Condition, HookStage, JsonHook, OciHook};
pub use mount::{Band, DestinationPolicy, Mount, MountFlags};
pub use runtime::{assemble_and_run, Assembled};
