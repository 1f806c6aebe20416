//! Shared plumbing for the OCI hook binaries: container-state parsing,
//! cgroup-v1 devices discovery, a chroot/privilege-drop helper, and the
//! dynamic-linker cache scan libfabric/glibc/MPI all three lean on (spec
//! sections 4.7-4.11).

pub mod amdgpu;
pub mod chroot_exec;
pub mod cgroup;
pub mod ldcache;
pub mod state;
pub mod timestamp;

pub use cgroup::DevicesCgroup;
pub use chroot_exec::run_in_rootfs;
pub use state::ContainerState;
