//! Cgroup v1 devices-controller discovery and whitelisting (spec section
//! 4.7).

use std::fs;
use std::path::PathBuf;

use sarus_core::error::{Error, Result};

/// A resolved devices-cgroup directory for one container, ready to accept
/// `devices.allow` writes.
#[derive(Debug, Clone)]
pub struct DevicesCgroup {
    path: PathBuf,
}

impl DevicesCgroup {
    /// Discovers the devices cgroup for the process `pid`.
    ///
    /// Parses `/proc/<pid>/mountinfo` for the line whose filesystem type is
    /// `cgroup` and super-options contain `devices`, extracting its
    /// mount-root and mount-point; then parses `/proc/<pid>/cgroup` for the
    /// `devices` controller line and composes
    /// `mountpoint/(cgroup-path - mount-root prefix)`.
    pub fn discover(pid: i32) -> Result<Self> {
        let mountinfo = fs::read_to_string(format!("/proc/{pid}/mountinfo"))?;
        let (mount_root, mount_point) = find_devices_mount(&mountinfo)
            .ok_or_else(|| Error::invariant("no devices cgroup mount found in mountinfo"))?;

        let cgroup_file = fs::read_to_string(format!("/proc/{pid}/cgroup"))?;
        let cgroup_path = find_devices_cgroup_path(&cgroup_file)
            .ok_or_else(|| Error::invariant("no devices line found in /proc/<pid>/cgroup"))?;

        if mount_root == "/.." || mount_root.split('/').any(|c| c == "..") {
            return Err(Error::policy("devices cgroup mount-root escapes its namespace"));
        }

        let relative = cgroup_path
            .strip_prefix(&mount_root)
            .ok_or_else(|| Error::policy("cgroup path does not share the mount-root prefix"))?;
        let relative = relative.trim_start_matches('/');

        let path = if relative.is_empty() { mount_point } else { format!("{mount_point}/{relative}") };
        Ok(Self { path: PathBuf::from(path) })
    }

    /// Writes `"<c|b> <major>:<minor> <access>"` to `devices.allow`.
    pub fn allow(&self, type_letter: char, major: u32, minor: u32, access: &str) -> Result<()> {
        let line = format!("{type_letter} {major}:{minor} {access}");
        fs::write(self.path.join("devices.allow"), line)?;
        Ok(())
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

fn find_devices_mount(mountinfo: &str) -> Option<(String, String)> {
    for line in mountinfo.lines() {
        // mountinfo fields: ... mount-root mount-point ... - fstype source super-options
        let dash_pos = line.find(" - ")?;
        let (left, right) = line.split_at(dash_pos);
        let right = &right[3..];
        let mut right_fields = right.split_whitespace();
        let fstype = right_fields.next()?;
        let _source = right_fields.next()?;
        let super_options = right_fields.next().unwrap_or("");
        if fstype != "cgroup" || !super_options.split(',').any(|o| o == "devices") {
            continue;
        }
        let left_fields: Vec<&str> = left.split_whitespace().collect();
        // field[3] = mount-root, field[4] = mount-point, counting the leading
        // mount-id/parent-id/major:minor fields (0,1,2).
        if left_fields.len() < 5 {
            continue;
        }
        return Some((left_fields[3].to_string(), left_fields[4].to_string()));
    }
    None
}

fn find_devices_cgroup_path(cgroup_file: &str) -> Option<String> {
    for line in cgroup_file.lines() {
        let mut fields = line.splitn(3, ':');
        let _hierarchy_id = fields.next()?;
        let controllers = fields.next()?;
        let path = fields.next()?;
        if controllers.split(',').any(|c| c == "devices") {
            return Some(path.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_devices_mount_line() {
        let mountinfo = "25 30 0:22 / /sys/fs/cgroup/devices rw,nosuid - cgroup cgroup rw,devices\n\
                          26 30 0:23 / /sys/fs/cgroup/cpu rw,nosuid - cgroup cgroup rw,cpu\n";
        let (root, point) = find_devices_mount(mountinfo).unwrap();
        assert_eq!(root, "/");
        assert_eq!(point, "/sys/fs/cgroup/devices");
    }

    #[test]
    fn finds_devices_cgroup_path() {
        let cgroup_file = "9:devices:/docker/abc123\n8:cpu,cpuacct:/docker/abc123\n";
        assert_eq!(find_devices_cgroup_path(cgroup_file).unwrap(), "/docker/abc123");
    }

    #[test]
    fn composes_allow_line() {
        let cgroup = DevicesCgroup { path: PathBuf::from("/sys/fs/cgroup/devices/docker/abc") };
        assert_eq!(cgroup.path().to_str().unwrap(), "/sys/fs/cgroup/devices/docker/abc");
    }
}
