//! ROCR/AMDGPU device enumeration, shared by the mount hook's GPU device
//! injection (spec section 4, overview table's "Hook: ... AMDGPU").
//!
//! ROCm exposes one `/dev/kfd` control node shared by every GPU plus one
//! `/dev/dri/renderD<N>` node per card; a container needs both to use the
//! card.

use std::path::{Path, PathBuf};

/// The ROCR device nodes a container needs to use the host's GPUs: the
/// shared `/dev/kfd` control node plus one render node per visible card.
#[derive(Debug, Clone)]
pub struct RocrDevices {
    pub kfd: PathBuf,
    pub render_nodes: Vec<PathBuf>,
}

/// Enumerates `/dev/dri/renderD<N>` nodes under `dev_dri`, restricted to
/// `visible_devices` if non-empty (as `ROCR_VISIBLE_DEVICES`/
/// `HIP_VISIBLE_DEVICES` would restrict them), pairing them with
/// `dev_kfd`.
pub fn discover(dev_kfd: &Path, dev_dri: &Path, visible_devices: &[u32]) -> Option<RocrDevices> {
    if !dev_kfd.exists() {
        return None;
    }
    let mut render_nodes: Vec<(u32, PathBuf)> = std::fs::read_dir(dev_dri)
        .ok()?
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let name = entry.file_name();
            let name = name.to_str()?;
            let index: u32 = name.strip_prefix("renderD")?.parse().ok()?;
            Some((index, entry.path()))
        })
        .collect();
    render_nodes.sort_by_key(|(index, _)| *index);

    let selected: Vec<PathBuf> = if visible_devices.is_empty() {
        render_nodes.into_iter().map(|(_, path)| path).collect()
    } else {
        render_nodes.into_iter().filter(|(index, _)| visible_devices.contains(index)).map(|(_, path)| path).collect()
    };

    if selected.is_empty() {
        return None;
    }
    Some(RocrDevices { kfd: dev_kfd.to_path_buf(), render_nodes: selected })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovers_all_render_nodes_when_unrestricted() {
        let tmp = tempfile::tempdir().unwrap();
        let dev_dri = tmp.path().join("dri");
        std::fs::create_dir_all(&dev_dri).unwrap();
        std::fs::write(dev_dri.join("renderD128"), []).unwrap();
        std::fs::write(dev_dri.join("renderD129"), []).unwrap();
        std::fs::write(dev_dri.join("card0"), []).unwrap();
        let kfd = tmp.path().join("kfd");
        std::fs::write(&kfd, []).unwrap();

        let devices = discover(&kfd, &dev_dri, &[]).unwrap();
        assert_eq!(devices.render_nodes.len(), 2);
    }

    #[test]
    fn restricts_to_visible_devices() {
        let tmp = tempfile::tempdir().unwrap();
        let dev_dri = tmp.path().join("dri");
        std::fs::create_dir_all(&dev_dri).unwrap();
        std::fs::write(dev_dri.join("renderD128"), []).unwrap();
        std::fs::write(dev_dri.join("renderD129"), []).unwrap();
        let kfd = tmp.path().join("kfd");
        std::fs::write(&kfd, []).unwrap();

        let devices = discover(&kfd, &dev_dri, &[129]).unwrap();
        assert_eq!(devices.render_nodes, vec![dev_dri.join("renderD129")]);
    }

    #[test]
    fn none_when_kfd_missing() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(discover(&tmp.path().join("kfd"), &tmp.path().join("dri"), &[]).is_none());
    }
}
