//! OCI runtime container-state document, read by every hook from stdin
//! (the [runtime-spec state
//! schema](https://github.com/opencontainers/runtime-spec/blob/main/runtime.md#state)).

use std::io::Read;
use std::path::PathBuf;

use serde::Deserialize;

use sarus_core::error::{Error, Result};

/// The document an OCI runtime writes to a hook's stdin.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerState {
    pub oci_version: String,
    pub id: String,
    pub status: String,
    pub pid: i32,
    pub bundle: PathBuf,
    #[serde(default)]
    pub annotations: std::collections::BTreeMap<String, String>,
}

impl ContainerState {
    /// Reads and parses the state document from stdin.
    pub fn from_stdin() -> Result<Self> {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        Self::from_str(&buf)
    }

    /// Parses a state document from an already-read string (used by tests).
    pub fn from_str(data: &str) -> Result<Self> {
        serde_json::from_str(data).map_err(|e| Error::invalid("container state", e.to_string()))
    }

    /// Reads the container's `/proc/<pid>/root`-relative rootfs path — the
    /// path hooks should operate on when they don't join the mount
    /// namespace themselves.
    pub fn proc_root(&self) -> PathBuf {
        PathBuf::from(format!("/proc/{}/root", self.pid))
    }

    /// Path of the `config.json` inside the bundle.
    pub fn config_path(&self) -> PathBuf {
        self.bundle.join("config.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_state_document() {
        let json = r#"{"ociVersion":"1.0.0","id":"abc","status":"created","pid":4242,"bundle":"/run/sarus/abc"}"#;
        let state = ContainerState::from_str(json).unwrap();
        assert_eq!(state.id, "abc");
        assert_eq!(state.pid, 4242);
        assert_eq!(state.proc_root(), PathBuf::from("/proc/4242/root"));
    }
}
