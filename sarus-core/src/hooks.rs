//! OCI hook records: declaration format, lifecycle stages, and trigger
//! conditions (spec sections 3, 6).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;

use crate::error::{Error, Result};

/// Lifecycle stage at which an OCI runtime invokes a hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HookStage {
    Prestart,
    CreateRuntime,
    CreateContainer,
    StartContainer,
    Poststart,
    Poststop,
}

impl HookStage {
    /// Assigns `entries` to this stage's slot on an in-progress
    /// `HooksBuilder`, returning the updated builder.
    pub fn assign(
        self,
        builder: oci_spec::runtime::HooksBuilder,
        entries: Vec<oci_spec::runtime::Hook>,
    ) -> oci_spec::runtime::HooksBuilder {
        match self {
            Self::Prestart => builder.prestart(entries),
            Self::CreateRuntime => builder.create_runtime(entries),
            Self::CreateContainer => builder.create_container(entries),
            Self::StartContainer => builder.start_container(entries),
            Self::Poststart => builder.poststart(entries),
            Self::Poststop => builder.poststop(entries),
        }
    }
}

/// The program invocation a hook declaration names.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct JsonHook {
    pub path: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub timeout: Option<u64>,
}

impl JsonHook {
    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }
}

/// A single `(keyRegex, valueRegex)` annotation-matching pair.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AnnotationMatch {
    pub key_regex: String,
    pub value_regex: String,
}

/// The polymorphic trigger condition for a hook, modeled as an exhaustively
/// matched tagged enum rather than the source's inheritance hierarchy (spec
/// section 9, REDESIGN FLAGS).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "condition", rename_all = "camelCase")]
pub enum Condition {
    /// Always fires.
    Always,
    /// Fires if any of the container's annotations matches every
    /// `(keyRegex, valueRegex)` pair.
    Annotations { matches: Vec<AnnotationMatch> },
    /// Fires if the container's command matches any of the given regexes.
    Commands { patterns: Vec<String> },
    /// Fires if the container config has at least one bind mount.
    HasBindMounts,
}

impl Condition {
    /// Evaluates whether this condition is satisfied for a container whose
    /// annotations, command, and bind-mount-presence are given.
    pub fn matches(&self, annotations: &BTreeMap<String, String>, command: &[String], has_bind_mounts: bool) -> Result<bool> {
        match self {
            Self::Always => Ok(true),
            Self::HasBindMounts => Ok(has_bind_mounts),
            Self::Commands { patterns } => {
                for pattern in patterns {
                    let re = Regex::new(pattern).map_err(|e| Error::invariant(e.to_string()))?;
                    if command.iter().any(|c| re.is_match(c)) {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Self::Annotations { matches } => {
                for m in matches {
                    let key_re = Regex::new(&m.key_regex).map_err(|e| Error::invariant(e.to_string()))?;
                    let value_re = Regex::new(&m.value_regex).map_err(|e| Error::invariant(e.to_string()))?;
                    let hit = annotations
                        .iter()
                        .any(|(k, v)| key_re.is_match(k) && value_re.is_match(v));
                    if !hit {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }
}

/// A fully-parsed OCI hook declaration, as found under the administrator's
/// `hooksDir`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct OciHook {
    /// Path of the declaration file this was loaded from.
    #[serde(skip)]
    pub json_file: PathBuf,
    pub hook: JsonHook,
    pub stages: Vec<HookStage>,
    #[serde(flatten)]
    pub condition: Condition,
}

/// Scans `hooks_dir` for `*.json` declarations, parsing and validating each.
/// A malformed declaration fails the whole scan: a subverted hooks
/// directory should not be able to silently lose coverage.
pub fn load_hooks(hooks_dir: &Path) -> Result<Vec<OciHook>> {
    if !hooks_dir.exists() {
        return Ok(Vec::new());
    }
    let mut hooks = Vec::new();
    for entry in fs::read_dir(hooks_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let data = fs::read_to_string(&path)?;
        let mut hook: OciHook = serde_json::from_str(&data)
            .map_err(|e| Error::invalid(path.display().to_string(), e.to_string()))?;
        hook.json_file = path;
        hooks.push(hook);
    }
    hooks.sort_by(|a, b| a.json_file.cmp(&b.json_file));
    Ok(hooks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn always_condition_always_matches() {
        assert!(Condition::Always.matches(&BTreeMap::new(), &[], false).unwrap());
    }

    #[test]
    fn commands_condition_matches_by_regex() {
        let cond = Condition::Commands { patterns: vec!["^/bin/.*sh$".into()] };
        assert!(cond.matches(&BTreeMap::new(), &["/bin/bash".into()], false).unwrap());
        assert!(!cond.matches(&BTreeMap::new(), &["/usr/bin/python".into()], false).unwrap());
    }

    #[test]
    fn annotations_condition_requires_all_pairs_to_match() {
        let cond = Condition::Annotations {
            matches: vec![AnnotationMatch { key_regex: "^com\\.hooks\\.mpi\\..*".into(), value_regex: ".*".into() }],
        };
        let mut annotations = BTreeMap::new();
        annotations.insert("com.hooks.mpi.enabled".into(), "true".into());
        assert!(cond.matches(&annotations, &[], false).unwrap());
        assert!(!Condition::Annotations {
            matches: vec![AnnotationMatch { key_regex: "^nomatch$".into(), value_regex: ".*".into() }]
        }
        .matches(&annotations, &[], false)
        .unwrap());
    }

    #[test]
    fn has_bind_mounts_condition() {
        assert!(Condition::HasBindMounts.matches(&BTreeMap::new(), &[], true).unwrap());
        assert!(!Condition::HasBindMounts.matches(&BTreeMap::new(), &[], false).unwrap());
    }
}
