//! Mount request parsing (spec sections 3, 4.2).

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Which privilege band a mount request was submitted under.
///
/// Site mounts (from the administrator's `sarus.json`) skip destination
/// policy. User mounts (from CLI flags) are checked against the
/// administrator's disallowed-prefix/exact-path lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    Site,
    User,
}

/// Mount flags, composed the way the spec requires: always `MS_REC |
/// MS_PRIVATE`, plus `MS_RDONLY` iff the request asked for `readonly`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountFlags(pub i32);

impl MountFlags {
    pub fn compose(readonly: bool) -> Self {
        let mut flags = (libc::MS_REC | libc::MS_PRIVATE) as i32;
        if readonly {
            flags |= libc::MS_RDONLY as i32;
        }
        Self(flags)
    }

    pub const fn readonly(self) -> bool {
        self.0 & (libc::MS_RDONLY as i32) != 0
    }
}

/// A validated bind mount request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub flags: i32,
}

/// Destination policy applied to user-band mounts.
#[derive(Debug, Clone, Default)]
pub struct DestinationPolicy {
    pub not_allowed_prefixes: Vec<PathBuf>,
    pub not_allowed_paths: Vec<PathBuf>,
}

impl DestinationPolicy {
    fn check(&self, destination: &Path) -> Result<()> {
        for exact in &self.not_allowed_paths {
            if destination == exact {
                return Err(Error::invalid(
                    destination.display().to_string(),
                    format!("destination cannot be '{}'", exact.display()),
                ));
            }
        }
        for prefix in &self.not_allowed_prefixes {
            if destination == prefix || destination.starts_with(prefix) {
                return Err(Error::invalid(
                    destination.display().to_string(),
                    format!("destination cannot be a subdirectory of '{}'", prefix.display()),
                ));
            }
        }
        Ok(())
    }
}

/// Parses a `type=bind,src=..,dst=..[,readonly]`-style mapping (already
/// split into key/value pairs by the excluded CLI layer) into a validated
/// [`Mount`].
///
/// Accepts alias keys `source|src` and `destination|dst|target`. Only
/// `type=bind` is currently supported; any other `type` or unknown key is
/// rejected.
pub fn parse_mount(
    pairs: &[(String, String)],
    band: Band,
    policy: &DestinationPolicy,
) -> Result<Mount> {
    let request = render(pairs);

    let mut source: Option<String> = None;
    let mut destination: Option<String> = None;
    let mut readonly = false;
    let mut mount_type: Option<String> = None;

    for (key, value) in pairs {
        match key.as_str() {
            "type" => mount_type = Some(value.clone()),
            "source" | "src" => source = Some(value.clone()),
            "destination" | "dst" | "target" => destination = Some(value.clone()),
            "readonly" => {
                readonly = matches!(value.as_str(), "" | "true" | "1");
            }
            other => {
                return Err(Error::invalid(request, format!("unknown mount option '{other}'")));
            }
        }
    }

    match mount_type.as_deref() {
        Some("bind") => {}
        Some(other) => {
            return Err(Error::invalid(request, format!("unsupported mount type '{other}'")));
        }
        None => return Err(Error::invalid(request, "missing required 'type' option")),
    }

    let source = source.ok_or_else(|| Error::invalid(request.clone(), "missing 'source'"))?;
    let destination =
        destination.ok_or_else(|| Error::invalid(request.clone(), "missing 'destination'"))?;

    let source = PathBuf::from(source);
    let destination = PathBuf::from(destination);

    require_absolute(&request, "source", &source)?;
    require_absolute(&request, "destination", &destination)?;

    if band == Band::User {
        policy.check(&destination)?;
    }

    Ok(Mount { source, destination, flags: MountFlags::compose(readonly).0 })
}

fn require_absolute(request: &str, which: &str, path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(Error::invalid(request.to_owned(), format!("{which} must not be empty")));
    }
    if !path.is_absolute() {
        return Err(Error::invalid(
            request.to_owned(),
            format!("{which} '{}' must be an absolute path", path.display()),
        ));
    }
    Ok(())
}

fn render(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| if v.is_empty() { k.clone() } else { format!("{k}={v}") })
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn accepts_minimal_bind() {
        let m = parse_mount(
            &pairs(&[("type", "bind"), ("src", "/a"), ("dst", "/b")]),
            Band::User,
            &DestinationPolicy::default(),
        )
        .unwrap();
        assert_eq!(m.source, PathBuf::from("/a"));
        assert_eq!(m.destination, PathBuf::from("/b"));
        assert_eq!(m.flags, (libc::MS_REC | libc::MS_PRIVATE) as i32);
    }

    #[test]
    fn readonly_adds_ms_rdonly() {
        let m = parse_mount(
            &pairs(&[("type", "bind"), ("source", "/a"), ("destination", "/b"), ("readonly", "")]),
            Band::User,
            &DestinationPolicy::default(),
        )
        .unwrap();
        assert_eq!(m.flags, (libc::MS_REC | libc::MS_PRIVATE | libc::MS_RDONLY) as i32);
    }

    #[test]
    fn rejects_relative_paths() {
        let err = parse_mount(
            &pairs(&[("type", "bind"), ("src", "a"), ("dst", "/b")]),
            Band::User,
            &DestinationPolicy::default(),
        )
        .unwrap_err();
        assert!(matches!(err.kind, crate::error::Kind::InvalidRequest { .. }));
    }

    #[test]
    fn rejects_unsupported_type() {
        let err = parse_mount(
            &pairs(&[("type", "tmpfs"), ("src", "/a"), ("dst", "/b")]),
            Band::User,
            &DestinationPolicy::default(),
        )
        .unwrap_err();
        assert!(matches!(err.kind, crate::error::Kind::InvalidRequest { .. }));
    }

    #[test]
    fn user_band_rejects_disallowed_prefix() {
        let policy = DestinationPolicy {
            not_allowed_prefixes: vec![PathBuf::from("/etc")],
            not_allowed_paths: vec![],
        };
        let err = parse_mount(
            &pairs(&[("type", "bind"), ("src", "/a"), ("dst", "/etc/passwd")]),
            Band::User,
            &policy,
        )
        .unwrap_err();
        let crate::error::Kind::InvalidRequest { reason, .. } = err.kind else { panic!() };
        assert!(reason.contains("subdirectory of '/etc'"));
    }

    #[test]
    fn site_band_skips_destination_policy() {
        let policy = DestinationPolicy {
            not_allowed_prefixes: vec![PathBuf::from("/etc")],
            not_allowed_paths: vec![],
        };
        let m = parse_mount(
            &pairs(&[("type", "bind"), ("src", "/a"), ("dst", "/etc/passwd")]),
            Band::Site,
            &policy,
        )
        .unwrap();
        assert_eq!(m.destination, PathBuf::from("/etc/passwd"));
    }

    #[test]
    fn exact_disallowed_path_is_rejected_even_without_prefix_match() {
        let policy = DestinationPolicy {
            not_allowed_prefixes: vec![],
            not_allowed_paths: vec![PathBuf::from("/opt/sarus")],
        };
        let err = parse_mount(
            &pairs(&[("type", "bind"), ("src", "/a"), ("dst", "/opt/sarus")]),
            Band::User,
            &policy,
        )
        .unwrap_err();
        assert!(matches!(err.kind, crate::error::Kind::InvalidRequest { .. }));
    }
}
