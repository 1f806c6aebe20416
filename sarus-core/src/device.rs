//! Device mount request parsing (spec sections 3, 4.2).

use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::mount::Mount;

/// Canonical access-letter order: duplicates and other characters are
/// invalid, and the rendered string always follows this order regardless
/// of the order characters appeared in the request.
const CANONICAL_ORDER: [char; 3] = ['r', 'w', 'm'];

/// A device's cgroup access permissions: some non-empty subset of
/// `{r, w, m}`, rendered in canonical `r`,`w`,`m` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access {
    read: bool,
    write: bool,
    mknod: bool,
}

impl Access {
    pub const ALL: Self = Self { read: true, write: true, mknod: true };

    /// Parses an access string such as `"rw"`, `"wmr"`, `"m"`.
    ///
    /// Rejects duplicates, unknown letters, empty input, and input longer
    /// than 3 characters.
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() || s.len() > 3 {
            return Err(Error::invalid(s.to_owned(), "access must be 1 to 3 characters"));
        }
        let mut access = Self { read: false, write: false, mknod: false };
        for c in s.chars() {
            let slot = match c {
                'r' => &mut access.read,
                'w' => &mut access.write,
                'm' => &mut access.mknod,
                other => {
                    return Err(Error::invalid(s.to_owned(), format!("unknown access letter '{other}'")));
                }
            };
            if *slot {
                return Err(Error::invalid(s.to_owned(), format!("duplicate access letter '{c}'")));
            }
            *slot = true;
        }
        Ok(access)
    }

    /// `true` if every character of `s` is a valid access letter (used to
    /// distinguish an access field from a destination path in the 2/3-field
    /// device grammar). Does not itself enforce no-duplicates — that's
    /// [`Access::parse`]'s job once a string is known to be the access field.
    fn looks_like_access(s: &str) -> bool {
        !s.is_empty() && s.len() <= 3 && s.chars().all(|c| CANONICAL_ORDER.contains(&c))
    }

    /// Renders in canonical `r`, `w`, `m` order.
    pub fn string(self) -> String {
        let mut s = String::with_capacity(3);
        if self.read {
            s.push('r');
        }
        if self.write {
            s.push('w');
        }
        if self.mknod {
            s.push('m');
        }
        s
    }
}

impl std::fmt::Display for Access {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.string())
    }
}

/// Device node type, as recorded by `stat(2)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Char,
    Block,
}

impl DeviceType {
    pub const fn letter(self) -> char {
        match self {
            Self::Char => 'c',
            Self::Block => 'b',
        }
    }
}

/// A validated device mount: a bind mount of a device node plus the
/// major/minor/type/access needed to whitelist it in the devices cgroup.
#[derive(Debug, Clone)]
pub struct DeviceMount {
    pub mount: Mount,
    pub major: u32,
    pub minor: u32,
    pub device_type: DeviceType,
    pub access: Access,
}

/// Parses a colon-delimited device request: `source[:destination[:access]]`.
///
/// A two-field form `source:access` is accepted when the second field
/// matches the access grammar; otherwise the second field is the
/// destination. Destination defaults to source; access defaults to `rwm`.
pub fn parse_device(request: &str) -> Result<DeviceMount> {
    let fields: Vec<&str> = request.split(':').collect();
    if fields.is_empty() || fields.len() > 3 || fields[0].is_empty() {
        return Err(Error::invalid(request.to_owned(), "expected 1 to 3 colon-separated fields"));
    }

    let source = fields[0];
    let (destination, access_str) = match fields.len() {
        1 => (source, None),
        2 => {
            if Access::looks_like_access(fields[1]) {
                (source, Some(fields[1]))
            } else {
                (fields[1], None)
            }
        }
        3 => {
            if !Access::looks_like_access(fields[2]) {
                return Err(Error::invalid(
                    request.to_owned(),
                    format!("'{}' is not a valid access specifier", fields[2]),
                ));
            }
            (fields[1], Some(fields[2]))
        }
        _ => unreachable!(),
    };

    let access = match access_str {
        Some(s) => Access::parse(s)?,
        None => Access::ALL,
    };

    let source = PathBuf::from(source);
    let destination = PathBuf::from(destination);
    if !source.is_absolute() {
        return Err(Error::invalid(request.to_owned(), "source must be an absolute path"));
    }
    if !destination.is_absolute() {
        return Err(Error::invalid(request.to_owned(), "destination must be an absolute path"));
    }

    let (major, minor, device_type) = stat_device(request, &source)?;

    Ok(DeviceMount {
        mount: Mount { source, destination, flags: crate::mount::MountFlags::compose(false).0 },
        major,
        minor,
        device_type,
        access,
    })
}

/// `stat`s `path`, requiring it to be a character or block device, and
/// extracts its major/minor from `st_rdev`.
fn stat_device(request: &str, path: &Path) -> Result<(u32, u32, DeviceType)> {
    let meta = fs::symlink_metadata(path)
        .map_err(|e| Error::invalid(request.to_owned(), format!("cannot stat '{}': {e}", path.display())))?;
    let file_type = meta.file_type();

    let device_type = if file_type.is_char_device() {
        DeviceType::Char
    } else if file_type.is_block_device() {
        DeviceType::Block
    } else {
        return Err(Error::invalid(
            request.to_owned(),
            format!("'{}' is not a character or block device", path.display()),
        ));
    };

    let rdev = meta.rdev();
    // major/minor encoding matches glibc's makedev/major/minor macros.
    let major = ((rdev >> 8) & 0xfff) as u32 | (((rdev >> 32) & !0xfff) as u32);
    let minor = (rdev & 0xff) as u32 | (((rdev >> 12) & !0xff) as u32);

    Ok((major, minor, device_type))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_canonicalizes_order() {
        assert_eq!(Access::parse("wmr").unwrap().string(), "rwm");
        assert_eq!(Access::parse("mw").unwrap().string(), "wm");
        assert_eq!(Access::parse("r").unwrap().string(), "r");
    }

    #[test]
    fn access_rejects_duplicates_unknown_empty_and_overlong() {
        assert!(Access::parse("rr").is_err());
        assert!(Access::parse("x").is_err());
        assert!(Access::parse("").is_err());
        assert!(Access::parse("rwmr").is_err());
    }

    #[test]
    fn access_parse_is_idempotent_under_string() {
        for s in ["r", "w", "m", "rw", "rm", "wm", "rwm"] {
            let once = Access::parse(s).unwrap().string();
            let twice = Access::parse(&once).unwrap().string();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn device_not_found_is_invalid_request() {
        let err = parse_device("/nonexistent/device").unwrap_err();
        assert!(matches!(err.kind, crate::error::Kind::InvalidRequest { .. }));
    }

    #[test]
    fn regular_file_is_rejected_as_device() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let path = tmp.path().to_str().unwrap();
        let err = parse_device(path).unwrap_err();
        assert!(matches!(err.kind, crate::error::Kind::InvalidRequest { .. }));
    }

    #[test]
    fn two_field_form_disambiguates_access_vs_destination() {
        // /dev/null exists on every Linux box this runs on.
        let d = parse_device("/dev/null:rw").unwrap();
        assert_eq!(d.mount.destination, PathBuf::from("/dev/null"));
        assert_eq!(d.access.string(), "rw");

        let d = parse_device("/dev/null:/dev/mydev").unwrap();
        assert_eq!(d.mount.destination, PathBuf::from("/dev/mydev"));
        assert_eq!(d.access.string(), "rwm");
    }

    #[test]
    fn three_field_form_requires_valid_access_in_third_position() {
        let d = parse_device("/dev/null:/dev/mydev:rw").unwrap();
        assert_eq!(d.mount.destination, PathBuf::from("/dev/mydev"));
        assert_eq!(d.access.string(), "rw");

        assert!(parse_device("/dev/null:/dev/mydev:bogus").is_err());
    }

    #[test]
    fn single_field_defaults_destination_and_access() {
        let d = parse_device("/dev/null").unwrap();
        assert_eq!(d.mount.destination, PathBuf::from("/dev/null"));
        assert_eq!(d.access.string(), "rwm");
        assert_eq!(d.device_type.letter(), 'c');
    }
}
