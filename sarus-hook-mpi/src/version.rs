//! Shared-library version model: `libX.so → libX.so.A → libX.so.A.B[...]`,
//! with trailing ABI components treated as an unsigned integer sequence
//! (spec section 4.9).

/// Compatibility mode selecting how strictly a container sibling's version
/// must match the host library being injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompatibilityMode {
    Major,
    Full,
    Strict,
}

impl CompatibilityMode {
    pub fn parse(s: &str) -> Self {
        match s {
            "full" => Self::Full,
            "strict" => Self::Strict,
            _ => Self::Major,
        }
    }
}

/// A parsed version: the unsigned integer sequence following `libX.so.`.
/// Always has at least one component (the major version) once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibVersion {
    pub components: Vec<u64>,
}

impl LibVersion {
    pub fn major(&self) -> u64 {
        self.components[0]
    }

    pub fn minor(&self) -> u64 {
        self.components.get(1).copied().unwrap_or(0)
    }

    pub fn patch(&self) -> Option<u64> {
        self.components.get(2).copied()
    }
}

/// The base name shared by a family of sibling libraries: `libmpi` for
/// `libmpi.so`, `libmpi.so.12`, `libmpi.so.12.0.3`, ....
pub fn family_name(filename: &str) -> Option<&str> {
    let idx = filename.find(".so")?;
    Some(&filename[..idx])
}

/// Parses the version suffix of `filename` given its `family`. Returns
/// `None` for a bare `libX.so` (nothing to compare) or a filename that
/// doesn't belong to `family`.
pub fn parse_version(filename: &str, family: &str) -> Option<LibVersion> {
    let prefix = format!("{family}.so");
    if filename == prefix {
        return None;
    }
    let rest = filename.strip_prefix(&format!("{prefix}."))?;
    let components: Vec<u64> = rest.split('.').map(str::parse).collect::<Result<_, _>>().ok()?;
    if components.is_empty() {
        return None;
    }
    Some(LibVersion { components })
}

/// Outcome of comparing a container sibling's version against the host
/// library's version under a given [`CompatibilityMode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compat {
    /// Versions match exactly (to the precision both specify).
    Equal,
    /// Sibling is usable in place of the host library under this mode.
    Compatible,
    /// Sibling cannot safely be treated as the host library.
    Incompatible,
}

/// Classifies `container` against `host` under `mode`.
pub fn classify(host: &LibVersion, container: &LibVersion, mode: CompatibilityMode) -> Compat {
    match mode {
        CompatibilityMode::Major => {
            if host.major() != container.major() {
                Compat::Incompatible
            } else if host.components == container.components {
                Compat::Equal
            } else {
                Compat::Compatible
            }
        }
        CompatibilityMode::Full => {
            if host.major() != container.major() {
                Compat::Incompatible
            } else if container.minor() > host.minor() {
                Compat::Incompatible
            } else if host.components == container.components {
                Compat::Equal
            } else {
                Compat::Compatible
            }
        }
        CompatibilityMode::Strict => {
            if host.major() != container.major() || host.minor() != container.minor() {
                return Compat::Incompatible;
            }
            match (host.patch(), container.patch()) {
                (Some(h), Some(c)) if h != c => Compat::Incompatible,
                _ => Compat::Equal,
            }
        }
    }
}

/// `true` if `container`'s version sorts strictly after `host`'s,
/// comparing missing trailing components as `0`.
pub fn is_newer(host: &LibVersion, container: &LibVersion) -> bool {
    let len = host.components.len().max(container.components.len());
    for i in 0..len {
        let h = host.components.get(i).copied().unwrap_or(0);
        let c = container.components.get(i).copied().unwrap_or(0);
        if c != h {
            return c > h;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_name_strips_so_suffix() {
        assert_eq!(family_name("libmpi.so.12.0.3"), Some("libmpi"));
        assert_eq!(family_name("libmpi.so"), Some("libmpi"));
    }

    #[test]
    fn parse_version_requires_at_least_major() {
        assert_eq!(parse_version("libmpi.so", "libmpi"), None);
        assert_eq!(parse_version("libmpi.so.12", "libmpi").unwrap().components, vec![12]);
        assert_eq!(parse_version("libmpi.so.12.0.3", "libmpi").unwrap().components, vec![12, 0, 3]);
    }

    #[test]
    fn major_mode_tolerates_any_minor_difference() {
        let host = LibVersion { components: vec![12, 0] };
        let newer = LibVersion { components: vec![12, 5] };
        let older = LibVersion { components: vec![12, 0] };
        assert_eq!(classify(&host, &newer, CompatibilityMode::Major), Compat::Compatible);
        assert_eq!(classify(&host, &older, CompatibilityMode::Major), Compat::Equal);
    }

    #[test]
    fn full_mode_rejects_newer_minor() {
        let host = LibVersion { components: vec![12, 2] };
        let newer = LibVersion { components: vec![12, 5] };
        let older = LibVersion { components: vec![12, 0] };
        assert_eq!(classify(&host, &newer, CompatibilityMode::Full), Compat::Incompatible);
        assert_eq!(classify(&host, &older, CompatibilityMode::Full), Compat::Compatible);
    }

    #[test]
    fn strict_mode_requires_patch_match_when_both_present() {
        let host = LibVersion { components: vec![12, 0, 3] };
        let same = LibVersion { components: vec![12, 0, 3] };
        let diff_patch = LibVersion { components: vec![12, 0, 4] };
        let no_patch = LibVersion { components: vec![12, 0] };
        assert_eq!(classify(&host, &same, CompatibilityMode::Strict), Compat::Equal);
        assert_eq!(classify(&host, &diff_patch, CompatibilityMode::Strict), Compat::Incompatible);
        assert_eq!(classify(&host, &no_patch, CompatibilityMode::Strict), Compat::Equal);
    }

    #[test]
    fn different_major_is_always_incompatible() {
        let host = LibVersion { components: vec![12, 0] };
        let other = LibVersion { components: vec![11, 9] };
        assert_eq!(classify(&host, &other, CompatibilityMode::Major), Compat::Incompatible);
    }

    #[test]
    fn is_newer_compares_missing_components_as_zero() {
        let host = LibVersion { components: vec![12] };
        let newer = LibVersion { components: vec![12, 1] };
        assert!(is_newer(&host, &newer));
        assert!(!is_newer(&newer, &host));
    }
}
