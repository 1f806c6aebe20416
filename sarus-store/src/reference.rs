//! OCI image reference parsing.
//!
//! Sarus references are a five-tuple `(server, namespace, image, tag,
//! digest)` rather than the registry/repository split used by most
//! Docker-reference parsers, because the image store indexes entries by a
//! key built from exactly these five fields (see [`Reference::unique_key`]).

use std::fmt;

const DEFAULT_SERVER: &str = "index.docker.io";
const DEFAULT_NAMESPACE: &str = "library";
const DEFAULT_TAG: &str = "latest";

/// A parsed Sarus image reference.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[non_exhaustive]
pub struct Reference {
    /// Registry server hostname (e.g. `index.docker.io`, `ghcr.io`).
    pub server: String,
    /// Namespace / organization (e.g. `library`, `myuser`).
    pub namespace: String,
    /// Image name.
    pub image: String,
    /// Tag, if any. At least one of `tag`/`digest` is set after a successful
    /// [`Reference::parse`] unless the input explicitly carried neither and
    /// the caller is fine with defaulting to `latest` (see `parse`).
    pub tag: Option<String>,
    /// Content digest, if any (e.g. `sha256:abcd...`).
    pub digest: Option<String>,
}

impl Reference {
    /// Parses a reference string of the form
    /// `[server/][namespace/]image[:tag][@digest]`.
    ///
    /// Missing `server` defaults to `index.docker.io`, missing `namespace`
    /// defaults to `library`, and if neither `tag` nor `digest` is present
    /// the tag defaults to `latest`.
    pub fn parse(input: &str) -> crate::Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(crate::Error::InvalidReference("empty reference".into()));
        }

        let (rest, digest) = match trimmed.split_once('@') {
            Some((rest, digest)) => {
                if digest.is_empty() {
                    return Err(crate::Error::InvalidReference(format!(
                        "empty digest in '{trimmed}'"
                    )));
                }
                (rest, Some(digest.to_owned()))
            }
            None => (trimmed, None),
        };

        let (path, tag) = match rest.rsplit_once(':') {
            // A ':' before any '/' is a registry port, not a tag separator.
            Some((path, tag)) if !tag.contains('/') && !path.is_empty() => {
                (path, Some(tag.to_owned()))
            }
            _ => (rest, None),
        };

        let mut segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.is_empty() {
            return Err(crate::Error::InvalidReference(format!(
                "no image name in '{trimmed}'"
            )));
        }
        let image = segments.pop().unwrap().to_owned();

        let (server, namespace) = match segments.len() {
            0 => (DEFAULT_SERVER.to_owned(), DEFAULT_NAMESPACE.to_owned()),
            1 => (DEFAULT_SERVER.to_owned(), segments[0].to_owned()),
            _ => {
                let server = segments.remove(0).to_owned();
                (server, segments.join("/"))
            }
        };

        let tag = match (&tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_owned()),
            _ => tag,
        };

        Ok(Self { server, namespace, image, tag, digest })
    }

    /// The image-store index key: `server/namespace/image/tag`, or
    /// `server/namespace/image/digest-with-colon-replaced-by-dash` if no tag
    /// is present. Errors if neither tag nor digest is set.
    pub fn unique_key(&self) -> crate::Result<String> {
        let suffix = match (&self.tag, &self.digest) {
            (Some(tag), _) => tag.clone(),
            (None, Some(digest)) => digest.replace(':', "-"),
            (None, None) => {
                return Err(crate::Error::InvalidReference(
                    "reference has neither tag nor digest".into(),
                ));
            }
        };
        Ok(format!("{}/{}/{}/{}", self.server, self.namespace, self.image, suffix))
    }

    /// Canonical display form: `server/namespace/image@digest` if a digest is
    /// present, else `server/namespace/image:tag`.
    pub fn normalize(&self) -> String {
        let base = format!("{}/{}/{}", self.server, self.namespace, self.image);
        match (&self.digest, &self.tag) {
            (Some(digest), _) => format!("{base}@{digest}"),
            (None, Some(tag)) => format!("{base}:{tag}"),
            (None, None) => base,
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.normalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bare_name_applies_all_defaults() {
        let r = Reference::parse("alpine").unwrap();
        assert_eq!(r.server, "index.docker.io");
        assert_eq!(r.namespace, "library");
        assert_eq!(r.image, "alpine");
        assert_eq!(r.tag.as_deref(), Some("latest"));
        assert_eq!(r.digest, None);
    }

    #[test]
    fn parse_with_tag() {
        let r = Reference::parse("alpine:3.14").unwrap();
        assert_eq!(r.tag.as_deref(), Some("3.14"));
    }

    #[test]
    fn parse_namespace_and_server() {
        let r = Reference::parse("ghcr.io/org/app:v1").unwrap();
        assert_eq!(r.server, "ghcr.io");
        assert_eq!(r.namespace, "org");
        assert_eq!(r.image, "app");
        assert_eq!(r.tag.as_deref(), Some("v1"));
    }

    #[test]
    fn parse_localhost_registry_port_is_not_a_tag() {
        let r = Reference::parse("localhost:5000/test:v1").unwrap();
        assert_eq!(r.server, "localhost:5000");
        assert_eq!(r.image, "test");
        assert_eq!(r.tag.as_deref(), Some("v1"));
    }

    #[test]
    fn parse_digest() {
        let r = Reference::parse("alpine@sha256:abc123").unwrap();
        assert_eq!(r.digest.as_deref(), Some("sha256:abc123"));
        assert_eq!(r.tag, None);
    }

    #[test]
    fn unique_key_prefers_tag() {
        let r = Reference::parse("alpine:3.14").unwrap();
        assert_eq!(r.unique_key().unwrap(), "index.docker.io/library/alpine/3.14");
    }

    #[test]
    fn unique_key_uses_dashed_digest_without_tag() {
        let mut r = Reference::parse("alpine@sha256:abc123").unwrap();
        r.tag = None;
        assert_eq!(
            r.unique_key().unwrap(),
            "index.docker.io/library/alpine/sha256-abc123"
        );
    }

    #[test]
    fn normalize_prefers_digest_over_tag() {
        let r = Reference {
            server: "index.docker.io".into(),
            namespace: "library".into(),
            image: "alpine".into(),
            tag: Some("3.14".into()),
            digest: Some("sha256:abc123".into()),
        };
        assert_eq!(r.normalize(), "index.docker.io/library/alpine@sha256:abc123");
    }

    #[test]
    fn empty_reference_is_rejected() {
        assert!(Reference::parse("").is_err());
        assert!(Reference::parse("   ").is_err());
    }
}
