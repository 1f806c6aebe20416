//! The Sarus image record and the on-disk metadata document it is indexed
//! in (spec section 3).

use std::path::{Path, PathBuf};

use crate::reference::Reference;

/// A single entry in `metadata.json`.
///
/// Field names mirror the wire format exactly (including the legacy,
/// always-empty `digest` field) so existing repositories deserialize
/// without migration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Entry {
    #[serde(rename = "uniqueKey")]
    pub unique_key: String,
    pub server: String,
    pub namespace: String,
    pub image: String,
    pub tag: Option<String>,
    /// Legacy field, always empty string; retained for on-disk compatibility.
    #[serde(default)]
    pub digest: String,
    #[serde(rename = "registryDigest")]
    pub registry_digest: Option<String>,
    /// sha256 of the image config JSON (the OCI "Image ID").
    pub id: String,
    #[serde(rename = "imagePath")]
    pub image_path: PathBuf,
    #[serde(rename = "metadataPath")]
    pub metadata_path: PathBuf,
    /// Total uncompressed data size, in bytes.
    pub datasize: u64,
    /// RFC 3339 local-time creation timestamp.
    pub created: String,
}

/// The full `metadata.json` document.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct MetadataDocument {
    pub images: Vec<Entry>,
}

/// An image resolved from the store: the metadata entry plus the
/// `Reference` it was looked up by.
#[derive(Debug, Clone)]
pub struct SarusImage {
    pub reference: Reference,
    pub id: String,
    pub registry_digest: Option<String>,
    /// Human-readable data size, e.g. "128.4 MB".
    pub datasize_human: String,
    pub created_local_time: String,
    pub image_file: PathBuf,
    pub metadata_file: PathBuf,
}

impl SarusImage {
    pub(crate) fn from_entry(reference: Reference, entry: &Entry) -> Self {
        Self {
            reference,
            id: entry.id.clone(),
            registry_digest: entry.registry_digest.clone(),
            datasize_human: human_size(entry.datasize),
            created_local_time: entry.created.clone(),
            image_file: entry.image_path.clone(),
            metadata_file: entry.metadata_path.clone(),
        }
    }
}

impl PartialEq for SarusImage {
    /// Equality ignores backing-file paths, per spec section 3.
    fn eq(&self, other: &Self) -> bool {
        self.reference == other.reference
            && self.id == other.id
            && self.registry_digest == other.registry_digest
    }
}

/// Formats a byte count as a human-readable size (`"128.4 MB"`-style).
#[allow(clippy::cast_precision_loss)]
pub fn human_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "kB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1000.0 && unit < UNITS.len() - 1 {
        size /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} {}", UNITS[0])
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}

/// `imagesDir / (uniqueKey + ".squashfs")`.
pub fn squashfs_path(images_dir: &Path, unique_key: &str) -> PathBuf {
    images_dir.join(format!("{unique_key}.squashfs"))
}

/// `imagesDir / (uniqueKey + ".meta")`.
pub fn meta_path(images_dir: &Path, unique_key: &str) -> PathBuf {
    images_dir.join(format!("{unique_key}.meta"))
}
