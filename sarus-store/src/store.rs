//! The image store: a file-backed registry of local squashfs images and
//! their metadata (spec section 4.1).

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::image::{Entry, MetadataDocument, SarusImage};
use crate::lock::{self, Mode, Timings};
use crate::reference::Reference;

const IMAGES_DIR: &str = "images";
const METADATA_FILE: &str = "metadata.json";

/// A single-repository image store rooted at a directory.
///
/// Layout: `<repo>/images/` holds the `.squashfs`/`.meta` files,
/// `<repo>/metadata.json` is the index.
#[derive(Debug)]
pub struct Store {
    repo: PathBuf,
    timings: Timings,
}

impl Store {
    /// Opens (creating if necessary) a repository rooted at `repo`.
    pub fn open(repo: impl Into<PathBuf>) -> crate::Result<Self> {
        Self::open_with_timings(repo, Timings::default())
    }

    /// Like [`open`](Self::open) with explicit lock timing configuration.
    pub fn open_with_timings(repo: impl Into<PathBuf>, timings: Timings) -> crate::Result<Self> {
        let repo = repo.into();
        fs::create_dir_all(repo.join(IMAGES_DIR))?;
        Ok(Self { repo, timings })
    }

    /// Directory holding `.squashfs`/`.meta` files.
    pub fn images_dir(&self) -> PathBuf {
        self.repo.join(IMAGES_DIR)
    }

    fn metadata_path(&self) -> PathBuf {
        self.repo.join(METADATA_FILE)
    }

    fn metadata_handle(&self) -> crate::Result<File> {
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.metadata_path())?)
    }

    fn read_document(&self) -> crate::Result<MetadataDocument> {
        let path = self.metadata_path();
        if !path.exists() {
            return Ok(MetadataDocument::default());
        }
        let data = fs::read_to_string(&path)?;
        if data.trim().is_empty() {
            return Ok(MetadataDocument::default());
        }
        Ok(serde_json::from_str(&data)?)
    }

    /// Atomically writes the document: write to a randomly-suffixed sibling,
    /// then rename over the real path.
    fn write_document(&self, doc: &MetadataDocument) -> crate::Result<()> {
        let path = self.metadata_path();
        let suffix: u64 = std::process::id() as u64 ^ (&doc as *const _ as u64);
        let tmp = path.with_extension(format!("json.{suffix:x}.tmp"));
        fs::write(&tmp, serde_json::to_string_pretty(doc)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Backing files for an entry, as `(squashfs, meta)`.
    fn backing_files_present(entry: &Entry) -> bool {
        entry.image_path.exists() && entry.metadata_path.exists()
    }

    fn remove_backing_files(entry: &Entry) -> crate::Result<()> {
        if entry.image_path.exists() {
            fs::remove_file(&entry.image_path)?;
        }
        if entry.metadata_path.exists() {
            fs::remove_file(&entry.metadata_path)?;
        }
        Ok(())
    }

    /// Adds `entry` to the index, replacing any existing entry with the same
    /// `uniqueKey`. New entries go to the tail.
    pub fn add_image(&self, entry: Entry) -> crate::Result<()> {
        let handle = self.metadata_handle()?;
        let _guard = lock::acquire(&handle, Mode::Exclusive, self.timings)?;

        let mut doc = self.read_document()?;
        doc.images.retain(|e| e.unique_key != entry.unique_key);
        doc.images.push(entry);
        self.write_document(&doc)
    }

    /// Removes the entry matching `reference`. Backing files are deleted
    /// before the metadata entry, so an interrupted removal leaves only
    /// reachable garbage (an orphaned metadata row, cleaned up by the next
    /// GC pass) rather than an orphaned, unreferenced file.
    pub fn remove_image(&self, reference: &Reference) -> crate::Result<()> {
        let key = reference.unique_key().map_err(|e| crate::Error::InvalidReference(e.to_string()))?;
        let handle = self.metadata_handle()?;
        let _guard = lock::acquire(&handle, Mode::Exclusive, self.timings)?;

        let mut doc = self.read_document()?;
        let Some(pos) = doc.images.iter().position(|e| e.unique_key == key) else {
            return Err(crate::Error::NotFound(reference.normalize()));
        };
        Self::remove_backing_files(&doc.images[pos])?;
        doc.images.remove(pos);
        self.write_document(&doc)
    }

    /// Lists all images, reconciling (garbage-collecting) any entry whose
    /// backing files have disappeared.
    pub fn list_images(&self) -> crate::Result<Vec<SarusImage>> {
        let handle = self.metadata_handle()?;
        let _guard = lock::acquire(&handle, Mode::Exclusive, self.timings)?;

        let mut doc = self.read_document()?;
        let mut stale = false;
        let mut kept = Vec::with_capacity(doc.images.len());

        for entry in std::mem::take(&mut doc.images) {
            if Self::backing_files_present(&entry) {
                kept.push(entry);
            } else {
                stale = true;
                tracing::info!(unique_key = %entry.unique_key, "garbage-collecting stale metadata entry");
            }
        }
        doc.images = kept;
        if stale {
            self.write_document(&doc)?;
        }

        doc.images
            .iter()
            .map(|e| reference_for_entry(e).map(|r| SarusImage::from_entry(r, e)))
            .collect()
    }

    /// Finds an image by reference, garbage-collecting it if its backing
    /// files have disappeared (taking a shared lock first, upgrading to
    /// exclusive only if a GC is actually needed, and re-reading the
    /// document after the upgrade in case another writer intervened).
    pub fn find_image(&self, reference: &Reference) -> crate::Result<SarusImage> {
        let key = reference.unique_key().map_err(|e| crate::Error::InvalidReference(e.to_string()))?;

        {
            let handle = self.metadata_handle()?;
            let _guard = lock::acquire(&handle, Mode::Shared, self.timings)?;
            let doc = self.read_document()?;
            match doc.images.iter().find(|e| e.unique_key == key) {
                Some(entry) if Self::backing_files_present(entry) => {
                    return Ok(SarusImage::from_entry(reference.clone(), entry));
                }
                Some(_) => {} // stale; fall through to the exclusive GC path below.
                None => return Err(crate::Error::NotFound(reference.normalize())),
            }
        }

        let handle = self.metadata_handle()?;
        let _guard = lock::acquire(&handle, Mode::Exclusive, self.timings)?;
        let mut doc = self.read_document()?;
        let Some(pos) = doc.images.iter().position(|e| e.unique_key == key) else {
            return Err(crate::Error::NotFound(reference.normalize()));
        };
        if Self::backing_files_present(&doc.images[pos]) {
            return Ok(SarusImage::from_entry(reference.clone(), &doc.images[pos]));
        }
        let stale = doc.images.remove(pos);
        tracing::info!(unique_key = %stale.unique_key, "garbage-collecting stale metadata entry");
        self.write_document(&doc)?;
        Err(crate::Error::NotFound(reference.normalize()))
    }

    /// `imagesDir / (uniqueKey + ".squashfs")`.
    pub fn squashfs_path(&self, reference: &Reference) -> crate::Result<PathBuf> {
        let key = reference.unique_key().map_err(|e| crate::Error::InvalidReference(e.to_string()))?;
        Ok(crate::image::squashfs_path(&self.images_dir(), &key))
    }

    /// `imagesDir / (uniqueKey + ".meta")`.
    pub fn meta_path(&self, reference: &Reference) -> crate::Result<PathBuf> {
        let key = reference.unique_key().map_err(|e| crate::Error::InvalidReference(e.to_string()))?;
        Ok(crate::image::meta_path(&self.images_dir(), &key))
    }
}

/// Reconstructs a `Reference` from a stored entry's own fields (rather than
/// re-parsing `unique_key`, which would be lossy for digest-only entries).
fn reference_for_entry(entry: &Entry) -> crate::Result<Reference> {
    Ok(Reference {
        server: entry.server.clone(),
        namespace: entry.namespace.clone(),
        image: entry.image.clone(),
        tag: entry.tag.clone(),
        digest: entry.registry_digest.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, dir: &Path) -> Entry {
        // Real unique keys contain '/' (server/namespace/image/tag); the
        // image-pull pipeline (out of scope here) creates the matching
        // directory tree before writing the squashfs file. Flatten for the
        // fixture so the store tests don't need to replicate that.
        let flat = key.replace('/', "_");
        let image_path = dir.join(format!("{flat}.squashfs"));
        let metadata_path = dir.join(format!("{flat}.meta"));
        fs::write(&image_path, b"squashfs").unwrap();
        fs::write(&metadata_path, b"{}").unwrap();
        Entry {
            unique_key: key.to_owned(),
            server: "index.docker.io".into(),
            namespace: "library".into(),
            image: "alpine".into(),
            tag: Some("3.14".into()),
            digest: String::new(),
            registry_digest: None,
            id: "sha256:deadbeef".into(),
            image_path,
            metadata_path,
            datasize: 1024,
            created: "2024-01-01T00:00:00".into(),
        }
    }

    #[test]
    fn add_then_find_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        let reference = Reference::parse("alpine:3.14").unwrap();
        let key = reference.unique_key().unwrap();
        store.add_image(entry(&key, &store.images_dir())).unwrap();

        let found = store.find_image(&reference).unwrap();
        assert_eq!(found.id, "sha256:deadbeef");
    }

    #[test]
    fn add_replaces_existing_entry_with_same_key() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        let reference = Reference::parse("alpine:3.14").unwrap();
        let key = reference.unique_key().unwrap();

        let mut first = entry(&key, &store.images_dir());
        first.id = "sha256:first".into();
        store.add_image(first).unwrap();

        let mut second = entry(&key, &store.images_dir());
        second.id = "sha256:second".into();
        store.add_image(second).unwrap();

        let doc = store.read_document().unwrap();
        assert_eq!(doc.images.len(), 1);
        assert_eq!(doc.images[0].id, "sha256:second");
    }

    #[test]
    fn remove_deletes_backing_files_and_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        let reference = Reference::parse("alpine:3.14").unwrap();
        let key = reference.unique_key().unwrap();
        let e = entry(&key, &store.images_dir());
        let image_path = e.image_path.clone();
        store.add_image(e).unwrap();

        store.remove_image(&reference).unwrap();
        assert!(!image_path.exists());
        assert!(store.find_image(&reference).is_err());
    }

    #[test]
    fn list_garbage_collects_entries_with_missing_backing_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        let reference = Reference::parse("alpine:3.14").unwrap();
        let key = reference.unique_key().unwrap();
        let e = entry(&key, &store.images_dir());
        let image_path = e.image_path.clone();
        store.add_image(e).unwrap();

        fs::remove_file(&image_path).unwrap();

        let images = store.list_images().unwrap();
        assert!(images.is_empty());
        let doc = store.read_document().unwrap();
        assert!(doc.images.is_empty());
    }

    #[test]
    fn find_garbage_collects_stale_entry_and_reports_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        let reference = Reference::parse("alpine:3.14").unwrap();
        let key = reference.unique_key().unwrap();
        let e = entry(&key, &store.images_dir());
        let metadata_path = e.metadata_path.clone();
        store.add_image(e).unwrap();

        fs::remove_file(&metadata_path).unwrap();

        let err = store.find_image(&reference).unwrap_err();
        assert!(matches!(err, crate::Error::NotFound(_)));
        assert!(store.read_document().unwrap().images.is_empty());
    }

    #[test]
    fn no_two_entries_share_a_unique_key_after_repeated_adds() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        let reference = Reference::parse("alpine:3.14").unwrap();
        let key = reference.unique_key().unwrap();
        for i in 0..5 {
            let mut e = entry(&key, &store.images_dir());
            e.id = format!("sha256:{i}");
            store.add_image(e).unwrap();
        }
        let doc = store.read_document().unwrap();
        assert_eq!(doc.images.len(), 1);
    }
}
