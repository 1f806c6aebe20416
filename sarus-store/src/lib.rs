//! Content-addressed squashfs image store for Sarus.
//!
//! Owns the on-disk repository layout described in spec section 6
//! (`<base>/<user>/.sarus/{images,metadata.json}`) and the `metadata.json`
//! index described in section 3, including its locking and
//! garbage-collection invariants (section 4.1, section 8).

mod error;
mod image;
mod lock;
mod reference;
mod store;

pub use error::{Error, Result};
pub use image::{Entry, MetadataDocument, SarusImage, human_size, meta_path, squashfs_path};
pub use lock::Timings as LockTimings;
pub use reference::Reference;
pub use store::Store;
