//! Tree capability traits.
//!
//! The transform engine never touches a tree's storage directly. It asks a
//! [`Tree`] about the starting state (kinds, contents, versioning) and, when
//! applying to disk, a [`WorkingTree`] for absolute paths and for updating
//! its persistent-identity records.
//!
//! All paths are tree-relative, `/`-separated, with the root as `""`.

use std::collections::BTreeSet;
use std::path::PathBuf;

use sha1::{Digest, Sha1};

use crate::error::{Result, TransformError};
use crate::filters::FilterStack;
use crate::model::inventory::InventoryDelta;
use crate::model::types::{ContentSummary, FileId, Kind, RevisionId};

pub mod disk;
pub mod memory;

pub use disk::DiskTree;
pub use memory::MemoryTree;

/// Read access to a tree.
///
/// Locking methods take `&self`: implementations keep lock state in interior
/// cells so that a transform can hold a shared borrow of its tree for the
/// whole session.
pub trait Tree {
    /// The kind of whatever occupies `path`, or `None` if nothing does.
    fn kind(&self, path: &str) -> Option<Kind>;

    /// The kind recorded for a versioned path. Defaults to [`Tree::kind`].
    fn stored_kind(&self, path: &str) -> Option<Kind> {
        self.kind(path)
    }

    fn path_content_summary(&self, path: &str) -> ContentSummary;

    /// Full content of the file at `path`.
    ///
    /// # Errors
    /// Returns [`TransformError::NoSuchFile`] if there is no file there.
    fn get_file(&self, path: &str) -> Result<Vec<u8>>;

    /// SHA-1 of the file at `path`, as lowercase hex.
    ///
    /// # Errors
    /// Propagates [`Tree::get_file`] errors.
    fn get_file_sha1(&self, path: &str) -> Result<String> {
        Ok(sha1_hex(&self.get_file(path)?))
    }

    /// # Errors
    /// Returns [`TransformError::NoSuchFile`] if `path` is not a symlink.
    fn get_symlink_target(&self, path: &str) -> Result<String>;

    /// The revision a nested tree reference is pinned to.
    ///
    /// # Errors
    /// Returns [`TransformError::NoSuchFile`] if `path` does not exist.
    fn get_reference_revision(&self, path: &str) -> Result<Option<RevisionId>> {
        Err(TransformError::NoSuchFile {
            path: path.to_owned(),
        })
    }

    fn is_executable(&self, path: &str) -> bool;

    fn has_filename(&self, path: &str) -> bool {
        self.kind(path).is_some()
    }

    /// Names of the entries directly inside the directory at `path`,
    /// versioned or not, sorted.
    ///
    /// # Errors
    /// Returns an I/O error if the directory cannot be listed.
    fn list_children(&self, path: &str) -> Result<Vec<String>>;

    fn path2id(&self, path: &str) -> Option<FileId>;

    fn id2path(&self, file_id: &FileId) -> Option<String>;

    fn all_file_ids(&self) -> BTreeSet<FileId>;

    fn is_versioned(&self, path: &str) -> bool {
        self.path2id(path).is_some()
    }

    /// Whether directories are versioned entities on this tree format.
    fn versions_directories(&self) -> bool {
        true
    }

    fn supports_symlinks(&self) -> bool {
        true
    }

    fn case_sensitive(&self) -> bool {
        true
    }

    /// # Errors
    /// Returns [`TransformError::LockContention`] if the lock is unavailable.
    fn lock_read(&self) -> Result<()>;

    /// # Errors
    /// Returns [`TransformError::ReadOnly`] for trees that cannot be written.
    fn lock_write(&self) -> Result<()> {
        Err(TransformError::ReadOnly)
    }

    /// # Errors
    /// Returns [`TransformError::LockNotHeld`] if no lock is held.
    fn unlock(&self) -> Result<()>;
}

/// A tree backed by a real directory that a transform can be applied to.
pub trait WorkingTree: Tree {
    fn as_tree(&self) -> &dyn Tree;

    /// Absolute filesystem path for a tree-relative path.
    fn abspath(&self, path: &str) -> PathBuf;

    /// Absolute path of the control directory (`.brz`).
    fn control_dir(&self) -> PathBuf;

    /// Whether `path` belongs to the control directory.
    fn is_control_filename(&self, path: &str) -> bool;

    /// Update persistent identity records. Requires a write lock.
    ///
    /// # Errors
    /// Returns [`TransformError::LockNotHeld`] without a write lock, or the
    /// inventory error if the delta is inconsistent.
    fn apply_inventory_delta(&self, delta: &[InventoryDelta]) -> Result<()>;

    /// Record the SHA-1 of content just written at `path`.
    ///
    /// # Errors
    /// Implementations may fail if the cache cannot be written.
    fn observed_sha1(&self, path: &str, sha1: &str) -> Result<()>;

    fn supports_executable(&self) -> bool {
        cfg!(unix)
    }

    /// Filters applied when writing content to `path`.
    fn content_filter_stack(&self, _path: &str) -> FilterStack {
        Vec::new()
    }
}

/// Lowercase hex SHA-1 of `bytes`.
#[must_use]
pub fn sha1_hex(bytes: &[u8]) -> String {
    let digest = Sha1::digest(bytes);
    let mut out = String::with_capacity(40);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
