//! Error types for tree transforms.
//!
//! [`TransformError`] is the single error type returned by the transform
//! engine. Structural conflicts are never reported through it during normal
//! detection; they are returned as [`RawConflict`] data and only escalate to
//! [`TransformError::MalformedTransform`] when a caller applies a transform
//! that still has them, or when resolution fails to converge.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::model::inventory::InventoryError;
use crate::model::types::{FileId, TransId};
use crate::transform::conflicts::RawConflict;

/// Convenience alias used throughout the crate.
pub type Result<T, E = TransformError> = std::result::Result<T, E>;

/// Errors returned by tree-transform operations.
#[derive(Debug, Error)]
pub enum TransformError {
    // -- Caller contract violations ------------------------------------------
    /// A ledger attribute was assigned twice for the same key.
    #[error("duplicate key in {table}: {key}")]
    DuplicateKey {
        /// Which attribute map rejected the insert.
        table: &'static str,
        key: String,
    },

    /// The tree root may only be moved with `adjust_root_path`.
    #[error("cannot move the tree root ({trans_id})")]
    CantMoveRoot { trans_id: TransId },

    /// A final path was requested for a node with no final name.
    #[error("no final name for {trans_id}")]
    NoFinalPath { trans_id: TransId },

    /// `apply` was called on a transform that has already been applied.
    #[error("tree transform has already been applied")]
    ReusingTransform,

    /// Two new directories both claim to be the tree root.
    #[error("more than one new tree root: {first} and {second}")]
    TwoRoots { first: TransId, second: TransId },

    /// Cancelling or clearing something that was never staged.
    #[error("{what} is not scheduled for {trans_id}")]
    NotScheduled { trans_id: TransId, what: &'static str },

    /// An operation needed a node that has no content.
    #[error("no such file: {path}")]
    NoSuchFile { path: String },

    /// Reading content back from a transform that cannot hold staged files.
    #[error("operation is not available on a preview transform: {operation}")]
    PreviewNotApplicable { operation: &'static str },

    // -- Pre-existing state ---------------------------------------------------
    /// A previous session left staged content behind.
    #[error(
        "limbo directory {} is not empty; a previous transform was interrupted. \
         Inspect and remove it before retrying.",
        path.display()
    )]
    ExistingLimbo { path: PathBuf },

    /// A previous session left content pending deletion behind.
    #[error(
        "pending-deletion directory {} is not empty; a previous transform was interrupted. \
         Inspect and remove it before retrying.",
        path.display()
    )]
    ExistingPendingDeletion { path: PathBuf },

    /// The limbo directory could not be removed during finalize.
    #[error("unable to delete limbo directory {}", path.display())]
    ImmortalLimbo { path: PathBuf },

    /// The pending-deletion directory could not be removed during finalize.
    #[error("unable to delete pending-deletion directory {}", path.display())]
    ImmortalPendingDeletion { path: PathBuf },

    // -- Locking --------------------------------------------------------------
    /// Another process holds the tree lock.
    #[error("tree at {} is locked by another process", path.display())]
    LockContention { path: PathBuf },

    /// A write operation was attempted without a write lock.
    #[error("tree at {} is not write-locked", path.display())]
    LockNotHeld { path: PathBuf },

    /// A write lock was requested on a tree that only supports reading.
    #[error("tree does not support write locks")]
    ReadOnly,

    // -- Conflicts ------------------------------------------------------------
    /// Conflicts remain (or resolution did not converge).
    #[error("tree transform is malformed: {}", format_conflicts(conflicts))]
    MalformedTransform { conflicts: Vec<RawConflict> },

    /// The configured orphan policy refused to move an orphan.
    #[error("orphaning {path} is not allowed: {reason}")]
    OrphaningForbidden { path: String, reason: String },

    // -- Filesystem -----------------------------------------------------------
    /// A rename target is already occupied.
    #[error("file exists: {}", path.display())]
    FileExists { path: PathBuf },

    /// A rename failed for another reason; the mover has been rolled back.
    #[error(
        "failed to rename {} to {}: {source} (os error {})",
        from.display(),
        to.display(),
        source.raw_os_error().unwrap_or(0)
    )]
    TransformRenameFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A file mover was used after `rollback` or `apply_deletions`.
    #[error("file mover has already been rolled back or committed")]
    MoverSpent,

    /// The filesystem refused to create a hard link.
    #[error("hard links are not supported at {}", path.display())]
    HardLinkNotSupported { path: PathBuf },

    /// A file id could not be found in the source tree.
    #[error("file id {file_id} is not present in the tree")]
    NoSuchId { file_id: FileId },

    // -- Codecs ---------------------------------------------------------------
    /// A serialized transform could not be decoded.
    #[error("corrupt transform records: {reason}")]
    CorruptRecords { reason: String },

    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error("config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A failpoint fired.
    #[cfg(feature = "failpoints")]
    #[error("failpoint {name}: {message}")]
    Failpoint { name: String, message: String },
}

fn format_conflicts(conflicts: &[RawConflict]) -> String {
    conflicts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rename_failure_reports_both_paths_and_errno() {
        let err = TransformError::TransformRenameFailed {
            from: PathBuf::from("/t/a"),
            to: PathBuf::from("/t/b"),
            source: io::Error::from_raw_os_error(13),
        };
        let msg = err.to_string();
        assert!(msg.contains("/t/a"), "{msg}");
        assert!(msg.contains("/t/b"), "{msg}");
        assert!(msg.contains("os error 13"), "{msg}");
    }

    #[test]
    fn existing_limbo_message_is_actionable() {
        let err = TransformError::ExistingLimbo {
            path: PathBuf::from("/t/.brz/limbo"),
        };
        let msg = err.to_string();
        assert!(msg.contains("/t/.brz/limbo"));
        assert!(msg.contains("remove it"));
    }

    #[test]
    fn malformed_lists_conflicts() {
        let err = TransformError::MalformedTransform {
            conflicts: vec![RawConflict::VersioningNoContents {
                trans_id: TransId::numbered(3),
            }],
        };
        assert!(err.to_string().contains("new-3"));
    }
}
