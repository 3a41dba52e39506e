//! Persistent identity store for a working tree.
//!
//! # Overview
//!
//! [`Inventory`] records every versioned node of a tree as an
//! [`InventoryEntry`] keyed by its [`FileId`]: the node's name, the file id of
//! its parent directory, its kind, its executable bit and (for nested trees)
//! the pinned revision. Paths are never stored; they are derived from the
//! parent chain, so renaming a directory implicitly moves everything below it.
//!
//! A reverse `path → FileId` index is rebuilt after every mutation so both
//! lookups are O(log n).
//!
//! # Deltas
//!
//! The transform engine never edits entries one by one. It produces an
//! [`InventoryDelta`] list and hands it to [`Inventory::apply_delta`], which
//! validates the complete result before committing it: either every change in
//! the delta lands, or none does.
//!
//! # File format
//!
//! `.brz/inventory` is a JSON array of entries sorted by path:
//!
//! ```json
//! [
//!   {"file_id": "TREE_ROOT", "parent_id": null, "name": "", "kind": "directory"},
//!   {"file_id": "hello-id", "parent_id": "TREE_ROOT", "name": "hello", "kind": "file"}
//! ]
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::{FileId, Kind, RevisionId};

// ---------------------------------------------------------------------------
// Entries and deltas
// ---------------------------------------------------------------------------

/// A single versioned node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryEntry {
    pub file_id: FileId,
    /// `None` only for the tree root.
    pub parent_id: Option<FileId>,
    /// Basename; the empty string for the tree root.
    pub name: String,
    pub kind: Kind,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub executable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_revision: Option<RevisionId>,
}

impl InventoryEntry {
    /// Create an entry with default executable bit and no reference.
    #[must_use]
    pub fn new(file_id: FileId, parent_id: Option<FileId>, name: &str, kind: Kind) -> Self {
        Self {
            file_id,
            parent_id,
            name: name.to_owned(),
            kind,
            executable: false,
            reference_revision: None,
        }
    }
}

/// One change to an inventory.
///
/// `old_path` is the path the file id had before the change (`None` for an
/// addition); `entry` is its new state (`None` for a removal).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InventoryDelta {
    pub old_path: Option<String>,
    pub new_path: Option<String>,
    pub file_id: FileId,
    pub entry: Option<InventoryEntry>,
}

// ---------------------------------------------------------------------------
// Inventory
// ---------------------------------------------------------------------------

/// Versioned nodes of a tree, keyed by persistent identity.
///
/// Invariants maintained by all mutating methods:
/// - There is at most one root (an entry with no parent).
/// - Every non-root entry's parent exists and is directory-like.
/// - No two siblings share a name.
/// - The reverse path index is consistent with the parent chain.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Inventory {
    entries: BTreeMap<FileId, InventoryEntry>,
    by_path: BTreeMap<String, FileId>,
    paths: BTreeMap<FileId, String>,
}

impl Inventory {
    /// Create an empty inventory (no root).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an inventory holding only a root directory.
    #[must_use]
    pub fn with_root(root_id: FileId) -> Self {
        let mut inv = Self::new();
        inv.entries.insert(
            root_id.clone(),
            InventoryEntry::new(root_id.clone(), None, "", Kind::Directory),
        );
        inv.by_path.insert(String::new(), root_id.clone());
        inv.paths.insert(root_id, String::new());
        inv
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    /// The root's file id, if the tree root is versioned.
    #[must_use]
    pub fn root_id(&self) -> Option<&FileId> {
        self.by_path.get("")
    }

    #[must_use]
    pub fn get(&self, file_id: &FileId) -> Option<&InventoryEntry> {
        self.entries.get(file_id)
    }

    #[must_use]
    pub fn path2id(&self, path: &str) -> Option<&FileId> {
        self.by_path.get(path)
    }

    #[must_use]
    pub fn id2path(&self, file_id: &FileId) -> Option<&str> {
        self.paths.get(file_id).map(String::as_str)
    }

    #[must_use]
    pub fn entry_by_path(&self, path: &str) -> Option<&InventoryEntry> {
        self.path2id(path).and_then(|id| self.entries.get(id))
    }

    /// Children of a directory, sorted by name.
    #[must_use]
    pub fn children(&self, file_id: &FileId) -> Vec<&InventoryEntry> {
        let mut children: Vec<&InventoryEntry> = self
            .entries
            .values()
            .filter(|e| e.parent_id.as_ref() == Some(file_id))
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        children
    }

    #[must_use]
    pub fn all_file_ids(&self) -> BTreeSet<FileId> {
        self.entries.keys().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over `(path, entry)` pairs in sorted path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &InventoryEntry)> {
        self.by_path
            .iter()
            .filter_map(|(p, id)| self.entries.get(id).map(|e| (p.as_str(), e)))
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    /// Version the node at `path`, whose parent directory must already be
    /// versioned.
    ///
    /// # Errors
    /// - [`InventoryError::PathAlreadyTracked`] if `path` is versioned.
    /// - [`InventoryError::DuplicateFileId`] if `file_id` is in use.
    /// - [`InventoryError::MissingParent`] if the parent is unversioned.
    pub fn add_path(&mut self, path: &str, kind: Kind, file_id: FileId) -> Result<(), InventoryError> {
        if self.by_path.contains_key(path) {
            return Err(InventoryError::PathAlreadyTracked(path.to_owned()));
        }
        let (dir, name) = split_path(path);
        let parent_id = self
            .by_path
            .get(dir)
            .cloned()
            .ok_or_else(|| InventoryError::MissingParent(path.to_owned()))?;
        let entry = InventoryEntry::new(file_id.clone(), Some(parent_id), name, kind);
        self.apply_delta(&[InventoryDelta {
            old_path: None,
            new_path: Some(path.to_owned()),
            file_id,
            entry: Some(entry),
        }])
    }

    /// Apply a list of changes atomically.
    ///
    /// All removals (entries with an `old_path`) are processed before any
    /// insertion, so a delta may freely move ids between paths. The result is
    /// validated as a whole; on error the inventory is left untouched.
    ///
    /// # Errors
    /// Returns [`InventoryError::InconsistentDelta`] if an `old_path` does not
    /// match the current state, or any structural invariant is broken by the
    /// resulting inventory.
    pub fn apply_delta(&mut self, delta: &[InventoryDelta]) -> Result<(), InventoryError> {
        let mut entries = self.entries.clone();
        for change in delta {
            if let Some(old_path) = &change.old_path {
                if self.id2path(&change.file_id) != Some(old_path.as_str()) {
                    return Err(InventoryError::InconsistentDelta {
                        path: old_path.clone(),
                        reason: format!("{} is not versioned at this path", change.file_id),
                    });
                }
                entries.remove(&change.file_id);
            }
        }
        for change in delta {
            if let Some(entry) = &change.entry {
                if entry.file_id != change.file_id {
                    return Err(InventoryError::InconsistentDelta {
                        path: change.new_path.clone().unwrap_or_default(),
                        reason: "entry file id does not match delta file id".to_owned(),
                    });
                }
                if entries.insert(entry.file_id.clone(), entry.clone()).is_some() {
                    return Err(InventoryError::DuplicateFileId(entry.file_id.clone()));
                }
            }
        }
        let (by_path, paths) = build_paths(&entries)?;
        for change in delta {
            if let (Some(new_path), Some(_)) = (&change.new_path, &change.entry)
                && paths.get(&change.file_id) != Some(new_path)
            {
                return Err(InventoryError::InconsistentDelta {
                    path: new_path.clone(),
                    reason: format!(
                        "{} resolves to {:?}",
                        change.file_id,
                        paths.get(&change.file_id)
                    ),
                });
            }
        }
        self.entries = entries;
        self.by_path = by_path;
        self.paths = paths;
        Ok(())
    }

    /// Set the executable flag on a versioned file.
    ///
    /// # Errors
    /// Returns [`InventoryError::NotTracked`] if `file_id` is unknown.
    pub fn set_executable(&mut self, file_id: &FileId, executable: bool) -> Result<(), InventoryError> {
        let entry = self
            .entries
            .get_mut(file_id)
            .ok_or_else(|| InventoryError::NotTracked(file_id.clone()))?;
        entry.executable = executable;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Load an inventory file. A missing file yields an empty inventory.
    ///
    /// # Errors
    /// Returns [`InventoryError::Io`] on I/O failure (other than not-found),
    /// [`InventoryError::Json`] on parse failure, or a structural error if the
    /// records do not form a valid tree.
    pub fn load(path: &Path) -> Result<Self, InventoryError> {
        match fs::read_to_string(path) {
            Ok(content) => {
                let records: Vec<InventoryEntry> = serde_json::from_str(&content)?;
                let mut entries = BTreeMap::new();
                for record in records {
                    let id = record.file_id.clone();
                    if entries.insert(id.clone(), record).is_some() {
                        return Err(InventoryError::DuplicateFileId(id));
                    }
                }
                let (by_path, paths) = build_paths(&entries)?;
                Ok(Self {
                    entries,
                    by_path,
                    paths,
                })
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(InventoryError::Io(e)),
        }
    }

    /// Save atomically: write `<path>.tmp`, then rename over `path`.
    ///
    /// # Errors
    /// Returns [`InventoryError::Io`] or [`InventoryError::Json`].
    pub fn save(&self, path: &Path) -> Result<(), InventoryError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let records: Vec<&InventoryEntry> = self.iter().map(|(_, e)| e).collect();
        let json = serde_json::to_string_pretty(&records)?;
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, json)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

/// Split a tree-relative path into `(dirname, basename)`.
#[must_use]
pub fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => ("", path),
    }
}

/// Join a tree-relative directory and a child name.
#[must_use]
pub fn join_path(parent: &str, child: &str) -> String {
    if parent.is_empty() {
        child.to_owned()
    } else {
        format!("{parent}/{child}")
    }
}

type PathIndex = (BTreeMap<String, FileId>, BTreeMap<FileId, String>);

/// Derive every entry's path from the parent chain, validating structure.
fn build_paths(entries: &BTreeMap<FileId, InventoryEntry>) -> Result<PathIndex, InventoryError> {
    let mut children: BTreeMap<&FileId, Vec<&InventoryEntry>> = BTreeMap::new();
    let mut roots = Vec::new();
    for entry in entries.values() {
        match &entry.parent_id {
            None => roots.push(entry),
            Some(parent) => children.entry(parent).or_default().push(entry),
        }
    }
    if roots.len() > 1 {
        return Err(InventoryError::InconsistentDelta {
            path: String::new(),
            reason: format!("{} root entries", roots.len()),
        });
    }
    let mut by_path = BTreeMap::new();
    let mut paths = BTreeMap::new();
    let mut queue: Vec<(&InventoryEntry, String)> =
        roots.into_iter().map(|r| (r, String::new())).collect();
    while let Some((entry, path)) = queue.pop() {
        if let Some(kids) = children.get(&entry.file_id) {
            if !entry.kind.is_directory_like() {
                return Err(InventoryError::ParentNotDirectory(path));
            }
            let mut names = BTreeSet::new();
            for kid in kids {
                if !names.insert(kid.name.as_str()) {
                    return Err(InventoryError::PathAlreadyTracked(join_path(&path, &kid.name)));
                }
                queue.push((kid, join_path(&path, &kid.name)));
            }
        }
        by_path.insert(path.clone(), entry.file_id.clone());
        paths.insert(entry.file_id.clone(), path);
    }
    if paths.len() != entries.len() {
        let orphan = entries
            .keys()
            .find(|id| !paths.contains_key(*id))
            .cloned()
            .unwrap_or_else(|| FileId::new(""));
        return Err(InventoryError::Unreachable(orphan));
    }
    Ok((by_path, paths))
}

// ---------------------------------------------------------------------------
// InventoryError
// ---------------------------------------------------------------------------

/// Errors produced by [`Inventory`] operations.
#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("path already versioned: {0}")]
    PathAlreadyTracked(String),

    #[error("file id not versioned: {0}")]
    NotTracked(FileId),

    #[error("duplicate file id: {0}")]
    DuplicateFileId(FileId),

    #[error("parent directory of {0} is not versioned")]
    MissingParent(String),

    #[error("{0} is not a directory, but has versioned children")]
    ParentNotDirectory(String),

    /// The entry's parent chain never reaches the root (missing parent or loop).
    #[error("entry {0} is not reachable from the tree root")]
    Unreachable(FileId),

    #[error("inconsistent inventory delta at {path:?}: {reason}")]
    InconsistentDelta { path: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::all, clippy::pedantic, clippy::nursery)]
mod tests {
    use super::*;

    fn sample() -> Inventory {
        let mut inv = Inventory::with_root(FileId::new("root"));
        inv.add_path("dir", Kind::Directory, FileId::new("dir-id")).unwrap();
        inv.add_path("dir/a", Kind::File, FileId::new("a-id")).unwrap();
        inv.add_path("b", Kind::File, FileId::new("b-id")).unwrap();
        inv
    }

    #[test]
    fn paths_follow_parent_chain() {
        let inv = sample();
        assert_eq!(inv.id2path(&FileId::new("a-id")), Some("dir/a"));
        assert_eq!(inv.path2id("b"), Some(&FileId::new("b-id")));
        assert_eq!(inv.root_id(), Some(&FileId::new("root")));
        assert_eq!(inv.len(), 4);
    }

    #[test]
    fn add_path_rejects_unversioned_parent() {
        let mut inv = sample();
        let err = inv.add_path("nope/x", Kind::File, FileId::new("x")).unwrap_err();
        assert!(matches!(err, InventoryError::MissingParent(_)));
    }

    #[test]
    fn add_path_rejects_duplicates() {
        let mut inv = sample();
        assert!(matches!(
            inv.add_path("b", Kind::File, FileId::new("other")),
            Err(InventoryError::PathAlreadyTracked(_))
        ));
        assert!(matches!(
            inv.add_path("c", Kind::File, FileId::new("b-id")),
            Err(InventoryError::DuplicateFileId(_))
        ));
    }

    #[test]
    fn renaming_directory_moves_children() {
        let mut inv = sample();
        let mut entry = inv.get(&FileId::new("dir-id")).unwrap().clone();
        entry.name = "renamed".to_owned();
        inv.apply_delta(&[InventoryDelta {
            old_path: Some("dir".to_owned()),
            new_path: Some("renamed".to_owned()),
            file_id: FileId::new("dir-id"),
            entry: Some(entry),
        }])
        .unwrap();
        assert_eq!(inv.id2path(&FileId::new("a-id")), Some("renamed/a"));
        assert_eq!(inv.path2id("dir/a"), None);
    }

    #[test]
    fn delta_is_all_or_nothing() {
        let mut inv = sample();
        let before = inv.clone();
        // Removing the directory while its child stays is inconsistent.
        let err = inv
            .apply_delta(&[InventoryDelta {
                old_path: Some("dir".to_owned()),
                new_path: None,
                file_id: FileId::new("dir-id"),
                entry: None,
            }])
            .unwrap_err();
        assert!(matches!(err, InventoryError::Unreachable(_)));
        assert_eq!(inv, before);
    }

    #[test]
    fn delta_rejects_stale_old_path() {
        let mut inv = sample();
        let err = inv
            .apply_delta(&[InventoryDelta {
                old_path: Some("wrong".to_owned()),
                new_path: None,
                file_id: FileId::new("b-id"),
                entry: None,
            }])
            .unwrap_err();
        assert!(matches!(err, InventoryError::InconsistentDelta { .. }));
    }

    #[test]
    fn file_parent_is_rejected() {
        let mut inv = sample();
        let err = inv
            .apply_delta(&[InventoryDelta {
                old_path: None,
                new_path: Some("b/c".to_owned()),
                file_id: FileId::new("c-id"),
                entry: Some(InventoryEntry::new(
                    FileId::new("c-id"),
                    Some(FileId::new("b-id")),
                    "c",
                    Kind::File,
                )),
            }])
            .unwrap_err();
        assert!(matches!(err, InventoryError::ParentNotDirectory(_)));
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inventory");
        let mut inv = sample();
        inv.set_executable(&FileId::new("b-id"), true).unwrap();
        inv.save(&path).unwrap();
        let loaded = Inventory::load(&path).unwrap();
        assert_eq!(loaded, inv);
        assert!(loaded.get(&FileId::new("b-id")).unwrap().executable);
    }

    #[test]
    fn load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let inv = Inventory::load(&dir.path().join("absent")).unwrap();
        assert!(inv.is_empty());
        assert_eq!(inv.root_id(), None);
    }

    #[test]
    fn split_and_join_paths() {
        assert_eq!(split_path("a/b/c"), ("a/b", "c"));
        assert_eq!(split_path("top"), ("", "top"));
        assert_eq!(join_path("", "x"), "x");
        assert_eq!(join_path("a", "x"), "a/x");
    }
}
