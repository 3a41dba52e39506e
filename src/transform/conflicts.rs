//! Structural conflict detection.
//!
//! Conflicts are data, never errors: [`TreeTransform::find_raw_conflicts`]
//! returns every illegal state it can see and leaves repair to
//! [`resolve_conflicts`](super::resolve::resolve_conflicts).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::types::{FileId, Kind, TransId};

use super::TreeTransform;

/// The kinds of structural conflict, named as they are shown to users.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConflictKind {
    #[serde(rename = "duplicate")]
    Duplicate,
    #[serde(rename = "duplicate id")]
    DuplicateId,
    #[serde(rename = "parent loop")]
    ParentLoop,
    #[serde(rename = "missing parent")]
    MissingParent,
    #[serde(rename = "deleting parent")]
    DeletingParent,
    #[serde(rename = "unversioned parent")]
    UnversionedParent,
    #[serde(rename = "non-directory parent")]
    NonDirectoryParent,
    #[serde(rename = "versioning no contents")]
    VersioningNoContents,
    #[serde(rename = "unversioned executability")]
    UnversionedExecutability,
    #[serde(rename = "non-file executability")]
    NonFileExecutability,
    #[serde(rename = "overwrite")]
    Overwrite,
}

impl ConflictKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Duplicate => "duplicate",
            Self::DuplicateId => "duplicate id",
            Self::ParentLoop => "parent loop",
            Self::MissingParent => "missing parent",
            Self::DeletingParent => "deleting parent",
            Self::UnversionedParent => "unversioned parent",
            Self::NonDirectoryParent => "non-directory parent",
            Self::VersioningNoContents => "versioning no contents",
            Self::UnversionedExecutability => "unversioned executability",
            Self::NonFileExecutability => "non-file executability",
            Self::Overwrite => "overwrite",
        }
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A machine-detected structural violation.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum RawConflict {
    /// Two live nodes share a final name under one parent. `first` sorts
    /// before `second`.
    Duplicate {
        first: TransId,
        second: TransId,
        name: String,
    },
    /// A node is being given a file id the tree already uses elsewhere.
    DuplicateId { existing: TransId, new: TransId },
    ParentLoop { trans_id: TransId },
    /// A node with children will not exist.
    MissingParent { trans_id: TransId },
    /// A directory scheduled for deletion still has children.
    DeletingParent { trans_id: TransId },
    /// An unversioned directory has versioned children.
    UnversionedParent { trans_id: TransId },
    NonDirectoryParent { trans_id: TransId },
    VersioningNoContents { trans_id: TransId },
    UnversionedExecutability { trans_id: TransId },
    NonFileExecutability { trans_id: TransId },
    /// New contents would land on existing content that is not deleted.
    Overwrite { trans_id: TransId, name: String },
}

impl RawConflict {
    #[must_use]
    pub const fn kind(&self) -> ConflictKind {
        match self {
            Self::Duplicate { .. } => ConflictKind::Duplicate,
            Self::DuplicateId { .. } => ConflictKind::DuplicateId,
            Self::ParentLoop { .. } => ConflictKind::ParentLoop,
            Self::MissingParent { .. } => ConflictKind::MissingParent,
            Self::DeletingParent { .. } => ConflictKind::DeletingParent,
            Self::UnversionedParent { .. } => ConflictKind::UnversionedParent,
            Self::NonDirectoryParent { .. } => ConflictKind::NonDirectoryParent,
            Self::VersioningNoContents { .. } => ConflictKind::VersioningNoContents,
            Self::UnversionedExecutability { .. } => ConflictKind::UnversionedExecutability,
            Self::NonFileExecutability { .. } => ConflictKind::NonFileExecutability,
            Self::Overwrite { .. } => ConflictKind::Overwrite,
        }
    }
}

impl fmt::Display for RawConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = self.kind();
        match self {
            Self::Duplicate {
                first,
                second,
                name,
            } => write!(f, "{kind}: {first} and {second} are both named '{name}'"),
            Self::DuplicateId { existing, new } => write!(f, "{kind}: {new} reuses the id of {existing}"),
            Self::Overwrite { trans_id, name } => write!(f, "{kind}: {trans_id} ('{name}')"),
            Self::ParentLoop { trans_id }
            | Self::MissingParent { trans_id }
            | Self::DeletingParent { trans_id }
            | Self::UnversionedParent { trans_id }
            | Self::NonDirectoryParent { trans_id }
            | Self::VersioningNoContents { trans_id }
            | Self::UnversionedExecutability { trans_id }
            | Self::NonFileExecutability { trans_id } => write!(f, "{kind}: {trans_id}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

impl TreeTransform<'_> {
    /// Scan the staged state for structural conflicts.
    ///
    /// Registers the source-tree children of every directory that gains
    /// children or loses content first, so that collisions with untouched
    /// entries are seen.
    ///
    /// # Errors
    /// Returns [`TransformError::ReusingTransform`](crate::error::TransformError::ReusingTransform)
    /// after apply, or an I/O error listing a source directory.
    pub fn find_raw_conflicts(&mut self) -> Result<Vec<RawConflict>> {
        self.ensure_not_done()?;
        self.add_tree_children()?;
        let by_parent = self.by_parent();
        let mut conflicts = Vec::new();
        conflicts.extend(self.unversioned_parents(&by_parent));
        conflicts.extend(self.parent_loops());
        conflicts.extend(self.duplicate_entries(&by_parent));
        conflicts.extend(self.duplicate_ids());
        conflicts.extend(self.parent_type_conflicts(&by_parent));
        conflicts.extend(self.improper_versioning());
        conflicts.extend(self.executability_conflicts());
        conflicts.extend(self.overwrite_conflicts());
        Ok(conflicts)
    }

    fn add_tree_children(&mut self) -> Result<()> {
        let mut parents: BTreeSet<TransId> = self.by_parent().into_keys().collect();
        parents.extend(
            self.ledger
                .removed_contents
                .iter()
                .filter(|t| self.tree_kind(t) == Some(Kind::Directory))
                .cloned(),
        );
        for trans_id in &self.ledger.removed_id {
            let kind = match self.tree_path(trans_id) {
                Some(path) => self.tree().stored_kind(path),
                None => self.tree_kind(trans_id),
            };
            if kind == Some(Kind::Directory) {
                parents.insert(trans_id.clone());
            }
        }
        for parent in &parents {
            self.iter_tree_children(parent)?;
        }
        Ok(())
    }

    fn unversioned_parents(&self, by_parent: &BTreeMap<TransId, BTreeSet<TransId>>) -> Vec<RawConflict> {
        if !self.tree().versions_directories() {
            return Vec::new();
        }
        by_parent
            .iter()
            .filter(|(parent, _)| !parent.is_root_parent() && !self.final_is_versioned(parent))
            .filter(|(_, children)| children.iter().any(|c| self.final_is_versioned(c)))
            .map(|(parent, _)| RawConflict::UnversionedParent {
                trans_id: parent.clone(),
            })
            .collect()
    }

    fn parent_loops(&self) -> Vec<RawConflict> {
        let mut conflicts = Vec::new();
        for trans_id in self.ledger.new_parent.keys() {
            let mut seen = BTreeSet::new();
            let mut current = trans_id.clone();
            while !current.is_root_parent() {
                seen.insert(current.clone());
                let Some(parent) = self.final_parent(&current) else {
                    break;
                };
                if &parent == trans_id {
                    conflicts.push(RawConflict::ParentLoop {
                        trans_id: trans_id.clone(),
                    });
                }
                if seen.contains(&parent) {
                    break;
                }
                current = parent;
            }
        }
        conflicts
    }

    fn duplicate_entries(&self, by_parent: &BTreeMap<TransId, BTreeSet<TransId>>) -> Vec<RawConflict> {
        let mut conflicts = Vec::new();
        if self.ledger.new_name.is_empty() && self.ledger.new_parent.is_empty() {
            return conflicts;
        }
        for children in by_parent.values() {
            let mut name_ids: Vec<(String, &TransId)> = children
                .iter()
                .filter_map(|child| {
                    let name = self.final_name(child).ok()?;
                    let name = if self.case_sensitive() { name } else { name.to_lowercase() };
                    Some((name, child))
                })
                .collect();
            name_ids.sort();
            let mut last: Option<(&str, &TransId)> = None;
            for (name, trans_id) in &name_ids {
                if self.final_kind(trans_id).is_none() && !self.final_is_versioned(trans_id) {
                    continue;
                }
                if let Some((last_name, last_id)) = last
                    && last_name == name
                {
                    conflicts.push(RawConflict::Duplicate {
                        first: last_id.clone(),
                        second: (*trans_id).clone(),
                        name: name.clone(),
                    });
                }
                last = Some((name, trans_id));
            }
        }
        conflicts
    }

    fn duplicate_ids(&mut self) -> Vec<RawConflict> {
        let removed_tree_ids: BTreeSet<FileId> = self
            .ledger
            .removed_id
            .iter()
            .filter_map(|t| self.tree_file_id(t))
            .collect();
        let active: BTreeSet<FileId> = self
            .tree()
            .all_file_ids()
            .into_iter()
            .filter(|id| !removed_tree_ids.contains(id))
            .collect();
        let claimed: Vec<(TransId, FileId)> = self
            .ledger
            .new_id
            .iter()
            .filter(|(_, file_id)| active.contains(*file_id))
            .map(|(t, f)| (t.clone(), f.clone()))
            .collect();
        let mut conflicts = Vec::new();
        for (trans_id, file_id) in claimed {
            let Some(path) = self.tree().id2path(&file_id) else {
                continue;
            };
            let existing = self.trans_id_tree_path(&path);
            if existing != trans_id {
                conflicts.push(RawConflict::DuplicateId {
                    existing,
                    new: trans_id,
                });
            }
        }
        conflicts
    }

    fn parent_type_conflicts(&self, by_parent: &BTreeMap<TransId, BTreeSet<TransId>>) -> Vec<RawConflict> {
        let mut conflicts = Vec::new();
        for (parent, children) in by_parent {
            if parent.is_root_parent() {
                continue;
            }
            if !children.iter().any(|c| self.final_kind(c).is_some()) {
                continue;
            }
            match self.final_kind(parent) {
                None if self.ledger.is_removed(parent) => {
                    conflicts.push(RawConflict::DeletingParent {
                        trans_id: parent.clone(),
                    });
                }
                None => conflicts.push(RawConflict::MissingParent {
                    trans_id: parent.clone(),
                }),
                Some(Kind::Directory) => {}
                Some(_) => conflicts.push(RawConflict::NonDirectoryParent {
                    trans_id: parent.clone(),
                }),
            }
        }
        conflicts
    }

    fn improper_versioning(&self) -> Vec<RawConflict> {
        self.ledger
            .new_id
            .keys()
            .filter(|t| self.final_kind(t).is_none())
            .map(|t| RawConflict::VersioningNoContents { trans_id: t.clone() })
            .collect()
    }

    fn executability_conflicts(&self) -> Vec<RawConflict> {
        let mut conflicts = Vec::new();
        for trans_id in self.ledger.new_executability.keys() {
            if !self.final_is_versioned(trans_id) {
                conflicts.push(RawConflict::UnversionedExecutability {
                    trans_id: trans_id.clone(),
                });
            } else if self.final_kind(trans_id) != Some(Kind::File) {
                conflicts.push(RawConflict::NonFileExecutability {
                    trans_id: trans_id.clone(),
                });
            }
        }
        conflicts
    }

    fn overwrite_conflicts(&self) -> Vec<RawConflict> {
        self.ledger
            .new_contents
            .keys()
            .filter(|t| self.tree_kind(t).is_some() && !self.ledger.is_removed(t))
            .map(|t| RawConflict::Overwrite {
                trans_id: t.clone(),
                name: self.final_name(t).unwrap_or_default(),
            })
            .collect()
    }
}
