//! Versioned changes implied by a transform.

use std::collections::BTreeMap;

use crate::error::Result;
use crate::model::inventory::split_path;
use crate::model::types::{FileId, Kind, TransId};

use super::TreeTransform;
use super::paths::FinalPaths;

/// One versioned node whose state differs between the source tree and the
/// transform's result. Pairs are `(before, after)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeChange {
    pub file_id: FileId,
    pub path: (Option<String>, Option<String>),
    pub changed_content: bool,
    pub versioned: (bool, bool),
    pub parent_id: (Option<FileId>, Option<FileId>),
    pub name: (Option<String>, Option<String>),
    pub kind: (Option<Kind>, Option<Kind>),
    pub executable: (bool, bool),
}

impl TreeChange {
    /// Whether only the location changed.
    #[must_use]
    pub fn is_rename_only(&self) -> bool {
        !self.changed_content
            && self.versioned.0 == self.versioned.1
            && self.executable.0 == self.executable.1
            && (self.parent_id.0 != self.parent_id.1 || self.name.0 != self.name.1)
    }
}

struct Side {
    name: Option<String>,
    parent_id: Option<FileId>,
    kind: Option<Kind>,
    executable: bool,
}

impl TreeTransform<'_> {
    /// Changes to every file id touched by this transform, sorted by
    /// `(old path, new path)`.
    ///
    /// Nodes that are unversioned both before and after are not reported.
    /// Results are meaningless while conflicts remain.
    ///
    /// # Errors
    /// Returns [`TransformError::NoFinalPath`](crate::error::TransformError::NoFinalPath)
    /// if a versioned node has no final path.
    pub fn iter_changes(&self) -> Result<Vec<TreeChange>> {
        let mut from_ids: BTreeMap<FileId, TransId> = BTreeMap::new();
        let mut to_ids: BTreeMap<FileId, TransId> = BTreeMap::new();
        for trans_id in self.ledger.affected_ids() {
            if let Some(file_id) = self.tree_file_id(&trans_id) {
                from_ids.insert(file_id, trans_id.clone());
            }
            if let Some(file_id) = self.final_file_id(&trans_id) {
                to_ids.insert(file_id, trans_id);
            }
        }

        let mut final_paths = FinalPaths::new(&self.ledger);
        let mut file_ids: Vec<&FileId> = from_ids.keys().chain(to_ids.keys()).collect();
        file_ids.sort();
        file_ids.dedup();
        let mut results = Vec::new();
        for file_id in file_ids {
            let from_versioned = from_ids.contains_key(file_id);
            let to_versioned = to_ids.contains_key(file_id);
            let (Some(from_trans_id), Some(to_trans_id)) = (
                from_ids.get(file_id).or_else(|| to_ids.get(file_id)),
                to_ids.get(file_id).or_else(|| from_ids.get(file_id)),
            ) else {
                continue;
            };

            let from_path = if from_versioned {
                self.tree_path(from_trans_id).map(str::to_owned)
            } else {
                None
            };
            let to_path = if to_versioned {
                Some(final_paths.get_path(to_trans_id)?)
            } else {
                None
            };
            let from = self.from_side(from_trans_id);
            let to = self.to_side(to_trans_id, from_trans_id, from.executable)?;

            let changed_content = if from.kind != to.kind {
                true
            } else {
                matches!(to.kind, Some(Kind::File | Kind::Symlink))
                    && (to_trans_id != from_trans_id
                        || self.ledger.new_contents.contains_key(to_trans_id))
            };
            if !changed_content
                && from_versioned == to_versioned
                && from.parent_id == to.parent_id
                && from.name == to.name
                && from.executable == to.executable
            {
                continue;
            }
            results.push(TreeChange {
                file_id: file_id.clone(),
                path: (from_path, to_path),
                changed_content,
                versioned: (from_versioned, to_versioned),
                parent_id: (from.parent_id, to.parent_id),
                name: (from.name, to.name),
                kind: (from.kind, to.kind),
                executable: (from.executable, to.executable),
            });
        }
        results.sort_by(|a, b| {
            let key = |c: &TreeChange| {
                (
                    c.path.0.clone().unwrap_or_default(),
                    c.path.1.clone().unwrap_or_default(),
                )
            };
            key(a).cmp(&key(b))
        });
        Ok(results)
    }

    fn from_side(&self, trans_id: &TransId) -> Side {
        let Some(path) = self.tree_path(trans_id) else {
            return Side {
                name: None,
                parent_id: None,
                kind: None,
                executable: false,
            };
        };
        let kind = self.tree().kind(path);
        Side {
            name: Some(split_path(path).1.to_owned()),
            parent_id: self
                .get_tree_parent(trans_id)
                .and_then(|parent| self.tree_file_id(&parent)),
            kind,
            executable: kind == Some(Kind::File) && self.tree().is_executable(path),
        }
    }

    fn to_side(&self, to_trans_id: &TransId, from_trans_id: &TransId, from_executable: bool) -> Result<Side> {
        let executable = match self.ledger.new_executability.get(to_trans_id) {
            Some(&executable) => executable,
            None if to_trans_id == from_trans_id => from_executable,
            None => false,
        };
        Ok(Side {
            name: Some(self.final_name(to_trans_id)?),
            parent_id: self
                .final_parent(to_trans_id)
                .and_then(|parent| self.final_file_id(&parent)),
            kind: self.final_kind(to_trans_id),
            executable,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::MemoryTree;
    use crate::tree::memory::MEMORY_ROOT_ID;

    fn source() -> MemoryTree {
        let mut tree = MemoryTree::new();
        tree.add_file("a", b"A").add_dir("d").add_file("d/f", b"F");
        tree
    }

    #[test]
    fn empty_transform_has_no_changes() {
        let tree = source();
        let tt = TreeTransform::preview(&tree).unwrap();
        assert!(tt.iter_changes().unwrap().is_empty());
    }

    #[test]
    fn rename_is_reported_without_content_change() {
        let tree = source();
        let mut tt = TreeTransform::preview(&tree).unwrap();
        let root = tt.root();
        let a = tt.trans_id_tree_path("a");
        tt.adjust_path("b", &root, &a).unwrap();
        let changes = tt.iter_changes().unwrap();
        assert_eq!(changes.len(), 1);
        let change = &changes[0];
        assert_eq!(change.file_id, FileId::new("a-id"));
        assert_eq!(change.path, (Some("a".to_owned()), Some("b".to_owned())));
        assert_eq!(change.name, (Some("a".to_owned()), Some("b".to_owned())));
        assert_eq!(
            change.parent_id,
            (Some(FileId::new(MEMORY_ROOT_ID)), Some(FileId::new(MEMORY_ROOT_ID)))
        );
        assert!(change.is_rename_only());
    }

    #[test]
    fn additions_removals_and_modifications() {
        let tree = source();
        let mut tt = TreeTransform::preview(&tree).unwrap();
        let root = tt.root();
        let a = tt.trans_id_tree_path("a");
        tt.delete_versioned(&a);
        let f = tt.trans_id_tree_path("d/f");
        tt.delete_contents(&f);
        tt.create_file([b"F2"], &f, None, None).unwrap();
        tt.new_file("n", &root, [b"N"], Some(FileId::new("n-id")), None, None)
            .unwrap();
        // Unversioned new files are not reported.
        tt.new_file("junk", &root, [b"J"], None, None, None).unwrap();

        let changes = tt.iter_changes().unwrap();
        let paths: Vec<_> = changes.iter().map(|c| c.path.clone()).collect();
        assert_eq!(
            paths,
            vec![
                (None, Some("n".to_owned())),
                (Some("a".to_owned()), None),
                (Some("d/f".to_owned()), Some("d/f".to_owned())),
            ]
        );
        assert_eq!(changes[0].versioned, (false, true));
        assert_eq!(changes[0].kind, (None, Some(Kind::File)));
        assert_eq!(changes[1].versioned, (true, false));
        assert_eq!(changes[1].kind, (Some(Kind::File), None));
        assert!(changes[2].changed_content);
        assert!(!changes[2].is_rename_only());
    }

    #[test]
    fn executability_change_is_reported() {
        let tree = source();
        let mut tt = TreeTransform::preview(&tree).unwrap();
        let a = tt.trans_id_tree_path("a");
        tt.set_executability(Some(true), &a).unwrap();
        let changes = tt.iter_changes().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].executable, (false, true));
        assert!(!changes[0].changed_content);
    }
}
