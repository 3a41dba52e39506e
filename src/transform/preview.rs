//! Read-only view of a transform's result.
//!
//! [`PreviewTree`] answers [`Tree`] queries for the tree as it would look
//! after the transform, without touching the source tree. The path index is
//! built once when the view is created; contents are read on demand from
//! limbo (new content) or from the source tree (everything else).

use std::collections::{BTreeMap, BTreeSet};
use std::fs;

use crate::error::{Result, TransformError};
use crate::model::inventory::join_path;
use crate::model::types::{ContentSummary, FileId, Kind, RevisionId, TransId};
use crate::tree::{Tree, sha1_hex};

use super::TreeTransform;
use super::ledger::NewContents;

/// The final state of a [`TreeTransform`], as a [`Tree`].
///
/// The view is a snapshot: it borrows the transform, so the transform
/// cannot change while the view is alive.
#[derive(Debug)]
pub struct PreviewTree<'p, 't> {
    tt: &'p TreeTransform<'t>,
    by_path: BTreeMap<String, TransId>,
    paths: BTreeMap<TransId, String>,
    children: BTreeMap<String, Vec<String>>,
}

impl<'t> TreeTransform<'t> {
    /// A read-only view of the tree this transform would produce.
    ///
    /// Nodes with no final content, and nodes not reachable from the root
    /// (orphans, parent loops), are not part of the view.
    ///
    /// # Errors
    /// - [`TransformError::ReusingTransform`] after apply.
    /// - I/O errors listing source directories.
    pub fn get_preview_tree(&mut self) -> Result<PreviewTree<'_, 't>> {
        self.ensure_not_done()?;
        let mut new_children: BTreeMap<TransId, BTreeSet<TransId>> = BTreeMap::new();
        for (child, parent) in &self.ledger.new_parent {
            new_children
                .entry(parent.clone())
                .or_default()
                .insert(child.clone());
        }

        let root = self.root();
        let mut by_path = BTreeMap::new();
        let mut paths = BTreeMap::new();
        let mut children: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut todo = vec![(root, String::new())];
        while let Some((trans_id, path)) = todo.pop() {
            let Some(kind) = self.final_kind(&trans_id) else {
                continue;
            };
            by_path.insert(path.clone(), trans_id.clone());
            paths.insert(trans_id.clone(), path.clone());
            if !kind.is_directory_like() {
                continue;
            }
            let mut kids: BTreeSet<TransId> = self
                .iter_tree_children(&trans_id)?
                .into_iter()
                .filter(|c| !self.ledger.new_parent.contains_key(c))
                .collect();
            if let Some(moved_in) = new_children.get(&trans_id) {
                kids.extend(moved_in.iter().cloned());
            }
            let mut names = Vec::new();
            for child in kids {
                if self.final_kind(&child).is_none() {
                    continue;
                }
                let name = self.final_name(&child)?;
                todo.push((child, join_path(&path, &name)));
                names.push(name);
            }
            names.sort();
            children.insert(path, names);
        }
        tracing::debug!(nodes = paths.len(), "preview tree built");
        Ok(PreviewTree {
            tt: self,
            by_path,
            paths,
            children,
        })
    }
}

impl PreviewTree<'_, '_> {
    /// The trans-id at a final path.
    #[must_use]
    pub fn path2trans_id(&self, path: &str) -> Option<&TransId> {
        self.by_path.get(path)
    }

    /// Every final path, sorted.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.by_path.keys().map(String::as_str)
    }

    fn lookup(&self, path: &str) -> Result<&TransId> {
        self.by_path.get(path).ok_or_else(|| TransformError::NoSuchFile {
            path: path.to_owned(),
        })
    }

    /// Source-tree path of `trans_id`, when its content comes from there.
    fn source_path(&self, trans_id: &TransId) -> Option<&str> {
        if self.tt.ledger.is_removed(trans_id) {
            return None;
        }
        self.tt.tree_path(trans_id)
    }

    fn staged_executable(&self, trans_id: &TransId) -> bool {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            self.tt
                .limbo_path(trans_id)
                .and_then(|p| fs::symlink_metadata(p).ok())
                .is_some_and(|m| m.is_file() && m.permissions().mode() & 0o100 != 0)
        }
        #[cfg(not(unix))]
        {
            let _ = trans_id;
            false
        }
    }
}

impl Tree for PreviewTree<'_, '_> {
    fn kind(&self, path: &str) -> Option<Kind> {
        let trans_id = self.by_path.get(path)?;
        if self.tt.ledger.new_reference_revision.contains_key(trans_id) {
            return Some(Kind::TreeReference);
        }
        self.tt.final_kind(trans_id)
    }

    fn path_content_summary(&self, path: &str) -> ContentSummary {
        let Some(trans_id) = self.by_path.get(path) else {
            return ContentSummary::missing();
        };
        let mut summary = match self.tt.ledger.new_contents(trans_id) {
            Some(NewContents::File) => match self.tt.staged_file_bytes(trans_id) {
                Ok(bytes) => ContentSummary {
                    kind: Some(Kind::File),
                    size: Some(bytes.len() as u64),
                    executable: self.staged_executable(trans_id),
                    sha1: Some(sha1_hex(&bytes)),
                    target: None,
                },
                Err(_) => ContentSummary::missing(),
            },
            Some(NewContents::Symlink { target }) => ContentSummary {
                kind: Some(Kind::Symlink),
                target: Some(target.clone()),
                ..ContentSummary::default()
            },
            Some(contents) => ContentSummary {
                kind: Some(contents.kind()),
                target: self
                    .tt
                    .ledger
                    .new_reference_revision
                    .get(trans_id)
                    .map(ToString::to_string),
                ..ContentSummary::default()
            },
            None => match self.source_path(trans_id) {
                Some(tree_path) => self.tt.tree().path_content_summary(tree_path),
                None => ContentSummary::missing(),
            },
        };
        if let Some(&executable) = self.tt.ledger.new_executability.get(trans_id) {
            summary.executable = executable;
        }
        summary
    }

    fn get_file(&self, path: &str) -> Result<Vec<u8>> {
        let trans_id = self.lookup(path)?;
        match self.tt.ledger.new_contents(trans_id) {
            Some(NewContents::File) => self.tt.staged_file_bytes(trans_id),
            Some(_) => Err(TransformError::NoSuchFile {
                path: path.to_owned(),
            }),
            None => match self.source_path(trans_id) {
                Some(tree_path) => self.tt.tree().get_file(tree_path),
                None => Err(TransformError::NoSuchFile {
                    path: path.to_owned(),
                }),
            },
        }
    }

    fn get_symlink_target(&self, path: &str) -> Result<String> {
        let trans_id = self.lookup(path)?;
        match self.tt.ledger.new_contents(trans_id) {
            Some(NewContents::Symlink { target }) => Ok(target.clone()),
            Some(_) => Err(TransformError::NoSuchFile {
                path: path.to_owned(),
            }),
            None => match self.source_path(trans_id) {
                Some(tree_path) => self.tt.tree().get_symlink_target(tree_path),
                None => Err(TransformError::NoSuchFile {
                    path: path.to_owned(),
                }),
            },
        }
    }

    fn get_reference_revision(&self, path: &str) -> Result<Option<RevisionId>> {
        let trans_id = self.lookup(path)?;
        if let Some(revision) = self.tt.ledger.new_reference_revision.get(trans_id) {
            return Ok(Some(revision.clone()));
        }
        match self.source_path(trans_id) {
            Some(tree_path) => self.tt.tree().get_reference_revision(tree_path),
            None => Ok(None),
        }
    }

    fn is_executable(&self, path: &str) -> bool {
        let Some(trans_id) = self.by_path.get(path) else {
            return false;
        };
        if let Some(&executable) = self.tt.ledger.new_executability.get(trans_id) {
            return executable;
        }
        match self.tt.ledger.new_contents(trans_id) {
            Some(NewContents::File) => self.staged_executable(trans_id),
            Some(_) => false,
            None => self
                .source_path(trans_id)
                .is_some_and(|p| self.tt.tree().is_executable(p)),
        }
    }

    fn list_children(&self, path: &str) -> Result<Vec<String>> {
        self.children
            .get(path)
            .cloned()
            .ok_or_else(|| TransformError::NoSuchFile {
                path: path.to_owned(),
            })
    }

    fn path2id(&self, path: &str) -> Option<FileId> {
        self.tt.final_file_id(self.by_path.get(path)?)
    }

    fn id2path(&self, file_id: &FileId) -> Option<String> {
        self.paths
            .iter()
            .find(|(trans_id, _)| self.tt.final_file_id(trans_id).as_ref() == Some(file_id))
            .map(|(_, path)| path.clone())
    }

    fn all_file_ids(&self) -> BTreeSet<FileId> {
        self.paths
            .keys()
            .filter_map(|trans_id| self.tt.final_file_id(trans_id))
            .collect()
    }

    fn versions_directories(&self) -> bool {
        self.tt.tree().versions_directories()
    }

    fn supports_symlinks(&self) -> bool {
        self.tt.tree().supports_symlinks()
    }

    fn case_sensitive(&self) -> bool {
        self.tt.case_sensitive()
    }

    // The transform already holds a lock on the source tree.
    fn lock_read(&self) -> Result<()> {
        Ok(())
    }

    fn unlock(&self) -> Result<()> {
        Ok(())
    }
}
