//! Applying a transform to a working tree.
//!
//! Apply runs in a fixed order:
//!
//! 1. Refuse if conflicts remain (unless the caller opts out).
//! 2. Compute the inventory delta while the ledger still describes the
//!    starting tree.
//! 3. Removals, deepest path first: deleted paths are moved into
//!    pending-deletion, moved paths into limbo.
//! 4. Insertions, shallowest path first: limbo entries are renamed to their
//!    final paths. Executable bits are set once every rename has landed.
//! 5. On any failure in 3–4 the changed modes are restored, the mover is
//!    rolled back and the error returned. Otherwise pending deletions are
//!    removed for good.
//! 6. The inventory delta and observed hashes are handed to the tree, and
//!    the transform is finalized.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{Result, TransformError};
use crate::fp;
use crate::model::inventory::{InventoryDelta, InventoryEntry};
use crate::model::types::{FileId, Kind, TransId};
use crate::tree::WorkingTree;

use super::TreeTransform;
use super::mover::{FileMover, Mover};
use super::paths::FinalPaths;

/// Outcome of a successful apply.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransformResult {
    /// Absolute paths that received new content.
    pub modified_paths: Vec<PathBuf>,
    /// Renames performed on the filesystem.
    pub rename_count: usize,
}

/// What the insertion phase placed, and the mode changes still to make.
struct Inserted {
    modified: Vec<PathBuf>,
    placed: Vec<TransId>,
    executable: Vec<(PathBuf, bool)>,
}

impl TreeTransform<'_> {
    /// Apply all staged changes to the working tree, then finalize.
    ///
    /// With `no_conflicts`, the conflict check is skipped; the caller
    /// asserts the transform is clean.
    ///
    /// # Errors
    /// - [`TransformError::PreviewNotApplicable`] on a preview transform.
    /// - [`TransformError::ReusingTransform`] if already applied.
    /// - [`TransformError::MalformedTransform`] if conflicts remain.
    /// - Rename errors, after the tree has been rolled back.
    pub fn apply(&mut self, no_conflicts: bool) -> Result<TransformResult> {
        let mut mover = FileMover::new();
        self.apply_with_mover(no_conflicts, &mut mover)
    }

    /// [`TreeTransform::apply`] with a caller-supplied [`Mover`].
    ///
    /// # Errors
    /// See [`TreeTransform::apply`].
    #[tracing::instrument(skip_all, fields(no_conflicts = no_conflicts))]
    pub fn apply_with_mover(&mut self, no_conflicts: bool, mover: &mut dyn Mover) -> Result<TransformResult> {
        self.ensure_not_done()?;
        let Some(wt) = self.working_tree() else {
            return Err(TransformError::PreviewNotApplicable { operation: "apply" });
        };
        if !no_conflicts {
            let conflicts = self.find_raw_conflicts()?;
            if !conflicts.is_empty() {
                return Err(TransformError::MalformedTransform { conflicts });
            }
        }
        self.rename_count = 0;
        let mut delta = self.generate_inventory_delta()?;

        let mut previous_modes = Vec::new();
        let swapped = self
            .apply_removals(wt, mover)
            .and_then(|()| fp!("FP_APPLY_AFTER_REMOVALS"))
            .and_then(|()| self.apply_insertions(wt, mover))
            .and_then(|inserted| {
                for (path, executable) in &inserted.executable {
                    let previous = set_executable_bit(path, *executable)?;
                    previous_modes.push((path.clone(), previous));
                }
                Ok(inserted)
            })
            .and_then(|inserted| fp!("FP_APPLY_AFTER_INSERTIONS").map(|()| inserted));
        let Inserted {
            modified: modified_paths,
            placed,
            ..
        } = match swapped {
            Ok(inserted) => inserted,
            Err(e) => {
                tracing::warn!(error = %e, "apply failed, rolling back");
                for (path, mode) in previous_modes.iter().rev() {
                    if let Err(restore) = restore_mode(path, *mode) {
                        tracing::error!(error = %restore, path = %path.display(), "mode restore failed");
                    }
                }
                if let Err(rollback) = mover.rollback() {
                    tracing::error!(error = %rollback, "rollback failed");
                }
                self.rename_count = 0;
                return Err(e);
            }
        };
        mover.apply_deletions()?;
        for trans_id in &placed {
            self.limbo.forget(trans_id);
        }

        if self.final_file_id(&self.root()).is_none() {
            delta.retain(|change| change.old_path.as_deref() != Some(""));
        }
        wt.apply_inventory_delta(&delta)?;
        self.apply_observed_sha1s(wt)?;
        self.mark_done();
        tracing::debug!(
            renames = self.rename_count,
            modified = modified_paths.len(),
            delta = delta.len(),
            "tree transform applied"
        );
        self.finalize()?;
        Ok(TransformResult {
            modified_paths,
            rename_count: self.rename_count,
        })
    }

    fn apply_removals(&mut self, wt: &dyn WorkingTree, mover: &mut dyn Mover) -> Result<()> {
        let deletion_dir = self
            .limbo
            .deletion_dir()
            .map(Path::to_owned)
            .ok_or(TransformError::PreviewNotApplicable { operation: "apply" })?;
        let tree_paths: Vec<(String, TransId)> = self
            .ledger
            .tree_path_ids
            .iter()
            .rev()
            .map(|(p, t)| (p.clone(), t.clone()))
            .collect();
        for (path, trans_id) in tree_paths {
            if path.is_empty() {
                continue;
            }
            let full_path = wt.abspath(&path);
            if self.ledger.is_removed(&trans_id) {
                mover.pre_delete(&full_path, &deletion_dir.join(trans_id.as_str()))?;
            } else if self.path_changed(&trans_id) {
                let limbo_path = self.limbo.name(&trans_id, &self.ledger);
                match mover.rename(&full_path, &limbo_path) {
                    Ok(()) => self.rename_count += 1,
                    Err(e) if is_missing_source(&e) => {
                        tracing::debug!(path = %path, "nothing on disk to move");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    fn apply_insertions(&mut self, wt: &dyn WorkingTree, mover: &mut dyn Mover) -> Result<Inserted> {
        let new_paths = self.new_paths(true)?;
        let mut modified = Vec::new();
        let mut executable_bits = Vec::new();
        for (path, trans_id) in &new_paths {
            let full_path = wt.abspath(path);
            if self.limbo.needs_rename().contains(trans_id)
                && let Some(limbo_path) = self.limbo.path_of(trans_id).map(Path::to_owned)
            {
                match mover.rename(&limbo_path, &full_path) {
                    Ok(()) => self.rename_count += 1,
                    Err(e) if is_missing_source(&e) => {
                        tracing::debug!(trans_id = %trans_id, "nothing in limbo to place");
                    }
                    Err(e) => return Err(e),
                }
            }
            if self.ledger.new_contents.contains_key(trans_id) {
                modified.push(full_path.clone());
            }
            if let Some(&executable) = self.ledger.new_executability.get(trans_id)
                && wt.supports_executable()
            {
                executable_bits.push((full_path, executable));
            }
        }
        Ok(Inserted {
            modified,
            placed: new_paths.into_iter().map(|(_, t)| t).collect(),
            executable: executable_bits,
        })
    }

    fn apply_observed_sha1s(&self, wt: &dyn WorkingTree) -> Result<()> {
        let mut paths = FinalPaths::new(&self.ledger);
        for (trans_id, sha1) in &self.ledger.observed_sha1s {
            let path = paths.get_path(trans_id)?;
            wt.observed_sha1(&path, sha1)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Inventory delta
    // -----------------------------------------------------------------------

    /// Nodes whose inventory entry changes: new names, parents, file ids,
    /// executability, kinds, and the tree children of re-identified parents.
    fn inventory_altered(&mut self) -> Result<Vec<(String, TransId)>> {
        let new_file_id: BTreeSet<TransId> = self
            .ledger
            .new_id
            .iter()
            .filter(|(t, f)| self.tree_file_id(t).as_ref() != Some(*f))
            .map(|(t, _)| t.clone())
            .collect();
        let mut changed: BTreeSet<TransId> = self.ledger.new_name.keys().cloned().collect();
        changed.extend(self.ledger.new_parent.keys().cloned());
        changed.extend(new_file_id.iter().cloned());
        changed.extend(self.ledger.new_executability.keys().cloned());
        let changed_kind: Vec<TransId> = self
            .ledger
            .removed_contents
            .iter()
            .filter(|t| self.ledger.new_contents.contains_key(*t) && !changed.contains(*t))
            .filter(|t| self.tree_kind(t) != self.final_kind(t))
            .cloned()
            .collect();
        changed.extend(changed_kind);
        for parent in &new_file_id {
            changed.extend(self.iter_tree_children(parent)?);
        }
        FinalPaths::new(&self.ledger).get_paths(&changed)
    }

    /// The inventory delta this transform implies, removals first.
    ///
    /// # Errors
    /// Returns [`TransformError::NoFinalPath`] for an altered node with no
    /// final path, or an I/O error listing a source directory.
    pub fn generate_inventory_delta(&mut self) -> Result<Vec<InventoryDelta>> {
        let altered = self.inventory_altered()?;
        let tree = self.tree();
        let mut delta = Vec::new();
        for trans_id in &self.ledger.removed_id {
            let file_id = if trans_id == self.ledger.root() {
                tree.path2id("")
            } else {
                self.tree_file_id(trans_id)
            };
            let Some(file_id) = file_id else {
                continue;
            };
            // Moved to another node, not removed.
            if self.ledger.r_new_id.contains_key(&file_id) {
                continue;
            }
            let Some(path) = self.tree_path(trans_id) else {
                continue;
            };
            delta.push(InventoryDelta {
                old_path: Some(path.to_owned()),
                new_path: None,
                file_id,
                entry: None,
            });
        }

        let new_path_file_ids: BTreeMap<&TransId, FileId> = altered
            .iter()
            .filter_map(|(_, t)| self.final_file_id(t).map(|f| (t, f)))
            .collect();
        for (path, trans_id) in &altered {
            let Some(file_id) = new_path_file_ids.get(trans_id).cloned() else {
                continue;
            };
            let old_path = tree.id2path(&file_id);
            let kind = self
                .final_kind(trans_id)
                .or_else(|| old_path.as_deref().and_then(|p| tree.stored_kind(p)));
            let Some(kind) = kind else {
                continue;
            };
            let parent_file_id = self.final_parent(trans_id).and_then(|parent| {
                new_path_file_ids
                    .get(&parent)
                    .cloned()
                    .or_else(|| self.final_file_id(&parent))
            });
            let mut entry = InventoryEntry::new(file_id.clone(), parent_file_id, &self.final_name(trans_id)?, kind);
            if let Some(revision) = self.ledger.new_reference_revision.get(trans_id) {
                entry.kind = Kind::TreeReference;
                entry.reference_revision = Some(revision.clone());
            }
            entry.executable = match self.ledger.new_executability.get(trans_id) {
                Some(&executable) => executable,
                None => kind == Kind::File && self.tree_path(trans_id).is_some_and(|p| tree.is_executable(p)),
            };
            delta.push(InventoryDelta {
                old_path,
                new_path: Some(path.clone()),
                file_id,
                entry: Some(entry),
            });
        }
        Ok(delta)
    }
}

fn is_missing_source(e: &TransformError) -> bool {
    matches!(
        e,
        TransformError::TransformRenameFailed { source, .. } if source.kind() == io::ErrorKind::NotFound
    )
}

/// Turn the owner execute bit on or off, returning the previous mode.
/// Group and other execute bits follow their read bits when turning on.
#[cfg(unix)]
fn set_executable_bit(path: &Path, executable: bool) -> Result<u32> {
    use std::os::unix::fs::PermissionsExt;

    let current = std::fs::metadata(path)?.permissions().mode();
    let mode = if executable {
        let mut mode = current | 0o100;
        if current & 0o040 != 0 {
            mode |= 0o010;
        }
        if current & 0o004 != 0 {
            mode |= 0o001;
        }
        mode
    } else {
        current & !0o111
    };
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(current)
}

#[cfg(unix)]
fn restore_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_executable_bit(_path: &Path, _executable: bool) -> Result<u32> {
    Ok(0)
}

#[cfg(not(unix))]
fn restore_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::tree::{DiskTree, MemoryTree, Tree};

    fn disk_tree() -> (tempfile::TempDir, DiskTree) {
        let dir = tempfile::tempdir().unwrap();
        let tree = DiskTree::init(dir.path()).unwrap();
        (dir, tree)
    }

    #[test]
    fn preview_cannot_be_applied() {
        let tree = MemoryTree::new();
        let mut tt = TreeTransform::preview(&tree).unwrap();
        assert!(matches!(
            tt.apply(false),
            Err(TransformError::PreviewNotApplicable { .. })
        ));
    }

    #[test]
    fn new_file_is_versioned_after_apply() {
        let (dir, tree) = disk_tree();
        let mut tt = TreeTransform::new(&tree).unwrap();
        let root = tt.root();
        tt.new_file("hello", &root, [b"hi\n"], Some(FileId::new("hello-id")), None, None)
            .unwrap();
        let result = tt.apply(false).unwrap();
        assert_eq!(result.rename_count, 1);
        assert_eq!(result.modified_paths, vec![dir.path().join("hello")]);
        assert_eq!(fs::read(dir.path().join("hello")).unwrap(), b"hi\n");
        assert_eq!(tree.path2id("hello"), Some(FileId::new("hello-id")));
        assert!(!dir.path().join(".brz/limbo").exists());
        assert!(!dir.path().join(".brz/pending-deletion").exists());
    }

    #[test]
    fn applying_twice_is_rejected() {
        let (_dir, tree) = disk_tree();
        let mut tt = TreeTransform::new(&tree).unwrap();
        tt.apply(false).unwrap();
        assert!(matches!(tt.apply(false), Err(TransformError::ReusingTransform)));
        tt.finalize().unwrap();
    }

    #[test]
    fn conflicts_block_apply() {
        let (dir, tree) = disk_tree();
        fs::write(dir.path().join("taken"), b"old").unwrap();
        let mut tt = TreeTransform::new(&tree).unwrap();
        let root = tt.root();
        tt.new_file("taken", &root, [b"new"], None, None, None).unwrap();
        assert!(matches!(
            tt.apply(false),
            Err(TransformError::MalformedTransform { .. })
        ));
        tt.finalize().unwrap();
        assert_eq!(fs::read(dir.path().join("taken")).unwrap(), b"old");
    }

    #[test]
    fn delete_and_unversion() {
        let (dir, tree) = disk_tree();
        fs::create_dir(dir.path().join("d")).unwrap();
        fs::write(dir.path().join("d/f"), b"x").unwrap();
        tree.add(&["d", "d/f"]).unwrap();
        let mut tt = TreeTransform::new(&tree).unwrap();
        let d = tt.trans_id_tree_path("d");
        let f = tt.trans_id_tree_path("d/f");
        tt.delete_versioned(&f);
        tt.delete_versioned(&d);
        let result = tt.apply(false).unwrap();
        assert_eq!(result.rename_count, 0);
        assert!(!dir.path().join("d").exists());
        assert_eq!(tree.path2id("d"), None);
        assert_eq!(tree.inventory().len(), 1);
    }

    #[test]
    fn moving_a_directory_carries_its_children() {
        let (dir, tree) = disk_tree();
        fs::create_dir(dir.path().join("d")).unwrap();
        fs::write(dir.path().join("d/f"), b"x").unwrap();
        let ids = tree.add(&["d", "d/f"]).unwrap();
        let mut tt = TreeTransform::new(&tree).unwrap();
        let root = tt.root();
        let d = tt.trans_id_tree_path("d");
        tt.adjust_path("e", &root, &d).unwrap();
        let result = tt.apply(false).unwrap();
        assert_eq!(result.rename_count, 2);
        assert_eq!(fs::read(dir.path().join("e/f")).unwrap(), b"x");
        assert_eq!(tree.path2id("e/f"), Some(ids[1].clone()));
    }

    #[cfg(unix)]
    #[test]
    fn executability_follows_read_bits() {
        use std::os::unix::fs::PermissionsExt;

        let (dir, tree) = disk_tree();
        let path = dir.path().join("script");
        fs::write(&path, b"#!/bin/sh\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o640)).unwrap();
        tree.add(&["script"]).unwrap();
        let mut tt = TreeTransform::new(&tree).unwrap();
        let script = tt.trans_id_tree_path("script");
        tt.set_executability(Some(true), &script).unwrap();
        tt.apply(false).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o750);
        assert!(tree.inventory().entry_by_path("script").unwrap().executable);
    }

    #[cfg(unix)]
    #[test]
    fn failed_mode_change_restores_earlier_ones() {
        use std::os::unix::fs::PermissionsExt;

        let (dir, tree) = disk_tree();
        for name in ["a", "b"] {
            let path = dir.path().join(name);
            fs::write(&path, name).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        }
        tree.add(&["a", "b"]).unwrap();
        let mut tt = TreeTransform::new(&tree).unwrap();
        for name in ["a", "b"] {
            let trans_id = tt.trans_id_tree_path(name);
            tt.set_executability(Some(true), &trans_id).unwrap();
        }
        // "a" is chmodded first; "b" vanishing makes the second change fail.
        fs::remove_file(dir.path().join("b")).unwrap();
        assert!(tt.apply(true).is_err());
        assert_eq!(tt.rename_count(), 0);
        tt.finalize().unwrap();

        let mode = fs::metadata(dir.path().join("a")).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o644);
        assert!(!tree.inventory().entry_by_path("a").unwrap().executable);
    }

    #[test]
    fn observed_sha1_reaches_the_hash_cache() {
        let (_dir, tree) = disk_tree();
        let mut tt = TreeTransform::new(&tree).unwrap();
        let root = tt.root();
        let sha1 = crate::tree::sha1_hex(b"abc");
        tt.new_file("f", &root, [b"abc"], Some(FileId::new("f-id")), None, Some(&sha1))
            .unwrap();
        tt.apply(false).unwrap();
        assert_eq!(tree.path_content_summary("f").sha1, Some(sha1));
    }
}
