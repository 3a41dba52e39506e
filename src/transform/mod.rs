//! Tree transforms: staged, conflict-resolving, rollback-safe tree edits.
//!
//! # Overview
//!
//! A [`TreeTransform`] describes how a tree should change. Nodes of the
//! future tree are named by [`TransId`]s: existing paths get one on demand
//! ([`TreeTransform::trans_id_tree_path`]), new nodes get one when created
//! ([`TreeTransform::create_path`]). Every change is recorded in a
//! [`Ledger`]; new content is written straight away into a private limbo
//! directory so that bytes can be staged before final paths are settled.
//!
//! # Lifecycle
//!
//! ```text
//! new / preview ──▶ stage changes ──▶ find_raw_conflicts / resolve_conflicts
//!                                          │
//!                      ┌───────────────────┴──────────────┐
//!                      ▼                                  ▼
//!                 apply (disk)                    get_preview_tree
//!                      │                                  │
//!                      └──────────────▶ finalize ◀────────┘
//! ```
//!
//! A working transform holds a write lock on its tree from construction
//! until [`TreeTransform::finalize`]; a preview transform holds a read lock
//! and never modifies the tree. `finalize` is idempotent and also runs on
//! drop.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

use crate::config::TransformConfig;
use crate::error::{Result, TransformError};
use crate::model::inventory::join_path;
use crate::model::types::{FileId, Kind, RevisionId, TransId};
use crate::tree::{Tree, WorkingTree};

pub mod apply;
pub mod build;
pub mod changes;
pub mod conflicts;
pub mod ledger;
mod limbo;
pub mod mover;
pub mod orphan;
pub mod paths;
pub mod preview;
pub mod resolve;
pub mod serialize;

pub use apply::TransformResult;
pub use build::{create_from_tree, new_by_entry};
pub use changes::TreeChange;
pub use conflicts::{ConflictKind, RawConflict};
pub use ledger::{Ledger, NewContents};
pub use mover::{FileMover, Mover};
pub use orphan::OrphanPolicy;
pub use paths::FinalPaths;
pub use preview::PreviewTree;
pub use resolve::{CookedConflict, ResolvedConflict, conflict_pass, cook_conflicts, resolve_conflicts};

use limbo::Limbo;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Session settings resolved by the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransformOptions {
    pub orphan_policy: OrphanPolicy,
    /// `None` asks the tree.
    pub case_sensitive: Option<bool>,
    pub max_resolution_passes: usize,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self {
            orphan_policy: OrphanPolicy::Conflict,
            case_sensitive: None,
            max_resolution_passes: 10,
        }
    }
}

impl TransformOptions {
    #[must_use]
    pub fn from_config(config: &TransformConfig) -> Self {
        Self {
            orphan_policy: config.orphan_policy(),
            case_sensitive: config.transform.case_sensitive,
            max_resolution_passes: config.transform.max_resolution_passes,
        }
    }
}

// ---------------------------------------------------------------------------
// TreeTransform
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum Backing<'t> {
    Working(&'t dyn WorkingTree),
    Preview(&'t dyn Tree),
}

/// A staged set of changes to a tree.
pub struct TreeTransform<'t> {
    backing: Backing<'t>,
    pub(crate) ledger: Ledger,
    pub(crate) limbo: Limbo,
    options: TransformOptions,
    case_sensitive: bool,
    done: bool,
    finalized: bool,
    pub(crate) rename_count: usize,
}

impl std::fmt::Debug for TreeTransform<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeTransform")
            .field("preview", &self.is_preview())
            .field("ledger", &self.ledger)
            .field("done", &self.done)
            .field("finalized", &self.finalized)
            .finish_non_exhaustive()
    }
}

impl<'t> TreeTransform<'t> {
    /// Start a transform of a working tree with default options.
    ///
    /// # Errors
    /// See [`TreeTransform::with_options`].
    pub fn new(tree: &'t dyn WorkingTree) -> Result<Self> {
        Self::with_options(tree, TransformOptions::default())
    }

    /// Start a transform of a working tree.
    ///
    /// Takes the tree's write lock and creates empty limbo and
    /// pending-deletion directories in its control directory.
    ///
    /// # Errors
    /// - [`TransformError::LockContention`] if the tree is locked elsewhere.
    /// - [`TransformError::ExistingLimbo`] / [`TransformError::ExistingPendingDeletion`]
    ///   if a previous session left content behind. The lock is released.
    pub fn with_options(tree: &'t dyn WorkingTree, options: TransformOptions) -> Result<Self> {
        tree.lock_write()?;
        let case_sensitive = options.case_sensitive.unwrap_or_else(|| tree.case_sensitive());
        let limbo = match Limbo::in_control_dir(&tree.control_dir(), case_sensitive) {
            Ok(limbo) => limbo,
            Err(e) => {
                tree.unlock()?;
                return Err(e);
            }
        };
        tracing::debug!(root = %tree.abspath("").display(), "tree transform started");
        Ok(Self::from_parts(Backing::Working(tree), limbo, options, case_sensitive))
    }

    /// Start a preview transform: changes are staged in a temporary limbo
    /// and can be inspected through [`TreeTransform::get_preview_tree`], but
    /// never applied.
    ///
    /// # Errors
    /// Returns an error if the tree cannot be read-locked or the temporary
    /// directory cannot be created.
    pub fn preview(tree: &'t dyn Tree) -> Result<Self> {
        Self::preview_with_options(tree, TransformOptions::default())
    }

    /// # Errors
    /// See [`TreeTransform::preview`].
    pub fn preview_with_options(tree: &'t dyn Tree, options: TransformOptions) -> Result<Self> {
        tree.lock_read()?;
        let case_sensitive = options.case_sensitive.unwrap_or(true);
        let limbo = match Limbo::temporary(case_sensitive) {
            Ok(limbo) => limbo,
            Err(e) => {
                tree.unlock()?;
                return Err(e);
            }
        };
        Ok(Self::from_parts(Backing::Preview(tree), limbo, options, case_sensitive))
    }

    fn from_parts(
        backing: Backing<'t>,
        limbo: Limbo,
        options: TransformOptions,
        case_sensitive: bool,
    ) -> Self {
        Self {
            backing,
            ledger: Ledger::new(),
            limbo,
            options,
            case_sensitive,
            done: false,
            finalized: false,
            rename_count: 0,
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// The source tree.
    #[must_use]
    pub fn tree(&self) -> &'t dyn Tree {
        match self.backing {
            Backing::Working(wt) => wt.as_tree(),
            Backing::Preview(tree) => tree,
        }
    }

    pub(crate) const fn working_tree(&self) -> Option<&'t dyn WorkingTree> {
        match self.backing {
            Backing::Working(wt) => Some(wt),
            Backing::Preview(_) => None,
        }
    }

    #[must_use]
    pub const fn is_preview(&self) -> bool {
        matches!(self.backing, Backing::Preview(_))
    }

    #[must_use]
    pub const fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    #[must_use]
    pub const fn options(&self) -> &TransformOptions {
        &self.options
    }

    #[must_use]
    pub const fn case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    /// The trans-id of the tree root.
    #[must_use]
    pub fn root(&self) -> TransId {
        self.ledger.root().clone()
    }

    /// Renames performed by the last apply.
    #[must_use]
    pub const fn rename_count(&self) -> usize {
        self.rename_count
    }

    pub(crate) fn ensure_not_done(&self) -> Result<()> {
        if self.done {
            Err(TransformError::ReusingTransform)
        } else {
            Ok(())
        }
    }

    pub(crate) const fn mark_done(&mut self) {
        self.done = true;
    }

    // -----------------------------------------------------------------------
    // Identifier space
    // -----------------------------------------------------------------------

    /// A fresh trans-id with no attributes.
    pub fn assign_id(&mut self) -> TransId {
        self.ledger.assign_id()
    }

    /// The trans-id for a source-tree path (memoised; the path may not exist).
    pub fn trans_id_tree_path(&mut self, path: &str) -> TransId {
        self.ledger.trans_id_tree_path(path)
    }

    /// The trans-id for a persistent file id.
    ///
    /// Ids being versioned by this transform map to their new node; ids in
    /// the tree map to their path; ids present nowhere get a memoised fresh
    /// trans-id.
    pub fn trans_id_file_id(&mut self, file_id: &FileId) -> TransId {
        if let Some(trans_id) = self.ledger.r_new_id.get(file_id) {
            return trans_id.clone();
        }
        if let Some(path) = self.tree().id2path(file_id) {
            return self.trans_id_tree_path(&path);
        }
        if let Some(trans_id) = self.ledger.non_present_ids.get(file_id) {
            return trans_id.clone();
        }
        let trans_id = self.assign_id();
        self.ledger
            .non_present_ids
            .insert(file_id.clone(), trans_id.clone());
        trans_id
    }

    // -----------------------------------------------------------------------
    // Source-tree queries
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn tree_path(&self, trans_id: &TransId) -> Option<&str> {
        self.ledger.tree_path(trans_id)
    }

    #[must_use]
    pub fn get_tree_parent(&self, trans_id: &TransId) -> Option<TransId> {
        self.ledger.get_tree_parent(trans_id)
    }

    /// Kind of the node in the source tree, `None` if absent.
    #[must_use]
    pub fn tree_kind(&self, trans_id: &TransId) -> Option<Kind> {
        self.tree_path(trans_id).and_then(|p| self.tree().kind(p))
    }

    /// File id of the node in the source tree.
    #[must_use]
    pub fn tree_file_id(&self, trans_id: &TransId) -> Option<FileId> {
        let path = self.tree_path(trans_id)?;
        if trans_id == self.ledger.root() {
            return self.tree().path2id("");
        }
        self.tree().path2id(path)
    }

    /// The tree's file id, or the id this transform associated with a
    /// node not present in the tree. May still be active.
    #[must_use]
    pub fn inactive_file_id(&self, trans_id: &TransId) -> Option<FileId> {
        self.tree_file_id(trans_id).or_else(|| {
            self.ledger
                .non_present_ids
                .iter()
                .find(|(_, t)| *t == trans_id)
                .map(|(f, _)| f.clone())
        })
    }

    /// Children of the node in the source tree, registering each one.
    ///
    /// # Errors
    /// Returns an I/O error if the directory cannot be listed.
    pub fn iter_tree_children(&mut self, parent: &TransId) -> Result<Vec<TransId>> {
        let Some(path) = self.tree_path(parent).map(str::to_owned) else {
            return Ok(Vec::new());
        };
        if !self.tree().kind(&path).is_some_and(Kind::is_directory_like) {
            return Ok(Vec::new());
        }
        let names = match self.tree().list_children(&path) {
            Ok(names) => names,
            Err(TransformError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        let working = self.working_tree();
        let mut children = Vec::with_capacity(names.len());
        for name in names {
            let child_path = join_path(&path, &name);
            if working.is_some_and(|wt| wt.is_control_filename(&child_path)) {
                continue;
            }
            children.push(self.trans_id_tree_path(&child_path));
        }
        Ok(children)
    }

    // -----------------------------------------------------------------------
    // Final-state queries
    // -----------------------------------------------------------------------

    /// Kind after the transform: staged content, else `None` if deleted,
    /// else the source tree's kind.
    #[must_use]
    pub fn final_kind(&self, trans_id: &TransId) -> Option<Kind> {
        if let Some(contents) = self.ledger.new_contents(trans_id) {
            return Some(contents.kind());
        }
        if self.ledger.is_removed(trans_id) {
            return None;
        }
        self.tree_kind(trans_id)
    }

    /// # Errors
    /// Returns [`TransformError::NoFinalPath`] if the node has no name.
    pub fn final_name(&self, trans_id: &TransId) -> Result<String> {
        self.ledger.final_name(trans_id)
    }

    #[must_use]
    pub fn final_parent(&self, trans_id: &TransId) -> Option<TransId> {
        self.ledger.final_parent(trans_id)
    }

    /// File id after the transform, `None` if unversioned.
    #[must_use]
    pub fn final_file_id(&self, trans_id: &TransId) -> Option<FileId> {
        if let Some(file_id) = self.ledger.new_id.get(trans_id) {
            return Some(file_id.clone());
        }
        if self.ledger.removed_id.contains(trans_id) {
            return None;
        }
        self.tree_file_id(trans_id)
    }

    #[must_use]
    pub fn final_is_versioned(&self, trans_id: &TransId) -> bool {
        self.final_file_id(trans_id).is_some()
    }

    #[must_use]
    pub fn path_changed(&self, trans_id: &TransId) -> bool {
        self.ledger.path_changed(trans_id)
    }

    #[must_use]
    pub fn by_parent(&self) -> BTreeMap<TransId, BTreeSet<TransId>> {
        self.ledger.by_parent()
    }

    /// Final path of `trans_id`.
    ///
    /// # Errors
    /// Returns [`TransformError::NoFinalPath`] if it cannot be resolved.
    pub fn final_path(&self, trans_id: &TransId) -> Result<String> {
        FinalPaths::new(&self.ledger).get_path(trans_id)
    }

    /// `(final path, trans_id)` for every new or changed node, sorted.
    ///
    /// With `filesystem_only`, only nodes that need a rename out of limbo or
    /// an executable-bit change.
    ///
    /// # Errors
    /// Returns [`TransformError::NoFinalPath`] for unresolvable nodes.
    pub fn new_paths(&self, filesystem_only: bool) -> Result<Vec<(String, TransId)>> {
        let ledger = &self.ledger;
        let mut ids: BTreeSet<&TransId> = BTreeSet::new();
        if filesystem_only {
            ids.extend(self.limbo.needs_rename().iter().filter(|t| {
                ledger.new_name.contains_key(*t)
                    || ledger.new_parent.contains_key(*t)
                    || ledger.new_contents.contains_key(*t)
                    || ledger.new_id.contains_key(*t)
            }));
        } else {
            ids.extend(ledger.new_name.keys());
            ids.extend(ledger.new_parent.keys());
            ids.extend(ledger.new_contents.keys());
            ids.extend(ledger.new_id.keys());
        }
        ids.extend(ledger.new_executability.keys());
        FinalPaths::new(ledger).get_paths(ids)
    }

    // -----------------------------------------------------------------------
    // Paths
    // -----------------------------------------------------------------------

    /// Mint an id for a new node at `parent/name`.
    ///
    /// # Errors
    /// Propagates ledger invariant violations.
    pub fn create_path(&mut self, name: &str, parent: &TransId) -> Result<TransId> {
        self.ledger.create_path(name, parent)
    }

    /// Change the final name and parent of a node.
    ///
    /// # Errors
    /// Returns [`TransformError::CantMoveRoot`] for the root, or an I/O error
    /// if staged content has to move within limbo.
    pub fn adjust_path(&mut self, name: &str, parent: &TransId, trans_id: &TransId) -> Result<()> {
        let previous_parent = self.ledger.new_parent.get(trans_id).cloned();
        let previous_name = self.ledger.new_name.get(trans_id).cloned();
        self.ledger.adjust_path(name, parent, trans_id)?;
        self.limbo.path_adjusted(
            trans_id,
            previous_parent.as_ref(),
            previous_name.as_deref(),
            &self.ledger,
        )
    }

    /// Emulate moving the root to `parent/name`.
    ///
    /// The physical root keeps its place: its children are pinned to the old
    /// root's trans-id, which becomes a new directory at `parent/name` with
    /// the old root's file id, and a fresh trans-id takes over the root path.
    ///
    /// # Errors
    /// Propagates staging errors.
    pub fn adjust_root_path(&mut self, name: &str, parent: &TransId) -> Result<()> {
        let old_root = self.root();
        let old_root_file_id = self.final_file_id(&old_root);
        for child in self.iter_tree_children(&old_root)? {
            if &child != parent {
                let child_name = self.final_name(&child)?;
                let child_parent = self.final_parent(&child).unwrap_or_else(|| old_root.clone());
                self.adjust_path(&child_name, &child_parent, &child)?;
            }
            if let Some(file_id) = self.final_file_id(&child) {
                self.unversion_file(&child);
                if self.ledger.new_id.get(&child) != Some(&file_id) {
                    self.ledger.cancel_versioning(&child).ok();
                    self.ledger.version_file(&child, file_id)?;
                }
            }
        }
        self.ledger.tree_path_ids.remove("");
        self.ledger.tree_id_paths.remove(&old_root);
        let new_root = self.ledger.trans_id_tree_path("");
        self.ledger.root = new_root.clone();
        let parent = if parent == &old_root { &new_root } else { parent };
        self.adjust_path(name, parent, &old_root)?;
        self.create_directory(&old_root)?;
        if let Some(file_id) = old_root_file_id {
            self.ledger.version_file(&old_root, file_id)?;
        }
        self.unversion_file(&new_root);
        Ok(())
    }

    /// Coalesce a new directory parented at the root-parent sentinel into
    /// the existing root. Idempotent.
    ///
    /// # Errors
    /// Returns [`TransformError::TwoRoots`] if more than one candidate exists.
    pub fn fixup_new_roots(&mut self) -> Result<()> {
        let candidates: Vec<TransId> = self
            .ledger
            .new_parent
            .iter()
            .filter(|(_, parent)| parent.is_root_parent())
            .map(|(t, _)| t.clone())
            .collect();
        let old_new_root = match candidates.as_slice() {
            [] => return Ok(()),
            [one] => one.clone(),
            [first, second, ..] => {
                return Err(TransformError::TwoRoots {
                    first: first.clone(),
                    second: second.clone(),
                });
            }
        };
        let root = self.root();
        let file_id = if self.final_kind(&root).is_none() {
            self.final_file_id(&old_new_root)
        } else {
            self.final_file_id(&root)
        };
        if self.ledger.new_id.contains_key(&old_new_root) {
            self.ledger.cancel_versioning(&old_new_root)?;
        } else {
            self.unversion_file(&old_new_root);
        }
        if self.tree_file_id(&root).is_some() && !self.ledger.removed_id.contains(&root) {
            self.unversion_file(&root);
        }
        if let Some(file_id) = file_id {
            if self.ledger.new_id.contains_key(&root) {
                self.ledger.cancel_versioning(&root)?;
            }
            self.ledger.version_file(&root, file_id)?;
        }

        self.iter_tree_children(&old_new_root)?;
        let children = self
            .by_parent()
            .remove(&old_new_root)
            .unwrap_or_default();
        for child in children {
            let name = self.final_name(&child)?;
            self.adjust_path(&name, &root, &child)?;
        }

        if self.ledger.new_contents.contains_key(&old_new_root) {
            self.cancel_creation(&old_new_root)?;
        } else {
            self.delete_contents(&old_new_root);
        }
        if self.ledger.is_removed(&root) {
            self.cancel_deletion(&root)?;
        }
        self.ledger.forget_path(&old_new_root);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Deletion and versioning
    // -----------------------------------------------------------------------

    /// Schedule removal of whatever occupies the node's path. A no-op when
    /// nothing does.
    pub fn delete_contents(&mut self, trans_id: &TransId) {
        if self.tree_kind(trans_id).is_some() {
            self.ledger.mark_removed(trans_id);
        }
    }

    /// # Errors
    /// Returns [`TransformError::NotScheduled`] if no deletion is staged.
    pub fn cancel_deletion(&mut self, trans_id: &TransId) -> Result<()> {
        self.ledger.cancel_deletion(trans_id)
    }

    pub fn unversion_file(&mut self, trans_id: &TransId) {
        self.ledger.unversion_file(trans_id);
    }

    /// Delete and unversion.
    pub fn delete_versioned(&mut self, trans_id: &TransId) {
        self.delete_contents(trans_id);
        self.unversion_file(trans_id);
    }

    /// # Errors
    /// See [`Ledger::set_executability`].
    pub fn set_executability(&mut self, executable: Option<bool>, trans_id: &TransId) -> Result<()> {
        self.ledger.set_executability(executable, trans_id)
    }

    /// # Errors
    /// See [`Ledger::set_tree_reference`].
    pub fn set_tree_reference(&mut self, revision: RevisionId, trans_id: &TransId) -> Result<()> {
        self.ledger.set_tree_reference(revision, trans_id)
    }

    /// Version the node, minting a fresh file id when none is given.
    ///
    /// # Errors
    /// See [`Ledger::version_file`].
    pub fn version_file(&mut self, trans_id: &TransId, file_id: Option<FileId>) -> Result<FileId> {
        let file_id = file_id.unwrap_or_else(FileId::random);
        self.ledger.version_file(trans_id, file_id.clone())?;
        Ok(file_id)
    }

    /// # Errors
    /// See [`Ledger::cancel_versioning`].
    pub fn cancel_versioning(&mut self, trans_id: &TransId) -> Result<FileId> {
        self.ledger.cancel_versioning(trans_id)
    }

    // -----------------------------------------------------------------------
    // Content creation
    // -----------------------------------------------------------------------

    fn check_no_contents(&self, trans_id: &TransId) -> Result<()> {
        if self.ledger.new_contents.contains_key(trans_id) {
            return Err(TransformError::DuplicateKey {
                table: "new_contents",
                key: trans_id.to_string(),
            });
        }
        Ok(())
    }

    /// Stage a regular file.
    ///
    /// Permission bits are copied from the source-tree file of `mode_source`
    /// (defaulting to `trans_id` itself) when one exists. A known `sha1` is
    /// pushed into the tree's hash cache after apply.
    ///
    /// # Errors
    /// Returns [`TransformError::DuplicateKey`] if content is already staged,
    /// or an I/O error writing limbo.
    pub fn create_file<I, C>(
        &mut self,
        chunks: I,
        trans_id: &TransId,
        mode_source: Option<&TransId>,
        sha1: Option<&str>,
    ) -> Result<()>
    where
        I: IntoIterator<Item = C>,
        C: AsRef<[u8]>,
    {
        self.check_no_contents(trans_id)?;
        let path = self.limbo.name(trans_id, &self.ledger);
        let mut file = File::create(&path)?;
        for chunk in chunks {
            file.write_all(chunk.as_ref())?;
        }
        drop(file);
        self.ledger.add_contents(trans_id, NewContents::File)?;
        self.limbo.set_mtime(&path)?;
        self.set_mode(trans_id, mode_source, &path)?;
        if let Some(sha1) = sha1 {
            self.ledger
                .observed_sha1s
                .insert(trans_id.clone(), sha1.to_owned());
        }
        Ok(())
    }

    fn set_mode(&self, trans_id: &TransId, mode_source: Option<&TransId>, limbo_path: &Path) -> Result<()> {
        let Some(wt) = self.working_tree() else {
            return Ok(());
        };
        let source = mode_source.unwrap_or(trans_id);
        let Some(old_path) = self.tree_path(source) else {
            return Ok(());
        };
        let meta = match fs::metadata(wt.abspath(old_path)) {
            Ok(meta) => meta,
            Err(e) if matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::NotADirectory) => {
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if meta.is_file() {
            fs::set_permissions(limbo_path, meta.permissions())?;
        }
        Ok(())
    }

    /// # Errors
    /// Returns [`TransformError::DuplicateKey`] or an I/O error.
    pub fn create_directory(&mut self, trans_id: &TransId) -> Result<()> {
        self.check_no_contents(trans_id)?;
        fs::create_dir(self.limbo.name(trans_id, &self.ledger))?;
        self.ledger.add_contents(trans_id, NewContents::Directory)
    }

    /// Stage a symbolic link to `target`.
    ///
    /// # Errors
    /// Returns [`TransformError::DuplicateKey`] or an I/O error.
    pub fn create_symlink(&mut self, target: &str, trans_id: &TransId) -> Result<()> {
        self.check_no_contents(trans_id)?;
        let path = self.limbo.name(trans_id, &self.ledger);
        #[cfg(unix)]
        std::os::unix::fs::symlink(target, &path)?;
        #[cfg(not(unix))]
        tracing::warn!(
            path = %path.display(),
            "unable to create symlink on this filesystem"
        );
        self.ledger.add_contents(
            trans_id,
            NewContents::Symlink {
                target: target.to_owned(),
            },
        )
    }

    /// Stage a nested tree reference pinned at `revision`.
    ///
    /// # Errors
    /// Returns [`TransformError::DuplicateKey`] or an I/O error.
    pub fn create_tree_reference(&mut self, revision: RevisionId, trans_id: &TransId) -> Result<()> {
        self.check_no_contents(trans_id)?;
        fs::create_dir(self.limbo.name(trans_id, &self.ledger))?;
        self.ledger.add_contents(trans_id, NewContents::TreeReference)?;
        self.ledger.set_tree_reference(revision, trans_id)
    }

    /// Stage a hard link to an existing file.
    ///
    /// # Errors
    /// Returns [`TransformError::HardLinkNotSupported`] if the filesystem
    /// refuses, [`TransformError::DuplicateKey`], or an I/O error.
    pub fn create_hardlink(&mut self, source: &Path, trans_id: &TransId) -> Result<()> {
        self.check_no_contents(trans_id)?;
        let path = self.limbo.name(trans_id, &self.ledger);
        if let Err(e) = fs::hard_link(source, &path) {
            if e.kind() == io::ErrorKind::PermissionDenied {
                return Err(TransformError::HardLinkNotSupported {
                    path: source.to_owned(),
                });
            }
            return Err(e.into());
        }
        self.ledger.add_contents(trans_id, NewContents::File)
    }

    /// Undo a `create_*` call and remove its staged content.
    ///
    /// # Errors
    /// Returns [`TransformError::NotScheduled`] if nothing is staged.
    pub fn cancel_creation(&mut self, trans_id: &TransId) -> Result<()> {
        if self.ledger.new_contents.remove(trans_id).is_none() {
            return Err(TransformError::NotScheduled {
                trans_id: trans_id.clone(),
                what: "creation",
            });
        }
        self.ledger.observed_sha1s.remove(trans_id);
        self.limbo.cancel_creation(trans_id, &self.ledger)
    }

    /// Bytes staged for a new file.
    ///
    /// # Errors
    /// Returns [`TransformError::NoSuchFile`] if no file is staged.
    pub fn staged_file_bytes(&self, trans_id: &TransId) -> Result<Vec<u8>> {
        let path = match (self.ledger.new_contents(trans_id), self.limbo.path_of(trans_id)) {
            (Some(NewContents::File), Some(path)) => path,
            _ => {
                return Err(TransformError::NoSuchFile {
                    path: trans_id.to_string(),
                });
            }
        };
        Ok(fs::read(path)?)
    }

    pub(crate) fn limbo_path(&self, trans_id: &TransId) -> Option<&Path> {
        self.limbo.path_of(trans_id)
    }

    // -----------------------------------------------------------------------
    // Convenience constructors
    // -----------------------------------------------------------------------

    fn new_entry(&mut self, name: &str, parent: &TransId, file_id: Option<FileId>) -> Result<TransId> {
        let trans_id = self.create_path(name, parent)?;
        if let Some(file_id) = file_id {
            self.ledger.version_file(&trans_id, file_id)?;
        }
        Ok(trans_id)
    }

    /// Create a file at `parent/name`, versioned if `file_id` is given.
    ///
    /// # Errors
    /// Propagates staging errors.
    pub fn new_file<I, C>(
        &mut self,
        name: &str,
        parent: &TransId,
        chunks: I,
        file_id: Option<FileId>,
        executable: Option<bool>,
        sha1: Option<&str>,
    ) -> Result<TransId>
    where
        I: IntoIterator<Item = C>,
        C: AsRef<[u8]>,
    {
        let trans_id = self.new_entry(name, parent, file_id)?;
        self.create_file(chunks, &trans_id, None, sha1)?;
        if executable.is_some() {
            self.set_executability(executable, &trans_id)?;
        }
        Ok(trans_id)
    }

    /// # Errors
    /// Propagates staging errors.
    pub fn new_directory(&mut self, name: &str, parent: &TransId, file_id: Option<FileId>) -> Result<TransId> {
        let trans_id = self.new_entry(name, parent, file_id)?;
        self.create_directory(&trans_id)?;
        Ok(trans_id)
    }

    /// # Errors
    /// Propagates staging errors.
    pub fn new_symlink(
        &mut self,
        name: &str,
        parent: &TransId,
        target: &str,
        file_id: Option<FileId>,
    ) -> Result<TransId> {
        let trans_id = self.new_entry(name, parent, file_id)?;
        self.create_symlink(target, &trans_id)?;
        Ok(trans_id)
    }

    // -----------------------------------------------------------------------
    // Finalize
    // -----------------------------------------------------------------------

    /// Remove limbo and release the tree lock. Safe to call repeatedly and
    /// after [`TreeTransform::apply`].
    ///
    /// # Errors
    /// Returns [`TransformError::ImmortalLimbo`] or
    /// [`TransformError::ImmortalPendingDeletion`] if the scratch
    /// directories cannot be removed. The lock is released regardless.
    pub fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;
        let cleaned = self.limbo.finalize(&self.ledger);
        let unlocked = self.tree().unlock();
        cleaned.and(unlocked)
    }
}

impl Drop for TreeTransform<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.finalize() {
            tracing::warn!(error = %e, "failed to finalize tree transform");
        }
    }
}
