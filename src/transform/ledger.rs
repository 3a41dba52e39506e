//! Staged mutation ledger.
//!
//! The ledger is pure bookkeeping: every map is keyed by [`TransId`] and no
//! method touches the filesystem or the source tree. Queries that need the
//! source tree (kinds, file ids) live on
//! [`TreeTransform`](super::TreeTransform), which owns a ledger.
//!
//! Tree paths are registered together with all of their ancestors, so the
//! tree parent of any registered id can be answered without minting new ids.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransformError};
use crate::model::inventory::split_path;
use crate::model::types::{FileId, Kind, RevisionId, TransId};

/// Kind of content staged for creation, with its payload where the payload
/// is not kept in limbo.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum NewContents {
    File,
    Directory,
    Symlink { target: String },
    TreeReference,
}

impl NewContents {
    #[must_use]
    pub const fn kind(&self) -> Kind {
        match self {
            Self::File => Kind::File,
            Self::Directory => Kind::Directory,
            Self::Symlink { .. } => Kind::Symlink,
            Self::TreeReference => Kind::TreeReference,
        }
    }
}

/// Every pending change of one transform session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ledger {
    pub(crate) id_number: u64,
    pub(crate) new_name: BTreeMap<TransId, String>,
    pub(crate) new_parent: BTreeMap<TransId, TransId>,
    pub(crate) new_contents: BTreeMap<TransId, NewContents>,
    pub(crate) observed_sha1s: BTreeMap<TransId, String>,
    pub(crate) removed_contents: BTreeSet<TransId>,
    pub(crate) new_executability: BTreeMap<TransId, bool>,
    pub(crate) new_reference_revision: BTreeMap<TransId, RevisionId>,
    pub(crate) new_id: BTreeMap<TransId, FileId>,
    pub(crate) r_new_id: BTreeMap<FileId, TransId>,
    pub(crate) non_present_ids: BTreeMap<FileId, TransId>,
    pub(crate) removed_id: BTreeSet<TransId>,
    pub(crate) tree_path_ids: BTreeMap<String, TransId>,
    pub(crate) tree_id_paths: BTreeMap<TransId, String>,
    pub(crate) root: TransId,
}

/// Insert `key → value`, refusing to overwrite.
fn unique_add<K, V>(map: &mut BTreeMap<K, V>, table: &'static str, key: K, value: V) -> Result<()>
where
    K: Ord + fmt::Display,
{
    if map.contains_key(&key) {
        return Err(TransformError::DuplicateKey {
            table,
            key: key.to_string(),
        });
    }
    map.insert(key, value);
    Ok(())
}

impl Ledger {
    /// An empty ledger whose root is the source tree's root path.
    #[must_use]
    pub fn new() -> Self {
        let mut ledger = Self {
            id_number: 0,
            new_name: BTreeMap::new(),
            new_parent: BTreeMap::new(),
            new_contents: BTreeMap::new(),
            observed_sha1s: BTreeMap::new(),
            removed_contents: BTreeSet::new(),
            new_executability: BTreeMap::new(),
            new_reference_revision: BTreeMap::new(),
            new_id: BTreeMap::new(),
            r_new_id: BTreeMap::new(),
            non_present_ids: BTreeMap::new(),
            removed_id: BTreeSet::new(),
            tree_path_ids: BTreeMap::new(),
            tree_id_paths: BTreeMap::new(),
            root: TransId::root_parent(),
        };
        ledger.root = ledger.trans_id_tree_path("");
        ledger
    }

    // -----------------------------------------------------------------------
    // Identifier space
    // -----------------------------------------------------------------------

    /// Mint a fresh, never reused trans-id.
    pub fn assign_id(&mut self) -> TransId {
        let id = TransId::numbered(self.id_number);
        self.id_number += 1;
        id
    }

    /// The trans-id for a path of the source tree, minted on first use.
    ///
    /// The path need not exist. Ancestors are registered as well.
    pub fn trans_id_tree_path(&mut self, path: &str) -> TransId {
        if let Some(id) = self.tree_path_ids.get(path) {
            return id.clone();
        }
        let id = self.assign_id();
        self.tree_path_ids.insert(path.to_owned(), id.clone());
        self.tree_id_paths.insert(id.clone(), path.to_owned());
        if !path.is_empty() {
            let (parent, _) = split_path(path);
            self.trans_id_tree_path(parent);
        }
        id
    }

    /// The trans-id that will be the tree root.
    #[must_use]
    pub const fn root(&self) -> &TransId {
        &self.root
    }

    /// Path of `trans_id` in the source tree, if it has one.
    #[must_use]
    pub fn tree_path(&self, trans_id: &TransId) -> Option<&str> {
        self.tree_id_paths.get(trans_id).map(String::as_str)
    }

    /// Parent of `trans_id` in the source tree.
    #[must_use]
    pub fn get_tree_parent(&self, trans_id: &TransId) -> Option<TransId> {
        let path = self.tree_id_paths.get(trans_id)?;
        if path.is_empty() {
            return Some(TransId::root_parent());
        }
        let (parent, _) = split_path(path);
        self.tree_path_ids.get(parent).cloned()
    }

    // -----------------------------------------------------------------------
    // Final-state queries
    // -----------------------------------------------------------------------

    /// The final basename of `trans_id`.
    ///
    /// # Errors
    /// Returns [`TransformError::NoFinalPath`] if it has neither a new name
    /// nor a tree path.
    pub fn final_name(&self, trans_id: &TransId) -> Result<String> {
        if let Some(name) = self.new_name.get(trans_id) {
            return Ok(name.clone());
        }
        self.tree_id_paths
            .get(trans_id)
            .map(|p| split_path(p).1.to_owned())
            .ok_or_else(|| TransformError::NoFinalPath {
                trans_id: trans_id.clone(),
            })
    }

    /// The final parent; the root-parent sentinel for the tree root.
    #[must_use]
    pub fn final_parent(&self, trans_id: &TransId) -> Option<TransId> {
        self.new_parent
            .get(trans_id)
            .cloned()
            .or_else(|| self.get_tree_parent(trans_id))
    }

    #[must_use]
    pub fn path_changed(&self, trans_id: &TransId) -> bool {
        self.new_name.contains_key(trans_id) || self.new_parent.contains_key(trans_id)
    }

    #[must_use]
    pub fn new_contents(&self, trans_id: &TransId) -> Option<&NewContents> {
        self.new_contents.get(trans_id)
    }

    #[must_use]
    pub fn is_removed(&self, trans_id: &TransId) -> bool {
        self.removed_contents.contains(trans_id)
    }

    /// Map of final parent → children for every known node.
    #[must_use]
    pub fn by_parent(&self) -> BTreeMap<TransId, BTreeSet<TransId>> {
        let mut by_parent: BTreeMap<TransId, BTreeSet<TransId>> = BTreeMap::new();
        for (trans_id, parent) in &self.new_parent {
            by_parent
                .entry(parent.clone())
                .or_default()
                .insert(trans_id.clone());
        }
        for trans_id in self.tree_id_paths.keys() {
            if let Some(parent) = self.final_parent(trans_id) {
                by_parent.entry(parent).or_default().insert(trans_id.clone());
            }
        }
        by_parent
    }

    /// Every trans-id touched by a staged change.
    #[must_use]
    pub fn affected_ids(&self) -> BTreeSet<TransId> {
        let mut ids: BTreeSet<TransId> = self.removed_id.iter().cloned().collect();
        ids.extend(self.new_id.keys().cloned());
        ids.extend(self.removed_contents.iter().cloned());
        ids.extend(self.new_contents.keys().cloned());
        ids.extend(self.new_executability.keys().cloned());
        ids.extend(self.new_name.keys().cloned());
        ids.extend(self.new_parent.keys().cloned());
        ids
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    /// Mint an id for a node that will live at `parent/name`.
    ///
    /// # Errors
    /// Never fails for a fresh id; the error type covers the invariant check.
    pub fn create_path(&mut self, name: &str, parent: &TransId) -> Result<TransId> {
        let trans_id = self.assign_id();
        unique_add(&mut self.new_name, "new_name", trans_id.clone(), name.to_owned())?;
        unique_add(&mut self.new_parent, "new_parent", trans_id.clone(), parent.clone())?;
        Ok(trans_id)
    }

    /// Change the final name and parent of `trans_id`.
    ///
    /// # Errors
    /// Returns [`TransformError::CantMoveRoot`] for the tree root.
    pub fn adjust_path(&mut self, name: &str, parent: &TransId, trans_id: &TransId) -> Result<()> {
        if &self.root == trans_id {
            return Err(TransformError::CantMoveRoot {
                trans_id: trans_id.clone(),
            });
        }
        self.new_name.insert(trans_id.clone(), name.to_owned());
        self.new_parent.insert(trans_id.clone(), parent.clone());
        Ok(())
    }

    pub(crate) fn forget_path(&mut self, trans_id: &TransId) {
        self.new_name.remove(trans_id);
        self.new_parent.remove(trans_id);
    }

    pub(crate) fn mark_removed(&mut self, trans_id: &TransId) {
        self.removed_contents.insert(trans_id.clone());
    }

    /// # Errors
    /// Returns [`TransformError::NotScheduled`] if no deletion is staged.
    pub fn cancel_deletion(&mut self, trans_id: &TransId) -> Result<()> {
        if self.removed_contents.remove(trans_id) {
            Ok(())
        } else {
            Err(TransformError::NotScheduled {
                trans_id: trans_id.clone(),
                what: "deletion",
            })
        }
    }

    pub fn unversion_file(&mut self, trans_id: &TransId) {
        self.removed_id.insert(trans_id.clone());
    }

    /// Stage (`Some`) or clear (`None`) an executable-bit override.
    ///
    /// # Errors
    /// - [`TransformError::NotScheduled`] when clearing an absent override.
    /// - [`TransformError::DuplicateKey`] when an override is already staged.
    pub fn set_executability(&mut self, executable: Option<bool>, trans_id: &TransId) -> Result<()> {
        match executable {
            None => self
                .new_executability
                .remove(trans_id)
                .map(|_| ())
                .ok_or_else(|| TransformError::NotScheduled {
                    trans_id: trans_id.clone(),
                    what: "executability change",
                }),
            Some(value) => unique_add(
                &mut self.new_executability,
                "new_executability",
                trans_id.clone(),
                value,
            ),
        }
    }

    /// # Errors
    /// Returns [`TransformError::DuplicateKey`] if a reference is staged.
    pub fn set_tree_reference(&mut self, revision: RevisionId, trans_id: &TransId) -> Result<()> {
        unique_add(
            &mut self.new_reference_revision,
            "new_reference_revision",
            trans_id.clone(),
            revision,
        )
    }

    /// Give `trans_id` the persistent identity `file_id`.
    ///
    /// # Errors
    /// Returns [`TransformError::DuplicateKey`] if `trans_id` is already being
    /// versioned or `file_id` is already claimed by another node.
    pub fn version_file(&mut self, trans_id: &TransId, file_id: FileId) -> Result<()> {
        if self.r_new_id.contains_key(&file_id) {
            return Err(TransformError::DuplicateKey {
                table: "r_new_id",
                key: file_id.to_string(),
            });
        }
        unique_add(&mut self.new_id, "new_id", trans_id.clone(), file_id.clone())?;
        self.r_new_id.insert(file_id, trans_id.clone());
        Ok(())
    }

    /// Undo [`Ledger::version_file`], returning the released id.
    ///
    /// # Errors
    /// Returns [`TransformError::NotScheduled`] if nothing is staged.
    pub fn cancel_versioning(&mut self, trans_id: &TransId) -> Result<FileId> {
        let file_id = self
            .new_id
            .remove(trans_id)
            .ok_or_else(|| TransformError::NotScheduled {
                trans_id: trans_id.clone(),
                what: "versioning",
            })?;
        self.r_new_id.remove(&file_id);
        Ok(file_id)
    }

    pub(crate) fn add_contents(&mut self, trans_id: &TransId, contents: NewContents) -> Result<()> {
        unique_add(&mut self.new_contents, "new_contents", trans_id.clone(), contents)
    }
}
