//! What to do with unversioned children of a deleted directory.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransformError};
use crate::model::inventory::join_path;
use crate::model::types::TransId;

use super::TreeTransform;

/// Top-level directory that receives orphans under [`OrphanPolicy::Move`].
pub const ORPHAN_DIR: &str = "brz-orphans";

/// Orphan handling, chosen when the transform is created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrphanPolicy {
    /// Keep the parent, report a `deleting parent` conflict.
    #[default]
    Conflict,
    /// Move orphans into [`ORPHAN_DIR`] and let the deletion proceed.
    Move,
}

impl OrphanPolicy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Conflict => "conflict",
            Self::Move => "move",
        }
    }
}

impl fmt::Display for OrphanPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown orphan policy '{0}'")]
pub struct UnknownPolicy(pub String);

impl FromStr for OrphanPolicy {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "conflict" => Ok(Self::Conflict),
            "move" => Ok(Self::Move),
            other => Err(UnknownPolicy(other.to_owned())),
        }
    }
}

impl TreeTransform<'_> {
    /// Hand `orphan`, an unversioned child of the deleted `parent`, to the
    /// orphan policy.
    ///
    /// # Errors
    /// Returns [`TransformError::OrphaningForbidden`] when the policy (or a
    /// preview transform) refuses.
    pub fn new_orphan(&mut self, orphan: &TransId, parent: &TransId) -> Result<()> {
        if self.is_preview() {
            return Err(self.forbidden(orphan, parent, "preview transforms keep orphans"));
        }
        match self.options().orphan_policy {
            OrphanPolicy::Conflict => Err(self.forbidden(orphan, parent, "never")),
            OrphanPolicy::Move => self.move_orphan(orphan, parent),
        }
    }

    fn forbidden(&self, orphan: &TransId, parent: &TransId, reason: &str) -> TransformError {
        let name = self.final_name(orphan).unwrap_or_else(|_| orphan.to_string());
        let path = self
            .tree_path(parent)
            .map_or_else(|| name.clone(), |p| join_path(p, &name));
        TransformError::OrphaningForbidden {
            path,
            reason: reason.to_owned(),
        }
    }

    fn move_orphan(&mut self, orphan: &TransId, parent: &TransId) -> Result<()> {
        let orphan_dir = self.trans_id_tree_path(ORPHAN_DIR);
        if self.final_kind(&orphan_dir).is_none() {
            self.create_directory(&orphan_dir)?;
        }
        let actual_name = self.final_name(orphan)?;
        let new_name = self.available_backup_name(&actual_name, &orphan_dir)?;
        self.adjust_path(&new_name, &orphan_dir, orphan)?;
        let parent_path = self.tree_path(parent).unwrap_or_default();
        tracing::warn!(
            "{} has been orphaned in {ORPHAN_DIR}",
            join_path(parent_path, &actual_name)
        );
        Ok(())
    }

    /// First free `name.~N~` (N from 1) among the final children of `parent`.
    ///
    /// # Errors
    /// Propagates final-name lookups of known children.
    pub(crate) fn available_backup_name(&self, name: &str, parent: &TransId) -> Result<String> {
        let known_children = self.by_parent().remove(parent).unwrap_or_default();
        let mut counter = 1_u32;
        loop {
            let candidate = format!("{name}.~{counter}~");
            if !self.has_named_child(&candidate, parent, known_children.iter())? {
                return Ok(candidate);
            }
            counter += 1;
        }
    }

    fn has_named_child<'a>(
        &self,
        name: &str,
        parent: &TransId,
        known_children: impl Iterator<Item = &'a TransId>,
    ) -> Result<bool> {
        for child in known_children {
            if self.final_name(child)? == name {
                return Ok(true);
            }
        }
        let Some(parent_path) = self.tree_path(parent) else {
            return Ok(false);
        };
        let child_path = join_path(parent_path, name);
        if self.ledger.tree_path_ids.contains_key(&child_path) {
            // Registered but no longer a final child of `parent`.
            return Ok(false);
        }
        Ok(self.tree().has_filename(&child_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::MemoryTree;

    #[test]
    fn parses_known_policies() {
        assert_eq!("move".parse::<OrphanPolicy>(), Ok(OrphanPolicy::Move));
        assert_eq!("conflict".parse::<OrphanPolicy>(), Ok(OrphanPolicy::Conflict));
        assert_eq!(
            "shred".parse::<OrphanPolicy>(),
            Err(UnknownPolicy("shred".to_owned()))
        );
        assert_eq!(OrphanPolicy::default(), OrphanPolicy::Conflict);
    }

    #[test]
    fn backup_names_skip_taken_slots() {
        let mut tree = MemoryTree::new();
        tree.add_file("d/f.~1~", b"").add_file("d/f", b"");
        let mut tt = TreeTransform::preview(&tree).unwrap();
        let d = tt.trans_id_tree_path("d");
        tt.iter_tree_children(&d).unwrap();
        tt.new_file("f.~2~", &d, [b""], None, None, None).unwrap();
        assert_eq!(tt.available_backup_name("f", &d).unwrap(), "f.~3~");
    }

    #[test]
    fn unregistered_children_are_found_in_the_tree() {
        let mut tree = MemoryTree::new();
        tree.add_file("d/f.~1~", b"");
        let mut tt = TreeTransform::preview(&tree).unwrap();
        let d = tt.trans_id_tree_path("d");
        assert_eq!(tt.available_backup_name("f", &d).unwrap(), "f.~2~");
    }

    #[test]
    fn preview_refuses_orphans() {
        let mut tree = MemoryTree::new();
        tree.add_file("d/f", b"");
        let mut tt = TreeTransform::preview(&tree).unwrap();
        let d = tt.trans_id_tree_path("d");
        let f = tt.trans_id_tree_path("d/f");
        let err = tt.new_orphan(&f, &d).unwrap_err();
        assert!(matches!(
            err,
            TransformError::OrphaningForbidden { ref path, .. } if path == "d/f"
        ));
    }
}
