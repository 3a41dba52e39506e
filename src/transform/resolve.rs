//! Automatic conflict repair and user-facing conflict records.
//!
//! [`resolve_conflicts`] alternates detection and [`conflict_pass`] until
//! the transform is clean, or gives up after the configured number of
//! passes with [`TransformError::MalformedTransform`]. Every repair that
//! leaves something for the user to look at is returned as a
//! [`ResolvedConflict`]; [`cook_conflicts`] turns those into
//! [`CookedConflict`]s carrying final paths.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransformError};
use crate::model::inventory::split_path;
use crate::model::types::{FileId, Kind, TransId};
use crate::tree::Tree;

use super::TreeTransform;
use super::conflicts::{ConflictKind, RawConflict};
use super::paths::FinalPaths;

/// A repair made by [`conflict_pass`], in trans-id terms.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ResolvedConflict {
    pub kind: ConflictKind,
    pub action: &'static str,
    pub trans_id: TransId,
    pub other: Option<TransId>,
}

impl ResolvedConflict {
    const fn new(kind: ConflictKind, action: &'static str, trans_id: TransId) -> Self {
        Self {
            kind,
            action,
            trans_id,
            other: None,
        }
    }

    fn with_other(mut self, other: TransId) -> Self {
        self.other = Some(other);
        self
    }
}

/// Repair conflicts until none remain. At least one detection pass always
/// runs, whatever the configured cap.
///
/// `path_tree`, when given, is the tree the transform is moving towards; it
/// is consulted to place missing parents and to leave its root alone.
///
/// # Errors
/// - [`TransformError::MalformedTransform`] with the residual conflicts if
///   the pass cap is reached.
/// - Any staging error raised by a repair.
#[tracing::instrument(skip_all, fields(max_passes = tt.options().max_resolution_passes))]
pub fn resolve_conflicts(
    tt: &mut TreeTransform<'_>,
    path_tree: Option<&dyn Tree>,
) -> Result<Vec<ResolvedConflict>> {
    let mut resolved = BTreeSet::new();
    let mut conflicts = Vec::new();
    for pass in 0..tt.options().max_resolution_passes.max(1) {
        conflicts = tt.find_raw_conflicts()?;
        if conflicts.is_empty() {
            tracing::debug!(passes = pass, resolved = resolved.len(), "conflicts resolved");
            return Ok(resolved.into_iter().collect());
        }
        tracing::debug!(pass, count = conflicts.len(), "resolving conflicts");
        resolved.extend(conflict_pass(tt, &conflicts, path_tree)?);
    }
    Err(TransformError::MalformedTransform { conflicts })
}

/// Apply one repair per conflict.
///
/// Repairs made earlier in the pass can make later conflicts stale; those
/// are skipped and caught again by the next detection.
///
/// # Errors
/// Propagates staging errors.
pub fn conflict_pass(
    tt: &mut TreeTransform<'_>,
    conflicts: &[RawConflict],
    path_tree: Option<&dyn Tree>,
) -> Result<BTreeSet<ResolvedConflict>> {
    let mut resolved = BTreeSet::new();
    for conflict in conflicts {
        match conflict {
            RawConflict::DuplicateId { existing, new } => {
                let file_id = tt.inactive_file_id(existing);
                if is_path_tree_root(path_tree, file_id.as_ref()) {
                    continue;
                }
                tt.unversion_file(existing);
                resolved.insert(
                    ResolvedConflict::new(ConflictKind::DuplicateId, "Unversioned existing file", existing.clone())
                        .with_other(new.clone()),
                );
            }
            RawConflict::Duplicate { first, second, .. } => {
                if let Some(record) = resolve_duplicate(tt, first, second)? {
                    resolved.insert(record);
                }
            }
            RawConflict::ParentLoop { trans_id } => {
                if let Some(record) = resolve_parent_loop(tt, trans_id)? {
                    resolved.insert(record);
                }
            }
            RawConflict::MissingParent { trans_id } => {
                if let Some(record) = resolve_missing_parent(tt, trans_id, path_tree)? {
                    resolved.insert(record);
                }
            }
            RawConflict::DeletingParent { trans_id } => {
                if let Some(record) = resolve_deleting_parent(tt, trans_id)? {
                    resolved.insert(record);
                }
            }
            RawConflict::UnversionedParent { trans_id } => {
                if tt.final_is_versioned(trans_id) {
                    continue;
                }
                let file_id = tt.inactive_file_id(trans_id);
                if is_path_tree_root(path_tree, file_id.as_ref()) {
                    continue;
                }
                tt.version_file(trans_id, file_id)?;
                resolved.insert(ResolvedConflict::new(
                    ConflictKind::UnversionedParent,
                    "Versioned directory",
                    trans_id.clone(),
                ));
            }
            RawConflict::NonDirectoryParent { trans_id } => {
                resolved.insert(resolve_non_directory_parent(tt, trans_id)?);
            }
            RawConflict::VersioningNoContents { trans_id } => {
                tt.cancel_versioning(trans_id)?;
            }
            RawConflict::UnversionedExecutability { trans_id }
            | RawConflict::NonFileExecutability { trans_id } => {
                tt.set_executability(None, trans_id)?;
            }
            RawConflict::Overwrite { trans_id, .. } => {
                tracing::debug!(trans_id = %trans_id, "overwrite conflicts are not resolved automatically");
            }
        }
    }
    Ok(resolved)
}

fn is_path_tree_root(path_tree: Option<&dyn Tree>, file_id: Option<&FileId>) -> bool {
    match (path_tree, file_id) {
        (Some(tree), Some(file_id)) => tree.path2id("").as_ref() == Some(file_id),
        _ => false,
    }
}

/// The moved side keeps the name; the untouched side becomes `name.moved`.
///
/// On trees that do not version directories, two directories are merged
/// instead: the children of the newcomer move into the existing one.
fn resolve_duplicate(
    tt: &mut TreeTransform<'_>,
    first: &TransId,
    second: &TransId,
) -> Result<Option<ResolvedConflict>> {
    let (existing, new) = if tt.path_changed(first) {
        (second, first)
    } else {
        (first, second)
    };
    let Some(final_parent) = tt.final_parent(existing) else {
        return Ok(None);
    };
    if !tt.tree().versions_directories()
        && tt.final_kind(existing) == Some(Kind::Directory)
        && tt.final_kind(new) == Some(Kind::Directory)
    {
        reparent_children(tt, new, existing)?;
        if tt.ledger().new_contents(new).is_some() {
            tt.cancel_creation(new)?;
        } else {
            tt.delete_contents(new);
        }
        return Ok(None);
    }
    let new_name = format!("{}.moved", tt.final_name(existing)?);
    tt.adjust_path(&new_name, &final_parent, existing)?;
    Ok(Some(
        ResolvedConflict::new(ConflictKind::Duplicate, "Moved existing file to", existing.clone())
            .with_other(new.clone()),
    ))
}

fn in_parent_loop(tt: &TreeTransform<'_>, trans_id: &TransId) -> bool {
    let mut seen = BTreeSet::new();
    let mut current = trans_id.clone();
    while let Some(parent) = tt.final_parent(&current) {
        if &parent == trans_id {
            return true;
        }
        if parent.is_root_parent() || !seen.insert(parent.clone()) {
            return false;
        }
        current = parent;
    }
    false
}

/// Undo the first move found walking up from `trans_id`.
fn resolve_parent_loop(tt: &mut TreeTransform<'_>, trans_id: &TransId) -> Result<Option<ResolvedConflict>> {
    if !in_parent_loop(tt, trans_id) {
        return Ok(None);
    }
    let mut current = trans_id.clone();
    while !tt.path_changed(&current) {
        match tt.final_parent(&current) {
            Some(parent) if !parent.is_root_parent() => current = parent,
            _ => return Ok(None),
        }
    }
    let Some(loop_parent) = tt.final_parent(&current) else {
        return Ok(None);
    };
    let restored = tt.get_tree_parent(&current).unwrap_or_else(|| tt.root());
    let name = tt.final_name(&current)?;
    tt.adjust_path(&name, &restored, &current)?;
    Ok(Some(
        ResolvedConflict::new(ConflictKind::ParentLoop, "Cancelled move", current).with_other(loop_parent),
    ))
}

fn resolve_missing_parent(
    tt: &mut TreeTransform<'_>,
    trans_id: &TransId,
    path_tree: Option<&dyn Tree>,
) -> Result<Option<ResolvedConflict>> {
    if tt.final_kind(trans_id).is_some() {
        return Ok(None);
    }
    let mut create = true;
    if tt.final_name(trans_id).is_err()
        && let Some(path_tree) = path_tree
        && let Some(file_id) = tt
            .final_file_id(trans_id)
            .or_else(|| tt.inactive_file_id(trans_id))
        && let Some(path) = path_tree.id2path(&file_id)
    {
        if path.is_empty() {
            // The other tree's root: its children belong under ours.
            create = false;
            let root = tt.root();
            reparent_children(tt, trans_id, &root)?;
        } else {
            let (parent_path, name) = split_path(&path);
            if let Some(parent_file_id) = path_tree.path2id(parent_path) {
                let parent = tt.trans_id_file_id(&parent_file_id);
                tt.adjust_path(name, &parent, trans_id)?;
            }
        }
    }
    if !create {
        return Ok(None);
    }
    tt.create_directory(trans_id)?;
    Ok(Some(ResolvedConflict::new(
        ConflictKind::MissingParent,
        "Created directory",
        trans_id.clone(),
    )))
}

/// Orphan the remaining children, or keep the directory.
fn resolve_deleting_parent(tt: &mut TreeTransform<'_>, trans_id: &TransId) -> Result<Option<ResolvedConflict>> {
    if !tt.ledger().is_removed(trans_id) {
        return Ok(None);
    }
    let mut cancel = true;
    if let Some(orphans) = potential_orphans(tt, trans_id)
        && !orphans.is_empty()
    {
        cancel = false;
        for orphan in &orphans {
            match tt.new_orphan(orphan, trans_id) {
                Ok(()) => {}
                Err(TransformError::OrphaningForbidden { .. }) => {
                    cancel = true;
                    break;
                }
                Err(e) => return Err(e),
            }
        }
    }
    if !cancel {
        return Ok(None);
    }
    tt.cancel_deletion(trans_id)?;
    Ok(Some(ResolvedConflict::new(
        ConflictKind::DeletingParent,
        "Not deleting",
        trans_id.clone(),
    )))
}

/// The live unversioned children of a directory, or `None` if a versioned
/// child remains.
fn potential_orphans(tt: &TreeTransform<'_>, dir: &TransId) -> Option<Vec<TransId>> {
    let children = tt.by_parent().remove(dir).unwrap_or_default();
    let mut orphans = Vec::new();
    for child in children {
        if tt.ledger().is_removed(&child) {
            continue;
        }
        if tt.final_is_versioned(&child) {
            return None;
        }
        orphans.push(child);
    }
    Some(orphans)
}

/// Put a new directory `name.new` beside the non-directory and move the
/// would-be children into it.
fn resolve_non_directory_parent(tt: &mut TreeTransform<'_>, trans_id: &TransId) -> Result<ResolvedConflict> {
    let parent_parent = tt.final_parent(trans_id).unwrap_or_else(|| tt.root());
    let parent_name = tt.final_name(trans_id)?;
    let parent_file_id = tt.final_file_id(trans_id);
    if parent_file_id.is_some() {
        if tt.ledger().new_id.contains_key(trans_id) {
            tt.cancel_versioning(trans_id)?;
        }
        tt.unversion_file(trans_id);
    }
    let new_parent = tt.new_directory(&format!("{parent_name}.new"), &parent_parent, parent_file_id)?;
    reparent_children(tt, trans_id, &new_parent)?;
    Ok(ResolvedConflict::new(
        ConflictKind::NonDirectoryParent,
        "Created directory",
        new_parent,
    ))
}

fn reparent_children(tt: &mut TreeTransform<'_>, old_parent: &TransId, new_parent: &TransId) -> Result<Vec<TransId>> {
    let children: Vec<TransId> = tt
        .by_parent()
        .remove(old_parent)
        .unwrap_or_default()
        .into_iter()
        .collect();
    for child in &children {
        let name = tt.final_name(child)?;
        tt.adjust_path(&name, new_parent, child)?;
    }
    Ok(children)
}

// ---------------------------------------------------------------------------
// Cooked conflicts
// ---------------------------------------------------------------------------

/// A conflict as shown to and stored for the user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookedConflict {
    #[serde(rename = "type")]
    pub kind: ConflictKind,
    pub action: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<FileId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_file_id: Option<FileId>,
}

impl CookedConflict {
    fn sort_key(&self) -> (&str, &'static str) {
        (&self.path, self.kind.as_str())
    }
}

impl fmt::Display for CookedConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = &self.path;
        let action = &self.action;
        let other = self.conflict_path.as_deref().unwrap_or("");
        match self.kind {
            ConflictKind::Duplicate => write!(f, "Conflict adding file {other}.  {action} {path}."),
            ConflictKind::DuplicateId => write!(f, "Conflict adding id to {other}.  {action} {path}."),
            ConflictKind::ParentLoop => write!(f, "Conflict moving {path} into {other}. {action}."),
            ConflictKind::UnversionedParent => write!(
                f,
                "Conflict because {path} is not versioned, but has versioned children.  {action}."
            ),
            ConflictKind::MissingParent => write!(f, "Conflict adding files to {path}.  {action}."),
            ConflictKind::DeletingParent => {
                write!(f, "Conflict: can't delete {path} because it is not empty.  {action}.")
            }
            ConflictKind::NonDirectoryParent => write!(
                f,
                "Conflict: {path} is not a directory, but has files in it.  {action}."
            ),
            kind => write!(f, "Conflict ({kind}) at {path}.  {action}."),
        }
    }
}

/// Translate repairs into final-path records, sorted by path then kind.
///
/// # Errors
/// Returns [`TransformError::NoFinalPath`] if a recorded node has no final
/// path.
pub fn cook_conflicts(resolved: &[ResolvedConflict], tt: &TreeTransform<'_>) -> Result<Vec<CookedConflict>> {
    let mut paths = FinalPaths::new(tt.ledger());
    let mut cooked = Vec::with_capacity(resolved.len());
    for record in resolved {
        let (conflict_path, conflict_file_id) = match &record.other {
            Some(other) => (Some(paths.get_path(other)?), tt.final_file_id(other)),
            None => (None, None),
        };
        cooked.push(CookedConflict {
            kind: record.kind,
            action: record.action.to_owned(),
            path: paths.get_path(&record.trans_id)?,
            file_id: tt.final_file_id(&record.trans_id),
            conflict_path,
            conflict_file_id,
        });
    }
    cooked.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    Ok(cooked)
}
