//! Limbo: the private scratch area where new content is staged.
//!
//! Every trans-id with new content gets a limbo path before its final path
//! is known. Children of a new directory are created directly inside the
//! directory's limbo path under their final name, so moving the directory
//! into place moves them too. Everything else gets a flat slot named after
//! its trans-id and is recorded in `needs_rename`.
//!
//! No two live trans-ids ever share a limbo path: a direct path is only used
//! when no other trans-id has claimed that name (case-insensitively on
//! case-insensitive targets) inside the parent.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use filetime::FileTime;
use tempfile::TempDir;

use crate::error::{Result, TransformError};
use crate::model::types::TransId;

use super::ledger::{Ledger, NewContents};

#[derive(Debug)]
pub(crate) struct Limbo {
    dir: PathBuf,
    deletion_dir: Option<PathBuf>,
    /// Owns the directory of a preview transform.
    _scratch: Option<TempDir>,
    files: BTreeMap<TransId, PathBuf>,
    possibly_stale: BTreeSet<PathBuf>,
    children: BTreeMap<TransId, BTreeSet<TransId>>,
    children_names: BTreeMap<TransId, BTreeMap<String, TransId>>,
    needs_rename: BTreeSet<TransId>,
    creation_mtime: Option<FileTime>,
    case_sensitive: bool,
}

impl Limbo {
    /// Limbo inside a working tree's control directory.
    ///
    /// Refuses to start over leftovers of an interrupted session.
    pub(crate) fn in_control_dir(control_dir: &Path, case_sensitive: bool) -> Result<Self> {
        let dir = control_dir.join("limbo");
        let deletion_dir = control_dir.join("pending-deletion");
        ensure_empty_directory_exists(&dir, |path| TransformError::ExistingLimbo { path })?;
        ensure_empty_directory_exists(&deletion_dir, |path| {
            TransformError::ExistingPendingDeletion { path }
        })?;
        Ok(Self::with_dirs(dir, Some(deletion_dir), None, case_sensitive))
    }

    /// Limbo in a fresh temporary directory, for previews.
    pub(crate) fn temporary(case_sensitive: bool) -> Result<Self> {
        let scratch = tempfile::Builder::new().prefix("brz-limbo-").tempdir()?;
        let dir = scratch.path().to_owned();
        Ok(Self::with_dirs(dir, None, Some(scratch), case_sensitive))
    }

    fn with_dirs(
        dir: PathBuf,
        deletion_dir: Option<PathBuf>,
        scratch: Option<TempDir>,
        case_sensitive: bool,
    ) -> Self {
        Self {
            dir,
            deletion_dir,
            _scratch: scratch,
            files: BTreeMap::new(),
            possibly_stale: BTreeSet::new(),
            children: BTreeMap::new(),
            children_names: BTreeMap::new(),
            needs_rename: BTreeSet::new(),
            creation_mtime: None,
            case_sensitive,
        }
    }

    pub(crate) fn deletion_dir(&self) -> Option<&Path> {
        self.deletion_dir.as_deref()
    }

    pub(crate) fn needs_rename(&self) -> &BTreeSet<TransId> {
        &self.needs_rename
    }

    pub(crate) fn path_of(&self, trans_id: &TransId) -> Option<&Path> {
        self.files.get(trans_id).map(PathBuf::as_path)
    }

    /// The limbo path of `trans_id`, assigned on first use.
    pub(crate) fn name(&mut self, trans_id: &TransId, ledger: &Ledger) -> PathBuf {
        if let Some(path) = self.files.get(trans_id) {
            return path.clone();
        }
        let path = self.generate_path(trans_id, ledger);
        self.files.insert(trans_id.clone(), path.clone());
        path
    }

    fn generate_path(&mut self, trans_id: &TransId, ledger: &Ledger) -> PathBuf {
        if let Some(path) = self.direct_path(trans_id, ledger) {
            return path;
        }
        self.needs_rename.insert(trans_id.clone());
        self.dir.join(trans_id.as_str())
    }

    fn direct_path(&mut self, trans_id: &TransId, ledger: &Ledger) -> Option<PathBuf> {
        let parent = ledger.new_parent.get(trans_id)?;
        if ledger.new_contents(parent) != Some(&NewContents::Directory) {
            return None;
        }
        let filename = ledger.new_name.get(trans_id)?;
        let parent_path = self.files.get(parent)?.clone();
        let names = self.children_names.entry(parent.clone()).or_default();
        let free = if self.case_sensitive {
            names.get(filename).is_none_or(|owner| owner == trans_id)
        } else {
            let lower = filename.to_lowercase();
            !names
                .iter()
                .any(|(name, owner)| owner != trans_id && name.to_lowercase() == lower)
        };
        if !free {
            return None;
        }
        names.insert(filename.clone(), trans_id.clone());
        self.children
            .entry(parent.clone())
            .or_default()
            .insert(trans_id.clone());
        Some(parent_path.join(filename))
    }

    /// Keep a direct limbo path in step with a changed final path.
    pub(crate) fn path_adjusted(
        &mut self,
        trans_id: &TransId,
        previous_parent: Option<&TransId>,
        previous_name: Option<&str>,
        ledger: &Ledger,
    ) -> Result<()> {
        if !self.files.contains_key(trans_id) || self.needs_rename.contains(trans_id) {
            return Ok(());
        }
        self.rename_in_limbo(std::slice::from_ref(trans_id), ledger)?;
        let Some(previous_parent) = previous_parent else {
            return Ok(());
        };
        let parent_changed = ledger.new_parent.get(trans_id) != Some(previous_parent);
        if parent_changed && let Some(children) = self.children.get_mut(previous_parent) {
            children.remove(trans_id);
        }
        let name_changed = ledger.new_name.get(trans_id).map(String::as_str) != previous_name;
        if (parent_changed || name_changed)
            && let (Some(names), Some(name)) =
                (self.children_names.get_mut(previous_parent), previous_name)
            && names.get(name) == Some(trans_id)
        {
            names.remove(name);
        }
        Ok(())
    }

    /// Move content whose direct limbo path no longer matches its final
    /// path to a freshly generated one.
    pub(crate) fn rename_in_limbo(&mut self, trans_ids: &[TransId], ledger: &Ledger) -> Result<()> {
        for trans_id in trans_ids {
            let Some(old_path) = self.files.remove(trans_id) else {
                continue;
            };
            self.possibly_stale.insert(old_path.clone());
            if ledger.new_contents(trans_id).is_none() {
                continue;
            }
            let new_path = self.name(trans_id, ledger);
            fs::rename(&old_path, &new_path)?;
            self.possibly_stale.remove(&old_path);
            for descendant in self.descendants(trans_id) {
                if let Some(desc_path) = self.files.get_mut(&descendant)
                    && let Ok(rest) = desc_path.strip_prefix(&old_path)
                {
                    *desc_path = new_path.join(rest);
                }
            }
        }
        Ok(())
    }

    fn descendants(&self, trans_id: &TransId) -> BTreeSet<TransId> {
        let mut out = BTreeSet::new();
        let mut stack: Vec<&TransId> = vec![trans_id];
        while let Some(current) = stack.pop() {
            if let Some(children) = self.children.get(current) {
                for child in children {
                    if out.insert(child.clone()) {
                        stack.push(child);
                    }
                }
            }
        }
        out
    }

    /// Drop the staged content of `trans_id`.
    ///
    /// Its limbo children are moved to flat slots first. The ledger entry
    /// must already be gone.
    pub(crate) fn cancel_creation(&mut self, trans_id: &TransId, ledger: &Ledger) -> Result<()> {
        if let Some(children) = self.children.remove(trans_id) {
            let children: Vec<TransId> = children.into_iter().collect();
            self.rename_in_limbo(&children, ledger)?;
            self.children_names.remove(trans_id);
        }
        if let Some(path) = self.files.get(trans_id) {
            delete_any(path)?;
        }
        Ok(())
    }

    /// Give `path` the session's shared creation time.
    pub(crate) fn set_mtime(&mut self, path: &Path) -> Result<()> {
        let mtime = *self
            .creation_mtime
            .get_or_insert_with(FileTime::now);
        filetime::set_symlink_file_times(path, mtime, mtime)?;
        Ok(())
    }

    /// Forget content that has been moved to its final location.
    pub(crate) fn forget(&mut self, trans_id: &TransId) {
        self.files.remove(trans_id);
    }

    /// Drop every trace of a cancelled creation so the trans-id can be
    /// staged again from scratch. Anything still at its limbo path is
    /// deleted.
    pub(crate) fn discard(&mut self, trans_id: &TransId) {
        if let Some(path) = self.files.remove(trans_id)
            && let Err(e) = delete_any(&path)
            && e.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(path = %path.display(), error = %e, "failed to discard limbo entry");
        }
        self.needs_rename.remove(trans_id);
        self.children.remove(trans_id);
        self.children_names.remove(trans_id);
        for children in self.children.values_mut() {
            children.remove(trans_id);
        }
        for names in self.children_names.values_mut() {
            names.retain(|_, owner| owner != trans_id);
        }
    }

    /// Delete the content this session staged, then the scratch directories.
    ///
    /// Only paths holding new content are deleted; tree content moved into
    /// limbo by an interrupted apply keeps limbo alive.
    pub(crate) fn finalize(&mut self, ledger: &Ledger) -> Result<()> {
        let mut paths: Vec<PathBuf> = self
            .files
            .iter()
            .filter(|(trans_id, _)| ledger.new_contents(trans_id).is_some())
            .map(|(_, path)| path.clone())
            .collect();
        paths.extend(self.possibly_stale.iter().cloned());
        paths.sort();
        for path in paths.iter().rev() {
            if let Err(e) = delete_any(path)
                && e.kind() != io::ErrorKind::NotFound
            {
                tracing::debug!(path = %path.display(), error = %e, "limbo entry survived");
            }
        }
        self.files.clear();
        self.possibly_stale.clear();
        match fs::remove_dir(&self.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(_) => {
                return Err(TransformError::ImmortalLimbo {
                    path: self.dir.clone(),
                });
            }
        }
        if let Some(deletion_dir) = &self.deletion_dir {
            match fs::remove_dir(deletion_dir) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(_) => {
                    return Err(TransformError::ImmortalPendingDeletion {
                        path: deletion_dir.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Remove a file, symlink or empty directory.
pub(crate) fn delete_any(path: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        fs::remove_dir(path)
    } else {
        fs::remove_file(path)
    }
}

/// Create `path` as an empty directory.
///
/// An existing empty directory is removed and recreated; a non-empty one
/// yields `on_busy(path)` and is left untouched.
fn ensure_empty_directory_exists(
    path: &Path,
    on_busy: impl FnOnce(PathBuf) -> TransformError,
) -> Result<()> {
    match fs::create_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            if fs::remove_dir(path).is_err() {
                return Err(on_busy(path.to_owned()));
            }
            fs::create_dir(path)?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
