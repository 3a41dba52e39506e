//! Undo-logged renames and deferred deletions.
//!
//! Every rename performed while applying a transform goes through a
//! [`Mover`]. Deletions are renames into the pending-deletion directory, so
//! until [`Mover::apply_deletions`] runs, [`Mover::rollback`] can restore the
//! tree exactly.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{Result, TransformError};
use crate::fp;

use super::limbo::delete_any;

/// Rename primitives used by apply.
///
/// Implementations must be usable once: after `rollback` or
/// `apply_deletions`, every method fails with
/// [`TransformError::MoverSpent`].
pub trait Mover {
    /// Rename `from` to `to`, recording it for rollback.
    ///
    /// # Errors
    /// - [`TransformError::FileExists`] if `to` is occupied.
    /// - [`TransformError::TransformRenameFailed`] for other OS errors.
    fn rename(&mut self, from: &Path, to: &Path) -> Result<()>;

    /// Move `from` to `to` inside the pending-deletion area.
    ///
    /// # Errors
    /// See [`Mover::rename`].
    fn pre_delete(&mut self, from: &Path, to: &Path) -> Result<()>;

    /// Undo every recorded rename, newest first.
    ///
    /// # Errors
    /// Returns [`TransformError::TransformRenameFailed`] if a rename cannot
    /// be reversed.
    fn rollback(&mut self) -> Result<()>;

    /// Remove everything moved aside by [`Mover::pre_delete`].
    ///
    /// # Errors
    /// Returns an I/O error if a path cannot be deleted.
    fn apply_deletions(&mut self) -> Result<()>;
}

#[derive(Debug, Default)]
struct Log {
    past_renames: Vec<(PathBuf, PathBuf)>,
    pending_deletions: Vec<PathBuf>,
}

/// The filesystem [`Mover`].
#[derive(Debug)]
pub struct FileMover {
    log: Option<Log>,
}

impl Default for FileMover {
    fn default() -> Self {
        Self::new()
    }
}

impl FileMover {
    #[must_use]
    pub fn new() -> Self {
        Self {
            log: Some(Log::default()),
        }
    }

    fn log(&mut self) -> Result<&mut Log> {
        self.log.as_mut().ok_or(TransformError::MoverSpent)
    }
}

impl Mover for FileMover {
    fn rename(&mut self, from: &Path, to: &Path) -> Result<()> {
        let log = self.log()?;
        fp!("FP_MOVER_RENAME")?;
        if let Err(e) = fs::rename(from, to) {
            if is_target_occupied(&e) {
                return Err(TransformError::FileExists { path: to.to_owned() });
            }
            return Err(TransformError::TransformRenameFailed {
                from: from.to_owned(),
                to: to.to_owned(),
                source: e,
            });
        }
        log.past_renames.push((from.to_owned(), to.to_owned()));
        Ok(())
    }

    fn pre_delete(&mut self, from: &Path, to: &Path) -> Result<()> {
        self.rename(from, to)?;
        self.log()?.pending_deletions.push(to.to_owned());
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        let log = self.log.take().ok_or(TransformError::MoverSpent)?;
        for (from, to) in log.past_renames.iter().rev() {
            fs::rename(to, from).map_err(|source| TransformError::TransformRenameFailed {
                from: to.clone(),
                to: from.clone(),
                source,
            })?;
        }
        tracing::debug!(renames = log.past_renames.len(), "file mover rolled back");
        Ok(())
    }

    fn apply_deletions(&mut self) -> Result<()> {
        let log = self.log.take().ok_or(TransformError::MoverSpent)?;
        for path in &log.pending_deletions {
            delete_tree(path)?;
        }
        Ok(())
    }
}

fn is_target_occupied(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::AlreadyExists | io::ErrorKind::DirectoryNotEmpty
    )
}

/// Remove `path` and, for directories, everything beneath it.
fn delete_tree(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => delete_any(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollback_restores_in_reverse_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let c = dir.path().join("c");
        fs::write(&a, b"A").unwrap();
        let mut mover = FileMover::new();
        mover.rename(&a, &b).unwrap();
        mover.rename(&b, &c).unwrap();
        assert!(c.exists() && !a.exists());
        mover.rollback().unwrap();
        assert_eq!(fs::read(&a).unwrap(), b"A");
        assert!(!b.exists() && !c.exists());
    }

    #[test]
    fn pre_delete_is_reversible_until_applied() {
        let dir = tempfile::tempdir().unwrap();
        let victim = dir.path().join("victim");
        let pending = dir.path().join("pending");
        fs::create_dir(&victim).unwrap();
        fs::write(victim.join("inner"), b"x").unwrap();

        let mut mover = FileMover::new();
        mover.pre_delete(&victim, &pending).unwrap();
        mover.rollback().unwrap();
        assert_eq!(fs::read(victim.join("inner")).unwrap(), b"x");

        let mut mover = FileMover::new();
        mover.pre_delete(&victim, &pending).unwrap();
        mover.apply_deletions().unwrap();
        assert!(!victim.exists() && !pending.exists());
    }

    #[test]
    fn occupied_directory_target_is_file_exists() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("from");
        let to = dir.path().join("to");
        fs::create_dir(&from).unwrap();
        fs::create_dir(&to).unwrap();
        fs::write(to.join("occupant"), b"").unwrap();
        let mut mover = FileMover::new();
        assert!(matches!(
            mover.rename(&from, &to),
            Err(TransformError::FileExists { .. })
        ));
    }

    #[test]
    fn missing_source_reports_both_paths() {
        let dir = tempfile::tempdir().unwrap();
        let mut mover = FileMover::new();
        let err = mover
            .rename(&dir.path().join("nope"), &dir.path().join("dest"))
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("nope") && msg.contains("dest"), "{msg}");
        assert!(msg.contains("os error 2"), "{msg}");
    }

    #[test]
    fn spent_mover_refuses_work() {
        let mut mover = FileMover::new();
        mover.apply_deletions().unwrap();
        assert!(matches!(mover.rollback(), Err(TransformError::MoverSpent)));
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            mover.rename(&dir.path().join("a"), &dir.path().join("b")),
            Err(TransformError::MoverSpent)
        ));
    }
}
