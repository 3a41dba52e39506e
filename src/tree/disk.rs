//! Local working tree with a `.brz/` control directory.
//!
//! Layout:
//!
//! ```text
//! <root>/
//!   .brz/
//!     inventory        JSON inventory (see model::inventory)
//!     hashcache        observed SHA-1s keyed by path, size and mtime
//!     conflicts        pending cooked conflicts (JSON)
//!     transform.toml   optional configuration
//!     lock             advisory lock file
//!     limbo/           transform scratch area (only during a session)
//!     pending-deletion/
//! ```

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, TransformConfig};
use crate::error::{Result, TransformError};
use crate::filters::{FilterProvider, FilterStack};
use crate::model::inventory::{Inventory, InventoryDelta};
use crate::model::types::{ContentSummary, FileId, Kind, RevisionId};
use crate::transform::resolve::CookedConflict;

use super::{Tree, WorkingTree};

/// Name of the control directory inside a working tree.
pub const CONTROL_DIR: &str = ".brz";

const INVENTORY_FILE: &str = "inventory";
const HASHCACHE_FILE: &str = "hashcache";
const CONFLICTS_FILE: &str = "conflicts";
const CONFIG_FILE: &str = "transform.toml";
const LOCK_FILE: &str = "lock";

// ---------------------------------------------------------------------------
// Lock state
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LockMode {
    Read,
    Write,
}

#[derive(Debug, Default)]
struct LockState {
    mode: Option<LockMode>,
    count: usize,
    /// Holds the OS advisory lock while open.
    file: Option<File>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct HashEntry {
    sha1: String,
    size: u64,
    mtime_ns: u128,
}

// ---------------------------------------------------------------------------
// DiskTree
// ---------------------------------------------------------------------------

/// A working tree rooted at a directory on the local filesystem.
#[derive(Debug)]
pub struct DiskTree {
    root: PathBuf,
    inventory: RefCell<Inventory>,
    hashes: RefCell<BTreeMap<String, HashEntry>>,
    lock: RefCell<LockState>,
    filters: Option<Arc<dyn FilterProvider>>,
    case_sensitive: bool,
}

impl DiskTree {
    /// Create a new working tree at `root` with an empty, versioned root.
    ///
    /// # Errors
    /// Returns [`TransformError::FileExists`] if `root` already has a control
    /// directory, or an I/O error.
    pub fn init(root: &Path) -> Result<Self> {
        let control = root.join(CONTROL_DIR);
        if control.exists() {
            return Err(TransformError::FileExists { path: control });
        }
        fs::create_dir_all(&control)?;
        Inventory::with_root(FileId::random()).save(&control.join(INVENTORY_FILE))?;
        Self::open(root)
    }

    /// Open an existing working tree.
    ///
    /// # Errors
    /// Returns [`TransformError::NoSuchFile`] if there is no control
    /// directory, or an error loading the inventory or configuration.
    pub fn open(root: &Path) -> Result<Self> {
        let control = root.join(CONTROL_DIR);
        if !control.is_dir() {
            return Err(TransformError::NoSuchFile {
                path: control.display().to_string(),
            });
        }
        let inventory = Inventory::load(&control.join(INVENTORY_FILE))?;
        let hashes = match fs::read_to_string(control.join(HASHCACHE_FILE)) {
            Ok(s) => serde_json::from_str(&s)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        let config = TransformConfig::load(&control.join(CONFIG_FILE))?;
        Ok(Self {
            root: root.to_owned(),
            inventory: RefCell::new(inventory),
            hashes: RefCell::new(hashes),
            lock: RefCell::new(LockState::default()),
            filters: None,
            case_sensitive: config.transform.case_sensitive.unwrap_or(true),
        })
    }

    /// Install a content-filter provider.
    #[must_use]
    pub fn with_filters(mut self, provider: Arc<dyn FilterProvider>) -> Self {
        self.filters = Some(provider);
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Load `.brz/transform.toml`.
    ///
    /// # Errors
    /// Returns the parse error with path and line.
    pub fn config(&self) -> Result<TransformConfig, ConfigError> {
        TransformConfig::load(&self.control_dir().join(CONFIG_FILE))
    }

    /// A snapshot of the current inventory.
    #[must_use]
    pub fn inventory(&self) -> Inventory {
        self.inventory.borrow().clone()
    }

    /// Version existing on-disk paths, minting fresh file ids.
    ///
    /// Paths must be given parents-first.
    ///
    /// # Errors
    /// Returns [`TransformError::NoSuchFile`] for a missing path, or an
    /// inventory error if a path or its parent is in the wrong state.
    pub fn add(&self, paths: &[&str]) -> Result<Vec<FileId>> {
        let ids = paths.iter().map(|_| FileId::random()).collect::<Vec<_>>();
        let pairs: Vec<(&str, FileId)> = paths.iter().copied().zip(ids.iter().cloned()).collect();
        self.add_with_ids(&pairs)?;
        Ok(ids)
    }

    /// Version existing on-disk paths under the given file ids.
    ///
    /// # Errors
    /// See [`DiskTree::add`].
    pub fn add_with_ids(&self, entries: &[(&str, FileId)]) -> Result<()> {
        self.lock_write()?;
        let result = self.add_locked(entries);
        self.unlock()?;
        result
    }

    fn add_locked(&self, entries: &[(&str, FileId)]) -> Result<()> {
        let mut inventory = self.inventory.borrow().clone();
        for (path, file_id) in entries {
            let kind = self.kind(path).ok_or_else(|| TransformError::NoSuchFile {
                path: (*path).to_owned(),
            })?;
            inventory.add_path(path, kind, file_id.clone())?;
            if kind == Kind::File && self.is_executable(path) {
                inventory.set_executable(file_id, true)?;
            }
        }
        inventory.save(&self.control_dir().join(INVENTORY_FILE))?;
        *self.inventory.borrow_mut() = inventory;
        Ok(())
    }

    /// Persist pending conflicts.
    ///
    /// # Errors
    /// Returns an I/O or JSON error.
    pub fn set_conflicts(&self, conflicts: &[CookedConflict]) -> Result<()> {
        let path = self.control_dir().join(CONFLICTS_FILE);
        if conflicts.is_empty() {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            return Ok(());
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_string_pretty(conflicts)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Pending conflicts recorded by [`DiskTree::set_conflicts`].
    ///
    /// # Errors
    /// Returns an I/O or JSON error.
    pub fn conflicts(&self) -> Result<Vec<CookedConflict>> {
        match fs::read_to_string(self.control_dir().join(CONFLICTS_FILE)) {
            Ok(s) => Ok(serde_json::from_str(&s)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn metadata(&self, path: &str) -> Option<fs::Metadata> {
        if self.is_control_filename(path) {
            return None;
        }
        fs::symlink_metadata(self.abspath(path)).ok()
    }

    fn require_write_lock(&self) -> Result<()> {
        if self.lock.borrow().mode == Some(LockMode::Write) {
            Ok(())
        } else {
            Err(TransformError::LockNotHeld {
                path: self.root.clone(),
            })
        }
    }

    fn lock(&self, mode: LockMode) -> Result<()> {
        let mut state = self.lock.borrow_mut();
        if let Some(held) = state.mode {
            if held == LockMode::Read && mode == LockMode::Write {
                return Err(TransformError::LockContention {
                    path: self.root.clone(),
                });
            }
            state.count += 1;
            return Ok(());
        }
        let lock_path = self.control_dir().join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        let locked = match mode {
            LockMode::Read => fs4::fs_std::FileExt::try_lock_shared(&file),
            LockMode::Write => fs4::fs_std::FileExt::try_lock_exclusive(&file),
        };
        if let Err(e) = locked {
            tracing::debug!(path = %lock_path.display(), error = %e, "tree lock unavailable");
            return Err(TransformError::LockContention {
                path: self.root.clone(),
            });
        }
        state.mode = Some(mode);
        state.count = 1;
        state.file = Some(file);
        Ok(())
    }

    fn save_hashes(&self) -> Result<()> {
        let path = self.control_dir().join(HASHCACHE_FILE);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_string(&*self.hashes.borrow())?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn cached_sha1(&self, path: &str, meta: &fs::Metadata) -> Option<String> {
        let hashes = self.hashes.borrow();
        let entry = hashes.get(path)?;
        (entry.size == meta.len() && Some(entry.mtime_ns) == mtime_ns(meta))
            .then(|| entry.sha1.clone())
    }
}

fn mtime_ns(meta: &fs::Metadata) -> Option<u128> {
    meta.modified()
        .ok()?
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_nanos())
}

#[cfg(unix)]
fn mode_is_executable(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o100 != 0
}

#[cfg(not(unix))]
const fn mode_is_executable(_meta: &fs::Metadata) -> bool {
    false
}

fn not_found(path: &str) -> impl FnOnce(io::Error) -> TransformError + '_ {
    move |e| {
        if e.kind() == io::ErrorKind::NotFound {
            TransformError::NoSuchFile {
                path: path.to_owned(),
            }
        } else {
            TransformError::Io(e)
        }
    }
}

impl Tree for DiskTree {
    fn kind(&self, path: &str) -> Option<Kind> {
        let meta = self.metadata(path)?;
        let ft = meta.file_type();
        if ft.is_symlink() {
            Some(Kind::Symlink)
        } else if ft.is_dir() {
            if self.stored_kind(path) == Some(Kind::TreeReference) {
                Some(Kind::TreeReference)
            } else {
                Some(Kind::Directory)
            }
        } else if ft.is_file() {
            Some(Kind::File)
        } else {
            None
        }
    }

    fn stored_kind(&self, path: &str) -> Option<Kind> {
        self.inventory.borrow().entry_by_path(path).map(|e| e.kind)
    }

    fn path_content_summary(&self, path: &str) -> ContentSummary {
        let Some(meta) = self.metadata(path) else {
            return ContentSummary::missing();
        };
        match self.kind(path) {
            Some(Kind::File) => ContentSummary {
                kind: Some(Kind::File),
                size: Some(meta.len()),
                executable: mode_is_executable(&meta),
                sha1: self.cached_sha1(path, &meta),
                target: None,
            },
            Some(Kind::Symlink) => ContentSummary {
                kind: Some(Kind::Symlink),
                target: self.get_symlink_target(path).ok(),
                ..ContentSummary::default()
            },
            Some(Kind::TreeReference) => ContentSummary {
                kind: Some(Kind::TreeReference),
                target: self
                    .get_reference_revision(path)
                    .ok()
                    .flatten()
                    .map(|r| r.to_string()),
                ..ContentSummary::default()
            },
            kind => ContentSummary {
                kind,
                ..ContentSummary::default()
            },
        }
    }

    fn get_file(&self, path: &str) -> Result<Vec<u8>> {
        if self.is_control_filename(path) {
            return Err(TransformError::NoSuchFile {
                path: path.to_owned(),
            });
        }
        fs::read(self.abspath(path)).map_err(not_found(path))
    }

    fn get_symlink_target(&self, path: &str) -> Result<String> {
        let target = fs::read_link(self.abspath(path)).map_err(not_found(path))?;
        Ok(target.to_string_lossy().into_owned())
    }

    fn get_reference_revision(&self, path: &str) -> Result<Option<RevisionId>> {
        self.inventory
            .borrow()
            .entry_by_path(path)
            .map(|e| e.reference_revision.clone())
            .ok_or_else(|| TransformError::NoSuchFile {
                path: path.to_owned(),
            })
    }

    fn is_executable(&self, path: &str) -> bool {
        self.metadata(path)
            .is_some_and(|m| m.file_type().is_file() && mode_is_executable(&m))
    }

    fn list_children(&self, path: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.abspath(path))? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if path.is_empty() && name == CONTROL_DIR {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    fn path2id(&self, path: &str) -> Option<FileId> {
        self.inventory.borrow().path2id(path).cloned()
    }

    fn id2path(&self, file_id: &FileId) -> Option<String> {
        self.inventory.borrow().id2path(file_id).map(str::to_owned)
    }

    fn all_file_ids(&self) -> BTreeSet<FileId> {
        self.inventory.borrow().all_file_ids()
    }

    fn supports_symlinks(&self) -> bool {
        cfg!(unix)
    }

    fn case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    fn lock_read(&self) -> Result<()> {
        self.lock(LockMode::Read)
    }

    fn lock_write(&self) -> Result<()> {
        self.lock(LockMode::Write)
    }

    fn unlock(&self) -> Result<()> {
        let mut state = self.lock.borrow_mut();
        if state.count == 0 {
            return Err(TransformError::LockNotHeld {
                path: self.root.clone(),
            });
        }
        state.count -= 1;
        if state.count == 0 {
            state.mode = None;
            // Dropping the handle releases the OS lock.
            state.file = None;
        }
        Ok(())
    }
}

impl WorkingTree for DiskTree {
    fn as_tree(&self) -> &dyn Tree {
        self
    }

    fn abspath(&self, path: &str) -> PathBuf {
        if path.is_empty() {
            self.root.clone()
        } else {
            self.root.join(path)
        }
    }

    fn control_dir(&self) -> PathBuf {
        self.root.join(CONTROL_DIR)
    }

    fn is_control_filename(&self, path: &str) -> bool {
        path == CONTROL_DIR || path.starts_with(".brz/")
    }

    fn apply_inventory_delta(&self, delta: &[InventoryDelta]) -> Result<()> {
        self.require_write_lock()?;
        let mut inventory = self.inventory.borrow().clone();
        inventory.apply_delta(delta)?;
        inventory.save(&self.control_dir().join(INVENTORY_FILE))?;
        *self.inventory.borrow_mut() = inventory;
        let mut hashes = self.hashes.borrow_mut();
        for change in delta {
            if let Some(old) = &change.old_path {
                hashes.remove(old);
            }
        }
        Ok(())
    }

    fn observed_sha1(&self, path: &str, sha1: &str) -> Result<()> {
        let Some(meta) = self.metadata(path) else {
            return Ok(());
        };
        let Some(mtime_ns) = mtime_ns(&meta) else {
            return Ok(());
        };
        self.hashes.borrow_mut().insert(
            path.to_owned(),
            HashEntry {
                sha1: sha1.to_owned(),
                size: meta.len(),
                mtime_ns,
            },
        );
        self.save_hashes()
    }

    fn content_filter_stack(&self, path: &str) -> FilterStack {
        self.filters
            .as_ref()
            .map(|p| p.filter_stack(path))
            .unwrap_or_default()
    }
}
