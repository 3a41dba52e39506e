//! In-memory source tree.
//!
//! [`MemoryTree`] is a read-only [`Tree`] built up programmatically. It is
//! used as the source for preview transforms and in tests.

use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Result, TransformError};
use crate::model::inventory::split_path;
use crate::model::types::{ContentSummary, FileId, Kind, RevisionId};

use super::{Tree, sha1_hex};

/// File id given to the root of every [`MemoryTree`].
pub const MEMORY_ROOT_ID: &str = "TREE_ROOT";

#[derive(Clone, Debug)]
struct Node {
    kind: Kind,
    file_id: Option<FileId>,
    content: Vec<u8>,
    target: Option<String>,
    executable: bool,
    reference_revision: Option<RevisionId>,
}

impl Node {
    const fn new(kind: Kind, file_id: Option<FileId>) -> Self {
        Self {
            kind,
            file_id,
            content: Vec::new(),
            target: None,
            executable: false,
            reference_revision: None,
        }
    }
}

/// A tree held entirely in memory.
#[derive(Clone, Debug)]
pub struct MemoryTree {
    nodes: BTreeMap<String, Node>,
    versions_directories: bool,
    case_sensitive: bool,
    locks: Cell<usize>,
}

impl Default for MemoryTree {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTree {
    /// A tree holding only a versioned root.
    #[must_use]
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            String::new(),
            Node::new(Kind::Directory, Some(FileId::new(MEMORY_ROOT_ID))),
        );
        Self {
            nodes,
            versions_directories: true,
            case_sensitive: true,
            locks: Cell::new(0),
        }
    }

    /// The id [`MemoryTree`] assigns to `path` when none is given.
    #[must_use]
    pub fn default_id(path: &str) -> FileId {
        FileId::new(format!("{}-id", path.replace('/', "-")))
    }

    fn insert(&mut self, path: &str, node: Node) -> &mut Self {
        let (parent, _) = split_path(path);
        if !self.nodes.contains_key(parent) {
            self.add_dir(parent);
        }
        self.nodes.insert(path.to_owned(), node);
        self
    }

    /// Add a versioned directory (and any missing ancestors).
    pub fn add_dir(&mut self, path: &str) -> &mut Self {
        self.insert(path, Node::new(Kind::Directory, Some(Self::default_id(path))))
    }

    /// Add a versioned file.
    pub fn add_file(&mut self, path: &str, content: &[u8]) -> &mut Self {
        let mut node = Node::new(Kind::File, Some(Self::default_id(path)));
        node.content = content.to_vec();
        self.insert(path, node)
    }

    /// Add a file that exists in the tree but is not versioned.
    pub fn add_unversioned_file(&mut self, path: &str, content: &[u8]) -> &mut Self {
        let mut node = Node::new(Kind::File, None);
        node.content = content.to_vec();
        self.insert(path, node)
    }

    pub fn add_symlink(&mut self, path: &str, target: &str) -> &mut Self {
        let mut node = Node::new(Kind::Symlink, Some(Self::default_id(path)));
        node.target = Some(target.to_owned());
        self.insert(path, node)
    }

    pub fn add_tree_reference(&mut self, path: &str, revision: &RevisionId) -> &mut Self {
        let mut node = Node::new(Kind::TreeReference, Some(Self::default_id(path)));
        node.reference_revision = Some(revision.clone());
        self.insert(path, node)
    }

    /// Replace the file id at `path` (`None` unversions it).
    pub fn set_file_id(&mut self, path: &str, file_id: Option<FileId>) -> &mut Self {
        if let Some(node) = self.nodes.get_mut(path) {
            node.file_id = file_id;
        }
        self
    }

    pub fn set_executable(&mut self, path: &str, executable: bool) -> &mut Self {
        if let Some(node) = self.nodes.get_mut(path) {
            node.executable = executable;
        }
        self
    }

    pub fn set_versions_directories(&mut self, value: bool) -> &mut Self {
        self.versions_directories = value;
        self
    }

    pub fn set_case_sensitive(&mut self, value: bool) -> &mut Self {
        self.case_sensitive = value;
        self
    }

    /// Number of locks currently held.
    #[must_use]
    pub fn lock_count(&self) -> usize {
        self.locks.get()
    }

    fn node(&self, path: &str) -> Result<&Node> {
        self.nodes.get(path).ok_or_else(|| TransformError::NoSuchFile {
            path: path.to_owned(),
        })
    }
}

impl Tree for MemoryTree {
    fn kind(&self, path: &str) -> Option<Kind> {
        self.nodes.get(path).map(|n| n.kind)
    }

    fn path_content_summary(&self, path: &str) -> ContentSummary {
        let Some(node) = self.nodes.get(path) else {
            return ContentSummary::missing();
        };
        match node.kind {
            Kind::File => ContentSummary {
                kind: Some(Kind::File),
                size: Some(node.content.len() as u64),
                executable: node.executable,
                sha1: Some(sha1_hex(&node.content)),
                target: None,
            },
            Kind::Symlink => ContentSummary {
                kind: Some(Kind::Symlink),
                target: node.target.clone(),
                ..ContentSummary::default()
            },
            Kind::TreeReference => ContentSummary {
                kind: Some(Kind::TreeReference),
                target: node.reference_revision.as_ref().map(ToString::to_string),
                ..ContentSummary::default()
            },
            Kind::Directory => ContentSummary {
                kind: Some(Kind::Directory),
                ..ContentSummary::default()
            },
        }
    }

    fn get_file(&self, path: &str) -> Result<Vec<u8>> {
        let node = self.node(path)?;
        if node.kind == Kind::File {
            Ok(node.content.clone())
        } else {
            Err(TransformError::NoSuchFile {
                path: path.to_owned(),
            })
        }
    }

    fn get_symlink_target(&self, path: &str) -> Result<String> {
        self.node(path)?
            .target
            .clone()
            .ok_or_else(|| TransformError::NoSuchFile {
                path: path.to_owned(),
            })
    }

    fn get_reference_revision(&self, path: &str) -> Result<Option<RevisionId>> {
        Ok(self.node(path)?.reference_revision.clone())
    }

    fn is_executable(&self, path: &str) -> bool {
        self.nodes.get(path).is_some_and(|n| n.executable)
    }

    fn list_children(&self, path: &str) -> Result<Vec<String>> {
        Ok(self
            .nodes
            .keys()
            .filter(|p| !p.is_empty())
            .filter_map(|p| {
                let (parent, name) = split_path(p);
                (parent == path).then(|| name.to_owned())
            })
            .collect())
    }

    fn path2id(&self, path: &str) -> Option<FileId> {
        self.nodes.get(path).and_then(|n| n.file_id.clone())
    }

    fn id2path(&self, file_id: &FileId) -> Option<String> {
        self.nodes
            .iter()
            .find(|(_, n)| n.file_id.as_ref() == Some(file_id))
            .map(|(p, _)| p.clone())
    }

    fn all_file_ids(&self) -> BTreeSet<FileId> {
        self.nodes.values().filter_map(|n| n.file_id.clone()).collect()
    }

    fn versions_directories(&self) -> bool {
        self.versions_directories
    }

    fn case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    fn lock_read(&self) -> Result<()> {
        self.locks.set(self.locks.get() + 1);
        Ok(())
    }

    fn unlock(&self) -> Result<()> {
        match self.locks.get() {
            0 => Err(TransformError::LockNotHeld {
                path: std::path::PathBuf::from("<memory>"),
            }),
            n => {
                self.locks.set(n - 1);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_creates_missing_ancestors() {
        let mut tree = MemoryTree::new();
        tree.add_file("a/b/c", b"x");
        assert_eq!(tree.kind("a"), Some(Kind::Directory));
        assert_eq!(tree.kind("a/b"), Some(Kind::Directory));
        assert_eq!(tree.path2id("a/b/c"), Some(FileId::new("a-b-c-id")));
        assert_eq!(tree.id2path(&FileId::new("a-id")).as_deref(), Some("a"));
    }

    #[test]
    fn list_children_is_direct_only() {
        let mut tree = MemoryTree::new();
        tree.add_file("a/x", b"").add_file("b", b"").add_dir("c");
        assert_eq!(tree.list_children("").unwrap(), vec!["a", "b", "c"]);
        assert_eq!(tree.list_children("a").unwrap(), vec!["x"]);
    }

    #[test]
    fn unversioned_files_have_no_id() {
        let mut tree = MemoryTree::new();
        tree.add_unversioned_file("junk", b"j");
        assert!(tree.has_filename("junk"));
        assert!(!tree.is_versioned("junk"));
        assert_eq!(tree.get_file("junk").unwrap(), b"j");
    }

    #[test]
    fn memory_tree_is_read_only() {
        let tree = MemoryTree::new();
        assert!(matches!(tree.lock_write(), Err(TransformError::ReadOnly)));
        tree.lock_read().unwrap();
        assert_eq!(tree.lock_count(), 1);
        tree.unlock().unwrap();
        assert!(tree.unlock().is_err());
    }
}
