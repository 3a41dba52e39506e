//! Core identifier and kind types for tree transforms.
//!
//! Foundation types shared by the transform engine, the tree capability
//! traits and the persistent inventory: transaction ids, persistent file
//! ids, revision ids, the closed set of node kinds, and content summaries.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// TransId
// ---------------------------------------------------------------------------

/// Sentinel parent of the tree root.
const ROOT_PARENT: &str = "root-parent";

/// An opaque per-session identifier for a node of the future tree.
///
/// Trans-ids are minted by a transform (`new-0`, `new-1`, ...) and are only
/// meaningful to the transform that minted them. The special value returned
/// by [`TransId::root_parent`] is the parent of the tree root.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransId(String);

impl TransId {
    /// Build the trans-id for the `n`th allocation of a session.
    #[must_use]
    pub fn numbered(n: u64) -> Self {
        Self(format!("new-{n}"))
    }

    /// The sentinel parent of the tree root.
    #[must_use]
    pub fn root_parent() -> Self {
        Self(ROOT_PARENT.to_owned())
    }

    /// Return `true` if this is the root-parent sentinel.
    #[must_use]
    pub fn is_root_parent(&self) -> bool {
        self.0 == ROOT_PARENT
    }

    /// Return the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// FileId
// ---------------------------------------------------------------------------

/// A persistent identity for a versioned node.
///
/// The engine treats file ids as opaque: it only needs equality, ordering and
/// a way to mint a fresh one ([`FileId::random`]) when none is supplied.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(String);

impl FileId {
    /// Wrap an existing identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint a fresh random identifier (32 lowercase hex characters).
    #[must_use]
    pub fn random() -> Self {
        Self(format!("{:032x}", rand::random::<u128>()))
    }

    /// Return the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FileId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// RevisionId
// ---------------------------------------------------------------------------

/// A revision pointer pinned by a nested tree reference.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionId(String);

impl RevisionId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Kind
// ---------------------------------------------------------------------------

/// The kind of a tree node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Kind {
    File,
    Directory,
    Symlink,
    TreeReference,
}

impl Kind {
    /// The canonical lowercase name (`"file"`, `"tree-reference"`, ...).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Directory => "directory",
            Self::Symlink => "symlink",
            Self::TreeReference => "tree-reference",
        }
    }

    /// Directories and tree references can hold children.
    #[must_use]
    pub const fn is_directory_like(self) -> bool {
        matches!(self, Self::Directory | Self::TreeReference)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown kind name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnknownKind(pub String);

impl fmt::Display for UnknownKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown node kind {:?}", self.0)
    }
}

impl std::error::Error for UnknownKind {}

impl FromStr for Kind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(Self::File),
            "directory" => Ok(Self::Directory),
            "symlink" => Ok(Self::Symlink),
            "tree-reference" => Ok(Self::TreeReference),
            other => Err(UnknownKind(other.to_owned())),
        }
    }
}

// ---------------------------------------------------------------------------
// ContentSummary
// ---------------------------------------------------------------------------

/// A cheap summary of what occupies a path.
///
/// `kind` is `None` when the path is missing. `size` and `sha1` are only
/// known for regular files, and `sha1` only when the tree has it cached.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContentSummary {
    pub kind: Option<Kind>,
    pub size: Option<u64>,
    pub executable: bool,
    pub sha1: Option<String>,
    /// Symlink target, or the pinned revision of a tree reference.
    pub target: Option<String>,
}

impl ContentSummary {
    /// Summary of a missing path.
    #[must_use]
    pub fn missing() -> Self {
        Self::default()
    }
}
