//! brz-transform: staged, conflict-resolving, rollback-safe tree edits.
//!
//! A [`TreeTransform`] records how a versioned tree should change, detects
//! and resolves structural conflicts, previews the result in memory, and
//! applies it to disk with a rename sequence that is undone on failure.
//!
//! ```no_run
//! use brz_transform::{DiskTree, TreeTransform};
//!
//! # fn main() -> brz_transform::Result<()> {
//! let wt = DiskTree::open(std::path::Path::new("."))?;
//! let mut tt = TreeTransform::new(&wt)?;
//! let root = tt.root();
//! tt.new_file("hello", &root, [b"hi\n"], None, None, None)?;
//! tt.apply(false)?;
//! tt.finalize()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod failpoints;
pub mod filters;
pub mod model;
pub mod transform;
pub mod tree;

pub use error::{Result, TransformError};
pub use model::types::{FileId, Kind, RevisionId, TransId};
pub use transform::{TransformOptions, TreeTransform};
pub use tree::{DiskTree, MemoryTree, Tree, WorkingTree};
