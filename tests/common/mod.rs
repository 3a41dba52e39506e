//! Shared fixtures for integration tests.
//!
//! Every tree lives in its own temp directory.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use brz_transform::DiskTree;
use tempfile::TempDir;

/// A node as seen on disk, for before/after comparisons.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Node {
    Dir { mode: u32 },
    File { bytes: Vec<u8>, mode: u32 },
    Symlink { target: String },
}

/// Route library logs to the test harness. Honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Build a versioned working tree from `(path, content)` pairs. Entries
/// ending in `/` are directories; list parents before children.
pub fn versioned_tree(entries: &[(&str, &str)]) -> (TempDir, DiskTree) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let wt = DiskTree::init(dir.path()).expect("failed to init tree");
    let mut paths = Vec::new();
    for (path, bytes) in entries {
        let rel = path.trim_end_matches('/');
        let full = dir.path().join(rel);
        if path.ends_with('/') {
            fs::create_dir(&full).expect("failed to create directory");
        } else {
            fs::write(&full, bytes).expect("failed to write file");
        }
        paths.push(rel);
    }
    wt.add(&paths).expect("failed to version paths");
    (dir, wt)
}

/// Write an unversioned file.
pub fn write_unversioned(root: &Path, path: &str, bytes: &[u8]) {
    fs::write(root.join(path), bytes).expect("failed to write file");
}

pub fn read(root: &Path, path: &str) -> Vec<u8> {
    fs::read(root.join(path)).expect("failed to read file")
}

/// Every path under `root` except the control directory.
pub fn snapshot(root: &Path) -> BTreeMap<String, Node> {
    let mut nodes = BTreeMap::new();
    walk(root, "", &mut nodes);
    nodes
}

fn walk(root: &Path, rel: &str, nodes: &mut BTreeMap<String, Node>) {
    let dir = if rel.is_empty() { root.to_owned() } else { root.join(rel) };
    for entry in fs::read_dir(&dir).expect("failed to list directory") {
        let entry = entry.expect("failed to read directory entry");
        let name = entry.file_name().to_string_lossy().into_owned();
        if rel.is_empty() && name == ".brz" {
            continue;
        }
        let child = if rel.is_empty() { name } else { format!("{rel}/{name}") };
        let meta = fs::symlink_metadata(entry.path()).expect("failed to stat");
        let node = if meta.file_type().is_symlink() {
            let target = fs::read_link(entry.path()).expect("failed to read link");
            Node::Symlink {
                target: target.to_string_lossy().into_owned(),
            }
        } else if meta.is_dir() {
            walk(root, &child, nodes);
            Node::Dir { mode: mode(&meta) }
        } else {
            Node::File {
                bytes: fs::read(entry.path()).expect("failed to read file"),
                mode: mode(&meta),
            }
        };
        nodes.insert(child, node);
    }
}

#[cfg(unix)]
fn mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o777
}

#[cfg(not(unix))]
fn mode(meta: &fs::Metadata) -> u32 {
    u32::from(meta.permissions().readonly())
}
