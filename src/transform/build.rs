//! Helpers that stage content copied from another tree.

use crate::error::{Result, TransformError};
use crate::filters::{FilterContext, filtered_output_bytes};
use crate::model::inventory::InventoryEntry;
use crate::model::types::{Kind, TransId};
use crate::tree::Tree;

use super::TreeTransform;

/// Stage the content found at `path` in `tree` as the new content of
/// `trans_id`.
///
/// File bytes come from `chunks` when given, otherwise from `tree`. When
/// `filter_tree_path` is set and the transform targets a working tree, the
/// bytes pass through the working tree's filter stack for that path (the
/// path the content will occupy, not where it came from).
///
/// Tree references without a pinned revision are staged as plain
/// directories.
///
/// # Errors
/// - [`TransformError::NoSuchFile`] if `path` is absent from `tree`.
/// - Any error from reading `tree` or staging content.
pub fn create_from_tree(
    tt: &mut TreeTransform<'_>,
    trans_id: &TransId,
    tree: &dyn Tree,
    path: &str,
    chunks: Option<Vec<Vec<u8>>>,
    filter_tree_path: Option<&str>,
) -> Result<()> {
    let kind = tree.kind(path).ok_or_else(|| TransformError::NoSuchFile {
        path: path.to_owned(),
    })?;
    match kind {
        Kind::Directory => tt.create_directory(trans_id),
        Kind::File => {
            let mut chunks = match chunks {
                Some(chunks) => chunks,
                None => vec![tree.get_file(path)?],
            };
            if let Some(target) = filter_tree_path
                && let Some(wt) = tt.working_tree()
            {
                let stack = wt.content_filter_stack(target);
                if !stack.is_empty() {
                    let file_id = tree.path2id(path);
                    let ctx = FilterContext {
                        path: target,
                        file_id: file_id.as_ref(),
                    };
                    chunks = filtered_output_bytes(chunks, &stack, &ctx);
                }
            }
            tt.create_file(chunks, trans_id, None, None)
        }
        Kind::Symlink => {
            let target = tree.get_symlink_target(path)?;
            tt.create_symlink(&target, trans_id)
        }
        Kind::TreeReference => match tree.get_reference_revision(path)? {
            Some(revision) => tt.create_tree_reference(revision, trans_id),
            None => tt.create_directory(trans_id),
        },
    }
}

/// Create a new versioned node under `parent` matching `entry`, reading
/// content from `path` in `tree`.
///
/// # Errors
/// Propagates errors from reading `tree` or staging content.
pub fn new_by_entry(
    path: &str,
    tt: &mut TreeTransform<'_>,
    entry: &InventoryEntry,
    parent: &TransId,
    tree: &dyn Tree,
) -> Result<TransId> {
    let file_id = Some(entry.file_id.clone());
    match entry.kind {
        Kind::File => {
            let bytes = tree.get_file(path)?;
            let executable = tree.is_executable(path);
            tt.new_file(&entry.name, parent, [bytes], file_id, Some(executable), None)
        }
        Kind::Directory | Kind::TreeReference => {
            let trans_id = tt.new_directory(&entry.name, parent, file_id)?;
            if entry.kind == Kind::TreeReference
                && let Some(revision) = &entry.reference_revision
            {
                tt.set_tree_reference(revision.clone(), &trans_id)?;
            }
            Ok(trans_id)
        }
        Kind::Symlink => {
            let target = tree.get_symlink_target(path)?;
            tt.new_symlink(&entry.name, parent, &target, file_id)
        }
    }
}
