//! A failed apply leaves the working tree exactly as it was.

mod common;

use std::io;
use std::path::Path;

use brz_transform::transform::{FileMover, Mover};
use brz_transform::{DiskTree, Result, TransformError, TreeTransform};

use common::{snapshot, versioned_tree};

/// Delegates to [`FileMover`] but fails the `fail_at`th rename.
struct FailingMover {
    inner: FileMover,
    renames: usize,
    fail_at: usize,
}

impl FailingMover {
    fn new(fail_at: usize) -> Self {
        Self {
            inner: FileMover::new(),
            renames: 0,
            fail_at,
        }
    }
}

impl Mover for FailingMover {
    fn rename(&mut self, from: &Path, to: &Path) -> Result<()> {
        self.renames += 1;
        if self.renames == self.fail_at {
            return Err(TransformError::TransformRenameFailed {
                from: from.to_owned(),
                to: to.to_owned(),
                source: io::Error::other("injected"),
            });
        }
        self.inner.rename(from, to)
    }

    fn pre_delete(&mut self, from: &Path, to: &Path) -> Result<()> {
        self.inner.pre_delete(from, to)
    }

    fn rollback(&mut self) -> Result<()> {
        self.inner.rollback()
    }

    fn apply_deletions(&mut self) -> Result<()> {
        self.inner.apply_deletions()
    }
}

fn fixture() -> (tempfile::TempDir, DiskTree) {
    versioned_tree(&[
        ("name1", "A"),
        ("name2", "B"),
        ("dir/", ""),
        ("dir/inner", "inner"),
        ("gone", "bye"),
    ])
}

/// Swap two files, delete one, move a directory and add new content.
fn stage(tt: &mut TreeTransform<'_>) {
    let root = tt.root();
    let t1 = tt.trans_id_tree_path("name1");
    let t2 = tt.trans_id_tree_path("name2");
    tt.adjust_path("name2", &root, &t1).unwrap();
    tt.adjust_path("name1", &root, &t2).unwrap();
    let gone = tt.trans_id_tree_path("gone");
    tt.delete_versioned(&gone);
    let dir = tt.trans_id_tree_path("dir");
    tt.adjust_path("moved", &root, &dir).unwrap();
    let fresh = tt.new_directory("fresh", &root, None).unwrap();
    tt.new_file("f", &fresh, [b"new"], None, Some(true), None).unwrap();
}

#[test]
fn every_failing_rename_rolls_back_cleanly() {
    // name1, name2 and dir go out to limbo and back, plus fresh: 7 renames.
    common::init_tracing();
    for fail_at in 1..=7 {
        let (dir, wt) = fixture();
        let before = snapshot(dir.path());
        let inventory = wt.inventory();

        let mut tt = TreeTransform::new(&wt).unwrap();
        stage(&mut tt);
        let mut mover = FailingMover::new(fail_at);
        let err = tt.apply_with_mover(false, &mut mover).unwrap_err();
        assert!(
            matches!(err, TransformError::TransformRenameFailed { .. }),
            "rename {fail_at}: {err}"
        );
        assert_eq!(tt.rename_count(), 0, "rename {fail_at}");
        tt.finalize().unwrap();

        assert_eq!(snapshot(dir.path()), before, "rename {fail_at}");
        assert_eq!(wt.inventory(), inventory, "rename {fail_at}");
        assert!(!dir.path().join(".brz/limbo").exists());
        assert!(!dir.path().join(".brz/pending-deletion").exists());
    }
}

#[test]
fn executable_change_on_an_existing_file_is_rolled_back() {
    // "a" sorts before "zz", so its mode is settled before the last rename.
    for fail_at in 1..=2 {
        let (dir, wt) = versioned_tree(&[("a", "a"), ("z", "z")]);
        let before = snapshot(dir.path());
        let inventory = wt.inventory();

        let mut tt = TreeTransform::new(&wt).unwrap();
        let root = tt.root();
        let a = tt.trans_id_tree_path("a");
        tt.set_executability(Some(true), &a).unwrap();
        let z = tt.trans_id_tree_path("z");
        tt.adjust_path("zz", &root, &z).unwrap();
        let mut mover = FailingMover::new(fail_at);
        assert!(tt.apply_with_mover(false, &mut mover).is_err());
        tt.finalize().unwrap();

        assert_eq!(snapshot(dir.path()), before, "rename {fail_at}");
        assert_eq!(wt.inventory(), inventory, "rename {fail_at}");
    }
}

#[test]
fn tree_is_usable_after_a_rolled_back_apply() {
    let (dir, wt) = fixture();
    {
        let mut tt = TreeTransform::new(&wt).unwrap();
        stage(&mut tt);
        let mut mover = FailingMover::new(3);
        assert!(tt.apply_with_mover(false, &mut mover).is_err());
    }

    let mut tt = TreeTransform::new(&wt).unwrap();
    stage(&mut tt);
    let result = tt.apply(false).unwrap();
    assert_eq!(result.rename_count, 7);
    assert_eq!(common::read(dir.path(), "name1"), b"B");
    assert_eq!(common::read(dir.path(), "moved/inner"), b"inner");
    assert_eq!(common::read(dir.path(), "fresh/f"), b"new");
    assert!(!dir.path().join("gone").exists());
}

#[cfg(feature = "failpoints")]
#[test]
fn failpoints_between_phases_roll_back() {
    use brz_transform::failpoints::{self, FailpointAction};

    for point in ["FP_APPLY_AFTER_REMOVALS", "FP_APPLY_AFTER_INSERTIONS"] {
        let (dir, wt) = fixture();
        let before = snapshot(dir.path());
        failpoints::set(point, FailpointAction::Error("crash".into()));
        let mut tt = TreeTransform::new(&wt).unwrap();
        stage(&mut tt);
        let inner = tt.trans_id_tree_path("dir/inner");
        tt.set_executability(Some(true), &inner).unwrap();
        let err = tt.apply(false).unwrap_err();
        failpoints::clear(point);
        assert!(matches!(err, TransformError::Failpoint { .. }), "{point}: {err}");
        tt.finalize().unwrap();
        assert_eq!(snapshot(dir.path()), before, "{point}");
    }
}
