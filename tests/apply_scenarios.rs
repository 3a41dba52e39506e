//! End-to-end transforms applied to on-disk working trees.

mod common;

use std::fs;

use brz_transform::transform::orphan::ORPHAN_DIR;
use brz_transform::transform::{ConflictKind, OrphanPolicy, cook_conflicts, resolve_conflicts};
use brz_transform::{FileId, TransformError, TransformOptions, TreeTransform};

use common::{read, versioned_tree, write_unversioned};

#[test]
fn swapping_two_names_exchanges_contents() {
    let (dir, wt) = versioned_tree(&[("name1", "A"), ("name2", "B")]);
    let inventory = wt.inventory();
    let id1 = inventory.path2id("name1").cloned().unwrap();
    let id2 = inventory.path2id("name2").cloned().unwrap();

    let mut tt = TreeTransform::new(&wt).unwrap();
    let root = tt.root();
    let t1 = tt.trans_id_tree_path("name1");
    let t2 = tt.trans_id_tree_path("name2");
    tt.adjust_path("name2", &root, &t1).unwrap();
    tt.adjust_path("name1", &root, &t2).unwrap();
    let result = tt.apply(false).unwrap();

    assert_eq!(read(dir.path(), "name1"), b"B");
    assert_eq!(read(dir.path(), "name2"), b"A");
    // Each file goes out to limbo and back in.
    assert_eq!(result.rename_count, 4);
    let inventory = wt.inventory();
    assert_eq!(inventory.path2id("name1"), Some(&id2));
    assert_eq!(inventory.path2id("name2"), Some(&id1));
}

#[test]
fn new_directory_with_child_needs_one_rename() {
    let (dir, wt) = versioned_tree(&[]);
    let mut tt = TreeTransform::new(&wt).unwrap();
    let root = tt.root();
    let d = tt.new_directory("d", &root, None).unwrap();
    tt.new_file("f", &d, [b"x"], None, None, None).unwrap();
    let result = tt.apply(false).unwrap();

    assert_eq!(result.rename_count, 1);
    assert_eq!(read(dir.path(), "d/f"), b"x");
    assert!(wt.inventory().path2id("d/f").is_some());
}

#[test]
fn finalize_is_idempotent() {
    let (dir, wt) = versioned_tree(&[("a", "a")]);
    let mut tt = TreeTransform::new(&wt).unwrap();
    let root = tt.root();
    tt.new_file("b", &root, [b"b"], None, None, None).unwrap();
    tt.apply(false).unwrap();
    tt.finalize().unwrap();
    tt.finalize().unwrap();
    assert!(!dir.path().join(".brz/limbo").exists());
    assert!(!dir.path().join(".brz/pending-deletion").exists());

    let mut unused = TreeTransform::new(&wt).unwrap();
    unused.finalize().unwrap();
    unused.finalize().unwrap();
}

#[test]
fn duplicate_name_moves_the_existing_file_aside() {
    let (dir, wt) = versioned_tree(&[("name", "old")]);
    let mut tt = TreeTransform::new(&wt).unwrap();
    let root = tt.root();
    tt.new_file("name", &root, [b"new"], Some(FileId::new("new-id")), None, None)
        .unwrap();
    let resolved = resolve_conflicts(&mut tt, None).unwrap();
    assert!(tt.find_raw_conflicts().unwrap().is_empty());
    let cooked = cook_conflicts(&resolved, &tt).unwrap();
    assert_eq!(cooked.len(), 1);
    assert_eq!(cooked[0].kind, ConflictKind::Duplicate);
    assert_eq!(cooked[0].path, "name.moved");
    tt.apply(false).unwrap();

    assert_eq!(read(dir.path(), "name"), b"new");
    assert_eq!(read(dir.path(), "name.moved"), b"old");
    assert_eq!(wt.inventory().path2id("name"), Some(&FileId::new("new-id")));

    wt.set_conflicts(&cooked).unwrap();
    assert_eq!(wt.conflicts().unwrap(), cooked);
    wt.set_conflicts(&[]).unwrap();
    assert!(wt.conflicts().unwrap().is_empty());
}

#[test]
fn orphans_block_deletion_under_conflict_policy() {
    let (dir, wt) = versioned_tree(&[("dir/", ""), ("dir/child", "c")]);
    write_unversioned(dir.path(), "dir/junk", b"j");
    let mut tt = TreeTransform::new(&wt).unwrap();
    let d = tt.trans_id_tree_path("dir");
    let child = tt.trans_id_tree_path("dir/child");
    tt.delete_versioned(&child);
    tt.delete_versioned(&d);

    let resolved = resolve_conflicts(&mut tt, None).unwrap();
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].kind, ConflictKind::DeletingParent);
    assert!(tt.find_raw_conflicts().unwrap().is_empty());
    tt.apply(false).unwrap();

    assert!(!dir.path().join("dir/child").exists());
    assert_eq!(read(dir.path(), "dir/junk"), b"j");
}

#[test]
fn orphans_are_moved_under_move_policy() {
    common::init_tracing();
    let (dir, wt) = versioned_tree(&[("dir/", ""), ("dir/child", "c")]);
    write_unversioned(dir.path(), "dir/junk", b"j");
    fs::create_dir(dir.path().join(ORPHAN_DIR)).unwrap();
    write_unversioned(dir.path(), &format!("{ORPHAN_DIR}/junk.~1~"), b"older");

    let options = TransformOptions {
        orphan_policy: OrphanPolicy::Move,
        ..Default::default()
    };
    let mut tt = TreeTransform::with_options(&wt, options).unwrap();
    let d = tt.trans_id_tree_path("dir");
    let child = tt.trans_id_tree_path("dir/child");
    tt.delete_versioned(&child);
    tt.delete_versioned(&d);

    let resolved = resolve_conflicts(&mut tt, None).unwrap();
    assert!(resolved.is_empty());
    assert!(tt.find_raw_conflicts().unwrap().is_empty());
    tt.apply(false).unwrap();

    assert!(!dir.path().join("dir").exists());
    assert_eq!(read(dir.path(), &format!("{ORPHAN_DIR}/junk.~1~")), b"older");
    assert_eq!(read(dir.path(), &format!("{ORPHAN_DIR}/junk.~2~")), b"j");
}

#[test]
fn leftover_limbo_content_blocks_a_new_session() {
    let (dir, wt) = versioned_tree(&[("a", "a")]);
    let limbo = dir.path().join(".brz/limbo");
    fs::create_dir(&limbo).unwrap();
    fs::write(limbo.join("stray"), b"unsaved").unwrap();

    match TreeTransform::new(&wt) {
        Err(TransformError::ExistingLimbo { path }) => assert_eq!(path, limbo),
        other => panic!("expected existing limbo, got {other:?}"),
    }
    assert_eq!(fs::read(limbo.join("stray")).unwrap(), b"unsaved");

    fs::remove_file(limbo.join("stray")).unwrap();
    let mut tt = TreeTransform::new(&wt).unwrap();
    tt.finalize().unwrap();
    assert!(!limbo.exists());
}

#[test]
fn leftover_pending_deletions_block_a_new_session() {
    let (dir, wt) = versioned_tree(&[("a", "a")]);
    let pending = dir.path().join(".brz/pending-deletion");
    fs::create_dir(&pending).unwrap();
    fs::write(pending.join("stray"), b"x").unwrap();

    assert!(matches!(
        TreeTransform::new(&wt),
        Err(TransformError::ExistingPendingDeletion { .. })
    ));
    assert!(pending.join("stray").exists());
}

#[test]
fn replacing_file_contents_keeps_its_identity() {
    let (dir, wt) = versioned_tree(&[("a", "before")]);
    let file_id = wt.inventory().path2id("a").cloned().unwrap();
    let mut tt = TreeTransform::new(&wt).unwrap();
    let a = tt.trans_id_tree_path("a");
    tt.delete_contents(&a);
    tt.create_file([b"after"], &a, None, None).unwrap();
    let result = tt.apply(false).unwrap();

    assert_eq!(read(dir.path(), "a"), b"after");
    assert_eq!(wt.inventory().path2id("a"), Some(&file_id));
    assert_eq!(result.modified_paths, vec![dir.path().join("a")]);
}

#[test]
fn config_orphan_policy_flows_into_options() {
    let (dir, wt) = versioned_tree(&[]);
    fs::write(
        dir.path().join(".brz/transform.toml"),
        "[transform]\norphan_policy = \"move\"\nmax_resolution_passes = 4\n",
    )
    .unwrap();
    let options = TransformOptions::from_config(&wt.config().unwrap());
    assert_eq!(options.orphan_policy, OrphanPolicy::Move);
    assert_eq!(options.max_resolution_passes, 4);
}
