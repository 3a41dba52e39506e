//! Serialized transforms can be resumed in a later session.

mod common;

use brz_transform::{FileId, TransformError, TreeTransform};

use common::{read, versioned_tree};

#[test]
fn resumed_transform_applies_like_the_original() {
    let (dir, wt) = versioned_tree(&[("keep", "k"), ("old", "o"), ("edit", "v1")]);

    let mut records = Vec::new();
    let staged_ledger = {
        let mut tt = TreeTransform::new(&wt).unwrap();
        let root = tt.root();
        let old = tt.trans_id_tree_path("old");
        tt.adjust_path("renamed", &root, &old).unwrap();
        let edit = tt.trans_id_tree_path("edit");
        tt.delete_contents(&edit);
        tt.create_file([&b"v2\n"[..], &b"more\n"[..]], &edit, None, None).unwrap();
        let d = tt.new_directory("d", &root, Some(FileId::new("d-id"))).unwrap();
        tt.new_file("f", &d, [b"\x00\x01binary"], Some(FileId::new("f-id")), None, None)
            .unwrap();
        tt.new_symlink("link", &root, "keep", None).unwrap();
        tt.serialize(&mut records).unwrap();
        tt.ledger().clone()
    };
    assert!(!dir.path().join(".brz/limbo").exists());

    let mut tt = TreeTransform::new(&wt).unwrap();
    tt.deserialize(records.as_slice()).unwrap();
    assert_eq!(tt.ledger(), &staged_ledger);
    tt.apply(false).unwrap();

    assert_eq!(read(dir.path(), "keep"), b"k");
    assert_eq!(read(dir.path(), "renamed"), b"o");
    assert_eq!(read(dir.path(), "edit"), b"v2\nmore\n");
    assert_eq!(read(dir.path(), "d/f"), b"\x00\x01binary");
    #[cfg(unix)]
    assert_eq!(
        std::fs::read_link(dir.path().join("link")).unwrap(),
        std::path::Path::new("keep")
    );
    let inventory = wt.inventory();
    assert_eq!(inventory.path2id("d/f"), Some(&FileId::new("f-id")));
    assert!(inventory.path2id("old").is_none());
    assert!(inventory.path2id("renamed").is_some());
}

#[test]
fn garbage_is_rejected_without_touching_the_ledger() {
    let (_dir, wt) = versioned_tree(&[("a", "a")]);
    let mut tt = TreeTransform::new(&wt).unwrap();
    let before = tt.ledger().clone();
    let err = tt
        .deserialize(&b"brz-transform-records 1\n{\"record\":\"end\"}\n"[..])
        .unwrap_err();
    assert!(matches!(err, TransformError::CorruptRecords { .. }), "{err}");
    assert_eq!(tt.ledger(), &before);
}
