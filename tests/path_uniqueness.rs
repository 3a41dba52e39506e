//! Resolved transforms never place two nodes at the same path.

mod common;

use std::collections::BTreeSet;

use brz_transform::transform::resolve_conflicts;
use brz_transform::{Tree, TreeTransform};
use proptest::prelude::*;

use common::versioned_tree;

const EXISTING: [&str; 3] = ["f0", "f1", "f2"];
const NAMES: [&str; 4] = ["a", "b", "f0", "f1"];

#[derive(Clone, Debug)]
enum Op {
    Create { name: usize },
    Rename { file: usize, name: usize },
    Delete { file: usize },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..NAMES.len()).prop_map(|name| Op::Create { name }),
        (0..EXISTING.len(), 0..NAMES.len()).prop_map(|(file, name)| Op::Rename { file, name }),
        (0..EXISTING.len()).prop_map(|file| Op::Delete { file }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_applied_paths_are_unique(ops in prop::collection::vec(arb_op(), 0..5)) {
        let (dir, wt) = versioned_tree(&[("f0", "0"), ("f1", "1"), ("f2", "2")]);
        let mut tt = TreeTransform::new(&wt).unwrap();
        let root = tt.root();
        let existing: Vec<_> = EXISTING.iter().map(|p| tt.trans_id_tree_path(p)).collect();
        let mut live: BTreeSet<_> = existing.iter().cloned().collect();
        for (i, op) in ops.iter().enumerate() {
            match *op {
                Op::Create { name } => {
                    let content = format!("new {i}");
                    let id = tt
                        .new_file(NAMES[name], &root, [content.as_bytes()], None, None, None)
                        .unwrap();
                    live.insert(id);
                }
                Op::Rename { file, name } => {
                    tt.adjust_path(NAMES[name], &root, &existing[file]).unwrap();
                }
                Op::Delete { file } => {
                    tt.delete_versioned(&existing[file]);
                    live.remove(&existing[file]);
                }
            }
        }

        resolve_conflicts(&mut tt, None).unwrap();
        prop_assert!(tt.find_raw_conflicts().unwrap().is_empty());
        let mut final_paths = BTreeSet::new();
        for trans_id in &live {
            let path = tt.final_path(trans_id).unwrap();
            prop_assert!(final_paths.insert(path.clone()), "{} is used twice", path);
        }
        tt.apply(false).unwrap();

        for path in &final_paths {
            prop_assert!(dir.path().join(path).is_file(), "{} is missing", path);
        }
        let on_disk = wt.list_children("").unwrap();
        prop_assert_eq!(on_disk.len(), final_paths.len());
        for (path, _) in wt.inventory().iter() {
            if !path.is_empty() {
                prop_assert!(final_paths.contains(path), "{} is versioned but not placed", path);
            }
        }
    }
}
