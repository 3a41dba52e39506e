//! Transform benchmarks.
//!
//! # Running
//!
//! ```bash
//! cargo bench --bench transform_apply
//! # With a custom filter:
//! cargo bench --bench transform_apply -- conflicts
//! ```

use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

use brz_transform::transform::resolve_conflicts;
use brz_transform::{DiskTree, MemoryTree, TreeTransform};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// A working tree with `n` versioned files spread over a few directories.
fn make_tree(n: usize) -> (tempfile::TempDir, DiskTree) {
    let dir = tempfile::tempdir().expect("tempdir");
    let wt = DiskTree::init(dir.path()).expect("init");
    let chunk = 50.max(n / 10);
    let mut paths = Vec::new();
    for i in 0..n {
        let sub = format!("part{}", i / chunk);
        if !dir.path().join(&sub).exists() {
            std::fs::create_dir(dir.path().join(&sub)).expect("mkdir");
            paths.push(sub.clone());
        }
        let path = format!("{sub}/file{i}.txt");
        std::fs::write(dir.path().join(&path), format!("bench file {i}\n")).expect("write");
        paths.push(path);
    }
    let refs: Vec<&str> = paths.iter().map(String::as_str).collect();
    wt.add(&refs).expect("add");
    (dir, wt)
}

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

/// Stage `n` new files in one new directory and apply.
fn bench_apply_new_files(c: &mut Criterion) {
    let mut group = c.benchmark_group("apply_new_files");
    for &n in &[10_usize, 100, 1_000] {
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::new("files", n), &n, |b, &n| {
            b.iter_batched(
                || make_tree(0),
                |(_dir, wt)| {
                    let mut tt = TreeTransform::new(&wt).expect("transform");
                    let root = tt.root();
                    let d = tt.new_directory("new", &root, None).expect("dir");
                    for i in 0..n {
                        tt.new_file(&format!("f{i}"), &d, [b"x"], None, None, None)
                            .expect("file");
                    }
                    tt.apply(false).expect("apply")
                },
                BatchSize::PerIteration,
            );
        });
    }
    group.finish();
}

/// Rename every versioned file and apply.
fn bench_apply_renames(c: &mut Criterion) {
    let mut group = c.benchmark_group("apply_renames");
    for &n in &[10_usize, 100, 1_000] {
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::new("files", n), &n, |b, _| {
            b.iter_batched(
                || make_tree(n),
                |(_dir, wt)| {
                    let paths: Vec<String> = wt
                        .inventory()
                        .iter()
                        .filter(|(p, e)| p.contains('/') && !e.kind.is_directory_like())
                        .map(|(p, _)| p.to_owned())
                        .collect();
                    let mut tt = TreeTransform::new(&wt).expect("transform");
                    for path in &paths {
                        let trans_id = tt.trans_id_tree_path(path);
                        let parent = tt.get_tree_parent(&trans_id).expect("parent");
                        let name = format!("{}.renamed", tt.final_name(&trans_id).expect("name"));
                        tt.adjust_path(&name, &parent, &trans_id).expect("adjust");
                    }
                    tt.apply(false).expect("apply")
                },
                BatchSize::PerIteration,
            );
        });
    }
    group.finish();
}

/// Detect and resolve `n` duplicate-name conflicts in a preview.
fn bench_resolve_duplicates(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolve_conflicts");
    for &n in &[10_usize, 100, 1_000] {
        let mut tree = MemoryTree::new();
        for i in 0..n {
            tree.add_file(&format!("f{i}"), b"old");
        }
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::new("duplicates", n), &n, |b, &n| {
            b.iter(|| {
                let mut tt = TreeTransform::preview(&tree).expect("preview");
                let root = tt.root();
                for i in 0..n {
                    tt.new_file(&format!("f{i}"), &root, [b"new"], None, None, None)
                        .expect("file");
                }
                resolve_conflicts(&mut tt, None).expect("resolve")
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_apply_new_files,
    bench_apply_renames,
    bench_resolve_duplicates,
);
criterion_main!(benches);
