//! Enumeration benchmarks for the polling backend's hot path

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn populated_dir(files: usize) -> TempDir {
    let tmp = TempDir::new().expect("tempdir");
    for index in 0..files {
        fs::write(tmp.path().join(format!("file-{index:04}")), b"x").expect("write");
    }
    tmp
}

fn bench_list_directory(c: &mut Criterion) {
    let small = populated_dir(16);
    let large = populated_dir(1024);

    c.bench_function("list_directory_16", |b| {
        b.iter(|| {
            let entries = vigil::fsutil::list_directory(black_box(small.path())).unwrap();
            black_box(entries.len())
        });
    });

    c.bench_function("list_directory_1024", |b| {
        b.iter(|| {
            let entries = vigil::fsutil::list_directory(black_box(large.path())).unwrap();
            black_box(entries.len())
        });
    });
}

fn bench_classify(c: &mut Criterion) {
    let tmp = populated_dir(1);
    let file = tmp.path().join("file-0000");

    c.bench_function("classify_file", |b| {
        b.iter(|| black_box(vigil::fsutil::classify(black_box(&file))));
    });
}

fn bench_canonicalize_root(c: &mut Criterion) {
    let path = Path::new("/var/tmp/../log/./nested/dir/..");

    c.bench_function("canonicalize_root", |b| {
        b.iter(|| black_box(vigil::fsutil::canonicalize_root(black_box(path)).unwrap()));
    });
}

criterion_group!(
    benches,
    bench_list_directory,
    bench_classify,
    bench_canonicalize_root
);
criterion_main!(benches);
