//! Benchmarks for tag-bitmap recall across intersection and union queries.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use memoryhub_core::{MemoryHub, MemoryHubConfig, RecallOp};
use tempfile::TempDir;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("build tokio runtime")
}

async fn seeded_hub(dir: &TempDir, n: usize) -> MemoryHub {
    let config = MemoryHubConfig {
        data_path: dir.path().to_path_buf(),
        ..Default::default()
    };
    let hub = MemoryHub::open(config).await.expect("open hub");
    for i in 0..n {
        let mut tags = vec!["bench".to_string()];
        if i % 3 == 0 {
            tags.push("alpha".to_string());
        }
        if i % 5 == 0 {
            tags.push("beta".to_string());
        }
        hub.remember(format!("entry {i}"), tags, String::new())
            .await
            .expect("remember");
    }
    hub
}

fn bench_tag_intersection(c: &mut Criterion) {
    let rt = runtime();
    let dir = TempDir::new().expect("tempdir");
    let hub = rt.block_on(seeded_hub(&dir, 10_000));
    let tags = vec!["alpha".to_string(), "beta".to_string()];

    c.bench_function("recall_by_tags_intersection", |b| {
        b.iter(|| {
            rt.block_on(async {
                let results = hub
                    .recall_by_tags(black_box(&tags), RecallOp::Intersection, 50)
                    .await
                    .expect("recall_by_tags");
                black_box(results.len());
            });
        });
    });

    rt.block_on(async { hub.close().await.expect("close hub") });
}

fn bench_tag_union(c: &mut Criterion) {
    let rt = runtime();
    let dir = TempDir::new().expect("tempdir");
    let hub = rt.block_on(seeded_hub(&dir, 10_000));
    let tags = vec!["alpha".to_string(), "beta".to_string()];

    c.bench_function("recall_by_tags_union", |b| {
        b.iter(|| {
            rt.block_on(async {
                let results = hub
                    .recall_by_tags(black_box(&tags), RecallOp::Union, 50)
                    .await
                    .expect("recall_by_tags");
                black_box(results.len());
            });
        });
    });

    rt.block_on(async { hub.close().await.expect("close hub") });
}

criterion_group!(benches, bench_tag_intersection, bench_tag_union);
criterion_main!(benches);
