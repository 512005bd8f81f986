//! Benchmarks for the remember/recall hot path and the recall-latency target.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use memoryhub_core::{MemoryHub, MemoryHubConfig};
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
        let content = match i % 4 {
            0 => format!("task_id bench-window {i}"),
            1 => format!("Log: bench trace {i}"),
            2 => format!("archive note {i}"),
            _ => format!("bench memory entry {i}"),
        };
        let tags = if i % 4 == 2 {
            vec!["archive".to_string()]
        } else {
            vec!["bench".to_string()]
        };
        hub.remember(content, tags, String::new()).await.expect("remember");
    }
    hub
}

fn bench_remember(c: &mut Criterion) {
    let rt = runtime();

    c.bench_function("remember_single_record", |b| {
        b.iter_batched(
            || TempDir::new().expect("tempdir"),
            |dir| {
                rt.block_on(async {
                    let config = MemoryHubConfig {
                        data_path: dir.path().to_path_buf(),
                        ..Default::default()
                    };
                    let hub = MemoryHub::open(config).await.expect("open hub");
                    let record = hub
                        .remember(black_box("Log: benchmark entry"), vec!["bench".into()], String::new())
                        .await
                        .expect("remember");
                    black_box(record);
                });
            },
            BatchSize::SmallInput,
        );
    });
}

fn bench_recall(c: &mut Criterion) {
    let rt = runtime();
    let dir = TempDir::new().expect("tempdir");
    let hub = rt.block_on(seeded_hub(&dir, 10_000));

    c.bench_function("recall_over_10k_records", |b| {
        b.iter(|| {
            rt.block_on(async {
                let results = hub.recall(black_box("bench"), 10).await.expect("recall");
                black_box(results.len());
            });
        });
    });

    rt.block_on(async { hub.close().await.expect("close hub") });
}

fn bench_recall_latency_target(c: &mut Criterion) {
    let rt = runtime();
    let dir = TempDir::new().expect("tempdir");
    let hub = rt.block_on(seeded_hub(&dir, 10_000));

    rt.block_on(async {
        for _ in 0..200 {
            hub.recall("bench", 10).await.expect("recall");
        }
        let stats = hub.stats().await.expect("stats");
        println!(
            "mean recall latency over 10k records: {:.3}ms (target < 35ms)",
            stats.recall_latency.mean_ms
        );
    });

    c.bench_function("recall_latency_distribution", |b| {
        b.iter(|| {
            rt.block_on(async {
                black_box(hub.recall("task_id", 10).await.expect("recall"));
            });
        });
    });

    rt.block_on(async { hub.close().await.expect("close hub") });
}

criterion_group!(benches, bench_remember, bench_recall, bench_recall_latency_target);
criterion_main!(benches);
