use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use tempfile::tempdir;

use strata_vtm::log::AppendOnlyLog;
use strata_vtm::threadpool::ThreadPool;

const SEGMENT_SIZE: u32 = 4 * 1024 * 1024;
const PAYLOAD: &[u8] = &[0x42; 128];

fn bench_log_append(c: &mut Criterion) {
    let pool = Arc::new(ThreadPool::new(2));

    let mut group = c.benchmark_group("log_append");
    group.bench_function("append_128b", |b| {
        let dir = tempdir().expect("tempdir");
        let log = AppendOnlyLog::create_new(Arc::clone(&pool), dir.path().join("bench.log"), SEGMENT_SIZE)
            .expect("create log");
        b.iter(|| {
            let addr = log.append(PAYLOAD).expect("append");
            black_box(addr);
        });
    });

    group.bench_function("append_then_read_back", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().expect("tempdir");
                let log = AppendOnlyLog::create_new(Arc::clone(&pool), dir.path().join("bench.log"), SEGMENT_SIZE)
                    .expect("create log");
                (dir, log)
            },
            |(dir, log)| {
                let addr = log.append(PAYLOAD).expect("append");
                let back = log.at(addr).expect("read back");
                black_box(&back);
                drop(dir);
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_log_append);
criterion_main!(benches);
