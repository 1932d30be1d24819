use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pzip::{CompressorPool, PoolConfig, Request, ZipArchive};
use std::io::Cursor;
use tokio_util::sync::CancellationToken;

fn generate_compressible_data(size: usize) -> Vec<u8> {
    let pattern = b"The quick brown fox jumps over the lazy dog. ";
    let mut data = Vec::with_capacity(size);
    while data.len() < size {
        data.extend_from_slice(pattern);
    }
    data.truncate(size);
    data
}

async fn compress_all(workers: usize, entries: usize, data: &[u8]) {
    let archive = ZipArchive::from_writer(Vec::new());
    let pool = CompressorPool::new(
        &CancellationToken::new(),
        archive.clone(),
        PoolConfig::default().with_workers(workers),
    );
    for i in 0..entries {
        pool.submit(Request::new(format!("entry-{}.bin", i), Cursor::new(data.to_vec())))
            .await
            .unwrap();
    }
    pool.finish().await.unwrap();
    black_box(archive.finish().await.unwrap());
}

fn bench_workers(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let entries = 32;
    let size = 256 * 1024;
    let data = generate_compressible_data(size);

    let mut group = c.benchmark_group("pool_workers");
    group.throughput(Throughput::Bytes((entries * size) as u64));
    group.sample_size(10);

    for workers in [1, 2, 4, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(workers), &workers, |b, &workers| {
            b.to_async(&rt)
                .iter(|| compress_all(workers, entries, black_box(&data)));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_workers);
criterion_main!(benches);
