use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, SamplingMode, Throughput};
use rand::{rngs::StdRng, Rng, SeedableRng};

use shelfdb::paths::DataPath;
use shelfdb::storage::{BlobStore, FileStore, LockRegistry};
use shelfdb::StoreConfig;

struct BenchCtx {
    _tmp: tempfile::TempDir,
    files: FileStore,
    rt: tokio::runtime::Runtime,
}

impl BenchCtx {
    fn new() -> Self {
        let tmp = tempfile::tempdir().expect("tempdir");
        let files = FileStore::new(&StoreConfig::new(tmp.path()), LockRegistry::new());
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .worker_threads(2)
            .build()
            .expect("tokio runtime");
        BenchCtx { _tmp: tmp, files, rt }
    }
}

fn gen_payloads(n: usize, size: usize, seed: u64) -> Vec<Vec<u8>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n).map(|_| (0..size).map(|_| rng.gen::<u8>()).collect()).collect()
}

fn bench_blob_store(c: &mut Criterion) {
    let sizes = [1_024usize, 64 * 1_024];
    let mut group = c.benchmark_group("blob_store");
    group.sampling_mode(SamplingMode::Flat);
    group.sample_size(20);

    for &size in &sizes {
        let ctx = BenchCtx::new();
        let blobs = BlobStore::new(&ctx.files, &DataPath::new(["bench", "blobs"]).expect("prefix"));
        group.throughput(Throughput::Bytes(size as u64));

        // Fresh content every iteration
        group.bench_with_input(BenchmarkId::new("write_unique", size), &size, |b, &size| {
            let mut seed = 0u64;
            b.iter(|| {
                seed += 1;
                let payload = gen_payloads(1, size, seed).remove(0);
                ctx.rt.block_on(blobs.write(&payload)).expect("write");
            });
        });

        // Same content: hashed then discarded
        let payload = gen_payloads(1, size, 0xDEAD_BEEF).remove(0);
        ctx.rt.block_on(blobs.write(&payload)).expect("seed write");
        group.bench_with_input(BenchmarkId::new("write_dedupe", size), &payload, |b, payload| {
            b.iter(|| criterion::black_box(ctx.rt.block_on(blobs.write(payload)).expect("write")));
        });

        let hash = ctx.rt.block_on(blobs.write(&payload)).expect("write");
        group.bench_with_input(BenchmarkId::new("read_verified", size), &hash, |b, hash| {
            b.iter(|| criterion::black_box(ctx.rt.block_on(blobs.read(hash)).expect("read")));
        });
    }

    // Atomic overwrite of one canonical file, backup retained
    let ctx = BenchCtx::new();
    let path = DataPath::new(["bench", "doc"]).expect("path");
    let body = gen_payloads(1, 4_096, 0xBEEF_CAFE).remove(0);
    group.throughput(Throughput::Bytes(body.len() as u64));
    group.bench_function("file_overwrite", |b| {
        b.iter(|| ctx.rt.block_on(ctx.files.write(&path, &body)).expect("write"));
    });
    group.bench_function("file_read", |b| {
        b.iter(|| criterion::black_box(ctx.rt.block_on(ctx.files.read(&path)).expect("read")));
    });

    group.finish();
}

criterion_group!(benches, bench_blob_store);
criterion_main!(benches);
