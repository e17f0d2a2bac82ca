// Batch formation benchmarks for the transaction cache.
//
// Covers cutting by size at several set sizes, cutting under the memory
// limit, and Merkle root computation over a cut set.

use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::time::Instant;

use rbft_order::block::Block;
use rbft_order::crypto::hash::ZERO_HASH;
use rbft_order::network::txcache::{BatchPolicy, Batcher};
use rbft_order::transaction::Transaction;

fn transactions(n: u64) -> Vec<Transaction> {
    (0..n)
        .map(|i| Transaction::new(format!("account-{}", i % 64), i, vec![0xAB; 128]))
        .collect()
}

fn bench_cut_by_size(c: &mut Criterion) {
    let mut group = c.benchmark_group("txcache/cut_by_size");
    let txs = transactions(4096);

    for set_size in [10usize, 100, 1000] {
        group.throughput(Throughput::Elements(txs.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(set_size), &set_size, |b, &set_size| {
            let policy = BatchPolicy {
                set_size,
                set_timeout: Duration::from_millis(100),
                max_mem: None,
            };
            b.iter(|| {
                let mut batcher = Batcher::new(policy);
                let now = Instant::now();
                let mut cuts = 0usize;
                for tx in txs.iter().cloned() {
                    if batcher.push(tx, now).is_some() {
                        cuts += 1;
                    }
                }
                cuts
            });
        });
    }
    group.finish();
}

fn bench_cut_by_memory(c: &mut Criterion) {
    let txs = transactions(4096);
    let policy = BatchPolicy {
        set_size: usize::MAX,
        set_timeout: Duration::from_millis(100),
        max_mem: Some(64 * 1024),
    };

    c.bench_function("txcache/cut_by_memory", |b| {
        b.iter(|| {
            let mut batcher = Batcher::new(policy);
            let now = Instant::now();
            txs.iter().cloned().filter_map(|tx| batcher.push(tx, now)).count()
        });
    });
}

fn bench_block_assembly(c: &mut Criterion) {
    let mut group = c.benchmark_group("block/assemble");
    for n in [100u64, 500, 1000] {
        let txs = transactions(n);
        group.throughput(Throughput::Elements(n));
        group.bench_with_input(BenchmarkId::from_parameter(n), &txs, |b, txs| {
            b.iter(|| Block::new(1, ZERO_HASH, 0, txs.clone()));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_cut_by_size, bench_cut_by_memory, bench_block_assembly);
criterion_main!(benches);
