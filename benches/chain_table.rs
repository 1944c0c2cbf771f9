use chaintable::ChainTable;
use criterion::{criterion_group, criterion_main, Criterion};
use std::time::Instant;

fn mix(key: u64) -> u64 {
    key.wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

fn insert_cold(c: &mut Criterion) {
    c.bench_function("ChainTable: insert, cold", |b| {
        b.iter_custom(|iters| {
            let table: ChainTable<u64> = ChainTable::new();
            let start = Instant::now();
            for i in 0..iters {
                assert!(table.insert(mix(i), |v| *v == i, i));
            }
            start.elapsed()
        })
    });
}

fn insert_pre_grown(c: &mut Criterion) {
    c.bench_function("ChainTable: insert, pre-grown", |b| {
        b.iter_custom(|iters| {
            let table: ChainTable<u64> = ChainTable::with_sizes(9, 26, 9);
            let target = usize::BITS - (iters as usize * 2).leading_zeros();
            table.grow(target.max(9));
            let start = Instant::now();
            for i in 0..iters {
                assert!(table.insert(mix(i), |v| *v == i, i));
            }
            start.elapsed()
        })
    });
}

fn read(c: &mut Criterion) {
    c.bench_function("ChainTable: read", |b| {
        b.iter_custom(|iters| {
            let table: ChainTable<u64> = ChainTable::new();
            for i in 0..iters {
                assert!(table.insert(mix(i), |v| *v == i, i));
            }
            let start = Instant::now();
            for i in 0..iters {
                assert_eq!(table.get(mix(i), |v| *v == i), Some(i));
            }
            start.elapsed()
        })
    });
}

fn grow(c: &mut Criterion) {
    c.bench_function("ChainTable: grow 2^14 entries", |b| {
        b.iter_custom(|iters| {
            let mut duration = std::time::Duration::default();
            for _ in 0..iters {
                let table: ChainTable<u64> = ChainTable::with_sizes(9, 26, 9);
                for i in 0..(1_u64 << 14) {
                    assert!(table.insert(mix(i), |v| *v == i, i));
                }
                let start = Instant::now();
                assert!(table.grow(15));
                duration += start.elapsed();
            }
            duration
        })
    });
}

criterion_group!(chain_table, insert_cold, insert_pre_grown, read, grow);
criterion_main!(chain_table);
