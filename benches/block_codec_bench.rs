// Block encode/decode throughput across block sizes, and TupleDomain
// intersect cost — the two hot paths every page that crosses a stage
// boundary (C1, C6) and every split-pruning decision (C2, C5) goes through.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use rusty_engine::engine::block::{Block, BlockBuilder};
use rusty_engine::engine::domain::{Domain, Range, Scalar, SortedRangeSet, TupleDomain};
use rusty_engine::engine::types::PhysicalCategory;

fn long_block(size: usize) -> Block {
    let mut builder = BlockBuilder::new(PhysicalCategory::Int64);
    for i in 0..size {
        if i % 37 == 0 {
            builder.append_null();
        } else {
            builder.append_long(i as i64);
        }
    }
    builder.build()
}

fn bench_block_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("block_encode");
    for size in [64usize, 1024, 16384] {
        let block = long_block(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| black_box(block.encode()));
        });
    }
    group.finish();
}

fn bench_block_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("block_round_trip");
    for size in [64usize, 1024, 16384] {
        let block = long_block(size);
        let encoded = block.encode();
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| black_box(Block::decode(&encoded).unwrap()));
        });
    }
    group.finish();
}

fn bench_tuple_domain_intersect(c: &mut Criterion) {
    let mut left = std::collections::HashMap::new();
    let mut right = std::collections::HashMap::new();
    for col in 0..16u32 {
        left.insert(
            col,
            Domain {
                values: SortedRangeSet::of(vec![Range {
                    low: Some(Scalar::Int64(col as i64 * 10)),
                    low_inclusive: true,
                    high: None,
                    high_inclusive: false,
                }]),
                null_allowed: true,
            },
        );
        right.insert(
            col,
            Domain { values: SortedRangeSet::of(vec![Range::equal(Scalar::Int64(col as i64 * 10 + 5))]), null_allowed: false },
        );
    }
    let left = TupleDomain::Some(left);
    let right = TupleDomain::Some(right);

    c.bench_function("tuple_domain_intersect_16_columns", |b| {
        b.iter(|| black_box(left.intersect(&right)));
    });
}

criterion_group!(benches, bench_block_encode, bench_block_round_trip, bench_tuple_domain_intersect);
criterion_main!(benches);
