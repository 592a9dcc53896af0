//! Benchmarks for single-threaded and concurrent HOT operations.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use hot_rowex::{HotRowex, HotSingleThreaded, IdentityKey, IndexedBytes};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

const SIZES: [usize; 3] = [1_000, 10_000, 100_000];

fn generate_random_u64(n: usize) -> Vec<u64> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..n).map(|_| rng.gen::<u64>() >> 1).collect()
}

fn generate_url_like_keys(n: usize) -> Vec<Vec<u8>> {
    let domains = ["example.com", "test.org", "demo.net", "sample.io"];
    let paths = ["users", "posts", "comments", "api/v1", "api/v2"];

    (0..n)
        .map(|i| {
            let domain = domains[i % domains.len()];
            let path = paths[(i / domains.len()) % paths.len()];
            let id = i / (domains.len() * paths.len());
            format!("{}/{}/{}", domain, path, id).into_bytes()
        })
        .collect()
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");

    for size in SIZES {
        let values = generate_random_u64(size);

        group.bench_with_input(BenchmarkId::new("HotSingleThreaded", size), &values, |b, values| {
            b.iter(|| {
                let mut trie: HotSingleThreaded<u64, _> = HotSingleThreaded::new(IdentityKey::new());
                for &v in values {
                    trie.insert(v);
                }
                black_box(trie.len())
            });
        });

        group.bench_with_input(BenchmarkId::new("HotRowex", size), &values, |b, values| {
            b.iter(|| {
                let trie: HotRowex<u64, _> = HotRowex::new(IdentityKey::new());
                for &v in values {
                    trie.insert(v);
                }
                black_box(trie.is_empty())
            });
        });

        group.bench_with_input(BenchmarkId::new("BTreeMap", size), &values, |b, values| {
            b.iter(|| {
                let mut map: BTreeMap<u64, u64> = BTreeMap::new();
                for &v in values {
                    map.insert(v, v);
                }
                black_box(map.len())
            });
        });
    }

    group.finish();
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup");

    for size in SIZES {
        let keys = generate_url_like_keys(size);

        let mut single: HotSingleThreaded<usize, _> = HotSingleThreaded::new(IndexedBytes::new(&keys));
        let rowex: HotRowex<usize, _> = HotRowex::new(IndexedBytes::new(&keys));
        let mut btree: BTreeMap<Vec<u8>, usize> = BTreeMap::new();
        for (i, key) in keys.iter().enumerate() {
            single.insert(i);
            rowex.insert(i);
            btree.insert(key.clone(), i);
        }

        group.bench_with_input(BenchmarkId::new("HotSingleThreaded", size), &keys, |b, keys| {
            b.iter(|| {
                let mut sum = 0usize;
                for key in keys {
                    if let Some(v) = single.lookup(key) {
                        sum += v;
                    }
                }
                black_box(sum)
            });
        });

        group.bench_with_input(BenchmarkId::new("HotRowex", size), &keys, |b, keys| {
            b.iter(|| {
                let mut sum = 0usize;
                for key in keys {
                    if let Some(v) = rowex.lookup(key) {
                        sum += v;
                    }
                }
                black_box(sum)
            });
        });

        group.bench_with_input(BenchmarkId::new("BTreeMap", size), &keys, |b, keys| {
            b.iter(|| {
                let mut sum = 0usize;
                for key in keys {
                    if let Some(v) = btree.get(key) {
                        sum += v;
                    }
                }
                black_box(sum)
            });
        });
    }

    group.finish();
}

fn bench_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan_100");

    for size in SIZES {
        let values = generate_random_u64(size);
        let mut single: HotSingleThreaded<u64, _> = HotSingleThreaded::new(IdentityKey::new());
        let rowex: HotRowex<u64, _> = HotRowex::new(IdentityKey::new());
        for &v in &values {
            single.insert(v);
            rowex.insert(v);
        }
        let starts: Vec<[u8; 8]> = values.iter().step_by(97).map(|v| v.to_be_bytes()).collect();

        group.bench_with_input(BenchmarkId::new("HotSingleThreaded", size), &starts, |b, starts| {
            b.iter(|| {
                let mut sum = 0u64;
                for start in starts {
                    sum = sum.wrapping_add(single.lower_bound(start).take(100).sum::<u64>());
                }
                black_box(sum)
            });
        });

        group.bench_with_input(BenchmarkId::new("HotRowex", size), &starts, |b, starts| {
            b.iter(|| {
                let mut sum = 0u64;
                for start in starts {
                    sum = sum.wrapping_add(rowex.lower_bound(start).take(100).sum::<u64>());
                }
                black_box(sum)
            });
        });
    }

    group.finish();
}

fn bench_concurrent_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_insert");
    group.sample_size(20);

    for threads in [1usize, 2, 4, 8] {
        let values = generate_random_u64(100_000);

        group.bench_with_input(BenchmarkId::new("HotRowex", threads), &values, |b, values| {
            b.iter(|| {
                let trie: HotRowex<u64, _> = HotRowex::new(IdentityKey::new());
                std::thread::scope(|s| {
                    for chunk in values.chunks(values.len().div_ceil(threads)) {
                        let trie = &trie;
                        s.spawn(move || {
                            for &v in chunk {
                                trie.insert(v);
                            }
                        });
                    }
                });
                black_box(trie.height())
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_insert, bench_lookup, bench_scan, bench_concurrent_insert);
criterion_main!(benches);
