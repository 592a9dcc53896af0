use super::*;

use proptest::prelude::*;
use proptest_derive::Arbitrary;
use std::collections::BTreeMap;
use std::ops::Bound;

/// Operations on a trie over a fixed table of keys; each op names a table slot.
#[derive(Clone, Debug, Arbitrary)]
enum Op {
    #[proptest(weight = 6)]
    Insert(#[proptest(strategy = "0..TABLE_LEN")] usize),
    #[proptest(weight = 2)]
    Upsert(#[proptest(strategy = "0..TABLE_LEN")] usize),
    #[proptest(weight = 4)]
    Remove(#[proptest(strategy = "0..TABLE_LEN")] usize),
    #[proptest(weight = 2)]
    Lookup(#[proptest(strategy = "0..TABLE_LEN")] usize),
    LowerBound(#[proptest(strategy = "0..TABLE_LEN")] usize),
    UpperBound(#[proptest(strategy = "0..TABLE_LEN")] usize),
}

const TABLE_LEN: usize = 96;

fn table_strategy() -> impl Strategy<Value = Vec<Vec<u8>>> {
    // Keys without 0x00 bytes: zero padding would make "a" and "a\0" equal.
    prop::collection::vec(prop::collection::vec(1u8..=255, 0..=24), TABLE_LEN)
}

/// Keys sharing long prefixes, so nodes fill up and split deep in the tree.
fn clustered_table_strategy() -> impl Strategy<Value = Vec<Vec<u8>>> {
    let key = (0u8..4, prop::collection::vec(prop_oneof![Just(1u8), Just(2), Just(0x80), 1u8..=255], 0..=12))
        .prop_map(|(cluster, tail)| {
            let mut key = vec![b'k', cluster + 1, b'/'];
            key.extend(tail);
            key
        });
    prop::collection::vec(key, TABLE_LEN)
}

fn lower_bound_of(m: &BTreeMap<Vec<u8>, usize>, key: &[u8]) -> Option<usize> {
    m.range::<[u8], _>((Bound::Included(key), Bound::Unbounded)).next().map(|(_, v)| *v)
}

fn upper_bound_of(m: &BTreeMap<Vec<u8>, usize>, key: &[u8]) -> Option<usize> {
    m.range::<[u8], _>((Bound::Excluded(key), Bound::Unbounded)).next().map(|(_, v)| *v)
}

fn run_single_threaded(table: &[Vec<u8>], ops: Vec<Op>) -> std::result::Result<(), TestCaseError> {
    let mut t: HotSingleThreaded<usize, _> = HotSingleThreaded::new(IndexedBytes::new(table));
    let mut m: BTreeMap<Vec<u8>, usize> = BTreeMap::new();

    for op in ops {
        match op {
            Op::Insert(i) => {
                let inserted = !m.contains_key(&table[i]);
                if inserted {
                    m.insert(table[i].clone(), i);
                }
                prop_assert_eq!(t.insert(i), inserted);
            }
            Op::Upsert(i) => {
                prop_assert_eq!(t.upsert(i), m.insert(table[i].clone(), i));
            }
            Op::Remove(i) => {
                prop_assert_eq!(t.remove(&table[i]), m.remove(&table[i]).is_some());
            }
            Op::Lookup(i) => {
                prop_assert_eq!(t.lookup(&table[i]), m.get(&table[i]).copied());
            }
            Op::LowerBound(i) => {
                prop_assert_eq!(t.lower_bound(&table[i]).next(), lower_bound_of(&m, &table[i]));
            }
            Op::UpperBound(i) => {
                prop_assert_eq!(t.upper_bound(&table[i]).next(), upper_bound_of(&m, &table[i]));
            }
        }
        prop_assert_eq!(t.len(), m.len());
    }

    prop_assert_eq!(t.check_invariants(), Ok(()));
    let got: Vec<usize> = t.iter().collect();
    let expected: Vec<usize> = m.values().copied().collect();
    prop_assert_eq!(got, expected);
    Ok(())
}

fn run_rowex(table: &[Vec<u8>], ops: Vec<Op>) -> std::result::Result<(), TestCaseError> {
    let config = Config {
        iterator_buffer_size: 4,
        ..Config::default()
    };
    let t: HotRowex<usize, _> = HotRowex::with_config(IndexedBytes::new(table), config).unwrap();
    let mut m: BTreeMap<Vec<u8>, usize> = BTreeMap::new();

    for op in ops {
        match op {
            // No removal in the concurrent trie: removes act as lookups.
            Op::Insert(i) | Op::Remove(i) => {
                let inserted = !m.contains_key(&table[i]);
                if inserted {
                    m.insert(table[i].clone(), i);
                }
                prop_assert_eq!(t.insert(i), inserted);
            }
            Op::Upsert(i) => {
                prop_assert_eq!(t.upsert(i), m.insert(table[i].clone(), i));
            }
            Op::Lookup(i) => {
                prop_assert_eq!(t.lookup(&table[i]), m.get(&table[i]).copied());
            }
            Op::LowerBound(i) => {
                prop_assert_eq!(t.lower_bound(&table[i]).next(), lower_bound_of(&m, &table[i]));
            }
            Op::UpperBound(i) => {
                prop_assert_eq!(t.upper_bound(&table[i]).next(), upper_bound_of(&m, &table[i]));
            }
        }
    }

    let got: Vec<usize> = t.iter().collect();
    let expected: Vec<usize> = m.values().copied().collect();
    prop_assert_eq!(got, expected);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        max_shrink_iters: 50_000,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_single_threaded_matches_btreemap(
        table in table_strategy(),
        ops in prop::collection::vec(any::<Op>(), 0..=600),
    ) {
        run_single_threaded(&table, ops)?;
    }

    #[test]
    fn prop_single_threaded_clustered_keys(
        table in clustered_table_strategy(),
        ops in prop::collection::vec(any::<Op>(), 0..=600),
    ) {
        run_single_threaded(&table, ops)?;
    }

    #[test]
    fn prop_rowex_matches_btreemap(
        table in table_strategy(),
        ops in prop::collection::vec(any::<Op>(), 0..=600),
    ) {
        run_rowex(&table, ops)?;
    }

    #[test]
    fn prop_rowex_clustered_keys(
        table in clustered_table_strategy(),
        ops in prop::collection::vec(any::<Op>(), 0..=600),
    ) {
        run_rowex(&table, ops)?;
    }
}

/// Integer values clustered around the largest storable id.
fn value_strategy() -> impl Strategy<Value = u64> {
    prop_oneof![
        4 => any::<u64>(),
        2 => 0u64..1_000,
        2 => (MAX_VALUE_ID - 8)..=(MAX_VALUE_ID + 8),
        1 => Just(1u64 << 63),
        1 => Just(u64::MAX),
    ]
}

fn run_integer_values(values: Vec<u64>) -> std::result::Result<(), TestCaseError> {
    let mut t: HotSingleThreaded<u64, _> = HotSingleThreaded::new(IdentityKey::new());
    let r: HotRowex<u64, _> = HotRowex::new(IdentityKey::new());
    let mut m = std::collections::BTreeSet::new();

    for v in values {
        let storable = v <= MAX_VALUE_ID;
        let inserted = storable && m.insert(v);
        prop_assert_eq!(t.insert(v), inserted);
        prop_assert_eq!(r.insert(v), inserted);
        if !storable {
            prop_assert_eq!(t.try_insert(v), Err(HotError::ValueIdOutOfRange { id: v }));
            prop_assert_eq!(r.try_upsert(v), Err(HotError::ValueIdOutOfRange { id: v }));
        }
        let expected = storable.then_some(v);
        prop_assert_eq!(t.lookup(&v.to_be_bytes()), expected);
        prop_assert_eq!(r.lookup(&v.to_be_bytes()), expected);
    }

    let expected: Vec<u64> = m.into_iter().collect();
    prop_assert_eq!(t.iter().collect::<Vec<_>>(), expected.clone());
    prop_assert_eq!(r.iter().collect::<Vec<_>>(), expected);
    prop_assert_eq!(t.check_invariants(), Ok(()));
    Ok(())
}

proptest! {
    #[test]
    fn prop_integer_values_respect_id_range(values in prop::collection::vec(value_strategy(), 0..=300)) {
        run_integer_values(values)?;
    }
}

fn for_each_permutation<T: Clone>(items: &[T], mut f: impl FnMut(Vec<T>)) {
    fn rec<T: Clone>(items: &[T], used: &mut [bool], out: &mut Vec<T>, f: &mut impl FnMut(Vec<T>)) {
        if out.len() == items.len() {
            f(out.clone());
            return;
        }
        for i in 0..items.len() {
            if used[i] {
                continue;
            }
            used[i] = true;
            out.push(items[i].clone());
            rec(items, used, out, f);
            out.pop();
            used[i] = false;
        }
    }

    let mut used = vec![false; items.len()];
    let mut out = Vec::with_capacity(items.len());
    rec(items, &mut used, &mut out, &mut f);
}

fn small_set() -> Vec<Vec<u8>> {
    ["a", "b", "c", "aa", "ab", "ba"].iter().map(|s| s.as_bytes().to_vec()).collect()
}

fn sorted_indexes(table: &[Vec<u8>]) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..table.len()).collect();
    idx.sort_by(|&a, &b| table[a].cmp(&table[b]));
    idx
}

#[test]
fn exhaustive_insert_order_small_set() {
    let table = small_set();
    let expected = sorted_indexes(&table);
    let order: Vec<usize> = (0..table.len()).collect();

    for_each_permutation(&order, |perm| {
        let mut t: HotSingleThreaded<usize, _> = HotSingleThreaded::new(IndexedBytes::new(&table));
        let r: HotRowex<usize, _> = HotRowex::new(IndexedBytes::new(&table));
        for &i in &perm {
            assert!(t.insert(i));
            assert!(r.insert(i));
        }
        assert_eq!(t.check_invariants(), Ok(()));
        assert_eq!(t.iter().collect::<Vec<_>>(), expected);
        assert_eq!(r.iter().collect::<Vec<_>>(), expected);
        for (i, key) in table.iter().enumerate() {
            assert_eq!(r.lookup(key), Some(i));
        }
    });
}

#[test]
fn exhaustive_remove_order_small_set() {
    let table = small_set();
    let order: Vec<usize> = (0..table.len()).collect();

    for_each_permutation(&order, |perm| {
        let mut t: HotSingleThreaded<usize, _> = HotSingleThreaded::new(IndexedBytes::new(&table));
        for i in 0..table.len() {
            assert!(t.insert(i));
        }
        let mut remaining = table.len();
        for i in perm {
            assert!(t.remove(&table[i]));
            assert!(!t.remove(&table[i]));
            remaining -= 1;
            assert_eq!(t.len(), remaining);
            assert_eq!(t.check_invariants(), Ok(()));
        }
        assert!(t.is_empty());
    });
}
