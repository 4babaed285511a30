// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Tests for the hash table.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use proptest::prelude::*;

use super::Table;
use crate::object::StrRef;
use crate::value::Value;

/// Fabricate a key. Collisions are forced by folding the hash into a few
/// buckets, which keeps the probe chains honest.
fn key(index: u32) -> StrRef {
    StrRef {
        index,
        hash: index % 4,
    }
}

#[test]
fn get_on_empty_table() {
    let table = Table::new();
    assert_eq!(table.get(key(1)), None);
    assert!(table.is_empty());
}

#[test]
fn set_then_get() {
    let mut table = Table::new();
    assert!(table.set(key(1), Value::Number(1.0)));
    assert!(table.set(key(2), Value::Number(2.0)));
    assert_eq!(table.get(key(1)), Some(Value::Number(1.0)));
    assert_eq!(table.get(key(2)), Some(Value::Number(2.0)));
    assert_eq!(table.get(key(3)), None);
    assert_eq!(table.len(), 2);
}

#[test]
fn set_overwrites_and_reports_existing_key() {
    let mut table = Table::new();
    assert!(table.set(key(1), Value::Number(1.0)));
    assert!(!table.set(key(1), Value::Number(9.0)));
    assert_eq!(table.get(key(1)), Some(Value::Number(9.0)));
    assert_eq!(table.len(), 1);
}

#[test]
fn delete_leaves_chain_intact() {
    let mut table = Table::new();
    // Same hash bucket, so these probe through each other.
    let a = StrRef { index: 1, hash: 7 };
    let b = StrRef { index: 2, hash: 7 };
    let c = StrRef { index: 3, hash: 7 };
    table.set(a, Value::Number(1.0));
    table.set(b, Value::Number(2.0));
    table.set(c, Value::Number(3.0));

    assert!(table.delete(b));
    assert_eq!(table.get(b), None);
    // The entries past the tombstone stay reachable.
    assert_eq!(table.get(c), Some(Value::Number(3.0)));
    assert!(!table.delete(b));
}

#[test]
fn set_after_delete_is_a_fresh_binding() {
    let mut table = Table::new();
    table.set(key(1), Value::Number(1.0));
    table.delete(key(1));
    // Reusing the tombstone still counts as a new key.
    assert!(table.set(key(1), Value::Number(2.0)));
    assert_eq!(table.get(key(1)), Some(Value::Number(2.0)));
}

#[test]
fn grows_past_initial_capacity() {
    let mut table = Table::new();
    for i in 0..100 {
        table.set(key(i), Value::Number(f64::from(i)));
    }
    for i in 0..100 {
        assert_eq!(table.get(key(i)), Some(Value::Number(f64::from(i))));
    }
    assert_eq!(table.len(), 100);
}

#[test]
fn find_key_matches_by_content_callback() {
    let mut table = Table::new();
    let a = StrRef { index: 1, hash: 42 };
    let b = StrRef { index: 2, hash: 42 };
    table.set(a, Value::Nil);
    table.set(b, Value::Nil);

    let found = table.find_key(42, |candidate| candidate.index == 2);
    assert_eq!(found, Some(b));
    assert_eq!(table.find_key(42, |_| false), None);
    assert_eq!(table.find_key(7, |_| true), None);
}

#[test]
fn sweep_unmarked_drops_entries() {
    let mut table = Table::new();
    table.set(key(1), Value::Nil);
    table.set(key(2), Value::Nil);
    table.sweep_unmarked(|k| k.index == 1);
    assert_eq!(table.get(key(1)), Some(Value::Nil));
    assert_eq!(table.get(key(2)), None);
}

#[test]
fn iter_yields_live_entries() {
    let mut table = Table::new();
    table.set(key(1), Value::Number(1.0));
    table.set(key(2), Value::Number(2.0));
    table.delete(key(1));

    let entries: Vec<_> = table.iter().collect();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0.index, 2);
}

proptest! {
    /// Model test against the standard library map: any interleaving of
    /// sets, deletes and gets behaves identically.
    #[test]
    fn behaves_like_std_hashmap(ops in prop::collection::vec((0u8..3, 0u32..24, -100i64..100), 0..200)) {
        let mut table = Table::new();
        let mut model = std::collections::HashMap::new();

        for (op, index, payload) in ops {
            match op {
                0 => {
                    let fresh = table.set(key(index), Value::Number(payload as f64));
                    let model_fresh = model.insert(index, payload as f64).is_none();
                    prop_assert_eq!(fresh, model_fresh);
                }
                1 => {
                    let removed = table.delete(key(index));
                    let model_removed = model.remove(&index).is_some();
                    prop_assert_eq!(removed, model_removed);
                }
                _ => {
                    let got = table.get(key(index)).and_then(Value::as_number);
                    prop_assert_eq!(got, model.get(&index).copied());
                }
            }
        }

        prop_assert_eq!(table.len(), model.len());
    }
}
