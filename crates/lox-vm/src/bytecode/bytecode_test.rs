// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Tests for chunks.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use super::{Chunk, MAX_CONSTANTS, op};
use crate::value::Value;

#[test]
fn write_keeps_lines_parallel_to_code() {
    let mut chunk = Chunk::new();
    chunk.write(op::NIL, 1);
    chunk.write(op::POP, 1);
    chunk.write(op::RETURN, 3);

    assert_eq!(chunk.code, vec![op::NIL, op::POP, op::RETURN]);
    assert_eq!(chunk.lines, vec![1, 1, 3]);
    assert_eq!(chunk.line_at(2), Some(3));
    assert_eq!(chunk.line_at(3), None);
}

#[test]
fn constants_index_in_insertion_order() {
    let mut chunk = Chunk::new();
    assert_eq!(chunk.add_constant(Value::Number(1.0)), Some(0));
    assert_eq!(chunk.add_constant(Value::Number(2.0)), Some(1));
    assert_eq!(chunk.constants.len(), 2);
}

#[test]
fn constant_pool_is_capped() {
    let mut chunk = Chunk::new();
    for i in 0..MAX_CONSTANTS {
        assert_eq!(chunk.add_constant(Value::Number(i as f64)), Some(i as u8));
    }
    assert_eq!(chunk.add_constant(Value::Nil), None);
    assert_eq!(chunk.constants.len(), MAX_CONSTANTS);
}

#[test]
fn identical_values_are_not_deduplicated() {
    let mut chunk = Chunk::new();
    assert_eq!(chunk.add_constant(Value::Number(1.0)), Some(0));
    assert_eq!(chunk.add_constant(Value::Number(1.0)), Some(1));
}
