// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Tests for value printing.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use super::{Value, write_value};
use crate::heap::Heap;
use crate::object::{Class, Function, Instance, Obj};
use crate::table::Table;

fn render(heap: &Heap, value: Value) -> String {
    let mut out = String::new();
    write_value(&mut out, heap, value).unwrap();
    out
}

#[test]
fn immediates() {
    let heap = Heap::new();
    assert_eq!(render(&heap, Value::Nil), "nil");
    assert_eq!(render(&heap, Value::Bool(true)), "true");
    assert_eq!(render(&heap, Value::Bool(false)), "false");
}

#[test]
fn integral_numbers_have_no_fraction() {
    let heap = Heap::new();
    assert_eq!(render(&heap, Value::Number(7.0)), "7");
    assert_eq!(render(&heap, Value::Number(-3.0)), "-3");
    assert_eq!(render(&heap, Value::Number(0.0)), "0");
}

#[test]
fn fractional_numbers_keep_their_fraction() {
    let heap = Heap::new();
    assert_eq!(render(&heap, Value::Number(2.5)), "2.5");
    assert_eq!(render(&heap, Value::Number(-0.125)), "-0.125");
}

#[test]
fn strings_render_bare() {
    let mut heap = Heap::new();
    let s = heap.intern("hi there");
    assert_eq!(render(&heap, Value::Obj(s.as_obj())), "hi there");
}

#[test]
fn functions_render_with_name() {
    let mut heap = Heap::new();
    let name = heap.intern("riddle");
    let function = heap.alloc(Obj::Function(Function {
        arity: 0,
        upvalue_count: 0,
        chunk: crate::bytecode::Chunk::new(),
        name: Some(name),
    }));
    assert_eq!(render(&heap, Value::Obj(function)), "<fn riddle>");

    let script = heap.alloc(Obj::Function(Function {
        arity: 0,
        upvalue_count: 0,
        chunk: crate::bytecode::Chunk::new(),
        name: None,
    }));
    assert_eq!(render(&heap, Value::Obj(script)), "<script>");
}

#[test]
fn classes_and_instances() {
    let mut heap = Heap::new();
    let name = heap.intern("Point");
    let class = heap.alloc(Obj::Class(Class {
        name,
        methods: Table::new(),
    }));
    let instance = heap.alloc(Obj::Instance(Instance {
        class,
        fields: Table::new(),
    }));
    assert_eq!(render(&heap, Value::Obj(class)), "Point");
    assert_eq!(render(&heap, Value::Obj(instance)), "Point instance");
}
