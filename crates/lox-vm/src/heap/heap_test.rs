// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Tests for the object arena and collector.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use super::Heap;
use crate::object::{Class, Closure, Function, Instance, Obj, Upvalue, UpvalueState};
use crate::table::Table;
use crate::value::Value;

fn new_function(heap: &mut Heap) -> crate::object::ObjRef {
    heap.alloc(Obj::Function(Function {
        arity: 0,
        upvalue_count: 0,
        chunk: crate::bytecode::Chunk::new(),
        name: None,
    }))
}

/// Run a full cycle with the given roots.
fn collect(heap: &mut Heap, roots: &[Value]) {
    for &root in roots {
        heap.mark_value(root);
    }
    heap.trace_references();
    heap.sweep_interned();
    heap.sweep();
}

#[test]
fn interning_deduplicates_content() {
    let mut heap = Heap::new();
    let a = heap.intern("twice");
    let b = heap.intern("twice");
    let c = heap.intern("once");
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(heap.str_chars(a), "twice");
}

#[test]
fn find_interned_sees_only_existing_content() {
    let mut heap = Heap::new();
    let a = heap.intern("present");
    let hash = a.hash();
    assert_eq!(heap.find_interned("present", hash), Some(a));
    assert_eq!(
        heap.find_interned("absent", crate::object::hash_str("absent")),
        None
    );
}

#[test]
fn concat_interns_the_combined_content() {
    let mut heap = Heap::new();
    let a = heap.intern("foo");
    let b = heap.intern("bar");
    let ab = heap.concat(a, b);
    assert_eq!(heap.str_chars(ab), "foobar");

    // The combined hash matches a directly interned equal string.
    let direct = heap.intern("foobar");
    assert_eq!(ab, direct);

    // And concatenation of already-interned content allocates nothing new.
    let objects = heap.object_count();
    let again = heap.concat(a, b);
    assert_eq!(again, ab);
    assert_eq!(heap.object_count(), objects);
}

#[test]
fn unreachable_objects_are_swept() {
    let mut heap = Heap::new();
    let kept = new_function(&mut heap);
    let dropped = new_function(&mut heap);

    collect(&mut heap, &[Value::Obj(kept)]);

    assert!(heap.function(kept).is_some());
    assert!(heap.obj(dropped).is_none());
}

#[test]
fn sweep_reuses_slots() {
    let mut heap = Heap::new();
    let dropped = new_function(&mut heap);
    collect(&mut heap, &[]);
    assert!(heap.obj(dropped).is_none());

    let reused = new_function(&mut heap);
    assert_eq!(reused, dropped);
}

#[test]
fn marks_are_cleared_between_cycles() {
    let mut heap = Heap::new();
    let function = new_function(&mut heap);

    collect(&mut heap, &[Value::Obj(function)]);
    assert!(heap.function(function).is_some());

    // A second cycle without roots must free it; stale marks would keep
    // it alive.
    collect(&mut heap, &[]);
    assert!(heap.obj(function).is_none());
}

#[test]
fn tracing_follows_closures_and_upvalues() {
    let mut heap = Heap::new();
    let function = new_function(&mut heap);
    let payload = heap.intern("captured");
    let upvalue = heap.alloc(Obj::Upvalue(Upvalue {
        state: UpvalueState::Closed(Value::Obj(payload.as_obj())),
    }));
    let closure = heap.alloc(Obj::Closure(Closure {
        function,
        upvalues: vec![upvalue],
    }));

    collect(&mut heap, &[Value::Obj(closure)]);

    assert!(heap.closure(closure).is_some());
    assert!(heap.function(function).is_some());
    assert!(heap.upvalue(upvalue).is_some());
    assert_eq!(heap.str_chars(payload), "captured");
}

#[test]
fn tracing_follows_class_methods_and_instance_fields() {
    let mut heap = Heap::new();
    let class_name = heap.intern("Widget");
    let method_name = heap.intern("poke");
    let method = new_function(&mut heap);

    let mut methods = Table::new();
    methods.set(method_name, Value::Obj(method));
    let class = heap.alloc(Obj::Class(Class {
        name: class_name,
        methods,
    }));

    let field_name = heap.intern("size");
    let field_value = heap.intern("large");
    let mut fields = Table::new();
    fields.set(field_name, Value::Obj(field_value.as_obj()));
    let instance = heap.alloc(Obj::Instance(Instance { class, fields }));

    collect(&mut heap, &[Value::Obj(instance)]);

    assert!(heap.instance(instance).is_some());
    assert!(heap.class(class).is_some());
    assert!(heap.function(method).is_some());
    assert_eq!(heap.str_chars(class_name), "Widget");
    assert_eq!(heap.str_chars(field_value), "large");
}

#[test]
fn tracing_follows_constant_pools() {
    let mut heap = Heap::new();
    let constant = heap.intern("in the pool");
    let function = new_function(&mut heap);
    heap.function_mut(function)
        .unwrap()
        .chunk
        .add_constant(Value::Obj(constant.as_obj()))
        .unwrap();

    collect(&mut heap, &[Value::Obj(function)]);

    assert_eq!(heap.str_chars(constant), "in the pool");
    assert_eq!(heap.find_interned("in the pool", constant.hash()), Some(constant));
}

#[test]
fn intern_table_is_weak() {
    let mut heap = Heap::new();
    let dead = heap.intern("ephemeral");
    let hash = dead.hash();

    collect(&mut heap, &[]);

    // Both the object and its intern entry are gone.
    assert!(heap.obj(dead.as_obj()).is_none());
    assert_eq!(heap.find_interned("ephemeral", hash), None);

    // Re-interning the same content builds a fresh object.
    let fresh = heap.intern("ephemeral");
    assert_eq!(heap.str_chars(fresh), "ephemeral");
}

#[test]
fn bytes_accounting_shrinks_after_a_cycle() {
    let mut heap = Heap::new();
    let kept = heap.intern("keep me around");
    for i in 0..64 {
        heap.intern(&format!("garbage-{i}"));
    }
    let before = heap.bytes_allocated();

    collect(&mut heap, &[Value::Obj(kept.as_obj())]);

    assert!(heap.bytes_allocated() < before);
    assert!(heap.object_count() >= 1);
    assert_eq!(heap.str_chars(kept), "keep me around");
}

#[test]
fn stress_mode_requests_collection_on_every_allocation() {
    let mut heap = Heap::new();
    assert_eq!(heap.should_collect(), cfg!(feature = "gc-stress"));
    heap.set_stress(true);
    assert!(heap.should_collect());
    heap.set_stress(false);
    assert!(!heap.should_collect());
}
