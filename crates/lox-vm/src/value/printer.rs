// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Printing of values for program output and diagnostics.

use core::fmt::{self, Write};

use crate::heap::Heap;
use crate::object::{Obj, ObjRef};
use crate::value::Value;

/// Write the user-facing rendering of a value.
///
/// Heap objects are resolved through the collector; a reference that no
/// longer points at a live object renders as `<unknown>` instead of
/// failing.
///
/// # Errors
///
/// Propagates formatter errors from the underlying writer.
pub fn write_value<W: Write>(out: &mut W, heap: &Heap, value: Value) -> fmt::Result {
    match value {
        Value::Nil => out.write_str("nil"),
        Value::Bool(b) => write!(out, "{b}"),
        Value::Number(n) => write_number(out, n),
        Value::Obj(r) => write_object(out, heap, r),
    }
}

/// Numbers print without a fractional part when they hold an integral
/// value, so `7.0` renders as `7` while `2.5` stays `2.5`.
fn write_number<W: Write>(out: &mut W, n: f64) -> fmt::Result {
    if n.is_finite() && n == n.trunc() && n.abs() < 1e15 {
        write!(out, "{}", n as i64)
    } else {
        write!(out, "{n}")
    }
}

fn write_object<W: Write>(out: &mut W, heap: &Heap, r: ObjRef) -> fmt::Result {
    match heap.obj(r) {
        Some(Obj::Str(s)) => out.write_str(&s.chars),
        Some(Obj::Function(f)) => match f.name {
            Some(name) => write!(out, "<fn {}>", heap.str_chars(name)),
            None => out.write_str("<script>"),
        },
        Some(Obj::Native(_)) => out.write_str("<native fn>"),
        Some(Obj::Closure(c)) => write_object(out, heap, c.function),
        Some(Obj::Upvalue(_)) => out.write_str("upvalue"),
        Some(Obj::Class(c)) => out.write_str(heap.str_chars(c.name)),
        Some(Obj::Instance(i)) => {
            write_object(out, heap, i.class)?;
            out.write_str(" instance")
        }
        Some(Obj::BoundMethod(b)) => write_object(out, heap, b.method),
        None => out.write_str("<unknown>"),
    }
}
