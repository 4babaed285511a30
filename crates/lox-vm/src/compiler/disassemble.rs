// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Human-readable chunk listings.
//!
//! Used by execution tracing and by tests; the output is deterministic
//! for a given source program.

use core::fmt::Write;

use crate::bytecode::{Chunk, op};
use crate::heap::Heap;
use crate::value::{Value, write_value};

/// Disassemble a whole chunk under a `== name ==` header.
#[must_use]
pub fn disassemble(heap: &Heap, chunk: &Chunk, name: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {name} ==");

    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(&mut out, heap, chunk, offset);
    }

    out
}

/// Disassemble the instruction at `offset`; returns the next offset.
pub fn disassemble_instruction(
    out: &mut String,
    heap: &Heap,
    chunk: &Chunk,
    offset: usize,
) -> usize {
    let _ = write!(out, "{offset:04} ");
    if offset > 0 && chunk.line_at(offset) == chunk.line_at(offset - 1) {
        let _ = write!(out, "   | ");
    } else {
        let _ = write!(out, "{:4} ", chunk.line_at(offset).unwrap_or(0));
    }

    let Some(&opcode) = chunk.code.get(offset) else {
        let _ = writeln!(out, "<end>");
        return offset + 1;
    };

    match opcode {
        op::CONSTANT => constant_instruction(out, heap, chunk, "CONSTANT", offset),
        op::NIL => simple_instruction(out, "NIL", offset),
        op::TRUE => simple_instruction(out, "TRUE", offset),
        op::FALSE => simple_instruction(out, "FALSE", offset),
        op::POP => simple_instruction(out, "POP", offset),
        op::GET_LOCAL => byte_instruction(out, chunk, "GET_LOCAL", offset),
        op::SET_LOCAL => byte_instruction(out, chunk, "SET_LOCAL", offset),
        op::GET_GLOBAL => constant_instruction(out, heap, chunk, "GET_GLOBAL", offset),
        op::DEFINE_GLOBAL => constant_instruction(out, heap, chunk, "DEFINE_GLOBAL", offset),
        op::SET_GLOBAL => constant_instruction(out, heap, chunk, "SET_GLOBAL", offset),
        op::GET_UPVALUE => byte_instruction(out, chunk, "GET_UPVALUE", offset),
        op::SET_UPVALUE => byte_instruction(out, chunk, "SET_UPVALUE", offset),
        op::GET_PROPERTY => constant_instruction(out, heap, chunk, "GET_PROPERTY", offset),
        op::SET_PROPERTY => constant_instruction(out, heap, chunk, "SET_PROPERTY", offset),
        op::EQUAL => simple_instruction(out, "EQUAL", offset),
        op::GREATER => simple_instruction(out, "GREATER", offset),
        op::LESS => simple_instruction(out, "LESS", offset),
        op::ADD => simple_instruction(out, "ADD", offset),
        op::SUBTRACT => simple_instruction(out, "SUBTRACT", offset),
        op::MULTIPLY => simple_instruction(out, "MULTIPLY", offset),
        op::DIVIDE => simple_instruction(out, "DIVIDE", offset),
        op::NOT => simple_instruction(out, "NOT", offset),
        op::NEGATE => simple_instruction(out, "NEGATE", offset),
        op::JUMP => jump_instruction(out, chunk, "JUMP", 1, offset),
        op::JUMP_IF_FALSE => jump_instruction(out, chunk, "JUMP_IF_FALSE", 1, offset),
        op::LOOP => jump_instruction(out, chunk, "LOOP", -1, offset),
        op::CALL => byte_instruction(out, chunk, "CALL", offset),
        op::CLOSURE => closure_instruction(out, heap, chunk, offset),
        op::CLOSE_UPVALUE => simple_instruction(out, "CLOSE_UPVALUE", offset),
        op::CLASS => constant_instruction(out, heap, chunk, "CLASS", offset),
        op::METHOD => constant_instruction(out, heap, chunk, "METHOD", offset),
        op::RETURN => simple_instruction(out, "RETURN", offset),
        _ => {
            let _ = writeln!(out, "unknown opcode {opcode}");
            offset + 1
        }
    }
}

fn simple_instruction(out: &mut String, name: &str, offset: usize) -> usize {
    let _ = writeln!(out, "{name}");
    offset + 1
}

fn byte_instruction(out: &mut String, chunk: &Chunk, name: &str, offset: usize) -> usize {
    let operand = chunk.code.get(offset + 1).copied().unwrap_or(0);
    let _ = writeln!(out, "{name:<16} {operand:4}");
    offset + 2
}

fn constant_instruction(
    out: &mut String,
    heap: &Heap,
    chunk: &Chunk,
    name: &str,
    offset: usize,
) -> usize {
    let index = chunk.code.get(offset + 1).copied().unwrap_or(0);
    let _ = write!(out, "{name:<16} {index:4} '");
    let value = chunk
        .constants
        .get(index as usize)
        .copied()
        .unwrap_or(Value::Nil);
    let _ = write_value(out, heap, value);
    let _ = writeln!(out, "'");
    offset + 2
}

fn jump_instruction(
    out: &mut String,
    chunk: &Chunk,
    name: &str,
    sign: i64,
    offset: usize,
) -> usize {
    let high = chunk.code.get(offset + 1).copied().unwrap_or(0);
    let low = chunk.code.get(offset + 2).copied().unwrap_or(0);
    let jump = i64::from(u16::from(high) << 8 | u16::from(low));
    let target = offset as i64 + 3 + sign * jump;
    let _ = writeln!(out, "{name:<16} {offset:4} -> {target}");
    offset + 3
}

fn closure_instruction(out: &mut String, heap: &Heap, chunk: &Chunk, offset: usize) -> usize {
    let index = chunk.code.get(offset + 1).copied().unwrap_or(0);
    let _ = write!(out, "{:<16} {index:4} '", "CLOSURE");
    let value = chunk
        .constants
        .get(index as usize)
        .copied()
        .unwrap_or(Value::Nil);
    let _ = write_value(out, heap, value);
    let _ = writeln!(out, "'");

    // The operand pairs follow the constant index; their count lives in
    // the function object itself.
    let upvalue_count = value
        .as_obj()
        .and_then(|r| heap.function(r))
        .map_or(0, |f| f.upvalue_count);

    let mut next = offset + 2;
    for _ in 0..upvalue_count {
        let is_local = chunk.code.get(next).copied().unwrap_or(0);
        let index = chunk.code.get(next + 1).copied().unwrap_or(0);
        let kind = if is_local != 0 { "local" } else { "upvalue" };
        let _ = writeln!(out, "{next:04}      |                     {kind} {index}");
        next += 2;
    }

    next
}
