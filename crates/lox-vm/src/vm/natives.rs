// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Host functions installed by the driver.
//!
//! The language itself has no I/O; `print` and `clock` arrive through
//! [`Vm::define_native`] like any other host extension would.

use std::sync::OnceLock;
use std::time::Instant;

use crate::value::{Value, write_value};
use crate::vm::{RuntimeError, Vm};

/// Register the standard natives: `clock/0` and `print/1`.
pub fn install(vm: &mut Vm) {
    vm.define_native("clock", 0, clock);
    vm.define_native("print", 1, print);
}

/// Seconds since the process first asked for the time, as a number.
///
/// # Errors
///
/// Never fails.
pub fn clock(_vm: &mut Vm, _args: &[Value]) -> Result<Value, RuntimeError> {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    Ok(Value::Number(start.elapsed().as_secs_f64()))
}

/// Print one value followed by a newline, returning nil.
///
/// # Errors
///
/// Never fails.
pub fn print(vm: &mut Vm, args: &[Value]) -> Result<Value, RuntimeError> {
    let value = args.first().copied().unwrap_or(Value::Nil);
    let mut text = String::new();
    let _ = write_value(&mut text, vm.heap(), value);
    text.push('\n');
    vm.write_output(&text);
    Ok(Value::Nil)
}
