// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! REPL (Read-Eval-Print Loop) for Lox.
//!
//! Reads one line at a time and hands it to the VM. The VM is shared
//! across the whole session, so globals defined on one line are visible
//! on the next. Errors are already reported on stderr by the VM and are
//! otherwise ignored here; the loop just keeps going.

use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;

use crate::vm::Vm;

/// Prompt shown before each line.
const PROMPT: &str = "lox> ";

/// Run the interactive loop until end-of-file or a terminal error.
///
/// # Errors
///
/// Returns the underlying editor error when the terminal setup or a read
/// fails for a reason other than EOF or an interrupt.
pub fn run(vm: &mut Vm) -> rustyline::Result<()> {
    let mut editor = DefaultEditor::new()?;

    loop {
        match editor.readline(PROMPT) {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(&line);
                // Keep the session alive whatever the line did.
                let _ = vm.interpret(&line);
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => return Ok(()),
            Err(error) => return Err(error),
        }
    }
}
