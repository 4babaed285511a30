// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! `lox` - run a Lox script or start an interactive session.
//!
//! Exit codes: 0 on success, 65 on compile errors, 70 on runtime errors,
//! 74 when the script file cannot be read.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;

use lox_vm::vm::natives;
use lox_vm::{InterpretError, Vm, repl};

#[derive(Parser)]
#[command(name = "lox")]
#[command(version = lox_vm::VERSION)]
#[command(about = "Bytecode interpreter for the Lox language", long_about = None)]
struct Args {
    /// Lox script to run; starts an interactive session when omitted.
    script: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut vm = Vm::new();
    natives::install(&mut vm);

    match args.script {
        Some(path) => run_file(&mut vm, &path),
        None => match repl::run(&mut vm) {
            Ok(()) => ExitCode::SUCCESS,
            Err(error) => {
                eprintln!("{error}");
                ExitCode::FAILURE
            }
        },
    }
}

fn run_file(vm: &mut Vm, path: &Path) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(error) => {
            eprintln!("couldn't read file \"{}\": {error}", path.display());
            return ExitCode::from(74);
        }
    };

    match vm.interpret(&source) {
        Ok(()) => ExitCode::SUCCESS,
        Err(InterpretError::Compile) => ExitCode::from(65),
        Err(InterpretError::Runtime) => ExitCode::from(70),
    }
}
