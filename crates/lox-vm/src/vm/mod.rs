// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Stack-based bytecode virtual machine for Lox.
//!
//! A [`Vm`] owns every piece of mutable interpreter state: the value
//! stack, the call-frame stack, the global table, the heap (and with it
//! the collector and the string interner), the open-upvalue list and the
//! compiler's root registrations. Threading one context through both
//! compilation and execution is what lets the collector see every root
//! without global state.
//!
//! The dispatch loop returns a [`RuntimeError`] instead of unwinding;
//! [`Vm::interpret`] reports it with a stack trace on stderr, resets the
//! stacks and surfaces [`InterpretError::Runtime`] to the host.


pub mod natives;

use std::io::Write;

use thiserror::Error;
use tracing::{debug, trace};

use crate::bytecode::op;
use crate::compiler::{self, disassemble_instruction};
use crate::heap::Heap;
use crate::object::{
    BoundMethod, Class, Instance, NativeFn, Obj, ObjRef, StrRef, Upvalue, UpvalueState,
};
use crate::table::Table;
use crate::value::{Value, write_value};

/// Maximum call-frame depth.
pub const FRAMES_MAX: usize = 64;

/// Value stack capacity: one full window of locals per frame.
pub const STACK_MAX: usize = FRAMES_MAX * 256;

/// Outcome of [`Vm::interpret`] when the program did not finish cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InterpretError {
    /// The source did not compile; diagnostics went to stderr.
    #[error("compile error")]
    Compile,
    /// Execution aborted; the message and stack trace went to stderr.
    #[error("runtime error")]
    Runtime,
}

/// Error raised by the dispatch loop or a native function.
///
/// The `Display` text is exactly what the user sees above the stack
/// trace.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    /// Read of a global that was never defined.
    #[error("undefined variable '{0}'")]
    UndefinedVariable(String),
    /// Property access found neither a field nor a method.
    #[error("undefined property '{0}'")]
    UndefinedProperty(String),
    /// Unary numeric operation on a non-number.
    #[error("operand must be a number")]
    OperandNotNumber,
    /// Binary numeric operation on non-numbers.
    #[error("operands must be numbers")]
    OperandsNotNumbers,
    /// `+` with operands that are neither both numbers nor both strings.
    #[error("operands must be two numbers or two strings")]
    AddOperands,
    /// Call of a value that is not callable.
    #[error("can only call functions and classes")]
    NotCallable,
    /// Wrong number of arguments in a call.
    #[error("expected {expected} arguments, but got {got}")]
    ArityMismatch {
        /// Number of parameters the callee declares.
        expected: u8,
        /// Number of arguments actually passed.
        got: u8,
    },
    /// Too many nested call frames.
    #[error("stack overflow")]
    StackOverflow,
    /// Field write on something that is not an instance.
    #[error("only instances have fields")]
    FieldsOnNonInstance,
    /// Property read on something that is not an instance.
    #[error("only instances have properties")]
    PropertiesOnNonInstance,
    /// Failure reported by a native function.
    #[error("{0}")]
    Native(String),
    /// Undecodable instruction byte.
    #[error("invalid opcode {0}")]
    InvalidOpcode(u8),
    /// Instruction pointer ran off the chunk.
    #[error("instruction pointer out of bounds")]
    IpOutOfBounds,
    /// An operation needed more stack values than present.
    #[error("value stack underflow")]
    StackUnderflow,
    /// Constant pool reference outside the pool or of the wrong kind.
    #[error("malformed constant reference")]
    BadConstant,
    /// Object handle did not resolve to the expected object.
    #[error("dangling object reference")]
    BadObject,
    /// Dispatch ran without an active call frame.
    #[error("no call frame active")]
    NoFrame,
}

/// One function activation.
///
/// `base` is the absolute stack slot of the callee, so `base + n` is the
/// frame's local `n` and local 0 is the callee or the method receiver.
#[derive(Debug, Clone, Copy)]
struct CallFrame {
    /// The object being executed: a closure, or a plain function when it
    /// captures nothing.
    callable: ObjRef,
    /// The `Function` carrying the chunk (same as `callable` for plain
    /// functions).
    function: ObjRef,
    ip: usize,
    base: usize,
}

/// Pre-resolved call target; splitting this off ends the heap borrow
/// before the call mutates the VM.
enum Callee {
    Function(ObjRef),
    Closure { callable: ObjRef, function: ObjRef },
    Native(NativeFn, u8),
    Class(ObjRef),
    Bound { receiver: Value, method: ObjRef },
}

/// The virtual machine.
pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    /// Upvalues whose variable is still on the stack, ordered by
    /// ascending slot; closing a scope peels a suffix off the back.
    open_upvalues: Vec<ObjRef>,
    /// Functions currently being compiled; the collector treats them as
    /// roots so a mid-parse collection cannot free them.
    compiler_roots: Vec<ObjRef>,
    /// Interned `"init"`, looked up on every class call.
    init_string: StrRef,
    out: Box<dyn Write>,
}

impl Vm {
    /// Create a VM writing program output to stdout.
    #[must_use]
    pub fn new() -> Self {
        Self::with_output(Box::new(std::io::stdout()))
    }

    /// Create a VM writing program output to the given sink.
    #[must_use]
    pub fn with_output(out: Box<dyn Write>) -> Self {
        let mut heap = Heap::new();
        let init_string = heap.intern("init");
        Self {
            heap,
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            open_upvalues: Vec::new(),
            compiler_roots: Vec::new(),
            init_string,
            out,
        }
    }

    /// Compile and run a program.
    ///
    /// Globals persist across calls, which is what makes a REPL session
    /// out of repeated invocations.
    ///
    /// # Errors
    ///
    /// [`InterpretError::Compile`] when the source does not compile,
    /// [`InterpretError::Runtime`] when execution aborts; in both cases
    /// the diagnostics have already been written to stderr.
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function = match compiler::compile(self, source) {
            Ok(function) => function,
            Err(_) => return Err(InterpretError::Compile),
        };

        self.push(Value::Obj(function));
        let result = self
            .call_function(function, function, 0)
            .and_then(|()| self.run());
        if let Err(error) = result {
            self.report_runtime_error(&error);
            return Err(InterpretError::Runtime);
        }
        Ok(())
    }

    /// Register a host function under `name` in the globals.
    ///
    /// Must be called before `interpret` uses the name; the driver
    /// installs `clock` and `print` this way.
    pub fn define_native(&mut self, name: &str, arity: u8, function: NativeFn) {
        let name = self.intern(name);
        // Keep the fresh name rooted across the native's allocation.
        self.push(Value::Obj(name.as_obj()));
        let native = self.alloc_object(Obj::Native(crate::object::Native {
            function,
            arity,
            name,
        }));
        self.push(Value::Obj(native));
        self.globals.set(name, Value::Obj(native));
        let _ = self.pop();
        let _ = self.pop();
    }

    /// Read access to the heap, for printing and inspection.
    #[must_use]
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub(crate) fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// Toggle collect-on-every-allocation at run time.
    pub fn set_gc_stress(&mut self, stress: bool) {
        self.heap.set_stress(stress);
    }

    /// Write program output (used by natives such as `print`).
    pub(crate) fn write_output(&mut self, text: &str) {
        let _ = self.out.write_all(text.as_bytes());
    }

    // --- allocation and collection ---------------------------------------

    /// Allocate a heap object, collecting first when the heap asks for it.
    ///
    /// Anything allocated but not yet reachable from a root must be
    /// pushed on the value stack (or stored into a rooted object) before
    /// the next call into here.
    pub(crate) fn alloc_object(&mut self, obj: Obj) -> ObjRef {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.alloc(obj)
    }

    /// Intern a string, collecting first when the heap asks for it.
    pub(crate) fn intern(&mut self, chars: &str) -> StrRef {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.intern(chars)
    }

    fn concatenate(&mut self, a: StrRef, b: StrRef) -> StrRef {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.concat(a, b)
    }

    pub(crate) fn push_compiler_root(&mut self, function: ObjRef) {
        self.compiler_roots.push(function);
    }

    pub(crate) fn pop_compiler_root(&mut self) {
        self.compiler_roots.pop();
    }

    /// One full collection cycle: mark the roots, trace, drop dead
    /// intern entries, sweep.
    fn collect_garbage(&mut self) {
        debug!(bytes = self.heap.bytes_allocated(), "gc begin");

        for &value in &self.stack {
            self.heap.mark_value(value);
        }
        for frame in &self.frames {
            self.heap.mark_object(frame.callable);
            self.heap.mark_object(frame.function);
        }
        for &upvalue in &self.open_upvalues {
            self.heap.mark_object(upvalue);
        }
        for (key, value) in self.globals.iter() {
            self.heap.mark_object(key.as_obj());
            self.heap.mark_value(value);
        }
        for &function in &self.compiler_roots {
            self.heap.mark_object(function);
        }
        let init_string = self.init_string;
        self.heap.mark_object(init_string.as_obj());

        self.heap.trace_references();
        self.heap.sweep_interned();
        self.heap.sweep();
    }

    // --- stack and frame plumbing ----------------------------------------

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack.pop().ok_or(RuntimeError::StackUnderflow)
    }

    fn peek(&self, distance: usize) -> Result<Value, RuntimeError> {
        let index = self
            .stack
            .len()
            .checked_sub(1 + distance)
            .ok_or(RuntimeError::StackUnderflow)?;
        Ok(self.stack[index])
    }

    fn frame(&self) -> Result<&CallFrame, RuntimeError> {
        self.frames.last().ok_or(RuntimeError::NoFrame)
    }

    fn frame_mut(&mut self) -> Result<&mut CallFrame, RuntimeError> {
        self.frames.last_mut().ok_or(RuntimeError::NoFrame)
    }

    fn reset_stacks(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    fn read_byte(&mut self) -> Result<u8, RuntimeError> {
        let frame = self.frames.last_mut().ok_or(RuntimeError::NoFrame)?;
        let function = self
            .heap
            .function(frame.function)
            .ok_or(RuntimeError::BadObject)?;
        let byte = function
            .chunk
            .code
            .get(frame.ip)
            .copied()
            .ok_or(RuntimeError::IpOutOfBounds)?;
        frame.ip += 1;
        Ok(byte)
    }

    fn read_short(&mut self) -> Result<u16, RuntimeError> {
        let high = self.read_byte()?;
        let low = self.read_byte()?;
        Ok(u16::from(high) << 8 | u16::from(low))
    }

    fn read_constant(&mut self) -> Result<Value, RuntimeError> {
        let index = self.read_byte()? as usize;
        let frame = self.frame()?;
        let function = self
            .heap
            .function(frame.function)
            .ok_or(RuntimeError::BadObject)?;
        function
            .chunk
            .constants
            .get(index)
            .copied()
            .ok_or(RuntimeError::BadConstant)
    }

    fn read_string_constant(&mut self) -> Result<StrRef, RuntimeError> {
        let value = self.read_constant()?;
        self.heap
            .as_str_ref(value)
            .ok_or(RuntimeError::BadConstant)
    }

    // --- calls ------------------------------------------------------------

    fn call_value(&mut self, callee: Value, arg_count: u8) -> Result<(), RuntimeError> {
        let resolved = match callee.as_obj().and_then(|r| Some((r, self.heap.obj(r)?))) {
            Some((r, Obj::Function(_))) => Callee::Function(r),
            Some((r, Obj::Closure(c))) => Callee::Closure {
                callable: r,
                function: c.function,
            },
            Some((_, Obj::Native(n))) => Callee::Native(n.function, n.arity),
            Some((r, Obj::Class(_))) => Callee::Class(r),
            Some((_, Obj::BoundMethod(b))) => Callee::Bound {
                receiver: b.receiver,
                method: b.method,
            },
            _ => return Err(RuntimeError::NotCallable),
        };

        match resolved {
            Callee::Function(function) => self.call_function(function, function, arg_count),
            Callee::Closure { callable, function } => {
                self.call_function(callable, function, arg_count)
            }
            Callee::Native(function, arity) => self.call_native(function, arity, arg_count),
            Callee::Class(class) => self.call_class(class, arg_count),
            Callee::Bound { receiver, method } => {
                // The receiver takes the callee slot and becomes local 0.
                let slot = self
                    .stack
                    .len()
                    .checked_sub(1 + arg_count as usize)
                    .ok_or(RuntimeError::StackUnderflow)?;
                self.stack[slot] = receiver;
                self.call_method(method, arg_count)
            }
        }
    }

    /// Frame a call of a `Function` or `Closure` object.
    fn call_function(
        &mut self,
        callable: ObjRef,
        function: ObjRef,
        arg_count: u8,
    ) -> Result<(), RuntimeError> {
        let arity = self
            .heap
            .function(function)
            .ok_or(RuntimeError::BadObject)?
            .arity;
        if arg_count != arity {
            return Err(RuntimeError::ArityMismatch {
                expected: arity,
                got: arg_count,
            });
        }

        if self.frames.len() == FRAMES_MAX {
            return Err(RuntimeError::StackOverflow);
        }

        let base = self
            .stack
            .len()
            .checked_sub(1 + arg_count as usize)
            .ok_or(RuntimeError::StackUnderflow)?;
        self.frames.push(CallFrame {
            callable,
            function,
            ip: 0,
            base,
        });
        Ok(())
    }

    /// Dispatch a method value, which is a function or a closure.
    fn call_method(&mut self, method: ObjRef, arg_count: u8) -> Result<(), RuntimeError> {
        let function = match self.heap.obj(method) {
            Some(Obj::Function(_)) => method,
            Some(Obj::Closure(c)) => c.function,
            _ => return Err(RuntimeError::NotCallable),
        };
        self.call_function(method, function, arg_count)
    }

    fn call_native(
        &mut self,
        function: NativeFn,
        arity: u8,
        arg_count: u8,
    ) -> Result<(), RuntimeError> {
        if arg_count != arity {
            return Err(RuntimeError::ArityMismatch {
                expected: arity,
                got: arg_count,
            });
        }

        let first = self
            .stack
            .len()
            .checked_sub(arg_count as usize)
            .ok_or(RuntimeError::StackUnderflow)?;
        let callee_slot = first.checked_sub(1).ok_or(RuntimeError::StackUnderflow)?;
        let args: Vec<Value> = self.stack[first..].to_vec();

        let result = function(self, &args)?;

        self.stack.truncate(callee_slot);
        self.push(result);
        Ok(())
    }

    /// Calling a class constructs an instance; a declared `init` method
    /// then runs with the call's arguments and the instance as receiver.
    fn call_class(&mut self, class: ObjRef, arg_count: u8) -> Result<(), RuntimeError> {
        let instance = self.alloc_object(Obj::Instance(Instance {
            class,
            fields: Table::new(),
        }));
        let slot = self
            .stack
            .len()
            .checked_sub(1 + arg_count as usize)
            .ok_or(RuntimeError::StackUnderflow)?;
        self.stack[slot] = Value::Obj(instance);

        let initializer = self
            .heap
            .class(class)
            .ok_or(RuntimeError::BadObject)?
            .methods
            .get(self.init_string);
        match initializer {
            Some(init) => {
                let method = init.as_obj().ok_or(RuntimeError::BadObject)?;
                self.call_method(method, arg_count)
            }
            None if arg_count != 0 => Err(RuntimeError::ArityMismatch {
                expected: 0,
                got: arg_count,
            }),
            None => Ok(()),
        }
    }

    // --- upvalues ---------------------------------------------------------

    /// Find or create the open upvalue for an absolute stack slot.
    ///
    /// The open list holds at most one upvalue per slot, so sibling
    /// closures share the captured variable.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let position = self
            .open_upvalues
            .binary_search_by_key(&slot, |&r| self.heap.open_slot(r));
        match position {
            Ok(index) => self.open_upvalues[index],
            Err(index) => {
                let upvalue = self.alloc_object(Obj::Upvalue(Upvalue {
                    state: UpvalueState::Open(slot),
                }));
                self.open_upvalues.insert(index, upvalue);
                upvalue
            }
        }
    }

    /// Close every open upvalue at or above `from`: copy the stack value
    /// into the upvalue and unlink it from the open list.
    fn close_upvalues(&mut self, from: usize) {
        while let Some(&last) = self.open_upvalues.last() {
            let slot = self.heap.open_slot(last);
            if slot < from {
                break;
            }
            let value = self.stack.get(slot).copied().unwrap_or(Value::Nil);
            if let Some(upvalue) = self.heap.upvalue_mut(last) {
                upvalue.state = UpvalueState::Closed(value);
            }
            self.open_upvalues.pop();
        }
    }

    // --- dispatch ---------------------------------------------------------

    #[expect(clippy::too_many_lines, reason = "one arm per opcode")]
    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            if tracing::enabled!(tracing::Level::TRACE) {
                self.trace_instruction();
            }

            let opcode = self.read_byte()?;
            match opcode {
                op::CONSTANT => {
                    let constant = self.read_constant()?;
                    self.push(constant);
                }

                op::NIL => self.push(Value::Nil),
                op::TRUE => self.push(Value::Bool(true)),
                op::FALSE => self.push(Value::Bool(false)),

                op::POP => {
                    self.pop()?;
                }

                op::GET_LOCAL => {
                    let slot = self.read_byte()? as usize;
                    let base = self.frame()?.base;
                    let value = self
                        .stack
                        .get(base + slot)
                        .copied()
                        .ok_or(RuntimeError::StackUnderflow)?;
                    self.push(value);
                }

                op::SET_LOCAL => {
                    let slot = self.read_byte()? as usize;
                    let base = self.frame()?.base;
                    let value = self.peek(0)?;
                    *self
                        .stack
                        .get_mut(base + slot)
                        .ok_or(RuntimeError::StackUnderflow)? = value;
                }

                op::GET_GLOBAL => {
                    let name = self.read_string_constant()?;
                    match self.globals.get(name) {
                        Some(value) => self.push(value),
                        None => {
                            return Err(RuntimeError::UndefinedVariable(
                                self.heap.str_chars(name).to_string(),
                            ));
                        }
                    }
                }

                op::DEFINE_GLOBAL => {
                    let name = self.read_string_constant()?;
                    let value = self.peek(0)?;
                    self.globals.set(name, value);
                    self.pop()?;
                }

                op::SET_GLOBAL => {
                    let name = self.read_string_constant()?;
                    let value = self.peek(0)?;
                    if self.globals.set(name, value) {
                        // Assignment must not create the binding.
                        self.globals.delete(name);
                        return Err(RuntimeError::UndefinedVariable(
                            self.heap.str_chars(name).to_string(),
                        ));
                    }
                }

                op::GET_UPVALUE => {
                    let slot = self.read_byte()? as usize;
                    let callable = self.frame()?.callable;
                    let upvalue = self
                        .heap
                        .closure(callable)
                        .and_then(|c| c.upvalues.get(slot).copied())
                        .ok_or(RuntimeError::BadObject)?;
                    let value = match self
                        .heap
                        .upvalue(upvalue)
                        .ok_or(RuntimeError::BadObject)?
                        .state
                    {
                        UpvalueState::Open(stack_slot) => self
                            .stack
                            .get(stack_slot)
                            .copied()
                            .ok_or(RuntimeError::StackUnderflow)?,
                        UpvalueState::Closed(value) => value,
                    };
                    self.push(value);
                }

                op::SET_UPVALUE => {
                    let slot = self.read_byte()? as usize;
                    let value = self.peek(0)?;
                    let callable = self.frame()?.callable;
                    let upvalue = self
                        .heap
                        .closure(callable)
                        .and_then(|c| c.upvalues.get(slot).copied())
                        .ok_or(RuntimeError::BadObject)?;
                    let state = self
                        .heap
                        .upvalue(upvalue)
                        .ok_or(RuntimeError::BadObject)?
                        .state;
                    match state {
                        UpvalueState::Open(stack_slot) => {
                            *self
                                .stack
                                .get_mut(stack_slot)
                                .ok_or(RuntimeError::StackUnderflow)? = value;
                        }
                        UpvalueState::Closed(_) => {
                            if let Some(u) = self.heap.upvalue_mut(upvalue) {
                                u.state = UpvalueState::Closed(value);
                            }
                        }
                    }
                }

                op::GET_PROPERTY => {
                    let name = self.read_string_constant()?;
                    let receiver = self.peek(0)?;
                    let instance_ref = receiver
                        .as_obj()
                        .filter(|&r| self.heap.instance(r).is_some())
                        .ok_or(RuntimeError::PropertiesOnNonInstance)?;

                    let field = self
                        .heap
                        .instance(instance_ref)
                        .and_then(|i| i.fields.get(name));
                    if let Some(value) = field {
                        self.pop()?;
                        self.push(value);
                    } else {
                        let class = self
                            .heap
                            .instance(instance_ref)
                            .ok_or(RuntimeError::BadObject)?
                            .class;
                        let method = self.heap.class(class).and_then(|c| c.methods.get(name));
                        match method {
                            Some(method) => {
                                let method = method.as_obj().ok_or(RuntimeError::BadObject)?;
                                let bound = self.alloc_object(Obj::BoundMethod(BoundMethod {
                                    receiver,
                                    method,
                                }));
                                self.pop()?;
                                self.push(Value::Obj(bound));
                            }
                            None => {
                                return Err(RuntimeError::UndefinedProperty(
                                    self.heap.str_chars(name).to_string(),
                                ));
                            }
                        }
                    }
                }

                op::SET_PROPERTY => {
                    let name = self.read_string_constant()?;
                    let target = self.peek(1)?;
                    let instance_ref = target
                        .as_obj()
                        .filter(|&r| self.heap.instance(r).is_some())
                        .ok_or(RuntimeError::FieldsOnNonInstance)?;

                    let value = self.peek(0)?;
                    if let Some(instance) = self.heap.instance_mut(instance_ref) {
                        instance.fields.set(name, value);
                    }

                    // Leave the assigned value as the expression result.
                    let value = self.pop()?;
                    self.pop()?;
                    self.push(value);
                }

                op::EQUAL => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.push(Value::Bool(Value::equals(a, b)));
                }

                op::GREATER => self.binary_number(|a, b| Value::Bool(a > b))?,
                op::LESS => self.binary_number(|a, b| Value::Bool(a < b))?,

                op::ADD => {
                    let b = self.peek(0)?;
                    let a = self.peek(1)?;
                    let strings = (self.heap.as_str_ref(a), self.heap.as_str_ref(b));
                    if let (Some(a), Some(b)) = strings {
                        let result = self.concatenate(a, b);
                        self.pop()?;
                        self.pop()?;
                        self.push(Value::Obj(result.as_obj()));
                    } else if let (Some(a), Some(b)) = (a.as_number(), b.as_number()) {
                        self.pop()?;
                        self.pop()?;
                        self.push(Value::Number(a + b));
                    } else {
                        return Err(RuntimeError::AddOperands);
                    }
                }

                op::SUBTRACT => self.binary_number(|a, b| Value::Number(a - b))?,
                op::MULTIPLY => self.binary_number(|a, b| Value::Number(a * b))?,
                op::DIVIDE => self.binary_number(|a, b| Value::Number(a / b))?,

                op::NOT => {
                    let value = self.pop()?;
                    self.push(Value::Bool(value.is_falsey()));
                }

                op::NEGATE => {
                    let n = self.peek(0)?.as_number().ok_or(RuntimeError::OperandNotNumber)?;
                    self.pop()?;
                    self.push(Value::Number(-n));
                }

                op::JUMP => {
                    let offset = self.read_short()? as usize;
                    self.frame_mut()?.ip += offset;
                }

                op::JUMP_IF_FALSE => {
                    let offset = self.read_short()? as usize;
                    if self.peek(0)?.is_falsey() {
                        self.frame_mut()?.ip += offset;
                    }
                }

                op::LOOP => {
                    let offset = self.read_short()? as usize;
                    let frame = self.frame_mut()?;
                    frame.ip = frame
                        .ip
                        .checked_sub(offset)
                        .ok_or(RuntimeError::IpOutOfBounds)?;
                }

                op::CALL => {
                    let arg_count = self.read_byte()?;
                    let callee = self.peek(arg_count as usize)?;
                    self.call_value(callee, arg_count)?;
                }

                op::CLOSURE => {
                    let function_value = self.read_constant()?;
                    let function = function_value
                        .as_obj()
                        .filter(|&r| self.heap.function(r).is_some())
                        .ok_or(RuntimeError::BadConstant)?;
                    let upvalue_count = self
                        .heap
                        .function(function)
                        .ok_or(RuntimeError::BadObject)?
                        .upvalue_count;

                    let closure = self.alloc_object(Obj::Closure(crate::object::Closure {
                        function,
                        upvalues: Vec::with_capacity(upvalue_count),
                    }));
                    // On the stack from here on, so captures allocated
                    // below stay reachable through it.
                    self.push(Value::Obj(closure));

                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte()? != 0;
                        let index = self.read_byte()? as usize;
                        let upvalue = if is_local {
                            let base = self.frame()?.base;
                            self.capture_upvalue(base + index)
                        } else {
                            let callable = self.frame()?.callable;
                            self.heap
                                .closure(callable)
                                .and_then(|c| c.upvalues.get(index).copied())
                                .ok_or(RuntimeError::BadObject)?
                        };
                        if let Some(c) = self.heap.closure_mut(closure) {
                            c.upvalues.push(upvalue);
                        }
                    }
                }

                op::CLOSE_UPVALUE => {
                    let top = self
                        .stack
                        .len()
                        .checked_sub(1)
                        .ok_or(RuntimeError::StackUnderflow)?;
                    self.close_upvalues(top);
                    self.pop()?;
                }

                op::CLASS => {
                    let name = self.read_string_constant()?;
                    let class = self.alloc_object(Obj::Class(Class {
                        name,
                        methods: Table::new(),
                    }));
                    self.push(Value::Obj(class));
                }

                op::METHOD => {
                    let name = self.read_string_constant()?;
                    let method = self.peek(0)?;
                    let class = self
                        .peek(1)?
                        .as_obj()
                        .filter(|&r| self.heap.class(r).is_some())
                        .ok_or(RuntimeError::BadObject)?;
                    if let Some(c) = self.heap.class_mut(class) {
                        c.methods.set(name, method);
                    }
                    self.pop()?;
                }

                op::RETURN => {
                    let result = self.pop()?;
                    let frame = *self.frame()?;
                    self.close_upvalues(frame.base);
                    self.frames.pop();

                    if self.frames.is_empty() {
                        // The script function itself.
                        self.pop()?;
                        return Ok(());
                    }

                    self.stack.truncate(frame.base);
                    self.push(result);
                }

                _ => return Err(RuntimeError::InvalidOpcode(opcode)),
            }
        }
    }

    /// Shared body of the strictly numeric binary operators: validate by
    /// peeking so an error leaves the operands in place for the trace.
    fn binary_number(&mut self, apply: fn(f64, f64) -> Value) -> Result<(), RuntimeError> {
        let b = self
            .peek(0)?
            .as_number()
            .ok_or(RuntimeError::OperandsNotNumbers)?;
        let a = self
            .peek(1)?
            .as_number()
            .ok_or(RuntimeError::OperandsNotNumbers)?;
        self.pop()?;
        self.pop()?;
        self.push(apply(a, b));
        Ok(())
    }

    /// Log the stack and the next instruction at trace level.
    fn trace_instruction(&self) {
        let Ok(frame) = self.frame() else { return };
        let Some(function) = self.heap.function(frame.function) else {
            return;
        };

        let mut stack_repr = String::new();
        for &value in &self.stack {
            stack_repr.push_str("[ ");
            let _ = write_value(&mut stack_repr, &self.heap, value);
            stack_repr.push_str(" ]");
        }

        let mut instruction = String::new();
        disassemble_instruction(&mut instruction, &self.heap, &function.chunk, frame.ip);
        trace!(stack = %stack_repr, instruction = %instruction.trim_end(), "dispatch");
    }

    /// Print the error and a frame trace to stderr, then reset the
    /// stacks so the VM is usable again.
    fn report_runtime_error(&mut self, error: &RuntimeError) {
        eprintln!("{error}");

        for frame in self.frames.iter().rev() {
            let Some(function) = self.heap.function(frame.function) else {
                continue;
            };
            // The ip is one past the failing instruction's byte.
            let line = function.chunk.line_at(frame.ip.saturating_sub(1)).unwrap_or(0);
            match function.name {
                None => eprintln!("[line {line}] in script"),
                Some(name) => eprintln!("[line {line}] in {}()", self.heap.str_chars(name)),
            }
        }

        self.reset_stacks();
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}
