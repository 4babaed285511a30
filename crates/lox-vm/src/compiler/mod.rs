// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Single-pass compiler from Lox source to bytecode.
//!
//! A Pratt parser with one token of lookahead drives code emission
//! directly: there is no syntax tree. Each function being compiled gets
//! its own [`FnCompiler`] context (locals, upvalue descriptors, scope
//! depth) on a stack that mirrors the nesting of `fun` declarations in
//! the source; the innermost context always emits into its own function's
//! chunk.
//!
//! Functions are allocated in the heap as soon as their compilation
//! starts and stay registered as collector roots until the enclosing
//! chunk's constant pool holds them, so a collection triggered by any
//! allocation mid-parse cannot free an in-progress function or anything
//! its constants reference.
//!
//! Diagnostics go straight to stderr as `[line N] error ...`. The first
//! error in a declaration flips the parser into panic mode, which
//! suppresses the cascade until `synchronize` finds a statement boundary.


mod disassemble;

pub use disassemble::{disassemble, disassemble_instruction};

use thiserror::Error;
use tracing::debug;

use crate::bytecode::op;
use crate::object::{Function, Obj, ObjRef};
use crate::scanner::{Scanner, Token, TokenKind};
use crate::value::Value;
use crate::vm::Vm;

/// Maximum locals per function; slot indices must fit in one byte.
const LOCALS_MAX: usize = 256;

/// Maximum upvalues per function.
const UPVALUES_MAX: usize = 256;

/// Compilation failed; the diagnostics already went to stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("compilation failed")]
pub struct CompileError;

/// Compile a source string into a script function.
///
/// The returned function has arity 0 and no name; the caller owns keeping
/// it reachable (the VM pushes it before framing the call).
///
/// # Errors
///
/// Returns [`CompileError`] when the source contains any syntax or
/// compile-time semantic error.
pub fn compile(vm: &mut Vm, source: &str) -> Result<ObjRef, CompileError> {
    let mut parser = Parser::new(vm, source);
    parser.begin_compiler(FunctionKind::Script);

    parser.advance();
    while !parser.match_token(TokenKind::Eof) {
        parser.declaration();
    }

    let (function, _) = parser.end_compiler();
    let had_error = parser.had_error;
    parser.vm.pop_compiler_root();

    if had_error { Err(CompileError) } else { Ok(function) }
}

/// Expression precedence, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . ()
    Primary,
}

impl Precedence {
    const fn one_higher(self) -> Self {
        match self {
            Self::None => Self::Assignment,
            Self::Assignment => Self::Or,
            Self::Or => Self::And,
            Self::And => Self::Equality,
            Self::Equality => Self::Comparison,
            Self::Comparison => Self::Term,
            Self::Term => Self::Factor,
            Self::Factor => Self::Unary,
            Self::Unary => Self::Call,
            Self::Call | Self::Primary => Self::Primary,
        }
    }
}

/// A prefix or infix handler. The flag tells prefix handlers whether an
/// `=` following them may be consumed as an assignment.
type ParseFn<'src, 'vm> = fn(&mut Parser<'src, 'vm>, bool);

/// Prefix handler for a token kind, if it can start an expression.
fn prefix_rule<'src, 'vm>(kind: TokenKind) -> Option<ParseFn<'src, 'vm>> {
    match kind {
        TokenKind::LeftParen => Some(Parser::grouping),
        TokenKind::Minus | TokenKind::Bang => Some(Parser::unary),
        TokenKind::Identifier => Some(Parser::variable),
        TokenKind::String => Some(Parser::string),
        TokenKind::Number => Some(Parser::number),
        TokenKind::False | TokenKind::True | TokenKind::Nil => Some(Parser::literal),
        TokenKind::This => Some(Parser::this),
        TokenKind::Super => Some(Parser::super_),
        _ => None,
    }
}

/// Infix handler for a token kind, if it can continue an expression.
fn infix_rule<'src, 'vm>(kind: TokenKind) -> Option<ParseFn<'src, 'vm>> {
    match kind {
        TokenKind::LeftParen => Some(Parser::call),
        TokenKind::Dot => Some(Parser::dot),
        TokenKind::Minus
        | TokenKind::Plus
        | TokenKind::Slash
        | TokenKind::Star
        | TokenKind::BangEqual
        | TokenKind::EqualEqual
        | TokenKind::Greater
        | TokenKind::GreaterEqual
        | TokenKind::Less
        | TokenKind::LessEqual => Some(Parser::binary),
        TokenKind::And => Some(Parser::and),
        TokenKind::Or => Some(Parser::or),
        _ => None,
    }
}

/// Infix binding power of a token kind.
fn infix_precedence(kind: TokenKind) -> Precedence {
    match kind {
        TokenKind::LeftParen | TokenKind::Dot => Precedence::Call,
        TokenKind::Minus | TokenKind::Plus => Precedence::Term,
        TokenKind::Slash | TokenKind::Star => Precedence::Factor,
        TokenKind::BangEqual | TokenKind::EqualEqual => Precedence::Equality,
        TokenKind::Greater | TokenKind::GreaterEqual | TokenKind::Less | TokenKind::LessEqual => {
            Precedence::Comparison
        }
        TokenKind::And => Precedence::And,
        TokenKind::Or => Precedence::Or,
        _ => Precedence::None,
    }
}

/// What kind of function a compiler context is producing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

/// A local variable in the current function.
struct Local<'src> {
    name: &'src str,
    /// Scope depth, or `None` between declaration and initialization.
    depth: Option<u32>,
    /// Whether any closure captures this local.
    is_captured: bool,
}

/// An upvalue descriptor: where the closure finds the captured variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpvalueDesc {
    index: u8,
    /// True when `index` is a local slot of the enclosing function,
    /// false when it is an upvalue index of the enclosing closure.
    is_local: bool,
}

/// Per-function compilation context.
struct FnCompiler<'src> {
    /// The heap-allocated function being filled in.
    function: ObjRef,
    kind: FunctionKind,
    arity: u8,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: u32,
}

/// Parser and emitter state shared by all nested compiler contexts.
struct Parser<'src, 'vm> {
    vm: &'vm mut Vm,
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    compilers: Vec<FnCompiler<'src>>,
    /// Nesting depth of enclosing `class` bodies; gates `this`.
    class_depth: usize,
}

impl<'src, 'vm> Parser<'src, 'vm> {
    fn new(vm: &'vm mut Vm, source: &'src str) -> Self {
        Self {
            vm,
            scanner: Scanner::new(source),
            current: Token::synthetic(),
            previous: Token::synthetic(),
            had_error: false,
            panic_mode: false,
            compilers: Vec::new(),
            class_depth: 0,
        }
    }

    // --- compiler context stack ------------------------------------------

    fn begin_compiler(&mut self, kind: FunctionKind) {
        let function = self.vm.alloc_object(Obj::Function(Function {
            arity: 0,
            upvalue_count: 0,
            chunk: crate::bytecode::Chunk::new(),
            name: None,
        }));
        self.vm.push_compiler_root(function);

        if kind != FunctionKind::Script {
            let name = self.vm.intern(self.previous.lexeme);
            if let Some(f) = self.vm.heap_mut().function_mut(function) {
                f.name = Some(name);
            }
        }

        // Slot 0 belongs to the callee; in methods it is the receiver.
        let slot_zero = match kind {
            FunctionKind::Method | FunctionKind::Initializer => "this",
            FunctionKind::Script | FunctionKind::Function => "",
        };
        let mut locals = Vec::new();
        locals.push(Local {
            name: slot_zero,
            depth: Some(0),
            is_captured: false,
        });

        self.compilers.push(FnCompiler {
            function,
            kind,
            arity: 0,
            locals,
            upvalues: Vec::new(),
            scope_depth: 0,
        });
    }

    /// Finish the innermost function: emit the implicit return, fix up
    /// arity and upvalue count, and hand back the function with its
    /// upvalue descriptors.
    ///
    /// The function stays on the VM's compiler-root stack; the caller
    /// pops it once the function is reachable elsewhere.
    fn end_compiler(&mut self) -> (ObjRef, Vec<UpvalueDesc>) {
        self.emit_return();

        let Some(compiler) = self.compilers.pop() else {
            return (ObjRef(0), Vec::new());
        };
        if let Some(f) = self.vm.heap_mut().function_mut(compiler.function) {
            f.arity = compiler.arity;
            f.upvalue_count = compiler.upvalues.len();
        }

        if !self.had_error && tracing::enabled!(tracing::Level::DEBUG) {
            if let Some(f) = self.vm.heap().function(compiler.function) {
                let name = match f.name {
                    Some(n) => self.vm.heap().str_chars(n).to_string(),
                    None => "<script>".to_string(),
                };
                let listing = disassemble(self.vm.heap(), &f.chunk, &name);
                debug!(function = %name, "\n{listing}");
            }
        }

        (compiler.function, compiler.upvalues)
    }

    fn compiler(&self) -> &FnCompiler<'src> {
        &self.compilers[self.compilers.len() - 1]
    }

    fn compiler_mut(&mut self) -> &mut FnCompiler<'src> {
        let last = self.compilers.len() - 1;
        &mut self.compilers[last]
    }

    // --- error reporting -------------------------------------------------

    fn error_at(&mut self, at_current: bool, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;

        let token = if at_current { self.current } else { self.previous };
        let mut location = String::new();
        match token.kind {
            TokenKind::Eof => location.push_str(" at end"),
            TokenKind::Error => {}
            _ => {
                location.push_str(" at '");
                location.push_str(token.lexeme);
                location.push('\'');
            }
        }
        eprintln!("[line {}] error{location}: {message}", token.line);
    }

    fn error(&mut self, message: &str) {
        self.error_at(false, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(true, message);
    }

    /// Leave panic mode by skipping to the next statement boundary.
    fn synchronize(&mut self) {
        self.panic_mode = false;

        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // --- token plumbing --------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme;
            self.error_at_current(message);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    // --- emission --------------------------------------------------------

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        let function = self.compiler().function;
        if let Some(f) = self.vm.heap_mut().function_mut(function) {
            f.chunk.write(byte, line);
        }
    }

    fn emit_bytes(&mut self, byte1: u8, byte2: u8) {
        self.emit_byte(byte1);
        self.emit_byte(byte2);
    }

    fn emit_return(&mut self) {
        if self.compiler().kind == FunctionKind::Initializer {
            // An initializer always hands back the receiver.
            self.emit_bytes(op::GET_LOCAL, 0);
        } else {
            self.emit_byte(op::NIL);
        }
        self.emit_byte(op::RETURN);
    }

    fn chunk_len(&self) -> usize {
        self.vm
            .heap()
            .function(self.compiler().function)
            .map_or(0, |f| f.chunk.code.len())
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let function = self.compiler().function;
        let index = self
            .vm
            .heap_mut()
            .function_mut(function)
            .and_then(|f| f.chunk.add_constant(value));
        match index {
            Some(index) => index,
            None => {
                self.error("too many constants in one chunk");
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_bytes(op::CONSTANT, index);
    }

    /// Emit a jump with a placeholder offset; returns the offset's
    /// position for [`Parser::patch_jump`].
    fn emit_jump(&mut self, instruction: u8) -> usize {
        self.emit_byte(instruction);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.chunk_len().saturating_sub(2)
    }

    /// Back-fill a jump emitted by [`Parser::emit_jump`] to land at the
    /// current end of the chunk.
    fn patch_jump(&mut self, target: usize) {
        let jump = self.chunk_len().saturating_sub(target + 2);
        if jump > usize::from(u16::MAX) {
            self.error("too much code to jump over");
        }
        let function = self.compiler().function;
        if let Some(f) = self.vm.heap_mut().function_mut(function) {
            if target + 1 < f.chunk.code.len() {
                f.chunk.code[target] = ((jump >> 8) & 0xff) as u8;
                f.chunk.code[target + 1] = (jump & 0xff) as u8;
            }
        }
    }

    /// Emit a backward jump to `loop_start`.
    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_byte(op::LOOP);
        let offset = self.chunk_len().saturating_sub(loop_start) + 2;
        if offset > usize::from(u16::MAX) {
            self.error("too much code to loop over");
        }
        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    // --- variables -------------------------------------------------------

    /// Intern an identifier and put it in the constant pool.
    fn identifier_constant(&mut self, name: &str) -> u8 {
        let s = self.vm.intern(name);
        self.make_constant(Value::Obj(s.as_obj()))
    }

    /// Resolve a name against the locals of compiler `ci`, innermost
    /// declaration first.
    fn resolve_local(&mut self, ci: usize, name: &str) -> Option<usize> {
        for i in (0..self.compilers[ci].locals.len()).rev() {
            if self.compilers[ci].locals[i].name == name {
                if self.compilers[ci].locals[i].depth.is_none() {
                    self.error("can't read local variable in its own initializer");
                }
                return Some(i);
            }
        }
        None
    }

    /// Resolve a name as an upvalue of compiler `ci`, capturing through
    /// every enclosing function on the way.
    fn resolve_upvalue(&mut self, ci: usize, name: &str) -> Option<usize> {
        if ci == 0 {
            return None;
        }

        if let Some(local) = self.resolve_local(ci - 1, name) {
            self.compilers[ci - 1].locals[local].is_captured = true;
            return Some(self.add_upvalue(ci, local as u8, true));
        }

        if let Some(upvalue) = self.resolve_upvalue(ci - 1, name) {
            return Some(self.add_upvalue(ci, upvalue as u8, false));
        }

        None
    }

    /// Add an upvalue descriptor to compiler `ci`, deduplicated.
    fn add_upvalue(&mut self, ci: usize, index: u8, is_local: bool) -> usize {
        let desc = UpvalueDesc { index, is_local };
        if let Some(existing) = self.compilers[ci].upvalues.iter().position(|&u| u == desc) {
            return existing;
        }
        if self.compilers[ci].upvalues.len() >= UPVALUES_MAX {
            self.error("too many closure variables in function");
            return 0;
        }
        self.compilers[ci].upvalues.push(desc);
        self.compilers[ci].upvalues.len() - 1
    }

    fn add_local(&mut self, name: &'src str) {
        if self.compiler().locals.len() >= LOCALS_MAX {
            self.error("too many local variables in function");
            return;
        }
        self.compiler_mut().locals.push(Local {
            name,
            depth: None,
            is_captured: false,
        });
    }

    /// Register `previous` as a local in the current scope. Globals are
    /// late-bound by name and skip this.
    fn declare_variable(&mut self) {
        if self.compiler().scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;

        let mut redeclared = false;
        for i in (0..self.compiler().locals.len()).rev() {
            let local = &self.compiler().locals[i];
            if let Some(depth) = local.depth {
                if depth < self.compiler().scope_depth {
                    break;
                }
            }
            if local.name == name {
                redeclared = true;
                break;
            }
        }
        if redeclared {
            self.error("a variable with this name already exists in this scope");
        }

        self.add_local(name);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);

        self.declare_variable();
        if self.compiler().scope_depth > 0 {
            return 0;
        }

        self.identifier_constant(self.previous.lexeme)
    }

    /// Flip the latest local from "declared" to "usable". The gap between
    /// the two states is what rejects `var x = x;`.
    fn mark_initialized(&mut self) {
        if self.compiler().scope_depth == 0 {
            return;
        }
        let depth = self.compiler().scope_depth;
        if let Some(local) = self.compiler_mut().locals.last_mut() {
            local.depth = Some(depth);
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.compiler().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_bytes(op::DEFINE_GLOBAL, global);
    }

    /// Compile a read or write of a named variable, resolving it as a
    /// local, an upvalue, or finally a global.
    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        let ci = self.compilers.len() - 1;
        let (get_op, set_op, arg) = if let Some(local) = self.resolve_local(ci, name.lexeme) {
            (op::GET_LOCAL, op::SET_LOCAL, local as u8)
        } else if let Some(upvalue) = self.resolve_upvalue(ci, name.lexeme) {
            (op::GET_UPVALUE, op::SET_UPVALUE, upvalue as u8)
        } else {
            let constant = self.identifier_constant(name.lexeme);
            (op::GET_GLOBAL, op::SET_GLOBAL, constant)
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_bytes(set_op, arg);
        } else {
            self.emit_bytes(get_op, arg);
        }
    }

    fn begin_scope(&mut self) {
        self.compiler_mut().scope_depth += 1;
    }

    /// Pop the scope's locals; captured ones are closed instead of
    /// dropped so closures keep seeing them.
    fn end_scope(&mut self) {
        self.compiler_mut().scope_depth -= 1;

        loop {
            let drop_local = match self.compiler().locals.last() {
                Some(local) => match local.depth {
                    Some(depth) => depth > self.compiler().scope_depth,
                    None => true,
                },
                None => false,
            };
            if !drop_local {
                break;
            }
            let captured = self
                .compiler()
                .locals
                .last()
                .is_some_and(|local| local.is_captured);
            if captured {
                self.emit_byte(op::CLOSE_UPVALUE);
            } else {
                self.emit_byte(op::POP);
            }
            self.compiler_mut().locals.pop();
        }
    }

    // --- expressions -----------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = prefix_rule(self.previous.kind) else {
            self.error("expected an expression");
            return;
        };

        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= infix_precedence(self.current.kind) {
            self.advance();
            if let Some(infix) = infix_rule(self.previous.kind) {
                infix(self, can_assign);
            }
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("invalid assignment target");
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "expected a ')'");
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        // Trim the surrounding quotes.
        let chars = &lexeme[1..lexeme.len() - 1];
        let s = self.vm.intern(chars);
        self.emit_constant(Value::Obj(s.as_obj()));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::Nil => self.emit_byte(op::NIL),
            TokenKind::False => self.emit_byte(op::FALSE),
            TokenKind::True => self.emit_byte(op::TRUE),
            _ => {}
        }
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.previous, can_assign);
    }

    fn this(&mut self, _can_assign: bool) {
        if self.class_depth == 0 {
            self.error("can't use 'this' outside of a class");
            return;
        }
        self.named_variable(self.previous, false);
    }

    fn super_(&mut self, _can_assign: bool) {
        self.error("'super' is not supported");
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;

        // Compile the operand.
        self.parse_precedence(Precedence::Unary);

        match operator {
            TokenKind::Bang => self.emit_byte(op::NOT),
            TokenKind::Minus => self.emit_byte(op::NEGATE),
            _ => {}
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;

        // Compile the right operand with one level tighter binding, so
        // the operators stay left-associative.
        self.parse_precedence(infix_precedence(operator).one_higher());

        match operator {
            TokenKind::BangEqual => self.emit_bytes(op::EQUAL, op::NOT),
            TokenKind::EqualEqual => self.emit_byte(op::EQUAL),
            TokenKind::Greater => self.emit_byte(op::GREATER),
            TokenKind::GreaterEqual => self.emit_bytes(op::LESS, op::NOT),
            TokenKind::Less => self.emit_byte(op::LESS),
            TokenKind::LessEqual => self.emit_bytes(op::GREATER, op::NOT),
            TokenKind::Plus => self.emit_byte(op::ADD),
            TokenKind::Minus => self.emit_byte(op::SUBTRACT),
            TokenKind::Star => self.emit_byte(op::MULTIPLY),
            TokenKind::Slash => self.emit_byte(op::DIVIDE),
            _ => {}
        }
    }

    fn and(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(op::JUMP_IF_FALSE);
        self.emit_byte(op::POP);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(op::JUMP_IF_FALSE);
        let end_jump = self.emit_jump(op::JUMP);

        self.patch_jump(else_jump);
        self.emit_byte(op::POP);

        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit_bytes(op::CALL, arg_count);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "expected a property name");
        let name = self.identifier_constant(self.previous.lexeme);

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_bytes(op::SET_PROPERTY, name);
        } else {
            self.emit_bytes(op::GET_PROPERTY, name);
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut arg_count: u8 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                if arg_count == u8::MAX {
                    self.error("can't have more than 255 arguments");
                }
                self.expression();
                arg_count = arg_count.saturating_add(1);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expected a ')'");
        arg_count
    }

    // --- functions and classes -------------------------------------------

    fn function(&mut self, kind: FunctionKind) {
        self.begin_compiler(kind);
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "expected a '('");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.compiler().arity == u8::MAX {
                    self.error_at_current("can't have more than 255 parameters");
                }
                let arity = self.compiler().arity.saturating_add(1);
                self.compiler_mut().arity = arity;

                let constant = self.parse_variable("expected a parameter name");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expected a ')'");

        self.consume(TokenKind::LeftBrace, "expected a '{'");
        self.block();

        // The frame teardown on RETURN drops every local, so no explicit
        // end_scope here.
        let (function, upvalues) = self.end_compiler();
        let constant = self.make_constant(Value::Obj(function));
        self.vm.pop_compiler_root();

        if upvalues.is_empty() {
            self.emit_bytes(op::CONSTANT, constant);
        } else {
            self.emit_bytes(op::CLOSURE, constant);
            for upvalue in upvalues {
                self.emit_byte(u8::from(upvalue.is_local));
                self.emit_byte(upvalue.index);
            }
        }
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "expected a method name");
        let constant = self.identifier_constant(self.previous.lexeme);
        let kind = if self.previous.lexeme == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };

        self.function(kind);
        self.emit_bytes(op::METHOD, constant);
    }

    // --- declarations and statements -------------------------------------

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("expected a variable name");

        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_byte(op::NIL);
        }

        self.consume(TokenKind::Semicolon, "expected a ';'");

        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("expected a function name");
        // A function may refer to itself recursively, so its binding is
        // usable before the body is done.
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "expected a class name");
        let name = self.previous;
        let name_constant = self.identifier_constant(name.lexeme);
        self.declare_variable();

        self.emit_bytes(op::CLASS, name_constant);
        self.define_variable(name_constant);

        self.class_depth += 1;

        // Put the class back on the stack while the methods install
        // themselves into it.
        self.named_variable(name, false);
        self.consume(TokenKind::LeftBrace, "expected a '{'");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "expected a '}'");
        self.emit_byte(op::POP);

        self.class_depth -= 1;
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "expected a '}'");
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "expected a ';'");
        self.emit_byte(op::POP);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "expected a '('");
        self.expression();
        self.consume(TokenKind::RightParen, "expected a ')'");

        let then_jump = self.emit_jump(op::JUMP_IF_FALSE);
        self.emit_byte(op::POP);
        self.statement();

        let else_jump = self.emit_jump(op::JUMP);
        self.patch_jump(then_jump);
        self.emit_byte(op::POP);

        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk_len();

        self.consume(TokenKind::LeftParen, "expected a '('");
        self.expression();
        self.consume(TokenKind::RightParen, "expected a ')'");

        let exit_jump = self.emit_jump(op::JUMP_IF_FALSE);
        self.emit_byte(op::POP);

        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_byte(op::POP);
    }

    fn for_statement(&mut self) {
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "expected a '('");
        if self.match_token(TokenKind::Semicolon) {
            // No initializer.
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk_len();

        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "expected a ';'");

            exit_jump = Some(self.emit_jump(op::JUMP_IF_FALSE));
            self.emit_byte(op::POP);
        }

        if !self.match_token(TokenKind::RightParen) {
            // The increment runs after the body, so jump over it now and
            // loop back to it from the body's end.
            let body_jump = self.emit_jump(op::JUMP);
            let increment_start = self.chunk_len();

            self.expression();
            self.emit_byte(op::POP);
            self.consume(TokenKind::RightParen, "expected a ')'");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_byte(op::POP);
        }

        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.compiler().kind == FunctionKind::Script {
            self.error("can't return from top-level code");
        }

        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.compiler().kind == FunctionKind::Initializer {
                self.error("can't return a value from an initializer");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "expected a ';'");
            self.emit_byte(op::RETURN);
        }
    }
}
