// File: src/compiler.rs
//
// Single-pass compiler: a Pratt expression parser fused with a
// scope-aware local/upvalue resolver, emitting bytecode directly with
// no intermediate AST. `Compiler` borrows the `Vm` for its whole run so
// every allocation (interned identifiers, nested Function objects) goes
// through the same GC-safe paths the VM itself uses — there is no
// process-wide compiler singleton.

use crate::bytecode::{Chunk, OpCode};
use crate::errors::CompileError;
use crate::lexer::Scanner;
use crate::object::{FunctionObj, ObjRef};
use crate::token::{Token, TokenKind};
use crate::value::Value;
use crate::vm::Vm;

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_JUMP: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // also ternary `?:`
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call | Primary => Primary,
        }
    }
}

fn token_precedence(kind: TokenKind) -> Precedence {
    use TokenKind::*;
    match kind {
        Minus | Plus => Precedence::Term,
        Slash | Star => Precedence::Factor,
        BangEqual | EqualEqual => Precedence::Equality,
        Greater | GreaterEqual | Less | LessEqual => Precedence::Comparison,
        And => Precedence::And,
        Or => Precedence::Or,
        Question => Precedence::Assignment,
        LeftParen | Dot => Precedence::Call,
        _ => Precedence::None,
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local {
    name: Vec<u8>,
    /// -1 marks "declared but not yet initialized" — reading it in its
    /// own initializer expression is a compile error.
    depth: i32,
    mutable: bool,
    is_captured: bool,
}

#[derive(Clone, Copy)]
struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

struct LoopState {
    continue_target: usize,
    /// Scope depth at the loop's own entry; `break`/`continue` pop every
    /// local declared deeper than this before jumping.
    scope_depth: usize,
    break_jumps: Vec<usize>,
}

struct FunctionFrame {
    /// The in-progress `Function` heap object. Mirrored onto
    /// `vm.compiler_roots` for the lifetime of this frame so a
    /// collection triggered by a nested identifier/string allocation
    /// can still trace its (incomplete) chunk.
    function: ObjRef,
    kind: FunctionKind,
    arity: u8,
    locals: Vec<Local>,
    scope_depth: usize,
    upvalues: Vec<UpvalueDesc>,
    loops: Vec<LoopState>,
}

struct ClassFrame {
    has_superclass: bool,
}

pub struct Compiler<'vm, 'src> {
    vm: &'vm mut Vm,
    scanner: Scanner<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    frames: Vec<FunctionFrame>,
    classes: Vec<ClassFrame>,
}

impl<'vm, 'src> Compiler<'vm, 'src> {
    pub fn compile(vm: &'vm mut Vm, source: &'src [u8]) -> Result<ObjRef, Vec<CompileError>> {
        let mut compiler = Compiler::new(vm, source);
        compiler.advance();
        while !compiler.check(TokenKind::Eof) {
            compiler.declaration();
        }
        compiler.consume(TokenKind::Eof, "Expect end of expression.");
        let function_ref = compiler.finish_script();
        if compiler.had_error {
            Err(std::mem::take(&mut compiler.errors))
        } else {
            Ok(function_ref)
        }
    }

    fn new(vm: &'vm mut Vm, source: &'src [u8]) -> Self {
        let dummy = Token { kind: TokenKind::Eof, lexeme: &source[0..0], line: 1 };
        let mut compiler = Compiler {
            vm,
            scanner: Scanner::new(source),
            previous: dummy.clone(),
            current: dummy,
            had_error: false,
            panic_mode: false,
            errors: Vec::new(),
            frames: Vec::new(),
            classes: Vec::new(),
        };
        compiler.begin_function(FunctionKind::Script, None);
        compiler
    }

    fn finish_script(&mut self) -> ObjRef {
        let (function, _upvalues) = self.finish_function();
        function
    }

    // ---- Token stream ---------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current.clone();
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme_str().into_owned();
            self.error_at_current(&message);
        }
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

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current.clone();
        self.error_at(&token, message);
    }

    fn error(&mut self, message: &str) {
        let token = self.previous.clone();
        self.error_at(&token, message);
    }

    fn error_at(&mut self, token: &Token, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let (at, at_end) = match token.kind {
            TokenKind::Eof => (None, true),
            TokenKind::Error => (None, false),
            _ => (Some(token.lexeme_str().into_owned()), false),
        };
        self.errors.push(CompileError { line: token.line, at, at_end, message: message.to_string() });
    }

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
                | TokenKind::Const
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return
                | TokenKind::Switch => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ---- Function frames --------------------------------------------------

    fn current_frame(&self) -> &FunctionFrame {
        self.frames.last().expect("no active function frame")
    }

    fn current_frame_mut(&mut self) -> &mut FunctionFrame {
        self.frames.last_mut().expect("no active function frame")
    }

    fn begin_function(&mut self, kind: FunctionKind, name: Option<ObjRef>) {
        let function = self.vm.heap.alloc_function(FunctionObj {
            arity: 0,
            upvalue_count: 0,
            name,
            chunk: Chunk::new(),
        });
        self.vm.compiler_roots.push(function);
        let slot0_name =
            if kind == FunctionKind::Method || kind == FunctionKind::Initializer {
                b"this".to_vec()
            } else {
                Vec::new()
            };
        let slot0 = Local { name: slot0_name, depth: 0, mutable: false, is_captured: false };
        self.frames.push(FunctionFrame {
            function,
            kind,
            arity: 0,
            locals: vec![slot0],
            scope_depth: 0,
            upvalues: Vec::new(),
            loops: Vec::new(),
        });
    }

    /// Emits the implicit end-of-body return, pops the frame, and writes
    /// the accumulated arity/upvalue count back onto the heap `Function`.
    fn finish_function(&mut self) -> (ObjRef, Vec<UpvalueDesc>) {
        self.emit_return_default();
        let frame = self.frames.pop().expect("finish_function with no active frame");
        self.vm.compiler_roots.pop();
        let f = self.vm.heap.get_function_mut(frame.function);
        f.arity = frame.arity;
        f.upvalue_count = frame.upvalues.len() as u8;
        (frame.function, frame.upvalues)
    }

    // ---- Bytecode emission ------------------------------------------------

    fn chunk_len(&self) -> usize {
        self.vm.heap.get_function(self.current_frame().function).chunk.code.len()
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        let function = self.current_frame().function;
        self.vm.heap.get_function_mut(function).chunk.write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_u24(&mut self, value: u32) {
        let line = self.previous.line;
        let function = self.current_frame().function;
        self.vm.heap.get_function_mut(function).chunk.write_u24(value, line);
    }

    /// Emits `short_op idx8` if `index` fits a byte, else `long_op idx24`,
    /// so a chunk's constant pool can grow past 256 entries without
    /// every identifier/constant-carrying opcode paying the wider
    /// operand cost up front.
    fn emit_indexed(&mut self, short_op: OpCode, long_op: OpCode, index: usize) {
        if index <= u8::MAX as usize {
            self.emit_byte(short_op as u8);
            self.emit_byte(index as u8);
        } else {
            self.emit_byte(long_op as u8);
            self.emit_u24(index as u32);
        }
    }

    fn make_constant(&mut self, value: Value) -> usize {
        let function = self.current_frame().function;
        self.vm.heap.get_function_mut(function).chunk.add_constant(value)
    }

    fn emit_constant(&mut self, value: Value) {
        let idx = self.make_constant(value);
        self.emit_indexed(OpCode::Constant, OpCode::ConstantLong, idx);
    }

    /// Interns `bytes` and adds it to the current chunk's constant pool.
    /// No extra GC rooting is needed between the intern and the append:
    /// nothing else allocates in between, so the still-unrooted string
    /// can't be collected before it lands in the (already-rooted,
    /// in-progress) function's chunk.
    fn identifier_constant(&mut self, bytes: &[u8]) -> usize {
        let r = self.vm.alloc_string(bytes);
        self.make_constant(Value::Obj(r))
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_byte(op as u8);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.chunk_len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.chunk_len() - offset - 2;
        if jump > MAX_JUMP {
            self.error("Too much code to jump over.");
        }
        let function = self.current_frame().function;
        let chunk = &mut self.vm.heap.get_function_mut(function).chunk;
        chunk.code[offset] = ((jump >> 8) & 0xff) as u8;
        chunk.code[offset + 1] = (jump & 0xff) as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.chunk_len() - loop_start + 2;
        if offset > MAX_JUMP {
            self.error("Loop body too large.");
        }
        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    fn emit_return_default(&mut self) {
        if self.current_frame().kind == FunctionKind::Initializer {
            self.emit_byte(OpCode::GetLocal as u8);
            self.emit_byte(0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    // ---- Declarations -------------------------------------------------

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration(true);
        } else if self.match_token(TokenKind::Const) {
            self.var_declaration(false);
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn parse_variable(&mut self, error_msg: &str, mutable: bool) -> usize {
        self.consume(TokenKind::Identifier, error_msg);
        self.declare_variable(mutable);
        if self.current_frame().scope_depth > 0 {
            return usize::MAX; // local — no global slot, ignored by define_variable
        }
        let name = self.previous.lexeme.to_vec();
        let name_ref = self.vm.alloc_string(&name);
        self.vm.resolve_global_slot(name_ref)
    }

    fn declare_variable(&mut self, mutable: bool) {
        if self.current_frame().scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme.to_vec();
        let depth = self.current_frame().scope_depth as i32;
        let mut duplicate = false;
        for local in self.current_frame().locals.iter().rev() {
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if local.name == name {
                duplicate = true;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name, mutable);
    }

    fn add_local(&mut self, name: Vec<u8>, mutable: bool) {
        if self.current_frame().locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.current_frame_mut().locals.push(Local { name, depth: -1, mutable, is_captured: false });
    }

    fn mark_initialized(&mut self) {
        if self.current_frame().scope_depth == 0 {
            return;
        }
        let depth = self.current_frame().scope_depth as i32;
        let frame = self.current_frame_mut();
        let last = frame.locals.len() - 1;
        frame.locals[last].depth = depth;
    }

    fn define_variable(&mut self, slot: usize) {
        if self.current_frame().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_indexed(OpCode::DefineGlobal, OpCode::DefineGlobalLong, slot);
    }

    fn var_declaration(&mut self, mutable: bool) {
        let msg = if mutable { "Expect variable name." } else { "Expect constant name." };
        let slot = self.parse_variable(msg, mutable);
        let is_local = self.current_frame().scope_depth > 0;
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else if mutable {
            // Globals left without an initializer start life as
            // `Undefined`, not `Nil` — reading one before assignment is
            // a runtime error, not a silent nil (§8).
            if is_local {
                self.emit_op(OpCode::Nil);
            } else {
                self.emit_constant(Value::Undefined);
            }
        } else {
            self.error("Const declaration requires an initializer.");
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(slot);
        if !mutable && !is_local {
            self.vm.mark_global_const(slot);
        }
    }

    fn fun_declaration(&mut self) {
        let slot = self.parse_variable("Expect function name.", true);
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(slot);
    }

    fn function(&mut self, kind: FunctionKind) {
        let name_bytes = self.previous.lexeme.to_vec();
        let name_ref = self.vm.alloc_string(&name_bytes);
        self.begin_function(kind, Some(name_ref));
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.current_frame().arity == 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                self.current_frame_mut().arity += 1;
                let constant = self.parse_variable("Expect parameter name.", true);
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();
        let (function_ref, upvalues) = self.finish_function();
        let idx = self.make_constant(Value::Obj(function_ref));
        self.emit_indexed(OpCode::Closure, OpCode::ClosureLong, idx);
        for up in upvalues {
            self.emit_byte(if up.is_local { 1 } else { 0 });
            self.emit_byte(up.index);
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous.lexeme.to_vec();
        self.declare_variable(true);
        let name_ref = self.vm.alloc_string(&class_name);
        let name_const = self.make_constant(Value::Obj(name_ref));
        self.emit_indexed(OpCode::Class, OpCode::ClassLong, name_const);
        if self.current_frame().scope_depth > 0 {
            self.mark_initialized();
        } else {
            let slot = self.vm.resolve_global_slot(name_ref);
            self.emit_indexed(OpCode::DefineGlobal, OpCode::DefineGlobalLong, slot);
        }

        self.classes.push(ClassFrame { has_superclass: false });

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            let super_name = self.previous.lexeme.to_vec();
            self.named_variable(&super_name, false);
            if super_name == class_name {
                self.error("A class can't inherit from itself.");
            }
            self.begin_scope();
            self.add_local(b"super".to_vec(), false);
            self.mark_initialized();
            self.named_variable(&class_name, false);
            self.emit_op(OpCode::Inherit);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable(&class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop); // the class value pushed for method binding

        if self.classes.last().unwrap().has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name_bytes = self.previous.lexeme.to_vec();
        let kind =
            if name_bytes == b"init" { FunctionKind::Initializer } else { FunctionKind::Method };
        let name_const = self.identifier_constant(&name_bytes);
        self.function(kind);
        self.emit_indexed(OpCode::Method, OpCode::MethodLong, name_const);
    }

    // ---- Statements -----------------------------------------------------

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::Switch) {
            self.switch_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::Continue) {
            self.continue_statement();
        } else if self.match_token(TokenKind::Break) {
            self.break_statement();
        } else if self.match_token(TokenKind::Case) {
            self.error("Can't use 'case' outside of a switch statement.");
        } else if self.match_token(TokenKind::Default) {
            self.error("Can't use 'default' outside of a switch statement.");
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
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn begin_scope(&mut self) {
        self.current_frame_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.current_frame_mut().scope_depth -= 1;
        let depth = self.current_frame().scope_depth as i32;
        loop {
            let pop_it = matches!(self.current_frame().locals.last(), Some(l) if l.depth > depth);
            if !pop_it {
                break;
            }
            let captured = self.current_frame().locals.last().unwrap().is_captured;
            self.current_frame_mut().locals.pop();
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");
        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk_len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");
        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.begin_loop(loop_start);
        self.statement();
        self.end_loop();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon) {
            // no initializer
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration(true);
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk_len();
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.chunk_len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");
            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.begin_loop(loop_start);
        self.statement();
        self.end_loop();
        self.emit_loop(loop_start);

        if let Some(jump) = exit_jump {
            self.patch_jump(jump);
            self.emit_op(OpCode::Pop);
        }
        self.end_scope();
    }

    /// `switch` desugars per-case to `DUP; <expr>; EQUAL; JUMP_IF_FALSE;
    /// POP; <stmts>; JUMP→end`, with an extra `POP` of the leftover
    /// comparison result threaded between each case's false branch and
    /// the next case's own `DUP` (§4.1).
    fn switch_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'switch'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after switch subject.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before switch body.");

        let mut end_jumps = Vec::new();
        let mut prev_case_jump: Option<usize> = None;

        while self.match_token(TokenKind::Case) {
            if let Some(jump) = prev_case_jump.take() {
                self.patch_jump(jump);
                self.emit_op(OpCode::Pop);
            }
            self.emit_op(OpCode::Dup);
            self.expression();
            self.consume(TokenKind::Colon, "Expect ':' after case value.");
            self.emit_op(OpCode::Equal);
            let next_case_jump = self.emit_jump(OpCode::JumpIfFalse);
            self.emit_op(OpCode::Pop);
            while !self.check(TokenKind::Case)
                && !self.check(TokenKind::Default)
                && !self.check(TokenKind::RightBrace)
                && !self.check(TokenKind::Eof)
            {
                self.declaration();
            }
            end_jumps.push(self.emit_jump(OpCode::Jump));
            prev_case_jump = Some(next_case_jump);
        }
        if let Some(jump) = prev_case_jump.take() {
            self.patch_jump(jump);
            self.emit_op(OpCode::Pop);
        }
        if self.match_token(TokenKind::Default) {
            self.consume(TokenKind::Colon, "Expect ':' after 'default'.");
            while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
                self.declaration();
            }
        }
        for jump in end_jumps {
            self.patch_jump(jump);
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after switch body.");
        self.emit_op(OpCode::Pop); // the duplicated subject
    }

    fn return_statement(&mut self) {
        if self.current_frame().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return_default();
        } else {
            if self.current_frame().kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn begin_loop(&mut self, continue_target: usize) {
        let depth = self.current_frame().scope_depth;
        self.current_frame_mut().loops.push(LoopState { continue_target, scope_depth: depth, break_jumps: Vec::new() });
    }

    fn end_loop(&mut self) {
        let loop_state = self.current_frame_mut().loops.pop().expect("end_loop with no active loop");
        for jump in loop_state.break_jumps {
            self.patch_jump(jump);
        }
    }

    fn emit_loop_exit_pops(&mut self) {
        let loop_depth = self.current_frame().loops.last().unwrap().scope_depth as i32;
        let locals_len = self.current_frame().locals.len();
        let count = self
            .current_frame()
            .locals
            .iter()
            .rev()
            .take_while(|l| l.depth > loop_depth)
            .count();
        for i in 0..count {
            let captured = self.current_frame().locals[locals_len - 1 - i].is_captured;
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    fn continue_statement(&mut self) {
        self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");
        if self.current_frame().loops.is_empty() {
            self.error("Can't use 'continue' outside of a loop.");
            return;
        }
        self.emit_loop_exit_pops();
        let target = self.current_frame().loops.last().unwrap().continue_target;
        self.emit_loop(target);
    }

    fn break_statement(&mut self) {
        self.consume(TokenKind::Semicolon, "Expect ';' after 'break'.");
        if self.current_frame().loops.is_empty() {
            self.error("Can't use 'break' outside of a loop.");
            return;
        }
        self.emit_loop_exit_pops();
        let jump = self.emit_jump(OpCode::Jump);
        self.current_frame_mut().loops.last_mut().unwrap().break_jumps.push(jump);
    }

    // ---- Expressions (Pratt parser) --------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        if !self.prefix(self.previous.kind, can_assign) {
            self.error("Expect expression.");
            return;
        }
        while precedence <= token_precedence(self.current.kind) {
            self.advance();
            self.infix(self.previous.kind, can_assign);
        }
        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn prefix(&mut self, kind: TokenKind, can_assign: bool) -> bool {
        match kind {
            TokenKind::LeftParen => self.grouping(),
            TokenKind::Minus | TokenKind::Bang => self.unary(),
            TokenKind::Number => self.number(),
            TokenKind::String => self.string(),
            TokenKind::True | TokenKind::False | TokenKind::Nil => self.literal(),
            TokenKind::Identifier => self.variable(can_assign),
            TokenKind::This => self.this_expr(),
            TokenKind::Super => self.super_expr(),
            _ => return false,
        }
        true
    }

    fn infix(&mut self, kind: TokenKind, can_assign: bool) {
        match kind {
            TokenKind::Minus
            | TokenKind::Plus
            | TokenKind::Slash
            | TokenKind::Star
            | TokenKind::BangEqual
            | TokenKind::EqualEqual
            | TokenKind::Greater
            | TokenKind::GreaterEqual
            | TokenKind::Less
            | TokenKind::LessEqual => self.binary(),
            TokenKind::And => self.and(),
            TokenKind::Or => self.or(),
            TokenKind::Question => self.ternary(),
            TokenKind::LeftParen => self.call(),
            TokenKind::Dot => self.dot(can_assign),
            _ => unreachable!("{kind:?} has no infix handler"),
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self) {
        let op = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match op {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self) {
        let op = self.previous.kind;
        self.parse_precedence(token_precedence(op).next());
        match op {
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            _ => unreachable!(),
        }
    }

    /// Right-associative: both arms recurse at `Assignment`.
    fn ternary(&mut self) {
        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Assignment);
        self.consume(TokenKind::Colon, "Expect ':' in ternary expression.");
        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Assignment);
        self.patch_jump(else_jump);
    }

    fn and(&mut self) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn number(&mut self) {
        let text = self.previous.lexeme_str();
        let value: f64 = text.parse().expect("scanner guarantees a well-formed number lexeme");
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self) {
        let lexeme = self.previous.lexeme;
        let bytes = &lexeme[1..lexeme.len() - 1];
        let r = self.vm.alloc_string(bytes);
        self.emit_constant(Value::Obj(r));
    }

    fn literal(&mut self) {
        match self.previous.kind {
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            _ => unreachable!(),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme.to_vec();
        self.named_variable(&name, can_assign);
    }

    fn this_expr(&mut self) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.named_variable(b"this", false);
    }

    fn super_expr(&mut self) {
        if self.classes.is_empty() {
            self.error("Can't use 'super' outside of a class.");
        } else if !self.classes.last().unwrap().has_superclass {
            self.error("Can't use 'super' in a class with no superclass.");
        }
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name_bytes = self.previous.lexeme.to_vec();
        let name_const = self.identifier_constant(&name_bytes);
        self.named_variable(b"this", false);
        if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.named_variable(b"super", false);
            self.emit_indexed(OpCode::SuperInvoke, OpCode::SuperInvokeLong, name_const);
            self.emit_byte(argc as u8);
        } else {
            self.named_variable(b"super", false);
            self.emit_indexed(OpCode::GetSuper, OpCode::GetSuperLong, name_const);
        }
    }

    fn call(&mut self) {
        let argc = self.argument_list();
        self.emit_op(OpCode::Call);
        self.emit_byte(argc as u8);
    }

    fn argument_list(&mut self) -> usize {
        let mut argc = 0usize;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if argc == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                argc += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        argc
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name_bytes = self.previous.lexeme.to_vec();
        let name_const = self.identifier_constant(&name_bytes);
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_indexed(OpCode::SetProperty, OpCode::SetPropertyLong, name_const);
        } else if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.emit_indexed(OpCode::Invoke, OpCode::InvokeLong, name_const);
            self.emit_byte(argc as u8);
        } else {
            self.emit_indexed(OpCode::GetProperty, OpCode::GetPropertyLong, name_const);
        }
    }

    // ---- Variable resolution ----------------------------------------------

    fn resolve_local(&mut self, frame_idx: usize, name: &[u8]) -> Option<(u8, bool)> {
        let found = {
            let locals = &self.frames[frame_idx].locals;
            locals
                .iter()
                .enumerate()
                .rev()
                .find(|(_, local)| local.name == name)
                .map(|(i, local)| (i as u8, local.mutable, local.depth == -1))
        };
        if let Some((i, mutable, uninitialized)) = found {
            if uninitialized {
                self.error("Can't read local variable in its own initializer.");
            }
            return Some((i, mutable));
        }
        None
    }

    fn resolve_upvalue(&mut self, frame_idx: usize, name: &[u8]) -> Option<(u8, bool)> {
        if frame_idx == 0 {
            return None;
        }
        let enclosing = frame_idx - 1;
        if let Some((local_idx, mutable)) = self.resolve_local(enclosing, name) {
            self.frames[enclosing].locals[local_idx as usize].is_captured = true;
            return Some((self.add_upvalue(frame_idx, local_idx, true), mutable));
        }
        if let Some((up_idx, mutable)) = self.resolve_upvalue(enclosing, name) {
            return Some((self.add_upvalue(frame_idx, up_idx, false), mutable));
        }
        None
    }

    fn add_upvalue(&mut self, frame_idx: usize, index: u8, is_local: bool) -> u8 {
        let upvalues = &mut self.frames[frame_idx].upvalues;
        for (i, up) in upvalues.iter().enumerate() {
            if up.index == index && up.is_local == is_local {
                return i as u8;
            }
        }
        if upvalues.len() >= MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        upvalues.push(UpvalueDesc { index, is_local });
        (upvalues.len() - 1) as u8
    }

    fn named_variable(&mut self, name: &[u8], can_assign: bool) {
        let frame_idx = self.frames.len() - 1;
        if let Some((slot, mutable)) = self.resolve_local(frame_idx, name) {
            self.emit_get_or_set(OpCode::GetLocal, OpCode::SetLocal, slot as usize, mutable, can_assign);
            return;
        }
        if let Some((slot, mutable)) = self.resolve_upvalue(frame_idx, name) {
            self.emit_get_or_set(OpCode::GetUpvalue, OpCode::SetUpvalue, slot as usize, mutable, can_assign);
            return;
        }
        let name_ref = self.vm.alloc_string(name);
        let slot = self.vm.resolve_global_slot(name_ref);
        let is_const = self.vm.is_global_const(slot);
        if can_assign && self.match_token(TokenKind::Equal) {
            if is_const {
                self.error("Cannot assign to a constant.");
            }
            self.expression();
            self.emit_indexed(OpCode::SetGlobal, OpCode::SetGlobalLong, slot);
        } else {
            self.emit_indexed(OpCode::GetGlobal, OpCode::GetGlobalLong, slot);
        }
    }

    fn emit_get_or_set(
        &mut self,
        get_op: OpCode,
        set_op: OpCode,
        arg: usize,
        mutable: bool,
        can_assign: bool,
    ) {
        if can_assign && self.match_token(TokenKind::Equal) {
            if !mutable {
                self.error("Cannot assign to a constant.");
            }
            self.expression();
            self.emit_byte(set_op as u8);
            self.emit_byte(arg as u8);
        } else {
            self.emit_byte(get_op as u8);
            self.emit_byte(arg as u8);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::InterpretResult;

    fn run(src: &str) -> InterpretResult {
        let mut vm = Vm::new();
        vm.interpret(src.as_bytes())
    }

    #[test]
    fn ternary_and_switch_compile() {
        assert_eq!(run("print true ? 1 : 2;"), InterpretResult::Ok);
        assert_eq!(
            run("switch (2) { case 1: print \"one\"; case 2: print \"two\"; default: print \"?\"; }"),
            InterpretResult::Ok
        );
    }

    #[test]
    fn break_outside_loop_is_compile_error() {
        assert_eq!(run("break;"), InterpretResult::CompileError);
    }

    #[test]
    fn continue_outside_loop_is_compile_error() {
        assert_eq!(run("continue;"), InterpretResult::CompileError);
    }

    #[test]
    fn self_reference_in_own_initializer_is_compile_error() {
        assert_eq!(run("{ var a = a; }"), InterpretResult::CompileError);
    }

    #[test]
    fn super_outside_class_is_compile_error() {
        assert_eq!(run("fun f() { return super.x; }"), InterpretResult::CompileError);
    }

    #[test]
    fn shadowing_reads_outer_initializer() {
        assert_eq!(run("var a = 2; { var a = a + 1; print a; } print a;"), InterpretResult::Ok);
    }

    #[test]
    fn upvalue_closes_on_frame_return() {
        let src = r#"
            fun outer() {
                var x = "outer";
                fun inner() { return x; }
                return inner;
            }
            print outer()();
        "#;
        assert_eq!(run(src), InterpretResult::Ok);
    }

    #[test]
    fn break_and_continue_pop_correctly() {
        let src = "for (var i = 0; i < 3; i = i + 1) { if (i == 1) continue; if (i == 2) break; print i; }";
        assert_eq!(run(src), InterpretResult::Ok);
    }
}
