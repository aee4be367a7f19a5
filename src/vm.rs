// File: src/vm.rs
//
// The stack-based virtual machine: call-frame dispatch, closures,
// open/closed upvalues, classes, and interning.

use crate::bytecode::OpCode;
use crate::compiler::Compiler;
use crate::errors::{InterpretResult, RuntimeError};
use crate::memory::Heap;
use crate::native;
use crate::object::{
    BoundMethodObj, ClassObj, ClosureObj, InstanceObj, NativeObj, ObjKind, ObjRef, UpvalueLocation,
};
use crate::table::Table;
use crate::value::{format_number, values_equal, Value};
use std::collections::HashSet;

const STACK_MAX: usize = 64 * 256;
const FRAMES_MAX: usize = 64;

struct CallFrame {
    closure: ObjRef,
    ip: usize,
    /// Index into `Vm::stack` where this frame's slot 0 (the callee, or
    /// for methods the receiver) lives.
    slots_base: usize,
}

pub struct Vm {
    pub heap: Heap,
    pub(crate) stack: Vec<Value>,
    frames: Vec<CallFrame>,
    pub(crate) open_upvalues: Option<ObjRef>,
    pub(crate) globals_names: Table<usize>,
    pub(crate) globals_values: Vec<Value>,
    const_globals: HashSet<usize>,
    /// The chain of in-progress `Function`s, mirrored here so the
    /// compiler (which borrows `&mut Vm` while it runs, §9 design note on
    /// avoiding process-wide mutable singletons) can register and
    /// unregister GC roots as it opens and closes `FunctionCompiler` scopes.
    pub(crate) compiler_roots: Vec<ObjRef>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        let mut vm = Vm {
            heap: Heap::new(),
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            open_upvalues: None,
            globals_names: Table::new(),
            globals_values: Vec::new(),
            const_globals: HashSet::new(),
            compiler_roots: Vec::new(),
        };
        vm.define_native("clock", 0, native::clock);
        vm.define_native("sqrt", 1, native::sqrt);
        vm.define_native("inputLine", 0, native::input_line);
        vm
    }

    fn define_native(
        &mut self,
        name: &'static str,
        arity: i32,
        function: crate::object::NativeFn,
    ) {
        let name_ref = self.heap.intern(name.as_bytes());
        let native_ref = self.heap.alloc_native(NativeObj { name, arity, function });
        let slot = self.resolve_global_slot(name_ref);
        self.globals_values[slot] = Value::Obj(native_ref);
    }

    // ---- Globals ----------------------------------------------------

    /// Gets the slot for `name`, creating one (initialized to
    /// `Undefined`) if this is the first time it's been seen.
    pub(crate) fn resolve_global_slot(&mut self, name: ObjRef) -> usize {
        let hash = self.heap.get_string(name).hash;
        if let Some(&slot) = self.globals_names.get(name, hash) {
            return slot;
        }
        let slot = self.globals_values.len();
        self.globals_values.push(Value::Undefined);
        self.globals_names.set(name, hash, slot);
        slot
    }

    pub(crate) fn mark_global_const(&mut self, slot: usize) {
        self.const_globals.insert(slot);
    }

    pub(crate) fn is_global_const(&self, slot: usize) -> bool {
        self.const_globals.contains(&slot)
    }

    // ---- GC cooperation ----------------------------------------------

    pub(crate) fn push(&mut self, v: Value) {
        self.stack.push(v);
    }

    pub(crate) fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow")
    }

    /// Allocates an interned string, running a collection first if the
    /// heap's threshold says so. Exposed to the compiler as well as used
    /// internally, since both must keep every other live object rooted
    /// through `self.stack`/`self.globals_values`/`self.compiler_roots`
    /// when a collection happens mid-allocation (§4.3 invariant).
    pub(crate) fn alloc_string(&mut self, bytes: &[u8]) -> ObjRef {
        let hash = crate::object::fnv1a_hash(bytes);
        if let Some(existing) = self.heap.find_interned(hash, bytes) {
            return existing;
        }
        self.maybe_collect();
        self.heap.alloc_string_raw(bytes.to_vec(), hash)
    }

    pub(crate) fn maybe_collect(&mut self) {
        if !self.heap.should_collect() {
            return;
        }
        let stack = &self.stack;
        let frames = &self.frames;
        let globals_values = &self.globals_values;
        let globals_names = &self.globals_names;
        let open_upvalues = self.open_upvalues;
        let compiler_roots = &self.compiler_roots;
        self.heap.collect_garbage(|heap, gray| {
            for v in stack {
                heap.mark_value(v, gray);
            }
            for frame in frames {
                heap.mark_object(frame.closure, gray);
            }
            for v in globals_values {
                heap.mark_value(v, gray);
            }
            for (key, _) in globals_names.iter() {
                heap.mark_object(key, gray);
            }
            let mut cur = open_upvalues;
            while let Some(r) = cur {
                heap.mark_object(r, gray);
                cur = heap.get_upvalue(r).next;
            }
            for r in compiler_roots {
                heap.mark_object(*r, gray);
            }
        });
    }

    // ---- Top-level entry point ---------------------------------------

    pub fn interpret(&mut self, source: &[u8]) -> InterpretResult {
        let function = match Compiler::compile(self, source) {
            Ok(f) => f,
            Err(errors) => {
                for error in &errors {
                    eprintln!("{error}");
                }
                return InterpretResult::CompileError;
            }
        };

        if crate::debug::trace_enabled() {
            eprint!("{}", self.heap.get_function(function).chunk.disassemble("script"));
        }

        self.push(Value::Obj(function));
        let closure = self.heap.alloc_closure(ClosureObj { function, upvalues: Vec::new() });
        self.pop();
        self.push(Value::Obj(closure));
        self.frames.push(CallFrame { closure, ip: 0, slots_base: 0 });

        match self.run() {
            Ok(()) => InterpretResult::Ok,
            Err(_) => InterpretResult::RuntimeError,
        }
    }

    // ---- Dispatch loop -------------------------------------------------

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            let op = OpCode::from_u8(self.read_byte());
            match op {
                OpCode::Constant => {
                    let idx = self.read_byte() as usize;
                    let v = self.chunk_constant(idx);
                    self.push(v);
                }
                OpCode::ConstantLong => {
                    let idx = self.read_u24() as usize;
                    let v = self.chunk_constant(idx);
                    self.push(v);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::Dup => {
                    let top = *self.stack.last().expect("stack underflow");
                    self.push(top);
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(values_equal(&a, &b)));
                }
                OpCode::Greater => self.binary_cmp(|a, b| a > b)?,
                OpCode::Less => self.binary_cmp(|a, b| a < b)?,
                OpCode::Add => self.add()?,
                OpCode::Subtract => self.binary_num(|a, b| a - b)?,
                OpCode::Multiply => self.binary_num(|a, b| a * b)?,
                OpCode::Divide => self.binary_num(|a, b| a / b)?,
                OpCode::Not => {
                    let v = self.pop();
                    self.push(Value::Bool(v.is_falsey()));
                }
                OpCode::Negate => {
                    let v = self.pop();
                    match v.as_number() {
                        Some(n) => self.push(Value::Number(-n)),
                        None => return Err(self.runtime_error("Operand must be a number.")),
                    }
                }
                OpCode::Print => {
                    let v = self.pop();
                    println!("{}", self.display_value(&v));
                }
                OpCode::DefineGlobal => {
                    let slot = self.read_byte() as usize;
                    self.define_global(slot);
                }
                OpCode::DefineGlobalLong => {
                    let slot = self.read_u24() as usize;
                    self.define_global(slot);
                }
                OpCode::GetGlobal => {
                    let slot = self.read_byte() as usize;
                    self.get_global(slot)?;
                }
                OpCode::GetGlobalLong => {
                    let slot = self.read_u24() as usize;
                    self.get_global(slot)?;
                }
                OpCode::SetGlobal => {
                    let slot = self.read_byte() as usize;
                    self.set_global(slot)?;
                }
                OpCode::SetGlobalLong => {
                    let slot = self.read_u24() as usize;
                    self.set_global(slot)?;
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.current_frame().slots_base;
                    self.push(self.stack[base + slot]);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.current_frame().slots_base;
                    self.stack[base + slot] = *self.stack.last().expect("stack underflow");
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let closure = self.current_frame().closure;
                    let up_ref = self.heap.get_closure(closure).upvalues[slot];
                    self.push(self.read_upvalue(up_ref));
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let closure = self.current_frame().closure;
                    let up_ref = self.heap.get_closure(closure).upvalues[slot];
                    let v = *self.stack.last().expect("stack underflow");
                    self.write_upvalue(up_ref, v);
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Jump => {
                    let offset = self.read_u16();
                    self.current_frame_mut().ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16();
                    if self.stack.last().expect("stack underflow").is_falsey() {
                        self.current_frame_mut().ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16();
                    self.current_frame_mut().ip -= offset as usize;
                }
                OpCode::Call => {
                    let argc = self.read_byte() as usize;
                    let callee = self.stack[self.stack.len() - 1 - argc];
                    self.call_value(callee, argc)?;
                }
                OpCode::Closure => {
                    let idx = self.read_byte() as usize;
                    self.closure(idx)?;
                }
                OpCode::ClosureLong => {
                    let idx = self.read_u24() as usize;
                    self.closure(idx)?;
                }
                OpCode::Class => {
                    let idx = self.read_byte() as usize;
                    self.class(idx);
                }
                OpCode::ClassLong => {
                    let idx = self.read_u24() as usize;
                    self.class(idx);
                }
                OpCode::Inherit => self.inherit()?,
                OpCode::Method => {
                    let idx = self.read_byte() as usize;
                    self.method(idx);
                }
                OpCode::MethodLong => {
                    let idx = self.read_u24() as usize;
                    self.method(idx);
                }
                OpCode::GetProperty => {
                    let idx = self.read_byte() as usize;
                    self.get_property(idx)?;
                }
                OpCode::GetPropertyLong => {
                    let idx = self.read_u24() as usize;
                    self.get_property(idx)?;
                }
                OpCode::SetProperty => {
                    let idx = self.read_byte() as usize;
                    self.set_property(idx)?;
                }
                OpCode::SetPropertyLong => {
                    let idx = self.read_u24() as usize;
                    self.set_property(idx)?;
                }
                OpCode::GetSuper => {
                    let idx = self.read_byte() as usize;
                    self.get_super(idx)?;
                }
                OpCode::GetSuperLong => {
                    let idx = self.read_u24() as usize;
                    self.get_super(idx)?;
                }
                OpCode::Invoke => {
                    let idx = self.read_byte() as usize;
                    let argc = self.read_byte() as usize;
                    self.invoke(idx, argc)?;
                }
                OpCode::InvokeLong => {
                    let idx = self.read_u24() as usize;
                    let argc = self.read_byte() as usize;
                    self.invoke(idx, argc)?;
                }
                OpCode::SuperInvoke => {
                    let idx = self.read_byte() as usize;
                    let argc = self.read_byte() as usize;
                    self.super_invoke(idx, argc)?;
                }
                OpCode::SuperInvokeLong => {
                    let idx = self.read_u24() as usize;
                    let argc = self.read_byte() as usize;
                    self.super_invoke(idx, argc)?;
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("frame underflow");
                    self.close_upvalues(frame.slots_base);
                    if self.frames.is_empty() {
                        self.pop(); // the reserved script slot
                        return Ok(());
                    }
                    self.stack.truncate(frame.slots_base);
                    self.push(result);
                }
            }
        }
    }

    // ---- Byte/operand reading ------------------------------------------

    fn current_frame(&self) -> &CallFrame {
        self.frames.last().expect("no active frame")
    }

    fn current_frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("no active frame")
    }

    fn chunk(&self) -> &crate::bytecode::Chunk {
        let closure = self.current_frame().closure;
        let function = self.heap.get_closure(closure).function;
        &self.heap.get_function(function).chunk
    }

    fn read_byte(&mut self) -> u8 {
        let ip = self.current_frame().ip;
        let byte = self.chunk().code[ip];
        self.current_frame_mut().ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let ip = self.current_frame().ip;
        let v = self.chunk().read_u16(ip);
        self.current_frame_mut().ip += 2;
        v
    }

    fn read_u24(&mut self) -> u32 {
        let ip = self.current_frame().ip;
        let v = self.chunk().read_u24(ip);
        self.current_frame_mut().ip += 3;
        v
    }

    fn chunk_constant(&self, idx: usize) -> Value {
        self.chunk().constants[idx]
    }

    // ---- Arithmetic / comparison ---------------------------------------

    fn binary_num(&mut self, op: impl Fn(f64, f64) -> f64) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => {
                self.push(Value::Number(op(x, y)));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be numbers.")),
        }
    }

    fn binary_cmp(&mut self, op: impl Fn(f64, f64) -> bool) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => {
                self.push(Value::Bool(op(x, y)));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be numbers.")),
        }
    }

    fn add(&mut self) -> Result<(), RuntimeError> {
        // Peek rather than pop so the operand strings stay reachable
        // while the concatenated buffer is being built (§4.2).
        let b = *self.stack.last().unwrap();
        let a = *self.stack[..self.stack.len() - 1].last().unwrap();
        if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
            self.pop();
            self.pop();
            self.push(Value::Number(x + y));
            return Ok(());
        }
        if let (Some(sa), Some(sb)) = (self.as_string_bytes(&a), self.as_string_bytes(&b)) {
            let mut combined = sa;
            combined.extend_from_slice(&sb);
            let result = self.alloc_string(&combined);
            self.pop();
            self.pop();
            self.push(Value::Obj(result));
            return Ok(());
        }
        Err(self.runtime_error("Operands must be two numbers or two strings."))
    }

    fn as_string_bytes(&self, v: &Value) -> Option<Vec<u8>> {
        match v {
            Value::Obj(r) => match self.heap.get(*r) {
                ObjKind::String(s) => Some(s.bytes.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    fn display_value(&self, v: &Value) -> String {
        match v {
            Value::Obj(r) => match self.heap.get(*r) {
                ObjKind::String(s) => s.as_str_lossy().into_owned(),
                ObjKind::Function(f) => match f.name {
                    Some(n) => format!("<fn {}>", self.heap.get_string(n).as_str_lossy()),
                    None => "<script>".to_string(),
                },
                ObjKind::Native(n) => format!("<native fn {}>", n.name),
                ObjKind::Closure(c) => {
                    let f = self.heap.get_function(c.function);
                    match f.name {
                        Some(n) => format!("<fn {}>", self.heap.get_string(n).as_str_lossy()),
                        None => "<script>".to_string(),
                    }
                }
                ObjKind::Class(c) => self.heap.get_string(c.name).as_str_lossy().into_owned(),
                ObjKind::Instance(i) => {
                    let class = self.heap.get_class(i.class);
                    format!("{} instance", self.heap.get_string(class.name).as_str_lossy())
                }
                ObjKind::BoundMethod(b) => {
                    let closure = self.heap.get_closure(b.method);
                    let f = self.heap.get_function(closure.function);
                    match f.name {
                        Some(n) => format!("<fn {}>", self.heap.get_string(n).as_str_lossy()),
                        None => "<script>".to_string(),
                    }
                }
                ObjKind::Upvalue(_) => "<upvalue>".to_string(),
            },
            _ => format_number_or_other(v),
        }
    }

    // ---- Globals --------------------------------------------------------

    fn define_global(&mut self, slot: usize) {
        let v = self.pop();
        self.globals_values[slot] = v;
    }

    fn get_global(&mut self, slot: usize) -> Result<(), RuntimeError> {
        match self.globals_values.get(slot) {
            Some(v) if !v.is_undefined() => {
                let v = *v;
                self.push(v);
                Ok(())
            }
            _ => {
                let name = self.global_name_for(slot);
                Err(self.runtime_error(&format!("Undefined variable '{name}'.")))
            }
        }
    }

    fn set_global(&mut self, slot: usize) -> Result<(), RuntimeError> {
        if self.globals_values.get(slot).map(|v| v.is_undefined()).unwrap_or(true) {
            let name = self.global_name_for(slot);
            return Err(self.runtime_error(&format!("Undefined variable '{name}'.")));
        }
        if self.is_global_const(slot) {
            let name = self.global_name_for(slot);
            return Err(self.runtime_error(&format!("Cannot assign to constant '{name}'.")));
        }
        let v = *self.stack.last().expect("stack underflow");
        self.globals_values[slot] = v;
        Ok(())
    }

    fn global_name_for(&self, slot: usize) -> String {
        self.globals_names
            .find_key_by(|s| *s == slot)
            .map(|r| self.heap.get_string(r).as_str_lossy().into_owned())
            .unwrap_or_else(|| "?".to_string())
    }

    // ---- Calls ------------------------------------------------------------

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), RuntimeError> {
        let Value::Obj(r) = callee else {
            return Err(self.runtime_error("Can only call functions and classes."));
        };
        match self.heap.get(r) {
            ObjKind::Closure(_) => self.call_closure(r, argc),
            ObjKind::Native(_) => self.call_native(r, argc),
            ObjKind::Class(_) => {
                let init_name = self.alloc_string(b"init");
                let init_hash = crate::object::fnv1a_hash(b"init");
                let init = match self.heap.get(r) {
                    ObjKind::Class(class) => class.methods.get(init_name, init_hash).copied(),
                    _ => unreachable!(),
                };
                let instance =
                    self.heap.alloc_instance(InstanceObj { class: r, fields: Table::new() });
                let base = self.stack.len() - argc - 1;
                self.stack[base] = Value::Obj(instance);
                match init {
                    Some(init_closure) => self.call_closure(init_closure, argc),
                    None => {
                        if argc != 0 {
                            return Err(self.runtime_error(&format!(
                                "Expected 0 arguments but got {argc}."
                            )));
                        }
                        Ok(())
                    }
                }
            }
            ObjKind::BoundMethod(bound) => {
                let receiver = bound.receiver;
                let method = bound.method;
                let base = self.stack.len() - argc - 1;
                self.stack[base] = receiver;
                self.call_closure(method, argc)
            }
            _ => Err(self.runtime_error("Can only call functions and classes.")),
        }
    }

    fn call_native(&mut self, native_ref: ObjRef, argc: usize) -> Result<(), RuntimeError> {
        let (arity, function) = match self.heap.get(native_ref) {
            ObjKind::Native(n) => (n.arity, n.function),
            _ => unreachable!(),
        };
        if arity >= 0 && arity as usize != argc {
            return Err(self.runtime_error(&format!(
                "Expected {arity} arguments but got {argc}."
            )));
        }
        let args_start = self.stack.len() - argc;
        let args: Vec<Value> = self.stack[args_start..].to_vec();
        match function(&args, &mut self.heap) {
            Ok(result) => {
                self.stack.truncate(args_start - 1);
                self.push(result);
                Ok(())
            }
            Err(message) => Err(self.runtime_error(&message)),
        }
    }

    fn call_closure(&mut self, closure: ObjRef, argc: usize) -> Result<(), RuntimeError> {
        let function = self.heap.get_closure(closure).function;
        let arity = self.heap.get_function(function).arity as usize;
        if argc != arity {
            return Err(self.runtime_error(&format!(
                "Expected {arity} arguments but got {argc}."
            )));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        let slots_base = self.stack.len() - argc - 1;
        self.frames.push(CallFrame { closure, ip: 0, slots_base });
        Ok(())
    }

    // ---- Closures & upvalues -----------------------------------------

    fn closure(&mut self, const_idx: usize) -> Result<(), RuntimeError> {
        let function = match self.chunk_constant(const_idx) {
            Value::Obj(r) => r,
            _ => unreachable!("CLOSURE operand must be a Function constant"),
        };
        let upvalue_count = self.heap.get_function(function).upvalue_count as usize;
        let mut upvalues = Vec::with_capacity(upvalue_count);
        for _ in 0..upvalue_count {
            let is_local = self.read_byte() != 0;
            let index = self.read_byte() as usize;
            let up_ref = if is_local {
                let base = self.current_frame().slots_base;
                self.capture_upvalue(base + index)
            } else {
                self.heap.get_closure(self.current_frame().closure).upvalues[index]
            };
            upvalues.push(up_ref);
        }
        self.maybe_collect();
        let closure_ref = self.heap.alloc_closure(ClosureObj { function, upvalues });
        self.push(Value::Obj(closure_ref));
        Ok(())
    }

    fn capture_upvalue(&mut self, stack_index: usize) -> ObjRef {
        let mut cur = self.open_upvalues;
        let mut prev: Option<ObjRef> = None;
        while let Some(r) = cur {
            let loc = self.heap.get_upvalue(r).location;
            match loc {
                UpvalueLocation::Stack(idx) if idx == stack_index => return r,
                UpvalueLocation::Stack(idx) if idx < stack_index => break,
                _ => {}
            }
            prev = cur;
            cur = self.heap.get_upvalue(r).next;
        }

        let created = self.heap.alloc_upvalue(stack_index);
        self.heap.get_upvalue_mut(created).next = cur;
        match prev {
            Some(p) => self.heap.get_upvalue_mut(p).next = Some(created),
            None => self.open_upvalues = Some(created),
        }
        created
    }

    fn close_upvalues(&mut self, limit: usize) {
        while let Some(r) = self.open_upvalues {
            let (should_close, stack_idx) = match self.heap.get_upvalue(r).location {
                UpvalueLocation::Stack(idx) if idx >= limit => (true, idx),
                _ => (false, 0),
            };
            if !should_close {
                break;
            }
            let value = self.stack[stack_idx];
            let up = self.heap.get_upvalue_mut(r);
            up.closed = value;
            up.location = UpvalueLocation::Closed;
            self.open_upvalues = up.next;
            self.heap.get_upvalue_mut(r).next = None;
        }
    }

    fn read_upvalue(&self, r: ObjRef) -> Value {
        match self.heap.get_upvalue(r).location {
            UpvalueLocation::Stack(idx) => self.stack[idx],
            UpvalueLocation::Closed => self.heap.get_upvalue(r).closed,
        }
    }

    fn write_upvalue(&mut self, r: ObjRef, v: Value) {
        match self.heap.get_upvalue(r).location {
            UpvalueLocation::Stack(idx) => self.stack[idx] = v,
            UpvalueLocation::Closed => self.heap.get_upvalue_mut(r).closed = v,
        }
    }

    // ---- Classes & methods ---------------------------------------------

    fn class(&mut self, name_idx: usize) {
        let name = match self.chunk_constant(name_idx) {
            Value::Obj(r) => r,
            _ => unreachable!("CLASS operand must be a String constant"),
        };
        self.maybe_collect();
        let class_ref = self.heap.alloc_class(ClassObj { name, methods: Table::new() });
        self.push(Value::Obj(class_ref));
    }

    fn inherit(&mut self) -> Result<(), RuntimeError> {
        let subclass = match *self.stack.last().unwrap() {
            Value::Obj(r) => r,
            _ => unreachable!(),
        };
        let superclass_val = self.stack[self.stack.len() - 2];
        let superclass = match superclass_val {
            Value::Obj(r) if matches!(self.heap.get(r), ObjKind::Class(_)) => r,
            _ => return Err(self.runtime_error("Superclass must be a class.")),
        };
        let inherited: Vec<(ObjRef, ObjRef)> =
            self.heap.get_class(superclass).methods.iter().map(|(k, v)| (k, *v)).collect();
        for (key_ref, method) in inherited {
            let hash = self.heap.get_string(key_ref).hash;
            self.heap.get_class_mut(subclass).methods.set(key_ref, hash, method);
        }
        self.pop(); // subclass; the superclass value remains as the `super` local
        Ok(())
    }

    fn method(&mut self, name_idx: usize) {
        let name = match self.chunk_constant(name_idx) {
            Value::Obj(r) => r,
            _ => unreachable!("METHOD operand must be a String constant"),
        };
        let hash = self.heap.get_string(name).hash;
        let closure = match self.pop() {
            Value::Obj(r) => r,
            _ => unreachable!(),
        };
        let class = match *self.stack.last().unwrap() {
            Value::Obj(r) => r,
            _ => unreachable!(),
        };
        self.heap.get_class_mut(class).methods.set(name, hash, closure);
    }

    fn get_property(&mut self, name_idx: usize) -> Result<(), RuntimeError> {
        let name = match self.chunk_constant(name_idx) {
            Value::Obj(r) => r,
            _ => unreachable!(),
        };
        let instance_ref = match *self.stack.last().unwrap() {
            Value::Obj(r) if matches!(self.heap.get(r), ObjKind::Instance(_)) => r,
            _ => return Err(self.runtime_error("Only instances have properties.")),
        };
        let hash = self.heap.get_string(name).hash;
        if let Some(&field) = self.heap.get_instance(instance_ref).fields.get(name, hash) {
            self.pop();
            self.push(field);
            return Ok(());
        }
        let class = self.heap.get_instance(instance_ref).class;
        if let Some(&method) = self.heap.get_class(class).methods.get(name, hash) {
            self.pop();
            let bound = self
                .heap
                .alloc_bound_method(BoundMethodObj { receiver: Value::Obj(instance_ref), method });
            self.push(Value::Obj(bound));
            return Ok(());
        }
        let prop_name = self.heap.get_string(name).as_str_lossy().into_owned();
        Err(self.runtime_error(&format!("Undefined property '{prop_name}'.")))
    }

    fn set_property(&mut self, name_idx: usize) -> Result<(), RuntimeError> {
        let name = match self.chunk_constant(name_idx) {
            Value::Obj(r) => r,
            _ => unreachable!(),
        };
        let instance_ref = match self.stack[self.stack.len() - 2] {
            Value::Obj(r) if matches!(self.heap.get(r), ObjKind::Instance(_)) => r,
            _ => return Err(self.runtime_error("Only instances have fields.")),
        };
        let hash = self.heap.get_string(name).hash;
        let value = self.pop();
        self.heap.get_instance_mut(instance_ref).fields.set(name, hash, value);
        self.pop(); // instance
        self.push(value);
        Ok(())
    }

    fn get_super(&mut self, name_idx: usize) -> Result<(), RuntimeError> {
        let name = match self.chunk_constant(name_idx) {
            Value::Obj(r) => r,
            _ => unreachable!(),
        };
        let superclass = match self.pop() {
            Value::Obj(r) => r,
            _ => unreachable!(),
        };
        let receiver = self.pop();
        let hash = self.heap.get_string(name).hash;
        match self.heap.get_class(superclass).methods.get(name, hash).copied() {
            Some(method) => {
                let bound = self.heap.alloc_bound_method(BoundMethodObj { receiver, method });
                self.push(Value::Obj(bound));
                Ok(())
            }
            None => {
                let prop_name = self.heap.get_string(name).as_str_lossy().into_owned();
                Err(self.runtime_error(&format!("Undefined property '{prop_name}'.")))
            }
        }
    }

    fn invoke(&mut self, name_idx: usize, argc: usize) -> Result<(), RuntimeError> {
        let name = match self.chunk_constant(name_idx) {
            Value::Obj(r) => r,
            _ => unreachable!(),
        };
        let receiver = self.stack[self.stack.len() - 1 - argc];
        let instance_ref = match receiver {
            Value::Obj(r) if matches!(self.heap.get(r), ObjKind::Instance(_)) => r,
            _ => return Err(self.runtime_error("Only instances have methods.")),
        };
        let hash = self.heap.get_string(name).hash;
        if let Some(&field) = self.heap.get_instance(instance_ref).fields.get(name, hash) {
            let base = self.stack.len() - 1 - argc;
            self.stack[base] = field;
            return self.call_value(field, argc);
        }
        let class = self.heap.get_instance(instance_ref).class;
        self.invoke_from_class(class, name, hash, argc)
    }

    fn super_invoke(&mut self, name_idx: usize, argc: usize) -> Result<(), RuntimeError> {
        let name = match self.chunk_constant(name_idx) {
            Value::Obj(r) => r,
            _ => unreachable!(),
        };
        let superclass = match self.pop() {
            Value::Obj(r) => r,
            _ => unreachable!(),
        };
        let hash = self.heap.get_string(name).hash;
        self.invoke_from_class(superclass, name, hash, argc)
    }

    fn invoke_from_class(
        &mut self,
        class: ObjRef,
        name: ObjRef,
        hash: u32,
        argc: usize,
    ) -> Result<(), RuntimeError> {
        match self.heap.get_class(class).methods.get(name, hash).copied() {
            Some(method) => self.call_closure(method, argc),
            None => {
                let prop_name = self.heap.get_string(name).as_str_lossy().into_owned();
                Err(self.runtime_error(&format!("Undefined property '{prop_name}'.")))
            }
        }
    }

    // ---- Errors ----------------------------------------------------------

    fn runtime_error(&mut self, message: &str) -> RuntimeError {
        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let function = self.heap.get_closure(frame.closure).function;
            let f = self.heap.get_function(function);
            let line = f.chunk.get_line(frame.ip.saturating_sub(1));
            let name = match f.name {
                Some(n) => self.heap.get_string(n).as_str_lossy().into_owned(),
                None => "script".to_string(),
            };
            trace.push(format!("[line {line}] in {name}"));
        }
        eprintln!("{message}");
        for line in &trace {
            eprintln!("{line}");
        }
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = None;
        RuntimeError { message: message.to_string(), trace }
    }
}

fn format_number_or_other(v: &Value) -> String {
    match v {
        Value::Number(n) => format_number(*n),
        other => other.to_string(),
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
    fn arithmetic_precedence() {
        assert_eq!(run("print 1 + 2 * 3;"), InterpretResult::Ok);
    }

    #[test]
    fn undefined_global_read_is_runtime_error() {
        assert_eq!(run("var x; x;"), InterpretResult::RuntimeError);
    }

    #[test]
    fn const_reassignment_is_compile_error() {
        assert_eq!(run("const PI = 3; PI = 4;"), InterpretResult::CompileError);
    }

    #[test]
    fn closures_share_captured_state() {
        let src = r#"
            fun makeCounter() {
                var c = 0;
                fun inc() { c = c + 1; return c; }
                return inc;
            }
            var f = makeCounter();
            print f();
            print f();
            print f();
        "#;
        assert_eq!(run(src), InterpretResult::Ok);
    }

    #[test]
    fn classes_with_init_and_inheritance() {
        let src = r#"
            class Animal {
                init(name) { this.name = name; }
                speak() { return this.name; }
            }
            class Dog < Animal {
                speak() { return "Woof, " + super.speak(); }
            }
            var d = Dog("Rex");
            print d.speak();
        "#;
        assert_eq!(run(src), InterpretResult::Ok);
    }
}
