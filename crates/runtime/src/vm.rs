//! The bytecode virtual machine
//!
//! A stack machine over the shared heap: a value stack, a call-frame stack
//! bounded by `FRAMES_MAX`, the globals table, and the sorted list of open
//! upvalues. Dispatch is one dense `match` per decoded opcode.
//!
//! The VM is also the GC mutator: before every allocating instruction it
//! polls the heap and, when pressure demands, marks its roots (value
//! stack, frame closures, open upvalues, globals, the `init` string) and
//! runs the collection. Operands of the pending allocation are still on
//! the value stack at that point, so nothing reachable is lost.

use std::io::{self, Write};

use tracing::{debug, trace};

use salmon_core::chunk::{Chunk, OpCode};
use salmon_core::debug::{disassemble_chunk, disassemble_instruction};
use salmon_core::heap::{Heap, ObjRef};
use salmon_core::object::{
    NativeEnv, NativeFn, Obj, ObjArray, ObjBoundMethod, ObjClass, ObjClosure, ObjInstance,
    ObjNative, ObjUpvalue,
};
use salmon_core::table::Table;
use salmon_core::value::{Value, format_value};
use salmon_compiler::compile;

use crate::natives;

pub const FRAMES_MAX: usize = 64;
pub const STACK_MAX: usize = FRAMES_MAX * 256;

/// Outcome of interpreting one source program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
}

/// A runtime failure: the message plus the rendered stack trace, built at
/// the point of the error while the frames were still intact.
#[derive(Debug)]
pub struct RuntimeError(pub String);

/// Debugging switches, set by the CLI.
#[derive(Debug, Clone, Copy, Default)]
pub struct VmOptions {
    /// Log every instruction with the current stack at trace level.
    pub trace_execution: bool,
    /// Dump every compiled chunk to the output sink before running.
    pub disassemble: bool,
}

/// One active function invocation. `slots` indexes the value stack at the
/// callee/receiver position.
struct CallFrame {
    closure: ObjRef,
    ip: usize,
    slots: usize,
}

/// Shorthand for a callee after its heap kind has been inspected, so call
/// dispatch does not hold a heap borrow.
enum Callee {
    Bound(Value, ObjRef),
    Class,
    Closure,
    Native(NativeFn),
    NotCallable,
}

pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    /// Open upvalues ordered by strictly decreasing stack slot.
    open_upvalues: Vec<ObjRef>,
    init_string: ObjRef,
    /// Current script path for error attribution, updated by `OP_PATH`.
    path: String,
    options: VmOptions,
    out: Box<dyn Write>,
}

impl Vm {
    pub fn new(options: VmOptions) -> Self {
        Vm::with_writer(options, Box::new(io::stdout()))
    }

    /// Construct with a custom output sink; `_print` and `--disassemble`
    /// write there instead of stdout.
    pub fn with_writer(options: VmOptions, out: Box<dyn Write>) -> Self {
        let mut heap = Heap::new();
        let init_string = heap.intern("init");
        let mut vm = Vm {
            heap,
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            open_upvalues: Vec::new(),
            init_string,
            path: String::new(),
            options,
            out,
        };
        natives::install(&mut vm);
        vm
    }

    /// Register a native under a global name.
    pub fn define_native(&mut self, name: &str, function: NativeFn) {
        let name = self.heap.intern(name);
        let native = self.heap.alloc(Obj::Native(ObjNative { function }));
        let key = self.heap.key(name);
        self.globals.set(key, Value::Obj(native));
    }

    /// Compile and run one source program. Compile diagnostics and runtime
    /// errors go to stderr; `_print` output goes to the VM's sink.
    pub fn interpret(&mut self, source: &str, path: &str) -> InterpretResult {
        self.path = path.to_string();
        let function = match compile(source, path, &mut self.heap) {
            Ok(function) => function,
            Err(diagnostics) => {
                for line in diagnostics {
                    eprintln!("{line}");
                }
                return InterpretResult::CompileError;
            }
        };

        if self.options.disassemble {
            self.disassemble_program(function);
        }

        // Keep the function rooted while the closure is allocated.
        self.push(Value::Obj(function));
        let closure = self.heap.alloc(Obj::Closure(ObjClosure {
            function,
            upvalues: Vec::new(),
        }));
        self.pop();
        self.push(Value::Obj(closure));
        if let Err(error) = self.call(closure, 0) {
            eprintln!("{}", error.0);
            self.reset_stack();
            return InterpretResult::RuntimeError;
        }

        match self.run() {
            Ok(()) => InterpretResult::Ok,
            Err(error) => {
                eprintln!("{}", error.0);
                self.reset_stack();
                InterpretResult::RuntimeError
            }
        }
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    // ---- frame and chunk access ----

    fn frame(&self) -> &CallFrame {
        &self.frames[self.frames.len() - 1]
    }

    fn current_chunk(&self) -> &Chunk {
        let closure = self.frame().closure;
        let function = self.heap.closure(closure).function;
        &self.heap.function(function).chunk
    }

    fn read_byte(&mut self) -> u8 {
        let index = self.frames.len() - 1;
        let ip = self.frames[index].ip;
        self.frames[index].ip += 1;
        let closure = self.frames[index].closure;
        let function = self.heap.closure(closure).function;
        self.heap.function(function).chunk.code[ip]
    }

    fn read_short(&mut self) -> u16 {
        let high = self.read_byte();
        let low = self.read_byte();
        u16::from_be_bytes([high, low])
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        let closure = self.frame().closure;
        let function = self.heap.closure(closure).function;
        self.heap.function(function).chunk.constants[index]
    }

    fn read_string(&mut self) -> ObjRef {
        match self.read_constant() {
            Value::Obj(r) => r,
            _ => panic!("constant operand is not a string"),
        }
    }

    // ---- value stack ----

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        match self.stack.pop() {
            Some(value) => value,
            None => panic!("value stack underflow"),
        }
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    // ---- kind helpers ----

    fn as_instance(&self, value: Value) -> Option<ObjRef> {
        value
            .as_obj()
            .filter(|&r| matches!(self.heap.get(r), Obj::Instance(_)))
    }

    fn as_class(&self, value: Value) -> Option<ObjRef> {
        value
            .as_obj()
            .filter(|&r| matches!(self.heap.get(r), Obj::Class(_)))
    }

    fn as_string(&self, value: Value) -> Option<ObjRef> {
        value
            .as_obj()
            .filter(|&r| matches!(self.heap.get(r), Obj::String(_)))
    }

    fn as_array(&self, value: Value) -> Option<ObjRef> {
        value
            .as_obj()
            .filter(|&r| matches!(self.heap.get(r), Obj::Array(_)))
    }

    // ---- errors ----

    /// Build the error with its stack trace, innermost frame first. The
    /// caller propagates it out of `run`, which resets the stack.
    fn runtime_error(&self, message: impl Into<String>) -> RuntimeError {
        let mut text = message.into();
        for frame in self.frames.iter().rev() {
            let closure = self.heap.closure(frame.closure);
            let function = self.heap.function(closure.function);
            let instruction = frame.ip.saturating_sub(1);
            let line = function.chunk.lines.get(instruction).copied().unwrap_or(0);
            text.push_str(&format!("\n[file {}, line {}] in ", self.path, line));
            match function.name {
                Some(name) => {
                    text.push_str(&format!("{}()", self.heap.string(name).chars));
                }
                None => text.push_str("script"),
            }
        }
        RuntimeError(text)
    }

    // ---- garbage collection ----

    /// Allocation safepoint. Every operand of the allocation about to
    /// happen must already be reachable from the stack.
    fn maybe_gc(&mut self) {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
    }

    fn collect_garbage(&mut self) {
        debug!(bytes = self.heap.bytes_allocated(), "gc begin");
        for &value in &self.stack {
            self.heap.mark_value(value);
        }
        for frame in &self.frames {
            self.heap.mark_object(frame.closure);
        }
        for &upvalue in &self.open_upvalues {
            self.heap.mark_object(upvalue);
        }
        for (key, value) in self.globals.iter() {
            self.heap.mark_object(key.string);
            self.heap.mark_value(value);
        }
        self.heap.mark_object(self.init_string);
        self.heap.trace_references();
        self.heap.sweep();
    }

    // ---- calls ----

    fn call(&mut self, closure: ObjRef, arg_count: usize) -> Result<(), RuntimeError> {
        let arity = self.heap.function(self.heap.closure(closure).function).arity;
        if arg_count != arity {
            return Err(self.runtime_error(format!(
                "Expected {arity} arguments but got {arg_count}."
            )));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            slots: self.stack.len() - arg_count - 1,
        });
        Ok(())
    }

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<(), RuntimeError> {
        let kind = match callee {
            Value::Obj(r) => match self.heap.get(r) {
                Obj::BoundMethod(bound) => Callee::Bound(bound.receiver, bound.method),
                Obj::Class(_) => Callee::Class,
                Obj::Closure(_) => Callee::Closure,
                Obj::Native(native) => Callee::Native(native.function),
                _ => Callee::NotCallable,
            },
            _ => Callee::NotCallable,
        };
        match kind {
            Callee::Bound(receiver, method) => {
                let top = self.stack.len();
                self.stack[top - arg_count - 1] = receiver;
                self.call(method, arg_count)
            }
            Callee::Class => {
                let class = match callee {
                    Value::Obj(r) => r,
                    _ => unreachable!("class callee must be an object"),
                };
                let instance = self.heap.alloc(Obj::Instance(ObjInstance {
                    class,
                    fields: Table::new(),
                }));
                let top = self.stack.len();
                self.stack[top - arg_count - 1] = Value::Obj(instance);
                let init_key = self.heap.key(self.init_string);
                let initializer = self.heap.class(class).methods.get(init_key);
                match initializer {
                    Some(Value::Obj(initializer)) => self.call(initializer, arg_count),
                    _ if arg_count != 0 => Err(self.runtime_error(format!(
                        "Expected 0 arguments but got {arg_count}."
                    ))),
                    _ => Ok(()),
                }
            }
            Callee::Closure => {
                let closure = match callee {
                    Value::Obj(r) => r,
                    _ => unreachable!("closure callee must be an object"),
                };
                self.call(closure, arg_count)
            }
            Callee::Native(function) => {
                let start = self.stack.len() - arg_count;
                let result = {
                    let mut env = NativeEnv {
                        heap: &self.heap,
                        out: &mut *self.out,
                    };
                    function(&mut env, &self.stack[start..])
                };
                self.stack.truncate(start - 1);
                self.push(result);
                Ok(())
            }
            Callee::NotCallable => Err(self.runtime_error("Can only call functions and classes.")),
        }
    }

    /// `receiver.name(args)` without allocating a bound method: fields
    /// shadow methods, then the class method table is consulted.
    fn invoke(&mut self, name: ObjRef, arg_count: usize) -> Result<(), RuntimeError> {
        let receiver = self.peek(arg_count);
        let Some(instance) = self.as_instance(receiver) else {
            return Err(self.runtime_error("Only instances have methods."));
        };
        let key = self.heap.key(name);
        if let Some(value) = self.heap.instance(instance).fields.get(key) {
            let top = self.stack.len();
            self.stack[top - arg_count - 1] = value;
            return self.call_value(value, arg_count);
        }
        let class = self.heap.instance(instance).class;
        self.invoke_from_class(class, name, arg_count)
    }

    fn invoke_from_class(
        &mut self,
        class: ObjRef,
        name: ObjRef,
        arg_count: usize,
    ) -> Result<(), RuntimeError> {
        let key = self.heap.key(name);
        match self.heap.class(class).methods.get(key) {
            Some(Value::Obj(method)) => self.call(method, arg_count),
            _ => Err(self.runtime_error(format!(
                "Undefined property '{}'.",
                self.heap.string(name).chars
            ))),
        }
    }

    fn bind_method(&mut self, class: ObjRef, name: ObjRef) -> Result<(), RuntimeError> {
        let key = self.heap.key(name);
        let method = match self.heap.class(class).methods.get(key) {
            Some(Value::Obj(method)) => method,
            _ => {
                return Err(self.runtime_error(format!(
                    "Undefined property '{}'.",
                    self.heap.string(name).chars
                )));
            }
        };
        let receiver = self.peek(0);
        let bound = self.heap.alloc(Obj::BoundMethod(ObjBoundMethod {
            receiver,
            method,
        }));
        self.pop();
        self.push(Value::Obj(bound));
        Ok(())
    }

    fn define_method(&mut self, name: ObjRef) {
        let method = self.peek(0);
        let class = match self.peek(1) {
            Value::Obj(r) => r,
            _ => panic!("method definition without a class on the stack"),
        };
        let key = self.heap.key(name);
        self.heap.class_mut(class).methods.set(key, method);
        self.pop();
    }

    // ---- upvalues ----

    fn open_upvalue_slot(&self, upvalue: ObjRef) -> usize {
        match *self.heap.upvalue(upvalue) {
            ObjUpvalue::Open(slot) => slot,
            ObjUpvalue::Closed(_) => panic!("closed upvalue on the open list"),
        }
    }

    /// Find or create the open upvalue for a stack slot. The list is kept
    /// sorted by decreasing slot and deduplicated, so two closures over
    /// the same variable share one upvalue.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut index = 0;
        while index < self.open_upvalues.len() {
            let existing_slot = self.open_upvalue_slot(self.open_upvalues[index]);
            if existing_slot > slot {
                index += 1;
                continue;
            }
            if existing_slot == slot {
                return self.open_upvalues[index];
            }
            break;
        }
        let created = self.heap.alloc(Obj::Upvalue(ObjUpvalue::Open(slot)));
        self.open_upvalues.insert(index, created);
        created
    }

    /// Close every open upvalue at or above `last`: copy the stack value
    /// into the upvalue and drop it from the open list.
    fn close_upvalues(&mut self, last: usize) {
        while let Some(&first) = self.open_upvalues.first() {
            let slot = self.open_upvalue_slot(first);
            if slot < last {
                break;
            }
            let value = self.stack[slot];
            *self.heap.upvalue_mut(first) = ObjUpvalue::Closed(value);
            self.open_upvalues.remove(0);
        }
    }

    // ---- arithmetic helpers ----

    fn numeric_operands(&mut self) -> Result<(f64, f64), RuntimeError> {
        let (Some(b), Some(a)) = (self.peek(0).as_number(), self.peek(1).as_number()) else {
            return Err(self.runtime_error("Operands must be numbers."));
        };
        self.pop();
        self.pop();
        Ok((a, b))
    }

    fn concatenate(&mut self, a: ObjRef, b: ObjRef) {
        let mut text = String::with_capacity(
            self.heap.string(a).chars.len() + self.heap.string(b).chars.len(),
        );
        text.push_str(&self.heap.string(a).chars);
        text.push_str(&self.heap.string(b).chars);
        let result = self.heap.intern(&text);
        self.pop();
        self.pop();
        self.push(Value::Obj(result));
    }

    /// Functional append: the result is a fresh array, the operand array
    /// is untouched.
    fn append(&mut self, array: ObjRef) {
        let value = self.peek(0);
        let mut values = self.heap.array(array).values.clone();
        values.push(value);
        let result = self.heap.alloc(Obj::Array(ObjArray { values }));
        self.pop();
        self.pop();
        self.push(Value::Obj(result));
    }

    // ---- debugging ----

    fn trace_instruction(&self) {
        let mut rendered = String::new();
        for &value in &self.stack {
            rendered.push_str(&format!("[ {} ]", format_value(&self.heap, value)));
        }
        let mut instruction = String::new();
        disassemble_instruction(&self.heap, self.current_chunk(), self.frame().ip, &mut instruction);
        trace!(stack = %rendered, instruction = %instruction.trim_end(), "exec");
    }

    /// Dump the script chunk and, transitively, every function chunk in
    /// its constant pools.
    fn disassemble_program(&mut self, script: ObjRef) {
        let mut pending = vec![script];
        while let Some(function) = pending.pop() {
            let f = self.heap.function(function);
            let name = match f.name {
                Some(name) => self.heap.string(name).chars.to_string(),
                None => "script".to_string(),
            };
            let text = disassemble_chunk(&self.heap, &f.chunk, &name);
            let _ = self.out.write_all(text.as_bytes());
            for &constant in &f.chunk.constants {
                if let Value::Obj(r) = constant {
                    if matches!(self.heap.get(r), Obj::Function(_)) {
                        pending.push(r);
                    }
                }
            }
        }
    }

    // ---- the dispatch loop ----

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            if self.options.trace_execution {
                self.trace_instruction();
            }
            let byte = self.read_byte();
            let op = OpCode::try_from(byte)
                .map_err(|_| self.runtime_error(format!("Unknown opcode {byte}.")))?;
            match op {
                OpCode::Constant => {
                    let constant = self.read_constant();
                    self.push(constant);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().slots;
                    let value = self.stack[base + slot];
                    self.push(value);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().slots;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let name = self.read_string();
                    let key = self.heap.key(name);
                    match self.globals.get(key) {
                        Some(value) => self.push(value),
                        None => {
                            return Err(self.runtime_error(format!(
                                "Undefined variable '{}'.",
                                self.heap.string(name).chars
                            )));
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    let key = self.heap.key(name);
                    let value = self.peek(0);
                    self.globals.set(key, value);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    let key = self.heap.key(name);
                    let value = self.peek(0);
                    if self.globals.set(key, value) {
                        self.globals.delete(key);
                        return Err(self.runtime_error(format!(
                            "Undefined variable '{}'.",
                            self.heap.string(name).chars
                        )));
                    }
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let closure = self.frame().closure;
                    let upvalue = self.heap.closure(closure).upvalues[slot];
                    let value = match *self.heap.upvalue(upvalue) {
                        ObjUpvalue::Open(stack_slot) => self.stack[stack_slot],
                        ObjUpvalue::Closed(value) => value,
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let closure = self.frame().closure;
                    let upvalue = self.heap.closure(closure).upvalues[slot];
                    let value = self.peek(0);
                    match self.heap.upvalue_mut(upvalue) {
                        ObjUpvalue::Open(stack_slot) => {
                            let stack_slot = *stack_slot;
                            self.stack[stack_slot] = value;
                        }
                        ObjUpvalue::Closed(closed) => *closed = value,
                    }
                }
                OpCode::GetProperty => {
                    self.maybe_gc();
                    let name = self.read_string();
                    let Some(instance) = self.as_instance(self.peek(0)) else {
                        return Err(self.runtime_error("Only instances have properties."));
                    };
                    let key = self.heap.key(name);
                    if let Some(value) = self.heap.instance(instance).fields.get(key) {
                        self.pop();
                        self.push(value);
                    } else {
                        let class = self.heap.instance(instance).class;
                        self.bind_method(class, name)?;
                    }
                }
                OpCode::SetProperty => {
                    let name = self.read_string();
                    let Some(instance) = self.as_instance(self.peek(1)) else {
                        return Err(self.runtime_error("Only instances have fields."));
                    };
                    let key = self.heap.key(name);
                    let value = self.peek(0);
                    self.heap.instance_mut(instance).fields.set(key, value);
                    let value = self.pop();
                    self.pop();
                    self.push(value);
                }
                OpCode::GetSuper => {
                    self.maybe_gc();
                    let name = self.read_string();
                    let superclass = match self.pop() {
                        Value::Obj(r) => r,
                        _ => return Err(self.runtime_error("Superclass must be a class.")),
                    };
                    self.bind_method(superclass, name)?;
                }
                OpCode::GetElement => {
                    self.maybe_gc();
                    let Some(index) = self.peek(0).as_number() else {
                        return Err(self.runtime_error("Index must be a number."));
                    };
                    let index = index as i64;
                    let container = self.peek(1);
                    if let Some(array) = self.as_array(container) {
                        let len = self.heap.array(array).values.len();
                        if index < 0 || index as usize >= len {
                            return Err(self.runtime_error(format!(
                                "Index of {index} out of bounds for array of length {len}."
                            )));
                        }
                        let value = self.heap.array(array).values[index as usize];
                        self.pop();
                        self.pop();
                        self.push(value);
                    } else if let Some(string) = self.as_string(container) {
                        let len = self.heap.string(string).chars.len();
                        if index < 0 || index as usize >= len {
                            return Err(self.runtime_error(format!(
                                "Index of {index} out of bounds for string of length {len}."
                            )));
                        }
                        let byte = self.heap.string(string).chars.as_bytes()[index as usize];
                        let text = String::from_utf8_lossy(&[byte]).into_owned();
                        let result = self.heap.intern(&text);
                        self.pop();
                        self.pop();
                        self.push(Value::Obj(result));
                    } else {
                        return Err(
                            self.runtime_error("Can not access element of a non array/string.")
                        );
                    }
                }
                OpCode::SetElement => {
                    self.maybe_gc();
                    let Some(array) = self.as_array(self.peek(2)) else {
                        return Err(self.runtime_error("Cannot set element of a non-array."));
                    };
                    let Some(index) = self.peek(1).as_number() else {
                        return Err(self.runtime_error("Index must be a number."));
                    };
                    let index = index as i64;
                    let len = self.heap.array(array).values.len();
                    if index < 0 || index as usize >= len {
                        return Err(self.runtime_error(format!(
                            "Index of {index} out of bounds for array of length {len}."
                        )));
                    }
                    let value = self.peek(0);
                    let mut values = self.heap.array(array).values.clone();
                    values[index as usize] = value;
                    let result = self.heap.alloc(Obj::Array(ObjArray { values }));
                    self.pop();
                    self.pop();
                    self.pop();
                    self.push(Value::Obj(result));
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::Greater => {
                    let (a, b) = self.numeric_operands()?;
                    self.push(Value::Bool(a > b));
                }
                OpCode::Less => {
                    let (a, b) = self.numeric_operands()?;
                    self.push(Value::Bool(a < b));
                }
                OpCode::Add => {
                    self.maybe_gc();
                    let b = self.peek(0);
                    let a = self.peek(1);
                    if let (Value::Number(x), Value::Number(y)) = (a, b) {
                        self.pop();
                        self.pop();
                        self.push(Value::Number(x + y));
                    } else if let (Some(x), Some(y)) = (self.as_string(a), self.as_string(b)) {
                        self.concatenate(x, y);
                    } else if let Some(array) = self.as_array(a) {
                        self.append(array);
                    } else {
                        return Err(self.runtime_error(
                            "Operands must be either two strings or two numbers.",
                        ));
                    }
                }
                OpCode::Subtract => {
                    let (a, b) = self.numeric_operands()?;
                    self.push(Value::Number(a - b));
                }
                OpCode::Multiply => {
                    let (a, b) = self.numeric_operands()?;
                    self.push(Value::Number(a * b));
                }
                OpCode::Divide => {
                    let (a, b) = self.numeric_operands()?;
                    self.push(Value::Number(a / b));
                }
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                OpCode::Negate => {
                    let Some(value) = self.peek(0).as_number() else {
                        return Err(self.runtime_error("Operand must be a number."));
                    };
                    self.pop();
                    self.push(Value::Number(-value));
                }
                OpCode::Jump => {
                    let offset = self.read_short() as usize;
                    let index = self.frames.len() - 1;
                    self.frames[index].ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_short() as usize;
                    if self.peek(0).is_falsey() {
                        let index = self.frames.len() - 1;
                        self.frames[index].ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_short() as usize;
                    let index = self.frames.len() - 1;
                    self.frames[index].ip -= offset;
                }
                OpCode::Call => {
                    self.maybe_gc();
                    let arg_count = self.read_byte() as usize;
                    let callee = self.peek(arg_count);
                    self.call_value(callee, arg_count)?;
                }
                OpCode::Invoke => {
                    self.maybe_gc();
                    let name = self.read_string();
                    let arg_count = self.read_byte() as usize;
                    self.invoke(name, arg_count)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string();
                    let arg_count = self.read_byte() as usize;
                    let superclass = match self.as_class(self.peek(0)) {
                        Some(class) => {
                            self.pop();
                            class
                        }
                        None => return Err(self.runtime_error("Superclass must be a class.")),
                    };
                    self.invoke_from_class(superclass, name, arg_count)?;
                }
                OpCode::Closure => {
                    self.maybe_gc();
                    let function = match self.read_constant() {
                        Value::Obj(r) => r,
                        _ => panic!("closure operand is not a function"),
                    };
                    let upvalue_count = self.heap.function(function).upvalue_count;
                    let mut upvalues = Vec::with_capacity(upvalue_count);
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        if is_local {
                            let slot = self.frame().slots + index;
                            upvalues.push(self.capture_upvalue(slot));
                        } else {
                            let closure = self.frame().closure;
                            upvalues.push(self.heap.closure(closure).upvalues[index]);
                        }
                    }
                    let closure = self.heap.alloc(Obj::Closure(ObjClosure { function, upvalues }));
                    self.push(Value::Obj(closure));
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let slots = self.frame().slots;
                    self.close_upvalues(slots);
                    self.frames.pop();
                    if self.frames.is_empty() {
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(slots);
                    self.push(result);
                }
                OpCode::Class => {
                    self.maybe_gc();
                    let name = self.read_string();
                    let class = self.heap.alloc(Obj::Class(ObjClass {
                        name,
                        methods: Table::new(),
                    }));
                    self.push(Value::Obj(class));
                }
                OpCode::Inherit => {
                    let Some(superclass) = self.as_class(self.peek(1)) else {
                        return Err(self.runtime_error("Superclass must be a class."));
                    };
                    let subclass = match self.peek(0) {
                        Value::Obj(r) => r,
                        _ => panic!("inherit without a class on the stack"),
                    };
                    let methods: Vec<_> = self.heap.class(superclass).methods.iter().collect();
                    for (key, value) in methods {
                        self.heap.class_mut(subclass).methods.set(key, value);
                    }
                    self.pop();
                }
                OpCode::Method | OpCode::PrivateMethod => {
                    let name = self.read_string();
                    self.define_method(name);
                }
                OpCode::Path => {
                    if let Some(string) = self.as_string(self.peek(0)) {
                        self.path = self.heap.string(string).chars.to_string();
                        self.pop();
                    }
                }
            }
        }
    }
}
