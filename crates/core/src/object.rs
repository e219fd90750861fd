//! Heap object variants
//!
//! Every heap-resident value is one of these nine kinds. The GC mark bit
//! and the free-list linkage live in the heap's slot records, not here, so
//! object payloads stay plain data.

use std::io::Write;
use std::mem;

use crate::chunk::Chunk;
use crate::heap::{Heap, ObjRef};
use crate::table::Table;
use crate::value::Value;

/// Execution context handed to native functions: read access to the heap
/// for inspecting arguments, and the VM's output sink. Natives must not
/// retain handles past their return.
pub struct NativeEnv<'a> {
    pub heap: &'a Heap,
    pub out: &'a mut dyn Write,
}

/// A native binding: `(args) -> value`, synchronous, no re-entry into the
/// interpreter.
pub type NativeFn = fn(&mut NativeEnv<'_>, &[Value]) -> Value;

/// An interned, immutable string with its cached FNV-1a hash.
#[derive(Debug)]
pub struct ObjString {
    pub chars: Box<str>,
    pub hash: u32,
}

/// A compiled function. Immutable once the compiler finishes it.
#[derive(Debug)]
pub struct ObjFunction {
    pub arity: usize,
    pub upvalue_count: usize,
    pub chunk: Chunk,
    /// Interned name; `None` for the top-level script.
    pub name: Option<ObjRef>,
}

impl ObjFunction {
    pub fn new() -> Self {
        ObjFunction {
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::new(),
            name: None,
        }
    }
}

impl Default for ObjFunction {
    fn default() -> Self {
        ObjFunction::new()
    }
}

/// A runtime instantiation of a function together with its captured
/// upvalues. Many closures may share one function.
#[derive(Debug)]
pub struct ObjClosure {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

/// A captured variable: open while its slot is still live on the value
/// stack, closed (owning the value) afterwards.
#[derive(Debug)]
pub enum ObjUpvalue {
    Open(usize),
    Closed(Value),
}

#[derive(Debug)]
pub struct ObjClass {
    pub name: ObjRef,
    pub methods: Table,
}

#[derive(Debug)]
pub struct ObjInstance {
    pub class: ObjRef,
    pub fields: Table,
}

/// A method extracted from an instance without being called: the receiver
/// travels with the closure.
#[derive(Debug)]
pub struct ObjBoundMethod {
    pub receiver: Value,
    pub method: ObjRef,
}

#[derive(Debug)]
pub struct ObjArray {
    pub values: Vec<Value>,
}

pub struct ObjNative {
    pub function: NativeFn,
}

impl std::fmt::Debug for ObjNative {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<native fn>")
    }
}

/// The tagged union of all heap object kinds.
#[derive(Debug)]
pub enum Obj {
    String(ObjString),
    Function(ObjFunction),
    Closure(ObjClosure),
    Upvalue(ObjUpvalue),
    Class(ObjClass),
    Instance(ObjInstance),
    BoundMethod(ObjBoundMethod),
    Array(ObjArray),
    Native(ObjNative),
}

impl Obj {
    /// Approximate heap footprint, used to drive the collection heuristic.
    /// Only directly owned buffers are counted; table storage behind
    /// classes and instances is deliberately approximated away.
    pub fn approximate_size(&self) -> usize {
        let payload = match self {
            Obj::String(s) => s.chars.len(),
            Obj::Function(f) => {
                f.chunk.code.len()
                    + f.chunk.lines.len() * mem::size_of::<u32>()
                    + f.chunk.constants.len() * mem::size_of::<Value>()
            }
            Obj::Closure(c) => c.upvalues.len() * mem::size_of::<ObjRef>(),
            Obj::Array(a) => a.values.len() * mem::size_of::<Value>(),
            Obj::Upvalue(_)
            | Obj::Class(_)
            | Obj::Instance(_)
            | Obj::BoundMethod(_)
            | Obj::Native(_) => 0,
        };
        mem::size_of::<Obj>() + payload
    }
}
