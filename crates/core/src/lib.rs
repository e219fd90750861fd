//! Salmon core runtime library
//!
//! Shared foundation for the compiler and the virtual machine: the tagged
//! value representation, the managed heap with string interning and
//! mark-sweep collection, bytecode chunks, the open-addressed hash table,
//! and the disassembler.

pub mod chunk;
pub mod debug;
pub mod heap;
pub mod object;
pub mod table;
pub mod value;

pub use chunk::{Chunk, OpCode};
pub use heap::{Heap, ObjRef, hash_string};
pub use object::{
    NativeEnv, NativeFn, Obj, ObjArray, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction,
    ObjInstance, ObjNative, ObjString, ObjUpvalue,
};
pub use table::{StringKey, Table};
pub use value::{Value, format_value};
