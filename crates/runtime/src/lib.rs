//! Salmon runtime library
//!
//! The bytecode virtual machine: stack, call frames, closures and open
//! upvalues, class and method dispatch, allocation-driven garbage
//! collection, and the built-in native bindings.

pub mod natives;
pub mod vm;

pub use vm::{FRAMES_MAX, InterpretResult, STACK_MAX, Vm, VmOptions};
