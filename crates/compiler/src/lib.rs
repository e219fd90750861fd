//! Salmon compiler library
//!
//! A tree-free, single-pass compiler: the Pratt parser in [`compiler`]
//! drives the [`scanner`] and emits bytecode chunks directly into the
//! shared heap. The result of a successful compile is a heap-resident
//! script function ready to be wrapped in a closure and run.

pub mod compiler;
pub mod scanner;

pub use compiler::compile;
pub use scanner::{Scanner, Token, TokenKind};
