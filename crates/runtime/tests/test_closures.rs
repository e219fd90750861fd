//! Integration tests for closures and upvalues
//!
//! Exercises the capture machinery through the public interpreter
//! interface: shared upvalues, closing on scope exit, re-exported
//! captures through intermediate functions, and method closures over
//! `super`.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use salmon_runtime::{InterpretResult, Vm, VmOptions};

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn run(source: &str) -> (InterpretResult, String) {
    let buffer = SharedBuffer::default();
    let mut vm = Vm::with_writer(VmOptions::default(), Box::new(buffer.clone()));
    let result = vm.interpret(source, "test.salmon");
    let bytes = buffer.0.lock().unwrap().clone();
    (result, String::from_utf8(bytes).unwrap())
}

fn assert_prints(source: &str, expected: &str) {
    let (result, output) = run(source);
    assert_eq!(result, InterpretResult::Ok, "program failed: {source}");
    assert_eq!(output, expected, "wrong output for: {source}");
}

#[test]
fn test_writes_through_one_closure_are_seen_by_the_other() {
    assert_prints(
        "var set := nil; var get := nil; \
         fun make() { \
           var state := 10; \
           set := | v | => { state := v; }; \
           get := | | => { return state; }; \
         } \
         make(); \
         _print(get()); \
         set(42); \
         _print(get());",
        "10\n42\n",
    );
}

#[test]
fn test_capture_survives_frame_return() {
    assert_prints(
        "fun adder(n) { return | x | => { return x + n; }; } \
         var add5 := adder(5); \
         var add9 := adder(9); \
         _print(add5(1)); \
         _print(add9(1));",
        "6\n10\n",
    );
}

#[test]
fn test_intermediate_function_re_exports_capture() {
    assert_prints(
        "fun outer() { \
           var x := 1; \
           fun middle() { \
             fun inner() { x += 1; return x; } \
             return inner; \
           } \
           return middle(); \
         } \
         var bump := outer(); \
         _print(bump()); \
         _print(bump());",
        "2\n3\n",
    );
}

#[test]
fn test_each_loop_iteration_closes_its_own_variable() {
    assert_prints(
        "var fns := []; \
         for (var i := 0; i < 3; i += 1) { \
           var j := i; \
           fns := fns + (| | => { return j; }); \
         } \
         _print(fns[0]()); _print(fns[1]()); _print(fns[2]());",
        "0\n1\n2\n",
    );
}

#[test]
fn test_block_exit_closes_upvalue_not_copies_early() {
    assert_prints(
        "var f := nil; \
         { \
           var x := 1; \
           f := | | => { return x; }; \
           x := 2; \
         } \
         _print(f());",
        "2\n",
    );
}

#[test]
fn test_methods_close_over_super() {
    assert_prints(
        "class A { describe() { return \"A\"; } } \
         class B < A { \
           describe() { \
             var parent := | | => { return super.describe(); }; \
             return parent() + \"B\"; \
           } \
         } \
         _print(B().describe());",
        "AB\n",
    );
}

#[test]
fn test_recursive_closure_by_name() {
    assert_prints(
        "fun countdown(n) { \
           if (n > 0) { _print(n); countdown(n - 1); } \
         } \
         countdown(3);",
        "3\n2\n1\n",
    );
}
