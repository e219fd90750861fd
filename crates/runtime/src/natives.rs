//! Built-in native bindings
//!
//! The standard registration set: `_length`, `_clock`, and `_print`.
//! Natives follow the `(args) -> value` ABI, run synchronously, and never
//! re-enter the interpreter. Arity is not enforced; a missing argument
//! degrades to `nil`.

use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

use salmon_core::object::{NativeEnv, Obj};
use salmon_core::value::{Value, format_value};

use crate::vm::Vm;

pub fn install(vm: &mut Vm) {
    vm.define_native("_length", length_native);
    vm.define_native("_clock", clock_native);
    vm.define_native("_print", print_native);
}

/// Length of a string or array as a number; `nil` for anything else.
fn length_native(env: &mut NativeEnv<'_>, args: &[Value]) -> Value {
    match args.first() {
        Some(Value::Obj(r)) => match env.heap.get(*r) {
            Obj::Array(array) => Value::Number(array.values.len() as f64),
            Obj::String(string) => Value::Number(string.chars.len() as f64),
            _ => Value::Nil,
        },
        _ => Value::Nil,
    }
}

/// Seconds since the Unix epoch.
fn clock_native(_env: &mut NativeEnv<'_>, _args: &[Value]) -> Value {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    Value::Number(elapsed.as_secs_f64())
}

/// Render one value to the VM's output sink, newline-terminated.
fn print_native(env: &mut NativeEnv<'_>, args: &[Value]) -> Value {
    let rendered = match args.first() {
        Some(&value) => format_value(env.heap, value),
        None => "nil".to_string(),
    };
    let _ = writeln!(env.out, "{rendered}");
    Value::Nil
}
