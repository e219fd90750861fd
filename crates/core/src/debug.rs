//! Bytecode disassembler
//!
//! Debug-only rendering of chunks in the fixed-column format:
//!
//! ```text
//! == script ==
//! 0000    1 OP_CONSTANT         0 '1'
//! 0002    | OP_ADD
//! ```

use std::fmt::Write;

use crate::chunk::{Chunk, OpCode};
use crate::heap::Heap;
use crate::value::format_value;

pub fn disassemble_chunk(heap: &Heap, chunk: &Chunk, name: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {} ==", name);
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(heap, chunk, offset, &mut out);
    }
    out
}

/// Render one instruction at `offset`, returning the offset of the next.
pub fn disassemble_instruction(
    heap: &Heap,
    chunk: &Chunk,
    offset: usize,
    out: &mut String,
) -> usize {
    let _ = write!(out, "{:04} ", offset);
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        let _ = write!(out, "   | ");
    } else {
        let _ = write!(out, "{:4} ", chunk.lines[offset]);
    }

    let op = match OpCode::try_from(chunk.code[offset]) {
        Ok(op) => op,
        Err(_) => {
            let _ = writeln!(out, "Unknown opcode {}", chunk.code[offset]);
            return offset + 1;
        }
    };

    match op {
        OpCode::Constant
        | OpCode::GetGlobal
        | OpCode::DefineGlobal
        | OpCode::SetGlobal
        | OpCode::GetProperty
        | OpCode::SetProperty
        | OpCode::GetSuper
        | OpCode::Class
        | OpCode::Method
        | OpCode::PrivateMethod => constant_instruction(heap, name_of(op), chunk, offset, out),
        OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::Call => byte_instruction(name_of(op), chunk, offset, out),
        OpCode::Jump | OpCode::JumpIfFalse => jump_instruction(name_of(op), 1, chunk, offset, out),
        OpCode::Loop => jump_instruction(name_of(op), -1, chunk, offset, out),
        OpCode::Invoke | OpCode::SuperInvoke => {
            invoke_instruction(heap, name_of(op), chunk, offset, out)
        }
        OpCode::Closure => closure_instruction(heap, chunk, offset, out),
        _ => simple_instruction(name_of(op), offset, out),
    }
}

fn name_of(op: OpCode) -> &'static str {
    match op {
        OpCode::Constant => "OP_CONSTANT",
        OpCode::Nil => "OP_NIL",
        OpCode::True => "OP_TRUE",
        OpCode::False => "OP_FALSE",
        OpCode::Pop => "OP_POP",
        OpCode::GetLocal => "OP_GET_LOCAL",
        OpCode::SetLocal => "OP_SET_LOCAL",
        OpCode::GetGlobal => "OP_GET_GLOBAL",
        OpCode::DefineGlobal => "OP_DEFINE_GLOBAL",
        OpCode::SetGlobal => "OP_SET_GLOBAL",
        OpCode::GetUpvalue => "OP_GET_UPVALUE",
        OpCode::SetUpvalue => "OP_SET_UPVALUE",
        OpCode::GetProperty => "OP_GET_PROPERTY",
        OpCode::SetProperty => "OP_SET_PROPERTY",
        OpCode::GetSuper => "OP_GET_SUPER",
        OpCode::GetElement => "OP_GET_ELEMENT",
        OpCode::SetElement => "OP_SET_ELEMENT",
        OpCode::Equal => "OP_EQUAL",
        OpCode::Greater => "OP_GREATER",
        OpCode::Less => "OP_LESS",
        OpCode::Add => "OP_ADD",
        OpCode::Subtract => "OP_SUBTRACT",
        OpCode::Multiply => "OP_MULTIPLY",
        OpCode::Divide => "OP_DIVIDE",
        OpCode::Not => "OP_NOT",
        OpCode::Negate => "OP_NEGATE",
        OpCode::Jump => "OP_JUMP",
        OpCode::JumpIfFalse => "OP_JUMP_IF_FALSE",
        OpCode::Loop => "OP_LOOP",
        OpCode::Call => "OP_CALL",
        OpCode::Inherit => "OP_INHERIT",
        OpCode::Invoke => "OP_INVOKE",
        OpCode::SuperInvoke => "OP_SUPER_INVOKE",
        OpCode::Closure => "OP_CLOSURE",
        OpCode::CloseUpvalue => "OP_CLOSE_UPVALUE",
        OpCode::Return => "OP_RETURN",
        OpCode::Class => "OP_CLASS",
        OpCode::Method => "OP_METHOD",
        OpCode::PrivateMethod => "OP_PRIVATE_METHOD",
        OpCode::Path => "OP_PATH",
    }
}

fn simple_instruction(name: &str, offset: usize, out: &mut String) -> usize {
    let _ = writeln!(out, "{}", name);
    offset + 1
}

fn byte_instruction(name: &str, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let slot = chunk.code[offset + 1];
    let _ = writeln!(out, "{:<16} {:4}", name, slot);
    offset + 2
}

fn jump_instruction(name: &str, sign: i64, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let jump = u16::from_be_bytes([chunk.code[offset + 1], chunk.code[offset + 2]]);
    let target = offset as i64 + 3 + sign * i64::from(jump);
    let _ = writeln!(out, "{:<16} {:4} -> {}", name, offset, target);
    offset + 3
}

fn constant_instruction(
    heap: &Heap,
    name: &str,
    chunk: &Chunk,
    offset: usize,
    out: &mut String,
) -> usize {
    let constant = chunk.code[offset + 1];
    let rendered = format_value(heap, chunk.constants[constant as usize]);
    let _ = writeln!(out, "{:<16} {:4} '{}'", name, constant, rendered);
    offset + 2
}

fn invoke_instruction(
    heap: &Heap,
    name: &str,
    chunk: &Chunk,
    offset: usize,
    out: &mut String,
) -> usize {
    let constant = chunk.code[offset + 1];
    let arg_count = chunk.code[offset + 2];
    let rendered = format_value(heap, chunk.constants[constant as usize]);
    let _ = writeln!(out, "{:<16} ({} args) {:4} '{}'", name, arg_count, constant, rendered);
    offset + 3
}

fn closure_instruction(heap: &Heap, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let mut offset = offset + 1;
    let constant = chunk.code[offset];
    offset += 1;
    let rendered = format_value(heap, chunk.constants[constant as usize]);
    let _ = writeln!(out, "{:<16} {:4} {}", "OP_CLOSURE", constant, rendered);

    let function = match chunk.constants[constant as usize] {
        crate::value::Value::Obj(r) => r,
        _ => return offset,
    };
    for _ in 0..heap.function(function).upvalue_count {
        let is_local = chunk.code[offset];
        let index = chunk.code[offset + 1];
        let _ = writeln!(
            out,
            "{:04}      |                     {} {}",
            offset,
            if is_local != 0 { "local" } else { "upvalue" },
            index
        );
        offset += 2;
    }
    offset
}
