//! Bytecode disassembler.
//!
//! Renders chunks for humans. Consumed under a debug flag only: the
//! compiler logs finished chunks and the VM traces instructions through
//! `tracing`, so `RUST_LOG=mscript::code=debug` or
//! `RUST_LOG=mscript::exec=trace` turn the output on.

use std::fmt::Write;

use mscript_core::{Chunk, Op};

/// Render a whole chunk, one instruction per line.
pub fn disassemble_chunk(chunk: &Chunk, name: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {} ==", name);
    let mut offset = 0;
    while offset < chunk.len() {
        let (text, next) = disassemble_instruction(chunk, offset);
        let _ = writeln!(out, "{}", text);
        offset = next;
    }
    out
}

/// Render the instruction at `offset`; returns the text and the offset of
/// the following instruction.
pub fn disassemble_instruction(chunk: &Chunk, offset: usize) -> (String, usize) {
    let byte = chunk.bytes[offset];
    let Some(op) = Op::from_byte(byte) else {
        return (format!("{:04} | <unknown byte {:#04x}>", offset, byte), offset + 1);
    };

    match op {
        Op::Const | Op::GetGlobal | Op::SetGlobal => constant_instruction(chunk, op, offset),
        Op::GetLocal | Op::SetLocal | Op::Invoke => byte_instruction(chunk, op, offset),
        Op::Jump | Op::JumpIfFalse => jump_instruction(chunk, op, offset, true),
        Op::Loop => jump_instruction(chunk, op, offset, false),
        _ => (format!("{:04} | {}", offset, op.name()), offset + 1),
    }
}

fn constant_instruction(chunk: &Chunk, op: Op, offset: usize) -> (String, usize) {
    let index = chunk.bytes[offset + 1] as usize;
    let text = match chunk.constants.get(index) {
        Some(value) => format!("{:04} | {} {} '{}'", offset, op.name(), index, value),
        None => format!("{:04} | {} {} <bad constant>", offset, op.name(), index),
    };
    (text, offset + 2)
}

fn byte_instruction(chunk: &Chunk, op: Op, offset: usize) -> (String, usize) {
    let operand = chunk.bytes[offset + 1];
    (
        format!("{:04} | {} {}", offset, op.name(), operand),
        offset + 2,
    )
}

fn jump_instruction(chunk: &Chunk, op: Op, offset: usize, forward: bool) -> (String, usize) {
    let operand = u16::from_be_bytes([chunk.bytes[offset + 1], chunk.bytes[offset + 2]]) as usize;
    let target = if forward {
        offset + 3 + operand
    } else {
        offset + 3 - operand
    };
    (
        format!("{:04} | {} {} -> {}", offset, op.name(), operand, target),
        offset + 3,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use mscript_core::Heap;

    fn disassemble(source: &str) -> String {
        let mut heap = Heap::new();
        let function = crate::compiler::compile(source, &mut heap).expect("program compiles");
        disassemble_chunk(&function.chunk, "script")
    }

    #[test]
    fn test_arithmetic_listing() {
        let listing = disassemble("1 + 2\n");
        assert!(listing.contains("== script =="), "{}", listing);
        assert!(listing.contains("OP_CONST 0 '1'"), "{}", listing);
        assert!(listing.contains("OP_CONST 1 '2'"), "{}", listing);
        assert!(listing.contains("OP_ADD"), "{}", listing);
        assert!(listing.contains("OP_NULL"), "{}", listing);
        assert!(listing.contains("OP_RETURN"), "{}", listing);
    }

    #[test]
    fn test_offsets_and_jump_targets() {
        let listing = disassemble("if 1 then\ny = 2\nend if\n");
        // the false edge jumps over the body to the closing pop
        assert!(listing.contains("0002 | OP_JUMP_IF_FALSE 8 -> 13"), "{}", listing);
        assert!(listing.contains("0010 | OP_JUMP 1 -> 14"), "{}", listing);
    }

    #[test]
    fn test_loop_prints_backward_target() {
        let listing = disassemble("x = 0\nwhile x < 3\nx = x + 1\nend while\n");
        let loop_line = listing
            .lines()
            .find(|line| line.contains("OP_LOOP"))
            .expect("loop listed");
        assert!(loop_line.ends_with("-> 4"), "{}", loop_line);
    }

    #[test]
    fn test_global_listing_shows_name() {
        let listing = disassemble("x = 3\n");
        assert!(listing.contains("OP_SET_GLOBAL 1 'x'"), "{}", listing);
    }
}
