use std::fmt::Write;
use std::mem;
use std::ops::Index;

use arrayvec::ArrayVec;
use makro_common::error::{Error, OverflowError, Result};
use makro_common::types::Span;

use crate::gc::{Gc, Trace};
use crate::op;
use crate::value::Value;

#[derive(Debug, Default)]
pub struct Chunk {
    pub ops: Vec<u8>,
    pub constants: ArrayVec<Value, 256>,
    pub spans: VecRun<Span>,
}

impl Chunk {
    pub fn write_u8(&mut self, byte: u8, span: &Span) {
        self.ops.push(byte);
        self.spans.push(span.clone());
    }

    /// Writes a constant to the [`Chunk`] and returns its index. If an equal
    /// [`Value`] is already present, then its index is returned instead.
    pub fn write_constant(&mut self, value: Value, span: &Span) -> Result<u8> {
        let idx = match self.constants.iter().position(|&constant| constant == value) {
            Some(idx) => idx,
            None => {
                self.constants
                    .try_push(value)
                    .map_err(|_| (Error::from(OverflowError::TooManyConstants), span.clone()))?;
                self.constants.len() - 1
            }
        };
        Ok(idx as u8)
    }

    pub fn size(&self) -> usize {
        self.ops.capacity()
            + self.constants.len() * mem::size_of::<Value>()
            + self.spans.values.capacity() * mem::size_of::<Run<Span>>()
    }

    /// Renders the whole chunk, one instruction per line.
    pub fn disassemble(&self, name: &str, gc: &Gc) -> String {
        let mut output = format!("== {name} ==\n");
        let mut idx = 0;
        while idx < self.ops.len() {
            idx = self.disassemble_op(idx, gc, &mut output);
            output.push('\n');
        }
        output
    }

    /// Renders the instruction at `idx` into `output` and returns the index
    /// of the next instruction.
    pub fn disassemble_op(&self, idx: usize, gc: &Gc, output: &mut String) -> usize {
        let _ = write!(output, "{idx:04} ");
        match self.ops[idx] {
            op::CONSTANT => self.disassemble_constant("OP_CONSTANT", idx, gc, output),
            op::NULL => self.disassemble_simple("OP_NULL", idx, output),
            op::TRUE => self.disassemble_simple("OP_TRUE", idx, output),
            op::FALSE => self.disassemble_simple("OP_FALSE", idx, output),
            op::POP => self.disassemble_simple("OP_POP", idx, output),
            op::GET_LOCAL => self.disassemble_byte("OP_GET_LOCAL", idx, output),
            op::SET_LOCAL => self.disassemble_byte("OP_SET_LOCAL", idx, output),
            op::GET_GLOBAL => self.disassemble_constant("OP_GET_GLOBAL", idx, gc, output),
            op::DEFINE_GLOBAL => self.disassemble_constant("OP_DEFINE_GLOBAL", idx, gc, output),
            op::SET_GLOBAL => self.disassemble_constant("OP_SET_GLOBAL", idx, gc, output),
            op::GET_UPVALUE => self.disassemble_byte("OP_GET_UPVALUE", idx, output),
            op::SET_UPVALUE => self.disassemble_byte("OP_SET_UPVALUE", idx, output),
            op::GET_PROPERTY => self.disassemble_constant("OP_GET_PROPERTY", idx, gc, output),
            op::SET_PROPERTY => self.disassemble_constant("OP_SET_PROPERTY", idx, gc, output),
            op::EQUAL => self.disassemble_simple("OP_EQUAL", idx, output),
            op::GREATER => self.disassemble_simple("OP_GREATER", idx, output),
            op::LESS => self.disassemble_simple("OP_LESS", idx, output),
            op::ADD => self.disassemble_simple("OP_ADD", idx, output),
            op::SUBTRACT => self.disassemble_simple("OP_SUBTRACT", idx, output),
            op::MULTIPLY => self.disassemble_simple("OP_MULTIPLY", idx, output),
            op::DIVIDE => self.disassemble_simple("OP_DIVIDE", idx, output),
            op::NOT => self.disassemble_simple("OP_NOT", idx, output),
            op::NEGATE => self.disassemble_simple("OP_NEGATE", idx, output),
            op::PRINT => self.disassemble_simple("OP_PRINT", idx, output),
            op::JUMP => self.disassemble_jump("OP_JUMP", idx, true, output),
            op::JUMP_IF_FALSE => self.disassemble_jump("OP_JUMP_IF_FALSE", idx, true, output),
            op::LOOP => self.disassemble_jump("OP_LOOP", idx, false, output),
            op::CALL => self.disassemble_byte("OP_CALL", idx, output),
            op::CLOSURE => {
                let mut idx = idx + 1;
                let constant_idx = self.ops[idx];
                let constant = self.constants[constant_idx as usize];
                let _ = write!(output, "{:16} {constant_idx:>4} '{}'", "OP_CLOSURE", gc.display(constant));

                let upvalue_count = match constant {
                    Value::Object(function) => gc.function(function).upvalue_count,
                    _ => 0,
                };
                for _ in 0..upvalue_count {
                    let offset = idx + 1;
                    let label = if self.ops[idx + 1] == 0 { "upvalue" } else { "local" };
                    let upvalue_idx = self.ops[idx + 2];
                    idx += 2;
                    let _ = write!(output, "\n{offset:04} |                     {label} {upvalue_idx}");
                }

                idx + 1
            }
            op::CLOSE_UPVALUE => self.disassemble_simple("OP_CLOSE_UPVALUE", idx, output),
            op::RETURN => self.disassemble_simple("OP_RETURN", idx, output),
            op::CLASS => self.disassemble_constant("OP_CLASS", idx, gc, output),
            byte => self.disassemble_simple(&format!("OP_UNKNOWN({byte:#X})"), idx, output),
        }
    }

    fn disassemble_simple(&self, name: &str, idx: usize, output: &mut String) -> usize {
        output.push_str(name);
        idx + 1
    }

    fn disassemble_byte(&self, name: &str, idx: usize, output: &mut String) -> usize {
        let byte = self.ops[idx + 1];
        let _ = write!(output, "{name:16} {byte:>4}");
        idx + 2
    }

    fn disassemble_constant(&self, name: &str, idx: usize, gc: &Gc, output: &mut String) -> usize {
        let constant_idx = self.ops[idx + 1];
        let constant = self.constants[constant_idx as usize];
        let _ = write!(output, "{name:16} {constant_idx:>4} '{}'", gc.display(constant));
        idx + 2
    }

    fn disassemble_jump(&self, name: &str, idx: usize, is_forward: bool, output: &mut String) -> usize {
        let to_offset = u16::from_be_bytes([self.ops[idx + 1], self.ops[idx + 2]]);
        let offset_sign = if is_forward { 1 } else { -1 };
        // The +3 is to account for the 3 byte jump instruction.
        let to_idx = (idx as isize) + (to_offset as isize) * offset_sign + 3;
        let _ = write!(output, "{name:16} {idx:>4} -> {to_idx}");
        idx + 3
    }
}

impl Trace for Chunk {
    fn trace(&self, gc: &mut Gc) {
        for constant in &self.constants {
            constant.trace(gc);
        }
    }
}

/// Run-length encoded [`Vec`]. Useful for storing data with a lot of contiguous
/// runs of the same value.
#[derive(Debug, Default)]
pub struct VecRun<T> {
    values: Vec<Run<T>>,
}

impl<T: Eq> VecRun<T> {
    fn push(&mut self, value: T) {
        match self.values.last_mut() {
            Some(run) if run.value == value && run.count < u8::MAX => {
                run.count += 1;
            }
            _ => self.values.push(Run { value, count: 1 }),
        };
    }
}

impl<T> Index<usize> for VecRun<T> {
    type Output = T;

    fn index(&self, index: usize) -> &Self::Output {
        let mut count = index;
        for run in &self.values {
            match count.checked_sub(run.count as usize) {
                Some(remaining) => count = remaining,
                None => return &run.value,
            }
        }
        panic!("index out of bounds");
    }
}

#[derive(Debug)]
struct Run<T> {
    value: T,
    count: u8,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn constants_are_deduplicated() {
        let mut chunk = Chunk::default();
        assert_eq!(chunk.write_constant(Value::Number(1.0), &(0..1)), Ok(0));
        assert_eq!(chunk.write_constant(Value::Number(2.0), &(0..1)), Ok(1));
        assert_eq!(chunk.write_constant(Value::Number(1.0), &(0..1)), Ok(0));
        assert_eq!(chunk.constants.len(), 2);
    }

    #[test]
    fn too_many_constants() {
        let mut chunk = Chunk::default();
        for i in 0..256 {
            assert_eq!(chunk.write_constant(Value::Number(i as f64), &(0..1)), Ok(i as u8));
        }
        // Existing constants can still be referenced.
        assert_eq!(chunk.write_constant(Value::Number(7.0), &(0..1)), Ok(7));
        assert_eq!(
            chunk.write_constant(Value::Number(256.0), &(3..4)),
            Err((Error::from(OverflowError::TooManyConstants), 3..4))
        );
    }

    #[test]
    fn spans_are_run_length_encoded() {
        let mut chunk = Chunk::default();
        chunk.write_u8(op::NULL, &(0..4));
        chunk.write_u8(op::NULL, &(0..4));
        chunk.write_u8(op::RETURN, &(5..6));

        assert_eq!(chunk.spans.values.len(), 2);
        assert_eq!(chunk.spans[0], 0..4);
        assert_eq!(chunk.spans[1], 0..4);
        assert_eq!(chunk.spans[2], 5..6);
    }

    #[test]
    fn disassemble() {
        let gc = Gc::default();
        let mut chunk = Chunk::default();
        let span = 0..1;
        let idx = chunk.write_constant(Value::Number(1.5), &span).unwrap();
        chunk.write_u8(op::CONSTANT, &span);
        chunk.write_u8(idx, &span);
        chunk.write_u8(op::JUMP_IF_FALSE, &span);
        chunk.write_u8(0, &span);
        chunk.write_u8(1, &span);
        chunk.write_u8(op::PRINT, &span);
        chunk.write_u8(op::RETURN, &span);

        let exp = "== test ==\n\
                   0000 OP_CONSTANT         0 '1.5'\n\
                   0002 OP_JUMP_IF_FALSE    2 -> 6\n\
                   0005 OP_PRINT\n\
                   0006 OP_RETURN\n";
        assert_eq!(chunk.disassemble("test", &gc), exp);
    }
}
