// File: src/debug.rs
//
// Bytecode disassembler. Purely diagnostic: it has no effect on
// compilation or execution, and is only ever invoked when
// the `QUILL_TRACE` env var is set or `--disassemble` is passed on the
// command line. One line per instruction: byte offset, source line (or
// `|` when it repeats the line above), mnemonic, and a decoded operand
// where the instruction has one.

use crate::bytecode::{Chunk, OpCode};

/// Returns `true` when disassembly output has been requested for this
/// process. Checked by the VM before each chunk it runs.
pub fn trace_enabled() -> bool {
    std::env::var_os("QUILL_TRACE").is_some()
}

impl Chunk {
    /// Disassembles every instruction in the chunk into a labeled block.
    pub fn disassemble(&self, name: &str) -> String {
        let mut out = format!("== {name} ==\n");
        let mut offset = 0;
        while offset < self.code.len() {
            let (line, next) = self.disassemble_instruction(offset);
            out.push_str(&line);
            out.push('\n');
            offset = next;
        }
        out
    }

    /// Disassembles the single instruction at `offset`, returning its
    /// text and the offset of the next instruction.
    pub fn disassemble_instruction(&self, offset: usize) -> (String, usize) {
        let mut header = format!("{offset:04} ");
        let line = self.get_line(offset);
        if offset > 0 && line == self.get_line(offset - 1) {
            header.push_str("   | ");
        } else {
            header.push_str(&format!("{line:4} "));
        }

        let op = OpCode::from_u8(self.code[offset]);
        let (body, next) = match op {
            OpCode::Constant => self.constant_instr("OP_CONSTANT", offset, false),
            OpCode::ConstantLong => self.constant_instr("OP_CONSTANT_LONG", offset, true),
            OpCode::Nil => self.simple_instr("OP_NIL", offset),
            OpCode::True => self.simple_instr("OP_TRUE", offset),
            OpCode::False => self.simple_instr("OP_FALSE", offset),
            OpCode::Equal => self.simple_instr("OP_EQUAL", offset),
            OpCode::Greater => self.simple_instr("OP_GREATER", offset),
            OpCode::Less => self.simple_instr("OP_LESS", offset),
            OpCode::Add => self.simple_instr("OP_ADD", offset),
            OpCode::Subtract => self.simple_instr("OP_SUBTRACT", offset),
            OpCode::Multiply => self.simple_instr("OP_MULTIPLY", offset),
            OpCode::Divide => self.simple_instr("OP_DIVIDE", offset),
            OpCode::Not => self.simple_instr("OP_NOT", offset),
            OpCode::Negate => self.simple_instr("OP_NEGATE", offset),
            OpCode::Print => self.simple_instr("OP_PRINT", offset),
            OpCode::Pop => self.simple_instr("OP_POP", offset),
            OpCode::Dup => self.simple_instr("OP_DUP", offset),
            OpCode::DefineGlobal => self.byte_instr("OP_DEFINE_GLOBAL", offset),
            OpCode::DefineGlobalLong => self.u24_instr("OP_DEFINE_GLOBAL_LONG", offset),
            OpCode::GetGlobal => self.byte_instr("OP_GET_GLOBAL", offset),
            OpCode::GetGlobalLong => self.u24_instr("OP_GET_GLOBAL_LONG", offset),
            OpCode::SetGlobal => self.byte_instr("OP_SET_GLOBAL", offset),
            OpCode::SetGlobalLong => self.u24_instr("OP_SET_GLOBAL_LONG", offset),
            OpCode::GetLocal => self.byte_instr("OP_GET_LOCAL", offset),
            OpCode::SetLocal => self.byte_instr("OP_SET_LOCAL", offset),
            OpCode::GetUpvalue => self.byte_instr("OP_GET_UPVALUE", offset),
            OpCode::SetUpvalue => self.byte_instr("OP_SET_UPVALUE", offset),
            OpCode::CloseUpvalue => self.simple_instr("OP_CLOSE_UPVALUE", offset),
            OpCode::Jump => self.jump_instr("OP_JUMP", 1, offset),
            OpCode::JumpIfFalse => self.jump_instr("OP_JUMP_IF_FALSE", 1, offset),
            OpCode::Loop => self.jump_instr("OP_LOOP", -1, offset),
            OpCode::Call => self.byte_instr("OP_CALL", offset),
            OpCode::Closure => self.closure_instr("OP_CLOSURE", offset, false),
            OpCode::ClosureLong => self.closure_instr("OP_CLOSURE_LONG", offset, true),
            OpCode::Class => self.constant_instr("OP_CLASS", offset, false),
            OpCode::ClassLong => self.constant_instr("OP_CLASS_LONG", offset, true),
            OpCode::Inherit => self.simple_instr("OP_INHERIT", offset),
            OpCode::Method => self.constant_instr("OP_METHOD", offset, false),
            OpCode::MethodLong => self.constant_instr("OP_METHOD_LONG", offset, true),
            OpCode::GetProperty => self.constant_instr("OP_GET_PROPERTY", offset, false),
            OpCode::GetPropertyLong => self.constant_instr("OP_GET_PROPERTY_LONG", offset, true),
            OpCode::SetProperty => self.constant_instr("OP_SET_PROPERTY", offset, false),
            OpCode::SetPropertyLong => self.constant_instr("OP_SET_PROPERTY_LONG", offset, true),
            OpCode::GetSuper => self.constant_instr("OP_GET_SUPER", offset, false),
            OpCode::GetSuperLong => self.constant_instr("OP_GET_SUPER_LONG", offset, true),
            OpCode::Invoke => self.invoke_instr("OP_INVOKE", offset, false),
            OpCode::InvokeLong => self.invoke_instr("OP_INVOKE_LONG", offset, true),
            OpCode::SuperInvoke => self.invoke_instr("OP_SUPER_INVOKE", offset, false),
            OpCode::SuperInvokeLong => self.invoke_instr("OP_SUPER_INVOKE_LONG", offset, true),
            OpCode::Return => self.simple_instr("OP_RETURN", offset),
        };
        header.push_str(&body);
        (header, next)
    }

    fn simple_instr(&self, name: &str, offset: usize) -> (String, usize) {
        (name.to_string(), offset + 1)
    }

    fn byte_instr(&self, name: &str, offset: usize) -> (String, usize) {
        let slot = self.code[offset + 1];
        (format!("{name:<20} {slot:4}"), offset + 2)
    }

    fn constant_instr(&self, name: &str, offset: usize, long: bool) -> (String, usize) {
        if long {
            let index = self.read_u24(offset + 1) as usize;
            (format!("{name:<20} {index:4} '{}'", self.constants[index]), offset + 4)
        } else {
            let index = self.code[offset + 1] as usize;
            (format!("{name:<20} {index:4} '{}'", self.constants[index]), offset + 2)
        }
    }

    /// The trailing (is_local, index) upvalue byte pairs aren't decoded
    /// here — how many follow is only known from the function's
    /// `upvalue_count`, which lives on the heap object, not the chunk.
    fn closure_instr(&self, name: &str, offset: usize, long: bool) -> (String, usize) {
        let (index, next) = if long {
            (self.read_u24(offset + 1) as usize, offset + 4)
        } else {
            (self.code[offset + 1] as usize, offset + 2)
        };
        (format!("{name:<20} {index:4} '{}'", self.constants[index]), next)
    }

    fn jump_instr(&self, name: &str, sign: i32, offset: usize) -> (String, usize) {
        let jump = self.read_u16(offset + 1) as i32;
        let target = offset as i32 + 3 + sign * jump;
        (format!("{name:<20} {offset:4} -> {target}"), offset + 3)
    }

    fn invoke_instr(&self, name: &str, offset: usize, long: bool) -> (String, usize) {
        if long {
            let index = self.read_u24(offset + 1) as usize;
            let argc = self.code[offset + 4];
            (format!("{name:<20} ({argc} args) {index:4} '{}'", self.constants[index]), offset + 5)
        } else {
            let index = self.code[offset + 1] as usize;
            let argc = self.code[offset + 2];
            (format!("{name:<20} ({argc} args) {index:4} '{}'", self.constants[index]), offset + 3)
        }
    }

    fn u24_instr(&self, name: &str, offset: usize) -> (String, usize) {
        let value = self.read_u24(offset + 1);
        (format!("{name:<20} {value:4}", ), offset + 4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn disassembles_a_constant_and_return() {
        let mut chunk = Chunk::new();
        let idx = chunk.add_constant(Value::Number(1.0));
        chunk.write(OpCode::Constant as u8, 1);
        chunk.write(idx as u8, 1);
        chunk.write(OpCode::Return as u8, 1);
        let out = chunk.disassemble("test");
        assert!(out.contains("OP_CONSTANT"));
        assert!(out.contains("OP_RETURN"));
    }

    #[test]
    fn jump_target_accounts_for_direction() {
        let mut chunk = Chunk::new();
        chunk.write(OpCode::Loop as u8, 1);
        chunk.write_u16(5, 1);
        let (text, next) = chunk.disassemble_instruction(0);
        assert!(text.contains("->"));
        assert_eq!(next, 3);
    }

    #[test]
    fn same_line_repeats_show_pipe() {
        let mut chunk = Chunk::new();
        chunk.write(OpCode::Nil as u8, 3);
        chunk.write(OpCode::Pop as u8, 3);
        let out = chunk.disassemble("test");
        assert!(out.contains("   | "));
    }
}
