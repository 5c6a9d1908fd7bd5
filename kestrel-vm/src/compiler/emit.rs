// kestrel-vm - Bytecode compiler, garbage collector and worker VM for the Kestrel programming language
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Byte emission and patching helpers on the per-function state.
//!
//! Fallible helpers return a static message; the code generator anchors
//! it to a diagnostic. Long operands are big-endian.

use crate::compiler::types::{FuncState, ScopeJumpKind};
use crate::opcode::OpCode;

impl FuncState {
    pub fn emit_byte(&mut self, byte: u8) {
        self.chunk.write_byte(byte, self.line, self.file);
    }

    pub fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    pub fn emit_u16(&mut self, value: u16) {
        self.emit_byte((value >> 8) as u8);
        self.emit_byte((value & 0xff) as u8);
    }

    pub fn emit_op_u16(&mut self, op: OpCode, value: u16) {
        self.emit_op(op);
        self.emit_u16(value);
    }

    pub fn offset(&self) -> usize {
        self.chunk.bytecode.len()
    }

    /// Emit a jump with a placeholder offset; returns the position of the
    /// two offset bytes for patching.
    pub fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.offset() - 2
    }

    /// Point the jump at `offset` to the current position.
    pub fn patch_jump(&mut self, offset: usize) -> Result<(), &'static str> {
        // -2 adjusts for the offset bytes themselves.
        let jump = self.offset() - offset - 2;
        if jump > u16::MAX as usize {
            return Err("Too much code to jump over.");
        }
        self.chunk.bytecode[offset] = (jump >> 8) as u8;
        self.chunk.bytecode[offset + 1] = (jump & 0xff) as u8;
        Ok(())
    }

    /// Loop back to `start`, re-testing the condition on top of the stack.
    pub fn emit_loop_if_true(&mut self, start: usize) -> Result<(), &'static str> {
        self.emit_op(OpCode::LoopIfTrue);
        let offset = self.offset() - start + 2;
        if offset > u16::MAX as usize {
            return Err("Loop body too large.");
        }
        self.emit_u16(offset as u16);
        Ok(())
    }

    /// Unconditional loop back to `start`.
    pub fn emit_loop(&mut self, start: usize) -> Result<(), &'static str> {
        self.emit_op(OpCode::Loop);
        let offset = self.offset() - start + 2;
        if offset > u16::MAX as usize {
            return Err("Loop body too large.");
        }
        self.emit_u16(offset as u16);
        Ok(())
    }

    /// Record a break/continue/advance site: placeholder opcode, 16-bit
    /// scope depth, pop count. `patch_scope_jumps` rewrites it later.
    pub fn emit_scope_jump(&mut self, kind: ScopeJumpKind, to_pop: u8) {
        self.emit_op(kind.placeholder());
        let site = self.offset();
        self.emit_u16(self.scope_depth as u16);
        self.emit_byte(to_pop);
        self.scope_jumps.push(site);
    }

    /// Rewrite every pending scope jump of `kind` recorded in a scope
    /// deeper than the current one into a `JumpPopN` landing here.
    pub fn patch_scope_jumps(&mut self, kind: ScopeJumpKind) -> Result<(), &'static str> {
        let target = self.offset();
        let mut i = self.scope_jumps.len();
        while i > 0 {
            i -= 1;
            let site = self.scope_jumps[i];
            let placeholder = self.chunk.bytecode[site - 1];
            let depth =
                u32::from(u16::from_be_bytes([self.chunk.bytecode[site], self.chunk.bytecode[site + 1]]));
            let to_pop = self.chunk.bytecode[site + 2];
            if depth > self.scope_depth && placeholder == kind.placeholder() as u8 {
                let jump = target - site - 3;
                if jump > u16::MAX as usize {
                    return Err("Too much code to jump over.");
                }
                self.chunk.bytecode[site - 1] = OpCode::JumpPopN as u8;
                self.chunk.bytecode[site] = to_pop;
                self.chunk.bytecode[site + 1] = (jump >> 8) as u8;
                self.chunk.bytecode[site + 2] = (jump & 0xff) as u8;
                self.scope_jumps.remove(i);
            } else if depth < self.scope_depth {
                // Sites below this one are in shallower scopes still.
                break;
            }
        }
        Ok(())
    }
}
