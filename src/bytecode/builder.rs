//! Bytecode assembler
//!
//! `CodeBuilder` emits method bodies with symbolic labels. Branch offsets are
//! back-patched in `finish` using the same basis rules the decoder applies.

use super::opcode::{Opcode, OperandLayout};
use crate::error::{Error, Result};

/// A branch destination inside a `CodeBuilder`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeLabel(usize);

#[derive(Debug)]
struct Fixup {
    /// Position of the s24 operand
    at: usize,
    /// Offset the s24 is relative to
    base: usize,
    label: CodeLabel,
}

/// Method body assembler
#[derive(Debug, Default)]
pub struct CodeBuilder {
    code: Vec<u8>,
    labels: Vec<Option<usize>>,
    fixups: Vec<Fixup>,
}

impl CodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current offset
    pub fn here(&self) -> u32 {
        self.code.len() as u32
    }

    pub fn new_label(&mut self) -> CodeLabel {
        self.labels.push(None);
        CodeLabel(self.labels.len() - 1)
    }

    /// Bind a label to the current offset
    pub fn bind(&mut self, label: CodeLabel) -> &mut Self {
        self.labels[label.0] = Some(self.code.len());
        self
    }

    /// Emit an opcode without operands
    pub fn op(&mut self, opcode: Opcode) -> &mut Self {
        debug_assert_eq!(opcode.layout(), OperandLayout::None, "{} needs operands", opcode);
        self.code.push(opcode as u8);
        self
    }

    pub fn op_u30(&mut self, opcode: Opcode, value: u32) -> &mut Self {
        self.code.push(opcode as u8);
        self.u30(value)
    }

    pub fn op_u30_u30(&mut self, opcode: Opcode, first: u32, second: u32) -> &mut Self {
        self.code.push(opcode as u8);
        self.u30(first).u30(second)
    }

    pub fn push_byte(&mut self, value: i8) -> &mut Self {
        self.code.push(Opcode::PushByte as u8);
        self.code.push(value as u8);
        self
    }

    pub fn push_short(&mut self, value: i16) -> &mut Self {
        self.op_u30(Opcode::PushShort, u32::from(value as u16))
    }

    /// getlocal, using the short form when possible
    pub fn get_local(&mut self, index: u32) -> &mut Self {
        match index {
            0..=3 => {
                self.code.push(Opcode::GetLocal0 as u8 + index as u8);
                self
            }
            _ => self.op_u30(Opcode::GetLocal, index),
        }
    }

    /// setlocal, using the short form when possible
    pub fn set_local(&mut self, index: u32) -> &mut Self {
        match index {
            0..=3 => {
                self.code.push(Opcode::SetLocal0 as u8 + index as u8);
                self
            }
            _ => self.op_u30(Opcode::SetLocal, index),
        }
    }

    /// Conditional branch or `jump` to a label
    pub fn branch(&mut self, opcode: Opcode, label: CodeLabel) -> &mut Self {
        debug_assert!(opcode.is_branch(), "{} is not a branch", opcode);
        self.code.push(opcode as u8);
        let at = self.code.len();
        self.code.extend_from_slice(&[0, 0, 0]);
        self.fixups.push(Fixup {
            at,
            base: at + 3,
            label,
        });
        self
    }

    pub fn jump(&mut self, label: CodeLabel) -> &mut Self {
        self.branch(Opcode::Jump, label)
    }

    /// `lookupswitch`; offsets are relative to the opcode byte
    pub fn lookup_switch(&mut self, default: CodeLabel, cases: &[CodeLabel]) -> &mut Self {
        let base = self.code.len();
        self.code.push(Opcode::LookupSwitch as u8);
        self.placeholder(base, default);
        self.u30(cases.len().saturating_sub(1) as u32);
        for case in cases {
            self.placeholder(base, *case);
        }
        self
    }

    pub fn debug_line(&mut self, line: u32) -> &mut Self {
        self.op_u30(Opcode::DebugLine, line)
    }

    /// `debug kind, name, reg, extra`
    pub fn debug(&mut self, kind: u8, name: u32, reg: u8, extra: u32) -> &mut Self {
        self.code.push(Opcode::Debug as u8);
        self.code.push(kind);
        self.u30(name);
        self.code.push(reg);
        self.u30(extra)
    }

    /// Raw u30
    pub fn u30(&mut self, mut value: u32) -> &mut Self {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.code.push(byte);
                return self;
            }
            self.code.push(byte | 0x80);
        }
    }

    /// Raw byte, for hand-crafted malformed streams
    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.code.extend_from_slice(bytes);
        self
    }

    fn placeholder(&mut self, base: usize, label: CodeLabel) {
        let at = self.code.len();
        self.code.extend_from_slice(&[0, 0, 0]);
        self.fixups.push(Fixup { at, base, label });
    }

    /// Resolve labels and return the code
    pub fn finish(&mut self) -> Result<Vec<u8>> {
        for fixup in &self.fixups {
            let target = self.labels[fixup.label.0].ok_or_else(|| {
                Error::internal(format!("label {} was never bound", fixup.label.0))
            })?;
            let relative = target as i64 - fixup.base as i64;
            if !(-(1 << 23)..(1 << 23)).contains(&relative) {
                return Err(Error::internal(format!(
                    "branch offset {} does not fit in s24",
                    relative
                )));
            }
            let bytes = (relative as i32).to_le_bytes();
            self.code[fixup.at..fixup.at + 3].copy_from_slice(&bytes[..3]);
        }
        Ok(std::mem::take(&mut self.code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::reader::{decode_all, Operands};

    #[test]
    fn test_forward_and_backward_branches() {
        let mut b = CodeBuilder::new();
        let top = b.new_label();
        let exit = b.new_label();
        b.bind(top).op(Opcode::Label);
        b.push_byte(1).branch(Opcode::IfTrue, exit);
        b.jump(top);
        b.bind(exit).op(Opcode::ReturnVoid);
        let code = b.finish().unwrap();

        let instrs = decode_all(&code).unwrap();
        assert_eq!(instrs[2].branch_target().unwrap(), 11);
        assert_eq!(instrs[3].branch_target().unwrap(), 0);
        assert_eq!(instrs[4].opcode, Opcode::ReturnVoid);
    }

    #[test]
    fn test_lookup_switch_round_trip() {
        let mut b = CodeBuilder::new();
        let (a, c, d) = (b.new_label(), b.new_label(), b.new_label());
        b.push_byte(0).lookup_switch(d, &[a, c]);
        b.bind(a).op(Opcode::ReturnVoid);
        b.bind(c).op(Opcode::ReturnVoid);
        b.bind(d).op(Opcode::ReturnVoid);
        let code = b.finish().unwrap();
        let instrs = decode_all(&code).unwrap();
        match &instrs[1].operands {
            Operands::Switch { default, cases } => {
                assert_eq!(*default, instrs[4].offset);
                assert_eq!(cases, &vec![instrs[2].offset, instrs[3].offset]);
            }
            other => panic!("unexpected operands {:?}", other),
        }
    }

    #[test]
    fn test_unbound_label() {
        let mut b = CodeBuilder::new();
        let nowhere = b.new_label();
        b.jump(nowhere);
        assert!(matches!(b.finish(), Err(Error::InternalError(_))));
    }

    #[test]
    fn test_local_short_forms() {
        let mut b = CodeBuilder::new();
        b.get_local(2).set_local(3).get_local(7);
        let code = b.finish().unwrap();
        assert_eq!(code, vec![0xd2, 0xd7, 0x62, 0x07]);
    }
}
