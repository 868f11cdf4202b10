//! Instruction decoding
//!
//! A single decoder is shared by the interpreter, the block-graph builder, the
//! emitter and the disassembler, so every consumer agrees on operand widths and
//! on the branch-offset basis:
//!
//! - conditional branches and `jump`: `target = offset_after_operand + s24`
//! - `lookupswitch`: every target is relative to the opcode byte itself

use super::opcode::{Opcode, OperandLayout};
use crate::error::{Error, Result};
use serde::Serialize;

/// Decoded inline operands
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Operands {
    None,
    Index(u32),
    Pair(u32, u32),
    Byte(i8),
    /// Raw s24 offset and the resolved absolute target
    Branch { offset: i32, target: u32 },
    Switch { default: u32, cases: Vec<u32> },
    Debug { kind: u8, index: u32, reg: u8, extra: u32 },
}

/// One decoded instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Instruction {
    pub offset: u32,
    pub opcode: Opcode,
    pub operands: Operands,
    /// Offset of the following instruction
    pub next: u32,
}

impl Instruction {
    /// First u30 operand
    pub fn index(&self) -> Result<u32> {
        match self.operands {
            Operands::Index(i) | Operands::Pair(i, _) => Ok(i),
            _ => Err(self.operand_error()),
        }
    }

    /// Second u30 operand
    pub fn second(&self) -> Result<u32> {
        match self.operands {
            Operands::Pair(_, n) => Ok(n),
            _ => Err(self.operand_error()),
        }
    }

    /// Absolute target of a branch
    pub fn branch_target(&self) -> Result<u32> {
        match self.operands {
            Operands::Branch { target, .. } => Ok(target),
            _ => Err(self.operand_error()),
        }
    }

    /// Local index of getlocal/setlocal in either form
    pub fn local_index(&self) -> Result<u32> {
        match self.opcode.short_local_index() {
            Some(index) => Ok(index),
            None => self.index(),
        }
    }

    /// All control-flow successors other than the fallthrough
    pub fn jump_targets(&self) -> Vec<u32> {
        match &self.operands {
            Operands::Branch { target, .. } => vec![*target],
            Operands::Switch { default, cases } => {
                let mut targets = Vec::with_capacity(cases.len() + 1);
                targets.push(*default);
                targets.extend(cases.iter().copied());
                targets
            }
            _ => Vec::new(),
        }
    }

    fn operand_error(&self) -> Error {
        Error::internal(format!(
            "{} at {} has operands {:?}",
            self.opcode, self.offset, self.operands
        ))
    }
}

/// Cursor over a method's code
#[derive(Debug, Clone)]
pub struct CodeReader<'a> {
    code: &'a [u8],
    pos: usize,
}

impl<'a> CodeReader<'a> {
    pub fn new(code: &'a [u8]) -> Self {
        Self { code, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.code.len()
    }

    pub fn seek(&mut self, pos: u32) -> Result<()> {
        let pos = pos as usize;
        if pos >= self.code.len() {
            return Err(Error::format_error("jump outside of code", pos));
        }
        self.pos = pos;
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let byte = *self
            .code
            .get(self.pos)
            .ok_or_else(|| Error::format_error("unexpected end of code", self.pos))?;
        self.pos += 1;
        Ok(byte)
    }

    /// Variable-length u30: 7 bits per byte, at most 5 bytes
    pub fn read_u30(&mut self) -> Result<u32> {
        let start = self.pos;
        let mut result: u32 = 0;
        for i in 0..5 {
            let byte = self.read_u8()?;
            result |= u32::from(byte & 0x7f) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
        Err(Error::format_error("u30 longer than 5 bytes", start))
    }

    /// 3-byte little-endian signed offset
    pub fn read_s24(&mut self) -> Result<i32> {
        let b0 = u32::from(self.read_u8()?);
        let b1 = u32::from(self.read_u8()?);
        let b2 = u32::from(self.read_u8()?);
        let raw = b0 | (b1 << 8) | (b2 << 16);
        // sign-extend from bit 23
        Ok(((raw << 8) as i32) >> 8)
    }

    fn target(&self, base: usize, offset: i32) -> Result<u32> {
        let target = base as i64 + i64::from(offset);
        if target < 0 || target >= self.code.len() as i64 {
            return Err(Error::format_error("jump outside of code", base));
        }
        Ok(target as u32)
    }

    /// Decode the instruction at the current position
    pub fn read_instruction(&mut self) -> Result<Instruction> {
        let offset = self.pos;
        let byte = self.read_u8()?;
        let opcode = Opcode::from_u8(byte).ok_or_else(|| {
            Error::unsupported(format!("unknown opcode {:#04x} at offset {}", byte, offset))
        })?;
        let operands = match opcode.layout() {
            OperandLayout::None => Operands::None,
            OperandLayout::U30 => {
                let value = self.read_u30()?;
                if opcode == Opcode::PushShort {
                    // truncated to 16 bits, then sign-extended
                    Operands::Index(value as u16 as i16 as i32 as u32)
                } else {
                    Operands::Index(value)
                }
            }
            OperandLayout::U30U30 => {
                let first = self.read_u30()?;
                let second = self.read_u30()?;
                Operands::Pair(first, second)
            }
            OperandLayout::I8 => Operands::Byte(self.read_u8()? as i8),
            OperandLayout::Branch => {
                let relative = self.read_s24()?;
                let target = self.target(self.pos, relative)?;
                Operands::Branch {
                    offset: relative,
                    target,
                }
            }
            OperandLayout::Switch => {
                let default = self.read_s24()?;
                let default = self.target(offset, default)?;
                let count = self.read_u30()?;
                let mut cases = Vec::new();
                for _ in 0..=count {
                    let case = self.read_s24()?;
                    cases.push(self.target(offset, case)?);
                }
                Operands::Switch { default, cases }
            }
            OperandLayout::Debug => {
                let kind = self.read_u8()?;
                let index = self.read_u30()?;
                let reg = self.read_u8()?;
                let extra = self.read_u30()?;
                Operands::Debug {
                    kind,
                    index,
                    reg,
                    extra,
                }
            }
        };
        Ok(Instruction {
            offset: offset as u32,
            opcode,
            operands,
            next: self.pos as u32,
        })
    }
}

/// Decode a whole method body
pub fn decode_all(code: &[u8]) -> Result<Vec<Instruction>> {
    let mut reader = CodeReader::new(code);
    let mut instructions = Vec::new();
    while !reader.at_end() {
        instructions.push(reader.read_instruction()?);
    }
    Ok(instructions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u30() {
        let mut reader = CodeReader::new(&[0x7f, 0x80, 0x01, 0xff, 0xff, 0xff, 0xff, 0x0f]);
        assert_eq!(reader.read_u30().unwrap(), 127);
        assert_eq!(reader.read_u30().unwrap(), 128);
        assert_eq!(reader.read_u30().unwrap(), u32::MAX);
    }

    #[test]
    fn test_u30_too_long() {
        let mut reader = CodeReader::new(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x01]);
        assert!(reader.read_u30().unwrap_err().is_format_error());
    }

    #[test]
    fn test_s24_sign_extension() {
        let mut reader = CodeReader::new(&[0xfd, 0xff, 0xff, 0x10, 0x00, 0x00]);
        assert_eq!(reader.read_s24().unwrap(), -3);
        assert_eq!(reader.read_s24().unwrap(), 16);
    }

    #[test]
    fn test_branch_target_is_after_operand() {
        // 0: jump +1 ; 4: nop ; 5: returnvoid
        let code = [0x10, 0x01, 0x00, 0x00, 0x02, 0x47];
        let instr = CodeReader::new(&code).read_instruction().unwrap();
        assert_eq!(instr.branch_target().unwrap(), 5);
        assert_eq!(instr.next, 4);
    }

    #[test]
    fn test_lookupswitch_is_relative_to_opcode() {
        // 0: nop ; 1: lookupswitch default=+9 count=0 case0=+10 ; 10: nop ; 11: returnvoid
        let code = [
            0x02, 0x1b, 0x09, 0x00, 0x00, 0x00, 0x0a, 0x00, 0x00, 0x02, 0x02, 0x47,
        ];
        let mut reader = CodeReader::new(&code);
        reader.read_instruction().unwrap();
        let instr = reader.read_instruction().unwrap();
        assert_eq!(
            instr.operands,
            Operands::Switch {
                default: 10,
                cases: vec![11]
            }
        );
    }

    #[test]
    fn test_jump_outside_of_code() {
        let code = [0x10, 0x10, 0x00, 0x00, 0x47];
        let err = CodeReader::new(&code).read_instruction().unwrap_err();
        assert!(err.is_format_error());
        let code = [0x10, 0xf0, 0xff, 0xff, 0x47];
        assert!(CodeReader::new(&code).read_instruction().is_err());
    }

    #[test]
    fn test_truncated_stream() {
        let err = decode_all(&[0x24]).unwrap_err();
        assert!(matches!(err, Error::FormatError { offset: 1, .. }));
    }

    #[test]
    fn test_pushshort_sign_extends() {
        // pushshort 0xffff encoded as u30
        let code = [0x25, 0xff, 0xff, 0x03];
        let instr = CodeReader::new(&code).read_instruction().unwrap();
        assert_eq!(instr.index().unwrap() as i32, -1);
    }

    #[test]
    fn test_unknown_opcode_is_unsupported() {
        let err = decode_all(&[0xfe]).unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn test_short_local_forms() {
        let instrs = decode_all(&[0xd2, 0x62, 0x05, 0x47]).unwrap();
        assert_eq!(instrs[0].local_index().unwrap(), 2);
        assert_eq!(instrs[1].local_index().unwrap(), 5);
        assert_eq!(instrs.len(), 3);
    }
}
