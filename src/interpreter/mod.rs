//! Bytecode interpreter
//!
//! A straight-line dispatch loop over the decoded instruction stream. Control
//! flow is handled here; every other opcode goes through
//! [`handlers::execute_op`], which the compiled tier shares.
//!
//! The loop records the offset of each instruction it starts in
//! `ctx.exec_pos`, which is what the exception-table dispatch in
//! [`crate::vm`] matches handler ranges against.

pub mod handlers;

use crate::bytecode::{decode_all, CodeReader, MethodInfo, Opcode, Operands};
use crate::error::{Error, Result};
use crate::runtime::{CallContext, Value};
use crate::vm::VmContext;
use tracing::trace;

/// Instruction start offsets of a method, decoded on the first jump
struct JumpTargets<'a> {
    code: &'a [u8],
    starts: Option<Vec<u32>>,
}

impl<'a> JumpTargets<'a> {
    fn new(code: &'a [u8]) -> Self {
        Self { code, starts: None }
    }

    /// `target` if an instruction begins there
    fn check(&mut self, target: u32) -> Result<u32> {
        if self.starts.is_none() {
            let starts = decode_all(self.code)?.iter().map(|i| i.offset).collect();
            self.starts = Some(starts);
        }
        match &self.starts {
            Some(starts) if starts.binary_search(&target).is_ok() => Ok(target),
            _ => Err(Error::format_error(
                "jump target is not an instruction boundary",
                target as usize,
            )),
        }
    }
}

/// Interpret `method` from `ctx.exec_pos` until it returns or throws
pub fn execute(vm: &VmContext, method: &MethodInfo, ctx: &mut CallContext) -> Result<Value> {
    let mut reader = CodeReader::new(&method.body.code);
    let mut targets = JumpTargets::new(&method.body.code);
    if ctx.exec_pos != 0 {
        reader.seek(targets.check(ctx.exec_pos)?)?;
    }

    loop {
        let instr = reader.read_instruction()?;
        ctx.exec_pos = instr.offset;
        trace!(offset = instr.offset, opcode = %instr.opcode, stack = ctx.stack_len(), "interpret");

        match instr.opcode {
            Opcode::Jump => reader.seek(targets.check(instr.branch_target()?)?)?,
            Opcode::IfTrue | Opcode::IfFalse => {
                let condition = ctx.pop()?.to_boolean();
                if condition == (instr.opcode == Opcode::IfTrue) {
                    reader.seek(targets.check(instr.branch_target()?)?)?;
                }
            }
            op if op.is_branch() => {
                let b = ctx.pop()?;
                let a = ctx.pop()?;
                if handlers::branch_taken(op, &a, &b)? {
                    reader.seek(targets.check(instr.branch_target()?)?)?;
                }
            }
            Opcode::LookupSwitch => {
                let index = ctx.pop()?.to_int32();
                let Operands::Switch { default, cases } = &instr.operands else {
                    return Err(Error::internal("lookupswitch without switch operands"));
                };
                let target = usize::try_from(index)
                    .ok()
                    .and_then(|i| cases.get(i))
                    .copied()
                    .unwrap_or(*default);
                reader.seek(targets.check(target)?)?;
            }
            Opcode::ReturnVoid => return Ok(Value::Undefined),
            Opcode::ReturnValue => return ctx.pop(),
            Opcode::Throw => return Err(Error::Thrown(ctx.pop()?)),
            _ => handlers::execute_op(vm, ctx, &instr)?,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{CodeBuilder, ConstantPoolData, MethodBody, ParamType};
    use crate::config::VmConfig;
    use crate::runtime::StandardModel;
    use std::rc::Rc;
    use std::sync::Arc;

    fn interpret(code: Vec<u8>, locals: u32, args: Vec<Value>) -> Result<Value> {
        let vm = VmContext::builder()
            .pool(Arc::new(ConstantPoolData::new()))
            .method(
                MethodInfo::new("test", MethodBody::new(code, 8, locals))
                    .with_params(vec![ParamType::Any; args.len()]),
            )
            .model(Rc::new(StandardModel::new()))
            .config(VmConfig::interpreter_only())
            .build()?;
        vm.invoke(0, Value::Null, args)
    }

    #[test]
    fn test_subtract_operand_order() {
        let mut b = CodeBuilder::new();
        b.push_byte(5).push_byte(3).op(Opcode::Subtract).op(Opcode::ReturnValue);
        let result = interpret(b.finish().unwrap(), 1, Vec::new()).unwrap();
        assert_eq!(result.to_number(), 2.0);
    }

    #[test]
    fn test_counting_loop() {
        // i = 0; while (i < 10) i = i + 1; return i
        let mut b = CodeBuilder::new();
        let (top, test) = (b.new_label(), b.new_label());
        b.push_byte(0).set_local(1).jump(test);
        b.bind(top).op(Opcode::Label);
        b.get_local(1).push_byte(1).op(Opcode::AddI).set_local(1);
        b.bind(test).get_local(1).push_byte(10).branch(Opcode::IfLt, top);
        b.get_local(1).op(Opcode::ReturnValue);
        let result = interpret(b.finish().unwrap(), 2, Vec::new()).unwrap();
        assert!(matches!(result, Value::Integer(10)));
    }

    #[test]
    fn test_lookupswitch_default_on_out_of_range() {
        for (index, expected) in [(0, 10), (1, 20), (2, 30), (-1, 30)] {
            let mut b = CodeBuilder::new();
            let (a, c, d) = (b.new_label(), b.new_label(), b.new_label());
            b.get_local(1).lookup_switch(d, &[a, c]);
            b.bind(a).push_byte(10).op(Opcode::ReturnValue);
            b.bind(c).push_byte(20).op(Opcode::ReturnValue);
            b.bind(d).push_byte(30).op(Opcode::ReturnValue);
            let result =
                interpret(b.finish().unwrap(), 2, vec![Value::from(index)]).unwrap();
            assert_eq!(result.to_int32(), expected, "index {}", index);
        }
    }

    #[test]
    fn test_throw_propagates_value() {
        let mut b = CodeBuilder::new();
        b.push_byte(42).op(Opcode::Throw);
        let err = interpret(b.finish().unwrap(), 1, Vec::new()).unwrap_err();
        assert!(matches!(err, Error::Thrown(Value::Integer(42))));
    }

    #[test]
    fn test_running_off_the_end_is_a_format_error() {
        let mut b = CodeBuilder::new();
        b.push_byte(1).op(Opcode::Pop);
        let err = interpret(b.finish().unwrap(), 1, Vec::new()).unwrap_err();
        assert!(err.is_format_error());
    }

    #[test]
    fn test_jump_into_an_operand_is_a_format_error() {
        // 0: jump +1 lands on the operand byte of 4: pushbyte 0x26
        let code = vec![0x10, 0x01, 0x00, 0x00, 0x24, 0x26, 0x48];
        let err = interpret(code, 1, Vec::new()).unwrap_err();
        assert!(
            matches!(err, Error::FormatError { offset: 5, .. }),
            "{:?}",
            err
        );
    }

    #[test]
    fn test_switch_case_into_an_operand_is_a_format_error() {
        // 2: lookupswitch, case 0 at +9 lands on the operand of 10: pushbyte 9
        let code = vec![
            0x24, 0x00, 0x1b, 0x00, 0x00, 0x00, 0x00, 0x09, 0x00, 0x00, 0x24, 0x09, 0x48,
        ];
        let err = interpret(code, 1, Vec::new()).unwrap_err();
        assert!(err.is_format_error(), "{:?}", err);
    }

    #[test]
    fn test_unknown_opcode() {
        let err = interpret(vec![0xfe], 1, Vec::new()).unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }
}
