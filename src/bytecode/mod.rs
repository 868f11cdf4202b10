//! Bytecode representation and instruction set
//!
//! This module holds everything the execution core needs to know about a
//! method's code: the opcode table, the shared decoder, method and class
//! descriptions, constant pool access, an assembler and the JSON module
//! format. It also provides a disassembler for the CLI and for tests.

pub mod builder;
pub mod method;
pub mod module;
pub mod opcode;
pub mod pool;
pub mod reader;

pub use builder::{CodeBuilder, CodeLabel};
pub use method::{
    ClassInfo, DefaultValue, ExceptionInfo, MethodBody, MethodFlags, MethodInfo, MethodTrait,
    ParamType, SlotTrait,
};
pub use module::Module;
pub use opcode::{Opcode, OperandLayout};
pub use pool::{ConstantPool, ConstantPoolData, Multiname, MultinameKind, QualifiedName};
pub use reader::{decode_all, CodeReader, Instruction, Operands};

use crate::error::Result;
use std::fmt::Write;

/// Disassemble a whole method, including its exception table
pub fn disassemble(method: &MethodInfo, pool: &dyn ConstantPool) -> Result<String> {
    let body = &method.body;
    let mut output = format!(
        "== {} (max_stack {}, locals {}) ==\n",
        method.name, body.max_stack, body.local_count
    );
    let mut reader = CodeReader::new(&body.code);
    while !reader.at_end() {
        let instruction = reader.read_instruction()?;
        output.push_str(&disassemble_instruction(&instruction, pool));
        output.push('\n');
    }
    for (i, exception) in body.exceptions.iter().enumerate() {
        let _ = writeln!(
            output,
            "  catch #{}: [{}, {}) -> {} type {}",
            i, exception.from, exception.to, exception.target, exception.exc_type
        );
    }
    Ok(output)
}

/// Disassemble a single instruction
pub fn disassemble_instruction(instruction: &Instruction, pool: &dyn ConstantPool) -> String {
    let operands = format_operands(instruction, pool);
    if operands.is_empty() {
        format!("{:04} {}", instruction.offset, instruction.opcode)
    } else {
        format!(
            "{:04} {:16} {}",
            instruction.offset,
            instruction.opcode.mnemonic(),
            operands
        )
    }
}

fn format_operands(instruction: &Instruction, pool: &dyn ConstantPool) -> String {
    use Opcode::*;
    match (&instruction.operands, instruction.opcode) {
        (Operands::None, _) => String::new(),
        (Operands::Byte(b), _) => b.to_string(),
        (Operands::Branch { target, .. }, _) => format!("-> {:04}", target),
        (Operands::Switch { default, cases }, _) => {
            let cases: Vec<String> = cases.iter().map(|c| format!("{:04}", c)).collect();
            format!("default {:04} [{}]", default, cases.join(", "))
        }
        (Operands::Debug { kind, index, reg, .. }, _) => {
            format!("{} {} r{}", kind, describe_string(pool, *index), reg)
        }
        (Operands::Index(i), PushShort) => (*i as i32).to_string(),
        (Operands::Index(i), PushInt) => describe(pool.get_integer(*i)),
        (Operands::Index(i), PushUInt) => describe(pool.get_uinteger(*i)),
        (Operands::Index(i), PushDouble) => describe(pool.get_double(*i)),
        (Operands::Index(i), PushString | DebugFile | Dxns) => describe_string(pool, *i),
        (Operands::Index(i), PushNamespace) => describe(pool.get_namespace(*i)),
        (
            Operands::Index(i),
            GetProperty | SetProperty | InitProperty | DeleteProperty | GetSuper | SetSuper
            | FindProperty | FindPropStrict | FindDef | GetLex | Coerce | AsType | IsType
            | GetDescendants,
        ) => describe_multiname(pool, *i),
        (
            Operands::Pair(name, argc),
            CallProperty | CallPropVoid | CallPropLex | CallSuper | CallSuperVoid
            | ConstructProp,
        ) => format!("{} ({} args)", describe_multiname(pool, *name), argc),
        (Operands::Pair(a, b), _) => format!("{} {}", a, b),
        (Operands::Index(i), _) => i.to_string(),
    }
}

fn describe<T: std::fmt::Debug>(value: Result<T>) -> String {
    match value {
        Ok(v) => format!("{:?}", v),
        Err(_) => "<bad index>".to_string(),
    }
}

fn describe_string(pool: &dyn ConstantPool, index: u32) -> String {
    describe(pool.get_string(index))
}

fn describe_multiname(pool: &dyn ConstantPool, index: u32) -> String {
    match pool.get_multiname(index) {
        Ok(m) => match m.static_name() {
            Ok(name) => name.to_string(),
            Err(_) => format!("{:?}({})", m.kind, m.name.as_deref().unwrap_or("*")),
        },
        Err(_) => "<bad multiname>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_disassemble_method() {
        let mut pool = ConstantPoolData::new();
        let trace = pool.add_qname("trace");
        let hello = pool.add_string("hello");

        let mut b = CodeBuilder::new();
        b.op_u30(Opcode::FindPropStrict, trace)
            .op_u30(Opcode::PushString, hello)
            .op_u30_u30(Opcode::CallPropVoid, trace, 1)
            .op(Opcode::ReturnVoid);
        let method = MethodInfo::new("main", MethodBody::new(b.finish().unwrap(), 2, 1));

        let text = disassemble(&method, &pool).unwrap();
        let expected = "\
== main (max_stack 2, locals 1) ==
0000 findpropstrict   trace
0002 pushstring       \"hello\"
0004 callpropvoid     trace (1 args)
0007 returnvoid
";
        assert_eq!(text, expected);
    }

    #[test]
    fn test_disassemble_branches() {
        let pool = ConstantPoolData::new();
        let mut b = CodeBuilder::new();
        let end = b.new_label();
        b.push_byte(-3).op(Opcode::Pop).jump(end);
        b.bind(end).op(Opcode::ReturnVoid);
        let method = MethodInfo::new("f", MethodBody::new(b.finish().unwrap(), 1, 1));
        let text = disassemble(&method, &pool).unwrap();
        assert!(text.contains("0000 pushbyte         -3"));
        assert!(text.contains("0003 jump             -> 0007"));
    }
}
