//! Lowered register IR produced by the emitter
//!
//! Each register holds one [`StackType`] for the whole method: an unboxed
//! primitive or an owned object reference. Reference counting is explicit in
//! the IR: `Move` transfers ownership, `Retain` is an incRef into a new
//! register and `Release` is a decRef. Every instruction that reads a
//! register consumes it, except `Retain`.
//!
//! A `LoweredMethod` never holds a `Value`. String and namespace constants
//! stay pool indices, so lowered code can be shared across threads.

use crate::bytecode::Instruction;
use crate::error::{Error, Result};
use crate::runtime::{helpers, StackType, Value};
use rustc_hash::FxHashMap as HashMap;
use serde::Serialize;
use std::fmt;

/// Virtual register identifier
pub type Register = u32;

/// Branch destination; resolved through `LoweredMethod::labels`
pub type Label = u32;

/// Constants that need the pool or are boxed
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum Constant {
    Undefined,
    Null,
    /// String pool index
    String(u32),
    /// Namespace pool index
    Namespace(u32),
}

/// Wrapping 32-bit integer operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IntOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    /// Produces a uint
    UShr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FloatOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UnaryOp {
    IntNeg,
    IntNot,
    FloatNeg,
    BoolNot,
}

/// Comparison on Number operands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Value-level semantic helper called on boxed operands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Helper {
    Add,
    AddI,
    Subtract,
    SubtractI,
    Multiply,
    MultiplyI,
    Divide,
    Modulo,
    Negate,
    NegateI,
    Increment,
    IncrementI,
    Decrement,
    DecrementI,
    Equals,
    StrictEquals,
    LessThan,
    LessEquals,
    GreaterThan,
    GreaterEquals,
    TypeOf,
    ConvertS,
    CoerceS,
    ConvertO,
    CoerceO,
    EscXAttr,
}

impl Helper {
    pub fn arity(self) -> usize {
        use Helper::*;
        match self {
            Add | AddI | Subtract | SubtractI | Multiply | MultiplyI | Divide | Modulo
            | Equals | StrictEquals | LessThan | LessEquals | GreaterThan | GreaterEquals => 2,
            _ => 1,
        }
    }

    /// Apply the helper; arguments are in push order
    pub fn call(self, args: &[Value]) -> Result<Value> {
        use Helper::*;
        if args.len() != self.arity() {
            return Err(Error::internal(format!(
                "helper {:?} called with {} arguments",
                self,
                args.len()
            )));
        }
        let a = &args[0];
        let b = args.get(1).unwrap_or(&Value::Undefined);
        Ok(match self {
            Add => helpers::add(a, b),
            AddI => helpers::add_i(a, b),
            Subtract => helpers::subtract(a, b),
            SubtractI => helpers::subtract_i(a, b),
            Multiply => helpers::multiply(a, b),
            MultiplyI => helpers::multiply_i(a, b),
            Divide => helpers::divide(a, b),
            Modulo => helpers::modulo(a, b),
            Negate => helpers::negate(a),
            NegateI => helpers::negate_i(a),
            Increment => helpers::increment(a),
            IncrementI => helpers::increment_i(a),
            Decrement => helpers::decrement(a),
            DecrementI => helpers::decrement_i(a),
            Equals => Value::Boolean(helpers::equals(a, b)),
            StrictEquals => Value::Boolean(helpers::strict_equals(a, b)),
            LessThan => Value::Boolean(helpers::less_than(a, b)),
            LessEquals => Value::Boolean(helpers::less_equals(a, b)),
            GreaterThan => Value::Boolean(helpers::greater_than(a, b)),
            GreaterEquals => Value::Boolean(helpers::greater_equals(a, b)),
            TypeOf => helpers::type_of(a),
            ConvertS => helpers::convert_s(a),
            CoerceS => helpers::coerce_s(a),
            ConvertO => helpers::convert_o(a)?,
            CoerceO => helpers::coerce_o(a),
            EscXAttr => helpers::esc_xattr(a),
        })
    }
}

/// One lowered instruction
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum NativeIR {
    /// Jump to `entry`, or to the handler whose target equals `exec_pos`
    EntryDispatch {
        entry: Label,
        handlers: Vec<(u32, Label)>,
    },
    SetExecPos(u32),

    // ========== Constants ==========
    LoadInt { dst: Register, value: i32 },
    LoadUInt { dst: Register, value: u32 },
    LoadNumber { dst: Register, value: f64 },
    LoadBool { dst: Register, value: bool },
    LoadConst { dst: Register, constant: Constant },

    // ========== Ownership ==========
    Move { dst: Register, src: Register },
    Retain { dst: Register, src: Register },
    Release(Register),
    Convert { dst: Register, src: Register, ty: StackType },

    // ========== Memory state ==========
    PushDynamic(Register),
    PopDynamic(Register),
    LoadLocal { dst: Register, local: u32 },
    StoreLocal { local: u32, src: Register },
    ClearLocal(u32),

    // ========== Native arithmetic ==========
    IntOp { dst: Register, op: IntOp, a: Register, b: Register },
    FloatOp { dst: Register, op: FloatOp, a: Register, b: Register },
    Unary { dst: Register, op: UnaryOp, src: Register },
    Compare { dst: Register, op: CompareOp, a: Register, b: Register },

    // ========== Fallbacks ==========
    CallHelper { dst: Register, helper: Helper, args: Vec<Register> },
    /// Interpreter routine on the memory-resident context
    Generic(Instruction),

    // ========== Control flow ==========
    Jump(Label),
    Branch { cond: Register, if_true: Label, if_false: Label },
    Switch { index: Register, cases: Vec<Label>, default: Label },
    Return(Register),
    ReturnVoid,
    Throw(Register),
    /// Fails with a format error when reached
    Trap { message: String, offset: u32 },
}

impl NativeIR {
    /// Instructions that can fail with a catchable error
    pub fn is_fallible(&self) -> bool {
        matches!(
            self,
            NativeIR::Generic(_) | NativeIR::CallHelper { .. } | NativeIR::Throw(_)
        )
    }
}

impl fmt::Display for NativeIR {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use NativeIR::*;
        match self {
            EntryDispatch { entry, handlers } => {
                write!(f, "entry_dispatch L{}", entry)?;
                for (target, label) in handlers {
                    write!(f, ", {} -> L{}", target, label)?;
                }
                Ok(())
            }
            SetExecPos(pos) => write!(f, "exec_pos {}", pos),
            LoadInt { dst, value } => write!(f, "r{} = int {}", dst, value),
            LoadUInt { dst, value } => write!(f, "r{} = uint {}", dst, value),
            LoadNumber { dst, value } => write!(f, "r{} = number {}", dst, value),
            LoadBool { dst, value } => write!(f, "r{} = bool {}", dst, value),
            LoadConst { dst, constant } => write!(f, "r{} = const {:?}", dst, constant),
            Move { dst, src } => write!(f, "r{} = move r{}", dst, src),
            Retain { dst, src } => write!(f, "r{} = retain r{}", dst, src),
            Release(r) => write!(f, "release r{}", r),
            Convert { dst, src, ty } => write!(f, "r{} = convert<{}> r{}", dst, ty, src),
            PushDynamic(r) => write!(f, "push r{}", r),
            PopDynamic(r) => write!(f, "r{} = pop", r),
            LoadLocal { dst, local } => write!(f, "r{} = local[{}]", dst, local),
            StoreLocal { local, src } => write!(f, "local[{}] = r{}", local, src),
            ClearLocal(local) => write!(f, "kill local[{}]", local),
            IntOp { dst, op, a, b } => write!(f, "r{} = int.{:?} r{}, r{}", dst, op, a, b),
            FloatOp { dst, op, a, b } => write!(f, "r{} = float.{:?} r{}, r{}", dst, op, a, b),
            Unary { dst, op, src } => write!(f, "r{} = {:?} r{}", dst, op, src),
            Compare { dst, op, a, b } => write!(f, "r{} = cmp.{:?} r{}, r{}", dst, op, a, b),
            CallHelper { dst, helper, args } => {
                let args: Vec<String> = args.iter().map(|r| format!("r{}", r)).collect();
                write!(f, "r{} = call {:?}({})", dst, helper, args.join(", "))
            }
            Generic(instr) => write!(f, "generic {} @{}", instr.opcode, instr.offset),
            Jump(label) => write!(f, "jump L{}", label),
            Branch {
                cond,
                if_true,
                if_false,
            } => write!(f, "branch r{} ? L{} : L{}", cond, if_true, if_false),
            Switch {
                index,
                cases,
                default,
            } => {
                let cases: Vec<String> = cases.iter().map(|l| format!("L{}", l)).collect();
                write!(f, "switch r{} [{}] else L{}", index, cases.join(", "), default)
            }
            Return(r) => write!(f, "return r{}", r),
            ReturnVoid => write!(f, "return void"),
            Throw(r) => write!(f, "throw r{}", r),
            Trap { message, offset } => write!(f, "trap \"{}\" @{}", message, offset),
        }
    }
}

/// The lowered form of one method, input to native code generation
#[derive(Debug, Clone, Serialize)]
pub struct LoweredMethod {
    pub name: String,
    pub ir: Vec<NativeIR>,
    /// IR position of every label
    pub labels: Vec<usize>,
    pub register_count: u32,
    /// Register-resident locals to write back when the IR instruction at
    /// the key fails
    pub unwind: HashMap<usize, Vec<(u32, Register)>>,
    /// Locals dead on entry to each handler target
    pub handler_resets: HashMap<u32, Vec<u32>>,
}

impl LoweredMethod {
    /// IR position of `label`
    pub fn label_position(&self, label: Label) -> Result<usize> {
        self.labels
            .get(label as usize)
            .copied()
            .ok_or_else(|| Error::internal(format!("unbound label L{}", label)))
    }

    pub fn handler_resets(&self, target: u32) -> &[u32] {
        self.handler_resets
            .get(&target)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

impl fmt::Display for LoweredMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "== {} ({} registers) ==", self.name, self.register_count)?;
        let mut marks: Vec<(usize, usize)> = self
            .labels
            .iter()
            .enumerate()
            .map(|(label, &pos)| (pos, label))
            .collect();
        marks.sort_unstable();
        let mut marks = marks.into_iter().peekable();
        for (pos, ir) in self.ir.iter().enumerate() {
            while let Some((_, label)) = marks.next_if(|(p, _)| *p == pos) {
                writeln!(f, "L{}:", label)?;
            }
            writeln!(f, "  {:4} {}", pos, ir)?;
        }
        for (_, label) in marks {
            writeln!(f, "L{}:", label)?;
        }
        Ok(())
    }
}
