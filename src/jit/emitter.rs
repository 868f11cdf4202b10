//! Register IR emitter
//!
//! Walks every live block a second time with the frozen [`AnalysisResult`]
//! and lowers it to [`NativeIR`]. Two views of the operand stack and the
//! locals are kept while emitting:
//!
//! - the static stack and static locals, values held in registers with a
//!   known type;
//! - the dynamic stack and memory locals of the `CallContext`, touched only
//!   when the static stack is empty or when state must be in memory.
//!
//! `sync_stacks` spills the static stack before any generic instruction and
//! at the end of every block. `sync_locals` runs in a per-edge epilogue and
//! shapes the static locals into what the destination block expects: its
//! typed starts in the block's entry slots, reset locals released, and
//! everything else in memory.

use super::analysis::{lowering, memory_locals, AnalysisResult, BlockInfo, Lowering};
use super::ir::{
    CompareOp, Constant, FloatOp, Helper, IntOp, Label, LoweredMethod, NativeIR, Register,
    UnaryOp,
};
use crate::bytecode::{ConstantPool, Instruction, MethodInfo, Opcode, Operands};
use crate::error::{Error, Result};
use crate::runtime::StackType;
use rustc_hash::FxHashMap as HashMap;
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// A local held in a register
#[derive(Debug, Clone, Copy)]
struct StaticLocal {
    reg: Register,
    ty: StackType,
    /// The memory copy is stale
    dirty: bool,
}

fn is_numeric(ty: StackType) -> bool {
    matches!(ty, StackType::Int | StackType::UInt | StackType::Number)
}

fn compare_op(helper: Helper) -> Result<CompareOp> {
    Ok(match helper {
        Helper::Equals | Helper::StrictEquals => CompareOp::Eq,
        Helper::LessThan => CompareOp::Lt,
        Helper::LessEquals => CompareOp::Le,
        Helper::GreaterThan => CompareOp::Gt,
        Helper::GreaterEquals => CompareOp::Ge,
        other => return Err(Error::internal(format!("{:?} is not a comparison", other))),
    })
}

/// Comparison computed by a conditional branch, and whether it is negated
fn branch_comparison(op: Opcode) -> Result<(Helper, bool)> {
    use Opcode::*;
    Ok(match op {
        IfEq => (Helper::Equals, false),
        IfNe => (Helper::Equals, true),
        IfStrictEq => (Helper::StrictEquals, false),
        IfStrictNe => (Helper::StrictEquals, true),
        IfLt => (Helper::LessThan, false),
        IfLe => (Helper::LessEquals, false),
        IfGt => (Helper::GreaterThan, false),
        IfGe => (Helper::GreaterEquals, false),
        IfNlt => (Helper::LessThan, true),
        IfNle => (Helper::LessEquals, true),
        IfNgt => (Helper::GreaterThan, true),
        IfNge => (Helper::GreaterEquals, true),
        other => return Err(Error::internal(format!("{} is not a comparison branch", other))),
    })
}

/// Lower `method` using its analysis
pub fn emit(
    method: &MethodInfo,
    analysis: &AnalysisResult,
    pool: &dyn ConstantPool,
) -> Result<LoweredMethod> {
    let mut emitter = Emitter::new(method, analysis, pool);
    emitter.emit_method()?;
    emitter.finish()
}

struct Emitter<'a> {
    method: &'a MethodInfo,
    analysis: &'a AnalysisResult,
    pool: &'a dyn ConstantPool,
    ir: Vec<NativeIR>,
    labels: Vec<Option<usize>>,
    next_register: Register,
    stack: Vec<(Register, StackType)>,
    locals: Vec<Option<StaticLocal>>,
    block_labels: BTreeMap<u32, Label>,
    entry_slots: HashMap<(u32, u32), Register>,
    unwind: HashMap<usize, Vec<(u32, Register)>>,
    has_exceptions: bool,
    /// Operands popped so far by the current instruction
    pops: usize,
}

impl<'a> Emitter<'a> {
    fn new(method: &'a MethodInfo, analysis: &'a AnalysisResult, pool: &'a dyn ConstantPool) -> Self {
        let mut emitter = Self {
            method,
            analysis,
            pool,
            ir: Vec::new(),
            labels: Vec::new(),
            next_register: 0,
            stack: Vec::new(),
            locals: vec![None; analysis.local_count as usize],
            block_labels: BTreeMap::new(),
            entry_slots: HashMap::default(),
            unwind: HashMap::default(),
            has_exceptions: !method.body.exceptions.is_empty(),
            pops: 0,
        };
        for &start in analysis.blocks.keys() {
            let label = emitter.new_label();
            emitter.block_labels.insert(start, label);
        }
        emitter
    }

    // ==================== IR plumbing ====================

    fn fresh(&mut self) -> Register {
        let reg = self.next_register;
        self.next_register += 1;
        reg
    }

    fn new_label(&mut self) -> Label {
        self.labels.push(None);
        (self.labels.len() - 1) as Label
    }

    fn bind(&mut self, label: Label) {
        if let Some(slot) = self.labels.get_mut(label as usize) {
            *slot = Some(self.ir.len());
        }
    }

    fn block_label(&self, start: u32) -> Result<Label> {
        self.block_labels
            .get(&start)
            .copied()
            .ok_or_else(|| Error::internal(format!("no block at offset {}", start)))
    }

    fn push_ir(&mut self, ir: NativeIR) {
        if self.has_exceptions && ir.is_fallible() {
            let dirty: Vec<(u32, Register)> = self
                .locals
                .iter()
                .enumerate()
                .filter_map(|(i, local)| match local {
                    Some(l) if l.dirty => Some((i as u32, l.reg)),
                    _ => None,
                })
                .collect();
            if !dirty.is_empty() {
                self.unwind.insert(self.ir.len(), dirty);
            }
        }
        self.ir.push(ir);
    }

    fn convert(&mut self, reg: Register, from: StackType, to: StackType) -> Register {
        if from == to {
            return reg;
        }
        let dst = self.fresh();
        self.push_ir(NativeIR::Convert { dst, src: reg, ty: to });
        dst
    }

    fn call_helper(&mut self, helper: Helper, args: Vec<Register>) -> Register {
        let dst = self.fresh();
        self.push_ir(NativeIR::CallHelper { dst, helper, args });
        dst
    }

    // ==================== Static stack ====================

    fn pop(&mut self, ip: u32) -> Result<(Register, StackType)> {
        let expected = self
            .analysis
            .operand_types(ip)
            .get(self.pops)
            .copied()
            .ok_or_else(|| {
                Error::internal(format!("offset {} pops more operands than analyzed", ip))
            })?;
        self.pops += 1;
        let (reg, ty) = match self.stack.pop() {
            Some(entry) => entry,
            None => {
                let reg = self.fresh();
                self.push_ir(NativeIR::PopDynamic(reg));
                (reg, StackType::Object)
            }
        };
        if ty != expected {
            return Err(Error::internal(format!(
                "operand at offset {} is {} but was analyzed as {}",
                ip, ty, expected
            )));
        }
        Ok((reg, ty))
    }

    /// Push a produced value, converted to the analyzed push type
    fn push(&mut self, ip: u32, reg: Register, ty: StackType) -> Result<()> {
        let target = self.analysis.push_type(ip).ok_or_else(|| {
            Error::internal(format!("no push type recorded for offset {}", ip))
        })?;
        let reg = self.convert(reg, ty, target);
        self.stack.push((reg, target));
        Ok(())
    }

    fn sync_stacks(&mut self) {
        let entries: Vec<(Register, StackType)> = self.stack.drain(..).collect();
        for (reg, _) in entries {
            self.push_ir(NativeIR::PushDynamic(reg));
        }
    }

    fn release_stack(&mut self) {
        let entries: Vec<(Register, StackType)> = self.stack.drain(..).collect();
        for (reg, _) in entries {
            self.push_ir(NativeIR::Release(reg));
        }
    }

    // ==================== Static locals ====================

    fn local_slot(&self, index: u32) -> Result<usize> {
        let slot = index as usize;
        if slot >= self.locals.len() {
            return Err(Error::internal(format!("local {} out of range", index)));
        }
        Ok(slot)
    }

    fn entry_slot(&mut self, block: u32, local: u32) -> Register {
        if let Some(&reg) = self.entry_slots.get(&(block, local)) {
            return reg;
        }
        let reg = self.fresh();
        self.entry_slots.insert((block, local), reg);
        reg
    }

    /// Write a local back to memory and forget its register
    fn flush_local(&mut self, slot: usize) {
        match self.locals[slot].take() {
            Some(local) if local.dirty => self.push_ir(NativeIR::StoreLocal {
                local: slot as u32,
                src: local.reg,
            }),
            Some(local) => self.push_ir(NativeIR::Release(local.reg)),
            None => {}
        }
    }

    fn release_locals(&mut self) {
        for slot in 0..self.locals.len() {
            if let Some(local) = self.locals[slot].take() {
                self.push_ir(NativeIR::Release(local.reg));
            }
        }
    }

    fn prologue(&mut self, block: &BlockInfo) {
        self.locals = vec![None; self.locals.len()];
        for (i, &ty) in block.locals_start.iter().enumerate() {
            if ty == StackType::None {
                continue;
            }
            let local = if block.start == 0 {
                let loaded = self.fresh();
                self.push_ir(NativeIR::LoadLocal {
                    dst: loaded,
                    local: i as u32,
                });
                let reg = self.convert(loaded, StackType::Object, ty);
                StaticLocal {
                    reg,
                    ty,
                    dirty: false,
                }
            } else {
                let slot = self.entry_slot(block.start, i as u32);
                let reg = self.fresh();
                self.push_ir(NativeIR::Move { dst: reg, src: slot });
                StaticLocal {
                    reg,
                    ty,
                    dirty: true,
                }
            };
            self.locals[i] = Some(local);
        }
    }

    /// Shape the locals for entry into `dest` without changing the
    /// emitter's view, so sibling edges start from the same state
    fn sync_locals(&mut self, dest: u32) -> Result<()> {
        let analysis = self.analysis;
        let target = analysis
            .block(dest)
            .ok_or_else(|| Error::internal(format!("edge to missing block {}", dest)))?;
        for i in 0..self.locals.len() {
            let local = self.locals[i];
            let start = target.locals_start[i];
            if target.locals_reset[i] {
                if let Some(l) = local {
                    self.push_ir(NativeIR::Release(l.reg));
                }
                continue;
            }
            if start == StackType::None {
                match local {
                    Some(l) if l.dirty => self.push_ir(NativeIR::StoreLocal {
                        local: i as u32,
                        src: l.reg,
                    }),
                    Some(l) => self.push_ir(NativeIR::Release(l.reg)),
                    None => {}
                }
                continue;
            }
            let Some(l) = local else {
                return Err(Error::internal(format!(
                    "local {} is in memory but block {} expects {}",
                    i, dest, start
                )));
            };
            if l.ty != start {
                return Err(Error::internal(format!(
                    "local {} is {} but block {} expects {}",
                    i, l.ty, dest, start
                )));
            }
            if dest == 0 {
                if l.dirty {
                    self.push_ir(NativeIR::StoreLocal {
                        local: i as u32,
                        src: l.reg,
                    });
                } else {
                    self.push_ir(NativeIR::Release(l.reg));
                }
            } else {
                let slot = self.entry_slot(dest, i as u32);
                self.push_ir(NativeIR::Move { dst: slot, src: l.reg });
            }
        }
        Ok(())
    }

    /// Epilogue of one control-flow edge
    fn edge(&mut self, dest: u32) -> Result<()> {
        if self.analysis.block(dest).is_none() {
            self.push_ir(NativeIR::Trap {
                message: "unexpected end of code".into(),
                offset: dest,
            });
            return Ok(());
        }
        self.sync_locals(dest)?;
        let label = self.block_label(dest)?;
        self.push_ir(NativeIR::Jump(label));
        Ok(())
    }

    // ==================== Blocks ====================

    fn emit_method(&mut self) -> Result<()> {
        let analysis = self.analysis;
        let entry = self.block_label(0)?;
        let mut handlers = Vec::new();
        for exception in &self.method.body.exceptions {
            if !handlers.iter().any(|(target, _)| *target == exception.target) {
                handlers.push((exception.target, self.block_label(exception.target)?));
            }
        }
        self.push_ir(NativeIR::EntryDispatch { entry, handlers });

        for block in analysis.blocks.values() {
            self.emit_block(block)?;
        }
        Ok(())
    }

    fn emit_block(&mut self, block: &BlockInfo) -> Result<()> {
        let analysis = self.analysis;
        let label = self.block_label(block.start)?;
        self.bind(label);
        self.stack.clear();
        self.prologue(block);

        let instructions = analysis.instructions_of(block);
        let Some(last) = instructions.last() else {
            self.push_ir(NativeIR::Trap {
                message: "unexpected end of code".into(),
                offset: block.end,
            });
            return Ok(());
        };
        for instr in instructions {
            if self.has_exceptions {
                self.push_ir(NativeIR::SetExecPos(instr.offset));
            }
            trace!(
                offset = instr.offset,
                opcode = %instr.opcode,
                static_stack = self.stack.len(),
                "emit"
            );
            self.pops = 0;
            self.emit_instruction(instr)?;
        }

        if !last.opcode.is_branch() && !last.opcode.is_terminator() {
            self.sync_stacks();
            self.edge(block.end)?;
        }
        Ok(())
    }

    fn emit_instruction(&mut self, instr: &Instruction) -> Result<()> {
        match lowering(instr.opcode) {
            Lowering::Native => self.emit_native(instr),
            Lowering::Generic(push) => {
                self.sync_stacks();
                for local in memory_locals(instr)? {
                    let slot = self.local_slot(local)?;
                    self.flush_local(slot);
                }
                self.push_ir(NativeIR::Generic(instr.clone()));
                if push.is_some() {
                    let reg = self.fresh();
                    self.push_ir(NativeIR::PopDynamic(reg));
                    self.push(instr.offset, reg, StackType::Object)?;
                }
                Ok(())
            }
        }
    }

    // ==================== Native lowering ====================

    fn emit_native(&mut self, instr: &Instruction) -> Result<()> {
        use Opcode::*;
        use StackType as T;
        let ip = instr.offset;
        match instr.opcode {
            Bkpt | Nop | Label | Debug | DebugLine | DebugFile => {}

            // ========== Constants ==========
            PushByte => {
                let Operands::Byte(value) = instr.operands else {
                    return Err(Error::internal("pushbyte without a byte operand"));
                };
                self.load_int(ip, i32::from(value))?;
            }
            PushShort => self.load_int(ip, instr.index()? as i32)?,
            PushInt => {
                let value = self.pool.get_integer(instr.index()?)?;
                self.load_int(ip, value)?;
            }
            PushUInt => {
                let value = self.pool.get_uinteger(instr.index()?)?;
                let dst = self.fresh();
                self.push_ir(NativeIR::LoadUInt { dst, value });
                self.push(ip, dst, T::UInt)?;
            }
            PushDouble => {
                let value = self.pool.get_double(instr.index()?)?;
                self.load_number(ip, value)?;
            }
            PushNaN => self.load_number(ip, f64::NAN)?,
            PushTrue | PushFalse => {
                let dst = self.fresh();
                self.push_ir(NativeIR::LoadBool {
                    dst,
                    value: instr.opcode == PushTrue,
                });
                self.push(ip, dst, T::Boolean)?;
            }
            PushNull => self.load_const(ip, Constant::Null)?,
            PushUndefined => self.load_const(ip, Constant::Undefined)?,
            PushString => self.load_const(ip, Constant::String(instr.index()?))?,
            PushNamespace => self.load_const(ip, Constant::Namespace(instr.index()?))?,

            // ========== Stack ==========
            Pop => {
                let (reg, _) = self.pop(ip)?;
                self.push_ir(NativeIR::Release(reg));
            }
            Dup => {
                let (reg, ty) = self.pop(ip)?;
                let copy = self.fresh();
                self.push_ir(NativeIR::Retain { dst: copy, src: reg });
                self.stack.push((reg, ty));
                self.stack.push((copy, ty));
            }
            Swap => {
                let b = self.pop(ip)?;
                let a = self.pop(ip)?;
                self.stack.push(b);
                self.stack.push(a);
            }

            // ========== Locals ==========
            GetLocal | GetLocal0 | GetLocal1 | GetLocal2 | GetLocal3 => {
                let slot = self.local_slot(instr.local_index()?)?;
                let local = match self.locals[slot] {
                    Some(local) => local,
                    None => {
                        let reg = self.fresh();
                        self.push_ir(NativeIR::LoadLocal {
                            dst: reg,
                            local: slot as u32,
                        });
                        let local = StaticLocal {
                            reg,
                            ty: T::Object,
                            dirty: false,
                        };
                        self.locals[slot] = Some(local);
                        local
                    }
                };
                let copy = self.fresh();
                self.push_ir(NativeIR::Retain {
                    dst: copy,
                    src: local.reg,
                });
                self.push(ip, copy, local.ty)?;
            }
            SetLocal | SetLocal0 | SetLocal1 | SetLocal2 | SetLocal3 => {
                let slot = self.local_slot(instr.local_index()?)?;
                let (reg, ty) = self.pop(ip)?;
                if let Some(old) = self.locals[slot].take() {
                    self.push_ir(NativeIR::Release(old.reg));
                }
                self.locals[slot] = Some(StaticLocal {
                    reg,
                    ty,
                    dirty: true,
                });
            }
            Kill => {
                let slot = self.local_slot(instr.index()?)?;
                if let Some(old) = self.locals[slot].take() {
                    self.push_ir(NativeIR::Release(old.reg));
                }
                self.push_ir(NativeIR::ClearLocal(slot as u32));
            }

            // ========== Arithmetic ==========
            Add => {
                let (a, b) = self.pop_pair(ip)?;
                if a.1 == T::Object || b.1 == T::Object {
                    let dst = self.call_helper(Helper::Add, vec![a.0, b.0]);
                    self.push(ip, dst, T::Object)?;
                } else {
                    self.float_op(ip, FloatOp::Add, a, b)?;
                }
            }
            Subtract | Multiply => {
                let (a, b) = self.pop_pair(ip)?;
                let (float_op, helper) = if instr.opcode == Subtract {
                    (FloatOp::Sub, Helper::Subtract)
                } else {
                    (FloatOp::Mul, Helper::Multiply)
                };
                // int operands widen to Number
                if a.1 == T::Object || b.1 == T::Object {
                    let dst = self.call_helper(helper, vec![a.0, b.0]);
                    self.push(ip, dst, T::Object)?;
                } else {
                    self.float_op(ip, float_op, a, b)?;
                }
            }
            Divide | Modulo => {
                let (a, b) = self.pop_pair(ip)?;
                let (float_op, helper) = if instr.opcode == Divide {
                    (FloatOp::Div, Helper::Divide)
                } else {
                    (FloatOp::Mod, Helper::Modulo)
                };
                if a.1 == T::Object || b.1 == T::Object {
                    let dst = self.call_helper(helper, vec![a.0, b.0]);
                    self.push(ip, dst, T::Object)?;
                } else {
                    self.float_op(ip, float_op, a, b)?;
                }
            }
            AddI | SubtractI | MultiplyI => {
                let (a, b) = self.pop_pair(ip)?;
                let (int_op, helper) = match instr.opcode {
                    AddI => (IntOp::Add, Helper::AddI),
                    SubtractI => (IntOp::Sub, Helper::SubtractI),
                    _ => (IntOp::Mul, Helper::MultiplyI),
                };
                if a.1 == T::Object || b.1 == T::Object {
                    let dst = self.call_helper(helper, vec![a.0, b.0]);
                    self.push(ip, dst, T::Object)?;
                } else {
                    self.int_op(ip, int_op, a, b)?;
                }
            }
            Negate => {
                let (reg, ty) = self.pop(ip)?;
                if ty == T::Object {
                    let dst = self.call_helper(Helper::Negate, vec![reg]);
                    self.push(ip, dst, T::Object)?;
                } else {
                    let src = self.convert(reg, ty, T::Number);
                    self.unary(ip, UnaryOp::FloatNeg, src, T::Number)?;
                }
            }
            NegateI => {
                let (reg, ty) = self.pop(ip)?;
                if ty == T::Object {
                    let dst = self.call_helper(Helper::NegateI, vec![reg]);
                    self.push(ip, dst, T::Object)?;
                } else {
                    let src = self.convert(reg, ty, T::Int);
                    self.unary(ip, UnaryOp::IntNeg, src, T::Int)?;
                }
            }
            Increment | Decrement => {
                let (reg, ty) = self.pop(ip)?;
                let (float_op, helper) = if instr.opcode == Increment {
                    (FloatOp::Add, Helper::Increment)
                } else {
                    (FloatOp::Sub, Helper::Decrement)
                };
                if ty == T::Object {
                    let dst = self.call_helper(helper, vec![reg]);
                    self.push(ip, dst, T::Object)?;
                } else {
                    let one = self.fresh();
                    self.push_ir(NativeIR::LoadNumber { dst: one, value: 1.0 });
                    self.float_op(ip, float_op, (reg, ty), (one, T::Number))?;
                }
            }
            IncrementI | DecrementI => {
                let (reg, ty) = self.pop(ip)?;
                let (int_op, helper) = if instr.opcode == IncrementI {
                    (IntOp::Add, Helper::IncrementI)
                } else {
                    (IntOp::Sub, Helper::DecrementI)
                };
                if ty == T::Object {
                    let dst = self.call_helper(helper, vec![reg]);
                    self.push(ip, dst, T::Object)?;
                } else {
                    let one = self.fresh();
                    self.push_ir(NativeIR::LoadInt { dst: one, value: 1 });
                    self.int_op(ip, int_op, (reg, ty), (one, T::Int))?;
                }
            }

            // ========== Bit operations ==========
            LShift | RShift | URShift | BitAnd | BitOr | BitXor => {
                let (a, b) = self.pop_pair(ip)?;
                let op = match instr.opcode {
                    LShift => IntOp::Shl,
                    RShift => IntOp::Shr,
                    URShift => IntOp::UShr,
                    BitAnd => IntOp::And,
                    BitOr => IntOp::Or,
                    _ => IntOp::Xor,
                };
                self.int_op(ip, op, a, b)?;
            }
            BitNot => {
                let (reg, ty) = self.pop(ip)?;
                let src = self.convert(reg, ty, T::Int);
                self.unary(ip, UnaryOp::IntNot, src, T::Int)?;
            }
            Not => {
                let (reg, ty) = self.pop(ip)?;
                let src = self.convert(reg, ty, T::Boolean);
                self.unary(ip, UnaryOp::BoolNot, src, T::Boolean)?;
            }

            // ========== Comparison ==========
            Equals | StrictEquals | LessThan | LessEquals | GreaterThan | GreaterEquals => {
                let (a, b) = self.pop_pair(ip)?;
                let helper = match instr.opcode {
                    Equals => Helper::Equals,
                    StrictEquals => Helper::StrictEquals,
                    LessThan => Helper::LessThan,
                    LessEquals => Helper::LessEquals,
                    GreaterThan => Helper::GreaterThan,
                    _ => Helper::GreaterEquals,
                };
                let dst = self.compare(helper, a, b)?;
                self.push(ip, dst, T::Boolean)?;
            }

            // ========== Conversion ==========
            ConvertS | CoerceS | EscXAttr | TypeOf => {
                let (reg, _) = self.pop(ip)?;
                let helper = match instr.opcode {
                    ConvertS => Helper::ConvertS,
                    CoerceS => Helper::CoerceS,
                    EscXAttr => Helper::EscXAttr,
                    _ => Helper::TypeOf,
                };
                let dst = self.call_helper(helper, vec![reg]);
                self.push(ip, dst, T::Object)?;
            }
            ConvertI | CoerceI => self.convert_to(ip, T::Int)?,
            ConvertU | CoerceU => self.convert_to(ip, T::UInt)?,
            ConvertD | CoerceD => self.convert_to(ip, T::Number)?,
            ConvertB | CoerceB => self.convert_to(ip, T::Boolean)?,
            CoerceA => {
                let (reg, ty) = self.pop(ip)?;
                self.push(ip, reg, ty)?;
            }
            ConvertO | CoerceO => {
                let (reg, ty) = self.pop(ip)?;
                if ty == T::Object {
                    let helper = if instr.opcode == ConvertO {
                        Helper::ConvertO
                    } else {
                        Helper::CoerceO
                    };
                    let dst = self.call_helper(helper, vec![reg]);
                    self.push(ip, dst, T::Object)?;
                } else {
                    self.push(ip, reg, ty)?;
                }
            }

            // ========== Control flow ==========
            Jump => {
                self.sync_stacks();
                self.edge(instr.branch_target()?)?;
            }
            IfTrue | IfFalse => {
                let (reg, ty) = self.pop(ip)?;
                self.sync_stacks();
                let cond = self.convert(reg, ty, T::Boolean);
                self.branch(cond, instr.opcode == IfTrue, instr)?;
            }
            IfEq | IfNe | IfLt | IfLe | IfGt | IfGe | IfNlt | IfNle | IfNgt | IfNge
            | IfStrictEq | IfStrictNe => {
                let (a, b) = self.pop_pair(ip)?;
                self.sync_stacks();
                let (helper, negated) = branch_comparison(instr.opcode)?;
                let cond = self.compare(helper, a, b)?;
                self.branch(cond, !negated, instr)?;
            }
            LookupSwitch => {
                let (reg, ty) = self.pop(ip)?;
                self.sync_stacks();
                let index = self.convert(reg, ty, T::Int);
                self.switch(index, instr)?;
            }
            ReturnVoid => {
                self.release_stack();
                self.release_locals();
                self.push_ir(NativeIR::ReturnVoid);
            }
            ReturnValue => {
                let (reg, _) = self.pop(ip)?;
                self.release_stack();
                self.release_locals();
                self.push_ir(NativeIR::Return(reg));
            }
            Throw => {
                let (reg, _) = self.pop(ip)?;
                self.release_stack();
                // a handler may still read the locals
                if !self.has_exceptions {
                    self.release_locals();
                }
                self.push_ir(NativeIR::Throw(reg));
            }

            op => {
                return Err(Error::internal(format!(
                    "{} has no native lowering",
                    op
                )))
            }
        }
        Ok(())
    }

    fn pop_pair(
        &mut self,
        ip: u32,
    ) -> Result<((Register, StackType), (Register, StackType))> {
        let b = self.pop(ip)?;
        let a = self.pop(ip)?;
        Ok((a, b))
    }

    fn load_int(&mut self, ip: u32, value: i32) -> Result<()> {
        let dst = self.fresh();
        self.push_ir(NativeIR::LoadInt { dst, value });
        self.push(ip, dst, StackType::Int)
    }

    fn load_number(&mut self, ip: u32, value: f64) -> Result<()> {
        let dst = self.fresh();
        self.push_ir(NativeIR::LoadNumber { dst, value });
        self.push(ip, dst, StackType::Number)
    }

    fn load_const(&mut self, ip: u32, constant: Constant) -> Result<()> {
        let dst = self.fresh();
        self.push_ir(NativeIR::LoadConst { dst, constant });
        self.push(ip, dst, StackType::Object)
    }

    fn int_op(
        &mut self,
        ip: u32,
        op: IntOp,
        a: (Register, StackType),
        b: (Register, StackType),
    ) -> Result<()> {
        let ra = self.convert(a.0, a.1, StackType::Int);
        let rb = self.convert(b.0, b.1, StackType::Int);
        let dst = self.fresh();
        self.push_ir(NativeIR::IntOp { dst, op, a: ra, b: rb });
        let ty = if op == IntOp::UShr {
            StackType::UInt
        } else {
            StackType::Int
        };
        self.push(ip, dst, ty)
    }

    fn float_op(
        &mut self,
        ip: u32,
        op: FloatOp,
        a: (Register, StackType),
        b: (Register, StackType),
    ) -> Result<()> {
        let ra = self.convert(a.0, a.1, StackType::Number);
        let rb = self.convert(b.0, b.1, StackType::Number);
        let dst = self.fresh();
        self.push_ir(NativeIR::FloatOp { dst, op, a: ra, b: rb });
        self.push(ip, dst, StackType::Number)
    }

    fn unary(&mut self, ip: u32, op: UnaryOp, src: Register, ty: StackType) -> Result<()> {
        let dst = self.fresh();
        self.push_ir(NativeIR::Unary { dst, op, src });
        self.push(ip, dst, ty)
    }

    fn convert_to(&mut self, ip: u32, ty: StackType) -> Result<()> {
        let (reg, from) = self.pop(ip)?;
        let reg = self.convert(reg, from, ty);
        self.push(ip, reg, ty)
    }

    /// Boolean register holding `a <helper> b`
    fn compare(
        &mut self,
        helper: Helper,
        a: (Register, StackType),
        b: (Register, StackType),
    ) -> Result<Register> {
        let native = if helper == Helper::StrictEquals {
            (is_numeric(a.1) && is_numeric(b.1))
                || (a.1 == StackType::Boolean && b.1 == StackType::Boolean)
        } else {
            a.1 != StackType::Object && b.1 != StackType::Object
        };
        if native {
            let ra = self.convert(a.0, a.1, StackType::Number);
            let rb = self.convert(b.0, b.1, StackType::Number);
            let dst = self.fresh();
            self.push_ir(NativeIR::Compare {
                dst,
                op: compare_op(helper)?,
                a: ra,
                b: rb,
            });
            Ok(dst)
        } else {
            let result = self.call_helper(helper, vec![a.0, b.0]);
            Ok(self.convert(result, StackType::Object, StackType::Boolean))
        }
    }

    fn branch(&mut self, cond: Register, when_true: bool, instr: &Instruction) -> Result<()> {
        let cond = if when_true {
            cond
        } else {
            let dst = self.fresh();
            self.push_ir(NativeIR::Unary {
                dst,
                op: UnaryOp::BoolNot,
                src: cond,
            });
            dst
        };
        let (taken, fallthrough) = (self.new_label(), self.new_label());
        self.push_ir(NativeIR::Branch {
            cond,
            if_true: taken,
            if_false: fallthrough,
        });
        self.bind(taken);
        self.edge(instr.branch_target()?)?;
        self.bind(fallthrough);
        self.edge(instr.next)
    }

    fn switch(&mut self, index: Register, instr: &Instruction) -> Result<()> {
        let Operands::Switch { default, cases } = &instr.operands else {
            return Err(Error::internal("lookupswitch without switch operands"));
        };
        let mut edges: BTreeMap<u32, Label> = BTreeMap::new();
        for &target in cases.iter().chain(std::iter::once(default)) {
            if !edges.contains_key(&target) {
                let label = self.new_label();
                edges.insert(target, label);
            }
        }
        let case_labels = cases.iter().map(|t| edges[t]).collect();
        self.push_ir(NativeIR::Switch {
            index,
            cases: case_labels,
            default: edges[default],
        });
        for (target, label) in edges {
            self.bind(label);
            self.edge(target)?;
        }
        Ok(())
    }

    // ==================== Finish ====================

    fn finish(self) -> Result<LoweredMethod> {
        let labels = self
            .labels
            .iter()
            .enumerate()
            .map(|(label, pos)| {
                pos.ok_or_else(|| Error::internal(format!("label L{} was never bound", label)))
            })
            .collect::<Result<Vec<usize>>>()?;

        let mut handler_resets = HashMap::default();
        for exception in &self.method.body.exceptions {
            if let Some(block) = self.analysis.block(exception.target) {
                let dead: Vec<u32> = block
                    .locals_reset
                    .iter()
                    .enumerate()
                    .filter(|(_, reset)| **reset)
                    .map(|(i, _)| i as u32)
                    .collect();
                handler_resets.insert(exception.target, dead);
            }
        }

        debug!(
            method = %self.method.name,
            ir = self.ir.len(),
            registers = self.next_register,
            "lowered method"
        );
        Ok(LoweredMethod {
            name: self.method.name.clone(),
            ir: self.ir,
            labels,
            register_count: self.next_register,
            unwind: self.unwind,
            handler_resets,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{CodeBuilder, ConstantPoolData, ExceptionInfo, MethodBody, ParamType};
    use crate::jit::analysis::analyze;

    fn compile(method: &MethodInfo) -> LoweredMethod {
        let analysis = analyze(method).unwrap();
        emit(method, &analysis, &ConstantPoolData::new()).unwrap()
    }

    fn method(b: &mut CodeBuilder, locals: u32) -> MethodInfo {
        MethodInfo::new("m", MethodBody::new(b.finish().unwrap(), 8, locals))
    }

    fn count(compiled: &LoweredMethod, pred: impl Fn(&NativeIR) -> bool) -> usize {
        compiled.ir.iter().filter(|ir| pred(ir)).count()
    }

    #[test]
    fn test_int_subtract_widens_to_float() {
        let mut b = CodeBuilder::new();
        b.push_byte(5).push_byte(3).op(Opcode::Subtract).op(Opcode::ReturnValue);
        let compiled = compile(&method(&mut b, 1));
        assert_eq!(
            count(&compiled, |ir| matches!(ir, NativeIR::IntOp { .. })),
            0
        );
        assert_eq!(
            count(&compiled, |ir| matches!(ir, NativeIR::FloatOp { op: FloatOp::Sub, .. })),
            1
        );
        assert_eq!(count(&compiled, |ir| matches!(ir, NativeIR::CallHelper { .. })), 0);
        assert_eq!(count(&compiled, |ir| matches!(ir, NativeIR::PushDynamic(_))), 0);
    }

    #[test]
    fn test_object_operand_uses_helper() {
        let mut b = CodeBuilder::new();
        b.get_local(1).push_byte(3).op(Opcode::Subtract).op(Opcode::ReturnValue);
        let compiled = compile(&method(&mut b, 2));
        assert_eq!(
            count(&compiled, |ir| matches!(
                ir,
                NativeIR::CallHelper {
                    helper: Helper::Subtract,
                    ..
                }
            )),
            1
        );
    }

    #[test]
    fn test_typed_param_is_unboxed_on_entry() {
        let mut b = CodeBuilder::new();
        b.get_local(1).get_local(1).op(Opcode::Multiply).op(Opcode::ReturnValue);
        let m = method(&mut b, 2).with_params(vec![ParamType::Int]);
        let compiled = compile(&m);
        assert!(compiled.ir.contains(&NativeIR::LoadLocal { dst: 0, local: 1 }));
        assert!(compiled.ir.contains(&NativeIR::Convert {
            dst: 1,
            src: 0,
            ty: StackType::Int
        }));
        assert_eq!(
            count(&compiled, |ir| matches!(ir, NativeIR::FloatOp { op: FloatOp::Mul, .. })),
            1
        );
    }

    #[test]
    fn test_multiply_i_stays_int() {
        let mut b = CodeBuilder::new();
        b.get_local(1).get_local(1).op(Opcode::MultiplyI).op(Opcode::ReturnValue);
        let m = method(&mut b, 2).with_params(vec![ParamType::Int]);
        let compiled = compile(&m);
        assert_eq!(
            count(&compiled, |ir| matches!(ir, NativeIR::IntOp { op: IntOp::Mul, .. })),
            1
        );
    }

    #[test]
    fn test_generic_op_syncs_the_stack() {
        let mut b = CodeBuilder::new();
        b.push_byte(1)
            .push_byte(2)
            .op_u30(Opcode::NewArray, 2)
            .op(Opcode::ReturnValue);
        let compiled = compile(&method(&mut b, 1));
        let pushes = count(&compiled, |ir| matches!(ir, NativeIR::PushDynamic(_)));
        assert_eq!(pushes, 2);
        assert!(compiled
            .ir
            .iter()
            .any(|ir| matches!(ir, NativeIR::Generic(i) if i.opcode == Opcode::NewArray)));
    }

    #[test]
    fn test_join_with_disagreeing_types_goes_through_memory() {
        let mut b = CodeBuilder::new();
        let (other, join) = (b.new_label(), b.new_label());
        b.get_local(1).branch(Opcode::IfTrue, other);
        b.push_byte(1).set_local(2).jump(join);
        b.bind(other).op(Opcode::PushNull).set_local(2);
        b.bind(join).get_local(2).op(Opcode::ReturnValue);
        let compiled = compile(&method(&mut b, 3));
        let stores = count(&compiled, |ir| matches!(ir, NativeIR::StoreLocal { local: 2, .. }));
        assert_eq!(stores, 2);
        assert_eq!(count(&compiled, |ir| matches!(ir, NativeIR::LoadLocal { local: 2, .. })), 1);
    }

    #[test]
    fn test_join_with_agreeing_types_stays_in_registers() {
        let mut b = CodeBuilder::new();
        let (other, join) = (b.new_label(), b.new_label());
        b.get_local(1).branch(Opcode::IfTrue, other);
        b.push_byte(1).set_local(2).jump(join);
        b.bind(other).push_byte(2).set_local(2);
        b.bind(join).get_local(2).op(Opcode::ReturnValue);
        let compiled = compile(&method(&mut b, 3));
        assert_eq!(count(&compiled, |ir| matches!(ir, NativeIR::StoreLocal { local: 2, .. })), 0);
        assert_eq!(count(&compiled, |ir| matches!(ir, NativeIR::LoadLocal { local: 2, .. })), 0);
    }

    #[test]
    fn test_exec_pos_and_unwind_with_exception_table() {
        let mut b = CodeBuilder::new();
        b.push_byte(7).set_local(1).push_byte(1).op(Opcode::Throw);
        b.op(Opcode::Pop).get_local(1).op(Opcode::ReturnValue);
        let mut m = method(&mut b, 2);
        m.body = m.body.with_exceptions(vec![ExceptionInfo {
            from: 0,
            to: 6,
            target: 6,
            exc_type: 0,
            var_name: 0,
        }]);
        let compiled = compile(&m);
        assert!(compiled.ir.contains(&NativeIR::SetExecPos(5)));
        let throw = compiled
            .ir
            .iter()
            .position(|ir| matches!(ir, NativeIR::Throw(_)))
            .unwrap();
        let spilled = &compiled.unwind[&throw];
        assert_eq!(spilled.len(), 1);
        assert_eq!(spilled[0].0, 1);
        assert!(matches!(&compiled.ir[0], NativeIR::EntryDispatch { handlers, .. } if handlers.len() == 1));
    }

    #[test]
    fn test_empty_code_traps() {
        let compiled = compile(&MethodInfo::new("m", MethodBody::new(Vec::new(), 1, 1)));
        assert!(compiled
            .ir
            .iter()
            .any(|ir| matches!(ir, NativeIR::Trap { .. })));
    }

    #[test]
    fn test_falling_off_the_end_traps() {
        let mut b = CodeBuilder::new();
        b.push_byte(1).op(Opcode::Pop);
        let compiled = compile(&method(&mut b, 1));
        assert!(matches!(compiled.ir.last(), Some(NativeIR::Trap { offset: 3, .. })));
    }
}
