//! Native code generation with Cranelift
//!
//! Each [`LoweredMethod`] becomes one Cranelift function of the form
//! `extern "C" fn(*mut JitFrame) -> i32`, built through a `FunctionBuilder`
//! and linked in its own `JITModule`. Registers with a primitive type are
//! Cranelift variables, so int, uint, number and boolean arithmetic runs
//! unboxed in machine registers. Object registers live in the frame and are
//! only touched through the callbacks in [`executor`](super::executor).
//!
//! A callback returns a nonzero status when it fails. Every fallible call
//! site branches on that status to a shared exit block, or first to an
//! unwind block for its IR position that boxes and spills the locals the
//! emitter recorded as register-resident there.

use super::executor::{self as rt, JitFrame, INT_OUT_OFFSET, NUMBER_OUT_OFFSET};
use super::ir::{CompareOp, FloatOp, IntOp, Label, LoweredMethod, NativeIR, Register, UnaryOp};
use crate::error::{Error, Result};
use crate::runtime::StackType;
use cranelift_codegen::ir::condcodes::{FloatCC, IntCC};
use cranelift_codegen::ir::{types, AbiParam, Block, FuncRef, InstBuilder, MemFlags, Signature, Type, Value};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext, Switch, Variable};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{Linkage, Module};
use rustc_hash::FxHashMap as HashMap;
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// Finalized machine code for one method, with the module that owns it
pub struct MachineCode {
    module: Option<JITModule>,
    entry: *const u8,
}

// SAFETY: the code behind `entry` is immutable once finalized and reads no
// thread-local state; the module is only touched again when it is dropped.
unsafe impl Send for MachineCode {}
// SAFETY: see above; `invoke` takes `&self` and never mutates the module.
unsafe impl Sync for MachineCode {}

impl MachineCode {
    /// Run the code on `frame`; nonzero means the frame holds the error
    pub(crate) fn invoke(&self, frame: &mut JitFrame<'_>) -> i32 {
        // SAFETY: `entry` was finalized from a function declared with exactly
        // this signature and stays mapped while `self.module` is alive.
        let entry = unsafe {
            std::mem::transmute::<*const u8, unsafe extern "C" fn(*mut JitFrame<'_>) -> i32>(
                self.entry,
            )
        };
        // SAFETY: the frame outlives the call and callbacks only see it
        // through the pointer passed here.
        unsafe { entry(frame) }
    }
}

impl Drop for MachineCode {
    fn drop(&mut self) {
        if let Some(module) = self.module.take() {
            // SAFETY: `entry` is not reachable once `self` is gone.
            unsafe { module.free_memory() };
        }
    }
}

impl fmt::Debug for MachineCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachineCode")
            .field("entry", &self.entry)
            .finish_non_exhaustive()
    }
}

/// Runtime routines the generated code imports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Callback {
    ExecPos,
    SetExecPos,
    Fail,
    LoadConst,
    Move,
    Retain,
    Release,
    BoxInt,
    BoxUInt,
    BoxNumber,
    BoxBool,
    UnboxInt,
    UnboxUInt,
    UnboxNumber,
    UnboxBool,
    Push,
    Pop,
    LoadLocal,
    StoreLocal,
    SpillLocal,
    ClearLocal,
    CallHelper,
    Generic,
    Throw,
    SetResult,
    Fmod,
    ToInt32,
}

impl Callback {
    pub(crate) const ALL: [Callback; 27] = [
        Callback::ExecPos,
        Callback::SetExecPos,
        Callback::Fail,
        Callback::LoadConst,
        Callback::Move,
        Callback::Retain,
        Callback::Release,
        Callback::BoxInt,
        Callback::BoxUInt,
        Callback::BoxNumber,
        Callback::BoxBool,
        Callback::UnboxInt,
        Callback::UnboxUInt,
        Callback::UnboxNumber,
        Callback::UnboxBool,
        Callback::Push,
        Callback::Pop,
        Callback::LoadLocal,
        Callback::StoreLocal,
        Callback::SpillLocal,
        Callback::ClearLocal,
        Callback::CallHelper,
        Callback::Generic,
        Callback::Throw,
        Callback::SetResult,
        Callback::Fmod,
        Callback::ToInt32,
    ];

    pub(crate) fn symbol(self) -> &'static str {
        use Callback::*;
        match self {
            ExecPos => "avm2_exec_pos",
            SetExecPos => "avm2_set_exec_pos",
            Fail => "avm2_fail",
            LoadConst => "avm2_load_const",
            Move => "avm2_move",
            Retain => "avm2_retain",
            Release => "avm2_release",
            BoxInt => "avm2_box_int",
            BoxUInt => "avm2_box_uint",
            BoxNumber => "avm2_box_number",
            BoxBool => "avm2_box_bool",
            UnboxInt => "avm2_unbox_int",
            UnboxUInt => "avm2_unbox_uint",
            UnboxNumber => "avm2_unbox_number",
            UnboxBool => "avm2_unbox_bool",
            Push => "avm2_push",
            Pop => "avm2_pop",
            LoadLocal => "avm2_load_local",
            StoreLocal => "avm2_store_local",
            SpillLocal => "avm2_spill_local",
            ClearLocal => "avm2_clear_local",
            CallHelper => "avm2_call_helper",
            Generic => "avm2_generic",
            Throw => "avm2_throw",
            SetResult => "avm2_set_result",
            Fmod => "avm2_fmod",
            ToInt32 => "avm2_to_int32",
        }
    }

    fn address(self) -> *const u8 {
        use Callback::*;
        match self {
            ExecPos => rt::avm2_exec_pos as *const u8,
            SetExecPos => rt::avm2_set_exec_pos as *const u8,
            Fail => rt::avm2_fail as *const u8,
            LoadConst => rt::avm2_load_const as *const u8,
            Move => rt::avm2_move as *const u8,
            Retain => rt::avm2_retain as *const u8,
            Release => rt::avm2_release as *const u8,
            BoxInt => rt::avm2_box_int as *const u8,
            BoxUInt => rt::avm2_box_uint as *const u8,
            BoxNumber => rt::avm2_box_number as *const u8,
            BoxBool => rt::avm2_box_bool as *const u8,
            UnboxInt => rt::avm2_unbox_int as *const u8,
            UnboxUInt => rt::avm2_unbox_uint as *const u8,
            UnboxNumber => rt::avm2_unbox_number as *const u8,
            UnboxBool => rt::avm2_unbox_bool as *const u8,
            Push => rt::avm2_push as *const u8,
            Pop => rt::avm2_pop as *const u8,
            LoadLocal => rt::avm2_load_local as *const u8,
            StoreLocal => rt::avm2_store_local as *const u8,
            SpillLocal => rt::avm2_spill_local as *const u8,
            ClearLocal => rt::avm2_clear_local as *const u8,
            CallHelper => rt::avm2_call_helper as *const u8,
            Generic => rt::avm2_generic as *const u8,
            Throw => rt::avm2_throw as *const u8,
            SetResult => rt::avm2_set_result as *const u8,
            Fmod => rt::avm2_fmod as *const u8,
            ToInt32 => rt::avm2_to_int32 as *const u8,
        }
    }

    /// Add this callback's parameters and returns to `sig`
    fn signature(self, mut sig: Signature, pointer: Type) -> Signature {
        use Callback::*;
        let frame = AbiParam::new(pointer);
        let int = AbiParam::new(types::I32);
        let float = AbiParam::new(types::F64);
        let (params, returns) = match self {
            ExecPos => (vec![frame], vec![int]),
            SetExecPos => (vec![frame, int], vec![]),
            Fail | LoadConst | Release | UnboxInt | UnboxUInt | UnboxNumber | UnboxBool | Push
            | Pop | ClearLocal | CallHelper | Generic | Throw | SetResult => {
                (vec![frame, int], vec![int])
            }
            Move | Retain | LoadLocal | StoreLocal | BoxInt | BoxUInt | BoxBool => {
                (vec![frame, int, int], vec![int])
            }
            BoxNumber => (vec![frame, int, float], vec![int]),
            SpillLocal => (vec![frame, int, int], vec![]),
            Fmod => (vec![float, float], vec![float]),
            ToInt32 => (vec![float], vec![int]),
        };
        sig.params.extend(params);
        sig.returns.extend(returns);
        sig
    }
}

/// Compile `method` to machine code for the host
pub fn generate(method: &LoweredMethod) -> Result<MachineCode> {
    let reg_types = register_types(method)?;
    let mut module = host_module()?;
    match define(&mut module, method, &reg_types) {
        Ok(entry) => {
            debug!(method = %method.name, registers = reg_types.len(), "generated machine code");
            Ok(MachineCode {
                module: Some(module),
                entry,
            })
        }
        Err(err) => {
            // SAFETY: no pointer into the module escaped `define`
            unsafe { module.free_memory() };
            Err(err)
        }
    }
}

fn host_module() -> Result<JITModule> {
    let mut flags = settings::builder();
    let verifier = if cfg!(debug_assertions) { "true" } else { "false" };
    for (name, value) in [
        ("use_colocated_libcalls", "false"),
        ("is_pic", "false"),
        ("opt_level", "speed"),
        ("enable_verifier", verifier),
    ] {
        flags
            .set(name, value)
            .map_err(|e| Error::unsupported(format!("code generator setting {}: {}", name, e)))?;
    }
    let isa = cranelift_native::builder()
        .map_err(|e| Error::unsupported(format!("host is not a code generation target: {}", e)))?
        .finish(settings::Flags::new(flags))
        .map_err(|e| Error::unsupported(format!("cannot configure host target: {}", e)))?;

    let mut builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
    for callback in Callback::ALL {
        builder.symbol(callback.symbol(), callback.address());
    }
    Ok(JITModule::new(builder))
}

fn define(module: &mut JITModule, method: &LoweredMethod, reg_types: &[StackType]) -> Result<*const u8> {
    let module_error = |e: cranelift_module::ModuleError| {
        Error::internal(format!("cannot generate code for {}: {}", method.name, e))
    };
    let pointer = module.target_config().pointer_type();

    let mut imports = Vec::with_capacity(Callback::ALL.len());
    for callback in Callback::ALL {
        let sig = callback.signature(module.make_signature(), pointer);
        let id = module
            .declare_function(callback.symbol(), Linkage::Import, &sig)
            .map_err(module_error)?;
        imports.push((callback, id));
    }

    let mut sig = module.make_signature();
    sig.params.push(AbiParam::new(pointer));
    sig.returns.push(AbiParam::new(types::I32));
    let id = module.declare_anonymous_function(&sig).map_err(module_error)?;

    let mut ctx = module.make_context();
    ctx.func.signature = sig;
    let mut fbc = FunctionBuilderContext::new();
    let mut builder = FunctionBuilder::new(&mut ctx.func, &mut fbc);
    let mut callbacks = HashMap::default();
    for (callback, id) in imports {
        callbacks.insert(callback, module.declare_func_in_func(id, builder.func));
    }
    translate(builder, method, reg_types, callbacks)?;

    module.define_function(id, &mut ctx).map_err(module_error)?;
    module.clear_context(&mut ctx);
    module.finalize_definitions().map_err(module_error)?;
    Ok(module.get_finalized_function(id))
}

// ==================== Register types ====================

/// Type each register holds, from its definitions
///
/// Copies take the type of their source, so this iterates until no new
/// register gets a type. Registers never defined are treated as objects.
pub(crate) fn register_types(method: &LoweredMethod) -> Result<Vec<StackType>> {
    let mut reg_types = vec![StackType::None; method.register_count as usize];
    loop {
        let mut changed = false;
        for (pos, ir) in method.ir.iter().enumerate() {
            let Some((dst, ty)) = definition(ir, &reg_types) else {
                continue;
            };
            if ty == StackType::None {
                continue;
            }
            let slot = reg_types.get_mut(dst as usize).ok_or_else(|| {
                Error::internal(format!("IR {} defines r{} past the register count", pos, dst))
            })?;
            if *slot == StackType::None {
                *slot = ty;
                changed = true;
            } else if *slot != ty {
                return Err(Error::internal(format!(
                    "r{} is defined as both {} and {} (IR {})",
                    dst, slot, ty, pos
                )));
            }
        }
        if !changed {
            break;
        }
    }
    for ty in &mut reg_types {
        if *ty == StackType::None {
            *ty = StackType::Object;
        }
    }
    Ok(reg_types)
}

fn definition(ir: &NativeIR, reg_types: &[StackType]) -> Option<(Register, StackType)> {
    let copied = |src: Register| reg_types.get(src as usize).copied().unwrap_or(StackType::None);
    Some(match ir {
        NativeIR::LoadInt { dst, .. } => (*dst, StackType::Int),
        NativeIR::LoadUInt { dst, .. } => (*dst, StackType::UInt),
        NativeIR::LoadNumber { dst, .. } => (*dst, StackType::Number),
        NativeIR::LoadBool { dst, .. } => (*dst, StackType::Boolean),
        NativeIR::LoadConst { dst, .. }
        | NativeIR::LoadLocal { dst, .. }
        | NativeIR::CallHelper { dst, .. } => (*dst, StackType::Object),
        NativeIR::PopDynamic(dst) => (*dst, StackType::Object),
        NativeIR::Move { dst, src } | NativeIR::Retain { dst, src } => (*dst, copied(*src)),
        NativeIR::Convert { dst, ty, .. } => (*dst, *ty),
        NativeIR::IntOp { dst, op: IntOp::UShr, .. } => (*dst, StackType::UInt),
        NativeIR::IntOp { dst, .. } => (*dst, StackType::Int),
        NativeIR::FloatOp { dst, .. } => (*dst, StackType::Number),
        NativeIR::Unary { dst, op, .. } => (
            *dst,
            match op {
                UnaryOp::IntNeg | UnaryOp::IntNot => StackType::Int,
                UnaryOp::FloatNeg => StackType::Number,
                UnaryOp::BoolNot => StackType::Boolean,
            },
        ),
        NativeIR::Compare { dst, .. } => (*dst, StackType::Boolean),
        _ => return None,
    })
}

fn native_type(ty: StackType) -> Option<Type> {
    match ty {
        StackType::Int | StackType::UInt => Some(types::I32),
        StackType::Number => Some(types::F64),
        StackType::Boolean => Some(types::I8),
        StackType::Object | StackType::None => None,
    }
}

fn box_callback(ty: StackType) -> Option<Callback> {
    match ty {
        StackType::Int => Some(Callback::BoxInt),
        StackType::UInt => Some(Callback::BoxUInt),
        StackType::Number => Some(Callback::BoxNumber),
        StackType::Boolean => Some(Callback::BoxBool),
        StackType::Object | StackType::None => None,
    }
}

fn float_cc(op: CompareOp) -> FloatCC {
    match op {
        CompareOp::Eq => FloatCC::Equal,
        CompareOp::Ne => FloatCC::NotEqual,
        CompareOp::Lt => FloatCC::LessThan,
        CompareOp::Le => FloatCC::LessThanOrEqual,
        CompareOp::Gt => FloatCC::GreaterThan,
        CompareOp::Ge => FloatCC::GreaterThanOrEqual,
    }
}

// ==================== Translation ====================

fn translate(
    mut builder: FunctionBuilder<'_>,
    method: &LoweredMethod,
    reg_types: &[StackType],
    callbacks: HashMap<Callback, FuncRef>,
) -> Result<()> {
    let entry = builder.create_block();
    builder.append_block_params_for_function_params(entry);
    builder.switch_to_block(entry);
    let frame = builder
        .block_params(entry)
        .first()
        .copied()
        .ok_or_else(|| Error::internal("compiled method has no frame parameter"))?;

    for (reg, &ty) in reg_types.iter().enumerate() {
        let Some(native) = native_type(ty) else {
            continue;
        };
        let var = Variable::from_u32(reg as u32);
        builder.declare_var(var, native);
        let zero = if native == types::F64 {
            builder.ins().f64const(0.0)
        } else {
            builder.ins().iconst(native, 0)
        };
        builder.def_var(var, zero);
    }

    let mut blocks = BTreeMap::new();
    for (label, &pos) in method.labels.iter().enumerate() {
        if pos > method.ir.len() {
            return Err(Error::internal(format!(
                "L{} is bound past the end of {}",
                label, method.name
            )));
        }
        blocks.entry(pos).or_insert_with(|| builder.create_block());
    }
    let fail_block = builder.create_block();

    let mut translator = Translator {
        builder,
        method,
        reg_types,
        callbacks,
        frame,
        blocks,
        fail_block,
        unwind_blocks: BTreeMap::new(),
    };
    translator.lower_body()?;
    translator.finish()
}

struct Translator<'a, 'f> {
    builder: FunctionBuilder<'f>,
    method: &'a LoweredMethod,
    reg_types: &'a [StackType],
    callbacks: HashMap<Callback, FuncRef>,
    frame: Value,
    /// Block starting at each labeled IR position
    blocks: BTreeMap<usize, Block>,
    /// Returns the failure status
    fail_block: Block,
    /// Spill paths for fallible positions with register-resident locals
    unwind_blocks: BTreeMap<usize, Block>,
}

impl<'a, 'f> Translator<'a, 'f> {
    fn lower_body(&mut self) -> Result<()> {
        let method = self.method;
        let mut terminated = false;
        for pos in 0..=method.ir.len() {
            if let Some(&block) = self.blocks.get(&pos) {
                if !terminated {
                    self.builder.ins().jump(block, &[]);
                }
                self.builder.switch_to_block(block);
                terminated = false;
            } else if terminated {
                if pos == method.ir.len() {
                    break;
                }
                let unreachable = self.builder.create_block();
                self.builder.switch_to_block(unreachable);
                terminated = false;
            }
            match method.ir.get(pos) {
                Some(ir) => terminated = self.lower(pos, ir)?,
                None => {
                    let at = self.imm(pos as u32);
                    self.call(Callback::Fail, &[self.frame, at])?;
                    self.builder.ins().jump(self.fail_block, &[]);
                }
            }
        }
        Ok(())
    }

    fn finish(mut self) -> Result<()> {
        let method = self.method;
        for (pos, block) in std::mem::take(&mut self.unwind_blocks) {
            self.builder.switch_to_block(block);
            let spills = method.unwind.get(&pos).map(Vec::as_slice).unwrap_or(&[]);
            for &(local, reg) in spills {
                let ty = self.reg_type(reg)?;
                if let Some(callback) = box_callback(ty) {
                    let value = self.abi_operand(reg, ty)?;
                    let r = self.imm(reg);
                    self.call(callback, &[self.frame, r, value])?;
                }
                let (l, r) = (self.imm(local), self.imm(reg));
                self.call(Callback::SpillLocal, &[self.frame, l, r])?;
            }
            self.builder.ins().jump(self.fail_block, &[]);
        }

        self.builder.switch_to_block(self.fail_block);
        let failed = self.builder.ins().iconst(types::I32, 1);
        self.builder.ins().return_(&[failed]);

        self.builder.seal_all_blocks();
        self.builder.finalize();
        Ok(())
    }

    // ==================== Plumbing ====================

    fn imm(&mut self, n: u32) -> Value {
        self.builder.ins().iconst(types::I32, i64::from(n))
    }

    fn call(&mut self, callback: Callback, args: &[Value]) -> Result<Option<Value>> {
        let func = self
            .callbacks
            .get(&callback)
            .copied()
            .ok_or_else(|| Error::internal(format!("{} was not imported", callback.symbol())))?;
        let inst = self.builder.ins().call(func, args);
        Ok(self.builder.inst_results(inst).first().copied())
    }

    fn fail_target(&mut self, pos: usize) -> Block {
        let spills = self.method.unwind.get(&pos).is_some_and(|s| !s.is_empty());
        if !spills {
            return self.fail_block;
        }
        if let Some(&block) = self.unwind_blocks.get(&pos) {
            return block;
        }
        let block = self.builder.create_block();
        self.unwind_blocks.insert(pos, block);
        block
    }

    /// Call a status-returning callback and leave through the failure path
    /// of `pos` when it reports an error
    fn checked(&mut self, pos: usize, callback: Callback, args: &[Value]) -> Result<()> {
        let status = self.call(callback, args)?.ok_or_else(|| {
            Error::internal(format!("{} returns no status", callback.symbol()))
        })?;
        let fail = self.fail_target(pos);
        let ok = self.builder.create_block();
        self.builder.ins().brif(status, fail, &[], ok, &[]);
        self.builder.switch_to_block(ok);
        Ok(())
    }

    fn label_block(&self, label: Label) -> Result<Block> {
        let pos = self.method.label_position(label)?;
        self.blocks
            .get(&pos)
            .copied()
            .ok_or_else(|| Error::internal(format!("L{} has no block", label)))
    }

    fn reg_type(&self, reg: Register) -> Result<StackType> {
        self.reg_types
            .get(reg as usize)
            .copied()
            .ok_or_else(|| Error::internal(format!("r{} is past the register count", reg)))
    }

    /// Current value of a primitive register, which must be `want`
    fn read(&mut self, reg: Register, want: Type) -> Result<Value> {
        let ty = self.reg_type(reg)?;
        match native_type(ty) {
            Some(native) if native == want => Ok(self.builder.use_var(Variable::from_u32(reg))),
            _ => Err(Error::internal(format!(
                "r{} holds {} where {} is required",
                reg, ty, want
            ))),
        }
    }

    fn write(&mut self, reg: Register, value: Value) -> Result<()> {
        let ty = self.reg_type(reg)?;
        let have = self.builder.func.dfg.value_type(value);
        if native_type(ty) != Some(have) {
            return Err(Error::internal(format!(
                "r{} holds {} but is assigned {}",
                reg, ty, have
            )));
        }
        self.builder.def_var(Variable::from_u32(reg), value);
        Ok(())
    }

    fn expect_object(&self, reg: Register) -> Result<()> {
        match self.reg_type(reg)? {
            StackType::Object => Ok(()),
            ty => Err(Error::internal(format!("r{} holds {} where an object is required", reg, ty))),
        }
    }

    /// Primitive register widened for a box callback
    fn abi_operand(&mut self, reg: Register, ty: StackType) -> Result<Value> {
        let native = native_type(ty)
            .ok_or_else(|| Error::internal(format!("r{} is not a primitive", reg)))?;
        let value = self.read(reg, native)?;
        Ok(if native == types::I8 {
            self.builder.ins().uextend(types::I32, value)
        } else {
            value
        })
    }

    /// Box a primitive register into its object slot
    fn materialize(&mut self, pos: usize, reg: Register) -> Result<()> {
        let ty = self.reg_type(reg)?;
        let Some(callback) = box_callback(ty) else {
            return Ok(());
        };
        let value = self.abi_operand(reg, ty)?;
        let r = self.imm(reg);
        self.checked(pos, callback, &[self.frame, r, value])
    }

    // ==================== Instructions ====================

    /// Lower one instruction; returns whether it ends its block
    fn lower(&mut self, pos: usize, ir: &NativeIR) -> Result<bool> {
        let frame = self.frame;
        let at = pos as u32;
        match ir {
            NativeIR::EntryDispatch { entry, handlers } => {
                let exec_pos = self
                    .call(Callback::ExecPos, &[frame])?
                    .ok_or_else(|| Error::internal("exec_pos callback returns nothing"))?;
                let targets = std::iter::once((0, *entry)).chain(handlers.iter().copied());
                for (target, label) in targets {
                    let block = self.label_block(label)?;
                    let next = self.builder.create_block();
                    let hit = self
                        .builder
                        .ins()
                        .icmp_imm(IntCC::Equal, exec_pos, i64::from(target));
                    self.builder.ins().brif(hit, block, &[], next, &[]);
                    self.builder.switch_to_block(next);
                }
                let p = self.imm(at);
                self.call(Callback::Fail, &[frame, p])?;
                self.builder.ins().jump(self.fail_block, &[]);
                return Ok(true);
            }
            NativeIR::SetExecPos(offset) => {
                let offset = self.imm(*offset);
                self.call(Callback::SetExecPos, &[frame, offset])?;
            }

            NativeIR::LoadInt { dst, value } => {
                let v = self.builder.ins().iconst(types::I32, i64::from(*value as u32));
                self.write(*dst, v)?;
            }
            NativeIR::LoadUInt { dst, value } => {
                let v = self.imm(*value);
                self.write(*dst, v)?;
            }
            NativeIR::LoadNumber { dst, value } => {
                let v = self.builder.ins().f64const(*value);
                self.write(*dst, v)?;
            }
            NativeIR::LoadBool { dst, value } => {
                let v = self.builder.ins().iconst(types::I8, i64::from(*value));
                self.write(*dst, v)?;
            }
            NativeIR::LoadConst { dst, .. } => {
                self.expect_object(*dst)?;
                let p = self.imm(at);
                self.checked(pos, Callback::LoadConst, &[frame, p])?;
            }

            NativeIR::Move { dst, src } | NativeIR::Retain { dst, src } => {
                let ty = self.reg_type(*src)?;
                if self.reg_type(*dst)? != ty {
                    return Err(Error::internal(format!(
                        "copy from r{} to r{} changes type at IR {}",
                        src, dst, pos
                    )));
                }
                match native_type(ty) {
                    Some(native) => {
                        let v = self.read(*src, native)?;
                        self.write(*dst, v)?;
                    }
                    None => {
                        let callback = if matches!(ir, NativeIR::Move { .. }) {
                            Callback::Move
                        } else {
                            Callback::Retain
                        };
                        let (d, s) = (self.imm(*dst), self.imm(*src));
                        self.checked(pos, callback, &[frame, d, s])?;
                    }
                }
            }
            NativeIR::Release(reg) => {
                if self.reg_type(*reg)? == StackType::Object {
                    let r = self.imm(*reg);
                    self.checked(pos, Callback::Release, &[frame, r])?;
                }
            }
            NativeIR::Convert { dst, src, ty } => self.convert(pos, *dst, *src, *ty)?,

            NativeIR::PushDynamic(reg) => {
                self.materialize(pos, *reg)?;
                let r = self.imm(*reg);
                self.checked(pos, Callback::Push, &[frame, r])?;
            }
            NativeIR::PopDynamic(dst) => {
                self.expect_object(*dst)?;
                let d = self.imm(*dst);
                self.checked(pos, Callback::Pop, &[frame, d])?;
            }
            NativeIR::LoadLocal { dst, local } => {
                self.expect_object(*dst)?;
                let (d, l) = (self.imm(*dst), self.imm(*local));
                self.checked(pos, Callback::LoadLocal, &[frame, d, l])?;
            }
            NativeIR::StoreLocal { local, src } => {
                self.materialize(pos, *src)?;
                let (l, s) = (self.imm(*local), self.imm(*src));
                self.checked(pos, Callback::StoreLocal, &[frame, l, s])?;
            }
            NativeIR::ClearLocal(local) => {
                let l = self.imm(*local);
                self.checked(pos, Callback::ClearLocal, &[frame, l])?;
            }

            NativeIR::IntOp { dst, op, a, b } => {
                let a = self.read_integral(*a)?;
                let b = self.read_integral(*b)?;
                let ins = self.builder.ins();
                let v = match op {
                    IntOp::Add => ins.iadd(a, b),
                    IntOp::Sub => ins.isub(a, b),
                    IntOp::Mul => ins.imul(a, b),
                    IntOp::And => ins.band(a, b),
                    IntOp::Or => ins.bor(a, b),
                    IntOp::Xor => ins.bxor(a, b),
                    IntOp::Shl => ins.ishl(a, b),
                    IntOp::Shr => ins.sshr(a, b),
                    IntOp::UShr => ins.ushr(a, b),
                };
                self.write(*dst, v)?;
            }
            NativeIR::FloatOp { dst, op, a, b } => {
                let a = self.read(*a, types::F64)?;
                let b = self.read(*b, types::F64)?;
                let v = match op {
                    FloatOp::Add => self.builder.ins().fadd(a, b),
                    FloatOp::Sub => self.builder.ins().fsub(a, b),
                    FloatOp::Mul => self.builder.ins().fmul(a, b),
                    FloatOp::Div => self.builder.ins().fdiv(a, b),
                    FloatOp::Mod => self
                        .call(Callback::Fmod, &[a, b])?
                        .ok_or_else(|| Error::internal("fmod returns nothing"))?,
                };
                self.write(*dst, v)?;
            }
            NativeIR::Unary { dst, op, src } => {
                let v = match op {
                    UnaryOp::IntNeg => {
                        let x = self.read_integral(*src)?;
                        self.builder.ins().ineg(x)
                    }
                    UnaryOp::IntNot => {
                        let x = self.read_integral(*src)?;
                        self.builder.ins().bnot(x)
                    }
                    UnaryOp::FloatNeg => {
                        let x = self.read(*src, types::F64)?;
                        self.builder.ins().fneg(x)
                    }
                    UnaryOp::BoolNot => {
                        let x = self.read(*src, types::I8)?;
                        self.builder.ins().bxor_imm(x, 1)
                    }
                };
                self.write(*dst, v)?;
            }
            NativeIR::Compare { dst, op, a, b } => {
                let a = self.read(*a, types::F64)?;
                let b = self.read(*b, types::F64)?;
                let v = self.builder.ins().fcmp(float_cc(*op), a, b);
                self.write(*dst, v)?;
            }

            NativeIR::CallHelper { dst, args, .. } => {
                self.expect_object(*dst)?;
                for &arg in args {
                    self.materialize(pos, arg)?;
                }
                let p = self.imm(at);
                self.checked(pos, Callback::CallHelper, &[frame, p])?;
            }
            NativeIR::Generic(_) => {
                let p = self.imm(at);
                self.checked(pos, Callback::Generic, &[frame, p])?;
            }

            NativeIR::Jump(label) => {
                let block = self.label_block(*label)?;
                self.builder.ins().jump(block, &[]);
                return Ok(true);
            }
            NativeIR::Branch {
                cond,
                if_true,
                if_false,
            } => {
                let c = self.read(*cond, types::I8)?;
                let (t, f) = (self.label_block(*if_true)?, self.label_block(*if_false)?);
                self.builder.ins().brif(c, t, &[], f, &[]);
                return Ok(true);
            }
            NativeIR::Switch {
                index,
                cases,
                default,
            } => {
                let idx = self.read_integral(*index)?;
                let mut switch = Switch::new();
                for (i, &label) in cases.iter().enumerate() {
                    switch.set_entry(i as u128, self.label_block(label)?);
                }
                let otherwise = self.label_block(*default)?;
                switch.emit(&mut self.builder, idx, otherwise);
                return Ok(true);
            }
            NativeIR::Return(reg) => {
                self.materialize(pos, *reg)?;
                let r = self.imm(*reg);
                self.checked(pos, Callback::SetResult, &[frame, r])?;
                let ok = self.builder.ins().iconst(types::I32, 0);
                self.builder.ins().return_(&[ok]);
                return Ok(true);
            }
            NativeIR::ReturnVoid => {
                let ok = self.builder.ins().iconst(types::I32, 0);
                self.builder.ins().return_(&[ok]);
                return Ok(true);
            }
            NativeIR::Throw(reg) => {
                let ty = self.reg_type(*reg)?;
                if let Some(callback) = box_callback(ty) {
                    let value = self.abi_operand(*reg, ty)?;
                    let r = self.imm(*reg);
                    self.call(callback, &[frame, r, value])?;
                }
                let r = self.imm(*reg);
                self.call(Callback::Throw, &[frame, r])?;
                let fail = self.fail_target(pos);
                self.builder.ins().jump(fail, &[]);
                return Ok(true);
            }
            NativeIR::Trap { .. } => {
                let p = self.imm(at);
                self.call(Callback::Fail, &[frame, p])?;
                self.builder.ins().jump(self.fail_block, &[]);
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn read_integral(&mut self, reg: Register) -> Result<Value> {
        self.read(reg, types::I32)
    }

    fn convert(&mut self, pos: usize, dst: Register, src: Register, to: StackType) -> Result<()> {
        let from = self.reg_type(src)?;
        if self.reg_type(dst)? != to {
            return Err(Error::internal(format!("r{} is not typed {} at IR {}", dst, to, pos)));
        }
        let frame = self.frame;
        match (from, to) {
            (StackType::Object, StackType::Object) => {
                let (d, s) = (self.imm(dst), self.imm(src));
                self.checked(pos, Callback::Move, &[frame, d, s])
            }
            (StackType::Object, _) => {
                let callback = match to {
                    StackType::Int => Callback::UnboxInt,
                    StackType::UInt => Callback::UnboxUInt,
                    StackType::Number => Callback::UnboxNumber,
                    StackType::Boolean => Callback::UnboxBool,
                    _ => return Err(Error::internal(format!("cannot unbox to {}", to))),
                };
                let s = self.imm(src);
                self.checked(pos, callback, &[frame, s])?;
                let flags = MemFlags::trusted();
                let v = match to {
                    StackType::Number => {
                        self.builder
                            .ins()
                            .load(types::F64, flags, frame, NUMBER_OUT_OFFSET)
                    }
                    StackType::Boolean => {
                        let raw = self.builder.ins().load(types::I32, flags, frame, INT_OUT_OFFSET);
                        self.builder.ins().icmp_imm(IntCC::NotEqual, raw, 0)
                    }
                    _ => self.builder.ins().load(types::I32, flags, frame, INT_OUT_OFFSET),
                };
                self.write(dst, v)
            }
            (_, StackType::Object) => {
                let callback = box_callback(from)
                    .ok_or_else(|| Error::internal(format!("cannot box r{} of type {}", src, from)))?;
                let value = self.abi_operand(src, from)?;
                let d = self.imm(dst);
                self.checked(pos, callback, &[frame, d, value])
            }
            _ => {
                let from_native = native_type(from)
                    .ok_or_else(|| Error::internal(format!("r{} has no value", src)))?;
                let x = self.read(src, from_native)?;
                let v = match (from, to) {
                    (StackType::Int, StackType::Number) => {
                        self.builder.ins().fcvt_from_sint(types::F64, x)
                    }
                    (StackType::UInt, StackType::Number) => {
                        self.builder.ins().fcvt_from_uint(types::F64, x)
                    }
                    (StackType::Boolean, StackType::Number) => {
                        let wide = self.builder.ins().uextend(types::I32, x);
                        self.builder.ins().fcvt_from_uint(types::F64, wide)
                    }
                    (StackType::Number, StackType::Int | StackType::UInt) => self
                        .call(Callback::ToInt32, &[x])?
                        .ok_or_else(|| Error::internal("ToInt32 returns nothing"))?,
                    (StackType::Boolean, StackType::Int | StackType::UInt) => {
                        self.builder.ins().uextend(types::I32, x)
                    }
                    (StackType::Int | StackType::UInt, StackType::Int | StackType::UInt) => x,
                    (StackType::Int | StackType::UInt, StackType::Boolean) => {
                        self.builder.ins().icmp_imm(IntCC::NotEqual, x, 0)
                    }
                    (StackType::Number, StackType::Boolean) => {
                        let zero = self.builder.ins().f64const(0.0);
                        self.builder.ins().fcmp(FloatCC::OrderedNotEqual, x, zero)
                    }
                    (StackType::Number, StackType::Number) | (StackType::Boolean, StackType::Boolean) => x,
                    _ => {
                        return Err(Error::internal(format!(
                            "no conversion from {} to {} at IR {}",
                            from, to, pos
                        )))
                    }
                };
                self.write(dst, v)
            }
        }
    }
}
