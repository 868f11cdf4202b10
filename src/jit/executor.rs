//! Runtime side of compiled code
//!
//! [`execute`] enters a method's machine code with a [`JitFrame`] and turns
//! the returned status into a `Result`. The `extern "C"` functions below are
//! what the machine code calls for anything that touches a boxed value: the
//! object register file, memory state in the `CallContext`, the semantic
//! helpers and the interpreter's generic routines.
//!
//! Callbacks report failure with a nonzero status and leave the error in the
//! frame. The first error recorded wins, so a failing spill on the unwind
//! path cannot hide the error that started it. Panics are caught at the
//! callback boundary and surface as an `InternalError`.

use super::ir::{Constant, LoweredMethod, NativeIR};
use super::CompiledMethod;
use crate::error::{Error, Result};
use crate::interpreter::handlers;
use crate::runtime::value::number_to_int32;
use crate::runtime::{CallContext, StackEntry, StackType, Value};
use crate::vm::VmContext;
use std::mem::offset_of;
use std::panic::{self, AssertUnwindSafe};
use tracing::{trace, warn};

/// One activation of compiled code
///
/// The first two fields are read directly by machine code after an unbox
/// callback, at [`INT_OUT_OFFSET`] and [`NUMBER_OUT_OFFSET`].
#[repr(C)]
pub struct JitFrame<'a> {
    int_out: i32,
    number_out: f64,
    vm: &'a VmContext,
    ctx: &'a mut CallContext,
    method: &'a LoweredMethod,
    /// Object registers, indexed by register number
    objects: Vec<Option<Value>>,
    result: Value,
    error: Option<Error>,
}

pub(crate) const INT_OUT_OFFSET: i32 = offset_of!(JitFrame<'static>, int_out) as i32;
pub(crate) const NUMBER_OUT_OFFSET: i32 = offset_of!(JitFrame<'static>, number_out) as i32;

impl<'a> JitFrame<'a> {
    fn new(vm: &'a VmContext, ctx: &'a mut CallContext, method: &'a LoweredMethod) -> Self {
        Self {
            int_out: 0,
            number_out: 0.0,
            vm,
            ctx,
            method,
            objects: vec![None; method.register_count as usize],
            result: Value::Undefined,
            error: None,
        }
    }

    fn slot(&mut self, reg: u32) -> Result<&mut Option<Value>> {
        self.objects
            .get_mut(reg as usize)
            .ok_or_else(|| Error::internal(format!("register r{} out of range", reg)))
    }

    fn set(&mut self, reg: u32, value: Value) -> Result<()> {
        *self.slot(reg)? = Some(value);
        Ok(())
    }

    fn take(&mut self, reg: u32) -> Result<Value> {
        self.slot(reg)?
            .take()
            .ok_or_else(|| Error::internal(format!("read of empty register r{}", reg)))
    }

    fn peek(&self, reg: u32) -> Result<&Value> {
        self.objects
            .get(reg as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::internal(format!("read of empty register r{}", reg)))
    }

    /// IR instruction at `pos`, for callbacks that take their operands from it
    fn ir(&self, pos: u32) -> Result<&'a NativeIR> {
        let method = self.method;
        method.ir.get(pos as usize).ok_or_else(|| {
            Error::internal(format!("{} has no IR instruction {}", method.name, pos))
        })
    }

    fn record(&mut self, err: Error) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    /// Object registers still holding a reference
    fn live_objects(&self) -> usize {
        self.objects
            .iter()
            .filter(|slot| matches!(slot, Some(Value::Object(_))))
            .count()
    }
}

/// Run `compiled` against `ctx`, entering at `ctx.exec_pos`
pub fn execute(vm: &VmContext, compiled: &CompiledMethod, ctx: &mut CallContext) -> Result<Value> {
    let lowered = &compiled.lowered;
    trace!(method = %lowered.name, entry = ctx.exec_pos, "enter machine code");
    let mut frame = JitFrame::new(vm, ctx, lowered);
    let status = compiled.code.invoke(&mut frame);
    if status != 0 {
        return Err(frame.error.take().unwrap_or_else(|| {
            Error::internal(format!("{} failed without recording an error", lowered.name))
        }));
    }
    let live = frame.live_objects();
    if live > 0 {
        warn!(method = %lowered.name, live, "registers still own objects at return");
    }
    Ok(std::mem::take(&mut frame.result))
}

fn unexpected(pos: u32, ir: &NativeIR, wanted: &str) -> Error {
    Error::internal(format!("IR {} is `{}`, not {}", pos, ir, wanted))
}

/// Run `op` on the frame, turning an error or a panic into a nonzero status
///
/// # Safety
/// `frame` must be null or the frame `execute` entered the machine code with.
unsafe fn with_frame<'a>(
    frame: *mut JitFrame<'a>,
    op: impl FnOnce(&mut JitFrame<'a>) -> Result<()>,
) -> i32 {
    // SAFETY: the caller passes the live frame of the current activation
    let Some(frame) = (unsafe { frame.as_mut() }) else {
        return 1;
    };
    match panic::catch_unwind(AssertUnwindSafe(|| op(&mut *frame))) {
        Ok(Ok(())) => 0,
        Ok(Err(err)) => {
            frame.record(err);
            1
        }
        Err(_) => {
            frame.record(Error::internal("panic inside a compiled code callback"));
            1
        }
    }
}

// ==================== Control ====================

pub(crate) unsafe extern "C" fn avm2_exec_pos(frame: *mut JitFrame<'_>) -> u32 {
    // SAFETY: see `with_frame`
    unsafe { frame.as_ref() }.map_or(0, |f| f.ctx.exec_pos)
}

pub(crate) unsafe extern "C" fn avm2_set_exec_pos(frame: *mut JitFrame<'_>, pos: u32) {
    // SAFETY: see `with_frame`
    if let Some(f) = unsafe { frame.as_mut() } {
        f.ctx.exec_pos = pos;
    }
}

/// Record why control reached a dead end at IR `pos`; always fails
pub(crate) unsafe extern "C" fn avm2_fail(frame: *mut JitFrame<'_>, pos: u32) -> i32 {
    unsafe {
        with_frame(frame, |f| {
            Err(match f.method.ir.get(pos as usize) {
                Some(NativeIR::Trap { message, offset }) => {
                    Error::format_error(message.clone(), *offset as usize)
                }
                Some(NativeIR::EntryDispatch { .. }) => {
                    Error::internal(format!("no handler entry at offset {}", f.ctx.exec_pos))
                }
                _ => Error::internal(format!("{} ran past its last instruction", f.method.name)),
            })
        })
    }
}

// ==================== Object registers ====================

pub(crate) unsafe extern "C" fn avm2_load_const(frame: *mut JitFrame<'_>, pos: u32) -> i32 {
    unsafe {
        with_frame(frame, |f| {
            let ir = f.ir(pos)?;
            let NativeIR::LoadConst { dst, constant } = ir else {
                return Err(unexpected(pos, ir, "a constant load"));
            };
            let value = match constant {
                Constant::Undefined => Value::Undefined,
                Constant::Null => Value::Null,
                Constant::String(index) => Value::String(f.vm.pool().get_string(*index)?),
                Constant::Namespace(index) => Value::Namespace(f.vm.pool().get_namespace(*index)?),
            };
            f.set(*dst, value)
        })
    }
}

pub(crate) unsafe extern "C" fn avm2_move(frame: *mut JitFrame<'_>, dst: u32, src: u32) -> i32 {
    unsafe {
        with_frame(frame, |f| {
            let value = f.take(src)?;
            f.set(dst, value)
        })
    }
}

pub(crate) unsafe extern "C" fn avm2_retain(frame: *mut JitFrame<'_>, dst: u32, src: u32) -> i32 {
    unsafe {
        with_frame(frame, |f| {
            let value = f.peek(src)?.clone();
            f.set(dst, value)
        })
    }
}

pub(crate) unsafe extern "C" fn avm2_release(frame: *mut JitFrame<'_>, reg: u32) -> i32 {
    unsafe { with_frame(frame, |f| f.take(reg).map(drop)) }
}

pub(crate) unsafe extern "C" fn avm2_box_int(frame: *mut JitFrame<'_>, reg: u32, value: i32) -> i32 {
    unsafe { with_frame(frame, |f| f.set(reg, Value::Integer(value))) }
}

pub(crate) unsafe extern "C" fn avm2_box_uint(frame: *mut JitFrame<'_>, reg: u32, value: u32) -> i32 {
    unsafe { with_frame(frame, |f| f.set(reg, Value::UInteger(value))) }
}

pub(crate) unsafe extern "C" fn avm2_box_number(frame: *mut JitFrame<'_>, reg: u32, value: f64) -> i32 {
    unsafe { with_frame(frame, |f| f.set(reg, Value::Number(value))) }
}

pub(crate) unsafe extern "C" fn avm2_box_bool(frame: *mut JitFrame<'_>, reg: u32, value: u32) -> i32 {
    unsafe { with_frame(frame, |f| f.set(reg, Value::Boolean(value != 0))) }
}

/// Convert the object in `reg` to `ty` and leave it in the frame's out slot
unsafe fn unbox(frame: *mut JitFrame<'_>, reg: u32, ty: StackType) -> i32 {
    unsafe {
        with_frame(frame, |f| {
            let value = f.take(reg)?;
            match StackEntry::from_value(value, ty)? {
                StackEntry::Int(i) => f.int_out = i,
                StackEntry::UInt(u) => f.int_out = u as i32,
                StackEntry::Boolean(b) => f.int_out = i32::from(b),
                StackEntry::Number(n) => f.number_out = n,
                StackEntry::Object(_) => {
                    return Err(Error::internal(format!("r{} cannot be unboxed to {}", reg, ty)))
                }
            }
            Ok(())
        })
    }
}

pub(crate) unsafe extern "C" fn avm2_unbox_int(frame: *mut JitFrame<'_>, reg: u32) -> i32 {
    unsafe { unbox(frame, reg, StackType::Int) }
}

pub(crate) unsafe extern "C" fn avm2_unbox_uint(frame: *mut JitFrame<'_>, reg: u32) -> i32 {
    unsafe { unbox(frame, reg, StackType::UInt) }
}

pub(crate) unsafe extern "C" fn avm2_unbox_number(frame: *mut JitFrame<'_>, reg: u32) -> i32 {
    unsafe { unbox(frame, reg, StackType::Number) }
}

pub(crate) unsafe extern "C" fn avm2_unbox_bool(frame: *mut JitFrame<'_>, reg: u32) -> i32 {
    unsafe { unbox(frame, reg, StackType::Boolean) }
}

// ==================== Memory state ====================

pub(crate) unsafe extern "C" fn avm2_push(frame: *mut JitFrame<'_>, reg: u32) -> i32 {
    unsafe {
        with_frame(frame, |f| {
            let value = f.take(reg)?;
            f.ctx.push(value)
        })
    }
}

pub(crate) unsafe extern "C" fn avm2_pop(frame: *mut JitFrame<'_>, dst: u32) -> i32 {
    unsafe {
        with_frame(frame, |f| {
            let value = f.ctx.pop()?;
            f.set(dst, value)
        })
    }
}

pub(crate) unsafe extern "C" fn avm2_load_local(frame: *mut JitFrame<'_>, dst: u32, local: u32) -> i32 {
    unsafe {
        with_frame(frame, |f| {
            let value = f.ctx.get_local(local)?;
            f.set(dst, value)
        })
    }
}

pub(crate) unsafe extern "C" fn avm2_store_local(frame: *mut JitFrame<'_>, local: u32, src: u32) -> i32 {
    unsafe {
        with_frame(frame, |f| {
            let value = f.take(src)?;
            f.ctx.set_local(local, value)
        })
    }
}

/// Write a register-held local back to memory on the way out to a handler
pub(crate) unsafe extern "C" fn avm2_spill_local(frame: *mut JitFrame<'_>, local: u32, src: u32) {
    // SAFETY: see `with_frame`
    let Some(f) = (unsafe { frame.as_mut() }) else {
        return;
    };
    let spilled = f.take(src).and_then(|value| f.ctx.set_local(local, value));
    if let Err(err) = spilled {
        warn!(method = %f.method.name, local, error = %err, "failed to spill local");
    }
}

pub(crate) unsafe extern "C" fn avm2_clear_local(frame: *mut JitFrame<'_>, local: u32) -> i32 {
    unsafe { with_frame(frame, |f| f.ctx.kill_local(local)) }
}

// ==================== Fallbacks ====================

pub(crate) unsafe extern "C" fn avm2_call_helper(frame: *mut JitFrame<'_>, pos: u32) -> i32 {
    unsafe {
        with_frame(frame, |f| {
            let ir = f.ir(pos)?;
            let NativeIR::CallHelper { dst, helper, args } = ir else {
                return Err(unexpected(pos, ir, "a helper call"));
            };
            let values = args
                .iter()
                .map(|reg| f.take(*reg))
                .collect::<Result<Vec<Value>>>()?;
            let result = helper.call(&values)?;
            f.set(*dst, result)
        })
    }
}

pub(crate) unsafe extern "C" fn avm2_generic(frame: *mut JitFrame<'_>, pos: u32) -> i32 {
    unsafe {
        with_frame(frame, |f| {
            let ir = f.ir(pos)?;
            let NativeIR::Generic(instr) = ir else {
                return Err(unexpected(pos, ir, "a generic instruction"));
            };
            handlers::execute_op(f.vm, f.ctx, instr)
        })
    }
}

/// Raise the value in `reg`; always fails
pub(crate) unsafe extern "C" fn avm2_throw(frame: *mut JitFrame<'_>, reg: u32) -> i32 {
    unsafe { with_frame(frame, |f| Err(Error::Thrown(f.take(reg)?))) }
}

pub(crate) unsafe extern "C" fn avm2_set_result(frame: *mut JitFrame<'_>, reg: u32) -> i32 {
    unsafe {
        with_frame(frame, |f| {
            f.result = f.take(reg)?;
            Ok(())
        })
    }
}

// ==================== Numeric ====================

pub(crate) extern "C" fn avm2_fmod(a: f64, b: f64) -> f64 {
    a % b
}

pub(crate) extern "C" fn avm2_to_int32(n: f64) -> i32 {
    number_to_int32(n)
}
