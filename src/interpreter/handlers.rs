//! Per-opcode routines on the memory-resident context
//!
//! Every non-control-flow opcode is implemented here once. The interpreter
//! dispatches to `execute_op` for everything except branches and returns,
//! and the compiled tier calls it for its generic fallback after syncing its
//! registers to memory, so both tiers see one set of stack effects.
//!
//! Operands are popped in reverse push order. Runtime multiname parts are
//! popped after the operands that were pushed after them and before the
//! receiver object.

use crate::bytecode::{Instruction, MultinameKind, Opcode, Operands, QualifiedName};
use crate::error::{Error, Result};
use crate::runtime::helpers;
use crate::runtime::{CallContext, Value};
use crate::vm::VmContext;
use std::rc::Rc;
use tracing::debug;

/// Resolve a multiname operand, popping its runtime parts
pub fn resolve_name(vm: &VmContext, ctx: &mut CallContext, index: u32) -> Result<QualifiedName> {
    let multiname = vm.pool().get_multiname(index)?;
    let static_name = || multiname.name.clone().unwrap_or_else(|| Rc::from("*"));
    match multiname.kind {
        MultinameKind::QName | MultinameKind::Multiname => multiname.static_name(),
        MultinameKind::MultinameL => {
            let name = ctx.pop()?;
            Ok(QualifiedName {
                namespace: multiname.namespace.clone(),
                name: name.to_rc_str(),
            })
        }
        MultinameKind::RTQName => {
            let namespace = ctx.pop()?;
            Ok(QualifiedName {
                namespace: Some(namespace.to_rc_str()),
                name: static_name(),
            })
        }
        MultinameKind::RTQNameL => {
            let name = ctx.pop()?;
            let namespace = ctx.pop()?;
            Ok(QualifiedName {
                namespace: Some(namespace.to_rc_str()),
                name: name.to_rc_str(),
            })
        }
        MultinameKind::TypeName => Err(Error::unsupported(format!(
            "parameterized type name {} used as a property name",
            index
        ))),
    }
}

/// Static type name operand of coerce / astype / istype
fn type_name(vm: &VmContext, index: u32) -> Result<QualifiedName> {
    vm.pool().get_multiname(index)?.static_name()
}

fn unary(opcode: Opcode) -> Option<fn(&Value) -> Value> {
    use Opcode::*;
    Some(match opcode {
        Negate => helpers::negate,
        NegateI => helpers::negate_i,
        Increment => helpers::increment,
        IncrementI => helpers::increment_i,
        Decrement => helpers::decrement,
        DecrementI => helpers::decrement_i,
        Not => helpers::not,
        BitNot => helpers::bit_not,
        TypeOf => helpers::type_of,
        ConvertS => helpers::convert_s,
        CoerceS => helpers::coerce_s,
        EscXAttr => helpers::esc_xattr,
        ConvertI | CoerceI => helpers::convert_i,
        ConvertU | CoerceU => helpers::convert_u,
        ConvertD | CoerceD => helpers::convert_d,
        ConvertB | CoerceB => helpers::convert_b,
        CoerceO => helpers::coerce_o,
        _ => return None,
    })
}

fn binary(opcode: Opcode) -> Option<fn(&Value, &Value) -> Value> {
    use Opcode::*;
    Some(match opcode {
        Add => helpers::add,
        AddI => helpers::add_i,
        Subtract => helpers::subtract,
        SubtractI => helpers::subtract_i,
        Multiply => helpers::multiply,
        MultiplyI => helpers::multiply_i,
        Divide => helpers::divide,
        Modulo => helpers::modulo,
        LShift => helpers::lshift,
        RShift => helpers::rshift,
        URShift => helpers::urshift,
        BitAnd => helpers::bit_and,
        BitOr => helpers::bit_or,
        BitXor => helpers::bit_xor,
        _ => return None,
    })
}

fn comparison(opcode: Opcode) -> Option<fn(&Value, &Value) -> bool> {
    use Opcode::*;
    Some(match opcode {
        Equals => helpers::equals,
        StrictEquals => helpers::strict_equals,
        LessThan => helpers::less_than,
        LessEquals => helpers::less_equals,
        GreaterThan => helpers::greater_than,
        GreaterEquals => helpers::greater_equals,
        _ => return None,
    })
}

/// Whether a two-operand conditional branch is taken for `a op b`
pub fn branch_taken(opcode: Opcode, a: &Value, b: &Value) -> Result<bool> {
    use Opcode::*;
    Ok(match opcode {
        IfEq => helpers::equals(a, b),
        IfNe => !helpers::equals(a, b),
        IfStrictEq => helpers::strict_equals(a, b),
        IfStrictNe => !helpers::strict_equals(a, b),
        IfLt => helpers::less_than(a, b),
        IfLe => helpers::less_equals(a, b),
        IfGt => helpers::greater_than(a, b),
        IfGe => helpers::greater_equals(a, b),
        IfNlt => !helpers::less_than(a, b),
        IfNle => !helpers::less_equals(a, b),
        IfNgt => !helpers::greater_than(a, b),
        IfNge => !helpers::greater_equals(a, b),
        other => return Err(Error::internal(format!("{} is not a comparison branch", other))),
    })
}

/// Index operand of `nextname` / `nextvalue`
fn enumeration_index(value: Value) -> Result<u32> {
    match value {
        Value::Integer(i) if i >= 0 => Ok(i as u32),
        other => Err(Error::unsupported(format!(
            "enumeration index must be an int, got {:?}",
            other
        ))),
    }
}

fn global_object(vm: &VmContext, ctx: &CallContext) -> Value {
    ctx.global_scope().unwrap_or_else(|| vm.model().global())
}

/// Execute one non-control-flow instruction against the context
pub fn execute_op(vm: &VmContext, ctx: &mut CallContext, instr: &Instruction) -> Result<()> {
    use Opcode::*;
    let model = vm.model();
    let method = ctx.method;

    if let Some(op) = unary(instr.opcode) {
        let a = ctx.pop()?;
        return ctx.push(op(&a));
    }
    if let Some(op) = binary(instr.opcode) {
        let b = ctx.pop()?;
        let a = ctx.pop()?;
        return ctx.push(op(&a, &b));
    }
    if let Some(op) = comparison(instr.opcode) {
        let b = ctx.pop()?;
        let a = ctx.pop()?;
        return ctx.push(Value::Boolean(op(&a, &b)));
    }

    match instr.opcode {
        Nop | Label | Debug | DebugLine | DebugFile => {}
        Bkpt => debug!(offset = instr.offset, "breakpoint"),

        // ========== Constants ==========
        PushNull => ctx.push(Value::Null)?,
        PushUndefined => ctx.push(Value::Undefined)?,
        PushTrue => ctx.push(Value::Boolean(true))?,
        PushFalse => ctx.push(Value::Boolean(false))?,
        PushNaN => ctx.push(Value::Number(f64::NAN))?,
        PushByte => match instr.operands {
            Operands::Byte(b) => ctx.push(Value::Integer(i32::from(b)))?,
            _ => return Err(Error::internal("pushbyte without a byte operand")),
        },
        PushShort => ctx.push(Value::Integer(instr.index()? as i32))?,
        PushString => ctx.push(Value::String(vm.pool().get_string(instr.index()?)?))?,
        PushInt => ctx.push(Value::Integer(vm.pool().get_integer(instr.index()?)?))?,
        PushUInt => ctx.push(Value::UInteger(vm.pool().get_uinteger(instr.index()?)?))?,
        PushDouble => ctx.push(Value::Number(vm.pool().get_double(instr.index()?)?))?,
        PushNamespace => {
            ctx.push(Value::Namespace(vm.pool().get_namespace(instr.index()?)?))?
        }

        // ========== Stack ==========
        Pop => drop(ctx.pop()?),
        Dup => {
            let top = ctx.peek()?.clone();
            ctx.push(top)?;
        }
        Swap => {
            let b = ctx.pop()?;
            let a = ctx.pop()?;
            ctx.push(b)?;
            ctx.push(a)?;
        }

        // ========== Locals ==========
        GetLocal | GetLocal0 | GetLocal1 | GetLocal2 | GetLocal3 => {
            let value = ctx.get_local(instr.local_index()?)?;
            ctx.push(value)?;
        }
        SetLocal | SetLocal0 | SetLocal1 | SetLocal2 | SetLocal3 => {
            let value = ctx.pop()?;
            ctx.set_local(instr.local_index()?, value)?;
        }
        Kill => ctx.kill_local(instr.index()?)?,
        IncLocal | DecLocal | IncLocalI | DecLocalI => {
            let index = instr.index()?;
            let value = ctx.get_local(index)?;
            let updated = match instr.opcode {
                IncLocal => helpers::increment(&value),
                DecLocal => helpers::decrement(&value),
                IncLocalI => helpers::increment_i(&value),
                _ => helpers::decrement_i(&value),
            };
            ctx.set_local(index, updated)?;
        }

        // ========== Scope ==========
        PushScope | PushWith => {
            let value = ctx.pop()?;
            if value.is_nullish() {
                return Err(Error::type_error(
                    "Cannot push a null or undefined value onto the scope chain",
                ));
            }
            ctx.push_scope(value, instr.opcode == PushWith);
        }
        PopScope => drop(ctx.pop_scope()?),
        GetGlobalScope => {
            let global = global_object(vm, ctx);
            ctx.push(global)?;
        }
        GetScopeObject => {
            let value = ctx.scope_at(instr.index()?)?;
            ctx.push(value)?;
        }
        Dxns => ctx.default_namespace = Some(vm.pool().get_string(instr.index()?)?),
        DxnsLate => {
            let ns = ctx.pop()?;
            ctx.default_namespace = Some(ns.to_rc_str());
        }

        // ========== Enumeration ==========
        HasNext2 => {
            let (object_reg, index_reg) = (instr.index()?, instr.second()?);
            let object = ctx.get_local(object_reg)?;
            let index = ctx.get_local(index_reg)?.to_uint32();
            let next = if object.is_nullish() {
                0
            } else {
                match model.has_next(vm, &object, index)? {
                    Some(next) => next,
                    None if index < model.enumerable_len(vm, &object) => index + 1,
                    None => 0,
                }
            };
            if next == 0 {
                ctx.set_local(object_reg, Value::Null)?;
            }
            ctx.set_local(index_reg, Value::Integer(next as i32))?;
            ctx.push(Value::Boolean(next != 0))?;
        }
        NextName | NextValue => {
            let index = enumeration_index(ctx.pop()?)?;
            let object = ctx.pop()?;
            let result = if instr.opcode == NextName {
                model.next_name(vm, &object, index)?
            } else {
                model.next_value(vm, &object, index)?
            };
            ctx.push(result)?;
        }

        // ========== Properties ==========
        GetProperty => {
            let name = resolve_name(vm, ctx, instr.index()?)?;
            let object = ctx.pop()?;
            ctx.push(model.get_property(vm, &object, &name)?)?;
        }
        SetProperty | InitProperty => {
            let value = ctx.pop()?;
            let name = resolve_name(vm, ctx, instr.index()?)?;
            let object = ctx.pop()?;
            if instr.opcode == SetProperty {
                model.set_property(vm, &object, &name, value)?;
            } else {
                model.init_property(vm, &object, &name, value)?;
            }
        }
        DeleteProperty => {
            let name = resolve_name(vm, ctx, instr.index()?)?;
            let object = ctx.pop()?;
            ctx.push(Value::Boolean(model.delete_property(vm, &object, &name)?))?;
        }
        GetDescendants => {
            let name = resolve_name(vm, ctx, instr.index()?)?;
            let object = ctx.pop()?;
            ctx.push(model.get_descendants(vm, &object, &name)?)?;
        }
        In => {
            let object = ctx.pop()?;
            let name = ctx.pop()?;
            let name = QualifiedName::public(name.to_rc_str());
            ctx.push(Value::Boolean(model.has_property(vm, &object, &name)?))?;
        }
        GetSlot => {
            let object = ctx.pop()?;
            ctx.push(model.get_slot(vm, &object, instr.index()?)?)?;
        }
        SetSlot => {
            let value = ctx.pop()?;
            let object = ctx.pop()?;
            model.set_slot(vm, &object, instr.index()?, value)?;
        }
        GetGlobalSlot => {
            let global = global_object(vm, ctx);
            ctx.push(model.get_slot(vm, &global, instr.index()?)?)?;
        }
        SetGlobalSlot => {
            let value = ctx.pop()?;
            let global = global_object(vm, ctx);
            model.set_slot(vm, &global, instr.index()?, value)?;
        }
        GetSuper => {
            let name = resolve_name(vm, ctx, instr.index()?)?;
            let object = ctx.pop()?;
            ctx.push(model.get_super(vm, method, &object, &name)?)?;
        }
        SetSuper => {
            let value = ctx.pop()?;
            let name = resolve_name(vm, ctx, instr.index()?)?;
            let object = ctx.pop()?;
            model.set_super(vm, method, &object, &name, value)?;
        }

        // ========== Lookup ==========
        FindPropStrict | FindProperty => {
            let name = resolve_name(vm, ctx, instr.index()?)?;
            let strict = instr.opcode == FindPropStrict;
            let found = model.find_property(vm, &ctx.scope_stack, &name, strict)?;
            ctx.push(found)?;
        }
        FindDef => {
            let name = type_name(vm, instr.index()?)?;
            ctx.push(model.find_definition(vm, &name)?)?;
        }
        GetLex => {
            let name = type_name(vm, instr.index()?)?;
            let object = model.find_property(vm, &ctx.scope_stack, &name, true)?;
            ctx.push(model.get_property(vm, &object, &name)?)?;
        }

        // ========== Calls ==========
        Call => {
            let args = ctx.pop_n(instr.index()? as usize)?;
            let receiver = ctx.pop()?;
            let function = ctx.pop()?;
            ctx.push(model.call(vm, &function, &receiver, args)?)?;
        }
        Construct => {
            let args = ctx.pop_n(instr.index()? as usize)?;
            let constructor = ctx.pop()?;
            ctx.push(model.construct(vm, &constructor, args)?)?;
        }
        CallProperty | CallPropVoid | CallPropLex => {
            let args = ctx.pop_n(instr.second()? as usize)?;
            let name = resolve_name(vm, ctx, instr.index()?)?;
            let object = ctx.pop()?;
            let result = if instr.opcode == CallPropLex {
                let function = model.get_property(vm, &object, &name)?;
                model.call(vm, &function, &Value::Null, args)?
            } else {
                model.call_property(vm, &object, &name, args)?
            };
            if instr.opcode != CallPropVoid {
                ctx.push(result)?;
            }
        }
        CallSuper | CallSuperVoid => {
            let args = ctx.pop_n(instr.second()? as usize)?;
            let name = resolve_name(vm, ctx, instr.index()?)?;
            let receiver = ctx.pop()?;
            let result = model.call_super(vm, method, &receiver, &name, args)?;
            if instr.opcode == CallSuper {
                ctx.push(result)?;
            }
        }
        ConstructSuper => {
            let args = ctx.pop_n(instr.index()? as usize)?;
            let receiver = ctx.pop()?;
            model.construct_super(vm, method, &receiver, args)?;
        }
        ConstructProp => {
            let args = ctx.pop_n(instr.second()? as usize)?;
            let name = resolve_name(vm, ctx, instr.index()?)?;
            let object = ctx.pop()?;
            ctx.push(model.construct_property(vm, &object, &name, args)?)?;
        }
        ConstructGenericType => {
            let params = ctx.pop_n(instr.index()? as usize)?;
            let factory = ctx.pop()?;
            ctx.push(model.apply_type(vm, &factory, params)?)?;
        }

        // ========== Object creation ==========
        NewFunction => {
            let scope = ctx.scope_stack.clone();
            ctx.push(model.new_function(vm, instr.index()?, scope)?)?;
        }
        NewObject => {
            let values = ctx.pop_n(2 * instr.index()? as usize)?;
            let mut properties = Vec::with_capacity(values.len() / 2);
            let mut iter = values.into_iter();
            while let (Some(name), Some(value)) = (iter.next(), iter.next()) {
                properties.push((name.to_rc_str(), value));
            }
            ctx.push(model.new_object(vm, properties)?)?;
        }
        NewArray => {
            let items = ctx.pop_n(instr.index()? as usize)?;
            ctx.push(model.new_array(vm, items)?)?;
        }
        NewActivation => ctx.push(model.new_activation(vm, method)?)?,
        NewCatch => ctx.push(model.new_catch(vm, method, instr.index()?)?)?,
        NewClass => {
            let base = ctx.pop()?;
            let scope = ctx.scope_stack.clone();
            ctx.push(model.new_class(vm, instr.index()?, base, scope)?)?;
        }

        // ========== Types ==========
        CoerceA => {}
        ConvertO => {
            let value = ctx.pop()?;
            ctx.push(helpers::convert_o(&value)?)?;
        }
        CheckFilter => model.check_filter(vm, ctx.peek()?)?,
        Coerce => {
            let value = ctx.pop()?;
            let name = type_name(vm, instr.index()?)?;
            ctx.push(model.coerce(vm, value, &name)?)?;
        }
        AsType => {
            let value = ctx.pop()?;
            let name = type_name(vm, instr.index()?)?;
            ctx.push(model.as_type(vm, value, &name)?)?;
        }
        AsTypeLate => {
            let type_value = ctx.pop()?;
            let value = ctx.pop()?;
            ctx.push(model.as_type_late(vm, value, &type_value)?)?;
        }
        IsType => {
            let value = ctx.pop()?;
            let name = type_name(vm, instr.index()?)?;
            ctx.push(Value::Boolean(model.is_type(vm, &value, &name)?))?;
        }
        IsTypeLate => {
            let type_value = ctx.pop()?;
            let value = ctx.pop()?;
            ctx.push(Value::Boolean(model.is_type_late(vm, &value, &type_value)?))?;
        }
        InstanceOf => {
            let constructor = ctx.pop()?;
            let value = ctx.pop()?;
            ctx.push(Value::Boolean(model.instance_of(vm, &value, &constructor)?))?;
        }

        other => {
            return Err(Error::internal(format!(
                "{} at {} must be handled by the dispatch loop",
                other, instr.offset
            )))
        }
    }
    Ok(())
}
