//! Opcode semantic helpers
//!
//! Value-level implementations of the arithmetic, comparison, conversion and
//! coercion opcode families. The interpreter calls them directly and the
//! compiled tier reaches them through `CallHelper` whenever an operand is not
//! a statically known primitive, so both tiers share one definition of every
//! coercion rule.
//!
//! `subtract`, `subtract_i`, `add_i` and `divide` treat an `undefined`
//! operand as producing 0 instead of NaN. Existing content relies on this.

use crate::error::{Error, Result};
use crate::runtime::value::Value;
use std::cmp::Ordering;

fn undefined_operand(a: &Value, b: &Value) -> bool {
    matches!(a, Value::Undefined) || matches!(b, Value::Undefined)
}

fn concatenates(v: &Value) -> bool {
    matches!(v, Value::String(_) | Value::Namespace(_) | Value::Object(_))
}

// ==================== Arithmetic ====================

/// `add`: string concatenation when either side is a string or object,
/// numeric addition otherwise
pub fn add(a: &Value, b: &Value) -> Value {
    if concatenates(a) || concatenates(b) {
        let mut s = a.to_ecma_string();
        s.push_str(&b.to_ecma_string());
        return Value::from(s);
    }
    Value::Number(a.to_number() + b.to_number())
}

pub fn add_i(a: &Value, b: &Value) -> Value {
    if undefined_operand(a, b) {
        return Value::Integer(0);
    }
    Value::Integer(a.to_int32().wrapping_add(b.to_int32()))
}

pub fn subtract(a: &Value, b: &Value) -> Value {
    if undefined_operand(a, b) {
        return Value::Number(0.0);
    }
    Value::Number(a.to_number() - b.to_number())
}

pub fn subtract_i(a: &Value, b: &Value) -> Value {
    if undefined_operand(a, b) {
        return Value::Integer(0);
    }
    Value::Integer(a.to_int32().wrapping_sub(b.to_int32()))
}

pub fn multiply(a: &Value, b: &Value) -> Value {
    Value::Number(a.to_number() * b.to_number())
}

pub fn multiply_i(a: &Value, b: &Value) -> Value {
    Value::Integer(a.to_int32().wrapping_mul(b.to_int32()))
}

pub fn divide(a: &Value, b: &Value) -> Value {
    if undefined_operand(a, b) {
        return Value::Number(0.0);
    }
    Value::Number(a.to_number() / b.to_number())
}

pub fn modulo(a: &Value, b: &Value) -> Value {
    Value::Number(a.to_number() % b.to_number())
}

pub fn negate(a: &Value) -> Value {
    Value::Number(-a.to_number())
}

pub fn negate_i(a: &Value) -> Value {
    Value::Integer(a.to_int32().wrapping_neg())
}

pub fn increment(a: &Value) -> Value {
    Value::Number(a.to_number() + 1.0)
}

pub fn increment_i(a: &Value) -> Value {
    Value::Integer(a.to_int32().wrapping_add(1))
}

pub fn decrement(a: &Value) -> Value {
    Value::Number(a.to_number() - 1.0)
}

pub fn decrement_i(a: &Value) -> Value {
    Value::Integer(a.to_int32().wrapping_sub(1))
}

// ==================== Bit operations ====================

pub fn not(a: &Value) -> Value {
    Value::Boolean(!a.to_boolean())
}

pub fn bit_not(a: &Value) -> Value {
    Value::Integer(!a.to_int32())
}

pub fn lshift(a: &Value, b: &Value) -> Value {
    Value::Integer(a.to_int32().wrapping_shl(b.to_uint32() & 31))
}

pub fn rshift(a: &Value, b: &Value) -> Value {
    Value::Integer(a.to_int32().wrapping_shr(b.to_uint32() & 31))
}

pub fn urshift(a: &Value, b: &Value) -> Value {
    Value::UInteger(a.to_uint32().wrapping_shr(b.to_uint32() & 31))
}

pub fn bit_and(a: &Value, b: &Value) -> Value {
    Value::Integer(a.to_int32() & b.to_int32())
}

pub fn bit_or(a: &Value, b: &Value) -> Value {
    Value::Integer(a.to_int32() | b.to_int32())
}

pub fn bit_xor(a: &Value, b: &Value) -> Value {
    Value::Integer(a.to_int32() ^ b.to_int32())
}

// ==================== Comparison ====================

/// Abstract relational comparison; `None` when either side is NaN
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    let a = to_primitive(a);
    let b = to_primitive(b);
    match (&a, &b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => a.to_number().partial_cmp(&b.to_number()),
    }
}

fn to_primitive(v: &Value) -> Value {
    match v {
        Value::Object(_) | Value::Namespace(_) => Value::from(v.to_ecma_string()),
        other => other.clone(),
    }
}

pub fn equals(a: &Value, b: &Value) -> bool {
    a.loose_equals(b)
}

pub fn strict_equals(a: &Value, b: &Value) -> bool {
    a.strict_equals(b)
}

pub fn less_than(a: &Value, b: &Value) -> bool {
    matches!(compare(a, b), Some(Ordering::Less))
}

pub fn less_equals(a: &Value, b: &Value) -> bool {
    matches!(compare(a, b), Some(Ordering::Less | Ordering::Equal))
}

pub fn greater_than(a: &Value, b: &Value) -> bool {
    matches!(compare(a, b), Some(Ordering::Greater))
}

pub fn greater_equals(a: &Value, b: &Value) -> bool {
    matches!(compare(a, b), Some(Ordering::Greater | Ordering::Equal))
}

// ==================== Conversion & coercion ====================

pub fn type_of(a: &Value) -> Value {
    Value::from(a.type_of())
}

pub fn convert_s(a: &Value) -> Value {
    Value::String(a.to_rc_str())
}

/// `coerce_s`: like `convert_s` but null and undefined become null
pub fn coerce_s(a: &Value) -> Value {
    if a.is_nullish() {
        Value::Null
    } else {
        convert_s(a)
    }
}

pub fn convert_i(a: &Value) -> Value {
    Value::Integer(a.to_int32())
}

pub fn convert_u(a: &Value) -> Value {
    Value::UInteger(a.to_uint32())
}

pub fn convert_d(a: &Value) -> Value {
    Value::Number(a.to_number())
}

pub fn convert_b(a: &Value) -> Value {
    Value::Boolean(a.to_boolean())
}

/// `convert_o`: TypeError on null or undefined
pub fn convert_o(a: &Value) -> Result<Value> {
    if a.is_nullish() {
        return Err(Error::type_error(format!(
            "Cannot convert {} to an object",
            a.to_ecma_string()
        )));
    }
    Ok(a.clone())
}

pub fn coerce_o(a: &Value) -> Value {
    match a {
        Value::Undefined => Value::Null,
        other => other.clone(),
    }
}

/// `esc_xattr`: escape a value for use in an XML attribute
pub fn esc_xattr(a: &Value) -> Value {
    let s = a.to_ecma_string();
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            '\t' => out.push_str("&#x9;"),
            c => out.push(c),
        }
    }
    Value::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::value::{Object, ObjectKind};

    #[test]
    fn test_add_concatenates_strings() {
        assert_eq!(add(&Value::from("a"), &Value::from(1)).to_ecma_string(), "a1");
        assert_eq!(add(&Value::from(2), &Value::Boolean(true)).to_number(), 3.0);
        let arr = Value::new_object(Object::new(
            ObjectKind::Array(vec![Value::from(1), Value::from(2)]),
            "Array",
        ));
        assert_eq!(add(&arr, &Value::from(3)).to_ecma_string(), "1,23");
    }

    #[test]
    fn test_undefined_operand_hack() {
        assert_eq!(subtract(&Value::Undefined, &Value::from(4)).to_number(), 0.0);
        assert_eq!(divide(&Value::from(4), &Value::Undefined).to_number(), 0.0);
        assert!(matches!(subtract_i(&Value::Undefined, &Value::from(1)), Value::Integer(0)));
        assert!(matches!(add_i(&Value::from(1), &Value::Undefined), Value::Integer(0)));
        // multiply and add follow ECMA
        assert!(multiply(&Value::Undefined, &Value::from(2)).to_number().is_nan());
        assert!(add(&Value::Undefined, &Value::from(2)).to_number().is_nan());
    }

    #[test]
    fn test_subtract_operand_order() {
        assert_eq!(subtract(&Value::from(5), &Value::from(3)).to_number(), 2.0);
        assert!(matches!(subtract_i(&Value::from(3), &Value::from(5)), Value::Integer(-2)));
    }

    #[test]
    fn test_integer_ops_wrap() {
        assert!(matches!(add_i(&Value::from(i32::MAX), &Value::from(1)), Value::Integer(i32::MIN)));
        assert!(matches!(negate_i(&Value::from(i32::MIN)), Value::Integer(i32::MIN)));
        assert!(matches!(increment_i(&Value::from(i32::MAX)), Value::Integer(i32::MIN)));
    }

    #[test]
    fn test_shifts() {
        assert!(matches!(lshift(&Value::from(1), &Value::from(33)), Value::Integer(2)));
        assert!(matches!(rshift(&Value::from(-8), &Value::from(1)), Value::Integer(-4)));
        assert!(matches!(urshift(&Value::from(-1), &Value::from(28)), Value::UInteger(15)));
        assert!(matches!(bit_not(&Value::from(0)), Value::Integer(-1)));
    }

    #[test]
    fn test_relational_with_nan_and_strings() {
        let nan = Value::Number(f64::NAN);
        assert!(!less_than(&nan, &Value::from(1)));
        assert!(!greater_equals(&nan, &Value::from(1)));
        assert!(less_than(&Value::from("abc"), &Value::from("abd")));
        assert!(less_equals(&Value::from("10"), &Value::from(10)));
        assert!(greater_than(&Value::from(3), &Value::Boolean(true)));
    }

    #[test]
    fn test_coercions() {
        assert!(matches!(coerce_s(&Value::Undefined), Value::Null));
        assert_eq!(convert_s(&Value::Null).to_ecma_string(), "null");
        assert!(convert_o(&Value::Undefined).is_err());
        assert!(matches!(coerce_o(&Value::Undefined), Value::Null));
        assert_eq!(type_of(&Value::from(1.5)).to_ecma_string(), "number");
        assert_eq!(esc_xattr(&Value::from("a<\"b\">&")).to_ecma_string(), "a&lt;&quot;b&quot;&gt;&amp;");
    }
}
