//! AVM2 value types
//!
//! `Value` is the boxed, memory-resident representation used by locals, the
//! operand stack and the object model. Cloning a `Value` that refers to an
//! object is an incRef and dropping it is a decRef, so ownership of stack and
//! local slots carries the reference-count discipline of the engine.
//!
//! `StackEntry` is the unboxed view used by the compiled tier: a primitive
//! kept in a native register, or an owned object reference.

use crate::error::{Error, Result};
use crate::runtime::context::ScopeEntry;
use crate::vm::VmContext;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Shared, mutable heap object
pub type ObjectRef = Rc<RefCell<Object>>;

/// Native function signature: `(vm, this, args)`
pub type NativeFn = Rc<dyn Fn(&VmContext, &Value, &[Value]) -> Result<Value>>;

/// A boxed AVM2 value
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Boolean(bool),
    Integer(i32),
    UInteger(u32),
    Number(f64),
    String(Rc<str>),
    Namespace(Rc<str>),
    Object(ObjectRef),
}

impl Value {
    /// Wrap an object in a fresh reference
    pub fn new_object(object: Object) -> Self {
        Value::Object(Rc::new(RefCell::new(object)))
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    /// Integer, uint or Number
    pub fn is_number(&self) -> bool {
        matches!(self, Value::Integer(_) | Value::UInteger(_) | Value::Number(_))
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    /// ECMA ToBoolean
    pub fn to_boolean(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Boolean(b) => *b,
            Value::Integer(i) => *i != 0,
            Value::UInteger(u) => *u != 0,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            Value::Namespace(_) | Value::Object(_) => true,
        }
    }

    /// ECMA ToNumber
    pub fn to_number(&self) -> f64 {
        match self {
            Value::Undefined => f64::NAN,
            Value::Null => 0.0,
            Value::Boolean(b) => f64::from(u8::from(*b)),
            Value::Integer(i) => f64::from(*i),
            Value::UInteger(u) => f64::from(*u),
            Value::Number(n) => *n,
            Value::String(s) | Value::Namespace(s) => string_to_number(s),
            Value::Object(obj) => match &obj.borrow().kind {
                ObjectKind::Array(items) if items.is_empty() => 0.0,
                ObjectKind::Array(items) if items.len() == 1 => items[0].to_number(),
                _ => f64::NAN,
            },
        }
    }

    /// ECMA ToInt32
    pub fn to_int32(&self) -> i32 {
        match self {
            Value::Integer(i) => *i,
            Value::UInteger(u) => *u as i32,
            Value::Boolean(b) => i32::from(*b),
            other => number_to_int32(other.to_number()),
        }
    }

    /// ECMA ToUint32
    pub fn to_uint32(&self) -> u32 {
        self.to_int32() as u32
    }

    /// ECMA ToString
    pub fn to_ecma_string(&self) -> String {
        match self {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Boolean(b) => b.to_string(),
            Value::Integer(i) => i.to_string(),
            Value::UInteger(u) => u.to_string(),
            Value::Number(n) => number_to_string(*n),
            Value::String(s) | Value::Namespace(s) => s.to_string(),
            Value::Object(obj) => obj.borrow().to_ecma_string(),
        }
    }

    /// ECMA ToString as a shared string
    pub fn to_rc_str(&self) -> Rc<str> {
        match self {
            Value::String(s) => s.clone(),
            other => Rc::from(other.to_ecma_string()),
        }
    }

    /// The `typeof` operator
    pub fn type_of(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "object",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) | Value::UInteger(_) | Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Namespace(_) => "object",
            Value::Object(obj) => match obj.borrow().kind {
                ObjectKind::Function(_) | ObjectKind::Native(_) => "function",
                _ => "object",
            },
        }
    }

    /// Strict equality (`===`); numbers compare by value across int/uint/Number
    pub fn strict_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (a, b) if a.is_number() && b.is_number() => a.to_number() == b.to_number(),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Namespace(a), Value::Namespace(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Abstract equality (`==`)
    pub fn loose_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined | Value::Null, Value::Undefined | Value::Null) => true,
            (Value::Undefined | Value::Null, _) | (_, Value::Undefined | Value::Null) => false,
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Object(_), Value::String(_)) | (Value::String(_), Value::Object(_)) => {
                self.to_ecma_string() == other.to_ecma_string()
            }
            (a, b) if a.is_primitive() && b.is_primitive() => {
                a.to_number() == b.to_number()
            }
            _ => self.strict_equals(other),
        }
    }

    fn is_primitive(&self) -> bool {
        !matches!(self, Value::Object(_) | Value::Namespace(_))
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}i", i),
            Value::UInteger(u) => write!(f, "{}u", u),
            Value::Number(n) => write!(f, "{}", number_to_string(*n)),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Namespace(s) => write!(f, "namespace({})", s),
            Value::Object(obj) => match obj.try_borrow() {
                Ok(o) => write!(f, "[object {}]", o.class_name),
                Err(_) => write!(f, "[object <borrowed>]"),
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_ecma_string())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i)
    }
}

impl From<u32> for Value {
    fn from(u: u32) -> Self {
        Value::UInteger(u)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(Rc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(Rc::from(s))
    }
}

impl From<Rc<str>> for Value {
    fn from(s: Rc<str>) -> Self {
        Value::String(s)
    }
}

/// ECMA ToInt32 on a double
pub fn number_to_int32(n: f64) -> i32 {
    if !n.is_finite() {
        return 0;
    }
    let truncated = n.trunc();
    let modulo = truncated.rem_euclid(4_294_967_296.0);
    modulo as u32 as i32
}

/// ECMA ToString on a double
pub fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if n == 0.0 {
        return "0".to_string();
    }
    let magnitude = n.abs();
    if (1e-6..1e21).contains(&magnitude) {
        return format!("{}", n);
    }
    // Rust prints `1e21`, ECMA wants `1e+21`
    let formatted = format!("{:e}", n);
    match formatted.split_once('e') {
        Some((mantissa, exponent)) if !exponent.starts_with('-') => {
            format!("{}e+{}", mantissa, exponent)
        }
        _ => formatted,
    }
}

/// ECMA ToNumber on a string
pub fn string_to_number(s: &str) -> f64 {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return 0.0;
    }
    match trimmed {
        "Infinity" | "+Infinity" => return f64::INFINITY,
        "-Infinity" => return f64::NEG_INFINITY,
        _ => {}
    }
    if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        return u64::from_str_radix(hex, 16)
            .map(|v| v as f64)
            .unwrap_or(f64::NAN);
    }
    // lexical accepts "inf"/"nan" spellings ECMA does not
    if trimmed
        .bytes()
        .any(|b| b.is_ascii_alphabetic() && b != b'e' && b != b'E')
    {
        return f64::NAN;
    }
    lexical_core::parse::<f64>(trimmed.as_bytes()).unwrap_or(f64::NAN)
}

// ==================== Objects ====================

/// A bytecode closure created by `newfunction`
#[derive(Debug, Clone)]
pub struct Closure {
    pub method: u32,
    pub scope: Vec<ScopeEntry>,
}

/// A host function
#[derive(Clone)]
pub struct NativeFunction {
    pub name: Rc<str>,
    pub func: NativeFn,
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[native {}]", self.name)
    }
}

/// How instances of a class are initialised
#[derive(Debug, Clone)]
pub enum ClassInit {
    /// Built-in class; instances are plain objects with `class_name` set
    Builtin,
    /// Class from the module's class table with its instance initializer
    Bytecode { class_index: u32, iinit: u32 },
}

/// A class object
#[derive(Debug, Clone)]
pub struct ClassObject {
    pub name: Rc<str>,
    pub init: ClassInit,
    /// Prototype given to instances
    pub prototype: ObjectRef,
    pub super_class: Option<ObjectRef>,
    /// Scope captured by `newclass`, used to run the instance initializer
    pub scope: Vec<ScopeEntry>,
    /// Named instance slots
    pub instance_traits: SlotNames,
}

/// Slot trait names and their 1-based slot ids
pub type SlotNames = Rc<[(Rc<str>, u32)]>;

/// Object payload
#[derive(Debug, Clone)]
pub enum ObjectKind {
    Plain,
    Array(Vec<Value>),
    Function(Closure),
    Native(NativeFunction),
    Class(ClassObject),
}

/// A heap object: dynamic properties in insertion order, fixed slots, and a
/// prototype link
#[derive(Debug, Clone)]
pub struct Object {
    pub kind: ObjectKind,
    pub class_name: Rc<str>,
    pub prototype: Option<ObjectRef>,
    properties: Vec<(Rc<str>, Value)>,
    /// Slot 1 is stored at index 0
    pub slots: Vec<Value>,
    /// Names under which slots are also visible as properties
    pub slot_names: Option<SlotNames>,
    /// Explicit enumeration order; replaces positional enumeration when set
    pub enumeration: Option<Vec<Rc<str>>>,
}

impl Object {
    pub fn new(kind: ObjectKind, class_name: impl Into<Rc<str>>) -> Self {
        Self {
            kind,
            class_name: class_name.into(),
            prototype: None,
            properties: Vec::new(),
            slots: Vec::new(),
            slot_names: None,
            enumeration: None,
        }
    }

    pub fn plain() -> Self {
        Self::new(ObjectKind::Plain, "Object")
    }

    pub fn with_prototype(mut self, prototype: Option<ObjectRef>) -> Self {
        self.prototype = prototype;
        self
    }

    pub fn with_slots(mut self, count: u32) -> Self {
        self.slots = vec![Value::Undefined; count as usize];
        self
    }

    /// Allocate slots for named traits
    pub fn with_slot_names(self, names: SlotNames) -> Self {
        let count = names.iter().map(|(_, id)| *id).max().unwrap_or(0);
        let mut object = self.with_slots(count);
        object.slot_names = Some(names);
        object
    }

    fn slot_index(&self, name: &str) -> Option<usize> {
        let names = self.slot_names.as_ref()?;
        let (_, id) = names.iter().find(|(n, _)| &**n == name)?;
        (*id as usize).checked_sub(1)
    }

    /// Own property lookup (slot traits, array indices and `length` included)
    pub fn get_own(&self, name: &str) -> Option<Value> {
        if let Some(index) = self.slot_index(name) {
            return self.slots.get(index).cloned();
        }
        if let ObjectKind::Array(items) = &self.kind {
            if name == "length" {
                return Some(Value::Integer(items.len() as i32));
            }
            if let Some(index) = array_index(name) {
                return items.get(index).cloned();
            }
        }
        self.properties
            .iter()
            .find(|(key, _)| &**key == name)
            .map(|(_, value)| value.clone())
    }

    pub fn has_own(&self, name: &str) -> bool {
        if self.slot_index(name).is_some() {
            return true;
        }
        if let ObjectKind::Array(items) = &self.kind {
            if name == "length" {
                return true;
            }
            if let Some(index) = array_index(name) {
                return index < items.len();
            }
        }
        self.properties.iter().any(|(key, _)| &**key == name)
    }

    /// Create or replace an own property; returns the previous value
    pub fn set_own(&mut self, name: Rc<str>, value: Value) -> Option<Value> {
        if let Some(index) = self.slot_index(&name) {
            if let Some(slot) = self.slots.get_mut(index) {
                return Some(std::mem::replace(slot, value));
            }
        }
        if let ObjectKind::Array(items) = &mut self.kind {
            if let Some(index) = array_index(&name) {
                if index >= items.len() {
                    items.resize(index + 1, Value::Undefined);
                }
                return Some(std::mem::replace(&mut items[index], value));
            }
            if &*name == "length" {
                let len = value.to_uint32() as usize;
                items.resize(len, Value::Undefined);
                return None;
            }
        }
        match self.properties.iter_mut().find(|(key, _)| *key == name) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.properties.push((name, value));
                None
            }
        }
    }

    /// Slot traits are fixed and never deleted
    pub fn delete_own(&mut self, name: &str) -> bool {
        if self.slot_index(name).is_some() {
            return false;
        }
        if let ObjectKind::Array(items) = &mut self.kind {
            if let Some(index) = array_index(name) {
                if let Some(slot) = items.get_mut(index) {
                    *slot = Value::Undefined;
                    return true;
                }
                return false;
            }
        }
        let before = self.properties.len();
        self.properties.retain(|(key, _)| &**key != name);
        before != self.properties.len()
    }

    /// Number of positionally enumerable entries
    pub fn enumerable_len(&self) -> u32 {
        let own = match &self.kind {
            ObjectKind::Array(items) => items.len() + self.properties.len(),
            _ => self.properties.len(),
        };
        own as u32
    }

    /// Name and value at a 1-based enumeration position
    pub fn enumerate_at(&self, position: u32) -> Option<(Value, Value)> {
        let index = (position as usize).checked_sub(1)?;
        if let ObjectKind::Array(items) = &self.kind {
            if let Some(item) = items.get(index) {
                return Some((Value::Integer(index as i32), item.clone()));
            }
            let (key, value) = self.properties.get(index - items.len())?;
            return Some((Value::String(key.clone()), value.clone()));
        }
        let (key, value) = self.properties.get(index)?;
        Some((Value::String(key.clone()), value.clone()))
    }

    pub fn property_names(&self) -> impl Iterator<Item = &Rc<str>> {
        self.properties.iter().map(|(key, _)| key)
    }

    /// 1-based slot read
    pub fn slot(&self, slot: u32) -> Result<Value> {
        slot.checked_sub(1)
            .and_then(|i| self.slots.get(i as usize))
            .cloned()
            .ok_or_else(|| Error::reference_error(format!("slot {} out of range", slot)))
    }

    /// 1-based slot write; returns the previous value
    pub fn set_slot(&mut self, slot: u32, value: Value) -> Result<Value> {
        let target = slot
            .checked_sub(1)
            .and_then(|i| self.slots.get_mut(i as usize))
            .ok_or_else(|| Error::reference_error(format!("slot {} out of range", slot)))?;
        Ok(std::mem::replace(target, value))
    }

    pub fn to_ecma_string(&self) -> String {
        match &self.kind {
            ObjectKind::Array(items) => items
                .iter()
                .map(|v| if v.is_nullish() { String::new() } else { v.to_ecma_string() })
                .collect::<Vec<_>>()
                .join(","),
            ObjectKind::Function(_) | ObjectKind::Native(_) => "function Function() {}".into(),
            ObjectKind::Class(class) => format!("[class {}]", class.name),
            ObjectKind::Plain if self.is_error() => {
                let message = self.get_own("message").map(|m| m.to_ecma_string());
                match message {
                    Some(m) if !m.is_empty() => format!("{}: {}", self.class_name, m),
                    _ => self.class_name.to_string(),
                }
            }
            ObjectKind::Plain => format!("[object {}]", self.class_name),
        }
    }

    fn is_error(&self) -> bool {
        self.class_name.ends_with("Error")
    }
}

fn array_index(name: &str) -> Option<usize> {
    if name.is_empty() || (name.len() > 1 && name.starts_with('0')) {
        return None;
    }
    name.parse::<u32>().ok().map(|i| i as usize)
}

// ==================== Stack types ====================

/// Static type of a stack entry or local, as tracked by the analysis
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StackType {
    /// Unknown: the value lives in memory
    #[default]
    None,
    Object,
    Int,
    UInt,
    Number,
    Boolean,
}

impl StackType {
    /// Unboxed primitive types
    pub fn is_primitive(self) -> bool {
        matches!(
            self,
            StackType::Int | StackType::UInt | StackType::Number | StackType::Boolean
        )
    }

    pub fn is_integral(self) -> bool {
        matches!(self, StackType::Int | StackType::UInt)
    }
}

impl fmt::Display for StackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StackType::None => "none",
            StackType::Object => "object",
            StackType::Int => "int",
            StackType::UInt => "uint",
            StackType::Number => "number",
            StackType::Boolean => "boolean",
        };
        f.write_str(name)
    }
}

/// A typed stack value: a native primitive or an owned object reference
#[derive(Debug, Clone)]
pub enum StackEntry {
    Object(Value),
    Int(i32),
    UInt(u32),
    Number(f64),
    Boolean(bool),
}

impl StackEntry {
    pub fn tag(&self) -> StackType {
        match self {
            StackEntry::Object(_) => StackType::Object,
            StackEntry::Int(_) => StackType::Int,
            StackEntry::UInt(_) => StackType::UInt,
            StackEntry::Number(_) => StackType::Number,
            StackEntry::Boolean(_) => StackType::Boolean,
        }
    }

    /// Box the entry
    pub fn into_value(self) -> Value {
        match self {
            StackEntry::Object(v) => v,
            StackEntry::Int(i) => Value::Integer(i),
            StackEntry::UInt(u) => Value::UInteger(u),
            StackEntry::Number(n) => Value::Number(n),
            StackEntry::Boolean(b) => Value::Boolean(b),
        }
    }

    /// Unbox a value to the requested type with ECMA conversion
    pub fn from_value(value: Value, ty: StackType) -> Result<StackEntry> {
        Ok(match ty {
            StackType::Object => StackEntry::Object(value),
            StackType::Int => StackEntry::Int(value.to_int32()),
            StackType::UInt => StackEntry::UInt(value.to_uint32()),
            StackType::Number => StackEntry::Number(value.to_number()),
            StackType::Boolean => StackEntry::Boolean(value.to_boolean()),
            StackType::None => {
                return Err(Error::internal("cannot materialize a value of type none"))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_formatting() {
        assert_eq!(number_to_string(2.0), "2");
        assert_eq!(number_to_string(-0.5), "-0.5");
        assert_eq!(number_to_string(f64::NAN), "NaN");
        assert_eq!(number_to_string(1e21), "1e+21");
        assert_eq!(number_to_string(1.5e-7), "1.5e-7");
        assert_eq!(number_to_string(f64::NEG_INFINITY), "-Infinity");
    }

    #[test]
    fn test_string_to_number() {
        assert_eq!(string_to_number("  42 "), 42.0);
        assert_eq!(string_to_number(""), 0.0);
        assert_eq!(string_to_number("0x1F"), 31.0);
        assert_eq!(string_to_number("1.5e3"), 1500.0);
        assert_eq!(string_to_number("-Infinity"), f64::NEG_INFINITY);
        assert!(string_to_number("inf").is_nan());
        assert!(string_to_number("12px").is_nan());
    }

    #[test]
    fn test_to_int32_wraps() {
        assert_eq!(number_to_int32(4_294_967_296.0 + 5.0), 5);
        assert_eq!(number_to_int32(-1.5), -1);
        assert_eq!(number_to_int32(2_147_483_648.0), i32::MIN);
        assert_eq!(number_to_int32(f64::NAN), 0);
        assert_eq!(Value::from(-1).to_uint32(), u32::MAX);
    }

    #[test]
    fn test_equality() {
        assert!(Value::Integer(2).strict_equals(&Value::Number(2.0)));
        assert!(!Value::Boolean(true).strict_equals(&Value::Integer(1)));
        assert!(Value::Boolean(true).loose_equals(&Value::Integer(1)));
        assert!(Value::from("3").loose_equals(&Value::Number(3.0)));
        assert!(Value::Null.loose_equals(&Value::Undefined));
        assert!(!Value::Null.loose_equals(&Value::Integer(0)));
        assert!(!Value::Number(f64::NAN).strict_equals(&Value::Number(f64::NAN)));
    }

    #[test]
    fn test_array_properties() {
        let mut array = Object::new(ObjectKind::Array(vec![Value::from(1), Value::from(2)]), "Array");
        assert_eq!(array.get_own("length").map(|v| v.to_int32()), Some(2));
        array.set_own(Rc::from("3"), Value::from(9));
        assert_eq!(array.get_own("length").map(|v| v.to_int32()), Some(4));
        assert!(array.get_own("2").map(|v| matches!(v, Value::Undefined)).unwrap_or(false));
        assert_eq!(Value::new_object(array).to_ecma_string(), "1,2,,9");
    }

    #[test]
    fn test_slots_are_one_based() {
        let mut obj = Object::plain().with_slots(2);
        obj.set_slot(1, Value::from(7)).unwrap();
        assert_eq!(obj.slot(1).unwrap().to_int32(), 7);
        assert!(obj.slot(0).is_err());
        assert!(obj.slot(3).is_err());
    }

    #[test]
    fn test_named_slots() {
        let names: SlotNames = Rc::from(vec![(Rc::from("x"), 1), (Rc::from("y"), 2)]);
        let mut obj = Object::plain().with_slot_names(names);
        assert_eq!(obj.slots.len(), 2);
        obj.set_own(Rc::from("y"), Value::from(4));
        assert_eq!(obj.slot(2).unwrap().to_int32(), 4);
        assert!(obj.has_own("x"));
        assert!(!obj.delete_own("x"));
        assert_eq!(obj.property_names().count(), 0);
    }

    #[test]
    fn test_stack_entry_conversions() {
        let entry = StackEntry::from_value(Value::Number(3.7), StackType::Int).unwrap();
        assert!(matches!(entry, StackEntry::Int(3)));
        assert_eq!(entry.tag(), StackType::Int);
        let boxed = StackEntry::UInt(u32::MAX).into_value();
        assert!(matches!(boxed, Value::UInteger(u32::MAX)));
        let unboxed = StackEntry::from_value(Value::from("12"), StackType::Number).unwrap();
        assert!(matches!(unboxed, StackEntry::Number(n) if n == 12.0));
        assert!(StackEntry::from_value(Value::Null, StackType::None).is_err());
    }

    #[test]
    fn test_refcount_follows_clones() {
        let obj = Value::new_object(Object::plain());
        let rc = obj.as_object().unwrap().clone();
        assert_eq!(Rc::strong_count(&rc), 2);
        let entry = StackEntry::Object(obj.clone());
        assert_eq!(Rc::strong_count(&rc), 3);
        drop(entry);
        drop(obj);
        assert_eq!(Rc::strong_count(&rc), 1);
    }
}
