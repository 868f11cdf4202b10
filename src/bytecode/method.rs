//! Method and class descriptions
//!
//! These are produced by the module loader (or built directly in tests) and
//! are immutable once handed to a [`VmContext`](crate::vm::VmContext).

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Method flags from the method signature
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct MethodFlags: u8 {
        /// Build an `arguments` array in the local after the parameters
        const NEED_ARGUMENTS = 0x01;
        const NEED_ACTIVATION = 0x02;
        /// Collect extra arguments into a rest array after the parameters
        const NEED_REST = 0x04;
        const HAS_OPTIONAL = 0x08;
        const SET_DXNS = 0x40;
        const HAS_PARAM_NAMES = 0x80;
    }
}

/// Declared parameter type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    #[default]
    Any,
    Int,
    UInt,
    Number,
    Boolean,
    String,
}

/// Default value of an optional parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultValue {
    Undefined,
    Null,
    Bool(bool),
    Int(i32),
    UInt(u32),
    Number(f64),
    String(String),
}

/// One entry of a method's exception table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    /// Start of the protected range (inclusive)
    pub from: u32,
    /// End of the protected range (exclusive)
    pub to: u32,
    /// Handler entry offset
    pub target: u32,
    /// Multiname index of the caught type; 0 catches everything
    #[serde(default)]
    pub exc_type: u32,
    /// Multiname index of the catch variable
    #[serde(default)]
    pub var_name: u32,
}

impl ExceptionInfo {
    pub fn covers(&self, offset: u32) -> bool {
        self.from <= offset && offset < self.to
    }
}

/// A fixed slot of an activation or class instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotTrait {
    pub name: String,
    pub slot_id: u32,
}

/// A method bound to a class prototype or class object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodTrait {
    pub name: String,
    pub method: u32,
}

/// Parsed method body
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MethodBody {
    pub code: Vec<u8>,
    pub max_stack: u32,
    pub local_count: u32,
    #[serde(default)]
    pub init_scope_depth: u32,
    #[serde(default)]
    pub max_scope_depth: u32,
    #[serde(default)]
    pub exceptions: Vec<ExceptionInfo>,
    /// Activation slots
    #[serde(default)]
    pub traits: Vec<SlotTrait>,
}

impl MethodBody {
    pub fn new(code: Vec<u8>, max_stack: u32, local_count: u32) -> Self {
        Self {
            code,
            max_stack,
            local_count,
            ..Self::default()
        }
    }

    pub fn with_exceptions(mut self, exceptions: Vec<ExceptionInfo>) -> Self {
        self.exceptions = exceptions;
        self
    }

    /// Handlers whose protected range covers `offset`, in table order
    pub fn handlers_at(&self, offset: u32) -> impl Iterator<Item = &ExceptionInfo> {
        self.exceptions.iter().filter(move |e| e.covers(offset))
    }

    /// Number of activation slots
    pub fn activation_slot_count(&self) -> u32 {
        self.traits.iter().map(|t| t.slot_id).max().unwrap_or(0)
    }
}

/// A method signature plus its body
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MethodInfo {
    pub name: String,
    #[serde(default)]
    pub param_types: Vec<ParamType>,
    /// Defaults for the trailing parameters
    #[serde(default)]
    pub optional: Vec<DefaultValue>,
    #[serde(default)]
    pub flags: MethodFlags,
    pub body: MethodBody,
}

impl MethodInfo {
    pub fn new(name: impl Into<String>, body: MethodBody) -> Self {
        Self {
            name: name.into(),
            body,
            ..Self::default()
        }
    }

    pub fn with_params(mut self, params: Vec<ParamType>) -> Self {
        self.param_types = params;
        self
    }

    pub fn with_flags(mut self, flags: MethodFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_optional(mut self, optional: Vec<DefaultValue>) -> Self {
        self.optional = optional;
        self.flags |= MethodFlags::HAS_OPTIONAL;
        self
    }

    pub fn param_count(&self) -> usize {
        self.param_types.len()
    }
}

/// A class definition from the module's class table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassInfo {
    pub name: String,
    /// Instance initializer (constructor) method
    pub iinit: u32,
    /// Class initializer, run by `newclass`
    #[serde(default)]
    pub cinit: Option<u32>,
    #[serde(default)]
    pub slots: Vec<SlotTrait>,
    /// Instance methods, installed on the prototype
    #[serde(default)]
    pub methods: Vec<MethodTrait>,
    #[serde(default)]
    pub static_methods: Vec<MethodTrait>,
}

impl ClassInfo {
    pub fn instance_slot_count(&self) -> u32 {
        self.slots.iter().map(|t| t.slot_id).max().unwrap_or(0)
    }

    /// Whether `method` belongs to this class's instance side
    pub fn owns_method(&self, method: u32) -> bool {
        self.iinit == method || self.methods.iter().any(|m| m.method == method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_range_is_half_open() {
        let info = ExceptionInfo {
            from: 2,
            to: 6,
            target: 10,
            exc_type: 0,
            var_name: 0,
        };
        assert!(!info.covers(1));
        assert!(info.covers(2));
        assert!(info.covers(5));
        assert!(!info.covers(6));
    }

    #[test]
    fn test_method_json_defaults() {
        let json = r#"{
            "name": "f",
            "param_types": ["int", "any"],
            "flags": "NEED_REST",
            "body": { "code": [71], "max_stack": 1, "local_count": 3 }
        }"#;
        let method: MethodInfo = serde_json::from_str(json).unwrap();
        assert_eq!(method.param_types, vec![ParamType::Int, ParamType::Any]);
        assert!(method.flags.contains(MethodFlags::NEED_REST));
        assert!(method.body.exceptions.is_empty());
        assert_eq!(method.body.code, vec![0x47]);
    }

    #[test]
    fn test_slot_counts() {
        let class = ClassInfo {
            name: "Point".into(),
            iinit: 3,
            slots: vec![
                SlotTrait { name: "x".into(), slot_id: 1 },
                SlotTrait { name: "y".into(), slot_id: 2 },
            ],
            ..ClassInfo::default()
        };
        assert_eq!(class.instance_slot_count(), 2);
        assert!(class.owns_method(3));
        assert!(!class.owns_method(4));
    }
}
