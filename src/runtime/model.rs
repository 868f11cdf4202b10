//! Object model interface
//!
//! The execution core never implements object semantics itself. Property
//! access, calls, construction, scope lookup, type tests and enumeration all
//! go through this trait, so an embedder can plug in its own class library.
//! [`StandardModel`](crate::runtime::builtins::StandardModel) is the
//! reference implementation.
//!
//! Ownership convention: arguments are passed by reference or by value
//! exactly as the opcode's stack effect transfers them. Values handed over in
//! a `Vec` are owned by the callee; references are borrowed for the call.

use crate::bytecode::QualifiedName;
use crate::error::{Error, ErrorKind, Result};
use crate::runtime::context::ScopeEntry;
use crate::runtime::value::Value;
use crate::vm::VmContext;
use std::rc::Rc;

pub trait ObjectModel {
    /// The global object, scope 0 of every top-level invocation
    fn global(&self) -> Value;

    // ========== Properties ==========

    fn get_property(&self, vm: &VmContext, object: &Value, name: &QualifiedName) -> Result<Value>;

    fn set_property(
        &self,
        vm: &VmContext,
        object: &Value,
        name: &QualifiedName,
        value: Value,
    ) -> Result<()>;

    /// `initproperty`; only differs from `set_property` for read-only traits
    fn init_property(
        &self,
        vm: &VmContext,
        object: &Value,
        name: &QualifiedName,
        value: Value,
    ) -> Result<()> {
        self.set_property(vm, object, name, value)
    }

    fn delete_property(&self, vm: &VmContext, object: &Value, name: &QualifiedName)
        -> Result<bool>;

    /// The `in` operator
    fn has_property(&self, vm: &VmContext, object: &Value, name: &QualifiedName) -> Result<bool>;

    fn get_slot(&self, vm: &VmContext, object: &Value, slot: u32) -> Result<Value>;

    fn set_slot(&self, vm: &VmContext, object: &Value, slot: u32, value: Value) -> Result<()>;

    // ========== Calls ==========

    fn call(&self, vm: &VmContext, function: &Value, this: &Value, args: Vec<Value>)
        -> Result<Value>;

    fn call_property(
        &self,
        vm: &VmContext,
        object: &Value,
        name: &QualifiedName,
        args: Vec<Value>,
    ) -> Result<Value> {
        let function = self.get_property(vm, object, name)?;
        if function.is_nullish() {
            return Err(Error::type_error(format!("{} is not a function", name)));
        }
        self.call(vm, &function, object, args)
    }

    fn construct(&self, vm: &VmContext, constructor: &Value, args: Vec<Value>) -> Result<Value>;

    fn construct_property(
        &self,
        vm: &VmContext,
        object: &Value,
        name: &QualifiedName,
        args: Vec<Value>,
    ) -> Result<Value> {
        let constructor = self.get_property(vm, object, name)?;
        self.construct(vm, &constructor, args)
    }

    /// `constructsuper` from inside `method`
    fn construct_super(
        &self,
        vm: &VmContext,
        method: u32,
        this: &Value,
        args: Vec<Value>,
    ) -> Result<()>;

    fn get_super(
        &self,
        vm: &VmContext,
        method: u32,
        this: &Value,
        name: &QualifiedName,
    ) -> Result<Value>;

    fn set_super(
        &self,
        vm: &VmContext,
        method: u32,
        this: &Value,
        name: &QualifiedName,
        value: Value,
    ) -> Result<()>;

    fn call_super(
        &self,
        vm: &VmContext,
        method: u32,
        this: &Value,
        name: &QualifiedName,
        args: Vec<Value>,
    ) -> Result<Value> {
        let function = self.get_super(vm, method, this, name)?;
        self.call(vm, &function, this, args)
    }

    // ========== Lookup ==========

    /// `findproperty` / `findpropstrict`: innermost scope object that has `name`
    fn find_property(
        &self,
        vm: &VmContext,
        scope: &[ScopeEntry],
        name: &QualifiedName,
        strict: bool,
    ) -> Result<Value>;

    /// `finddef`: the script object defining `name`
    fn find_definition(&self, vm: &VmContext, name: &QualifiedName) -> Result<Value>;

    // ========== Object creation ==========

    fn new_object(&self, vm: &VmContext, properties: Vec<(Rc<str>, Value)>) -> Result<Value>;

    fn new_array(&self, vm: &VmContext, items: Vec<Value>) -> Result<Value>;

    fn new_activation(&self, vm: &VmContext, method: u32) -> Result<Value>;

    fn new_catch(&self, vm: &VmContext, method: u32, handler: u32) -> Result<Value>;

    fn new_function(&self, vm: &VmContext, method: u32, scope: Vec<ScopeEntry>) -> Result<Value>;

    fn new_class(
        &self,
        vm: &VmContext,
        class_index: u32,
        base: Value,
        scope: Vec<ScopeEntry>,
    ) -> Result<Value>;

    /// `applytype` for parameterized types
    fn apply_type(&self, _vm: &VmContext, _factory: &Value, _params: Vec<Value>) -> Result<Value> {
        Err(Error::unsupported("parameterized types are not supported"))
    }

    // ========== Enumeration ==========

    /// Custom enumeration hook; `Ok(None)` means positional enumeration
    fn has_next(&self, _vm: &VmContext, _object: &Value, _index: u32) -> Result<Option<u32>> {
        Ok(None)
    }

    /// Number of positionally enumerable entries
    fn enumerable_len(&self, vm: &VmContext, object: &Value) -> u32;

    fn next_name(&self, vm: &VmContext, object: &Value, index: u32) -> Result<Value>;

    fn next_value(&self, vm: &VmContext, object: &Value, index: u32) -> Result<Value>;

    // ========== Types ==========

    fn is_type(&self, vm: &VmContext, value: &Value, type_name: &QualifiedName) -> Result<bool>;

    fn is_type_late(&self, vm: &VmContext, value: &Value, type_value: &Value) -> Result<bool>;

    fn as_type(&self, vm: &VmContext, value: Value, type_name: &QualifiedName) -> Result<Value> {
        if self.is_type(vm, &value, type_name)? {
            Ok(value)
        } else {
            Ok(Value::Null)
        }
    }

    fn as_type_late(&self, vm: &VmContext, value: Value, type_value: &Value) -> Result<Value> {
        if self.is_type_late(vm, &value, type_value)? {
            Ok(value)
        } else {
            Ok(Value::Null)
        }
    }

    fn coerce(&self, vm: &VmContext, value: Value, type_name: &QualifiedName) -> Result<Value>;

    fn instance_of(&self, vm: &VmContext, value: &Value, constructor: &Value) -> Result<bool>;

    /// Error object for a helper-raised runtime error
    fn new_error(&self, vm: &VmContext, kind: ErrorKind, message: &str) -> Value;

    // ========== XML ==========

    fn get_descendants(&self, _vm: &VmContext, _object: &Value, name: &QualifiedName) -> Result<Value> {
        Err(Error::unsupported(format!("descendants of {} require XML support", name)))
    }

    fn check_filter(&self, _vm: &VmContext, value: &Value) -> Result<()> {
        Err(Error::type_error(format!(
            "Filter operator not supported on type {}",
            value.type_of()
        )))
    }
}
