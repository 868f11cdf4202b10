//! Shared test helpers for integration tests
#![allow(dead_code)]

use avm2::bytecode::{
    CodeBuilder, ConstantPoolData, MethodBody, MethodInfo, ParamType, QualifiedName,
};
use avm2::jit::CompilationTier;
use avm2::runtime::{ObjectModel, ScopeEntry, StandardModel};
use avm2::{ErrorKind, Result, Value, VmConfig, VmContext};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

/// Finish `b` into a method with no declared parameters
pub fn method(name: &str, b: &mut CodeBuilder, max_stack: u32, locals: u32) -> MethodInfo {
    MethodInfo::new(name, MethodBody::new(b.finish().unwrap(), max_stack, locals))
}

pub fn untyped(method: MethodInfo, params: usize) -> MethodInfo {
    method.with_params(vec![ParamType::Any; params])
}

/// Build a VM over `methods` with the standard model
pub fn vm(methods: Vec<MethodInfo>, pool: ConstantPoolData, config: VmConfig) -> VmContext {
    VmContext::builder()
        .pool(Arc::new(pool))
        .methods(methods)
        .model(Rc::new(StandardModel::new()))
        .config(config)
        .build()
        .unwrap()
}

/// Run method 0 of `methods` once interpreted and once compiled
pub fn run_both_tiers(
    methods: Vec<MethodInfo>,
    pool: ConstantPoolData,
    args: Vec<Value>,
) -> (Result<Value>, Result<Value>) {
    let interpreted = vm(methods.clone(), pool.clone(), VmConfig::interpreter_only());
    let a = interpreted.invoke(0, Value::Null, args.clone());
    assert_eq!(interpreted.tier_of(0), CompilationTier::Interpreted);

    let compiled = vm(methods, pool, VmConfig::jit_always());
    let b = compiled.invoke(0, Value::Null, args);
    assert_eq!(
        compiled.tier_of(0),
        CompilationTier::Compiled,
        "method did not compile"
    );
    (a, b)
}

/// Value equality across tiers that compares numbers by value only
pub fn same_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Object(_), Value::Object(_)) => a.to_ecma_string() == b.to_ecma_string(),
        _ if a.is_number() && b.is_number() => {
            let (x, y) = (a.to_number(), b.to_number());
            x == y || (x.is_nan() && y.is_nan())
        }
        _ => a.strict_equals(b),
    }
}

/// Value equality that also requires both tiers to agree on the variant;
/// NaN matches NaN and the sign of zero is significant
pub fn strict_same_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            (x.is_nan() && y.is_nan()) || x.to_bits() == y.to_bits()
        }
        (Value::Integer(x), Value::Integer(y)) => x == y,
        (Value::UInteger(x), Value::UInteger(y)) => x == y,
        (Value::Boolean(x), Value::Boolean(y)) => x == y,
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Namespace(x), Value::Namespace(y)) => x == y,
        (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
        (Value::Object(_), Value::Object(_)) => a.to_ecma_string() == b.to_ecma_string(),
        _ => false,
    }
}

/// Like `assert_same_outcome`, but errors must agree too and values are
/// compared with `strict_same_value`
pub fn assert_same_outcome_strict(results: (Result<Value>, Result<Value>)) -> Option<Value> {
    match results {
        (Ok(a), Ok(b)) => {
            assert!(strict_same_value(&a, &b), "interpreter {:?} vs compiled {:?}", a, b);
            Some(a)
        }
        (Err(a), Err(b)) => {
            assert_eq!(a.to_string(), b.to_string());
            None
        }
        (a, b) => panic!("tiers disagree: {:?} vs {:?}", a, b),
    }
}

pub fn assert_same_outcome(results: (Result<Value>, Result<Value>)) -> Value {
    match results {
        (Ok(a), Ok(b)) => {
            assert!(same_value(&a, &b), "interpreter {:?} vs compiled {:?}", a, b);
            a
        }
        (Err(a), Err(b)) => panic!("both tiers failed: {} / {}", a, b),
        (a, b) => panic!("tiers disagree: {:?} vs {:?}", a, b),
    }
}

// ==================== Recording model ====================

/// `StandardModel` wrapper that logs every object-model entry point it sees
pub struct RecordingModel {
    inner: StandardModel,
    log: RefCell<Vec<String>>,
}

impl RecordingModel {
    pub fn new() -> Self {
        Self {
            inner: StandardModel::new(),
            log: RefCell::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.log.borrow().clone()
    }

    pub fn output(&self) -> Vec<String> {
        self.inner.output()
    }

    fn record(&self, entry: impl Into<String>) {
        self.log.borrow_mut().push(entry.into());
    }
}

impl ObjectModel for RecordingModel {
    fn global(&self) -> Value {
        self.inner.global()
    }

    fn get_property(&self, vm: &VmContext, object: &Value, name: &QualifiedName) -> Result<Value> {
        self.record(format!("get_property {}", name));
        self.inner.get_property(vm, object, name)
    }

    fn set_property(
        &self,
        vm: &VmContext,
        object: &Value,
        name: &QualifiedName,
        value: Value,
    ) -> Result<()> {
        self.record(format!("set_property {}", name));
        self.inner.set_property(vm, object, name, value)
    }

    fn init_property(
        &self,
        vm: &VmContext,
        object: &Value,
        name: &QualifiedName,
        value: Value,
    ) -> Result<()> {
        self.record(format!("init_property {}", name));
        self.inner.init_property(vm, object, name, value)
    }

    fn delete_property(&self, vm: &VmContext, object: &Value, name: &QualifiedName) -> Result<bool> {
        self.record(format!("delete_property {}", name));
        self.inner.delete_property(vm, object, name)
    }

    fn has_property(&self, vm: &VmContext, object: &Value, name: &QualifiedName) -> Result<bool> {
        self.record(format!("has_property {}", name));
        self.inner.has_property(vm, object, name)
    }

    fn get_slot(&self, vm: &VmContext, object: &Value, slot: u32) -> Result<Value> {
        self.record(format!("get_slot {}", slot));
        self.inner.get_slot(vm, object, slot)
    }

    fn set_slot(&self, vm: &VmContext, object: &Value, slot: u32, value: Value) -> Result<()> {
        self.record(format!("set_slot {}", slot));
        self.inner.set_slot(vm, object, slot, value)
    }

    fn call(&self, vm: &VmContext, function: &Value, this: &Value, args: Vec<Value>) -> Result<Value> {
        self.record(format!("call/{}", args.len()));
        self.inner.call(vm, function, this, args)
    }

    fn call_property(
        &self,
        vm: &VmContext,
        object: &Value,
        name: &QualifiedName,
        args: Vec<Value>,
    ) -> Result<Value> {
        self.record(format!("call_property {}/{}", name, args.len()));
        self.inner.call_property(vm, object, name, args)
    }

    fn construct(&self, vm: &VmContext, constructor: &Value, args: Vec<Value>) -> Result<Value> {
        self.record(format!("construct/{}", args.len()));
        self.inner.construct(vm, constructor, args)
    }

    fn construct_super(&self, vm: &VmContext, method: u32, this: &Value, args: Vec<Value>) -> Result<()> {
        self.record("construct_super");
        self.inner.construct_super(vm, method, this, args)
    }

    fn get_super(&self, vm: &VmContext, method: u32, this: &Value, name: &QualifiedName) -> Result<Value> {
        self.record(format!("get_super {}", name));
        self.inner.get_super(vm, method, this, name)
    }

    fn set_super(
        &self,
        vm: &VmContext,
        method: u32,
        this: &Value,
        name: &QualifiedName,
        value: Value,
    ) -> Result<()> {
        self.record(format!("set_super {}", name));
        self.inner.set_super(vm, method, this, name, value)
    }

    fn find_property(
        &self,
        vm: &VmContext,
        scope: &[ScopeEntry],
        name: &QualifiedName,
        strict: bool,
    ) -> Result<Value> {
        self.record(format!("find_property {}", name));
        self.inner.find_property(vm, scope, name, strict)
    }

    fn find_definition(&self, vm: &VmContext, name: &QualifiedName) -> Result<Value> {
        self.record(format!("find_definition {}", name));
        self.inner.find_definition(vm, name)
    }

    fn new_object(&self, vm: &VmContext, properties: Vec<(Rc<str>, Value)>) -> Result<Value> {
        self.record(format!("new_object/{}", properties.len()));
        self.inner.new_object(vm, properties)
    }

    fn new_array(&self, vm: &VmContext, items: Vec<Value>) -> Result<Value> {
        self.record(format!("new_array/{}", items.len()));
        self.inner.new_array(vm, items)
    }

    fn new_activation(&self, vm: &VmContext, method: u32) -> Result<Value> {
        self.record("new_activation");
        self.inner.new_activation(vm, method)
    }

    fn new_catch(&self, vm: &VmContext, method: u32, handler: u32) -> Result<Value> {
        self.record("new_catch");
        self.inner.new_catch(vm, method, handler)
    }

    fn new_function(&self, vm: &VmContext, method: u32, scope: Vec<ScopeEntry>) -> Result<Value> {
        self.record(format!("new_function {}", method));
        self.inner.new_function(vm, method, scope)
    }

    fn new_class(
        &self,
        vm: &VmContext,
        class_index: u32,
        base: Value,
        scope: Vec<ScopeEntry>,
    ) -> Result<Value> {
        self.record(format!("new_class {}", class_index));
        self.inner.new_class(vm, class_index, base, scope)
    }

    fn has_next(&self, vm: &VmContext, object: &Value, index: u32) -> Result<Option<u32>> {
        self.record(format!("has_next {}", index));
        self.inner.has_next(vm, object, index)
    }

    fn enumerable_len(&self, vm: &VmContext, object: &Value) -> u32 {
        self.inner.enumerable_len(vm, object)
    }

    fn next_name(&self, vm: &VmContext, object: &Value, index: u32) -> Result<Value> {
        self.record(format!("next_name {}", index));
        self.inner.next_name(vm, object, index)
    }

    fn next_value(&self, vm: &VmContext, object: &Value, index: u32) -> Result<Value> {
        self.record(format!("next_value {}", index));
        self.inner.next_value(vm, object, index)
    }

    fn is_type(&self, vm: &VmContext, value: &Value, type_name: &QualifiedName) -> Result<bool> {
        self.record(format!("is_type {}", type_name));
        self.inner.is_type(vm, value, type_name)
    }

    fn is_type_late(&self, vm: &VmContext, value: &Value, type_value: &Value) -> Result<bool> {
        self.record("is_type_late");
        self.inner.is_type_late(vm, value, type_value)
    }

    fn coerce(&self, vm: &VmContext, value: Value, type_name: &QualifiedName) -> Result<Value> {
        self.record(format!("coerce {}", type_name));
        self.inner.coerce(vm, value, type_name)
    }

    fn instance_of(&self, vm: &VmContext, value: &Value, constructor: &Value) -> Result<bool> {
        self.record("instance_of");
        self.inner.instance_of(vm, value, constructor)
    }

    fn new_error(&self, vm: &VmContext, kind: ErrorKind, message: &str) -> Value {
        self.record(format!("new_error {}", kind));
        self.inner.new_error(vm, kind, message)
    }
}

/// Build a VM over a shared `RecordingModel`
pub fn recording_vm(
    methods: Vec<MethodInfo>,
    pool: ConstantPoolData,
    config: VmConfig,
) -> (VmContext, Rc<RecordingModel>) {
    let model = Rc::new(RecordingModel::new());
    let vm = VmContext::builder()
        .pool(Arc::new(pool))
        .methods(methods)
        .model(model.clone())
        .config(config)
        .build()
        .unwrap();
    (vm, model)
}
