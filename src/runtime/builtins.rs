//! Reference object model
//!
//! `StandardModel` is a small but complete implementation of [`ObjectModel`]:
//! a global object with `trace`, `Math` and the core classes, dynamic
//! properties with prototype chains, named slots, closures over the scope
//! stack, and classes from the module's class table.

use super::context::ScopeEntry;
use super::model::ObjectModel;
use super::value::{
    ClassInit, ClassObject, Closure, NativeFunction, Object, ObjectKind, ObjectRef, SlotNames,
    Value,
};
use crate::bytecode::QualifiedName;
use crate::error::{Error, ErrorKind, Result};
use crate::vm::VmContext;
use rustc_hash::FxHashMap as HashMap;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;

const ERROR_CLASSES: &[&str] = &[
    "TypeError",
    "ReferenceError",
    "RangeError",
    "ArgumentError",
    "VerifyError",
];

/// Reference implementation of the object model
pub struct StandardModel {
    global: ObjectRef,
    object_prototype: ObjectRef,
    array_prototype: ObjectRef,
    /// Classes by name, for type tests and error construction
    classes: RefCell<HashMap<Rc<str>, ObjectRef>>,
    /// Classes created by `newclass`, by class-table index
    bytecode_classes: RefCell<HashMap<u32, ObjectRef>>,
    output: Rc<RefCell<Vec<String>>>,
}

impl Default for StandardModel {
    fn default() -> Self {
        Self::new()
    }
}

impl StandardModel {
    pub fn new() -> Self {
        let object_prototype = Rc::new(RefCell::new(Object::plain()));
        let array_prototype = new_ref(Object::plain().with_prototype(Some(object_prototype.clone())));
        let global = new_ref(
            Object::new(ObjectKind::Plain, "global").with_prototype(Some(object_prototype.clone())),
        );
        let model = Self {
            global,
            object_prototype,
            array_prototype,
            classes: RefCell::new(HashMap::default()),
            bytecode_classes: RefCell::new(HashMap::default()),
            output: Rc::new(RefCell::new(Vec::new())),
        };
        model.register_classes();
        model.register_trace();
        model.register_math();
        model
    }

    /// Lines written by `trace` so far
    pub fn output(&self) -> Vec<String> {
        self.output.borrow().clone()
    }

    /// Drain the `trace` output
    pub fn take_output(&self) -> Vec<String> {
        std::mem::take(&mut *self.output.borrow_mut())
    }

    fn define_global(&self, name: &str, value: Value) {
        self.global.borrow_mut().set_own(Rc::from(name), value);
    }

    fn register_classes(&self) {
        let object_class = builtin_class("Object", self.object_prototype.clone(), None);
        self.add_class(object_class.clone());
        self.add_class(builtin_class(
            "Array",
            self.array_prototype.clone(),
            Some(object_class.clone()),
        ));

        let error_prototype = new_ref(
            Object::new(ObjectKind::Plain, "Error").with_prototype(Some(self.object_prototype.clone())),
        );
        error_prototype
            .borrow_mut()
            .set_own(Rc::from("message"), Value::from(""));
        let error_class = builtin_class("Error", error_prototype.clone(), Some(object_class));
        self.add_class(error_class.clone());
        for name in ERROR_CLASSES {
            let prototype = new_ref(
                Object::new(ObjectKind::Plain, *name).with_prototype(Some(error_prototype.clone())),
            );
            self.add_class(builtin_class(name, prototype, Some(error_class.clone())));
        }
    }

    fn add_class(&self, class: ObjectRef) {
        let name = match &class.borrow().kind {
            ObjectKind::Class(c) => c.name.clone(),
            _ => return,
        };
        self.define_global(&name, Value::Object(class.clone()));
        self.classes.borrow_mut().insert(name, class);
    }

    fn register_trace(&self) {
        let output = self.output.clone();
        self.define_global(
            "trace",
            native("trace", move |_vm, _this, args| {
                let line = args
                    .iter()
                    .map(Value::to_ecma_string)
                    .collect::<Vec<_>>()
                    .join(" ");
                debug!(target: "avm2::trace", "{}", line);
                output.borrow_mut().push(line);
                Ok(Value::Undefined)
            }),
        );
    }

    fn register_math(&self) {
        let mut math = Object::new(ObjectKind::Plain, "Math")
            .with_prototype(Some(self.object_prototype.clone()));
        math.set_own(Rc::from("PI"), Value::Number(std::f64::consts::PI));
        math.set_own(
            Rc::from("abs"),
            native("abs", |_vm, _this, args| Ok(Value::Number(number_arg(args, 0).abs()))),
        );
        math.set_own(
            Rc::from("floor"),
            native("floor", |_vm, _this, args| {
                Ok(Value::Number(number_arg(args, 0).floor()))
            }),
        );
        math.set_own(
            Rc::from("max"),
            native("max", |_vm, _this, args| {
                let mut result = f64::NEG_INFINITY;
                for arg in args {
                    let n = arg.to_number();
                    if n.is_nan() {
                        return Ok(Value::Number(f64::NAN));
                    }
                    result = result.max(n);
                }
                Ok(Value::Number(result))
            }),
        );
        self.define_global("Math", Value::new_object(math));
    }

    fn class_named(&self, name: &str) -> Option<ObjectRef> {
        self.classes.borrow().get(name).cloned()
    }

    /// Bytecode class whose instance side defines `method`
    fn owning_class(&self, vm: &VmContext, method: u32) -> Result<ObjectRef> {
        let index = vm
            .classes()
            .iter()
            .position(|c| c.owns_method(method))
            .ok_or_else(|| {
                Error::reference_error(format!("method {} does not belong to a class", method))
            })?;
        self.bytecode_classes
            .borrow()
            .get(&(index as u32))
            .cloned()
            .ok_or_else(|| Error::reference_error(format!("class {} is not initialized", index)))
    }

    fn make_closure(&self, method: u32, scope: Vec<ScopeEntry>) -> Value {
        Value::new_object(
            Object::new(ObjectKind::Function(Closure { method, scope }), "Function")
                .with_prototype(Some(self.object_prototype.clone())),
        )
    }

    /// Run the constructor of `class` on an already allocated instance
    fn initialize(&self, vm: &VmContext, class: &ObjectRef, this: &Value, args: Vec<Value>) -> Result<()> {
        let (init, scope, name) = match &class.borrow().kind {
            ObjectKind::Class(c) => (c.init.clone(), c.scope.clone(), c.name.clone()),
            _ => return Err(Error::type_error("not a class")),
        };
        match init {
            ClassInit::Bytecode { iinit, .. } => {
                let mut scope = scope;
                scope.push(ScopeEntry::new(Value::Object(class.clone())));
                vm.invoke_closure(iinit, this.clone(), args, scope)?;
            }
            ClassInit::Builtin if is_error_class(&name) => {
                if let (Some(message), Value::Object(obj)) = (args.first(), this) {
                    obj.borrow_mut()
                        .set_own(Rc::from("message"), Value::String(message.to_rc_str()));
                }
            }
            ClassInit::Builtin => {}
        }
        Ok(())
    }

    fn construct_class(&self, vm: &VmContext, class: &ObjectRef, args: Vec<Value>) -> Result<Value> {
        let (name, prototype, traits) = match &class.borrow().kind {
            ObjectKind::Class(c) => (c.name.clone(), c.prototype.clone(), c.instance_traits.clone()),
            _ => return Err(Error::type_error("not a class")),
        };
        if &*name == "Array" {
            let items = match args.as_slice() {
                [Value::Integer(n)] if *n >= 0 => vec![Value::Undefined; *n as usize],
                _ => args,
            };
            return Ok(Value::new_object(
                Object::new(ObjectKind::Array(items), "Array").with_prototype(Some(prototype)),
            ));
        }
        let mut instance = Object::new(ObjectKind::Plain, name).with_prototype(Some(prototype));
        if !traits.is_empty() {
            instance = instance.with_slot_names(traits);
        }
        let instance = Value::new_object(instance);
        self.initialize(vm, class, &instance, args)?;
        Ok(instance)
    }

    fn prototype_of_constructor(&self, constructor: &Value) -> Result<ObjectRef> {
        let obj = constructor
            .as_object()
            .ok_or_else(|| Error::type_error("instanceof requires a class or function"))?;
        let o = obj.borrow();
        match &o.kind {
            ObjectKind::Class(c) => Ok(c.prototype.clone()),
            ObjectKind::Function(_) | ObjectKind::Native(_) => match o.get_own("prototype") {
                Some(Value::Object(p)) => Ok(p),
                _ => Ok(self.object_prototype.clone()),
            },
            _ => Err(Error::type_error("instanceof requires a class or function")),
        }
    }

    fn is_instance_of_class(&self, value: &Value, name: &str) -> bool {
        let Some(obj) = value.as_object() else {
            return false;
        };
        match self.class_named(name) {
            Some(class) => {
                let prototype = match &class.borrow().kind {
                    ObjectKind::Class(c) => c.prototype.clone(),
                    _ => return false,
                };
                inherits_from(obj, &prototype)
            }
            None => &*obj.borrow().class_name == name,
        }
    }
}

fn new_ref(object: Object) -> ObjectRef {
    Rc::new(RefCell::new(object))
}

fn native(
    name: &str,
    func: impl Fn(&VmContext, &Value, &[Value]) -> Result<Value> + 'static,
) -> Value {
    Value::new_object(Object::new(
        ObjectKind::Native(NativeFunction {
            name: Rc::from(name),
            func: Rc::new(func),
        }),
        "Function",
    ))
}

fn builtin_class(name: &str, prototype: ObjectRef, super_class: Option<ObjectRef>) -> ObjectRef {
    new_ref(Object::new(
        ObjectKind::Class(ClassObject {
            name: Rc::from(name),
            init: ClassInit::Builtin,
            prototype,
            super_class,
            scope: Vec::new(),
            instance_traits: Rc::from(Vec::new()),
        }),
        "Class",
    ))
}

fn number_arg(args: &[Value], index: usize) -> f64 {
    args.get(index).map(Value::to_number).unwrap_or(f64::NAN)
}

fn is_error_class(name: &str) -> bool {
    name == "Error" || ERROR_CLASSES.contains(&name)
}

fn null_reference(name: &QualifiedName) -> Error {
    Error::type_error(format!(
        "Cannot access a property or method of a null object reference ({})",
        name
    ))
}

/// Property lookup along the prototype chain
fn lookup(object: &ObjectRef, name: &str) -> Option<Value> {
    let mut current = object.clone();
    loop {
        let next = {
            let o = current.borrow();
            if let Some(value) = o.get_own(name) {
                return Some(value);
            }
            if let (ObjectKind::Class(c), "prototype") = (&o.kind, name) {
                return Some(Value::Object(c.prototype.clone()));
            }
            o.prototype.clone()
        };
        current = next?;
    }
}

fn inherits_from(object: &ObjectRef, prototype: &ObjectRef) -> bool {
    let mut current = object.borrow().prototype.clone();
    while let Some(p) = current {
        if Rc::ptr_eq(&p, prototype) {
            return true;
        }
        current = p.borrow().prototype.clone();
    }
    false
}

fn fits_int(n: f64) -> bool {
    n.fract() == 0.0 && n >= f64::from(i32::MIN) && n <= f64::from(i32::MAX)
}

fn fits_uint(n: f64) -> bool {
    n.fract() == 0.0 && n >= 0.0 && n <= f64::from(u32::MAX)
}

impl ObjectModel for StandardModel {
    fn global(&self) -> Value {
        Value::Object(self.global.clone())
    }

    fn get_property(&self, _vm: &VmContext, object: &Value, name: &QualifiedName) -> Result<Value> {
        match object {
            Value::Object(obj) => Ok(lookup(obj, &name.name).unwrap_or(Value::Undefined)),
            Value::Undefined | Value::Null => Err(null_reference(name)),
            Value::String(s) if &*name.name == "length" => {
                Ok(Value::Integer(s.chars().count() as i32))
            }
            _ => Ok(Value::Undefined),
        }
    }

    fn set_property(
        &self,
        _vm: &VmContext,
        object: &Value,
        name: &QualifiedName,
        value: Value,
    ) -> Result<()> {
        match object {
            Value::Object(obj) => {
                // the previous value is released after the borrow ends
                let _old = obj.borrow_mut().set_own(name.name.clone(), value);
                Ok(())
            }
            Value::Undefined | Value::Null => Err(null_reference(name)),
            other => Err(Error::reference_error(format!(
                "Cannot create property {} on {}",
                name,
                other.type_of()
            ))),
        }
    }

    fn delete_property(
        &self,
        _vm: &VmContext,
        object: &Value,
        name: &QualifiedName,
    ) -> Result<bool> {
        match object {
            Value::Object(obj) => {
                let mut o = obj.borrow_mut();
                if o.has_own(&name.name) {
                    Ok(o.delete_own(&name.name))
                } else {
                    Ok(true)
                }
            }
            Value::Undefined | Value::Null => Err(null_reference(name)),
            _ => Ok(false),
        }
    }

    fn has_property(&self, _vm: &VmContext, object: &Value, name: &QualifiedName) -> Result<bool> {
        match object {
            Value::Object(obj) => Ok(lookup(obj, &name.name).is_some()),
            Value::Undefined | Value::Null => Err(null_reference(name)),
            Value::String(_) => Ok(&*name.name == "length"),
            _ => Ok(false),
        }
    }

    fn get_slot(&self, _vm: &VmContext, object: &Value, slot: u32) -> Result<Value> {
        match object {
            Value::Object(obj) => obj.borrow().slot(slot),
            Value::Undefined | Value::Null => Err(Error::type_error(
                "Cannot access a slot of a null object reference",
            )),
            other => Err(Error::reference_error(format!(
                "{} has no slot {}",
                other.type_of(),
                slot
            ))),
        }
    }

    fn set_slot(&self, _vm: &VmContext, object: &Value, slot: u32, value: Value) -> Result<()> {
        match object {
            Value::Object(obj) => {
                let _old = obj.borrow_mut().set_slot(slot, value)?;
                Ok(())
            }
            Value::Undefined | Value::Null => Err(Error::type_error(
                "Cannot access a slot of a null object reference",
            )),
            other => Err(Error::reference_error(format!(
                "{} has no slot {}",
                other.type_of(),
                slot
            ))),
        }
    }

    fn call(&self, vm: &VmContext, function: &Value, this: &Value, args: Vec<Value>) -> Result<Value> {
        let obj = function
            .as_object()
            .ok_or_else(|| Error::type_error(format!("{} is not a function", function.to_ecma_string())))?;
        let kind = obj.borrow().kind.clone();
        match kind {
            ObjectKind::Function(closure) => {
                vm.invoke_closure(closure.method, this.clone(), args, closure.scope)
            }
            ObjectKind::Native(native) => (native.func)(vm, this, &args),
            ObjectKind::Class(class) => {
                // `T(x)` is a cast, except for the error classes
                if args.len() == 1 && !is_error_class(&class.name) {
                    let value = args.into_iter().next().unwrap_or_default();
                    self.coerce(vm, value, &QualifiedName::public(class.name))
                } else {
                    self.construct(vm, function, args)
                }
            }
            _ => Err(Error::type_error(format!(
                "{} is not a function",
                function.to_ecma_string()
            ))),
        }
    }

    fn construct(&self, vm: &VmContext, constructor: &Value, args: Vec<Value>) -> Result<Value> {
        let obj = constructor
            .as_object()
            .ok_or_else(|| Error::type_error(format!("{} is not a constructor", constructor)))?;
        let kind = obj.borrow().kind.clone();
        match kind {
            ObjectKind::Class(_) => self.construct_class(vm, obj, args),
            ObjectKind::Function(closure) => {
                let prototype = match obj.borrow().get_own("prototype") {
                    Some(Value::Object(p)) => p,
                    _ => self.object_prototype.clone(),
                };
                let instance = Value::new_object(Object::plain().with_prototype(Some(prototype)));
                let result =
                    vm.invoke_closure(closure.method, instance.clone(), args, closure.scope)?;
                match result {
                    Value::Object(_) => Ok(result),
                    _ => Ok(instance),
                }
            }
            _ => Err(Error::type_error(format!("{} is not a constructor", constructor))),
        }
    }

    fn construct_super(&self, vm: &VmContext, method: u32, this: &Value, args: Vec<Value>) -> Result<()> {
        let class = self.owning_class(vm, method)?;
        let super_class = match &class.borrow().kind {
            ObjectKind::Class(c) => c.super_class.clone(),
            _ => None,
        };
        match super_class {
            Some(sup) => self.initialize(vm, &sup, this, args),
            None => Ok(()),
        }
    }

    fn get_super(&self, vm: &VmContext, method: u32, _this: &Value, name: &QualifiedName) -> Result<Value> {
        let class = self.owning_class(vm, method)?;
        let super_prototype = match &class.borrow().kind {
            ObjectKind::Class(c) => c.super_class.as_ref().and_then(|s| match &s.borrow().kind {
                ObjectKind::Class(sc) => Some(sc.prototype.clone()),
                _ => None,
            }),
            _ => None,
        };
        super_prototype
            .and_then(|p| lookup(&p, &name.name))
            .ok_or_else(|| Error::reference_error(format!("{} is not defined on super", name)))
    }

    fn set_super(
        &self,
        vm: &VmContext,
        _method: u32,
        this: &Value,
        name: &QualifiedName,
        value: Value,
    ) -> Result<()> {
        self.set_property(vm, this, name, value)
    }

    fn find_property(
        &self,
        _vm: &VmContext,
        scope: &[ScopeEntry],
        name: &QualifiedName,
        strict: bool,
    ) -> Result<Value> {
        for entry in scope.iter().rev() {
            if let Value::Object(obj) = &entry.value {
                if lookup(obj, &name.name).is_some() {
                    return Ok(entry.value.clone());
                }
            }
        }
        if lookup(&self.global, &name.name).is_some() || !strict {
            return Ok(self.global());
        }
        Err(Error::reference_error(format!("Variable {} is not defined", name)))
    }

    fn find_definition(&self, _vm: &VmContext, name: &QualifiedName) -> Result<Value> {
        if lookup(&self.global, &name.name).is_some() {
            Ok(self.global())
        } else {
            Err(Error::reference_error(format!("Variable {} is not defined", name)))
        }
    }

    fn new_object(&self, _vm: &VmContext, properties: Vec<(Rc<str>, Value)>) -> Result<Value> {
        let mut object = Object::plain().with_prototype(Some(self.object_prototype.clone()));
        for (name, value) in properties {
            object.set_own(name, value);
        }
        Ok(Value::new_object(object))
    }

    fn new_array(&self, _vm: &VmContext, items: Vec<Value>) -> Result<Value> {
        Ok(Value::new_object(
            Object::new(ObjectKind::Array(items), "Array")
                .with_prototype(Some(self.array_prototype.clone())),
        ))
    }

    fn new_activation(&self, vm: &VmContext, method: u32) -> Result<Value> {
        let info = vm.method(method)?;
        let names: SlotNames = info
            .body
            .traits
            .iter()
            .map(|t| (Rc::from(t.name.as_str()), t.slot_id))
            .collect::<Vec<_>>()
            .into();
        Ok(Value::new_object(
            Object::new(ObjectKind::Plain, "Activation").with_slot_names(names),
        ))
    }

    fn new_catch(&self, vm: &VmContext, method: u32, handler: u32) -> Result<Value> {
        let info = vm.method(method)?;
        let exception = info.body.exceptions.get(handler as usize).ok_or_else(|| {
            Error::format_error(format!("exception handler {} out of range", handler), 0)
        })?;
        let name = match exception.var_name {
            0 => Rc::from(""),
            index => vm.pool().get_multiname(index)?.static_name()?.name,
        };
        let names: SlotNames = Rc::from(vec![(name, 1)]);
        Ok(Value::new_object(
            Object::new(ObjectKind::Plain, "Catch").with_slot_names(names),
        ))
    }

    fn new_function(&self, _vm: &VmContext, method: u32, scope: Vec<ScopeEntry>) -> Result<Value> {
        Ok(self.make_closure(method, scope))
    }

    fn new_class(
        &self,
        vm: &VmContext,
        class_index: u32,
        base: Value,
        scope: Vec<ScopeEntry>,
    ) -> Result<Value> {
        let info = vm.class(class_index)?.clone();
        let base_class = match &base {
            Value::Object(obj) if matches!(obj.borrow().kind, ObjectKind::Class(_)) => Some(obj.clone()),
            Value::Undefined | Value::Null => None,
            other => {
                return Err(Error::type_error(format!(
                    "{} is not a valid base class",
                    other.to_ecma_string()
                )))
            }
        };
        let (parent_prototype, mut traits) = match &base_class {
            Some(class) => match &class.borrow().kind {
                ObjectKind::Class(c) => (c.prototype.clone(), c.instance_traits.to_vec()),
                _ => (self.object_prototype.clone(), Vec::new()),
            },
            None => (self.object_prototype.clone(), Vec::new()),
        };
        traits.extend(info.slots.iter().map(|t| (Rc::from(t.name.as_str()), t.slot_id)));

        let prototype = new_ref(
            Object::new(ObjectKind::Plain, info.name.as_str()).with_prototype(Some(parent_prototype)),
        );
        for m in &info.methods {
            let closure = self.make_closure(m.method, scope.clone());
            prototype.borrow_mut().set_own(Rc::from(m.name.as_str()), closure);
        }

        let name: Rc<str> = Rc::from(info.name.as_str());
        let mut class_object = Object::new(
            ObjectKind::Class(ClassObject {
                name: name.clone(),
                init: ClassInit::Bytecode {
                    class_index,
                    iinit: info.iinit,
                },
                prototype,
                super_class: base_class,
                scope: scope.clone(),
                instance_traits: traits.into(),
            }),
            "Class",
        )
        .with_prototype(Some(self.object_prototype.clone()));
        for m in &info.static_methods {
            class_object.set_own(Rc::from(m.name.as_str()), self.make_closure(m.method, scope.clone()));
        }
        let class_ref = new_ref(class_object);
        self.classes.borrow_mut().insert(name, class_ref.clone());
        self.bytecode_classes
            .borrow_mut()
            .insert(class_index, class_ref.clone());

        let class_value = Value::Object(class_ref);
        if let Some(cinit) = info.cinit {
            vm.invoke_closure(cinit, class_value.clone(), Vec::new(), scope)?;
        }
        Ok(class_value)
    }

    fn has_next(&self, _vm: &VmContext, object: &Value, index: u32) -> Result<Option<u32>> {
        let Some(obj) = object.as_object() else {
            return Ok(None);
        };
        let o = obj.borrow();
        Ok(o.enumeration.as_ref().map(|names| {
            if (index as usize) < names.len() {
                index + 1
            } else {
                0
            }
        }))
    }

    fn enumerable_len(&self, _vm: &VmContext, object: &Value) -> u32 {
        match object {
            Value::Object(obj) => obj.borrow().enumerable_len(),
            _ => 0,
        }
    }

    fn next_name(&self, _vm: &VmContext, object: &Value, index: u32) -> Result<Value> {
        let Some(obj) = object.as_object() else {
            return Ok(Value::Undefined);
        };
        let o = obj.borrow();
        if let Some(names) = &o.enumeration {
            return Ok(index
                .checked_sub(1)
                .and_then(|i| names.get(i as usize))
                .map(|n| Value::String(n.clone()))
                .unwrap_or_default());
        }
        Ok(o.enumerate_at(index).map(|(name, _)| name).unwrap_or_default())
    }

    fn next_value(&self, _vm: &VmContext, object: &Value, index: u32) -> Result<Value> {
        let Some(obj) = object.as_object() else {
            return Ok(Value::Undefined);
        };
        let name = {
            let o = obj.borrow();
            match &o.enumeration {
                Some(names) => index.checked_sub(1).and_then(|i| names.get(i as usize)).cloned(),
                None => return Ok(o.enumerate_at(index).map(|(_, v)| v).unwrap_or_default()),
            }
        };
        Ok(name.and_then(|n| lookup(obj, &n)).unwrap_or_default())
    }

    fn is_type(&self, _vm: &VmContext, value: &Value, type_name: &QualifiedName) -> Result<bool> {
        Ok(match &*type_name.name {
            "*" => true,
            "Object" => !value.is_nullish(),
            "int" => match value {
                Value::Integer(_) => true,
                Value::UInteger(u) => *u <= i32::MAX as u32,
                Value::Number(n) => fits_int(*n),
                _ => false,
            },
            "uint" => match value {
                Value::Integer(i) => *i >= 0,
                Value::UInteger(_) => true,
                Value::Number(n) => fits_uint(*n),
                _ => false,
            },
            "Number" => value.is_number(),
            "String" => matches!(value, Value::String(_)),
            "Boolean" => matches!(value, Value::Boolean(_)),
            "Namespace" => matches!(value, Value::Namespace(_)),
            "Function" => value.type_of() == "function",
            name => self.is_instance_of_class(value, name),
        })
    }

    fn is_type_late(&self, vm: &VmContext, value: &Value, type_value: &Value) -> Result<bool> {
        let name = match type_value {
            Value::Object(obj) => match &obj.borrow().kind {
                ObjectKind::Class(c) => c.name.clone(),
                _ => return Err(Error::type_error("istypelate requires a class")),
            },
            Value::Undefined | Value::Null => {
                return Err(Error::type_error("istypelate on a null type"))
            }
            _ => return Err(Error::type_error("istypelate requires a class")),
        };
        self.is_type(vm, value, &QualifiedName::public(name))
    }

    fn coerce(&self, vm: &VmContext, value: Value, type_name: &QualifiedName) -> Result<Value> {
        Ok(match &*type_name.name {
            "*" => value,
            "int" => Value::Integer(value.to_int32()),
            "uint" => Value::UInteger(value.to_uint32()),
            "Number" => Value::Number(value.to_number()),
            "Boolean" => Value::Boolean(value.to_boolean()),
            "String" if value.is_nullish() => Value::Null,
            "String" => Value::String(value.to_rc_str()),
            "Object" if matches!(value, Value::Undefined) => Value::Null,
            "Object" => value,
            _ if value.is_nullish() => Value::Null,
            _ if self.is_type(vm, &value, type_name)? => value,
            _ => {
                return Err(Error::type_error(format!(
                    "Type Coercion failed: cannot convert {} to {}",
                    value.to_ecma_string(),
                    type_name
                )))
            }
        })
    }

    fn instance_of(&self, _vm: &VmContext, value: &Value, constructor: &Value) -> Result<bool> {
        let prototype = self.prototype_of_constructor(constructor)?;
        Ok(match value.as_object() {
            Some(obj) => inherits_from(obj, &prototype),
            None => false,
        })
    }

    fn new_error(&self, _vm: &VmContext, kind: ErrorKind, message: &str) -> Value {
        let class = self
            .class_named(kind.class_name())
            .or_else(|| self.class_named("Error"));
        let prototype = class.and_then(|c| {
            let prototype = match &c.borrow().kind {
                ObjectKind::Class(class) => Some(class.prototype.clone()),
                _ => None,
            };
            prototype
        });
        let mut error = Object::new(ObjectKind::Plain, kind.class_name()).with_prototype(prototype);
        error.set_own(Rc::from("message"), Value::from(message));
        Value::new_object(error)
    }
}
