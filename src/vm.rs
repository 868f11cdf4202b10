//! VM context and method invocation
//!
//! `VmContext` bundles everything an executing method needs: the constant
//! pool, the method and class tables, the object model, the configuration
//! and the compiled-code cache. It is passed explicitly to every entry point
//! of both tiers.
//!
//! An invocation builds a fresh `CallContext`, picks a tier, and then loops
//! on the exception table: a catchable error whose faulting offset is
//! covered by a matching handler resets the context to that handler and
//! re-enters the same tier.

use crate::bytecode::{ClassInfo, ConstantPool, DefaultValue, MethodFlags, MethodInfo, ParamType};
use crate::config::{JitMode, VmConfig};
use crate::error::{Error, Result};
use crate::interpreter;
use crate::jit::{self, CodeCache, CompilationTier, CompiledMethod};
use crate::runtime::{CallContext, ObjectModel, ScopeEntry, Value};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, warn};

/// Execution environment shared by every invocation on one thread
pub struct VmContext {
    pool: Arc<dyn ConstantPool>,
    methods: Vec<Arc<MethodInfo>>,
    classes: Vec<ClassInfo>,
    model: Rc<dyn ObjectModel>,
    cache: Arc<CodeCache>,
    config: VmConfig,
    /// Invocation count per method, for `JitMode::Auto`
    hit_counts: RefCell<Vec<u32>>,
    depth: Cell<usize>,
}

impl fmt::Debug for VmContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmContext")
            .field("methods", &self.methods.len())
            .field("classes", &self.classes.len())
            .field("config", &self.config)
            .field("compiled", &self.cache.publish_count())
            .finish()
    }
}

/// Builder for [`VmContext`]
#[derive(Default)]
pub struct VmContextBuilder {
    pool: Option<Arc<dyn ConstantPool>>,
    methods: Vec<MethodInfo>,
    classes: Vec<ClassInfo>,
    model: Option<Rc<dyn ObjectModel>>,
    config: VmConfig,
    cache: Option<Arc<CodeCache>>,
}

impl VmContextBuilder {
    pub fn pool(mut self, pool: Arc<dyn ConstantPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Append one method; its index is its position
    pub fn method(mut self, method: MethodInfo) -> Self {
        self.methods.push(method);
        self
    }

    pub fn methods(mut self, methods: Vec<MethodInfo>) -> Self {
        self.methods.extend(methods);
        self
    }

    pub fn classes(mut self, classes: Vec<ClassInfo>) -> Self {
        self.classes = classes;
        self
    }

    pub fn model(mut self, model: Rc<dyn ObjectModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn config(mut self, config: VmConfig) -> Self {
        self.config = config;
        self
    }

    /// Share compiled code with other VMs running the same module
    pub fn cache(mut self, cache: Arc<CodeCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn build(self) -> Result<VmContext> {
        let pool = self
            .pool
            .ok_or_else(|| Error::ConfigError("VmContext needs a constant pool".into()))?;
        let model = self
            .model
            .ok_or_else(|| Error::ConfigError("VmContext needs an object model".into()))?;
        let mut vm = VmContext::new(pool, self.methods, self.classes, model, self.config);
        if let Some(cache) = self.cache {
            vm.cache = cache;
        }
        Ok(vm)
    }
}

/// Restores the call depth when an invocation ends
struct DepthGuard<'a>(&'a Cell<usize>);

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.0.set(self.0.get().saturating_sub(1));
    }
}

fn coerce_param(ty: ParamType, value: Value) -> Value {
    match ty {
        ParamType::Any => value,
        ParamType::Int => Value::Integer(value.to_int32()),
        ParamType::UInt => Value::UInteger(value.to_uint32()),
        ParamType::Number => Value::Number(value.to_number()),
        ParamType::Boolean => Value::Boolean(value.to_boolean()),
        ParamType::String if value.is_nullish() => Value::Null,
        ParamType::String => Value::String(value.to_rc_str()),
    }
}

fn default_value(default: &DefaultValue) -> Value {
    match default {
        DefaultValue::Undefined => Value::Undefined,
        DefaultValue::Null => Value::Null,
        DefaultValue::Bool(b) => Value::Boolean(*b),
        DefaultValue::Int(i) => Value::Integer(*i),
        DefaultValue::UInt(u) => Value::UInteger(*u),
        DefaultValue::Number(n) => Value::Number(*n),
        DefaultValue::String(s) => Value::from(s.as_str()),
    }
}

impl VmContext {
    pub fn new(
        pool: Arc<dyn ConstantPool>,
        methods: Vec<MethodInfo>,
        classes: Vec<ClassInfo>,
        model: Rc<dyn ObjectModel>,
        config: VmConfig,
    ) -> Self {
        let count = methods.len();
        Self {
            pool,
            methods: methods.into_iter().map(Arc::new).collect(),
            classes,
            model,
            cache: Arc::new(CodeCache::new()),
            config,
            hit_counts: RefCell::new(vec![0; count]),
            depth: Cell::new(0),
        }
    }

    pub fn builder() -> VmContextBuilder {
        VmContextBuilder::default()
    }

    // ==================== Accessors ====================

    pub fn pool(&self) -> &dyn ConstantPool {
        self.pool.as_ref()
    }

    pub fn model(&self) -> &dyn ObjectModel {
        self.model.as_ref()
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<CodeCache> {
        &self.cache
    }

    pub fn method(&self, id: u32) -> Result<&Arc<MethodInfo>> {
        self.methods
            .get(id as usize)
            .ok_or_else(|| Error::internal(format!("method {} out of range", id)))
    }

    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    /// Index of the first method called `name`
    pub fn method_by_name(&self, name: &str) -> Option<u32> {
        self.methods
            .iter()
            .position(|m| m.name == name)
            .map(|i| i as u32)
    }

    pub fn class(&self, index: u32) -> Result<&ClassInfo> {
        self.classes
            .get(index as usize)
            .ok_or_else(|| Error::internal(format!("class {} out of range", index)))
    }

    pub fn classes(&self) -> &[ClassInfo] {
        &self.classes
    }

    /// Current native call depth
    pub fn call_depth(&self) -> usize {
        self.depth.get()
    }

    // ==================== Invocation ====================

    /// Call a top-level method with the global object as its only scope
    pub fn invoke(&self, id: u32, this: Value, args: Vec<Value>) -> Result<Value> {
        let scope = vec![ScopeEntry::new(self.model.global())];
        self.invoke_closure(id, this, args, scope)
    }

    /// Call a method with a captured scope chain
    pub fn invoke_closure(
        &self,
        id: u32,
        this: Value,
        args: Vec<Value>,
        scope: Vec<ScopeEntry>,
    ) -> Result<Value> {
        let depth = self.depth.get();
        if depth >= self.config.max_call_depth {
            return Err(Error::range_error(format!(
                "call depth exceeds {}",
                self.config.max_call_depth
            )));
        }
        self.depth.set(depth + 1);
        let _guard = DepthGuard(&self.depth);

        let method = Arc::clone(self.method(id)?);
        let mut ctx = CallContext::new(id, method.body.local_count, method.body.max_stack, scope);
        self.bind_arguments(&method, &mut ctx, this, args)?;
        let compiled = self.select_tier(id, &method)?;
        self.run(&method, compiled.as_deref(), &mut ctx)
    }

    /// Fill `this`, the declared parameters and the rest or arguments array
    fn bind_arguments(
        &self,
        method: &MethodInfo,
        ctx: &mut CallContext,
        this: Value,
        args: Vec<Value>,
    ) -> Result<()> {
        ctx.set_local(0, this)?;
        let params = method.param_count();
        let all = method
            .flags
            .contains(MethodFlags::NEED_ARGUMENTS)
            .then(|| args.clone());

        let mut args = args;
        let extra = if args.len() > params {
            args.split_off(params)
        } else {
            Vec::new()
        };
        let first_optional = params.saturating_sub(method.optional.len());
        let mut supplied = args.into_iter();
        for (i, &ty) in method.param_types.iter().enumerate() {
            let value = match supplied.next() {
                Some(value) => value,
                None if i >= first_optional => method
                    .optional
                    .get(i - first_optional)
                    .map(default_value)
                    .unwrap_or_default(),
                None => Value::Undefined,
            };
            ctx.set_local(i as u32 + 1, coerce_param(ty, value))?;
        }

        let extra_local = params as u32 + 1;
        if method.flags.contains(MethodFlags::NEED_REST) {
            let rest = self.model.new_array(self, extra)?;
            ctx.set_local(extra_local, rest)?;
        } else if let Some(all) = all {
            let arguments = self.model.new_array(self, all)?;
            ctx.set_local(extra_local, arguments)?;
        }
        Ok(())
    }

    // ==================== Tiers ====================

    fn select_tier(&self, id: u32, method: &MethodInfo) -> Result<Option<Arc<CompiledMethod>>> {
        let hits = {
            let mut counts = self.hit_counts.borrow_mut();
            match counts.get_mut(id as usize) {
                Some(count) => {
                    *count = count.saturating_add(1);
                    *count
                }
                None => 0,
            }
        };
        let wanted = match self.config.jit {
            JitMode::Off => false,
            JitMode::On => true,
            JitMode::Auto => hits >= self.config.jit_threshold,
        };
        if !wanted {
            return Ok(None);
        }
        if let Some(compiled) = self.cache.get(id) {
            return Ok(Some(compiled));
        }
        if self.cache.has_failed(id) {
            return Ok(None);
        }
        match self.compile_method(id) {
            Ok(compiled) => Ok(Some(compiled)),
            Err(err) if err.is_format_error() => Err(err),
            Err(err) => {
                warn!(method = %method.name, error = %err, "compilation failed, interpreting");
                Ok(None)
            }
        }
    }

    /// Compile `id` now, or return its published code
    pub fn compile_method(&self, id: u32) -> Result<Arc<CompiledMethod>> {
        let method = Arc::clone(self.method(id)?);
        let compiled = self
            .cache
            .get_or_compile(id, || jit::compile(&method, self.pool.as_ref()))?;
        debug!(method = %method.name, ir = compiled.lowered.ir.len(), "using compiled code");
        if self.config.trace_jit {
            debug!("\n{}", compiled);
        }
        Ok(compiled)
    }

    /// Tier the next invocation of `id` would start in, without counting it
    pub fn tier_of(&self, id: u32) -> CompilationTier {
        if self.cache.get(id).is_some() {
            CompilationTier::Compiled
        } else {
            CompilationTier::Interpreted
        }
    }

    // ==================== Exception dispatch ====================

    fn run(
        &self,
        method: &MethodInfo,
        compiled: Option<&CompiledMethod>,
        ctx: &mut CallContext,
    ) -> Result<Value> {
        loop {
            let result = match compiled {
                Some(compiled) => jit::execute(self, compiled, ctx),
                None => interpreter::execute(self, method, ctx),
            };
            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !err.is_catchable() || method.body.exceptions.is_empty() {
                return Err(err);
            }

            let exception = match &err {
                Error::Thrown(value) => value.clone(),
                Error::RuntimeError { kind, message } => self.model.new_error(self, *kind, message),
                _ => return Err(err),
            };
            let pos = ctx.exec_pos;
            let Some(target) = self.find_handler(method, pos, &exception)? else {
                return Err(err);
            };
            debug!(method = %method.name, from = pos, target, "entering exception handler");
            drop(err);
            ctx.reset_for_handler(target, exception)?;
            if let Some(compiled) = compiled {
                for &local in compiled.handler_resets(target) {
                    ctx.kill_local(local)?;
                }
            }
        }
    }

    /// Target of the first handler covering `pos` that accepts `exception`
    fn find_handler(&self, method: &MethodInfo, pos: u32, exception: &Value) -> Result<Option<u32>> {
        for handler in method.body.handlers_at(pos) {
            if handler.exc_type == 0 {
                return Ok(Some(handler.target));
            }
            let type_name = self.pool.get_multiname(handler.exc_type)?.static_name()?;
            if self.model.is_type(self, exception, &type_name)? {
                return Ok(Some(handler.target));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{CodeBuilder, ConstantPoolData, ExceptionInfo, MethodBody, Opcode};
    use crate::runtime::StandardModel;

    fn vm_with(methods: Vec<MethodInfo>, config: VmConfig) -> VmContext {
        VmContext::builder()
            .pool(Arc::new(ConstantPoolData::new()))
            .methods(methods)
            .model(Rc::new(StandardModel::new()))
            .config(config)
            .build()
            .unwrap()
    }

    fn return_local(index: u32, locals: u32) -> MethodBody {
        let mut b = CodeBuilder::new();
        b.get_local(index).op(Opcode::ReturnValue);
        MethodBody::new(b.finish().unwrap(), 1, locals)
    }

    #[test]
    fn test_builder_requires_pool_and_model() {
        let err = VmContext::builder().build().unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[test]
    fn test_parameters_are_coerced() {
        let method = MethodInfo::new("f", return_local(1, 2)).with_params(vec![ParamType::Int]);
        let vm = vm_with(vec![method], VmConfig::interpreter_only());
        let result = vm.invoke(0, Value::Null, vec![Value::from("42")]).unwrap();
        assert!(matches!(result, Value::Integer(42)));
    }

    #[test]
    fn test_string_param_keeps_null() {
        let method =
            MethodInfo::new("f", return_local(1, 2)).with_params(vec![ParamType::String]);
        let vm = vm_with(vec![method], VmConfig::interpreter_only());
        let result = vm.invoke(0, Value::Null, vec![Value::Undefined]).unwrap();
        assert!(matches!(result, Value::Null));
        let result = vm.invoke(0, Value::Null, vec![Value::from(1.5)]).unwrap();
        assert_eq!(result.to_ecma_string(), "1.5");
    }

    #[test]
    fn test_missing_params_use_defaults() {
        let method = MethodInfo::new("f", return_local(2, 3))
            .with_params(vec![ParamType::Any, ParamType::Int])
            .with_optional(vec![DefaultValue::Int(9)]);
        let vm = vm_with(vec![method], VmConfig::interpreter_only());
        let result = vm.invoke(0, Value::Null, vec![Value::from(1)]).unwrap();
        assert!(matches!(result, Value::Integer(9)));

        let result = vm.invoke(0, Value::Null, Vec::new()).unwrap();
        assert!(matches!(result, Value::Integer(9)));
    }

    #[test]
    fn test_rest_array_collects_extra_args() {
        let mut b = CodeBuilder::new();
        b.get_local(2).op(Opcode::ReturnValue);
        let method = MethodInfo::new("f", MethodBody::new(b.finish().unwrap(), 1, 3))
            .with_params(vec![ParamType::Any])
            .with_flags(MethodFlags::NEED_REST);
        let vm = vm_with(vec![method], VmConfig::interpreter_only());
        let rest = vm
            .invoke(0, Value::Null, vec![Value::from(1), Value::from(2), Value::from(3)])
            .unwrap();
        assert_eq!(rest.to_ecma_string(), "2,3");
    }

    #[test]
    fn test_call_depth_limit() {
        let method = MethodInfo::new("f", return_local(0, 1));
        let mut config = VmConfig::interpreter_only();
        config.max_call_depth = 1;
        let vm = vm_with(vec![method], config);
        vm.depth.set(1);
        let err = vm.invoke(0, Value::Null, Vec::new()).unwrap_err();
        assert_eq!(err.kind(), Some(crate::error::ErrorKind::RangeError));
        assert_eq!(vm.call_depth(), 1);
    }

    #[test]
    fn test_depth_restored_after_error() {
        let mut b = CodeBuilder::new();
        b.push_byte(1).op(Opcode::Throw);
        let method = MethodInfo::new("f", MethodBody::new(b.finish().unwrap(), 1, 1));
        let vm = vm_with(vec![method], VmConfig::interpreter_only());
        assert!(vm.invoke(0, Value::Null, Vec::new()).is_err());
        assert_eq!(vm.call_depth(), 0);
    }

    #[test]
    fn test_auto_mode_compiles_at_threshold() {
        let method = MethodInfo::new("f", return_local(0, 1));
        let mut config = VmConfig::default();
        config.jit_threshold = 3;
        let vm = vm_with(vec![method], config);
        for _ in 0..2 {
            vm.invoke(0, Value::Null, Vec::new()).unwrap();
            assert_eq!(vm.tier_of(0), CompilationTier::Interpreted);
        }
        vm.invoke(0, Value::Null, Vec::new()).unwrap();
        assert_eq!(vm.tier_of(0), CompilationTier::Compiled);
    }

    #[test]
    fn test_uncompilable_method_falls_back() {
        // an entry-block back edge that disagrees with the parameter types
        let mut b = CodeBuilder::new();
        let top = b.new_label();
        b.bind(top).get_local(1).op(Opcode::Pop);
        b.op(Opcode::PushNull).set_local(1);
        b.op(Opcode::PushFalse).branch(Opcode::IfTrue, top);
        b.op(Opcode::ReturnVoid);
        let method = MethodInfo::new("f", MethodBody::new(b.finish().unwrap(), 1, 2))
            .with_params(vec![ParamType::Int]);
        let vm = vm_with(vec![method], VmConfig::jit_always());
        let result = vm.invoke(0, Value::Null, vec![Value::from(1)]).unwrap();
        assert!(matches!(result, Value::Undefined));
        assert!(vm.cache().has_failed(0));
        assert_eq!(vm.tier_of(0), CompilationTier::Interpreted);
    }

    #[test]
    fn test_catch_all_handler_in_both_tiers() {
        // try { throw 5 } catch (e) { return e + 1 }
        let mut b = CodeBuilder::new();
        b.push_byte(5).op(Opcode::Throw);
        b.push_byte(1).op(Opcode::Add).op(Opcode::ReturnValue);
        let body = MethodBody::new(b.finish().unwrap(), 2, 1).with_exceptions(vec![
            ExceptionInfo {
                from: 0,
                to: 3,
                target: 3,
                exc_type: 0,
                var_name: 0,
            },
        ]);
        for config in [VmConfig::interpreter_only(), VmConfig::jit_always()] {
            let vm = vm_with(vec![MethodInfo::new("f", body.clone())], config);
            let result = vm.invoke(0, Value::Null, Vec::new()).unwrap();
            assert_eq!(result.to_number(), 6.0);
        }
    }

    #[test]
    fn test_uncovered_throw_escapes() {
        let mut b = CodeBuilder::new();
        b.op(Opcode::Nop).push_byte(5).op(Opcode::Throw);
        let body = MethodBody::new(b.finish().unwrap(), 1, 1).with_exceptions(vec![
            ExceptionInfo {
                from: 0,
                to: 1,
                target: 1,
                exc_type: 0,
                var_name: 0,
            },
        ]);
        let vm = vm_with(vec![MethodInfo::new("f", body)], VmConfig::interpreter_only());
        let err = vm.invoke(0, Value::Null, Vec::new()).unwrap_err();
        assert!(matches!(err, Error::Thrown(Value::Integer(5))));
    }
}
