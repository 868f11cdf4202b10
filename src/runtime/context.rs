//! Per-invocation call context
//!
//! Both execution tiers read and write the same `CallContext`, which is what
//! makes exceptions and tier crossings see consistent state. The context
//! never touches reference counts itself: values move in and out by
//! ownership, so a pushed object is owned by the stack until popped.

use crate::error::{Error, Result};
use crate::runtime::value::Value;
use std::rc::Rc;

/// One entry of the scope chain
#[derive(Debug, Clone)]
pub struct ScopeEntry {
    pub value: Value,
    /// Pushed by `pushwith`
    pub is_with: bool,
}

impl ScopeEntry {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            is_with: false,
        }
    }
}

/// Activation record of one method invocation
#[derive(Debug)]
pub struct CallContext {
    /// Method index in the owning `VmContext`
    pub method: u32,
    pub locals: Vec<Value>,
    stack: Vec<Value>,
    max_stack: usize,
    pub scope_stack: Vec<ScopeEntry>,
    /// Depth of the captured closure scope; handlers truncate back to it
    pub initial_scope_depth: usize,
    /// Offset of the instruction being executed; 0 on a fresh invocation
    pub exec_pos: u32,
    pub default_namespace: Option<Rc<str>>,
}

impl CallContext {
    pub fn new(method: u32, local_count: u32, max_stack: u32, scope: Vec<ScopeEntry>) -> Self {
        let initial_scope_depth = scope.len();
        Self {
            method,
            locals: vec![Value::Undefined; local_count as usize],
            stack: Vec::with_capacity(max_stack as usize),
            max_stack: max_stack as usize,
            scope_stack: scope,
            initial_scope_depth,
            exec_pos: 0,
            default_namespace: None,
        }
    }

    // ========== Operand stack ==========

    pub fn push(&mut self, value: Value) -> Result<()> {
        if self.stack.len() >= self.max_stack {
            return Err(Error::internal(format!(
                "operand stack overflow (max_stack {})",
                self.max_stack
            )));
        }
        self.stack.push(value);
        Ok(())
    }

    pub fn pop(&mut self) -> Result<Value> {
        self.stack
            .pop()
            .ok_or_else(|| Error::internal("operand stack underflow"))
    }

    /// Pop `n` values, returned in push order
    pub fn pop_n(&mut self, n: usize) -> Result<Vec<Value>> {
        if n > self.stack.len() {
            return Err(Error::internal(format!(
                "operand stack underflow: need {}, have {}",
                n,
                self.stack.len()
            )));
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    pub fn peek(&self) -> Result<&Value> {
        self.stack
            .last()
            .ok_or_else(|| Error::internal("peek on empty operand stack"))
    }

    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    pub fn stack(&self) -> &[Value] {
        &self.stack
    }

    pub fn clear_stack(&mut self) {
        self.stack.clear();
    }

    // ========== Locals ==========

    fn local_slot(&mut self, index: u32) -> Result<&mut Value> {
        let count = self.locals.len();
        self.locals
            .get_mut(index as usize)
            .ok_or_else(|| Error::internal(format!("local {} out of range ({})", index, count)))
    }

    /// Read a local (incRef)
    pub fn get_local(&self, index: u32) -> Result<Value> {
        self.locals.get(index as usize).cloned().ok_or_else(|| {
            Error::internal(format!("local {} out of range ({})", index, self.locals.len()))
        })
    }

    /// Replace a local, dropping the previous value
    pub fn set_local(&mut self, index: u32, value: Value) -> Result<()> {
        *self.local_slot(index)? = value;
        Ok(())
    }

    /// Move a local out, leaving `undefined`
    pub fn take_local(&mut self, index: u32) -> Result<Value> {
        Ok(std::mem::take(self.local_slot(index)?))
    }

    pub fn kill_local(&mut self, index: u32) -> Result<()> {
        self.set_local(index, Value::Undefined)
    }

    // ========== Scope chain ==========

    pub fn push_scope(&mut self, value: Value, is_with: bool) {
        self.scope_stack.push(ScopeEntry { value, is_with });
    }

    pub fn pop_scope(&mut self) -> Result<ScopeEntry> {
        if self.scope_stack.len() <= self.initial_scope_depth {
            return Err(Error::internal("popscope below the captured scope"));
        }
        self.scope_stack
            .pop()
            .ok_or_else(|| Error::internal("scope stack underflow"))
    }

    pub fn scope_at(&self, index: u32) -> Result<Value> {
        self.scope_stack
            .get(index as usize)
            .map(|entry| entry.value.clone())
            .ok_or_else(|| Error::internal(format!("scope index {} out of range", index)))
    }

    /// Outermost scope object
    pub fn global_scope(&self) -> Option<Value> {
        self.scope_stack.first().map(|entry| entry.value.clone())
    }

    /// Prepare the context for entering a catch handler
    pub fn reset_for_handler(&mut self, target: u32, exception: Value) -> Result<()> {
        self.stack.clear();
        self.scope_stack.truncate(self.initial_scope_depth);
        self.exec_pos = target;
        if self.max_stack == 0 {
            return Err(Error::format_error(
                "exception handler entered with max_stack 0",
                target as usize,
            ));
        }
        self.push(exception)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::value::Object;

    #[test]
    fn test_stack_bounds() {
        let mut ctx = CallContext::new(0, 1, 2, Vec::new());
        ctx.push(Value::from(1)).unwrap();
        ctx.push(Value::from(2)).unwrap();
        assert!(matches!(ctx.push(Value::from(3)), Err(Error::InternalError(_))));
        assert_eq!(ctx.pop().unwrap().to_int32(), 2);
        assert_eq!(ctx.pop().unwrap().to_int32(), 1);
        assert!(ctx.pop().is_err());
        assert!(ctx.peek().is_err());
    }

    #[test]
    fn test_pop_n_keeps_push_order() {
        let mut ctx = CallContext::new(0, 0, 8, Vec::new());
        for i in 0..4 {
            ctx.push(Value::from(i)).unwrap();
        }
        let args = ctx.pop_n(3).unwrap();
        let ints: Vec<i32> = args.iter().map(Value::to_int32).collect();
        assert_eq!(ints, vec![1, 2, 3]);
        assert_eq!(ctx.stack_len(), 1);
        assert!(ctx.pop_n(2).is_err());
    }

    #[test]
    fn test_locals_bounds() {
        let mut ctx = CallContext::new(0, 2, 1, Vec::new());
        ctx.set_local(1, Value::from("x")).unwrap();
        assert_eq!(ctx.get_local(1).unwrap().to_ecma_string(), "x");
        assert!(ctx.get_local(2).is_err());
        assert!(ctx.set_local(5, Value::Null).is_err());
        assert_eq!(ctx.take_local(1).unwrap().to_ecma_string(), "x");
        assert!(matches!(ctx.get_local(1).unwrap(), Value::Undefined));
    }

    #[test]
    fn test_reset_for_handler() {
        let global = Value::new_object(Object::plain());
        let mut ctx = CallContext::new(0, 1, 4, vec![ScopeEntry::new(global)]);
        ctx.push(Value::from(1)).unwrap();
        ctx.push_scope(Value::new_object(Object::plain()), true);
        ctx.reset_for_handler(12, Value::from("err")).unwrap();
        assert_eq!(ctx.exec_pos, 12);
        assert_eq!(ctx.stack_len(), 1);
        assert_eq!(ctx.scope_stack.len(), 1);
        assert_eq!(ctx.peek().unwrap().to_ecma_string(), "err");
    }

    #[test]
    fn test_handler_entry_without_stack_room_is_format_error() {
        let mut ctx = CallContext::new(0, 1, 0, Vec::new());
        let err = ctx.reset_for_handler(7, Value::from("err")).unwrap_err();
        assert!(matches!(err, Error::FormatError { .. }), "{:?}", err);
        assert_eq!(ctx.stack_len(), 0);
    }

    #[test]
    fn test_popscope_keeps_captured_scope() {
        let mut ctx = CallContext::new(0, 0, 1, vec![ScopeEntry::new(Value::Null)]);
        assert!(ctx.pop_scope().is_err());
        ctx.push_scope(Value::Null, false);
        assert!(ctx.pop_scope().is_ok());
    }
}
