//! Runtime environment for the avm2 VM
//!
//! Value representation, the per-invocation call context, the opcode semantic
//! helpers shared by both tiers, and the object model the execution core
//! delegates to.

pub mod builtins;
pub mod context;
pub mod helpers;
pub mod model;
pub mod value;

pub use builtins::StandardModel;
pub use context::{CallContext, ScopeEntry};
pub use model::ObjectModel;
pub use value::{
    ClassInit, ClassObject, Closure, NativeFn, NativeFunction, Object, ObjectKind, ObjectRef,
    SlotNames, StackEntry, StackType, Value,
};
