//! avm2: an ActionScript 3 bytecode virtual machine
//!
//! The engine executes method bodies from an ABC constant pool and method
//! table in one of two tiers:
//!
//! - the [`interpreter`], a dispatch loop over decoded instructions;
//! - the compiled tier in [`jit`], which analyzes a method's block graph and
//!   stack types, lowers it to a register IR with unboxed primitives, and
//!   compiles that IR to host machine code with Cranelift. The code runs
//!   against the same call context as the interpreter.
//!
//! Object semantics (properties, calls, classes, scope lookup) are not part
//! of the engine. They are reached through the [`runtime::ObjectModel`]
//! trait, with [`runtime::StandardModel`] as a reference implementation.
//!
//! # Quick Start
//!
//! ```no_run
//! use avm2::bytecode::{CodeBuilder, ConstantPoolData, MethodBody, MethodInfo, Opcode};
//! use avm2::runtime::StandardModel;
//! use avm2::{Value, VmConfig, VmContext};
//! use std::rc::Rc;
//! use std::sync::Arc;
//!
//! fn main() -> avm2::Result<()> {
//!     let mut code = CodeBuilder::new();
//!     code.push_byte(5).push_byte(3).op(Opcode::Subtract).op(Opcode::ReturnValue);
//!     let vm = VmContext::builder()
//!         .pool(Arc::new(ConstantPoolData::new()))
//!         .method(MethodInfo::new("main", MethodBody::new(code.finish()?, 2, 1)))
//!         .model(Rc::new(StandardModel::new()))
//!         .config(VmConfig::jit_always())
//!         .build()?;
//!     let result = vm.invoke(0, Value::Null, Vec::new())?;
//!     println!("{}", result);
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! | Category | Modules |
//! |----------|---------|
//! | **Bytecode** | [`bytecode`] (decoder, pool, method tables, assembler, JSON modules) |
//! | **Runtime** | [`runtime`] (values, call context, helpers, object model) |
//! | **Execution** | [`interpreter`], [`jit`], [`vm`] |
//! | **Ambient** | [`config`], [`error`](Error) |
#![allow(clippy::too_many_arguments)]
#![allow(clippy::new_without_default)]
#![allow(clippy::enum_variant_names)]

pub mod bytecode;
pub mod config;
pub mod interpreter;
pub mod jit;
pub mod runtime;
pub mod vm;

mod error;

pub use config::{JitMode, VmConfig};
pub use error::{Error, ErrorKind, Result};
pub use runtime::{ObjectModel, StandardModel, Value};
pub use vm::VmContext;

/// avm2 version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
