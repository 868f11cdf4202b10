//! Compiled execution tier
//!
//! A method is compiled in three passes. [`analysis`] discovers the block
//! graph and iterates a type-flow analysis to a fixpoint. [`emitter`] then
//! lowers every live block to the register IR in [`ir`], keeping values with
//! a known primitive type unboxed in registers and falling back to the
//! interpreter's own routines for everything else. [`codegen`] turns that IR
//! into host machine code with Cranelift, and [`executor`] enters it against
//! the same `CallContext` the interpreter uses, which is what lets exceptions
//! and tier changes see consistent state.
//!
//! Compiled code is immutable and `Send + Sync`; [`cache::CodeCache`] shares
//! it between VMs.

pub mod analysis;
pub mod cache;
pub mod codegen;
pub mod emitter;
pub mod executor;
pub mod ir;

pub use analysis::{analyze, AnalysisResult, BlockInfo};
pub use cache::CodeCache;
pub use emitter::emit;
pub use executor::execute;
pub use codegen::MachineCode;
pub use ir::{Helper, LoweredMethod, NativeIR};

use crate::bytecode::{ConstantPool, MethodInfo};
use crate::error::Result;
use serde::Serialize;
use std::fmt;
use tracing::debug;

/// Execution tier of a method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CompilationTier {
    Interpreted,
    Compiled,
}

impl fmt::Display for CompilationTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompilationTier::Interpreted => write!(f, "interpreted"),
            CompilationTier::Compiled => write!(f, "compiled"),
        }
    }
}

/// A method ready to run in the compiled tier
#[derive(Debug)]
pub struct CompiledMethod {
    pub lowered: LoweredMethod,
    pub code: MachineCode,
}

impl CompiledMethod {
    pub fn name(&self) -> &str {
        &self.lowered.name
    }

    /// Locals dead on entry to the handler at `target`
    pub fn handler_resets(&self, target: u32) -> &[u32] {
        self.lowered.handler_resets(target)
    }
}

impl fmt::Display for CompiledMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.lowered.fmt(f)
    }
}

/// Analyze, lower and generate machine code for `method`
pub fn compile(method: &MethodInfo, pool: &dyn ConstantPool) -> Result<CompiledMethod> {
    let analysis = analyze(method)?;
    debug!(
        method = %method.name,
        blocks = analysis.blocks.len(),
        iterations = analysis.iterations,
        "analysis converged"
    );
    let lowered = emit(method, &analysis, pool)?;
    let code = codegen::generate(&lowered)?;
    Ok(CompiledMethod { lowered, code })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{CodeBuilder, ConstantPoolData, MethodBody, Opcode};

    #[test]
    fn test_compile_straight_line() {
        let mut b = CodeBuilder::new();
        b.push_byte(2).push_byte(3).op(Opcode::Multiply).op(Opcode::ReturnValue);
        let method = MethodInfo::new("mul", MethodBody::new(b.finish().unwrap(), 2, 1));
        let compiled = compile(&method, &ConstantPoolData::new()).unwrap();
        assert_eq!(compiled.name(), "mul");
        assert!(matches!(compiled.lowered.ir.last(), Some(NativeIR::Return(_))));
        assert!(compiled.to_string().starts_with("== mul ("));
    }

    #[test]
    fn test_compile_rejects_malformed_code() {
        // jump past the end of the method
        let method = MethodInfo::new(
            "bad",
            MethodBody::new(vec![Opcode::Jump as u8, 0x40, 0, 0], 1, 1),
        );
        let err = compile(&method, &ConstantPoolData::new()).unwrap_err();
        assert!(err.is_format_error());
    }

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_compiled_method_can_be_shared() {
        assert_send_sync::<CompiledMethod>();
    }

    #[test]
    fn test_tier_display() {
        assert_eq!(CompilationTier::Compiled.to_string(), "compiled");
    }
}
