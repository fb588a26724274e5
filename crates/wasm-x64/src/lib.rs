#![allow(clippy::too_many_lines, clippy::missing_errors_doc)]

pub mod abi;
pub mod error;
pub mod runtime;
pub mod translate;
pub mod x64;

/// Test harness module for asserting on emitted code.
///
/// Only available when running tests or when the `test-harness` feature
/// is enabled.
#[cfg(any(test, feature = "test-harness"))]
pub mod test_harness;

pub use error::{Error, Result};
pub use translate::instr::{FuncCode, FuncType, Instr, MemArg, ValType};
pub use translate::{
    compile, compile_function, compile_with_options, CompileOptions, CompiledFunction,
    CompiledModule, GlobalType, ModuleTypes, BOUNDS_TRAP_VECTOR, RELOC_PLACEHOLDER,
};
pub use x64::{RelocKind, Relocation};
