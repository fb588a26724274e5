mod codegen;
pub mod instr;
mod stack;

use wasmparser::{CompositeInnerType, Parser, Payload, TypeRef};

use crate::{Error, Result};
use instr::{decode_function, FuncType, ValType};

pub use codegen::{compile_function, CompiledFunction, BOUNDS_TRAP_VECTOR, RELOC_PLACEHOLDER};

/// Knobs for code generation.
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Emit an `int3` breakpoint at the top of every prologue so a
    /// debugger stops on function entry.
    pub debug_break_on_entry: bool,
}

/// Declared type of one global variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalType {
    pub ty: ValType,
    pub mutable: bool,
}

/// Per-module index spaces the emitter consults: the signature of every
/// function (imports first) and the type of every global.
#[derive(Debug, Default)]
pub struct ModuleTypes {
    pub functypes: Vec<FuncType>,
    pub globals: Vec<GlobalType>,
}

/// Native code for every local function of a module, in code-section
/// order.
#[derive(Debug)]
pub struct CompiledModule {
    pub functions: Vec<CompiledFunction>,
}

pub fn compile(wasm: &[u8]) -> Result<CompiledModule> {
    compile_with_options(wasm, &CompileOptions::default())
}

pub fn compile_with_options(wasm: &[u8], options: &CompileOptions) -> Result<CompiledModule> {
    let mut func_types: Vec<FuncType> = Vec::new();
    let mut module = ModuleTypes::default();
    let mut local_func_types: Vec<FuncType> = Vec::new();
    let mut bodies = Vec::new();

    for payload in Parser::new(0).parse_all(wasm) {
        match payload? {
            Payload::TypeSection(reader) => {
                for rec_group in reader {
                    for sub_type in rec_group?.into_types() {
                        match &sub_type.composite_type.inner {
                            CompositeInnerType::Func(f) => {
                                func_types.push(FuncType::from_wasm(f)?);
                            }
                            other => {
                                return Err(Error::Unsupported(format!("type section entry {other:?}")));
                            }
                        }
                    }
                }
            }
            Payload::ImportSection(reader) => {
                for import in reader {
                    match import?.ty {
                        TypeRef::Func(type_idx) => {
                            let ft = func_types.get(type_idx as usize).ok_or_else(|| {
                                Error::Malformed(format!("type index {type_idx} out of range"))
                            })?;
                            module.functypes.push(ft.clone());
                        }
                        TypeRef::Global(g) => {
                            module.globals.push(GlobalType {
                                ty: ValType::from_wasm(g.content_type)?,
                                mutable: g.mutable,
                            });
                        }
                        // table and memory imports carry no layout the
                        // emitter bakes into code
                        _ => {}
                    }
                }
            }
            Payload::FunctionSection(reader) => {
                for type_idx in reader {
                    let type_idx = type_idx?;
                    let ft = func_types.get(type_idx as usize).ok_or_else(|| {
                        Error::Malformed(format!("type index {type_idx} out of range"))
                    })?;
                    module.functypes.push(ft.clone());
                    local_func_types.push(ft.clone());
                }
            }
            Payload::GlobalSection(reader) => {
                for global in reader {
                    let g = global?.ty;
                    module.globals.push(GlobalType {
                        ty: ValType::from_wasm(g.content_type)?,
                        mutable: g.mutable,
                    });
                }
            }
            Payload::CodeSectionEntry(body) => {
                bodies.push(body);
            }
            _ => {}
        }
    }

    let mut functions = Vec::with_capacity(bodies.len());
    for (i, body) in bodies.iter().enumerate() {
        let func_type = local_func_types.get(i).ok_or_else(|| {
            Error::Malformed(format!("code entry {i} has no function declaration"))
        })?;
        let code = decode_function(body)?;
        let compiled = compile_function(&func_types, &module, func_type, &code, options)?;
        tracing::debug!(
            function = i,
            code_bytes = compiled.code.len(),
            relocations = compiled.relocs.len(),
            "compiled function"
        );
        functions.push(compiled);
    }

    Ok(CompiledModule { functions })
}
