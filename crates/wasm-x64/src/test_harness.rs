//! Test harness for wasm-x64 unit and integration tests.
//!
//! This module is only available when running tests (`#[cfg(test)]`) or
//! with the `test-harness` feature enabled.
//!
//! # Example
//!
//! ```rust
//! use wasm_x64::test_harness::*;
//!
//! let f = compile_wat_function(
//!     r#"
//!     (module
//!         (func (result i32) i32.const 42)
//!     )
//!     "#,
//! )
//! .expect("compile");
//!
//! // prologue, push 42, pop rax, epilogue
//! assert_contains_bytes(&f.code, &[0x68, 0x2A, 0x00, 0x00, 0x00], "push 42");
//! ```

use crate::{
    compile, compile_with_options, CompileOptions, CompiledFunction, CompiledModule, Error,
    RelocKind, Result,
};

/// Parse WAT (WebAssembly Text) format to a WASM binary.
pub fn wat_to_wasm(wat: &str) -> Result<Vec<u8>> {
    wat::parse_str(wat).map_err(|e| Error::Internal(format!("WAT parse error: {e}")))
}

/// Compile WAT directly.
pub fn compile_wat(wat: &str) -> Result<CompiledModule> {
    compile(&wat_to_wasm(wat)?)
}

/// Compile WAT with explicit options.
pub fn compile_wat_with(wat: &str, options: &CompileOptions) -> Result<CompiledModule> {
    compile_with_options(&wat_to_wasm(wat)?, options)
}

/// Compile WAT and return its first (usually only) function.
pub fn compile_wat_function(wat: &str) -> Result<CompiledFunction> {
    let mut module = compile_wat(wat)?;
    if module.functions.is_empty() {
        return Err(Error::Internal("module has no local functions".to_string()));
    }
    Ok(module.functions.remove(0))
}

/// Offset of the first occurrence of `needle` in `haystack`.
pub fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Number of (possibly overlapping) occurrences of `needle`.
pub fn count_bytes(haystack: &[u8], needle: &[u8]) -> usize {
    if needle.is_empty() || haystack.len() < needle.len() {
        return 0;
    }
    haystack.windows(needle.len()).filter(|w| *w == needle).count()
}

/// Assert that `needle` occurs somewhere in `code`.
pub fn assert_contains_bytes(code: &[u8], needle: &[u8], what: &str) {
    assert!(
        find_bytes(code, needle).is_some(),
        "expected to find {what} ({needle:02X?}) in emitted code:\n{}",
        hex_dump(code)
    );
}

/// Assert that `first` occurs and is followed (not necessarily
/// adjacently) by `second`.
pub fn assert_bytes_ordered(code: &[u8], first: &[u8], second: &[u8], what: &str) {
    let a = find_bytes(code, first)
        .unwrap_or_else(|| panic!("expected {what}: missing {first:02X?}\n{}", hex_dump(code)));
    let rest = &code[a + first.len()..];
    assert!(
        find_bytes(rest, second).is_some(),
        "expected {what}: {second:02X?} after offset {a}\n{}",
        hex_dump(code)
    );
}

/// Relocations of one kind, in emission order.
pub fn relocs_of(f: &CompiledFunction, kind: RelocKind) -> Vec<usize> {
    f.relocs
        .iter()
        .filter(|r| r.kind == kind)
        .map(|r| r.code_offset)
        .collect()
}

pub fn hex_dump(code: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::new();
    for (i, chunk) in code.chunks(16).enumerate() {
        let _ = write!(out, "{:06x}:", i * 16);
        for byte in chunk {
            let _ = write!(out, " {byte:02x}");
        }
        out.push('\n');
    }
    out
}
