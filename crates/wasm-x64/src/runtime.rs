//! Runtime instance layouts baked into emitted code.
//!
//! The loader that resolves relocations hands the generated code absolute
//! addresses of these structs. The emitter dereferences fields at the
//! offsets below, so the runtime's in-memory representation must match
//! these `#[repr(C)]` definitions exactly.

use std::mem::offset_of;

/// A callable function instance. Emitted `call` sequences load the
/// instance pointer via a `Func` relocation and jump through
/// `compiled_code`.
#[repr(C)]
pub struct FuncInst {
    pub compiled_code: *const u8,
}

/// A linear memory instance. `size` is the current byte length of the
/// region at `data`; every emitted load/store compares against it.
#[repr(C)]
pub struct MemInst {
    pub data: *mut u8,
    pub size: usize,
    pub max: usize,
}

/// A global variable instance.
#[repr(C)]
pub struct GlobalInst {
    pub value: Value,
    pub mutable: bool,
}

/// Storage for one wasm value. All members alias the same 8 bytes; the
/// declared global type selects which one the emitter reads or writes.
#[repr(C)]
#[derive(Clone, Copy)]
pub union Value {
    pub i32: u32,
    pub i64: u64,
    pub f32: f32,
    pub f64: f64,
}

pub const FUNC_INST_COMPILED_CODE: usize = offset_of!(FuncInst, compiled_code);
pub const MEM_INST_DATA: usize = offset_of!(MemInst, data);
pub const MEM_INST_SIZE: usize = offset_of!(MemInst, size);
pub const GLOBAL_INST_VALUE: usize = offset_of!(GlobalInst, value);
