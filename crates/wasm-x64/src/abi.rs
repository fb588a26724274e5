//! System V AMD64 calling-convention constants.
//!
//! This module centralizes the argument-register protocol and frame layout
//! rules shared by the locals-layout pass, the prologue, and call
//! marshalling, so the three can never disagree.

use crate::x64::Reg;

/// Integer argument registers, in assignment order.
pub const INT_ARG_REGS: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];

/// Number of xmm registers used for float arguments (xmm0..xmm7).
pub const MAX_XMM_ARGS: usize = 8;

/// Size of one operand-stack / frame-local slot in bytes. Every wasm value
/// occupies exactly one slot regardless of its type.
pub const SLOT_SIZE: i32 = 8;

/// Frame-pointer offset of the first caller-spilled parameter: the saved
/// base pointer and the return address sit between rbp and the arguments.
pub const FIRST_STACK_PARAM_OFFSET: i32 = 16;
