pub mod asm;
pub mod reloc;

pub use asm::{Asm, CodeBuf, Cond, Reg};
pub use reloc::{RelocKind, Relocation};
