//! Instruction emitter and function compiler.
//!
//! One pass over the instruction tree. Every opcode emits a fixed x86-64
//! sequence while `StaticStack` mirrors what the code does to the machine
//! stack; forward control flow goes through label ids and is back-patched
//! after the body is emitted.

use crate::abi::{FIRST_STACK_PARAM_OFFSET, INT_ARG_REGS, MAX_XMM_ARGS, SLOT_SIZE};
use crate::runtime;
use crate::translate::instr::{FuncCode, FuncType, Instr, MemArg, ValType};
use crate::translate::stack::StaticStack;
use crate::translate::{CompileOptions, ModuleTypes};
use crate::x64::asm::AluOp;
use crate::x64::{Asm, Cond, Reg, RelocKind, Relocation};
use crate::{Error, Result};

/// Loader-visible placeholder for 8-byte immediates that relocations
/// overwrite (a run of nops, as a tell in unpatched dumps).
pub const RELOC_PLACEHOLDER: u64 = 0x9090_9090_9090_9090;

/// Interrupt vector of the emitted bounds-check trap.
pub const BOUNDS_TRAP_VECTOR: u8 = 4;

/// The emitted code and its relocation table.
#[derive(Debug, Clone)]
pub struct CompiledFunction {
    pub code: Vec<u8>,
    pub relocs: Vec<Relocation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BranchTarget {
    Label(usize),
    FunctionExit,
}

#[derive(Debug, Clone, Copy)]
struct BranchSite {
    /// Offset of the first byte of the 5-byte near-jump placeholder.
    site: usize,
    target: BranchTarget,
}

/// Frame assignment of one local: its type and rbp-relative slot.
#[derive(Debug, Clone, Copy)]
struct LocalSlot {
    ty: ValType,
    fp_offset: i32,
}

#[derive(Clone, Copy)]
enum LoadKind {
    I32,
    I64,
    F64,
    I32S8,
}

#[derive(Clone, Copy)]
enum StoreKind {
    I32,
    I64,
    F64,
    I8,
    I16,
}

enum CallKind {
    Direct(u32),
    Indirect(u32),
}

/// Compile one function body to native code.
///
/// `func_types` is the module's type section (consulted by
/// `call_indirect`); `module` carries the per-index function and global
/// types; `func_type` is this function's own signature.
pub fn compile_function(
    func_types: &[FuncType],
    module: &ModuleTypes,
    func_type: &FuncType,
    code: &FuncCode,
    options: &CompileOptions,
) -> Result<CompiledFunction> {
    let (locals, n_frame_locals) = layout_locals(func_type, &code.locals)?;
    let mut emitter = Emitter {
        asm: Asm::new(),
        labels: Vec::new(),
        branches: Vec::new(),
        relocs: Vec::new(),
        stack: StaticStack::new(),
        locals,
        n_frame_locals,
        func_types,
        module,
        func_type,
    };

    emitter.emit_prologue(options)?;
    emitter.emit_seq(&code.body)?;
    emitter.patch_branches()?;
    emitter.emit_epilogue()?;

    Ok(CompiledFunction {
        code: emitter.asm.into_bytes(),
        relocs: emitter.relocs,
    })
}

/// Assign every local its frame slot.
///
/// Register parameters take the slots directly below the saved base
/// pointer in assignment order; declared locals continue below them;
/// parameters the caller passed on its stack stay where they are, above
/// the return address.
fn layout_locals(
    func_type: &FuncType,
    local_decls: &[(u32, ValType)],
) -> Result<(Vec<LocalSlot>, usize)> {
    let mut locals = Vec::with_capacity(func_type.params.len());
    let mut n_int = 0usize;
    let mut n_xmm = 0usize;
    let mut n_stack = 0i32;

    for &ty in &func_type.params {
        let fp_offset = if ty.is_int() && n_int < INT_ARG_REGS.len() {
            n_int += 1;
            slot_offset(n_int + n_xmm)?
        } else if !ty.is_int() && n_xmm < MAX_XMM_ARGS {
            n_xmm += 1;
            slot_offset(n_int + n_xmm)?
        } else {
            let off = n_stack
                .checked_mul(SLOT_SIZE)
                .and_then(|o| o.checked_add(FIRST_STACK_PARAM_OFFSET))
                .ok_or(Error::OffsetOverflow("caller-spilled parameter offset"))?;
            n_stack = n_stack
                .checked_add(1)
                .ok_or(Error::OffsetOverflow("caller-spilled parameter count"))?;
            off
        };
        locals.push(LocalSlot { ty, fp_offset });
    }

    let n_reg_params = n_int + n_xmm;
    let mut n_decl = 0usize;
    for &(count, ty) in local_decls {
        for _ in 0..count {
            n_decl = n_decl
                .checked_add(1)
                .ok_or(Error::OffsetOverflow("local count"))?;
            locals.push(LocalSlot {
                ty,
                fp_offset: slot_offset(
                    n_reg_params
                        .checked_add(n_decl)
                        .ok_or(Error::OffsetOverflow("local count"))?,
                )?,
            });
        }
    }

    Ok((locals, n_reg_params + n_decl))
}

/// rbp-relative offset of the `n`-th (1-based) frame slot below rbp.
fn slot_offset(n: usize) -> Result<i32> {
    i32::try_from(n)
        .ok()
        .and_then(|n| n.checked_mul(-SLOT_SIZE))
        .ok_or(Error::OffsetOverflow("frame slot offset"))
}

struct Emitter<'a> {
    asm: Asm,
    /// Continuation id -> resolved code offset.
    labels: Vec<Option<usize>>,
    branches: Vec<BranchSite>,
    relocs: Vec<Relocation>,
    stack: StaticStack,
    locals: Vec<LocalSlot>,
    n_frame_locals: usize,
    func_types: &'a [FuncType],
    module: &'a ModuleTypes,
    func_type: &'a FuncType,
}

impl Emitter<'_> {
    fn alloc_label(&mut self) -> usize {
        self.labels.push(None);
        self.labels.len() - 1
    }

    fn push_reloc(&mut self, kind: RelocKind, code_offset: usize, index: u32) {
        self.relocs.push(Relocation {
            kind,
            code_offset,
            index,
        });
    }

    fn local(&self, idx: u32) -> Result<LocalSlot> {
        self.locals
            .get(idx as usize)
            .copied()
            .ok_or_else(|| Error::Malformed(format!("local index {idx} out of range")))
    }

    fn frame_bytes(&self) -> Result<i32> {
        i32::try_from(self.n_frame_locals)
            .ok()
            .and_then(|n| n.checked_mul(SLOT_SIZE))
            .ok_or(Error::OffsetOverflow("frame size"))
    }

    /// Patch a rel32 field to land on `target`.
    fn patch_rel32(&mut self, field: usize, target: usize) -> Result<()> {
        let rel = (target as i64) - (field as i64 + 4);
        let rel =
            i32::try_from(rel).map_err(|_| Error::OffsetOverflow("forward jump displacement"))?;
        self.asm.patch_u32(field, rel as u32);
        Ok(())
    }

    /// Patch a rel8 field to land on the current offset.
    fn patch_rel8_here(&mut self, field: usize) -> Result<()> {
        let rel = (self.asm.offset() as i64) - (field as i64 + 1);
        let rel = i8::try_from(rel).map_err(|_| Error::OffsetOverflow("short jump displacement"))?;
        self.asm.patch_u8(field, rel as u8);
        Ok(())
    }

    // ── prologue / epilogue ──

    fn emit_prologue(&mut self, options: &CompileOptions) -> Result<()> {
        self.asm.push_r64(Reg::Rbp);
        self.asm.mov_rr(Reg::Rbp, Reg::Rsp);
        if options.debug_break_on_entry {
            self.asm.int3();
        }

        let frame_bytes = self.frame_bytes()?;
        if frame_bytes != 0 {
            self.asm.sub_r64_imm32(Reg::Rsp, frame_bytes);
        }

        // spill register parameters to their frame slots
        let mut n_int = 0usize;
        let mut n_xmm = 0u8;
        for i in 0..self.func_type.params.len() {
            let slot = self.locals[i];
            if slot.fp_offset > 0 {
                continue;
            }
            match slot.ty {
                ValType::I32 | ValType::I64 => {
                    self.asm
                        .mov_m64_r64(Reg::Rbp, slot.fp_offset, INT_ARG_REGS[n_int]);
                    n_int += 1;
                }
                ValType::F32 => {
                    self.asm.movss_m_x(Reg::Rbp, slot.fp_offset, n_xmm);
                    n_xmm += 1;
                }
                ValType::F64 => {
                    self.asm.movsd_m_x(Reg::Rbp, slot.fp_offset, n_xmm);
                    n_xmm += 1;
                }
            }
        }

        // declared locals start out zero
        let n_decl = self.locals.len() - self.func_type.params.len();
        if n_decl == 1 {
            self.asm.mov_m64_rsp_imm32(0);
        } else if n_decl > 1 {
            let count = i32::try_from(n_decl).map_err(|_| Error::OffsetOverflow("local count"))?;
            self.asm.mov_rr(Reg::Rdi, Reg::Rsp);
            self.asm.xor_r64(Reg::Rax);
            self.asm.mov_r64_imm32(Reg::Rcx, count);
            self.asm.cld();
            self.asm.rep_stosq();
        }
        Ok(())
    }

    fn patch_branches(&mut self) -> Result<()> {
        let exit = self.asm.offset();
        for i in 0..self.branches.len() {
            let BranchSite { site, target } = self.branches[i];
            let target_offset = match target {
                BranchTarget::FunctionExit => exit,
                BranchTarget::Label(id) => self
                    .labels
                    .get(id)
                    .copied()
                    .flatten()
                    .ok_or_else(|| Error::Internal(format!("unresolved label {id}")))?,
            };
            let rel = (target_offset as i64) - (site as i64) - 5;
            let rel =
                i32::try_from(rel).map_err(|_| Error::OffsetOverflow("branch displacement"))?;
            self.asm.patch_u8(site, 0xE9);
            self.asm.patch_u32(site + 1, rel as u32);
        }
        Ok(())
    }

    fn emit_epilogue(&mut self) -> Result<()> {
        if let Some(ty) = self.func_type.result {
            self.stack.pop_expect(ty)?;
            self.asm.pop_r64(Reg::Rax);
            // callers expect float results in xmm0
            if matches!(ty, ValType::F32 | ValType::F64) {
                self.asm.movq_xmm0_rax();
            }
        }
        if !self.stack.is_empty() {
            return Err(Error::Malformed(
                "operand stack not empty at function end".to_string(),
            ));
        }
        let frame_bytes = self.frame_bytes()?;
        if frame_bytes != 0 {
            self.asm.add_r64_imm32(Reg::Rsp, frame_bytes);
        }
        self.asm.pop_r64(Reg::Rbp);
        self.asm.ret();
        Ok(())
    }

    // ── instruction dispatch ──

    fn emit_seq(&mut self, instrs: &[Instr]) -> Result<()> {
        for instr in instrs {
            self.emit_instr(instr)?;
        }
        Ok(())
    }

    fn emit_instr(&mut self, instr: &Instr) -> Result<()> {
        match instr {
            Instr::Unreachable => self.asm.ud2(),
            Instr::Nop => {}

            Instr::Block { result, body } => self.emit_block(*result, body, false)?,
            Instr::Loop { result, body } => self.emit_block(*result, body, true)?,
            Instr::If {
                result,
                then_body,
                else_body,
            } => self.emit_if(*result, then_body, else_body)?,

            Instr::Br { label } => self.emit_br(*label)?,
            Instr::BrIf { label } => {
                self.stack.pop_expect(ValType::I32)?;
                self.asm.pop_r64(Reg::Rsi);
                self.asm.test_r32(Reg::Rsi);
                let skip = self.asm.jcc_rel8_placeholder(Cond::E);
                self.emit_br(*label)?;
                self.patch_rel8_here(skip)?;
            }
            Instr::BrTable { targets, default } => self.emit_br_table(targets, *default)?,
            Instr::Return => self.emit_return()?,

            Instr::Call { func } => self.emit_call(CallKind::Direct(*func))?,
            Instr::CallIndirect { type_index } => {
                self.emit_call(CallKind::Indirect(*type_index))?;
            }

            Instr::Drop => {
                self.stack.pop()?;
                self.asm.add_r64_imm32(Reg::Rsp, SLOT_SIZE);
            }

            Instr::LocalGet { local } => {
                let slot = self.local(*local)?;
                self.stack.push(slot.ty);
                self.asm.push_m64(Reg::Rbp, slot.fp_offset);
            }
            Instr::LocalSet { local } => {
                let slot = self.local(*local)?;
                self.stack.pop_expect(slot.ty)?;
                self.asm.pop_m64(Reg::Rbp, slot.fp_offset);
            }
            Instr::LocalTee { local } => {
                let slot = self.local(*local)?;
                self.stack.peek_expect(slot.ty)?;
                self.asm.mov_r64_m64(Reg::Rax, Reg::Rsp, 0);
                self.asm.mov_m64_r64(Reg::Rbp, slot.fp_offset, Reg::Rax);
            }

            Instr::GlobalGet { global } => {
                let ty = self.global_type(*global)?;
                let imm = self.asm.mov_r64_imm64(Reg::Rax, RELOC_PLACEHOLDER);
                self.push_reloc(RelocKind::Global, imm, *global);
                let value = runtime::GLOBAL_INST_VALUE as i32;
                match ty {
                    ValType::I32 | ValType::F32 => self.asm.mov_r32_m32(Reg::Rax, Reg::Rax, value),
                    ValType::I64 | ValType::F64 => self.asm.mov_r64_m64(Reg::Rax, Reg::Rax, value),
                }
                self.asm.push_r64(Reg::Rax);
                self.stack.push(ty);
            }
            Instr::GlobalSet { global } => {
                let ty = self.global_type(*global)?;
                self.stack.pop_expect(ty)?;
                self.asm.pop_r64(Reg::Rdx);
                let imm = self.asm.mov_r64_imm64(Reg::Rax, RELOC_PLACEHOLDER);
                self.push_reloc(RelocKind::Global, imm, *global);
                let value = runtime::GLOBAL_INST_VALUE as i32;
                match ty {
                    ValType::I32 | ValType::F32 => self.asm.mov_m32_r32(Reg::Rax, value, Reg::Rdx),
                    ValType::I64 | ValType::F64 => self.asm.mov_m64_r64(Reg::Rax, value, Reg::Rdx),
                }
            }

            Instr::I32Load(m) => self.emit_load(LoadKind::I32, m)?,
            Instr::I64Load(m) => self.emit_load(LoadKind::I64, m)?,
            Instr::F64Load(m) => self.emit_load(LoadKind::F64, m)?,
            Instr::I32Load8S(m) => self.emit_load(LoadKind::I32S8, m)?,
            Instr::I32Store(m) => self.emit_store(StoreKind::I32, m)?,
            Instr::I64Store(m) => self.emit_store(StoreKind::I64, m)?,
            Instr::F64Store(m) => self.emit_store(StoreKind::F64, m)?,
            Instr::I32Store8(m) => self.emit_store(StoreKind::I8, m)?,
            Instr::I32Store16(m) => self.emit_store(StoreKind::I16, m)?,

            Instr::I32Const(v) => {
                // push imm32 sign-extends; negative values would dirty the
                // upper half of the slot, which must stay zero
                if *v >= 0 {
                    self.asm.push_imm32(*v);
                } else {
                    self.asm.mov_r32_imm32(Reg::Rax, *v as u32);
                    self.asm.push_r64(Reg::Rax);
                }
                self.stack.push(ValType::I32);
            }
            Instr::I64Const(v) => {
                self.asm.mov_r64_imm64(Reg::Rax, *v as u64);
                self.asm.push_r64(Reg::Rax);
                self.stack.push(ValType::I64);
            }
            Instr::F64Const(v) => {
                self.asm.mov_r64_imm64(Reg::Rax, v.to_bits());
                self.asm.push_r64(Reg::Rax);
                self.stack.push(ValType::F64);
            }

            Instr::I32Eqz => {
                self.stack.pop_expect(ValType::I32)?;
                self.asm.xor_r32(Reg::Rax);
                self.asm.cmp_m32_rsp_imm8(0);
                self.asm.setcc_al(Cond::E);
                self.asm.mov_m32_r32(Reg::Rsp, 0, Reg::Rax);
                self.stack.push(ValType::I32);
            }

            Instr::I32Eq => self.emit_int_cmp(false, Cond::E)?,
            Instr::I32Ne => self.emit_int_cmp(false, Cond::Ne)?,
            Instr::I32LtS => self.emit_int_cmp(false, Cond::L)?,
            Instr::I32LtU => self.emit_int_cmp(false, Cond::B)?,
            Instr::I32GtS => self.emit_int_cmp(false, Cond::G)?,
            Instr::I32GtU => self.emit_int_cmp(false, Cond::A)?,
            Instr::I32LeS => self.emit_int_cmp(false, Cond::Le)?,
            Instr::I32LeU => self.emit_int_cmp(false, Cond::Be)?,
            Instr::I32GeS => self.emit_int_cmp(false, Cond::Ge)?,
            Instr::I64Eq => self.emit_int_cmp(true, Cond::E)?,
            Instr::I64Ne => self.emit_int_cmp(true, Cond::Ne)?,
            Instr::I64LtS => self.emit_int_cmp(true, Cond::L)?,
            Instr::I64LtU => self.emit_int_cmp(true, Cond::B)?,
            Instr::I64GtS => self.emit_int_cmp(true, Cond::G)?,
            Instr::I64GtU => self.emit_int_cmp(true, Cond::A)?,
            Instr::I64LeS => self.emit_int_cmp(true, Cond::Le)?,
            Instr::I64LeU => self.emit_int_cmp(true, Cond::Be)?,
            Instr::I64GeS => self.emit_int_cmp(true, Cond::Ge)?,

            Instr::F64Eq => self.emit_f64_cmp(true)?,
            Instr::F64Ne => self.emit_f64_cmp(false)?,

            Instr::I32Add => self.emit_int_alu(AluOp::Add, false)?,
            Instr::I32Sub => self.emit_int_alu(AluOp::Sub, false)?,
            Instr::I32And => self.emit_int_alu(AluOp::And, false)?,
            Instr::I32Or => self.emit_int_alu(AluOp::Or, false)?,
            Instr::I32Xor => self.emit_int_alu(AluOp::Xor, false)?,
            Instr::I64Add => self.emit_int_alu(AluOp::Add, true)?,
            Instr::I64Sub => self.emit_int_alu(AluOp::Sub, true)?,
            Instr::I64And => self.emit_int_alu(AluOp::And, true)?,
            Instr::I64Or => self.emit_int_alu(AluOp::Or, true)?,
            Instr::I64Xor => self.emit_int_alu(AluOp::Xor, true)?,

            Instr::I32Mul => self.emit_int_mul(false)?,
            Instr::I64Mul => self.emit_int_mul(true)?,

            Instr::I32DivS => self.emit_int_div(false, true, false)?,
            Instr::I32DivU => self.emit_int_div(false, false, false)?,
            Instr::I32RemS => self.emit_int_div(false, true, true)?,
            Instr::I32RemU => self.emit_int_div(false, false, true)?,
            Instr::I64DivS => self.emit_int_div(true, true, false)?,
            Instr::I64DivU => self.emit_int_div(true, false, false)?,
            Instr::I64RemS => self.emit_int_div(true, true, true)?,
            Instr::I64RemU => self.emit_int_div(true, false, true)?,

            Instr::I32Shl => self.emit_int_shift(ShiftKind::Shl, false)?,
            Instr::I32ShrS => self.emit_int_shift(ShiftKind::ShrS, false)?,
            Instr::I32ShrU => self.emit_int_shift(ShiftKind::ShrU, false)?,
            Instr::I64Shl => self.emit_int_shift(ShiftKind::Shl, true)?,
            Instr::I64ShrS => self.emit_int_shift(ShiftKind::ShrS, true)?,
            Instr::I64ShrU => self.emit_int_shift(ShiftKind::ShrU, true)?,

            Instr::F64Neg => {
                self.stack.peek_expect(ValType::F64)?;
                self.asm.btc_m64_rsp_imm8(63);
            }
            Instr::F64Add => self.emit_f64_arith(F64Arith::Add)?,
            Instr::F64Sub => self.emit_f64_arith(F64Arith::Sub)?,
            Instr::F64Mul => self.emit_f64_arith(F64Arith::Mul)?,

            Instr::I32WrapI64 => {
                self.stack.pop_expect(ValType::I64)?;
                // 32-bit load zero-extends, the store clears the high half
                self.asm.mov_r32_m32(Reg::Rax, Reg::Rsp, 0);
                self.asm.mov_m64_r64(Reg::Rsp, 0, Reg::Rax);
                self.stack.push(ValType::I32);
            }
            Instr::I32TruncF64S => {
                self.stack.pop_expect(ValType::F64)?;
                self.asm.cvttsd2si32_eax_rsp();
                self.asm.mov_m64_r64(Reg::Rsp, 0, Reg::Rax);
                self.stack.push(ValType::I32);
            }
            Instr::I32TruncF64U => {
                self.stack.pop_expect(ValType::F64)?;
                // 64-bit convert covers the full u32 range
                self.asm.cvttsd2si64_rax_rsp();
                self.asm.mov_m64_r64(Reg::Rsp, 0, Reg::Rax);
                self.stack.push(ValType::I32);
            }
            Instr::I64ExtendI32S => {
                self.stack.pop_expect(ValType::I32)?;
                self.asm.movsxd_rax_m_rsp();
                self.asm.mov_m64_r64(Reg::Rsp, 0, Reg::Rax);
                self.stack.push(ValType::I64);
            }
            Instr::I64ExtendI32U => {
                // the high half of an i32 slot is already zero
                self.stack.pop_expect(ValType::I32)?;
                self.stack.push(ValType::I64);
            }
            Instr::F64ConvertI32S => {
                self.stack.pop_expect(ValType::I32)?;
                self.asm.cvtsi2sd32_x0_rsp();
                self.asm.movsd_m_x(Reg::Rsp, 0, 0);
                self.stack.push(ValType::F64);
            }
            Instr::F64ConvertI32U => {
                self.stack.pop_expect(ValType::I32)?;
                self.asm.mov_r32_m32(Reg::Rax, Reg::Rsp, 0);
                self.asm.cvtsi2sd64_x0_rax();
                self.asm.movsd_m_x(Reg::Rsp, 0, 0);
                self.stack.push(ValType::F64);
            }
            Instr::I64ReinterpretF64 => {
                self.stack.pop_expect(ValType::F64)?;
                self.stack.push(ValType::I64);
            }
            Instr::F64ReinterpretI64 => {
                self.stack.pop_expect(ValType::I64)?;
                self.stack.push(ValType::F64);
            }
        }
        Ok(())
    }

    // ── control flow ──

    fn emit_block(&mut self, result: Option<ValType>, body: &[Instr], is_loop: bool) -> Result<()> {
        let arity = usize::from(result.is_some());
        let label = self.alloc_label();
        let label_idx = self.stack.len();
        self.stack.push_label(arity, label);

        let start = self.asm.offset();
        self.emit_seq(body)?;
        self.stack.settle_block(label_idx, arity)?;

        // loops continue at their first byte, blocks after their last
        self.labels[label] = Some(if is_loop { start } else { self.asm.offset() });
        Ok(())
    }

    fn emit_if(
        &mut self,
        result: Option<ValType>,
        then_body: &[Instr],
        else_body: &[Instr],
    ) -> Result<()> {
        let arity = usize::from(result.is_some());
        self.stack.pop_expect(ValType::I32)?;
        self.asm.pop_r64(Reg::Rax);
        self.asm.test_r32(Reg::Rax);
        let else_jump = self.asm.jcc_rel32_placeholder(Cond::E);

        let label = self.alloc_label();
        let label_idx = self.stack.len();
        self.stack.push_label(arity, label);

        self.emit_seq(then_body)?;

        if else_body.is_empty() {
            let after = self.asm.offset();
            self.patch_rel32(else_jump, after)?;
        } else {
            let end_site = self.asm.jmp_rel32_placeholder();
            let else_start = self.asm.offset();
            self.patch_rel32(else_jump, else_start)?;
            self.emit_seq(else_body)?;
            let after = self.asm.offset();
            self.patch_rel32(end_site + 1, after)?;
        }

        self.stack.settle_block(label_idx, arity)?;
        self.labels[label] = Some(self.asm.offset());
        Ok(())
    }

    /// Discard the slots between the top `arity` values and label `L`,
    /// sliding the values down over them, then jump to `L`'s continuation.
    fn emit_br(&mut self, labelidx: u32) -> Result<()> {
        let label_idx = self.stack.find_label(labelidx)?;
        let (arity, cont) = self.stack.label_at(label_idx)?;

        let depth = self.stack.len() - label_idx;
        let discard = depth
            .checked_sub(labelidx as usize + 1)
            .and_then(|d| d.checked_sub(arity))
            .ok_or_else(|| Error::Malformed("branch arity deeper than stack".to_string()))?;
        let shift = i32::try_from(discard)
            .ok()
            .and_then(|d| d.checked_mul(SLOT_SIZE))
            .ok_or(Error::OffsetOverflow("branch stack shift"))?;

        if arity > 0 && shift != 0 {
            // memmove(rsp + shift, rsp, arity * 8), descending because the
            // regions overlap and the higher addresses must survive
            let top = i32::try_from((arity - 1) * SLOT_SIZE as usize)
                .map_err(|_| Error::OffsetOverflow("branch arity"))?;
            self.asm.mov_rr(Reg::Rsi, Reg::Rsp);
            if top != 0 {
                self.asm.add_r64_imm32(Reg::Rsi, top);
            }
            self.asm.mov_rr(Reg::Rdi, Reg::Rsp);
            self.asm.add_r64_imm32(
                Reg::Rdi,
                top.checked_add(shift)
                    .ok_or(Error::OffsetOverflow("branch stack shift"))?,
            );
            let count =
                i32::try_from(arity).map_err(|_| Error::OffsetOverflow("branch arity"))?;
            self.asm.mov_r64_imm32(Reg::Rcx, count);
            self.asm.std();
            self.asm.rep_movsq();
            self.asm.cld();
        }

        if shift != 0 {
            self.asm.add_r64_imm32(Reg::Rsp, shift);
        }

        let site = self.asm.jmp_rel32_placeholder();
        self.branches.push(BranchSite {
            site,
            target: BranchTarget::Label(cont),
        });
        Ok(())
    }

    fn emit_br_table(&mut self, targets: &[u32], default: u32) -> Result<()> {
        self.stack.pop_expect(ValType::I32)?;
        self.asm.pop_r64(Reg::Rax);

        let n = u32::try_from(targets.len())
            .map_err(|_| Error::OffsetOverflow("branch table length"))?;
        self.asm.cmp_eax_imm32(n);
        let default_jump = self.asm.jcc_rel32_placeholder(Cond::Ae);

        // rdx := table base, then jump to base + table[selector]
        self.asm.lea_r64_rip(Reg::Rdx, 9);
        self.asm.movsxd_rax_table();
        self.asm.add_rax_rdx();
        self.asm.jmp_r64(Reg::Rax);

        let table_off = self.asm.offset();
        for _ in targets {
            self.asm.emit_u32(0x9090_9090);
        }

        let mut end_sites = Vec::with_capacity(targets.len());
        for (i, &target) in targets.iter().enumerate() {
            let entry = u32::try_from(self.asm.offset() - table_off)
                .map_err(|_| Error::OffsetOverflow("branch table entry"))?;
            self.asm.patch_u32(table_off + i * 4, entry);

            self.emit_br(target)?;
            end_sites.push(self.asm.jmp_rel32_placeholder());
        }

        let default_start = self.asm.offset();
        self.patch_rel32(default_jump, default_start)?;
        self.emit_br(default)?;

        let join = self.asm.offset();
        for site in end_sites {
            self.patch_rel32(site + 1, join)?;
        }
        Ok(())
    }

    /// Tail-call-style return: move the results to the top of the
    /// frame-local area, point rsp at them, and jump to the epilogue.
    fn emit_return(&mut self) -> Result<()> {
        let arity = i32::from(self.func_type.result.is_some());
        let frame_bytes = self.frame_bytes()?;

        if arity > 0 {
            self.asm
                .lea_r64_m(Reg::Rsi, Reg::Rsp, (arity - 1) * SLOT_SIZE);
            let dst = frame_bytes
                .checked_add(SLOT_SIZE)
                .and_then(i32::checked_neg)
                .ok_or(Error::OffsetOverflow("return slot offset"))?;
            self.asm.lea_r64_m(Reg::Rdi, Reg::Rbp, dst);
            self.asm.mov_r64_imm32(Reg::Rcx, arity);
            self.asm.std();
            self.asm.rep_movsq();
            self.asm.cld();
        }

        let sp = frame_bytes
            .checked_add(arity * SLOT_SIZE)
            .and_then(i32::checked_neg)
            .ok_or(Error::OffsetOverflow("return stack reset"))?;
        self.asm.lea_r64_m(Reg::Rsp, Reg::Rbp, sp);

        let site = self.asm.jmp_rel32_placeholder();
        self.branches.push(BranchSite {
            site,
            target: BranchTarget::FunctionExit,
        });
        Ok(())
    }

    // ── calls ──

    fn emit_call(&mut self, kind: CallKind) -> Result<()> {
        let ft = match &kind {
            CallKind::Direct(func) => self
                .module
                .functypes
                .get(*func as usize)
                .ok_or_else(|| Error::Malformed(format!("function index {func} out of range")))?
                .clone(),
            CallKind::Indirect(type_index) => self
                .func_types
                .get(*type_index as usize)
                .ok_or_else(|| Error::Malformed(format!("type index {type_index} out of range")))?
                .clone(),
        };

        // resolve the callee into rax
        match kind {
            CallKind::Indirect(type_index) => {
                self.stack.pop_expect(ValType::I32)?;
                let depth = self.n_frame_locals + self.stack.value_depth();

                let imm = self.asm.mov_r64_imm64(Reg::Rdi, RELOC_PLACEHOLDER);
                self.push_reloc(RelocKind::Table, imm, 0);
                let imm = self.asm.mov_r64_imm64(Reg::Rsi, RELOC_PLACEHOLDER);
                self.push_reloc(RelocKind::Type, imm, type_index);
                self.asm.pop_r64(Reg::Rdx);
                let imm = self.asm.mov_r64_imm64(Reg::Rax, RELOC_PLACEHOLDER);
                self.push_reloc(RelocKind::ResolveIndirectCall, imm, 0);

                // the resolver is an ordinary SysV call and needs the same
                // 16-byte alignment as the eventual callee
                let pad = depth % 2 == 1;
                if pad {
                    self.asm.sub_r64_imm32(Reg::Rsp, SLOT_SIZE);
                }
                self.asm.call_r64(Reg::Rax);
                if pad {
                    self.asm.add_r64_imm32(Reg::Rsp, SLOT_SIZE);
                }
            }
            CallKind::Direct(func) => {
                let imm = self.asm.mov_r64_imm64(Reg::Rax, RELOC_PLACEHOLDER);
                self.push_reloc(RelocKind::Func, imm, func);
                self.asm.mov_r64_m64(
                    Reg::Rax,
                    Reg::Rax,
                    runtime::FUNC_INST_COMPILED_CODE as i32,
                );
            }
        }

        self.stack.check_call_args(&ft.params)?;

        // count the arguments that overflow the registers
        let mut n_int = 0usize;
        let mut n_xmm = 0usize;
        let mut n_spill = 0usize;
        for &ty in &ft.params {
            if ty.is_int() && n_int < INT_ARG_REGS.len() {
                n_int += 1;
            } else if !ty.is_int() && n_xmm < MAX_XMM_ARGS {
                n_xmm += 1;
            } else {
                n_spill += 1;
            }
        }

        let depth = self.n_frame_locals + self.stack.value_depth() + n_spill;
        let pad = depth % 2 == 1;
        let aligned = usize::from(pad);
        if pad {
            self.asm.sub_r64_imm32(Reg::Rsp, SLOT_SIZE);
        }

        // marshal: the i-th input sits i slots below the top of the
        // operand stack, shifted by whatever we have pushed since
        let n_inputs = ft.params.len();
        let mut n_int = 0usize;
        let mut n_xmm = 0u8;
        let mut pushed = 0usize;
        for (i, &ty) in ft.params.iter().enumerate() {
            let slot = n_inputs - 1 - i + pushed + aligned;
            let off = i32::try_from(slot)
                .ok()
                .and_then(|s| s.checked_mul(SLOT_SIZE))
                .ok_or(Error::OffsetOverflow("call argument offset"))?;
            if ty.is_int() && n_int < INT_ARG_REGS.len() {
                self.asm.mov_r64_m64(INT_ARG_REGS[n_int], Reg::Rsp, off);
                n_int += 1;
            } else if ty == ValType::F32 && usize::from(n_xmm) < MAX_XMM_ARGS {
                self.asm.movss_x_m(n_xmm, Reg::Rsp, off);
                n_xmm += 1;
            } else if ty == ValType::F64 && usize::from(n_xmm) < MAX_XMM_ARGS {
                self.asm.movsd_x_m(n_xmm, Reg::Rsp, off);
                n_xmm += 1;
            } else {
                self.asm.push_m64(Reg::Rsp, off);
                pushed += 1;
            }
        }

        self.asm.call_r64(Reg::Rax);

        // drop the consumed arguments, the pushed copies, and the pad
        let restore = pushed
            .checked_add(n_inputs)
            .and_then(|n| n.checked_add(aligned))
            .and_then(|n| i32::try_from(n).ok())
            .and_then(|n| n.checked_mul(SLOT_SIZE))
            .ok_or(Error::OffsetOverflow("call stack restore"))?;
        if restore != 0 {
            self.asm.add_r64_imm32(Reg::Rsp, restore);
        }

        for _ in 0..n_inputs {
            self.stack.pop()?;
        }
        if let Some(result) = ft.result {
            if matches!(result, ValType::F32 | ValType::F64) {
                self.asm.movq_rax_xmm0();
            }
            self.asm.push_r64(Reg::Rax);
            self.stack.push(result);
        }
        Ok(())
    }

    fn global_type(&self, idx: u32) -> Result<ValType> {
        self.module
            .globals
            .get(idx as usize)
            .map(|g| g.ty)
            .ok_or_else(|| Error::Malformed(format!("global index {idx} out of range")))
    }

    // ── memory ──

    /// Pop the i32 address into rsi, bias it, trap if it exceeds the
    /// memory size, and leave the data pointer in rax.
    fn emit_bounds_checked_address(&mut self, memarg: &MemArg) -> Result<()> {
        self.stack.pop_expect(ValType::I32)?;
        self.asm.pop_r64(Reg::Rsi);

        // the 4-byte pad lets every access width share one compare
        let biased = memarg
            .offset
            .checked_add(4)
            .and_then(|o| i32::try_from(o).ok())
            .ok_or(Error::OffsetOverflow("memory access offset"))?;
        self.asm.add_r64_imm32(Reg::Rsi, biased);

        let imm = self.asm.mov_r64_imm64(Reg::Rax, RELOC_PLACEHOLDER);
        self.push_reloc(RelocKind::Mem, imm, 0);
        self.asm
            .mov_r64_m64(Reg::Rax, Reg::Rax, runtime::MEM_INST_SIZE as i32);
        self.asm.cmp_rr(Reg::Rsi, Reg::Rax);
        let skip = self.asm.jcc_rel8_placeholder(Cond::Le);
        self.asm.int_imm8(BOUNDS_TRAP_VECTOR);
        self.patch_rel8_here(skip)?;

        let imm = self.asm.mov_r64_imm64(Reg::Rax, RELOC_PLACEHOLDER);
        self.push_reloc(RelocKind::Mem, imm, 0);
        self.asm
            .mov_r64_m64(Reg::Rax, Reg::Rax, runtime::MEM_INST_DATA as i32);
        Ok(())
    }

    fn emit_load(&mut self, kind: LoadKind, memarg: &MemArg) -> Result<()> {
        self.emit_bounds_checked_address(memarg)?;
        match kind {
            LoadKind::I32S8 => self.asm.mov_r32_m8s_bi(Reg::Rax, Reg::Rax, Reg::Rsi, -4),
            LoadKind::I32 => self.asm.mov_r32_m32_bi(Reg::Rax, Reg::Rax, Reg::Rsi, -4),
            LoadKind::I64 | LoadKind::F64 => {
                self.asm.mov_r64_m64_bi(Reg::Rax, Reg::Rax, Reg::Rsi, -4);
            }
        }
        self.asm.push_r64(Reg::Rax);
        self.stack.push(match kind {
            LoadKind::I32 | LoadKind::I32S8 => ValType::I32,
            LoadKind::I64 => ValType::I64,
            LoadKind::F64 => ValType::F64,
        });
        Ok(())
    }

    fn emit_store(&mut self, kind: StoreKind, memarg: &MemArg) -> Result<()> {
        self.stack.pop_expect(match kind {
            StoreKind::I32 | StoreKind::I8 | StoreKind::I16 => ValType::I32,
            StoreKind::I64 => ValType::I64,
            StoreKind::F64 => ValType::F64,
        })?;
        self.asm.pop_r64(Reg::Rdi);
        self.emit_bounds_checked_address(memarg)?;
        match kind {
            StoreKind::I8 => self.asm.mov_m8_r8_bi(Reg::Rax, Reg::Rsi, -4, Reg::Rdi),
            StoreKind::I16 => self.asm.mov_m16_r16_bi(Reg::Rax, Reg::Rsi, -4, Reg::Rdi),
            StoreKind::I32 => self.asm.mov_m32_r32_bi(Reg::Rax, Reg::Rsi, -4, Reg::Rdi),
            StoreKind::I64 | StoreKind::F64 => {
                self.asm.mov_m64_r64_bi(Reg::Rax, Reg::Rsi, -4, Reg::Rdi);
            }
        }
        Ok(())
    }

    // ── arithmetic helpers ──

    fn emit_int_cmp(&mut self, wide: bool, cond: Cond) -> Result<()> {
        let ty = if wide { ValType::I64 } else { ValType::I32 };
        self.stack.pop_expect(ty)?;
        self.stack.pop_expect(ty)?;
        self.asm.pop_r64(Reg::Rdi);
        if wide {
            self.asm.xor_r64(Reg::Rax);
        } else {
            self.asm.xor_r32(Reg::Rax);
        }
        self.asm.alu_m_rsp(AluOp::Cmp, Reg::Rdi, wide);
        self.asm.setcc_al(cond);
        if wide {
            // overwrite all 8 significant bytes of the lhs slot
            self.asm.mov_m64_r64(Reg::Rsp, 0, Reg::Rax);
        } else {
            self.asm.mov_m32_r32(Reg::Rsp, 0, Reg::Rax);
        }
        self.stack.push(ValType::I32);
        Ok(())
    }

    fn emit_f64_cmp(&mut self, is_eq: bool) -> Result<()> {
        self.stack.pop_expect(ValType::F64)?;
        self.stack.pop_expect(ValType::F64)?;
        self.asm.movsd_x_m(0, Reg::Rsp, 0);
        self.asm.add_r64_imm32(Reg::Rsp, SLOT_SIZE);
        self.asm.xor_r32(Reg::Rax);
        if is_eq {
            self.asm.xor_r32(Reg::Rdx);
        } else {
            self.asm.mov_r32_imm32(Reg::Rdx, 1);
        }
        self.asm.ucomisd_x_m_rsp(0);
        // NaN parity: unordered means eq=0 / ne=1, folded in via cmov
        self.asm.setcc_al(if is_eq { Cond::Np } else { Cond::P });
        self.asm.cmovne_r32(Reg::Rax, Reg::Rdx);
        self.asm.mov_m64_r64(Reg::Rsp, 0, Reg::Rax);
        self.stack.push(ValType::I32);
        Ok(())
    }

    fn emit_int_alu(&mut self, op: AluOp, wide: bool) -> Result<()> {
        let ty = if wide { ValType::I64 } else { ValType::I32 };
        self.stack.pop_expect(ty)?;
        self.stack.peek_expect(ty)?;
        self.asm.pop_r64(Reg::Rax);
        self.asm.alu_m_rsp(op, Reg::Rax, wide);
        Ok(())
    }

    fn emit_int_mul(&mut self, wide: bool) -> Result<()> {
        let ty = if wide { ValType::I64 } else { ValType::I32 };
        self.stack.pop_expect(ty)?;
        self.stack.peek_expect(ty)?;
        self.asm.pop_r64(Reg::Rax);
        self.asm.mul_m_rsp(wide);
        if wide {
            self.asm.mov_m64_r64(Reg::Rsp, 0, Reg::Rax);
        } else {
            self.asm.mov_m32_r32(Reg::Rsp, 0, Reg::Rax);
        }
        Ok(())
    }

    fn emit_int_div(&mut self, wide: bool, signed: bool, want_rem: bool) -> Result<()> {
        let ty = if wide { ValType::I64 } else { ValType::I32 };
        self.stack.pop_expect(ty)?;
        self.stack.peek_expect(ty)?;
        self.asm.pop_r64(Reg::Rdi);
        if wide {
            self.asm.mov_r64_m64(Reg::Rax, Reg::Rsp, 0);
        } else {
            self.asm.mov_r32_m32(Reg::Rax, Reg::Rsp, 0);
        }
        if signed {
            self.asm.cqo(wide);
            self.asm.idiv_r(Reg::Rdi, wide);
        } else {
            if wide {
                self.asm.xor_r64(Reg::Rdx);
            } else {
                self.asm.xor_r32(Reg::Rdx);
            }
            self.asm.div_r(Reg::Rdi, wide);
        }
        let result = if want_rem { Reg::Rdx } else { Reg::Rax };
        if wide {
            self.asm.mov_m64_r64(Reg::Rsp, 0, result);
        } else {
            self.asm.mov_m32_r32(Reg::Rsp, 0, result);
        }
        Ok(())
    }

    fn emit_int_shift(&mut self, kind: ShiftKind, wide: bool) -> Result<()> {
        let ty = if wide { ValType::I64 } else { ValType::I32 };
        self.stack.pop_expect(ty)?;
        self.stack.peek_expect(ty)?;
        self.asm.pop_r64(Reg::Rcx);
        match kind {
            ShiftKind::Shl => self.asm.shl_m_rsp(wide),
            ShiftKind::ShrS => self.asm.sar_m_rsp(wide),
            ShiftKind::ShrU => self.asm.shr_m_rsp(wide),
        }
        Ok(())
    }

    fn emit_f64_arith(&mut self, op: F64Arith) -> Result<()> {
        self.stack.pop_expect(ValType::F64)?;
        self.stack.peek_expect(ValType::F64)?;
        self.asm.movsd_x_m(1, Reg::Rsp, 0);
        self.asm.add_r64_imm32(Reg::Rsp, SLOT_SIZE);
        self.asm.movsd_x_m(0, Reg::Rsp, 0);
        match op {
            F64Arith::Add => self.asm.addsd_xx(0, 1),
            F64Arith::Sub => self.asm.subsd_xx(0, 1),
            F64Arith::Mul => self.asm.mulsd_xx(0, 1),
        }
        self.asm.movsd_m_x(Reg::Rsp, 0, 0);
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum ShiftKind {
    Shl,
    ShrS,
    ShrU,
}

#[derive(Clone, Copy)]
enum F64Arith {
    Add,
    Sub,
    Mul,
}
