//! The instruction tree the compiler consumes.
//!
//! Each opcode is a tagged variant carrying exactly its immediates; nested
//! control structures own their instruction sequences, so the emitter can
//! recurse without cross-references. `decode_function` builds the tree from
//! a `wasmparser` operator stream.

use wasmparser::{BlockType, FunctionBody, Operator};

use crate::{Error, Result};

/// The four primitive value types of the dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValType {
    I32,
    I64,
    F32,
    F64,
}

impl ValType {
    pub(crate) fn from_wasm(ty: wasmparser::ValType) -> Result<Self> {
        match ty {
            wasmparser::ValType::I32 => Ok(Self::I32),
            wasmparser::ValType::I64 => Ok(Self::I64),
            wasmparser::ValType::F32 => Ok(Self::F32),
            wasmparser::ValType::F64 => Ok(Self::F64),
            other => Err(Error::Unsupported(format!("value type {other:?}"))),
        }
    }

    pub fn is_int(self) -> bool {
        matches!(self, Self::I32 | Self::I64)
    }
}

/// A function signature. The dialect allows at most one result.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FuncType {
    pub params: Vec<ValType>,
    pub result: Option<ValType>,
}

impl FuncType {
    pub(crate) fn from_wasm(ty: &wasmparser::FuncType) -> Result<Self> {
        let params = ty
            .params()
            .iter()
            .map(|&p| ValType::from_wasm(p))
            .collect::<Result<Vec<_>>>()?;
        let result = match ty.results() {
            [] => None,
            [r] => Some(ValType::from_wasm(*r)?),
            _ => return Err(Error::Unsupported("multi-value results".to_string())),
        };
        Ok(Self { params, result })
    }
}

/// Static immediate of a memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemArg {
    pub offset: u32,
}

/// One instruction of the supported opcode set.
#[derive(Debug, Clone)]
pub enum Instr {
    Unreachable,
    Nop,
    Block {
        result: Option<ValType>,
        body: Vec<Instr>,
    },
    Loop {
        result: Option<ValType>,
        body: Vec<Instr>,
    },
    If {
        result: Option<ValType>,
        then_body: Vec<Instr>,
        else_body: Vec<Instr>,
    },
    Br {
        label: u32,
    },
    BrIf {
        label: u32,
    },
    BrTable {
        targets: Vec<u32>,
        default: u32,
    },
    Return,
    Call {
        func: u32,
    },
    CallIndirect {
        type_index: u32,
    },
    Drop,
    LocalGet {
        local: u32,
    },
    LocalSet {
        local: u32,
    },
    LocalTee {
        local: u32,
    },
    GlobalGet {
        global: u32,
    },
    GlobalSet {
        global: u32,
    },
    I32Load(MemArg),
    I64Load(MemArg),
    F64Load(MemArg),
    I32Load8S(MemArg),
    I32Store(MemArg),
    I64Store(MemArg),
    F64Store(MemArg),
    I32Store8(MemArg),
    I32Store16(MemArg),
    I32Const(i32),
    I64Const(i64),
    F64Const(f64),
    I32Eqz,
    I32Eq,
    I32Ne,
    I32LtS,
    I32LtU,
    I32GtS,
    I32GtU,
    I32LeS,
    I32LeU,
    I32GeS,
    I64Eq,
    I64Ne,
    I64LtS,
    I64LtU,
    I64GtS,
    I64GtU,
    I64LeS,
    I64LeU,
    I64GeS,
    F64Eq,
    F64Ne,
    I32Add,
    I32Sub,
    I32Mul,
    I32And,
    I32Or,
    I32Xor,
    I32Shl,
    I32ShrS,
    I32ShrU,
    I32DivS,
    I32DivU,
    I32RemS,
    I32RemU,
    I64Add,
    I64Sub,
    I64Mul,
    I64And,
    I64Or,
    I64Xor,
    I64Shl,
    I64ShrS,
    I64ShrU,
    I64DivS,
    I64DivU,
    I64RemS,
    I64RemU,
    F64Neg,
    F64Add,
    F64Sub,
    F64Mul,
    I32WrapI64,
    I32TruncF64S,
    I32TruncF64U,
    I64ExtendI32S,
    I64ExtendI32U,
    F64ConvertI32S,
    F64ConvertI32U,
    I64ReinterpretF64,
    F64ReinterpretI64,
}

/// Declared locals plus the instruction tree of one function body.
#[derive(Debug, Clone, Default)]
pub struct FuncCode {
    /// Run-length encoded local declarations, as in the binary format.
    pub locals: Vec<(u32, ValType)>,
    pub body: Vec<Instr>,
}

enum Frame {
    Block {
        result: Option<ValType>,
        instrs: Vec<Instr>,
    },
    Loop {
        result: Option<ValType>,
        instrs: Vec<Instr>,
    },
    If {
        result: Option<ValType>,
        then_instrs: Vec<Instr>,
        else_instrs: Vec<Instr>,
        in_else: bool,
    },
}

impl Frame {
    fn into_instr(self) -> Instr {
        match self {
            Frame::Block { result, instrs } => Instr::Block { result, body: instrs },
            Frame::Loop { result, instrs } => Instr::Loop { result, body: instrs },
            Frame::If {
                result,
                then_instrs,
                else_instrs,
                ..
            } => Instr::If {
                result,
                then_body: then_instrs,
                else_body: else_instrs,
            },
        }
    }

    fn instrs_mut(&mut self) -> &mut Vec<Instr> {
        match self {
            Frame::Block { instrs, .. } | Frame::Loop { instrs, .. } => instrs,
            Frame::If {
                then_instrs,
                else_instrs,
                in_else,
                ..
            } => {
                if *in_else {
                    else_instrs
                } else {
                    then_instrs
                }
            }
        }
    }
}

/// Build the instruction tree for one code-section entry.
pub fn decode_function(body: &FunctionBody) -> Result<FuncCode> {
    let mut locals = Vec::new();
    for local in body.get_locals_reader()? {
        let (count, ty) = local?;
        locals.push((count, ValType::from_wasm(ty)?));
    }

    let mut root: Vec<Instr> = Vec::new();
    let mut frames: Vec<Frame> = Vec::new();

    let mut reader = body.get_operators_reader()?;
    loop {
        if reader.eof() {
            return Err(Error::Malformed("function body missing end".to_string()));
        }
        let op = reader.read()?;
        match op {
            Operator::Block { blockty } => {
                frames.push(Frame::Block {
                    result: block_result(&blockty)?,
                    instrs: Vec::new(),
                });
            }
            Operator::Loop { blockty } => {
                frames.push(Frame::Loop {
                    result: block_result(&blockty)?,
                    instrs: Vec::new(),
                });
            }
            Operator::If { blockty } => {
                frames.push(Frame::If {
                    result: block_result(&blockty)?,
                    then_instrs: Vec::new(),
                    else_instrs: Vec::new(),
                    in_else: false,
                });
            }
            Operator::Else => match frames.last_mut() {
                Some(Frame::If { in_else, .. }) if !*in_else => *in_else = true,
                _ => return Err(Error::Malformed("else outside if".to_string())),
            },
            Operator::End => match frames.pop() {
                Some(frame) => {
                    let instr = frame.into_instr();
                    frames
                        .last_mut()
                        .map_or(&mut root, Frame::instrs_mut)
                        .push(instr);
                }
                None => break,
            },
            other => {
                let instr = map_operator(&other)?;
                frames
                    .last_mut()
                    .map_or(&mut root, Frame::instrs_mut)
                    .push(instr);
            }
        }
    }

    Ok(FuncCode { locals, body: root })
}

fn block_result(blockty: &BlockType) -> Result<Option<ValType>> {
    match blockty {
        BlockType::Empty => Ok(None),
        BlockType::Type(ty) => Ok(Some(ValType::from_wasm(*ty)?)),
        BlockType::FuncType(_) => Err(Error::Unsupported(
            "block with function-type signature".to_string(),
        )),
    }
}

fn mem_arg(memarg: &wasmparser::MemArg) -> Result<MemArg> {
    if memarg.memory != 0 {
        return Err(Error::Unsupported("multiple memories".to_string()));
    }
    let offset = u32::try_from(memarg.offset)
        .map_err(|_| Error::Unsupported("64-bit memory offset".to_string()))?;
    Ok(MemArg { offset })
}

fn map_operator(op: &Operator) -> Result<Instr> {
    Ok(match op {
        Operator::Unreachable => Instr::Unreachable,
        Operator::Nop => Instr::Nop,
        Operator::Br { relative_depth } => Instr::Br { label: *relative_depth },
        Operator::BrIf { relative_depth } => Instr::BrIf { label: *relative_depth },
        Operator::BrTable { targets } => Instr::BrTable {
            targets: targets.targets().collect::<std::result::Result<_, _>>()?,
            default: targets.default(),
        },
        Operator::Return => Instr::Return,
        Operator::Call { function_index } => Instr::Call { func: *function_index },
        Operator::CallIndirect { type_index, .. } => Instr::CallIndirect {
            type_index: *type_index,
        },
        Operator::Drop => Instr::Drop,
        Operator::LocalGet { local_index } => Instr::LocalGet { local: *local_index },
        Operator::LocalSet { local_index } => Instr::LocalSet { local: *local_index },
        Operator::LocalTee { local_index } => Instr::LocalTee { local: *local_index },
        Operator::GlobalGet { global_index } => Instr::GlobalGet { global: *global_index },
        Operator::GlobalSet { global_index } => Instr::GlobalSet { global: *global_index },
        Operator::I32Load { memarg } => Instr::I32Load(mem_arg(memarg)?),
        Operator::I64Load { memarg } => Instr::I64Load(mem_arg(memarg)?),
        Operator::F64Load { memarg } => Instr::F64Load(mem_arg(memarg)?),
        Operator::I32Load8S { memarg } => Instr::I32Load8S(mem_arg(memarg)?),
        Operator::I32Store { memarg } => Instr::I32Store(mem_arg(memarg)?),
        Operator::I64Store { memarg } => Instr::I64Store(mem_arg(memarg)?),
        Operator::F64Store { memarg } => Instr::F64Store(mem_arg(memarg)?),
        Operator::I32Store8 { memarg } => Instr::I32Store8(mem_arg(memarg)?),
        Operator::I32Store16 { memarg } => Instr::I32Store16(mem_arg(memarg)?),
        Operator::I32Const { value } => Instr::I32Const(*value),
        Operator::I64Const { value } => Instr::I64Const(*value),
        Operator::F64Const { value } => Instr::F64Const(f64::from_bits(value.bits())),
        Operator::I32Eqz => Instr::I32Eqz,
        Operator::I32Eq => Instr::I32Eq,
        Operator::I32Ne => Instr::I32Ne,
        Operator::I32LtS => Instr::I32LtS,
        Operator::I32LtU => Instr::I32LtU,
        Operator::I32GtS => Instr::I32GtS,
        Operator::I32GtU => Instr::I32GtU,
        Operator::I32LeS => Instr::I32LeS,
        Operator::I32LeU => Instr::I32LeU,
        Operator::I32GeS => Instr::I32GeS,
        Operator::I64Eq => Instr::I64Eq,
        Operator::I64Ne => Instr::I64Ne,
        Operator::I64LtS => Instr::I64LtS,
        Operator::I64LtU => Instr::I64LtU,
        Operator::I64GtS => Instr::I64GtS,
        Operator::I64GtU => Instr::I64GtU,
        Operator::I64LeS => Instr::I64LeS,
        Operator::I64LeU => Instr::I64LeU,
        Operator::I64GeS => Instr::I64GeS,
        Operator::F64Eq => Instr::F64Eq,
        Operator::F64Ne => Instr::F64Ne,
        Operator::I32Add => Instr::I32Add,
        Operator::I32Sub => Instr::I32Sub,
        Operator::I32Mul => Instr::I32Mul,
        Operator::I32And => Instr::I32And,
        Operator::I32Or => Instr::I32Or,
        Operator::I32Xor => Instr::I32Xor,
        Operator::I32Shl => Instr::I32Shl,
        Operator::I32ShrS => Instr::I32ShrS,
        Operator::I32ShrU => Instr::I32ShrU,
        Operator::I32DivS => Instr::I32DivS,
        Operator::I32DivU => Instr::I32DivU,
        Operator::I32RemS => Instr::I32RemS,
        Operator::I32RemU => Instr::I32RemU,
        Operator::I64Add => Instr::I64Add,
        Operator::I64Sub => Instr::I64Sub,
        Operator::I64Mul => Instr::I64Mul,
        Operator::I64And => Instr::I64And,
        Operator::I64Or => Instr::I64Or,
        Operator::I64Xor => Instr::I64Xor,
        Operator::I64Shl => Instr::I64Shl,
        Operator::I64ShrS => Instr::I64ShrS,
        Operator::I64ShrU => Instr::I64ShrU,
        Operator::I64DivS => Instr::I64DivS,
        Operator::I64DivU => Instr::I64DivU,
        Operator::I64RemS => Instr::I64RemS,
        Operator::I64RemU => Instr::I64RemU,
        Operator::F64Neg => Instr::F64Neg,
        Operator::F64Add => Instr::F64Add,
        Operator::F64Sub => Instr::F64Sub,
        Operator::F64Mul => Instr::F64Mul,
        Operator::I32WrapI64 => Instr::I32WrapI64,
        Operator::I32TruncF64S => Instr::I32TruncF64S,
        Operator::I32TruncF64U => Instr::I32TruncF64U,
        Operator::I64ExtendI32S => Instr::I64ExtendI32S,
        Operator::I64ExtendI32U => Instr::I64ExtendI32U,
        Operator::F64ConvertI32S => Instr::F64ConvertI32S,
        Operator::F64ConvertI32U => Instr::F64ConvertI32U,
        Operator::I64ReinterpretF64 => Instr::I64ReinterpretF64,
        Operator::F64ReinterpretI64 => Instr::F64ReinterpretI64,
        other => return Err(Error::Unsupported(format!("{other:?}"))),
    })
}
