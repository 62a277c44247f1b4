//! The input AST.
//!
//! This crate never parses `.wat` text: that is delegated to an external
//! grammar toolkit. What lands here is the already-validated tree shape that
//! toolkit hands back. The types below describe that shape precisely enough
//! for the lowerer to consume, and not one field more.

use crate::common::Id;

/// A WASM value type. Only the integer types are in scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValType {
    I32,
    I64,
}

impl ValType {
    pub fn bytes(self) -> i32 {
        match self {
            ValType::I32 => 4,
            ValType::I64 => 8,
        }
    }
}

/// The result type carried by a `block`/`loop`/`if`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockType {
    Empty,
    Value(ValType),
}

impl BlockType {
    pub fn arity(self) -> usize {
        match self {
            BlockType::Empty => 0,
            BlockType::Value(_) => 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemWidth {
    W8,
    W16,
    W32,
    W64,
}

impl MemWidth {
    pub fn bytes(self) -> i32 {
        match self {
            MemWidth::W8 => 1,
            MemWidth::W16 => 2,
            MemWidth::W32 => 4,
            MemWidth::W64 => 8,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
pub enum BinOp {
    #[display("add")]
    Add,
    #[display("sub")]
    Sub,
    #[display("mul")]
    Mul,
    #[display("div_s")]
    DivS,
    #[display("div_u")]
    DivU,
    #[display("rem_s")]
    RemS,
    #[display("rem_u")]
    RemU,
    #[display("and")]
    And,
    #[display("or")]
    Or,
    #[display("xor")]
    Xor,
    #[display("shl")]
    Shl,
    #[display("shr_s")]
    ShrS,
    #[display("shr_u")]
    ShrU,
    #[display("rotl")]
    Rotl,
    #[display("rotr")]
    Rotr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
pub enum UnOp {
    #[display("clz")]
    Clz,
    #[display("ctz")]
    Ctz,
    #[display("popcnt")]
    Popcnt,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
pub enum CmpOp {
    #[display("eq")]
    Eq,
    #[display("ne")]
    Ne,
    #[display("lt_s")]
    LtS,
    #[display("lt_u")]
    LtU,
    #[display("gt_s")]
    GtS,
    #[display("gt_u")]
    GtU,
    #[display("le_s")]
    LeS,
    #[display("le_u")]
    LeU,
    #[display("ge_s")]
    GeS,
    #[display("ge_u")]
    GeU,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
pub enum ConvOp {
    #[display("i32.wrap_i64")]
    WrapI64,
    #[display("i64.extend_i32_s")]
    ExtendI32S,
    #[display("i64.extend_i32_u")]
    ExtendI32U,
    #[display("i32.extend8_s")]
    I32Extend8S,
    #[display("i32.extend16_s")]
    I32Extend16S,
    #[display("i64.extend8_s")]
    I64Extend8S,
    #[display("i64.extend16_s")]
    I64Extend16S,
    #[display("i64.extend32_s")]
    I64Extend32S,
}

/// One instruction in a function body.
///
/// Block nesting is represented the way the reference grammar toolkits
/// produce it: flat, with explicit `End`/`Else` markers, rather than as a
/// recursive tree. The lowerer's block-context stack (see `lower::mod`)
/// reconstructs nesting while walking this list once.
#[derive(Clone, Debug, PartialEq)]
pub enum Instr {
    // Arithmetic / logical / bitwise
    Binop(ValType, BinOp),
    Unop(ValType, UnOp),
    Cmp(ValType, CmpOp),
    Eqz(ValType),

    // Memory
    Load {
        ty: ValType,
        width: MemWidth,
        signed: bool,
        offset: u32,
    },
    Store {
        ty: ValType,
        width: MemWidth,
        offset: u32,
    },
    MemorySize,
    MemoryGrow,

    // Locals / globals
    LocalGet(u32),
    LocalSet(u32),
    LocalTee(u32),
    GlobalGet(Id, ValType),
    GlobalSet(Id, ValType),

    // Control
    Block(BlockType),
    Loop(BlockType),
    If(BlockType),
    Else,
    End,
    Br(u32),
    BrIf(u32),
    BrTable(Vec<u32>, u32),
    Return,
    Unreachable,

    // Calls
    Call(Id),
    CallIndirect { sig_index: u32 },

    // Conversions
    Convert(ConvOp),

    // Parametric
    Drop,
    Select,
    Nop,

    // Constants
    I32Const(i32),
    I64Const(i64),
}

#[derive(Clone, Debug)]
pub struct Function {
    pub name: Id,
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
    pub locals: Vec<ValType>,
    pub body: Vec<Instr>,
}

impl Function {
    /// Local index 0..params.len() are parameters; the rest are `locals`.
    pub fn local_type(&self, index: u32) -> Option<ValType> {
        let index = index as usize;
        self.params
            .get(index)
            .or_else(|| self.locals.get(index - self.params.len()))
            .copied()
    }

    pub fn local_count(&self) -> usize {
        self.params.len() + self.locals.len()
    }
}

/// The parameter/result shape of an indirectly-called function, addressed
/// by `sig_index` from a `call_indirect` site rather than by name.
#[derive(Clone, Debug)]
pub struct FuncType {
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
}

#[derive(Clone, Debug, Default)]
pub struct Module {
    pub functions: Vec<Function>,
    pub sig_types: Vec<FuncType>,
}
