//! The CLI's own minimal `Module` reader (spec §6.1: this crate never
//! builds a WAT tokenizer/parser; a real toolchain hands an
//! already-parsed AST to the pipeline driver, and this module is the
//! stand-in for that toolchain's output, expressed as JSON instead of
//! WAT text). Every shape here mirrors `ast` one field at a time; the
//! only job is converting wire data into the real AST, so a malformed
//! instruction shows up as a `serde_json` error before the pipeline
//! ever sees it.

use serde::Deserialize;

use crate::ast::{BinOp, BlockType, CmpOp, ConvOp, Function, FuncType, Instr, MemWidth, Module, UnOp, ValType};
use crate::common::Id;

#[derive(Deserialize)]
pub struct WireModule {
    pub functions: Vec<WireFunction>,
    #[serde(default)]
    pub sig_types: Vec<WireFuncType>,
}

/// The parameter/result shape for a `call_indirect` site, addressed by
/// position in `WireModule::sig_types` rather than by name.
#[derive(Deserialize)]
pub struct WireFuncType {
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub results: Vec<String>,
}

#[derive(Deserialize)]
pub struct WireFunction {
    pub name: String,
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub results: Vec<String>,
    #[serde(default)]
    pub locals: Vec<String>,
    #[serde(default)]
    pub body: Vec<WireInstr>,
}

/// Every instruction is tagged by its `op` field; a handful carry an
/// `args` array of primitive values (ints, strings), since they're the
/// most compact encoding for a hand-written test fixture.
#[derive(Deserialize)]
#[serde(tag = "op", content = "args", rename_all = "snake_case")]
pub enum WireInstr {
    Binop(String, String),
    Unop(String, String),
    Cmp(String, String),
    Eqz(String),
    Load { ty: String, width: String, signed: bool, offset: u32 },
    Store { ty: String, width: String, offset: u32 },
    MemorySize,
    MemoryGrow,
    LocalGet(u32),
    LocalSet(u32),
    LocalTee(u32),
    GlobalGet(String, String),
    GlobalSet(String, String),
    Block(WireBlockType),
    Loop(WireBlockType),
    If(WireBlockType),
    Else,
    End,
    Br(u32),
    BrIf(u32),
    BrTable(Vec<u32>, u32),
    Return,
    Unreachable,
    Call(String),
    CallIndirect { sig_index: u32 },
    Convert(String),
    Drop,
    Select,
    Nop,
    I32Const(i32),
    I64Const(i64),
}

#[derive(Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum WireBlockType {
    Empty,
    Value(String),
}

fn width(name: &str) -> MemWidth {
    match name {
        "w8" | "8" => MemWidth::W8,
        "w16" | "16" => MemWidth::W16,
        "w32" | "32" => MemWidth::W32,
        "w64" | "64" => MemWidth::W64,
        other => panic!("unknown memory width `{other}`"),
    }
}

fn binop(name: &str) -> BinOp {
    match name {
        "add" => BinOp::Add,
        "sub" => BinOp::Sub,
        "mul" => BinOp::Mul,
        "div_s" => BinOp::DivS,
        "div_u" => BinOp::DivU,
        "rem_s" => BinOp::RemS,
        "rem_u" => BinOp::RemU,
        "and" => BinOp::And,
        "or" => BinOp::Or,
        "xor" => BinOp::Xor,
        "shl" => BinOp::Shl,
        "shr_s" => BinOp::ShrS,
        "shr_u" => BinOp::ShrU,
        "rotl" => BinOp::Rotl,
        "rotr" => BinOp::Rotr,
        other => panic!("unknown binop `{other}`"),
    }
}

fn unop(name: &str) -> UnOp {
    match name {
        "clz" => UnOp::Clz,
        "ctz" => UnOp::Ctz,
        "popcnt" => UnOp::Popcnt,
        other => panic!("unknown unop `{other}`"),
    }
}

fn cmpop(name: &str) -> CmpOp {
    match name {
        "eq" => CmpOp::Eq,
        "ne" => CmpOp::Ne,
        "lt_s" => CmpOp::LtS,
        "lt_u" => CmpOp::LtU,
        "gt_s" => CmpOp::GtS,
        "gt_u" => CmpOp::GtU,
        "le_s" => CmpOp::LeS,
        "le_u" => CmpOp::LeU,
        "ge_s" => CmpOp::GeS,
        "ge_u" => CmpOp::GeU,
        other => panic!("unknown comparison `{other}`"),
    }
}

fn convop(name: &str) -> ConvOp {
    match name {
        "wrap_i64" => ConvOp::WrapI64,
        "extend_i32_s" => ConvOp::ExtendI32S,
        "extend_i32_u" => ConvOp::ExtendI32U,
        "extend8_s_i32" | "i32_extend8_s" => ConvOp::I32Extend8S,
        "extend16_s_i32" | "i32_extend16_s" => ConvOp::I32Extend16S,
        "extend8_s_i64" | "i64_extend8_s" => ConvOp::I64Extend8S,
        "extend16_s_i64" | "i64_extend16_s" => ConvOp::I64Extend16S,
        "extend32_s_i64" | "i64_extend32_s" => ConvOp::I64Extend32S,
        other => panic!("unknown conversion `{other}`"),
    }
}

impl From<WireBlockType> for BlockType {
    fn from(w: WireBlockType) -> Self {
        match w {
            WireBlockType::Empty => BlockType::Empty,
            WireBlockType::Value(ty) => BlockType::Value(valtype(&ty)),
        }
    }
}

impl From<WireInstr> for Instr {
    fn from(w: WireInstr) -> Self {
        match w {
            WireInstr::Binop(ty, op) => Instr::Binop(valtype(&ty), binop(&op)),
            WireInstr::Unop(ty, op) => Instr::Unop(valtype(&ty), unop(&op)),
            WireInstr::Cmp(ty, op) => Instr::Cmp(valtype(&ty), cmpop(&op)),
            WireInstr::Eqz(ty) => Instr::Eqz(valtype(&ty)),
            WireInstr::Load { ty, width: w, signed, offset } => Instr::Load { ty: valtype(&ty), width: width(&w), signed, offset },
            WireInstr::Store { ty, width: w, offset } => Instr::Store { ty: valtype(&ty), width: width(&w), offset },
            WireInstr::MemorySize => Instr::MemorySize,
            WireInstr::MemoryGrow => Instr::MemoryGrow,
            WireInstr::LocalGet(i) => Instr::LocalGet(i),
            WireInstr::LocalSet(i) => Instr::LocalSet(i),
            WireInstr::LocalTee(i) => Instr::LocalTee(i),
            WireInstr::GlobalGet(name, ty) => Instr::GlobalGet(Id::new(name), valtype(&ty)),
            WireInstr::GlobalSet(name, ty) => Instr::GlobalSet(Id::new(name), valtype(&ty)),
            WireInstr::Block(bt) => Instr::Block(bt.into()),
            WireInstr::Loop(bt) => Instr::Loop(bt.into()),
            WireInstr::If(bt) => Instr::If(bt.into()),
            WireInstr::Else => Instr::Else,
            WireInstr::End => Instr::End,
            WireInstr::Br(d) => Instr::Br(d),
            WireInstr::BrIf(d) => Instr::BrIf(d),
            WireInstr::BrTable(targets, default) => Instr::BrTable(targets, default),
            WireInstr::Return => Instr::Return,
            WireInstr::Unreachable => Instr::Unreachable,
            WireInstr::Call(name) => Instr::Call(Id::new(name)),
            WireInstr::CallIndirect { sig_index } => Instr::CallIndirect { sig_index },
            WireInstr::Convert(op) => Instr::Convert(convop(&op)),
            WireInstr::Drop => Instr::Drop,
            WireInstr::Select => Instr::Select,
            WireInstr::Nop => Instr::Nop,
            WireInstr::I32Const(v) => Instr::I32Const(v),
            WireInstr::I64Const(v) => Instr::I64Const(v),
        }
    }
}

fn valtype(name: &str) -> ValType {
    match name {
        "i32" => ValType::I32,
        "i64" => ValType::I64,
        other => panic!("unknown value type `{other}`"),
    }
}

impl From<WireFunction> for Function {
    fn from(w: WireFunction) -> Self {
        Function {
            name: Id::new(w.name),
            params: w.params.iter().map(|s| valtype(s)).collect(),
            results: w.results.iter().map(|s| valtype(s)).collect(),
            locals: w.locals.iter().map(|s| valtype(s)).collect(),
            body: w.body.into_iter().map(Instr::from).collect(),
        }
    }
}

impl From<WireFuncType> for FuncType {
    fn from(w: WireFuncType) -> Self {
        FuncType {
            params: w.params.iter().map(|s| valtype(s)).collect(),
            results: w.results.iter().map(|s| valtype(s)).collect(),
        }
    }
}

impl From<WireModule> for Module {
    fn from(w: WireModule) -> Self {
        Module {
            functions: w.functions.into_iter().map(Function::from).collect(),
            sig_types: w.sig_types.into_iter().map(FuncType::from).collect(),
        }
    }
}

/// Parse a JSON-encoded module (spec §6.1's stand-in for a real WAT
/// parser's output) into this crate's own AST.
pub fn parse_module(text: &str) -> serde_json::Result<Module> {
    let wire: WireModule = serde_json::from_str(text)?;
    Ok(wire.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_add_function() {
        let json = r#"{
            "functions": [{
                "name": "add",
                "params": ["i32", "i32"],
                "results": ["i32"],
                "body": [
                    {"op": "local_get", "args": 0},
                    {"op": "local_get", "args": 1},
                    {"op": "binop", "args": ["i32", "add"]},
                    {"op": "return"}
                ]
            }]
        }"#;
        let module = parse_module(json).unwrap();
        assert_eq!(module.functions.len(), 1);
        assert_eq!(module.functions[0].name, Id::new("add".to_string()));
        assert_eq!(module.functions[0].body.len(), 4);
        assert!(matches!(module.functions[0].body[2], Instr::Binop(ValType::I32, BinOp::Add)));
    }
}
