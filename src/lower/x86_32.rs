//! x86-32 semantic primitives (spec §4.1.2/§4.1.3: cdecl-like, stack-passed
//! arguments, one scratch register). i64 values are wide here (two 32-bit
//! words), so the add/sub/and/or/xor paths in `lower::mod` are exercised
//! for this target.

use super::{AsmBuf, FrameInfo, Isa};
use crate::ast::{BinOp, CmpOp, ConvOp, MemWidth, ValType};
use crate::stack::{Loc, ValueLoc};
use crate::target::Target;

pub struct X86_32Isa;

fn operand(loc: Loc) -> String {
    match loc {
        Loc::Reg(r) => r.to_string(),
        Loc::Spill(off) => format!("dword [ebp{off:+}]"),
        Loc::Imm(v) => v.to_string(),
    }
}

fn mnemonic(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "add",
        BinOp::Sub => "sub",
        BinOp::Mul => "imul",
        BinOp::DivS => "idiv",
        BinOp::DivU => "div",
        BinOp::RemS => "idiv",
        BinOp::RemU => "div",
        BinOp::And => "and",
        BinOp::Or => "or",
        BinOp::Xor => "xor",
        BinOp::Shl => "shl",
        BinOp::ShrS => "sar",
        BinOp::ShrU => "shr",
        BinOp::Rotl => "rol",
        BinOp::Rotr => "ror",
    }
}

fn cc(op: CmpOp) -> &'static str {
    match op {
        CmpOp::Eq => "e",
        CmpOp::Ne => "ne",
        CmpOp::LtS => "l",
        CmpOp::LtU => "b",
        CmpOp::GtS => "g",
        CmpOp::GtU => "a",
        CmpOp::LeS => "le",
        CmpOp::LeU => "be",
        CmpOp::GeS => "ge",
        CmpOp::GeU => "ae",
    }
}

impl Isa for X86_32Isa {
    fn target(&self) -> Target {
        Target::X86_32
    }

    fn emit_prologue(&self, b: &mut AsmBuf, frame: &FrameInfo) {
        let sched = self.schedule();
        b.instr("push ebp");
        b.instr("mov ebp, esp");
        // Virtual-stack registers and the memory-base register are saved
        // right below ebp once the frame pointer is established; locals
        // start further down, past this save area, and never alias it.
        for reg in sched.stack_regs.iter().chain(std::iter::once(&sched.mem_base)) {
            b.instr(format!("push {reg}"));
        }
        if frame.frame_bytes > 0 {
            b.instr(format!("sub esp, {}", frame.frame_bytes));
        }
        b.instr(format!("mov {}, [__wat_memory_base]", sched.mem_base));
        // cdecl: parameters arrive on the caller's stack above the saved
        // return address, at `[ebp+8]`, `[ebp+12]`, ... one 32-bit word
        // each (a wide i64 parameter occupies two consecutive words).
        let mut incoming_off = 8i32;
        for offs in frame.local_offsets.iter().take(frame.param_count) {
            for &local_off in offs {
                b.instr(format!("mov eax, [ebp+{incoming_off}]"));
                b.instr(format!("mov [ebp{local_off:+}], eax"));
                incoming_off += 4;
            }
        }
    }

    fn emit_epilogue(&self, b: &mut AsmBuf, frame: &FrameInfo) {
        let sched = self.schedule();
        if frame.frame_bytes > 0 {
            b.instr(format!("add esp, {}", frame.frame_bytes));
        }
        for reg in std::iter::once(&sched.mem_base).chain(sched.stack_regs.iter().rev()) {
            b.instr(format!("pop {reg}"));
        }
        b.instr("pop ebp");
        b.instr("ret");
    }

    fn save_area_bytes(&self) -> i32 {
        let sched = self.schedule();
        (sched.stack_regs.len() as i32 + 1) * sched.word_bytes
    }

    fn emit_mov(&self, b: &mut AsmBuf, dst: Loc, src: Loc, _ty: ValType) {
        if dst == src {
            return;
        }
        b.instr(format!("mov {}, {}", operand(dst), operand(src)));
    }

    fn emit_mov_imm(&self, b: &mut AsmBuf, dst: Loc, value: i64, _ty: ValType) {
        b.instr(format!("mov {}, {value}", operand(dst)));
    }

    fn emit_load_mem(&self, b: &mut AsmBuf, dst: Loc, addr_reg: &str, offset: u32, width: MemWidth, signed: bool) {
        let (op, kw) = match width {
            MemWidth::W8 => (if signed { "movsx" } else { "movzx" }, "byte"),
            MemWidth::W16 => (if signed { "movsx" } else { "movzx" }, "word"),
            _ => ("mov", "dword"),
        };
        b.instr(format!("{op} {}, {kw} [{addr_reg}+{offset}]", operand(dst)));
    }

    fn emit_store_mem(&self, b: &mut AsmBuf, src: Loc, addr_reg: &str, offset: u32, width: MemWidth) {
        let kw = match width {
            MemWidth::W8 => "byte",
            MemWidth::W16 => "word",
            _ => "dword",
        };
        // edi (a stack register here) has no 8/16-bit alias without a REX
        // prefix, which this mode doesn't have; stage through eax, which
        // is never a stack register, for any narrower-than-word store.
        let value = match width {
            MemWidth::W8 => {
                b.instr(format!("mov eax, {}", operand(src)));
                "al".to_string()
            }
            MemWidth::W16 => {
                b.instr(format!("mov eax, {}", operand(src)));
                "ax".to_string()
            }
            _ => operand(src),
        };
        b.instr(format!("mov {kw} [{addr_reg}+{offset}], {value}"));
    }

    fn emit_load_global(&self, b: &mut AsmBuf, dst: Loc, name: &str, _ty: ValType) {
        b.instr(format!("mov {}, [{name}]", operand(dst)));
    }

    fn emit_store_global(&self, b: &mut AsmBuf, src: Loc, name: &str, _ty: ValType) {
        b.instr(format!("mov [{name}], {}", operand(src)));
    }

    fn emit_binop_word(&self, b: &mut AsmBuf, op: BinOp, dst: Loc, lhs: Loc, rhs: Loc, carry_in: Option<bool>, _ty: ValType) {
        if dst != lhs {
            b.instr(format!("mov {}, {}", operand(dst), operand(lhs)));
        }
        match op {
            BinOp::Mul => b.instr(format!("imul {}, {}", operand(dst), operand(rhs))),
            BinOp::DivS | BinOp::DivU | BinOp::RemS | BinOp::RemU => {
                let signed = matches!(op, BinOp::DivS | BinOp::RemS);
                b.instr(format!("mov eax, {}", operand(dst)));
                b.instr(if signed { "cdq".to_string() } else { "xor edx, edx".to_string() });
                b.instr(format!("{} {}", mnemonic(op), operand(rhs)));
                let result_reg = if matches!(op, BinOp::DivS | BinOp::DivU) { "eax" } else { "edx" };
                b.instr(format!("mov {}, {result_reg}", operand(dst)));
            }
            BinOp::Shl | BinOp::ShrS | BinOp::ShrU | BinOp::Rotl | BinOp::Rotr => {
                // Move the full register: edi (a stack register here) has
                // no non-REX 8-bit alias, so stage through ecx instead of
                // cl directly.
                b.instr(format!("mov ecx, {}", operand(rhs)));
                b.instr(format!("{} {}, cl", mnemonic(op), operand(dst)));
            }
            BinOp::Add | BinOp::Sub => {
                let op_name = match (op, carry_in) {
                    (BinOp::Add, Some(true)) => "adc",
                    (BinOp::Sub, Some(true)) => "sbb",
                    (BinOp::Add, _) => "add",
                    (BinOp::Sub, _) => "sub",
                    _ => unreachable!(),
                };
                b.instr(format!("{op_name} {}, {}", operand(dst), operand(rhs)));
            }
            BinOp::And | BinOp::Or | BinOp::Xor => {
                b.instr(format!("{} {}, {}", mnemonic(op), operand(dst), operand(rhs)));
            }
        }
    }

    fn emit_or_word(&self, b: &mut AsmBuf, dst: Loc, lhs: Loc, rhs: Loc, ty: ValType) {
        self.emit_binop_word(b, BinOp::Or, dst, lhs, rhs, None, ty);
    }

    fn emit_cmp_set(&self, b: &mut AsmBuf, op: CmpOp, dst: Loc, lhs: Loc, rhs: Loc, _ty: ValType) {
        b.instr(format!("cmp {}, {}", operand(lhs), operand(rhs)));
        b.instr(format!("set{} al", cc(op)));
        b.instr("movzx eax, al");
        if dst != Loc::Reg("eax") {
            b.instr(format!("mov {}, eax", operand(dst)));
        }
    }

    fn emit_eqz(&self, b: &mut AsmBuf, dst: Loc, src: Loc, ty: ValType) {
        self.emit_cmp_set(b, CmpOp::Eq, dst, src, Loc::Imm(0), ty);
    }

    fn emit_branch_if_bit(&self, b: &mut AsmBuf, src: Loc, bit_index: u32, _ty: ValType, label: &str, when_set: bool) {
        b.instr(format!("test {}, {}", operand(src), 1i64 << bit_index));
        b.instr(format!("j{} {label}", if when_set { "nz" } else { "z" }));
    }

    fn emit_branch(&self, b: &mut AsmBuf, label: &str) {
        b.instr(format!("jmp {label}"));
    }

    fn emit_branch_if(&self, b: &mut AsmBuf, cond: Loc, label: &str, _ty: ValType, when_nonzero: bool) {
        b.instr(format!("cmp {}, 0", operand(cond)));
        b.instr(format!("j{} {label}", if when_nonzero { "ne" } else { "e" }));
    }

    fn emit_call(&self, b: &mut AsmBuf, name: &str) {
        b.instr(format!("call {name}"));
    }

    fn emit_call_indirect_stub(&self, b: &mut AsmBuf, table_index: Loc, sig_index: u32) {
        b.instr(format!("push {sig_index}"));
        b.instr(format!("push {}", operand(table_index)));
        b.instr("call __wat_call_indirect_check");
        b.instr("add esp, 8");
    }

    fn emit_call_indirect_branch(&self, b: &mut AsmBuf) {
        b.instr("call eax");
    }

    fn emit_trap(&self, b: &mut AsmBuf) {
        b.instr("ud2");
    }

    fn emit_nop(&self, b: &mut AsmBuf) {
        b.instr("nop");
    }

    fn emit_convert(&self, b: &mut AsmBuf, op: ConvOp, dst: &ValueLoc, src: &ValueLoc) {
        match op {
            ConvOp::WrapI64 => self.emit_mov(b, dst.narrow(), src.words()[0], ValType::I32),
            ConvOp::ExtendI32S => {
                b.instr(format!("mov eax, {}", operand(src.narrow())));
                b.instr("cdq");
                self.emit_mov(b, dst.words()[0], Loc::Reg("eax"), ValType::I32);
                self.emit_mov(b, dst.words()[1], Loc::Reg("edx"), ValType::I32);
            }
            ConvOp::ExtendI32U => {
                self.emit_mov(b, dst.words()[0], src.narrow(), ValType::I32);
                self.emit_mov_imm(b, dst.words()[1], 0, ValType::I32);
            }
            ConvOp::I32Extend8S => b.instr(format!("movsx {}, byte {}", operand(dst.narrow()), operand(src.narrow()))),
            ConvOp::I32Extend16S => b.instr(format!("movsx {}, word {}", operand(dst.narrow()), operand(src.narrow()))),
            ConvOp::I64Extend8S => {
                b.instr(format!("movsx eax, byte {}", operand(src.words()[0])));
                b.instr("cdq");
                self.emit_mov(b, dst.words()[0], Loc::Reg("eax"), ValType::I32);
                self.emit_mov(b, dst.words()[1], Loc::Reg("edx"), ValType::I32);
            }
            ConvOp::I64Extend16S => {
                b.instr(format!("movsx eax, word {}", operand(src.words()[0])));
                b.instr("cdq");
                self.emit_mov(b, dst.words()[0], Loc::Reg("eax"), ValType::I32);
                self.emit_mov(b, dst.words()[1], Loc::Reg("edx"), ValType::I32);
            }
            ConvOp::I64Extend32S => {
                b.instr(format!("mov eax, {}", operand(src.words()[0])));
                b.instr("cdq");
                self.emit_mov(b, dst.words()[0], Loc::Reg("eax"), ValType::I32);
                self.emit_mov(b, dst.words()[1], Loc::Reg("edx"), ValType::I32);
            }
        }
    }

    fn emit_select(&self, b: &mut AsmBuf, dst: Loc, on_true: Loc, on_false: Loc, cond: Loc, _ty: ValType) {
        if dst != on_false {
            b.instr(format!("mov {}, {}", operand(dst), operand(on_false)));
        }
        b.instr(format!("cmp {}, 0", operand(cond)));
        b.instr(format!("cmovne {}, {}", operand(dst), operand(on_true)));
    }

    fn emit_memory_size(&self, b: &mut AsmBuf, dst: Loc) {
        b.instr("call __wat_memory_size");
        self.emit_mov(b, dst, Loc::Reg("eax"), ValType::I32);
    }

    fn emit_memory_grow(&self, b: &mut AsmBuf, dst: Loc, src: Loc) {
        b.instr(format!("push {}", operand(src)));
        b.instr("call __wat_memory_grow");
        b.instr("add esp, 4");
        self.emit_mov(b, dst, Loc::Reg("eax"), ValType::I32);
    }

    fn emit_wide_stub_call(&self, b: &mut AsmBuf, name: &str, dst: &ValueLoc, lhs: &ValueLoc, rhs: Option<&ValueLoc>) {
        let addr_of = |loc: &Loc| match loc {
            Loc::Spill(off) => format!("ebp{off:+}"),
            _ => unreachable!("wide values always spill"),
        };
        if let Some(rhs) = rhs {
            b.instr(format!("lea eax, [{}]", addr_of(&rhs.words()[0])));
            b.instr("push eax");
        }
        b.instr(format!("lea eax, [{}]", addr_of(&lhs.words()[0])));
        b.instr("push eax");
        b.instr(format!("lea eax, [{}]", addr_of(&dst.words()[0])));
        b.instr("push eax");
        b.instr(format!("call {name}"));
        b.instr(format!("add esp, {}", if rhs.is_some() { 12 } else { 8 }));
    }

    fn arg_reg(&self, _index: usize) -> Option<&'static str> {
        None
    }

    fn emit_stack_arg_push(&self, b: &mut AsmBuf, loc: Loc) {
        b.instr(format!("push {}", operand(loc)));
    }

    fn emit_stack_arg_cleanup(&self, b: &mut AsmBuf, words: i32) {
        b.instr(format!("add esp, {}", words * 4));
    }

    fn emit_reserve(&self, b: &mut AsmBuf, name: &str, bytes: i32) {
        b.label(name);
        b.instr(format!("res {bytes}"));
    }
}
