//! x86-64 semantic primitives (spec §4.1.2 SysV-like schedule).
//!
//! Registers are wide enough to hold any WASM value this crate lowers, so
//! every primitive here operates on single words; the wide-value paths in
//! `lower::mod` never trigger for this target (see `Target::has_64bit_registers`).

use super::{AsmBuf, FrameInfo, Isa};
use crate::ast::{BinOp, CmpOp, ConvOp, MemWidth};
use crate::stack::{Loc, ValueLoc};
use crate::target::Target;

pub struct X86_64Isa;

fn reg_width(ty: crate::ast::ValType) -> &'static str {
    if ty == crate::ast::ValType::I64 {
        "q"
    } else {
        "d"
    }
}

fn sized(reg: &str, ty: crate::ast::ValType) -> String {
    // All register names in target.rs's X86_64 schedule are already the
    // 64-bit form (`rax`, `r12`, ...); a 32-bit operation addresses the
    // same register through its 32-bit alias. r8-r15 take a `d` suffix;
    // the legacy eight take an `e` prefix in place of the leading `r`.
    if ty == crate::ast::ValType::I64 || !reg.starts_with('r') {
        return reg.to_string();
    }
    if reg.as_bytes()[1].is_ascii_digit() {
        return format!("{reg}d");
    }
    format!("e{}", &reg[1..])
}

fn operand(loc: Loc, ty: crate::ast::ValType) -> String {
    match loc {
        Loc::Reg(r) => sized(r, ty),
        // The size keyword disambiguates an immediate paired against a
        // spilled slot, which otherwise carries no width of its own.
        Loc::Spill(off) => format!("{} [rbp{off:+}]", reg_width_keyword(ty)),
        Loc::Imm(v) => v.to_string(),
    }
}

fn reg_width_keyword(ty: crate::ast::ValType) -> &'static str {
    if ty == crate::ast::ValType::I64 { "qword" } else { "dword" }
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

/// The 8-bit name for a register's low byte, used by `setcc`.
fn low8(reg: &str) -> String {
    match reg {
        "rax" => "al".into(),
        "rbx" => "bl".into(),
        "rcx" => "cl".into(),
        "rdx" => "dl".into(),
        "rsi" => "sil".into(),
        "rdi" => "dil".into(),
        "rbp" => "bpl".into(),
        "rsp" => "spl".into(),
        r if r.starts_with('r') && r.as_bytes()[1].is_ascii_digit() => format!("{r}b"),
        other => other.to_string(),
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

impl Isa for X86_64Isa {
    fn target(&self) -> Target {
        Target::X86_64
    }

    fn emit_prologue(&self, b: &mut AsmBuf, frame: &FrameInfo) {
        let sched = self.schedule();
        b.instr("push rbp");
        b.instr("mov rbp, rsp");
        // Virtual-stack registers and the memory-base register are this
        // function's own working state, saved right below rbp once the
        // frame pointer is established; locals start further down, past
        // this save area, and never alias it.
        for reg in sched.stack_regs.iter().chain(std::iter::once(&sched.mem_base)) {
            b.instr(format!("push {reg}"));
        }
        if frame.frame_bytes > 0 {
            b.instr(format!("sub rsp, {}", frame.frame_bytes));
        }
        b.instr(format!("mov {}, [__wat_memory_base]", sched.mem_base));
        // Spill incoming parameters from argument registers into their
        // local slots so the rest of the body only ever reads locals from
        // memory, never from a parameter register directly.
        for (i, offs) in frame.local_offsets.iter().take(frame.param_count).enumerate() {
            if let Some(&arg_reg) = sched.args.get(i) {
                b.instr(format!("mov [rbp{:+}], {arg_reg}", offs[0]));
            }
        }
    }

    fn emit_epilogue(&self, b: &mut AsmBuf, frame: &FrameInfo) {
        let _ = frame.has_result;
        let sched = self.schedule();
        if frame.frame_bytes > 0 {
            b.instr(format!("add rsp, {}", frame.frame_bytes));
        }
        for reg in std::iter::once(&sched.mem_base).chain(sched.stack_regs.iter().rev()) {
            b.instr(format!("pop {reg}"));
        }
        b.instr("pop rbp");
        b.instr("ret");
    }

    fn save_area_bytes(&self) -> i32 {
        let sched = self.schedule();
        (sched.stack_regs.len() as i32 + 1) * sched.word_bytes
    }

    fn emit_mov(&self, b: &mut AsmBuf, dst: Loc, src: Loc, ty: crate::ast::ValType) {
        if dst == src {
            return;
        }
        b.instr(format!("mov {}, {}", operand(dst, ty), operand(src, ty)));
    }

    fn emit_mov_imm(&self, b: &mut AsmBuf, dst: Loc, value: i64, ty: crate::ast::ValType) {
        b.instr(format!("mov {}, {value}", operand(dst, ty)));
    }

    fn emit_load_mem(&self, b: &mut AsmBuf, dst: Loc, addr_reg: &str, offset: u32, width: MemWidth, signed: bool) {
        let op = if width == MemWidth::W64 { "mov" } else if signed { "movsx" } else { "movzx" };
        let ty = if width == MemWidth::W64 { crate::ast::ValType::I64 } else { crate::ast::ValType::I32 };
        let width_kw = match width {
            MemWidth::W8 => "byte",
            MemWidth::W16 => "word",
            MemWidth::W32 => "dword",
            MemWidth::W64 => "qword",
        };
        b.instr(format!("{op} {}, {width_kw} [{addr_reg}+{offset}]", operand(dst, ty)));
    }

    fn emit_store_mem(&self, b: &mut AsmBuf, src: Loc, addr_reg: &str, offset: u32, width: MemWidth) {
        let width_kw = match width {
            MemWidth::W8 => "byte",
            MemWidth::W16 => "word",
            MemWidth::W32 => "dword",
            MemWidth::W64 => "qword",
        };
        // A byte/word store needs a source operand of that exact width, and
        // not every register on this target's stack has a non-REX low-8/16
        // alias (r12-r15 do, but staging through rax uniformly means this
        // doesn't have to special-case which ones); rax is never a stack
        // register, so clobbering it here is safe.
        let value = match width {
            MemWidth::W8 => {
                b.instr(format!("mov eax, {}", operand(src, crate::ast::ValType::I32)));
                "al".to_string()
            }
            MemWidth::W16 => {
                b.instr(format!("mov eax, {}", operand(src, crate::ast::ValType::I32)));
                "ax".to_string()
            }
            MemWidth::W32 => operand(src, crate::ast::ValType::I32),
            MemWidth::W64 => operand(src, crate::ast::ValType::I64),
        };
        b.instr(format!("mov {width_kw} [{addr_reg}+{offset}], {value}"));
    }

    fn emit_load_global(&self, b: &mut AsmBuf, dst: Loc, name: &str, ty: crate::ast::ValType) {
        b.instr(format!("mov {}, [{name}]", operand(dst, ty)));
    }

    fn emit_store_global(&self, b: &mut AsmBuf, src: Loc, name: &str, ty: crate::ast::ValType) {
        b.instr(format!("mov [{name}], {}", operand(src, ty)));
    }

    fn emit_binop_word(&self, b: &mut AsmBuf, op: BinOp, dst: Loc, lhs: Loc, rhs: Loc, carry_in: Option<bool>, ty: crate::ast::ValType) {
        if dst != lhs {
            self.emit_mov(b, dst, lhs, ty);
        }
        match op {
            BinOp::Mul => {
                b.instr(format!("imul {}, {}", operand(dst, ty), operand(rhs, ty)));
            }
            BinOp::DivS | BinOp::DivU | BinOp::RemS | BinOp::RemU => {
                let signed = matches!(op, BinOp::DivS | BinOp::RemS);
                b.instr(format!("mov {}, {}", sized("rax", ty), operand(dst, ty)));
                b.instr(if signed { "cqo".to_string() } else { format!("xor {}, {}", sized("rdx", ty), sized("rdx", ty)) });
                b.instr(format!("{} {}", mnemonic(op), operand(rhs, ty)));
                let result_reg = if matches!(op, BinOp::DivS | BinOp::DivU) { "rax" } else { "rdx" };
                b.instr(format!("mov {}, {}", operand(dst, ty), sized(result_reg, ty)));
            }
            BinOp::Shl | BinOp::ShrS | BinOp::ShrU | BinOp::Rotl | BinOp::Rotr => {
                // Move the full register (not just its low byte: source
                // registers on this target's stack don't all have a
                // non-REX 8-bit alias) so the shift instruction can still
                // read its count from cl afterward.
                b.instr(format!("mov ecx, {}", operand(rhs, crate::ast::ValType::I32)));
                b.instr(format!("{} {}, cl", mnemonic(op), operand(dst, ty)));
            }
            BinOp::Add | BinOp::Sub => {
                let op_name = match (op, carry_in) {
                    (BinOp::Add, Some(true)) => "adc",
                    (BinOp::Sub, Some(true)) => "sbb",
                    (BinOp::Add, _) => "add",
                    (BinOp::Sub, _) => "sub",
                    _ => unreachable!(),
                };
                b.instr(format!("{op_name} {}, {}", operand(dst, ty), operand(rhs, ty)));
            }
            BinOp::And | BinOp::Or | BinOp::Xor => {
                b.instr(format!("{} {}, {}", mnemonic(op), operand(dst, ty), operand(rhs, ty)));
            }
        }
    }

    fn emit_or_word(&self, b: &mut AsmBuf, dst: Loc, lhs: Loc, rhs: Loc, ty: crate::ast::ValType) {
        self.emit_binop_word(b, BinOp::Or, dst, lhs, rhs, None, ty);
    }

    fn emit_cmp_set(&self, b: &mut AsmBuf, op: CmpOp, dst: Loc, lhs: Loc, rhs: Loc, ty: crate::ast::ValType) {
        b.instr(format!("cmp {}, {}", operand(lhs, ty), operand(rhs, ty)));
        let low8 = match dst {
            Loc::Reg(r) => low8(r),
            _ => "al".into(),
        };
        b.instr(format!("set{} {low8}", cc(op)));
        if let Loc::Reg(_) = dst {
            b.instr(format!("movzx {}, {low8}", operand(dst, crate::ast::ValType::I32)));
        } else {
            b.instr(format!("movzx eax, {low8}"));
            b.instr(format!("mov {}, eax", operand(dst, crate::ast::ValType::I32)));
        }
    }

    fn emit_eqz(&self, b: &mut AsmBuf, dst: Loc, src: Loc, ty: crate::ast::ValType) {
        self.emit_cmp_set(b, CmpOp::Eq, dst, src, Loc::Imm(0), ty);
    }

    fn emit_branch_if_bit(&self, b: &mut AsmBuf, src: Loc, bit_index: u32, ty: crate::ast::ValType, label: &str, when_set: bool) {
        b.instr(format!("test {}, {}", operand(src, ty), 1i64 << bit_index));
        b.instr(format!("j{} {label}", if when_set { "nz" } else { "z" }));
    }

    fn emit_branch(&self, b: &mut AsmBuf, label: &str) {
        b.instr(format!("jmp {label}"));
    }

    fn emit_branch_if(&self, b: &mut AsmBuf, cond: Loc, label: &str, ty: crate::ast::ValType, when_nonzero: bool) {
        b.instr(format!("cmp {}, 0", operand(cond, ty)));
        b.instr(format!("j{} {label}", if when_nonzero { "ne" } else { "e" }));
    }

    fn emit_call(&self, b: &mut AsmBuf, name: &str) {
        b.instr(format!("call {name}"));
    }

    fn emit_call_indirect_stub(&self, b: &mut AsmBuf, table_index: Loc, sig_index: u32) {
        b.instr(format!("mov edi, {}", operand(table_index, crate::ast::ValType::I32)));
        b.instr(format!("mov esi, {sig_index}"));
        b.instr("call __wat_call_indirect_check");
    }

    fn emit_call_indirect_branch(&self, b: &mut AsmBuf) {
        b.instr("call rax");
    }

    fn emit_trap(&self, b: &mut AsmBuf) {
        b.instr("ud2");
    }

    fn emit_nop(&self, b: &mut AsmBuf) {
        b.instr("nop");
    }

    fn emit_convert(&self, b: &mut AsmBuf, op: ConvOp, dst: &ValueLoc, src: &ValueLoc) {
        let d = dst.narrow();
        let s = src.narrow();
        match op {
            ConvOp::WrapI64 => b.instr(format!("mov {}, {}", operand(d, crate::ast::ValType::I32), operand(s, crate::ast::ValType::I32))),
            ConvOp::ExtendI32S => b.instr(format!("movsxd {}, {}", operand(d, crate::ast::ValType::I64), operand(s, crate::ast::ValType::I32))),
            ConvOp::ExtendI32U => b.instr(format!("mov {}, {}", operand(d, crate::ast::ValType::I32), operand(s, crate::ast::ValType::I32))),
            ConvOp::I32Extend8S => b.instr(format!("movsx {}, byte {}", operand(d, crate::ast::ValType::I32), operand(s, crate::ast::ValType::I32))),
            ConvOp::I32Extend16S => b.instr(format!("movsx {}, word {}", operand(d, crate::ast::ValType::I32), operand(s, crate::ast::ValType::I32))),
            ConvOp::I64Extend8S => b.instr(format!("movsx {}, byte {}", operand(d, crate::ast::ValType::I64), operand(s, crate::ast::ValType::I64))),
            ConvOp::I64Extend16S => b.instr(format!("movsx {}, word {}", operand(d, crate::ast::ValType::I64), operand(s, crate::ast::ValType::I64))),
            ConvOp::I64Extend32S => b.instr(format!("movsxd {}, {}", operand(d, crate::ast::ValType::I64), operand(s, crate::ast::ValType::I32))),
        }
    }

    fn emit_select(&self, b: &mut AsmBuf, dst: Loc, on_true: Loc, on_false: Loc, cond: Loc, ty: crate::ast::ValType) {
        if dst != on_false {
            self.emit_mov(b, dst, on_false, ty);
        }
        b.instr(format!("cmp {}, 0", operand(cond, crate::ast::ValType::I32)));
        b.instr(format!("cmovne {}, {}", operand(dst, ty), operand(on_true, ty)));
    }

    fn emit_memory_size(&self, b: &mut AsmBuf, dst: Loc) {
        b.instr("call __wat_memory_size");
        self.emit_mov(b, dst, Loc::Reg("rax"), crate::ast::ValType::I32);
    }

    fn emit_memory_grow(&self, b: &mut AsmBuf, dst: Loc, src: Loc) {
        b.instr(format!("mov edi, {}", operand(src, crate::ast::ValType::I32)));
        b.instr("call __wat_memory_grow");
        self.emit_mov(b, dst, Loc::Reg("rax"), crate::ast::ValType::I32);
    }

    fn emit_wide_stub_call(&self, b: &mut AsmBuf, name: &str, dst: &ValueLoc, lhs: &ValueLoc, rhs: Option<&ValueLoc>) {
        // x86-64 never produces wide values (its native word already holds
        // an i64), so this path is unreachable in practice; kept for trait
        // completeness and to document the intended pointer-passing ABI
        // (arg0 = &dst, arg1 = &lhs, arg2 = &rhs) for the narrower targets.
        let addr_of = |loc: &Loc| match loc {
            Loc::Spill(off) => format!("rbp{off:+}"),
            _ => unreachable!("wide values always spill"),
        };
        b.instr(format!("lea rdi, [{}]", addr_of(&dst.words()[0])));
        b.instr(format!("lea rsi, [{}]", addr_of(&lhs.words()[0])));
        if let Some(rhs) = rhs {
            b.instr(format!("lea rdx, [{}]", addr_of(&rhs.words()[0])));
        }
        b.instr(format!("call {name}"));
    }

    fn arg_reg(&self, index: usize) -> Option<&'static str> {
        self.schedule().args.get(index).copied()
    }

    fn emit_stack_arg_push(&self, b: &mut AsmBuf, loc: Loc) {
        b.instr(format!("push {}", operand(loc, crate::ast::ValType::I64)));
    }

    fn emit_stack_arg_cleanup(&self, b: &mut AsmBuf, words: i32) {
        b.instr(format!("add rsp, {}", words * 8));
    }

    fn emit_reserve(&self, b: &mut AsmBuf, name: &str, bytes: i32) {
        b.label(name);
        b.instr(format!("res {bytes}"));
    }
}
