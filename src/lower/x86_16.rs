//! x86-16 semantic primitives (spec §4.1.2/§4.1.3: 16-bit real-mode-style
//! registers, stack-only argument passing, one scratch register). Both
//! i32 (two words) and i64 (four words) are wide here — the narrowest
//! target in the set, and the one that most exercises the wide-value
//! machinery in `lower::mod`.

use super::{AsmBuf, FrameInfo, Isa};
use crate::ast::{BinOp, CmpOp, ConvOp, MemWidth, ValType};
use crate::stack::{Loc, ValueLoc};
use crate::target::Target;

pub struct X86_16Isa;

fn operand(loc: Loc) -> String {
    match loc {
        Loc::Reg(r) => r.to_string(),
        Loc::Spill(off) => format!("word [bp{off:+}]"),
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

impl Isa for X86_16Isa {
    fn target(&self) -> Target {
        Target::X86_16
    }

    fn emit_prologue(&self, b: &mut AsmBuf, frame: &FrameInfo) {
        let sched = self.schedule();
        b.instr("push bp");
        b.instr("mov bp, sp");
        // Virtual-stack registers and the memory-base register are saved
        // right below bp once the frame pointer is established; locals
        // start further down, past this save area, and never alias it.
        for reg in sched.stack_regs.iter().chain(std::iter::once(&sched.mem_base)) {
            b.instr(format!("push {reg}"));
        }
        if frame.frame_bytes > 0 {
            b.instr(format!("sub sp, {}", frame.frame_bytes));
        }
        b.instr(format!("mov {}, [__wat_memory_base]", sched.mem_base));
        let mut incoming_off = 4i32; // saved bp + return address, near call
        for offs in frame.local_offsets.iter().take(frame.param_count) {
            for &local_off in offs {
                b.instr(format!("mov ax, [bp+{incoming_off}]"));
                b.instr(format!("mov [bp{local_off:+}], ax"));
                incoming_off += 2;
            }
        }
    }

    fn emit_epilogue(&self, b: &mut AsmBuf, frame: &FrameInfo) {
        let sched = self.schedule();
        if frame.frame_bytes > 0 {
            b.instr(format!("add sp, {}", frame.frame_bytes));
        }
        for reg in std::iter::once(&sched.mem_base).chain(sched.stack_regs.iter().rev()) {
            b.instr(format!("pop {reg}"));
        }
        b.instr("pop bp");
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
        match width {
            MemWidth::W8 => {
                b.instr(format!("mov al, byte [{addr_reg}+{offset}]"));
                b.instr(if signed { "cbw".to_string() } else { "xor ah, ah".to_string() });
                b.instr(format!("mov {}, ax", operand(dst)));
            }
            _ => b.instr(format!("mov {}, word [{addr_reg}+{offset}]", operand(dst))),
        }
    }

    fn emit_store_mem(&self, b: &mut AsmBuf, src: Loc, addr_reg: &str, offset: u32, width: MemWidth) {
        match width {
            // si/di (stack registers here) have no 8-bit sub-register on
            // this target at all; stage through ax, which always has one.
            MemWidth::W8 => {
                b.instr(format!("mov ax, {}", operand(src)));
                b.instr(format!("mov byte [{addr_reg}+{offset}], al"));
            }
            _ => b.instr(format!("mov word [{addr_reg}+{offset}], {}", operand(src))),
        }
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
                b.instr(format!("mov ax, {}", operand(dst)));
                b.instr(if signed { "cwd".to_string() } else { "xor dx, dx".to_string() });
                b.instr(format!("{} {}", mnemonic(op), operand(rhs)));
                let result_reg = if matches!(op, BinOp::DivS | BinOp::DivU) { "ax" } else { "dx" };
                b.instr(format!("mov {}, {result_reg}", operand(dst)));
            }
            BinOp::Shl | BinOp::ShrS | BinOp::ShrU | BinOp::Rotl | BinOp::Rotr => {
                b.instr(format!("mov cx, {}", operand(rhs)));
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
        b.instr("xor ah, ah");
        if dst != Loc::Reg("ax") {
            b.instr(format!("mov {}, ax", operand(dst)));
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
        b.instr("add sp, 4");
    }

    fn emit_call_indirect_branch(&self, b: &mut AsmBuf) {
        b.instr("call ax");
    }

    fn emit_trap(&self, b: &mut AsmBuf) {
        b.instr("int3");
    }

    fn emit_nop(&self, b: &mut AsmBuf) {
        b.instr("nop");
    }

    fn emit_convert(&self, b: &mut AsmBuf, op: ConvOp, dst: &ValueLoc, src: &ValueLoc) {
        // Every conversion here boils down to "copy the words that exist,
        // fill the rest with a sign- or zero-extension of the top word."
        let dw = dst.words();
        let sw = src.words();
        let signed = matches!(op, ConvOp::ExtendI32S | ConvOp::I32Extend8S | ConvOp::I32Extend16S | ConvOp::I64Extend8S | ConvOp::I64Extend16S | ConvOp::I64Extend32S);
        match op {
            ConvOp::I32Extend8S => {
                // cbw reads al and rewrites ah from its sign bit, so ah's
                // incoming value here never matters.
                b.instr(format!("mov ax, {}", operand(sw[0])));
                b.instr("cbw");
                self.emit_mov(b, dw[0], Loc::Reg("ax"), ValType::I32);
                sign_extend_rest(self, b, &dw[1..], "ax");
            }
            ConvOp::I32Extend16S | ConvOp::WrapI64 | ConvOp::ExtendI32S | ConvOp::ExtendI32U => {
                for (i, &d) in dw.iter().enumerate() {
                    if i < sw.len() {
                        self.emit_mov(b, d, sw[i], ValType::I32);
                    } else if signed {
                        sign_extend_rest(self, b, &dw[i..], word_name(sw[sw.len() - 1]));
                        break;
                    } else {
                        self.emit_mov_imm(b, d, 0, ValType::I32);
                    }
                }
            }
            ConvOp::I64Extend8S => {
                b.instr(format!("mov ax, {}", operand(sw[0])));
                b.instr("cbw");
                self.emit_mov(b, dw[0], Loc::Reg("ax"), ValType::I32);
                sign_extend_rest(self, b, &dw[1..], "ax");
            }
            ConvOp::I64Extend16S | ConvOp::I64Extend32S => {
                self.emit_mov(b, dw[0], sw[0], ValType::I32);
                sign_extend_rest(self, b, &dw[1..], word_name(sw[0]));
            }
        }
    }

    fn emit_select(&self, b: &mut AsmBuf, dst: Loc, on_true: Loc, on_false: Loc, cond: Loc, _ty: ValType) {
        // No `cmov` on this target's instruction set: branch around the
        // overwrite instead.
        use std::sync::atomic::{AtomicU32, Ordering};
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let keep = format!("select_keep_{}", COUNTER.fetch_add(1, Ordering::Relaxed));
        if dst != on_false {
            b.instr(format!("mov {}, {}", operand(dst), operand(on_false)));
        }
        b.instr(format!("cmp {}, 0", operand(cond)));
        b.instr(format!("je {keep}"));
        b.instr(format!("mov {}, {}", operand(dst), operand(on_true)));
        b.label(&keep);
    }

    fn emit_memory_size(&self, b: &mut AsmBuf, dst: Loc) {
        b.instr("call __wat_memory_size");
        self.emit_mov(b, dst, Loc::Reg("ax"), ValType::I32);
    }

    fn emit_memory_grow(&self, b: &mut AsmBuf, dst: Loc, src: Loc) {
        b.instr(format!("push {}", operand(src)));
        b.instr("call __wat_memory_grow");
        b.instr("add sp, 2");
        self.emit_mov(b, dst, Loc::Reg("ax"), ValType::I32);
    }

    fn emit_wide_stub_call(&self, b: &mut AsmBuf, name: &str, dst: &ValueLoc, lhs: &ValueLoc, rhs: Option<&ValueLoc>) {
        let addr_of = |loc: &Loc| match loc {
            Loc::Spill(off) => format!("bp{off:+}"),
            _ => unreachable!("wide values always spill"),
        };
        if let Some(rhs) = rhs {
            b.instr(format!("lea ax, [{}]", addr_of(&rhs.words()[0])));
            b.instr("push ax");
        }
        b.instr(format!("lea ax, [{}]", addr_of(&lhs.words()[0])));
        b.instr("push ax");
        b.instr(format!("lea ax, [{}]", addr_of(&dst.words()[0])));
        b.instr("push ax");
        b.instr(format!("call {name}"));
        b.instr(format!("add sp, {}", if rhs.is_some() { 6 } else { 4 }));
    }

    fn arg_reg(&self, _index: usize) -> Option<&'static str> {
        None
    }

    fn emit_stack_arg_push(&self, b: &mut AsmBuf, loc: Loc) {
        b.instr(format!("push {}", operand(loc)));
    }

    fn emit_stack_arg_cleanup(&self, b: &mut AsmBuf, words: i32) {
        b.instr(format!("add sp, {}", words * 2));
    }

    fn emit_reserve(&self, b: &mut AsmBuf, name: &str, bytes: i32) {
        b.label(name);
        b.instr(format!("res {bytes}"));
    }
}

fn word_name(loc: Loc) -> &'static str {
    match loc {
        Loc::Reg(r) => r,
        _ => "ax",
    }
}

fn sign_extend_rest(isa: &X86_16Isa, b: &mut AsmBuf, rest: &[Loc], sign_source: &str) {
    if rest.is_empty() {
        return;
    }
    b.instr(format!("mov ax, {sign_source}"));
    b.instr("cwd");
    for &d in rest {
        isa.emit_mov(b, d, Loc::Reg("dx"), ValType::I32);
    }
}
