//! arm32 semantic primitives (spec §4.1.2/§4.1.3: AAPCS32-like, fixed
//! 4-byte instructions). i64 is wide here (two 32-bit words), so the
//! carry-chained add/sub and wide-stub paths in `lower::mod` are both
//! exercised for this target, same as x86-32.

use super::{AsmBuf, FrameInfo, Isa};
use crate::ast::{BinOp, CmpOp, ConvOp, MemWidth, ValType};
use crate::stack::{Loc, ValueLoc};
use crate::target::Target;

pub struct Arm32Isa;

fn cc(op: CmpOp) -> &'static str {
    match op {
        CmpOp::Eq => "eq",
        CmpOp::Ne => "ne",
        CmpOp::LtS => "lt",
        CmpOp::LtU => "lo",
        CmpOp::GtS => "gt",
        CmpOp::GtU => "hi",
        CmpOp::LeS => "le",
        CmpOp::LeU => "ls",
        CmpOp::GeS => "ge",
        CmpOp::GeU => "hs",
    }
}

/// Materialize `loc` into a register: arm32 is load/store, every ALU
/// operation needs its operands already in registers.
fn load_to(b: &mut AsmBuf, loc: Loc, scratch: &'static str) -> &'static str {
    match loc {
        Loc::Reg(r) => r,
        Loc::Spill(off) => {
            b.instr(format!("ldr {scratch}, [r11, #{off}]"));
            scratch
        }
        Loc::Imm(v) => {
            b.instr(format!("mov {scratch}, #{v}"));
            scratch
        }
    }
}

fn store_from(b: &mut AsmBuf, dst: Loc, value_reg: &str) {
    match dst {
        Loc::Reg(r) => {
            if r != value_reg {
                b.instr(format!("mov {r}, {value_reg}"));
            }
        }
        Loc::Spill(off) => b.instr(format!("str {value_reg}, [r11, #{off}]")),
        Loc::Imm(_) => unreachable!("cannot store into an immediate"),
    }
}

impl Arm32Isa {
    /// Every callee-saved register except `r11`/`lr`, which the prologue
    /// saves separately while establishing the frame pointer.
    fn save_area_regs(&self) -> Vec<&'static str> {
        self.schedule().callee_saved.iter().filter(|r| **r != "lr" && **r != "r11").cloned().collect()
    }
}

impl Isa for Arm32Isa {
    fn target(&self) -> Target {
        Target::Arm32
    }

    fn emit_prologue(&self, b: &mut AsmBuf, frame: &FrameInfo) {
        b.instr("push {r11, lr}");
        b.instr("mov r11, r13");
        // Virtual-stack registers and the memory-base register (plus the
        // remaining callee-saved scratch registers this target never
        // actually clobbers) are saved right below r11 once the frame
        // pointer is established; locals start further down, past this
        // save area, and never alias it.
        b.instr(format!("push {{{}}}", self.save_area_regs().join(", ")));
        if frame.frame_bytes > 0 {
            b.instr(format!("sub r13, r13, #{}", frame.frame_bytes));
        }
        b.instr("ldr r8, =__wat_memory_base");
        b.instr("ldr r8, [r8]");
        let sched = self.schedule();
        let mut reg_idx = 0usize;
        for offs in frame.local_offsets.iter().take(frame.param_count) {
            for &local_off in offs {
                if let Some(&arg_reg) = sched.args.get(reg_idx) {
                    b.instr(format!("str {arg_reg}, [r11, #{local_off}]"));
                    reg_idx += 1;
                }
            }
        }
    }

    fn emit_epilogue(&self, b: &mut AsmBuf, frame: &FrameInfo) {
        if frame.frame_bytes > 0 {
            b.instr(format!("add r13, r13, #{}", frame.frame_bytes));
        }
        b.instr(format!("pop {{{}}}", self.save_area_regs().iter().rev().cloned().collect::<Vec<_>>().join(", ")));
        b.instr("pop {r11, lr}");
        b.instr("bx lr");
    }

    fn save_area_bytes(&self) -> i32 {
        self.save_area_regs().len() as i32 * self.schedule().word_bytes
    }

    fn emit_mov(&self, b: &mut AsmBuf, dst: Loc, src: Loc, _ty: ValType) {
        if dst == src {
            return;
        }
        let scratch = match dst {
            Loc::Reg(r) => r,
            _ => "r12",
        };
        let v = load_to(b, src, scratch);
        store_from(b, dst, v);
    }

    fn emit_mov_imm(&self, b: &mut AsmBuf, dst: Loc, value: i64, _ty: ValType) {
        match dst {
            Loc::Reg(r) => b.instr(format!("mov {r}, #{value}")),
            Loc::Spill(off) => {
                b.instr(format!("mov r12, #{value}"));
                b.instr(format!("str r12, [r11, #{off}]"));
            }
            Loc::Imm(_) => unreachable!(),
        }
    }

    fn emit_load_mem(&self, b: &mut AsmBuf, dst: Loc, addr_reg: &str, offset: u32, width: MemWidth, signed: bool) {
        let op = match (width, signed) {
            (MemWidth::W8, true) => "ldrsb",
            (MemWidth::W8, false) => "ldrb",
            (MemWidth::W16, true) => "ldrsh",
            (MemWidth::W16, false) => "ldrh",
            _ => "ldr",
        };
        b.instr(format!("{op} r12, [{addr_reg}, #{offset}]"));
        store_from(b, dst, "r12");
    }

    fn emit_store_mem(&self, b: &mut AsmBuf, src: Loc, addr_reg: &str, offset: u32, width: MemWidth) {
        let op = match width {
            MemWidth::W8 => "strb",
            MemWidth::W16 => "strh",
            _ => "str",
        };
        let v = load_to(b, src, "r12");
        b.instr(format!("{op} {v}, [{addr_reg}, #{offset}]"));
    }

    fn emit_load_global(&self, b: &mut AsmBuf, dst: Loc, name: &str, _ty: ValType) {
        b.instr(format!("ldr r12, ={name}"));
        b.instr("ldr r12, [r12]");
        store_from(b, dst, "r12");
    }

    fn emit_store_global(&self, b: &mut AsmBuf, src: Loc, name: &str, _ty: ValType) {
        let v = load_to(b, src, "r12");
        b.instr("ldr r1, =".to_string() + name);
        b.instr(format!("str {v}, [r1]"));
    }

    fn emit_binop_word(&self, b: &mut AsmBuf, op: BinOp, dst: Loc, lhs: Loc, rhs: Loc, carry_in: Option<bool>, _ty: ValType) {
        let l = load_to(b, lhs, "r0");
        let r = load_to(b, rhs, "r1");
        let d = "r12";
        match op {
            BinOp::Add => b.instr(format!("{} {d}, {l}, {r}", if carry_in == Some(true) { "adcs" } else { "adds" })),
            BinOp::Sub => b.instr(format!("{} {d}, {l}, {r}", if carry_in == Some(true) { "sbcs" } else { "subs" })),
            BinOp::Mul => b.instr(format!("mul {d}, {l}, {r}")),
            BinOp::DivS => b.instr(format!("sdiv {d}, {l}, {r}")),
            BinOp::DivU => b.instr(format!("udiv {d}, {l}, {r}")),
            BinOp::RemS => {
                b.instr(format!("sdiv r2, {l}, {r}"));
                b.instr(format!("mls {d}, r2, {r}, {l}"));
            }
            BinOp::RemU => {
                b.instr(format!("udiv r2, {l}, {r}"));
                b.instr(format!("mls {d}, r2, {r}, {l}"));
            }
            BinOp::And => b.instr(format!("and {d}, {l}, {r}")),
            BinOp::Or => b.instr(format!("orr {d}, {l}, {r}")),
            BinOp::Xor => b.instr(format!("eor {d}, {l}, {r}")),
            BinOp::Shl => b.instr(format!("lsl {d}, {l}, {r}")),
            BinOp::ShrS => b.instr(format!("asr {d}, {l}, {r}")),
            BinOp::ShrU => b.instr(format!("lsr {d}, {l}, {r}")),
            BinOp::Rotl => {
                b.instr(format!("rsb r2, {r}, #32"));
                b.instr(format!("ror {d}, {l}, r2"));
            }
            BinOp::Rotr => b.instr(format!("ror {d}, {l}, {r}")),
        }
        store_from(b, dst, d);
    }

    fn emit_or_word(&self, b: &mut AsmBuf, dst: Loc, lhs: Loc, rhs: Loc, ty: ValType) {
        self.emit_binop_word(b, BinOp::Or, dst, lhs, rhs, None, ty);
    }

    fn emit_cmp_set(&self, b: &mut AsmBuf, op: CmpOp, dst: Loc, lhs: Loc, rhs: Loc, _ty: ValType) {
        let l = load_to(b, lhs, "r0");
        let r = load_to(b, rhs, "r1");
        b.instr(format!("cmp {l}, {r}"));
        b.instr("mov r12, #0");
        b.instr(format!("mov{} r12, #1", cc(op)));
        store_from(b, dst, "r12");
    }

    fn emit_eqz(&self, b: &mut AsmBuf, dst: Loc, src: Loc, ty: ValType) {
        self.emit_cmp_set(b, CmpOp::Eq, dst, src, Loc::Imm(0), ty);
    }

    fn emit_branch_if_bit(&self, b: &mut AsmBuf, src: Loc, bit_index: u32, _ty: ValType, label: &str, when_set: bool) {
        let s = load_to(b, src, "r12");
        b.instr(format!("tst {s}, #{}", 1u32 << bit_index));
        b.instr(format!("b{} {label}", if when_set { "ne" } else { "eq" }));
    }

    fn emit_branch(&self, b: &mut AsmBuf, label: &str) {
        b.instr(format!("b {label}"));
    }

    fn emit_branch_if(&self, b: &mut AsmBuf, cond: Loc, label: &str, _ty: ValType, when_nonzero: bool) {
        let c = load_to(b, cond, "r12");
        b.instr(format!("cmp {c}, #0"));
        b.instr(format!("b{} {label}", if when_nonzero { "ne" } else { "eq" }));
    }

    fn emit_call(&self, b: &mut AsmBuf, name: &str) {
        b.instr(format!("bl {name}"));
    }

    fn emit_call_indirect_stub(&self, b: &mut AsmBuf, table_index: Loc, sig_index: u32) {
        let idx = load_to(b, table_index, "r0");
        if idx != "r0" {
            b.instr(format!("mov r0, {idx}"));
        }
        b.instr(format!("mov r1, #{sig_index}"));
        b.instr("bl __wat_call_indirect_check");
        // The check returns the verified address in r0, the callee's own
        // first argument register; move it to r12 (never an argument or
        // callee-saved register) before argument marshaling can clobber it.
        b.instr("mov r12, r0");
    }

    fn emit_call_indirect_branch(&self, b: &mut AsmBuf) {
        b.instr("blx r12");
    }

    fn emit_trap(&self, b: &mut AsmBuf) {
        b.instr(".word 0xe7f000f0");
    }

    fn emit_nop(&self, b: &mut AsmBuf) {
        b.instr("nop");
    }

    fn emit_convert(&self, b: &mut AsmBuf, op: ConvOp, dst: &ValueLoc, src: &ValueLoc) {
        match op {
            ConvOp::WrapI64 => self.emit_mov(b, dst.narrow(), src.words()[0], ValType::I32),
            ConvOp::ExtendI32S => {
                let v = load_to(b, src.narrow(), "r0");
                b.instr(format!("asr r1, {v}, #31"));
                store_from(b, dst.words()[0], v);
                store_from(b, dst.words()[1], "r1");
            }
            ConvOp::ExtendI32U => {
                self.emit_mov(b, dst.words()[0], src.narrow(), ValType::I32);
                self.emit_mov_imm(b, dst.words()[1], 0, ValType::I32);
            }
            ConvOp::I32Extend8S => {
                let v = load_to(b, src.narrow(), "r0");
                b.instr(format!("sxtb r12, {v}"));
                store_from(b, dst.narrow(), "r12");
            }
            ConvOp::I32Extend16S => {
                let v = load_to(b, src.narrow(), "r0");
                b.instr(format!("sxth r12, {v}"));
                store_from(b, dst.narrow(), "r12");
            }
            ConvOp::I64Extend8S => {
                let v = load_to(b, src.words()[0], "r0");
                b.instr(format!("sxtb r0, {v}"));
                b.instr("asr r1, r0, #31");
                store_from(b, dst.words()[0], "r0");
                store_from(b, dst.words()[1], "r1");
            }
            ConvOp::I64Extend16S => {
                let v = load_to(b, src.words()[0], "r0");
                b.instr(format!("sxth r0, {v}"));
                b.instr("asr r1, r0, #31");
                store_from(b, dst.words()[0], "r0");
                store_from(b, dst.words()[1], "r1");
            }
            ConvOp::I64Extend32S => {
                let v = load_to(b, src.words()[0], "r0");
                b.instr(format!("asr r1, {v}, #31"));
                store_from(b, dst.words()[0], v);
                store_from(b, dst.words()[1], "r1");
            }
        }
    }

    fn emit_select(&self, b: &mut AsmBuf, dst: Loc, on_true: Loc, on_false: Loc, cond: Loc, _ty: ValType) {
        let t = load_to(b, on_true, "r0");
        let f = load_to(b, on_false, "r1");
        let c = load_to(b, cond, "r2");
        b.instr(format!("cmp {c}, #0"));
        b.instr(format!("mov r12, {f}"));
        b.instr(format!("movne r12, {t}"));
        store_from(b, dst, "r12");
    }

    fn emit_memory_size(&self, b: &mut AsmBuf, dst: Loc) {
        b.instr("bl __wat_memory_size");
        store_from(b, dst, "r0");
    }

    fn emit_memory_grow(&self, b: &mut AsmBuf, dst: Loc, src: Loc) {
        let v = load_to(b, src, "r0");
        if v != "r0" {
            b.instr(format!("mov r0, {v}"));
        }
        b.instr("bl __wat_memory_grow");
        store_from(b, dst, "r0");
    }

    fn emit_wide_stub_call(&self, b: &mut AsmBuf, name: &str, dst: &ValueLoc, lhs: &ValueLoc, rhs: Option<&ValueLoc>) {
        let addr_of = |loc: &Loc| match loc {
            Loc::Spill(off) => *off,
            _ => unreachable!("wide values always spill"),
        };
        b.instr(format!("add r0, r11, #{}", addr_of(&dst.words()[0])));
        b.instr(format!("add r1, r11, #{}", addr_of(&lhs.words()[0])));
        if let Some(rhs) = rhs {
            b.instr(format!("add r2, r11, #{}", addr_of(&rhs.words()[0])));
        }
        b.instr(format!("bl {name}"));
    }

    fn arg_reg(&self, index: usize) -> Option<&'static str> {
        self.schedule().args.get(index).copied()
    }

    fn emit_stack_arg_push(&self, b: &mut AsmBuf, loc: Loc) {
        let v = load_to(b, loc, "r12");
        b.instr(format!("push {{{v}}}"));
    }

    fn emit_stack_arg_cleanup(&self, b: &mut AsmBuf, words: i32) {
        b.instr(format!("add r13, r13, #{}", words * 4));
    }

    fn emit_reserve(&self, b: &mut AsmBuf, name: &str, bytes: i32) {
        b.label(name);
        b.instr(format!("res {bytes}"));
    }
}
