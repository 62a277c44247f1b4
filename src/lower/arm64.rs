//! arm64 semantic primitives (spec §4.1.2/§4.1.3: AAPCS64-like, fixed
//! 4-byte instructions). Like x86-64, every value fits one native
//! register, so the wide-value paths never trigger here.

use super::{AsmBuf, FrameInfo, Isa};
use crate::ast::{BinOp, CmpOp, ConvOp, MemWidth, ValType};
use crate::stack::{Loc, ValueLoc};
use crate::target::Target;

pub struct Arm64Isa;

/// Registers in the schedule are named by their 32-bit (`w`) form; an I64
/// operation addresses the same physical register through its `x` alias.
fn sized(reg: &str, ty: ValType) -> String {
    if ty == ValType::I64 && reg.starts_with('w') {
        format!("x{}", &reg[1..])
    } else {
        reg.to_string()
    }
}

fn operand(loc: Loc, ty: ValType) -> String {
    match loc {
        Loc::Reg(r) => sized(r, ty),
        Loc::Spill(off) => format!("[x29, #{off}]"),
        Loc::Imm(v) => format!("#{v}"),
    }
}

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

/// Materialize `loc` into a register (loading it from its spill slot if
/// necessary): arm64 is load/store, every ALU operation needs registers.
fn load_to(b: &mut AsmBuf, loc: Loc, scratch: &str, ty: ValType) -> String {
    match loc {
        Loc::Reg(r) => sized(r, ty),
        Loc::Spill(off) => {
            b.instr(format!("ldr {scratch}, [x29, #{off}]"));
            scratch.to_string()
        }
        Loc::Imm(v) => {
            b.instr(format!("mov {scratch}, #{v}"));
            scratch.to_string()
        }
    }
}

fn store_from(b: &mut AsmBuf, dst: Loc, value_reg: &str, ty: ValType) {
    match dst {
        Loc::Reg(r) => {
            let dr = sized(r, ty);
            if dr != value_reg {
                b.instr(format!("mov {dr}, {value_reg}"));
            }
        }
        Loc::Spill(off) => b.instr(format!("str {value_reg}, [x29, #{off}]")),
        Loc::Imm(_) => unreachable!("cannot store into an immediate"),
    }
}

impl Isa for Arm64Isa {
    fn target(&self) -> Target {
        Target::Arm64
    }

    fn emit_prologue(&self, b: &mut AsmBuf, frame: &FrameInfo) {
        // Save area, above the locals/spills region x29 addresses with
        // negative offsets: [x29, #0) holds x29/x30, [x29, #16) holds the
        // virtual-stack registers and the memory-base register this
        // function's own codegen writes through.
        let save_bytes = 48; // x19-x23 (40 bytes) rounded up to 16
        let frame_total = frame.frame_bytes + 16 + save_bytes;
        b.instr(format!("sub sp, sp, #{frame_total}"));
        b.instr(format!("stp x29, x30, [sp, #{}]", frame.frame_bytes));
        b.instr(format!("add x29, sp, #{}", frame.frame_bytes));
        b.instr("stp x19, x20, [x29, #16]");
        b.instr("stp x21, x22, [x29, #32]");
        b.instr("str x23, [x29, #48]");
        b.instr("adrp x9, __wat_memory_base");
        b.instr("ldr x23, [x9, :lo12:__wat_memory_base]");
        let sched = self.schedule();
        for (i, offs) in frame.local_offsets.iter().take(frame.param_count).enumerate() {
            if let Some(&arg_reg) = sched.args.get(i) {
                b.instr(format!("str {arg_reg}, [x29, #{}]", offs[0]));
            }
        }
    }

    fn emit_epilogue(&self, b: &mut AsmBuf, frame: &FrameInfo) {
        let _ = frame.has_result;
        let save_bytes = 48;
        let frame_total = frame.frame_bytes + 16 + save_bytes;
        b.instr("ldp x19, x20, [x29, #16]");
        b.instr("ldp x21, x22, [x29, #32]");
        b.instr("ldr x23, [x29, #48]");
        b.instr(format!("ldp x29, x30, [sp, #{}]", frame.frame_bytes));
        b.instr(format!("add sp, sp, #{frame_total}"));
        b.instr("ret");
    }

    fn emit_mov(&self, b: &mut AsmBuf, dst: Loc, src: Loc, ty: ValType) {
        if dst == src {
            return;
        }
        // A register destination can be the load's own target directly;
        // anything else stages through a scratch register first.
        let scratch = match dst {
            Loc::Reg(r) => sized(r, ty),
            _ => "w9".to_string(),
        };
        let val = load_to(b, src, &scratch, ty);
        store_from(b, dst, &val, ty);
    }

    fn emit_mov_imm(&self, b: &mut AsmBuf, dst: Loc, value: i64, ty: ValType) {
        match dst {
            Loc::Reg(r) => b.instr(format!("mov {}, #{value}", sized(r, ty))),
            Loc::Spill(off) => {
                b.instr(format!("mov w9, #{value}"));
                b.instr(format!("str {}, [x29, #{off}]", sized("w9", ty)));
            }
            Loc::Imm(_) => unreachable!(),
        }
    }

    fn emit_load_mem(&self, b: &mut AsmBuf, dst: Loc, addr_reg: &str, offset: u32, width: MemWidth, signed: bool) {
        let (op, reg) = match width {
            MemWidth::W8 => (if signed { "ldrsb" } else { "ldrb" }, "w9"),
            MemWidth::W16 => (if signed { "ldrsh" } else { "ldrh" }, "w9"),
            MemWidth::W32 => ("ldr", "w9"),
            MemWidth::W64 => ("ldr", "x9"),
        };
        b.instr(format!("{op} {reg}, [{addr_reg}, #{offset}]"));
        let ty = if width == MemWidth::W64 { ValType::I64 } else { ValType::I32 };
        store_from(b, dst, reg, ty);
    }

    fn emit_store_mem(&self, b: &mut AsmBuf, src: Loc, addr_reg: &str, offset: u32, width: MemWidth) {
        let (op, reg) = match width {
            MemWidth::W8 => ("strb", "w9"),
            MemWidth::W16 => ("strh", "w9"),
            MemWidth::W32 => ("str", "w9"),
            MemWidth::W64 => ("str", "x9"),
        };
        let ty = if width == MemWidth::W64 { ValType::I64 } else { ValType::I32 };
        let val = load_to(b, src, reg, ty);
        b.instr(format!("{op} {val}, [{addr_reg}, #{offset}]"));
    }

    fn emit_load_global(&self, b: &mut AsmBuf, dst: Loc, name: &str, ty: ValType) {
        b.instr(format!("adrp x9, {name}"));
        b.instr(format!("ldr {}, [x9, :lo12:{name}]", sized("w9", ty)));
        store_from(b, dst, &sized("w9", ty), ty);
    }

    fn emit_store_global(&self, b: &mut AsmBuf, src: Loc, name: &str, ty: ValType) {
        let val = load_to(b, src, "w9", ty);
        b.instr(format!("adrp x10, {name}"));
        b.instr(format!("str {val}, [x10, :lo12:{name}]"));
    }

    fn emit_binop_word(&self, b: &mut AsmBuf, op: BinOp, dst: Loc, lhs: Loc, rhs: Loc, carry_in: Option<bool>, ty: ValType) {
        let l = load_to(b, lhs, "w9", ty);
        let r = load_to(b, rhs, "w10", ty);
        let d = "w11";
        match op {
            BinOp::Add => {
                b.instr(format!("{} {d}, {l}, {r}", if carry_in == Some(true) { "adcs" } else { "adds" }));
            }
            BinOp::Sub => {
                b.instr(format!("{} {d}, {l}, {r}", if carry_in == Some(true) { "sbcs" } else { "subs" }));
            }
            BinOp::Mul => b.instr(format!("mul {d}, {l}, {r}")),
            BinOp::DivS => b.instr(format!("sdiv {d}, {l}, {r}")),
            BinOp::DivU => b.instr(format!("udiv {d}, {l}, {r}")),
            BinOp::RemS => {
                b.instr(format!("sdiv w12, {l}, {r}"));
                b.instr(format!("msub {d}, w12, {r}, {l}"));
            }
            BinOp::RemU => {
                b.instr(format!("udiv w12, {l}, {r}"));
                b.instr(format!("msub {d}, w12, {r}, {l}"));
            }
            BinOp::And => b.instr(format!("and {d}, {l}, {r}")),
            BinOp::Or => b.instr(format!("orr {d}, {l}, {r}")),
            BinOp::Xor => b.instr(format!("eor {d}, {l}, {r}")),
            BinOp::Shl => b.instr(format!("lsl {d}, {l}, {r}")),
            BinOp::ShrS => b.instr(format!("asr {d}, {l}, {r}")),
            BinOp::ShrU => b.instr(format!("lsr {d}, {l}, {r}")),
            BinOp::Rotl => {
                b.instr(format!("neg w12, {r}"));
                b.instr(format!("ror {d}, {l}, w12"));
            }
            BinOp::Rotr => b.instr(format!("ror {d}, {l}, {r}")),
        }
        store_from(b, dst, d, ty);
    }

    fn emit_or_word(&self, b: &mut AsmBuf, dst: Loc, lhs: Loc, rhs: Loc, ty: ValType) {
        self.emit_binop_word(b, BinOp::Or, dst, lhs, rhs, None, ty);
    }

    fn emit_cmp_set(&self, b: &mut AsmBuf, op: CmpOp, dst: Loc, lhs: Loc, rhs: Loc, ty: ValType) {
        let l = load_to(b, lhs, "w9", ty);
        let r = load_to(b, rhs, "w10", ty);
        b.instr(format!("cmp {l}, {r}"));
        b.instr(format!("cset w11, {}", cc(op)));
        store_from(b, dst, "w11", ValType::I32);
    }

    fn emit_eqz(&self, b: &mut AsmBuf, dst: Loc, src: Loc, ty: ValType) {
        self.emit_cmp_set(b, CmpOp::Eq, dst, src, Loc::Imm(0), ty);
    }

    fn emit_branch_if_bit(&self, b: &mut AsmBuf, src: Loc, bit_index: u32, ty: ValType, label: &str, when_set: bool) {
        let s = load_to(b, src, "w9", ty);
        if when_set {
            b.instr(format!("tbnz {s}, #{bit_index}, {label}"));
        } else {
            b.instr(format!("tbz {s}, #{bit_index}, {label}"));
        }
    }

    fn emit_branch(&self, b: &mut AsmBuf, label: &str) {
        b.instr(format!("b {label}"));
    }

    fn emit_branch_if(&self, b: &mut AsmBuf, cond: Loc, label: &str, ty: ValType, when_nonzero: bool) {
        let c = load_to(b, cond, "w9", ty);
        if when_nonzero {
            b.instr(format!("cbnz {c}, {label}"));
        } else {
            b.instr(format!("cbz {c}, {label}"));
        }
    }

    fn emit_call(&self, b: &mut AsmBuf, name: &str) {
        b.instr(format!("bl {name}"));
    }

    fn emit_call_indirect_stub(&self, b: &mut AsmBuf, table_index: Loc, sig_index: u32) {
        let idx = load_to(b, table_index, "w0", ValType::I32);
        if idx != "w0" {
            b.instr(format!("mov w0, {idx}"));
        }
        b.instr(format!("mov w1, #{sig_index}"));
        b.instr("bl __wat_call_indirect_check");
        // The check returns the verified address in x0, the callee's own
        // first argument register; move it to x8 (outside the x0-x7
        // argument range) before argument marshaling can clobber it.
        b.instr("mov x8, x0");
    }

    fn emit_call_indirect_branch(&self, b: &mut AsmBuf) {
        b.instr("blr x8");
    }

    fn emit_trap(&self, b: &mut AsmBuf) {
        b.instr("brk #1");
    }

    fn emit_nop(&self, b: &mut AsmBuf) {
        b.instr("nop");
    }

    fn emit_convert(&self, b: &mut AsmBuf, op: ConvOp, dst: &ValueLoc, src: &ValueLoc) {
        let d = dst.narrow();
        let s = src.narrow();
        match op {
            ConvOp::WrapI64 => {
                let v = load_to(b, s, "w9", ValType::I32);
                store_from(b, d, &v, ValType::I32);
            }
            ConvOp::ExtendI32S => {
                let v = load_to(b, s, "w9", ValType::I32);
                b.instr(format!("sxtw x11, {v}"));
                store_from(b, d, "x11", ValType::I64);
            }
            ConvOp::ExtendI32U => {
                let v = load_to(b, s, "w9", ValType::I32);
                b.instr(format!("uxtw x11, {v}"));
                store_from(b, d, "x11", ValType::I64);
            }
            ConvOp::I32Extend8S => {
                let v = load_to(b, s, "w9", ValType::I32);
                b.instr(format!("sxtb w11, {v}"));
                store_from(b, d, "w11", ValType::I32);
            }
            ConvOp::I32Extend16S => {
                let v = load_to(b, s, "w9", ValType::I32);
                b.instr(format!("sxth w11, {v}"));
                store_from(b, d, "w11", ValType::I32);
            }
            ConvOp::I64Extend8S => {
                let v = load_to(b, s, "x9", ValType::I64);
                b.instr(format!("sxtb x11, {v}"));
                store_from(b, d, "x11", ValType::I64);
            }
            ConvOp::I64Extend16S => {
                let v = load_to(b, s, "x9", ValType::I64);
                b.instr(format!("sxth x11, {v}"));
                store_from(b, d, "x11", ValType::I64);
            }
            ConvOp::I64Extend32S => {
                let v = load_to(b, s, "x9", ValType::I64);
                b.instr(format!("sxtw x11, {v}"));
                store_from(b, d, "x11", ValType::I64);
            }
        }
    }

    fn emit_select(&self, b: &mut AsmBuf, dst: Loc, on_true: Loc, on_false: Loc, cond: Loc, ty: ValType) {
        let t = load_to(b, on_true, "w9", ty);
        let f = load_to(b, on_false, "w10", ty);
        let c = load_to(b, cond, "w12", ValType::I32);
        b.instr(format!("cmp {c}, #0"));
        b.instr(format!("csel w11, {t}, {f}, ne"));
        store_from(b, dst, "w11", ty);
    }

    fn emit_memory_size(&self, b: &mut AsmBuf, dst: Loc) {
        b.instr("bl __wat_memory_size");
        store_from(b, dst, "w0", ValType::I32);
    }

    fn emit_memory_grow(&self, b: &mut AsmBuf, dst: Loc, src: Loc) {
        let v = load_to(b, src, "w0", ValType::I32);
        if v != "w0" {
            b.instr(format!("mov w0, {v}"));
        }
        b.instr("bl __wat_memory_grow");
        store_from(b, dst, "w0", ValType::I32);
    }

    fn emit_wide_stub_call(&self, b: &mut AsmBuf, name: &str, dst: &ValueLoc, lhs: &ValueLoc, rhs: Option<&ValueLoc>) {
        // arm64 never produces wide values; kept for trait completeness.
        let addr_of = |loc: &Loc| match loc {
            Loc::Spill(off) => *off,
            _ => unreachable!("wide values always spill"),
        };
        b.instr(format!("add x0, x29, #{}", addr_of(&dst.words()[0])));
        b.instr(format!("add x1, x29, #{}", addr_of(&lhs.words()[0])));
        if let Some(rhs) = rhs {
            b.instr(format!("add x2, x29, #{}", addr_of(&rhs.words()[0])));
        }
        b.instr(format!("bl {name}"));
    }

    fn arg_reg(&self, index: usize) -> Option<&'static str> {
        self.schedule().args.get(index).copied()
    }

    fn emit_stack_arg_push(&self, b: &mut AsmBuf, loc: Loc) {
        let v = load_to(b, loc, "w9", ValType::I32);
        b.instr(format!("str {v}, [sp, #-16]!"));
    }

    fn emit_stack_arg_cleanup(&self, b: &mut AsmBuf, words: i32) {
        b.instr(format!("add sp, sp, #{}", words * 16));
    }

    fn emit_reserve(&self, b: &mut AsmBuf, name: &str, bytes: i32) {
        b.label(name);
        b.instr(format!("res {bytes}"));
    }
}
