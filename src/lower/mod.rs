//! The WAT-to-assembly lowerer (spec §4.1).
//!
//! This module holds everything architecture-*independent*: the opcode
//! walker, the block-context stack, prologue/epilogue frame layout, and the
//! assembly-text emitter. Each of the five architectures under
//! `lower::{x86_64, x86_32, x86_16, arm64, arm32}` supplies only the
//! "semantic primitives" the walker calls into (the [`Isa`] trait) — the
//! compact abstraction the spec's design notes explicitly permit (§9), so
//! five lowerers do not mean five copies of the control-flow and
//! stack-tracking logic.

mod arm32;
mod arm64;
mod x86_16;
mod x86_32;
mod x86_64;

use crate::ast::{BinOp, BlockType, CmpOp, ConvOp, Function, Instr, MemWidth, Module, UnOp, ValType};
use crate::common::{Id, Map};
use crate::diag::{CodegenError, Result};
use crate::stack::{word_count, Loc, OperandStack, ValueLoc};
use crate::target::{RegisterSchedule, Target};

/// A textual assembly program under construction: one instruction per
/// line, `identifier:` labels, `;` comments (spec §4.3).
#[derive(Default)]
pub struct AsmBuf {
    lines: Vec<String>,
}

impl AsmBuf {
    pub fn new() -> Self {
        AsmBuf::default()
    }

    pub fn label(&mut self, name: &str) {
        self.lines.push(format!("{name}:"));
    }

    pub fn instr(&mut self, text: impl Into<String>) {
        self.lines.push(format!("    {}", text.into()));
    }

    pub fn comment(&mut self, text: &str) {
        self.lines.push(format!("    ; {text}"));
    }

    pub fn into_text(self) -> String {
        let mut s = self.lines.join("\n");
        s.push('\n');
        s
    }
}

/// A function's parameter/result shape, consulted at each `call` site so
/// the right number of operands is popped off the stack (spec §4.1.6).
#[derive(Clone, Debug)]
pub struct Signature {
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
}

pub fn build_signatures(module: &Module) -> Map<Id, Signature> {
    module
        .functions
        .iter()
        .map(|f| {
            (
                f.name,
                Signature {
                    params: f.params.clone(),
                    results: f.results.clone(),
                },
            )
        })
        .collect()
}

/// `call_indirect`'s `sig_index`-addressed counterpart to `build_signatures`:
/// positional, not name-keyed, since an indirect call site only ever knows
/// the callee's shape, never its identity.
pub fn build_sig_types(module: &Module) -> Vec<Signature> {
    module
        .sig_types
        .iter()
        .map(|t| Signature { params: t.params.clone(), results: t.results.clone() })
        .collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BlockKind {
    Block,
    Loop,
    If,
}

struct BlockCtx {
    kind: BlockKind,
    entry_depth: usize,
    result_ty: BlockType,
    /// Where this block's carried result (if `result_ty.arity() == 1`)
    /// waits between the point it is produced and the point it is read
    /// back onto the operand stack. Allocated once per block so every path
    /// that can reach `end` — the fallthrough, an `else`, any `br`/`br_if`
    /// naming this block — funnels through the same memory, the same way
    /// `Return` funnels every exit through one result register (spec
    /// §4.1.4 "Calling convention").
    result_slot: Option<Vec<Loc>>,
    /// `end_N` for block/if, `start_N` for loop.
    continue_label: String,
    end_label: String,
    has_else: bool,
}

impl BlockCtx {
    fn branch_target(&self) -> &str {
        match self.kind {
            BlockKind::Loop => &self.continue_label,
            BlockKind::Block | BlockKind::If => &self.end_label,
        }
    }

    /// How many values an edge *to this block's branch target* carries.
    /// Differs from `result_ty.arity()` for a loop: a backward branch to a
    /// loop's top restarts it with no operands, even though the loop's own
    /// forward/fallthrough path may still produce a result at `end`.
    fn branch_arity(&self) -> usize {
        match self.kind {
            BlockKind::Loop => 0,
            BlockKind::Block | BlockKind::If => self.result_ty.arity(),
        }
    }
}

/// Per-function mutable lowering state threaded through opcode handlers.
/// A plain value, not module-level globals, so lowering one function is a
/// pure transformation of its AST.
pub struct LowerState<'a> {
    target: Target,
    schedule: &'static RegisterSchedule,
    func: &'a Function,
    sigs: &'a Map<Id, Signature>,
    sig_types: &'a [Signature],
    stack: OperandStack,
    blocks: Vec<BlockCtx>,
    label_counter: u32,
    fn_id: u32,
    /// One entry per local (params first), low word offset first.
    local_offsets: Vec<Vec<i32>>,
    exit_label: String,
    globals_used: std::collections::BTreeMap<Id, ValType>,
}

/// What the architecture backend needs to emit a prologue/epilogue.
pub struct FrameInfo {
    pub frame_bytes: i32,
    pub local_offsets: Vec<Vec<i32>>,
    pub param_count: usize,
    pub has_result: bool,
    pub exit_label: String,
}

/// The semantic primitives each architecture specializes (spec §9). The
/// shared walker in this module calls only these; it never special-cases
/// an architecture by name.
pub trait Isa {
    fn target(&self) -> Target;
    fn schedule(&self) -> &'static RegisterSchedule {
        self.target().schedule()
    }

    fn emit_prologue(&self, b: &mut AsmBuf, frame: &FrameInfo);
    fn emit_epilogue(&self, b: &mut AsmBuf, frame: &FrameInfo);

    /// Bytes `emit_prologue` reserves between the frame pointer and the
    /// first local for the virtual-stack/mem-base register save area it
    /// pushes once the frame pointer is established (spec §4.1.4). Locals
    /// start below this area so a save never aliases a spill slot. Zero on
    /// architectures (arm64) whose save area sits on the other side of the
    /// frame pointer from locals.
    fn save_area_bytes(&self) -> i32 {
        0
    }

    /// Copy one machine word. `ty` only matters on targets with more than
    /// one native register width (x86-64/arm64 32- vs 64-bit forms); on a
    /// single-native-width target it is a no-op hint.
    fn emit_mov(&self, b: &mut AsmBuf, dst: Loc, src: Loc, ty: ValType);
    fn emit_mov_imm(&self, b: &mut AsmBuf, dst: Loc, value: i64, ty: ValType);

    fn emit_load_mem(&self, b: &mut AsmBuf, dst: Loc, addr_reg: &str, offset: u32, width: MemWidth, signed: bool);
    fn emit_store_mem(&self, b: &mut AsmBuf, src: Loc, addr_reg: &str, offset: u32, width: MemWidth);
    fn emit_load_global(&self, b: &mut AsmBuf, dst: Loc, name: &str, ty: ValType);
    fn emit_store_global(&self, b: &mut AsmBuf, src: Loc, name: &str, ty: ValType);

    /// A single-word binary op. `carry_in` chains multi-word add/sub:
    /// `None` for a standalone word, `Some(false)` for the low word of a
    /// chain, `Some(true)` for every word above it.
    fn emit_binop_word(&self, b: &mut AsmBuf, op: BinOp, dst: Loc, lhs: Loc, rhs: Loc, carry_in: Option<bool>, ty: ValType);
    fn emit_or_word(&self, b: &mut AsmBuf, dst: Loc, lhs: Loc, rhs: Loc, ty: ValType);

    fn emit_cmp_set(&self, b: &mut AsmBuf, op: CmpOp, dst: Loc, lhs: Loc, rhs: Loc, ty: ValType);
    fn emit_eqz(&self, b: &mut AsmBuf, dst: Loc, src: Loc, ty: ValType);
    /// Branch to `label` when bit `bit_index` of `src` is set (`when_set`)
    /// or clear (`!when_set`), without disturbing `src`. The building
    /// block the portable `clz`/`ctz`/`popcnt` expansion is built from.
    fn emit_branch_if_bit(&self, b: &mut AsmBuf, src: Loc, bit_index: u32, ty: ValType, label: &str, when_set: bool);

    fn emit_branch(&self, b: &mut AsmBuf, label: &str);
    fn emit_branch_if(&self, b: &mut AsmBuf, cond: Loc, label: &str, ty: ValType, when_nonzero: bool);

    fn emit_call(&self, b: &mut AsmBuf, name: &str);
    /// Verify `table_index` against `sig_index` and leave the resolved
    /// function address in this architecture's fixed indirect-call target
    /// register — never an argument register, so it survives the argument
    /// marshaling `emit_call_indirect_branch` is emitted after.
    fn emit_call_indirect_stub(&self, b: &mut AsmBuf, table_index: Loc, sig_index: u32);
    /// Call through the register `emit_call_indirect_stub` left the
    /// resolved address in.
    fn emit_call_indirect_branch(&self, b: &mut AsmBuf);
    fn emit_trap(&self, b: &mut AsmBuf);
    fn emit_nop(&self, b: &mut AsmBuf);
    fn emit_convert(&self, b: &mut AsmBuf, op: ConvOp, dst: &ValueLoc, src: &ValueLoc);
    fn emit_select(&self, b: &mut AsmBuf, dst: Loc, on_true: Loc, on_false: Loc, cond: Loc, ty: ValType);
    fn emit_memory_size(&self, b: &mut AsmBuf, dst: Loc);
    fn emit_memory_grow(&self, b: &mut AsmBuf, dst: Loc, src: Loc);

    /// External-symbol stub for wide (multi-word) arithmetic this crate
    /// does not expand inline — see DESIGN.md. `lhs`/`rhs`/`dst` are
    /// always backed by contiguous spill memory (wide values never live
    /// in registers), so the stub receives pointers, not values.
    fn emit_wide_stub_call(&self, b: &mut AsmBuf, name: &str, dst: &ValueLoc, lhs: &ValueLoc, rhs: Option<&ValueLoc>);

    fn arg_reg(&self, index: usize) -> Option<&'static str>;
    fn emit_stack_arg_push(&self, b: &mut AsmBuf, loc: Loc);
    fn emit_stack_arg_cleanup(&self, b: &mut AsmBuf, words: i32);

    /// Reserve `bytes` of zero-initialized storage at the current
    /// position, labeled `name`. Emitted once per referenced global after
    /// every function: this crate has no data section, so a global's
    /// storage is a pseudo-instruction reservation rather than a symbol in
    /// one (spec §4.1.6, "Globals").
    fn emit_reserve(&self, b: &mut AsmBuf, name: &str, bytes: i32);
}

fn new_isa(target: Target) -> Box<dyn Isa> {
    match target {
        Target::X86_64 => Box::new(x86_64::X86_64Isa),
        Target::X86_32 => Box::new(x86_32::X86_32Isa),
        Target::X86_16 => Box::new(x86_16::X86_16Isa),
        Target::Arm64 => Box::new(arm64::Arm64Isa),
        Target::Arm32 => Box::new(arm32::Arm32Isa),
    }
}

/// Lower every function in `module` for `target`, concatenating their
/// assembly text and appending one reservation per referenced global.
pub fn lower_module(module: &Module, target: Target) -> Result<String> {
    let sigs = build_signatures(module);
    let sig_types = build_sig_types(module);
    let isa = new_isa(target);
    let mut out = String::new();
    let mut globals = std::collections::BTreeMap::new();
    for (id, func) in module.functions.iter().enumerate() {
        let (text, used) = lower_function(func, id as u32, target, &sigs, &sig_types, isa.as_ref())?;
        out.push_str(&text);
        globals.extend(used);
    }
    if !globals.is_empty() {
        let mut b = AsmBuf::new();
        let word_bytes = target.schedule().word_bytes;
        for (g, ty) in globals {
            isa.emit_reserve(&mut b, &g, word_bytes);
            if word_count(target, ty) > 1 {
                isa.emit_reserve(&mut b, &format!("{g}_hi"), word_bytes);
            }
        }
        out.push_str(&b.into_text());
    }
    Ok(out)
}

fn lower_function(
    func: &Function,
    fn_id: u32,
    target: Target,
    sigs: &Map<Id, Signature>,
    sig_types: &[Signature],
    isa: &dyn Isa,
) -> Result<(String, std::collections::BTreeMap<Id, ValType>)> {
    let schedule = target.schedule();

    let mut local_offsets = Vec::with_capacity(func.local_count());
    let mut next_offset = -isa.save_area_bytes();
    for i in 0..func.local_count() as u32 {
        let ty = func.local_type(i).expect("local index in range");
        let words = word_count(target, ty);
        let mut offs = Vec::with_capacity(words);
        for _ in 0..words {
            next_offset -= schedule.word_bytes;
            offs.push(next_offset);
        }
        local_offsets.push(offs);
    }

    let exit_label = format!("function_exit_{fn_id}");
    let mut state = LowerState {
        target,
        schedule,
        func,
        sigs,
        sig_types,
        stack: OperandStack::new(schedule, next_offset),
        blocks: Vec::new(),
        label_counter: 0,
        fn_id,
        local_offsets,
        exit_label: exit_label.clone(),
        globals_used: std::collections::BTreeMap::new(),
    };

    let mut b = AsmBuf::new();
    b.label(&format!("function_{fn_id}"));

    let mut body = AsmBuf::new();
    for (i, instr) in func.body.iter().enumerate() {
        lower_instr(&mut state, isa, &mut body, i, instr)?;
    }
    if !state.blocks.is_empty() {
        return Err(CodegenError::MalformedInput {
            opcode_index: func.body.len(),
            message: "unclosed block at function end".into(),
        });
    }
    move_result_to_exit(&mut state, isa, &mut body);
    body.label(&exit_label);

    let frame_bytes = round_up(-state.stack.max_spill_bytes(), schedule.stack_align);
    let frame = FrameInfo {
        frame_bytes,
        local_offsets: state.local_offsets.clone(),
        param_count: func.params.len(),
        has_result: !func.results.is_empty(),
        exit_label,
    };

    isa.emit_prologue(&mut b, &frame);
    b.lines.extend(body.lines);
    isa.emit_epilogue(&mut b, &frame);

    Ok((b.into_text(), state.globals_used))
}

fn round_up(value: i32, align: i32) -> i32 {
    let v = value.max(0);
    if align <= 1 {
        return v;
    }
    (v + align - 1) / align * align
}

fn move_result_to_exit(state: &mut LowerState, isa: &dyn Isa, b: &mut AsmBuf) {
    if state.func.results.is_empty() {
        return;
    }
    let ty = state.func.results[0];
    let value = state.stack.pop();
    place_result(isa, b, ty, &value);
}

/// Result convention: the schedule's `result` register holds the low
/// word; a wide value's high word goes in the first scratch register
/// (documented in DESIGN.md — wide values never round-trip through a
/// function boundary any other way in this crate).
fn place_result(isa: &dyn Isa, b: &mut AsmBuf, ty: ValType, value: &ValueLoc) {
    let result_reg = isa.schedule().result;
    if value.is_wide() {
        let words = value.words();
        isa.emit_mov(b, Loc::Reg(result_reg), words[0], ValType::I32);
        if let Some(&hi_reg) = isa.schedule().scratch.first() {
            isa.emit_mov(b, Loc::Reg(hi_reg), words[1], ValType::I32);
        }
    } else {
        isa.emit_mov(b, Loc::Reg(result_reg), value.narrow(), ty);
    }
}

fn new_label(state: &mut LowerState, prefix: &str) -> String {
    let n = state.label_counter;
    state.label_counter += 1;
    format!("{prefix}_{}_{n}", state.fn_id)
}

fn local_loc(state: &LowerState, index: u32) -> ValueLoc {
    ValueLoc(state.local_offsets[index as usize].iter().map(|&o| Loc::Spill(o)).collect())
}

fn copy_words(isa: &dyn Isa, b: &mut AsmBuf, dst: &[Loc], src: &[Loc], ty: ValType) {
    debug_assert_eq!(dst.len(), src.len());
    let word_ty = if dst.len() == 1 { ty } else { ValType::I32 };
    for (&d, &s) in dst.iter().zip(src.iter()) {
        if d != s {
            isa.emit_mov(b, d, s, word_ty);
        }
    }
}

fn lower_instr(state: &mut LowerState, isa: &dyn Isa, b: &mut AsmBuf, index: usize, instr: &Instr) -> Result<()> {
    let target = state.target;
    match *instr {
        Instr::I32Const(v) => {
            let dst = state.stack.push(target, ValType::I32);
            isa.emit_mov_imm(b, dst.narrow(), v as i64, ValType::I32);
        }
        Instr::I64Const(v) => {
            let dst = state.stack.push(target, ValType::I64);
            if dst.is_wide() {
                let words = dst.words().to_vec();
                let mut remaining = v as u64;
                let bits_per_word = (state.schedule.word_bytes * 8) as u32;
                for w in words {
                    let chunk = if bits_per_word >= 64 { remaining } else { remaining & ((1u64 << bits_per_word) - 1) };
                    isa.emit_mov_imm(b, w, chunk as i64, ValType::I32);
                    if bits_per_word < 64 {
                        remaining >>= bits_per_word;
                    }
                }
            } else {
                isa.emit_mov_imm(b, dst.narrow(), v, ValType::I64);
            }
        }

        Instr::Binop(ty, op) => lower_binop(state, isa, b, ty, op),
        Instr::Unop(ty, op) => lower_unop(state, isa, b, ty, op)?,
        Instr::Cmp(ty, op) => lower_cmp(state, isa, b, ty, op),
        Instr::Eqz(ty) => lower_eqz(state, isa, b, ty),

        Instr::Load { ty, width, signed, offset } => lower_load(state, isa, b, ty, width, signed, offset),
        Instr::Store { ty, width, offset } => lower_store(state, isa, b, ty, width, offset),
        Instr::MemorySize => {
            let dst = state.stack.push(target, ValType::I32);
            isa.emit_memory_size(b, dst.narrow());
        }
        Instr::MemoryGrow => {
            let src = state.stack.pop();
            let dst = state.stack.push(target, ValType::I32);
            isa.emit_memory_grow(b, dst.narrow(), src.narrow());
        }

        Instr::LocalGet(i) => {
            let ty = local_ty(state, i, index)?;
            let dst = state.stack.push(target, ty);
            let src = local_loc(state, i);
            copy_words(isa, b, dst.words(), &src.0, ty);
        }
        Instr::LocalSet(i) => {
            let ty = local_ty(state, i, index)?;
            let src = state.stack.pop();
            let dst = local_loc(state, i);
            copy_words(isa, b, &dst.0, src.words(), ty);
        }
        Instr::LocalTee(i) => {
            let ty = local_ty(state, i, index)?;
            let src = state.stack.top();
            let dst = local_loc(state, i);
            copy_words(isa, b, &dst.0, src.words(), ty);
        }
        Instr::GlobalGet(name, ty) => {
            state.globals_used.insert(name, ty);
            let dst = state.stack.push(target, ty);
            let words = dst.words();
            let word_ty = if words.len() == 1 { ty } else { ValType::I32 };
            for (i, &word) in words.iter().enumerate() {
                let word_name = global_word_name(&name, i);
                isa.emit_load_global(b, word, &word_name, word_ty);
            }
        }
        Instr::GlobalSet(name, ty) => {
            state.globals_used.insert(name, ty);
            let src = state.stack.pop();
            let words = src.words();
            let word_ty = if words.len() == 1 { ty } else { ValType::I32 };
            for (i, &word) in words.iter().enumerate() {
                let word_name = global_word_name(&name, i);
                isa.emit_store_global(b, word, &word_name, word_ty);
            }
        }

        Instr::Block(bt) => lower_block_start(state, BlockKind::Block, bt),
        Instr::Loop(bt) => lower_loop_start(state, b, bt),
        Instr::If(bt) => lower_if_start(state, isa, b, bt),
        Instr::Else => lower_else(state, isa, b)?,
        Instr::End => lower_end(state, isa, b)?,
        Instr::Br(depth) => lower_br(state, isa, b, depth, None)?,
        Instr::BrIf(depth) => {
            let cond = state.stack.pop();
            lower_br(state, isa, b, depth, Some(cond.narrow()))?;
        }
        Instr::BrTable(ref targets, default) => lower_br_table(state, isa, b, targets, default)?,
        Instr::Return => {
            move_result_to_exit(state, isa, b);
            isa.emit_branch(b, &state.exit_label);
        }
        Instr::Unreachable => isa.emit_trap(b),

        Instr::Call(name) => lower_call(state, isa, b, name)?,
        Instr::CallIndirect { sig_index } => lower_call_indirect(state, isa, b, sig_index, index)?,

        Instr::Convert(op) => lower_convert(state, isa, b, op),

        Instr::Drop => {
            state.stack.pop();
        }
        Instr::Select => lower_select(state, isa, b),
        Instr::Nop => isa.emit_nop(b),
    }
    Ok(())
}

/// A wide global's storage is two separate reservations (`asm::x86`'s
/// memory operand has no `[label+disp]` form to address a second word off
/// one label), so word 1 and up get their own synthesized label.
fn global_word_name(name: &Id, word_index: usize) -> String {
    if word_index == 0 {
        name.to_string()
    } else {
        format!("{name}_hi")
    }
}

fn local_ty(state: &LowerState, i: u32, index: usize) -> Result<ValType> {
    state.func.local_type(i).ok_or_else(|| CodegenError::MalformedInput {
        opcode_index: index,
        message: format!("local index {i} out of range"),
    })
}

fn lower_binop(state: &mut LowerState, isa: &dyn Isa, b: &mut AsmBuf, ty: ValType, op: BinOp) {
    let target = state.target;
    let (lhs, rhs) = state.stack.pop2();
    let dst = state.stack.push(target, ty);

    if !dst.is_wide() {
        isa.emit_binop_word(b, op, dst.narrow(), lhs.narrow(), rhs.narrow(), None, ty);
        return;
    }

    match op {
        BinOp::Add | BinOp::Sub | BinOp::And | BinOp::Or | BinOp::Xor => {
            let dw = dst.words();
            let lw = lhs.words();
            let rw = rhs.words();
            for i in 0..dw.len() {
                let carry = matches!(op, BinOp::Add | BinOp::Sub).then_some(i != 0);
                isa.emit_binop_word(b, op, dw[i], lw[i], rw[i], carry, ValType::I32);
            }
        }
        _ => {
            let name = format!("__wat_wide_{op}_{}", if ty == ValType::I64 { "i64" } else { "i32" });
            isa.emit_wide_stub_call(b, &name, &dst, &lhs, Some(&rhs));
        }
    }
}

/// `clz`/`ctz`/`popcnt` expand to straight-line, fully unrolled code built
/// only from bit tests and branches — no loop counter, no second scratch
/// register, so it works even on the one-scratch-register x86-32/x86-16
/// schedules (spec's own "a loop or lookup" wording, taken literally as a
/// compile-time-unrolled loop rather than a runtime one).
fn lower_unop(state: &mut LowerState, isa: &dyn Isa, b: &mut AsmBuf, ty: ValType, op: UnOp) -> Result<()> {
    let target = state.target;
    let src = state.stack.pop();
    let dst = state.stack.push(target, ty);

    if dst.is_wide() {
        let name = format!("__wat_wide_{op}_i64");
        isa.emit_wide_stub_call(b, &name, &dst, &src, None);
        return Ok(());
    }

    let src = src.narrow();
    let dst = dst.narrow();
    let width_bits = (ty.bytes() * 8) as u32;
    let stop_label = new_label(state, "bitop_stop");

    match op {
        UnOp::Ctz => {
            isa.emit_mov_imm(b, dst, width_bits as i64, ty);
            let found: Vec<String> = (0..width_bits).map(|i| format!("ctz_found_{}_{i}", state.fn_id)).collect();
            for (i, label) in found.iter().enumerate() {
                isa.emit_branch_if_bit(b, src, i as u32, ty, label, true);
            }
            isa.emit_branch(b, &stop_label);
            for (i, label) in found.iter().enumerate() {
                b.label(label);
                isa.emit_mov_imm(b, dst, i as i64, ty);
                isa.emit_branch(b, &stop_label);
            }
        }
        UnOp::Clz => {
            isa.emit_mov_imm(b, dst, width_bits as i64, ty);
            let found: Vec<String> = (0..width_bits).map(|i| format!("clz_found_{}_{i}", state.fn_id)).collect();
            for (i, label) in found.iter().enumerate() {
                let bit_index = width_bits - 1 - i as u32;
                isa.emit_branch_if_bit(b, src, bit_index, ty, label, true);
            }
            isa.emit_branch(b, &stop_label);
            for (i, label) in found.iter().enumerate() {
                b.label(label);
                isa.emit_mov_imm(b, dst, i as i64, ty);
                isa.emit_branch(b, &stop_label);
            }
        }
        UnOp::Popcnt => {
            isa.emit_mov_imm(b, dst, 0, ty);
            for i in 0..width_bits {
                let skip = format!("popcnt_skip_{}_{i}", state.fn_id);
                isa.emit_branch_if_bit(b, src, i, ty, &skip, false);
                isa.emit_binop_word(b, BinOp::Add, dst, dst, Loc::Imm(1), None, ty);
                b.label(&skip);
            }
        }
    }
    b.label(&stop_label);
    Ok(())
}

fn lower_cmp(state: &mut LowerState, isa: &dyn Isa, b: &mut AsmBuf, ty: ValType, op: CmpOp) {
    let target = state.target;
    let (lhs, rhs) = state.stack.pop2();
    let dst = state.stack.push(target, ValType::I32);
    if !lhs.is_wide() {
        isa.emit_cmp_set(b, op, dst.narrow(), lhs.narrow(), rhs.narrow(), ty);
        return;
    }
    match op {
        CmpOp::Eq | CmpOp::Ne => {
            let acc = dst.narrow();
            let lw = lhs.words().to_vec();
            let rw = rhs.words().to_vec();
            isa.emit_binop_word(b, BinOp::Xor, acc, lw[0], rw[0], None, ValType::I32);
            for i in 1..lw.len() {
                let diff = lw[i];
                isa.emit_binop_word(b, BinOp::Xor, diff, lw[i], rw[i], None, ValType::I32);
                isa.emit_or_word(b, acc, acc, diff, ValType::I32);
            }
            isa.emit_cmp_set(b, op, acc, acc, Loc::Imm(0), ValType::I32);
        }
        _ => {
            let name = format!("__wat_wide_cmp_{op}_i64");
            isa.emit_wide_stub_call(b, &name, &dst, &lhs, Some(&rhs));
        }
    }
}

fn lower_eqz(state: &mut LowerState, isa: &dyn Isa, b: &mut AsmBuf, ty: ValType) {
    let target = state.target;
    let src = state.stack.pop();
    let dst = state.stack.push(target, ValType::I32);
    if !src.is_wide() {
        isa.emit_eqz(b, dst.narrow(), src.narrow(), ty);
        return;
    }
    let acc = dst.narrow();
    let words = src.words().to_vec();
    isa.emit_mov(b, acc, words[0], ValType::I32);
    for &w in &words[1..] {
        isa.emit_or_word(b, acc, acc, w, ValType::I32);
    }
    isa.emit_eqz(b, acc, acc, ValType::I32);
}

fn resolve_addr_reg(isa: &dyn Isa, b: &mut AsmBuf, addr: Loc) -> &'static str {
    match addr {
        Loc::Reg(r) => r,
        _ => {
            let r = *isa.schedule().scratch.first().expect("every schedule has a scratch register");
            isa.emit_mov(b, Loc::Reg(r), addr, ValType::I32);
            r
        }
    }
}

fn lower_load(state: &mut LowerState, isa: &dyn Isa, b: &mut AsmBuf, ty: ValType, width: MemWidth, signed: bool, offset: u32) {
    let target = state.target;
    let addr = state.stack.pop();
    let dst = state.stack.push(target, ty);
    let addr_reg = resolve_addr_reg(isa, b, addr.narrow());
    if !dst.is_wide() {
        isa.emit_load_mem(b, dst.narrow(), addr_reg, offset, width, signed);
    } else {
        let words = dst.words();
        let wb = state.schedule.word_bytes as u32;
        isa.emit_load_mem(b, words[0], addr_reg, offset, MemWidth::W32, false);
        isa.emit_load_mem(b, words[1], addr_reg, offset + wb, MemWidth::W32, signed);
    }
}

fn lower_store(state: &mut LowerState, isa: &dyn Isa, b: &mut AsmBuf, _ty: ValType, width: MemWidth, offset: u32) {
    let (addr, value) = state.stack.pop2();
    let addr_reg = resolve_addr_reg(isa, b, addr.narrow());
    if !value.is_wide() {
        isa.emit_store_mem(b, value.narrow(), addr_reg, offset, width);
    } else {
        let words = value.words();
        let wb = state.schedule.word_bytes as u32;
        isa.emit_store_mem(b, words[0], addr_reg, offset, MemWidth::W32);
        isa.emit_store_mem(b, words[1], addr_reg, offset + wb, MemWidth::W32);
    }
}

fn allocate_result_slot(state: &mut LowerState, bt: BlockType) -> Option<Vec<Loc>> {
    match bt {
        BlockType::Value(ty) => Some(state.stack.alloc_scratch_words(word_count(state.target, ty))),
        BlockType::Empty => None,
    }
}

fn lower_block_start(state: &mut LowerState, kind: BlockKind, bt: BlockType) {
    let end_label = new_label(state, "end");
    let result_slot = allocate_result_slot(state, bt);
    state.blocks.push(BlockCtx {
        kind,
        entry_depth: state.stack.depth(),
        result_ty: bt,
        result_slot,
        continue_label: end_label.clone(),
        end_label,
        has_else: false,
    });
}

fn lower_loop_start(state: &mut LowerState, b: &mut AsmBuf, bt: BlockType) {
    let start_label = new_label(state, "start");
    let end_label = new_label(state, "end");
    b.label(&start_label);
    let result_slot = allocate_result_slot(state, bt);
    state.blocks.push(BlockCtx {
        kind: BlockKind::Loop,
        entry_depth: state.stack.depth(),
        result_ty: bt,
        result_slot,
        continue_label: start_label,
        end_label,
        has_else: false,
    });
}

fn lower_if_start(state: &mut LowerState, isa: &dyn Isa, b: &mut AsmBuf, bt: BlockType) {
    let cond = state.stack.pop();
    let else_label = new_label(state, "else");
    isa.emit_branch_if(b, cond.narrow(), &else_label, ValType::I32, false);
    let result_slot = allocate_result_slot(state, bt);
    state.blocks.push(BlockCtx {
        kind: BlockKind::If,
        entry_depth: state.stack.depth(),
        result_ty: bt,
        result_slot,
        continue_label: else_label.clone(),
        end_label: else_label,
        has_else: false,
    });
}

/// Funnel whichever path is currently falling off the end of a block's
/// body into its result slot, mirroring `move_result_to_exit`'s role for
/// whole functions. A no-op for an empty-result block.
fn merge_into_result_slot(state: &mut LowerState, isa: &dyn Isa, b: &mut AsmBuf, ctx: &BlockCtx) {
    if ctx.result_ty.arity() == 0 {
        return;
    }
    let top = state.stack.pop();
    let slot = ctx.result_slot.as_ref().expect("arity-1 block always has a result slot");
    copy_words(isa, b, slot, top.words(), ValType::I32);
}

fn lower_else(state: &mut LowerState, isa: &dyn Isa, b: &mut AsmBuf) -> Result<()> {
    {
        let ctx = state.blocks.last().ok_or_else(|| CodegenError::MalformedInput {
            opcode_index: 0,
            message: "`else` outside an `if`".into(),
        })?;
        if ctx.kind != BlockKind::If {
            return Err(CodegenError::MalformedInput { opcode_index: 0, message: "`else` without matching `if`".into() });
        }
    }
    let (result_arity, result_slot) = {
        let ctx = state.blocks.last().unwrap();
        (ctx.result_ty.arity(), ctx.result_slot.clone())
    };
    if result_arity != 0 {
        let top = state.stack.pop();
        let slot = result_slot.as_ref().expect("arity-1 block always has a result slot");
        copy_words(isa, b, slot, top.words(), ValType::I32);
    }

    let real_end = new_label(state, "end");
    let ctx = state.blocks.last_mut().unwrap();
    isa.emit_branch(b, &real_end);
    b.label(&ctx.continue_label);
    ctx.continue_label = real_end.clone();
    ctx.end_label = real_end;
    ctx.has_else = true;
    let entry_depth = ctx.entry_depth;
    state.stack.truncate_to(entry_depth);
    Ok(())
}

fn lower_end(state: &mut LowerState, isa: &dyn Isa, b: &mut AsmBuf) -> Result<()> {
    let ctx = state.blocks.pop().ok_or_else(|| CodegenError::MalformedInput {
        opcode_index: 0,
        message: "`end` with no open block".into(),
    })?;
    merge_into_result_slot(state, isa, b, &ctx);
    state.stack.truncate_to(ctx.entry_depth);
    b.label(&ctx.end_label);
    if let (BlockType::Value(ty), Some(slot)) = (ctx.result_ty, &ctx.result_slot) {
        let dst = state.stack.push(state.target, ty);
        copy_words(isa, b, dst.words(), slot, ValType::I32);
    }
    Ok(())
}

fn lower_br(state: &mut LowerState, isa: &dyn Isa, b: &mut AsmBuf, depth: u32, cond: Option<Loc>) -> Result<()> {
    let idx = state.blocks.len().checked_sub(1 + depth as usize).ok_or_else(|| CodegenError::MalformedInput {
        opcode_index: 0,
        message: format!("branch depth {depth} exceeds enclosing blocks"),
    })?;

    if state.blocks[idx].branch_arity() == 1 {
        // `br_if`'s carried value is a peek, not a pop: the not-taken path
        // still needs it sitting on top of the operand stack afterward.
        let top = state.stack.top();
        let slot = state.blocks[idx].result_slot.clone().expect("arity-1 branch target has a result slot");
        copy_words(isa, b, &slot, top.words(), ValType::I32);
    }
    let label = state.blocks[idx].branch_target().to_string();
    match cond {
        None => isa.emit_branch(b, &label),
        Some(c) => isa.emit_branch_if(b, c, &label, ValType::I32, true),
    }
    Ok(())
}

fn lower_br_table(state: &mut LowerState, isa: &dyn Isa, b: &mut AsmBuf, targets: &[u32], default: u32) -> Result<()> {
    // A linear compare-and-branch chain rather than an indexed jump table:
    // behaviorally identical and avoids per-architecture jump-table address
    // computation (see DESIGN.md).
    let index = state.stack.pop();
    let index = index.narrow();
    let scratch = Loc::Reg(*isa.schedule().scratch.first().expect("every schedule has a scratch register"));
    for (i, &depth) in targets.iter().enumerate() {
        let case_label = new_label(state, "brtable_case");
        isa.emit_cmp_set(b, CmpOp::Eq, scratch, index, Loc::Imm(i as i64), ValType::I32);
        isa.emit_branch_if(b, scratch, &case_label, ValType::I32, true);
        b.label(&case_label);
        lower_br(state, isa, b, depth, None)?;
    }
    lower_br(state, isa, b, default, None)
}

fn lower_call(state: &mut LowerState, isa: &dyn Isa, b: &mut AsmBuf, name: Id) -> Result<()> {
    let sig = state.sigs.get(&name).cloned().ok_or_else(|| CodegenError::MalformedInput {
        opcode_index: 0,
        message: format!("call to undefined function {name:?}"),
    })?;
    let target = state.target;
    let mut args = Vec::with_capacity(sig.params.len());
    for _ in 0..sig.params.len() {
        args.push(state.stack.pop());
    }
    args.reverse();

    // Marshal argument words through the architecture's argument registers
    // first, then the outgoing stack once those run out — the same slot
    // assignment the callee's own prologue uses to read parameters back
    // out (spec §4.1.4), kept in lockstep by going through `arg_reg` on
    // both sides.
    let mut reg_idx = 0usize;
    let mut stack_words = Vec::new();
    for arg in &args {
        for &w in arg.words() {
            if let Some(reg) = isa.arg_reg(reg_idx) {
                isa.emit_mov(b, Loc::Reg(reg), w, ValType::I32);
                reg_idx += 1;
            } else {
                stack_words.push(w);
            }
        }
    }
    for w in stack_words.iter().rev() {
        isa.emit_stack_arg_push(b, *w);
    }
    isa.emit_call(b, &name);
    if !stack_words.is_empty() {
        isa.emit_stack_arg_cleanup(b, stack_words.len() as i32);
    }
    if let Some(&result_ty) = sig.results.first() {
        let dst = state.stack.push(target, result_ty);
        if dst.is_wide() {
            let words = dst.words();
            isa.emit_mov(b, words[0], Loc::Reg(isa.schedule().result), ValType::I32);
            if let Some(&hi) = isa.schedule().scratch.first() {
                isa.emit_mov(b, words[1], Loc::Reg(hi), ValType::I32);
            }
        } else {
            isa.emit_mov(b, dst.narrow(), Loc::Reg(isa.schedule().result), result_ty);
        }
    }
    Ok(())
}

fn lower_call_indirect(state: &mut LowerState, isa: &dyn Isa, b: &mut AsmBuf, sig_index: u32, index: usize) -> Result<()> {
    let sig = state.sig_types.get(sig_index as usize).cloned().ok_or_else(|| CodegenError::MalformedInput {
        opcode_index: index,
        message: format!("call_indirect references undefined signature {sig_index}"),
    })?;
    let target = state.target;
    let table_index = state.stack.pop();

    // Resolve and verify the target *before* marshaling the callee's own
    // arguments: `emit_call_indirect_stub` leaves the address in a
    // register `arg_reg` never hands out, so the marshaling below cannot
    // clobber it.
    isa.emit_call_indirect_stub(b, table_index.narrow(), sig_index);

    let mut args = Vec::with_capacity(sig.params.len());
    for _ in 0..sig.params.len() {
        args.push(state.stack.pop());
    }
    args.reverse();

    // Same register-then-stack marshaling `lower_call` uses for a direct
    // call: the callee's own prologue reads its parameters back out
    // through the identical `arg_reg` slot assignment regardless of
    // whether it was reached directly or through the table.
    let mut reg_idx = 0usize;
    let mut stack_words = Vec::new();
    for arg in &args {
        for &w in arg.words() {
            if let Some(reg) = isa.arg_reg(reg_idx) {
                isa.emit_mov(b, Loc::Reg(reg), w, ValType::I32);
                reg_idx += 1;
            } else {
                stack_words.push(w);
            }
        }
    }
    for w in stack_words.iter().rev() {
        isa.emit_stack_arg_push(b, *w);
    }
    isa.emit_call_indirect_branch(b);
    if !stack_words.is_empty() {
        isa.emit_stack_arg_cleanup(b, stack_words.len() as i32);
    }
    if let Some(&result_ty) = sig.results.first() {
        let dst = state.stack.push(target, result_ty);
        if dst.is_wide() {
            let words = dst.words();
            isa.emit_mov(b, words[0], Loc::Reg(isa.schedule().result), ValType::I32);
            if let Some(&hi) = isa.schedule().scratch.first() {
                isa.emit_mov(b, words[1], Loc::Reg(hi), ValType::I32);
            }
        } else {
            isa.emit_mov(b, dst.narrow(), Loc::Reg(isa.schedule().result), result_ty);
        }
    }
    Ok(())
}

fn lower_convert(state: &mut LowerState, isa: &dyn Isa, b: &mut AsmBuf, op: ConvOp) {
    let target = state.target;
    let src = state.stack.pop();
    let result_ty = match op {
        ConvOp::WrapI64 => ValType::I32,
        _ => ValType::I64,
    };
    let dst = state.stack.push(target, result_ty);
    isa.emit_convert(b, op, &dst, &src);
}

fn lower_select(state: &mut LowerState, isa: &dyn Isa, b: &mut AsmBuf) {
    let target = state.target;
    let cond = state.stack.pop();
    let (on_true, on_false) = state.stack.pop2();
    let dst = state.stack.push(target, ValType::I32);
    isa.emit_select(b, dst.narrow(), on_true.narrow(), on_false.narrow(), cond.narrow(), ValType::I32);
}
