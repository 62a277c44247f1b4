//! The lowerer's model of the WASM operand stack (spec §3, §4.1.5).
//!
//! The first [`STACK_REGS`] logical values live in fixed registers; anything
//! deeper spills to `[frame_ptr - offset]`, growing toward lower addresses.
//! This type only ever hands out *locations*; it never emits assembly
//! itself, which is what lets the same stack model serve all five
//! architectures (see `lower::mod`).
//!
//! One wrinkle beyond the spec's register table: a virtual-stack register
//! is exactly as wide as the target's native word (64 bits on x86-64/arm64,
//! 32 on x86-32/arm32, 16 on x86-16). A WASM value wider than that can't
//! live in one register. Such values always spill, as consecutive machine
//! words (low word first), and never occupy one of the four register
//! slots — see `DESIGN.md` for why a full register-pair scheme was not
//! worth the added complexity here.

use crate::ast::ValType;
use crate::target::{RegisterSchedule, Target, STACK_REGS};

/// Where one machine word lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Loc {
    Reg(&'static str),
    /// Byte offset from the frame pointer; always negative.
    Spill(i32),
    /// A literal operand, for the handful of places a lowering helper needs
    /// to feed `Isa::emit_binop_word`/`emit_cmp_set` a constant (a loop trip
    /// count, a bit mask) rather than a value already on the operand stack.
    Imm(i64),
}

/// Where one *logical* WASM value lives: one machine word if it fits the
/// target's native width, otherwise several, low word first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValueLoc(pub Vec<Loc>);

impl ValueLoc {
    pub fn narrow(&self) -> Loc {
        assert_eq!(self.0.len(), 1, "expected a single-word value location");
        self.0[0]
    }

    pub fn words(&self) -> &[Loc] {
        &self.0
    }

    pub fn is_wide(&self) -> bool {
        self.0.len() > 1
    }
}

/// How many native words on `target` a value of type `ty` occupies.
pub fn word_count(target: Target, ty: ValType) -> usize {
    let native_bits = target.schedule().word_bytes * 8;
    let value_bits = ty.bytes() * 8;
    ((value_bits + native_bits - 1) / native_bits) as usize
}

#[derive(Debug)]
pub struct OperandStack {
    schedule: &'static RegisterSchedule,
    slots: Vec<ValueLoc>,
    narrow_reg_used: usize,
    spill_offset: i32,
    /// High-water mark of `spill_offset`, used to size the stack frame.
    max_spill: i32,
}

impl OperandStack {
    pub fn new(schedule: &'static RegisterSchedule, spill_base: i32) -> Self {
        OperandStack {
            schedule,
            slots: Vec::new(),
            narrow_reg_used: 0,
            spill_offset: spill_base,
            max_spill: spill_base,
        }
    }

    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    pub fn max_spill_bytes(&self) -> i32 {
        self.max_spill
    }

    fn alloc_word(&mut self) -> Loc {
        self.spill_offset -= self.schedule.word_bytes;
        self.max_spill = self.max_spill.min(self.spill_offset);
        Loc::Spill(self.spill_offset)
    }

    /// Reserve the next logical slot and return where the caller should
    /// write the value's word(s). The architecture backend emits the
    /// actual move(s) into the returned location(s); this type only tracks
    /// bookkeeping.
    pub fn push(&mut self, target: Target, ty: ValType) -> ValueLoc {
        let words = word_count(target, ty);
        if words == 1 && self.narrow_reg_used < STACK_REGS {
            let loc = Loc::Reg(self.schedule.stack_regs[self.narrow_reg_used]);
            self.narrow_reg_used += 1;
            self.slots.push(ValueLoc(vec![loc]));
        } else {
            // Wide values, and narrow values once the register window is
            // full, always spill.
            let locs = (0..words).map(|_| self.alloc_word()).collect();
            self.slots.push(ValueLoc(locs));
        }
        self.slots.last().unwrap().clone()
    }

    fn free_word(&mut self, loc: Loc) {
        if let Loc::Spill(off) = loc {
            if off == self.spill_offset {
                self.spill_offset += self.schedule.word_bytes;
            }
        }
    }

    /// Consume and return the top slot's location(s).
    pub fn pop(&mut self) -> ValueLoc {
        let loc = self.slots.pop().expect("operand stack underflow");
        if loc.0.len() == 1 {
            match loc.0[0] {
                Loc::Reg(_) => self.narrow_reg_used -= 1,
                l @ Loc::Spill(_) => self.free_word(l),
                Loc::Imm(_) => unreachable!("operand stack never holds an immediate"),
            }
        } else {
            for &l in loc.0.iter().rev() {
                self.free_word(l);
            }
        }
        loc
    }

    /// Pop two values; `.1` is the logical top (right-hand operand).
    pub fn pop2(&mut self) -> (ValueLoc, ValueLoc) {
        let rhs = self.pop();
        let lhs = self.pop();
        (lhs, rhs)
    }

    pub fn top(&self) -> ValueLoc {
        self.slots.last().expect("operand stack underflow").clone()
    }

    pub fn at(&self, k: usize) -> ValueLoc {
        self.slots[self.slots.len() - 1 - k].clone()
    }

    /// Logically drop every value above `target_depth`, without emitting
    /// any code: used when a `br`/`br_if` adjusts the compile-time stack to
    /// a block's declared result arity before branching away (spec
    /// §4.1.7).
    pub fn truncate_to(&mut self, target_depth: usize) {
        while self.slots.len() > target_depth {
            self.pop();
        }
    }

    /// Permanently reserve `count` spill words outside the normal
    /// push/pop discipline: backing storage for a block's carried branch
    /// result, which must survive across the compile-time stack churn of
    /// both the branch path and the fallthrough path.
    pub fn alloc_scratch_words(&mut self, count: usize) -> Vec<Loc> {
        (0..count).map(|_| self.alloc_word()).collect()
    }
}
