//! Target selection and the per-architecture register/ABI tables.
//!
//! This is the `TargetSpec` the design notes call for: one place describing
//! register schedules, calling conventions, and widths, so the lowerer and
//! assembler walk the *same* shared algorithm for every architecture and
//! only the data here changes.

use clap::ValueEnum;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ValueEnum, derive_more::Display)]
pub enum Target {
    #[display("x86_64")]
    X86_64,
    #[display("x86_32")]
    X86_32,
    #[display("x86_16")]
    X86_16,
    #[display("arm64")]
    Arm64,
    #[display("arm32")]
    Arm32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ValueEnum, derive_more::Display)]
pub enum Container {
    #[display("flat")]
    Flat,
    #[display("pe")]
    Pe,
}

/// The fixed count of WASM-stack values held in registers before spilling.
pub const STACK_REGS: usize = 4;

/// Per-architecture register schedule (spec §4.1.2) and calling convention
/// (spec §4.1.3), collapsed into one table so the generic lowerer never
/// special-cases an architecture by name.
#[derive(Debug)]
pub struct RegisterSchedule {
    /// The `STACK_REGS` registers backing the first values of the WASM
    /// operand stack, innermost-first is not implied here: index 0 is the
    /// register used when stack depth is 0, etc.
    pub stack_regs: [&'static str; STACK_REGS],
    /// Dedicated register holding the module's linear-memory base.
    pub mem_base: &'static str,
    /// Registers free for scratch use inside a single opcode's expansion.
    pub scratch: &'static [&'static str],
    pub frame_ptr: &'static str,
    pub stack_ptr: &'static str,
    /// Register (or register pair, widest-first) holding the function
    /// result.
    pub result: &'static str,
    /// Argument-passing registers, in order; remaining arguments go on the
    /// caller's stack.
    pub args: &'static [&'static str],
    /// Registers the callee must restore before returning, beyond the frame
    /// pointer and the stack-backed return address.
    pub callee_saved: &'static [&'static str],
    pub stack_align: i32,
    /// Size in bytes of one spill slot / general-purpose register on this
    /// target.
    pub word_bytes: i32,
}

pub const X86_64: RegisterSchedule = RegisterSchedule {
    stack_regs: ["r12", "r13", "r14", "r15"],
    mem_base: "r11",
    scratch: &["rax", "rbx", "rcx", "rdx"],
    frame_ptr: "rbp",
    stack_ptr: "rsp",
    result: "rax",
    args: &["rdi", "rsi", "rdx", "rcx", "r8", "r9"],
    callee_saved: &["rbx", "r12", "r13", "r14", "r15"],
    stack_align: 16,
    word_bytes: 8,
};

pub const X86_32: RegisterSchedule = RegisterSchedule {
    stack_regs: ["ebx", "ecx", "edx", "edi"],
    mem_base: "esi",
    scratch: &["eax"],
    frame_ptr: "ebp",
    stack_ptr: "esp",
    result: "eax",
    args: &[],
    callee_saved: &["ebx", "esi", "edi", "ebp"],
    stack_align: 4,
    word_bytes: 4,
};

pub const X86_16: RegisterSchedule = RegisterSchedule {
    stack_regs: ["bx", "cx", "dx", "di"],
    mem_base: "si",
    scratch: &["ax"],
    frame_ptr: "bp",
    stack_ptr: "sp",
    result: "ax",
    args: &[],
    callee_saved: &["bx", "si", "di", "bp"],
    stack_align: 2,
    word_bytes: 2,
};

pub const ARM64: RegisterSchedule = RegisterSchedule {
    stack_regs: ["w19", "w20", "w21", "w22"],
    mem_base: "x23",
    scratch: &["w0", "w1", "w2", "w3", "w4", "w5", "w6", "w7", "w8", "w9", "w10"],
    frame_ptr: "x29",
    stack_ptr: "sp",
    result: "x0",
    args: &["x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7"],
    callee_saved: &["x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27", "x28", "x29", "x30"],
    stack_align: 16,
    word_bytes: 8,
};

pub const ARM32: RegisterSchedule = RegisterSchedule {
    stack_regs: ["r4", "r5", "r6", "r7"],
    mem_base: "r8",
    scratch: &["r0", "r1", "r2", "r3", "r12"],
    frame_ptr: "r11",
    stack_ptr: "r13",
    result: "r0",
    args: &["r0", "r1", "r2", "r3"],
    callee_saved: &["r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "lr"],
    stack_align: 8,
    word_bytes: 4,
};

impl Target {
    pub fn schedule(self) -> &'static RegisterSchedule {
        match self {
            Target::X86_64 => &X86_64,
            Target::X86_32 => &X86_32,
            Target::X86_16 => &X86_16,
            Target::Arm64 => &ARM64,
            Target::Arm32 => &ARM32,
        }
    }

    /// True when a native general-purpose register is wide enough to hold a
    /// WASM i64 on its own (x86-64, arm64). False means i64 values are
    /// always spilled to a pair of `word_bytes`-sized memory slots: see
    /// DESIGN.md for why this crate does not implement register-pair i64.
    pub fn has_64bit_registers(self) -> bool {
        matches!(self, Target::X86_64 | Target::Arm64)
    }

    pub fn is_arm(self) -> bool {
        matches!(self, Target::Arm64 | Target::Arm32)
    }

    /// Fixed instruction width in bytes, or `None` for the variable-length
    /// x86 family.
    pub fn fixed_instruction_width(self) -> Option<usize> {
        if self.is_arm() {
            Some(4)
        } else {
            None
        }
    }
}
