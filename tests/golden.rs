//! End-to-end WAT-to-bytes scenarios. Each one pins down a specific
//! byte sequence this crate has to reproduce exactly, the way a real
//! assembler's test suite checks known-good encodings rather than
//! just "it didn't panic".

use wabc::ast::{BinOp, FuncType, Function, Instr, Module, ValType};
use wabc::asm;
use wabc::common::Id;
use wabc::target::Target;

#[test]
fn arm64_ret_matches_known_encoding() {
    let bytes = asm::assemble(Target::Arm64, "ret").unwrap();
    assert_eq!(bytes, [0xC0, 0x03, 0x5F, 0xD6]);
}

#[test]
fn arm64_nop_matches_known_encoding() {
    let bytes = asm::assemble(Target::Arm64, "nop").unwrap();
    assert_eq!(bytes, [0x1F, 0x20, 0x03, 0xD5]);
}

#[test]
fn arm32_bx_lr_matches_known_encoding() {
    let bytes = asm::assemble(Target::Arm32, "bx lr").unwrap();
    assert_eq!(bytes, [0x1E, 0xFF, 0x2F, 0xE1]);
}

#[test]
fn arm32_mov_immediate_matches_known_encoding() {
    let bytes = asm::assemble(Target::Arm32, "mov r0, #42").unwrap();
    assert_eq!(bytes, [0x2A, 0x00, 0xA0, 0xE3]);
}

#[test]
fn arm32_forward_branch_offset_is_zero_two_instructions_ahead() {
    let text = "b skip\nnop\nskip:\nnop";
    let bytes = asm::assemble(Target::Arm32, text).unwrap();
    // PC for the branch is (offset + 8); target is two instructions (8
    // bytes) further on, so the encoded signed word offset is zero.
    assert_eq!(&bytes[0..4], &[0x00, 0x00, 0x00, 0xEA]);
}

fn add_function() -> Module {
    Module {
        functions: vec![Function {
            name: Id::new("add".to_string()),
            params: vec![ValType::I32, ValType::I32],
            results: vec![ValType::I32],
            locals: vec![],
            body: vec![
                Instr::LocalGet(0),
                Instr::LocalGet(1),
                Instr::Binop(ValType::I32, BinOp::Add),
                Instr::Return,
            ],
        }],
        sig_types: vec![],
    }
}

#[test]
fn x86_64_add_function_lowers_to_a_well_formed_prologue_and_epilogue() {
    // `push rbp` is the first instruction this function emits, and the
    // four virtual-stack registers plus the memory-base register are
    // saved right below `rbp` once it's established — so the two
    // locals land at `[rbp-48]`/`[rbp-56]`, past that five-register
    // save area.
    let asm = wabc::pipeline::lower_to_asm(&add_function(), Target::X86_64).unwrap();
    let first_instr = asm.lines().find(|l| !l.trim().is_empty() && !l.trim_end().ends_with(':'));
    assert_eq!(first_instr, Some("    push rbp"));
    assert!(asm.contains("mov rbp, rsp"));
    assert!(asm.contains("[rbp-48]"));
    assert!(asm.contains("[rbp-56]"));
    assert!(asm.contains("add"));
    assert!(asm.trim_end().ends_with("ret"));

    let bytes = asm::assemble(Target::X86_64, &asm).unwrap();
    // Lowered machine code must begin with `push rbp` (0x55) and end
    // with a bare `ret` (0xC3), run through the epilogue's register
    // restores first.
    assert_eq!(bytes[0], 0x55);
    assert_eq!(*bytes.last().unwrap(), 0xC3);
}

#[test]
fn call_indirect_marshals_its_argument_before_branching() {
    // One param, popped off the table index, marshaled into `edi` before
    // the resolved (and by then overwritten-risk) target in `rax` is
    // finally called — not skipped the way a stub-only lowering would.
    let module = Module {
        functions: vec![Function {
            name: Id::new("caller".to_string()),
            params: vec![],
            results: vec![ValType::I32],
            locals: vec![],
            body: vec![
                Instr::I32Const(7),
                Instr::I32Const(0),
                Instr::CallIndirect { sig_index: 0 },
                Instr::Return,
            ],
        }],
        sig_types: vec![FuncType { params: vec![ValType::I32], results: vec![ValType::I32] }],
    };
    let asm = wabc::pipeline::lower_to_asm(&module, Target::X86_64).unwrap();
    assert!(asm.contains("call __wat_call_indirect_check"));
    // The marshaled argument lands in `edi` *after* the check call, so the
    // callee actually receives it.
    let check_pos = asm.find("call __wat_call_indirect_check").unwrap();
    let marshal_pos = asm.find("mov edi,").unwrap();
    let branch_pos = asm.find("call rax").unwrap();
    assert!(check_pos < marshal_pos, "argument must be marshaled after the table lookup");
    assert!(marshal_pos < branch_pos, "argument must be marshaled before the indirect call");
}

#[test]
fn wide_global_get_set_round_trips_through_two_reserved_words() {
    // i64 on x86-32 needs two machine words; `g`'s high word gets its own
    // `g_hi` reservation rather than a `[g+4]`-style offset this
    // assembler's memory operand can't express.
    let module = Module {
        functions: vec![Function {
            name: Id::new("roundtrip".to_string()),
            params: vec![],
            results: vec![ValType::I64],
            locals: vec![],
            body: vec![
                Instr::I64Const(42),
                Instr::GlobalSet(Id::new("g".to_string()), ValType::I64),
                Instr::GlobalGet(Id::new("g".to_string()), ValType::I64),
                Instr::Return,
            ],
        }],
        sig_types: vec![],
    };
    let asm = wabc::pipeline::lower_to_asm(&module, Target::X86_32).unwrap();
    assert!(asm.contains("g:"));
    assert!(asm.contains("g_hi:"));
    assert!(asm.contains("[g]"));
    assert!(asm.contains("[g_hi]"));
}

#[test]
fn add_function_compiles_on_every_target() {
    for target in [
        Target::X86_64,
        Target::X86_32,
        Target::X86_16,
        Target::Arm64,
        Target::Arm32,
    ] {
        let bytes =
            wabc::pipeline::compile(&add_function(), target, wabc::target::Container::Flat)
                .unwrap();
        assert!(!bytes.is_empty());
    }
}

#[test]
fn pe_container_wraps_a_real_compiled_function() {
    let bytes = wabc::pipeline::compile(&add_function(), Target::X86_64, wabc::target::Container::Pe)
        .unwrap();
    assert_eq!(&bytes[0..2], b"MZ");
    assert_eq!(bytes.len() % 0x200, 0);
}
