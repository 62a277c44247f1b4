//! The pipeline driver (spec §4.5): the pure function tying the
//! lowerer, assembler, and container emitter together. No file I/O
//! happens here — that's the CLI binary's job, the same split the
//! teacher draws between `lib.rs` and `src/bin`.

use crate::ast::Module;
use crate::container;
use crate::diag::Result;
use crate::lower;
use crate::target::{Container, Target};

/// Lower `module` for `target`, assemble the result, and wrap it in
/// `container`. Returns the finished byte buffer or the first
/// `CodegenError` either stage raised.
pub fn compile(module: &Module, target: Target, container: Container) -> Result<Vec<u8>> {
    let asm = lower::lower_module(module, target)?;
    let code = crate::asm::assemble(target, &asm)?;
    Ok(container::wrap(container, code))
}

/// Just the lowering stage, for the CLI's `--emit-asm` debug view.
pub fn lower_to_asm(module: &Module, target: Target) -> Result<String> {
    lower::lower_module(module, target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Function, Instr};
    use crate::common::Id;

    fn empty_fn(name: &str) -> Function {
        Function {
            name: Id::new(name.to_string()),
            params: vec![],
            results: vec![],
            locals: vec![],
            body: vec![Instr::Return],
        }
    }

    #[test]
    fn flat_container_compiles_to_a_nonempty_buffer() {
        let module = Module { functions: vec![empty_fn("f")], sig_types: vec![] };
        let bytes = compile(&module, Target::Arm64, Container::Flat).unwrap();
        assert!(!bytes.is_empty());
    }

    #[test]
    fn pe_container_wraps_the_same_code_with_a_dos_header() {
        let module = Module { functions: vec![empty_fn("f")], sig_types: vec![] };
        let bytes = compile(&module, Target::X86_64, Container::Pe).unwrap();
        assert_eq!(&bytes[0..2], b"MZ");
    }

    #[test]
    fn lower_to_asm_produces_text_for_every_target() {
        let module = Module { functions: vec![empty_fn("f")], sig_types: vec![] };
        for target in [Target::X86_64, Target::X86_32, Target::X86_16, Target::Arm64, Target::Arm32] {
            assert!(!lower_to_asm(&module, target).unwrap().is_empty());
        }
    }
}
