//! Diagnostics.
//!
//! One error enum for the whole pipeline. Every fatal condition named in the
//! spec (malformed input, an opcode outside the covered set, an assembler
//! parse failure, an out-of-range encoding, an unresolved label, or a
//! pass-1/pass-2 size mismatch) is a variant here, not a type of its own —
//! callers match on `CodegenError`, not on a family of error types.

use std::fmt;

#[derive(Clone, PartialEq, Eq)]
pub enum CodegenError {
    /// The AST is ill-typed or structurally inconsistent: stack underflow,
    /// an arity mismatch at block end, or a branch depth beyond the
    /// enclosing blocks.
    MalformedInput { opcode_index: usize, message: String },

    /// An opcode outside the integer-only covered set (float, SIMD, ...).
    UnsupportedOpcode { opcode_index: usize, name: String },

    /// The assembler could not tokenize a line or recognize its mnemonic.
    AssemblyParseError { line: usize, message: String },

    /// An immediate or branch displacement does not fit the instruction
    /// form's bit width.
    EncodingOutOfRange {
        label: String,
        delta: i64,
        permitted: String,
    },

    /// A label was referenced but never defined anywhere in the input.
    UndefinedLabel { name: String },

    /// Pass-2 position disagrees with pass-1 sizing. This is always a bug in
    /// the sizing table, not a malformed program.
    PassMismatch {
        at_line: usize,
        pass1_offset: usize,
        pass2_offset: usize,
    },
}

impl fmt::Display for CodegenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodegenError::MalformedInput { opcode_index, message } => {
                write!(f, "malformed input at opcode {opcode_index}: {message}")
            }
            CodegenError::UnsupportedOpcode { opcode_index, name } => {
                write!(f, "unsupported opcode {name:?} at opcode {opcode_index}")
            }
            CodegenError::AssemblyParseError { line, message } => {
                write!(f, "assembly parse error at line {line}: {message}")
            }
            CodegenError::EncodingOutOfRange { label, delta, permitted } => {
                write!(
                    f,
                    "displacement to {label:?} out of range: {delta} (permitted: {permitted})"
                )
            }
            CodegenError::UndefinedLabel { name } => {
                write!(f, "undefined label {name:?}")
            }
            CodegenError::PassMismatch { at_line, pass1_offset, pass2_offset } => {
                write!(
                    f,
                    "internal error: pass-1/pass-2 size mismatch at line {at_line} \
                     (pass1={pass1_offset}, pass2={pass2_offset})"
                )
            }
        }
    }
}

// Mirrors the teacher's LexError/ParseError: Debug forwards to Display so
// `.unwrap()` in tests and `{:?}` logging both read as the one diagnostic
// line, not a field dump.
impl fmt::Debug for CodegenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl std::error::Error for CodegenError {}

pub type Result<T> = std::result::Result<T, CodegenError>;
