//! Two-pass assembler (spec §4.2): turns the text `lower` emits into
//! machine code. Pass 1 walks the tokenized lines once to size every
//! instruction and populate the label table; pass 2 re-walks, encoding
//! each instruction now that every label has a known offset, and asserts
//! its output length matches what pass 1 predicted. A mismatch there is
//! always a bug in the sizing table, never a malformed program, so it
//! surfaces as `CodegenError::PassMismatch` rather than being silently
//! patched over.
//!
//! The line grammar is deliberately thin (spec §4.3): one instruction per
//! line, `identifier:` labels, `;` or `//` comments running to end of
//! line, no directives. `tokenize` below implements that grammar; unlike
//! the regex-table lexer it's modeled on, every line here is handled, not
//! left as a todo.

mod arm32;
mod arm64;
mod x86;

use crate::common::{Id, Map};
use crate::diag::{CodegenError, Result};
use crate::target::Target;

/// One parsed line: either a label definition or an instruction with its
/// operand text already split on top-level commas (commas nested inside
/// `[...]` or `{...}`, as in `stp x19, x20, [x29, #16]` or ARM32's
/// `push {r4, r5}`, do not split).
#[derive(Clone, Debug)]
pub struct ParsedLine {
    pub label: Option<Id>,
    pub mnemonic: Option<String>,
    pub operands: Vec<String>,
    pub line: usize,
}

pub fn tokenize(text: &str) -> Vec<ParsedLine> {
    let mut out = Vec::new();
    for (i, raw) in text.lines().enumerate() {
        let stripped = strip_comment(raw);
        let trimmed = stripped.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(name) = trimmed.strip_suffix(':') {
            out.push(ParsedLine {
                label: Some(Id::new(name.trim().to_string())),
                mnemonic: None,
                operands: Vec::new(),
                line: i,
            });
            continue;
        }
        let mut split = trimmed.splitn(2, char::is_whitespace);
        let mnemonic = split.next().unwrap().to_string();
        let rest = split.next().unwrap_or("").trim();
        out.push(ParsedLine {
            label: None,
            mnemonic: Some(mnemonic),
            operands: split_operands(rest),
            line: i,
        });
    }
    out
}

fn strip_comment(line: &str) -> &str {
    let semi = line.find(';');
    let slashes = line.find("//");
    match (semi, slashes) {
        (Some(a), Some(b)) => &line[..a.min(b)],
        (Some(a), None) => &line[..a],
        (None, Some(b)) => &line[..b],
        (None, None) => line,
    }
}

fn split_operands(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut cur = String::new();
    for ch in s.chars() {
        match ch {
            '[' | '{' => {
                depth += 1;
                cur.push(ch);
            }
            ']' | '}' => {
                depth -= 1;
                cur.push(ch);
            }
            ',' if depth == 0 => {
                out.push(cur.trim().to_string());
                cur.clear();
            }
            _ => cur.push(ch),
        }
    }
    let last = cur.trim();
    if !last.is_empty() {
        out.push(last.to_string());
    }
    out
}

/// Label offsets gathered during pass 1, keyed by interned name.
#[derive(Default)]
pub struct SymbolTable {
    offsets: Map<Id, u32>,
}

impl SymbolTable {
    pub fn define(&mut self, name: Id, offset: u32) {
        self.offsets.insert(name, offset);
    }

    pub fn get(&self, name: &str) -> Option<u32> {
        self.offsets.get(&Id::new(name.to_string())).copied()
    }
}

/// Fixed external symbols this crate calls by name but never defines in
/// the assembled text (spec §9: the runtime providing them is out of
/// scope). They resolve to address 0 — a linker would patch this in a
/// complete toolchain, which this crate does not implement.
const EXTERNAL_SYMBOLS: &[&str] = &["__wat_memory_base", "__wat_memory_size", "__wat_memory_grow", "__wat_call_indirect_check"];

pub fn resolve_symbol(symbols: &SymbolTable, name: &str) -> Result<u32> {
    if let Some(off) = symbols.get(name) {
        return Ok(off);
    }
    if EXTERNAL_SYMBOLS.contains(&name) {
        return Ok(0);
    }
    Err(CodegenError::UndefinedLabel { name: name.to_string() })
}

/// The growing machine-code output of a single assemble pass.
#[derive(Default)]
pub struct CodeBuffer {
    bytes: Vec<u8>,
}

impl CodeBuffer {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn push_u8(&mut self, v: u8) {
        self.bytes.push(v);
    }

    pub fn push_u16(&mut self, v: u16) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub fn push_u32(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub fn push_u64(&mut self, v: u64) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.bytes
    }
}

/// Per-architecture half of the assembler: sizes and encodes one
/// instruction at a time. The two-pass driver below is shared; only this
/// trait's implementations differ between targets.
pub trait InstrEncoder {
    fn size(&self, mnemonic: &str, operands: &[String], line: usize) -> Result<usize>;

    fn encode(&self, buf: &mut CodeBuffer, mnemonic: &str, operands: &[String], pc: u32, symbols: &SymbolTable, line: usize) -> Result<()>;

    /// Called once after pass 1 finishes sizing every line, with the total
    /// code length before any trailer this encoder wants to append (arm32
    /// uses this for its literal pool of symbol addresses).
    fn pass1_finished(&self, _code_len: u32) {}

    /// Called once after pass 2 finishes encoding every line, to append
    /// any trailing data whose own size was already folded into
    /// `pass1_finished`'s bookkeeping.
    fn finish(&self, _buf: &mut CodeBuffer, _symbols: &SymbolTable) -> Result<()> {
        Ok(())
    }
}

fn new_encoder(target: Target) -> Box<dyn InstrEncoder> {
    match target {
        Target::X86_64 => Box::new(x86::X86Encoder::new(x86::Width::W64)),
        Target::X86_32 => Box::new(x86::X86Encoder::new(x86::Width::W32)),
        Target::X86_16 => Box::new(x86::X86Encoder::new(x86::Width::W16)),
        Target::Arm64 => Box::new(arm64::Arm64Encoder),
        Target::Arm32 => Box::new(arm32::Arm32Encoder::default()),
    }
}

/// Assemble `text` (the output of `lower::lower_module`) into machine
/// code for `target`.
pub fn assemble(target: Target, text: &str) -> Result<Vec<u8>> {
    let lines = tokenize(text);
    let encoder = new_encoder(target);

    let mut symbols = SymbolTable::default();
    let mut sizes = Vec::with_capacity(lines.len());
    let mut offset: u32 = 0;
    for line in &lines {
        if let Some(label) = line.label {
            symbols.define(label, offset);
        }
        if let Some(mnemonic) = &line.mnemonic {
            let len = encoder.size(mnemonic, &line.operands, line.line)? as u32;
            sizes.push(len);
            offset += len;
        } else {
            sizes.push(0);
        }
    }
    encoder.pass1_finished(offset);

    let mut buf = CodeBuffer::default();
    for (line, expected) in lines.iter().zip(sizes.iter()) {
        let start = buf.len() as u32;
        if let Some(mnemonic) = &line.mnemonic {
            encoder.encode(&mut buf, mnemonic, &line.operands, start, &symbols, line.line)?;
        }
        let actual = buf.len() as u32 - start;
        if actual != *expected {
            return Err(CodegenError::PassMismatch {
                at_line: line.line,
                pass1_offset: (start + *expected) as usize,
                pass2_offset: buf.len(),
            });
        }
    }
    encoder.finish(&mut buf, &symbols)?;

    Ok(buf.into_vec())
}

/// Parse a leading `#`-prefixed (ARM) or bare (x86) decimal/hex immediate.
pub(crate) fn parse_imm(s: &str) -> Option<i64> {
    let s = s.strip_prefix('#').unwrap_or(s);
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("-0x")) {
        let neg = s.starts_with('-');
        let v = i64::from_str_radix(hex, 16).ok()?;
        return Some(if neg { -v } else { v });
    }
    s.parse::<i64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_strips_comments_and_indentation() {
        let text = "function_0:\n    push rbx ; save\n    mov rax, rbx // result\n";
        let lines = tokenize(text);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].label, Some(Id::new("function_0".to_string())));
        assert_eq!(lines[1].mnemonic.as_deref(), Some("push"));
        assert_eq!(lines[1].operands, vec!["rbx".to_string()]);
        assert_eq!(lines[2].operands, vec!["rax".to_string(), "rbx".to_string()]);
    }

    #[test]
    fn split_operands_respects_bracket_and_brace_nesting() {
        assert_eq!(split_operands("x19, x20, [x29, #16]"), vec!["x19", "x20", "[x29, #16]"]);
        assert_eq!(split_operands("{r4, r5, r6}"), vec!["{r4, r5, r6}"]);
    }
}
