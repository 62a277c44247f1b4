//! ARM32 (AAPCS32-ish) encoder. Every real instruction is 4 bytes, same
//! as arm64, but this target also has `ldr rN, =symbol` — a pseudo-op
//! with no single-instruction native encoding, so it has to load from a
//! nearby literal pool instead. That pool is trailer data: its contents
//! aren't known until every line has been sized (`pass1_finished`) and
//! its bytes aren't written until every real instruction has been
//! encoded (`finish`), mirroring how a real linker-less assembler would
//! place one after `.text`.

use std::cell::RefCell;

use super::{resolve_symbol, CodeBuffer, InstrEncoder, SymbolTable};
use crate::common::Id;
use crate::diag::{CodegenError, Result};

fn parse_err(line: usize, message: impl Into<String>) -> CodegenError {
    CodegenError::AssemblyParseError { line, message: message.into() }
}

fn reg_num(name: &str) -> Option<u8> {
    match name {
        "sp" => Some(13),
        "lr" => Some(14),
        "pc" => Some(15),
        _ => name.strip_prefix('r').and_then(|n| n.parse::<u8>().ok()).filter(|&n| n <= 15),
    }
}

fn cond_code(cc: &str) -> Option<u32> {
    Some(match cc {
        "eq" => 0x0,
        "ne" => 0x1,
        "hs" | "cs" => 0x2,
        "lo" | "cc" => 0x3,
        "mi" => 0x4,
        "pl" => 0x5,
        "vs" => 0x6,
        "vc" => 0x7,
        "hi" => 0x8,
        "ls" => 0x9,
        "ge" => 0xa,
        "lt" => 0xb,
        "gt" => 0xc,
        "le" => 0xd,
        "al" | "" => 0xe,
        _ => return None,
    })
}

/// Split a mnemonic like `movne` or `subs` into its base and an optional
/// trailing condition code. Only `mov` takes a condition suffix in this
/// target's catalog (no `cset`/`csel` here, so `mov<cc>` is how
/// conditional selects are built), and only `adds`/`subs`/`adcs`/`sbcs`
/// take the flag-setting `s` suffix.
fn split_cond(mnemonic: &str) -> (&str, &str) {
    for base in ["mov"] {
        if let Some(rest) = mnemonic.strip_prefix(base) {
            if !rest.is_empty() && cond_code(rest).is_some() {
                return (base, rest);
            }
        }
    }
    (mnemonic, "al")
}

fn parse_imm(s: &str) -> Option<i64> {
    super::parse_imm(s)
}

fn parse_reg_list(s: &str) -> Option<Vec<u8>> {
    let inner = s.strip_prefix('{')?.strip_suffix('}')?;
    inner.split(',').map(|r| reg_num(r.trim())).collect()
}

/// `[rN, #imm]` or bare `rN` (for `str`/`ldr` addressing, always the
/// former; never a pre/post-index writeback form on this target).
fn parse_mem(s: &str, line: usize) -> Result<(u8, i32)> {
    let inner = s.strip_prefix('[').and_then(|s| s.strip_suffix(']')).ok_or_else(|| parse_err(line, format!("expected [rN, #imm], found `{s}`")))?;
    let mut parts = inner.split(',');
    let base = reg_num(parts.next().unwrap_or("").trim()).ok_or_else(|| parse_err(line, format!("unknown base register in `{s}`")))?;
    let disp = match parts.next() {
        Some(d) => parse_imm(d.trim()).ok_or_else(|| parse_err(line, format!("bad displacement in `{s}`")))?,
        None => 0,
    };
    Ok((base, disp as i32))
}

const UDF_TRAP: u32 = 0xe7f0_00f0;

/// Tracks the symbols referenced by `ldr rN, =symbol` across both passes,
/// in first-seen order, so every such load gets a stable slot in the
/// literal pool appended after the code.
#[derive(Default)]
pub struct Arm32Encoder {
    pool: RefCell<Vec<Id>>,
    pool_base: RefCell<u32>,
}

impl Arm32Encoder {
    fn pool_slot(&self, name: &str) -> u32 {
        let id = Id::new(name.to_string());
        let mut pool = self.pool.borrow_mut();
        let idx = match pool.iter().position(|s| *s == id) {
            Some(i) => i,
            None => {
                pool.push(id);
                pool.len() - 1
            }
        };
        *self.pool_base.borrow() + idx as u32 * 4
    }

    fn encode_one(&self, buf: &mut CodeBuffer, mnemonic: &str, operands: &[String], pc: u32, symbols: &SymbolTable, line: usize, sizing: bool) -> Result<usize> {
        if mnemonic == "res" {
            let n = operands.first().and_then(|s| parse_imm(s)).ok_or_else(|| parse_err(line, "res needs a byte count"))? as usize;
            if !sizing {
                buf.push_bytes(&vec![0u8; n]);
            }
            return Ok(n);
        }
        if mnemonic == ".word" {
            let v = operands.first().and_then(|s| parse_imm(s)).unwrap_or(UDF_TRAP as i64) as u32;
            if !sizing {
                buf.push_u32(v);
            }
            return Ok(4);
        }

        let word = self.encode_word(mnemonic, operands, pc, symbols, line, sizing)?;
        if !sizing {
            buf.push_u32(word);
        }
        Ok(4)
    }

    fn encode_word(&self, mnemonic: &str, operands: &[String], pc: u32, symbols: &SymbolTable, line: usize, sizing: bool) -> Result<u32> {
        let reg = |i: usize| -> Result<u8> {
            let name = operands.get(i).ok_or_else(|| parse_err(line, format!("{mnemonic} missing operand {i}")))?;
            reg_num(name).ok_or_else(|| parse_err(line, format!("unknown register `{name}`")))
        };

        match mnemonic {
            "nop" => Ok(0xe320_f000),
            "bx" => Ok(0xe12f_ff10 | reg(0)? as u32),
            "blx" => Ok(0xe12f_ff30 | reg(0)? as u32),

            "b" | "bl" => {
                let target = &operands[0];
                let addr = if sizing { pc.wrapping_add(8) } else { resolve_symbol(symbols, target)? };
                let rel = addr.wrapping_sub(pc.wrapping_add(8)) as i32;
                if rel % 4 != 0 {
                    return Err(parse_err(line, "branch target is not word-aligned"));
                }
                let imm24 = ((rel / 4) as u32) & 0x00ff_ffff;
                let op = if mnemonic == "bl" { 0xeb00_0000 } else { 0xea00_0000 };
                Ok(op | imm24)
            }

            m if m.starts_with("mov") => {
                let (_, cc) = split_cond(mnemonic);
                let cond = cond_code(cc).ok_or_else(|| parse_err(line, format!("unknown condition `{cc}`")))? << 28;
                let rd = reg(0)?;
                let src = operands.get(1).ok_or_else(|| parse_err(line, "mov missing source"))?;
                if let Some(imm) = parse_imm(src) {
                    if !(0..=255).contains(&imm) {
                        return Err(CodegenError::EncodingOutOfRange { label: "mov immediate".into(), delta: imm, permitted: "0..=255".into() });
                    }
                    Ok(cond | 0x03a0_0000 | ((rd as u32) << 12) | imm as u32)
                } else {
                    let rm = reg_num(src).ok_or_else(|| parse_err(line, format!("unknown register `{src}`")))?;
                    Ok(cond | 0x01a0_0000 | ((rd as u32) << 12) | rm as u32)
                }
            }

            "ldr" if operands.get(1).map(|s| s.starts_with('=')).unwrap_or(false) => {
                let name = operands[1].trim_start_matches('=');
                let rd = reg(0)?;
                let slot = self.pool_slot(name);
                let rel = slot as i64 - (pc as i64 + 8);
                if !(-4095..=4095).contains(&rel) {
                    return Err(CodegenError::EncodingOutOfRange { label: name.to_string(), delta: rel, permitted: "-4095..=4095".into() });
                }
                let (u, imm12) = if rel >= 0 { (1u32, rel as u32) } else { (0u32, (-rel) as u32) };
                Ok(0xe510_0000 | (u << 23) | (15 << 16) | ((rd as u32) << 12) | imm12)
            }
            "ldr" | "str" | "ldrb" | "strb" | "ldrsb" | "ldrh" | "strh" | "ldrsh" => {
                let rd = reg(0)?;
                let mem = operands.get(1).ok_or_else(|| parse_err(line, format!("{mnemonic} missing memory operand")))?;
                let (base, disp) = parse_mem(mem, line)?;
                let (u, off) = if disp >= 0 { (1u32, disp as u32) } else { (0u32, (-disp) as u32) };
                let is_load = mnemonic.starts_with("ldr");
                let l = is_load as u32;
                match mnemonic {
                    "ldr" | "str" | "ldrb" | "strb" => {
                        if off > 0xfff {
                            return Err(CodegenError::EncodingOutOfRange { label: mem.clone(), delta: off as i64, permitted: "0..=4095".into() });
                        }
                        let b = (mnemonic.ends_with('b')) as u32;
                        Ok(0xe500_0000 | (u << 23) | (b << 22) | (l << 20) | ((base as u32) << 16) | ((rd as u32) << 12) | off)
                    }
                    "ldrh" | "strh" | "ldrsb" | "ldrsh" => {
                        if off > 0xff {
                            return Err(CodegenError::EncodingOutOfRange { label: mem.clone(), delta: off as i64, permitted: "0..=255".into() });
                        }
                        let (s_bit, h_bit) = match mnemonic {
                            "ldrh" | "strh" => (0u32, 1u32),
                            "ldrsb" => (1u32, 0u32),
                            "ldrsh" => (1u32, 1u32),
                            _ => unreachable!(),
                        };
                        let imm_lo = off & 0xf;
                        let imm_hi = (off >> 4) & 0xf;
                        Ok(0xe140_0090 | (u << 23) | (l << 20) | ((base as u32) << 16) | ((rd as u32) << 12) | (imm_hi << 8) | (s_bit << 6) | (h_bit << 5) | imm_lo)
                    }
                    _ => unreachable!(),
                }
            }

            "push" => {
                let list = operands.first().and_then(|s| parse_reg_list(s)).ok_or_else(|| parse_err(line, "push needs a {r..} list"))?;
                let mask: u32 = list.iter().fold(0, |m, &r| m | (1 << r));
                Ok(0xe92d_0000 | mask)
            }
            "pop" => {
                let list = operands.first().and_then(|s| parse_reg_list(s)).ok_or_else(|| parse_err(line, "pop needs a {r..} list"))?;
                let mask: u32 = list.iter().fold(0, |m, &r| m | (1 << r));
                Ok(0xe8bd_0000 | mask)
            }

            "add" | "sub" | "and" | "orr" | "eor" | "rsb" | "adds" | "subs" | "adcs" | "sbcs" | "cmp" | "tst" => {
                let s_bit = matches!(mnemonic, "adds" | "subs" | "adcs" | "sbcs" | "cmp" | "tst") as u32;
                let opc = match mnemonic {
                    "add" | "adds" => 0x4,
                    "sub" | "subs" => 0x2,
                    "cmp" => 0xa,
                    "adcs" => 0x5,
                    "sbcs" => 0x6,
                    "and" => 0x0,
                    "tst" => 0x8,
                    "orr" => 0xc,
                    "eor" => 0x1,
                    "rsb" => 0x3,
                    _ => unreachable!(),
                };
                let is_cmp_like = matches!(mnemonic, "cmp" | "tst");
                let (rd, rn, rhs_idx) = if is_cmp_like { (0u8, reg(0)?, 1) } else { (reg(0)?, reg(1)?, 2) };
                let rhs = operands.get(rhs_idx).ok_or_else(|| parse_err(line, format!("{mnemonic} missing right-hand operand")))?;
                let base = 0xe000_0000 | (opc << 21) | (s_bit << 20) | ((rn as u32) << 16) | ((rd as u32) << 12);
                if let Some(imm) = parse_imm(rhs) {
                    if !(0..=255).contains(&imm) {
                        return Err(CodegenError::EncodingOutOfRange { label: format!("{mnemonic} immediate"), delta: imm, permitted: "0..=255".into() });
                    }
                    Ok(base | 0x0200_0000 | imm as u32)
                } else {
                    let rm = reg_num(rhs).ok_or_else(|| parse_err(line, format!("unknown register `{rhs}`")))?;
                    Ok(base | rm as u32)
                }
            }

            "lsl" | "lsr" | "asr" | "ror" => {
                let rd = reg(0)?;
                let rn = reg(1)?;
                let shift_op = match mnemonic {
                    "lsl" => 0u32,
                    "lsr" => 1,
                    "asr" => 2,
                    "ror" => 3,
                    _ => unreachable!(),
                };
                let shift_src = operands.get(2).ok_or_else(|| parse_err(line, format!("{mnemonic} missing shift operand")))?;
                if let Some(rs) = reg_num(shift_src) {
                    Ok(0xe1a0_0010 | ((rd as u32) << 12) | ((rs as u32) << 8) | (shift_op << 5) | rn as u32)
                } else {
                    let amt = parse_imm(shift_src).ok_or_else(|| parse_err(line, format!("bad shift amount `{shift_src}`")))? as u32;
                    Ok(0xe1a0_0000 | ((rd as u32) << 12) | (amt << 7) | (shift_op << 5) | rn as u32)
                }
            }

            "mul" => {
                let rd = reg(0)?;
                let rm = reg(1)?;
                let rs = reg(2)?;
                Ok(0xe000_0090 | ((rd as u32) << 16) | ((rs as u32) << 8) | rm as u32)
            }
            "mls" => {
                let rd = reg(0)?;
                let rm = reg(1)?;
                let rs = reg(2)?;
                let ra = reg(3)?;
                Ok(0xe006_0090 | ((rd as u32) << 16) | ((ra as u32) << 12) | ((rs as u32) << 8) | rm as u32)
            }
            "sdiv" => {
                let rd = reg(0)?;
                let rn = reg(1)?;
                let rm = reg(2)?;
                Ok(0xe710_f010 | ((rd as u32) << 16) | ((rm as u32) << 8) | rn as u32)
            }
            "udiv" => {
                let rd = reg(0)?;
                let rn = reg(1)?;
                let rm = reg(2)?;
                Ok(0xe730_f010 | ((rd as u32) << 16) | ((rm as u32) << 8) | rn as u32)
            }

            "sxtb" | "sxth" => {
                let rd = reg(0)?;
                let rm = reg(1)?;
                let base = if mnemonic == "sxtb" { 0xe6af_0070 } else { 0xe6bf_0070 };
                Ok(base | ((rd as u32) << 12) | rm as u32)
            }

            m if m.len() > 1 && m.starts_with('b') && cond_code(&m[1..]).is_some() => {
                let cc = &m[1..];
                let cond = cond_code(cc).ok_or_else(|| parse_err(line, format!("unknown condition `{cc}`")))?;
                let target = &operands[0];
                let addr = if sizing { pc.wrapping_add(8) } else { resolve_symbol(symbols, target)? };
                let rel = addr.wrapping_sub(pc.wrapping_add(8)) as i32;
                if rel % 4 != 0 {
                    return Err(parse_err(line, "branch target is not word-aligned"));
                }
                let imm24 = ((rel / 4) as u32) & 0x00ff_ffff;
                Ok((cond << 28) | 0x0a00_0000 | imm24)
            }

            other => Err(CodegenError::UnsupportedOpcode { opcode_index: line, name: other.to_string() }),
        }
    }
}

impl InstrEncoder for Arm32Encoder {
    fn size(&self, mnemonic: &str, operands: &[String], line: usize) -> Result<usize> {
        let mut scratch = CodeBuffer::default();
        let symbols = SymbolTable::default();
        self.encode_one(&mut scratch, mnemonic, operands, 0, &symbols, line, true)
    }

    fn encode(&self, buf: &mut CodeBuffer, mnemonic: &str, operands: &[String], pc: u32, symbols: &SymbolTable, line: usize) -> Result<()> {
        self.encode_one(buf, mnemonic, operands, pc, symbols, line, false)?;
        Ok(())
    }

    fn pass1_finished(&self, code_len: u32) {
        *self.pool_base.borrow_mut() = code_len;
    }

    fn finish(&self, buf: &mut CodeBuffer, symbols: &SymbolTable) -> Result<()> {
        let pool = self.pool.borrow();
        for name in pool.iter() {
            let addr = resolve_symbol(symbols, name.as_str())?;
            buf.push_u32(addr);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(mnemonic: &str, operands: &[&str]) -> u32 {
        let enc = Arm32Encoder::default();
        let ops: Vec<String> = operands.iter().map(|s| s.to_string()).collect();
        let symbols = SymbolTable::default();
        enc.encode_word(mnemonic, &ops, 0, &symbols, 0, false).unwrap()
    }

    #[test]
    fn bx_lr_matches_known_encoding() {
        assert_eq!(encode("bx", &["lr"]), 0xe12f_ff1e);
    }

    #[test]
    fn mov_immediate_matches_known_encoding() {
        assert_eq!(encode("mov", &["r0", "#42"]), 0xe3a0_002a);
    }

    #[test]
    fn push_reg_list_sets_one_bit_per_register() {
        assert_eq!(encode("push", &["{r4, r5, r6}"]), 0xe92d_0070);
    }

    #[test]
    fn literal_pool_slot_is_deduplicated_across_loads() {
        let enc = Arm32Encoder::default();
        let a = enc.pool_slot("__wat_memory_base");
        let b = enc.pool_slot("other_symbol");
        let c = enc.pool_slot("__wat_memory_base");
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(enc.pool.borrow().len(), 2);
    }

    #[test]
    fn forward_branch_resolves_against_defined_label() {
        let enc = Arm32Encoder::default();
        let mut symbols = SymbolTable::default();
        symbols.define(Id::new("target".to_string()), 12);
        let word = enc.encode_word("b", &["target".to_string()], 0, &symbols, 0, false).unwrap();
        // (12 - 8) / 4 = 1
        assert_eq!(word & 0x00ff_ffff, 1);
    }
}
