//! Shared x86 encoder for the three x86 targets. `lower::x86_64`,
//! `lower::x86_32`, and `lower::x86_16` all emit the same instruction-text
//! shape (mnemonic plus comma-separated operands, `[reg+disp]` or
//! `[label]` memory operands, optional `byte`/`word`/`dword`/`qword`
//! size keywords), so one encoder handles all three, parameterized by
//! `Width`.
//!
//! x86-16 addressing is the one place this deliberately parts ways with
//! real 8086 machine code: this crate's x86-16 register schedule uses cx
//! and dx as base registers for spilled locals (`target::RegisterSchedule`),
//! which the 8086 ModRM encoding has no slot for (only bx, bp, si, di are
//! legal memory-operand bases on real hardware). Rather than restructure
//! the register schedule this late, the 16-bit encoder below assigns its
//! own rm-field numbering across all six address-capable registers. The
//! result decodes correctly with this assembler's own two passes but is
//! not real 8086 object code — see DESIGN.md.

use crate::asm::{parse_imm, CodeBuffer, InstrEncoder, SymbolTable};
use crate::diag::{CodegenError, Result};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Width {
    W64,
    W32,
    W16,
}

pub struct X86Encoder {
    width: Width,
}

impl X86Encoder {
    pub fn new(width: Width) -> Self {
        X86Encoder { width }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct RegInfo {
    num: u8,
    ext: bool,
    size: u8,
    needs_rex_low8: bool,
}

fn lookup_reg(name: &str) -> Option<RegInfo> {
    let r = |num, ext, size, needs_rex_low8| Some(RegInfo { num, ext, size, needs_rex_low8 });
    match name {
        "rax" => r(0, false, 64, false),
        "eax" => r(0, false, 32, false),
        "ax" => r(0, false, 16, false),
        "al" => r(0, false, 8, false),
        "rcx" => r(1, false, 64, false),
        "ecx" => r(1, false, 32, false),
        "cx" => r(1, false, 16, false),
        "cl" => r(1, false, 8, false),
        "rdx" => r(2, false, 64, false),
        "edx" => r(2, false, 32, false),
        "dx" => r(2, false, 16, false),
        "dl" => r(2, false, 8, false),
        "rbx" => r(3, false, 64, false),
        "ebx" => r(3, false, 32, false),
        "bx" => r(3, false, 16, false),
        "bl" => r(3, false, 8, false),
        "rsp" => r(4, false, 64, false),
        "esp" => r(4, false, 32, false),
        "sp" => r(4, false, 16, false),
        "spl" => r(4, false, 8, true),
        "rbp" => r(5, false, 64, false),
        "ebp" => r(5, false, 32, false),
        "bp" => r(5, false, 16, false),
        "bpl" => r(5, false, 8, true),
        "rsi" => r(6, false, 64, false),
        "esi" => r(6, false, 32, false),
        "si" => r(6, false, 16, false),
        "sil" => r(6, false, 8, true),
        "rdi" => r(7, false, 64, false),
        "edi" => r(7, false, 32, false),
        "di" => r(7, false, 16, false),
        "dil" => r(7, false, 8, true),
        "r8" => r(8, true, 64, false),
        "r8d" => r(8, true, 32, false),
        "r8b" => r(8, true, 8, false),
        "r9" => r(9, true, 64, false),
        "r9d" => r(9, true, 32, false),
        "r9b" => r(9, true, 8, false),
        "r10" => r(10, true, 64, false),
        "r10d" => r(10, true, 32, false),
        "r10b" => r(10, true, 8, false),
        "r11" => r(11, true, 64, false),
        "r11d" => r(11, true, 32, false),
        "r11b" => r(11, true, 8, false),
        "r12" => r(12, true, 64, false),
        "r12d" => r(12, true, 32, false),
        "r12b" => r(12, true, 8, false),
        "r13" => r(13, true, 64, false),
        "r13d" => r(13, true, 32, false),
        "r13b" => r(13, true, 8, false),
        "r14" => r(14, true, 64, false),
        "r14d" => r(14, true, 32, false),
        "r14b" => r(14, true, 8, false),
        "r15" => r(15, true, 64, false),
        "r15d" => r(15, true, 32, false),
        "r15b" => r(15, true, 8, false),
        _ => None,
    }
}

/// x86-16 has no ModRM slot for cx/dx as an address base; this assigns
/// each address-capable register its own rm code instead. rm=6 is
/// reserved for a bare `[label]` operand, mirroring how real 8086 ModRM
/// mod=00,rm=110 means "direct address" rather than "based on si".
fn addr16_rm(name: &str) -> Option<u8> {
    match name {
        "bx" => Some(0),
        "cx" => Some(1),
        "dx" => Some(2),
        "di" => Some(3),
        "si" => Some(4),
        "ax" => Some(5),
        _ => None,
    }
}

#[derive(Clone, Debug)]
enum Mem {
    Base { reg: String, disp: i32 },
    Label(String),
}

#[derive(Clone, Debug)]
enum Opnd {
    Reg(RegInfo),
    Imm(i64),
    /// The `Option<u8>` is the explicit `byte`/`word`/`dword`/`qword`
    /// hint, when the operand text carried one.
    Mem(Mem, Option<u8>),
    /// An identifier that isn't a register: a jump/call target or,
    /// combined with `Mem::Label`, resolved separately by context.
    Label(String),
}

fn parse_mem_inner(inner: &str) -> Option<Mem> {
    let inner = inner.trim();
    let bytes = inner.as_bytes();
    let mut split_at = None;
    for i in 1..bytes.len() {
        if bytes[i] == b'+' || bytes[i] == b'-' {
            split_at = Some(i);
            break;
        }
    }
    if let Some(i) = split_at {
        let base = inner[..i].trim().to_string();
        let disp: i32 = inner[i..].trim().parse().ok()?;
        return Some(Mem::Base { reg: base, disp });
    }
    Some(Mem::Label(inner.to_string()))
}

fn parse_operand(s: &str) -> Option<Opnd> {
    let s = s.trim();
    for (kw, bits) in [("qword", 64u8), ("dword", 32), ("word", 16), ("byte", 8)] {
        if let Some(rest) = s.strip_prefix(kw) {
            let rest = rest.trim();
            if let Some(inner) = rest.strip_prefix('[').and_then(|x| x.strip_suffix(']')) {
                return Some(Opnd::Mem(parse_mem_inner(inner)?, Some(bits)));
            }
        }
    }
    if let Some(inner) = s.strip_prefix('[').and_then(|x| x.strip_suffix(']')) {
        return Some(Opnd::Mem(parse_mem_inner(inner)?, None));
    }
    if let Some(v) = parse_imm(s) {
        return Some(Opnd::Imm(v));
    }
    if let Some(info) = lookup_reg(s) {
        return Some(Opnd::Reg(info));
    }
    Some(Opnd::Label(s.to_string()))
}

fn parse_err(line: usize, text: &str) -> CodegenError {
    CodegenError::AssemblyParseError { line, message: format!("cannot parse x86 operand `{text}`") }
}

fn operand_at(operands: &[String], i: usize, line: usize) -> Result<Opnd> {
    let text = operands.get(i).ok_or_else(|| parse_err(line, "<missing>"))?;
    parse_operand(text).ok_or_else(|| parse_err(line, text))
}

const ALU_MNEMONICS: &[(&str, u8)] = &[("add", 0), ("or", 1), ("adc", 2), ("sbb", 3), ("and", 4), ("sub", 5), ("xor", 6), ("cmp", 7)];

fn alu_digit(mnemonic: &str) -> Option<u8> {
    ALU_MNEMONICS.iter().find(|(m, _)| *m == mnemonic).map(|(_, d)| *d)
}

const SHIFT_MNEMONICS: &[(&str, u8)] = &[("rol", 0), ("ror", 1), ("shl", 4), ("sar", 7), ("shr", 5)];

fn shift_digit(mnemonic: &str) -> Option<u8> {
    SHIFT_MNEMONICS.iter().find(|(m, _)| *m == mnemonic).map(|(_, d)| *d)
}

fn cc_code(cc: &str) -> Option<u8> {
    Some(match cc {
        "o" => 0x0,
        "no" => 0x1,
        "b" | "c" => 0x2,
        "ae" | "nb" => 0x3,
        "e" | "z" => 0x4,
        "ne" | "nz" => 0x5,
        "be" => 0x6,
        "a" => 0x7,
        "s" => 0x8,
        "ns" => 0x9,
        "p" => 0xa,
        "np" => 0xb,
        "l" => 0xc,
        "ge" => 0xd,
        "le" => 0xe,
        "g" => 0xf,
        _ => return None,
    })
}

/// A ModRM(+SIB)(+disp) encoding, built without knowing label addresses
/// yet; `resolve` fills in the displacement for a `Mem::Label` operand
/// once addresses are known, which pass 1 never has.
struct ModRmShape {
    prefix_needs_addr_size_hack: bool,
    modrm: u8,
    sib: Option<u8>,
    disp_bytes: u8,
    disp_is_label: Option<String>,
    ext_x: bool,
    ext_b: bool,
}

impl X86Encoder {
    fn word_bits(&self) -> u8 {
        match self.width {
            Width::W64 => 64,
            Width::W32 => 32,
            Width::W16 => 16,
        }
    }

    /// The operand size implied when no explicit register/keyword pins
    /// it down (a bare `[label]` operand paired with an immediate, say).
    fn default_bits(&self) -> u8 {
        self.word_bits()
    }

    fn reg_field_and_rex(&self, info: RegInfo) -> (u8, bool, bool) {
        (info.num & 7, info.num >= 8, info.needs_rex_low8)
    }

    fn shape_for_mem(&self, mem: &Mem, reg_field: u8) -> Result<ModRmShape> {
        match (self.width, mem) {
            (Width::W16, Mem::Base { reg, disp }) => {
                let rm = addr16_rm(reg).ok_or_else(|| CodegenError::AssemblyParseError { line: 0, message: format!("`{reg}` cannot address memory on this target") })?;
                let (mode, disp_bytes) = if *disp == 0 && rm != 6 {
                    (0u8, 0u8)
                } else if *disp >= i8::MIN as i32 && *disp <= i8::MAX as i32 {
                    (1u8, 1u8)
                } else {
                    (2u8, 2u8)
                };
                Ok(ModRmShape {
                    prefix_needs_addr_size_hack: false,
                    modrm: (mode << 6) | (reg_field << 3) | rm,
                    sib: None,
                    disp_bytes,
                    disp_is_label: None,
                    ext_x: false,
                    ext_b: false,
                })
            }
            (Width::W16, Mem::Label(name)) => Ok(ModRmShape {
                prefix_needs_addr_size_hack: false,
                modrm: (0u8 << 6) | (reg_field << 3) | 6,
                sib: None,
                disp_bytes: 2,
                disp_is_label: Some(name.clone()),
                ext_x: false,
                ext_b: false,
            }),
            (_, Mem::Base { reg, disp }) => {
                let info = lookup_reg(reg).ok_or_else(|| CodegenError::AssemblyParseError { line: 0, message: format!("`{reg}` is not a register") })?;
                let base_low = info.num & 7;
                let force_disp8 = base_low == 5 && *disp == 0;
                let (mode, disp_bytes) = if *disp == 0 && !force_disp8 {
                    (0u8, 0u8)
                } else if *disp >= i8::MIN as i32 && *disp <= i8::MAX as i32 {
                    (1u8, 1u8)
                } else {
                    (2u8, 4u8)
                };
                if base_low == 4 {
                    Ok(ModRmShape {
                        prefix_needs_addr_size_hack: false,
                        modrm: (mode << 6) | (reg_field << 3) | 4,
                        sib: Some((0 << 6) | (4 << 3) | base_low),
                        disp_bytes,
                        disp_is_label: None,
                        ext_x: false,
                        ext_b: info.ext,
                    })
                } else {
                    Ok(ModRmShape {
                        prefix_needs_addr_size_hack: false,
                        modrm: (mode << 6) | (reg_field << 3) | base_low,
                        sib: None,
                        disp_bytes,
                        disp_is_label: None,
                        ext_x: false,
                        ext_b: info.ext,
                    })
                }
            }
            (Width::W32, Mem::Label(name)) => Ok(ModRmShape {
                prefix_needs_addr_size_hack: false,
                modrm: (0u8 << 6) | (reg_field << 3) | 5,
                sib: None,
                disp_bytes: 4,
                disp_is_label: Some(name.clone()),
                ext_x: false,
                ext_b: false,
            }),
            (Width::W64, Mem::Label(name)) => Ok(ModRmShape {
                prefix_needs_addr_size_hack: false,
                modrm: (0u8 << 6) | (reg_field << 3) | 4,
                sib: Some((0 << 6) | (4 << 3) | 5),
                disp_bytes: 4,
                disp_is_label: Some(name.clone()),
                ext_x: false,
                ext_b: false,
            }),
        }
    }

    fn shape_for_operand(&self, opnd: &Opnd, reg_field: u8) -> Result<(ModRmShape, bool)> {
        match opnd {
            Opnd::Reg(info) => Ok((
                ModRmShape {
                    prefix_needs_addr_size_hack: false,
                    modrm: (0b11 << 6) | (reg_field << 3) | (info.num & 7),
                    sib: None,
                    disp_bytes: 0,
                    disp_is_label: None,
                    ext_x: false,
                    ext_b: info.num >= 8,
                },
                info.needs_rex_low8,
            )),
            Opnd::Mem(m, _) => Ok((self.shape_for_mem(m, reg_field)?, false)),
            _ => Err(CodegenError::AssemblyParseError { line: 0, message: "expected register or memory operand".into() }),
        }
    }

    fn shape_len(&self, shape: &ModRmShape) -> usize {
        1 + shape.sib.map_or(0, |_| 1) + shape.disp_bytes as usize
    }

    fn write_shape(&self, buf: &mut CodeBuffer, shape: &ModRmShape, symbols: &SymbolTable) -> Result<()> {
        let _ = shape.prefix_needs_addr_size_hack;
        buf.push_u8(shape.modrm);
        if let Some(sib) = shape.sib {
            buf.push_u8(sib);
        }
        if let Some(name) = &shape.disp_is_label {
            let addr = crate::asm::resolve_symbol(symbols, name)?;
            match shape.disp_bytes {
                2 => buf.push_u16(addr as u16),
                4 => buf.push_u32(addr),
                _ => unreachable!(),
            }
        } else {
            match shape.disp_bytes {
                0 => {}
                1 => buf.push_u8(0),
                2 => buf.push_u16(0),
                4 => buf.push_u32(0),
                _ => unreachable!(),
            }
        }
        Ok(())
    }

    /// Re-derives `write_shape`'s displacement bytes, this time with the
    /// real value, for the non-label case (labels already carry their
    /// name and get resolved lazily in `write_shape`).
    fn write_shape_with_disp(&self, buf: &mut CodeBuffer, shape: &ModRmShape, disp: i32) {
        buf.push_u8(shape.modrm);
        if let Some(sib) = shape.sib {
            buf.push_u8(sib);
        }
        match shape.disp_bytes {
            0 => {}
            1 => buf.push_u8(disp as i8 as u8),
            2 => buf.push_u16(disp as i16 as u16),
            4 => buf.push_u32(disp as u32),
            _ => unreachable!(),
        }
    }

    fn rex(&self, w: bool, r: bool, x: bool, b: bool, force: bool) -> Option<u8> {
        if self.width != Width::W64 {
            return None;
        }
        if w || r || x || b || force {
            Some(0x40 | ((w as u8) << 3) | ((r as u8) << 2) | ((x as u8) << 1) | (b as u8))
        } else {
            None
        }
    }

    fn op_size_prefix(&self, requested_bits: u8) -> Option<u8> {
        // 0x66 toggles the default operand size in both directions:
        // 16-bit code with a 32-bit operand, or 32/64-bit code with a
        // 16-bit operand.
        let default_bits = if self.width == Width::W16 { 16 } else { 32 };
        if requested_bits == 16 && default_bits != 16 {
            Some(0x66)
        } else if requested_bits == 32 && default_bits == 16 {
            Some(0x66)
        } else {
            None
        }
    }

    fn encode_alu(&self, buf: &mut CodeBuffer, digit: u8, dst: &Opnd, src: &Opnd, symbols: &SymbolTable, disp_override: Option<i32>) -> Result<()> {
        match (dst, src) {
            (Opnd::Reg(_), Opnd::Imm(v)) | (Opnd::Mem(..), Opnd::Imm(v)) => self.encode_alu_imm(buf, digit, dst_bits(dst)?, dst, *v, symbols, disp_override),
            (_, Opnd::Reg(s)) => {
                let bits = s.size;
                if let Some(p) = self.op_size_prefix(bits) {
                    buf.push_u8(p);
                }
                let (shape, force8) = self.shape_for_operand(dst, s.num & 7)?;
                if let Some(rex) = self.rex(bits == 64, s.num >= 8, shape.ext_x, shape.ext_b, force8 || shape_needs_rex_low8(dst)) {
                    buf.push_u8(rex);
                }
                let opcode = (digit << 3) | if bits == 8 { 0 } else { 1 };
                buf.push_u8(opcode);
                self.write_shape_here(buf, &shape, symbols, disp_override)?;
                Ok(())
            }
            (Opnd::Reg(d), Opnd::Mem(_, _)) => {
                let bits = d.size;
                if let Some(p) = self.op_size_prefix(bits) {
                    buf.push_u8(p);
                }
                let (shape, _) = self.shape_for_operand(src, d.num & 7)?;
                if let Some(rex) = self.rex(bits == 64, d.num >= 8, shape.ext_x, shape.ext_b, false) {
                    buf.push_u8(rex);
                }
                let opcode = (digit << 3) | 3 - if bits == 8 { 1 } else { 0 };
                buf.push_u8(opcode);
                self.write_shape_here(buf, &shape, symbols, disp_override)?;
                Ok(())
            }
            _ => Err(CodegenError::AssemblyParseError { line: 0, message: "unsupported ALU operand shape".into() }),
        }
    }

    fn encode_alu_imm(&self, buf: &mut CodeBuffer, digit: u8, bits: u8, dst: &Opnd, v: i64, symbols: &SymbolTable, disp_override: Option<i32>) -> Result<()> {
        if let Some(p) = self.op_size_prefix(bits) {
            buf.push_u8(p);
        }
        let (shape, force8) = self.shape_for_operand(dst, digit)?;
        let dst_reg_num = if let Opnd::Reg(r) = dst { r.num } else { 0 };
        if let Some(rex) = self.rex(bits == 64, false, shape.ext_x, shape.ext_b, force8) {
            buf.push_u8(rex);
        }
        let _ = dst_reg_num;
        let fits8 = bits != 8 && v >= i8::MIN as i64 && v <= i8::MAX as i64;
        let opcode = if bits == 8 { 0x80 } else if fits8 { 0x83 } else { 0x81 };
        buf.push_u8(opcode);
        self.write_shape_here(buf, &shape, symbols, disp_override)?;
        match (bits, fits8) {
            (8, _) => buf.push_u8(v as i8 as u8),
            (_, true) => buf.push_u8(v as i8 as u8),
            (16, false) => buf.push_u16(v as i16 as u16),
            (_, false) => buf.push_u32(v as i32 as u32),
        }
        Ok(())
    }

    fn write_shape_here(&self, buf: &mut CodeBuffer, shape: &ModRmShape, symbols: &SymbolTable, disp_override: Option<i32>) -> Result<()> {
        match disp_override {
            Some(d) => {
                self.write_shape_with_disp(buf, shape, d);
                Ok(())
            }
            None => self.write_shape(buf, shape, symbols),
        }
    }
}

fn dst_bits(o: &Opnd) -> Result<u8> {
    match o {
        Opnd::Reg(r) => Ok(r.size),
        Opnd::Mem(_, Some(bits)) => Ok(*bits),
        Opnd::Mem(_, None) => Err(CodegenError::AssemblyParseError { line: 0, message: "bare memory ALU destination needs a size keyword".into() }),
        _ => Err(CodegenError::AssemblyParseError { line: 0, message: "not a valid ALU destination".into() }),
    }
}

fn shape_needs_rex_low8(o: &Opnd) -> bool {
    matches!(o, Opnd::Reg(r) if r.needs_rex_low8)
}

/// Instructions this crate's lowerers never emit a memory-only,
/// no-register form of get their size purely from the register operand
/// (no size keyword required); a bare `[label]` alongside another bare
/// `[label]` never happens in generated code.
fn width_of(operands: &[Opnd]) -> u8 {
    for o in operands {
        if let Opnd::Reg(r) = o {
            return r.size;
        }
    }
    32
}

impl InstrEncoder for X86Encoder {
    fn size(&self, mnemonic: &str, operands: &[String], line: usize) -> Result<usize> {
        let mut buf = CodeBuffer::default();
        let dummy = SymbolTable::default();
        // Sizing runs the real encoder against offset 0 with a permissive
        // symbol table standing in for "any real offset"; every encoded
        // form here has a fixed length regardless of the actual displacement
        // value (immediates and displacements are always emitted at their
        // pre-decided width), so the byte count is accurate even though the
        // bytes themselves are throwaway.
        self.encode_impl(&mut buf, mnemonic, operands, 0, &dummy, line, true)?;
        Ok(buf.len())
    }

    fn encode(&self, buf: &mut CodeBuffer, mnemonic: &str, operands: &[String], pc: u32, symbols: &SymbolTable, line: usize) -> Result<()> {
        self.encode_impl(buf, mnemonic, operands, pc, symbols, line, false)
    }
}

impl X86Encoder {
    fn encode_impl(&self, buf: &mut CodeBuffer, mnemonic: &str, operands: &[String], pc: u32, symbols: &SymbolTable, line: usize, sizing: bool) -> Result<()> {
        if mnemonic == "res" {
            let n = operands.first().and_then(|s| s.parse::<usize>().ok()).ok_or_else(|| parse_err(line, "res"))?;
            for _ in 0..n {
                buf.push_u8(0);
            }
            return Ok(());
        }

        if let Some(digit) = alu_digit(mnemonic) {
            let dst = operand_at(operands, 0, line)?;
            let src = operand_at(operands, 1, line)?;
            let disp_override = sizing.then_some(0);
            return self.encode_alu(buf, digit, &dst, &src, symbols, disp_override);
        }

        if let Some(digit) = shift_digit(mnemonic) {
            let dst = operand_at(operands, 0, line)?;
            let bits = dst_bits(&dst).unwrap_or_else(|_| self.default_bits());
            if let Some(p) = self.op_size_prefix(bits) {
                buf.push_u8(p);
            }
            let (shape, force8) = self.shape_for_operand(&dst, digit)?;
            let ext_b = if let Opnd::Reg(r) = &dst { r.num >= 8 } else { shape.ext_b };
            if let Some(rex) = self.rex(bits == 64, false, shape.ext_x, ext_b, force8) {
                buf.push_u8(rex);
            }
            buf.push_u8(if bits == 8 { 0xd2 } else { 0xd3 });
            self.write_shape_here(buf, &shape, symbols, sizing.then_some(0))?;
            return Ok(());
        }

        match mnemonic {
            "mov" => self.encode_mov(buf, operands, symbols, line, sizing),
            "movsx" | "movzx" => self.encode_movx(buf, mnemonic, operands, symbols, line, sizing),
            "movsxd" => self.encode_movsxd(buf, operands, symbols, line, sizing),
            "lea" => self.encode_lea(buf, operands, symbols, line, sizing),
            "push" => self.encode_push_pop(buf, operands, line, 0x50),
            "pop" => self.encode_push_pop(buf, operands, line, 0x58),
            "imul" => self.encode_imul(buf, operands, symbols, line, sizing),
            "idiv" | "div" => self.encode_div(buf, mnemonic, operands, line),
            "test" => self.encode_test(buf, operands, symbols, line, sizing),
            "cmp" => unreachable!("cmp is handled via alu_digit"),
            "cmovne" | "cmove" => self.encode_cmov(buf, mnemonic, operands, symbols, line, sizing),
            m if m.starts_with("set") => self.encode_setcc(buf, m, operands, line),
            m if (m.starts_with('j') && cc_code(&m[1..]).is_some()) || m == "jmp" => self.encode_jump(buf, m, operands, pc, symbols, line, sizing),
            "call" => self.encode_call(buf, operands, pc, symbols, line, sizing),
            "ret" => {
                buf.push_u8(0xc3);
                Ok(())
            }
            "nop" => {
                buf.push_u8(0x90);
                Ok(())
            }
            "ud2" => {
                buf.push_u8(0x0f);
                buf.push_u8(0x0b);
                Ok(())
            }
            "int3" => {
                buf.push_u8(0xcc);
                Ok(())
            }
            "cbw" => {
                buf.push_u8(0x66);
                buf.push_u8(0x98);
                Ok(())
            }
            "cwd" => {
                buf.push_u8(0x66);
                buf.push_u8(0x99);
                Ok(())
            }
            "cdq" => {
                buf.push_u8(0x99);
                Ok(())
            }
            "cqo" => {
                buf.push_u8(0x48);
                buf.push_u8(0x99);
                Ok(())
            }
            _ => Err(CodegenError::UnsupportedOpcode { opcode_index: line, name: mnemonic.to_string() }),
        }
    }

    fn encode_mov(&self, buf: &mut CodeBuffer, operands: &[String], symbols: &SymbolTable, line: usize, sizing: bool) -> Result<()> {
        let dst = operand_at(operands, 0, line)?;
        let src = operand_at(operands, 1, line)?;
        let disp_override = sizing.then_some(0);
        match (&dst, &src) {
            (Opnd::Reg(d), Opnd::Imm(v)) => {
                if let Some(p) = self.op_size_prefix(d.size) {
                    buf.push_u8(p);
                }
                if let Some(rex) = self.rex(d.size == 64, false, false, d.num >= 8, d.needs_rex_low8) {
                    buf.push_u8(rex);
                }
                let base = if d.size == 8 { 0xb0 } else { 0xb8 };
                buf.push_u8(base | (d.num & 7));
                match d.size {
                    8 => buf.push_u8(*v as i8 as u8),
                    16 => buf.push_u16(*v as i16 as u16),
                    32 => buf.push_u32(*v as i32 as u32),
                    64 => buf.push_u64(*v as u64),
                    _ => unreachable!(),
                }
                Ok(())
            }
            (Opnd::Mem(_, hint), Opnd::Imm(v)) => {
                let bits = hint.unwrap_or_else(|| self.default_bits());
                if let Some(p) = self.op_size_prefix(bits) {
                    buf.push_u8(p);
                }
                let (shape, _) = self.shape_for_operand(&dst, 0)?;
                if let Some(rex) = self.rex(bits == 64, false, shape.ext_x, shape.ext_b, false) {
                    buf.push_u8(rex);
                }
                buf.push_u8(if bits == 8 { 0xc6 } else { 0xc7 });
                self.write_shape_here(buf, &shape, symbols, disp_override)?;
                match bits {
                    8 => buf.push_u8(*v as i8 as u8),
                    16 => buf.push_u16(*v as i16 as u16),
                    _ => buf.push_u32(*v as i32 as u32),
                }
                Ok(())
            }
            (_, Opnd::Reg(s)) => {
                if let Some(p) = self.op_size_prefix(s.size) {
                    buf.push_u8(p);
                }
                let (shape, force8) = self.shape_for_operand(&dst, s.num & 7)?;
                if let Some(rex) = self.rex(s.size == 64, s.num >= 8, shape.ext_x, shape.ext_b, force8 || shape_needs_rex_low8(&dst)) {
                    buf.push_u8(rex);
                }
                buf.push_u8(if s.size == 8 { 0x88 } else { 0x89 });
                self.write_shape_here(buf, &shape, symbols, disp_override)
            }
            (Opnd::Reg(d), Opnd::Mem(_, _)) => {
                if let Some(p) = self.op_size_prefix(d.size) {
                    buf.push_u8(p);
                }
                let (shape, _) = self.shape_for_operand(&src, d.num & 7)?;
                if let Some(rex) = self.rex(d.size == 64, d.num >= 8, shape.ext_x, shape.ext_b, d.needs_rex_low8) {
                    buf.push_u8(rex);
                }
                buf.push_u8(if d.size == 8 { 0x8a } else { 0x8b });
                self.write_shape_here(buf, &shape, symbols, disp_override)
            }
            _ => Err(parse_err(line, "mov")),
        }
    }

    fn encode_movx(&self, buf: &mut CodeBuffer, mnemonic: &str, operands: &[String], symbols: &SymbolTable, line: usize, sizing: bool) -> Result<()> {
        let dst = operand_at(operands, 0, line)?;
        let src_text = operands.get(1).ok_or_else(|| parse_err(line, mnemonic))?;
        let src_bits = if src_text.trim_start().starts_with("byte") { 8 } else { 16 };
        let src = parse_operand(src_text).ok_or_else(|| parse_err(line, src_text))?;
        let d = match &dst {
            Opnd::Reg(r) => *r,
            _ => return Err(parse_err(line, mnemonic)),
        };
        if let Some(rex) = self.rex(d.size == 64, d.num >= 8, false, false, false) {
            buf.push_u8(rex);
        }
        buf.push_u8(0x0f);
        let op = match (mnemonic, src_bits) {
            ("movzx", 8) => 0xb6,
            ("movzx", _) => 0xb7,
            ("movsx", 8) => 0xbe,
            (_, _) => 0xbf,
        };
        buf.push_u8(op);
        let (shape, _) = self.shape_for_operand(&src, d.num & 7)?;
        self.write_shape_here(buf, &shape, symbols, sizing.then_some(0))
    }

    fn encode_movsxd(&self, buf: &mut CodeBuffer, operands: &[String], symbols: &SymbolTable, line: usize, sizing: bool) -> Result<()> {
        let dst = operand_at(operands, 0, line)?;
        let src = operand_at(operands, 1, line)?;
        let d = match &dst {
            Opnd::Reg(r) => *r,
            _ => return Err(parse_err(line, "movsxd")),
        };
        if let Some(rex) = self.rex(true, d.num >= 8, false, false, false) {
            buf.push_u8(rex);
        }
        buf.push_u8(0x63);
        let (shape, _) = self.shape_for_operand(&src, d.num & 7)?;
        self.write_shape_here(buf, &shape, symbols, sizing.then_some(0))
    }

    fn encode_lea(&self, buf: &mut CodeBuffer, operands: &[String], symbols: &SymbolTable, line: usize, sizing: bool) -> Result<()> {
        let dst = operand_at(operands, 0, line)?;
        let src = operand_at(operands, 1, line)?;
        let d = match &dst {
            Opnd::Reg(r) => *r,
            _ => return Err(parse_err(line, "lea")),
        };
        if let Some(p) = self.op_size_prefix(d.size) {
            buf.push_u8(p);
        }
        let (shape, _) = self.shape_for_operand(&src, d.num & 7)?;
        if let Some(rex) = self.rex(d.size == 64, d.num >= 8, shape.ext_x, shape.ext_b, false) {
            buf.push_u8(rex);
        }
        buf.push_u8(0x8d);
        self.write_shape_here(buf, &shape, symbols, sizing.then_some(0))
    }

    fn encode_push_pop(&self, buf: &mut CodeBuffer, operands: &[String], line: usize, base: u8) -> Result<()> {
        let o = operand_at(operands, 0, line)?;
        match o {
            Opnd::Reg(r) => {
                if let Some(rex) = self.rex(false, false, false, r.num >= 8, false) {
                    buf.push_u8(rex);
                }
                buf.push_u8(base | (r.num & 7));
                Ok(())
            }
            _ => Err(parse_err(line, "push/pop")),
        }
    }

    fn encode_imul(&self, buf: &mut CodeBuffer, operands: &[String], symbols: &SymbolTable, line: usize, sizing: bool) -> Result<()> {
        let dst = operand_at(operands, 0, line)?;
        let src = operand_at(operands, 1, line)?;
        let d = match &dst {
            Opnd::Reg(r) => *r,
            _ => return Err(parse_err(line, "imul")),
        };
        if let Some(p) = self.op_size_prefix(d.size) {
            buf.push_u8(p);
        }
        let (shape, _) = self.shape_for_operand(&src, d.num & 7)?;
        if let Some(rex) = self.rex(d.size == 64, d.num >= 8, shape.ext_x, shape.ext_b, false) {
            buf.push_u8(rex);
        }
        buf.push_u8(0x0f);
        buf.push_u8(0xaf);
        self.write_shape_here(buf, &shape, symbols, sizing.then_some(0))
    }

    fn encode_div(&self, buf: &mut CodeBuffer, mnemonic: &str, operands: &[String], line: usize) -> Result<()> {
        let o = operand_at(operands, 0, line)?;
        let r = match o {
            Opnd::Reg(r) => r,
            _ => return Err(parse_err(line, mnemonic)),
        };
        if let Some(p) = self.op_size_prefix(r.size) {
            buf.push_u8(p);
        }
        if let Some(rex) = self.rex(r.size == 64, false, false, r.num >= 8, false) {
            buf.push_u8(rex);
        }
        buf.push_u8(if r.size == 8 { 0xf6 } else { 0xf7 });
        let digit = if mnemonic == "idiv" { 7 } else { 6 };
        buf.push_u8((0b11 << 6) | (digit << 3) | (r.num & 7));
        Ok(())
    }

    fn encode_test(&self, buf: &mut CodeBuffer, operands: &[String], symbols: &SymbolTable, line: usize, sizing: bool) -> Result<()> {
        let dst = operand_at(operands, 0, line)?;
        let src = operand_at(operands, 1, line)?;
        match (&dst, &src) {
            (Opnd::Reg(d), Opnd::Imm(v)) => {
                if let Some(p) = self.op_size_prefix(d.size) {
                    buf.push_u8(p);
                }
                if let Some(rex) = self.rex(d.size == 64, false, false, d.num >= 8, d.needs_rex_low8) {
                    buf.push_u8(rex);
                }
                buf.push_u8(if d.size == 8 { 0xf6 } else { 0xf7 });
                buf.push_u8((0b11 << 6) | (0 << 3) | (d.num & 7));
                match d.size {
                    8 => buf.push_u8(*v as i8 as u8),
                    16 => buf.push_u16(*v as i16 as u16),
                    _ => buf.push_u32(*v as i32 as u32),
                }
                Ok(())
            }
            (Opnd::Mem(_, hint), Opnd::Imm(v)) => {
                let bits = hint.unwrap_or_else(|| self.default_bits());
                if let Some(p) = self.op_size_prefix(bits) {
                    buf.push_u8(p);
                }
                let (shape, _) = self.shape_for_operand(&dst, 0)?;
                if let Some(rex) = self.rex(bits == 64, false, shape.ext_x, shape.ext_b, false) {
                    buf.push_u8(rex);
                }
                buf.push_u8(if bits == 8 { 0xf6 } else { 0xf7 });
                self.write_shape_here(buf, &shape, symbols, sizing.then_some(0))?;
                match bits {
                    8 => buf.push_u8(*v as i8 as u8),
                    16 => buf.push_u16(*v as i16 as u16),
                    _ => buf.push_u32(*v as i32 as u32),
                }
                Ok(())
            }
            (_, Opnd::Reg(s)) => {
                if let Some(p) = self.op_size_prefix(s.size) {
                    buf.push_u8(p);
                }
                let (shape, force8) = self.shape_for_operand(&dst, s.num & 7)?;
                if let Some(rex) = self.rex(s.size == 64, s.num >= 8, shape.ext_x, shape.ext_b, force8) {
                    buf.push_u8(rex);
                }
                buf.push_u8(if s.size == 8 { 0x84 } else { 0x85 });
                self.write_shape_here(buf, &shape, symbols, sizing.then_some(0))
            }
            _ => Err(parse_err(line, "test")),
        }
    }

    fn encode_cmov(&self, buf: &mut CodeBuffer, mnemonic: &str, operands: &[String], symbols: &SymbolTable, line: usize, sizing: bool) -> Result<()> {
        let dst = operand_at(operands, 0, line)?;
        let src = operand_at(operands, 1, line)?;
        let d = match &dst {
            Opnd::Reg(r) => *r,
            _ => return Err(parse_err(line, mnemonic)),
        };
        if let Some(p) = self.op_size_prefix(d.size) {
            buf.push_u8(p);
        }
        let (shape, _) = self.shape_for_operand(&src, d.num & 7)?;
        if let Some(rex) = self.rex(d.size == 64, d.num >= 8, shape.ext_x, shape.ext_b, false) {
            buf.push_u8(rex);
        }
        buf.push_u8(0x0f);
        let cc = cc_code(&mnemonic[4..]).unwrap_or(if mnemonic == "cmovne" { 0x5 } else { 0x4 });
        buf.push_u8(0x40 | cc);
        self.write_shape_here(buf, &shape, symbols, sizing.then_some(0))
    }

    fn encode_setcc(&self, buf: &mut CodeBuffer, mnemonic: &str, operands: &[String], line: usize) -> Result<()> {
        let cc = cc_code(&mnemonic[3..]).ok_or_else(|| parse_err(line, mnemonic))?;
        let o = operand_at(operands, 0, line)?;
        let r = match o {
            Opnd::Reg(r) => r,
            _ => return Err(parse_err(line, mnemonic)),
        };
        if let Some(rex) = self.rex(false, false, false, r.num >= 8, r.needs_rex_low8) {
            buf.push_u8(rex);
        }
        buf.push_u8(0x0f);
        buf.push_u8(0x90 | cc);
        buf.push_u8((0b11 << 6) | (0 << 3) | (r.num & 7));
        Ok(())
    }

    fn encode_jump(&self, buf: &mut CodeBuffer, mnemonic: &str, operands: &[String], pc: u32, symbols: &SymbolTable, line: usize, sizing: bool) -> Result<()> {
        let target = operands.first().ok_or_else(|| parse_err(line, mnemonic))?;
        let is_jmp = mnemonic == "jmp";
        let (opcode_len, rel) = if sizing {
            (if is_jmp { 5 } else { 6 }, 0i64)
        } else {
            let addr = crate::asm::resolve_symbol(symbols, target)? as i64;
            let instr_len = if is_jmp { 5 } else { 6 };
            (instr_len, addr - (pc as i64 + instr_len as i64))
        };
        if is_jmp {
            buf.push_u8(0xe9);
        } else {
            buf.push_u8(0x0f);
            buf.push_u8(0x80 | cc_code(&mnemonic[1..]).ok_or_else(|| parse_err(line, mnemonic))?);
        }
        if !(i32::MIN as i64..=i32::MAX as i64).contains(&rel) {
            return Err(CodegenError::EncodingOutOfRange { label: target.clone(), delta: rel, permitted: "i32".into() });
        }
        buf.push_u32(rel as i32 as u32);
        let _ = opcode_len;
        Ok(())
    }

    fn encode_call(&self, buf: &mut CodeBuffer, operands: &[String], pc: u32, symbols: &SymbolTable, line: usize, sizing: bool) -> Result<()> {
        let target_text = operands.first().ok_or_else(|| parse_err(line, "call"))?;
        if let Some(info) = lookup_reg(target_text) {
            if let Some(rex) = self.rex(false, false, false, info.num >= 8, false) {
                buf.push_u8(rex);
            }
            buf.push_u8(0xff);
            buf.push_u8((0b11 << 6) | (2 << 3) | (info.num & 7));
            return Ok(());
        }
        let rel = if sizing {
            0
        } else {
            let addr = crate::asm::resolve_symbol(symbols, target_text)? as i64;
            addr - (pc as i64 + 5)
        };
        buf.push_u8(0xe8);
        if !(i32::MIN as i64..=i32::MAX as i64).contains(&rel) {
            return Err(CodegenError::EncodingOutOfRange { label: target_text.clone(), delta: rel, permitted: "i32".into() });
        }
        buf.push_u32(rel as i32 as u32);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::assemble;
    use crate::target::Target;

    #[test]
    fn ret_is_a_single_byte() {
        let out = assemble(Target::X86_64, "ret\n").unwrap();
        assert_eq!(out, vec![0xc3]);
    }

    #[test]
    fn push_pop_extended_register_needs_rex() {
        let out = assemble(Target::X86_64, "push r12\npop r12\n").unwrap();
        assert_eq!(out, vec![0x41, 0x54, 0x41, 0x5c]);
    }

    #[test]
    fn mov_reg_imm32_encodes_as_b8_plus_reg() {
        let out = assemble(Target::X86_32, "mov eax, 5\n").unwrap();
        assert_eq!(out, vec![0xb8, 5, 0, 0, 0]);
    }

    #[test]
    fn near_jump_resolves_forward_label() {
        let text = "jmp target\nnop\ntarget:\nret\n";
        let out = assemble(Target::X86_64, text).unwrap();
        assert_eq!(&out[0..1], &[0xe9]);
        assert_eq!(&out[5..6], &[0x90]);
        assert_eq!(&out[6..7], &[0xc3]);
    }

    #[test]
    fn undefined_label_is_rejected() {
        let err = assemble(Target::X86_64, "jmp nowhere\n").unwrap_err();
        assert!(matches!(err, CodegenError::UndefinedLabel { .. }));
    }
}
