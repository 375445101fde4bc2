//! Length decoder for the x86-64 instruction forms that reach the installer.
//!
//! This is not a disassembler. It understands legacy prefixes, REX, the
//! one- and two-byte opcodes the code generators emit, ModR/M + SIB and
//! displacement/immediate sizes. That is enough to find the end of an
//! instruction and the location of its patchable operand.

use crate::error::ContractViolation;

use super::codebuf::{read_i32, read_u32};
use super::reloc::OperandFormat;

/// Broad classification used by the installer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstKind {
    /// `call rel32`
    Call,
    /// `jmp rel32` or `jmp rel8`
    Jump,
    /// `jcc rel32` or `jcc rel8`
    CondJump,
    /// `mov r64, imm64`
    MovLiteral64,
    /// `call r/m64`
    CallReg,
    /// `jmp r/m64`
    JumpReg,
    /// `test r/m32, r32` reading memory (safepoint polls)
    TestMem,
    Other,
}

/// Position and width of an operand field, as an absolute offset into the
/// code section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub offset: usize,
    pub size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
    pub start: usize,
    pub len: usize,
    pub kind: InstKind,
    /// ModR/M displacement.
    pub disp: Option<Field>,
    /// True when `disp` is relative to the next instruction.
    pub rip_relative: bool,
    /// Immediate operand.
    pub imm: Option<Field>,
    /// Branch displacement.
    pub rel: Option<Field>,
    /// ModR/M reg field (opcode extension for group opcodes).
    pub reg_field: Option<u8>,
}

impl Decoded {
    /// Offset of the following instruction.
    pub fn next(&self) -> usize {
        self.start + self.len
    }

    /// Locate the operand of the given format.
    pub fn operand(&self, format: OperandFormat) -> Result<Field, ContractViolation> {
        let found = match format {
            OperandFormat::Imm => self.imm.filter(|f| f.size == 8),
            OperandFormat::NarrowOop => self.imm.filter(|f| f.size == 4),
            OperandFormat::Disp32 => self.disp.filter(|f| f.size == 4 && self.rip_relative),
            OperandFormat::Call32 => self.rel.filter(|f| f.size == 4),
        };
        found.ok_or(ContractViolation::OperandMismatch {
            offset: self.start as u32,
            format,
        })
    }

    /// Absolute offset (within the section) a branch lands on.
    pub fn branch_target(&self, code: &[u8]) -> Option<i64> {
        let rel = self.rel?;
        let value = match rel.size {
            1 => code[rel.offset] as i8 as i64,
            _ => read_i32(code, rel.offset) as i64,
        };
        Some(self.next() as i64 + value)
    }

    pub fn read_imm32(&self, code: &[u8]) -> Option<u32> {
        self.imm.filter(|f| f.size == 4).map(|f| read_u32(code, f.offset))
    }
}

struct Cursor<'a> {
    code: &'a [u8],
    start: usize,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn next_byte(&mut self) -> Result<u8, ContractViolation> {
        let byte = *self.code.get(self.pos).ok_or(ContractViolation::OffsetOutOfBounds {
            offset: self.start as u32,
            len: self.code.len(),
        })?;
        self.pos += 1;
        Ok(byte)
    }

    fn field(&mut self, size: usize) -> Result<Field, ContractViolation> {
        let offset = self.pos;
        if offset + size > self.code.len() {
            return Err(ContractViolation::OffsetOutOfBounds {
                offset: self.start as u32,
                len: self.code.len(),
            });
        }
        self.pos += size;
        Ok(Field { offset, size })
    }

    fn undecodable(&self, byte: u8) -> ContractViolation {
        ContractViolation::UndecodableInstruction {
            offset: self.start as u32,
            byte,
        }
    }
}

/// Parsed ModR/M tail.
struct ModRm {
    reg: u8,
    /// Addresses memory rather than naming a register.
    memory: bool,
    disp: Option<Field>,
    rip_relative: bool,
}

fn decode_modrm(cur: &mut Cursor) -> Result<ModRm, ContractViolation> {
    let modrm = cur.next_byte()?;
    let mode = modrm >> 6;
    let reg = (modrm >> 3) & 0x7;
    let rm = modrm & 0x7;

    if mode == 0b11 {
        return Ok(ModRm {
            reg,
            memory: false,
            disp: None,
            rip_relative: false,
        });
    }

    let mut disp_size = match mode {
        0b01 => 1,
        0b10 => 4,
        _ => 0,
    };
    let mut rip_relative = false;

    if rm == 0b100 {
        let sib = cur.next_byte()?;
        if mode == 0b00 && sib & 0x7 == 0b101 {
            disp_size = 4;
        }
    } else if mode == 0b00 && rm == 0b101 {
        disp_size = 4;
        rip_relative = true;
    }

    let disp = if disp_size > 0 {
        Some(cur.field(disp_size)?)
    } else {
        None
    };
    Ok(ModRm {
        reg,
        memory: true,
        disp,
        rip_relative,
    })
}

/// Decode the instruction starting at `offset`.
pub fn decode(code: &[u8], offset: usize) -> Result<Decoded, ContractViolation> {
    let mut cur = Cursor {
        code,
        start: offset,
        pos: offset,
    };

    let mut opsize16 = false;
    let mut byte = cur.next_byte()?;
    while matches!(byte, 0x66 | 0xF2 | 0xF3) {
        opsize16 |= byte == 0x66;
        byte = cur.next_byte()?;
    }

    let mut rex_w = false;
    if (0x40..=0x4F).contains(&byte) {
        rex_w = byte & 0x08 != 0;
        byte = cur.next_byte()?;
    }

    let imm_z = if opsize16 { 2 } else { 4 };

    let mut kind = InstKind::Other;
    let mut modrm = None;
    let mut imm = None;
    let mut rel = None;

    match byte {
        0x0F => {
            let op2 = cur.next_byte()?;
            match op2 {
                0x80..=0x8F => {
                    kind = InstKind::CondJump;
                    rel = Some(cur.field(4)?);
                }
                0x10 | 0x11 | 0x1F | 0x28 | 0x29 | 0x2A | 0x2C | 0x2D | 0x2E | 0x2F
                | 0x40..=0x4F | 0x51 | 0x54 | 0x57 | 0x58 | 0x59 | 0x5A | 0x5C | 0x5E
                | 0x6E | 0x7E | 0x90..=0x9F | 0xAF | 0xB6 | 0xB7 | 0xBE | 0xBF | 0xD6 => {
                    modrm = Some(decode_modrm(&mut cur)?);
                }
                _ => return Err(cur.undecodable(op2)),
            }
        }
        0xE8 => {
            kind = InstKind::Call;
            rel = Some(cur.field(4)?);
        }
        0xE9 => {
            kind = InstKind::Jump;
            rel = Some(cur.field(4)?);
        }
        0xEB => {
            kind = InstKind::Jump;
            rel = Some(cur.field(1)?);
        }
        0x70..=0x7F => {
            kind = InstKind::CondJump;
            rel = Some(cur.field(1)?);
        }
        0xB8..=0xBF => {
            if rex_w {
                kind = InstKind::MovLiteral64;
                imm = Some(cur.field(8)?);
            } else {
                imm = Some(cur.field(imm_z)?);
            }
        }
        0xFF => {
            let m = decode_modrm(&mut cur)?;
            match m.reg {
                2 => kind = InstKind::CallReg,
                4 => kind = InstKind::JumpReg,
                0 | 1 | 6 => {}
                _ => return Err(cur.undecodable(byte)),
            }
            modrm = Some(m);
        }
        // ALU r/m forms: op r/m, r and op r, r/m
        0x00..=0x3F if byte & 0x7 < 4 => {
            modrm = Some(decode_modrm(&mut cur)?);
        }
        // ALU accumulator-immediate forms
        0x00..=0x3F if byte & 0x7 == 4 => {
            imm = Some(cur.field(1)?);
        }
        0x00..=0x3F if byte & 0x7 == 5 => {
            imm = Some(cur.field(imm_z)?);
        }
        0x85 => {
            let m = decode_modrm(&mut cur)?;
            if m.memory {
                kind = InstKind::TestMem;
            }
            modrm = Some(m);
        }
        0x63 | 0x84 | 0x86..=0x8B | 0x8D | 0xD1 | 0xD3 => {
            modrm = Some(decode_modrm(&mut cur)?);
        }
        0x80 | 0x83 | 0xC0 | 0xC1 | 0xC6 => {
            modrm = Some(decode_modrm(&mut cur)?);
            imm = Some(cur.field(1)?);
        }
        0x81 | 0xC7 => {
            modrm = Some(decode_modrm(&mut cur)?);
            imm = Some(cur.field(imm_z)?);
        }
        0xF7 => {
            let m = decode_modrm(&mut cur)?;
            if m.reg == 0 {
                imm = Some(cur.field(imm_z)?);
            }
            modrm = Some(m);
        }
        0xA8 | 0x6A => {
            imm = Some(cur.field(1)?);
        }
        0xA9 | 0x68 => {
            imm = Some(cur.field(imm_z)?);
        }
        0x50..=0x5F | 0x90 | 0x99 | 0xC3 | 0xCC | 0xF4 => {}
        _ => return Err(cur.undecodable(byte)),
    }

    let (disp, rip_relative, reg_field) = match modrm {
        Some(m) => (m.disp, m.rip_relative, Some(m.reg)),
        None => (None, false, None),
    };

    Ok(Decoded {
        start: offset,
        len: cur.pos - offset,
        kind,
        disp,
        rip_relative,
        imm,
        rel,
        reg_field,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::codebuf::CodeBuffer;
    use crate::jit::x86_64::{Cond, Reg, X86_64Assembler, Xmm};

    fn one(f: impl FnOnce(&mut X86_64Assembler)) -> (Vec<u8>, Decoded) {
        let mut buf = CodeBuffer::new();
        let mut asm = X86_64Assembler::new(&mut buf);
        f(&mut asm);
        let code = buf.into_code();
        let d = decode(&code, 0).unwrap();
        assert_eq!(d.len, code.len(), "length of {:02x?}", code);
        (code, d)
    }

    #[test]
    fn test_call_and_jumps() {
        let (_, d) = one(|a| a.call_rel32(0));
        assert_eq!(d.kind, InstKind::Call);
        assert_eq!(d.rel, Some(Field { offset: 1, size: 4 }));

        let (_, d) = one(|a| a.jmp_rel32(0));
        assert_eq!(d.kind, InstKind::Jump);

        let (_, d) = one(|a| a.jcc_rel32(Cond::L, 0));
        assert_eq!(d.kind, InstKind::CondJump);
        assert_eq!(d.rel, Some(Field { offset: 2, size: 4 }));

        let (_, d) = one(|a| a.jcc_rel8(Cond::E, 0));
        assert_eq!(d.kind, InstKind::CondJump);
        assert_eq!(d.len, 2);
    }

    #[test]
    fn test_mov_literal64() {
        let (_, d) = one(|a| a.mov_ri64(Reg::R10, 0x1234));
        assert_eq!(d.kind, InstKind::MovLiteral64);
        assert_eq!(d.operand(OperandFormat::Imm).unwrap(), Field { offset: 2, size: 8 });
        assert!(d.operand(OperandFormat::NarrowOop).is_err());
    }

    #[test]
    fn test_narrow_immediate() {
        let (code, d) = one(|a| a.mov_r32_imm32(Reg::Rax, 0xCAFE));
        assert_eq!(d.kind, InstKind::Other);
        assert_eq!(d.read_imm32(&code), Some(0xCAFE));

        let (_, d) = one(|a| a.cmp_r32_imm32(Reg::R9, 1));
        assert_eq!(d.operand(OperandFormat::NarrowOop).unwrap().size, 4);
    }

    #[test]
    fn test_register_call() {
        let (_, d) = one(|a| a.call_r(Reg::R10));
        assert_eq!(d.kind, InstKind::CallReg);
        assert_eq!(d.len, 3);

        let (_, d) = one(|a| a.jmp_m(Reg::Rbx, 0x18));
        assert_eq!(d.kind, InstKind::JumpReg);
    }

    #[test]
    fn test_rip_relative_operands() {
        let (_, d) = one(|a| a.mov_rip(Reg::Rax, 0));
        assert!(d.rip_relative);
        assert_eq!(d.operand(OperandFormat::Disp32).unwrap(), Field { offset: 3, size: 4 });

        let (_, d) = one(|a| a.movsd_rip(Xmm::Xmm3, 0));
        assert_eq!(d.len, 8);
        assert!(d.rip_relative);

        let (_, d) = one(|a| a.poll_near(0));
        assert_eq!(d.operand(OperandFormat::Disp32).unwrap().offset, 2);

        // base+disp is not a data reference
        let (_, d) = one(|a| a.mov_rm(Reg::Rax, Reg::Rbp, 0x100));
        assert!(d.operand(OperandFormat::Disp32).is_err());
    }

    #[test]
    fn test_poll_forms() {
        let (_, d) = one(|a| a.poll_far(Reg::R10));
        assert_eq!(d.kind, InstKind::TestMem);
        assert!(!d.rip_relative);

        let (_, d) = one(|a| a.poll_near(0));
        assert_eq!(d.kind, InstKind::TestMem);
        assert!(d.rip_relative);

        let (_, d) = one(|a| a.test_rr(Reg::Rax, Reg::Rax));
        assert_eq!(d.kind, InstKind::Other);
    }

    #[test]
    fn test_generator_forms_have_expected_length() {
        one(|a| a.mov_rm(Reg::Rax, Reg::Rsp, 8));
        one(|a| a.mov_mr(Reg::R12, 0x200, Reg::R15));
        one(|a| a.mov_m32_imm32(Reg::R15, 8, 2));
        one(|a| a.lea(Reg::Rdx, Reg::Rbp, -8));
        one(|a| a.cmov(Cond::E, Reg::Rdx, Reg::Rax));
        one(|a| a.sub_ri32(Reg::Rsp, 0x1000));
        one(|a| a.and_ri32(Reg::Rsp, -16));
        one(|a| a.cmp_rm(Reg::R10, Reg::Rax, 8));
        one(|a| a.test_rr(Reg::Rax, Reg::Rax));
        one(|a| a.xor_rr(Reg::Rax, Reg::Rax));
        one(|a| a.poll_far(Reg::R10));
        one(|a| a.push(Reg::R13));
        one(|a| a.setcc(Cond::Ne, Reg::Rax));
        one(|a| a.movzx_r64_r8(Reg::Rax, Reg::Rax));
        one(|a| a.movsd_store(Reg::Rsp, 8, Xmm::Xmm9));
        one(|a| a.cmp_r8_zero(Reg::Rax));
        one(|a| a.ret());
    }

    #[test]
    fn test_branch_target() {
        let mut code = vec![0x90; 4];
        code.extend_from_slice(&[0xE9, 0xF7, 0xFF, 0xFF, 0xFF]); // jmp -9
        let d = decode(&code, 4).unwrap();
        assert_eq!(d.branch_target(&code), Some(0));
    }

    #[test]
    fn test_truncated_and_unknown() {
        assert!(matches!(
            decode(&[0xE8, 0x00], 0),
            Err(ContractViolation::OffsetOutOfBounds { offset: 0, .. })
        ));
        assert_eq!(
            decode(&[0x0F, 0x0B], 0),
            Err(ContractViolation::UndecodableInstruction { offset: 0, byte: 0x0B })
        );
        assert!(decode(&[], 0).is_err());
    }
}
