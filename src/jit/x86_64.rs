//! x86-64 instruction encoding.
//!
//! This module provides functions for encoding the x86-64 instruction
//! forms used by the runtime stubs, adapters and native wrappers, and the
//! call/poll/load forms the installer knows how to patch.

use super::codebuf::CodeBuffer;

/// x86-64 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    /// All registers in encoding order.
    pub const ALL: [Reg; 16] = [
        Reg::Rax,
        Reg::Rcx,
        Reg::Rdx,
        Reg::Rbx,
        Reg::Rsp,
        Reg::Rbp,
        Reg::Rsi,
        Reg::Rdi,
        Reg::R8,
        Reg::R9,
        Reg::R10,
        Reg::R11,
        Reg::R12,
        Reg::R13,
        Reg::R14,
        Reg::R15,
    ];

    /// Get the register code (lower 3 bits).
    pub fn code(self) -> u8 {
        (self as u8) & 0x7
    }

    /// Check if this register requires REX.B or REX.R extension.
    pub fn needs_rex_ext(self) -> bool {
        (self as u8) >= 8
    }

    /// Get the REX.B bit for this register (when used as base/rm).
    pub fn rex_b(self) -> u8 {
        if self.needs_rex_ext() { 0x01 } else { 0x00 }
    }

    /// Get the REX.R bit for this register (when used as reg).
    pub fn rex_r(self) -> u8 {
        if self.needs_rex_ext() { 0x04 } else { 0x00 }
    }

    pub fn name(self) -> &'static str {
        const NAMES: [&str; 16] = [
            "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11",
            "r12", "r13", "r14", "r15",
        ];
        NAMES[self as usize]
    }
}

/// x86-64 SSE registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Xmm {
    Xmm0 = 0,
    Xmm1 = 1,
    Xmm2 = 2,
    Xmm3 = 3,
    Xmm4 = 4,
    Xmm5 = 5,
    Xmm6 = 6,
    Xmm7 = 7,
    Xmm8 = 8,
    Xmm9 = 9,
    Xmm10 = 10,
    Xmm11 = 11,
    Xmm12 = 12,
    Xmm13 = 13,
    Xmm14 = 14,
    Xmm15 = 15,
}

impl Xmm {
    pub const ALL: [Xmm; 16] = [
        Xmm::Xmm0,
        Xmm::Xmm1,
        Xmm::Xmm2,
        Xmm::Xmm3,
        Xmm::Xmm4,
        Xmm::Xmm5,
        Xmm::Xmm6,
        Xmm::Xmm7,
        Xmm::Xmm8,
        Xmm::Xmm9,
        Xmm::Xmm10,
        Xmm::Xmm11,
        Xmm::Xmm12,
        Xmm::Xmm13,
        Xmm::Xmm14,
        Xmm::Xmm15,
    ];

    pub fn code(self) -> u8 {
        (self as u8) & 0x7
    }

    pub fn needs_rex_ext(self) -> bool {
        (self as u8) >= 8
    }
}

/// x86-64 condition codes (for Jcc, SETcc, CMOVcc).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    O = 0x0,  // Overflow
    No = 0x1, // Not overflow
    B = 0x2,  // Below (unsigned <)
    Ae = 0x3, // Above or equal (unsigned >=)
    E = 0x4,  // Equal
    Ne = 0x5, // Not equal
    Be = 0x6, // Below or equal (unsigned <=)
    A = 0x7,  // Above (unsigned >)
    S = 0x8,  // Sign (negative)
    Ns = 0x9, // Not sign (non-negative)
    P = 0xA,  // Parity even
    Np = 0xB, // Parity odd
    L = 0xC,  // Less (signed <)
    Ge = 0xD, // Greater or equal (signed >=)
    Le = 0xE, // Less or equal (signed <=)
    G = 0xF,  // Greater (signed >)
}

/// x86-64 assembler.
pub struct X86_64Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> X86_64Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    /// Current offset in the underlying buffer.
    pub fn offset(&self) -> usize {
        self.buf.offset()
    }

    /// Define a label at the current position.
    pub fn bind(&mut self, label: &str) {
        self.buf.define_label(label);
    }

    /// Pad with NOPs to the given alignment.
    pub fn align(&mut self, alignment: usize) {
        self.buf.align(alignment);
    }

    // ==================== REX prefix helpers ====================

    /// Emit REX.W prefix for 64-bit operations.
    fn emit_rex_w(&mut self, reg: Reg, rm: Reg) {
        let rex = 0x48 | reg.rex_r() | rm.rex_b();
        self.buf.emit_u8(rex);
    }

    /// Emit REX.W prefix for single register operations.
    fn emit_rex_w_single(&mut self, rm: Reg) {
        let rex = 0x48 | rm.rex_b();
        self.buf.emit_u8(rex);
    }

    /// Emit a REX prefix built from raw register numbers, skipping it when empty.
    fn emit_rex_raw(&mut self, w: bool, reg: u8, base: u8) {
        let mut rex = 0x40;
        if w {
            rex |= 0x08;
        }
        if reg >= 8 {
            rex |= 0x04;
        }
        if base >= 8 {
            rex |= 0x01;
        }
        if rex != 0x40 {
            self.buf.emit_u8(rex);
        }
    }

    // ==================== ModR/M helpers ====================

    /// Encode ModR/M byte.
    /// mod: 2 bits, reg: 3 bits, rm: 3 bits
    fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
        ((mode & 0x3) << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
    }

    /// Emit ModR/M (plus SIB and displacement) for `[base + disp]`.
    fn emit_mem(&mut self, reg: u8, base: Reg, disp: i32) {
        // RSP/R12 as base always need a SIB byte
        let needs_sib = base.code() == 0b100;
        let rm = if needs_sib { 0b100 } else { base.code() };

        // RBP/R13 with mod=00 would mean RIP-relative / disp32-only
        if disp == 0 && base.code() != 0b101 {
            self.buf.emit_u8(Self::modrm(0b00, reg, rm));
            if needs_sib {
                self.buf.emit_u8(0x24);
            }
        } else if (-128..=127).contains(&disp) {
            self.buf.emit_u8(Self::modrm(0b01, reg, rm));
            if needs_sib {
                self.buf.emit_u8(0x24);
            }
            self.buf.emit_u8(disp as u8);
        } else {
            self.buf.emit_u8(Self::modrm(0b10, reg, rm));
            if needs_sib {
                self.buf.emit_u8(0x24);
            }
            self.buf.emit_u32(disp as u32);
        }
    }

    /// Emit ModR/M for `[rip + disp32]`.
    fn emit_rip(&mut self, reg: u8, disp: i32) {
        self.buf.emit_u8(Self::modrm(0b00, reg, 0b101));
        self.buf.emit_u32(disp as u32);
    }

    // ==================== Data Movement ====================

    /// MOV r64, r64 (register to register)
    pub fn mov_rr(&mut self, dst: Reg, src: Reg) {
        self.emit_rex_w(src, dst);
        self.buf.emit_u8(0x89); // MOV r/m64, r64
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// MOV r64, imm64 (move 64-bit immediate to register)
    pub fn mov_ri64(&mut self, dst: Reg, imm: i64) {
        self.emit_rex_w_single(dst);
        self.buf.emit_u8(0xB8 + dst.code()); // MOV r64, imm64
        self.buf.emit_u64(imm as u64);
    }

    /// MOV r32, imm32 (zero-extended; the narrow-oop load form)
    pub fn mov_r32_imm32(&mut self, dst: Reg, imm: u32) {
        if dst.needs_rex_ext() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0xB8 + dst.code());
        self.buf.emit_u32(imm);
    }

    /// MOV r64, [base + disp] (load from memory)
    pub fn mov_rm(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.emit_rex_w(dst, base);
        self.buf.emit_u8(0x8B); // MOV r64, r/m64
        self.emit_mem(dst.code(), base, disp);
    }

    /// MOV [base + disp], r64 (store to memory)
    pub fn mov_mr(&mut self, base: Reg, disp: i32, src: Reg) {
        self.emit_rex_w(src, base);
        self.buf.emit_u8(0x89); // MOV r/m64, r64
        self.emit_mem(src.code(), base, disp);
    }

    /// MOV DWORD PTR [base + disp], imm32
    pub fn mov_m32_imm32(&mut self, base: Reg, disp: i32, imm: u32) {
        self.emit_rex_raw(false, 0, base as u8);
        self.buf.emit_u8(0xC7); // MOV r/m32, imm32
        self.emit_mem(0, base, disp);
        self.buf.emit_u32(imm);
    }

    /// MOV r64, [rip + disp32] (data-section load)
    pub fn mov_rip(&mut self, dst: Reg, disp: i32) {
        self.emit_rex_w_single_r(dst);
        self.buf.emit_u8(0x8B);
        self.emit_rip(dst.code(), disp);
    }

    fn emit_rex_w_single_r(&mut self, reg: Reg) {
        self.buf.emit_u8(0x48 | reg.rex_r());
    }

    /// LEA r64, [base + disp]
    pub fn lea(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.emit_rex_w(dst, base);
        self.buf.emit_u8(0x8D);
        self.emit_mem(dst.code(), base, disp);
    }

    /// CMOVcc r64, r64
    pub fn cmov(&mut self, cond: Cond, dst: Reg, src: Reg) {
        self.emit_rex_w(dst, src);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x40 + cond as u8);
        self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
    }

    // ==================== Arithmetic Operations ====================

    /// ADD r64, imm32 (sign-extended)
    pub fn add_ri32(&mut self, dst: Reg, imm: i32) {
        self.emit_rex_w_single(dst);
        if (-128..=127).contains(&imm) {
            self.buf.emit_u8(0x83); // ADD r/m64, imm8
            self.buf.emit_u8(Self::modrm(0b11, 0, dst.code()));
            self.buf.emit_u8(imm as u8);
        } else {
            self.buf.emit_u8(0x81); // ADD r/m64, imm32
            self.buf.emit_u8(Self::modrm(0b11, 0, dst.code()));
            self.buf.emit_u32(imm as u32);
        }
    }

    /// SUB r64, imm32 (sign-extended)
    pub fn sub_ri32(&mut self, dst: Reg, imm: i32) {
        self.emit_rex_w_single(dst);
        if (-128..=127).contains(&imm) {
            self.buf.emit_u8(0x83); // SUB r/m64, imm8
            self.buf.emit_u8(Self::modrm(0b11, 5, dst.code()));
            self.buf.emit_u8(imm as u8);
        } else {
            self.buf.emit_u8(0x81); // SUB r/m64, imm32
            self.buf.emit_u8(Self::modrm(0b11, 5, dst.code()));
            self.buf.emit_u32(imm as u32);
        }
    }

    /// AND r64, imm32 (sign-extended)
    pub fn and_ri32(&mut self, dst: Reg, imm: i32) {
        self.emit_rex_w_single(dst);
        if (-128..=127).contains(&imm) {
            self.buf.emit_u8(0x83); // AND r/m64, imm8
            self.buf.emit_u8(Self::modrm(0b11, 4, dst.code()));
            self.buf.emit_u8(imm as u8);
        } else {
            self.buf.emit_u8(0x81); // AND r/m64, imm32
            self.buf.emit_u8(Self::modrm(0b11, 4, dst.code()));
            self.buf.emit_u32(imm as u32);
        }
    }

    /// CMP r64, [base + disp]
    pub fn cmp_rm(&mut self, lhs: Reg, base: Reg, disp: i32) {
        self.emit_rex_w(lhs, base);
        self.buf.emit_u8(0x3B); // CMP r64, r/m64
        self.emit_mem(lhs.code(), base, disp);
    }

    /// CMP r32, imm32 (the narrow-oop compare form)
    pub fn cmp_r32_imm32(&mut self, lhs: Reg, imm: u32) {
        if lhs.needs_rex_ext() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0x81); // CMP r/m32, imm32
        self.buf.emit_u8(Self::modrm(0b11, 7, lhs.code()));
        self.buf.emit_u32(imm);
    }

    /// XOR r64, r64
    pub fn xor_rr(&mut self, dst: Reg, src: Reg) {
        self.emit_rex_w(src, dst);
        self.buf.emit_u8(0x31); // XOR r/m64, r64
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// TEST r64, r64 (bitwise AND, set flags, discard result)
    pub fn test_rr(&mut self, dst: Reg, src: Reg) {
        self.emit_rex_w(src, dst);
        self.buf.emit_u8(0x85); // TEST r/m64, r64
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    // ==================== Safepoint Polls ====================

    /// TEST [rip + disp32], EAX (near poll; disp carries the page offset until installed)
    pub fn poll_near(&mut self, encoded_offset: i32) {
        self.buf.emit_u8(0x85);
        self.emit_rip(0, encoded_offset);
    }

    /// TEST [base], EAX (far poll through a register holding the page address)
    pub fn poll_far(&mut self, base: Reg) {
        self.emit_rex_raw(false, 0, base as u8);
        self.buf.emit_u8(0x85);
        self.emit_mem(0, base, 0);
    }

    // ==================== Stack Operations ====================

    /// PUSH r64
    pub fn push(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41); // REX.B
        }
        self.buf.emit_u8(0x50 + reg.code());
    }

    /// POP r64
    pub fn pop(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41); // REX.B
        }
        self.buf.emit_u8(0x58 + reg.code());
    }

    // ==================== Control Flow ====================

    /// JMP rel32 (relative jump, near)
    pub fn jmp_rel32(&mut self, offset: i32) {
        self.buf.emit_u8(0xE9); // JMP rel32
        self.buf.emit_u32(offset as u32);
    }

    /// JMP rel8 (short jump)
    pub fn jmp_rel8(&mut self, offset: i8) {
        self.buf.emit_u8(0xEB); // JMP rel8
        self.buf.emit_u8(offset as u8);
    }

    /// Jcc rel32 (conditional jump, near)
    pub fn jcc_rel32(&mut self, cond: Cond, offset: i32) {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x80 + cond as u8); // Jcc rel32
        self.buf.emit_u32(offset as u32);
    }

    /// Jcc rel32 to a label
    pub fn jcc_label(&mut self, cond: Cond, label: &str) {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x80 + cond as u8);
        self.buf.emit_forward_ref(label);
    }

    /// Jcc rel8 (conditional short jump)
    pub fn jcc_rel8(&mut self, cond: Cond, offset: i8) {
        self.buf.emit_u8(0x70 + cond as u8); // Jcc rel8
        self.buf.emit_u8(offset as u8);
    }

    /// CALL rel32 (relative call)
    pub fn call_rel32(&mut self, offset: i32) {
        self.buf.emit_u8(0xE8); // CALL rel32
        self.buf.emit_u32(offset as u32);
    }

    /// CALL r64 (indirect call through register)
    pub fn call_r(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41); // REX.B
        }
        self.buf.emit_u8(0xFF); // CALL r/m64
        self.buf.emit_u8(Self::modrm(0b11, 2, reg.code()));
    }

    /// JMP r64 (indirect jump through register)
    pub fn jmp_r(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41); // REX.B
        }
        self.buf.emit_u8(0xFF); // JMP r/m64
        self.buf.emit_u8(Self::modrm(0b11, 4, reg.code()));
    }

    /// JMP QWORD PTR [base + disp]
    pub fn jmp_m(&mut self, base: Reg, disp: i32) {
        self.emit_rex_raw(false, 0, base as u8);
        self.buf.emit_u8(0xFF);
        self.emit_mem(4, base, disp);
    }

    /// RET (return)
    pub fn ret(&mut self) {
        self.buf.emit_u8(0xC3);
    }

    /// NOP (no operation)
    pub fn nop(&mut self) {
        self.buf.emit_u8(0x90);
    }

    // ==================== Conditional Set ====================

    /// SETcc r8 (set byte based on condition)
    pub fn setcc(&mut self, cond: Cond, dst: Reg) {
        if dst.needs_rex_ext()
            || dst == Reg::Rsp
            || dst == Reg::Rbp
            || dst == Reg::Rsi
            || dst == Reg::Rdi
        {
            // Need REX prefix to access SPL, BPL, SIL, DIL or R8B-R15B
            self.buf.emit_u8(0x40 | dst.rex_b());
        }
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x90 + cond as u8); // SETcc r/m8
        self.buf.emit_u8(Self::modrm(0b11, 0, dst.code()));
    }

    /// MOVZX r64, r8 (zero-extend byte to qword)
    pub fn movzx_r64_r8(&mut self, dst: Reg, src: Reg) {
        self.emit_rex_w(dst, src);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xB6); // MOVZX r64, r/m8
        self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
    }

    /// CMP r8, 0 (test a native boolean in the low byte)
    pub fn cmp_r8_zero(&mut self, reg: Reg) {
        if reg.needs_rex_ext() || matches!(reg, Reg::Rsp | Reg::Rbp | Reg::Rsi | Reg::Rdi) {
            self.buf.emit_u8(0x40 | reg.rex_b());
        }
        self.buf.emit_u8(0x80); // CMP r/m8, imm8
        self.buf.emit_u8(Self::modrm(0b11, 7, reg.code()));
        self.buf.emit_u8(0);
    }

    // ==================== SSE2 Floating Point ====================

    /// MOVSD xmm, [base + disp]
    pub fn movsd_load(&mut self, dst: Xmm, base: Reg, disp: i32) {
        self.buf.emit_u8(0xF2);
        self.emit_rex_raw(false, dst as u8, base as u8);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x10);
        self.emit_mem(dst.code(), base, disp);
    }

    /// MOVSD [base + disp], xmm
    pub fn movsd_store(&mut self, base: Reg, disp: i32, src: Xmm) {
        self.buf.emit_u8(0xF2);
        self.emit_rex_raw(false, src as u8, base as u8);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x11);
        self.emit_mem(src.code(), base, disp);
    }

    /// MOVSD xmm, [rip + disp32] (data-section load)
    pub fn movsd_rip(&mut self, dst: Xmm, disp: i32) {
        self.buf.emit_u8(0xF2);
        self.emit_rex_raw(false, dst as u8, 0);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x10);
        self.emit_rip(dst.code(), disp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(f: impl FnOnce(&mut X86_64Assembler)) -> Vec<u8> {
        let mut buf = CodeBuffer::new();
        let mut asm = X86_64Assembler::new(&mut buf);
        f(&mut asm);
        buf.into_code()
    }

    #[test]
    fn test_mov_rr() {
        // MOV RAX, RBX = 48 89 D8
        assert_eq!(encode(|a| a.mov_rr(Reg::Rax, Reg::Rbx)), [0x48, 0x89, 0xD8]);
        // MOV R9, R8 = 4D 89 C1
        assert_eq!(encode(|a| a.mov_rr(Reg::R9, Reg::R8)), [0x4D, 0x89, 0xC1]);
    }

    #[test]
    fn test_mov_ri64() {
        // MOV RAX, imm64 = 48 B8 F0 DE BC 9A 78 56 34 12
        assert_eq!(
            encode(|a| a.mov_ri64(Reg::Rax, 0x123456789ABCDEF0u64 as i64)),
            [0x48, 0xB8, 0xF0, 0xDE, 0xBC, 0x9A, 0x78, 0x56, 0x34, 0x12]
        );
        // MOV R10, 42 = 49 BA 2A 00 ...
        assert_eq!(
            encode(|a| a.mov_ri64(Reg::R10, 42)),
            [0x49, 0xBA, 0x2A, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_mov_r32_imm32() {
        assert_eq!(
            encode(|a| a.mov_r32_imm32(Reg::Rcx, 0x11223344)),
            [0xB9, 0x44, 0x33, 0x22, 0x11]
        );
        assert_eq!(
            encode(|a| a.mov_r32_imm32(Reg::R11, 1)),
            [0x41, 0xBB, 1, 0, 0, 0]
        );
    }

    #[test]
    fn test_push_pop() {
        // PUSH RBX = 53, PUSH R12 = 41 54, POP R12 = 41 5C, POP RBX = 5B
        let code = encode(|a| {
            a.push(Reg::Rbx);
            a.push(Reg::R12);
            a.pop(Reg::R12);
            a.pop(Reg::Rbx);
        });
        assert_eq!(code, [0x53, 0x41, 0x54, 0x41, 0x5C, 0x5B]);
    }

    #[test]
    fn test_mov_rm_forms() {
        // MOV RAX, [RBX] = 48 8B 03
        assert_eq!(encode(|a| a.mov_rm(Reg::Rax, Reg::Rbx, 0)), [0x48, 0x8B, 0x03]);
        // MOV RAX, [RBX+16] = 48 8B 43 10
        assert_eq!(encode(|a| a.mov_rm(Reg::Rax, Reg::Rbx, 16)), [0x48, 0x8B, 0x43, 0x10]);
        // MOV RAX, [RSP+8] = 48 8B 44 24 08
        assert_eq!(
            encode(|a| a.mov_rm(Reg::Rax, Reg::Rsp, 8)),
            [0x48, 0x8B, 0x44, 0x24, 0x08]
        );
        // MOV RAX, [RBP] needs an explicit disp8 = 48 8B 45 00
        assert_eq!(encode(|a| a.mov_rm(Reg::Rax, Reg::Rbp, 0)), [0x48, 0x8B, 0x45, 0x00]);
        // MOV RAX, [R13+0x200] = 49 8B 85 00 02 00 00
        assert_eq!(
            encode(|a| a.mov_rm(Reg::Rax, Reg::R13, 0x200)),
            [0x49, 0x8B, 0x85, 0x00, 0x02, 0x00, 0x00]
        );
    }

    #[test]
    fn test_mov_mr_simple() {
        // MOV [RBX], RAX = 48 89 03
        assert_eq!(encode(|a| a.mov_mr(Reg::Rbx, 0, Reg::Rax)), [0x48, 0x89, 0x03]);
    }

    #[test]
    fn test_mov_m32_imm32() {
        // MOV DWORD PTR [R15+8], 2 = 41 C7 47 08 02 00 00 00
        assert_eq!(
            encode(|a| a.mov_m32_imm32(Reg::R15, 8, 2)),
            [0x41, 0xC7, 0x47, 0x08, 0x02, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_rip_relative_forms() {
        // MOV RAX, [RIP+0x10] = 48 8B 05 10 00 00 00
        assert_eq!(
            encode(|a| a.mov_rip(Reg::Rax, 0x10)),
            [0x48, 0x8B, 0x05, 0x10, 0, 0, 0]
        );
        // MOVSD XMM1, [RIP+0] = F2 0F 10 0D 00 00 00 00
        assert_eq!(
            encode(|a| a.movsd_rip(Xmm::Xmm1, 0)),
            [0xF2, 0x0F, 0x10, 0x0D, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_lea_and_cmov() {
        // LEA RDX, [RBP-8] = 48 8D 55 F8
        assert_eq!(encode(|a| a.lea(Reg::Rdx, Reg::Rbp, -8)), [0x48, 0x8D, 0x55, 0xF8]);
        // CMOVE RDX, RAX = 48 0F 44 D0
        assert_eq!(
            encode(|a| a.cmov(Cond::E, Reg::Rdx, Reg::Rax)),
            [0x48, 0x0F, 0x44, 0xD0]
        );
    }

    #[test]
    fn test_add_sub_and_imm() {
        // ADD RAX, 16 = 48 83 C0 10
        assert_eq!(encode(|a| a.add_ri32(Reg::Rax, 16)), [0x48, 0x83, 0xC0, 0x10]);
        // ADD RAX, 256 = 48 81 C0 00 01 00 00
        assert_eq!(
            encode(|a| a.add_ri32(Reg::Rax, 256)),
            [0x48, 0x81, 0xC0, 0x00, 0x01, 0x00, 0x00]
        );
        // SUB RSP, 32 = 48 83 EC 20
        assert_eq!(encode(|a| a.sub_ri32(Reg::Rsp, 32)), [0x48, 0x83, 0xEC, 0x20]);
        // AND RSP, -16 = 48 83 E4 F0
        assert_eq!(encode(|a| a.and_ri32(Reg::Rsp, -16)), [0x48, 0x83, 0xE4, 0xF0]);
    }

    #[test]
    fn test_cmp_forms() {
        // CMP R10, [RAX+8] = 4C 3B 50 08
        assert_eq!(
            encode(|a| a.cmp_rm(Reg::R10, Reg::Rax, 8)),
            [0x4C, 0x3B, 0x50, 0x08]
        );
        // CMP EAX, imm32 = 81 F8 imm32
        assert_eq!(
            encode(|a| a.cmp_r32_imm32(Reg::Rax, 7)),
            [0x81, 0xF8, 7, 0, 0, 0]
        );
    }

    #[test]
    fn test_polls() {
        // TEST [RIP+0x40], EAX = 85 05 40 00 00 00
        assert_eq!(encode(|a| a.poll_near(0x40)), [0x85, 0x05, 0x40, 0, 0, 0]);
        // TEST [R10], EAX = 41 85 02
        assert_eq!(encode(|a| a.poll_far(Reg::R10)), [0x41, 0x85, 0x02]);
    }

    #[test]
    fn test_jumps_and_calls() {
        // JMP +16 = E9 10 00 00 00
        assert_eq!(encode(|a| a.jmp_rel32(0x10)), [0xE9, 0x10, 0, 0, 0]);
        // JMP +16 = EB 10
        assert_eq!(encode(|a| a.jmp_rel8(0x10)), [0xEB, 0x10]);
        // JE +16 = 0F 84 10 00 00 00
        assert_eq!(encode(|a| a.jcc_rel32(Cond::E, 0x10)), [0x0F, 0x84, 0x10, 0, 0, 0]);
        // JE +16 = 74 10
        assert_eq!(encode(|a| a.jcc_rel8(Cond::E, 0x10)), [0x74, 0x10]);
        // CALL +16 = E8 10 00 00 00
        assert_eq!(encode(|a| a.call_rel32(0x10)), [0xE8, 0x10, 0, 0, 0]);
        // CALL RAX = FF D0, CALL R10 = 41 FF D2
        assert_eq!(encode(|a| a.call_r(Reg::Rax)), [0xFF, 0xD0]);
        assert_eq!(encode(|a| a.call_r(Reg::R10)), [0x41, 0xFF, 0xD2]);
        // JMP R10 = 41 FF E2
        assert_eq!(encode(|a| a.jmp_r(Reg::R10)), [0x41, 0xFF, 0xE2]);
        // JMP [RBX+0x18] = FF 63 18
        assert_eq!(encode(|a| a.jmp_m(Reg::Rbx, 0x18)), [0xFF, 0x63, 0x18]);
    }

    #[test]
    fn test_label_jumps() {
        let mut buf = CodeBuffer::new();
        let mut asm = X86_64Assembler::new(&mut buf);
        asm.jcc_label(Cond::Ne, "out");
        asm.nop();
        asm.bind("out");
        asm.ret();
        buf.patch_forward_refs().unwrap();
        assert_eq!(buf.code(), &[0x0F, 0x85, 0x01, 0, 0, 0, 0x90, 0xC3]);
    }

    #[test]
    fn test_setcc_movzx() {
        // SETNE AL = 0F 95 C0
        assert_eq!(encode(|a| a.setcc(Cond::Ne, Reg::Rax)), [0x0F, 0x95, 0xC0]);
        // MOVZX RAX, AL = 48 0F B6 C0
        assert_eq!(
            encode(|a| a.movzx_r64_r8(Reg::Rax, Reg::Rax)),
            [0x48, 0x0F, 0xB6, 0xC0]
        );
        // CMP AL, 0 = 80 F8 00
        assert_eq!(encode(|a| a.cmp_r8_zero(Reg::Rax)), [0x80, 0xF8, 0x00]);
    }

    #[test]
    fn test_movsd_memory() {
        // MOVSD XMM0, [RBP-16] = F2 0F 10 45 F0
        assert_eq!(
            encode(|a| a.movsd_load(Xmm::Xmm0, Reg::Rbp, -16)),
            [0xF2, 0x0F, 0x10, 0x45, 0xF0]
        );
        // MOVSD [RSP+8], XMM9 = F2 44 0F 11 4C 24 08
        assert_eq!(
            encode(|a| a.movsd_store(Reg::Rsp, 8, Xmm::Xmm9)),
            [0xF2, 0x44, 0x0F, 0x11, 0x4C, 0x24, 0x08]
        );
    }
}
