//! Relocation entries.
//!
//! An entry remembers where a patchable instruction is and what its operand
//! means. It never stores the operand value: that is always re-derived from
//! the instruction bytes and the current section addresses, so entries stay
//! valid when the code moves.

use serde::Serialize;

use crate::error::ContractViolation;

use super::codebuf::{SectionLayout, read_i32};
use super::decode::decode;

/// Which operand of the instruction the entry refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperandFormat {
    /// Full 64-bit immediate (`mov r64, imm64`), or nothing to adjust.
    Imm,
    /// 32-bit immediate holding a compressed object.
    NarrowOop,
    /// RIP-relative 32-bit displacement.
    Disp32,
    /// Branch rel32.
    Call32,
}

/// How an object constant is reachable from the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OopRef {
    /// Index into the artifact's object table.
    Index(usize),
    /// The object sits in the instruction's immediate.
    Immediate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelocKind {
    Oop(OopRef),
    SectionWord(Section),
    RuntimeCall,
    /// `ic_mark` is the code offset of the `mov` holding the inline-cache value.
    VirtualCall { ic_mark: u32 },
    StaticCall,
    OptVirtualCall,
    Poll,
    PollReturn,
}

impl RelocKind {
    /// Entries whose instruction is a Java call that resolution may re-target.
    pub fn is_java_call(&self) -> bool {
        matches!(
            self,
            RelocKind::VirtualCall { .. } | RelocKind::StaticCall | RelocKind::OptVirtualCall
        )
    }

    pub fn is_oop(&self) -> bool {
        matches!(self, RelocKind::Oop(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            RelocKind::Oop(OopRef::Index(_)) => "oop (narrow)",
            RelocKind::Oop(OopRef::Immediate) => "oop",
            RelocKind::SectionWord(Section::Data) => "section_word (data)",
            RelocKind::RuntimeCall => "runtime_call",
            RelocKind::VirtualCall { .. } => "virtual_call",
            RelocKind::StaticCall => "static_call",
            RelocKind::OptVirtualCall => "opt_virtual_call",
            RelocKind::Poll => "poll",
            RelocKind::PollReturn => "poll_return",
        }
    }
}

/// One relocation entry, keyed by the offset of the instruction it describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Relocation {
    pub offset: u32,
    pub kind: RelocKind,
    pub format: OperandFormat,
}

impl Relocation {
    pub fn new(offset: u32, kind: RelocKind, format: OperandFormat) -> Self {
        Self {
            offset,
            kind,
            format,
        }
    }

    /// Adjust this entry's operand after the code moved from `old` to `new`.
    ///
    /// `code` is the artifact's code section at its new location. Branch
    /// and poll targets are absolute and stay where they are; data-section
    /// references follow the data section. Immediates need nothing.
    pub fn fix_after_move(
        &self,
        code: &mut [u8],
        old: SectionLayout,
        new: SectionLayout,
    ) -> Result<(), ContractViolation> {
        if matches!(self.format, OperandFormat::Imm | OperandFormat::NarrowOop) {
            return Ok(());
        }

        let inst = decode(code, self.offset as usize)?;
        let field = inst.operand(self.format)?;
        let next = inst.next();
        let current = read_i32(code, field.offset) as i64;

        let old_target = old.code_addr(next) as i64 + current;
        let new_target = match self.kind {
            RelocKind::SectionWord(Section::Data) => {
                let data_offset = old_target - old.data_base as i64;
                new.data_base as i64 + data_offset
            }
            _ => old_target,
        };

        let disp = new_target - new.code_addr(next) as i64;
        let disp = i32::try_from(disp).map_err(|_| ContractViolation::DisplacementOverflow {
            offset: self.offset,
            displacement: disp,
        })?;
        code[field.offset..field.offset + 4].copy_from_slice(&disp.to_le_bytes());
        Ok(())
    }
}

/// Relocation entries of one artifact, ordered by offset.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RelocationTable {
    entries: Vec<Relocation>,
}

impl RelocationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an entry. At most one entry per instruction.
    pub fn push(&mut self, reloc: Relocation) -> Result<(), ContractViolation> {
        match self.entries.binary_search_by_key(&reloc.offset, |r| r.offset) {
            Ok(_) => Err(ContractViolation::DuplicateSite {
                offset: reloc.offset,
            }),
            Err(pos) => {
                self.entries.insert(pos, reloc);
                Ok(())
            }
        }
    }

    pub fn get(&self, offset: u32) -> Option<&Relocation> {
        self.entries
            .binary_search_by_key(&offset, |r| r.offset)
            .ok()
            .map(|i| &self.entries[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Relocation> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
