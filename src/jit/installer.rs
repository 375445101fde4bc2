//! Code installation.
//!
//! The compiler hands over finished machine code, its data section and a
//! list of sites: places in the code whose operands refer to something
//! outside it. [`Relocator`] rewrites each site for the addresses the code
//! will occupy and records a relocation entry so the site can be found and
//! re-patched later. [`CodeInstaller`] wraps that in allocation, copying and
//! publication.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::RuntimeConfig;
use crate::error::{ContractViolation, InstallError};
use crate::runtime::method::Method;
use crate::runtime::objects::{CompressedOops, ObjectRef, ObjectTable};
use crate::runtime::stubs::RuntimeStubs;

use super::code_blob::InstalledCode;
use super::codebuf::{SectionLayout, read_i32};
use super::decode::{Decoded, Field, InstKind, decode};
use super::memory::ExecutableMemory;
use super::reloc::{OopRef, OperandFormat, RelocKind, Relocation, RelocationTable, Section};
use super::stackmap::{OopMap, OopMapSet, ReferenceMap};

/// Value an inline cache holds while its call site is unresolved.
pub const CLEAN_IC_VALUE: u64 = u64::MAX;

/// How a Java call site dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    /// Dispatch code was inlined by the compiler; nothing to patch.
    InlineInvoke,
    InvokeVirtual,
    InvokeInterface,
    InvokeStatic,
    InvokeSpecial,
}

/// Safepoint poll forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollKind {
    /// `test [rip+disp32], eax`
    Near,
    /// `test [reg], eax` with the page address in a register
    Far,
    ReturnNear,
    ReturnFar,
}

impl TryFrom<i32> for PollKind {
    type Error = ContractViolation;

    fn try_from(raw: i32) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(PollKind::Near),
            1 => Ok(PollKind::Far),
            2 => Ok(PollKind::ReturnNear),
            3 => Ok(PollKind::ReturnFar),
            _ => Err(ContractViolation::InvalidPollKind(raw)),
        }
    }
}

/// Where a call into another code blob should land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobTarget {
    pub code_begin: u64,
    /// Set for full methods, whose callers enter past the inline-cache check.
    pub verified_entry: Option<u64>,
}

impl BlobTarget {
    pub fn destination(&self) -> u64 {
        self.verified_entry.unwrap_or(self.code_begin)
    }
}

impl From<&InstalledCode> for BlobTarget {
    fn from(code: &InstalledCode) -> Self {
        let verified_entry = match code.kind() {
            CodeKind::Method => Some(code.verified_entry_point()),
            _ => None,
        };
        Self {
            code_begin: code.code_begin(),
            verified_entry,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SiteKind {
    ObjectConstant {
        object: ObjectRef,
        compressed: bool,
    },
    DataReference {
        data_offset: u32,
    },
    ForeignCall {
        destination: u64,
        debug: Option<ReferenceMap>,
    },
    BlobCall {
        target: BlobTarget,
        debug: Option<ReferenceMap>,
    },
    MethodCall {
        call_type: CallType,
        /// Offset of the `mov` that loads the inline-cache value.
        ic_mark: Option<u32>,
        /// The callee, when the compiler resolved it.
        method: Option<Arc<Method>>,
        debug: Option<ReferenceMap>,
    },
    SafepointPoll {
        poll: PollKind,
    },
}

/// One location in the code needing fix-up.
#[derive(Debug, Clone)]
pub struct Site {
    pub offset: u32,
    pub kind: SiteKind,
}

impl Site {
    pub fn new(offset: u32, kind: SiteKind) -> Self {
        Self { offset, kind }
    }

    fn debug(&self) -> Option<&ReferenceMap> {
        match &self.kind {
            SiteKind::ForeignCall { debug, .. }
            | SiteKind::BlobCall { debug, .. }
            | SiteKind::MethodCall { debug, .. } => debug.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeKind {
    /// Compiled method or native wrapper.
    Method,
    /// Adapters and similar glue. Never stops at a safepoint.
    BufferBlob,
    /// Shared runtime stubs.
    RuntimeStub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct EntryOffsets {
    pub verified_entry: u32,
    /// Entry with the inline-cache check, if the code has one.
    pub unverified_entry: Option<u32>,
}

/// Compiler output for one artifact.
#[derive(Debug, Clone)]
pub struct CompiledCode {
    pub name: String,
    pub kind: CodeKind,
    pub code: Vec<u8>,
    pub data: Vec<u8>,
    pub data_alignment: usize,
    pub sites: Vec<Site>,
    pub entries: EntryOffsets,
    pub frame_size: u32,
}

impl CompiledCode {
    pub fn new(name: &str, kind: CodeKind, code: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            code,
            data: Vec::new(),
            data_alignment: 8,
            sites: Vec::new(),
            entries: EntryOffsets::default(),
            frame_size: 0,
        }
    }
}

/// Runtime addresses sites are resolved against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InstallContext {
    pub stubs: RuntimeStubs,
    pub polling_page: u64,
    pub narrow_oops: CompressedOops,
}

/// What the relocator produced besides the patched bytes.
#[derive(Debug, Default)]
pub struct RelocatorOutput {
    pub relocations: RelocationTable,
    pub objects: ObjectTable,
    pub oop_maps: OopMapSet,
}

/// Applies sites to a code section that will live at `layout`.
pub struct Relocator<'a> {
    name: &'a str,
    kind: CodeKind,
    code: &'a mut [u8],
    data_len: usize,
    layout: SectionLayout,
    context: &'a InstallContext,
    verify_call_types: bool,
    trace: bool,
    seen: HashSet<u32>,
    out: RelocatorOutput,
}

impl<'a> Relocator<'a> {
    pub fn new(
        compiled_name: &'a str,
        kind: CodeKind,
        code: &'a mut [u8],
        data_len: usize,
        layout: SectionLayout,
        context: &'a InstallContext,
        config: &RuntimeConfig,
    ) -> Self {
        Self {
            name: compiled_name,
            kind,
            code,
            data_len,
            layout,
            context,
            verify_call_types: config.verify_call_types,
            trace: config.trace_install,
            seen: HashSet::new(),
            out: RelocatorOutput::default(),
        }
    }

    fn decode_at(&self, offset: u32) -> Result<Decoded, ContractViolation> {
        if offset as usize >= self.code.len() {
            return Err(ContractViolation::OffsetOutOfBounds {
                offset,
                len: self.code.len(),
            });
        }
        decode(self.code, offset as usize)
    }

    fn write(&mut self, field: Field, bytes: &[u8]) {
        self.code[field.offset..field.offset + bytes.len()].copy_from_slice(bytes);
    }

    fn record(&mut self, offset: u32, kind: RelocKind, format: OperandFormat) -> Result<(), ContractViolation> {
        if self.trace {
            eprintln!(
                "[install] {}: {} at {:#x} ({:?})",
                self.name,
                kind.name(),
                offset,
                format
            );
        }
        self.out.relocations.push(Relocation::new(offset, kind, format))
    }

    /// Point a rel32 branch at an absolute address.
    fn set_rel32(&mut self, inst: &Decoded, destination: u64) -> Result<(), ContractViolation> {
        let field = inst.operand(OperandFormat::Call32)?;
        let disp = destination as i64 - self.layout.code_addr(inst.next()) as i64;
        let disp = fit_i32(inst.start as u32, disp)?;
        self.write(field, &disp.to_le_bytes());
        Ok(())
    }

    /// Offset of the return address of the call at `pc_offset`.
    pub fn next_offset(&self, pc_offset: u32, has_method: bool) -> Result<u32, ContractViolation> {
        let inst = self.decode_at(pc_offset)?;
        match inst.kind {
            InstKind::Call | InstKind::Jump if inst.len == 5 => Ok(pc_offset + 5),
            InstKind::MovLiteral64 => {
                // mov r64, imm64 followed by call through that register
                let call = pc_offset as usize + inst.len;
                let bytes: [u8; 3] = self
                    .code
                    .get(call..call + 3)
                    .and_then(|b| b.try_into().ok())
                    .ok_or(ContractViolation::OffsetOutOfBounds {
                        offset: call as u32,
                        len: self.code.len(),
                    })?;
                let is_reg_call = (bytes[0] == 0x40 || bytes[0] == 0x41)
                    && bytes[1] == 0xFF
                    && bytes[2] & 0xF8 == 0xD0;
                if !is_reg_call {
                    return Err(ContractViolation::UnexpectedCallEncoding {
                        offset: call as u32,
                        bytes,
                    });
                }
                Ok((call + 3) as u32)
            }
            InstKind::CallReg => {
                if self.verify_call_types && !has_method {
                    return Err(ContractViolation::RegisterCallWithoutMethod { offset: pc_offset });
                }
                Ok(inst.next() as u32)
            }
            InstKind::CondJump => Ok(inst.next() as u32),
            _ => Err(ContractViolation::UnsupportedCallSite { offset: pc_offset }),
        }
    }

    /// Embed an object in the instruction at `pc_offset`.
    pub fn patch_object_constant(
        &mut self,
        pc_offset: u32,
        object: ObjectRef,
        compressed: bool,
    ) -> Result<(), ContractViolation> {
        let inst = self.decode_at(pc_offset)?;
        if compressed {
            let field = inst.operand(OperandFormat::NarrowOop)?;
            let narrow = self.context.narrow_oops.encode(object).ok_or(
                ContractViolation::NarrowOopOutOfRange {
                    offset: pc_offset,
                    object: object.0,
                },
            )?;
            let index = self.out.objects.find_or_insert(object);
            self.write(field, &narrow.to_le_bytes());
            self.record(pc_offset, RelocKind::Oop(OopRef::Index(index)), OperandFormat::NarrowOop)
        } else {
            let field = inst.operand(OperandFormat::Imm)?;
            self.write(field, &object.0.to_le_bytes());
            self.record(pc_offset, RelocKind::Oop(OopRef::Immediate), OperandFormat::Imm)
        }
    }

    /// Point a RIP-relative operand at `data_offset` in the data section.
    pub fn patch_data_reference(&mut self, pc_offset: u32, data_offset: u32) -> Result<(), ContractViolation> {
        let inst = self.decode_at(pc_offset)?;
        let field = inst.operand(OperandFormat::Disp32)?;
        if data_offset as usize >= self.data_len {
            return Err(ContractViolation::OffsetOutOfBounds {
                offset: data_offset,
                len: self.data_len,
            });
        }

        let dest = self.layout.data_addr(data_offset as usize);
        let next = self.layout.code_addr(inst.next());
        let disp = fit_i32(pc_offset, dest as i64 - next as i64)?;
        self.write(field, &disp.to_le_bytes());
        self.record(pc_offset, RelocKind::SectionWord(Section::Data), OperandFormat::Disp32)
    }

    /// Call or jump into another blob.
    pub fn relocate_blob_call(&mut self, pc_offset: u32, target: BlobTarget) -> Result<(), ContractViolation> {
        let inst = self.decode_at(pc_offset)?;
        if !matches!(inst.kind, InstKind::Call | InstKind::Jump | InstKind::CondJump) {
            return Err(ContractViolation::UnsupportedCallSite { offset: pc_offset });
        }
        self.set_rel32(&inst, target.destination())?;
        self.record(pc_offset, RelocKind::RuntimeCall, OperandFormat::Call32)
    }

    /// Call, jump or load of a foreign (runtime or native) address.
    pub fn relocate_foreign_call(&mut self, pc_offset: u32, destination: u64) -> Result<(), ContractViolation> {
        let inst = self.decode_at(pc_offset)?;
        let has_rel32 = inst.rel.is_some_and(|f| f.size == 4);
        match inst.kind {
            InstKind::Call | InstKind::Jump | InstKind::CondJump if has_rel32 => {
                self.set_rel32(&inst, destination)?;
                self.record(pc_offset, RelocKind::RuntimeCall, OperandFormat::Call32)
            }
            InstKind::MovLiteral64 => {
                let field = inst.operand(OperandFormat::Imm)?;
                self.write(field, &destination.to_le_bytes());
                self.record(pc_offset, RelocKind::RuntimeCall, OperandFormat::Imm)
            }
            _ => Err(ContractViolation::UnsupportedForeignCall { offset: pc_offset }),
        }
    }

    /// Route an unresolved Java call through the matching resolution stub.
    pub fn relocate_method_call(
        &mut self,
        pc_offset: u32,
        call_type: CallType,
        ic_mark: Option<u32>,
        method: Option<&Method>,
    ) -> Result<(), ContractViolation> {
        if call_type == CallType::InlineInvoke {
            return Ok(());
        }

        if self.verify_call_types
            && let Some(method) = method
        {
            let wants_static = call_type == CallType::InvokeStatic;
            if method.is_static() != wants_static {
                return Err(ContractViolation::CallTypeMismatch {
                    offset: pc_offset,
                    is_static: method.is_static(),
                });
            }
        }

        let inst = self.decode_at(pc_offset)?;
        if inst.kind != InstKind::Call {
            return Err(ContractViolation::UnsupportedCallSite { offset: pc_offset });
        }

        let stubs = self.context.stubs;
        let (destination, kind) = match call_type {
            CallType::InvokeVirtual | CallType::InvokeInterface => {
                let mark = ic_mark.ok_or(ContractViolation::MissingInvokeMark { offset: pc_offset })?;
                let mov = self.decode_at(mark)?;
                if mov.kind != InstKind::MovLiteral64 {
                    return Err(ContractViolation::OperandMismatch {
                        offset: mark,
                        format: OperandFormat::Imm,
                    });
                }
                let field = mov.operand(OperandFormat::Imm)?;
                self.write(field, &CLEAN_IC_VALUE.to_le_bytes());
                (stubs.resolve_virtual, RelocKind::VirtualCall { ic_mark: mark })
            }
            CallType::InvokeStatic => (stubs.resolve_static, RelocKind::StaticCall),
            CallType::InvokeSpecial => (stubs.resolve_opt_virtual, RelocKind::OptVirtualCall),
            CallType::InlineInvoke => return Ok(()),
        };

        self.set_rel32(&inst, destination)?;
        self.record(pc_offset, kind, OperandFormat::Call32)
    }

    /// Aim a near poll at the polling page; record far polls as-is.
    pub fn relocate_poll(&mut self, pc_offset: u32, poll: PollKind) -> Result<(), ContractViolation> {
        let (kind, near) = match poll {
            PollKind::Near => (RelocKind::Poll, true),
            PollKind::Far => (RelocKind::Poll, false),
            PollKind::ReturnNear => (RelocKind::PollReturn, true),
            PollKind::ReturnFar => (RelocKind::PollReturn, false),
        };

        if !near {
            // Loads through a register: nothing to rewrite, and nothing to
            // adjust when the code moves.
            let inst = self.decode_at(pc_offset)?;
            if inst.kind != InstKind::TestMem || inst.rip_relative {
                return Err(ContractViolation::UnexpectedPollEncoding { offset: pc_offset });
            }
            return self.record(pc_offset, kind, OperandFormat::Imm);
        }

        let inst = self.decode_at(pc_offset)?;
        let field = inst.operand(OperandFormat::Disp32)?;
        // The compiler leaves the offset into the polling page in the operand.
        let page_offset = read_i32(self.code, field.offset) as i64;
        let target = self.context.polling_page as i64 + page_offset;
        let disp = fit_i32(pc_offset, target - self.layout.code_addr(inst.next()) as i64)?;
        self.write(field, &disp.to_le_bytes());
        self.record(pc_offset, kind, OperandFormat::Disp32)
    }

    /// Apply one site.
    pub fn process(&mut self, site: &Site) -> Result<(), ContractViolation> {
        let offset = site.offset;
        if offset as usize >= self.code.len() {
            return Err(ContractViolation::OffsetOutOfBounds {
                offset,
                len: self.code.len(),
            });
        }
        if !self.seen.insert(offset) {
            return Err(ContractViolation::DuplicateSite { offset });
        }
        if self.kind == CodeKind::BufferBlob
            && (matches!(site.kind, SiteKind::SafepointPoll { .. }) || site.debug().is_some())
        {
            return Err(ContractViolation::SafepointInBufferBlob { offset });
        }

        let mut has_method = false;
        match &site.kind {
            SiteKind::ObjectConstant { object, compressed } => {
                self.patch_object_constant(offset, *object, *compressed)?
            }
            SiteKind::DataReference { data_offset } => self.patch_data_reference(offset, *data_offset)?,
            SiteKind::ForeignCall { destination, .. } => {
                self.relocate_foreign_call(offset, *destination)?
            }
            SiteKind::BlobCall { target, .. } => self.relocate_blob_call(offset, *target)?,
            SiteKind::MethodCall {
                call_type,
                ic_mark,
                method,
                ..
            } => {
                has_method = method.is_some();
                self.relocate_method_call(offset, *call_type, *ic_mark, method.as_deref())?
            }
            SiteKind::SafepointPoll { poll } => self.relocate_poll(offset, *poll)?,
        }

        if let Some(map) = site.debug() {
            let return_pc = self.next_offset(offset, has_method)?;
            self.out.oop_maps.add(OopMap::from_reference_map(return_pc, map)?);
        }
        Ok(())
    }

    pub fn finish(self) -> RelocatorOutput {
        self.out
    }
}

fn fit_i32(offset: u32, displacement: i64) -> Result<i32, ContractViolation> {
    i32::try_from(displacement).map_err(|_| ContractViolation::DisplacementOverflow {
        offset,
        displacement,
    })
}

fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Places compiled code into executable memory.
#[derive(Debug, Clone)]
pub struct CodeInstaller {
    config: RuntimeConfig,
    context: InstallContext,
}

impl CodeInstaller {
    pub fn new(config: RuntimeConfig, context: InstallContext) -> Self {
        Self { config, context }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn context(&self) -> &InstallContext {
        &self.context
    }

    /// Offset of the data section behind `code_len` bytes of code.
    pub fn data_offset(&self, compiled: &CompiledCode) -> usize {
        let alignment = compiled
            .data_alignment
            .max(self.config.data_alignment)
            .next_power_of_two();
        align_up(compiled.code.len(), alignment)
    }

    fn validate(&self, compiled: &CompiledCode) -> Result<(), ContractViolation> {
        let len = compiled.code.len();
        let entries = [
            Some(compiled.entries.verified_entry),
            compiled.entries.unverified_entry,
        ];
        for entry in entries.into_iter().flatten() {
            if entry as usize >= len {
                return Err(ContractViolation::OffsetOutOfBounds { offset: entry, len });
            }
        }
        Ok(())
    }

    /// Run the relocator over `compiled.code` for the given layout, without
    /// allocating anything.
    pub fn relocate_at(
        &self,
        compiled: &mut CompiledCode,
        layout: SectionLayout,
    ) -> Result<RelocatorOutput, ContractViolation> {
        self.validate(compiled)?;
        let mut relocator = Relocator::new(
            &compiled.name,
            compiled.kind,
            &mut compiled.code,
            compiled.data.len(),
            layout,
            &self.context,
            &self.config,
        );
        for site in &compiled.sites {
            relocator.process(site)?;
        }
        Ok(relocator.finish())
    }

    /// Install compiled code. On error nothing is published and the memory
    /// is released.
    pub fn install(&self, mut compiled: CompiledCode) -> Result<Arc<InstalledCode>, InstallError> {
        let data_offset = self.data_offset(&compiled);
        let total = (data_offset + compiled.data.len()).max(1);
        let mut memory = ExecutableMemory::new(total)?;
        let layout = SectionLayout {
            code_base: memory.base(),
            data_base: memory.base() + data_offset as u64,
        };

        let output = self.relocate_at(&mut compiled, layout)?;

        memory.write(0, &compiled.code)?;
        memory.write(data_offset, &compiled.data)?;
        memory.make_executable()?;

        if self.config.trace_install {
            eprintln!(
                "[install] installed {} ({:?}) at {:#x}, {} bytes, {} relocations",
                compiled.name,
                compiled.kind,
                layout.code_base,
                compiled.code.len(),
                output.relocations.len()
            );
        }

        Ok(Arc::new(InstalledCode::new(
            compiled,
            memory,
            data_offset,
            output,
            self.context,
        )))
    }
}
