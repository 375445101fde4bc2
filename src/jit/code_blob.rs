//! Installed code and everything that touches it after publication.
//!
//! An [`InstalledCode`] owns its executable memory, relocation entries and
//! oop maps. Later changes (call-site transitions, moved objects, moving
//! the whole artifact) all go through the entries recorded at install time
//! and serialize on the artifact's patch lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{ContractViolation, InstallError};
use crate::runtime::call_site::{CallSiteState, CompiledCallSite};
use crate::runtime::objects::{ObjectRef, ObjectTable};

use super::codebuf::{SectionLayout, read_u32, read_u64};
use super::decode::decode;
use super::installer::{CodeKind, CompiledCode, EntryOffsets, InstallContext, RelocatorOutput};
use super::memory::ExecutableMemory;
use super::reloc::{OopRef, OperandFormat, RelocKind, RelocationTable};
use super::stackmap::OopMapSet;

/// State that changes after installation. Guarded by the patch lock.
#[derive(Debug, Default, Clone)]
pub(crate) struct PatchState {
    pub(crate) objects: ObjectTable,
    pub(crate) call_sites: HashMap<u32, CallSiteState>,
}

pub struct InstalledCode {
    name: String,
    kind: CodeKind,
    memory: ExecutableMemory,
    code_len: usize,
    data_offset: usize,
    data_len: usize,
    entries: EntryOffsets,
    frame_size: u32,
    relocations: RelocationTable,
    oop_maps: OopMapSet,
    context: InstallContext,
    patch: Mutex<PatchState>,
}

impl std::fmt::Debug for InstalledCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstalledCode")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("code_begin", &format_args!("{:#x}", self.code_begin()))
            .field("code_len", &self.code_len)
            .field("relocations", &self.relocations.len())
            .finish()
    }
}

impl InstalledCode {
    pub(crate) fn new(
        compiled: CompiledCode,
        memory: ExecutableMemory,
        data_offset: usize,
        output: RelocatorOutput,
        context: InstallContext,
    ) -> Self {
        Self {
            name: compiled.name,
            kind: compiled.kind,
            memory,
            code_len: compiled.code.len(),
            data_offset,
            data_len: compiled.data.len(),
            entries: compiled.entries,
            frame_size: compiled.frame_size,
            relocations: output.relocations,
            oop_maps: output.oop_maps,
            context,
            patch: Mutex::new(PatchState {
                objects: output.objects,
                call_sites: HashMap::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> CodeKind {
        self.kind
    }

    pub fn code_begin(&self) -> u64 {
        self.memory.base()
    }

    pub fn code_end(&self) -> u64 {
        self.code_begin() + self.code_len as u64
    }

    pub fn code_len(&self) -> usize {
        self.code_len
    }

    pub fn contains(&self, address: u64) -> bool {
        (self.code_begin()..self.code_end()).contains(&address)
    }

    pub fn layout(&self) -> SectionLayout {
        SectionLayout {
            code_base: self.memory.base(),
            data_base: self.memory.base() + self.data_offset as u64,
        }
    }

    /// Absolute address of a code offset.
    pub fn address_of(&self, offset: u32) -> u64 {
        self.code_begin() + offset as u64
    }

    pub fn verified_entry_point(&self) -> u64 {
        self.address_of(self.entries.verified_entry)
    }

    /// Entry used by callers that have not checked the receiver class.
    pub fn entry_point(&self) -> u64 {
        self.address_of(
            self.entries
                .unverified_entry
                .unwrap_or(self.entries.verified_entry),
        )
    }

    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    pub fn relocations(&self) -> &RelocationTable {
        &self.relocations
    }

    pub fn oop_maps(&self) -> &OopMapSet {
        &self.oop_maps
    }

    pub fn context(&self) -> &InstallContext {
        &self.context
    }

    pub fn is_executable(&self) -> bool {
        self.memory.is_executable()
    }

    /// Copy of the current code bytes.
    pub fn code(&self) -> Vec<u8> {
        let _guard = self.lock();
        self.read_code(|code| code.to_vec())
    }

    pub fn data(&self) -> Vec<u8> {
        self.memory.bytes()[self.data_offset..self.data_offset + self.data_len].to_vec()
    }

    /// Objects referenced through the object table.
    pub fn objects(&self) -> Vec<ObjectRef> {
        self.lock().objects.iter().copied().collect()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, PatchState> {
        self.patch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Short-lived view of the code section. Callers hold the patch lock
    /// or accept a racy read.
    pub(crate) fn read_code<T>(&self, f: impl FnOnce(&[u8]) -> T) -> T {
        f(&self.memory.bytes()[..self.code_len])
    }

    /// # Safety
    /// The caller holds the patch lock and no thread executes the bytes.
    pub(crate) unsafe fn patch_bytes(&self, offset: usize, bytes: &[u8]) -> Result<(), InstallError> {
        unsafe { self.memory.patch(offset, bytes) }?;
        Ok(())
    }

    /// The call site recorded at `offset`.
    pub fn call_site(&self, offset: u32) -> Result<CompiledCallSite<'_>, ContractViolation> {
        match self.relocations.get(offset) {
            Some(reloc) if reloc.format == OperandFormat::Call32 && reloc.kind.is_java_call() => {
                Ok(CompiledCallSite::new(self, *reloc))
            }
            _ => Err(ContractViolation::NoCallSiteAt { offset }),
        }
    }

    /// Let the collector update every object this code refers to.
    ///
    /// `f` maps an object to its current location and is called once per
    /// object-table slot and once per immediate.
    ///
    /// # Safety
    /// Must run at a safepoint: no thread may execute this code meanwhile.
    pub unsafe fn oops_do(
        &self,
        mut f: impl FnMut(ObjectRef) -> ObjectRef,
    ) -> Result<(), InstallError> {
        let mut state = self.lock();

        for index in 0..state.objects.len() {
            if let Some(old) = state.objects.get(index) {
                state.objects.set(index, f(old));
            }
        }

        for reloc in self.relocations.iter() {
            let RelocKind::Oop(oop) = reloc.kind else {
                continue;
            };
            let offset = reloc.offset as usize;
            match oop {
                OopRef::Immediate => {
                    let (field, old) = self.read_code(|code| {
                        let field = decode(code, offset)?.operand(OperandFormat::Imm)?;
                        Ok::<_, ContractViolation>((field, ObjectRef(read_u64(code, field.offset))))
                    })?;
                    let new = f(old);
                    if new != old {
                        unsafe { self.patch_bytes(field.offset, &new.0.to_le_bytes())? };
                    }
                }
                OopRef::Index(index) => {
                    let object = state
                        .objects
                        .get(index)
                        .ok_or(ContractViolation::OperandMismatch {
                            offset: reloc.offset,
                            format: OperandFormat::NarrowOop,
                        })?;
                    let narrow = self.context.narrow_oops.encode(object).ok_or(
                        ContractViolation::NarrowOopOutOfRange {
                            offset: reloc.offset,
                            object: object.0,
                        },
                    )?;
                    let (field, current) = self.read_code(|code| {
                        let field = decode(code, offset)?.operand(OperandFormat::NarrowOop)?;
                        Ok::<_, ContractViolation>((field, read_u32(code, field.offset)))
                    })?;
                    if current != narrow {
                        unsafe { self.patch_bytes(field.offset, &narrow.to_le_bytes())? };
                    }
                }
            }
        }
        Ok(())
    }

    /// Move the artifact to freshly allocated memory.
    ///
    /// Branch and poll targets keep their absolute destinations, data
    /// references follow the data section. The old copy stays valid until
    /// dropped.
    pub fn relocate(&self) -> Result<Arc<InstalledCode>, InstallError> {
        let state = self.lock();
        let mut code = self.read_code(|code| code.to_vec());
        let data = self.data();

        let mut memory = ExecutableMemory::new((self.data_offset + self.data_len).max(1))?;
        let old = self.layout();
        let new = SectionLayout {
            code_base: memory.base(),
            data_base: memory.base() + self.data_offset as u64,
        };
        for reloc in self.relocations.iter() {
            reloc.fix_after_move(&mut code, old, new)?;
        }

        memory.write(0, &code)?;
        memory.write(self.data_offset, &data)?;
        memory.make_executable()?;

        Ok(Arc::new(InstalledCode {
            name: self.name.clone(),
            kind: self.kind,
            memory,
            code_len: self.code_len,
            data_offset: self.data_offset,
            data_len: self.data_len,
            entries: self.entries,
            frame_size: self.frame_size,
            relocations: self.relocations.clone(),
            oop_maps: self.oop_maps.clone(),
            context: self.context,
            patch: Mutex::new((*state).clone()),
        }))
    }
}
