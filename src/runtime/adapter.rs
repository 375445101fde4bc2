//! Interpreted/compiled calling-convention adapters.
//!
//! Every method with the same fingerprint shares one handler: an i2c entry
//! (interpreter calling compiled code), a c2i entry (compiled code calling
//! the interpreter) and an unverified c2i entry that checks the inline
//! cache first. Handlers are generated on first request and kept for the
//! lifetime of the library.
//!
//! Interpreter frames hold one 8-byte slot per argument slot, first
//! argument at the highest address. A long or double occupies two slots
//! and its value lives in the lower-addressed one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{InstallError, MemoryError};
use crate::jit::code_blob::InstalledCode;
use crate::jit::codebuf::CodeBuffer;
use crate::jit::installer::{CodeInstaller, CodeKind, CompiledCode, EntryOffsets, Site, SiteKind};
use crate::jit::registers::Register;
use crate::jit::x86_64::{Cond, Reg, X86_64Assembler};

use super::calling_convention::{
    ArgLayout, ArgLocation, IC_REG, J_RARGS, METHOD_REG, SENDER_SP_REG, java_calling_convention,
};
use super::method::{Method, METHOD_FROM_COMPILED_OFFSET, METHOD_INTERPRETER_ENTRY_OFFSET};
use super::objects::{IC_HOLDER_KLASS_OFFSET, IC_HOLDER_METHOD_OFFSET, KLASS_OFFSET};
use super::signature::{BasicType, Fingerprint};

/// Index of the handler shared by all abstract methods.
pub const ABSTRACT_HANDLER_INDEX: usize = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterHandlerEntry {
    index: usize,
    fingerprint: Fingerprint,
    i2c_entry: u64,
    c2i_entry: u64,
    c2i_unverified_entry: u64,
}

impl AdapterHandlerEntry {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn i2c_entry(&self) -> u64 {
        self.i2c_entry
    }

    pub fn c2i_entry(&self) -> u64 {
        self.c2i_entry
    }

    pub fn c2i_unverified_entry(&self) -> u64 {
        self.c2i_unverified_entry
    }
}

#[derive(Debug, Default)]
struct LibraryState {
    handlers: Vec<Arc<AdapterHandlerEntry>>,
    by_fingerprint: HashMap<Fingerprint, usize>,
    blobs: Vec<Arc<InstalledCode>>,
    code_bytes: usize,
}

/// Fingerprint-keyed cache of adapter handlers.
#[derive(Debug)]
pub struct AdapterHandlerLibrary {
    installer: CodeInstaller,
    state: Mutex<LibraryState>,
}

impl AdapterHandlerLibrary {
    /// `installer` must already resolve against the real runtime stubs.
    pub fn new(installer: CodeInstaller) -> Self {
        let abstract_error = installer.context().stubs.abstract_method_error;
        let mut state = LibraryState::default();
        state.handlers.push(Arc::new(AdapterHandlerEntry {
            index: ABSTRACT_HANDLER_INDEX,
            fingerprint: Fingerprint::default(),
            i2c_entry: abstract_error,
            c2i_entry: abstract_error,
            c2i_unverified_entry: abstract_error,
        }));
        Self {
            installer,
            state: Mutex::new(state),
        }
    }

    /// Handler for `method`, generating it on first use of its fingerprint.
    pub fn get_adapter(&self, method: &Method) -> Result<Arc<AdapterHandlerEntry>, InstallError> {
        let trace = self.installer.config().trace_adapters;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if method.is_abstract() {
            return Ok(state.handlers[ABSTRACT_HANDLER_INDEX].clone());
        }

        let fingerprint = Fingerprint::for_method(method.signature(), method.is_static());
        if let Some(&index) = state.by_fingerprint.get(&fingerprint) {
            if trace {
                eprintln!(
                    "[adapter] hit {} {} -> #{}",
                    method.name(),
                    fingerprint,
                    index
                );
            }
            return Ok(state.handlers[index].clone());
        }

        let args: Vec<BasicType> = method
            .signature()
            .java_args(method.is_static())
            .into_iter()
            .map(BasicType::normalized)
            .collect();
        let (compiled, offsets) = generate_adapter(&fingerprint, &args, &self.installer);

        if let Some(limit) = self.installer.config().max_adapter_code {
            let requested = compiled.code.len();
            if state.code_bytes + requested > limit {
                return Err(MemoryError::CodeCacheFull { requested, limit }.into());
            }
        }

        let blob = self.installer.install(compiled)?;
        let index = state.handlers.len();
        let entry = Arc::new(AdapterHandlerEntry {
            index,
            fingerprint: fingerprint.clone(),
            i2c_entry: blob.address_of(offsets.i2c),
            c2i_entry: blob.address_of(offsets.c2i),
            c2i_unverified_entry: blob.address_of(offsets.c2i_unverified),
        });

        if trace {
            eprintln!(
                "[adapter] new #{} for {} {}: i2c {:#x}, c2i {:#x}, c2i unverified {:#x}",
                index,
                method.name(),
                fingerprint,
                entry.i2c_entry,
                entry.c2i_entry,
                entry.c2i_unverified_entry
            );
        }

        state.code_bytes += blob.code_len();
        state.blobs.push(blob);
        state.handlers.push(entry.clone());
        state.by_fingerprint.insert(fingerprint, index);
        Ok(entry)
    }

    pub fn get_entry(&self, index: usize) -> Option<Arc<AdapterHandlerEntry>> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.handlers.get(index).cloned()
    }

    /// Number of handlers, the abstract one included.
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handlers
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes of generated adapter code.
    pub fn code_size(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .code_bytes
    }
}

struct AdapterOffsets {
    i2c: u32,
    c2i_unverified: u32,
    c2i: u32,
}

/// Offset of each argument's value slot from the lowest argument slot.
fn interpreter_offsets(args: &[BasicType]) -> Vec<i32> {
    let total: usize = args.iter().map(|t| t.slots()).sum();
    let mut slot = 0;
    let mut offsets = Vec::with_capacity(args.len());
    for ty in args {
        let value_slot = slot + ty.slots() - 1;
        offsets.push(((total - 1 - value_slot) * 8) as i32);
        slot += ty.slots();
    }
    offsets
}

fn round_up(value: usize, to: usize) -> usize {
    value.div_ceil(to) * to
}

/// Interpreter → compiled. Entered with the interpreter's arguments above
/// the return address and the callee in the method register.
fn emit_i2c(asm: &mut X86_64Assembler, layout: &ArgLayout, offsets: &[i32]) {
    asm.mov_rr(Reg::R11, Reg::Rsp);
    asm.mov_rm(Reg::Rax, Reg::Rsp, 0);
    if layout.stack_slots > 0 {
        asm.sub_ri32(Reg::Rsp, layout.stack_slots as i32 * 8);
    }
    asm.and_ri32(Reg::Rsp, -16);
    asm.push(Reg::Rax);

    for (location, offset) in layout.locations.iter().zip(offsets) {
        let src = 8 + offset;
        match *location {
            ArgLocation::Reg(Register::Gpr(reg)) => asm.mov_rm(reg, Reg::R11, src),
            ArgLocation::Reg(Register::Xmm(xmm)) => asm.movsd_load(xmm, Reg::R11, src),
            ArgLocation::Stack(k) => {
                asm.mov_rm(Reg::R10, Reg::R11, src);
                asm.mov_mr(Reg::Rsp, 8 + k as i32 * 8, Reg::R10);
            }
        }
    }

    asm.mov_rm(Reg::R11, METHOD_REG, METHOD_FROM_COMPILED_OFFSET);
    asm.jmp_r(Reg::R11);
}

/// Receiver class check against the inline-cache holder. Loads the callee
/// from the holder and branches to the miss stub on mismatch. Returns the
/// offset of the branch.
fn emit_ic_check(asm: &mut X86_64Assembler) -> u32 {
    let receiver = J_RARGS[0];
    asm.mov_rm(Reg::R10, receiver, KLASS_OFFSET);
    asm.cmp_rm(Reg::R10, IC_REG, IC_HOLDER_KLASS_OFFSET);
    asm.mov_rm(METHOD_REG, IC_REG, IC_HOLDER_METHOD_OFFSET);
    let miss = asm.offset() as u32;
    asm.jcc_rel32(Cond::Ne, 0);
    miss
}

/// Compiled → interpreter. Builds the interpreter's argument area under
/// the return address and enters the interpreter with the caller's stack
/// pointer in the sender-SP register.
fn emit_c2i(asm: &mut X86_64Assembler, layout: &ArgLayout, offsets: &[i32], total_slots: usize) {
    asm.pop(Reg::Rax);
    asm.mov_rr(SENDER_SP_REG, Reg::Rsp);
    let area = round_up(total_slots * 8, 16);
    if area > 0 {
        asm.sub_ri32(Reg::Rsp, area as i32);
    }
    asm.push(Reg::Rax);

    for (location, offset) in layout.locations.iter().zip(offsets) {
        let dst = 8 + offset;
        match *location {
            ArgLocation::Reg(Register::Gpr(reg)) => asm.mov_mr(Reg::Rsp, dst, reg),
            ArgLocation::Reg(Register::Xmm(xmm)) => asm.movsd_store(Reg::Rsp, dst, xmm),
            ArgLocation::Stack(k) => {
                asm.mov_rm(Reg::R10, SENDER_SP_REG, k as i32 * 8);
                asm.mov_mr(Reg::Rsp, dst, Reg::R10);
            }
        }
    }

    asm.jmp_m(METHOD_REG, METHOD_INTERPRETER_ENTRY_OFFSET);
}

fn generate_adapter(
    fingerprint: &Fingerprint,
    args: &[BasicType],
    installer: &CodeInstaller,
) -> (CompiledCode, AdapterOffsets) {
    let layout = java_calling_convention(args);
    let offsets = interpreter_offsets(args);
    let total_slots: usize = args.iter().map(|t| t.slots()).sum();

    let mut buf = CodeBuffer::new();
    let mut asm = X86_64Assembler::new(&mut buf);

    let i2c = asm.offset() as u32;
    emit_i2c(&mut asm, &layout, &offsets);

    asm.align(16);
    let c2i_unverified = asm.offset() as u32;
    let miss = emit_ic_check(&mut asm);

    let c2i = asm.offset() as u32;
    emit_c2i(&mut asm, &layout, &offsets, total_slots);

    let mut compiled = CompiledCode::new(
        &format!("adapter {}", fingerprint),
        CodeKind::BufferBlob,
        buf.into_code(),
    );
    compiled.entries = EntryOffsets {
        verified_entry: c2i,
        unverified_entry: Some(c2i_unverified),
    };
    compiled.sites.push(Site::new(
        miss,
        SiteKind::ForeignCall {
            destination: installer.context().stubs.ic_miss,
            debug: None,
        },
    ));

    (
        compiled,
        AdapterOffsets {
            i2c,
            c2i_unverified,
            c2i,
        },
    )
}
