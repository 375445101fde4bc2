//! Shared runtime stubs.
//!
//! Unresolved call sites and failed inline-cache checks land in one of
//! these. Each stub preserves the Java argument registers, asks an
//! embedder-supplied resolver where the call should really go, and jumps
//! there with the arguments intact.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::InstallError;
use crate::jit::code_blob::InstalledCode;
use crate::jit::codebuf::CodeBuffer;
use crate::jit::installer::{CodeInstaller, CodeKind, CompiledCode, Site, SiteKind};
use crate::jit::x86_64::{Reg, X86_64Assembler};

use super::calling_convention::{FP_ARGS, IC_REG, J_RARGS, METHOD_REG, THREAD_REG};
use super::thread::ManagedThread;

/// Entry addresses of the shared stubs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeStubs {
    pub resolve_virtual: u64,
    pub resolve_static: u64,
    pub resolve_opt_virtual: u64,
    pub ic_miss: u64,
    pub wrong_method: u64,
    pub abstract_method_error: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubKind {
    ResolveVirtual,
    ResolveStatic,
    ResolveOptVirtual,
    IcMiss,
    WrongMethod,
    AbstractMethodError,
}

impl StubKind {
    pub const ALL: [StubKind; 6] = [
        StubKind::ResolveVirtual,
        StubKind::ResolveStatic,
        StubKind::ResolveOptVirtual,
        StubKind::IcMiss,
        StubKind::WrongMethod,
        StubKind::AbstractMethodError,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StubKind::ResolveVirtual => "resolve_virtual_call",
            StubKind::ResolveStatic => "resolve_static_call",
            StubKind::ResolveOptVirtual => "resolve_opt_virtual_call",
            StubKind::IcMiss => "ic_miss",
            StubKind::WrongMethod => "handle_wrong_method",
            StubKind::AbstractMethodError => "abstract_method_error",
        }
    }
}

impl RuntimeStubs {
    pub fn get(&self, kind: StubKind) -> u64 {
        match kind {
            StubKind::ResolveVirtual => self.resolve_virtual,
            StubKind::ResolveStatic => self.resolve_static,
            StubKind::ResolveOptVirtual => self.resolve_opt_virtual,
            StubKind::IcMiss => self.ic_miss,
            StubKind::WrongMethod => self.wrong_method,
            StubKind::AbstractMethodError => self.abstract_method_error,
        }
    }

    fn set(&mut self, kind: StubKind, address: u64) {
        let slot = match kind {
            StubKind::ResolveVirtual => &mut self.resolve_virtual,
            StubKind::ResolveStatic => &mut self.resolve_static,
            StubKind::ResolveOptVirtual => &mut self.resolve_opt_virtual,
            StubKind::IcMiss => &mut self.ic_miss,
            StubKind::WrongMethod => &mut self.wrong_method,
            StubKind::AbstractMethodError => &mut self.abstract_method_error,
        };
        *slot = address;
    }
}

/// Resolver called by a stub with the current thread. Returns the address
/// the stub jumps to.
pub type Resolver = extern "C" fn(*mut ManagedThread) -> u64;

/// Resolvers behind each stub, supplied by the embedder.
#[derive(Clone, Copy)]
pub struct RuntimeEntryPoints {
    pub resolve_virtual: Resolver,
    pub resolve_static: Resolver,
    pub resolve_opt_virtual: Resolver,
    pub ic_miss: Resolver,
    pub wrong_method: Resolver,
    pub abstract_method_error: Resolver,
}

impl RuntimeEntryPoints {
    pub fn get(&self, kind: StubKind) -> Resolver {
        match kind {
            StubKind::ResolveVirtual => self.resolve_virtual,
            StubKind::ResolveStatic => self.resolve_static,
            StubKind::ResolveOptVirtual => self.resolve_opt_virtual,
            StubKind::IcMiss => self.ic_miss,
            StubKind::WrongMethod => self.wrong_method,
            StubKind::AbstractMethodError => self.abstract_method_error,
        }
    }
}

impl fmt::Debug for RuntimeEntryPoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("RuntimeEntryPoints");
        for kind in StubKind::ALL {
            s.field(kind.name(), &format_args!("{:#x}", self.get(kind) as usize));
        }
        s.finish()
    }
}

fn unlinked(kind: StubKind) -> ! {
    eprintln!("[runtime] call through {} with no resolver installed", kind.name());
    std::process::abort()
}

extern "C" fn unlinked_resolve_virtual(_: *mut ManagedThread) -> u64 {
    unlinked(StubKind::ResolveVirtual)
}

extern "C" fn unlinked_resolve_static(_: *mut ManagedThread) -> u64 {
    unlinked(StubKind::ResolveStatic)
}

extern "C" fn unlinked_resolve_opt_virtual(_: *mut ManagedThread) -> u64 {
    unlinked(StubKind::ResolveOptVirtual)
}

extern "C" fn unlinked_ic_miss(_: *mut ManagedThread) -> u64 {
    unlinked(StubKind::IcMiss)
}

extern "C" fn unlinked_wrong_method(_: *mut ManagedThread) -> u64 {
    unlinked(StubKind::WrongMethod)
}

extern "C" fn unlinked_abstract_method_error(_: *mut ManagedThread) -> u64 {
    unlinked(StubKind::AbstractMethodError)
}

impl Default for RuntimeEntryPoints {
    fn default() -> Self {
        Self {
            resolve_virtual: unlinked_resolve_virtual,
            resolve_static: unlinked_resolve_static,
            resolve_opt_virtual: unlinked_resolve_opt_virtual,
            ic_miss: unlinked_ic_miss,
            wrong_method: unlinked_wrong_method,
            abstract_method_error: unlinked_abstract_method_error,
        }
    }
}

const FP_SAVE_AREA: i32 = (FP_ARGS.len() * 8) as i32;

/// Registers a stub must hand through unchanged, in push order.
fn saved_registers() -> impl DoubleEndedIterator<Item = Reg> {
    [IC_REG, METHOD_REG].into_iter().chain(J_RARGS)
}

/// Emit one stub. Returns the code and the offset of the resolver load.
fn emit_stub(resolver: Resolver) -> (Vec<u8>, u32) {
    let mut buf = CodeBuffer::new();
    let mut asm = X86_64Assembler::new(&mut buf);

    asm.push(Reg::Rbp);
    asm.mov_rr(Reg::Rbp, Reg::Rsp);
    for reg in saved_registers() {
        asm.push(reg);
    }
    // Eight pushes plus rbp keep rsp 16-byte aligned for the call below.
    asm.sub_ri32(Reg::Rsp, FP_SAVE_AREA);
    for (i, xmm) in FP_ARGS.iter().enumerate() {
        asm.movsd_store(Reg::Rsp, i as i32 * 8, *xmm);
    }

    asm.mov_rr(Reg::Rdi, THREAD_REG);
    let call_site = asm.offset() as u32;
    asm.mov_ri64(Reg::R10, resolver as usize as i64);
    asm.call_r(Reg::R10);
    asm.mov_rr(Reg::R11, Reg::Rax);

    for (i, xmm) in FP_ARGS.iter().enumerate() {
        asm.movsd_load(*xmm, Reg::Rsp, i as i32 * 8);
    }
    asm.add_ri32(Reg::Rsp, FP_SAVE_AREA);
    for reg in saved_registers().rev() {
        asm.pop(reg);
    }
    asm.pop(Reg::Rbp);
    asm.jmp_r(Reg::R11);

    (buf.into_code(), call_site)
}

/// Generate and install every stub.
pub fn generate(
    installer: &CodeInstaller,
    entry_points: &RuntimeEntryPoints,
) -> Result<(RuntimeStubs, Vec<Arc<InstalledCode>>), InstallError> {
    let mut stubs = RuntimeStubs::default();
    let mut blobs = Vec::with_capacity(StubKind::ALL.len());

    for kind in StubKind::ALL {
        let (code, call_site) = emit_stub(entry_points.get(kind));
        let mut compiled = CompiledCode::new(kind.name(), CodeKind::RuntimeStub, code);
        compiled.sites.push(Site::new(
            call_site,
            SiteKind::ForeignCall {
                destination: entry_points.get(kind) as usize as u64,
                debug: None,
            },
        ));
        let blob = installer.install(compiled)?;
        stubs.set(kind, blob.code_begin());
        blobs.push(blob);
    }

    Ok((stubs, blobs))
}
