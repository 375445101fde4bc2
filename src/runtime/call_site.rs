//! Call-site state after installation.
//!
//! A Java call site starts out clean, routed through its resolution stub.
//! Resolution binds it to one callee (monomorphic); a virtual site whose
//! receivers keep changing is bound to a dispatch stub (megamorphic) and
//! stays there until something invalidates it back to clean.

use crate::error::{ContractViolation, InstallError};
use crate::jit::code_blob::InstalledCode;
use crate::jit::codebuf::read_u64;
use crate::jit::decode::decode;
use crate::jit::installer::CLEAN_IC_VALUE;
use crate::jit::reloc::{OperandFormat, RelocKind, Relocation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallSiteState {
    /// Calls the resolution stub.
    Clean,
    /// Bound to a single callee.
    Monomorphic {
        target: u64,
        cached_value: Option<u64>,
    },
    /// Bound to a dispatch stub. Only virtual sites get here.
    Megamorphic { target: u64 },
}

impl CallSiteState {
    pub fn name(&self) -> &'static str {
        match self {
            CallSiteState::Clean => "clean",
            CallSiteState::Monomorphic { .. } => "monomorphic",
            CallSiteState::Megamorphic { .. } => "megamorphic",
        }
    }
}

/// View of one call relocation in an installed artifact.
#[derive(Debug, Clone, Copy)]
pub struct CompiledCallSite<'a> {
    code: &'a InstalledCode,
    reloc: Relocation,
}

impl<'a> CompiledCallSite<'a> {
    pub(crate) fn new(code: &'a InstalledCode, reloc: Relocation) -> Self {
        Self { code, reloc }
    }

    pub fn offset(&self) -> u32 {
        self.reloc.offset
    }

    pub fn kind(&self) -> RelocKind {
        self.reloc.kind
    }

    pub fn state(&self) -> CallSiteState {
        self.code
            .lock()
            .call_sites
            .get(&self.reloc.offset)
            .copied()
            .unwrap_or(CallSiteState::Clean)
    }

    /// Current absolute call target, read from the instruction.
    pub fn destination(&self) -> Result<u64, ContractViolation> {
        let offset = self.reloc.offset;
        let target = self.code.read_code(|code| {
            decode(code, offset as usize)?
                .branch_target(code)
                .ok_or(ContractViolation::OperandMismatch {
                    offset,
                    format: OperandFormat::Call32,
                })
        })?;
        Ok((self.code.code_begin() as i64 + target) as u64)
    }

    /// Inline-cache value of a virtual site.
    pub fn cached_value(&self) -> Result<Option<u64>, ContractViolation> {
        let RelocKind::VirtualCall { ic_mark } = self.reloc.kind else {
            return Ok(None);
        };
        let value = self.code.read_code(|code| {
            let field = decode(code, ic_mark as usize)?.operand(OperandFormat::Imm)?;
            Ok::<_, ContractViolation>(read_u64(code, field.offset))
        })?;
        Ok(Some(value))
    }

    /// Where a clean site points.
    pub fn clean_destination(&self) -> Result<u64, ContractViolation> {
        let stubs = self.code.context().stubs;
        match self.reloc.kind {
            RelocKind::VirtualCall { .. } => Ok(stubs.resolve_virtual),
            RelocKind::StaticCall => Ok(stubs.resolve_static),
            RelocKind::OptVirtualCall => Ok(stubs.resolve_opt_virtual),
            _ => Err(ContractViolation::NoCallSiteAt {
                offset: self.reloc.offset,
            }),
        }
    }

    fn illegal(&self, from: CallSiteState, to: &'static str) -> ContractViolation {
        ContractViolation::IllegalCallSiteTransition {
            offset: self.reloc.offset,
            from: from.name(),
            to,
        }
    }

    /// Call displacement that reaches `target`, checked before anything is
    /// written.
    fn destination_patch(&self, target: u64) -> Result<(usize, [u8; 4]), ContractViolation> {
        let offset = self.reloc.offset;
        let (field, next) = self.code.read_code(|code| {
            let inst = decode(code, offset as usize)?;
            Ok::<_, ContractViolation>((inst.operand(OperandFormat::Call32)?, inst.next()))
        })?;
        let displacement = target as i64 - self.code.address_of(next as u32) as i64;
        let disp = i32::try_from(displacement)
            .map_err(|_| ContractViolation::DisplacementOverflow { offset, displacement })?;
        Ok((field.offset, disp.to_le_bytes()))
    }

    /// Inline-cache immediate for `value`. `None` for sites without one.
    fn cached_value_patch(&self, value: u64) -> Result<Option<(usize, [u8; 8])>, ContractViolation> {
        let RelocKind::VirtualCall { ic_mark } = self.reloc.kind else {
            return Ok(None);
        };
        let field = self.code.read_code(|code| {
            decode(code, ic_mark as usize)?.operand(OperandFormat::Imm)
        })?;
        Ok(Some((field.offset, value.to_le_bytes())))
    }

    /// Write the call target and, when given, the inline cache. Both fields
    /// are computed first so a failed check leaves the site untouched.
    ///
    /// # Safety
    /// Caller holds the patch lock and no thread executes the call.
    unsafe fn retarget(&self, target: u64, cached_value: Option<u64>) -> Result<(), InstallError> {
        let call = self.destination_patch(target)?;
        let ic = match cached_value {
            Some(value) => self.cached_value_patch(value)?,
            None => None,
        };
        unsafe {
            if let Some((field, bytes)) = ic {
                self.code.patch_bytes(field, &bytes)?;
            }
            self.code.patch_bytes(call.0, &call.1)
        }
    }

    /// Bind a clean site to `target`. Virtual sites also store `cached_value`
    /// in their inline cache.
    ///
    /// # Safety
    /// Must run at a safepoint: no thread may execute this call site.
    pub unsafe fn set_to_monomorphic(
        &self,
        target: u64,
        cached_value: Option<u64>,
    ) -> Result<(), InstallError> {
        let mut state = self.code.lock();
        let current = state
            .call_sites
            .get(&self.reloc.offset)
            .copied()
            .unwrap_or(CallSiteState::Clean);
        if current != CallSiteState::Clean {
            return Err(self.illegal(current, "monomorphic").into());
        }

        unsafe { self.retarget(target, cached_value)? };
        state.call_sites.insert(
            self.reloc.offset,
            CallSiteState::Monomorphic {
                target,
                cached_value,
            },
        );
        Ok(())
    }

    /// Send a monomorphic virtual site to a dispatch stub.
    ///
    /// # Safety
    /// Must run at a safepoint: no thread may execute this call site.
    pub unsafe fn set_to_megamorphic(&self, target: u64) -> Result<(), InstallError> {
        let mut state = self.code.lock();
        let current = state
            .call_sites
            .get(&self.reloc.offset)
            .copied()
            .unwrap_or(CallSiteState::Clean);
        let is_virtual = matches!(self.reloc.kind, RelocKind::VirtualCall { .. });
        if !is_virtual || !matches!(current, CallSiteState::Monomorphic { .. }) {
            return Err(self.illegal(current, "megamorphic").into());
        }

        unsafe { self.retarget(target, None)? };
        state
            .call_sites
            .insert(self.reloc.offset, CallSiteState::Megamorphic { target });
        Ok(())
    }

    /// Route the site back through its resolution stub.
    ///
    /// # Safety
    /// Must run at a safepoint: no thread may execute this call site.
    pub unsafe fn set_to_clean(&self) -> Result<(), InstallError> {
        let mut state = self.code.lock();
        let destination = self.clean_destination()?;
        unsafe { self.retarget(destination, Some(CLEAN_IC_VALUE))? };
        state.call_sites.remove(&self.reloc.offset);
        Ok(())
    }
}
