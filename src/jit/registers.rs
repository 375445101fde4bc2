//! Compiler register indices to native registers.
//!
//! The compiler numbers registers in one flat space: general-purpose
//! registers first, then the XMM file.

use std::fmt;

use crate::error::ContractViolation;

use super::x86_64::{Reg, Xmm};

pub const GPR_COUNT: u32 = 16;
pub const XMM_COUNT: u32 = 16;

/// A physical register as the runtime sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    Gpr(Reg),
    Xmm(Xmm),
}

impl Register {
    pub fn is_general_purpose(self) -> bool {
        !matches!(self, Register::Xmm(_))
    }

    /// Back to the compiler's index space.
    pub fn index(self) -> u32 {
        match self {
            Register::Gpr(r) => r as u32,
            Register::Xmm(x) => GPR_COUNT + x as u32,
        }
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Register::Gpr(r) => write!(f, "{}", r.name()),
            Register::Xmm(x) => write!(f, "xmm{}", *x as u8),
        }
    }
}

/// Translate a compiler register index.
pub fn to_native_register(index: u32) -> Result<Register, ContractViolation> {
    if index < GPR_COUNT {
        return Ok(Register::Gpr(Reg::ALL[index as usize]));
    }
    let xmm = index - GPR_COUNT;
    if xmm < XMM_COUNT {
        return Ok(Register::Xmm(Xmm::ALL[xmm as usize]));
    }
    Err(ContractViolation::RegisterIndexOutOfRange(index))
}
