//! Error types for code installation and adapter generation.
//!
//! Two families, handled differently by callers:
//! - [`ContractViolation`]: the compiler handed us something inconsistent
//!   with the bytes it emitted. Never recoverable; installation is aborted.
//! - [`MemoryError`]: code memory could not be obtained. The caller may
//!   retry later or fall back to the interpreter.

pub use crate::jit::memory::MemoryError;

use crate::jit::reloc::OperandFormat;

/// A broken compiler/runtime contract detected while installing or patching code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractViolation {
    /// A site offset (or a length read from it) lies outside the code section.
    OffsetOutOfBounds { offset: u32, len: usize },
    /// Two site descriptors name the same instruction.
    DuplicateSite { offset: u32 },
    /// The bytes at `offset` are not an instruction form we can decode.
    UndecodableInstruction { offset: u32, byte: u8 },
    /// The instruction at `offset` has no operand of the requested format.
    OperandMismatch { offset: u32, format: OperandFormat },
    /// Instruction kind not allowed at a call site.
    UnsupportedCallSite { offset: u32 },
    /// A `mov r64, imm64` call pair is not followed by `REX FF /2`.
    UnexpectedCallEncoding { offset: u32, bytes: [u8; 3] },
    /// Instruction kind not allowed for a foreign call relocation.
    UnsupportedForeignCall { offset: u32 },
    /// A computed displacement does not fit its operand.
    DisplacementOverflow { offset: u32, displacement: i64 },
    /// An object cannot be represented in the compressed form.
    NarrowOopOutOfRange { offset: u32, object: u64 },
    /// Raw poll tag outside the known set.
    InvalidPollKind(i32),
    /// Compiler register index outside both register files.
    RegisterIndexOutOfRange(u32),
    /// A virtual or interface call without its inline-cache mark.
    MissingInvokeMark { offset: u32 },
    /// Static tag used on an instance method or the reverse.
    CallTypeMismatch { offset: u32, is_static: bool },
    /// A register call site without a method (only inlined vtable dispatch uses them).
    RegisterCallWithoutMethod { offset: u32 },
    /// Safepoint polls or debug info inside a blob that must not stop.
    SafepointInBufferBlob { offset: u32 },
    /// A far poll site that is not `test` through a base register.
    UnexpectedPollEncoding { offset: u32 },
    /// Re-patch requested where no call relocation exists.
    NoCallSiteAt { offset: u32 },
    /// A generated stub jumps to a label that was never defined.
    UnboundLabel(String),
    /// A call-site state change the state machine does not allow.
    IllegalCallSiteTransition {
        offset: u32,
        from: &'static str,
        to: &'static str,
    },
}

impl std::fmt::Display for ContractViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContractViolation::OffsetOutOfBounds { offset, len } => {
                write!(f, "offset {:#x} outside code section of {} bytes", offset, len)
            }
            ContractViolation::DuplicateSite { offset } => {
                write!(f, "more than one site at offset {:#x}", offset)
            }
            ContractViolation::UndecodableInstruction { offset, byte } => {
                write!(f, "cannot decode instruction at {:#x} (byte {:#04x})", offset, byte)
            }
            ContractViolation::OperandMismatch { offset, format } => {
                write!(f, "instruction at {:#x} has no {:?} operand", offset, format)
            }
            ContractViolation::UnsupportedCallSite { offset } => {
                write!(f, "unsupported type of instruction for call site at {:#x}", offset)
            }
            ContractViolation::UnexpectedCallEncoding { offset, bytes } => write!(
                f,
                "expected call with rex/rexb prefix byte at {:#x}, found {:02x} {:02x} {:02x}",
                offset, bytes[0], bytes[1], bytes[2]
            ),
            ContractViolation::UnsupportedForeignCall { offset } => {
                write!(f, "unsupported relocation for foreign call at {:#x}", offset)
            }
            ContractViolation::DisplacementOverflow {
                offset,
                displacement,
            } => write!(
                f,
                "displacement {:#x} at {:#x} does not fit in 32 bits",
                displacement, offset
            ),
            ContractViolation::NarrowOopOutOfRange { offset, object } => write!(
                f,
                "object {:#x} at {:#x} cannot be compressed",
                object, offset
            ),
            ContractViolation::InvalidPollKind(raw) => write!(f, "invalid poll kind {}", raw),
            ContractViolation::RegisterIndexOutOfRange(index) => {
                write!(f, "register index {} maps to no native register", index)
            }
            ContractViolation::MissingInvokeMark { offset } => {
                write!(f, "virtual call at {:#x} has no inline-cache mark", offset)
            }
            ContractViolation::CallTypeMismatch { offset, is_static } => {
                if *is_static {
                    write!(f, "cannot call static method with instance call type at {:#x}", offset)
                } else {
                    write!(f, "cannot call non-static method with invokestatic at {:#x}", offset)
                }
            }
            ContractViolation::RegisterCallWithoutMethod { offset } => {
                write!(f, "register call at {:#x} is only valid for virtual calls", offset)
            }
            ContractViolation::SafepointInBufferBlob { offset } => {
                write!(f, "buffer blob has a safepoint at {:#x}", offset)
            }
            ContractViolation::UnexpectedPollEncoding { offset } => {
                write!(f, "far poll at {:#x} must test memory through a register", offset)
            }
            ContractViolation::NoCallSiteAt { offset } => {
                write!(f, "no call relocation at {:#x}", offset)
            }
            ContractViolation::UnboundLabel(label) => write!(f, "undefined label: {}", label),
            ContractViolation::IllegalCallSiteTransition { offset, from, to } => write!(
                f,
                "call site at {:#x} cannot go from {} to {}",
                offset, from, to
            ),
        }
    }
}

impl std::error::Error for ContractViolation {}

/// Error returned by installation, adapter creation and re-patching.
#[derive(Debug)]
pub enum InstallError {
    Contract(ContractViolation),
    Memory(MemoryError),
}

impl InstallError {
    /// True for failures the caller may recover from (out of code memory).
    pub fn is_recoverable(&self) -> bool {
        matches!(self, InstallError::Memory(_))
    }
}

impl std::fmt::Display for InstallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstallError::Contract(e) => write!(f, "contract violation: {}", e),
            InstallError::Memory(e) => write!(f, "code memory: {}", e),
        }
    }
}

impl std::error::Error for InstallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InstallError::Contract(e) => Some(e),
            InstallError::Memory(e) => Some(e),
        }
    }
}

impl From<ContractViolation> for InstallError {
    fn from(e: ContractViolation) -> Self {
        InstallError::Contract(e)
    }
}

impl From<MemoryError> for InstallError {
    fn from(e: MemoryError) -> Self {
        InstallError::Memory(e)
    }
}
