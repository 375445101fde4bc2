//! jitlink - code installation and calling-convention adapters for a
//! managed runtime on x86-64.
//!
//! The installer turns compiler output into executable, patchable code;
//! the shared runtime generates the stubs and adapters that connect it to
//! the interpreter and to native code.

pub mod config;
pub mod error;
pub mod jit;
pub mod manifest;
pub mod runtime;

// Re-export commonly used types
pub use config::RuntimeConfig;
pub use error::{ContractViolation, InstallError, MemoryError};
pub use jit::code_blob::InstalledCode;
pub use jit::installer::{CodeInstaller, CompiledCode, Site, SiteKind};
pub use runtime::SharedRuntime;
