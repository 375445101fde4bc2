//! Code installation infrastructure.
//!
//! - Executable memory and the polling page
//! - Code buffer and the x86-64 encoder used by generated stubs
//! - Length decoder for locating patchable operands
//! - Relocation entries, oop maps and the register mapper
//! - The installer and installed-code artifacts

pub mod code_blob;
pub mod codebuf;
pub mod decode;
pub mod installer;
pub mod memory;
pub mod registers;
pub mod reloc;
pub mod stackmap;
pub mod x86_64;
