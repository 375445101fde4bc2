//! Methods as the adapter library and the installer see them.

use std::mem::offset_of;
use std::sync::atomic::{AtomicU64, Ordering};

use super::objects::ObjectRef;
use super::signature::{MethodSignature, SignatureError};

/// Method access flags (class-file encoding).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccessFlags(pub u16);

impl AccessFlags {
    pub const PUBLIC: u16 = 0x0001;
    pub const STATIC: u16 = 0x0008;
    pub const NATIVE: u16 = 0x0100;
    pub const ABSTRACT: u16 = 0x0400;

    pub fn is_static(self) -> bool {
        self.0 & Self::STATIC != 0
    }

    pub fn is_abstract(self) -> bool {
        self.0 & Self::ABSTRACT != 0
    }
}

/// The part of a method generated code reads through the method register.
#[repr(C)]
#[derive(Debug, Default)]
pub struct MethodBlock {
    /// Where compiled callers enter: compiled code, or the c2i adapter.
    from_compiled_entry: AtomicU64,
    /// Where interpreted callers enter: the interpreter, or the i2c adapter.
    from_interpreted_entry: AtomicU64,
    /// The interpreter's entry for this method.
    interpreter_entry: AtomicU64,
}

pub const METHOD_FROM_COMPILED_OFFSET: i32 = offset_of!(MethodBlock, from_compiled_entry) as i32;
pub const METHOD_FROM_INTERPRETED_OFFSET: i32 =
    offset_of!(MethodBlock, from_interpreted_entry) as i32;
pub const METHOD_INTERPRETER_ENTRY_OFFSET: i32 =
    offset_of!(MethodBlock, interpreter_entry) as i32;

#[derive(Debug)]
pub struct Method {
    name: String,
    descriptor: String,
    flags: AccessFlags,
    signature: MethodSignature,
    /// Class mirror of the holder, passed to static native methods.
    holder_mirror: ObjectRef,
    block: Box<MethodBlock>,
}

impl Method {
    pub fn new(name: &str, descriptor: &str, flags: AccessFlags) -> Result<Self, SignatureError> {
        let signature = MethodSignature::parse(descriptor)?;
        Ok(Self {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            flags,
            signature,
            holder_mirror: ObjectRef::NULL,
            block: Box::default(),
        })
    }

    pub fn with_holder_mirror(mut self, mirror: ObjectRef) -> Self {
        self.holder_mirror = mirror;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub fn flags(&self) -> AccessFlags {
        self.flags
    }

    pub fn is_static(&self) -> bool {
        self.flags.is_static()
    }

    pub fn is_abstract(&self) -> bool {
        self.flags.is_abstract()
    }

    pub fn signature(&self) -> &MethodSignature {
        &self.signature
    }

    pub fn holder_mirror(&self) -> ObjectRef {
        self.holder_mirror
    }

    /// Address loaded into the method register at calls to this method.
    pub fn block_address(&self) -> u64 {
        &*self.block as *const MethodBlock as u64
    }

    pub fn from_compiled_entry(&self) -> u64 {
        self.block.from_compiled_entry.load(Ordering::Acquire)
    }

    pub fn from_interpreted_entry(&self) -> u64 {
        self.block.from_interpreted_entry.load(Ordering::Acquire)
    }

    pub fn interpreter_entry(&self) -> u64 {
        self.block.interpreter_entry.load(Ordering::Acquire)
    }

    pub fn set_interpreter_entry(&self, entry: u64) {
        self.block.interpreter_entry.store(entry, Ordering::Release);
    }

    pub fn set_from_compiled_entry(&self, entry: u64) {
        self.block.from_compiled_entry.store(entry, Ordering::Release);
    }

    pub fn set_from_interpreted_entry(&self, entry: u64) {
        self.block.from_interpreted_entry.store(entry, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags() {
        let m = Method::new(
            "max",
            "(II)I",
            AccessFlags(AccessFlags::PUBLIC | AccessFlags::STATIC),
        )
        .unwrap();
        assert!(m.is_static());
        assert!(!m.is_abstract());
        assert_eq!(m.signature().params.len(), 2);
    }

    #[test]
    fn test_bad_descriptor() {
        assert!(Method::new("f", "(I", AccessFlags::default()).is_err());
    }

    #[test]
    fn test_block_offsets() {
        assert_eq!(METHOD_FROM_COMPILED_OFFSET, 0);
        assert_eq!(METHOD_FROM_INTERPRETED_OFFSET, 8);
        assert_eq!(METHOD_INTERPRETER_ENTRY_OFFSET, 16);
    }

    #[test]
    fn test_entries_are_visible_through_block() {
        let m = Method::new("f", "()V", AccessFlags::default()).unwrap();
        m.set_from_compiled_entry(0x1234);
        let block = m.block_address() as *const u64;
        assert_eq!(unsafe { *block }, 0x1234);
    }
}
