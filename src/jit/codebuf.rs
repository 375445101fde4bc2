//! Code buffers.
//!
//! [`CodeBuffer`] builds machine code incrementally; stubs, adapters and
//! wrappers are emitted into one. [`SectionLayout`] says where the code
//! and data sections of a compilation unit will live.

use std::collections::HashMap;

use crate::error::ContractViolation;

/// A buffer for building machine code.
pub struct CodeBuffer {
    /// The code bytes
    code: Vec<u8>,
    /// Labels for forward references (name -> offset)
    labels: HashMap<String, usize>,
    /// Pending rel32 references (offset of the operand, label name)
    forward_refs: Vec<(usize, String)>,
}

impl CodeBuffer {
    /// Create a new empty code buffer.
    pub fn new() -> Self {
        Self {
            code: Vec::new(),
            labels: HashMap::new(),
            forward_refs: Vec::new(),
        }
    }

    /// Get the current size of the code.
    pub fn len(&self) -> usize {
        self.code.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Get the current offset (for labels and sites).
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    /// Emit a single byte.
    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    /// Emit a 16-bit value (little-endian).
    pub fn emit_u16(&mut self, value: u16) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 32-bit value (little-endian).
    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 64-bit value (little-endian).
    pub fn emit_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Define a label at the current position.
    pub fn define_label(&mut self, name: &str) {
        self.labels.insert(name.to_string(), self.code.len());
    }

    /// Get the offset of a label (if defined).
    pub fn get_label(&self, name: &str) -> Option<usize> {
        self.labels.get(name).copied()
    }

    /// Emit a rel32 placeholder referring to a label.
    /// The reference is resolved by `patch_forward_refs`.
    pub fn emit_forward_ref(&mut self, label: &str) {
        let offset = self.code.len();
        self.forward_refs.push((offset, label.to_string()));
        self.emit_u32(0);
    }

    /// Patch all forward references.
    pub fn patch_forward_refs(&mut self) -> Result<(), ContractViolation> {
        for (offset, label) in self.forward_refs.drain(..) {
            let target = self
                .labels
                .get(&label)
                .ok_or_else(|| ContractViolation::UnboundLabel(label.clone()))?;

            // Relative to the end of the operand
            let rel_offset = (*target as i64) - (offset as i64 + 4);
            if rel_offset < i32::MIN as i64 || rel_offset > i32::MAX as i64 {
                return Err(ContractViolation::DisplacementOverflow {
                    offset: offset as u32,
                    displacement: rel_offset,
                });
            }
            let bytes = (rel_offset as i32).to_le_bytes();
            self.code[offset..offset + 4].copy_from_slice(&bytes);
        }
        Ok(())
    }

    /// Get the code bytes (for inspection).
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Consume the buffer and return the raw code bytes.
    /// Note: This does not patch forward references - use patch_forward_refs first.
    pub fn into_code(self) -> Vec<u8> {
        self.code
    }

    /// Align the code to the given boundary with NOPs.
    pub fn align(&mut self, alignment: usize) {
        let current = self.code.len();
        let aligned = (current + alignment - 1) & !(alignment - 1);
        for _ in current..aligned {
            self.emit_u8(0x90);
        }
    }
}

impl Default for CodeBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Addresses the code and data sections of a compilation unit will occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionLayout {
    pub code_base: u64,
    pub data_base: u64,
}

impl SectionLayout {
    /// Address of a code offset.
    pub fn code_addr(&self, offset: usize) -> u64 {
        self.code_base.wrapping_add(offset as u64)
    }

    /// Address of a data offset.
    pub fn data_addr(&self, offset: usize) -> u64 {
        self.data_base.wrapping_add(offset as u64)
    }
}

/// Little-endian field readers shared by the installer and re-patching code.
/// Callers bounds-check through the decoder before reading.
pub fn read_i32(bytes: &[u8], offset: usize) -> i32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    i32::from_le_bytes(raw)
}

pub fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    read_i32(bytes, offset) as u32
}

pub fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_bytes() {
        let mut buf = CodeBuffer::new();
        buf.emit_u8(0x90);
        buf.emit_u16(0x1234);
        buf.emit_u32(0xDEADBEEF);

        assert_eq!(buf.len(), 7);
        assert_eq!(buf.code(), &[0x90, 0x34, 0x12, 0xEF, 0xBE, 0xAD, 0xDE]);
    }

    #[test]
    fn test_labels() {
        let mut buf = CodeBuffer::new();
        buf.emit_u8(0x90);
        buf.define_label("test");
        buf.emit_u8(0x90);

        assert_eq!(buf.get_label("test"), Some(1));
    }

    #[test]
    fn test_forward_ref_backward_and_forward() {
        let mut buf = CodeBuffer::new();
        buf.define_label("top");
        buf.emit_u8(0xE9);
        buf.emit_forward_ref("end");
        buf.emit_u8(0xE9);
        buf.emit_forward_ref("top");
        buf.define_label("end");
        buf.patch_forward_refs().unwrap();

        // first jmp: operand at 1, target 10 -> 10 - 5
        assert_eq!(read_i32(buf.code(), 1), 5);
        // second jmp: operand at 6, target 0 -> 0 - 10
        assert_eq!(read_i32(buf.code(), 6), -10);
    }

    #[test]
    fn test_undefined_label() {
        let mut buf = CodeBuffer::new();
        buf.emit_u8(0xE9);
        buf.emit_forward_ref("nowhere");
        assert_eq!(
            buf.patch_forward_refs(),
            Err(ContractViolation::UnboundLabel("nowhere".to_string()))
        );
    }

    #[test]
    fn test_alignment() {
        let mut buf = CodeBuffer::new();
        buf.emit_u8(0xC3);
        buf.align(4);

        assert_eq!(buf.len(), 4);
        assert_eq!(&buf.code()[1..], &[0x90, 0x90, 0x90]);
    }

    #[test]
    fn test_layout_addresses() {
        let layout = SectionLayout {
            code_base: 0x1000,
            data_base: 0x2000,
        };
        assert_eq!(layout.code_addr(0x10), 0x1010);
        assert_eq!(layout.data_addr(8), 0x2008);
    }
}
