//! Object references as seen by installed code.
//!
//! The heap itself lives elsewhere. Here an object is only an address, plus
//! the compressed encoding used by 32-bit immediates.

use std::fmt;
use std::mem::offset_of;

use serde::{Deserialize, Serialize};

/// Address of a managed object. Zero is null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectRef(pub u64);

impl ObjectRef {
    pub const NULL: ObjectRef = ObjectRef(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn address(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Offset of the class pointer in every object header.
pub const KLASS_OFFSET: i32 = 0;

/// What an inline cache holds when its call site enters a c2i adapter:
/// the receiver class the site was resolved for, and the callee.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcHolder {
    pub klass: u64,
    pub method: u64,
}

pub const IC_HOLDER_KLASS_OFFSET: i32 = offset_of!(IcHolder, klass) as i32;
pub const IC_HOLDER_METHOD_OFFSET: i32 = offset_of!(IcHolder, method) as i32;

/// Compressed object encoding: `narrow = (address - base) >> shift`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressedOops {
    pub base: u64,
    pub shift: u8,
}

impl Default for CompressedOops {
    fn default() -> Self {
        Self { base: 0, shift: 3 }
    }
}

impl CompressedOops {
    /// Largest shift a 32-bit narrow value can use.
    pub const MAX_SHIFT: u8 = 32;

    pub fn validate(&self) -> Result<(), String> {
        if self.shift > Self::MAX_SHIFT {
            return Err(format!(
                "compressed_oops.shift must be at most {}, got {}",
                Self::MAX_SHIFT,
                self.shift
            ));
        }
        Ok(())
    }

    /// Encode an object. `None` if it lies outside the encodable range, is
    /// not aligned to the shift, or sits at `base` (narrow 0 means null).
    pub fn encode(&self, object: ObjectRef) -> Option<u32> {
        if object.is_null() {
            return Some(0);
        }
        let delta = object.0.checked_sub(self.base)?;
        if delta == 0 {
            return None;
        }
        let mask = 1u64.checked_shl(self.shift as u32)? - 1;
        if delta & mask != 0 {
            return None;
        }
        u32::try_from(delta >> self.shift).ok()
    }

    /// Decode a narrow value. `None` if the address does not fit in 64 bits.
    pub fn decode(&self, narrow: u32) -> Option<ObjectRef> {
        if narrow == 0 {
            return Some(ObjectRef::NULL);
        }
        let offset = (narrow as u64).checked_shl(self.shift as u32)?;
        if offset >> self.shift != narrow as u64 {
            return None;
        }
        self.base.checked_add(offset).map(ObjectRef)
    }
}

/// Objects referenced by one artifact through indices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectTable {
    objects: Vec<ObjectRef>,
}

impl ObjectTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of `object`, appending it if not present.
    pub fn find_or_insert(&mut self, object: ObjectRef) -> usize {
        if let Some(index) = self.objects.iter().position(|o| *o == object) {
            return index;
        }
        self.objects.push(object);
        self.objects.len() - 1
    }

    pub fn get(&self, index: usize) -> Option<ObjectRef> {
        self.objects.get(index).copied()
    }

    pub fn set(&mut self, index: usize, object: ObjectRef) {
        if let Some(slot) = self.objects.get_mut(index) {
            *slot = object;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ObjectRef> {
        self.objects.iter()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
