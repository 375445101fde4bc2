//! Oop maps for installed code.
//!
//! An oop map says which registers and stack slots hold object references
//! when a call returns to a given pc. The collector looks them up while
//! walking compiled frames.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ContractViolation;

use super::registers::{Register, to_native_register};

/// Reference locations as the compiler describes them, in compiler
/// register indices and frame-relative stack slots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceMap {
    pub registers: Vec<u32>,
    pub stack_slots: Vec<u32>,
}

/// Reference locations at one return address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OopMap {
    /// Code offset of the return address
    pub return_pc: u32,
    /// Registers holding references
    pub registers: Vec<Register>,
    /// Bitmap of stack slots that hold references (bit N of word N/64)
    stack_refs: Vec<u64>,
}

impl OopMap {
    pub fn new(return_pc: u32) -> Self {
        Self {
            return_pc,
            registers: Vec::new(),
            stack_refs: Vec::new(),
        }
    }

    /// Translate a compiler reference map.
    pub fn from_reference_map(return_pc: u32, map: &ReferenceMap) -> Result<Self, ContractViolation> {
        let mut oop_map = Self::new(return_pc);
        for &index in &map.registers {
            oop_map.registers.push(to_native_register(index)?);
        }
        for &slot in &map.stack_slots {
            oop_map.mark_stack_ref(slot as usize);
        }
        Ok(oop_map)
    }

    /// Mark a stack slot as containing a reference.
    pub fn mark_stack_ref(&mut self, slot: usize) {
        let word = slot / 64;
        if word >= self.stack_refs.len() {
            self.stack_refs.resize(word + 1, 0);
        }
        self.stack_refs[word] |= 1 << (slot % 64);
    }

    /// Check if a stack slot contains a reference.
    pub fn is_stack_ref(&self, slot: usize) -> bool {
        self.stack_refs
            .get(slot / 64)
            .is_some_and(|w| w & (1 << (slot % 64)) != 0)
    }

    /// Get all stack slots that contain references.
    pub fn stack_ref_slots(&self) -> Vec<usize> {
        (0..self.stack_refs.len() * 64)
            .filter(|&i| self.is_stack_ref(i))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty() && self.stack_refs.iter().all(|w| *w == 0)
    }
}

/// Oop maps of one installed artifact, indexed by return pc.
#[derive(Debug, Clone, Default)]
pub struct OopMapSet {
    maps: BTreeMap<u32, OopMap>,
}

impl OopMapSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, map: OopMap) {
        self.maps.insert(map.return_pc, map);
    }

    /// Look up the map recorded for an exact return pc.
    pub fn lookup(&self, return_pc: u32) -> Option<&OopMap> {
        self.maps.get(&return_pc)
    }

    /// All maps in pc order.
    pub fn iter(&self) -> impl Iterator<Item = &OopMap> {
        self.maps.values()
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }
}
