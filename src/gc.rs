//! GC map registration for helper calls.
//!
//! A snippet's call into a runtime helper can trigger a collection, so the
//! stack walker needs to know which registers hold live references at the
//! call's return address.

use std::collections::BTreeMap;

/// Live-register information for the instruction ending at `offset`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct GcMap {
    /// Offset of the return address, relative to the start of its buffer.
    pub offset: u32,
    /// One bit per register encoding that holds a live reference.
    pub live_registers: u32,
}

/// Receives GC maps from the snippet emitter.
pub trait GcMapSink {
    /// Registers the map for the helper call returning to `instruction_address`.
    fn attach_gc_map(&mut self, instruction_address: u64, live_register_mask: u32);
}

/// A [`GcMapSink`] that keeps every map, keyed by address.
#[derive(Debug, Default, Clone)]
pub struct GcMapRegistry {
    maps: BTreeMap<u64, u32>,
}

impl GcMapRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The live-register mask registered at `address`.
    pub fn lookup(&self, address: u64) -> Option<u32> {
        self.maps.get(&address).copied()
    }

    /// Number of registered maps.
    pub fn len(&self) -> usize {
        self.maps.len()
    }

    /// Whether nothing has been registered.
    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    /// All maps in address order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u32)> + '_ {
        self.maps.iter().map(|(&addr, &mask)| (addr, mask))
    }
}

impl GcMapSink for GcMapRegistry {
    fn attach_gc_map(&mut self, instruction_address: u64, live_register_mask: u32) {
        self.maps.insert(instruction_address, live_register_mask);
    }
}
