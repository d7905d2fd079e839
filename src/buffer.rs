//! A bounds-checked cursor for writing code and data.
//!
//! Snippets, thunks and trampolines are written into a [`CodeBuffer`] whose
//! capacity is fixed up front from the length computed before emission. The
//! buffer knows the address its first byte will be installed at, so encoders
//! can compute PC-relative displacements and range checks against final
//! addresses, and it collects the relocations and GC maps recorded while
//! writing.
//!
//! Writing past the capacity is an [`InternalError::BufferOverrun`]: a
//! sizing bug must never silently spill into a neighbouring allocation.

use crate::gc::GcMap;
use crate::reloc::{PatchLocation, Reloc, RelocTarget, Relocation};
use crate::result::{CompileResult, InternalError};
use smallvec::SmallVec;

/// Offset in bytes from the start of a buffer.
pub type CodeOffset = u32;

/// Which part of a compiled method a buffer holds; relocations recorded in
/// the buffer are located relative to it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Section {
    /// The method's main instruction stream.
    Method,
    /// The method's out-of-line snippet block (or a standalone stub).
    Stubs,
}

/// A fixed-capacity code and data writer.
pub struct CodeBuffer {
    section: Section,
    base: u64,
    capacity: CodeOffset,
    data: Vec<u8>,
    relocs: SmallVec<[Relocation; 16]>,
    gc_maps: SmallVec<[GcMap; 8]>,
}

/// The bytes, relocations and GC maps of a finished buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedBuffer {
    /// Address the bytes are to be installed at.
    pub base: u64,
    /// The bytes, exactly `capacity` long.
    pub data: Vec<u8>,
    /// Relocations, in the order they were recorded.
    pub relocs: Vec<Relocation>,
    /// GC maps, in the order they were recorded.
    pub gc_maps: Vec<GcMap>,
}

impl CodeBuffer {
    /// A buffer of `capacity` bytes destined for address `base`.
    pub fn new(section: Section, base: u64, capacity: CodeOffset) -> Self {
        Self {
            section,
            base,
            capacity,
            data: Vec::with_capacity(capacity as usize),
            relocs: SmallVec::new(),
            gc_maps: SmallVec::new(),
        }
    }

    /// Current write offset.
    pub fn cur_offset(&self) -> CodeOffset {
        self.data.len() as CodeOffset
    }

    /// Address of the next byte written.
    pub fn cur_addr(&self) -> u64 {
        self.base + u64::from(self.cur_offset())
    }

    /// Address of the first byte.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Bytes still available.
    pub fn remaining(&self) -> CodeOffset {
        self.capacity - self.cur_offset()
    }

    fn reserve(&mut self, len: usize) -> CompileResult<()> {
        if len > self.remaining() as usize {
            log::error!(
                "code buffer at {:#x} overrun: {len} bytes at offset {} of {}",
                self.base,
                self.cur_offset(),
                self.capacity
            );
            return Err(InternalError::BufferOverrun {
                offset: self.cur_offset(),
                len: len as u32,
                capacity: self.capacity,
            }
            .into());
        }
        Ok(())
    }

    /// Add a byte.
    pub fn put1(&mut self, value: u8) -> CompileResult<()> {
        self.put_data(&[value])
    }

    /// Add 2 bytes.
    pub fn put2(&mut self, value: u16) -> CompileResult<()> {
        self.put_data(&value.to_le_bytes())
    }

    /// Add 4 bytes.
    pub fn put4(&mut self, value: u32) -> CompileResult<()> {
        self.put_data(&value.to_le_bytes())
    }

    /// Add 8 bytes.
    pub fn put8(&mut self, value: u64) -> CompileResult<()> {
        self.put_data(&value.to_le_bytes())
    }

    /// Add a pointer-sized field of `size` bytes. A 4-byte field keeps the
    /// low 32 bits of `value`.
    pub fn put_word(&mut self, value: u64, size: u8) -> CompileResult<()> {
        match size {
            4 => self.put4(value as u32),
            8 => self.put8(value),
            _ => unreachable!("unsupported pointer size {size}"),
        }
    }

    /// Add a slice of bytes.
    pub fn put_data(&mut self, bytes: &[u8]) -> CompileResult<()> {
        self.reserve(bytes.len())?;
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Add `count` copies of `byte`.
    pub fn put_fill(&mut self, byte: u8, count: u32) -> CompileResult<()> {
        self.reserve(count as usize)?;
        self.data
            .extend(core::iter::repeat(byte).take(count as usize));
        Ok(())
    }

    /// Pad with `byte` until the current *address* is a multiple of `align`,
    /// returning the number of bytes added.
    pub fn align_to(&mut self, align: u32, byte: u8) -> CompileResult<u32> {
        trace!("CodeBuffer: align to {align}");
        assert!(align.is_power_of_two(), "{align} is not a power of two");
        let mask = u64::from(align) - 1;
        let pad = ((u64::from(align) - (self.cur_addr() & mask)) & mask) as u32;
        self.put_fill(byte, pad)?;
        Ok(pad)
    }

    /// Record a relocation of the field at `offset`.
    pub fn add_reloc_at_offset(
        &mut self,
        offset: CodeOffset,
        kind: Reloc,
        target: RelocTarget,
        addend: i64,
    ) {
        let location = match self.section {
            Section::Method => PatchLocation::Method(offset),
            Section::Stubs => PatchLocation::Stubs(offset),
        };
        trace!("CodeBuffer: reloc {kind} at {location} -> {target}");
        self.relocs.push(Relocation::new(location, kind, target, addend));
    }

    /// Record a relocation of the field starting at the current offset.
    pub fn add_reloc(&mut self, kind: Reloc, target: RelocTarget, addend: i64) {
        self.add_reloc_at_offset(self.cur_offset(), kind, target, addend);
    }

    /// Record that the instruction ending at the current offset may trigger
    /// a collection with `live_registers` holding references.
    pub fn add_gc_map(&mut self, live_registers: u32) {
        self.gc_maps.push(GcMap {
            offset: self.cur_offset(),
            live_registers,
        });
    }

    /// GC maps recorded so far.
    pub fn gc_maps(&self) -> &[GcMap] {
        &self.gc_maps
    }

    /// Relocations recorded so far.
    pub fn relocs(&self) -> &[Relocation] {
        &self.relocs
    }

    /// The bytes written so far.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Finish writing. The buffer must be exactly full.
    pub fn finish(self) -> CompileResult<FinishedBuffer> {
        if self.cur_offset() != self.capacity {
            log::error!(
                "code buffer at {:#x} finished with {} of {} bytes written",
                self.base,
                self.cur_offset(),
                self.capacity
            );
            return Err(InternalError::BufferOverrun {
                offset: self.cur_offset(),
                len: 0,
                capacity: self.capacity,
            }
            .into());
        }
        Ok(FinishedBuffer {
            base: self.base,
            data: self.data,
            relocs: self.relocs.into_vec(),
            gc_maps: self.gc_maps.into_vec(),
        })
    }
}
