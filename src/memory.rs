//! The code cache: process-wide memory holding snippets, thunks and
//! trampolines.
//!
//! The cache is a list of segments. Each segment is one *reachable region*:
//! any branch inside it can reach any other address in it, so a trampoline
//! placed in a segment serves every call site of that segment. Code is
//! allocated upward from a segment's base and trampolines downward from its
//! top, inside a tail reserved for them.
//!
//! Segments are never freed while the cache lives, so addresses handed out
//! stay valid for run-time views of installed snippets.
//!
//! Addresses are *target* addresses. By default they are the host addresses
//! of the backing pages; with `address-base` configured, segments are instead
//! assigned consecutive target addresses from that base, which lets a 64-bit
//! host lay out code for a 32-bit target.

use crate::config::CodeCacheConfig;
use crate::result::{CompileError, CompileResult, InternalError};
use cranelift_entity::{EntityRef, PrimaryMap, entity_impl};
use std::sync::{Mutex, MutexGuard};

/// A segment of the code cache.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId(u32);
entity_impl!(SegmentId, "segment");

/// Round `size` up to the nearest multiple of `page_size`.
fn round_up_to_page_size(size: usize, page_size: usize) -> usize {
    (size + (page_size - 1)) & !(page_size - 1)
}

struct Segment {
    _alloc: region::Allocation,
    host: *mut u8,
    base: u64,
    size: usize,
    code_top: usize,
    trampoline_floor: usize,
    trampoline_bottom: usize,
}

// The pointer refers to pages owned by `_alloc`, which lives as long as the
// segment; all mutation goes through the cache's lock or through atomics.
unsafe impl Send for Segment {}

impl Segment {
    fn contains(&self, addr: u64, len: usize) -> bool {
        addr >= self.base && addr + len as u64 <= self.base + self.size as u64
    }

    fn holds(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.base + self.size as u64
    }
}

/// Space handed out by [`CodeCache::reserve`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Reservation {
    /// Target address of the first byte.
    pub addr: u64,
    /// Reserved length.
    pub len: u32,
    /// Segment holding the space.
    pub segment: SegmentId,
}

/// Process-wide JIT code memory.
pub struct CodeCache {
    segments: Mutex<PrimaryMap<SegmentId, Segment>>,
    segment_size: usize,
    max_segments: usize,
    trampoline_reserve: usize,
    address_base: Option<u64>,
    page_size: usize,
}

impl CodeCache {
    /// An empty cache; segments are allocated on demand.
    pub fn new(config: &CodeCacheConfig) -> Self {
        let page_size = region::page::size();
        let segment_size = round_up_to_page_size(config.segment_size.max(1), page_size);
        let address_base = config
            .address_base
            .map(|base| round_up_to_page_size(base as usize, page_size) as u64);
        Self {
            segments: Mutex::new(PrimaryMap::new()),
            segment_size,
            max_segments: config.max_segments,
            trampoline_reserve: config.trampoline_reserve,
            address_base,
            page_size,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PrimaryMap<SegmentId, Segment>> {
        self.segments.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn new_segment(
        &self,
        segments: &mut PrimaryMap<SegmentId, Segment>,
        min_code: usize,
    ) -> CompileResult<SegmentId> {
        if segments.len() >= self.max_segments {
            return Err(CompileError::CodeCacheFull {
                requested: min_code,
            });
        }
        let size = round_up_to_page_size(
            self.segment_size.max(min_code + self.trampoline_reserve),
            self.page_size,
        );
        let mut alloc = region::alloc(size, region::Protection::READ_WRITE).map_err(|e| {
            log::warn!("failed to map a {size}-byte code-cache segment: {e}");
            CompileError::CodeCacheFull { requested: size }
        })?;
        let host = alloc.as_mut_ptr::<u8>();
        let base = match self.address_base {
            Some(first) => segments
                .values()
                .last()
                .map_or(first, |last| last.base + last.size as u64),
            None => host as u64,
        };
        let id = segments.push(Segment {
            _alloc: alloc,
            host,
            base,
            size,
            code_top: 0,
            trampoline_floor: size - self.trampoline_reserve.min(size),
            trampoline_bottom: size,
        });
        log::debug!("code cache: new {id} at {base:#x}, {size} bytes");
        Ok(id)
    }

    /// Reserves `len` bytes of code space aligned to `align`.
    pub fn reserve(&self, len: u32, align: u32) -> CompileResult<Reservation> {
        assert!(align.is_power_of_two());
        let len_usize = len as usize;
        let align_usize = align as usize;
        let mut segments = self.lock();

        if segments.len() > 0 {
            let id = SegmentId::new(segments.len() - 1);
            let seg = &mut segments[id];
            let start = (seg.code_top + align_usize - 1) & !(align_usize - 1);
            if start + len_usize <= seg.trampoline_floor {
                seg.code_top = start + len_usize;
                let addr = seg.base + start as u64;
                trace!("code cache: reserved {len} bytes at {addr:#x}");
                return Ok(Reservation {
                    addr,
                    len,
                    segment: id,
                });
            }
        }

        let id = self
            .new_segment(&mut segments, len_usize + align_usize)
            .map_err(|e| match e {
                CompileError::CodeCacheFull { .. } => CompileError::CodeCacheFull {
                    requested: len_usize,
                },
                e => e,
            })?;
        let seg = &mut segments[id];
        seg.code_top = len_usize;
        Ok(Reservation {
            addr: seg.base,
            len,
            segment: id,
        })
    }

    /// Carves `size` bytes for a trampoline out of the top of `segment`,
    /// provided `usable` accepts the address they would start at. Returns
    /// `None`, and keeps the space, when the segment's trampoline space is
    /// used up or `usable` rejects the address.
    pub fn allocate_trampoline(
        &self,
        segment: SegmentId,
        size: u32,
        usable: impl FnOnce(u64) -> bool,
    ) -> Option<u64> {
        let mut segments = self.lock();
        let seg = &mut segments[segment];
        let bottom = seg.trampoline_bottom.checked_sub(size as usize)? & !7;
        let addr = seg.base + bottom as u64;
        if bottom < seg.trampoline_floor || !usable(addr) {
            return None;
        }
        seg.trampoline_bottom = bottom;
        Some(addr)
    }

    /// The segment containing `addr`.
    pub fn segment_of(&self, addr: u64) -> Option<SegmentId> {
        self.lock()
            .iter()
            .find(|(_, seg)| seg.holds(addr))
            .map(|(id, _)| id)
    }

    /// Target address range of `segment`.
    pub fn segment_bounds(&self, segment: SegmentId) -> (u64, u64) {
        let segments = self.lock();
        let seg = &segments[segment];
        (seg.base, seg.base + seg.size as u64)
    }

    /// Number of segments allocated so far.
    pub fn segment_count(&self) -> usize {
        self.lock().len()
    }

    /// Host pointer to `len` bytes at target address `addr`.
    ///
    /// The pointer stays valid for as long as the cache lives.
    pub(crate) fn host_ptr(&self, addr: u64, len: usize) -> CompileResult<*mut u8> {
        let segments = self.lock();
        let seg = segments
            .values()
            .find(|seg| seg.contains(addr, len))
            .ok_or(InternalError::OutsideCodeCache { addr, len })?;
        // SAFETY: `contains` checked that the range is inside the segment.
        Ok(unsafe { seg.host.add((addr - seg.base) as usize) })
    }

    /// Copies `bytes` to target address `addr`.
    pub fn write(&self, addr: u64, bytes: &[u8]) -> CompileResult<()> {
        let segments = self.lock();
        let seg = segments
            .values()
            .find(|seg| seg.contains(addr, bytes.len()))
            .ok_or(InternalError::OutsideCodeCache {
                addr,
                len: bytes.len(),
            })?;
        // SAFETY: the destination lies inside the segment's allocation, and
        // `bytes` cannot alias code-cache memory borrowed mutably elsewhere.
        unsafe {
            let dst = seg.host.add((addr - seg.base) as usize);
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
        }
        Ok(())
    }

    /// Fills `out` from target address `addr`.
    pub fn read_into(&self, addr: u64, out: &mut [u8]) -> CompileResult<()> {
        let segments = self.lock();
        let seg = segments
            .values()
            .find(|seg| seg.contains(addr, out.len()))
            .ok_or(InternalError::OutsideCodeCache {
                addr,
                len: out.len(),
            })?;
        // SAFETY: the source lies inside the segment's allocation.
        unsafe {
            let src = seg.host.add((addr - seg.base) as usize);
            core::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    /// Reads `len` bytes at target address `addr`.
    pub fn read(&self, addr: u64, len: usize) -> CompileResult<Vec<u8>> {
        let mut out = vec![0; len];
        self.read_into(addr, &mut out)?;
        Ok(out)
    }
}
