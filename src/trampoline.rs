//! Trampolines for branches that cannot reach their target.
//!
//! A PC-relative call from a snippet to a runtime helper has limited reach
//! (±2 GiB on x86-64, ±128 MiB on AArch64). When a helper is out of range,
//! the branch is pointed at a trampoline in the call site's own code-cache
//! segment instead, which jumps to the helper through an absolute address.
//! One trampoline exists per (target, segment) pair and is shared by every
//! branch of that segment.

use crate::buffer::{CodeBuffer, Section};
use crate::isa::InstructionEncoder;
use crate::memory::{CodeCache, SegmentId};
use crate::result::{CompileError, CompileResult, InternalError};
use rustc_hash::FxHashMap;
use std::sync::Mutex;

/// An installed trampoline.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Trampoline {
    /// Address of the trampoline's first instruction.
    pub address: u64,
    /// Address it jumps to.
    pub target: u64,
    /// The reachable region it serves.
    pub segment: SegmentId,
}

/// All trampolines of a code cache.
#[derive(Default)]
pub struct TrampolineTable {
    map: Mutex<FxHashMap<(u64, SegmentId), Trampoline>>,
}

impl TrampolineTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The address a branch at `call_site` should be pointed at to reach
    /// `target`: `target` itself when it is directly reachable, otherwise a
    /// trampoline in the call site's segment, created on first use.
    ///
    /// With `stress` set, a trampoline is used whenever the target has
    /// them, even if the branch could reach it directly.
    pub fn resolve_branch_target(
        &self,
        isa: &dyn InstructionEncoder,
        cache: &CodeCache,
        stress: bool,
        target: u64,
        call_site: u64,
    ) -> CompileResult<u64> {
        let in_range = isa.branch_in_range(call_site, target);
        let size = match isa.trampoline_size() {
            Some(size) => size,
            None if in_range => return Ok(target),
            None => {
                log::error!("{}: branch at {call_site:#x} cannot reach {target:#x}", isa.name());
                return Err(InternalError::BranchOutOfRange {
                    from: call_site,
                    to: target,
                }
                .into());
            }
        };
        if in_range && !stress {
            return Ok(target);
        }

        let segment = cache
            .segment_of(call_site)
            .ok_or(InternalError::OutsideCodeCache {
                addr: call_site,
                len: 0,
            })?;

        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = map.get(&(target, segment)) {
            trace!(
                "branch at {call_site:#x} -> {target:#x} shares trampoline {:#x}",
                existing.address
            );
            return Ok(existing.address);
        }

        let exhausted = || {
            log::warn!("{segment}: no room for a trampoline to {target:#x}");
            CompileError::TrampolineSpaceExhausted { target, call_site }
        };
        let address = cache
            .allocate_trampoline(segment, size, |addr| isa.branch_in_range(call_site, addr))
            .ok_or_else(exhausted)?;

        let mut buf = CodeBuffer::new(Section::Stubs, address, size);
        isa.emit_trampoline(&mut buf, target)?;
        let code = buf.finish()?;
        cache.write(address, &code.data)?;

        map.insert(
            (target, segment),
            Trampoline {
                address,
                target,
                segment,
            },
        );
        log::debug!("{segment}: trampoline at {address:#x} to {target:#x}");
        Ok(address)
    }

    /// The trampoline to `target` serving `segment`, if one exists.
    pub fn get(&self, target: u64, segment: SegmentId) -> Option<Trampoline> {
        self.map
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(target, segment))
            .copied()
    }

    /// Number of trampolines created.
    pub fn len(&self) -> usize {
        self.map.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether no trampoline has been created.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
