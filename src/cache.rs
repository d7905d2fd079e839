//! Inline dispatch caches.
//!
//! A virtual or interface call site carries a few cache slots, each pairing
//! a receiver class with the method that class dispatches to. The runtime
//! fills them as the call executes; a call whose receiver class is cached
//! skips the generic dispatch helper.
//!
//! Slots are read by any number of threads while others fill them, with no
//! lock. A slot is three pointer-sized words:
//!
//! ```text
//! +0   class       0 while the slot is empty
//! +P   method
//! +2P  sequence    odd while a writer owns the slot
//! ```
//!
//! A writer claims the slot by moving the sequence from even to odd, stores
//! the method and then the class, the class last and with release ordering,
//! and moves the sequence to the next even value. A reader that observes a
//! class therefore also observes the method published with it, and the
//! sequence check rejects a pair torn by an overwrite under the evict-oldest
//! policy.
//!
//! The state word after the slots counts the filled slots in its low 16
//! bits, keeps the eviction cursor in bits 16 to 30, and sets bit 31 once
//! the site has gone megamorphic. Slots are only ever handed out by a
//! compare-and-swap on that word, in fill order. Two threads missing on the
//! same class at the same time may both fill a slot for it; the duplicate is
//! harmless.
//!
//! Once megamorphic, a site stops consulting its slots: [`InlineCache::dispatch`]
//! sends every receiver to [`HelperId::MegamorphicDispatch`].

use crate::config::EvictionPolicy;
use crate::helpers::HelperId;
use crate::memory::CodeCache;
use crate::result::CompileResult;
use crate::runtime::{Field, word_at};
use crate::snippet::layout::CacheFields;
use core::sync::atomic::{AtomicU32, Ordering, fence};
use smallvec::SmallVec;

const FILLED_MASK: u32 = 0xffff;
const CURSOR_SHIFT: u32 = 16;
const CURSOR_MASK: u32 = 0x7fff;
const MEGAMORPHIC: u32 = 1 << 31;

/// Observable state of a call site's cache.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CacheState {
    /// No slot filled yet.
    Empty,
    /// The only slot of a single-slot cache is filled.
    SingleFilled,
    /// This many slots are filled.
    MultiFilled(u32),
    /// The site dispatches generically from now on.
    Megamorphic,
}

/// What [`InlineCache::record`] did.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// The class was already cached; nothing changed.
    AlreadyCached,
    /// The class was written to this empty slot.
    Filled(u32),
    /// The class replaced the oldest entry, in this slot.
    Evicted(u32),
    /// The cache is megamorphic; nothing was written.
    Megamorphic,
}

/// Where a call on a receiver of a given class goes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Straight to this cached method.
    Cached(u64),
    /// The class is not cached; resolve it and [`record`](InlineCache::record)
    /// the result.
    Miss,
    /// Through this generic dispatch helper, without touching the cache.
    Generic(HelperId),
}

#[derive(Copy, Clone)]
struct Slot<'a> {
    class: Field<'a>,
    method: Field<'a>,
    sequence: Field<'a>,
}

impl Slot<'_> {
    /// A consistent (class, method) pair, or `None` if the slot is empty.
    fn read(&self) -> Option<(u64, u64)> {
        loop {
            let s1 = self.sequence.load(Ordering::Acquire);
            if s1 & 1 != 0 {
                core::hint::spin_loop();
                continue;
            }
            let class = self.class.load(Ordering::Acquire);
            let method = self.method.load(Ordering::Relaxed);
            fence(Ordering::Acquire);
            let s2 = self.sequence.load(Ordering::Relaxed);
            if s1 == s2 {
                return (class != 0).then_some((class, method));
            }
        }
    }

    fn write(&self, class: u64, method: u64) {
        let seq = loop {
            let seq = self.sequence.load(Ordering::Relaxed);
            if seq & 1 == 0
                && self
                    .sequence
                    .compare_exchange_weak(seq, seq + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                break seq;
            }
            core::hint::spin_loop();
        };
        fence(Ordering::Release);
        self.method.store(method, Ordering::Relaxed);
        self.class.store(class, Ordering::Release);
        self.sequence.store(seq + 2, Ordering::Release);
    }
}

/// The inline dispatch cache of an installed snippet.
pub struct InlineCache<'a> {
    slots: SmallVec<[Slot<'a>; 4]>,
    state: &'a AtomicU32,
    policy: EvictionPolicy,
}

impl<'a> InlineCache<'a> {
    pub(crate) fn new(
        cache: &'a CodeCache,
        data: u64,
        pointer_size: u8,
        fields: CacheFields,
        policy: EvictionPolicy,
    ) -> CompileResult<Self> {
        let p = u64::from(pointer_size);
        let mut slots = SmallVec::new();
        for index in 0..u64::from(fields.slot_count) {
            let at = data + u64::from(fields.slots) + index * 3 * p;
            slots.push(Slot {
                class: Field::at(cache, at, pointer_size)?,
                method: Field::at(cache, at + p, pointer_size)?,
                sequence: Field::at(cache, at + 2 * p, pointer_size)?,
            });
        }
        Ok(Self {
            slots,
            state: word_at(cache, data + u64::from(fields.state))?,
            policy,
        })
    }

    /// Number of slots.
    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    /// What happens once every slot is filled.
    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    /// The method cached for `class`.
    pub fn lookup(&self, class: u64) -> Option<u64> {
        self.slots
            .iter()
            .filter_map(Slot::read)
            .find(|&(c, _)| c == class)
            .map(|(_, method)| method)
    }

    /// Routes a call on a receiver of `class`.
    ///
    /// A megamorphic site, or one with no slots, always takes the generic
    /// dispatch helper, even for classes still in its slots.
    pub fn dispatch(&self, class: u64) -> Dispatch {
        if self.capacity() == 0 || self.state.load(Ordering::Acquire) & MEGAMORPHIC != 0 {
            return Dispatch::Generic(HelperId::MegamorphicDispatch);
        }
        match self.lookup(class) {
            Some(method) => Dispatch::Cached(method),
            None => Dispatch::Miss,
        }
    }

    /// Records that receivers of `class` dispatch to `method`.
    pub fn record(&self, class: u64, method: u64) -> RecordOutcome {
        debug_assert_ne!(class, 0, "class 0 marks an empty slot");
        if self.lookup(class).is_some() {
            return RecordOutcome::AlreadyCached;
        }
        let capacity = self.capacity();
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            if state & MEGAMORPHIC != 0 {
                return RecordOutcome::Megamorphic;
            }
            let filled = state & FILLED_MASK;
            let (new, outcome) = if filled < capacity {
                (state + 1, RecordOutcome::Filled(filled))
            } else if self.policy == EvictionPolicy::EvictOldest && capacity > 0 {
                let cursor = (state >> CURSOR_SHIFT) & CURSOR_MASK;
                let next = (cursor + 1) % capacity;
                let new = (state & !(CURSOR_MASK << CURSOR_SHIFT)) | (next << CURSOR_SHIFT);
                (new, RecordOutcome::Evicted(cursor))
            } else {
                (state | MEGAMORPHIC, RecordOutcome::Megamorphic)
            };
            match self
                .state
                .compare_exchange_weak(state, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    match outcome {
                        RecordOutcome::Filled(slot) | RecordOutcome::Evicted(slot) => {
                            trace!("inline cache: {class:#x} -> {method:#x} in slot {slot}");
                            self.slots[slot as usize].write(class, method);
                        }
                        _ => log::debug!(
                            "inline cache: megamorphic after {filled} classes, missed on {class:#x}"
                        ),
                    }
                    return outcome;
                }
                Err(current) => state = current,
            }
        }
    }

    /// The cache's state.
    pub fn state(&self) -> CacheState {
        let state = self.state.load(Ordering::Acquire);
        if state & MEGAMORPHIC != 0 {
            return CacheState::Megamorphic;
        }
        match state & FILLED_MASK {
            0 => CacheState::Empty,
            1 if self.capacity() == 1 => CacheState::SingleFilled,
            n => CacheState::MultiFilled(n),
        }
    }

    /// The filled (class, method) entries, in slot order.
    pub fn entries(&self) -> Vec<(u64, u64)> {
        self.slots.iter().filter_map(Slot::read).collect()
    }
}
