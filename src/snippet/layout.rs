//! The byte layout of a snippet.
//!
//! ```text
//! entry:  argument flush stores
//!         call helper (jump for OSR induction)
//!         padding to pointer alignment            p bytes, 0 <= p <= P - A
//! data:   +0    return address                    P
//!         +P    constant pool                     P
//!         +2P   constant-pool index               P
//!         +3P   method pointer                    P   absent for OSR induction
//!               thunk pointer                     P   virtual, interface, method handle
//!               cache slots                       N x 3P (class, method, sequence)
//!               cache state                       4
//!               dispatch helper index             4
//!               lock word                         4
//! tail:   padding                                 P - A - p bytes
//! ```
//!
//! `P` is the pointer size and `A` the instruction alignment. The runtime's
//! resolution helpers find the data area by rounding the helper call's return
//! address up to `P`, and read the fields at the offsets below; any change
//! here must bump [`crate::LAYOUT_VERSION`].
//!
//! The two padding runs always add up to `P - A`, so a snippet's length does
//! not depend on where it is placed and can be computed before emission.

use crate::config::Config;
use crate::descriptor::CallDescriptor;
use crate::isa::InstructionEncoder;
use crate::marshal::FlushPlan;
use crate::result::CompileResult;

/// Constant-pool index stored by snippets whose callee is already resolved
/// (all ones, truncated to the pointer size).
pub const NO_CP_INDEX: u64 = u64::MAX;

/// Lock word of a call that has not been resolved.
pub const LOCK_UNRESOLVED: u32 = 0;
/// Lock word while one thread resolves the call.
pub const LOCK_RESOLVING: u32 = 1;
/// Lock word once the method pointer is published.
pub const LOCK_RESOLVED: u32 = 2;

/// Offsets of the inline dispatch cache within the data area.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CacheFields {
    /// First slot.
    pub slots: u32,
    /// Number of slots.
    pub slot_count: u32,
    /// The state word.
    pub state: u32,
}

/// Sizes of a snippet's parts and offsets of its data fields, relative to
/// the start of the data area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnippetLayout {
    /// Pointer size of the target.
    pub pointer_size: u8,
    /// Length of the argument flush.
    pub flush_len: u32,
    /// Length of the helper call or jump.
    pub branch_len: u32,
    /// Combined length of the two padding runs.
    pub padding: u32,
    /// Length of the data area.
    pub data_len: u32,
    /// The call site's return address.
    pub return_address: u32,
    /// The constant pool.
    pub constant_pool: u32,
    /// The constant-pool index.
    pub cp_index: u32,
    /// The callee's method pointer.
    pub method: Option<u32>,
    /// The interpreter-bridge thunk.
    pub thunk: Option<u32>,
    /// The inline dispatch cache.
    pub cache: Option<CacheFields>,
    /// Index of the interpreter dispatch helper.
    pub dispatch_helper: u32,
    /// The lock word.
    pub lock_word: u32,
}

impl SnippetLayout {
    /// The layout of the snippet for `desc`, whose arguments are flushed by
    /// `plan`.
    pub fn new(
        desc: &CallDescriptor,
        plan: &FlushPlan,
        isa: &dyn InstructionEncoder,
        config: &Config,
    ) -> CompileResult<Self> {
        let p = u32::from(isa.pointer_size());
        let flush_len = plan.encoded_len(isa)?;

        let mut next = 3 * p;
        let mut take = |size: u32| {
            let at = next;
            next += size;
            at
        };
        let method = desc.has_method_pointer().then(|| take(p));
        let thunk = desc.kind.uses_thunk().then(|| take(p));
        let cache = config.cache_shape(desc.kind).map(|(slot_count, _)| {
            let slots = take(slot_count * 3 * p);
            CacheFields {
                slots,
                slot_count,
                state: take(4),
            }
        });
        let dispatch_helper = take(4);
        let lock_word = take(4);

        Ok(Self {
            pointer_size: isa.pointer_size(),
            flush_len,
            branch_len: isa.branch_len(),
            padding: p - isa.instruction_alignment(),
            data_len: next,
            return_address: 0,
            constant_pool: p,
            cp_index: 2 * p,
            method,
            thunk,
            cache,
            dispatch_helper,
            lock_word,
        })
    }

    /// Total length of the snippet.
    pub fn total_len(&self) -> u32 {
        self.flush_len + self.branch_len + self.padding + self.data_len
    }

    /// Offset of the helper call's return address from the snippet entry.
    pub fn call_return_offset(&self) -> u32 {
        self.flush_len + self.branch_len
    }

    /// Offset of cache slot `index` from the data area.
    pub fn slot_offset(&self, index: u32) -> Option<u32> {
        let cache = self.cache?;
        (index < cache.slot_count)
            .then(|| cache.slots + index * 3 * u32::from(self.pointer_size))
    }
}

/// Where the runtime finds a snippet's data area, given the return address
/// of the snippet's helper call.
pub fn data_area(return_address: u64, pointer_size: u8) -> u64 {
    let mask = u64::from(pointer_size) - 1;
    (return_address + mask) & !mask
}
