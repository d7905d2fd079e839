//! Run-time views of installed snippets.
//!
//! Once a snippet is installed, executing threads read and update a few of
//! its data fields concurrently: the method pointer and lock word of an
//! unresolved call, and the inline dispatch cache of a virtual or interface
//! call. These views access the fields with atomics at the offsets the
//! snippet was laid out with, the same way the runtime's helpers do.

use crate::cache::InlineCache;
use crate::config::EvictionPolicy;
use crate::descriptor::ConstantPoolRef;
use crate::memory::CodeCache;
use crate::result::CompileResult;
use crate::snippet::SnippetLayout;
use crate::snippet::layout::{LOCK_RESOLVED, LOCK_RESOLVING, LOCK_UNRESOLVED};
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// A pointer-sized field of installed code.
#[derive(Copy, Clone)]
pub(crate) enum Field<'a> {
    W32(&'a AtomicU32),
    W64(&'a AtomicU64),
}

impl<'a> Field<'a> {
    /// The field of `pointer_size` bytes at target address `addr`.
    pub(crate) fn at(cache: &'a CodeCache, addr: u64, pointer_size: u8) -> CompileResult<Self> {
        let ptr = cache.host_ptr(addr, usize::from(pointer_size))?;
        // SAFETY: `host_ptr` checked that the field lies in a segment, which
        // stays mapped for as long as `cache` lives. Segments are page aligned
        // and fields are aligned to their size within them, so the pointer is
        // aligned for the atomic type.
        Ok(unsafe {
            match pointer_size {
                4 => Field::W32(&*(ptr as *const AtomicU32)),
                _ => Field::W64(&*(ptr as *const AtomicU64)),
            }
        })
    }

    pub(crate) fn load(self, order: Ordering) -> u64 {
        match self {
            Field::W32(a) => u64::from(a.load(order)),
            Field::W64(a) => a.load(order),
        }
    }

    pub(crate) fn store(self, value: u64, order: Ordering) {
        match self {
            Field::W32(a) => a.store(value as u32, order),
            Field::W64(a) => a.store(value, order),
        }
    }

    pub(crate) fn compare_exchange_weak(
        self,
        current: u64,
        new: u64,
        success: Ordering,
        failure: Ordering,
    ) -> Result<u64, u64> {
        match self {
            Field::W32(a) => a
                .compare_exchange_weak(current as u32, new as u32, success, failure)
                .map(u64::from)
                .map_err(u64::from),
            Field::W64(a) => a.compare_exchange_weak(current, new, success, failure),
        }
    }
}

/// A 4-byte field of installed code.
pub(crate) fn word_at(cache: &CodeCache, addr: u64) -> CompileResult<&AtomicU32> {
    let ptr = cache.host_ptr(addr, 4)?;
    // SAFETY: as in `Field::at`; 4-byte fields are 4-byte aligned.
    Ok(unsafe { &*(ptr as *const AtomicU32) })
}

/// Resolution progress of an unresolved call, from its lock word.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LockState {
    /// Nobody has resolved the call yet.
    Unresolved,
    /// A thread is resolving the call.
    Resolving,
    /// The method pointer is published.
    Resolved,
}

/// Atomic accessors over the data area of an installed snippet.
pub struct SnippetData<'a> {
    return_address: Field<'a>,
    constant_pool: Field<'a>,
    cp_index: Field<'a>,
    method: Option<Field<'a>>,
    thunk: Option<Field<'a>>,
    dispatch_helper: &'a AtomicU32,
    lock: &'a AtomicU32,
    cache: Option<InlineCache<'a>>,
}

impl<'a> SnippetData<'a> {
    /// The view of the data area at `data` laid out as `layout`. `policy`
    /// applies to the inline cache, if the snippet has one.
    pub fn new(
        cache: &'a CodeCache,
        data: u64,
        layout: &SnippetLayout,
        policy: Option<EvictionPolicy>,
    ) -> CompileResult<Self> {
        let p = layout.pointer_size;
        let field = |offset: u32| Field::at(cache, data + u64::from(offset), p);
        let inline_cache = match layout.cache {
            Some(fields) => Some(InlineCache::new(
                cache,
                data,
                p,
                fields,
                policy.unwrap_or(EvictionPolicy::Megamorphic),
            )?),
            None => None,
        };
        Ok(Self {
            return_address: field(layout.return_address)?,
            constant_pool: field(layout.constant_pool)?,
            cp_index: field(layout.cp_index)?,
            method: layout.method.map(field).transpose()?,
            thunk: layout.thunk.map(field).transpose()?,
            dispatch_helper: word_at(cache, data + u64::from(layout.dispatch_helper))?,
            lock: word_at(cache, data + u64::from(layout.lock_word))?,
            cache: inline_cache,
        })
    }

    /// The call site's return address.
    pub fn return_address(&self) -> u64 {
        self.return_address.load(Ordering::Relaxed)
    }

    /// The constant-pool entry naming the callee; `None` for calls that
    /// were resolved at compile time.
    pub fn constant_pool(&self) -> Option<ConstantPoolRef> {
        let address = self.constant_pool.load(Ordering::Relaxed);
        (address != 0).then(|| ConstantPoolRef {
            address,
            index: self.cp_index.load(Ordering::Relaxed) as u32,
        })
    }

    /// The callee's method pointer, if published.
    pub fn method(&self) -> Option<u64> {
        self.method
            .map(|field| field.load(Ordering::Acquire))
            .filter(|&m| m != 0)
    }

    /// The interpreter-bridge thunk, if the snippet has one and it is linked.
    pub fn thunk(&self) -> Option<u64> {
        self.thunk
            .map(|field| field.load(Ordering::Relaxed))
            .filter(|&t| t != 0)
    }

    /// Index of the interpreter dispatch helper.
    pub fn dispatch_helper_index(&self) -> u32 {
        self.dispatch_helper.load(Ordering::Relaxed)
    }

    /// Current state of the lock word.
    pub fn lock_state(&self) -> LockState {
        match self.lock.load(Ordering::Acquire) {
            LOCK_UNRESOLVED => LockState::Unresolved,
            LOCK_RESOLVING => LockState::Resolving,
            _ => LockState::Resolved,
        }
    }

    /// The inline dispatch cache, for virtual and interface calls.
    pub fn inline_cache(&self) -> Option<&InlineCache<'a>> {
        self.cache.as_ref()
    }

    /// Resolves the call exactly once.
    ///
    /// The first thread to arrive moves the lock word from unresolved to
    /// resolving and runs `resolve`, which is given the constant-pool entry
    /// naming the callee. On success the method pointer is published and the
    /// lock word set to resolved; on failure the lock word returns to
    /// unresolved so that a later call can retry. Threads arriving while a
    /// resolution is in progress wait for it and then re-read the published
    /// pointer. Calls that are already resolved, including those whose
    /// method pointer a load event patched, return their method immediately.
    ///
    /// # Panics
    ///
    /// Panics if the snippet has no method pointer (OSR induction).
    pub fn resolve_with<E>(
        &self,
        resolve: impl FnOnce(Option<ConstantPoolRef>) -> Result<u64, E>,
    ) -> Result<u64, E> {
        let method = self
            .method
            .expect("OSR induction snippets have no method pointer");
        resolve_once(method, self.lock, || {
            trace!("resolving call returning to {:#x}", self.return_address());
            resolve(self.constant_pool())
        })
    }
}

/// Publishes the result of `resolve` into `method` unless the call is
/// already resolved, using `lock` so that at most one thread runs it.
///
/// A non-zero method pointer counts as resolved whatever the lock word
/// says. Returns the published pointer, which is the earlier one if another
/// resolution got there first.
pub(crate) fn resolve_once<E>(
    method: Field<'_>,
    lock: &AtomicU32,
    resolve: impl FnOnce() -> Result<u64, E>,
) -> Result<u64, E> {
    let current = method.load(Ordering::Acquire);
    if current != 0 {
        return Ok(current);
    }
    loop {
        match lock.compare_exchange(
            LOCK_UNRESOLVED,
            LOCK_RESOLVING,
            Ordering::Acquire,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                // Another path may have published between the first check
                // and taking the lock.
                let current = method.load(Ordering::Acquire);
                if current != 0 {
                    lock.store(LOCK_RESOLVED, Ordering::Release);
                    return Ok(current);
                }
                return match resolve() {
                    Ok(m) => {
                        method.store(m, Ordering::Release);
                        lock.store(LOCK_RESOLVED, Ordering::Release);
                        Ok(m)
                    }
                    Err(e) => {
                        lock.store(LOCK_UNRESOLVED, Ordering::Release);
                        Err(e)
                    }
                };
            }
            Err(LOCK_RESOLVED) => return Ok(method.load(Ordering::Acquire)),
            Err(_) => {
                core::hint::spin_loop();
                std::thread::yield_now();
            }
        }
    }
}
