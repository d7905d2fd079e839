//! Out-of-line call-dispatch snippets for a JIT back end.
//!
//! For every call site the main code generator cannot resolve or bind
//! directly, this crate emits a small block of native code and data (a
//! *snippet*) outside the hot instruction stream. The snippet flushes the
//! register arguments to their stack slots, calls a runtime helper, and
//! carries the data the helper needs to finish the call: the return address,
//! the constant-pool entry naming the callee, a method pointer that is patched
//! once the callee is resolved, inline dispatch-cache slots for virtual and
//! interface calls, and a lock word that serializes first-time resolution.
//!
//! The pieces, leaves first:
//!
//! * [`abi::AbiDescriptor`] describes the argument registers and stack slots of
//!   a target's JIT linkage.
//! * [`marshal::flush_arguments`] computes the stores that spill argument
//!   registers to the stack.
//! * [`helpers::select_helper`] maps a [`CallDescriptor`] to the runtime helper
//!   that services it.
//! * [`isa::InstructionEncoder`] is the per-architecture encoding strategy.
//! * [`snippet::SnippetSet`] sizes, lays out and emits the snippets of one
//!   compiled method; the sized length always equals the emitted length.
//! * [`reloc`] records every embedded address as a [`reloc::Relocation`] and
//!   applies them once per load event.
//! * [`trampoline::TrampolineTable`] redirects branches that cannot reach
//!   their target through shared, in-range trampolines.
//! * [`cache::InlineCache`] and [`runtime::SnippetData`] are the run-time views
//!   of an installed snippet's mutable fields.
//! * [`thunk::ThunkTable`] memoizes interpreter-bridge thunks by signature.
//!
//! Everything that would otherwise be global state (the helper table, the
//! code cache, trampolines and thunks) is owned by an explicitly constructed
//! [`Environment`].

/// Like `log::trace!`, but compiled out unless debug assertions or the
/// `trace-log` feature are enabled.
#[macro_export]
macro_rules! trace {
    ($($tt:tt)*) => {
        if cfg!(any(feature = "trace-log", debug_assertions)) {
            ::log::trace!($($tt)*);
        }
    };
}

pub mod abi;
pub mod buffer;
pub mod cache;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod gc;
pub mod helpers;
pub mod isa;
pub mod marshal;
pub mod memory;
pub mod reloc;
pub mod result;
pub mod runtime;
pub mod snippet;
pub mod thunk;
pub mod trampoline;

pub use crate::config::{Config, EvictionPolicy};
pub use crate::context::Environment;
pub use crate::descriptor::{
    CallDescriptor, CallKind, ConstantPoolRef, ResolutionState, ValueType,
};
pub use crate::helpers::{HelperId, HelperTable, ReturnKind};
pub use crate::result::{CompileError, CompileResult, InternalError};
pub use crate::snippet::{SnippetLabel, SnippetRequest, SnippetSet};
pub use crate::thunk::{TerseSignature, Thunk};

/// Version of the snippet data-area layout shared with the runtime's
/// resolution helpers. Any change to field order or sizes bumps this.
pub const LAYOUT_VERSION: u32 = 1;
