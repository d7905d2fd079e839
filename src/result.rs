//! Result and error types representing the outcome of generating snippets.

use crate::descriptor::ValueType;
use crate::helpers::HelperId;
use crate::reloc::Reloc;
use crate::snippet::SnippetKind;
use thiserror::Error;

/// A snippet, trampoline or thunk could not be generated.
///
/// Resource exhaustion is reported for the method being compiled, and the VM
/// runs that method in the interpreter instead. [`CompileError::Internal`]
/// means the binary contract with the runtime would be violated; it must
/// abort the compilation and is never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// No code-cache segment can hold an allocation of this size.
    #[error("code cache is full: cannot allocate {requested} bytes")]
    CodeCacheFull {
        /// Number of bytes asked for.
        requested: usize,
    },

    /// The reachable region of a call site has no room left for a trampoline.
    #[error("no reachable space for a trampoline to {target:#x} from {call_site:#x}")]
    TrampolineSpaceExhausted {
        /// Address the branch wants to reach.
        target: u64,
        /// Address of the branch instruction.
        call_site: u64,
    },

    /// The configuration an environment was created with is inconsistent.
    #[error("{0}")]
    InvalidConfig(String),

    /// An internal consistency check failed.
    #[error(transparent)]
    Internal(#[from] InternalError),
}

impl CompileError {
    /// Whether this error indicates a code-generation bug or a broken setup
    /// rather than a shortage of resources.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CompileError::Internal(_) | CompileError::InvalidConfig(_))
    }
}

/// A violated invariant inside the snippet generator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InternalError {
    /// Emission wrote a different number of bytes than was reserved.
    #[error(
        "{kind} snippet {label} with its call returning to {return_address:#x}: \
         estimated {estimated} bytes but emitted {actual}"
    )]
    SizeMismatch {
        /// Index of the snippet within its method.
        label: u32,
        /// Which kind of snippet was being emitted.
        kind: SnippetKind,
        /// Return address of the snippet's helper call.
        return_address: u64,
        /// Length computed before emission.
        estimated: u32,
        /// Length actually emitted.
        actual: u32,
    },

    /// No dispatch helper exists for this return type.
    #[error("no dispatch helper returns {0}")]
    UnsupportedReturnType(ValueType),

    /// A write ran past the end of a code buffer.
    #[error("code buffer overrun: {len} bytes at offset {offset} of a {capacity}-byte buffer")]
    BufferOverrun {
        /// Offset of the write.
        offset: u32,
        /// Size of the write.
        len: u32,
        /// Capacity of the buffer.
        capacity: u32,
    },

    /// A helper was selected that the VM never registered.
    #[error("helper `{0}` has no registered address")]
    MissingHelper(HelperId),

    /// A branch cannot reach its target and the target has no trampolines.
    #[error("branch at {from:#x} cannot reach {to:#x}")]
    BranchOutOfRange {
        /// Address of the branch instruction.
        from: u64,
        /// Address it needs to reach.
        to: u64,
    },

    /// A snippet was driven through its lifecycle out of order.
    #[error("snippet {label}: cannot {operation} while {state}")]
    InvalidSnippetState {
        /// Index of the snippet within its method.
        label: u32,
        /// The state the snippet was in.
        state: &'static str,
        /// The operation that was attempted.
        operation: &'static str,
    },

    /// An argument slot offset has no encoding on this target.
    #[error("stack offset {0} cannot be encoded in an argument store")]
    StackOffsetNotEncodable(i32),

    /// A relocated value does not fit the field that holds it.
    #[error("value {value:#x} does not fit a {kind} relocation at {at:#x}")]
    RelocationOverflow {
        /// Encoding of the field.
        kind: Reloc,
        /// Address of the field.
        at: u64,
        /// Value that was to be written.
        value: u64,
    },

    /// The triple names an architecture without an encoder.
    #[error("unsupported target `{0}`")]
    UnsupportedTarget(String),

    /// A helper call was emitted without registering its GC map.
    #[error("snippet {label}: helper call has no GC map")]
    MissingGcMap {
        /// Index of the snippet within its method.
        label: u32,
    },

    /// A load event was asked to apply a record its table does not have.
    #[error("no relocation {index} in a table of {len}")]
    UnknownRelocation {
        /// Index that was asked for.
        index: usize,
        /// Number of records in the table.
        len: usize,
    },

    /// An access fell outside every code-cache segment.
    #[error("address range {addr:#x}+{len} is not inside the code cache")]
    OutsideCodeCache {
        /// Start of the access.
        addr: u64,
        /// Length of the access.
        len: usize,
    },
}

/// A convenient alias for a `Result` that uses `CompileError` as the error type.
pub type CompileResult<T> = Result<T, CompileError>;
