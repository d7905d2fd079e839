//! Call-site descriptors handed over by the main code generator.

use core::fmt;
use smallvec::SmallVec;

#[cfg(feature = "enable-serde")]
use serde_derive::{Deserialize, Serialize};

/// Semantic type of an argument or return value.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum ValueType {
    /// 8-bit integer, widened to 32 bits in its slot.
    Int8,
    /// 16-bit integer, widened to 32 bits in its slot.
    Int16,
    /// 32-bit integer.
    Int32,
    /// 64-bit integer. Occupies two stack slots.
    Int64,
    /// Object reference or raw pointer.
    Address,
    /// Single-precision float.
    Float,
    /// Double-precision float. Occupies two stack slots.
    Double,
    /// Aggregate passed by reference.
    Aggregate,
}

impl ValueType {
    /// Is this value passed in the floating-point bank?
    pub fn is_float(self) -> bool {
        matches!(self, ValueType::Float | ValueType::Double)
    }

    /// Values that take two stack slots in the interpreter's frame.
    pub fn is_wide(self) -> bool {
        matches!(self, ValueType::Int64 | ValueType::Double)
    }

    /// Size in bytes of the value, with `pointer_size` for addresses and
    /// aggregate references.
    pub fn bytes(self, pointer_size: u8) -> u8 {
        match self {
            ValueType::Int8 => 1,
            ValueType::Int16 => 2,
            ValueType::Int32 | ValueType::Float => 4,
            ValueType::Int64 | ValueType::Double => 8,
            ValueType::Address | ValueType::Aggregate => pointer_size,
        }
    }

    /// The character used for this type in a terse signature.
    pub fn terse_char(self) -> char {
        match self {
            ValueType::Int8 | ValueType::Int16 | ValueType::Int32 => 'I',
            ValueType::Int64 => 'J',
            ValueType::Address => 'L',
            ValueType::Float => 'F',
            ValueType::Double => 'D',
            ValueType::Aggregate => 'A',
        }
    }

    /// Inverse of [`ValueType::terse_char`]; narrow integers come back as
    /// `Int32`.
    pub fn from_terse_char(c: char) -> Option<Self> {
        Some(match c {
            'I' => ValueType::Int32,
            'J' => ValueType::Int64,
            'L' => ValueType::Address,
            'F' => ValueType::Float,
            'D' => ValueType::Double,
            'A' => ValueType::Aggregate,
            _ => return None,
        })
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            ValueType::Int8 => "int8",
            ValueType::Int16 => "int16",
            ValueType::Int32 => "int32",
            ValueType::Int64 => "int64",
            ValueType::Address => "address",
            ValueType::Float => "float",
            ValueType::Double => "double",
            ValueType::Aggregate => "aggregate",
        })
    }
}

/// How the call site dispatches to its callee.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum CallKind {
    /// A static method.
    Static,
    /// A non-virtual instance method (constructors, private and super calls).
    Special,
    /// A virtual method selected by the receiver's class.
    Virtual,
    /// An interface method selected by the receiver's class.
    Interface,
    /// A native method.
    Native,
    /// A method-handle invocation.
    MethodHandle,
    /// Transfer to the on-stack-replacement induction helper.
    OsrInduction,
}

impl CallKind {
    /// Call kinds whose snippets embed inline dispatch-cache slots.
    pub fn uses_dispatch_cache(self) -> bool {
        matches!(self, CallKind::Virtual | CallKind::Interface)
    }

    /// Call kinds whose snippets carry an interpreter-bridge thunk pointer.
    pub fn uses_thunk(self) -> bool {
        matches!(
            self,
            CallKind::Virtual | CallKind::Interface | CallKind::MethodHandle
        )
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            CallKind::Static => "static",
            CallKind::Special => "special",
            CallKind::Virtual => "virtual",
            CallKind::Interface => "interface",
            CallKind::Native => "native",
            CallKind::MethodHandle => "method-handle",
            CallKind::OsrInduction => "osr-induction",
        })
    }
}

/// Whether the callee is known at compile time.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum ResolutionState {
    /// The callee's method pointer is known.
    Resolved,
    /// The constant-pool entry has not been resolved yet.
    Unresolved,
    /// Resolved now, but treated as unresolved so that ahead-of-time code
    /// does not embed a method pointer from this process.
    ForcedUnresolved,
}

impl ResolutionState {
    /// Both unresolved states share the unresolved dispatch path.
    pub fn is_unresolved(self) -> bool {
        !matches!(self, ResolutionState::Resolved)
    }
}

/// The constant pool owning a call's method reference, and the index of
/// that reference.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct ConstantPoolRef {
    /// Address of the constant pool.
    pub address: u64,
    /// Index of the method reference within it.
    pub index: u32,
}

/// The shape of a call site that needs an out-of-line snippet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallDescriptor {
    /// Arguments in call order, receiver first for instance calls.
    pub args: SmallVec<[ValueType; 8]>,
    /// Return type, `None` for void.
    pub ret: Option<ValueType>,
    /// How the call dispatches.
    pub kind: CallKind,
    /// Whether the callee is synchronized.
    pub synchronized: bool,
    /// Resolution state of the callee.
    pub resolution: ResolutionState,
    /// Where the callee's method reference lives.
    pub constant_pool: ConstantPoolRef,
    /// The callee's method pointer, when resolved.
    pub method: Option<u64>,
}

impl CallDescriptor {
    /// A resolved, unsynchronized call.
    pub fn new(
        kind: CallKind,
        args: &[ValueType],
        ret: Option<ValueType>,
        constant_pool: ConstantPoolRef,
    ) -> Self {
        Self {
            args: args.iter().copied().collect(),
            ret,
            kind,
            synchronized: false,
            resolution: ResolutionState::Resolved,
            constant_pool,
            method: None,
        }
    }

    /// Marks the callee as synchronized.
    pub fn synchronized(mut self) -> Self {
        self.synchronized = true;
        self
    }

    /// Marks the callee as unresolved.
    pub fn unresolved(mut self) -> Self {
        self.resolution = ResolutionState::Unresolved;
        self.method = None;
        self
    }

    /// Records the resolved callee.
    pub fn with_method(mut self, method: u64) -> Self {
        self.resolution = ResolutionState::Resolved;
        self.method = Some(method);
        self
    }

    /// Treats a resolved call as unresolved, for code that must not embed a
    /// method pointer. Native calls and OSR induction are never forced.
    pub fn force_unresolved(mut self) -> Self {
        if self.resolution == ResolutionState::Resolved
            && !matches!(self.kind, CallKind::Native | CallKind::OsrInduction)
        {
            self.resolution = ResolutionState::ForcedUnresolved;
        }
        self
    }

    /// Whether the callee is a native method.
    pub fn is_native(&self) -> bool {
        self.kind == CallKind::Native
    }

    /// Whether the snippet carries the callee's method pointer.
    pub fn has_method_pointer(&self) -> bool {
        self.kind != CallKind::OsrInduction
    }
}
