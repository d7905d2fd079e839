//! Runtime helpers that service out-of-line calls, and the decision table
//! that picks one for a call site.

use crate::descriptor::{CallDescriptor, CallKind, ValueType};
use crate::result::{CompileResult, InternalError};
use core::fmt;
use rustc_hash::FxHashMap;

#[cfg(feature = "enable-serde")]
use serde_derive::{Deserialize, Serialize};

/// Return-type specialization of the dispatch helpers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum ReturnKind {
    /// No return value.
    Void,
    /// 8, 16 or 32-bit integer.
    Int32,
    /// 64-bit integer.
    Int64,
    /// Reference or pointer.
    Address,
    /// Single-precision float.
    Float,
    /// Double-precision float.
    Double,
}

impl ReturnKind {
    /// All return kinds, in helper-table order.
    pub const ALL: [ReturnKind; 6] = [
        ReturnKind::Void,
        ReturnKind::Int32,
        ReturnKind::Int64,
        ReturnKind::Address,
        ReturnKind::Float,
        ReturnKind::Double,
    ];

    /// Classifies a call's return type.
    ///
    /// Aggregates are returned through memory by compiled code and have no
    /// interpreter dispatch helper; asking for one is a code-generation bug.
    pub fn from_return_type(ret: Option<ValueType>) -> CompileResult<Self> {
        Ok(match ret {
            None => ReturnKind::Void,
            Some(ValueType::Int8 | ValueType::Int16 | ValueType::Int32) => ReturnKind::Int32,
            Some(ValueType::Int64) => ReturnKind::Int64,
            Some(ValueType::Address) => ReturnKind::Address,
            Some(ValueType::Float) => ReturnKind::Float,
            Some(ValueType::Double) => ReturnKind::Double,
            Some(ty @ ValueType::Aggregate) => {
                log::error!("no dispatch helper for a call returning {ty}");
                return Err(InternalError::UnsupportedReturnType(ty).into());
            }
        })
    }

    /// The character used for this return kind in a terse signature.
    pub fn terse_char(self) -> char {
        match self {
            ReturnKind::Void => 'V',
            ReturnKind::Int32 => 'I',
            ReturnKind::Int64 => 'J',
            ReturnKind::Address => 'L',
            ReturnKind::Float => 'F',
            ReturnKind::Double => 'D',
        }
    }

    fn ordinal(self) -> u32 {
        match self {
            ReturnKind::Void => 0,
            ReturnKind::Int32 => 1,
            ReturnKind::Int64 => 2,
            ReturnKind::Address => 3,
            ReturnKind::Float => 4,
            ReturnKind::Double => 5,
        }
    }
}

impl fmt::Display for ReturnKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            ReturnKind::Void => "void",
            ReturnKind::Int32 => "int32",
            ReturnKind::Int64 => "int64",
            ReturnKind::Address => "address",
            ReturnKind::Float => "float",
            ReturnKind::Double => "double",
        })
    }
}

/// Identity of a runtime helper.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum HelperId {
    /// Transfers a method running in compiled code to its OSR body.
    InduceOsr,
    /// Resolves a static callee, then dispatches to it.
    UnresolvedStatic(ReturnKind),
    /// Resolves a special callee, then dispatches to it.
    UnresolvedSpecial(ReturnKind),
    /// Resolves a virtual or interface callee, then dispatches to it.
    UnresolvedVirtual(ReturnKind),
    /// Calls a resolved native method directly.
    NativeStatic,
    /// Runs a resolved static method in the interpreter.
    InterpreterStatic {
        /// Return specialization.
        ret: ReturnKind,
        /// Whether the helper acquires the callee's monitor.
        synchronized: bool,
    },
    /// Runs a resolved special method in the interpreter.
    InterpreterSpecial {
        /// Return specialization.
        ret: ReturnKind,
        /// Whether the helper acquires the callee's monitor.
        synchronized: bool,
    },
    /// Generic virtual/interface dispatch once a call site goes megamorphic.
    MegamorphicDispatch,
    /// Interpreter entry used by interpreter-bridge thunks.
    ThunkDispatch(ReturnKind),
}

impl HelperId {
    /// Every helper, in [`HelperId::index`] order.
    pub fn all() -> impl Iterator<Item = HelperId> {
        let per_ret = |f: fn(ReturnKind) -> HelperId| ReturnKind::ALL.into_iter().map(f);
        let interp = |special: bool| {
            ReturnKind::ALL.into_iter().flat_map(move |ret| {
                [false, true].into_iter().map(move |synchronized| {
                    if special {
                        HelperId::InterpreterSpecial { ret, synchronized }
                    } else {
                        HelperId::InterpreterStatic { ret, synchronized }
                    }
                })
            })
        };
        [
            HelperId::InduceOsr,
            HelperId::NativeStatic,
            HelperId::MegamorphicDispatch,
        ]
        .into_iter()
        .chain(per_ret(HelperId::ThunkDispatch))
        .chain(per_ret(HelperId::UnresolvedStatic))
        .chain(per_ret(HelperId::UnresolvedSpecial))
        .chain(per_ret(HelperId::UnresolvedVirtual))
        .chain(interp(false))
        .chain(interp(true))
    }

    /// Dense index of this helper in the runtime's helper table. Unresolved
    /// snippets store the index of the helper to use once resolved.
    pub fn index(self) -> u32 {
        match self {
            HelperId::InduceOsr => 0,
            HelperId::NativeStatic => 1,
            HelperId::MegamorphicDispatch => 2,
            HelperId::ThunkDispatch(ret) => 3 + ret.ordinal(),
            HelperId::UnresolvedStatic(ret) => 9 + ret.ordinal(),
            HelperId::UnresolvedSpecial(ret) => 15 + ret.ordinal(),
            HelperId::UnresolvedVirtual(ret) => 21 + ret.ordinal(),
            HelperId::InterpreterStatic { ret, synchronized } => {
                27 + 2 * ret.ordinal() + u32::from(synchronized)
            }
            HelperId::InterpreterSpecial { ret, synchronized } => {
                39 + 2 * ret.ordinal() + u32::from(synchronized)
            }
        }
    }
}

impl fmt::Display for HelperId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            HelperId::InduceOsr => write!(f, "induce-osr"),
            HelperId::NativeStatic => write!(f, "native-static"),
            HelperId::MegamorphicDispatch => write!(f, "megamorphic-dispatch"),
            HelperId::ThunkDispatch(ret) => write!(f, "thunk-dispatch-{ret}"),
            HelperId::UnresolvedStatic(ret) => write!(f, "interpreter-unresolved-static-{ret}"),
            HelperId::UnresolvedSpecial(ret) => write!(f, "interpreter-unresolved-special-{ret}"),
            HelperId::UnresolvedVirtual(ret) => write!(f, "interpreter-unresolved-virtual-{ret}"),
            HelperId::InterpreterStatic { ret, synchronized } => {
                let sync = if synchronized { "sync-" } else { "" };
                write!(f, "interpreter-static-{sync}{ret}")
            }
            HelperId::InterpreterSpecial { ret, synchronized } => {
                let sync = if synchronized { "sync-" } else { "" };
                write!(f, "interpreter-special-{sync}{ret}")
            }
        }
    }
}

/// Picks the helper a call site's snippet transfers to.
///
/// Rules, first match wins:
///
/// 1. OSR induction uses [`HelperId::InduceOsr`] whatever it returns.
/// 2. Unresolved calls use the unresolved family for their dispatch kind.
/// 3. Native calls use [`HelperId::NativeStatic`].
/// 4. Everything else runs in the interpreter, specialized by return type and
///    synchronization.
pub fn select_helper(desc: &CallDescriptor) -> CompileResult<HelperId> {
    if desc.kind == CallKind::OsrInduction {
        return Ok(HelperId::InduceOsr);
    }

    let ret = ReturnKind::from_return_type(desc.ret)?;

    if desc.resolution.is_unresolved() {
        return Ok(match desc.kind {
            CallKind::Static | CallKind::Native => HelperId::UnresolvedStatic(ret),
            CallKind::Special => HelperId::UnresolvedSpecial(ret),
            CallKind::Virtual | CallKind::Interface | CallKind::MethodHandle => {
                HelperId::UnresolvedVirtual(ret)
            }
            CallKind::OsrInduction => unreachable!(),
        });
    }

    if desc.is_native() {
        return Ok(HelperId::NativeStatic);
    }

    Ok(interpreter_helper(desc.kind, ret, desc.synchronized))
}

/// The interpreter dispatch helper a call site uses once its callee is
/// resolved.
pub fn interpreter_helper(kind: CallKind, ret: ReturnKind, synchronized: bool) -> HelperId {
    match kind {
        CallKind::Static | CallKind::Native | CallKind::OsrInduction => {
            HelperId::InterpreterStatic { ret, synchronized }
        }
        CallKind::Special | CallKind::Virtual | CallKind::Interface | CallKind::MethodHandle => {
            HelperId::InterpreterSpecial { ret, synchronized }
        }
    }
}

/// Addresses of the runtime helpers, registered by the VM once at startup.
#[derive(Debug, Clone, Default)]
pub struct HelperTable {
    addresses: FxHashMap<HelperId, u64>,
}

impl HelperTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// A table placing every helper `stride` bytes apart from `base`, in
    /// [`HelperId::index`] order. Useful for tests and for inspecting layouts
    /// without a VM.
    pub fn synthetic(base: u64, stride: u64) -> Self {
        let mut table = Self::new();
        for id in HelperId::all() {
            table.define(id, base + u64::from(id.index()) * stride);
        }
        table
    }

    /// Registers (or replaces) the address of `id`.
    pub fn define(&mut self, id: HelperId, address: u64) -> &mut Self {
        self.addresses.insert(id, address);
        self
    }

    /// The address of `id`.
    pub fn resolve_helper_address(&self, id: HelperId) -> CompileResult<u64> {
        self.addresses.get(&id).copied().ok_or_else(|| {
            log::error!("helper `{id}` was selected but never registered");
            InternalError::MissingHelper(id).into()
        })
    }
}
