//! Out-of-line call snippets.
//!
//! Each call site that needs one gets a snippet: a few instructions that
//! flush the argument registers and call the runtime helper servicing the
//! call, followed by the data the helper reads and patches. A method's
//! snippets are managed together by a [`SnippetSet`], which drives each of
//! them through three states:
//!
//! * *sized*: [`SnippetSet::add`] computed the exact length from the call
//!   descriptor and the target alone;
//! * *laid out*: [`SnippetSet::layout`] reserved one code-cache block for all
//!   of the method's snippets and bound every label to an address;
//! * *finalized*: [`SnippetSet::emit`] wrote the bytes, checked that each
//!   snippet came out exactly as long as sized, registered the GC maps and
//!   installed the block.

use crate::context::Environment;
use crate::descriptor::{CallDescriptor, CallKind};
use crate::helpers::HelperId;
use crate::reloc::{LoadBases, LoadEvent, RelocTarget, RelocationTable};
use crate::result::CompileResult;
use core::fmt;
use cranelift_entity::entity_impl;

mod emit;
pub mod layout;
mod set;

pub use self::layout::{SnippetLayout, data_area};
pub use self::set::SnippetSet;

#[cfg(feature = "enable-serde")]
use serde_derive::{Deserialize, Serialize};

/// A reference to a snippet of the method being compiled.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct SnippetLabel(u32);
entity_impl!(SnippetLabel, "snippet");

/// The variant of a snippet, decided by its call descriptor.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SnippetKind {
    /// The callee is known.
    Resolved,
    /// A static or special callee still to be resolved.
    Unresolved,
    /// A virtual callee still to be resolved.
    VirtualUnresolved,
    /// An interface callee still to be resolved.
    InterfaceUnresolved,
    /// A jump to the OSR induction helper.
    OsrInduction,
}

impl SnippetKind {
    /// Classifies the snippet of `desc`.
    pub fn of(desc: &CallDescriptor) -> Self {
        match desc.kind {
            CallKind::OsrInduction => SnippetKind::OsrInduction,
            _ if !desc.resolution.is_unresolved() => SnippetKind::Resolved,
            CallKind::Virtual | CallKind::MethodHandle => SnippetKind::VirtualUnresolved,
            CallKind::Interface => SnippetKind::InterfaceUnresolved,
            _ => SnippetKind::Unresolved,
        }
    }
}

impl fmt::Display for SnippetKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            SnippetKind::Resolved => "resolved",
            SnippetKind::Unresolved => "unresolved",
            SnippetKind::VirtualUnresolved => "virtual-unresolved",
            SnippetKind::InterfaceUnresolved => "interface-unresolved",
            SnippetKind::OsrInduction => "osr-induction",
        })
    }
}

/// A call site that needs a snippet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnippetRequest {
    /// The call.
    pub descriptor: CallDescriptor,
    /// Offset of the call's return address within the calling method.
    pub return_offset: u32,
    /// Registers holding live references across the helper call, one bit
    /// per register encoding.
    pub live_registers: u32,
}

impl SnippetRequest {
    /// A request for the call `descriptor` returning to `return_offset`.
    pub fn new(descriptor: CallDescriptor, return_offset: u32) -> Self {
        Self {
            descriptor,
            return_offset,
            live_registers: 0,
        }
    }

    /// Sets the registers holding live references across the helper call.
    pub fn live_registers(mut self, mask: u32) -> Self {
        self.live_registers = mask;
        self
    }
}

/// A finalized snippet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmittedSnippet {
    pub(crate) label: SnippetLabel,
    pub(crate) kind: SnippetKind,
    pub(crate) call_kind: CallKind,
    pub(crate) helper: HelperId,
    pub(crate) entry: u64,
    pub(crate) data: u64,
    pub(crate) layout: SnippetLayout,
}

impl EmittedSnippet {
    /// The snippet's label.
    pub fn label(&self) -> SnippetLabel {
        self.label
    }

    /// The snippet's variant.
    pub fn kind(&self) -> SnippetKind {
        self.kind
    }

    /// How the call it serves dispatches.
    pub fn call_kind(&self) -> CallKind {
        self.call_kind
    }

    /// The helper it calls.
    pub fn helper(&self) -> HelperId {
        self.helper
    }

    /// Address of its first instruction.
    pub fn entry(&self) -> u64 {
        self.entry
    }

    /// Its length in bytes.
    pub fn len(&self) -> u32 {
        self.layout.total_len()
    }

    /// Whether the snippet is empty; never true.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return address of its helper call.
    pub fn call_return_address(&self) -> u64 {
        self.entry + u64::from(self.layout.call_return_offset())
    }

    /// Address of its data area.
    pub fn data_address(&self) -> u64 {
        self.data
    }

    /// Address of the method-pointer field, which resolution patches.
    pub fn method_field(&self) -> Option<u64> {
        self.layout.method.map(|off| self.data + u64::from(off))
    }

    /// Its layout.
    pub fn layout(&self) -> &SnippetLayout {
        &self.layout
    }
}

/// The installed snippets of one method and the relocations that complete
/// them.
#[derive(Debug, Clone)]
pub struct CompiledStubs {
    pub(crate) base: u64,
    pub(crate) len: u32,
    pub(crate) snippets: Vec<EmittedSnippet>,
    pub(crate) relocations: RelocationTable,
}

impl CompiledStubs {
    /// Address of the snippet block.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Length of the snippet block.
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Whether the method has no snippets.
    pub fn is_empty(&self) -> bool {
        self.snippets.is_empty()
    }

    /// The snippets, in label order.
    pub fn snippets(&self) -> &[EmittedSnippet] {
        &self.snippets
    }

    /// The snippet labelled `label`, if this method has one.
    pub fn snippet(&self, label: SnippetLabel) -> Option<&EmittedSnippet> {
        self.snippets.get(label.as_u32() as usize)
    }

    /// The relocations of the snippets and of the call sites wired to them.
    pub fn relocations(&self) -> &RelocationTable {
        &self.relocations
    }

    /// Starts a load event for the calling method installed at
    /// `method_base` and applies every relocation whose value is known now:
    /// helper addresses (through trampolines where needed), return
    /// addresses, constant pools, thunks, resolved method pointers and the
    /// call-site branches. Method pointers of unresolved calls stay pending
    /// in the returned event.
    pub fn link(&self, env: &Environment, method_base: u64) -> CompileResult<LoadEvent<'_>> {
        let bases = LoadBases {
            method: method_base,
            stubs: self.base,
        };
        let mut event = self.relocations.begin_load(bases);
        event.apply_all(env, |target| self.resolve_target(env, &bases, target))?;
        Ok(event)
    }

    /// The value of `target` for code loaded at `bases`, or `None` if it is
    /// not known yet.
    pub fn resolve_target(
        &self,
        env: &Environment,
        bases: &LoadBases,
        target: &RelocTarget,
    ) -> CompileResult<Option<u64>> {
        Ok(match target {
            RelocTarget::Helper(id) => Some(env.helpers().resolve_helper_address(*id)?),
            RelocTarget::MethodCode { offset } => Some(bases.method + u64::from(*offset)),
            RelocTarget::ConstantPool(cp) => Some(cp.address),
            RelocTarget::MethodObject { method, .. } => *method,
            RelocTarget::ClassRedefinition { method } => Some(*method),
            RelocTarget::ThunkPointer(signature) => {
                Some(env.get_or_create_thunk(signature)?.entry())
            }
            RelocTarget::SnippetEntry(label) => self.snippet(*label).map(|snippet| snippet.entry),
        })
    }
}
