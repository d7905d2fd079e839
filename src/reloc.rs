//! Relocation records and their application.
//!
//! Every address embedded in a snippet (a helper, the call site's return
//! address, the constant pool, a thunk, the callee's method pointer) is
//! written as a placeholder and described by a [`Relocation`]. A loader
//! applies the records once per load event: when freshly compiled code is
//! installed, or when ahead-of-time code is reloaded into another process
//! and every value has to be recomputed. Records whose value is not known at
//! load time (the method pointer of an unresolved call) stay pending until a
//! resolution event supplies it.
//!
//! Application overwrites the field, clearing any previous value, so applying
//! a record twice with the same value leaves the same bytes.

use crate::context::Environment;
use crate::descriptor::ConstantPoolRef;
use crate::helpers::HelperId;
use crate::result::{CompileResult, InternalError};
use crate::runtime::{Field, resolve_once, word_at};
use crate::snippet::SnippetLabel;
use crate::thunk::TerseSignature;
use core::convert::Infallible;
use core::fmt;

#[cfg(feature = "enable-serde")]
use serde_derive::{Deserialize, Serialize};

/// How a relocated field is encoded.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum Reloc {
    /// Absolute 4-byte address.
    Abs4,
    /// Absolute 8-byte address.
    Abs8,
    /// x86 PC-relative 4-byte displacement of a `call`/`jmp`. The addend is
    /// usually -4, as the displacement is relative to the end of the
    /// instruction.
    X86CallPCRel4,
    /// AArch64 `bl`/`b` 26-bit word offset.
    Arm64Call,
}

impl Reloc {
    /// Whether this is a PC-relative branch that may need a trampoline.
    pub fn is_branch(self) -> bool {
        matches!(self, Reloc::X86CallPCRel4 | Reloc::Arm64Call)
    }

    /// Distance from the start of the branch instruction to the field.
    pub fn field_offset(self) -> u64 {
        match self {
            Reloc::X86CallPCRel4 => 1,
            Reloc::Abs4 | Reloc::Abs8 | Reloc::Arm64Call => 0,
        }
    }
}

impl fmt::Display for Reloc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Reloc::Abs4 => "Abs4",
            Reloc::Abs8 => "Abs8",
            Reloc::X86CallPCRel4 => "CallPCRel4",
            Reloc::Arm64Call => "Arm64Call",
        })
    }
}

/// Where a relocated field lives.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum PatchLocation {
    /// Offset into the calling method's instruction stream.
    Method(u32),
    /// Offset into the method's out-of-line snippet block.
    Stubs(u32),
}

impl PatchLocation {
    /// Absolute address of the field under `bases`.
    pub fn address(self, bases: &LoadBases) -> u64 {
        match self {
            PatchLocation::Method(offset) => bases.method + u64::from(offset),
            PatchLocation::Stubs(offset) => bases.stubs + u64::from(offset),
        }
    }
}

impl fmt::Display for PatchLocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PatchLocation::Method(offset) => write!(f, "method+{offset:#x}"),
            PatchLocation::Stubs(offset) => write!(f, "stubs+{offset:#x}"),
        }
    }
}

/// What a relocated field refers to, with the data needed to recompute it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum RelocTarget {
    /// The absolute address of a runtime helper.
    Helper(HelperId),
    /// An address inside the calling method, such as a call's return address.
    MethodCode {
        /// Offset from the start of the method.
        offset: u32,
    },
    /// The constant pool owning a call's method reference.
    ConstantPool(ConstantPoolRef),
    /// The callee's method pointer. `method` is known for resolved calls;
    /// unresolved ones are applied when the constant-pool entry resolves.
    MethodObject {
        /// Where the method reference lives.
        cp: ConstantPoolRef,
        /// The method, when resolved at compile time.
        method: Option<u64>,
        /// Offset of the snippet's lock word in the snippet block, for calls
        /// resolved at run time. Applying the record then publishes the
        /// pointer through the lock word.
        lock_word: Option<u32>,
    },
    /// A method pointer that class redefinition must repatch.
    ClassRedefinition {
        /// The method the site currently points at.
        method: u64,
    },
    /// The interpreter-bridge thunk for a signature.
    ThunkPointer(TerseSignature),
    /// The entry of one of the method's own snippets.
    SnippetEntry(SnippetLabel),
}

impl fmt::Display for RelocTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RelocTarget::Helper(id) => write!(f, "helper {id}"),
            RelocTarget::MethodCode { offset } => write!(f, "method+{offset:#x}"),
            RelocTarget::ConstantPool(cp) => write!(f, "cp {:#x}", cp.address),
            RelocTarget::MethodObject { cp, method, .. } => match method {
                Some(m) => write!(f, "method-object {m:#x}"),
                None => write!(f, "method-object cp {:#x}[{}]", cp.address, cp.index),
            },
            RelocTarget::ClassRedefinition { method } => {
                write!(f, "class-redefinition site of {method:#x}")
            }
            RelocTarget::ThunkPointer(sig) => write!(f, "thunk {sig}"),
            RelocTarget::SnippetEntry(label) => write!(f, "{label}"),
        }
    }
}

/// A deferred patch: write the value of `target` plus `addend` into the
/// field at `location`, encoded as `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Relocation {
    /// Where the field is.
    pub location: PatchLocation,
    /// How the field is encoded.
    pub kind: Reloc,
    /// What the field refers to.
    pub target: RelocTarget,
    /// Constant added to the target's value.
    pub addend: i64,
}

impl Relocation {
    /// Creates a relocation record.
    pub fn new(location: PatchLocation, kind: Reloc, target: RelocTarget, addend: i64) -> Self {
        Self {
            location,
            kind,
            target,
            addend,
        }
    }
}

impl fmt::Display for Relocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {} {}", self.location, self.kind, self.target)?;
        if self.addend != 0 {
            write!(f, " {:+}", self.addend)?;
        }
        Ok(())
    }
}

/// Addresses the sections of a compiled method were loaded at.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LoadBases {
    /// Start of the method's instruction stream.
    pub method: u64,
    /// Start of the method's snippet block.
    pub stubs: u64,
}

fn overflow(kind: Reloc, at: u64, value: u64) -> crate::result::CompileError {
    log::error!("relocation {kind} at {at:#x} cannot hold {value:#x}");
    InternalError::RelocationOverflow { kind, at, value }.into()
}

/// Writes `value` into the field described by `record`.
///
/// Branches that cannot reach `value` directly are routed through the
/// trampoline serving the branch's reachable region.
pub fn apply_relocation(
    env: &Environment,
    bases: &LoadBases,
    record: &Relocation,
    value: u64,
) -> CompileResult<()> {
    let at = record.location.address(bases);
    let cache = env.code_cache();
    trace!("apply {record} = {value:#x} at {at:#x}");

    let value = if record.kind.is_branch() {
        env.resolve_branch_target(value, at - record.kind.field_offset())?
    } else {
        value
    };
    let target = value.wrapping_add(record.addend as u64);

    if let RelocTarget::MethodObject {
        lock_word: Some(lock_word),
        ..
    } = &record.target
    {
        if !record.kind.is_branch() {
            let lock = PatchLocation::Stubs(*lock_word).address(bases);
            return publish_method(env, record.kind, at, lock, target);
        }
    }

    match record.kind {
        Reloc::Abs4 => {
            let v = u32::try_from(target).map_err(|_| overflow(record.kind, at, target))?;
            cache.write(at, &v.to_le_bytes())
        }
        Reloc::Abs8 => cache.write(at, &target.to_le_bytes()),
        Reloc::X86CallPCRel4 => {
            let pcrel = if env.isa().pointer_size() == 4 {
                // The whole 32-bit address space is reachable.
                (target as u32).wrapping_sub(at as u32)
            } else {
                let diff = (target as i64).wrapping_sub(at as i64);
                i32::try_from(diff).map_err(|_| overflow(record.kind, at, value))? as u32
            };
            cache.write(at, &pcrel.to_le_bytes())
        }
        Reloc::Arm64Call => {
            let diff = (target as i64).wrapping_sub(at as i64);
            if diff & 3 != 0 || !(-(1 << 27)..(1 << 27)).contains(&diff) {
                return Err(overflow(record.kind, at, value));
            }
            let imm26 = ((diff >> 2) as u32) & 0x03ff_ffff;
            let mut inst = [0; 4];
            cache.read_into(at, &mut inst)?;
            let inst = (u32::from_le_bytes(inst) & !0x03ff_ffff) | imm26;
            cache.write(at, &inst.to_le_bytes())
        }
    }
}

/// Publishes the method pointer of a call resolved at run time, unless a
/// resolution already published one.
fn publish_method(
    env: &Environment,
    kind: Reloc,
    at: u64,
    lock: u64,
    target: u64,
) -> CompileResult<()> {
    let cache = env.code_cache();
    let (size, value) = match kind {
        Reloc::Abs4 => {
            let v = u32::try_from(target).map_err(|_| overflow(kind, at, target))?;
            (4, u64::from(v))
        }
        _ => (8, target),
    };
    let field = Field::at(cache, at, size)?;
    let lock = word_at(cache, lock)?;
    let Ok(method) = resolve_once(field, lock, || Ok::<_, Infallible>(value));
    if method != value {
        log::debug!("method pointer at {at:#x} already resolved to {method:#x}, keeping it");
    }
    Ok(())
}

/// The relocations of one compiled method.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct RelocationTable {
    records: Vec<Relocation>,
}

impl RelocationTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a record, returning its index.
    pub fn push(&mut self, record: Relocation) -> usize {
        self.records.push(record);
        self.records.len() - 1
    }

    /// All records, in recording order.
    pub fn records(&self) -> &[Relocation] {
        &self.records
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the table has no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Starts a load event for code loaded at `bases`.
    pub fn begin_load(&self, bases: LoadBases) -> LoadEvent<'_> {
        LoadEvent {
            table: self,
            bases,
            applied: vec![false; self.records.len()],
        }
    }
}

impl Extend<Relocation> for RelocationTable {
    fn extend<T: IntoIterator<Item = Relocation>>(&mut self, iter: T) {
        self.records.extend(iter);
    }
}

/// One load of a method's code. Each record is applied at most once per
/// event; later applications of the same record are no-ops.
pub struct LoadEvent<'a> {
    table: &'a RelocationTable,
    bases: LoadBases,
    applied: Vec<bool>,
}

impl<'a> LoadEvent<'a> {
    /// The bases of this load.
    pub fn bases(&self) -> LoadBases {
        self.bases
    }

    /// Applies every pending record whose target `resolve` can supply a
    /// value for, returning how many were applied. Records for which
    /// `resolve` returns `None` stay pending.
    pub fn apply_all(
        &mut self,
        env: &Environment,
        mut resolve: impl FnMut(&RelocTarget) -> CompileResult<Option<u64>>,
    ) -> CompileResult<usize> {
        let mut count = 0;
        for (index, record) in self.table.records.iter().enumerate() {
            if self.applied[index] {
                continue;
            }
            if let Some(value) = resolve(&record.target)? {
                apply_relocation(env, &self.bases, record, value)?;
                self.applied[index] = true;
                count += 1;
            }
        }
        log::debug!(
            "load at {:#x}: applied {count} relocations, {} pending",
            self.bases.method,
            self.pending().count()
        );
        Ok(count)
    }

    /// Applies record `index` with `value`. Returns `false` if the record
    /// was already applied in this event.
    ///
    /// The method pointer of an unresolved call is published the same way
    /// [`SnippetData::resolve_with`](crate::runtime::SnippetData::resolve_with)
    /// publishes it, so the first of the two to run wins.
    pub fn apply(&mut self, env: &Environment, index: usize, value: u64) -> CompileResult<bool> {
        let Some(record) = self.table.records.get(index) else {
            return Err(InternalError::UnknownRelocation {
                index,
                len: self.table.len(),
            }
            .into());
        };
        if self.applied[index] {
            return Ok(false);
        }
        apply_relocation(env, &self.bases, record, value)?;
        self.applied[index] = true;
        Ok(true)
    }

    /// Records not applied yet, with their indices.
    pub fn pending(&self) -> impl Iterator<Item = (usize, &'a Relocation)> + '_ {
        let table: &'a RelocationTable = self.table;
        table
            .records
            .iter()
            .enumerate()
            .filter(|(index, _)| !self.applied[*index])
    }

    /// Whether every record has been applied.
    pub fn is_complete(&self) -> bool {
        self.applied.iter().all(|a| *a)
    }
}
