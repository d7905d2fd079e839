//! Per-architecture instruction encoding.
//!
//! The snippet emitter is architecture-agnostic: everything that depends on
//! the instruction set goes through the [`InstructionEncoder`] selected once
//! per target with [`lookup`].

use crate::abi::AbiDescriptor;
use crate::buffer::CodeBuffer;
use crate::marshal::ArgStore;
use crate::reloc::{Reloc, RelocTarget};
use crate::result::{CompileResult, InternalError};
use target_lexicon::{Architecture, Triple};

pub mod aarch64;
pub mod x86;

/// How a direct branch instruction refers to its target.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BranchReloc {
    /// Offset of the relocated field from the start of the instruction.
    pub field_offset: u32,
    /// Encoding of the field.
    pub kind: Reloc,
    /// Addend to record with the relocation.
    pub addend: i64,
}

/// The instruction-set strategy used by the snippet emitter.
pub trait InstructionEncoder: Send + Sync {
    /// Get the name of the ISA.
    fn name(&self) -> &'static str;

    /// Get the target triple of the ISA.
    fn triple(&self) -> &Triple;

    /// The JIT linkage of this target.
    fn abi(&self) -> &AbiDescriptor;

    /// Size of an address in bytes.
    fn pointer_size(&self) -> u8 {
        self.abi().pointer_size
    }

    /// Every instruction starts at a multiple of this.
    fn instruction_alignment(&self) -> u32;

    /// Encoded length of an argument store.
    fn arg_store_len(&self, store: &ArgStore) -> CompileResult<u32>;

    /// Encodes an argument store.
    fn emit_arg_store(&self, buf: &mut CodeBuffer, store: &ArgStore) -> CompileResult<()>;

    /// Length of a direct call or jump.
    fn branch_len(&self) -> u32;

    /// How direct calls and jumps are relocated.
    fn branch_reloc(&self) -> BranchReloc;

    /// Emits a direct call to `target`, leaving the displacement to a
    /// relocation.
    fn emit_call(&self, buf: &mut CodeBuffer, target: RelocTarget) -> CompileResult<()>;

    /// Emits a direct jump to `target`, leaving the displacement to a
    /// relocation.
    fn emit_jump(&self, buf: &mut CodeBuffer, target: RelocTarget) -> CompileResult<()>;

    /// Whether a direct branch at `from` can reach `to`.
    fn branch_in_range(&self, from: u64, to: u64) -> bool;

    /// Size of a trampoline, or `None` if every address is directly
    /// reachable on this target.
    fn trampoline_size(&self) -> Option<u32>;

    /// Emits a trampoline that jumps to the absolute address `target`.
    fn emit_trampoline(&self, buf: &mut CodeBuffer, target: u64) -> CompileResult<()>;

    /// Filler for padding that is never executed.
    fn padding_byte(&self) -> u8;
}

/// Look up the encoder for the given target triple.
pub fn lookup(triple: Triple) -> CompileResult<Box<dyn InstructionEncoder>> {
    match triple.architecture {
        Architecture::X86_64 => Ok(Box::new(x86::X86Encoder::x64(triple))),
        Architecture::X86_32(_) => Ok(Box::new(x86::X86Encoder::ia32(triple))),
        Architecture::Aarch64(_) => Ok(Box::new(aarch64::Aarch64Encoder::new(triple))),
        _ => Err(InternalError::UnsupportedTarget(triple.to_string()).into()),
    }
}
