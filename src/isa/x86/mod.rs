//! Encoder for the x86 family: x86-64 and IA-32.
//!
//! Both modes share the store, call and jump encodings; they differ in the
//! linkage, the availability of REX prefixes and reachability. IA-32 wraps
//! displacements around the 32-bit address space, so every address is
//! directly reachable and no trampolines are needed.

use crate::abi::AbiDescriptor;
use crate::buffer::CodeBuffer;
use crate::isa::{BranchReloc, InstructionEncoder};
use crate::marshal::ArgStore;
use crate::reloc::{Reloc, RelocTarget};
use crate::result::CompileResult;
use target_lexicon::Triple;

mod emit;
pub(crate) mod regs;

/// The two operating modes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Mode {
    Long,
    Protected,
}

/// x86 instruction encoder.
pub struct X86Encoder {
    triple: Triple,
    mode: Mode,
    abi: AbiDescriptor,
}

impl X86Encoder {
    /// Encoder for 64-bit code.
    pub fn x64(triple: Triple) -> Self {
        Self {
            triple,
            mode: Mode::Long,
            abi: regs::x64_abi(),
        }
    }

    /// Encoder for 32-bit code.
    pub fn ia32(triple: Triple) -> Self {
        Self {
            triple,
            mode: Mode::Protected,
            abi: regs::ia32_abi(),
        }
    }

    fn encode_store(&self, store: &ArgStore) -> CompileResult<smallvec::SmallVec<[u8; 16]>> {
        emit::encode_store(
            store,
            self.abi.stack_pointer.hw_enc(),
            self.mode == Mode::Long,
        )
    }
}

impl InstructionEncoder for X86Encoder {
    fn name(&self) -> &'static str {
        match self.mode {
            Mode::Long => "x64",
            Mode::Protected => "ia32",
        }
    }

    fn triple(&self) -> &Triple {
        &self.triple
    }

    fn abi(&self) -> &AbiDescriptor {
        &self.abi
    }

    fn instruction_alignment(&self) -> u32 {
        1
    }

    fn arg_store_len(&self, store: &ArgStore) -> CompileResult<u32> {
        Ok(self.encode_store(store)?.len() as u32)
    }

    fn emit_arg_store(&self, buf: &mut CodeBuffer, store: &ArgStore) -> CompileResult<()> {
        let bytes = self.encode_store(store)?;
        buf.put_data(&bytes)
    }

    fn branch_len(&self) -> u32 {
        emit::BRANCH_LEN
    }

    fn branch_reloc(&self) -> BranchReloc {
        BranchReloc {
            field_offset: 1,
            kind: Reloc::X86CallPCRel4,
            addend: -4,
        }
    }

    fn emit_call(&self, buf: &mut CodeBuffer, target: RelocTarget) -> CompileResult<()> {
        emit::emit_branch(buf, emit::CALL_REL32, target)
    }

    fn emit_jump(&self, buf: &mut CodeBuffer, target: RelocTarget) -> CompileResult<()> {
        emit::emit_branch(buf, emit::JMP_REL32, target)
    }

    fn branch_in_range(&self, from: u64, to: u64) -> bool {
        match self.mode {
            Mode::Long => emit::rel32_in_range(from, to),
            Mode::Protected => true,
        }
    }

    fn trampoline_size(&self) -> Option<u32> {
        match self.mode {
            Mode::Long => Some(emit::TRAMPOLINE_LEN),
            Mode::Protected => None,
        }
    }

    fn emit_trampoline(&self, buf: &mut CodeBuffer, target: u64) -> CompileResult<()> {
        emit::emit_trampoline(buf, target)
    }

    fn padding_byte(&self) -> u8 {
        emit::INT3
    }
}
