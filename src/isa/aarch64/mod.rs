//! Encoder for AArch64.

use crate::abi::{AbiDescriptor, RegClass};
use crate::buffer::CodeBuffer;
use crate::isa::{BranchReloc, InstructionEncoder};
use crate::marshal::{ArgStore, StoreWidth};
use crate::reloc::{Reloc, RelocTarget};
use crate::result::{CompileResult, InternalError};
use target_lexicon::Triple;

pub(crate) mod regs;

/// `bl` with a zero offset.
const BL: u32 = 0b100101 << 26;
/// `b` with a zero offset.
const B: u32 = 0b000101 << 26;
/// `ldr x16, #8`
const LDR_IP0_LIT8: u32 = 0x5800_0050;
/// `br x16`
const BR_IP0: u32 = 0xd61f_0200;

/// Reach of `b`/`bl`: a signed 26-bit word offset.
const BRANCH_RANGE: i64 = 1 << 27;

/// Bits 31..22 of the store forms, by register class and width:
/// (unsigned scaled offset, unscaled signed offset).
fn store_opcodes(class: RegClass, width: StoreWidth) -> (u32, u32) {
    match (class, width) {
        (RegClass::Int, StoreWidth::W64) => (0b1111100100, 0b1111100000),
        (RegClass::Int, StoreWidth::W32) => (0b1011100100, 0b1011100000),
        (RegClass::Float, StoreWidth::W64) => (0b1111110100, 0b1111110000),
        (RegClass::Float, StoreWidth::W32) => (0b1011110100, 0b1011110000),
    }
}

fn enc_ldst_uimm12(op_31_22: u32, uimm12: u32, rn: u8, rt: u8) -> u32 {
    debug_assert!(uimm12 < (1 << 12));
    (op_31_22 << 22) | (uimm12 << 10) | (u32::from(rn) << 5) | u32::from(rt)
}

fn enc_ldst_simm9(op_31_22: u32, simm9: i32, rn: u8, rt: u8) -> u32 {
    debug_assert!((-256..256).contains(&simm9));
    (op_31_22 << 22) | (((simm9 as u32) & 0x1ff) << 12) | (u32::from(rn) << 5) | u32::from(rt)
}

/// AArch64 instruction encoder.
pub struct Aarch64Encoder {
    triple: Triple,
    abi: AbiDescriptor,
}

impl Aarch64Encoder {
    /// Create an AArch64 encoder.
    pub fn new(triple: Triple) -> Self {
        Self {
            triple,
            abi: regs::abi(),
        }
    }

    fn encode_store(&self, store: &ArgStore) -> CompileResult<u32> {
        let rn = self.abi.stack_pointer.hw_enc();
        let rt = store.reg.hw_enc();
        let size = store.width.bytes() as i32;
        let (scaled, unscaled) = store_opcodes(store.reg.class(), store.width);
        let offset = store.offset;
        if offset >= 0 && offset % size == 0 && offset / size < (1 << 12) {
            Ok(enc_ldst_uimm12(scaled, (offset / size) as u32, rn, rt))
        } else if (-256..256).contains(&offset) {
            Ok(enc_ldst_simm9(unscaled, offset, rn, rt))
        } else {
            log::error!("aarch64: cannot encode `{store}`");
            Err(InternalError::StackOffsetNotEncodable(offset).into())
        }
    }

    fn emit_branch(&self, buf: &mut CodeBuffer, opcode: u32, target: RelocTarget) -> CompileResult<()> {
        buf.add_reloc(Reloc::Arm64Call, target, 0);
        buf.put4(opcode)
    }
}

impl InstructionEncoder for Aarch64Encoder {
    fn name(&self) -> &'static str {
        "aarch64"
    }

    fn triple(&self) -> &Triple {
        &self.triple
    }

    fn abi(&self) -> &AbiDescriptor {
        &self.abi
    }

    fn instruction_alignment(&self) -> u32 {
        4
    }

    fn arg_store_len(&self, store: &ArgStore) -> CompileResult<u32> {
        self.encode_store(store).map(|_| 4)
    }

    fn emit_arg_store(&self, buf: &mut CodeBuffer, store: &ArgStore) -> CompileResult<()> {
        let inst = self.encode_store(store)?;
        buf.put4(inst)
    }

    fn branch_len(&self) -> u32 {
        4
    }

    fn branch_reloc(&self) -> BranchReloc {
        BranchReloc {
            field_offset: 0,
            kind: Reloc::Arm64Call,
            addend: 0,
        }
    }

    fn emit_call(&self, buf: &mut CodeBuffer, target: RelocTarget) -> CompileResult<()> {
        self.emit_branch(buf, BL, target)
    }

    fn emit_jump(&self, buf: &mut CodeBuffer, target: RelocTarget) -> CompileResult<()> {
        self.emit_branch(buf, B, target)
    }

    fn branch_in_range(&self, from: u64, to: u64) -> bool {
        let diff = (to as i64).wrapping_sub(from as i64);
        diff & 3 == 0 && (-BRANCH_RANGE..BRANCH_RANGE).contains(&diff)
    }

    fn trampoline_size(&self) -> Option<u32> {
        Some(16)
    }

    fn emit_trampoline(&self, buf: &mut CodeBuffer, target: u64) -> CompileResult<()> {
        debug_assert_eq!(regs::ip0().hw_enc(), 16);
        buf.put4(LDR_IP0_LIT8)?;
        buf.put4(BR_IP0)?;
        buf.put8(target)
    }

    fn padding_byte(&self) -> u8 {
        0
    }
}
