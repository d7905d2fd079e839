//! x86 instruction encodings used by snippets, thunks and trampolines.

use crate::abi::RegClass;
use crate::buffer::CodeBuffer;
use crate::marshal::{ArgStore, StoreWidth};
use crate::reloc::{Reloc, RelocTarget};
use crate::result::{CompileResult, InternalError};
use smallvec::SmallVec;

/// Opcode of `call rel32`.
pub(crate) const CALL_REL32: u8 = 0xe8;
/// Opcode of `jmp rel32`.
pub(crate) const JMP_REL32: u8 = 0xe9;
/// Length of `call rel32` and `jmp rel32`.
pub(crate) const BRANCH_LEN: u32 = 5;
/// `int3`, used for padding.
pub(crate) const INT3: u8 = 0xcc;
/// A trampoline is `jmp [rip+0]` followed by the 8-byte target and two
/// bytes of padding.
pub(crate) const TRAMPOLINE_LEN: u32 = 16;

/// Encodes the ModR/M byte.
#[inline(always)]
fn encode_modrm(m0d: u8, enc_reg_g: u8, rm_e: u8) -> u8 {
    debug_assert!(m0d < 4);
    debug_assert!(enc_reg_g < 8);
    debug_assert!(rm_e < 8);
    ((m0d & 3) << 6) | ((enc_reg_g & 7) << 3) | (rm_e & 7)
}

/// Encodes a REX prefix, or `None` when the instruction needs no prefix.
fn rex(w: bool, enc_g: u8, enc_e: u8) -> Option<u8> {
    let r = (enc_g >> 3) & 1;
    let b = (enc_e >> 3) & 1;
    if w || r != 0 || b != 0 {
        Some(0x40 | (u8::from(w) << 3) | (r << 2) | b)
    } else {
        None
    }
}

/// Encodes a store of `store.reg` to `[base + store.offset]`.
///
/// The same bytes are used to size and to emit the store, so the two can
/// never disagree. `rex_ok` is false in 32-bit mode, where no REX prefix
/// exists.
pub(crate) fn encode_store(
    store: &ArgStore,
    base: u8,
    rex_ok: bool,
) -> CompileResult<SmallVec<[u8; 16]>> {
    let mut bytes = SmallVec::new();
    let src = store.reg.hw_enc();
    let w = store.width == StoreWidth::W64;

    let prefix = match store.reg.class() {
        RegClass::Int => rex(w, src, base),
        RegClass::Float => rex(false, src, base),
    };
    if !rex_ok && prefix.is_some() {
        return Err(InternalError::UnsupportedTarget(format!(
            "`{}` needs a REX prefix in 32-bit mode",
            store
        ))
        .into());
    }

    match store.reg.class() {
        RegClass::Int => {
            bytes.extend(prefix);
            bytes.push(0x89);
        }
        RegClass::Float => {
            // movss / movsd: the mandatory prefix precedes REX.
            bytes.push(if w { 0xf2 } else { 0xf3 });
            bytes.extend(prefix);
            bytes.extend_from_slice(&[0x0f, 0x11]);
        }
    }

    let disp = store.offset;
    let (m0d, disp_len) = if disp == 0 && base & 7 != 5 {
        (0b00, 0)
    } else if i8::try_from(disp).is_ok() {
        (0b01, 1)
    } else {
        (0b10, 4)
    };
    bytes.push(encode_modrm(m0d, src & 7, base & 7));
    if base & 7 == 4 {
        // SIB with no index.
        bytes.push(0x20 | (base & 7));
    }
    match disp_len {
        0 => {}
        1 => bytes.push(disp as i8 as u8),
        _ => bytes.extend_from_slice(&disp.to_le_bytes()),
    }
    Ok(bytes)
}

/// Emits `call rel32` or `jmp rel32` to `target`.
pub(crate) fn emit_branch(buf: &mut CodeBuffer, opcode: u8, target: RelocTarget) -> CompileResult<()> {
    buf.put1(opcode)?;
    buf.add_reloc(Reloc::X86CallPCRel4, target, -4);
    buf.put4(0)
}

/// Emits `jmp [rip+0]; .quad target; int3; int3`.
pub(crate) fn emit_trampoline(buf: &mut CodeBuffer, target: u64) -> CompileResult<()> {
    buf.put_data(&[0xff, 0x25, 0, 0, 0, 0])?;
    buf.put8(target)?;
    buf.put_data(&[INT3, INT3])
}

/// Whether `jmp rel32` at `from` reaches `to`.
pub(crate) fn rel32_in_range(from: u64, to: u64) -> bool {
    let next = from.wrapping_add(u64::from(BRANCH_LEN));
    i32::try_from((to as i64).wrapping_sub(next as i64)).is_ok()
}
