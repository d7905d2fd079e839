//! Writing one snippet.

use super::layout::{LOCK_RESOLVED, LOCK_UNRESOLVED, NO_CP_INDEX, SnippetLayout};
use super::{SnippetKind, SnippetLabel, SnippetRequest};
use crate::buffer::CodeBuffer;
use crate::config::Config;
use crate::descriptor::{CallKind, ResolutionState};
use crate::helpers::{HelperId, ReturnKind, interpreter_helper};
use crate::isa::InstructionEncoder;
use crate::marshal::FlushPlan;
use crate::reloc::{Reloc, RelocTarget};
use crate::result::{CompileResult, InternalError};
use crate::thunk::TerseSignature;

/// Offsets of an emitted snippet within its buffer.
pub(super) struct Placement {
    pub entry: u32,
    pub data: u32,
}

/// Everything about a snippet that is fixed once it has been sized.
pub(super) struct SizedSnippet<'a> {
    pub label: SnippetLabel,
    pub kind: SnippetKind,
    pub request: &'a SnippetRequest,
    pub plan: &'a FlushPlan,
    pub helper: HelperId,
    pub layout: &'a SnippetLayout,
}

fn pointer_reloc(pointer_size: u8) -> Reloc {
    if pointer_size == 4 { Reloc::Abs4 } else { Reloc::Abs8 }
}

/// Writes `snippet` at the current position of `buf` and checks that it
/// came out exactly as long as its layout says.
pub(super) fn emit_snippet(
    isa: &dyn InstructionEncoder,
    config: &Config,
    snippet: &SizedSnippet<'_>,
    buf: &mut CodeBuffer,
) -> CompileResult<Placement> {
    let desc = &snippet.request.descriptor;
    let layout = snippet.layout;
    let p = layout.pointer_size;
    let abs = pointer_reloc(p);
    let start = buf.cur_offset();
    trace!(
        "{}: {} snippet for {} call at {:#x}",
        snippet.label,
        snippet.kind,
        desc.kind,
        buf.cur_addr()
    );

    snippet.plan.emit(isa, buf)?;

    let target = RelocTarget::Helper(snippet.helper);
    if desc.kind == CallKind::OsrInduction {
        isa.emit_jump(buf, target)?;
    } else {
        isa.emit_call(buf, target)?;
        buf.add_gc_map(snippet.request.live_registers);
    }

    let pad = buf.align_to(u32::from(p), isa.padding_byte())?;
    let data = buf.cur_offset();

    buf.add_reloc(
        abs,
        RelocTarget::MethodCode {
            offset: snippet.request.return_offset,
        },
        0,
    );
    buf.put_word(0, p)?;

    let unresolved = desc.resolution.is_unresolved();
    if unresolved {
        buf.add_reloc(abs, RelocTarget::ConstantPool(desc.constant_pool), 0);
        buf.put_word(0, p)?;
        buf.put_word(u64::from(desc.constant_pool.index), p)?;
    } else {
        buf.put_word(0, p)?;
        buf.put_word(NO_CP_INDEX, p)?;
    }

    if layout.method.is_some() {
        let method = match desc.resolution {
            ResolutionState::Resolved => desc.method,
            _ => None,
        };
        buf.add_reloc(
            abs,
            RelocTarget::MethodObject {
                cp: desc.constant_pool,
                method,
                lock_word: unresolved.then(|| data + layout.lock_word),
            },
            0,
        );
        if let Some(method) = method.filter(|_| config.dispatch().class_redefinition) {
            buf.add_reloc(abs, RelocTarget::ClassRedefinition { method }, 0);
        }
        buf.put_word(0, p)?;
    }

    if layout.thunk.is_some() {
        buf.add_reloc(
            abs,
            RelocTarget::ThunkPointer(TerseSignature::from_descriptor(desc)),
            0,
        );
        buf.put_word(0, p)?;
    }

    if let Some(cache) = layout.cache {
        buf.put_fill(0, cache.slot_count * 3 * u32::from(p))?;
        buf.put4(0)?;
    }

    // OSR induction has nothing to dispatch to; record the static
    // interpreter entry so the field is never garbage.
    let ret = match desc.kind {
        CallKind::OsrInduction => ReturnKind::Void,
        _ => ReturnKind::from_return_type(desc.ret)?,
    };
    buf.put4(interpreter_helper(desc.kind, ret, desc.synchronized).index())?;
    buf.put4(if unresolved { LOCK_UNRESOLVED } else { LOCK_RESOLVED })?;

    let tail = layout.padding.checked_sub(pad);
    if let Some(tail) = tail {
        buf.put_fill(isa.padding_byte(), tail)?;
    }

    let actual = buf.cur_offset() - start;
    let estimated = layout.total_len();
    if tail.is_none() || actual != estimated {
        let return_address = buf.base() + u64::from(start + layout.call_return_offset());
        log::error!(
            "{}: {} snippet returning to {return_address:#x} is {actual} bytes, sized as {estimated}",
            snippet.label,
            snippet.kind,
        );
        return Err(InternalError::SizeMismatch {
            label: snippet.label.as_u32(),
            kind: snippet.kind,
            return_address,
            estimated,
            actual,
        }
        .into());
    }

    Ok(Placement { entry: start, data })
}
