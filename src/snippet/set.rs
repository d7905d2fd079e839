//! The snippets of one compiled method.

use super::emit::{SizedSnippet, emit_snippet};
use super::layout::SnippetLayout;
use super::{CompiledStubs, EmittedSnippet, SnippetKind, SnippetLabel, SnippetRequest};
use crate::buffer::{CodeBuffer, Section};
use crate::context::Environment;
use crate::descriptor::CallKind;
use crate::gc::GcMapSink;
use crate::helpers::{HelperId, select_helper};
use crate::marshal::{FlushPlan, flush_arguments};
use crate::reloc::{PatchLocation, RelocTarget, Relocation, RelocationTable};
use crate::result::{CompileResult, InternalError};
use cranelift_entity::PrimaryMap;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum SnippetState {
    Sized,
    LaidOut { offset: u32 },
    Finalized,
}

impl SnippetState {
    fn name(self) -> &'static str {
        match self {
            SnippetState::Sized => "sized",
            SnippetState::LaidOut { .. } => "laid out",
            SnippetState::Finalized => "finalized",
        }
    }
}

struct Snippet {
    request: SnippetRequest,
    kind: SnippetKind,
    plan: FlushPlan,
    helper: HelperId,
    layout: SnippetLayout,
    state: SnippetState,
}

/// Sizes, lays out and emits the snippets of one method.
///
/// Compiling a method is single-threaded, so a `SnippetSet` is not shared;
/// concurrently compiled methods each use their own.
#[derive(Default)]
pub struct SnippetSet {
    snippets: PrimaryMap<SnippetLabel, Snippet>,
    call_sites: Vec<Relocation>,
    base: Option<u64>,
}

fn invalid(label: SnippetLabel, state: SnippetState, operation: &'static str) -> InternalError {
    log::error!("{label}: cannot {operation} while {}", state.name());
    InternalError::InvalidSnippetState {
        label: label.as_u32(),
        state: state.name(),
        operation,
    }
}

impl SnippetSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sizes the snippet for `request` and returns its label.
    ///
    /// With `force-unresolved` configured, resolved calls are sized and
    /// emitted as unresolved ones.
    pub fn add(&mut self, env: &Environment, mut request: SnippetRequest) -> CompileResult<SnippetLabel> {
        let label = self.snippets.next_key();
        if self.base.is_some() {
            return Err(invalid(label, SnippetState::LaidOut { offset: 0 }, "add").into());
        }
        if env.config().dispatch().force_unresolved {
            request.descriptor = request.descriptor.force_unresolved();
        }

        let isa = env.isa();
        let desc = &request.descriptor;
        let helper = select_helper(desc)?;
        let plan = flush_arguments(&desc.args, isa.abi(), 0);
        let layout = SnippetLayout::new(desc, &plan, isa, env.config())?;
        let kind = SnippetKind::of(desc);
        trace!(
            "{label}: {kind} {} call via {helper}, {} bytes",
            desc.kind,
            layout.total_len()
        );

        Ok(self.snippets.push(Snippet {
            request,
            kind,
            plan,
            helper,
            layout,
            state: SnippetState::Sized,
        }))
    }

    /// Number of snippets.
    pub fn len(&self) -> usize {
        self.snippets.len()
    }

    /// Whether the method needs no snippets.
    pub fn is_empty(&self) -> bool {
        self.snippets.is_empty()
    }

    /// The exact length of the snippet `label`, known as soon as it is added.
    /// `None` if no snippet has that label.
    pub fn estimate_length(&self, label: SnippetLabel) -> Option<u32> {
        self.snippets.get(label).map(|s| s.layout.total_len())
    }

    /// The layout of the snippet `label`.
    pub fn snippet_layout(&self, label: SnippetLabel) -> Option<&SnippetLayout> {
        self.snippets.get(label).map(|s| &s.layout)
    }

    /// The variant of the snippet `label`.
    pub fn kind(&self, label: SnippetLabel) -> Option<SnippetKind> {
        self.snippets.get(label).map(|s| s.kind)
    }

    /// The helper the snippet `label` calls.
    pub fn helper(&self, label: SnippetLabel) -> Option<HelperId> {
        self.snippets.get(label).map(|s| s.helper)
    }

    /// Combined length of all snippets.
    pub fn total_len(&self) -> u32 {
        self.snippets
            .values()
            .map(|s| s.layout.total_len())
            .sum()
    }

    /// Reserves one code-cache block for all snippets and binds their
    /// labels. Returns the block's address.
    pub fn layout(&mut self, env: &Environment) -> CompileResult<u64> {
        if let Some((label, s)) = self
            .snippets
            .iter()
            .find(|(_, s)| s.state != SnippetState::Sized)
        {
            return Err(invalid(label, s.state, "lay out").into());
        }
        let isa = env.isa();
        let align = u32::from(isa.pointer_size()).max(isa.instruction_alignment());
        let reservation = env.code_cache().reserve(self.total_len(), align)?;

        let mut offset = 0;
        for snippet in self.snippets.values_mut() {
            snippet.state = SnippetState::LaidOut { offset };
            offset += snippet.layout.total_len();
        }
        log::debug!(
            "{} snippets, {offset} bytes at {:#x}",
            self.snippets.len(),
            reservation.addr
        );
        self.base = Some(reservation.addr);
        Ok(reservation.addr)
    }

    /// Address of the snippet `label`, once laid out.
    pub fn address_of(&self, label: SnippetLabel) -> Option<u64> {
        match self.snippets.get(label)?.state {
            SnippetState::LaidOut { offset } => Some(self.base? + u64::from(offset)),
            _ => None,
        }
    }

    /// Records that the call instruction at `call_offset` in the calling
    /// method transfers to the snippet `label`. The call is patched when the
    /// method is linked.
    pub fn wire_call_site(
        &mut self,
        env: &Environment,
        call_offset: u32,
        label: SnippetLabel,
    ) -> CompileResult<()> {
        if self.snippets.get(label).is_none() {
            log::error!("call at method+{call_offset:#x} wired to unknown {label}");
            return Err(InternalError::InvalidSnippetState {
                label: label.as_u32(),
                state: "unknown",
                operation: "wire",
            }
            .into());
        }
        let branch = env.isa().branch_reloc();
        self.call_sites.push(Relocation::new(
            PatchLocation::Method(call_offset + branch.field_offset),
            branch.kind,
            RelocTarget::SnippetEntry(label),
            branch.addend,
        ));
        Ok(())
    }

    /// Writes every snippet into the block reserved by [`SnippetSet::layout`],
    /// registers the GC maps of their helper calls with `gc` and installs
    /// the block.
    pub fn emit(&mut self, env: &Environment, gc: &mut dyn GcMapSink) -> CompileResult<CompiledStubs> {
        let base = match self.base {
            Some(base) => base,
            None => {
                let label = self.snippets.keys().next().unwrap_or_else(|| SnippetLabel::from_u32(0));
                return Err(invalid(label, SnippetState::Sized, "emit").into());
            }
        };
        if let Some((label, s)) = self
            .snippets
            .iter()
            .find(|(_, s)| !matches!(s.state, SnippetState::LaidOut { .. }))
        {
            return Err(invalid(label, s.state, "emit").into());
        }

        let isa = env.isa();
        let total = self.total_len();
        let mut buf = CodeBuffer::new(Section::Stubs, base, total);
        let mut emitted = Vec::with_capacity(self.snippets.len());

        for (label, snippet) in self.snippets.iter() {
            let sized = SizedSnippet {
                label,
                kind: snippet.kind,
                request: &snippet.request,
                plan: &snippet.plan,
                helper: snippet.helper,
                layout: &snippet.layout,
            };
            let placement = emit_snippet(isa, env.config(), &sized, &mut buf)?;
            debug_assert_eq!(
                snippet.state,
                SnippetState::LaidOut {
                    offset: placement.entry
                }
            );
            emitted.push(EmittedSnippet {
                label,
                kind: snippet.kind,
                call_kind: snippet.request.descriptor.kind,
                helper: snippet.helper,
                entry: base + u64::from(placement.entry),
                data: base + u64::from(placement.data),
                layout: snippet.layout.clone(),
            });
        }

        let code = buf.finish()?;

        for snippet in &emitted {
            if snippet.call_kind == CallKind::OsrInduction {
                continue;
            }
            let ret = (snippet.call_return_address() - base) as u32;
            if !code.gc_maps.iter().any(|map| map.offset == ret) {
                log::error!("{}: helper call returning to {ret:#x} has no GC map", snippet.label);
                return Err(InternalError::MissingGcMap {
                    label: snippet.label.as_u32(),
                }
                .into());
            }
        }

        env.code_cache().write(base, &code.data)?;
        for map in &code.gc_maps {
            gc.attach_gc_map(base + u64::from(map.offset), map.live_registers);
        }

        let mut relocations = RelocationTable::new();
        relocations.extend(self.call_sites.iter().cloned());
        relocations.extend(code.relocs);

        for snippet in self.snippets.values_mut() {
            snippet.state = SnippetState::Finalized;
        }
        log::debug!(
            "installed {} snippets at {base:#x} with {} relocations",
            emitted.len(),
            relocations.len()
        );

        Ok(CompiledStubs {
            base,
            len: total,
            snippets: emitted,
            relocations,
        })
    }
}
