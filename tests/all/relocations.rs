use super::*;
use callstubs::reloc::{LoadBases, PatchLocation, Reloc, RelocTarget, Relocation, apply_relocation};
use callstubs::runtime::LockState;
use callstubs::{CallKind, CompileError, HelperId, InternalError, ReturnKind, ValueType};
use std::sync::atomic::{AtomicUsize, Ordering};

fn unresolved_static() -> CallDescriptor {
    CallDescriptor::new(CallKind::Static, &[ValueType::Int32], None, CP).unresolved()
}

fn stub_bytes(env: &Environment, m: &Method) -> Vec<u8> {
    env.code_cache()
        .read(m.stubs.base(), m.stubs.len() as usize)
        .unwrap()
}

#[test]
fn records_in_emission_order() {
    let env = env_for(X64, |_| {});
    let m = compile(&env, &[unresolved_static()]).unwrap();
    let label = m.labels[0];
    let snippet = m.stubs.snippet(label).unwrap();
    let lock_word = (snippet.data_address() - m.stubs.base()) as u32 + snippet.layout().lock_word;
    let targets: Vec<_> = m
        .stubs
        .relocations()
        .records()
        .iter()
        .map(|r| r.target.clone())
        .collect();
    assert_eq!(
        targets,
        vec![
            RelocTarget::SnippetEntry(label),
            RelocTarget::Helper(HelperId::UnresolvedStatic(ReturnKind::Void)),
            RelocTarget::MethodCode { offset: 5 },
            RelocTarget::ConstantPool(CP),
            RelocTarget::MethodObject {
                cp: CP,
                method: None,
                lock_word: Some(lock_word),
            },
        ]
    );
    let call_site = &m.stubs.relocations().records()[0];
    assert_eq!(call_site.location, PatchLocation::Method(1));
    assert_eq!(call_site.kind, Reloc::X86CallPCRel4);
    assert_eq!(call_site.addend, -4);
}

#[test]
fn class_redefinition_sites_are_opt_in() {
    let desc = CallDescriptor::new(CallKind::Special, &[ValueType::Address], None, CP)
        .with_method(METHOD);
    let count = |env: &Environment| {
        let m = compile(env, &[desc.clone()]).unwrap();
        m.stubs
            .relocations()
            .records()
            .iter()
            .filter(|r| matches!(r.target, RelocTarget::ClassRedefinition { .. }))
            .count()
    };
    assert_eq!(count(&env_for(X64, |_| {})), 0);
    assert_eq!(
        count(&env_for(X64, |config| {
            config.class_redefinition(true);
        })),
        1
    );

    // Nothing to redefine before the callee is known.
    let env = env_for(X64, |config| {
        config.class_redefinition(true);
    });
    let m = compile(&env, &[unresolved_static()]).unwrap();
    assert!(!m
        .stubs
        .relocations()
        .records()
        .iter()
        .any(|r| matches!(r.target, RelocTarget::ClassRedefinition { .. })));
}

#[test]
fn linking_twice_is_idempotent() {
    let env = env_for(X64, |_| {});
    let calls = [
        unresolved_static(),
        CallDescriptor::new(CallKind::Virtual, &[ValueType::Address], None, CP).unresolved(),
        CallDescriptor::new(CallKind::Static, &[], None, CP).with_method(METHOD),
    ];
    let m = compile(&env, &calls).unwrap();

    m.stubs.link(&env, m.base).unwrap();
    let stubs = stub_bytes(&env, &m);
    let method = env.code_cache().read(m.base, 15).unwrap();

    let mut event = m.stubs.link(&env, m.base).unwrap();
    assert_eq!(stub_bytes(&env, &m), stubs);
    assert_eq!(env.code_cache().read(m.base, 15).unwrap(), method);
    assert_eq!(env.thunks().len(), 1);

    let pending: Vec<usize> = event.pending().map(|(index, _)| index).collect();
    assert_eq!(pending.len(), 2);
    for &index in &pending {
        assert!(event.apply(&env, index, METHOD).unwrap());
    }
    let resolved = stub_bytes(&env, &m);
    for &index in &pending {
        assert!(!event.apply(&env, index, METHOD).unwrap());
    }
    assert_eq!(stub_bytes(&env, &m), resolved);
    assert!(event.is_complete());

    // Applying a record by hand, twice, writes the same bytes.
    let record = &m.stubs.relocations().records()[pending[0]];
    apply_relocation(&env, &event.bases(), record, METHOD).unwrap();
    apply_relocation(&env, &event.bases(), record, METHOD).unwrap();
    assert_eq!(stub_bytes(&env, &m), resolved);
}

#[test]
fn resolution_patches_the_method_pointer() {
    let env = env_for(AARCH64, |_| {});
    let m = compile(&env, &[unresolved_static()]).unwrap();
    let snippet = m.stubs.snippet(m.labels[0]).unwrap();
    let mut event = m.stubs.link(&env, m.base).unwrap();
    let data = env.snippet_data(snippet).unwrap();
    assert_eq!(data.method(), None);

    let (index, record) = event.pending().next().unwrap();
    assert_eq!(
        record.location.address(&event.bases()),
        snippet.method_field().unwrap()
    );
    assert!(event.apply(&env, index, METHOD).unwrap());
    assert_eq!(data.method(), Some(METHOD));
    assert_eq!(data.lock_state(), LockState::Resolved);
    assert!(event.is_complete());

    // The patched call is resolved for the runtime too.
    let resolved = data.resolve_with(|_| -> Result<u64, ()> {
        panic!("a patched call must not be resolved again")
    });
    assert_eq!(resolved, Ok(METHOD));
    assert_eq!(data.method(), Some(METHOD));
}

#[test]
fn runtime_resolution_is_not_overwritten_by_a_later_patch() {
    let env = env_for(X64, |_| {});
    let m = compile(&env, &[unresolved_static()]).unwrap();
    let mut event = m.stubs.link(&env, m.base).unwrap();
    let data = env.snippet_data(m.stubs.snippet(m.labels[0]).unwrap()).unwrap();

    assert_eq!(data.resolve_with(|_| Ok::<_, ()>(METHOD)), Ok(METHOD));
    let (index, _) = event.pending().next().unwrap();
    assert!(event.apply(&env, index, 0x0e00_0080).unwrap());
    assert_eq!(data.method(), Some(METHOD));
    assert_eq!(data.lock_state(), LockState::Resolved);
}

#[test]
fn a_published_pointer_short_circuits_resolution() {
    let env = env_for(X64, |_| {});
    let m = compile(&env, &[unresolved_static()]).unwrap();
    let _event = m.stubs.link(&env, m.base).unwrap();
    let snippet = m.stubs.snippet(m.labels[0]).unwrap();
    let data = env.snippet_data(snippet).unwrap();

    // A pointer written outside the lock protocol still counts.
    env.code_cache()
        .write(snippet.method_field().unwrap(), &METHOD.to_le_bytes())
        .unwrap();
    assert_eq!(data.lock_state(), LockState::Unresolved);
    let resolved = data.resolve_with(|_| -> Result<u64, ()> { panic!("already resolved") });
    assert_eq!(resolved, Ok(METHOD));
}

#[test]
fn unknown_records_and_labels_are_reported() {
    let env = env_for(X64, |_| {});
    let m = compile(&env, &[unresolved_static()]).unwrap();
    let mut event = m.stubs.link(&env, m.base).unwrap();
    let len = m.stubs.relocations().len();
    assert_eq!(
        event.apply(&env, len, METHOD),
        Err(CompileError::Internal(InternalError::UnknownRelocation { index: len, len }))
    );
    assert!(m.stubs.snippet(SnippetLabel::from_u32(7)).is_none());
}

#[test]
fn call_sites_branch_to_their_snippets() {
    for triple in [X64, IA32] {
        let env = env_for(triple, |_| {});
        let m = compile(&env, &[unresolved_static(), unresolved_static()]).unwrap();
        m.stubs.link(&env, m.base).unwrap();
        for (i, &label) in m.labels.iter().enumerate() {
            let call = m.base + u64::from(Method::call_offset(&env, i));
            assert_eq!(read_u32(&env, call) & 0xff, 0xe8);
            assert_eq!(x86_branch_dest(&env, call), m.stubs.snippet(label).unwrap().entry());
        }
    }

    let env = env_for(AARCH64, |_| {});
    let m = compile(&env, &[unresolved_static()]).unwrap();
    m.stubs.link(&env, m.base).unwrap();
    assert_eq!(read_u32(&env, m.base) >> 26, 0b100101);
    assert_eq!(
        arm64_branch_dest(&env, m.base),
        m.stubs.snippet(m.labels[0]).unwrap().entry()
    );
}

#[test]
fn relinking_a_moved_method() {
    let env = env_for(X64, |_| {});
    let m = compile(&env, &[unresolved_static()]).unwrap();
    let snippet = m.stubs.snippet(m.labels[0]).unwrap();
    m.stubs.link(&env, m.base).unwrap();

    // Load the same method body somewhere else and link it there.
    let moved = env.code_cache().reserve(5, 16).unwrap().addr;
    let body = env.code_cache().read(m.base, 5).unwrap();
    env.code_cache().write(moved, &body).unwrap();
    let event = m.stubs.link(&env, moved).unwrap();
    assert_eq!(
        event.bases(),
        LoadBases {
            method: moved,
            stubs: m.stubs.base()
        }
    );

    let data = env.snippet_data(snippet).unwrap();
    assert_eq!(data.return_address(), moved + 5);
    assert_eq!(x86_branch_dest(&env, moved), snippet.entry());
}

#[test]
fn far_helpers_share_one_trampoline() {
    let far = 0x7f00_0000_0000;
    let env = env_with_helpers(X64, HelperTable::synthetic(far, HELPER_STRIDE), |_| {});
    let m = compile(&env, &[unresolved_static(), unresolved_static()]).unwrap();
    m.stubs.link(&env, m.base).unwrap();

    let helper = far + u64::from(HelperId::UnresolvedStatic(ReturnKind::Void).index()) * HELPER_STRIDE;
    let dests: Vec<u64> = m
        .labels
        .iter()
        .map(|&label| {
            let snippet = m.stubs.snippet(label).unwrap();
            x86_branch_dest(&env, snippet.entry() + u64::from(snippet.layout().flush_len))
        })
        .collect();
    assert_eq!(dests[0], dests[1]);
    assert_eq!(env.trampolines().len(), 1);

    let segment = env.code_cache().segment_of(dests[0]).unwrap();
    let trampoline = env.trampolines().get(helper, segment).unwrap();
    assert_eq!(trampoline.address, dests[0]);
    let code = env.code_cache().read(trampoline.address, 14).unwrap();
    assert_eq!(&code[..6], &[0xff, 0x25, 0, 0, 0, 0]);
    assert_eq!(code[6..14], helper.to_le_bytes());
}

#[test]
fn stress_mode_routes_every_branch_through_trampolines() {
    let env = env_for(AARCH64, |config| {
        config.stress_trampolines(true);
    });
    let desc = CallDescriptor::new(CallKind::Static, &[], None, CP).with_method(METHOD);
    let m = compile(&env, &[desc]).unwrap();
    m.stubs.link(&env, m.base).unwrap();

    let snippet = m.stubs.snippet(m.labels[0]).unwrap();
    let dest = arm64_branch_dest(&env, snippet.entry());
    assert_ne!(dest, helper_address(snippet.helper()));
    assert_eq!(read_u32(&env, dest), 0x5800_0050);
    assert_eq!(read_u32(&env, dest + 4), 0xd61f_0200);
    let target = env.code_cache().read(dest + 8, 8).unwrap();
    assert_eq!(target, helper_address(snippet.helper()).to_le_bytes());
    // The helper and the snippet entry each got one.
    assert_eq!(env.trampolines().len(), 2);
}

#[test]
fn ia32_pointer_fields_must_fit() {
    let env = env_for(IA32, |_| {});
    let desc = CallDescriptor::new(CallKind::Static, &[], None, CP).with_method(0x1_0000_0000);
    let m = compile(&env, &[desc]).unwrap();
    let err = m.stubs.link(&env, m.base).err().unwrap();
    assert!(err.is_fatal());
    assert!(matches!(
        err,
        CompileError::Internal(InternalError::RelocationOverflow {
            kind: Reloc::Abs4,
            value: 0x1_0000_0000,
            ..
        })
    ));
}

#[test]
fn unrelocatable_addresses_are_rejected() {
    let env = env_for(X64, |_| {});
    compile(&env, &[unresolved_static()]).unwrap();
    let bases = LoadBases {
        method: 0x10,
        stubs: 0x20,
    };
    let record = Relocation::new(PatchLocation::Stubs(0), Reloc::Abs8, RelocTarget::ConstantPool(CP), 0);
    let err = apply_relocation(&env, &bases, &record, CP.address).unwrap_err();
    assert!(matches!(
        err,
        CompileError::Internal(InternalError::OutsideCodeCache { addr: 0x20, .. })
    ));
}

#[test]
fn first_resolution_wins() {
    let env = env_for(X64, |_| {});
    let m = compile(&env, &[unresolved_static()]).unwrap();
    let _event = m.stubs.link(&env, m.base).unwrap();
    let data = env.snippet_data(m.stubs.snippet(m.labels[0]).unwrap()).unwrap();

    // A failed resolution leaves the call unresolved for the next caller.
    let failed = data.resolve_with(|cp| {
        assert_eq!(cp, Some(CP));
        Err("class not found")
    });
    assert_eq!(failed, Err("class not found"));
    assert_eq!(data.lock_state(), LockState::Unresolved);

    let calls = AtomicUsize::new(0);
    std::thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                let method = data.resolve_with(|_| -> Result<u64, ()> {
                    calls.fetch_add(1, Ordering::SeqCst);
                    std::thread::yield_now();
                    Ok(METHOD)
                });
                assert_eq!(method, Ok(METHOD));
            });
        }
    });
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(data.lock_state(), LockState::Resolved);
    assert_eq!(data.method(), Some(METHOD));
}
