use super::*;
use callstubs::gc::GcMapRegistry;
use callstubs::reloc::RelocTarget;
use callstubs::runtime::LockState;
use callstubs::snippet::{SnippetKind, data_area};
use callstubs::{
    CallKind, CompileError, EvictionPolicy, HelperId, InternalError, ReturnKind, SnippetLabel,
    SnippetRequest, SnippetSet, ValueType,
};
use proptest::prelude::*;

fn static_call(args: &[ValueType], ret: Option<ValueType>) -> CallDescriptor {
    CallDescriptor::new(CallKind::Static, args, ret, CP)
}

#[test]
fn unresolved_static_on_ia32() {
    let env = env_for(IA32, |_| {});
    let desc = static_call(&[ValueType::Int32; 3], Some(ValueType::Int64)).unresolved();
    let m = compile(&env, &[desc]).unwrap();
    let snippet = m.stubs.snippet(m.labels[0]).unwrap();

    let helper = HelperId::UnresolvedStatic(ReturnKind::Int64);
    assert_eq!(snippet.kind(), SnippetKind::Unresolved);
    assert_eq!(snippet.helper(), helper);
    assert_eq!(helper.to_string(), "interpreter-unresolved-static-int64");

    let layout = snippet.layout();
    assert_eq!(layout.flush_len, 8);
    assert_eq!(layout.branch_len, 5);
    assert_eq!(layout.padding, 3);
    assert_eq!(layout.method, Some(12));
    assert_eq!(layout.thunk, None);
    assert_eq!(layout.cache, None);
    assert_eq!(layout.lock_word, 20);
    assert_eq!(layout.data_len, 24);
    assert_eq!(snippet.len(), 40);

    let event = m.stubs.link(&env, m.base).unwrap();

    let code = env.code_cache().read(snippet.entry(), 13).unwrap();
    assert_eq!(&code[..9], &[0x89, 0x44, 0x24, 0x0c, 0x89, 0x54, 0x24, 0x08, 0xe8]);
    assert_eq!(
        x86_branch_dest(&env, snippet.entry() + 8),
        helper_address(helper)
    );
    assert_eq!(
        snippet.data_address(),
        data_area(snippet.call_return_address(), 4)
    );

    let data = env.snippet_data(snippet).unwrap();
    assert_eq!(data.return_address(), m.base + 5);
    assert_eq!(data.constant_pool(), Some(CP));
    assert_eq!(data.method(), None);
    assert_eq!(data.thunk(), None);
    assert!(data.inline_cache().is_none());
    assert_eq!(data.lock_state(), LockState::Unresolved);
    assert_eq!(
        data.dispatch_helper_index(),
        HelperId::InterpreterStatic {
            ret: ReturnKind::Int64,
            synchronized: false
        }
        .index()
    );

    let pending: Vec<_> = event.pending().collect();
    assert_eq!(pending.len(), 1);
    assert_eq!(
        pending[0].1.target,
        RelocTarget::MethodObject {
            cp: CP,
            method: None,
            lock_word: Some((snippet.data_address() - m.stubs.base()) as u32 + 20),
        }
    );
}

#[test]
fn resolved_static_embeds_its_method() {
    let env = env_for(X64, |_| {});
    let desc = static_call(&[ValueType::Address, ValueType::Double], None)
        .with_method(METHOD)
        .synchronized();
    let m = compile(&env, &[desc]).unwrap();
    let snippet = m.stubs.snippet(m.labels[0]).unwrap();
    assert_eq!(snippet.kind(), SnippetKind::Resolved);
    assert_eq!(
        snippet.helper(),
        HelperId::InterpreterStatic {
            ret: ReturnKind::Void,
            synchronized: true
        }
    );

    let event = m.stubs.link(&env, m.base).unwrap();
    assert!(event.is_complete());

    let data = env.snippet_data(snippet).unwrap();
    assert_eq!(data.method(), Some(METHOD));
    assert_eq!(data.constant_pool(), None);
    assert_eq!(data.lock_state(), LockState::Resolved);
    let layout = snippet.layout();
    assert_eq!(
        read_word(&env, snippet.data_address() + u64::from(layout.cp_index)),
        u64::MAX
    );
    assert_eq!(snippet.method_field(), Some(snippet.data_address() + 24));

    // Already resolved: the resolver is never consulted.
    let resolved = data.resolve_with(|_| -> Result<u64, ()> { panic!("resolved twice") });
    assert_eq!(resolved, Ok(METHOD));
}

#[test]
fn osr_induction_jumps_and_has_no_method() {
    let env = env_for(X64, |_| {});
    let desc = CallDescriptor::new(CallKind::OsrInduction, &[], Some(ValueType::Int32), CP);
    let m = compile(&env, &[desc]).unwrap();
    let snippet = m.stubs.snippet(m.labels[0]).unwrap();
    assert_eq!(snippet.kind(), SnippetKind::OsrInduction);
    assert_eq!(snippet.helper(), HelperId::InduceOsr);
    assert_eq!(snippet.layout().method, None);
    assert_eq!(snippet.method_field(), None);

    m.stubs.link(&env, m.base).unwrap();
    let code = env.code_cache().read(snippet.entry(), 1).unwrap();
    assert_eq!(code[0], 0xe9);
    assert_eq!(
        x86_branch_dest(&env, snippet.entry()),
        helper_address(HelperId::InduceOsr)
    );
    assert!(m.gc_maps.is_empty());

    let data = env.snippet_data(snippet).unwrap();
    assert_eq!(
        data.dispatch_helper_index(),
        HelperId::InterpreterStatic {
            ret: ReturnKind::Void,
            synchronized: false
        }
        .index()
    );
}

#[test]
fn native_calls_use_the_native_helper() {
    let env = env_for(AARCH64, |_| {});
    let desc = CallDescriptor::new(CallKind::Native, &[ValueType::Int64], None, CP).with_method(METHOD);
    let m = compile(&env, &[desc]).unwrap();
    let snippet = m.stubs.snippet(m.labels[0]).unwrap();
    assert_eq!(snippet.helper(), HelperId::NativeStatic);
    m.stubs.link(&env, m.base).unwrap();
    let call = snippet.entry() + u64::from(snippet.layout().flush_len);
    assert_eq!(
        arm64_branch_dest(&env, call),
        helper_address(HelperId::NativeStatic)
    );
}

#[test]
fn gc_maps_are_registered_at_each_helper_return() {
    let env = env_for(X64, |_| {});
    let calls = [
        static_call(&[ValueType::Int32], None).unresolved(),
        CallDescriptor::new(CallKind::OsrInduction, &[], None, CP),
        CallDescriptor::new(CallKind::Virtual, &[ValueType::Address], None, CP).unresolved(),
    ];
    let m = compile(&env, &calls).unwrap();
    assert_eq!(m.gc_maps.len(), 2);
    for &label in &m.labels {
        let snippet = m.stubs.snippet(label).unwrap();
        let map = m.gc_maps.lookup(snippet.call_return_address());
        if snippet.call_kind() == CallKind::OsrInduction {
            assert_eq!(map, None);
        } else {
            assert_eq!(map, Some(0b101));
        }
    }
}

#[test]
fn snippets_are_packed_back_to_back() {
    let env = env_for(X64, |_| {});
    let calls = [
        static_call(&[ValueType::Int32, ValueType::Float], Some(ValueType::Float)).unresolved(),
        CallDescriptor::new(CallKind::Interface, &[ValueType::Address], None, CP).unresolved(),
        CallDescriptor::new(CallKind::Special, &[ValueType::Address], None, CP).with_method(METHOD),
    ];
    let m = compile(&env, &calls).unwrap();
    let snippets = m.stubs.snippets();
    assert_eq!(snippets[0].entry(), m.stubs.base());
    for pair in snippets.windows(2) {
        assert_eq!(pair[0].entry() + u64::from(pair[0].len()), pair[1].entry());
    }
    let total: u32 = snippets.iter().map(|s| s.len()).sum();
    assert_eq!(m.stubs.len(), total);
    for s in snippets {
        assert_eq!(s.data_address() % 8, 0);
    }
}

#[test]
fn force_unresolved_drops_the_method_pointer() {
    let env = env_for(X64, |config| {
        config.force_unresolved(true);
    });
    let calls = [
        static_call(&[], None).with_method(METHOD),
        CallDescriptor::new(CallKind::Native, &[], None, CP).with_method(METHOD),
    ];
    let m = compile(&env, &calls).unwrap();
    let forced = m.stubs.snippet(m.labels[0]).unwrap();
    assert_eq!(forced.kind(), SnippetKind::Unresolved);
    assert_eq!(forced.helper(), HelperId::UnresolvedStatic(ReturnKind::Void));
    let native = m.stubs.snippet(m.labels[1]).unwrap();
    assert_eq!(native.kind(), SnippetKind::Resolved);
    assert_eq!(native.helper(), HelperId::NativeStatic);

    let event = m.stubs.link(&env, m.base).unwrap();
    assert_eq!(event.pending().count(), 1);
    let data = env.snippet_data(forced).unwrap();
    assert_eq!(data.method(), None);
    assert_eq!(data.constant_pool(), Some(CP));
    assert_eq!(data.lock_state(), LockState::Unresolved);
}

#[test]
fn aggregate_returns_are_rejected() {
    let env = env_for(X64, |_| {});
    let mut set = SnippetSet::new();
    let desc = static_call(&[], Some(ValueType::Aggregate)).with_method(METHOD);
    let err = set.add(&env, SnippetRequest::new(desc, 5)).unwrap_err();
    assert_eq!(
        err,
        CompileError::Internal(InternalError::UnsupportedReturnType(ValueType::Aggregate))
    );
    assert!(err.is_fatal());
    assert!(set.is_empty());
}

fn invalid_state(err: CompileError) -> (&'static str, &'static str) {
    match err {
        CompileError::Internal(InternalError::InvalidSnippetState {
            state, operation, ..
        }) => (state, operation),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn lifecycle_misuse_is_fatal() {
    let env = env_for(X64, |_| {});
    let mut gc = GcMapRegistry::new();
    let mut set = SnippetSet::new();
    let desc = static_call(&[ValueType::Int32], None).unresolved();
    let label = set.add(&env, SnippetRequest::new(desc.clone(), 5)).unwrap();
    assert_eq!(set.address_of(label), None);

    assert_eq!(
        invalid_state(set.emit(&env, &mut gc).unwrap_err()),
        ("sized", "emit")
    );
    assert_eq!(
        invalid_state(
            set.wire_call_site(&env, 0, SnippetLabel::from_u32(7))
                .unwrap_err()
        ),
        ("unknown", "wire")
    );

    let base = set.layout(&env).unwrap();
    assert_eq!(set.address_of(label), Some(base));
    assert_eq!(
        invalid_state(set.add(&env, SnippetRequest::new(desc, 10)).unwrap_err()),
        ("laid out", "add")
    );
    assert_eq!(
        invalid_state(set.layout(&env).unwrap_err()),
        ("laid out", "lay out")
    );

    set.emit(&env, &mut gc).unwrap();
    assert_eq!(
        invalid_state(set.emit(&env, &mut gc).unwrap_err()),
        ("finalized", "emit")
    );
}

#[test]
fn code_cache_exhaustion_is_recoverable() {
    let env = env_for(X64, |config| {
        config
            .segment_size(4096)
            .max_segments(1)
            .trampoline_reserve(64);
    });
    let desc = CallDescriptor::new(CallKind::Virtual, &[ValueType::Address], None, CP).unresolved();
    // Each method lays out about 1.6KiB; the single segment runs out after a
    // few of them, however large a page is.
    for _ in 0..100 {
        let mut set = SnippetSet::new();
        for i in 0..10 {
            set.add(&env, SnippetRequest::new(desc.clone(), 5 * i + 5)).unwrap();
        }
        match set.layout(&env) {
            Ok(_) => continue,
            Err(err) => {
                assert!(matches!(err, CompileError::CodeCacheFull { .. }));
                assert!(!err.is_fatal());
                assert_eq!(env.code_cache().segment_count(), 1);
                return;
            }
        }
    }
    panic!("code cache never filled up");
}

#[test]
fn environments_reject_inconsistent_configurations() {
    let helpers = || HelperTable::synthetic(HELPER_BASE, HELPER_STRIDE);
    let triple = Triple::from_str(X64).unwrap();

    let mut oversized = Config::new();
    oversized.virtual_cache(0x1_0000, EvictionPolicy::EvictOldest);
    let err = Environment::new(triple.clone(), oversized, helpers()).err().unwrap();
    assert!(matches!(err, CompileError::InvalidConfig(_)));
    assert!(err.is_fatal());

    let mut no_segments = Config::new();
    no_segments.max_segments(0);
    assert!(matches!(
        Environment::new(triple, no_segments, helpers()).err().unwrap(),
        CompileError::InvalidConfig(_)
    ));
}

fn value_type() -> impl Strategy<Value = ValueType> {
    prop_oneof![
        Just(ValueType::Int8),
        Just(ValueType::Int16),
        Just(ValueType::Int32),
        Just(ValueType::Int64),
        Just(ValueType::Address),
        Just(ValueType::Float),
        Just(ValueType::Double),
        Just(ValueType::Aggregate),
    ]
}

fn return_type() -> impl Strategy<Value = Option<ValueType>> {
    prop_oneof![
        Just(None),
        Just(Some(ValueType::Int16)),
        Just(Some(ValueType::Int32)),
        Just(Some(ValueType::Int64)),
        Just(Some(ValueType::Address)),
        Just(Some(ValueType::Float)),
        Just(Some(ValueType::Double)),
    ]
}

fn call_kind() -> impl Strategy<Value = CallKind> {
    prop_oneof![
        Just(CallKind::Static),
        Just(CallKind::Special),
        Just(CallKind::Virtual),
        Just(CallKind::Interface),
        Just(CallKind::Native),
        Just(CallKind::MethodHandle),
        Just(CallKind::OsrInduction),
    ]
}

fn descriptor() -> impl Strategy<Value = CallDescriptor> {
    (
        call_kind(),
        prop::collection::vec(value_type(), 0..12),
        return_type(),
        any::<bool>(),
        any::<bool>(),
    )
        .prop_map(|(kind, args, ret, unresolved, synchronized)| {
            let mut desc = CallDescriptor::new(kind, &args, ret, CP);
            desc = if unresolved {
                desc.unresolved()
            } else {
                desc.with_method(METHOD)
            };
            if synchronized {
                desc = desc.synchronized();
            }
            desc
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn emitted_length_matches_estimate(
        triple in prop::sample::select(vec![X64, IA32, AARCH64]),
        calls in prop::collection::vec(descriptor(), 1..6),
    ) {
        let env = env_for(triple, |_| {});
        let mut set = SnippetSet::new();
        let mut estimates = Vec::new();
        for (i, desc) in calls.iter().enumerate() {
            let request = SnippetRequest::new(desc.clone(), 4 * i as u32 + 4);
            let label = set.add(&env, request).unwrap();
            estimates.push((label, set.estimate_length(label).unwrap()));
        }
        set.layout(&env).unwrap();
        let stubs = set.emit(&env, &mut GcMapRegistry::new()).unwrap();

        let p = env.isa().pointer_size();
        for (label, estimate) in estimates {
            let snippet = stubs.snippet(label).unwrap();
            prop_assert_eq!(snippet.len(), estimate);
            prop_assert_eq!(
                snippet.data_address(),
                data_area(snippet.call_return_address(), p)
            );
            prop_assert!(snippet.data_address() + u64::from(snippet.layout().data_len)
                <= snippet.entry() + u64::from(estimate));
        }
        let total: u32 = stubs.snippets().iter().map(|s| s.len()).sum();
        prop_assert_eq!(stubs.len(), total);
    }
}
