use super::*;
use callstubs::{CallKind, CompileError, HelperId, InternalError, ReturnKind, TerseSignature, ValueType};
use std::sync::Arc;

#[test]
fn thunks_are_memoized_by_signature() {
    let env = env_for(X64, |_| {});
    let sig: TerseSignature = "(LI)V".parse().unwrap();
    let first = env.get_or_create_thunk(&sig).unwrap();
    let again = env.get_or_create_thunk(&sig).unwrap();
    assert!(Arc::ptr_eq(&first, &again));

    let narrow = TerseSignature::new(&[ValueType::Address, ValueType::Int8], None);
    assert!(Arc::ptr_eq(&first, &env.get_or_create_thunk(&narrow).unwrap()));

    let other = env.get_or_create_thunk(&"(LJ)V".parse().unwrap()).unwrap();
    assert_ne!(other.entry(), first.entry());
    assert_eq!(env.thunks().len(), 2);
    assert!(Arc::ptr_eq(&env.thunks().get(&sig).unwrap(), &first));
    assert!(env.thunks().get(&"()D".parse().unwrap()).is_none());
}

#[test]
fn x64_thunk_code() {
    let env = env_for(X64, |_| {});
    let thunk = env
        .get_or_create_thunk(&"(LI)V".parse().unwrap())
        .unwrap();
    assert_eq!(thunk.len(), 14);
    let code = env.code_cache().read(thunk.entry(), 10).unwrap();
    assert_eq!(
        code,
        [0x48, 0x89, 0x44, 0x24, 0x10, 0x89, 0x74, 0x24, 0x08, 0xe9]
    );
    assert_eq!(
        x86_branch_dest(&env, thunk.entry() + 9),
        helper_address(HelperId::ThunkDispatch(ReturnKind::Void))
    );
}

#[test]
fn aarch64_thunk_dispatches_by_return_type() {
    let env = env_for(AARCH64, |_| {});
    let thunk = env
        .get_or_create_thunk(&"(D)D".parse().unwrap())
        .unwrap();
    assert_eq!(thunk.len(), 8);
    assert_eq!(
        arm64_branch_dest(&env, thunk.entry() + 4),
        helper_address(HelperId::ThunkDispatch(ReturnKind::Double))
    );
}

#[test]
fn snippets_point_at_their_thunk() {
    let env = env_for(X64, |_| {});
    let calls = [
        CallDescriptor::new(
            CallKind::Virtual,
            &[ValueType::Address, ValueType::Int16],
            None,
            CP,
        )
        .unresolved(),
        CallDescriptor::new(
            CallKind::Interface,
            &[ValueType::Address, ValueType::Int32],
            None,
            CP,
        )
        .unresolved(),
    ];
    let m = compile(&env, &calls).unwrap();
    m.stubs.link(&env, m.base).unwrap();

    let thunk = env.thunks().get(&"(LI)V".parse().unwrap()).unwrap();
    for &label in &m.labels {
        let data = env.snippet_data(m.stubs.snippet(label).unwrap()).unwrap();
        assert_eq!(data.thunk(), Some(thunk.entry()));
    }
    assert_eq!(env.thunks().len(), 1);
}

#[test]
fn concurrent_requests_share_one_thunk() {
    let env = env_for(AARCH64, |_| {});
    let sig: TerseSignature = "(LJF)L".parse().unwrap();
    let (env, sig) = (&env, &sig);
    let thunks: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| s.spawn(move || env.get_or_create_thunk(sig).unwrap()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    for thunk in &thunks {
        assert!(Arc::ptr_eq(thunk, &thunks[0]));
    }
    assert_eq!(env.thunks().len(), 1);
}

#[test]
fn aggregate_returns_have_no_thunk() {
    let env = env_for(X64, |_| {});
    let err = env
        .get_or_create_thunk(&"(L)A".parse().unwrap())
        .unwrap_err();
    assert_eq!(
        err,
        CompileError::Internal(InternalError::UnsupportedReturnType(ValueType::Aggregate))
    );
}
