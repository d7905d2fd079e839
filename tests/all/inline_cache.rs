use super::*;
use callstubs::cache::{CacheState, Dispatch, InlineCache, RecordOutcome};
use callstubs::{CallKind, EvictionPolicy, HelperId, ValueType};
use proptest::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};

const A: u64 = 0x4000_0100;
const B: u64 = 0x4000_0200;
const C: u64 = 0x4000_0300;
const D: u64 = 0x4000_0400;
const E: u64 = 0x4000_0500;

fn method_for(class: u64) -> u64 {
    class ^ 0x0f00_0000
}

fn call(kind: CallKind) -> CallDescriptor {
    CallDescriptor::new(kind, &[ValueType::Address], None, CP).unresolved()
}

/// Compiles and links one call of `kind`, then hands its inline cache to `f`.
fn with_cache(
    triple: &str,
    kind: CallKind,
    configure: impl FnOnce(&mut Config),
    f: impl FnOnce(&InlineCache<'_>),
) {
    let env = env_for(triple, configure);
    let m = compile(&env, &[call(kind)]).unwrap();
    let _event = m.stubs.link(&env, m.base).unwrap();
    let data = env.snippet_data(m.stubs.snippet(m.labels[0]).unwrap()).unwrap();
    f(data.inline_cache().unwrap());
}

#[test]
fn repeated_class_changes_nothing() {
    with_cache(X64, CallKind::Virtual, |_| {}, |cache| {
        assert_eq!(cache.capacity(), 4);
        assert_eq!(cache.state(), CacheState::Empty);
        for (i, class) in [A, B, C, D].into_iter().enumerate() {
            assert_eq!(
                cache.record(class, method_for(class)),
                RecordOutcome::Filled(i as u32)
            );
        }
        let expected: Vec<_> = [A, B, C, D].iter().map(|&c| (c, method_for(c))).collect();
        assert_eq!(cache.entries(), expected);
        assert_eq!(cache.record(A, method_for(A)), RecordOutcome::AlreadyCached);
        assert_eq!(cache.entries(), expected);
        assert_eq!(cache.state(), CacheState::MultiFilled(4));
        assert_eq!(cache.lookup(C), Some(method_for(C)));
    });
}

#[test]
fn one_class_too_many_goes_megamorphic() {
    with_cache(X64, CallKind::Interface, |_| {}, |cache| {
        assert_eq!(cache.capacity(), 2);
        assert_eq!(cache.policy(), EvictionPolicy::Megamorphic);
        cache.record(A, method_for(A));
        cache.record(B, method_for(B));
        assert_eq!(cache.record(C, method_for(C)), RecordOutcome::Megamorphic);
        assert_eq!(cache.state(), CacheState::Megamorphic);
        assert_eq!(cache.lookup(C), None);
        assert_eq!(cache.record(D, method_for(D)), RecordOutcome::Megamorphic);
        assert_eq!(cache.record(A, method_for(A)), RecordOutcome::AlreadyCached);
        assert_eq!(cache.entries(), vec![(A, method_for(A)), (B, method_for(B))]);
        // The slots are kept but no longer consulted.
        for class in [A, B, C] {
            assert_eq!(
                cache.dispatch(class),
                Dispatch::Generic(HelperId::MegamorphicDispatch)
            );
        }
    });
}

#[test]
fn evict_oldest_rotates() {
    let configure = |config: &mut Config| {
        config.virtual_cache(2, EvictionPolicy::EvictOldest);
    };
    with_cache(X64, CallKind::Virtual, configure, |cache| {
        cache.record(A, method_for(A));
        cache.record(B, method_for(B));
        assert_eq!(cache.record(C, method_for(C)), RecordOutcome::Evicted(0));
        assert_eq!(cache.entries(), vec![(C, method_for(C)), (B, method_for(B))]);
        assert_eq!(cache.record(D, method_for(D)), RecordOutcome::Evicted(1));
        assert_eq!(cache.record(E, method_for(E)), RecordOutcome::Evicted(0));
        assert_eq!(cache.entries(), vec![(E, method_for(E)), (D, method_for(D))]);
        assert_eq!(cache.lookup(A), None);
        assert_eq!(cache.dispatch(A), Dispatch::Miss);
        assert_eq!(cache.dispatch(E), Dispatch::Cached(method_for(E)));
        assert_eq!(cache.state(), CacheState::MultiFilled(2));
    });
}

#[test]
fn single_slot_cache() {
    let configure = |config: &mut Config| {
        config.interface_cache(1, EvictionPolicy::Megamorphic);
    };
    with_cache(IA32, CallKind::Interface, configure, |cache| {
        assert_eq!(cache.record(A, method_for(A)), RecordOutcome::Filled(0));
        assert_eq!(cache.state(), CacheState::SingleFilled);
        assert_eq!(cache.lookup(A), Some(method_for(A)));
        assert_eq!(cache.record(B, method_for(B)), RecordOutcome::Megamorphic);
    });
}

#[test]
fn method_handles_have_no_cache() {
    let env = env_for(X64, |_| {});
    let m = compile(&env, &[call(CallKind::MethodHandle)]).unwrap();
    let snippet = m.stubs.snippet(m.labels[0]).unwrap();
    assert_eq!(snippet.layout().cache, None);
    assert!(snippet.layout().thunk.is_some());
    m.stubs.link(&env, m.base).unwrap();
    assert!(env.snippet_data(snippet).unwrap().inline_cache().is_none());
}

fn class(id: u64) -> u64 {
    0x4000_0000 + id * 0x100
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn readers_never_see_torn_entries(
        triple in prop::sample::select(vec![X64, IA32]),
        slots in 1u32..4,
        classes in prop::collection::vec(1u64..12, 1..48),
    ) {
        let configure = |config: &mut Config| {
            config.virtual_cache(slots, EvictionPolicy::EvictOldest);
        };
        with_cache(triple, CallKind::Virtual, configure, |cache| {
            let done = AtomicBool::new(false);
            let classes = &classes;
            std::thread::scope(|s| {
                let writers: Vec<_> = (0..3u64)
                    .map(|w| {
                        s.spawn(move || {
                            for _ in 0..20 {
                                for &id in classes {
                                    let c = class(id + w);
                                    cache.record(c, method_for(c));
                                }
                            }
                        })
                    })
                    .collect();
                for _ in 0..2 {
                    s.spawn(|| {
                        while !done.load(Ordering::Relaxed) {
                            for id in 1..15 {
                                let c = class(id);
                                if let Some(m) = cache.lookup(c) {
                                    assert_eq!(m, method_for(c));
                                }
                            }
                            for (c, m) in cache.entries() {
                                assert_eq!(m, method_for(c));
                            }
                        }
                    });
                }
                for writer in writers {
                    writer.join().unwrap();
                }
                done.store(true, Ordering::Relaxed);
            });
            let entries = cache.entries();
            assert_eq!(entries.len(), slots as usize);
            for (c, m) in entries {
                assert_eq!(m, method_for(c));
            }
        });
    }
}
