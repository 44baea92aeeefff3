//! Property-based tests for the generational window.
//!
//! Uses proptest to generate push/slide sequences and verify the id and
//! eviction invariants hold.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use pageward::memory::window::EvictHook;
use pageward::{ArenaFlags, Domain, EpochPolicy, GenerationalBuffer, ReleasePolicy};
use proptest::prelude::*;

fn counting_hook(evicted: &Arc<AtomicUsize>) -> EvictHook<u32> {
    let evicted = Arc::clone(evicted);
    Box::new(move |_| {
        evicted.fetch_add(1, Ordering::Relaxed);
    })
}

#[derive(Clone, Copy, Debug)]
enum Op {
    Push(u32),
    Slide,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![3 => any::<u32>().prop_map(Op::Push), 1 => Just(Op::Slide)]
}

proptest! {
    /// Values pushed from a seed id come back under consecutive ids
    #[test]
    fn by_id_round_trip(start in 1u64..10_000, values in prop::collection::vec(any::<u32>(), 1..=4)) {
        let mut buffer: GenerationalBuffer<u32, 4> =
            GenerationalBuffer::with_seed(start, values[0], Box::new(drop::<u32>));
        for &v in &values[1..] {
            buffer.push(v);
        }
        for (i, v) in (0u64..).zip(&values) {
            prop_assert_eq!(buffer.by_id(start + i), Some(v));
        }
        prop_assert!(buffer.by_id(start - 1).is_none());
        prop_assert!(buffer.by_id(start + values.len() as u64).is_none());
    }

    /// The eviction hook fires once per push after the buffer fills, never before
    #[test]
    fn eviction_exactly_once(pushes in 0usize..40) {
        let evicted = Arc::new(AtomicUsize::new(0));
        let mut buffer: GenerationalBuffer<u32, 4> =
            GenerationalBuffer::with_seed(1, 0, counting_hook(&evicted));
        for i in 0..pushes {
            let full_before = buffer.is_full();
            let before = evicted.load(Ordering::Relaxed);
            buffer.push(u32::try_from(i).unwrap_or(u32::MAX));
            let fired = evicted.load(Ordering::Relaxed) - before;
            prop_assert_eq!(fired, usize::from(full_before));
        }
        prop_assert_eq!(evicted.load(Ordering::Relaxed), (pushes + 1).saturating_sub(4));
    }

    /// Position grows by exactly one per push or slide and count stays within capacity
    #[test]
    fn ids_are_monotonic(start in 1u64..1_000, ops in prop::collection::vec(op(), 0..64)) {
        let mut buffer: GenerationalBuffer<u32, 3> =
            GenerationalBuffer::with_seed(start, 0, Box::new(drop::<u32>));
        let mut expected = start;
        for op in ops {
            match op {
                Op::Push(v) => buffer.push(v),
                Op::Slide if buffer.is_full() => buffer.slide(),
                Op::Slide => continue,
            }
            expected += 1;
            prop_assert_eq!(buffer.position(), expected);
            prop_assert!(buffer.count() <= buffer.capacity());
            prop_assert!(buffer.start() <= buffer.position());
            prop_assert_eq!(buffer.position() - buffer.start() + 1, buffer.count() as u64);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// The domain watermark moves by one per gc and not otherwise
    #[test]
    fn domain_position_counts_gc_calls(
        steps in prop::collection::vec(any::<bool>(), 0..12),
        reuse in any::<bool>(),
        lazy in any::<bool>(),
    ) {
        let domain = Domain::new(
            EpochPolicy::default()
                .with_reuse(reuse)
                .with_lazy_clean(lazy)
                .with_release(ReleasePolicy::Unmap),
        );
        let arena = domain.arena_create(usize::MAX, 0, 1 << 16, ArenaFlags::Private).unwrap();
        let region = domain.region_create(arena);
        let mut expected = 1;
        for advance in steps {
            let position = domain.position(region);
            prop_assert_eq!(position, expected);
            if advance {
                // Safety: Test code, no pointers are kept across gc.
                unsafe { domain.gc(region, position).unwrap() };
                expected += 1;
            } else {
                // Safety: Test code.
                let p = unsafe { domain.alloc(region, 128, position) };
                prop_assert!(p.is_some());
            }
        }
        prop_assert_eq!(domain.position(region), expected);
    }
}
