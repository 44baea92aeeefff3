//! Process-wide gauges for mapped pages and epoch churn.
//!
//! Updates are `Relaxed` and unsynchronised with each other, so a snapshot can
//! catch `mapped_bytes` mid-way between a slab map and the matching
//! `arena_slab_bytes` update. Read them for diagnostics, never to decide
//! whether to allocate.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// A gauge that never reports below zero.
///
/// A release counted on one thread can land before the map it pairs with on
/// another, so the stored value may go negative for a moment; `get` hides it.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn signed(bytes: usize) -> isize {
        isize::try_from(bytes).unwrap_or(isize::MAX)
    }

    #[inline]
    pub fn add(&self, bytes: usize) {
        self.0.fetch_add(Self::signed(bytes), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, bytes: usize) {
        self.0.fetch_sub(Self::signed(bytes), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        usize::try_from(self.0.load(Ordering::Relaxed)).unwrap_or(0)
    }
}

// Bytes currently mapped by this layer (slabs, oversized blocks, guarded objects)
crate::sync::static_atomic! {
    pub static MAPPED_BYTES: Counter = Counter::new();
}
// Bytes kept mapped with no access under `ReleasePolicy::Retain`
crate::sync::static_atomic! {
    pub static RETAINED_BYTES: Counter = Counter::new();
}

// Breakdown by kind
crate::sync::static_atomic! {
    pub static ARENA_SLAB_BYTES: Counter = Counter::new();
}
crate::sync::static_atomic! {
    pub static OVERSIZED_BYTES: Counter = Counter::new();
}
crate::sync::static_atomic! {
    pub static GUARDED_BYTES: Counter = Counter::new();
}

crate::sync::static_atomic! {
    pub static LIVE_EPOCHS: Counter = Counter::new();
}
crate::sync::static_atomic! {
    pub static EPOCH_ADVANCES: Counter = Counter::new();
}
crate::sync::static_atomic! {
    pub static PROTECT_CALLS: Counter = Counter::new();
}

/// Undo an earlier `add` of `val`; a transient negative is clamped on read.
pub fn sub_saturating(counter: &Counter, val: usize) {
    counter.sub(val);
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub mapped_bytes: usize,
    pub retained_bytes: usize,
    pub arena_slab_bytes: usize,
    pub oversized_bytes: usize,
    pub guarded_bytes: usize,
    pub live_epochs: usize,
    pub epoch_advances: usize,
    pub protect_calls: usize,
}

/// Snapshot of the process-wide counters.
#[must_use]
pub fn memory_stats() -> MemoryStats {
    MemoryStats {
        mapped_bytes: MAPPED_BYTES.get(),
        retained_bytes: RETAINED_BYTES.get(),
        arena_slab_bytes: ARENA_SLAB_BYTES.get(),
        oversized_bytes: OVERSIZED_BYTES.get(),
        guarded_bytes: GUARDED_BYTES.get(),
        live_epochs: LIVE_EPOCHS.get(),
        epoch_advances: EPOCH_ADVANCES.get(),
        protect_calls: PROTECT_CALLS.get(),
    }
}
