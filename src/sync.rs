// Sync primitives, switched to `loom` under `cfg(loom)`.
//
// The domain lock and the stats counters must come from here. A direct
// `std::sync` import in library code hides that state from the loom models.

pub(crate) mod atomic {
    #[cfg(loom)]
    pub(crate) use loom::sync::atomic::{AtomicIsize, Ordering};

    #[cfg(not(loom))]
    pub(crate) use std::sync::atomic::{AtomicIsize, Ordering};
}

#[cfg(loom)]
#[allow(unused_imports)]
pub(crate) use loom::sync::{Arc, Mutex, MutexGuard};

#[cfg(not(loom))]
#[allow(unused_imports)]
pub(crate) use std::sync::{Arc, Mutex, MutexGuard};

#[cfg(not(loom))]
pub(crate) use std::sync::OnceLock;

/// Init-once cell for the cached page size.
///
/// Backed by a plain std mutex because it lives in a `static` and loom's
/// `Mutex::new` is not `const`. Loom has nothing to explore here.
#[cfg(loom)]
pub(crate) struct OnceLock<T> {
    slot: std::sync::Mutex<Option<Box<T>>>,
}

#[cfg(loom)]
impl<T> OnceLock<T> {
    pub(crate) const fn new() -> Self {
        Self {
            slot: std::sync::Mutex::new(None),
        }
    }

    pub(crate) fn get_or_init(&self, init: impl FnOnce() -> T) -> &T {
        let mut slot = self
            .slot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let value: *const T = &**slot.get_or_insert_with(|| Box::new(init()));
        // Safety: the box is written once and freed only with `self`.
        unsafe { &*value }
    }
}

#[cfg(loom)]
// Safety: the slot is only touched under its mutex.
unsafe impl<T: Send + Sync> Sync for OnceLock<T> {}

/// `pub static NAME: Type = init;` that loom re-creates for every model run.
macro_rules! static_atomic {
    (pub static $name:ident : $ty:ty = $init:expr ;) => {
        #[cfg(not(loom))]
        pub static $name: $ty = $init;

        #[cfg(loom)]
        loom::lazy_static! {
            pub static ref $name: $ty = $init;
        }
    };
}
pub(crate) use static_atomic;

/// Take `mutex`, ignoring poison.
///
/// Only test code panics while the domain lock is held, and every update under
/// it completes before any call that can panic.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
