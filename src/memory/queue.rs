//! The epoch window and its protection transitions.
//!
//! The queue keeps the `N` most recent epochs. An epoch's protection follows
//! from its distance to the current one:
//!
//! | distance | protection | why                                   |
//! |----------|------------|---------------------------------------|
//! | 0        | read-write | receives new allocations              |
//! | 1        | read-only  | stale readers still work, writes trap |
//! | 2        | none       | any access traps                      |
//! | 3        | read-write | drained, next to be evicted/recycled  |
//!
//! With `N == 2` the epoch at distance 1 is raised back to read-write on the
//! next advance, since it is about to become current again.

use std::ptr::NonNull;

use super::epoch::Epoch;
use super::fatal::die;
use super::guard::{Guarded, Handle, Signed};
use super::pages;
use super::stats;
use super::vm::{Protection, VmError};
use super::window::{EvictHook, GenerationalBuffer};
use crate::config::{ArenaOptions, EpochPolicy};

/// Number of generations a domain keeps.
pub const WINDOW_SIZE: usize = 4;

#[repr(C)]
pub struct EpochQueue<const N: usize = WINDOW_SIZE> {
    signature: u64,
    buffer: GenerationalBuffer<Guarded<Epoch>, N>,
    guard_offset: isize,
    allocated: usize,
    full_advances: u64,
    policy: EpochPolicy,
    options: ArenaOptions,
}

// Safety: repr(C) with the signature as the first field.
unsafe impl<const N: usize> Signed for EpochQueue<N> {
    const SIGNATURE: u64 = 0x4550_5155_4555_0000 | N as u64;
    const NAME: &'static str = "EpochQueue";
}

fn evict_hook() -> EvictHook<Guarded<Epoch>> {
    Box::new(|epoch: Guarded<Epoch>| {
        tracing::trace!(epoch = ?epoch.as_ptr(), "evicting epoch");
        drop(epoch);
    })
}

impl<const N: usize> EpochQueue<N> {
    const AT_LEAST_TWO: () = assert!(N >= 2, "an epoch queue needs at least two slots");

    /// A queue behind a guard page, seeded with one writable epoch as
    /// generation `start_id`.
    ///
    /// # Panics
    ///
    /// Panics if `start_id` is 0.
    ///
    /// # Errors
    ///
    /// Returns `VmError` if the first epoch or the queue itself cannot be
    /// mapped.
    pub(crate) fn create(
        start_id: u64,
        policy: EpochPolicy,
        options: ArenaOptions,
    ) -> Result<Guarded<Self>, VmError> {
        let () = Self::AT_LEAST_TWO;
        let first = Epoch::create(&options, policy.object_release, policy.memory_release)?;
        let page = pages::page_size();
        let queue = Self {
            signature: Self::SIGNATURE,
            buffer: GenerationalBuffer::with_seed(start_id, first, evict_hook()),
            guard_offset: -page.cast_signed(),
            allocated: 0,
            full_advances: 0,
            policy,
            options,
        };
        let mut guarded = Guarded::new(queue, policy.object_release)?;
        guarded.allocated = guarded.mapped_bytes();
        debug_assert_eq!(
            guarded.handle().addr().wrapping_sub(guarded.as_ptr() as usize).cast_signed(),
            guarded.guard_offset
        );
        tracing::info!(
            handle = ?guarded.handle(),
            start_id,
            window = N,
            reuse = policy.reuse_epochs,
            lazy = policy.lazy_clean,
            objects = ?policy.object_release,
            memory = ?policy.memory_release,
            "epoch queue created"
        );
        Ok(guarded)
    }

    fn validate(&self) {
        // Safety: reading our own first field.
        let signature = unsafe { std::ptr::read_volatile(&raw const self.signature) };
        if signature != Self::SIGNATURE {
            die!("epoch queue at {:p} failed validation (signature {signature:#018x})", self);
        }
    }

    /// Resolve a handle produced for a queue of this shape.
    ///
    /// # Safety
    ///
    /// See [`Handle::resolve`].
    pub(crate) unsafe fn resolve(handle: Handle) -> NonNull<Self> {
        // Safety: upheld by caller.
        let queue = unsafe { handle.resolve::<Self>() };
        // Safety: resolve checked the signature.
        unsafe { queue.as_ref() }.validate();
        queue
    }

    /// The writable epoch new allocations go to.
    pub(crate) fn current_epoch(&self) -> NonNull<Epoch> {
        self.validate();
        let Some(epoch) = self.buffer.current() else {
            die!("epoch queue at {:p} has no current epoch", self);
        };
        epoch.validate();
        // Safety: Guarded pointers are never null.
        unsafe { NonNull::new_unchecked(epoch.as_ptr()) }
    }

    /// The logical id of the current generation; `gc` must be called with
    /// exactly this watermark.
    #[inline]
    pub fn position(&self) -> u64 {
        self.buffer.position()
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.buffer.count()
    }

    #[inline]
    pub fn guard_offset(&self) -> isize {
        self.guard_offset
    }

    /// Bytes mapped for the queue object and its guard page.
    #[inline]
    pub fn allocated_bytes(&self) -> usize {
        self.allocated
    }

    #[inline]
    pub fn policy(&self) -> EpochPolicy {
        self.policy
    }

    /// The epoch `distance` generations behind the current one.
    #[cfg(test)]
    pub(crate) fn epoch_at(&self, distance: usize) -> Option<&Guarded<Epoch>> {
        self.buffer.previous(distance)
    }

    /// Protection the epoch at `distance` currently has, derived from the
    /// window position alone.
    pub fn protection_at(&self, distance: usize) -> Option<Protection> {
        if distance >= self.buffer.count() {
            return None;
        }
        Some(match distance {
            0 => Protection::ReadWrite,
            1 => Protection::Read,
            2 => Protection::None,
            // Drained once it passed distance 2 on an advance that ran with
            // the window full.
            d if self.full_advances >= (d - 2) as u64 => Protection::ReadWrite,
            _ => Protection::None,
        })
    }

    /// Retire the current epoch and start a new generation.
    ///
    /// # Errors
    ///
    /// Returns `VmError` if a new epoch is needed and cannot be created. The
    /// window is left untouched in that case.
    ///
    /// # Safety
    ///
    /// Pointers handed out from the retiring epochs become read-only or
    /// inaccessible. Callers only touching memory through allocations made
    /// since the matching watermark are unaffected.
    pub(crate) unsafe fn advance(&mut self) -> Result<(), VmError> {
        self.validate();
        let n = self.buffer.count();
        let full = self.buffer.is_full();
        let recycle = self.policy.reuse_epochs && full;

        let fresh = if recycle {
            None
        } else {
            Some(Epoch::create(
                &self.options,
                self.policy.object_release,
                self.policy.memory_release,
            )?)
        };

        // Safety: every epoch below is owned by this window; the transitions
        // are what invalidates stale pointers.
        unsafe {
            if let Some(current) = self.buffer.current() {
                current.protect(Protection::Read);
            }

            if n >= 2
                && let Some(second) = self.buffer.previous_mut(1)
            {
                if !self.policy.lazy_clean {
                    second.protect(Protection::ReadWrite);
                    second.reclaim();
                }
                second.protect(if N == 2 {
                    Protection::ReadWrite
                } else {
                    Protection::None
                });
            }

            if full
                && n >= 3
                && let Some(draining) = self.buffer.previous_mut(2)
            {
                draining.protect(Protection::ReadWrite);
                if self.policy.lazy_clean {
                    draining.reclaim();
                }
            }
        }

        if full {
            self.full_advances += 1;
        }
        match fresh {
            None => {
                let Some(oldest) = self.buffer.previous_mut(N - 1) else {
                    die!("full epoch window has no oldest slot");
                };
                // Safety: the oldest epoch left the window's reachable range
                // two advances ago.
                unsafe { oldest.recycle() };
                self.buffer.slide();
            }
            Some(epoch) => self.buffer.push(epoch),
        }

        stats::EPOCH_ADVANCES.add(1);
        tracing::debug!(
            position = self.buffer.position(),
            count = self.buffer.count(),
            recycled = recycle,
            "epoch advanced"
        );
        Ok(())
    }
}

impl<const N: usize> std::fmt::Debug for EpochQueue<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochQueue")
            .field("start", &self.buffer.start())
            .field("position", &self.buffer.position())
            .field("count", &self.buffer.count())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
