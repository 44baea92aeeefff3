//! Build-time policies and arena creation options.
//!
//! The policy defaults come from cargo features so that a build picks its
//! trade-offs once. A [`Domain`](crate::Domain) captures its policy at
//! construction and never changes it afterwards.

/// What happens to pages this layer is done with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleasePolicy {
    /// Return pages to the OS.
    Unmap,
    /// Keep pages mapped with no access for the life of the process, so any
    /// late access still traps. Costs address space.
    Retain,
}

/// How the epoch window retires generations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EpochPolicy {
    /// Relabel the oldest epoch as the new current one instead of destroying
    /// it and creating a fresh epoch.
    pub reuse_epochs: bool,
    /// Run the region reclaim step right before an epoch is evicted or
    /// recycled, instead of when it first loses access.
    pub lazy_clean: bool,
    /// Pages of the queue and epoch objects, guard pages included. Retaining
    /// them keeps a stale handle trapping after its domain is gone.
    pub object_release: ReleasePolicy,
    /// Slabs and oversized blocks, the memory callers actually touch.
    pub memory_release: ReleasePolicy,
}

fn retain_if(retain: bool) -> ReleasePolicy {
    if retain {
        ReleasePolicy::Retain
    } else {
        ReleasePolicy::Unmap
    }
}

impl Default for EpochPolicy {
    fn default() -> Self {
        Self {
            reuse_epochs: cfg!(feature = "reuse-epochs"),
            lazy_clean: cfg!(feature = "lazy-clean"),
            object_release: retain_if(
                cfg!(feature = "retain-objects") || cfg!(feature = "retain-freed"),
            ),
            memory_release: retain_if(cfg!(feature = "retain-freed")),
        }
    }
}

impl EpochPolicy {
    #[must_use]
    pub fn with_reuse(mut self, reuse_epochs: bool) -> Self {
        self.reuse_epochs = reuse_epochs;
        self
    }

    #[must_use]
    pub fn with_lazy_clean(mut self, lazy_clean: bool) -> Self {
        self.lazy_clean = lazy_clean;
        self
    }

    /// Use `release` for both objects and memory.
    #[must_use]
    pub fn with_release(mut self, release: ReleasePolicy) -> Self {
        self.object_release = release;
        self.memory_release = release;
        self
    }

    #[must_use]
    pub fn with_object_release(mut self, release: ReleasePolicy) -> Self {
        self.object_release = release;
        self
    }

    #[must_use]
    pub fn with_memory_release(mut self, release: ReleasePolicy) -> Self {
        self.memory_release = release;
        self
    }
}

/// Mapping flavour for arena slabs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ArenaFlags {
    #[default]
    Private,
    Shared,
}

/// Default slab size for epoch arenas (4 MiB).
pub const DEFAULT_SLAB_SIZE: usize = 4 * 1024 * 1024;

/// The arguments of an arena creation call.
///
/// Every epoch builds its own [`PageArena`](crate::PageArena) from the same
/// options, so the limits apply per generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArenaOptions {
    /// Upper bound on bytes an arena may map for slabs.
    pub quota: usize,
    /// Bytes of slabs mapped eagerly when the arena is created.
    pub prealloc: usize,
    /// Slab size, rounded up to whole pages.
    pub slab_size: usize,
    pub flags: ArenaFlags,
}

impl Default for ArenaOptions {
    fn default() -> Self {
        Self {
            quota: usize::MAX,
            prealloc: 0,
            slab_size: DEFAULT_SLAB_SIZE,
            flags: ArenaFlags::Private,
        }
    }
}

impl ArenaOptions {
    #[must_use]
    pub fn new(quota: usize, prealloc: usize, slab_size: usize, flags: ArenaFlags) -> Self {
        Self {
            quota,
            prealloc,
            slab_size,
            flags,
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_follows_features() {
        let policy = EpochPolicy::default();
        assert_eq!(policy.reuse_epochs, cfg!(feature = "reuse-epochs"));
        assert_eq!(policy.lazy_clean, cfg!(feature = "lazy-clean"));
        assert_eq!(
            policy.memory_release == ReleasePolicy::Retain,
            cfg!(feature = "retain-freed")
        );
        assert_eq!(
            policy.object_release == ReleasePolicy::Retain,
            cfg!(feature = "retain-objects") || cfg!(feature = "retain-freed")
        );
    }

    #[test]
    fn test_policy_builders() {
        let policy = EpochPolicy::default()
            .with_reuse(false)
            .with_lazy_clean(true)
            .with_release(ReleasePolicy::Retain);
        assert!(!policy.reuse_epochs);
        assert!(policy.lazy_clean);
        assert_eq!(policy.object_release, ReleasePolicy::Retain);
        assert_eq!(policy.memory_release, ReleasePolicy::Retain);

        let split = policy.with_memory_release(ReleasePolicy::Unmap);
        assert_eq!(split.object_release, ReleasePolicy::Retain);
        assert_eq!(split.memory_release, ReleasePolicy::Unmap);
        let split = split
            .with_object_release(ReleasePolicy::Unmap)
            .with_memory_release(ReleasePolicy::Retain);
        assert_eq!(split.object_release, ReleasePolicy::Unmap);
        assert_eq!(split.memory_release, ReleasePolicy::Retain);
    }

    #[test]
    fn test_default_arena_options() {
        let options = ArenaOptions::default();
        assert_eq!(options.slab_size, DEFAULT_SLAB_SIZE);
        assert_eq!(options.quota, usize::MAX);
        assert_eq!(options.prealloc, 0);
        assert_eq!(options.flags, ArenaFlags::Private);
    }
}
