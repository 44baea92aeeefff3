//! Guard-page handles.
//!
//! Objects handed across the allocator boundary live one page *after* the
//! address the caller receives. That leading page has no access, so code
//! that treats a [`Handle`] as the real object faults on first touch instead
//! of scribbling over it. The only way in is [`Handle::resolve`], which
//! steps over the guard page and checks the object's signature.

use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use super::fatal::die;
use super::pages::{self, map_pages, protect_or_die, unmap_pages};
use super::stats;
use super::vm::{Protection, VmError};
use crate::config::{ArenaFlags, ReleasePolicy};

/// A type that can sit behind a guard page.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]` with a `u64` as their first field,
/// holding [`SIGNATURE`](Self::SIGNATURE) for as long as the value is alive.
pub(crate) unsafe trait Signed {
    const SIGNATURE: u64;
    const NAME: &'static str;
}

/// Opaque address of a guarded object. Never dereference it directly.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(NonNull<u8>);

// Safety: a handle is an address; all access goes through `resolve` under the
// owner's lock.
unsafe impl Send for Handle {}
// Safety: see above.
unsafe impl Sync for Handle {}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Handle({:p})", self.0)
    }
}

impl Handle {
    /// The raw address, which always points at an inaccessible page.
    #[inline]
    #[must_use]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline]
    #[must_use]
    pub fn as_ptr(self) -> *const u8 {
        self.0.as_ptr().cast_const()
    }

    /// Step over the guard page and validate the object's signature.
    ///
    /// A mismatch means a foreign or corrupted handle crossed the boundary;
    /// the process is aborted.
    ///
    /// # Safety
    ///
    /// `self` must have been produced by a [`Guarded<T>`] whose pages are
    /// still mapped.
    pub(crate) unsafe fn resolve<T: Signed>(self) -> NonNull<T> {
        // Safety: the object starts exactly one page after the handle.
        let object = unsafe { self.0.add(pages::page_size()) }.cast::<T>();
        // Safety: `Signed` guarantees a leading u64 signature.
        let signature = unsafe { std::ptr::read_volatile(object.as_ptr().cast::<u64>()) };
        if signature != T::SIGNATURE {
            die!(
                "handle {:p} does not resolve to a live {} (signature {signature:#018x})",
                self.0,
                T::NAME
            );
        }
        object
    }
}

/// Owns a `T` placed after one inaccessible guard page.
pub(crate) struct Guarded<T: Signed> {
    object: NonNull<T>,
    mapped: usize,
    release: ReleasePolicy,
}

// Safety: Guarded owns its pages exclusively.
unsafe impl<T: Signed + Send> Send for Guarded<T> {}

impl<T: Signed> Guarded<T> {
    /// # Errors
    ///
    /// Returns `VmError` if the pages cannot be mapped.
    pub(crate) fn new(value: T, release: ReleasePolicy) -> Result<Self, VmError> {
        let page = pages::page_size();
        debug_assert!(std::mem::align_of::<T>() <= page);
        let (base, mapped) = map_pages(page + std::mem::size_of::<T>(), ArenaFlags::Private)?;
        // Safety: fresh mapping we own; the first page becomes the guard.
        unsafe { protect_or_die(base, page, Protection::None) };
        // Safety: the object pages start one page in and are read-write.
        let object = unsafe { base.add(page) }.cast::<T>();
        // Safety: aligned, writable, large enough for T.
        unsafe { object.as_ptr().write(value) };
        stats::GUARDED_BYTES.add(mapped);
        let guarded = Self {
            object,
            mapped,
            release,
        };
        debug_assert!(guarded.is_live());
        Ok(guarded)
    }

    /// The address handed outward instead of the object.
    #[inline]
    pub(crate) fn handle(&self) -> Handle {
        // Safety: the guard page precedes the object inside one mapping.
        Handle(unsafe { self.object.cast::<u8>().sub(pages::page_size()) })
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut T {
        self.object.as_ptr()
    }

    #[inline]
    pub(crate) fn mapped_bytes(&self) -> usize {
        self.mapped
    }

    pub(crate) fn is_live(&self) -> bool {
        // Safety: `Signed` guarantees a leading u64 signature.
        let signature = unsafe { std::ptr::read_volatile(self.object.as_ptr().cast::<u64>()) };
        signature == T::SIGNATURE
    }
}

impl<T: Signed> Deref for Guarded<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: object pages stay read-write for the Guarded's lifetime.
        unsafe { self.object.as_ref() }
    }
}

impl<T: Signed> DerefMut for Guarded<T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: as above, and &mut self is exclusive.
        unsafe { self.object.as_mut() }
    }
}

impl<T: Signed> Drop for Guarded<T> {
    fn drop(&mut self) {
        if !self.is_live() {
            die!("releasing a {} whose signature is corrupted", T::NAME);
        }
        let base = self.handle().0;
        // Safety: we own the object and its pages; nothing else refers to
        // them once the owner is dropping us.
        unsafe {
            std::ptr::drop_in_place(self.object.as_ptr());
            std::ptr::write_volatile(self.object.as_ptr().cast::<u64>(), 0);
            protect_or_die(base, self.mapped, Protection::ReadWrite);
            unmap_pages(base, self.mapped, self.release);
        }
        stats::sub_saturating(&stats::GUARDED_BYTES, self.mapped);
    }
}

#[cfg(all(test, not(any(loom, miri))))]
mod tests {
    use super::*;

    #[repr(C)]
    struct Probe {
        signature: u64,
        value: u32,
    }

    // Safety: repr(C) with the signature first.
    unsafe impl Signed for Probe {
        const SIGNATURE: u64 = 0x5052_4f42_455f_7631;
        const NAME: &'static str = "Probe";
    }

    impl Probe {
        fn new(value: u32) -> Self {
            Self {
                signature: Self::SIGNATURE,
                value,
            }
        }
    }

    #[test]
    fn test_handle_is_one_page_before_object() {
        let guarded = Guarded::new(Probe::new(5), ReleasePolicy::Unmap).unwrap();
        let handle = guarded.handle();
        assert_eq!(
            handle.addr() + pages::page_size(),
            guarded.as_ptr() as usize
        );
        assert!(pages::is_page_aligned(handle.addr()));
        assert_eq!(guarded.mapped_bytes(), pages::page_size() * 2);
    }

    #[test]
    fn test_resolve_returns_object() {
        let mut guarded = Guarded::new(Probe::new(5), ReleasePolicy::Unmap).unwrap();
        guarded.value = 6;
        // Safety: Test code, guarded is alive.
        let resolved = unsafe { guarded.handle().resolve::<Probe>() };
        assert_eq!(resolved.as_ptr(), guarded.as_ptr());
        // Safety: Test code.
        assert_eq!(unsafe { resolved.as_ref() }.value, 6);
    }

    #[test]
    fn test_is_live_tracks_signature() {
        let guarded = Guarded::new(Probe::new(1), ReleasePolicy::Unmap).unwrap();
        assert!(guarded.is_live());
        assert_eq!(guarded.signature, Probe::SIGNATURE);
    }

    #[test]
    fn test_release_updates_stats() {
        let before = stats::RETAINED_BYTES.get();
        let guarded = Guarded::new(Probe::new(1), ReleasePolicy::Retain).unwrap();
        let mapped = guarded.mapped_bytes();
        drop(guarded);
        assert!(stats::RETAINED_BYTES.get() >= before + mapped);
    }

    #[test]
    fn test_handle_debug_shows_address() {
        let guarded = Guarded::new(Probe::new(1), ReleasePolicy::Unmap).unwrap();
        let text = format!("{:?}", guarded.handle());
        assert!(text.starts_with("Handle(0x"), "{text}");
    }
}
