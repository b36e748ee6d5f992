// Copyright © 2024 Andrea Corbellini and contributors
// SPDX-License-Identifier: BSD-3-Clause

//! Lazy initialization of a [`SegmentManager`].
//!
//! See [`LazySegmentManager`] for information and examples.

use crate::SegmentManager;
use core::alloc::GlobalAlloc;
use core::alloc::Layout;
use core::ops::Deref;
use spin::Lazy;

#[cfg(feature = "allocator-api")]
use core::alloc::AllocError;
#[cfg(feature = "allocator-api")]
use core::alloc::Allocator;
#[cfg(feature = "allocator-api")]
use core::ptr::NonNull;

/// Lazy-initialized [`SegmentManager`].
///
/// The manager is not constructed when `LazySegmentManager` is constructed, but when it is first
/// accessed. This makes it possible to keep a manager in a `static` item.
///
/// `LazySegmentManager` dereferences to [`SegmentManager`] and implements [`GlobalAlloc`] (and
/// [`Allocator`] with the `allocator-api` feature).
///
/// # Examples
///
/// ```
/// use seqfit::lazy::LazySegmentManager;
/// use seqfit::SegmentManager;
///
/// static MANAGER: LazySegmentManager = LazySegmentManager::new(|| {
///     SegmentManager::with_capacity(4096, false).expect("4096 bytes is a valid segment size")
/// });
///
/// // The manager is constructed here, on first use.
/// let ptr = MANAGER.alloc(64).unwrap();
/// unsafe { MANAGER.free(ptr.as_ptr()) }.unwrap();
/// assert_eq!(MANAGER.usage().objects, 0);
/// ```
#[derive(Debug)]
pub struct LazySegmentManager<F = fn() -> SegmentManager<'static>>(Lazy<SegmentManager<'static>, F>);

impl<F> LazySegmentManager<F> {
    /// Constructs a new [`LazySegmentManager`] from the given initialization function.
    ///
    /// The initialization function is called the first time the manager is used, either by
    /// dereferencing or through one of the implemented traits.
    #[inline]
    #[must_use]
    pub const fn new(f: F) -> Self {
        Self(Lazy::new(f))
    }
}

impl<F: FnOnce() -> SegmentManager<'static>> LazySegmentManager<F> {
    /// Returns a reference to the underlying [`SegmentManager`], initializing it if needed.
    #[inline]
    pub fn get(&self) -> &SegmentManager<'static> {
        self
    }
}

impl<F: FnOnce() -> SegmentManager<'static>> Deref for LazySegmentManager<F> {
    type Target = SegmentManager<'static>;

    #[inline]
    fn deref(&self) -> &SegmentManager<'static> {
        &self.0
    }
}

#[cfg(feature = "allocator-api")]
unsafe impl<F: FnOnce() -> SegmentManager<'static>> Allocator for LazySegmentManager<F> {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        Allocator::allocate(self.get(), layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        Allocator::deallocate(self.get(), ptr, layout)
    }
}

unsafe impl<F: FnOnce() -> SegmentManager<'static>> GlobalAlloc for LazySegmentManager<F> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        GlobalAlloc::alloc(self.get(), layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        GlobalAlloc::dealloc(self.get(), ptr, layout)
    }
}
