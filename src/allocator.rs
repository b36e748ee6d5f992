// Copyright © 2024 Andrea Corbellini and contributors
// SPDX-License-Identifier: BSD-3-Clause

use crate::error::Error;
use crate::region::UNIT_ALIGN;
use crate::SegmentManager;
use alloc::sync::Arc;
use core::any::type_name;
use core::fmt;
use core::marker::PhantomData;
use core::ptr::NonNull;
use log::debug;

#[cfg(feature = "allocator-api")]
use core::alloc::AllocError;
#[cfg(feature = "allocator-api")]
use core::alloc::Allocator;
#[cfg(feature = "allocator-api")]
use core::alloc::Layout;

/// Size of the segment created by [`SegmentAllocator::with_default_segment`], in bytes.
///
/// Enough for a handful of small objects.
pub const DEFAULT_SEGMENT_SIZE: usize = 128;

/// Byte-oriented memory manager behind a [`SegmentAllocator`].
///
/// [`SegmentManager`] is the implementation used in practice. Other implementations can stand in
/// for it, for example to observe the requests an allocator makes.
///
/// # Safety
///
/// Pointers returned by [`alloc`](Self::alloc) must be valid for reads and writes of `bytes`
/// bytes, aligned to [`SegmentManager::UNIT_SIZE`], and not handed out again until passed to
/// [`free`](Self::free).
pub unsafe trait Manager {
    /// Allocates at least `bytes` bytes.
    ///
    /// # Errors
    ///
    /// Whatever error the implementation reports, typically [`Error::OutOfMemory`].
    fn alloc(&self, bytes: usize) -> Result<NonNull<u8>, Error>;

    /// Returns memory obtained from [`alloc`](Self::alloc).
    ///
    /// # Errors
    ///
    /// Whatever error the implementation reports, typically [`Error::InvalidPointer`] or
    /// [`Error::DoubleFree`].
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`alloc`](Self::alloc) on this manager.
    unsafe fn free(&self, ptr: *mut u8) -> Result<(), Error>;
}

// SAFETY: blocks are unit-aligned and never overlap while allocated.
unsafe impl<'a> Manager for SegmentManager<'a> {
    #[inline]
    fn alloc(&self, bytes: usize) -> Result<NonNull<u8>, Error> {
        SegmentManager::alloc(self, bytes)
    }

    #[inline]
    unsafe fn free(&self, ptr: *mut u8) -> Result<(), Error> {
        SegmentManager::free(self, ptr)
    }
}

/// Typed allocator backed by a shared [`Manager`], a [`SegmentManager`] by default.
///
/// `SegmentAllocator<T>` counts in elements of `T` rather than in bytes. Copies made with
/// [`Clone`] or [`rebind`](Self::rebind) share the same manager through an [`Arc`], so the
/// manager lives as long as any allocator that refers to it.
///
/// An allocator may also be *unbound* (see [`unbound`](Self::unbound) and [`take`](Self::take)).
/// Every request on an unbound allocator fails with [`Error::Unbound`].
///
/// # Examples
///
/// ```
/// use seqfit::Error;
/// use seqfit::SegmentAllocator;
///
/// let mut ints = SegmentAllocator::<u64>::with_default_segment(false).unwrap();
/// let ptr = ints.allocate(4).unwrap();
/// unsafe { ints.deallocate(ptr, 4) }.unwrap();
///
/// let moved = ints.take();
/// assert!(moved.is_bound());
/// assert_eq!(ints.allocate(1), Err(Error::Unbound));
/// ```
pub struct SegmentAllocator<'a, T, M = SegmentManager<'a>> {
    manager: Option<Arc<M>>,
    log: bool,
    phantom: PhantomData<(fn() -> T, &'a ())>,
}

impl<'a, T, M: Manager> SegmentAllocator<'a, T, M> {
    /// Constructs an allocator that serves requests from `manager`.
    ///
    /// With `log` set, every [`allocate`](Self::allocate) and [`deallocate`](Self::deallocate)
    /// call is logged at `debug` level.
    #[inline]
    #[must_use]
    pub fn new(manager: Arc<M>, log: bool) -> Self {
        Self {
            manager: Some(manager),
            log,
            phantom: PhantomData,
        }
    }

    /// Constructs an allocator that is not bound to any manager.
    #[inline]
    #[must_use]
    pub const fn unbound(log: bool) -> Self {
        Self {
            manager: None,
            log,
            phantom: PhantomData,
        }
    }

    /// Allocates uninitialized memory for `n` elements of `T`.
    ///
    /// # Errors
    ///
    /// - [`Error::EmptyRequest`] if `n` is zero.
    /// - [`Error::Unbound`] if the allocator has no manager.
    /// - [`Error::UnsupportedAlignment`] if `T` needs a stricter alignment than
    ///   [`SegmentManager::UNIT_SIZE`].
    /// - [`Error::CapacityOverflow`] if `n * size_of::<T>()` overflows.
    /// - [`Error::OutOfMemory`] if the manager has no fragment large enough.
    ///
    /// Errors from the manager are returned unchanged: [`Error::OutOfMemory`] only carries the
    /// byte count. The element count and element size are logged alongside it when the allocator
    /// was created with `log` set.
    pub fn allocate(&self, n: usize) -> Result<NonNull<T>, Error> {
        let bytes = n.checked_mul(size_of::<T>());

        if self.log {
            match bytes {
                Some(bytes) => debug!(
                    "{}: allocating {} objects, {} bytes are required",
                    type_name::<Self>(),
                    n,
                    bytes,
                ),
                None => debug!(
                    "{}: allocating {} objects, required bytes overflow",
                    type_name::<Self>(),
                    n,
                ),
            }
        }

        if n == 0 {
            return Err(Error::EmptyRequest);
        }
        let manager = self.manager.as_ref().ok_or(Error::Unbound)?;
        if align_of::<T>() > UNIT_ALIGN {
            return Err(Error::UnsupportedAlignment {
                align: align_of::<T>(),
            });
        }
        let bytes = bytes.ok_or(Error::CapacityOverflow)?;

        manager
            .alloc(bytes)
            .map(NonNull::cast)
            .inspect_err(|err| {
                if self.log {
                    debug!(
                        "{}: {} objects of {} bytes: {}",
                        type_name::<Self>(),
                        n,
                        size_of::<T>(),
                        err,
                    );
                }
            })
    }

    /// Returns memory for `n` elements of `T` to the manager.
    ///
    /// `n` is only used for logging: the manager knows the size of the block from its header.
    ///
    /// # Errors
    ///
    /// [`Error::Unbound`] if the allocator has no manager; otherwise whatever
    /// [`Manager::free`] reports.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`allocate`](Self::allocate) on an allocator that shares
    /// this allocator's manager, and must not be used after this call succeeds.
    pub unsafe fn deallocate(&self, ptr: NonNull<T>, n: usize) -> Result<(), Error> {
        if self.log {
            match n.checked_mul(size_of::<T>()) {
                Some(bytes) => debug!(
                    "{}: deallocating {} objects, {} bytes to be freed",
                    type_name::<Self>(),
                    n,
                    bytes,
                ),
                None => debug!(
                    "{}: deallocating {} objects, size overflows",
                    type_name::<Self>(),
                    n,
                ),
            }
        }

        let manager = self.manager.as_ref().ok_or(Error::Unbound)?;
        manager.free(ptr.as_ptr().cast())
    }

    /// Returns an allocator for elements of type `U` that shares this allocator's manager and
    /// logging setting.
    #[inline]
    #[must_use]
    pub fn rebind<U>(&self) -> SegmentAllocator<'a, U, M> {
        SegmentAllocator {
            manager: self.manager.clone(),
            log: self.log,
            phantom: PhantomData,
        }
    }

    /// Moves the manager reference out of this allocator.
    ///
    /// The returned allocator takes over the reference without touching the reference count.
    /// `self` is left unbound, with logging disabled.
    #[inline]
    #[must_use]
    pub fn take(&mut self) -> Self {
        let log = core::mem::replace(&mut self.log, false);
        Self {
            manager: self.manager.take(),
            log,
            phantom: PhantomData,
        }
    }

    /// Returns the manager this allocator is bound to, if any.
    #[inline]
    #[must_use]
    pub fn manager(&self) -> Option<&Arc<M>> {
        self.manager.as_ref()
    }

    /// Returns `true` if this allocator has a manager.
    #[inline]
    #[must_use]
    pub const fn is_bound(&self) -> bool {
        self.manager.is_some()
    }

    /// Returns `true` if this allocator logs its requests.
    #[inline]
    #[must_use]
    pub const fn is_logging_enabled(&self) -> bool {
        self.log
    }
}

impl<T> SegmentAllocator<'static, T> {
    /// Constructs an allocator over a private segment of [`DEFAULT_SEGMENT_SIZE`] bytes.
    ///
    /// # Errors
    ///
    /// Never fails in practice; the signature matches [`with_capacity`](Self::with_capacity).
    #[inline]
    pub fn with_default_segment(log: bool) -> Result<Self, Error> {
        Self::with_capacity(DEFAULT_SEGMENT_SIZE, log)
    }

    /// Constructs an allocator over a private segment of `size` bytes.
    ///
    /// The segment is released when the last allocator sharing it is dropped.
    ///
    /// # Errors
    ///
    /// Whatever [`SegmentManager::with_capacity`] reports.
    pub fn with_capacity(size: usize, log: bool) -> Result<Self, Error> {
        let manager = SegmentManager::with_capacity(size, false)?;
        Ok(Self::new(Arc::new(manager), log))
    }
}

impl<'a, T, M: Manager> Clone for SegmentAllocator<'a, T, M> {
    #[inline]
    fn clone(&self) -> Self {
        self.rebind()
    }
}

impl<'a, T, U, M: Manager> From<&SegmentAllocator<'a, U, M>> for SegmentAllocator<'a, T, M> {
    #[inline]
    fn from(other: &SegmentAllocator<'a, U, M>) -> Self {
        other.rebind()
    }
}

/// Two allocators are equal when they are bound to the same manager, whatever their element
/// types. An unbound allocator is not equal to any allocator, itself included.
impl<'a, T, U, M> PartialEq<SegmentAllocator<'a, U, M>> for SegmentAllocator<'a, T, M> {
    fn eq(&self, other: &SegmentAllocator<'a, U, M>) -> bool {
        match (&self.manager, &other.manager) {
            (Some(this), Some(that)) => Arc::ptr_eq(this, that),
            _ => false,
        }
    }
}

impl<'a, T, M> fmt::Debug for SegmentAllocator<'a, T, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentAllocator")
            .field("element", &type_name::<T>())
            .field("manager", &self.manager.as_ref().map(Arc::as_ptr))
            .field("log", &self.log)
            .finish()
    }
}

#[cfg(feature = "allocator-api")]
unsafe impl<'a, T, M: Manager> Allocator for SegmentAllocator<'a, T, M> {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if self.log {
            debug!("{}: allocating {:?}", type_name::<Self>(), layout);
        }
        if layout.align() > UNIT_ALIGN {
            return Err(AllocError);
        }
        let manager = self.manager.as_deref().ok_or(AllocError)?;
        let ptr = manager.alloc(layout.size()).map_err(|_| AllocError)?;
        Ok(NonNull::slice_from_raw_parts(ptr, layout.size()))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if self.log {
            debug!("{}: deallocating {:?}", type_name::<Self>(), layout);
        }
        if let Some(manager) = self.manager.as_deref() {
            // Failures are already reported by the manager.
            let _ = manager.free(ptr.as_ptr());
        }
    }
}
