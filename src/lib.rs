// Copyright © 2024 Andrea Corbellini and contributors
// SPDX-License-Identifier: BSD-3-Clause

//! Seqfit: a sequential-fit allocator over a memory segment you already have.
//!
//! Seqfit does not ask the operating system for memory. You hand it a fixed byte region (a stack
//! array, a static buffer, a slice of a larger mapping) and it carves that region into blocks on
//! request, returning them to a free list when they are released.
//!
//! The crate has two layers:
//!
//! * [`SegmentManager`]: the byte-oriented allocator. It owns the free list and the mutex that
//!   protects it.
//! * [`SegmentAllocator`]: a typed front end that counts in elements of `T`, shares its manager
//!   with every copy of itself, and can be rebound to a different element type.
//!
//! This is a no-`std` crate; it only needs `alloc` for [`Arc`](alloc::sync::Arc) and for segments
//! that the manager owns itself.
//!
//! # Quick start
//!
//! ```
//! use seqfit::SegmentManager;
//!
//! let mut memory = [0u8; 1024];
//! let manager = SegmentManager::new(&mut memory, false).expect("segment too small");
//!
//! let ptr = manager.alloc(100).expect("out of memory");
//! // SAFETY: `ptr` was returned by `alloc` on this manager and is freed only once.
//! unsafe { manager.free(ptr.as_ptr()) }.expect("invalid free");
//! ```
//!
//! Typed allocation goes through [`SegmentAllocator`]:
//!
//! ```
//! use seqfit::SegmentAllocator;
//! use seqfit::SegmentManager;
//! use std::sync::Arc;
//!
//! let manager = Arc::new(SegmentManager::with_capacity(4096, false).unwrap());
//! let ints = SegmentAllocator::<u32>::new(manager, false);
//! let nodes = ints.rebind::<[u64; 4]>();
//! assert!(ints == nodes);
//!
//! let ptr = ints.allocate(16).unwrap();
//! unsafe { ints.deallocate(ptr, 16) }.unwrap();
//! ```
//!
//! # Algorithm
//!
//! The segment is divided into *units*, each the size of a block header
//! ([`SegmentManager::UNIT_SIZE`]). Every block, free or allocated, starts with a header holding
//! its size in units and a link. The first unit is a sentinel that anchors a circular,
//! address-ordered list of free blocks.
//!
//! * **Allocation** rounds the request up to whole units, adds one for the header, and takes the
//!   first free block that is large enough. If the leftover is at least a header plus one unit, the
//!   block is split and the tail stays on the free list; otherwise the whole block is handed out.
//! * **Deallocation** puts the block back at its address-ordered position and merges it with the
//!   free block right after it and the free block right before it, when they touch.
//!
//! Links are stored as unit indices relative to the start of the segment, not as pointers. All
//! address arithmetic lives in one module.
//!
//! Allocation is `O(n)` in the number of free fragments. There is no best-fit search, no
//! compaction, and the segment never grows.
//!
//! # Errors
//!
//! Everything returns [`Result`] with an [`Error`]. [`Error::OutOfMemory`] is the only error that
//! happens in normal operation; [`Error::InvalidPointer`] and [`Error::DoubleFree`] are bugs in
//! the caller and are also reported through the [`log`] facade at `warn` level.
//!
//! # Logging
//!
//! Diagnostics go through the [`log`] crate. A manager created with `verbose = true` logs every
//! allocation and free at `debug` level; a [`SegmentAllocator`] created with `log = true` logs
//! every typed request. Nothing is printed unless the application installs a logger.
//!
//! Records are emitted after the manager lock is released, so a logger may allocate, even when the
//! manager is the global allocator.
//!
//! # Thread safety
//!
//! [`SegmentManager`] is `Send + Sync`. Every `alloc` and `free` holds a [spin
//! lock](https://en.wikipedia.org/wiki/Spinlock) for its whole duration, so operations from
//! different threads are totally ordered. Nothing ever waits for memory to become available.
//!
//! # Cargo feature flags
//!
//! * `allocator-api`: implements [`core::alloc::Allocator`] for [`SegmentManager`] and
//!   [`SegmentAllocator`] (requires a nightly compiler).
//! * `lazy`: enables [`LazySegmentManager`](lazy::LazySegmentManager), for managers stored in
//!   `static` items.

#![no_std]
#![cfg_attr(feature = "allocator-api", feature(allocator_api))]
#![warn(clippy::dbg_macro)]
#![warn(clippy::print_stderr)]
#![warn(clippy::print_stdout)]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![warn(unreachable_pub)]
#![warn(unused_crate_dependencies)]
#![warn(unused_macro_rules)]
#![warn(unused_qualifications)]
#![doc(test(attr(deny(warnings))))]

extern crate alloc;

#[cfg(test)]
extern crate std;

mod allocator;
mod block;
mod error;
mod iter;
mod region;
mod usage;


#[cfg(feature = "lazy")]
pub mod lazy;

use crate::block::Block;
use crate::block::HeaderRepr;
use crate::block::ALLOCATED;
use crate::block::MIN_FRAGMENT_UNITS;
use crate::block::SENTINEL;
use crate::iter::FreeBlocks;
use crate::region::Region;
use crate::region::UNIT_ALIGN;
use crate::region::UNIT_SIZE;
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::alloc::GlobalAlloc;
use core::alloc::Layout;
use core::ptr::NonNull;
use log::debug;
use log::warn;
use spin::Mutex;

#[cfg(feature = "allocator-api")]
use core::alloc::AllocError;
#[cfg(feature = "allocator-api")]
use core::alloc::Allocator;

pub use crate::allocator::Manager;
pub use crate::allocator::SegmentAllocator;
pub use crate::allocator::DEFAULT_SEGMENT_SIZE;
pub use crate::error::Error;
pub use crate::usage::FreeFragment;
pub use crate::usage::Usage;

/// The segment manager: a sequential-fit allocator over one fixed memory segment.
///
/// A manager either borrows its segment (see [`new`](Self::new)) or owns it (see
/// [`with_capacity`](Self::with_capacity)). In both cases the segment never moves and never
/// grows; the manager only sub-allocates inside it.
///
/// See the [crate-level documentation](crate#algorithm) for how blocks are laid out.
#[derive(Debug)]
pub struct SegmentManager<'a> {
    inner: Mutex<ManagerInner<'a>>,
    verbose: bool,
    // Declared after `inner` so that it is released last.
    owned: Option<OwnedSegment>,
}

impl<'a> SegmentManager<'a> {
    /// Size of one unit (one block header), in bytes.
    ///
    /// All block sizes are multiples of this value, and every pointer returned by
    /// [`alloc`](Self::alloc) is aligned to it.
    pub const UNIT_SIZE: usize = UNIT_SIZE;

    /// Smallest segment that can be managed: the sentinel header plus one block made of a header
    /// and one unit of payload.
    pub const MIN_SEGMENT_SIZE: usize = (1 + MIN_FRAGMENT_UNITS) * UNIT_SIZE;

    /// Constructs a segment manager over `segment`.
    ///
    /// The start of `segment` is rounded up to [`UNIT_SIZE`](Self::UNIT_SIZE) alignment and its
    /// length rounded down to a multiple of it. With `verbose` set, every operation is logged at
    /// `debug` level.
    ///
    /// # Errors
    ///
    /// [`Error::SegmentTooSmall`] if what remains after alignment is smaller than
    /// [`MIN_SEGMENT_SIZE`](Self::MIN_SEGMENT_SIZE).
    ///
    /// # Examples
    ///
    /// ```
    /// use seqfit::Error;
    /// use seqfit::SegmentManager;
    ///
    /// let mut memory = [0u8; 512];
    /// assert!(SegmentManager::new(&mut memory, false).is_ok());
    ///
    /// let mut tiny = [0u8; 8];
    /// assert!(matches!(
    ///     SegmentManager::new(&mut tiny, false),
    ///     Err(Error::SegmentTooSmall { size: 8, .. })
    /// ));
    /// ```
    pub fn new(segment: &'a mut [u8], verbose: bool) -> Result<Self, Error> {
        // SAFETY: `segment` is a unique reference that lives for `'a`.
        unsafe { Self::from_nonnull(NonNull::from(segment), verbose, None) }
    }

    /// Constructs a segment manager from a pointer and a size.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidPointer`] if `ptr` is null, [`Error::SegmentTooSmall`] if the segment is
    /// smaller than [`MIN_SEGMENT_SIZE`](Self::MIN_SEGMENT_SIZE) after alignment.
    ///
    /// # Safety
    ///
    /// - the memory at `ptr..ptr + size` must be valid for reads and writes for the lifetime `'a`.
    /// - that memory must not be accessed through any other pointer or reference while the
    ///   manager is alive, except through pointers returned by [`alloc`](Self::alloc).
    pub unsafe fn from_ptr_size(ptr: *mut u8, size: usize, verbose: bool) -> Result<Self, Error> {
        let ptr = NonNull::new(ptr).ok_or(Error::InvalidPointer)?;
        Self::from_nonnull(NonNull::slice_from_raw_parts(ptr, size), verbose, None)
    }

    unsafe fn from_nonnull(
        slice: NonNull<[u8]>,
        verbose: bool,
        owned: Option<OwnedSegment>,
    ) -> Result<Self, Error> {
        let region = Region::new(slice);
        if region.size() < Self::MIN_SEGMENT_SIZE {
            return Err(Error::SegmentTooSmall {
                size: slice.len(),
                min: Self::MIN_SEGMENT_SIZE,
            });
        }

        if verbose {
            debug!(
                "segment manager over {} bytes: unit {} bytes, minimum fragment {} bytes, \
                 minimum segment {} bytes",
                region.size(),
                UNIT_SIZE,
                MIN_FRAGMENT_UNITS * UNIT_SIZE,
                Self::MIN_SEGMENT_SIZE,
            );
        }

        Ok(Self {
            inner: Mutex::new(ManagerInner::init(region)),
            verbose,
            owned,
        })
    }

    /// Returns `true` if this manager allocated its segment itself and will release it on drop.
    #[inline]
    #[must_use]
    pub const fn is_owner(&self) -> bool {
        self.owned.is_some()
    }

    /// Returns `true` if this manager logs every operation.
    #[inline]
    #[must_use]
    pub const fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Size of the managed segment after alignment, in bytes.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.lock().region.size()
    }

    /// Allocates a block with at least `bytes` bytes of payload.
    ///
    /// The returned pointer is aligned to [`UNIT_SIZE`](Self::UNIT_SIZE) and the memory it points
    /// to is uninitialized. A request for zero bytes still takes one unit of payload.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfMemory`] if no free fragment is large enough. The free list is left
    /// untouched in that case.
    pub fn alloc(&self, bytes: usize) -> Result<NonNull<u8>, Error> {
        // The guard is dropped at the end of the statement, before anything is logged.
        let (result, event) = self.inner.lock().allocate(bytes);
        event.emit(self.verbose);
        result
    }

    /// Returns a block to the free list, merging it with the free fragments on either side.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidPointer`] if `ptr` is null, lies outside the segment, or does not point
    ///   to the start of an allocated block.
    /// - [`Error::DoubleFree`] if the block is already on the free list. This includes any
    ///   unit-aligned pointer into a free fragment, whether or not it was ever handed out.
    ///
    /// In both cases the manager is left unchanged, and the failure is logged at `warn` level.
    ///
    /// # Safety
    ///
    /// `ptr` must be null, point outside of the segment, or have been returned by
    /// [`alloc`](Self::alloc) on this manager. After a successful call the block must not be
    /// accessed anymore.
    pub unsafe fn free(&self, ptr: *mut u8) -> Result<(), Error> {
        let (result, event) = self.inner.lock().free(ptr);
        event.emit(self.verbose);
        result
    }

    /// Returns memory usage information for this manager.
    ///
    /// This walks the whole free list, so it is linear in the number of free fragments.
    ///
    /// # Examples
    ///
    /// ```
    /// use seqfit::SegmentManager;
    ///
    /// let manager = SegmentManager::with_capacity(1024, false).unwrap();
    /// let usage = manager.usage();
    /// assert_eq!(usage.total, 1024);
    /// assert_eq!(usage.free, 1024 - SegmentManager::UNIT_SIZE);
    /// assert_eq!(usage.objects, 0);
    /// ```
    #[must_use]
    pub fn usage(&self) -> Usage {
        self.inner.lock().usage()
    }

    /// Returns the fragments currently on the free list, in address order.
    #[must_use]
    pub fn fragments(&self) -> Vec<FreeFragment> {
        self.inner.lock().fragments()
    }
}

impl SegmentManager<'static> {
    /// Constructs a segment manager that owns a freshly allocated segment of `size` bytes.
    ///
    /// The segment is released when the manager is dropped. `size` is rounded down to a multiple
    /// of [`UNIT_SIZE`](Self::UNIT_SIZE).
    ///
    /// # Errors
    ///
    /// - [`Error::SegmentTooSmall`] if `size` is smaller than
    ///   [`MIN_SEGMENT_SIZE`](Self::MIN_SEGMENT_SIZE).
    /// - [`Error::CapacityOverflow`] if `size` exceeds `isize::MAX`.
    /// - [`Error::OutOfMemory`] if the segment itself cannot be allocated.
    pub fn with_capacity(size: usize, verbose: bool) -> Result<Self, Error> {
        if size < Self::MIN_SEGMENT_SIZE {
            return Err(Error::SegmentTooSmall {
                size,
                min: Self::MIN_SEGMENT_SIZE,
            });
        }
        if size > isize::MAX as usize {
            return Err(Error::CapacityOverflow);
        }
        let owned = OwnedSegment::new(size / UNIT_SIZE)?;
        let slice = owned.as_bytes();
        // SAFETY: the buffer is exclusively owned by the manager and outlives its region.
        unsafe { Self::from_nonnull(slice, verbose, Some(owned)) }
    }
}

impl<'a> TryFrom<&'a mut [u8]> for SegmentManager<'a> {
    type Error = Error;

    #[inline]
    fn try_from(slice: &'a mut [u8]) -> Result<Self, Error> {
        Self::new(slice, false)
    }
}

impl<'a, const N: usize> TryFrom<&'a mut [u8; N]> for SegmentManager<'a> {
    type Error = Error;

    #[inline]
    fn try_from(array: &'a mut [u8; N]) -> Result<Self, Error> {
        Self::new(array.as_mut_slice(), false)
    }
}

#[cfg(feature = "allocator-api")]
unsafe impl<'a> Allocator for SegmentManager<'a> {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.align() > UNIT_ALIGN {
            return Err(AllocError);
        }
        let ptr = self.alloc(layout.size()).map_err(|_| AllocError)?;
        Ok(NonNull::slice_from_raw_parts(ptr, layout.size()))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, _layout: Layout) {
        // Failures are already reported through `log`.
        let _ = self.free(ptr.as_ptr());
    }
}

unsafe impl<'a> GlobalAlloc for SegmentManager<'a> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > UNIT_ALIGN {
            return core::ptr::null_mut();
        }
        SegmentManager::alloc(self, layout.size())
            .map(NonNull::as_ptr)
            .unwrap_or_else(|_| core::ptr::null_mut())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        // Failures are already reported through `log`.
        let _ = self.free(ptr);
    }
}

/// A segment allocated by the manager itself.
#[derive(Debug)]
struct OwnedSegment(NonNull<[HeaderRepr]>);

// SAFETY: the buffer is uniquely owned; all accesses go through the manager's mutex.
unsafe impl Send for OwnedSegment {}
// SAFETY: see above.
unsafe impl Sync for OwnedSegment {}

impl OwnedSegment {
    fn new(units: usize) -> Result<Self, Error> {
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(units)
            .map_err(|_| Error::OutOfMemory {
                requested: units * UNIT_SIZE,
            })?;
        buffer.resize(units, HeaderRepr::default());
        Ok(Self(NonNull::from(Box::leak(buffer.into_boxed_slice()))))
    }

    fn as_bytes(&self) -> NonNull<[u8]> {
        NonNull::slice_from_raw_parts(self.0.cast::<u8>(), self.0.len() * UNIT_SIZE)
    }
}

impl Drop for OwnedSegment {
    fn drop(&mut self) {
        // SAFETY: the pointer comes from `Box::leak` in `new()` and is released only here.
        drop(unsafe { Box::from_raw(self.0.as_ptr()) });
    }
}

#[derive(Debug)]
struct ManagerInner<'a> {
    region: Region<'a>,
    objects: usize,
    allocated_units: usize,
}

impl<'a> ManagerInner<'a> {
    /// Writes the sentinel and one free block spanning the rest of the region.
    fn init(region: Region<'a>) -> Self {
        debug_assert!(
            region.units() > MIN_FRAGMENT_UNITS,
            "region is too small for a sentinel and a fragment"
        );

        let first = SENTINEL + 1;
        Block::new(region, SENTINEL, 0, first).write();
        Block::new(region, first, region.units() - 1, SENTINEL).write();

        Self {
            region,
            objects: 0,
            allocated_units: 0,
        }
    }

    fn allocate(&mut self, bytes: usize) -> (Result<NonNull<u8>, Error>, Event) {
        let exhausted = |needed| {
            (
                Err(Error::OutOfMemory { requested: bytes }),
                Event::Exhausted { bytes, needed },
            )
        };

        let Some(needed) = bytes.div_ceil(UNIT_SIZE).max(1).checked_add(1) else {
            return exhausted(usize::MAX);
        };

        // SAFETY: the sentinel is always present.
        let mut prev = unsafe { Block::read(self.region, SENTINEL) };

        while prev.next != SENTINEL {
            // SAFETY: free list links always point inside the region.
            let mut curr = unsafe { Block::read(self.region, prev.next) };

            if curr.size >= needed {
                let remainder = curr.size - needed;
                let split = remainder >= MIN_FRAGMENT_UNITS;

                if split {
                    let tail = Block::new(self.region, curr.index() + needed, remainder, curr.next);
                    tail.write();
                    prev.next = tail.index();
                    curr.size = needed;
                } else {
                    prev.next = curr.next;
                }
                prev.write();

                curr.next = ALLOCATED;
                curr.write();

                self.objects += 1;
                self.allocated_units += curr.size;

                let event = Event::Allocated {
                    bytes,
                    units: curr.size,
                    offset: self.region.offset_of(curr.index()),
                    split,
                    usable: curr.capacity(),
                };
                return (Ok(curr.data()), event);
            }

            prev = curr;
        }

        exhausted(needed)
    }

    unsafe fn free(&mut self, ptr: *mut u8) -> (Result<(), Error>, Event) {
        let rejected =
            |error: Error, reason: &'static str| (Err(error), Event::Rejected { ptr, reason });

        let Ok(index) = self.region.header_index(ptr) else {
            return rejected(
                Error::InvalidPointer,
                "pointer does not belong to the segment",
            );
        };

        // Find the last free block at or before `index`.
        // SAFETY: the sentinel is always present, and links point inside the region.
        let mut prev = Block::read(self.region, SENTINEL);
        while prev.next != SENTINEL && prev.next <= index {
            prev = Block::read(self.region, prev.next);
        }

        if !prev.is_sentinel() && prev.contains(index) {
            return rejected(Error::DoubleFree, "block is already free");
        }

        // Blocks can extend up to the next free fragment, or to the end of the region.
        let limit = match prev.next {
            SENTINEL => self.region.units(),
            next => next,
        };

        // SAFETY: `index` was validated by `header_index()`.
        let mut block = Block::read(self.region, index);
        if !block.is_allocated() || block.size < MIN_FRAGMENT_UNITS || block.size > limit - index {
            return rejected(Error::InvalidPointer, "no allocated block at this address");
        }

        self.objects -= 1;
        self.allocated_units -= block.size;
        let freed = block.size;
        let mut merged_next = false;
        let mut merged_prev = false;

        block.next = prev.next;
        if prev.next != SENTINEL && block.end() == prev.next {
            let next = Block::read(self.region, prev.next);
            block.size += next.size;
            block.next = next.next;
            next.release();
            merged_next = true;
        }

        if !prev.is_sentinel() && prev.end() == block.index() {
            prev.size += block.size;
            prev.next = block.next;
            prev.write();
            block.release();
            merged_prev = true;
        } else {
            block.write();
            prev.next = block.index();
            prev.write();
        }

        let event = Event::Freed {
            units: freed,
            offset: self.region.offset_of(index),
            merged_next,
            merged_prev,
        };
        (Ok(()), event)
    }

    fn usage(&self) -> Usage {
        // SAFETY: the free list was initialized by `init()`.
        unsafe { Usage::get(self.region, self.objects, self.allocated_units) }
    }

    fn fragments(&self) -> Vec<FreeFragment> {
        // SAFETY: the free list was initialized by `init()`.
        unsafe { FreeBlocks::new(self.region) }
            .map(|block| FreeFragment {
                offset: self.region.offset_of(block.index()),
                size: self.region.offset_of(block.size),
            })
            .collect()
    }
}

/// Outcome of an `alloc` or `free` call.
///
/// Recorded while the lock is held and logged after it is released: a logger that allocates may
/// call back into the same manager.
#[derive(Copy, Clone, Debug)]
enum Event {
    Allocated {
        bytes: usize,
        units: usize,
        offset: usize,
        split: bool,
        usable: usize,
    },
    Exhausted {
        bytes: usize,
        needed: usize,
    },
    Freed {
        units: usize,
        offset: usize,
        merged_next: bool,
        merged_prev: bool,
    },
    Rejected {
        ptr: *mut u8,
        reason: &'static str,
    },
}

impl Event {
    /// Rejected frees are always logged; everything else only when `verbose` is set.
    fn emit(self, verbose: bool) {
        match self {
            Self::Rejected { ptr, reason } => warn!("free {ptr:p}: {reason}"),
            _ if !verbose => {}
            Self::Allocated {
                bytes,
                units,
                offset,
                split,
                usable,
            } => debug!(
                "alloc {} bytes: {} units at offset {} ({}), {} bytes usable",
                bytes,
                units,
                offset,
                if split { "split" } else { "whole fragment" },
                usable,
            ),
            Self::Exhausted { bytes, needed } => {
                debug!("alloc {bytes} bytes: no fragment of {needed} units available")
            }
            Self::Freed {
                units,
                offset,
                merged_next,
                merged_prev,
            } => debug!(
                "free {units} units at offset {offset} (merged with next: {merged_next}, \
                 merged with previous: {merged_prev})"
            ),
        }
    }
}
