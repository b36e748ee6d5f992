// Copyright © 2024 Andrea Corbellini and contributors
// SPDX-License-Identifier: BSD-3-Clause

use crate::region::Region;
use core::ptr::NonNull;

/// Unit index of the sentinel header that anchors the free list.
pub(crate) const SENTINEL: usize = 0;

/// Value stored in the `next` field of a block that is handed out to a caller.
pub(crate) const ALLOCATED: usize = usize::MAX;

/// Value stored in the `next` field of a header that was absorbed by a neighbouring fragment.
pub(crate) const RELEASED: usize = usize::MAX - 1;

/// Smallest fragment worth keeping on its own: a header plus one unit of payload.
pub(crate) const MIN_FRAGMENT_UNITS: usize = 2;

/// In-memory representation of a block header.
///
/// `size` counts units and includes the header itself. `next` is the unit index of the next free
/// block, or one of [`ALLOCATED`] / [`RELEASED`].
#[repr(C, align(16))]
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
pub(crate) struct HeaderRepr {
    size: usize,
    next: usize,
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct Block<'a> {
    region: Region<'a>,
    index: usize,
    pub(crate) size: usize,
    pub(crate) next: usize,
}

impl<'a> Block<'a> {
    #[inline]
    #[must_use]
    pub(crate) const fn new(region: Region<'a>, index: usize, size: usize, next: usize) -> Self {
        Self {
            region,
            index,
            size,
            next,
        }
    }

    /// Reads the header at unit `index`.
    ///
    /// # Safety
    ///
    /// `index` must be within `region`.
    #[inline]
    #[must_use]
    pub(crate) unsafe fn read(region: Region<'a>, index: usize) -> Self {
        let HeaderRepr { size, next } = region.read(index);
        Self {
            region,
            index,
            size,
            next,
        }
    }

    /// Writes this header back to the region.
    #[inline]
    pub(crate) fn write(&self) {
        debug_assert!(
            self.index == SENTINEL || self.end() <= self.region.units(),
            "block exceeds the region"
        );
        let header = HeaderRepr {
            size: self.size,
            next: self.next,
        };
        // SAFETY: blocks are only built for indices inside the region, and their header unit is
        // never part of a payload handed out to a caller.
        unsafe { self.region.write(self.index, header) }
    }

    /// Marks this header as absorbed by a neighbour.
    ///
    /// The header memory now belongs to the payload of a larger free fragment; stamping it keeps a
    /// stale pointer to it from passing as an allocated block.
    #[inline]
    pub(crate) fn release(mut self) {
        self.next = RELEASED;
        self.write();
    }

    #[inline]
    #[must_use]
    pub(crate) const fn index(&self) -> usize {
        self.index
    }

    /// Index of the first unit past this block.
    #[inline]
    #[must_use]
    pub(crate) const fn end(&self) -> usize {
        self.index + self.size
    }

    #[inline]
    #[must_use]
    pub(crate) const fn is_sentinel(&self) -> bool {
        self.index == SENTINEL
    }

    #[inline]
    #[must_use]
    pub(crate) const fn is_allocated(&self) -> bool {
        self.next == ALLOCATED
    }

    /// Returns `true` if unit `index` falls inside this block.
    #[inline]
    #[must_use]
    pub(crate) const fn contains(&self, index: usize) -> bool {
        self.index <= index && index < self.end()
    }

    #[inline]
    #[must_use]
    pub(crate) fn data(&self) -> NonNull<u8> {
        self.region.data_ptr(self.index)
    }

    /// Size of the payload, in bytes.
    #[inline]
    #[must_use]
    pub(crate) fn capacity(&self) -> usize {
        self.region.offset_of(self.size.saturating_sub(1))
    }
}
