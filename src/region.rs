// Copyright © 2024 Andrea Corbellini and contributors
// SPDX-License-Identifier: BSD-3-Clause

//! Unit-aligned view of the managed bytes.
//!
//! This is the only place where addresses are turned into unit indices and back. Everything else
//! in the crate speaks in terms of indices relative to the start of the region.

use crate::block::HeaderRepr;
use crate::error::Error;
use core::marker::PhantomData;
use core::ptr::NonNull;

/// Size of one unit (one block header), in bytes.
pub(crate) const UNIT_SIZE: usize = size_of::<HeaderRepr>();

/// Alignment of every unit, and therefore of every pointer handed out.
pub(crate) const UNIT_ALIGN: usize = align_of::<HeaderRepr>();

#[derive(Copy, Clone, Debug)]
pub(crate) struct Region<'a> {
    start: NonNull<HeaderRepr>,
    units: usize,
    phantom: PhantomData<&'a mut [u8]>,
}

// SAFETY: `Region` behaves like the `&'a mut [u8]` it was created from. The pointer is never
// aliased outside of the owning `SegmentManager`, which serializes every access with its mutex.
unsafe impl<'a> Send for Region<'a> where &'a mut [u8]: Send {}

impl<'a> Region<'a> {
    /// Creates a region over `slice`.
    ///
    /// The start of `slice` is moved forward to the first address aligned for a header, and the
    /// length is truncated to a whole number of units. If nothing is left, the region is empty.
    ///
    /// # Safety
    ///
    /// - `slice` must be valid for reads and writes for the lifetime `'a`.
    /// - `slice` must not be aliased by any other reference or pointer.
    #[must_use]
    pub(crate) unsafe fn new(slice: NonNull<[u8]>) -> Self {
        let start = slice.cast::<u8>();
        let pad = start.as_ptr().align_offset(UNIT_ALIGN);

        if pad >= slice.len() {
            return Self {
                start: NonNull::dangling(),
                units: 0,
                phantom: PhantomData,
            };
        }

        let start = start.byte_add(pad).cast::<HeaderRepr>();
        debug_assert!(start.is_aligned(), "failed to align region");

        Self {
            start,
            units: (slice.len() - pad) / UNIT_SIZE,
            phantom: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub(crate) const fn units(&self) -> usize {
        self.units
    }

    /// Size of the region in bytes. Always a multiple of [`UNIT_SIZE`].
    #[inline]
    #[must_use]
    pub(crate) const fn size(&self) -> usize {
        self.units * UNIT_SIZE
    }

    /// Reads the header stored at unit `index`.
    ///
    /// # Safety
    ///
    /// `index` must be less than [`units()`](Self::units).
    #[inline]
    #[must_use]
    pub(crate) unsafe fn read(&self, index: usize) -> HeaderRepr {
        debug_assert!(index < self.units, "unit index out of bounds");
        self.start.add(index).read()
    }

    /// Writes a header at unit `index`.
    ///
    /// # Safety
    ///
    /// `index` must be less than [`units()`](Self::units), and unit `index` must not be part of
    /// the payload of an allocated block.
    #[inline]
    pub(crate) unsafe fn write(&self, index: usize, header: HeaderRepr) {
        debug_assert!(index < self.units, "unit index out of bounds");
        self.start.add(index).write(header);
    }

    /// Returns the payload pointer of the block whose header is at unit `index`.
    #[inline]
    #[must_use]
    pub(crate) fn data_ptr(&self, index: usize) -> NonNull<u8> {
        debug_assert!(index + 1 < self.units, "block has no payload");
        // SAFETY: the payload unit lies within the region, as checked above.
        unsafe { self.start.add(index + 1).cast() }
    }

    /// Maps a payload pointer back to the unit index of its header.
    ///
    /// Fails with [`Error::InvalidPointer`] if `data` is null, is not unit-aligned relative to the
    /// region, or has its header outside of the region (the sentinel unit included).
    pub(crate) fn header_index(&self, data: *mut u8) -> Result<usize, Error> {
        if data.is_null() {
            return Err(Error::InvalidPointer);
        }

        let offset = (data as usize).wrapping_sub(self.start.as_ptr() as usize);
        if offset >= self.size() || offset % UNIT_SIZE != 0 {
            return Err(Error::InvalidPointer);
        }

        // Unit 0 is the sentinel, so the first possible payload is unit 2.
        match offset / UNIT_SIZE {
            index @ 2.. => Ok(index - 1),
            _ => Err(Error::InvalidPointer),
        }
    }

    #[inline]
    #[must_use]
    pub(crate) fn offset_of(&self, index: usize) -> usize {
        index * UNIT_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(align(16))]
    struct Aligned([u8; 256]);

    fn region(slice: &mut [u8]) -> Region<'_> {
        unsafe { Region::new(NonNull::from(slice)) }
    }

    #[test]
    fn aligns_and_truncates() {
        let mut memory = Aligned([0u8; 256]);
        let region = region(&mut memory.0[1..250]);
        assert_eq!(region.size() % UNIT_SIZE, 0);
        assert!(region.size() <= 249);
        assert!(region.size() + 2 * UNIT_SIZE > 249);
    }

    #[test]
    fn empty_when_too_short_to_align() {
        let mut memory = Aligned([0u8; 256]);
        let region = region(&mut memory.0[1..2]);
        assert_eq!(region.units(), 0);
    }

    #[test]
    fn header_index_round_trip() {
        let mut memory = Aligned([0u8; 256]);
        let region = region(&mut memory.0[..]);
        let data = region.data_ptr(3);
        assert_eq!(region.header_index(data.as_ptr()), Ok(3));
    }

    #[test]
    fn header_index_rejects_foreign_pointers() {
        let mut memory = Aligned([0u8; 256]);
        let region = region(&mut memory.0[..]);
        let data = region.data_ptr(3).as_ptr();

        assert_eq!(
            region.header_index(core::ptr::null_mut()),
            Err(Error::InvalidPointer)
        );
        assert_eq!(
            region.header_index(data.wrapping_add(1)),
            Err(Error::InvalidPointer)
        );
        assert_eq!(
            region.header_index(region.data_ptr(0).as_ptr()),
            Err(Error::InvalidPointer)
        );

        let mut other = 0u64;
        assert_eq!(
            region.header_index(core::ptr::addr_of_mut!(other).cast()),
            Err(Error::InvalidPointer)
        );
    }
}
