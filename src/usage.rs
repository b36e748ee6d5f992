// Copyright © 2024 Andrea Corbellini and contributors
// SPDX-License-Identifier: BSD-3-Clause

use crate::iter::FreeBlocks;
use crate::region::Region;
use crate::region::UNIT_SIZE;

/// Memory usage information.
///
/// This structure is returned by [`SegmentManager::usage`](crate::SegmentManager::usage).
///
/// The fields always satisfy `total == used + free + overhead`, where `overhead` counts the
/// sentinel header plus one header per allocated block.
#[derive(Default, Clone, PartialEq, Eq, Debug)]
pub struct Usage {
    /// Size of the segment after alignment, in bytes.
    ///
    /// This usually matches the size of the buffer given to the manager, but may be slightly lower
    /// if the buffer was not aligned to [`SegmentManager::UNIT_SIZE`](crate::SegmentManager::UNIT_SIZE)
    /// or its length was not a multiple of it.
    pub total: usize,
    /// Payload capacity of all allocated blocks, in bytes.
    ///
    /// Requests are rounded up to whole units, so this may be larger than the sum of the requested
    /// sizes.
    pub used: usize,
    /// Capacity of all free fragments, in bytes, headers included.
    pub free: usize,
    /// Bytes taken by headers that are not part of any free fragment.
    pub overhead: usize,
    /// Number of blocks currently allocated.
    pub objects: usize,
    /// Number of fragments on the free list.
    pub fragments: usize,
    /// Capacity of the largest free fragment, in bytes, header included.
    pub largest_free: usize,
}

impl Usage {
    /// # Safety
    ///
    /// `region` must hold an initialized free list.
    pub(crate) unsafe fn get(region: Region<'_>, objects: usize, allocated_units: usize) -> Self {
        let mut usage = Self {
            total: region.size(),
            used: (allocated_units - objects) * UNIT_SIZE,
            objects,
            ..Self::default()
        };

        for block in FreeBlocks::new(region) {
            let size = block.size * UNIT_SIZE;
            usage.free += size;
            usage.fragments += 1;
            usage.largest_free = usage.largest_free.max(size);
        }

        usage.overhead = usage.total - usage.used - usage.free;
        usage
    }
}

/// A fragment on the free list, as returned by
/// [`SegmentManager::fragments`](crate::SegmentManager::fragments).
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct FreeFragment {
    /// Offset of the fragment header from the start of the segment, in bytes.
    pub offset: usize,
    /// Size of the fragment in bytes, header included.
    pub size: usize,
}
