// Copyright © 2024 Andrea Corbellini and contributors
// SPDX-License-Identifier: BSD-3-Clause

use thiserror::Error;

/// Errors reported by [`SegmentManager`](crate::SegmentManager) and
/// [`SegmentAllocator`](crate::SegmentAllocator).
///
/// Only [`Error::OutOfMemory`] is part of normal operation. [`Error::InvalidPointer`] and
/// [`Error::DoubleFree`] mean that the caller handed back something it should not have, and the
/// segment is at risk of corruption; see [`Error::is_fatal`].
#[derive(Error, Copy, Clone, PartialEq, Eq, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The segment cannot hold the sentinel header plus one minimal fragment.
    #[error("segment of {size} bytes is too small to be used (at least {min} bytes are needed)")]
    SegmentTooSmall {
        /// Size of the segment that was supplied, in bytes.
        size: usize,
        /// Minimum usable segment size, in bytes.
        min: usize,
    },

    /// No free fragment is large enough for the request, or an owned segment could not be
    /// allocated.
    #[error("no free fragment large enough was found ({requested} bytes were requested)")]
    OutOfMemory {
        /// Number of bytes that were requested.
        requested: usize,
    },

    /// The pointer is null, lies outside the segment, or does not point to an allocated block.
    #[error("invalid pointer: this memory was not allocated from the segment")]
    InvalidPointer,

    /// The block is already on the free list.
    #[error("memory block is already freed")]
    DoubleFree,

    /// An allocator was asked for zero elements.
    #[error("cannot allocate zero elements")]
    EmptyRequest,

    /// An allocator is not bound to any segment manager.
    #[error("allocator is not bound to a segment manager")]
    Unbound,

    /// The requested size in bytes does not fit in a `usize`.
    #[error("requested capacity overflows `usize`")]
    CapacityOverflow,

    /// The requested alignment is stricter than the alignment of a segment unit.
    #[error("alignment of {align} bytes is not supported")]
    UnsupportedAlignment {
        /// The alignment that was requested, in bytes.
        align: usize,
    },
}

impl Error {
    /// Returns `true` for errors that indicate memory corruption risk: freeing a pointer that was
    /// never allocated, or freeing the same block twice.
    #[inline]
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidPointer | Self::DoubleFree)
    }
}
