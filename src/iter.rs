// Copyright © 2024 Andrea Corbellini and contributors
// SPDX-License-Identifier: BSD-3-Clause

use crate::block::Block;
use crate::block::SENTINEL;
use crate::region::Region;

/// Walks the circular free list once, starting after the sentinel and stopping when the list
/// wraps back to it.
#[derive(Clone, Debug)]
pub(crate) struct FreeBlocks<'a> {
    region: Region<'a>,
    next: usize,
}

impl<'a> FreeBlocks<'a> {
    /// # Safety
    ///
    /// `region` must hold an initialized free list.
    pub(crate) unsafe fn new(region: Region<'a>) -> Self {
        let sentinel = Block::read(region, SENTINEL);
        Self {
            region,
            next: sentinel.next,
        }
    }
}

impl<'a> Iterator for FreeBlocks<'a> {
    type Item = Block<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next == SENTINEL {
            return None;
        }
        // SAFETY: every link on the free list points to a header inside the region.
        let block = unsafe { Block::read(self.region, self.next) };
        debug_assert!(
            block.next == SENTINEL || block.next > block.index(),
            "free list is not sorted by address"
        );
        self.next = block.next;
        Some(block)
    }
}
