//! Size-class pool allocator.
//!
//! Requests up to [`MAX_POOL_SIZE`] (including the pool header) are rounded up to a power of two no smaller than
//! [`MIN_POOL_SIZE`] and served from per-class free lists. An empty class splits a block from the next larger class in
//! half; the largest class is refilled one page at a time. Freed blocks go back to their own class and are not merged.
//! Larger requests are sent to the page allocator as whole pages.
//!
//! Block headers are kept in a side table keyed by block address rather than in the block itself.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::{collections::BTreeMap, vec::Vec};

use uefi_sdk::{
    ensure,
    error::{EfiError, Result},
};

use crate::{
    page_allocator::{AllocateType, PageAllocator},
    uefi_size_to_pages, UEFI_PAGE_SIZE,
};

/// log2 of the smallest pool block.
pub const MIN_POOL_SHIFT: u32 = 6;
/// log2 of the largest pool block.
pub const MAX_POOL_SHIFT: u32 = 11;
/// Smallest pool block in bytes.
pub const MIN_POOL_SIZE: u64 = 1 << MIN_POOL_SHIFT;
/// Largest pool block in bytes.
pub const MAX_POOL_SIZE: u64 = 1 << MAX_POOL_SHIFT;
/// Bytes reserved at the start of every pool block.
pub const POOL_HEADER_SIZE: u64 = 16;

const MAX_POOL_INDEX: usize = (MAX_POOL_SHIFT - MIN_POOL_SHIFT) as usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PoolBlock {
    SizeClass(usize),
    Pages(u64),
}

impl PoolBlock {
    fn size(&self) -> u64 {
        match self {
            PoolBlock::SizeClass(index) => MIN_POOL_SIZE << index,
            PoolBlock::Pages(pages) => pages * UEFI_PAGE_SIZE,
        }
    }
}

/// Pool allocator layered on a [`PageAllocator`].
#[derive(Debug)]
pub struct PoolAllocator {
    free_lists: [Vec<u64>; MAX_POOL_INDEX + 1],
    in_use: BTreeMap<u64, PoolBlock>,
    max_address: u64,
}

impl Default for PoolAllocator {
    fn default() -> Self {
        Self::new(u64::MAX)
    }
}

impl PoolAllocator {
    /// Creates an empty pool. Pages for the pool are requested below `max_address` first, then anywhere.
    pub fn new(max_address: u64) -> Self {
        Self { free_lists: Default::default(), in_use: BTreeMap::new(), max_address }
    }

    /// Allocates `size` bytes and returns the address of the usable buffer.
    ///
    /// ## Errors
    ///
    /// Returns [`EfiError::InvalidParameter`] for a zero-size request.
    /// Returns [`EfiError::OutOfResources`] if the page allocator cannot supply backing pages.
    pub fn allocate_pool(&mut self, pages: &mut PageAllocator, size: u64) -> Result<u64> {
        ensure!(size != 0, EfiError::InvalidParameter);
        let total = size.checked_add(POOL_HEADER_SIZE).ok_or(EfiError::OutOfResources)?;

        let (block, kind) = if total > MAX_POOL_SIZE {
            let page_count = uefi_size_to_pages(total);
            (self.allocate_backing_pages(pages, page_count)?, PoolBlock::Pages(page_count))
        } else {
            let index = Self::size_class(total);
            (self.allocate_by_index(pages, index)?, PoolBlock::SizeClass(index))
        };

        log::trace!(target: "allocations", "Pool allocation of {:#x} bytes at {:#x} ({:?})", size, block, kind);
        self.in_use.insert(block, kind);
        Ok(block + POOL_HEADER_SIZE)
    }

    /// Frees a buffer returned by [`allocate_pool`](PoolAllocator::allocate_pool).
    ///
    /// ## Errors
    ///
    /// Returns [`EfiError::InvalidParameter`] if `buffer` is not an outstanding pool allocation.
    pub fn free_pool(&mut self, pages: &mut PageAllocator, buffer: u64) -> Result<()> {
        let block = buffer.checked_sub(POOL_HEADER_SIZE).ok_or(EfiError::InvalidParameter)?;
        let kind = self.in_use.remove(&block).ok_or(EfiError::InvalidParameter)?;
        log::trace!(target: "allocations", "Pool free at {:#x} ({:?})", block, kind);
        match kind {
            PoolBlock::SizeClass(index) => self.free_lists[index].push(block),
            PoolBlock::Pages(page_count) => {
                if let Err(err) = pages.free_pages(block, page_count) {
                    // put it back so the caller sees an unchanged pool.
                    self.in_use.insert(block, kind);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Bytes currently handed out, including headers and rounding.
    pub fn bytes_in_use(&self) -> u64 {
        self.in_use.values().map(PoolBlock::size).sum()
    }

    /// Number of blocks waiting on the free list for each size class, smallest class first.
    pub fn free_block_counts(&self) -> [usize; MAX_POOL_INDEX + 1] {
        core::array::from_fn(|index| self.free_lists[index].len())
    }

    fn size_class(total: u64) -> usize {
        let shift = total.next_power_of_two().trailing_zeros().max(MIN_POOL_SHIFT);
        (shift - MIN_POOL_SHIFT) as usize
    }

    fn allocate_by_index(&mut self, pages: &mut PageAllocator, index: usize) -> Result<u64> {
        if let Some(block) = self.free_lists[index].pop() {
            return Ok(block);
        }

        let block_size = MIN_POOL_SIZE << index;
        let block = if index == MAX_POOL_INDEX {
            self.allocate_backing_pages(pages, uefi_size_to_pages(block_size << 1))?
        } else {
            self.allocate_by_index(pages, index + 1)?
        };
        // the upper half is kept for the next request of this class.
        self.free_lists[index].push(block + block_size);
        Ok(block)
    }

    fn allocate_backing_pages(&mut self, pages: &mut PageAllocator, page_count: u64) -> Result<u64> {
        match pages.allocate_pages(AllocateType::MaxAddress(self.max_address), page_count) {
            Ok(address) => Ok(address),
            Err(EfiError::OutOfResources) if self.max_address != u64::MAX => {
                log::trace!(target: "allocations", "Pool falling back to any address for {:#x} pages", page_count);
                pages.allocate_pages(AllocateType::AnyPages, page_count)
            }
            Err(err) => Err(err),
        }
    }
}
