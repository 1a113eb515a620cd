//! UEFI Rust Allocator Lib
//!
//! Provides the page and pool allocators used to service MM memory requests.
//!
//! [`PageAllocator`](page_allocator::PageAllocator) tracks free physical memory as an address-ordered set of page
//! runs. Allocation picks the highest-addressed run that satisfies the request; free inserts the run back and merges
//! it with both neighbors immediately, so the free set never holds two adjacent runs.
//!
//! [`PoolAllocator`](pool_allocator::PoolAllocator) serves small requests from power-of-two size classes carved out
//! of pages, and forwards large requests to the page allocator directly.
//!
//! Neither allocator touches the memory it hands out; both deal only in addresses. MM execution is serialized, so
//! neither is locked.
//!
//! ## Examples and Usage
//!
//! ```
//! use uefi_allocator::{page_allocator::{AllocateType, PageAllocator}, pool_allocator::PoolAllocator};
//!
//! let mut pages = PageAllocator::new();
//! pages.add_memory_region(0x100000, 0x40).unwrap();
//!
//! let base = pages.allocate_pages(AllocateType::AnyPages, 4).unwrap();
//! assert_eq!(base, 0x13c000);
//!
//! let mut pool = PoolAllocator::new(u64::MAX);
//! let buffer = pool.allocate_pool(&mut pages, 0x20).unwrap();
//! pool.free_pool(&mut pages, buffer).unwrap();
//! pages.free_pages(base, 4).unwrap();
//! ```
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod page_allocator;
pub mod pool_allocator;

/// Size of a page in bytes.
pub const UEFI_PAGE_SIZE: u64 = 0x1000;
/// log2 of [`UEFI_PAGE_SIZE`].
pub const UEFI_PAGE_SHIFT: u32 = 12;

/// Converts a byte count into the number of pages needed to hold it.
pub const fn uefi_size_to_pages(size: u64) -> u64 {
    (size >> UEFI_PAGE_SHIFT) + if size & (UEFI_PAGE_SIZE - 1) != 0 { 1 } else { 0 }
}

/// Snapshot of memory usage across the page and pool allocators.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Pages currently on the free list.
    pub free_pages: u64,
    /// Bytes handed out by the pool allocator, including pool headers and size-class rounding.
    pub pool_bytes_in_use: u64,
}

impl MemoryStats {
    /// Collects usage from the given allocators.
    pub fn collect(pages: &page_allocator::PageAllocator, pool: &pool_allocator::PoolAllocator) -> Self {
        MemoryStats { free_pages: pages.free_page_count(), pool_bytes_in_use: pool.bytes_in_use() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_to_pages_rounds_up() {
        assert_eq!(uefi_size_to_pages(0), 0);
        assert_eq!(uefi_size_to_pages(1), 1);
        assert_eq!(uefi_size_to_pages(UEFI_PAGE_SIZE), 1);
        assert_eq!(uefi_size_to_pages(UEFI_PAGE_SIZE + 1), 2);
    }
}
