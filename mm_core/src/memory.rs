//! MM Memory Services
//!
//! Page and pool allocation for MM modules, backed by the allocators in [`uefi_allocator`]. MM execution is
//! serialized by the entry point, so the allocators sit behind a plain `RefCell` rather than a TPL lock.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use uefi_allocator::{
    page_allocator::{AllocateType, PageAllocator},
    pool_allocator::PoolAllocator,
    MemoryStats,
};
use uefi_sdk::error::Result;

use crate::MmCore;

#[derive(Debug)]
pub(crate) struct MmMemory {
    pages: PageAllocator,
    pool: PoolAllocator,
}

impl MmMemory {
    pub(crate) fn new(pool_max_address: u64) -> Self {
        MmMemory { pages: PageAllocator::new(), pool: PoolAllocator::new(pool_max_address) }
    }
}

impl MmCore {
    /// Allocates `pages` contiguous pages.
    ///
    /// This function matches the behavior of EFI_MM_SYSTEM_TABLE.MmAllocatePages() in PI spec 1.8 volume 4 section
    /// 3.2.2.
    pub fn allocate_pages(&self, allocate_type: AllocateType, pages: u64) -> Result<u64> {
        self.memory.borrow_mut().pages.allocate_pages(allocate_type, pages)
    }

    /// Frees pages returned by [`allocate_pages`](MmCore::allocate_pages).
    pub fn free_pages(&self, base: u64, pages: u64) -> Result<()> {
        self.memory.borrow_mut().pages.free_pages(base, pages)
    }

    /// Allocates `size` bytes of pool.
    ///
    /// This function matches the behavior of EFI_MM_SYSTEM_TABLE.MmAllocatePool() in PI spec 1.8 volume 4 section
    /// 3.2.2.
    pub fn allocate_pool(&self, size: u64) -> Result<u64> {
        let mut memory = self.memory.borrow_mut();
        let MmMemory { pages, pool } = &mut *memory;
        pool.allocate_pool(pages, size)
    }

    /// Frees pool returned by [`allocate_pool`](MmCore::allocate_pool).
    pub fn free_pool(&self, buffer: u64) -> Result<()> {
        let mut memory = self.memory.borrow_mut();
        let MmMemory { pages, pool } = &mut *memory;
        pool.free_pool(pages, buffer)
    }

    /// Hands a range of memory to the MM page allocator.
    pub fn add_memory_region(&self, base: u64, pages: u64) -> Result<()> {
        log::info!("Adding MM memory region {:#x} ({:#x} pages)", base, pages);
        self.memory.borrow_mut().pages.add_memory_region(base, pages)
    }

    /// Current page and pool usage.
    pub fn memory_stats(&self) -> MemoryStats {
        let memory = self.memory.borrow();
        MemoryStats::collect(&memory.pages, &memory.pool)
    }
}
