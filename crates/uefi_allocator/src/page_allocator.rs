//! Page free-list allocator.
//!
//! Free memory is kept as a map from run base address to run length in pages. Runs never overlap and are never
//! address-adjacent: every insert merges with its neighbors.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::collections::BTreeMap;
use core::fmt;

use uefi_sdk::{
    ensure,
    error::{EfiError, Result},
};

use crate::UEFI_PAGE_SIZE;

/// Placement policy for [`PageAllocator::allocate_pages`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocateType {
    // Allocate anywhere; equivalent to MaxAddress(u64::MAX).
    AnyPages,
    // Allocate from the highest free run that ends at or below this address (inclusive).
    MaxAddress(u64),
    // Allocate at exactly this address.
    Address(u64),
}

/// Address-ordered free-list page allocator.
#[derive(Default)]
pub struct PageAllocator {
    free_runs: BTreeMap<u64, u64>,
}

impl fmt::Debug for PageAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for (base, pages) in &self.free_runs {
            list.entry(&format_args!("{:#x}..{:#x}", base, base + pages * UEFI_PAGE_SIZE));
        }
        list.finish()
    }
}

fn run_size(pages: u64) -> Result<u64> {
    pages.checked_mul(UEFI_PAGE_SIZE).ok_or(EfiError::OutOfResources)
}

impl PageAllocator {
    /// Creates an allocator with no memory.
    pub const fn new() -> Self {
        Self { free_runs: BTreeMap::new() }
    }

    /// Hands a range of memory to the allocator. The range is merged with the free list like a free.
    pub fn add_memory_region(&mut self, base: u64, pages: u64) -> Result<()> {
        log::debug!(target: "allocations", "Adding memory region {:#x} ({:#x} pages)", base, pages);
        self.insert_free_run(base, pages)
    }

    /// Allocates `pages` contiguous pages and returns the base address.
    ///
    /// ## Errors
    ///
    /// Returns [`EfiError::InvalidParameter`] for a zero-page request or a misaligned fixed address.
    /// Returns [`EfiError::NotFound`] if a fixed address is not entirely free.
    /// Returns [`EfiError::OutOfResources`] if no run below the bound is large enough.
    pub fn allocate_pages(&mut self, allocate_type: AllocateType, pages: u64) -> Result<u64> {
        ensure!(pages != 0, EfiError::InvalidParameter);
        let size = run_size(pages)?;

        log::trace!(target: "allocations", "Page allocation: {:?}", allocate_type);
        log::trace!(target: "allocations", "  Pages: {:#x}", pages);

        let base = match allocate_type {
            AllocateType::Address(address) => {
                ensure!(address % UEFI_PAGE_SIZE == 0, EfiError::InvalidParameter);
                let end = address.checked_add(size).ok_or(EfiError::NotFound)?;
                let (run_base, run_end) = self.run_containing(address).ok_or(EfiError::NotFound)?;
                ensure!(end <= run_end, EfiError::NotFound);
                self.carve(run_base, address, size);
                address
            }
            AllocateType::MaxAddress(max_address) => self.allocate_max_address(max_address, size)?,
            AllocateType::AnyPages => self.allocate_max_address(u64::MAX, size)?,
        };

        log::trace!(target: "allocations", "  Allocated: {:#x}", base);
        Ok(base)
    }

    /// Returns `pages` pages at `base` to the free list and merges them with adjacent free runs.
    ///
    /// ## Errors
    ///
    /// Returns [`EfiError::InvalidParameter`] for a misaligned base, a zero-page count, or a range that overlaps memory
    /// that is already free.
    pub fn free_pages(&mut self, base: u64, pages: u64) -> Result<()> {
        log::trace!(target: "allocations", "Page free: {:#x} ({:#x} pages)", base, pages);
        self.insert_free_run(base, pages)
    }

    /// Total pages on the free list.
    pub fn free_page_count(&self) -> u64 {
        self.free_runs.values().sum()
    }

    /// The free runs as (base, pages) pairs in address order.
    pub fn free_runs(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.free_runs.iter().map(|(base, pages)| (*base, *pages))
    }

    fn run_end(base: u64, pages: u64) -> u64 {
        base.saturating_add(pages.saturating_mul(UEFI_PAGE_SIZE))
    }

    fn run_containing(&self, address: u64) -> Option<(u64, u64)> {
        let (base, pages) = self.free_runs.range(..=address).next_back()?;
        let end = Self::run_end(*base, *pages);
        (address < end).then_some((*base, end))
    }

    fn allocate_max_address(&mut self, max_address: u64, size: u64) -> Result<u64> {
        // highest fitting run wins; a run crossing the bound is clipped to it.
        let bound = max_address.saturating_add(1) & !(UEFI_PAGE_SIZE - 1);
        let mut chosen = None;
        for (base, pages) in self.free_runs.range(..bound).rev() {
            let end = Self::run_end(*base, *pages).min(bound);
            if end - base >= size {
                chosen = Some((*base, end - size));
                break;
            }
        }
        let (run_base, address) = chosen.ok_or(EfiError::OutOfResources)?;
        self.carve(run_base, address, size);
        Ok(address)
    }

    // removes [address, address + size) from the run at run_base, keeping whatever is left on either side.
    fn carve(&mut self, run_base: u64, address: u64, size: u64) {
        let Some(pages) = self.free_runs.remove(&run_base) else {
            log::error!(target: "allocations", "Free run {:#x} vanished during allocation.", run_base);
            return;
        };
        let run_end = Self::run_end(run_base, pages);
        let end = address + size;
        if address > run_base {
            self.free_runs.insert(run_base, (address - run_base) / UEFI_PAGE_SIZE);
        }
        if end < run_end {
            self.free_runs.insert(end, (run_end - end) / UEFI_PAGE_SIZE);
        }
    }

    fn insert_free_run(&mut self, base: u64, pages: u64) -> Result<()> {
        ensure!(pages != 0 && base % UEFI_PAGE_SIZE == 0, EfiError::InvalidParameter);
        let end = base.checked_add(run_size(pages)?).ok_or(EfiError::InvalidParameter)?;

        let previous = self.free_runs.range(..base).next_back().map(|(b, p)| (*b, *p));
        let next = self.free_runs.range(base..).next().map(|(b, p)| (*b, *p));

        if let Some((prev_base, prev_pages)) = previous {
            ensure!(Self::run_end(prev_base, prev_pages) <= base, EfiError::InvalidParameter);
        }
        if let Some((next_base, _)) = next {
            ensure!(end <= next_base, EfiError::InvalidParameter);
        }

        let mut new_base = base;
        let mut new_pages = pages;
        if let Some((prev_base, prev_pages)) = previous {
            if Self::run_end(prev_base, prev_pages) == base {
                self.free_runs.remove(&prev_base);
                new_base = prev_base;
                new_pages += prev_pages;
            }
        }
        if let Some((next_base, next_pages)) = next {
            if next_base == end {
                self.free_runs.remove(&next_base);
                new_pages += next_pages;
            }
        }
        self.free_runs.insert(new_base, new_pages);
        Ok(())
    }
}
