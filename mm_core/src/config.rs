//! MM core configuration.
//!
//! Platform-fixed values the MM core needs before any module runs: the memory it may hand out and how it reacts to
//! dispatch requests.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::vec::Vec;

/// Configuration for an [`MmCore`](crate::MmCore).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MmCoreConfig {
    /// Pool pages are allocated below this address when possible, and anywhere otherwise.
    pub pool_max_address: u64,
    /// Memory handed to the page allocator at startup, as (base, pages) ranges.
    pub memory_regions: Vec<(u64, u64)>,
    /// Whether a dispatch request runs the module dispatcher.
    pub dispatch_on_entry: bool,
}

impl MmCoreConfig {
    /// Adds a (base, pages) range to [`memory_regions`](MmCoreConfig::memory_regions).
    pub fn with_memory_region(mut self, base: u64, pages: u64) -> Self {
        self.memory_regions.push((base, pages));
        self
    }

    /// Overrides [`pool_max_address`](MmCoreConfig::pool_max_address).
    pub fn with_pool_max_address(mut self, max_address: u64) -> Self {
        self.pool_max_address = max_address;
        self
    }

    /// Overrides [`dispatch_on_entry`](MmCoreConfig::dispatch_on_entry).
    pub fn with_dispatch_on_entry(mut self, dispatch: bool) -> Self {
        self.dispatch_on_entry = dispatch;
        self
    }
}

impl Default for MmCoreConfig {
    fn default() -> Self {
        MmCoreConfig { pool_max_address: u64::MAX, memory_regions: Vec::new(), dispatch_on_entry: true }
    }
}
