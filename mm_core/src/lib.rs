//! Management Mode (MM) Core
//!
//! This crate provides [`MmCore`], the core of a standalone MM environment. It owns:
//!
//! - a [`Core`] holding the MM handle/protocol database. It is separate from any DXE `Core`; MM modules publish
//!   protocols to each other through it.
//! - the MM module dispatcher ([`dispatcher`]), which loads modules in dependency order through an [`ImageLoader`].
//! - the MMI handler database ([`mmi`]) and the [`entry_point`](MmCore::entry_point) every MMI goes through.
//! - page and pool memory services over the MM memory regions ([`memory`]).
//!
//! ## Examples
//!
//! ```ignore
//! use mm_core::{config::MmCoreConfig, entry::CommunicateBuffer, MmCore};
//!
//! let config = MmCoreConfig::default().with_memory_region(mm_base, mm_pages);
//! let mm = MmCore::new(config, Box::new(PeLoader))?;
//! for module in firmware_volume_modules() {
//!     mm.add_module(module);
//! }
//! mm.dispatch()?;
//!
//! // on every MMI:
//! let mut comm = CommunicateBuffer::from_bytes(shared_buffer)?;
//! mm.entry_point(Some(&mut comm))?;
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

pub mod config;
pub mod dispatcher;
pub mod entry;
pub mod memory;
pub mod mmi;

#[cfg(test)]
mod test_support;

use alloc::{boxed::Box, vec::Vec};
use core::{
    cell::{Cell, RefCell},
    fmt,
};

use dxe_core::{config::CoreConfig, Core};
use uefi_sdk::error::Result;

use crate::{
    config::MmCoreConfig,
    dispatcher::{Dispatcher, ImageLoader},
    entry::MmPhase,
    memory::MmMemory,
    mmi::{DispatchHandle, MmiDatabase},
};

/// The MM core context.
pub struct MmCore {
    config: MmCoreConfig,
    core: Core,
    loader: Box<dyn ImageLoader>,
    dispatcher: RefCell<Dispatcher>,
    mmi: RefCell<MmiDatabase>,
    memory: RefCell<MmMemory>,
    phase: Cell<MmPhase>,
    in_mm: Cell<bool>,
    entry_point_registered: Cell<bool>,
    unregister_on_lock: RefCell<Vec<DispatchHandle>>,
}

impl MmCore {
    /// Creates an MM core, hands it the configured memory regions and registers its own MMI handlers.
    pub fn new(config: MmCoreConfig, loader: Box<dyn ImageLoader>) -> Result<Self> {
        let mm = Self {
            core: Core::new(CoreConfig::default()),
            loader,
            dispatcher: RefCell::new(Dispatcher::default()),
            mmi: RefCell::new(MmiDatabase::default()),
            memory: RefCell::new(MmMemory::new(config.pool_max_address)),
            phase: Cell::new(MmPhase::Boot),
            in_mm: Cell::new(false),
            entry_point_registered: Cell::new(false),
            unregister_on_lock: RefCell::new(Vec::new()),
            config,
        };

        for &(base, pages) in mm.config.memory_regions.iter() {
            mm.add_memory_region(base, pages)?;
        }
        mm.register_core_handlers()?;
        Ok(mm)
    }

    /// The handle/protocol database and event services shared by MM modules.
    pub fn core(&self) -> &Core {
        &self.core
    }

    /// The configuration this core was created with.
    pub fn config(&self) -> &MmCoreConfig {
        &self.config
    }
}

impl fmt::Debug for MmCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MmCore")
            .field("config", &self.config)
            .field("phase", &self.phase.get())
            .field("dispatcher", &self.dispatcher)
            .field("mmi", &self.mmi)
            .field("memory", &self.memory)
            .finish()
    }
}
