//! UEFI Core Services
//!
//! This crate provides [`Core`], a self-contained instance of the UEFI core services: the task priority level (TPL)
//! scheduler, event services, the handle/protocol database services and the driver connection engine.
//!
//! A `Core` owns all of its state. Nothing is stored in globals, so independent instances (for example, the DXE and
//! MM cores) never share handles, protocols or events. A `Core` is single-threaded; the only "concurrency" is the TPL
//! mechanism: notification functions queued by signaled events run when the TPL is restored below their notify TPL.
//!
//! ## Examples
//!
//! ```
//! use std::{cell::Cell, rc::Rc};
//! use r_efi::efi;
//! use dxe_core::{config::CoreConfig, Core, NotifyFn};
//!
//! let core = Core::new(CoreConfig::default());
//! let count = Rc::new(Cell::new(0));
//! let counter = count.clone();
//! let notify: NotifyFn = Rc::new(move |_core, _event| counter.set(counter.get() + 1));
//!
//! let event = core.create_event(efi::EVT_NOTIFY_SIGNAL, efi::TPL_NOTIFY, Some(notify)).unwrap();
//! let old_tpl = core.raise_tpl(efi::TPL_CALLBACK);
//! core.signal_event(event).unwrap();
//! assert_eq!(count.get(), 1); // TPL_NOTIFY is above TPL_CALLBACK, so the notify ran right away.
//! core.restore_tpl(old_tpl);
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
pub mod driver_services;
pub mod events;
pub mod protocols;
pub mod tpl;

#[cfg(test)]
mod test_support;

use alloc::{boxed::Box, rc::Rc};
use core::{
    cell::RefCell,
    fmt,
    sync::atomic::{AtomicBool, AtomicU64, AtomicUsize},
};

use r_efi::efi;
use tpl_lock::TplMutex;
use uefi_event::EventDb;
use uefi_protocol_db::ProtocolDb;

use crate::{config::CoreConfig, driver_services::ModuleDispatch, tpl::InterruptControl};

pub use uefi_event::{Event, EventType, TimerDelay};
pub use uefi_protocol_db::{Handle, Interface, OpenProtocolInformation, Registration, SearchType, DXE_CORE_HANDLE};

/// An event notification function. The closure captures whatever context it needs.
pub type NotifyFn = Rc<dyn Fn(&Core, Event)>;

/// The core services context.
pub struct Core {
    config: CoreConfig,
    current_tpl: AtomicUsize,
    event_notifies_in_progress: AtomicBool,
    system_time: AtomicU64,
    interrupts: Box<dyn InterruptControl>,
    protocol_db: TplMutex<ProtocolDb>,
    event_db: TplMutex<EventDb<NotifyFn>>,
    module_dispatch: RefCell<Option<Rc<dyn ModuleDispatch>>>,
}

impl Core {
    /// Creates a core with the given configuration and a software-only interrupt state.
    pub fn new(config: CoreConfig) -> Self {
        Self::with_interrupt_control(config, Box::new(tpl::InterruptState::new()))
    }

    /// Creates a core that masks and unmasks interrupts through `interrupts` when crossing TPL_HIGH_LEVEL.
    pub fn with_interrupt_control(config: CoreConfig, interrupts: Box<dyn InterruptControl>) -> Self {
        Self {
            config,
            current_tpl: AtomicUsize::new(efi::TPL_APPLICATION),
            event_notifies_in_progress: AtomicBool::new(false),
            system_time: AtomicU64::new(0),
            interrupts,
            protocol_db: TplMutex::new(efi::TPL_NOTIFY, ProtocolDb::new(), "ProtocolLock"),
            event_db: TplMutex::new(efi::TPL_HIGH_LEVEL, EventDb::new(), "EventLock"),
            module_dispatch: RefCell::new(None),
        }
    }

    /// The configuration this core was created with.
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }
}

impl fmt::Debug for Core {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Core")
            .field("config", &self.config)
            .field("current_tpl", &self.current_tpl())
            .field("protocol_db", &self.protocol_db)
            .field("event_db", &self.event_db)
            .finish()
    }
}
