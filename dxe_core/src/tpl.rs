//! Task Priority Level (TPL) Scheduler
//!
//! Raising the TPL defers notifications at or below the new level; restoring it runs every notification queued above
//! the restored level, highest TPL first and FIFO within a TPL. Restoring is the only place deferred work runs.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::{cell::Cell, sync::atomic::Ordering};

use r_efi::efi;
use tpl_lock::TplControl;

use crate::Core;

/// Masks and unmasks asynchronous interrupts on behalf of the scheduler.
#[cfg_attr(test, mockall::automock)]
pub trait InterruptControl {
    /// Unmask interrupts.
    fn enable_interrupts(&self);
    /// Mask interrupts.
    fn disable_interrupts(&self);
}

/// Software-only interrupt state, for environments where the core does not own the interrupt controller (hosted
/// tests, or MM where interrupts are never delivered to the core).
#[derive(Debug)]
pub struct InterruptState {
    enabled: Cell<bool>,
}

impl InterruptState {
    /// Creates a state with interrupts enabled.
    pub const fn new() -> Self {
        Self { enabled: Cell::new(true) }
    }

    /// Whether interrupts are currently unmasked.
    pub fn interrupts_enabled(&self) -> bool {
        self.enabled.get()
    }
}

impl Default for InterruptState {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptControl for InterruptState {
    fn enable_interrupts(&self) {
        self.enabled.set(true);
    }

    fn disable_interrupts(&self) {
        self.enabled.set(false);
    }
}

impl Core {
    /// Returns the current TPL.
    pub fn current_tpl(&self) -> efi::Tpl {
        self.current_tpl.load(Ordering::SeqCst)
    }

    /// Raises the TPL to `new_tpl` and returns the previous TPL.
    ///
    /// This function matches the behavior of EFI_BOOT_SERVICES.RaiseTPL() in UEFI spec 2.10 section 7.1.8. Entering
    /// TPL_HIGH_LEVEL masks interrupts.
    ///
    /// ## Panics
    ///
    /// Panics if `new_tpl` is above TPL_HIGH_LEVEL or below the current TPL.
    pub fn raise_tpl(&self, new_tpl: efi::Tpl) -> efi::Tpl {
        assert!(new_tpl <= efi::TPL_HIGH_LEVEL, "Invalid attempt to raise TPL above TPL_HIGH_LEVEL");

        let prev_tpl = self.current_tpl.fetch_max(new_tpl, Ordering::SeqCst);

        assert!(
            new_tpl >= prev_tpl,
            "Invalid attempt to raise TPL to lower value. New TPL: {:#x?}, Prev TPL: {:#x?}",
            new_tpl,
            prev_tpl
        );

        if (new_tpl == efi::TPL_HIGH_LEVEL) && (prev_tpl < efi::TPL_HIGH_LEVEL) {
            self.interrupts.disable_interrupts();
        }
        prev_tpl
    }

    /// Restores the TPL to `new_tpl`, running every notification queued above it.
    ///
    /// This function matches the behavior of EFI_BOOT_SERVICES.RestoreTPL() in UEFI spec 2.10 section 7.1.8. Each
    /// notification runs with the current TPL set to its notify TPL and with no core lock held, so it may call any
    /// core service. Notifications queued while draining are picked up by the same loop.
    ///
    /// ## Panics
    ///
    /// Panics if `new_tpl` is above the current TPL.
    pub fn restore_tpl(&self, new_tpl: efi::Tpl) {
        let prev_tpl = self.current_tpl.fetch_min(new_tpl, Ordering::SeqCst);

        assert!(
            new_tpl <= prev_tpl,
            "Invalid attempt to restore TPL to higher value. New TPL: {:#x?}, Prev TPL: {:#x?}",
            new_tpl,
            prev_tpl
        );

        if new_tpl < prev_tpl {
            loop {
                // Taking the event lock to pop a notification restores the TPL when the lock is released, which lands
                // back here. The flag turns that inner restore into a plain TPL store.
                let notification = match self.event_notifies_in_progress.compare_exchange(
                    false,
                    true,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let result = self.event_db.lock(self).consume_next_event_notify(new_tpl);
                        self.event_notifies_in_progress.store(false, Ordering::Release);
                        result
                    }
                    _ => break, /* reentrant restore_tpl case */
                };

                let Some(notification) = notification else {
                    break; /* no pending events */
                };

                if notification.notify_tpl < efi::TPL_HIGH_LEVEL {
                    self.interrupts.enable_interrupts();
                } else {
                    self.interrupts.disable_interrupts();
                }
                self.current_tpl.store(notification.notify_tpl, Ordering::SeqCst);
                log::trace!("Dispatching notify for {:?} at TPL {:#x}", notification.event, notification.notify_tpl);
                (notification.notify_function)(self, notification.event);
            }
        }

        if new_tpl < efi::TPL_HIGH_LEVEL {
            self.interrupts.enable_interrupts();
        }
        self.current_tpl.store(new_tpl, Ordering::SeqCst);
    }
}

impl TplControl for Core {
    fn raise_tpl(&self, new_tpl: efi::Tpl) -> efi::Tpl {
        Core::raise_tpl(self, new_tpl)
    }

    fn restore_tpl(&self, old_tpl: efi::Tpl) {
        Core::restore_tpl(self, old_tpl)
    }
}
