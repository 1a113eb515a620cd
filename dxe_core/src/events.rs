//! Core Event Services
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::sync::atomic::Ordering;

use r_efi::efi;
use uefi_event::{Event, TimerDelay};
use uefi_sdk::{
    ensure,
    error::{EfiError, Result},
    guid::FmtGuid,
};

use crate::{Core, NotifyFn};

impl Core {
    /// Creates an event.
    ///
    /// This function matches the behavior of EFI_BOOT_SERVICES.CreateEvent() in UEFI spec 2.10 section 7.1.1. The
    /// legacy `EVT_SIGNAL_EXIT_BOOT_SERVICES` and `EVT_SIGNAL_VIRTUAL_ADDRESS_CHANGE` types become members of the
    /// corresponding event groups.
    pub fn create_event(
        &self,
        event_type: u32,
        notify_tpl: efi::Tpl,
        notify_function: Option<NotifyFn>,
    ) -> Result<Event> {
        self.create_event_ex(event_type, notify_tpl, notify_function, None)
    }

    /// Creates an event, optionally in an event group.
    ///
    /// This function matches the behavior of EFI_BOOT_SERVICES.CreateEventEx() in UEFI spec 2.10 section 7.1.2.
    /// Signaling any member of a group signals every member.
    ///
    /// ## Errors
    ///
    /// Returns [`EfiError::InvalidParameter`] for an unsupported event type, a notify event without a notify function
    /// or with an invalid notify TPL, or a legacy group type combined with an explicit group.
    pub fn create_event_ex(
        &self,
        event_type: u32,
        notify_tpl: efi::Tpl,
        notify_function: Option<NotifyFn>,
        event_group: Option<efi::Guid>,
    ) -> Result<Event> {
        let event = self.event_db.lock(self).create_event(event_type, notify_tpl, notify_function, event_group)?;
        log::trace!(
            "Created {:?}: type {:#x}, tpl {:#x}, group {:?}",
            event,
            event_type,
            notify_tpl,
            event_group.as_ref().map(FmtGuid)
        );
        Ok(event)
    }

    /// Closes an event. Pending notifications and protocol notify registrations for it are discarded.
    pub fn close_event(&self, event: Event) -> Result<()> {
        self.event_db.lock(self).close_event(event)?;
        self.protocol_db.lock(self).unregister_protocol_notify_events(&[event]);
        Ok(())
    }

    /// Signals an event.
    ///
    /// This function matches the behavior of EFI_BOOT_SERVICES.SignalEvent() in UEFI spec 2.10 section 7.1.4.
    /// Notifications above the current TPL run before this function returns.
    pub fn signal_event(&self, event: Event) -> Result<()> {
        let status = self.event_db.lock(self).signal_event(event);

        // Dispatch immediately as the reference implementation does as a side effect of its locking.
        let old_tpl = self.raise_tpl(efi::TPL_HIGH_LEVEL);
        self.restore_tpl(old_tpl);

        status
    }

    /// Signals every event in `group`.
    pub fn signal_event_group(&self, group: &efi::Guid) {
        log::debug!("Signaling event group {:?}", FmtGuid(group));
        self.event_db.lock(self).signal_group(*group);

        let old_tpl = self.raise_tpl(efi::TPL_HIGH_LEVEL);
        self.restore_tpl(old_tpl);
    }

    /// Checks whether a non-notify-signal event is signaled, consuming the signal.
    ///
    /// This function matches the behavior of EFI_BOOT_SERVICES.CheckEvent() in UEFI spec 2.10 section 7.1.6. A
    /// notify-wait event that is not signaled has its notify function queued and dispatched before the signal is
    /// sampled again.
    ///
    /// ## Errors
    ///
    /// Returns [`EfiError::InvalidParameter`] for an unknown or notify-signal event.
    /// Returns [`EfiError::NotReady`] if the event is not signaled.
    pub fn check_event(&self, event: Event) -> Result<()> {
        let event_type = self.event_db.lock(self).get_event_type(event)?;
        ensure!(!event_type.is_notify_signal(), EfiError::InvalidParameter);

        if self.event_db.lock(self).read_and_clear_signaled(event)? {
            return Ok(());
        }

        self.event_db.lock(self).queue_event_notify(event)?;

        // raise/restore TPL to allow notifies to occur at the appropriate level.
        let old_tpl = self.raise_tpl(efi::TPL_HIGH_LEVEL);
        self.restore_tpl(old_tpl);

        if self.event_db.lock(self).read_and_clear_signaled(event)? {
            return Ok(());
        }

        Err(EfiError::NotReady)
    }

    /// Waits until one of `events` is signaled and returns its index.
    ///
    /// This function matches the behavior of EFI_BOOT_SERVICES.WaitForEvent() in UEFI spec 2.10 section 7.1.5. The
    /// configured idle-loop event group is signaled after every pass over `events` that finds nothing.
    ///
    /// ## Errors
    ///
    /// Returns [`EfiError::InvalidParameter`] for an empty list, or an event that cannot be waited on.
    /// Returns [`EfiError::Unsupported`] if the current TPL is not TPL_APPLICATION.
    pub fn wait_for_event(&self, events: &[Event]) -> Result<usize> {
        ensure!(!events.is_empty(), EfiError::InvalidParameter);
        ensure!(self.current_tpl() == efi::TPL_APPLICATION, EfiError::Unsupported);

        //spin on the list
        loop {
            for (index, event) in events.iter().enumerate() {
                match self.check_event(*event) {
                    Err(EfiError::NotReady) => (),
                    Ok(()) => return Ok(index),
                    Err(err) => return Err(err),
                }
            }
            self.signal_event_group(&self.config.idle_loop_group);
        }
    }

    /// Arms or cancels a timer event.
    ///
    /// This function matches the behavior of EFI_BOOT_SERVICES.SetTimer() in UEFI spec 2.10 section 7.1.7.
    /// `trigger_time` is relative to now, in 100ns units. A periodic timer with a zero trigger time uses the configured
    /// default period.
    pub fn set_timer(&self, event: Event, timer_type: TimerDelay, trigger_time: u64) -> Result<()> {
        let now = self.system_time.load(Ordering::SeqCst);
        let (trigger_time, period) = match timer_type {
            TimerDelay::Cancel => (None, None),
            TimerDelay::Relative => (Some(now + trigger_time), None),
            TimerDelay::Periodic => {
                let period = if trigger_time == 0 { self.config.default_timer_period } else { trigger_time };
                (Some(now + period), Some(period))
            }
        };

        self.event_db.lock(self).set_timer(event, timer_type, trigger_time, period)
    }

    /// Advances system time by `elapsed` (100ns units) and signals every timer that expired.
    ///
    /// Intended to be called from the platform timer interrupt. Notifications for expired timers run before this
    /// function returns if the current TPL allows.
    pub fn timer_tick(&self, elapsed: u64) {
        let old_tpl = self.raise_tpl(efi::TPL_HIGH_LEVEL);
        let current_time = self.system_time.fetch_add(elapsed, Ordering::SeqCst) + elapsed;
        self.event_db.lock(self).timer_tick(current_time);
        self.restore_tpl(old_tpl); //implicitly dispatches timer notifies if any.
    }

    /// Current system time in 100ns units, as advanced by [`timer_tick`](Core::timer_tick).
    pub fn system_time(&self) -> u64 {
        self.system_time.load(Ordering::SeqCst)
    }

    /// Returns `true` if `event` exists.
    pub fn is_valid_event(&self, event: Event) -> bool {
        self.event_db.lock(self).is_valid(event)
    }
}
