//! UEFI Event Database support
//!
//! This crate provides an UEFI event database implementation. The database tracks event records, event groups, timer
//! state and the per-TPL queues of pending notifications. It performs no locking and never invokes a notification
//! itself: the owner guards it with a TPL lock and drains [`EventDb::consume_next_event_notify`] when the TPL is
//! restored.
//!
//! The notification payload is generic (`N`) so that the owner decides what a "notify function" is; the database only
//! clones it out when the notification is consumed.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

use alloc::{
    collections::{BTreeMap, VecDeque},
    vec::Vec,
};
use core::{fmt, num::NonZeroUsize};

use r_efi::efi;
use uefi_sdk::{
    error::{EfiError, Result},
    guid::{self, FmtGuid},
};

/// Opaque identity of an event in an [`EventDb`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Event(NonZeroUsize);

impl Event {
    /// Reconstructs an event from its index. Returns `None` for zero.
    pub fn from_index(index: usize) -> Option<Self> {
        NonZeroUsize::new(index).map(Event)
    }

    /// The index of this event in the database that created it.
    pub fn index(&self) -> usize {
        self.0.get()
    }
}

/// Defines the supported UEFI event types
#[repr(u32)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum EventType {
    /// 0x80000200 Timer event with a notification function that is queued when the event is signaled.
    TimerNotify = efi::EVT_TIMER | efi::EVT_NOTIFY_SIGNAL,
    /// 0x80000000 Timer event without a notification function. It can be checked with CheckEvent() or WaitForEvent().
    Timer = efi::EVT_TIMER,
    /// 0x00000100 Generic event with a notification function that can be waited on with CheckEvent() or
    /// WaitForEvent().
    NotifyWait = efi::EVT_NOTIFY_WAIT,
    /// 0x00000200 Generic event with a notification function that is queued when the event is signaled.
    NotifySignal = efi::EVT_NOTIFY_SIGNAL,
    /// 0x00000201 ExitBootServices event. Translated to the exit boot services event group on creation.
    ExitBootServices = efi::EVT_SIGNAL_EXIT_BOOT_SERVICES,
    /// 0x60000202 SetVirtualAddressMap event. Translated to the virtual address change event group on creation.
    SetVirtualAddress = efi::EVT_SIGNAL_VIRTUAL_ADDRESS_CHANGE,
    /// 0x00000000 Generic event without a notification function.
    Generic = 0x00000000,
    /// 0x80000100 Timer event with a notification function that can be waited on with CheckEvent() or
    /// WaitForEvent().
    TimerNotifyWait = efi::EVT_TIMER | efi::EVT_NOTIFY_WAIT,
}

impl TryFrom<u32> for EventType {
    type Error = EfiError;
    fn try_from(value: u32) -> Result<Self> {
        match value {
            x if x == EventType::TimerNotify as u32 => Ok(EventType::TimerNotify),
            x if x == EventType::Timer as u32 => Ok(EventType::Timer),
            x if x == EventType::NotifyWait as u32 => Ok(EventType::NotifyWait),
            x if x == EventType::NotifySignal as u32 => Ok(EventType::NotifySignal),
            // the legacy group types must be translated to their event group before they get here.
            x if x == EventType::ExitBootServices as u32 => Err(EfiError::InvalidParameter),
            x if x == EventType::SetVirtualAddress as u32 => Err(EfiError::InvalidParameter),
            x if x == EventType::Generic as u32 => Ok(EventType::Generic),
            x if x == EventType::TimerNotifyWait as u32 => Ok(EventType::TimerNotifyWait),
            _ => Err(EfiError::InvalidParameter),
        }
    }
}

impl EventType {
    /// indicates whether this EventType is NOTIFY_SIGNAL
    pub fn is_notify_signal(&self) -> bool {
        (*self as u32) & efi::EVT_NOTIFY_SIGNAL != 0
    }

    /// indicates whether this EventType is NOTIFY_WAIT
    pub fn is_notify_wait(&self) -> bool {
        (*self as u32) & efi::EVT_NOTIFY_WAIT != 0
    }

    /// indicates whether this EventType is TIMER
    pub fn is_timer(&self) -> bool {
        (*self as u32) & efi::EVT_TIMER != 0
    }

    fn is_notifiable(&self) -> bool {
        self.is_notify_signal() || self.is_notify_wait()
    }
}

/// Defines supported timer delay types.
#[repr(u32)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TimerDelay {
    /// Cancels a pending timer
    Cancel,
    /// Creates a periodic timer
    Periodic,
    /// Creates a one-shot relative timer
    Relative,
}

impl TryFrom<u32> for TimerDelay {
    type Error = EfiError;
    fn try_from(value: u32) -> Result<Self> {
        match value {
            x if x == TimerDelay::Cancel as u32 => Ok(TimerDelay::Cancel),
            x if x == TimerDelay::Periodic as u32 => Ok(TimerDelay::Periodic),
            x if x == TimerDelay::Relative as u32 => Ok(TimerDelay::Relative),
            _ => Err(EfiError::InvalidParameter),
        }
    }
}

/// A notification ready to be dispatched.
#[derive(Clone)]
pub struct EventNotification<N> {
    /// event handle
    pub event: Event,
    /// TPL that notification should run at
    pub notify_tpl: efi::Tpl,
    /// notification function
    pub notify_function: N,
}

impl<N> fmt::Debug for EventNotification<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventNotification").field("event", &self.event).field("notify_tpl", &self.notify_tpl).finish()
    }
}

struct EventRecord<N> {
    event_type: EventType,
    event_group: Option<efi::Guid>,

    signaled: bool,
    queued: bool,

    //Only used for NOTIFY events.
    notify_tpl: efi::Tpl,
    notify_function: Option<N>,

    //Only used for TIMER events.
    trigger_time: Option<u64>,
    period: Option<u64>,
}

impl<N> fmt::Debug for EventRecord<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRecord")
            .field("event_type", &self.event_type)
            .field("event_group", &self.event_group.as_ref().map(FmtGuid))
            .field("signaled", &self.signaled)
            .field("queued", &self.queued)
            .field("notify_tpl", &self.notify_tpl)
            .field("trigger_time", &self.trigger_time)
            .field("period", &self.period)
            .finish()
    }
}

impl<N> EventRecord<N> {
    fn new(
        event_type: u32,
        notify_tpl: efi::Tpl,
        notify_function: Option<N>,
        event_group: Option<efi::Guid>,
    ) -> Result<Self> {
        let event_type: EventType = event_type.try_into()?;

        let notify_function = if event_type.is_notifiable() {
            if notify_function.is_none() {
                return Err(EfiError::InvalidParameter);
            }
            if !((efi::TPL_APPLICATION + 1)..=efi::TPL_HIGH_LEVEL).contains(&notify_tpl) {
                return Err(EfiError::InvalidParameter);
            }
            notify_function
        } else {
            None
        };

        Ok(EventRecord {
            event_type,
            event_group,
            signaled: false,
            queued: false,
            notify_tpl,
            notify_function,
            trigger_time: None,
            period: None,
        })
    }
}

/// The event database.
///
/// Pending notifications are held in one FIFO per TPL; [`consume_next_event_notify`](EventDb::consume_next_event_notify)
/// always drains the highest pending TPL first.
pub struct EventDb<N> {
    events: BTreeMap<Event, EventRecord<N>>,
    next_event_id: NonZeroUsize,
    pending_notifies: BTreeMap<efi::Tpl, VecDeque<Event>>,
}

impl<N> Default for EventDb<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N> fmt::Debug for EventDb<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDb").field("events", &self.events).field("pending_notifies", &self.pending_notifies).finish()
    }
}

impl<N> EventDb<N> {
    /// Creates a new, empty event database.
    pub const fn new() -> Self {
        EventDb { events: BTreeMap::new(), next_event_id: NonZeroUsize::MIN, pending_notifies: BTreeMap::new() }
    }
}

impl<N: Clone> EventDb<N> {
    /// Creates a new event in the event database
    ///
    /// This function closely matches the semantics of the EFI_BOOT_SERVICES.CreateEventEx() API in UEFI spec 2.10
    /// section 7.1.2. The legacy `EVT_SIGNAL_EXIT_BOOT_SERVICES` and `EVT_SIGNAL_VIRTUAL_ADDRESS_CHANGE` types are
    /// translated into notify-signal members of the corresponding event group; combining them with an explicit group
    /// is an error.
    ///
    /// ## Errors
    ///
    /// Returns [`EfiError::InvalidParameter`] for an unsupported type, a notifiable event without a notify function,
    /// or a notify TPL outside of (TPL_APPLICATION, TPL_HIGH_LEVEL].
    pub fn create_event(
        &mut self,
        event_type: u32,
        notify_tpl: efi::Tpl,
        notify_function: Option<N>,
        event_group: Option<efi::Guid>,
    ) -> Result<Event> {
        let (event_type, event_group) = match (event_type, event_group) {
            (efi::EVT_SIGNAL_EXIT_BOOT_SERVICES, None) => {
                (efi::EVT_NOTIFY_SIGNAL, Some(guid::EVENT_GROUP_EXIT_BOOT_SERVICES))
            }
            (efi::EVT_SIGNAL_VIRTUAL_ADDRESS_CHANGE, None) => {
                (efi::EVT_NOTIFY_SIGNAL, Some(guid::EVENT_GROUP_VIRTUAL_ADDRESS_CHANGE))
            }
            (efi::EVT_SIGNAL_EXIT_BOOT_SERVICES | efi::EVT_SIGNAL_VIRTUAL_ADDRESS_CHANGE, Some(_)) => {
                return Err(EfiError::InvalidParameter)
            }
            (event_type, event_group) => (event_type, event_group),
        };

        let record = EventRecord::new(event_type, notify_tpl, notify_function, event_group)?;
        let event = Event(self.next_event_id);
        self.next_event_id = self.next_event_id.checked_add(1).ok_or(EfiError::OutOfResources)?;
        self.events.insert(event, record);
        Ok(event)
    }

    /// Closes (deletes) an event from the event database. Any pending notification for the event is discarded.
    ///
    /// ## Errors
    ///
    /// Returns [`EfiError::InvalidParameter`] if the event does not exist.
    pub fn close_event(&mut self, event: Event) -> Result<()> {
        let record = self.events.remove(&event).ok_or(EfiError::InvalidParameter)?;
        if record.queued {
            Self::dequeue(&mut self.pending_notifies, event, record.notify_tpl);
        }
        Ok(())
    }

    /// Marks an event as signaled, and queues it for dispatch if it is of type NotifySignal.
    ///
    /// If the event is a member of an event group, every member of the group is signaled instead.
    ///
    /// ## Errors
    ///
    /// Returns [`EfiError::InvalidParameter`] if the event does not exist.
    pub fn signal_event(&mut self, event: Event) -> Result<()> {
        let record = self.events.get_mut(&event).ok_or(EfiError::InvalidParameter)?;

        //an already signaled event does not queue an additional notify.
        if record.signaled {
            return Ok(());
        }

        if let Some(group) = record.event_group {
            self.signal_group(group);
        } else {
            record.signaled = true;
            if record.event_type.is_notify_signal() {
                Self::queue_notify(&mut self.pending_notifies, event, record);
            }
        }
        Ok(())
    }

    /// Signals every member of an event group.
    pub fn signal_group(&mut self, group: efi::Guid) {
        log::trace!("Signaling event group {:?}", FmtGuid(&group));
        for (event, record) in self.events.iter_mut().filter(|(_, r)| r.event_group == Some(group) && !r.signaled) {
            record.signaled = true;
            if record.event_type.is_notify_signal() {
                Self::queue_notify(&mut self.pending_notifies, *event, record);
            }
        }
    }

    /// Indicates whether the given event is in the signaled state. Unknown events are never signaled.
    pub fn is_signaled(&self, event: Event) -> bool {
        self.events.get(&event).is_some_and(|record| record.signaled)
    }

    /// Clears the signaled state for the given event.
    pub fn clear_signal(&mut self, event: Event) -> Result<()> {
        self.events.get_mut(&event).ok_or(EfiError::InvalidParameter)?.signaled = false;
        Ok(())
    }

    /// Atomically reads and clears the signaled state.
    pub fn read_and_clear_signaled(&mut self, event: Event) -> Result<bool> {
        let record = self.events.get_mut(&event).ok_or(EfiError::InvalidParameter)?;
        Ok(core::mem::replace(&mut record.signaled, false))
    }

    /// Queues the notify for the given event regardless of its signal state.
    ///
    /// An event that is already queued moves to the tail of its TPL queue. Events without a notify function are left
    /// alone.
    pub fn queue_event_notify(&mut self, event: Event) -> Result<()> {
        let record = self.events.get_mut(&event).ok_or(EfiError::InvalidParameter)?;
        Self::queue_notify(&mut self.pending_notifies, event, record);
        Ok(())
    }

    /// Returns the event type for the given event
    pub fn get_event_type(&self, event: Event) -> Result<EventType> {
        Ok(self.events.get(&event).ok_or(EfiError::InvalidParameter)?.event_type)
    }

    /// Returns the event group the event belongs to, if any.
    pub fn get_event_group(&self, event: Event) -> Result<Option<efi::Guid>> {
        Ok(self.events.get(&event).ok_or(EfiError::InvalidParameter)?.event_group)
    }

    /// Sets a timer on the specified event.
    ///
    /// `trigger_time` is absolute, in the same units as the time passed to [`timer_tick`](EventDb::timer_tick).
    /// Cancelling a timer also discards a pending notification for the event.
    ///
    /// ## Errors
    ///
    /// Returns [`EfiError::InvalidParameter`] if the event is not a timer, or the arguments don't fit `timer_type`.
    pub fn set_timer(
        &mut self,
        event: Event,
        timer_type: TimerDelay,
        trigger_time: Option<u64>,
        period: Option<u64>,
    ) -> Result<()> {
        let record = self.events.get_mut(&event).ok_or(EfiError::InvalidParameter)?;
        if !record.event_type.is_timer() {
            return Err(EfiError::InvalidParameter);
        }
        match timer_type {
            TimerDelay::Cancel => {
                if trigger_time.is_some() || period.is_some() {
                    return Err(EfiError::InvalidParameter);
                }
                if record.queued {
                    Self::dequeue(&mut self.pending_notifies, event, record.notify_tpl);
                    record.queued = false;
                    if record.event_type.is_notify_signal() {
                        record.signaled = false;
                    }
                }
            }
            TimerDelay::Periodic => {
                if trigger_time.is_none() || period.is_none() {
                    return Err(EfiError::InvalidParameter);
                }
            }
            TimerDelay::Relative => {
                if trigger_time.is_none() || period.is_some() {
                    return Err(EfiError::InvalidParameter);
                }
            }
        }
        record.trigger_time = trigger_time;
        record.period = period;
        Ok(())
    }

    /// Processes timers against the current time.
    ///
    /// Every timer whose trigger time is at or before `current_time` is signaled. Periodic timers are re-armed
    /// `period` after `current_time`; one-shot timers are disarmed.
    pub fn timer_tick(&mut self, current_time: u64) {
        let mut expired = Vec::new();
        for (event, record) in self.events.iter_mut().filter(|(_, r)| r.event_type.is_timer()) {
            let Some(trigger_time) = record.trigger_time else {
                continue;
            };
            if trigger_time <= current_time {
                //no period means it's a one-shot event; another call to set_timer is required to "re-arm"
                record.trigger_time = record.period.map(|period| current_time + period);
                expired.push(*event);
            }
        }
        for event in expired {
            if let Err(err) = self.signal_event(event) {
                log::error!("Error {:?} signaling timer event {:?}.", err, event);
            }
        }
    }

    /// Pops the next pending notification whose TPL is strictly above `tpl_level`.
    ///
    /// Higher TPL queues are drained first, FIFO within a TPL. A notify-signal event returned here has its signal
    /// cleared; a notify-wait event keeps its signal state for CheckEvent to consume.
    pub fn consume_next_event_notify(&mut self, tpl_level: efi::Tpl) -> Option<EventNotification<N>> {
        loop {
            let next = {
                let mut bucket = self.pending_notifies.last_entry()?;
                if *bucket.key() <= tpl_level {
                    return None;
                }
                let next = bucket.get_mut().pop_front();
                if bucket.get().is_empty() {
                    bucket.remove();
                }
                next
            };
            let Some(event) = next else {
                continue;
            };
            let Some(record) = self.events.get_mut(&event) else {
                log::error!("Pending notify for missing event {:?}.", event);
                continue;
            };
            record.queued = false;
            if record.event_type.is_notify_signal() {
                record.signaled = false;
            }
            let Some(notify_function) = record.notify_function.clone() else {
                continue;
            };
            return Some(EventNotification { event, notify_tpl: record.notify_tpl, notify_function });
        }
    }

    /// Returns the highest TPL that has a pending notification.
    pub fn highest_pending_tpl(&self) -> Option<efi::Tpl> {
        self.pending_notifies.keys().next_back().copied()
    }

    /// Indicates whether the event exists.
    pub fn is_valid(&self, event: Event) -> bool {
        self.events.contains_key(&event)
    }

    /// Number of events in the database.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Indicates whether the database holds no events.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    fn queue_notify(pending: &mut BTreeMap<efi::Tpl, VecDeque<Event>>, event: Event, record: &mut EventRecord<N>) {
        if !record.event_type.is_notifiable() {
            return;
        }
        if record.queued {
            Self::dequeue(pending, event, record.notify_tpl);
        }
        pending.entry(record.notify_tpl).or_default().push_back(event);
        record.queued = true;
    }

    fn dequeue(pending: &mut BTreeMap<efi::Tpl, VecDeque<Event>>, event: Event, notify_tpl: efi::Tpl) {
        if let Some(bucket) = pending.get_mut(&notify_tpl) {
            bucket.retain(|queued| *queued != event);
            if bucket.is_empty() {
                pending.remove(&notify_tpl);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use core::str::FromStr;
    use std::vec::Vec;

    use r_efi::efi;
    use uefi_sdk::{error::EfiError, guid};
    use uuid::Uuid;

    use super::*;

    // notify functions are opaque to the database; a tag is enough to tell them apart.
    type Tag = usize;

    fn drain(db: &mut EventDb<Tag>, tpl: efi::Tpl) -> Vec<(Event, Tag)> {
        let mut drained = Vec::new();
        while let Some(notification) = db.consume_next_event_notify(tpl) {
            drained.push((notification.event, notification.notify_function));
        }
        drained
    }

    #[test]
    fn new_should_create_empty_db() {
        let db: EventDb<Tag> = EventDb::new();
        assert!(db.is_empty());
        assert_eq!(db.highest_pending_tpl(), None);
    }

    #[test]
    fn create_event_should_validate_parameters() {
        let mut db: EventDb<Tag> = EventDb::new();

        assert!(db.create_event(efi::EVT_TIMER | efi::EVT_NOTIFY_SIGNAL, efi::TPL_NOTIFY, Some(1), None).is_ok());
        assert!(db.create_event(efi::EVT_TIMER, efi::TPL_NOTIFY, None, None).is_ok());
        assert_eq!(db.len(), 2);

        //notifiable event without a notify function.
        assert_eq!(
            db.create_event(efi::EVT_NOTIFY_SIGNAL, efi::TPL_NOTIFY, None, None),
            Err(EfiError::InvalidParameter)
        );
        //notify TPLs outside of (APPLICATION, HIGH_LEVEL].
        assert_eq!(
            db.create_event(efi::EVT_NOTIFY_SIGNAL, efi::TPL_APPLICATION, Some(1), None),
            Err(EfiError::InvalidParameter)
        );
        assert_eq!(
            db.create_event(efi::EVT_NOTIFY_SIGNAL, efi::TPL_HIGH_LEVEL + 1, Some(1), None),
            Err(EfiError::InvalidParameter)
        );
        //both notify types at once.
        assert_eq!(
            db.create_event(efi::EVT_NOTIFY_SIGNAL | efi::EVT_NOTIFY_WAIT, efi::TPL_NOTIFY, Some(1), None),
            Err(EfiError::InvalidParameter)
        );
        assert_eq!(db.len(), 2);
    }

    #[test]
    fn legacy_event_types_should_map_to_event_groups() {
        let mut db: EventDb<Tag> = EventDb::new();
        let ebs = db.create_event(efi::EVT_SIGNAL_EXIT_BOOT_SERVICES, efi::TPL_CALLBACK, Some(1), None).unwrap();
        assert_eq!(db.get_event_type(ebs), Ok(EventType::NotifySignal));
        assert_eq!(db.get_event_group(ebs), Ok(Some(guid::EVENT_GROUP_EXIT_BOOT_SERVICES)));

        let vac = db.create_event(efi::EVT_SIGNAL_VIRTUAL_ADDRESS_CHANGE, efi::TPL_CALLBACK, Some(2), None).unwrap();
        assert_eq!(db.get_event_group(vac), Ok(Some(guid::EVENT_GROUP_VIRTUAL_ADDRESS_CHANGE)));

        assert_eq!(
            db.create_event(
                efi::EVT_SIGNAL_EXIT_BOOT_SERVICES,
                efi::TPL_CALLBACK,
                Some(3),
                Some(guid::EVENT_GROUP_END_OF_DXE)
            ),
            Err(EfiError::InvalidParameter)
        );
    }

    #[test]
    fn close_event_should_delete_event_and_pending_notify() {
        let mut db: EventDb<Tag> = EventDb::new();
        let events: Vec<Event> = (0..10)
            .map(|tag| db.create_event(efi::EVT_NOTIFY_SIGNAL, efi::TPL_NOTIFY, Some(tag), None).unwrap())
            .collect();
        for event in events.iter() {
            db.signal_event(*event).unwrap();
        }
        for (consumed, event) in events.iter().enumerate() {
            assert!(db.is_valid(*event));
            db.close_event(*event).unwrap();
            assert_eq!(db.len(), 9 - consumed);
            assert!(!db.is_valid(*event));
            assert_eq!(db.close_event(*event), Err(EfiError::InvalidParameter));
        }
        assert!(db.consume_next_event_notify(efi::TPL_APPLICATION).is_none());
    }

    #[test]
    fn signal_event_should_not_double_queue() {
        let mut db: EventDb<Tag> = EventDb::new();
        let event = db.create_event(efi::EVT_NOTIFY_SIGNAL, efi::TPL_NOTIFY, Some(7), None).unwrap();
        for _ in 0..3 {
            db.signal_event(event).unwrap();
        }
        assert!(db.is_signaled(event));
        assert_eq!(drain(&mut db, efi::TPL_APPLICATION), [(event, 7)]);
        //dispatch cleared the signal, so signaling again queues again.
        assert!(!db.is_signaled(event));
        db.signal_event(event).unwrap();
        assert_eq!(drain(&mut db, efi::TPL_APPLICATION), [(event, 7)]);
    }

    #[test]
    fn signal_event_on_an_event_group_should_signal_all_members() {
        let mut db: EventDb<Tag> = EventDb::new();
        let group = efi::Guid::from_bytes(Uuid::from_str("b4dd7e5b-7a41-4a41-9a65-3c2a6a5d2f11").unwrap().as_bytes());
        let members: Vec<Event> = (0..3)
            .map(|tag| db.create_event(efi::EVT_NOTIFY_SIGNAL, efi::TPL_CALLBACK, Some(tag), Some(group)).unwrap())
            .collect();
        let waiter = db.create_event(0, efi::TPL_APPLICATION, None, Some(group)).unwrap();
        let outsider = db.create_event(efi::EVT_NOTIFY_SIGNAL, efi::TPL_CALLBACK, Some(99), None).unwrap();

        db.signal_event(members[1]).unwrap();

        assert!(members.iter().all(|e| db.is_signaled(*e)));
        assert!(db.is_signaled(waiter));
        assert!(!db.is_signaled(outsider));
        let drained: Vec<Tag> = drain(&mut db, efi::TPL_APPLICATION).into_iter().map(|(_, tag)| tag).collect();
        assert_eq!(drained, [0, 1, 2]);
    }

    #[test]
    fn pending_notifies_should_drain_by_tpl_then_fifo() {
        let mut db: EventDb<Tag> = EventDb::new();
        let order = [
            (efi::TPL_CALLBACK, 1),
            (efi::TPL_NOTIFY, 2),
            (efi::TPL_CALLBACK, 3),
            (efi::TPL_HIGH_LEVEL, 4),
            (efi::TPL_NOTIFY, 5),
        ];
        for (tpl, tag) in order {
            let event = db.create_event(efi::EVT_NOTIFY_SIGNAL, tpl, Some(tag), None).unwrap();
            db.signal_event(event).unwrap();
        }
        assert_eq!(db.highest_pending_tpl(), Some(efi::TPL_HIGH_LEVEL));

        //nothing at or below the requested level is consumed.
        let drained: Vec<Tag> = drain(&mut db, efi::TPL_CALLBACK).into_iter().map(|(_, tag)| tag).collect();
        assert_eq!(drained, [4, 2, 5]);
        assert_eq!(db.highest_pending_tpl(), Some(efi::TPL_CALLBACK));

        let drained: Vec<Tag> = drain(&mut db, efi::TPL_APPLICATION).into_iter().map(|(_, tag)| tag).collect();
        assert_eq!(drained, [1, 3]);
        assert_eq!(db.highest_pending_tpl(), None);
    }

    #[test]
    fn notify_wait_events_should_only_queue_on_request() {
        let mut db: EventDb<Tag> = EventDb::new();
        let event = db.create_event(efi::EVT_NOTIFY_WAIT, efi::TPL_NOTIFY, Some(1), None).unwrap();
        db.signal_event(event).unwrap();
        assert!(db.consume_next_event_notify(efi::TPL_APPLICATION).is_none());

        db.queue_event_notify(event).unwrap();
        db.queue_event_notify(event).unwrap();
        assert_eq!(drain(&mut db, efi::TPL_APPLICATION), [(event, 1)]);
        //wait events keep their signal for CheckEvent to consume.
        assert!(db.is_signaled(event));
        assert_eq!(db.read_and_clear_signaled(event), Ok(true));
        assert_eq!(db.read_and_clear_signaled(event), Ok(false));
    }

    #[test]
    fn queue_event_notify_should_ignore_events_without_notifies() {
        let mut db: EventDb<Tag> = EventDb::new();
        let event = db.create_event(efi::EVT_TIMER, efi::TPL_NOTIFY, Some(1), None).unwrap();
        db.queue_event_notify(event).unwrap();
        assert!(db.consume_next_event_notify(efi::TPL_APPLICATION).is_none());
        assert_eq!(db.queue_event_notify(Event::from_index(1000).unwrap()), Err(EfiError::InvalidParameter));
    }

    #[test]
    fn clear_signal_should_clear_signaled_state() {
        let mut db: EventDb<Tag> = EventDb::new();
        let event = db.create_event(0, efi::TPL_APPLICATION, None, None).unwrap();
        db.signal_event(event).unwrap();
        assert!(db.is_signaled(event));
        db.clear_signal(event).unwrap();
        assert!(!db.is_signaled(event));
        assert!(!db.is_signaled(Event::from_index(1000).unwrap()));
    }

    #[test]
    fn set_timer_should_validate_arguments() {
        let mut db: EventDb<Tag> = EventDb::new();
        let timer = db.create_event(efi::EVT_TIMER, efi::TPL_APPLICATION, None, None).unwrap();
        let plain = db.create_event(0, efi::TPL_APPLICATION, None, None).unwrap();

        assert_eq!(db.set_timer(plain, TimerDelay::Relative, Some(10), None), Err(EfiError::InvalidParameter));
        assert_eq!(db.set_timer(timer, TimerDelay::Cancel, Some(10), None), Err(EfiError::InvalidParameter));
        assert_eq!(db.set_timer(timer, TimerDelay::Periodic, Some(10), None), Err(EfiError::InvalidParameter));
        assert_eq!(db.set_timer(timer, TimerDelay::Relative, None, None), Err(EfiError::InvalidParameter));
        assert_eq!(db.set_timer(timer, TimerDelay::Relative, Some(10), Some(10)), Err(EfiError::InvalidParameter));
        assert!(db.set_timer(timer, TimerDelay::Relative, Some(10), None).is_ok());
        assert!(db.set_timer(timer, TimerDelay::Cancel, None, None).is_ok());

        assert_eq!(TimerDelay::try_from(efi::TIMER_PERIODIC), Ok(TimerDelay::Periodic));
        assert_eq!(TimerDelay::try_from(7), Err(EfiError::InvalidParameter));
    }

    #[test]
    fn timer_tick_should_signal_expired_timers() {
        let mut db: EventDb<Tag> = EventDb::new();
        let one_shot = db.create_event(efi::EVT_TIMER | efi::EVT_NOTIFY_SIGNAL, efi::TPL_NOTIFY, Some(1), None).unwrap();
        let periodic = db.create_event(efi::EVT_TIMER | efi::EVT_NOTIFY_SIGNAL, efi::TPL_NOTIFY, Some(2), None).unwrap();
        db.set_timer(one_shot, TimerDelay::Relative, Some(100), None).unwrap();
        db.set_timer(periodic, TimerDelay::Periodic, Some(50), Some(50)).unwrap();

        db.timer_tick(10);
        assert!(drain(&mut db, efi::TPL_APPLICATION).is_empty());

        db.timer_tick(50);
        assert_eq!(drain(&mut db, efi::TPL_APPLICATION), [(periodic, 2)]);

        db.timer_tick(100);
        assert_eq!(drain(&mut db, efi::TPL_APPLICATION), [(one_shot, 1), (periodic, 2)]);

        //one-shot is disarmed, periodic re-armed.
        db.timer_tick(150);
        assert_eq!(drain(&mut db, efi::TPL_APPLICATION), [(periodic, 2)]);
    }

    #[test]
    fn cancelling_a_timer_should_discard_its_pending_notify() {
        let mut db: EventDb<Tag> = EventDb::new();
        let timer = db.create_event(efi::EVT_TIMER | efi::EVT_NOTIFY_SIGNAL, efi::TPL_NOTIFY, Some(1), None).unwrap();
        db.set_timer(timer, TimerDelay::Periodic, Some(10), Some(10)).unwrap();
        db.timer_tick(10);
        assert_eq!(db.highest_pending_tpl(), Some(efi::TPL_NOTIFY));

        db.set_timer(timer, TimerDelay::Cancel, None, None).unwrap();
        assert_eq!(db.highest_pending_tpl(), None);
        assert!(!db.is_signaled(timer));

        db.timer_tick(100);
        assert!(drain(&mut db, efi::TPL_APPLICATION).is_empty());
    }

    #[test]
    fn event_type_should_reject_unknown_types() {
        assert_eq!(EventType::try_from(efi::EVT_NOTIFY_WAIT), Ok(EventType::NotifyWait));
        assert_eq!(EventType::try_from(efi::EVT_SIGNAL_EXIT_BOOT_SERVICES), Err(EfiError::InvalidParameter));
        assert_eq!(EventType::try_from(0x1234), Err(EfiError::InvalidParameter));
        assert!(EventType::TimerNotifyWait.is_timer());
        assert!(EventType::TimerNotifyWait.is_notify_wait());
        assert!(!EventType::Timer.is_notify_signal());
        assert_eq!(Event::from_index(0), None);
        assert_eq!(Event::from_index(3).map(|e| e.index()), Some(3));
    }
}
