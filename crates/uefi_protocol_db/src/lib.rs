//! UEFI Protocol Database Support
//!
//! This crate provides an UEFI handle/protocol database implementation: handles, the protocol interfaces installed on
//! them, the open-protocol ledger for every interface, and protocol notify registrations.
//!
//! The database is a plain data structure. It never calls into drivers and never signals events; operations that
//! would do so in UEFI instead return what the caller must act on (for example, the notify events to signal after an
//! install). Locking and driver disconnection are the owner's responsibility.
//!
//! Every protocol keeps its interfaces in install order, keyed by a monotonically increasing install sequence number.
//! Notify registrations remember the last sequence number they have returned, which makes
//! [`next_instance_for_registration`](ProtocolDb::next_instance_for_registration) an incremental cursor that is
//! unaffected by interfaces being removed behind it.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::{collections::BTreeMap, rc::Rc, vec::Vec};
use core::{any::Any, fmt, num::NonZeroUsize};

use r_efi::efi;
use uefi_event::Event;
use uefi_sdk::{
    error::{EfiError, Result},
    guid::{FmtGuid, OrdGuid},
};

/// Protocol installed on the reserved core handle so that it is a valid agent for the lifetime of the database.
const CORE_HANDLE_PROTOCOL_GUID: efi::Guid =
    efi::Guid::from_fields(0xfced7c96, 0x356e, 0x48cb, 0xa9, 0xa9, &[0xe0, 0x89, 0xb2, 0xdd, 0xf4, 0x9b]);

const BY_DRIVER_EXCLUSIVE: u32 = efi::OPEN_PROTOCOL_BY_DRIVER | efi::OPEN_PROTOCOL_EXCLUSIVE;

/// Opaque identity of a handle in a [`ProtocolDb`]. Handles are never reused within one database.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Handle(NonZeroUsize);

impl Handle {
    /// Reconstructs a handle from its index. Returns `None` for zero.
    pub fn from_index(index: usize) -> Option<Self> {
        NonZeroUsize::new(index).map(Handle)
    }

    /// The index of this handle in the database that created it.
    pub fn index(&self) -> usize {
        self.0.get()
    }
}

/// The handle owned by the database itself; used as the agent for `HandleProtocol` style lookups.
pub const DXE_CORE_HANDLE: Handle = Handle(NonZeroUsize::MIN);

/// A protocol interface: a possibly-null, type-erased shared object.
///
/// Two interfaces are equal only if they are both null or refer to the same allocation.
#[derive(Clone, Default)]
pub struct Interface(Option<Rc<dyn Any>>);

impl Interface {
    /// Wraps `value` in a new interface.
    pub fn new<T: Any>(value: T) -> Self {
        Self(Some(Rc::new(value)))
    }

    /// Wraps an existing shared object, preserving its identity.
    pub fn from_rc(value: Rc<dyn Any>) -> Self {
        Self(Some(value))
    }

    /// The null interface.
    pub const fn null() -> Self {
        Self(None)
    }

    /// Indicates whether this is the null interface.
    pub fn is_null(&self) -> bool {
        self.0.is_none()
    }

    /// Recovers the typed object behind the interface, if it is a `T`.
    pub fn downcast<T: Any>(&self) -> Option<Rc<T>> {
        self.0.clone()?.downcast::<T>().ok()
    }
}

impl PartialEq for Interface {
    fn eq(&self, other: &Self) -> bool {
        match (&self.0, &other.0) {
            (None, None) => true,
            (Some(a), Some(b)) => core::ptr::addr_eq(Rc::as_ptr(a), Rc::as_ptr(b)),
            _ => false,
        }
    }
}

impl Eq for Interface {}

impl fmt::Debug for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(rc) => write!(f, "Interface({:p})", Rc::as_ptr(rc)),
            None => write!(f, "Interface(null)"),
        }
    }
}

/// Opaque identity of a protocol notify registration.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Registration(NonZeroUsize);

/// Search strategies for [`ProtocolDb::locate_handles`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchType {
    /// Every handle in the database, in creation order.
    AllHandles,
    /// The next handle that received an interface for the registration's protocol since it was last consumed.
    ByRegisterNotify(Registration),
    /// Every handle supporting the protocol, in install order.
    ByProtocol(efi::Guid),
}

/// This structure is used to track open protocol information on a handle.
///
/// The semantics of this structure follow that of the EFI_OPEN_PROTOCOL_INFORMATION_ENTRY structure defined in UEFI
/// spec version 2.10 section 7.3.11.
#[derive(Clone, Copy, Debug)]
pub struct OpenProtocolInformation {
    pub agent_handle: Option<Handle>,
    pub controller_handle: Option<Handle>,
    pub attributes: u32,
    pub open_count: u32,
}

impl PartialEq for OpenProtocolInformation {
    fn eq(&self, other: &Self) -> bool {
        self.agent_handle == other.agent_handle
            && self.controller_handle == other.controller_handle
            && self.attributes == other.attributes
    }
}

impl Eq for OpenProtocolInformation {}

impl OpenProtocolInformation {
    fn new(
        handle: Handle,
        agent_handle: Option<Handle>,
        controller_handle: Option<Handle>,
        attributes: u32,
    ) -> Result<Self> {
        match attributes {
            efi::OPEN_PROTOCOL_BY_CHILD_CONTROLLER => {
                if agent_handle.is_none() || controller_handle.is_none() || controller_handle == Some(handle) {
                    return Err(EfiError::InvalidParameter);
                }
            }
            efi::OPEN_PROTOCOL_BY_DRIVER | BY_DRIVER_EXCLUSIVE => {
                if agent_handle.is_none() || controller_handle.is_none() {
                    return Err(EfiError::InvalidParameter);
                }
            }
            efi::OPEN_PROTOCOL_EXCLUSIVE => {
                if agent_handle.is_none() {
                    return Err(EfiError::InvalidParameter);
                }
            }
            efi::OPEN_PROTOCOL_BY_HANDLE_PROTOCOL
            | efi::OPEN_PROTOCOL_GET_PROTOCOL
            | efi::OPEN_PROTOCOL_TEST_PROTOCOL => (),
            _ => return Err(EfiError::InvalidParameter),
        }
        Ok(OpenProtocolInformation { agent_handle, controller_handle, attributes, open_count: 1 })
    }

    /// True if the open was made by a driver managing the controller.
    pub fn is_by_driver(&self) -> bool {
        self.attributes & efi::OPEN_PROTOCOL_BY_DRIVER != 0
    }

    /// True if the open holds exclusive access.
    pub fn is_exclusive(&self) -> bool {
        self.attributes & efi::OPEN_PROTOCOL_EXCLUSIVE != 0
    }

    /// True if the open records a parent/child relationship.
    pub fn is_by_child_controller(&self) -> bool {
        self.attributes & efi::OPEN_PROTOCOL_BY_CHILD_CONTROLLER != 0
    }

    // opens that can be dropped without asking anyone.
    fn is_releasable(&self) -> bool {
        !(self.is_by_driver() || self.is_exclusive() || self.is_by_child_controller())
    }
}

struct ProtocolInstance {
    interface: Interface,
    install_seq: u64,
    usage: Vec<OpenProtocolInformation>,
}

impl ProtocolInstance {
    fn opened_by_driver(&self) -> bool {
        self.usage.iter().any(|u| u.is_by_driver())
    }

    fn opened_by_exclusive(&self) -> bool {
        self.usage.iter().any(|u| u.is_exclusive())
    }
}

struct HandleRecord {
    protocols: BTreeMap<OrdGuid, ProtocolInstance>,
    key: u64,
    locate_request: u64,
}

struct ProtocolNotify {
    registration: Registration,
    event: Event,
    position: u64,
}

#[derive(Default)]
struct ProtocolEntry {
    instances: BTreeMap<u64, Handle>,
    notifies: Vec<ProtocolNotify>,
}

/// The handle/protocol database.
pub struct ProtocolDb {
    handles: BTreeMap<Handle, HandleRecord>,
    protocols: BTreeMap<OrdGuid, ProtocolEntry>,
    next_handle: NonZeroUsize,
    next_registration: NonZeroUsize,
    install_seq: u64,
    handle_db_key: u64,
    locate_request: u64,
}

impl Default for ProtocolDb {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ProtocolDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolDb")
            .field("handles", &self.handles.len())
            .field("protocols", &self.protocols.len())
            .field("handle_db_key", &self.handle_db_key)
            .finish()
    }
}

impl ProtocolDb {
    /// Creates a database holding only [`DXE_CORE_HANDLE`].
    pub fn new() -> Self {
        let mut db = ProtocolDb {
            handles: BTreeMap::new(),
            protocols: BTreeMap::new(),
            next_handle: NonZeroUsize::MIN,
            next_registration: NonZeroUsize::MIN,
            install_seq: 0,
            handle_db_key: 0,
            locate_request: 0,
        };
        match db.install_protocol_interface(None, CORE_HANDLE_PROTOCOL_GUID, Interface::null()) {
            Ok((handle, _)) if handle == DXE_CORE_HANDLE => (),
            other => log::error!("Failed to reserve the core handle: {:?}", other.map(|(handle, _)| handle)),
        }
        db
    }

    /// Returns every protocol that currently has at least one installed interface.
    pub fn registered_protocols(&self) -> Vec<efi::Guid> {
        self.protocols.iter().filter(|(_, entry)| !entry.instances.is_empty()).map(|(guid, _)| guid.0).collect()
    }

    /// Current value of the handle database key. Every install, uninstall and reinstall advances it.
    pub fn handle_database_key(&self) -> u64 {
        self.handle_db_key
    }

    /// Returns every handle modified after the database key was `key`, in creation order.
    pub fn handles_modified_since(&self, key: u64) -> Vec<Handle> {
        self.handles.iter().filter(|(_, record)| record.key > key).map(|(handle, _)| *handle).collect()
    }

    /// Installs a protocol interface on the given handle.
    ///
    /// This function closely matches the semantics of the EFI_BOOT_SERVICES.InstallProtocolInterface() API in UEFI
    /// spec 2.10 section 7.3.2. A new handle is created if `handle` is `None`.
    ///
    /// On success, returns the handle the protocol was installed on and the events of every notify registered for the
    /// protocol. The caller is responsible for signaling them.
    ///
    /// ## Errors
    ///
    /// Returns [`EfiError::InvalidParameter`] if `handle` is not a valid handle or already supports `protocol`.
    pub fn install_protocol_interface(
        &mut self,
        handle: Option<Handle>,
        protocol: efi::Guid,
        interface: Interface,
    ) -> Result<(Handle, Vec<Event>)> {
        let handle = match handle {
            Some(handle) => {
                self.validate_handle(handle)?;
                if self.handles.get(&handle).is_some_and(|record| record.protocols.contains_key(&OrdGuid(protocol))) {
                    return Err(EfiError::InvalidParameter);
                }
                handle
            }
            None => {
                let handle = Handle(self.next_handle);
                self.next_handle = self.next_handle.checked_add(1).ok_or(EfiError::OutOfResources)?;
                self.handles.insert(handle, HandleRecord { protocols: BTreeMap::new(), key: 0, locate_request: 0 });
                handle
            }
        };

        self.install_seq += 1;
        self.handle_db_key += 1;
        let install_seq = self.install_seq;

        let record = self.handles.get_mut(&handle).ok_or(EfiError::InvalidParameter)?;
        record.key = self.handle_db_key;
        record.protocols.insert(OrdGuid(protocol), ProtocolInstance { interface, install_seq, usage: Vec::new() });

        let entry = self.protocols.entry(OrdGuid(protocol)).or_default();
        entry.instances.insert(install_seq, handle);

        log::debug!("Installed {:?} on {:?}", FmtGuid(&protocol), handle);
        Ok((handle, entry.notifies.iter().map(|notify| notify.event).collect()))
    }

    /// Removes a protocol interface from the given handle.
    ///
    /// This function closely matches the semantics of the EFI_BOOT_SERVICES.UninstallProtocolInterface() API in UEFI
    /// spec 2.10 section 7.3.3, except that it never disconnects drivers. Open records that can simply be dropped
    /// (by handle protocol, get protocol and test protocol) are removed; any other open record causes
    /// [`EfiError::AccessDenied`] and leaves the database untouched. When the last interface on a handle is removed,
    /// the handle is destroyed.
    ///
    /// ## Errors
    ///
    /// Returns [`EfiError::InvalidParameter`] if the handle is invalid.
    /// Returns [`EfiError::NotFound`] if `interface` is not installed for `protocol` on the handle.
    /// Returns [`EfiError::AccessDenied`] if the interface is still in use.
    pub fn uninstall_protocol_interface(
        &mut self,
        handle: Handle,
        protocol: efi::Guid,
        interface: &Interface,
    ) -> Result<()> {
        self.validate_handle(handle)?;
        let record = self.handles.get_mut(&handle).ok_or(EfiError::InvalidParameter)?;
        let instance = record.protocols.get(&OrdGuid(protocol)).ok_or(EfiError::NotFound)?;
        if &instance.interface != interface {
            return Err(EfiError::NotFound);
        }
        if !instance.usage.iter().all(|usage| usage.is_releasable()) {
            return Err(EfiError::AccessDenied);
        }

        let install_seq = instance.install_seq;
        record.protocols.remove(&OrdGuid(protocol));
        self.handle_db_key += 1;
        record.key = self.handle_db_key;
        if record.protocols.is_empty() {
            self.handles.remove(&handle);
        }
        if let Some(entry) = self.protocols.get_mut(&OrdGuid(protocol)) {
            entry.instances.remove(&install_seq);
        }

        log::debug!("Uninstalled {:?} from {:?}", FmtGuid(&protocol), handle);
        Ok(())
    }

    /// Replaces a protocol interface on the given handle.
    ///
    /// This function closely matches the semantics of the EFI_BOOT_SERVICES.ReinstallProtocolInterface() API in UEFI
    /// spec 2.10 section 7.3.4, except that it never disconnects or connects drivers. The interface row moves to the
    /// tail of the protocol's install order so that notify registrations see it again.
    ///
    /// On success, returns the events of every notify registered for the protocol.
    ///
    /// ## Errors
    ///
    /// Same as [`uninstall_protocol_interface`](ProtocolDb::uninstall_protocol_interface).
    pub fn reinstall_protocol_interface(
        &mut self,
        handle: Handle,
        protocol: efi::Guid,
        old_interface: &Interface,
        new_interface: Interface,
    ) -> Result<Vec<Event>> {
        self.validate_handle(handle)?;
        let record = self.handles.get_mut(&handle).ok_or(EfiError::InvalidParameter)?;
        let instance = record.protocols.get_mut(&OrdGuid(protocol)).ok_or(EfiError::NotFound)?;
        if &instance.interface != old_interface {
            return Err(EfiError::NotFound);
        }
        if !instance.usage.iter().all(|usage| usage.is_releasable()) {
            return Err(EfiError::AccessDenied);
        }

        self.install_seq += 1;
        self.handle_db_key += 1;
        let old_seq = core::mem::replace(&mut instance.install_seq, self.install_seq);
        instance.interface = new_interface;
        instance.usage.clear();
        record.key = self.handle_db_key;

        let entry = self.protocols.entry(OrdGuid(protocol)).or_default();
        entry.instances.remove(&old_seq);
        entry.instances.insert(self.install_seq, handle);

        log::debug!("Reinstalled {:?} on {:?}", FmtGuid(&protocol), handle);
        Ok(entry.notifies.iter().map(|notify| notify.event).collect())
    }

    /// Returns the handles matching `search`.
    ///
    /// [`SearchType::ByRegisterNotify`] returns at most one handle and does not move the registration's cursor; use
    /// [`next_instance_for_registration`](ProtocolDb::next_instance_for_registration) to consume it.
    ///
    /// ## Errors
    ///
    /// Returns [`EfiError::NotFound`] if no handles match.
    pub fn locate_handles(&mut self, search: SearchType) -> Result<Vec<Handle>> {
        let handles: Vec<Handle> = match search {
            SearchType::AllHandles => self.handles.keys().copied().collect(),
            SearchType::ByRegisterNotify(registration) => {
                self.peek_registration(registration).map(|(_, handle)| handle).into_iter().collect()
            }
            SearchType::ByProtocol(protocol) => {
                self.locate_request += 1;
                let request = self.locate_request;
                let mut handles = Vec::new();
                if let Some(entry) = self.protocols.get(&OrdGuid(protocol)) {
                    for handle in entry.instances.values() {
                        let Some(record) = self.handles.get_mut(handle) else {
                            log::error!("Protocol {:?} lists missing handle {:?}.", FmtGuid(&protocol), handle);
                            continue;
                        };
                        //skip handles already returned by this request.
                        if record.locate_request != request {
                            record.locate_request = request;
                            handles.push(*handle);
                        }
                    }
                }
                handles
            }
        };
        if handles.is_empty() {
            return Err(EfiError::NotFound);
        }
        Ok(handles)
    }

    /// Returns the first installed instance of `protocol` on any handle.
    pub fn locate_protocol(&self, protocol: efi::Guid) -> Result<(Handle, Interface)> {
        let entry = self.protocols.get(&OrdGuid(protocol)).ok_or(EfiError::NotFound)?;
        entry
            .instances
            .values()
            .find_map(|handle| Some((*handle, self.handles.get(handle)?.protocols.get(&OrdGuid(protocol))?.interface.clone())))
            .ok_or(EfiError::NotFound)
    }

    /// Returns the interface for the specified protocol on the given handle.
    ///
    /// ## Errors
    ///
    /// Returns [`EfiError::NotFound`] if the handle does not exist (including handles destroyed by an uninstall) or
    /// does not support the protocol.
    pub fn get_interface_for_handle(&self, handle: Handle, protocol: efi::Guid) -> Result<Interface> {
        let record = self.handles.get(&handle).ok_or(EfiError::NotFound)?;
        Ok(record.protocols.get(&OrdGuid(protocol)).ok_or(EfiError::NotFound)?.interface.clone())
    }

    /// Returns Ok(()) if the handle is a valid handle, Err(InvalidParameter) otherwise.
    pub fn validate_handle(&self, handle: Handle) -> Result<()> {
        //to be valid the handle must exist in the handle database (i.e. not have been deleted).
        if !self.handles.contains_key(&handle) {
            return Err(EfiError::InvalidParameter);
        }
        Ok(())
    }

    /// Records an open of `protocol` on `handle` and returns the interface.
    ///
    /// This implements the ledger half of EFI_BOOT_SERVICES.OpenProtocol() (UEFI spec 2.10 section 7.3.9). Requests
    /// for exclusive access that collide with a by-driver open fail with [`EfiError::AccessDenied`]; the caller is
    /// expected to disconnect those drivers and retry. An open without an agent is validated but not recorded. An
    /// open matching an existing record exactly bumps its open count.
    ///
    /// ## Errors
    ///
    /// Returns [`EfiError::InvalidParameter`] for invalid handles or attribute combinations.
    /// Returns [`EfiError::Unsupported`] if the handle does not support the protocol.
    /// Returns [`EfiError::AlreadyStarted`] if the same agent and controller already hold it by driver.
    /// Returns [`EfiError::AccessDenied`] if the attributes conflict with an existing open.
    pub fn add_protocol_usage(
        &mut self,
        handle: Handle,
        protocol: efi::Guid,
        agent_handle: Option<Handle>,
        controller_handle: Option<Handle>,
        attributes: u32,
    ) -> Result<Interface> {
        self.validate_handle(handle)?;
        if let Some(agent) = agent_handle {
            self.validate_handle(agent)?;
        }
        if let Some(controller) = controller_handle {
            self.validate_handle(controller)?;
        }

        let new_usage = OpenProtocolInformation::new(handle, agent_handle, controller_handle, attributes)?;
        let record = self.handles.get_mut(&handle).ok_or(EfiError::InvalidParameter)?;
        let instance = record.protocols.get_mut(&OrdGuid(protocol)).ok_or(EfiError::Unsupported)?;

        let exact_match = instance.usage.iter().position(|usage| usage == &new_usage);
        match attributes {
            efi::OPEN_PROTOCOL_BY_DRIVER | BY_DRIVER_EXCLUSIVE if exact_match.is_some() => {
                return Err(EfiError::AlreadyStarted);
            }
            efi::OPEN_PROTOCOL_BY_DRIVER | BY_DRIVER_EXCLUSIVE | efi::OPEN_PROTOCOL_EXCLUSIVE => {
                if instance.opened_by_exclusive() || instance.opened_by_driver() {
                    return Err(EfiError::AccessDenied);
                }
            }
            _ => (),
        }

        if agent_handle.is_none() {
            return Ok(instance.interface.clone());
        }
        match exact_match {
            Some(index) => instance.usage[index].open_count += 1,
            None => instance.usage.push(new_usage),
        }
        Ok(instance.interface.clone())
    }

    /// Removes every open record of `protocol` on `handle` made by `agent_handle` for `controller_handle`.
    ///
    /// ## Errors
    ///
    /// Returns [`EfiError::InvalidParameter`] for invalid handles.
    /// Returns [`EfiError::NotFound`] if the handle does not support the protocol or no record matches.
    pub fn remove_protocol_usage(
        &mut self,
        handle: Handle,
        protocol: efi::Guid,
        agent_handle: Handle,
        controller_handle: Option<Handle>,
    ) -> Result<()> {
        self.validate_handle(handle)?;
        self.validate_handle(agent_handle)?;
        if let Some(controller) = controller_handle {
            self.validate_handle(controller)?;
        }

        let record = self.handles.get_mut(&handle).ok_or(EfiError::InvalidParameter)?;
        let instance = record.protocols.get_mut(&OrdGuid(protocol)).ok_or(EfiError::NotFound)?;
        let before = instance.usage.len();
        instance.usage.retain(|usage| {
            !(usage.agent_handle == Some(agent_handle) && usage.controller_handle == controller_handle)
        });
        if instance.usage.len() == before {
            return Err(EfiError::NotFound);
        }
        Ok(())
    }

    /// Returns a snapshot of the open records for `protocol` on `handle`.
    pub fn get_open_protocol_information_by_protocol(
        &self,
        handle: Handle,
        protocol: efi::Guid,
    ) -> Result<Vec<OpenProtocolInformation>> {
        self.validate_handle(handle)?;
        let record = self.handles.get(&handle).ok_or(EfiError::NotFound)?;
        Ok(record.protocols.get(&OrdGuid(protocol)).ok_or(EfiError::NotFound)?.usage.clone())
    }

    /// Returns a snapshot of the open records for every protocol on `handle`.
    pub fn get_open_protocol_information(&self, handle: Handle) -> Result<Vec<(efi::Guid, Vec<OpenProtocolInformation>)>> {
        let record = self.handles.get(&handle).ok_or(EfiError::NotFound)?;
        Ok(record.protocols.iter().map(|(guid, instance)| (guid.0, instance.usage.clone())).collect())
    }

    /// Returns the protocols installed on `handle`, most recently installed first.
    pub fn get_protocols_on_handle(&self, handle: Handle) -> Result<Vec<efi::Guid>> {
        let record = self.handles.get(&handle).ok_or(EfiError::InvalidParameter)?;
        let mut protocols: Vec<(u64, efi::Guid)> =
            record.protocols.iter().map(|(guid, instance)| (instance.install_seq, guid.0)).collect();
        protocols.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(protocols.into_iter().map(|(_, guid)| guid).collect())
    }

    /// Registers `event` to be signaled whenever an interface for `protocol` is installed or reinstalled.
    ///
    /// The registration's cursor starts before the first interface, so interfaces installed before the registration
    /// are also reported by [`next_instance_for_registration`](ProtocolDb::next_instance_for_registration).
    pub fn register_protocol_notify(&mut self, protocol: efi::Guid, event: Event) -> Result<Registration> {
        let registration = Registration(self.next_registration);
        self.next_registration = self.next_registration.checked_add(1).ok_or(EfiError::OutOfResources)?;
        self.protocols.entry(OrdGuid(protocol)).or_default().notifies.push(ProtocolNotify {
            registration,
            event,
            position: 0,
        });
        Ok(registration)
    }

    /// Removes a notify registration.
    ///
    /// ## Errors
    ///
    /// Returns [`EfiError::InvalidParameter`] if the registration does not exist.
    pub fn unregister_protocol_notify(&mut self, registration: Registration) -> Result<()> {
        for entry in self.protocols.values_mut() {
            if let Some(index) = entry.notifies.iter().position(|notify| notify.registration == registration) {
                entry.notifies.remove(index);
                return Ok(());
            }
        }
        Err(EfiError::InvalidParameter)
    }

    /// Removes every notify registration that signals one of `events`.
    pub fn unregister_protocol_notify_events(&mut self, events: &[Event]) {
        for entry in self.protocols.values_mut() {
            entry.notifies.retain(|notify| !events.contains(&notify.event));
        }
    }

    /// Returns the next interface installed for the registration's protocol and advances the cursor past it.
    pub fn next_instance_for_registration(&mut self, registration: Registration) -> Option<(Handle, Interface)> {
        let (install_seq, handle) = self.peek_registration(registration)?;
        let (protocol, notify) = self.protocols.iter_mut().find_map(|(protocol, entry)| {
            Some((*protocol, entry.notifies.iter_mut().find(|notify| notify.registration == registration)?))
        })?;
        notify.position = install_seq;
        let interface = self.handles.get(&handle)?.protocols.get(&protocol)?.interface.clone();
        Some((handle, interface))
    }

    /// Returns the handles that opened a protocol on `parent_handle` by child controller, in handle order.
    pub fn get_child_handles(&self, parent_handle: Handle) -> Vec<Handle> {
        let Some(record) = self.handles.get(&parent_handle) else {
            return Vec::new();
        };
        let mut child_handles: Vec<Handle> = record
            .protocols
            .values()
            .flat_map(|instance| instance.usage.iter())
            .filter(|usage| usage.is_by_child_controller())
            .filter_map(|usage| usage.controller_handle)
            .collect();
        child_handles.sort();
        child_handles.dedup();
        child_handles
    }

    fn peek_registration(&self, registration: Registration) -> Option<(u64, Handle)> {
        self.protocols.values().find_map(|entry| {
            let notify = entry.notifies.iter().find(|notify| notify.registration == registration)?;
            Some(entry.instances.range(notify.position + 1..).next().map(|(seq, handle)| (*seq, *handle)))
        })?
    }
}
