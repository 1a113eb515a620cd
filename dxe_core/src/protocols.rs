//! Core Protocol Services
//!
//! The handle/protocol database services. These wrap [`ProtocolDb`](uefi_protocol_db::ProtocolDb) with the parts of
//! the boot services that need the rest of the core: signaling protocol notify events, and disconnecting or
//! reconnecting drivers that hold an interface being removed or replaced.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::{collections::BTreeSet, rc::Rc, vec::Vec};

use r_efi::efi;
use uefi_device_path::{is_device_path_end, remaining_device_path, DevicePathBuf};
use uefi_event::Event;
use uefi_protocol_db::{Handle, Interface, OpenProtocolInformation, Registration, SearchType, DXE_CORE_HANDLE};
use uefi_sdk::{
    ensure,
    error::{EfiError, Result},
    guid::FmtGuid,
};

use crate::Core;

impl Core {
    /// Installs a protocol interface on a handle, creating the handle if `handle` is `None`.
    ///
    /// This function matches the behavior of EFI_BOOT_SERVICES.InstallProtocolInterface() in UEFI spec 2.10 section
    /// 7.3.2. Every notify registered for `protocol` is signaled.
    pub fn install_protocol_interface(
        &self,
        handle: Option<Handle>,
        protocol: efi::Guid,
        interface: Interface,
    ) -> Result<Handle> {
        log::info!("InstallProtocolInterface: {:?} @ {:?}", FmtGuid(&protocol), interface);
        let (handle, notifies) = self.protocol_db.lock(self).install_protocol_interface(handle, protocol, interface)?;
        self.signal_protocol_notifies(notifies);
        Ok(handle)
    }

    /// Removes a protocol interface from a handle.
    ///
    /// This function matches the behavior of EFI_BOOT_SERVICES.UninstallProtocolInterface() in UEFI spec 2.10 section
    /// 7.3.3. Drivers holding the interface by driver are disconnected first. If the interface is still in use after
    /// that, the handle is reconnected and [`EfiError::AccessDenied`] is returned.
    pub fn uninstall_protocol_interface(&self, handle: Handle, protocol: efi::Guid, interface: &Interface) -> Result<()> {
        log::info!("UninstallProtocolInterface: {:?} @ {:?}", FmtGuid(&protocol), interface);
        self.check_installed_interface(handle, protocol, interface)?;

        let result = match self.disconnect_protocol_users(handle, protocol) {
            Ok(()) => self.protocol_db.lock(self).uninstall_protocol_interface(handle, protocol, interface),
            Err(_) => Err(EfiError::AccessDenied),
        };

        if result == Err(EfiError::AccessDenied) {
            let _ = self.connect_controller(handle, &[], None, true);
        }
        result
    }

    /// Replaces a protocol interface on a handle.
    ///
    /// This function matches the behavior of EFI_BOOT_SERVICES.ReinstallProtocolInterface() in UEFI spec 2.10 section
    /// 7.3.4. Drivers holding the old interface are disconnected, the handle is reconnected so they can pick up the
    /// new interface, and then every notify registered for `protocol` is signaled.
    pub fn reinstall_protocol_interface(
        &self,
        handle: Handle,
        protocol: efi::Guid,
        old_interface: &Interface,
        new_interface: Interface,
    ) -> Result<()> {
        log::info!("ReinstallProtocolInterface: {:?} @ {:?} -> {:?}", FmtGuid(&protocol), old_interface, new_interface);
        self.check_installed_interface(handle, protocol, old_interface)?;

        let result = match self.disconnect_protocol_users(handle, protocol) {
            Ok(()) => {
                self.protocol_db.lock(self).reinstall_protocol_interface(handle, protocol, old_interface, new_interface)
            }
            Err(_) => Err(EfiError::AccessDenied),
        };

        // Connect controller so agents that were forced to release old_interface can now consume new_interface.
        // Error status is ignored.
        let _ = self.connect_controller(handle, &[], None, true);

        self.signal_protocol_notifies(result?);
        Ok(())
    }

    /// Installs several protocol interfaces on one handle as a single operation.
    ///
    /// This function matches the behavior of EFI_BOOT_SERVICES.InstallMultipleProtocolInterfaces() in UEFI spec 2.10
    /// section 7.3.16. Notifications are held until every interface is installed. If any install fails, the ones
    /// already installed are removed again.
    ///
    /// ## Errors
    ///
    /// Returns [`EfiError::InvalidParameter`] for an empty list, or any error from the individual installs.
    /// Returns [`EfiError::AlreadyStarted`] if a device path being installed is already present on another handle.
    pub fn install_multiple_protocol_interfaces(
        &self,
        handle: Option<Handle>,
        interfaces: &[(efi::Guid, Interface)],
    ) -> Result<Handle> {
        ensure!(!interfaces.is_empty(), EfiError::InvalidParameter);

        let old_tpl = self.raise_tpl(efi::TPL_NOTIFY);

        let mut current_handle = handle;
        let mut installed = Vec::new();
        let mut status = Ok(());
        for (protocol, interface) in interfaces {
            if *protocol == efi::protocols::device_path::PROTOCOL_GUID && self.is_duplicate_device_path(interface) {
                status = Err(EfiError::AlreadyStarted);
                break;
            }
            match self.install_protocol_interface(current_handle, *protocol, interface.clone()) {
                Ok(new_handle) => {
                    current_handle = Some(new_handle);
                    installed.push((*protocol, interface.clone()));
                }
                Err(err) => {
                    status = Err(err);
                    break;
                }
            }
        }

        if let Err(err) = status {
            log::warn!("InstallMultipleProtocolInterfaces failed with {:?}; rolling back.", err);
            if let Some(handle) = current_handle {
                for (protocol, interface) in installed.iter().rev() {
                    let _ = self.uninstall_protocol_interface(handle, *protocol, interface);
                }
            }
        }

        self.restore_tpl(old_tpl);
        status?;
        current_handle.ok_or(EfiError::InvalidParameter)
    }

    /// Removes several protocol interfaces from one handle as a single operation.
    ///
    /// This function matches the behavior of EFI_BOOT_SERVICES.UninstallMultipleProtocolInterfaces() in UEFI spec
    /// 2.10 section 7.3.17. Every pair is checked against the handle before anything is removed. If an interface
    /// still cannot be removed, the ones already removed are installed again and [`EfiError::InvalidParameter`] is
    /// returned.
    pub fn uninstall_multiple_protocol_interfaces(
        &self,
        handle: Handle,
        interfaces: &[(efi::Guid, Interface)],
    ) -> Result<()> {
        ensure!(!interfaces.is_empty(), EfiError::InvalidParameter);
        for (protocol, interface) in interfaces {
            if self.check_installed_interface(handle, *protocol, interface).is_err() {
                log::warn!("UninstallMultipleProtocolInterfaces: {:?} not on {:?}.", FmtGuid(protocol), handle);
                return Err(EfiError::InvalidParameter);
            }
        }

        for (index, (protocol, interface)) in interfaces.iter().enumerate() {
            if let Err(err) = self.uninstall_protocol_interface(handle, *protocol, interface) {
                log::warn!("UninstallMultipleProtocolInterfaces failed with {:?}; reinstalling.", err);
                self.reinstall_removed_interfaces(handle, &interfaces[..index])?;
                return Err(EfiError::InvalidParameter);
            }
        }
        Ok(())
    }

    // Puts back interfaces removed by a failed multiple uninstall. The handle is gone if its last protocol was
    // removed, in which case the interfaces land together on a new handle.
    fn reinstall_removed_interfaces(&self, handle: Handle, removed: &[(efi::Guid, Interface)]) -> Result<()> {
        let mut target = if self.is_valid_handle(handle) { Some(handle) } else { None };
        for (protocol, interface) in removed {
            match self.install_protocol_interface(target, *protocol, interface.clone()) {
                Ok(installed_on) => target = Some(installed_on),
                Err(err) => {
                    log::error!("Failed to reinstall {:?} on {:?}: {:?}", FmtGuid(protocol), handle, err);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Returns the interface for `protocol` on `handle`, recording the access on behalf of the core.
    ///
    /// This function matches the behavior of EFI_BOOT_SERVICES.HandleProtocol() in UEFI spec 2.10 section 7.3.7.
    pub fn handle_protocol(&self, handle: Handle, protocol: efi::Guid) -> Result<Interface> {
        self.open_protocol(handle, protocol, Some(DXE_CORE_HANDLE), None, efi::OPEN_PROTOCOL_BY_HANDLE_PROTOCOL)
    }

    /// Opens `protocol` on `handle` and records the open in the handle's ledger.
    ///
    /// This function matches the behavior of EFI_BOOT_SERVICES.OpenProtocol() in UEFI spec 2.10 section 7.3.9. An
    /// exclusive open that collides with drivers holding the protocol by driver disconnects those drivers and tries
    /// again. This includes `agent_handle` itself when it already holds the protocol by driver.
    ///
    /// ## Errors
    ///
    /// Returns [`EfiError::InvalidParameter`] for invalid handles or attribute combinations.
    /// Returns [`EfiError::Unsupported`] if the handle does not support the protocol.
    /// Returns [`EfiError::AlreadyStarted`] if `agent_handle` already holds the protocol by driver for the same
    /// controller. The interface is unchanged and can be retrieved with [`handle_protocol`](Core::handle_protocol).
    /// Returns [`EfiError::AccessDenied`] if the open conflicts with an existing one that cannot be released.
    pub fn open_protocol(
        &self,
        handle: Handle,
        protocol: efi::Guid,
        agent_handle: Option<Handle>,
        controller_handle: Option<Handle>,
        attributes: u32,
    ) -> Result<Interface> {
        let result =
            self.protocol_db.lock(self).add_protocol_usage(handle, protocol, agent_handle, controller_handle, attributes);

        match result {
            Err(EfiError::AccessDenied) if (attributes & efi::OPEN_PROTOCOL_EXCLUSIVE) != 0 => {
                let usages = self.protocol_db.lock(self).get_open_protocol_information_by_protocol(handle, protocol)?;
                ensure!(!usages.iter().any(OpenProtocolInformation::is_exclusive), EfiError::AccessDenied);

                let mut seen = BTreeSet::new();
                let drivers: Vec<Handle> = usages
                    .iter()
                    .filter(|usage| usage.is_by_driver())
                    .filter_map(|usage| usage.agent_handle)
                    .filter(|driver| seen.insert(*driver))
                    .collect();
                for driver in drivers {
                    log::info!("Disconnecting {:?} from {:?} for exclusive open.", driver, handle);
                    if self.disconnect_controller(handle, Some(driver), None).is_err() {
                        return Err(EfiError::AccessDenied);
                    }
                }

                self.protocol_db.lock(self).add_protocol_usage(
                    handle,
                    protocol,
                    agent_handle,
                    controller_handle,
                    attributes,
                )
            }
            other => other,
        }
    }

    /// Removes the open records of `protocol` on `handle` made by `agent_handle` for `controller_handle`.
    ///
    /// This function matches the behavior of EFI_BOOT_SERVICES.CloseProtocol() in UEFI spec 2.10 section 7.3.10.
    pub fn close_protocol(
        &self,
        handle: Handle,
        protocol: efi::Guid,
        agent_handle: Handle,
        controller_handle: Option<Handle>,
    ) -> Result<()> {
        self.protocol_db.lock(self).remove_protocol_usage(handle, protocol, agent_handle, controller_handle)
    }

    /// Returns the open records of `protocol` on `handle`.
    ///
    /// This function matches the behavior of EFI_BOOT_SERVICES.OpenProtocolInformation() in UEFI spec 2.10 section
    /// 7.3.11.
    pub fn open_protocol_information(&self, handle: Handle, protocol: efi::Guid) -> Result<Vec<OpenProtocolInformation>> {
        self.protocol_db.lock(self).get_open_protocol_information_by_protocol(handle, protocol)
    }

    /// Returns the protocols installed on `handle`.
    ///
    /// This function matches the behavior of EFI_BOOT_SERVICES.ProtocolsPerHandle() in UEFI spec 2.10 section 7.3.14.
    pub fn protocols_per_handle(&self, handle: Handle) -> Result<Vec<efi::Guid>> {
        self.protocol_db.lock(self).get_protocols_on_handle(handle)
    }

    /// Copies the handles matching `search` into `buffer`.
    ///
    /// This function matches the behavior of EFI_BOOT_SERVICES.LocateHandle() in UEFI spec 2.10 section 7.3.7.
    /// `required_len` is always set to the number of matching handles. A [`SearchType::ByRegisterNotify`] search
    /// consumes the reported handle only when it is actually returned.
    ///
    /// ## Errors
    ///
    /// Returns [`EfiError::NotFound`] if no handles match.
    /// Returns [`EfiError::BufferTooSmall`] if `buffer` cannot hold every match.
    pub fn locate_handle(&self, search: SearchType, buffer: &mut [Handle], required_len: &mut usize) -> Result<()> {
        let handles = self.protocol_db.lock(self).locate_handles(search)?;
        *required_len = handles.len();
        ensure!(buffer.len() >= handles.len(), EfiError::BufferTooSmall);

        buffer[..handles.len()].copy_from_slice(&handles);
        if let SearchType::ByRegisterNotify(registration) = search {
            self.protocol_db.lock(self).next_instance_for_registration(registration);
        }
        Ok(())
    }

    /// Returns the handles matching `search`.
    ///
    /// This function matches the behavior of EFI_BOOT_SERVICES.LocateHandleBuffer() in UEFI spec 2.10 section 7.3.15.
    pub fn locate_handle_buffer(&self, search: SearchType) -> Result<Vec<Handle>> {
        let handles = self.protocol_db.lock(self).locate_handles(search)?;
        if let SearchType::ByRegisterNotify(registration) = search {
            self.protocol_db.lock(self).next_instance_for_registration(registration);
        }
        Ok(handles)
    }

    /// Returns the first interface for `protocol`, or the next one reported for `registration`.
    ///
    /// This function matches the behavior of EFI_BOOT_SERVICES.LocateProtocol() in UEFI spec 2.10 section 7.3.18.
    pub fn locate_protocol(&self, protocol: efi::Guid, registration: Option<Registration>) -> Result<Interface> {
        match registration {
            Some(registration) => {
                let next = self.protocol_db.lock(self).next_instance_for_registration(registration);
                next.map(|(_, interface)| interface).ok_or(EfiError::NotFound)
            }
            None => {
                let (_, interface) = self.protocol_db.lock(self).locate_protocol(protocol)?;
                Ok(interface)
            }
        }
    }

    /// Finds the handle supporting `protocol` whose device path is the longest prefix of `device_path`.
    ///
    /// This function matches the behavior of EFI_BOOT_SERVICES.LocateDevicePath() in UEFI spec 2.10 section 7.3.8.
    /// Returns the handle and the unmatched remainder of `device_path`. Device path interfaces must be installed as
    /// [`DevicePathBuf`].
    ///
    /// ## Errors
    ///
    /// Returns [`EfiError::InvalidParameter`] for an empty path.
    /// Returns [`EfiError::NotFound`] if no handle's device path is a prefix of `device_path`.
    pub fn locate_device_path<'a>(&self, protocol: efi::Guid, device_path: &'a [u8]) -> Result<(Handle, &'a [u8])> {
        ensure!(!device_path.is_empty(), EfiError::InvalidParameter);

        let handles = self.protocol_db.lock(self).locate_handles(SearchType::ByProtocol(protocol))?;

        let mut best_match: Option<(Handle, &'a [u8], usize)> = None;
        for handle in handles {
            let Some(handle_path) = self.device_path_for_handle(handle) else {
                continue;
            };
            let Some((remaining_path, matching_nodes)) = remaining_device_path(handle_path.as_bytes(), device_path)
            else {
                continue;
            };
            if best_match.is_none_or(|(_, _, best_nodes)| matching_nodes > best_nodes) {
                best_match = Some((handle, remaining_path, matching_nodes));
            }
        }

        best_match.map(|(handle, remaining_path, _)| (handle, remaining_path)).ok_or(EfiError::NotFound)
    }

    /// Registers `event` to be signaled whenever an interface for `protocol` is installed or reinstalled.
    ///
    /// This function matches the behavior of EFI_BOOT_SERVICES.RegisterProtocolNotify() in UEFI spec 2.10 section
    /// 7.3.5. The registration is dropped when the event is closed.
    pub fn register_protocol_notify(&self, protocol: efi::Guid, event: Event) -> Result<Registration> {
        ensure!(self.is_valid_event(event), EfiError::InvalidParameter);
        self.protocol_db.lock(self).register_protocol_notify(protocol, event)
    }

    /// Removes a notify registration.
    pub fn unregister_protocol_notify(&self, registration: Registration) -> Result<()> {
        self.protocol_db.lock(self).unregister_protocol_notify(registration)
    }

    /// Returns the handles opened by child controller on `parent_handle`.
    pub fn get_child_handles(&self, parent_handle: Handle) -> Vec<Handle> {
        self.protocol_db.lock(self).get_child_handles(parent_handle)
    }

    /// Current handle database key. Every install, uninstall and reinstall advances it.
    pub fn handle_database_key(&self) -> u64 {
        self.protocol_db.lock(self).handle_database_key()
    }

    /// Returns every protocol with at least one installed interface. Used to evaluate dependency expressions.
    pub fn registered_protocols(&self) -> Vec<efi::Guid> {
        self.protocol_db.lock(self).registered_protocols()
    }

    /// Returns `true` if `handle` exists.
    pub fn is_valid_handle(&self, handle: Handle) -> bool {
        self.protocol_db.lock(self).validate_handle(handle).is_ok()
    }

    pub(crate) fn device_path_for_handle(&self, handle: Handle) -> Option<Rc<DevicePathBuf>> {
        let interface =
            self.protocol_db.lock(self).get_interface_for_handle(handle, efi::protocols::device_path::PROTOCOL_GUID);
        interface.ok()?.downcast::<DevicePathBuf>()
    }

    fn signal_protocol_notifies(&self, events: Vec<Event>) {
        let mut closed_events = Vec::new();
        for event in events {
            if self.signal_event(event) == Err(EfiError::InvalidParameter) {
                //means event doesn't exist (probably closed).
                closed_events.push(event);
            }
        }
        if !closed_events.is_empty() {
            self.protocol_db.lock(self).unregister_protocol_notify_events(&closed_events);
        }
    }

    // Check if the handle/protocol/interface triple is legitimate
    fn check_installed_interface(&self, handle: Handle, protocol: efi::Guid, interface: &Interface) -> Result<()> {
        self.protocol_db.lock(self).validate_handle(handle)?;
        let found = self.protocol_db.lock(self).get_interface_for_handle(handle, protocol)?;
        ensure!(&found == interface, EfiError::NotFound);
        Ok(())
    }

    // Disconnects every driver holding `protocol` on `handle` by driver. Each driver is asked at most once.
    fn disconnect_protocol_users(&self, handle: Handle, protocol: efi::Guid) -> Result<()> {
        let mut disconnected = BTreeSet::new();
        loop {
            let usages =
                self.protocol_db.lock(self).get_open_protocol_information_by_protocol(handle, protocol).unwrap_or_default();
            let Some(driver) = usages
                .iter()
                .filter(|usage| usage.is_by_driver())
                .filter_map(|usage| usage.agent_handle)
                .find(|driver| !disconnected.contains(driver))
            else {
                return Ok(());
            };
            disconnected.insert(driver);
            self.disconnect_controller(handle, Some(driver), None)?;
        }
    }

    fn is_duplicate_device_path(&self, interface: &Interface) -> bool {
        let Some(device_path) = interface.downcast::<DevicePathBuf>() else {
            return false;
        };
        match self.locate_device_path(efi::protocols::device_path::PROTOCOL_GUID, device_path.as_bytes()) {
            Ok((_, remaining_path)) => is_device_path_end(remaining_path),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use std::{cell::RefCell, rc::Rc, vec, vec::Vec};

    use efi::protocols::device_path::{Hardware, TYPE_HARDWARE};

    use super::*;
    use crate::{config::CoreConfig, test_support::test_guid, NotifyFn};

    fn guid1() -> efi::Guid {
        test_guid("0e896c7a-57dc-4987-bc22-abc3a8263210")
    }

    fn guid2() -> efi::Guid {
        test_guid("9c5dca1d-ac0f-46db-9eba-2bc961c711a2")
    }

    fn pci_path(nodes: &[(u8, u8)]) -> DevicePathBuf {
        let mut path = DevicePathBuf::new();
        for (func, dev) in nodes {
            path.push_node(TYPE_HARDWARE, Hardware::SUBTYPE_PCI, &[*func, *dev]);
        }
        path
    }

    #[test]
    fn install_then_handle_protocol_should_return_same_interface() {
        let core = Core::new(CoreConfig::default());
        let interface = Interface::new(42u32);
        let handle = core.install_protocol_interface(None, guid1(), interface.clone()).unwrap();
        let found = core.handle_protocol(handle, guid1()).unwrap();
        assert_eq!(found, interface);
        assert_eq!(*found.downcast::<u32>().unwrap(), 42);

        let info = core.open_protocol_information(handle, guid1()).unwrap();
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].agent_handle, Some(DXE_CORE_HANDLE));
        assert_eq!(core.handle_protocol(handle, guid2()), Err(EfiError::Unsupported));
    }

    #[test]
    fn install_twice_on_same_handle_should_fail() {
        let core = Core::new(CoreConfig::default());
        let handle = core.install_protocol_interface(None, guid1(), Interface::new(1u8)).unwrap();
        assert_eq!(
            core.install_protocol_interface(Some(handle), guid1(), Interface::new(2u8)),
            Err(EfiError::InvalidParameter)
        );
    }

    #[test]
    fn install_should_signal_notify_and_registration_should_report_each_handle_once() {
        let core = Core::new(CoreConfig::default());
        let reported = Rc::new(RefCell::new(Vec::new()));
        let registration = Rc::new(RefCell::new(None));

        let notify_reported = reported.clone();
        let notify_registration = registration.clone();
        let notify: NotifyFn = Rc::new(move |core: &Core, _| {
            let registration = notify_registration.borrow().unwrap();
            while let Ok(handles) = core.locate_handle_buffer(SearchType::ByRegisterNotify(registration)) {
                notify_reported.borrow_mut().extend(handles);
            }
        });
        let event = core.create_event(efi::EVT_NOTIFY_SIGNAL, efi::TPL_CALLBACK, Some(notify)).unwrap();
        *registration.borrow_mut() = Some(core.register_protocol_notify(guid1(), event).unwrap());

        let h1 = core.install_protocol_interface(None, guid1(), Interface::new(1u8)).unwrap();
        let old = core.raise_tpl(efi::TPL_CALLBACK);
        let h2 = core.install_protocol_interface(None, guid1(), Interface::new(2u8)).unwrap();
        let h3 = core.install_protocol_interface(None, guid1(), Interface::new(3u8)).unwrap();
        core.restore_tpl(old);

        assert_eq!(*reported.borrow(), vec![h1, h2, h3]);
    }

    #[test]
    fn closed_notify_event_should_be_unregistered() {
        let core = Core::new(CoreConfig::default());
        let event = core.create_event(0, efi::TPL_APPLICATION, None).unwrap();
        let registration = core.register_protocol_notify(guid1(), event).unwrap();
        core.close_event(event).unwrap();
        assert_eq!(core.unregister_protocol_notify(registration), Err(EfiError::InvalidParameter));
        assert_eq!(core.register_protocol_notify(guid1(), event), Err(EfiError::InvalidParameter));
        core.install_protocol_interface(None, guid1(), Interface::new(1u8)).unwrap();
    }

    #[test]
    fn uninstall_should_check_interface_identity_and_destroy_empty_handle() {
        let core = Core::new(CoreConfig::default());
        let interface = Interface::new(5u32);
        let handle = core.install_protocol_interface(None, guid1(), interface.clone()).unwrap();
        core.handle_protocol(handle, guid1()).unwrap();

        assert_eq!(core.uninstall_protocol_interface(handle, guid1(), &Interface::new(5u32)), Err(EfiError::NotFound));
        assert_eq!(core.uninstall_protocol_interface(handle, guid2(), &interface), Err(EfiError::NotFound));
        core.uninstall_protocol_interface(handle, guid1(), &interface).unwrap();
        assert!(!core.is_valid_handle(handle));
        assert_eq!(core.uninstall_protocol_interface(handle, guid1(), &interface), Err(EfiError::InvalidParameter));
    }

    #[test]
    fn uninstall_should_be_denied_while_held_exclusively() {
        let core = Core::new(CoreConfig::default());
        let interface = Interface::new(5u32);
        let handle = core.install_protocol_interface(None, guid1(), interface.clone()).unwrap();
        let agent = core.install_protocol_interface(None, guid2(), Interface::null()).unwrap();
        core.open_protocol(handle, guid1(), Some(agent), None, efi::OPEN_PROTOCOL_EXCLUSIVE).unwrap();

        assert_eq!(core.uninstall_protocol_interface(handle, guid1(), &interface), Err(EfiError::AccessDenied));
        core.close_protocol(handle, guid1(), agent, None).unwrap();
        core.uninstall_protocol_interface(handle, guid1(), &interface).unwrap();
    }

    #[test]
    fn reinstall_should_swap_interface_and_signal_notify() {
        let core = Core::new(CoreConfig::default());
        let count = Rc::new(RefCell::new(0));
        let inner = count.clone();
        let notify: NotifyFn = Rc::new(move |_, _| *inner.borrow_mut() += 1);
        let event = core.create_event(efi::EVT_NOTIFY_SIGNAL, efi::TPL_CALLBACK, Some(notify)).unwrap();

        let old = Interface::new(1u8);
        let handle = core.install_protocol_interface(None, guid1(), old.clone()).unwrap();
        core.register_protocol_notify(guid1(), event).unwrap();

        let new = Interface::new(2u8);
        core.reinstall_protocol_interface(handle, guid1(), &old, new.clone()).unwrap();
        assert_eq!(core.handle_protocol(handle, guid1()).unwrap(), new);
        assert_eq!(*count.borrow(), 1);

        assert_eq!(core.reinstall_protocol_interface(handle, guid1(), &old, Interface::new(3u8)), Err(EfiError::NotFound));
    }

    #[test]
    fn install_multiple_should_roll_back_on_failure() {
        let core = Core::new(CoreConfig::default());
        let existing = core.install_protocol_interface(None, guid2(), Interface::new(0u8)).unwrap();

        let result = core.install_multiple_protocol_interfaces(
            Some(existing),
            &[(guid1(), Interface::new(1u8)), (guid2(), Interface::new(2u8))],
        );
        assert_eq!(result, Err(EfiError::InvalidParameter));
        assert_eq!(core.protocols_per_handle(existing).unwrap(), vec![guid2()]);

        let handle = core
            .install_multiple_protocol_interfaces(None, &[(guid1(), Interface::new(1u8)), (guid2(), Interface::new(2u8))])
            .unwrap();
        assert_eq!(core.protocols_per_handle(handle).unwrap(), vec![guid2(), guid1()]);
        assert_eq!(core.install_multiple_protocol_interfaces(None, &[]), Err(EfiError::InvalidParameter));
    }

    #[test]
    fn install_multiple_should_reject_duplicate_device_path() {
        let core = Core::new(CoreConfig::default());
        let device_path_guid = efi::protocols::device_path::PROTOCOL_GUID;
        core.install_protocol_interface(None, device_path_guid, Interface::new(pci_path(&[(0, 1)]))).unwrap();

        let result = core.install_multiple_protocol_interfaces(
            None,
            &[(guid1(), Interface::new(1u8)), (device_path_guid, Interface::new(pci_path(&[(0, 1)])))],
        );
        assert_eq!(result, Err(EfiError::AlreadyStarted));
        assert_eq!(core.locate_handle_buffer(SearchType::ByProtocol(guid1())), Err(EfiError::NotFound));

        core.install_multiple_protocol_interfaces(None, &[(device_path_guid, Interface::new(pci_path(&[(0, 1), (0, 2)])))])
            .unwrap();
    }

    #[test]
    fn uninstall_multiple_should_reinstall_on_failure() {
        let core = Core::new(CoreConfig::default());
        let one = Interface::new(1u8);
        let two = Interface::new(2u8);
        let handle =
            core.install_multiple_protocol_interfaces(None, &[(guid1(), one.clone()), (guid2(), two.clone())]).unwrap();

        let result =
            core.uninstall_multiple_protocol_interfaces(handle, &[(guid1(), one.clone()), (guid2(), Interface::new(9u8))]);
        assert_eq!(result, Err(EfiError::InvalidParameter));
        assert_eq!(core.handle_protocol(handle, guid1()).unwrap(), one);

        core.uninstall_multiple_protocol_interfaces(handle, &[(guid1(), one), (guid2(), two)]).unwrap();
        assert!(!core.is_valid_handle(handle));
    }

    #[test]
    fn uninstall_multiple_should_keep_last_protocol_when_another_is_absent() {
        let core = Core::new(CoreConfig::default());
        let only = Interface::new(1u8);
        let handle = core.install_protocol_interface(None, guid1(), only.clone()).unwrap();

        let result =
            core.uninstall_multiple_protocol_interfaces(handle, &[(guid1(), only.clone()), (guid2(), Interface::new(2u8))]);
        assert_eq!(result, Err(EfiError::InvalidParameter));
        assert!(core.is_valid_handle(handle));
        assert_eq!(core.handle_protocol(handle, guid1()).unwrap(), only);
        assert_eq!(core.locate_handle_buffer(SearchType::ByProtocol(guid1())).unwrap(), vec![handle]);
    }

    #[test]
    fn uninstall_multiple_should_restore_interfaces_after_handle_is_emptied() {
        let core = Core::new(CoreConfig::default());
        let only = Interface::new(1u8);
        let handle = core.install_protocol_interface(None, guid1(), only.clone()).unwrap();

        // the second removal fails once the first has emptied and destroyed the handle.
        let result = core.uninstall_multiple_protocol_interfaces(handle, &[(guid1(), only.clone()), (guid1(), only.clone())]);
        assert_eq!(result, Err(EfiError::InvalidParameter));
        assert_eq!(core.locate_protocol(guid1(), None).unwrap(), only);
        assert_eq!(core.locate_handle_buffer(SearchType::ByProtocol(guid1())).unwrap().len(), 1);
    }

    #[test]
    fn locate_handle_should_report_required_size() {
        let core = Core::new(CoreConfig::default());
        let h1 = core.install_protocol_interface(None, guid1(), Interface::new(1u8)).unwrap();
        let h2 = core.install_protocol_interface(None, guid1(), Interface::new(2u8)).unwrap();

        let mut required = 0;
        let mut small = [DXE_CORE_HANDLE; 1];
        assert_eq!(
            core.locate_handle(SearchType::ByProtocol(guid1()), &mut small, &mut required),
            Err(EfiError::BufferTooSmall)
        );
        assert_eq!(required, 2);

        let mut buffer = [DXE_CORE_HANDLE; 4];
        core.locate_handle(SearchType::ByProtocol(guid1()), &mut buffer, &mut required).unwrap();
        assert_eq!(&buffer[..required], &[h1, h2]);

        assert_eq!(
            core.locate_handle(SearchType::ByProtocol(guid2()), &mut buffer, &mut required),
            Err(EfiError::NotFound)
        );
    }

    #[test]
    fn locate_handle_by_register_notify_should_advance_only_on_success() {
        let core = Core::new(CoreConfig::default());
        let event = core.create_event(0, efi::TPL_APPLICATION, None).unwrap();
        let registration = core.register_protocol_notify(guid1(), event).unwrap();
        let h1 = core.install_protocol_interface(None, guid1(), Interface::new(1u8)).unwrap();

        let mut required = 0;
        let mut empty: [Handle; 0] = [];
        assert_eq!(
            core.locate_handle(SearchType::ByRegisterNotify(registration), &mut empty, &mut required),
            Err(EfiError::BufferTooSmall)
        );
        let mut buffer = [DXE_CORE_HANDLE; 1];
        core.locate_handle(SearchType::ByRegisterNotify(registration), &mut buffer, &mut required).unwrap();
        assert_eq!(buffer[0], h1);
        assert_eq!(
            core.locate_handle(SearchType::ByRegisterNotify(registration), &mut buffer, &mut required),
            Err(EfiError::NotFound)
        );
    }

    #[test]
    fn locate_protocol_should_follow_registration() {
        let core = Core::new(CoreConfig::default());
        assert_eq!(core.locate_protocol(guid1(), None), Err(EfiError::NotFound));

        let event = core.create_event(0, efi::TPL_APPLICATION, None).unwrap();
        let registration = core.register_protocol_notify(guid1(), event).unwrap();
        let first = Interface::new(1u8);
        let second = Interface::new(2u8);
        core.install_protocol_interface(None, guid1(), first.clone()).unwrap();
        core.install_protocol_interface(None, guid1(), second.clone()).unwrap();

        assert_eq!(core.locate_protocol(guid1(), None).unwrap(), first);
        assert_eq!(core.locate_protocol(guid1(), Some(registration)).unwrap(), first);
        assert_eq!(core.locate_protocol(guid1(), Some(registration)).unwrap(), second);
        assert_eq!(core.locate_protocol(guid1(), Some(registration)), Err(EfiError::NotFound));
    }

    #[test]
    fn locate_device_path_should_pick_longest_prefix() {
        let core = Core::new(CoreConfig::default());
        let device_path_guid = efi::protocols::device_path::PROTOCOL_GUID;
        let root = core.install_protocol_interface(None, device_path_guid, Interface::new(pci_path(&[(0, 1)]))).unwrap();
        let bridge =
            core.install_protocol_interface(None, device_path_guid, Interface::new(pci_path(&[(0, 1), (0, 2)]))).unwrap();
        core.install_protocol_interface(None, device_path_guid, Interface::new(pci_path(&[(0, 3)]))).unwrap();

        let target = pci_path(&[(0, 1), (0, 2), (0, 4)]);
        let (handle, remaining) = core.locate_device_path(device_path_guid, target.as_bytes()).unwrap();
        assert_eq!(handle, bridge);
        assert_eq!(remaining, pci_path(&[(0, 4)]).as_bytes());

        let target = pci_path(&[(0, 1), (0, 5)]);
        assert_eq!(core.locate_device_path(device_path_guid, target.as_bytes()).unwrap().0, root);

        let target = pci_path(&[(0, 9)]);
        assert_eq!(core.locate_device_path(device_path_guid, target.as_bytes()), Err(EfiError::NotFound));
        assert_eq!(core.locate_device_path(device_path_guid, &[]), Err(EfiError::InvalidParameter));

        //only handles that also support the requested protocol are considered.
        core.install_protocol_interface(Some(root), guid1(), Interface::new(1u8)).unwrap();
        let target = pci_path(&[(0, 1), (0, 2), (0, 4)]);
        assert_eq!(core.locate_device_path(guid1(), target.as_bytes()).unwrap().0, root);
    }

    #[test]
    fn protocols_per_handle_should_list_most_recent_first() {
        let core = Core::new(CoreConfig::default());
        let handle = core.install_protocol_interface(None, guid1(), Interface::new(1u8)).unwrap();
        core.install_protocol_interface(Some(handle), guid2(), Interface::new(2u8)).unwrap();
        assert_eq!(core.protocols_per_handle(handle).unwrap(), vec![guid2(), guid1()]);
        assert!(core.protocols_per_handle(DXE_CORE_HANDLE).is_ok());
    }

    #[test]
    fn handle_database_key_should_advance_on_changes() {
        let core = Core::new(CoreConfig::default());
        let key = core.handle_database_key();
        let interface = Interface::new(1u8);
        let handle = core.install_protocol_interface(None, guid1(), interface.clone()).unwrap();
        assert!(core.handle_database_key() > key);
        let key = core.handle_database_key();
        core.uninstall_protocol_interface(handle, guid1(), &interface).unwrap();
        assert!(core.handle_database_key() > key);
    }

    #[test]
    fn registered_protocols_should_track_installed_interfaces() {
        let core = Core::new(CoreConfig::default());
        let interface = Interface::new(1u8);
        let handle = core.install_protocol_interface(None, guid1(), interface.clone()).unwrap();
        assert!(core.registered_protocols().contains(&guid1()));
        assert!(!core.registered_protocols().contains(&guid2()));

        core.uninstall_protocol_interface(handle, guid1(), &interface).unwrap();
        assert!(!core.registered_protocols().contains(&guid1()));
    }
}
