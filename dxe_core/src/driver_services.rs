//! Core Driver Services
//!
//! Connects drivers to controllers and disconnects them again, following UEFI spec 2.10 sections 7.3.12 and 7.3.13.
//! Drivers take part by installing a [`DriverBindingProtocol`] instance; platforms and bus drivers can steer the order
//! in which drivers are tried with the override protocols defined here.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::{collections::BTreeSet, rc::Rc, vec::Vec};
use core::fmt;

use r_efi::efi;
use uefi_device_path::is_device_path_end;
use uefi_protocol_db::{Handle, Interface, SearchType};
use uefi_sdk::{
    ensure,
    error::{EfiError, Result},
};

use crate::Core;

/// Driver entry points invoked by the connection engine.
///
/// Each function receives the core so the driver can open, close, install and uninstall protocols.
pub trait DriverBinding {
    /// Tests whether the driver can manage `controller`. Must not leave the controller's protocols open.
    fn supported(
        &self,
        core: &Core,
        driver_binding_handle: Handle,
        controller: Handle,
        remaining_device_path: Option<&[u8]>,
    ) -> Result<()>;

    /// Starts managing `controller`. Protocols consumed from the controller are opened by driver with the driver
    /// binding handle as agent.
    fn start(
        &self,
        core: &Core,
        driver_binding_handle: Handle,
        controller: Handle,
        remaining_device_path: Option<&[u8]>,
    ) -> Result<()>;

    /// Stops managing `controller`, or only the listed children of it when `children` is not empty. The driver
    /// closes its own open records.
    fn stop(&self, core: &Core, driver_binding_handle: Handle, controller: Handle, children: &[Handle]) -> Result<()>;
}

/// The interface installed under `efi::protocols::driver_binding::PROTOCOL_GUID`.
#[derive(Clone)]
pub struct DriverBindingProtocol {
    /// Drivers with higher versions are tried first.
    pub version: u32,
    /// The image that produced this binding.
    pub image_handle: Handle,
    /// The handle the binding is installed on. Used as the agent handle for the driver's opens.
    pub driver_binding_handle: Handle,
    pub binding: Rc<dyn DriverBinding>,
}

impl fmt::Debug for DriverBindingProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverBindingProtocol")
            .field("version", &self.version)
            .field("image_handle", &self.image_handle)
            .field("driver_binding_handle", &self.driver_binding_handle)
            .finish()
    }
}

/// Platform-wide driver preference for a controller.
pub trait PlatformDriverOverride {
    /// Returns the image handle that follows `previous` in the preference list for `controller`, or `None` at the
    /// end of the list.
    fn get_driver(&self, controller: Handle, previous: Option<Handle>) -> Option<Handle>;
}

/// The interface installed under `efi::protocols::platform_driver_override::PROTOCOL_GUID`.
#[derive(Clone)]
pub struct PlatformDriverOverrideProtocol(pub Rc<dyn PlatformDriverOverride>);

/// Bus driver preference, installed on the controller it applies to.
pub trait BusSpecificDriverOverride {
    /// Returns the image handle that follows `previous` in the preference list, or `None` at the end of the list.
    fn get_driver(&self, previous: Option<Handle>) -> Option<Handle>;
}

/// The interface installed under `efi::protocols::bus_specific_driver_override::PROTOCOL_GUID`.
#[derive(Clone)]
pub struct BusSpecificDriverOverrideProtocol(pub Rc<dyn BusSpecificDriverOverride>);

/// Driver family version, installed on a driver binding handle.
pub trait DriverFamilyOverride {
    fn get_version(&self) -> u32;
}

/// The interface installed under `efi::protocols::driver_family_override::PROTOCOL_GUID`.
#[derive(Clone)]
pub struct DriverFamilyOverrideProtocol(pub Rc<dyn DriverFamilyOverride>);

/// Loads and starts any modules whose dependencies are now satisfied.
///
/// Registered with [`Core::register_module_dispatch`] so that [`Core::connect_device_path`] can make forward progress
/// when no driver for the next device path node is loaded yet.
pub trait ModuleDispatch {
    /// Runs one dispatch pass. Returns [`EfiError::NotFound`] if nothing was dispatched.
    fn dispatch(&self, core: &Core) -> Result<()>;
}

impl Core {
    /// Installs a driver binding for `binding` on `driver_binding_handle`, or on `image_handle` if none is given.
    pub fn install_driver_binding(
        &self,
        image_handle: Handle,
        driver_binding_handle: Option<Handle>,
        version: u32,
        binding: Rc<dyn DriverBinding>,
    ) -> Result<Handle> {
        let driver_binding_handle = driver_binding_handle.unwrap_or(image_handle);
        let protocol = DriverBindingProtocol { version, image_handle, driver_binding_handle, binding };
        self.install_protocol_interface(
            Some(driver_binding_handle),
            efi::protocols::driver_binding::PROTOCOL_GUID,
            Interface::new(protocol),
        )
    }

    /// Registers the dispatcher used by [`connect_device_path`](Core::connect_device_path).
    pub fn register_module_dispatch(&self, dispatch: Rc<dyn ModuleDispatch>) {
        self.module_dispatch.replace(Some(dispatch));
    }

    /// Connects drivers to a controller.
    ///
    /// This function matches the behavior of EFI_BOOT_SERVICES.ConnectController() in UEFI spec 2.10 section 7.3.12.
    /// `driver_image_handles` are tried first, in order. If `recursive` is set, every child created for the controller
    /// is connected too; failures connecting children are ignored.
    ///
    /// Driver bindings that are valid when this is called must remain valid until it returns.
    ///
    /// ## Errors
    ///
    /// Returns [`EfiError::InvalidParameter`] if `handle` is not a valid handle.
    /// Returns [`EfiError::NotFound`] if no driver was started and the remaining device path is not an end node.
    pub fn connect_controller(
        &self,
        handle: Handle,
        driver_image_handles: &[Handle],
        remaining_device_path: Option<&[u8]>,
        recursive: bool,
    ) -> Result<()> {
        let return_status = loop {
            match self.connect_single_controller(handle, driver_image_handles, remaining_device_path) {
                Err(EfiError::NotReady) => log::info!("Driver bindings changed while connecting {:?}; retrying.", handle),
                status => break status,
            }
        };

        if recursive {
            for child in self.get_child_handles(handle) {
                //ignore the return value to match behavior of edk2 reference.
                let _ = self.connect_controller(child, &[], None, true);
            }
        }

        return_status
    }

    /// Disconnects drivers from a controller.
    ///
    /// This function matches the behavior of EFI_BOOT_SERVICES.DisconnectController() in UEFI spec 2.10 section
    /// 7.3.13. With no `driver_image_handle`, every driver managing the controller is stopped. With a `child_handle`,
    /// only that child is stopped, and the driver itself only if it was the driver's only child.
    ///
    /// ## Errors
    ///
    /// Returns [`EfiError::InvalidParameter`] for invalid handles, or if a managing driver no longer has a driver
    /// binding.
    /// Returns [`EfiError::NotFound`] if there were drivers to stop but none stopped successfully.
    pub fn disconnect_controller(
        &self,
        controller_handle: Handle,
        driver_image_handle: Option<Handle>,
        child_handle: Option<Handle>,
    ) -> Result<()> {
        ensure!(self.is_valid_handle(controller_handle), EfiError::InvalidParameter);
        if let Some(handle) = driver_image_handle {
            ensure!(self.is_valid_handle(handle), EfiError::InvalidParameter);
        }
        if let Some(handle) = child_handle {
            ensure!(self.is_valid_handle(handle), EfiError::InvalidParameter);
        }

        // determine which driver_handles should be stopped.
        let controller_info = self.protocol_db.lock(self).get_open_protocol_information(controller_handle);
        let mut drivers_managing_controller: Vec<Handle> = controller_info
            .unwrap_or_default()
            .iter()
            .flat_map(|(_, open_info)| {
                open_info.iter().filter(|info| info.is_by_driver()).filter_map(|info| info.agent_handle)
            })
            .collect();

        // remove duplicates but preserve ordering.
        let mut driver_set = BTreeSet::new();
        drivers_managing_controller.retain(|x| driver_set.insert(*x));

        // if the driver image was specified, only disconnect that one (if it is actually managing it)
        if let Some(driver) = driver_image_handle {
            drivers_managing_controller.retain(|x| *x == driver);
        }

        let mut one_or_more_drivers_disconnected = false;
        let no_drivers = drivers_managing_controller.is_empty();
        for driver_handle in drivers_managing_controller {
            let controller_info = self.protocol_db.lock(self).get_open_protocol_information(controller_handle);
            let Ok(controller_info) = controller_info else {
                continue;
            };

            // Determine whether this driver still has the controller open by driver, and what child handles it has
            // open (if any).
            let mut driver_valid = false;
            let mut child_handles = Vec::new();
            for (_guid, open_info) in controller_info.iter() {
                for info in open_info.iter().filter(|info| info.agent_handle == Some(driver_handle)) {
                    if info.is_by_driver() {
                        driver_valid = true;
                    }
                    if info.is_by_child_controller() {
                        child_handles.extend(info.controller_handle);
                    }
                }
            }

            // Closed as a side effect of stopping an earlier driver in the list.
            if !driver_valid {
                continue;
            }

            // remove duplicates but preserve ordering.
            let mut child_set = BTreeSet::new();
            child_handles.retain(|x| child_set.insert(*x));

            let total_children = child_handles.len();
            let mut is_only_child = false;
            if let Some(handle) = child_handle {
                // a child this driver did not create is not in its scope.
                if !child_handles.contains(&handle) {
                    continue;
                }
                //if the child was specified, but was the only child, then the driver should be disconnected.
                //if the child was specified, but other children were present, then the driver should not be
                //disconnected.
                child_handles.retain(|x| x == &handle);
                is_only_child = total_children == child_handles.len();
            }

            // A driver that uninstalled its own binding while still managing the controller cannot be stopped. This
            // leaves the controller un-disconnect-able, as in the reference implementation.
            let driver_binding = self.driver_binding_for_handle(driver_handle).ok_or(EfiError::InvalidParameter)?;

            let mut status = Ok(());
            if !child_handles.is_empty() {
                log::info!("Stopping children {:?} of {:?} in {:?}", child_handles, controller_handle, driver_handle);
                status = driver_binding.binding.stop(self, driver_handle, controller_handle, &child_handles);
            }
            if status.is_ok() && (child_handle.is_none() || is_only_child) {
                log::info!("Stopping {:?} on {:?}", driver_handle, controller_handle);
                status = driver_binding.binding.stop(self, driver_handle, controller_handle, &[]);
            }
            match status {
                Ok(()) => one_or_more_drivers_disconnected = true,
                Err(err) => log::warn!("{:?} failed to stop on {:?}: {:?}", driver_handle, controller_handle, err),
            }
        }

        if one_or_more_drivers_disconnected || no_drivers {
            Ok(())
        } else {
            Err(EfiError::NotFound)
        }
    }

    /// Connects controllers along `device_path` until a handle with the entire path exists.
    ///
    /// Each pass connects the handle whose device path is the longest prefix of `device_path`. When a pass makes no
    /// progress, the registered [`ModuleDispatch`] is asked to load more drivers. Returns the handle that matches the
    /// entire path.
    ///
    /// ## Errors
    ///
    /// Returns [`EfiError::NotFound`] if no handle matches any prefix of the path, or if no progress can be made and
    /// no dispatcher is registered, the dispatcher has nothing left to do, or the configured number of dispatch
    /// attempts is used up.
    pub fn connect_device_path(&self, device_path: &[u8]) -> Result<Handle> {
        let mut previous_handle = None;
        let mut dispatch_attempts = 0;
        loop {
            let (handle, remaining_path) =
                self.locate_device_path(efi::protocols::device_path::PROTOCOL_GUID, device_path)?;

            if previous_handle == Some(handle) {
                // If no forward progress is made try invoking the dispatcher.
                let dispatcher = self.module_dispatch.borrow().clone().ok_or(EfiError::NotFound)?;
                ensure!(dispatch_attempts < self.config.connect_device_path_attempts, EfiError::NotFound);
                dispatch_attempts += 1;
                log::info!("No progress connecting {:?}; dispatching (attempt {})", handle, dispatch_attempts);
                dispatcher.dispatch(self)?;
            }
            previous_handle = Some(handle);

            let _ = self.connect_controller(handle, &[], Some(remaining_path), false);

            if is_device_path_end(remaining_path) {
                return Ok(handle);
            }
        }
    }

    /// Recursively connects every handle modified since the handle database key was `key`.
    pub fn connect_handles_by_key(&self, key: u64) {
        let handles = self.protocol_db.lock(self).handles_modified_since(key);
        for handle in handles {
            if self.is_valid_handle(handle) {
                let _ = self.connect_controller(handle, &[], None, true);
            }
        }
    }

    fn connect_single_controller(
        &self,
        controller_handle: Handle,
        driver_image_handles: &[Handle],
        remaining_device_path: Option<&[u8]>,
    ) -> Result<()> {
        ensure!(self.is_valid_handle(controller_handle), EfiError::InvalidParameter);

        let all_bindings = self.all_driver_bindings();
        let binding_count = all_bindings.len();

        //The following sources for driver instances are considered per UEFI Spec 2.10 section 7.3.12:
        //1. Context Override
        let mut driver_candidates = bindings_for_images(&all_bindings, driver_image_handles);

        //2. Platform Driver Override
        let platform_images = self.platform_override_images(controller_handle);
        append_unique(&mut driver_candidates, bindings_for_images(&all_bindings, &platform_images));

        //3. Driver Family Override Search
        append_unique(&mut driver_candidates, self.family_override_bindings(&all_bindings));

        //4. Bus Specific Driver Override
        let bus_images = self.bus_override_images(controller_handle);
        append_unique(&mut driver_candidates, bindings_for_images(&all_bindings, &bus_images));

        //5. Driver Binding Search
        let mut sorted_bindings = all_bindings;
        sorted_bindings.sort_by(|a, b| b.version.cmp(&a.version));
        append_unique(&mut driver_candidates, sorted_bindings);

        // an override may have loaded new drivers; start over so they are considered.
        if self.all_driver_bindings().len() > binding_count {
            return Err(EfiError::NotReady);
        }

        //loop until no more drivers can be started on handle.
        let mut one_started = false;
        loop {
            let supported = driver_candidates.iter().position(|candidate| {
                candidate
                    .binding
                    .supported(self, candidate.driver_binding_handle, controller_handle, remaining_device_path)
                    .is_ok()
            });
            let Some(index) = supported else {
                break;
            };

            let candidate = driver_candidates.remove(index);
            log::info!("Starting {:?} on {:?}", candidate.driver_binding_handle, controller_handle);
            match candidate.binding.start(self, candidate.driver_binding_handle, controller_handle, remaining_device_path)
            {
                Ok(()) => one_started = true,
                Err(err) => log::warn!(
                    "{:?} failed to start on {:?}: {:?}",
                    candidate.driver_binding_handle,
                    controller_handle,
                    err
                ),
            }
        }

        if one_started {
            return Ok(());
        }

        if remaining_device_path.is_some_and(is_device_path_end) {
            return Ok(());
        }

        Err(EfiError::NotFound)
    }

    fn driver_binding_for_handle(&self, handle: Handle) -> Option<Rc<DriverBindingProtocol>> {
        let interface =
            self.protocol_db.lock(self).get_interface_for_handle(handle, efi::protocols::driver_binding::PROTOCOL_GUID);
        interface.ok()?.downcast::<DriverBindingProtocol>()
    }

    fn all_driver_bindings(&self) -> Vec<Rc<DriverBindingProtocol>> {
        let handles = self
            .protocol_db
            .lock(self)
            .locate_handles(SearchType::ByProtocol(efi::protocols::driver_binding::PROTOCOL_GUID))
            .unwrap_or_default();
        handles.into_iter().filter_map(|handle| self.driver_binding_for_handle(handle)).collect()
    }

    fn platform_override_images(&self, controller_handle: Handle) -> Vec<Handle> {
        let interface = self.protocol_db.lock(self).locate_protocol(efi::protocols::platform_driver_override::PROTOCOL_GUID);
        let Some(platform_override) =
            interface.ok().and_then(|(_, interface)| interface.downcast::<PlatformDriverOverrideProtocol>())
        else {
            return Vec::new();
        };
        collect_override_images(|previous| platform_override.0.get_driver(controller_handle, previous))
    }

    fn bus_override_images(&self, controller_handle: Handle) -> Vec<Handle> {
        let interface = self
            .protocol_db
            .lock(self)
            .get_interface_for_handle(controller_handle, efi::protocols::bus_specific_driver_override::PROTOCOL_GUID);
        let Some(bus_override) = interface.ok().and_then(|interface| interface.downcast::<BusSpecificDriverOverrideProtocol>())
        else {
            return Vec::new();
        };
        collect_override_images(|previous| bus_override.0.get_driver(previous))
    }

    // bindings whose handle carries a driver family override, highest family version first.
    fn family_override_bindings(&self, all_bindings: &[Rc<DriverBindingProtocol>]) -> Vec<Rc<DriverBindingProtocol>> {
        let mut family_bindings: Vec<(u32, Rc<DriverBindingProtocol>)> = all_bindings
            .iter()
            .filter_map(|binding| {
                let interface = self.protocol_db.lock(self).get_interface_for_handle(
                    binding.driver_binding_handle,
                    efi::protocols::driver_family_override::PROTOCOL_GUID,
                );
                let family = interface.ok()?.downcast::<DriverFamilyOverrideProtocol>()?;
                Some((family.0.get_version(), binding.clone()))
            })
            .collect();
        family_bindings.sort_by(|a, b| b.0.cmp(&a.0));
        family_bindings.into_iter().map(|(_, binding)| binding).collect()
    }
}

fn bindings_for_images(
    all_bindings: &[Rc<DriverBindingProtocol>],
    image_handles: &[Handle],
) -> Vec<Rc<DriverBindingProtocol>> {
    image_handles
        .iter()
        .flat_map(|image| all_bindings.iter().filter(move |binding| binding.image_handle == *image))
        .cloned()
        .collect()
}

fn append_unique(candidates: &mut Vec<Rc<DriverBindingProtocol>>, additional: Vec<Rc<DriverBindingProtocol>>) {
    for binding in additional {
        if !candidates.iter().any(|existing| existing.driver_binding_handle == binding.driver_binding_handle) {
            candidates.push(binding);
        }
    }
}

fn collect_override_images(mut get_driver: impl FnMut(Option<Handle>) -> Option<Handle>) -> Vec<Handle> {
    let mut images = Vec::new();
    let mut previous = None;
    while let Some(image) = get_driver(previous) {
        if images.contains(&image) {
            log::warn!("Driver override returned {:?} twice; ignoring the rest of the list.", image);
            break;
        }
        images.push(image);
        previous = Some(image);
    }
    images
}
