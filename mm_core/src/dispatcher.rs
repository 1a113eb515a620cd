//! MM Module Dispatcher
//!
//! Modules are discovered with [`MmCore::add_module`] and move through three states: dependent until their
//! dependency expression is satisfied, scheduled once it is, and initialized after a load and start has been
//! attempted, whatever the outcome. A module whose expression is `BEFORE X` or `AFTER X` is never evaluated; it is
//! scheduled immediately before or after X when X itself is scheduled.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::{
    collections::{BTreeSet, VecDeque},
    vec::Vec,
};
use core::{fmt, mem};

use dxe_core::{Handle, Interface};
use r_efi::efi;
use uefi_allocator::{page_allocator::AllocateType, uefi_size_to_pages};
use uefi_depex::{AssociatedDependency, Depex};
use uefi_sdk::{
    error::{EfiError, Result},
    guid::FmtGuid,
};

use crate::MmCore;

/// A module found in a firmware volume, ready to be handed to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverEntry {
    /// The file name of the module. Before and After expressions refer to modules by this name.
    pub file_name: efi::Guid,
    /// The module's dependency expression. A module without one is dispatched as soon as it is discovered.
    pub depex: Option<Depex>,
    /// The PE32 image.
    pub image: Vec<u8>,
}

/// Where a discovered module is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    /// Waiting for its dependency expression, its Before/After target, or a schedule request.
    Dependent,
    /// Queued for loading.
    Scheduled,
    /// Load and start were attempted.
    Initialized,
}

/// Errors from [`MmCore::dispatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    Efi(EfiError),
    /// Scheduling the named module would require scheduling it before itself.
    DependencyCycle(efi::Guid),
}

impl From<EfiError> for DispatchError {
    fn from(err: EfiError) -> Self {
        DispatchError::Efi(err)
    }
}

impl From<DispatchError> for EfiError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Efi(err) => err,
            DispatchError::DependencyCycle(_) => EfiError::Aborted,
        }
    }
}

impl From<DispatchError> for efi::Status {
    fn from(err: DispatchError) -> Self {
        EfiError::from(err).into()
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::Efi(err) => write!(f, "{}", err),
            DispatchError::DependencyCycle(file_name) => {
                write!(f, "dependency cycle through module {}", FmtGuid(file_name))
            }
        }
    }
}

/// Loads and runs module images on behalf of the dispatcher.
#[cfg_attr(test, mockall::automock)]
pub trait ImageLoader {
    /// Copies `image` into the pages at `base` and relocates it there. Returns the entry point address.
    fn load_image(&self, file_name: &efi::Guid, image: &[u8], base: u64) -> Result<u64>;

    /// Calls the entry point of a loaded image. `image_handle` carries the image's [`MmLoadedImage`].
    fn start_image(&self, mm: &MmCore, image_handle: Handle, entry_point: u64) -> Result<()>;
}

/// Describes a loaded module. Installed under `efi::protocols::loaded_image::PROTOCOL_GUID` on the image handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmLoadedImage {
    pub file_name: efi::Guid,
    pub image_base: u64,
    pub image_pages: u64,
    pub entry_point: u64,
}

struct DiscoveredModule {
    file_name: efi::Guid,
    depex: Option<Depex>,
    association: Option<AssociatedDependency>,
    image: Vec<u8>,
    state: ModuleState,
}

#[derive(Default)]
pub(crate) struct Dispatcher {
    executing: bool,
    discovered: Vec<DiscoveredModule>,
    scheduled: VecDeque<usize>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("executing", &self.executing)
            .field("discovered", &self.discovered.len())
            .field("scheduled", &self.scheduled)
            .finish()
    }
}

impl Dispatcher {
    // schedules the module, every dependent module that must run right before it, and every one that must run right
    // after it.
    fn schedule_with_associations(&mut self, index: usize) -> core::result::Result<(), DispatchError> {
        let mut in_progress = BTreeSet::new();
        self.insert_on_scheduled_queue(index, &mut in_progress)
    }

    fn insert_on_scheduled_queue(
        &mut self,
        index: usize,
        in_progress: &mut BTreeSet<usize>,
    ) -> core::result::Result<(), DispatchError> {
        let file_name = self.discovered[index].file_name;
        if !in_progress.insert(index) {
            log::warn!("Module {:?} depends on itself through Before/After; not scheduling it.", FmtGuid(&file_name));
            return Err(DispatchError::DependencyCycle(file_name));
        }

        for before in self.associated_with(index, AssociatedDependency::Before(file_name)) {
            if self.discovered[before].state == ModuleState::Dependent {
                self.insert_on_scheduled_queue(before, in_progress)?;
            }
        }

        self.discovered[index].state = ModuleState::Scheduled;
        self.scheduled.push_back(index);
        log::debug!("Scheduled module {:?}", FmtGuid(&file_name));

        for after in self.associated_with(index, AssociatedDependency::After(file_name)) {
            if self.discovered[after].state == ModuleState::Dependent {
                self.insert_on_scheduled_queue(after, in_progress)?;
            }
        }

        in_progress.remove(&index);
        Ok(())
    }

    fn associated_with(&self, index: usize, association: AssociatedDependency) -> Vec<usize> {
        self.discovered
            .iter()
            .enumerate()
            .filter(|(other, module)| {
                *other != index && module.state == ModuleState::Dependent && module.association == Some(association)
            })
            .map(|(other, _)| other)
            .collect()
    }

    // modules whose (non-associated) dependency expression holds for `protocols`.
    fn ready_modules(&mut self, protocols: &[efi::Guid]) -> Vec<usize> {
        let mut ready = Vec::new();
        for (index, module) in self.discovered.iter_mut().enumerate() {
            if module.state != ModuleState::Dependent || module.association.is_some() {
                continue;
            }
            let satisfied = match module.depex {
                Some(ref mut depex) => depex.eval(protocols),
                None => true,
            };
            if satisfied {
                ready.push(index);
            }
        }
        ready
    }
}

impl MmCore {
    /// Adds a discovered module. Its dependency expression is examined once here to see whether it is tied to
    /// another module by Before/After.
    pub fn add_module(&self, entry: DriverEntry) {
        let association = entry.depex.as_ref().and_then(Depex::is_associated);
        log::debug!("Discovered module {:?} ({:?})", FmtGuid(&entry.file_name), association);
        self.dispatcher.borrow_mut().discovered.push(DiscoveredModule {
            file_name: entry.file_name,
            depex: entry.depex,
            association,
            image: entry.image,
            state: ModuleState::Dependent,
        });
    }

    /// Clears the schedule-on-request flag of a discovered module, so that the rest of its dependency expression is
    /// evaluated by the next dispatch.
    ///
    /// This function matches the behavior of EFI_MM_DISPATCH_PROTOCOL.Schedule() in PI spec 1.8 volume 4.
    ///
    /// ## Errors
    ///
    /// Returns [`EfiError::NotFound`] if no dependent module with that name is waiting on a schedule request.
    pub fn schedule(&self, file_name: &efi::Guid) -> Result<()> {
        let mut dispatcher = self.dispatcher.borrow_mut();
        for module in dispatcher.discovered.iter_mut() {
            if module.file_name != *file_name || module.state != ModuleState::Dependent {
                continue;
            }
            if let Some(depex) = &mut module.depex {
                if depex.is_sor() {
                    depex.schedule();
                    return Ok(());
                }
            }
        }
        Err(EfiError::NotFound)
    }

    /// The state of the first discovered module named `file_name`.
    pub fn module_state(&self, file_name: &efi::Guid) -> Option<ModuleState> {
        let dispatcher = self.dispatcher.borrow();
        dispatcher.discovered.iter().find(|module| module.file_name == *file_name).map(|module| module.state)
    }

    /// Records that the MM entry point has been registered. The dispatcher pauses after the module that does this.
    pub fn register_entry_point(&self) {
        self.entry_point_registered.set(true);
    }

    /// Loads and starts every module whose dependencies are satisfied, until no more can be scheduled.
    ///
    /// Scheduled modules are run first; then the dependent ones are evaluated against the installed protocols, and
    /// the two steps repeat until an evaluation schedules nothing.
    ///
    /// ## Errors
    ///
    /// Returns [`EfiError::AlreadyStarted`] if called from a module being dispatched.
    /// Returns [`EfiError::NotReady`] if a module registered the MM entry point. Remaining work is picked up by the
    /// next call.
    /// Returns [`EfiError::NotFound`] if nothing was loaded.
    /// Returns [`DispatchError::DependencyCycle`] if Before/After associations form a cycle.
    pub fn dispatch(&self) -> core::result::Result<(), DispatchError> {
        {
            let mut dispatcher = self.dispatcher.borrow_mut();
            if dispatcher.executing {
                return Err(EfiError::AlreadyStarted.into());
            }
            dispatcher.executing = true;
        }

        let result = self.dispatch_until_idle();
        self.dispatcher.borrow_mut().executing = false;
        result
    }

    /// Logs every discovered module that was never scheduled.
    pub fn display_discovered_not_dispatched(&self) {
        for module in self.dispatcher.borrow().discovered.iter() {
            if module.state == ModuleState::Dependent {
                log::warn!("Module {:?} found but not dispatched.", FmtGuid(&module.file_name));
            }
        }
    }

    fn dispatch_until_idle(&self) -> core::result::Result<(), DispatchError> {
        let mut anything_loaded = false;
        loop {
            loop {
                let next = self.dispatcher.borrow_mut().scheduled.pop_front();
                let Some(index) = next else {
                    break;
                };

                let (file_name, image) = {
                    let mut dispatcher = self.dispatcher.borrow_mut();
                    let module = &mut dispatcher.discovered[index];
                    module.state = ModuleState::Initialized;
                    (module.file_name, mem::take(&mut module.image))
                };

                let entry_point_registered = self.entry_point_registered.get();
                match self.load_and_start(&file_name, &image) {
                    Ok(()) => anything_loaded = true,
                    Err(err) => log::error!("Failed to load module {:?}: {:?}", FmtGuid(&file_name), err),
                }

                if !entry_point_registered && self.entry_point_registered.get() {
                    log::info!("MM entry point registered by {:?}; returning to the caller.", FmtGuid(&file_name));
                    return Err(EfiError::NotReady.into());
                }
            }

            let protocols = self.core.registered_protocols();
            let ready = self.dispatcher.borrow_mut().ready_modules(&protocols);
            if ready.is_empty() {
                break;
            }
            for index in ready {
                let mut dispatcher = self.dispatcher.borrow_mut();
                if dispatcher.discovered[index].state == ModuleState::Dependent {
                    dispatcher.schedule_with_associations(index)?;
                }
            }
        }

        if anything_loaded {
            Ok(())
        } else {
            Err(EfiError::NotFound.into())
        }
    }

    // Err only when the image could not be loaded. A module whose entry point fails is unloaded again.
    fn load_and_start(&self, file_name: &efi::Guid, image: &[u8]) -> Result<()> {
        let image_pages = uefi_size_to_pages(image.len() as u64).max(1);
        let image_base = self.allocate_pages(AllocateType::AnyPages, image_pages)?;

        let loaded = self.loader.load_image(file_name, image, image_base).and_then(|entry_point| {
            let loaded_image = Interface::new(MmLoadedImage { file_name: *file_name, image_base, image_pages, entry_point });
            let image_handle = self.core.install_protocol_interface(
                None,
                efi::protocols::loaded_image::PROTOCOL_GUID,
                loaded_image.clone(),
            )?;
            Ok((image_handle, loaded_image, entry_point))
        });
        let (image_handle, loaded_image, entry_point) = match loaded {
            Ok(loaded) => loaded,
            Err(err) => {
                let _ = self.free_pages(image_base, image_pages);
                return Err(err);
            }
        };

        log::info!("Loaded MM module {:?} at {:#x}", FmtGuid(file_name), image_base);
        if let Err(err) = self.loader.start_image(self, image_handle, entry_point) {
            log::warn!("MM module {:?} returned {:?} from its entry point; unloading it.", FmtGuid(file_name), err);
            let _ = self.core.uninstall_protocol_interface(
                image_handle,
                efi::protocols::loaded_image::PROTOCOL_GUID,
                &loaded_image,
            );
            let _ = self.free_pages(image_base, image_pages);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use core::cell::RefCell;
    use std::{boxed::Box, rc::Rc, vec, vec::Vec};

    use dxe_core::Interface;
    use uefi_depex::Opcode;

    use super::*;
    use crate::{config::MmCoreConfig, test_support::test_guid};

    const BASE: u64 = 0x100000;

    fn module_a() -> efi::Guid {
        test_guid("7b6f0c4e-2d2a-4a4f-8f5e-6a1c0f3d2b11")
    }

    fn module_b() -> efi::Guid {
        test_guid("0c9d3f55-1e8b-4c57-9d0a-3b2f6e7a8c22")
    }

    fn module_c() -> efi::Guid {
        test_guid("e4a1b7c2-5f6d-4e3a-b2c1-9d8e7f6a5b33")
    }

    fn protocol_p() -> efi::Guid {
        test_guid("3e7c5a2b-8d4f-4b6e-a1c9-2f0e5d7b9a44")
    }

    fn module(file_name: efi::Guid, depex: Option<&[Opcode]>) -> DriverEntry {
        DriverEntry { file_name, depex: depex.map(Depex::from), image: vec![0u8; 0x1800] }
    }

    // Loads at the given base and records the order images are started in. Starting an image whose name is in
    // `installs` installs the paired protocol.
    fn recording_loader(started: &Rc<RefCell<Vec<efi::Guid>>>, installs: Vec<(efi::Guid, efi::Guid)>) -> MockImageLoader {
        let mut loader = MockImageLoader::new();
        loader.expect_load_image().returning(|_, _, base| Ok(base + 0x400));
        let started = started.clone();
        loader.expect_start_image().returning_st(move |mm: &MmCore, image_handle: Handle, _entry_point: u64| {
            let loaded = mm
                .core()
                .handle_protocol(image_handle, efi::protocols::loaded_image::PROTOCOL_GUID)?
                .downcast::<MmLoadedImage>()
                .ok_or(EfiError::InvalidParameter)?;
            started.borrow_mut().push(loaded.file_name);
            for (name, protocol) in installs.iter() {
                if *name == loaded.file_name {
                    mm.core().install_protocol_interface(None, *protocol, Interface::null())?;
                }
            }
            Ok(())
        });
        loader
    }

    fn mm_with(loader: MockImageLoader) -> MmCore {
        MmCore::new(MmCoreConfig::default().with_memory_region(BASE, 0x40), Box::new(loader)).unwrap()
    }

    #[test]
    fn before_module_should_load_ahead_of_its_target() {
        let started = Rc::new(RefCell::new(Vec::new()));
        let mm = mm_with(recording_loader(&started, Vec::new()));
        mm.add_module(module(module_b(), None));
        mm.add_module(module(module_a(), Some(&[Opcode::Before(module_b()), Opcode::End])));

        mm.dispatch().unwrap();
        assert_eq!(*started.borrow(), vec![module_a(), module_b()]);
    }

    #[test]
    fn after_module_should_load_behind_its_target() {
        let started = Rc::new(RefCell::new(Vec::new()));
        let mm = mm_with(recording_loader(&started, Vec::new()));
        mm.add_module(module(module_a(), Some(&[Opcode::After(module_b()), Opcode::End])));
        mm.add_module(module(module_b(), None));
        mm.add_module(module(module_c(), None));

        mm.dispatch().unwrap();
        assert_eq!(*started.borrow(), vec![module_b(), module_a(), module_c()]);
    }

    #[test]
    fn depex_should_be_reevaluated_after_each_pass() {
        let started = Rc::new(RefCell::new(Vec::new()));
        let mm = mm_with(recording_loader(&started, vec![(module_b(), protocol_p())]));
        mm.add_module(module(module_a(), Some(&[Opcode::Push(protocol_p(), false), Opcode::End])));
        mm.add_module(module(module_b(), Some(&[Opcode::True, Opcode::End])));

        mm.dispatch().unwrap();
        assert_eq!(*started.borrow(), vec![module_b(), module_a()]);
        assert_eq!(mm.module_state(&module_a()), Some(ModuleState::Initialized));

        // nothing left to do.
        assert_eq!(mm.dispatch(), Err(DispatchError::Efi(EfiError::NotFound)));
    }

    #[test]
    fn before_cycle_should_leave_both_modules_dependent() {
        let started = Rc::new(RefCell::new(Vec::new()));
        let mm = mm_with(recording_loader(&started, Vec::new()));
        mm.add_module(module(module_a(), Some(&[Opcode::Before(module_b()), Opcode::End])));
        mm.add_module(module(module_b(), Some(&[Opcode::Before(module_a()), Opcode::End])));
        mm.add_module(module(module_c(), None));

        mm.dispatch().unwrap();
        assert_eq!(*started.borrow(), vec![module_c()]);
        assert_eq!(mm.module_state(&module_a()), Some(ModuleState::Dependent));
        assert_eq!(mm.module_state(&module_b()), Some(ModuleState::Dependent));
    }

    #[test]
    fn cycle_reachable_from_scheduled_module_should_be_reported() {
        let started = Rc::new(RefCell::new(Vec::new()));
        let mm = mm_with(recording_loader(&started, Vec::new()));
        // a second copy of module B, tied to A, closes the loop B <- A <- B.
        mm.add_module(module(module_b(), None));
        mm.add_module(module(module_a(), Some(&[Opcode::Before(module_b()), Opcode::End])));
        mm.add_module(module(module_b(), Some(&[Opcode::Before(module_a()), Opcode::End])));

        assert_eq!(mm.dispatch(), Err(DispatchError::DependencyCycle(module_a())));
        assert!(started.borrow().is_empty());
        assert_eq!(efi::Status::from(DispatchError::DependencyCycle(module_a())), efi::Status::ABORTED);

        // the dispatcher is usable again afterwards.
        assert_ne!(mm.dispatch(), Err(DispatchError::Efi(EfiError::AlreadyStarted)));
    }

    #[test]
    fn sor_module_should_wait_for_schedule_request() {
        let started = Rc::new(RefCell::new(Vec::new()));
        let mm = mm_with(recording_loader(&started, Vec::new()));
        mm.add_module(module(module_a(), Some(&[Opcode::Sor, Opcode::True, Opcode::End])));

        assert_eq!(mm.dispatch(), Err(DispatchError::Efi(EfiError::NotFound)));
        assert_eq!(mm.schedule(&module_b()), Err(EfiError::NotFound));

        mm.schedule(&module_a()).unwrap();
        mm.dispatch().unwrap();
        assert_eq!(*started.borrow(), vec![module_a()]);
        assert_eq!(mm.schedule(&module_a()), Err(EfiError::NotFound));
    }

    #[test]
    fn entry_point_registration_should_pause_dispatch() {
        let mut loader = MockImageLoader::new();
        loader.expect_load_image().returning(|_, _, base| Ok(base));
        let started = Rc::new(RefCell::new(Vec::new()));
        let log = started.clone();
        loader.expect_start_image().returning_st(move |mm: &MmCore, image_handle: Handle, _entry_point: u64| {
            log.borrow_mut().push(image_handle);
            if log.borrow().len() == 1 {
                mm.register_entry_point();
            }
            Ok(())
        });
        let mm = mm_with(loader);
        mm.add_module(module(module_a(), None));
        mm.add_module(module(module_b(), None));

        assert_eq!(mm.dispatch(), Err(DispatchError::Efi(EfiError::NotReady)));
        assert_eq!(started.borrow().len(), 1);
        assert_eq!(mm.module_state(&module_b()), Some(ModuleState::Scheduled));

        mm.dispatch().unwrap();
        assert_eq!(started.borrow().len(), 2);
    }

    #[test]
    fn failed_start_should_release_image_pages() {
        let mut loader = MockImageLoader::new();
        loader.expect_load_image().times(1).returning(|_, _, base| Ok(base));
        loader.expect_start_image().times(1).returning(|_, _, _| Err(EfiError::Unsupported));
        let mm = mm_with(loader);
        let free_before = mm.memory_stats().free_pages;
        mm.add_module(module(module_a(), None));

        // the start was attempted, so the module counts as dispatched.
        mm.dispatch().unwrap();
        assert_eq!(mm.memory_stats().free_pages, free_before);
        assert_eq!(mm.module_state(&module_a()), Some(ModuleState::Initialized));
        assert_eq!(
            mm.core().locate_handle_buffer(dxe_core::SearchType::ByProtocol(efi::protocols::loaded_image::PROTOCOL_GUID)),
            Err(EfiError::NotFound)
        );
    }

    #[test]
    fn failed_load_should_not_count_as_dispatch() {
        let mut loader = MockImageLoader::new();
        loader.expect_load_image().times(1).returning(|_, _, _| Err(EfiError::LoadError));
        loader.expect_start_image().never();
        let mm = mm_with(loader);
        let free_before = mm.memory_stats().free_pages;
        mm.add_module(module(module_a(), None));

        assert_eq!(mm.dispatch(), Err(DispatchError::Efi(EfiError::NotFound)));
        assert_eq!(mm.memory_stats().free_pages, free_before);
        assert_eq!(mm.module_state(&module_a()), Some(ModuleState::Initialized));
    }

    #[test]
    fn nested_dispatch_should_be_refused() {
        let mut loader = MockImageLoader::new();
        loader.expect_load_image().returning(|_, _, base| Ok(base));
        let nested = Rc::new(RefCell::new(None));
        let result = nested.clone();
        loader.expect_start_image().returning_st(move |mm: &MmCore, _, _| {
            result.replace(Some(mm.dispatch()));
            Ok(())
        });
        let mm = mm_with(loader);
        mm.add_module(module(module_a(), None));

        mm.dispatch().unwrap();
        assert_eq!(*nested.borrow(), Some(Err(DispatchError::Efi(EfiError::AlreadyStarted))));
    }
}
