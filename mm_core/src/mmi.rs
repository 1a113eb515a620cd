//! Management Mode Interrupt (MMI) handler database.
//!
//! Handlers are registered either for a handler type GUID, in which case they receive communicate buffers addressed
//! to that GUID, or with no type, in which case they are root handlers run on every MM entry to service hardware
//! interrupt sources.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::{collections::BTreeMap, rc::Rc, vec::Vec};
use core::{fmt, num::NonZeroUsize};

use r_efi::efi;
use uefi_sdk::{
    error::{EfiError, Result},
    guid::{FmtGuid, OrdGuid},
};

use crate::MmCore;

/// Opaque identity of a registered MMI handler.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct DispatchHandle(NonZeroUsize);

/// Successful outcomes of an MMI handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MmiStatus {
    /// The interrupt was handled and the source quiesced. Ends processing of a typed MMI.
    Success,
    /// The interrupt was handled but its source will assert again. Ends processing of a typed MMI.
    InterruptPending,
    /// The interrupt source was quiesced, but the interrupt was not for this handler.
    SourceQuiesced,
    /// The interrupt source is still pending and was not serviced by this handler.
    SourcePending,
}

/// An MMI handler.
pub trait MmiHandler {
    /// Services an MMI.
    ///
    /// `context` is supplied by whoever raised the MMI. `comm_buffer` is the message of a communicate buffer, which
    /// the handler may rewrite in place as its response. Root handlers never receive one.
    fn handle(
        &self,
        mm: &MmCore,
        dispatch_handle: DispatchHandle,
        context: Option<&[u8]>,
        comm_buffer: Option<&mut Vec<u8>>,
    ) -> Result<MmiStatus>;
}

type HandlerList = Vec<(DispatchHandle, Rc<dyn MmiHandler>)>;

#[derive(Default)]
pub(crate) struct MmiDatabase {
    next_handle: usize,
    root: HandlerList,
    typed: BTreeMap<OrdGuid, HandlerList>,
}

impl fmt::Debug for MmiDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MmiDatabase")
            .field("root", &self.root.len())
            .field("typed", &self.typed.iter().map(|(guid, list)| (*guid, list.len())).collect::<Vec<_>>())
            .finish()
    }
}

impl MmiDatabase {
    fn register(&mut self, handler: Rc<dyn MmiHandler>, handler_type: Option<efi::Guid>) -> Result<DispatchHandle> {
        self.next_handle += 1;
        let dispatch_handle = DispatchHandle(NonZeroUsize::new(self.next_handle).ok_or(EfiError::OutOfResources)?);
        let list = match handler_type {
            Some(guid) => self.typed.entry(OrdGuid(guid)).or_default(),
            None => &mut self.root,
        };
        list.push((dispatch_handle, handler));
        Ok(dispatch_handle)
    }

    fn unregister(&mut self, dispatch_handle: DispatchHandle) -> Result<()> {
        if let Some(index) = self.root.iter().position(|(handle, _)| *handle == dispatch_handle) {
            self.root.remove(index);
            return Ok(());
        }

        let guid = self
            .typed
            .iter()
            .find(|(_, list)| list.iter().any(|(handle, _)| *handle == dispatch_handle))
            .map(|(guid, _)| *guid)
            .ok_or(EfiError::InvalidParameter)?;
        if let Some(list) = self.typed.get_mut(&guid) {
            list.retain(|(handle, _)| *handle != dispatch_handle);
            if list.is_empty() {
                self.typed.remove(&guid);
            }
        }
        Ok(())
    }

    fn is_registered(&self, dispatch_handle: DispatchHandle) -> bool {
        self.root.iter().chain(self.typed.values().flatten()).any(|(handle, _)| *handle == dispatch_handle)
    }

    fn snapshot(&self, handler_type: Option<&efi::Guid>) -> Option<HandlerList> {
        match handler_type {
            Some(guid) => self.typed.get(&OrdGuid(*guid)).cloned(),
            None => Some(self.root.clone()),
        }
    }
}

impl MmCore {
    /// Registers an MMI handler.
    ///
    /// This function matches the behavior of EFI_MM_SYSTEM_TABLE.MmiHandlerRegister() in PI spec 1.8 volume 4
    /// section 3.2.4. With no `handler_type` the handler becomes a root handler.
    pub fn mmi_handler_register(
        &self,
        handler: Rc<dyn MmiHandler>,
        handler_type: Option<efi::Guid>,
    ) -> Result<DispatchHandle> {
        let dispatch_handle = self.mmi.borrow_mut().register(handler, handler_type)?;
        log::debug!("Registered MMI handler {:?} for {:?}", dispatch_handle, handler_type.as_ref().map(FmtGuid));
        Ok(dispatch_handle)
    }

    /// Unregisters an MMI handler.
    ///
    /// ## Errors
    ///
    /// Returns [`EfiError::InvalidParameter`] if `dispatch_handle` is not registered.
    pub fn mmi_handler_unregister(&self, dispatch_handle: DispatchHandle) -> Result<()> {
        self.mmi.borrow_mut().unregister(dispatch_handle)?;
        log::debug!("Unregistered MMI handler {:?}", dispatch_handle);
        Ok(())
    }

    /// Runs the handlers registered for `handler_type`, or the root handlers if it is `None`.
    ///
    /// This function matches the behavior of EFI_MM_SYSTEM_TABLE.MmiManage() in PI spec 1.8 volume 4 section 3.2.4.
    /// The handler list is captured before the first handler runs, so handlers may register and unregister others;
    /// a handler unregistered before its turn is skipped. For a typed MMI the first handler returning
    /// [`MmiStatus::Success`] or [`MmiStatus::InterruptPending`] ends processing. Root handlers always all run, and any
    /// [`MmiStatus`] counts as handled.
    ///
    /// ## Errors
    ///
    /// Returns [`EfiError::NotFound`] if there are no handlers for `handler_type` or none handled the MMI. If a typed
    /// handler failed and none succeeded, the last failure is returned instead.
    pub fn mmi_manage(
        &self,
        handler_type: Option<&efi::Guid>,
        context: Option<&[u8]>,
        mut comm_buffer: Option<&mut Vec<u8>>,
    ) -> Result<()> {
        let Some(handlers) = self.mmi.borrow().snapshot(handler_type) else {
            return Err(EfiError::NotFound);
        };

        let mut handled = false;
        let mut last_error = None;
        for (dispatch_handle, handler) in handlers {
            if !self.mmi.borrow().is_registered(dispatch_handle) {
                continue;
            }

            match handler.handle(self, dispatch_handle, context, comm_buffer.as_deref_mut()) {
                Ok(MmiStatus::Success) | Ok(MmiStatus::InterruptPending) if handler_type.is_some() => return Ok(()),
                Ok(MmiStatus::Success) | Ok(MmiStatus::InterruptPending) => handled = true,
                Ok(MmiStatus::SourceQuiesced) | Ok(MmiStatus::SourcePending) => {
                    if handler_type.is_none() {
                        handled = true;
                    }
                }
                Err(err) => {
                    log::warn!("MMI handler {:?} failed: {:?}", dispatch_handle, err);
                    last_error = Some(err);
                }
            }
        }

        if handled {
            return Ok(());
        }
        match (handler_type, last_error) {
            (Some(_), Some(err)) => Err(err),
            _ => Err(EfiError::NotFound),
        }
    }
}
