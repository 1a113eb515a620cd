//! MM Entry Point
//!
//! Every MMI enters here. A communicate buffer sent from outside MM is routed to the handlers registered for its
//! header GUID, then the root handlers run to service hardware sources.
//!
//! The handlers the core registers for itself are also here. They run the dispatcher on request from DXE and track
//! the boot lifecycle (End of DXE, Ready to Lock, Ready to Boot and Exit Boot Services), publishing the matching MM
//! protocol the first time each phase is reached.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::{rc::Rc, vec::Vec};
use core::mem;

use dxe_core::Interface;
use r_efi::efi;
use uefi_sdk::{
    ensure,
    error::{EfiError, Result},
    guid::{self, FmtGuid},
};

use crate::{
    dispatcher::DispatchError,
    mmi::{DispatchHandle, MmiHandler, MmiStatus},
    MmCore,
};

/// Size of the communicate header: the handler GUID followed by the message length.
pub const COMMUNICATE_HEADER_SIZE: usize = mem::size_of::<efi::Guid>() + mem::size_of::<usize>();

/// A message sent into MM.
///
/// On the wire this is an EFI_MM_COMMUNICATE_HEADER: a 16 byte handler GUID, a native-endian `usize` message length
/// and the message itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommunicateBuffer {
    /// Selects the handlers the message is delivered to.
    pub header_guid: efi::Guid,
    /// The message. Handlers may replace it with their response.
    pub message: Vec<u8>,
    /// What the handlers returned. `NOT_STARTED` until the buffer has been through the entry point.
    pub return_status: efi::Status,
}

impl CommunicateBuffer {
    pub fn new(header_guid: efi::Guid, message: Vec<u8>) -> Self {
        Self { header_guid, message, return_status: efi::Status::NOT_STARTED }
    }

    /// Parses a communicate header and its message.
    ///
    /// ## Errors
    ///
    /// Returns [`EfiError::BadBufferSize`] if `bytes` is too short for the header or for the message length it
    /// declares.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(bytes.len() >= COMMUNICATE_HEADER_SIZE, EfiError::BadBufferSize);
        let (guid_bytes, rest) = bytes.split_at(mem::size_of::<efi::Guid>());
        let (length_bytes, data) = rest.split_at(mem::size_of::<usize>());

        let mut guid = [0u8; 16];
        guid.copy_from_slice(guid_bytes);
        let mut length = [0u8; mem::size_of::<usize>()];
        length.copy_from_slice(length_bytes);
        let length = usize::from_ne_bytes(length);
        ensure!(length <= data.len(), EfiError::BadBufferSize);

        Ok(Self::new(efi::Guid::from_bytes(&guid), data[..length].to_vec()))
    }

    /// Serializes the header and message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(COMMUNICATE_HEADER_SIZE + self.message.len());
        bytes.extend_from_slice(self.header_guid.as_bytes());
        bytes.extend_from_slice(&self.message.len().to_ne_bytes());
        bytes.extend_from_slice(&self.message);
        bytes
    }
}

/// How far the boot has progressed, as seen from MM. Phases only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MmPhase {
    Boot,
    EndOfDxe,
    ReadyToLock,
    ReadyToBoot,
    ExitBootServices,
}

impl MmPhase {
    // (handler type the phase is announced with, MM protocol installed when it is reached)
    fn guids(self) -> Option<(efi::Guid, efi::Guid)> {
        match self {
            MmPhase::Boot => None,
            MmPhase::EndOfDxe => Some((guid::EVENT_GROUP_END_OF_DXE, guid::MM_END_OF_DXE_PROTOCOL)),
            MmPhase::ReadyToLock => Some((guid::DXE_MM_READY_TO_LOCK_PROTOCOL, guid::MM_READY_TO_LOCK_PROTOCOL)),
            MmPhase::ReadyToBoot => Some((guid::EVENT_GROUP_READY_TO_BOOT, guid::MM_READY_TO_BOOT_PROTOCOL)),
            MmPhase::ExitBootServices => {
                Some((guid::EVENT_GROUP_EXIT_BOOT_SERVICES, guid::MM_EXIT_BOOT_SERVICES_PROTOCOL))
            }
        }
    }
}

impl MmCore {
    /// Services one MMI.
    ///
    /// If `comm_buffer` is present, its message is delivered to the handlers for its header GUID and their status is
    /// stored in [`return_status`](CommunicateBuffer::return_status). The root handlers run afterwards in either case.
    ///
    /// ## Errors
    ///
    /// Returns [`EfiError::AccessDenied`] if called from within an MMI handler.
    pub fn entry_point(&self, comm_buffer: Option<&mut CommunicateBuffer>) -> Result<()> {
        ensure!(!self.in_mm.replace(true), EfiError::AccessDenied);

        if let Some(comm) = comm_buffer {
            log::trace!("MMI communicate buffer for {:?}", FmtGuid(&comm.header_guid));
            let result = self.mmi_manage(Some(&comm.header_guid), None, Some(&mut comm.message));
            comm.return_status = match result {
                Ok(()) => efi::Status::SUCCESS,
                Err(err) => err.into(),
            };
        }

        // NotFound only means no root handler claimed a source.
        let _ = self.mmi_manage(None, None, None);

        self.in_mm.set(false);
        Ok(())
    }

    /// The latest lifecycle phase reached.
    pub fn phase(&self) -> MmPhase {
        self.phase.get()
    }

    pub(crate) fn register_core_handlers(&self) -> Result<()> {
        let dispatch = self.mmi_handler_register(Rc::new(DispatchRequestHandler), Some(guid::EVENT_DXE_DISPATCH))?;

        for phase in [MmPhase::EndOfDxe, MmPhase::ReadyToLock, MmPhase::ReadyToBoot, MmPhase::ExitBootServices] {
            let Some((handler_type, _)) = phase.guids() else {
                continue;
            };
            let handle = self.mmi_handler_register(Rc::new(PhaseHandler { phase }), Some(handler_type))?;
            if phase == MmPhase::ReadyToLock {
                self.unregister_on_lock.borrow_mut().extend([dispatch, handle]);
            }
        }
        Ok(())
    }

    fn enter_phase(&self, phase: MmPhase) -> Result<()> {
        let current = self.phase.get();
        if phase == MmPhase::ReadyToBoot && current >= MmPhase::ExitBootServices {
            log::warn!("Ready to Boot signaled after Exit Boot Services; ignoring it.");
            return Ok(());
        }

        if let Some((_, protocol)) = phase.guids() {
            if self.core.locate_protocol(protocol, None).is_err() {
                self.core.install_protocol_interface(None, protocol, Interface::null())?;
            }
        }

        if phase > current {
            log::info!("MM phase {:?} -> {:?}", current, phase);
            self.phase.set(phase);
        }

        if phase == MmPhase::ReadyToLock {
            let handles = mem::take(&mut *self.unregister_on_lock.borrow_mut());
            for handle in handles {
                self.mmi_handler_unregister(handle)?;
            }
            self.display_discovered_not_dispatched();
        }
        Ok(())
    }
}

// Runs the dispatcher when DXE asks for it. The message is replaced with the dispatcher's status as a native-endian
// `usize`.
struct DispatchRequestHandler;

impl MmiHandler for DispatchRequestHandler {
    fn handle(
        &self,
        mm: &MmCore,
        _dispatch_handle: DispatchHandle,
        _context: Option<&[u8]>,
        comm_buffer: Option<&mut Vec<u8>>,
    ) -> Result<MmiStatus> {
        let status = if mm.config.dispatch_on_entry {
            match mm.dispatch() {
                Ok(()) => efi::Status::SUCCESS,
                Err(DispatchError::Efi(EfiError::NotFound)) => efi::Status::NOT_FOUND,
                Err(DispatchError::Efi(EfiError::NotReady)) => efi::Status::NOT_READY,
                Err(err) => {
                    log::error!("MM dispatch failed: {}", err);
                    return Err(err.into());
                }
            }
        } else {
            efi::Status::NOT_STARTED
        };

        if let Some(buffer) = comm_buffer {
            buffer.clear();
            buffer.extend_from_slice(&status.as_usize().to_ne_bytes());
        }
        Ok(MmiStatus::Success)
    }
}

struct PhaseHandler {
    phase: MmPhase,
}

impl MmiHandler for PhaseHandler {
    fn handle(
        &self,
        mm: &MmCore,
        _dispatch_handle: DispatchHandle,
        _context: Option<&[u8]>,
        _comm_buffer: Option<&mut Vec<u8>>,
    ) -> Result<MmiStatus> {
        mm.enter_phase(self.phase)?;
        Ok(MmiStatus::Success)
    }
}
