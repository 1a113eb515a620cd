//! Core Test Support
//!
//! Code to help support testing.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
extern crate std;

use core::{cell::RefCell, str::FromStr};
use std::{rc::Rc, vec::Vec};

use r_efi::efi;
use uefi_device_path::{is_device_path_end, DevicePathBuf, DevicePathNode};
use uefi_sdk::error::{EfiError, Result};
use uuid::Uuid;

use crate::{driver_services::DriverBinding, Core, Handle, Interface};

pub(crate) fn test_guid(s: &str) -> efi::Guid {
    efi::Guid::from_bytes(Uuid::from_str(s).unwrap().as_bytes())
}

/// Protocol installed on the children created by a [`RecorderDriver`].
pub(crate) fn child_protocol_guid() -> efi::Guid {
    test_guid("3d1f3d0e-9c1f-4b5e-8d5f-0e2b2e8c4f31")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DriverCall {
    Start(&'static str, Handle),
    Stop(&'static str, usize),
}

/// Shared record of start and stop calls across several drivers.
#[derive(Clone, Default)]
pub(crate) struct DriverLog(Rc<RefCell<Vec<DriverCall>>>);

impl DriverLog {
    /// Names of the drivers started, in order.
    pub(crate) fn starts(&self) -> Vec<&'static str> {
        self.0
            .borrow()
            .iter()
            .filter_map(|call| match call {
                DriverCall::Start(name, _) => Some(*name),
                DriverCall::Stop(..) => None,
            })
            .collect()
    }

    /// Controllers drivers were started on, in order.
    pub(crate) fn started_on(&self) -> Vec<Handle> {
        self.0
            .borrow()
            .iter()
            .filter_map(|call| match call {
                DriverCall::Start(_, controller) => Some(*controller),
                DriverCall::Stop(..) => None,
            })
            .collect()
    }

    /// Stop calls as (driver name, number of children passed).
    pub(crate) fn stops(&self) -> Vec<(&'static str, usize)> {
        self.0
            .borrow()
            .iter()
            .filter_map(|call| match call {
                DriverCall::Stop(name, children) => Some((*name, *children)),
                DriverCall::Start(..) => None,
            })
            .collect()
    }

    fn push(&self, call: DriverCall) {
        self.0.borrow_mut().push(call);
    }
}

/// A well-behaved bus or device driver that records its start and stop calls.
///
/// By default the driver manages controllers carrying `protocol` by opening it by driver, so only one such driver
/// can manage a controller at a time. A shared driver only records calls and never opens anything.
pub(crate) struct RecorderDriver {
    name: &'static str,
    protocol: efi::Guid,
    log: DriverLog,
    child_count: usize,
    device_path_children: bool,
    shared: bool,
    children: RefCell<Vec<(Handle, efi::Guid, Interface)>>,
}

impl RecorderDriver {
    pub(crate) fn new(name: &'static str, protocol: efi::Guid, log: &DriverLog) -> Self {
        Self {
            name,
            protocol,
            log: log.clone(),
            child_count: 0,
            device_path_children: false,
            shared: false,
            children: RefCell::new(Vec::new()),
        }
    }

    /// Creates `count` children carrying [`child_protocol_guid`] on start.
    pub(crate) fn with_children(mut self, count: usize) -> Self {
        self.child_count = count;
        self
    }

    /// Creates one child for the first node of a non-end remaining device path on start. The child's device path is
    /// the controller's device path extended by that node.
    pub(crate) fn with_device_path_children(mut self) -> Self {
        self.device_path_children = true;
        self
    }

    pub(crate) fn shared(mut self) -> Self {
        self.shared = true;
        self
    }

    fn create_child(
        &self,
        core: &Core,
        agent: Handle,
        controller: Handle,
        protocol: efi::Guid,
        interface: Interface,
    ) -> Result<()> {
        let child = core.install_protocol_interface(None, protocol, interface.clone())?;
        core.open_protocol(controller, self.protocol, Some(agent), Some(child), efi::OPEN_PROTOCOL_BY_CHILD_CONTROLLER)?;
        self.children.borrow_mut().push((child, protocol, interface));
        Ok(())
    }
}

impl DriverBinding for RecorderDriver {
    fn supported(&self, core: &Core, agent: Handle, controller: Handle, _remaining: Option<&[u8]>) -> Result<()> {
        if self.shared {
            let protocols = core.protocols_per_handle(controller)?;
            return if protocols.contains(&self.protocol) { Ok(()) } else { Err(EfiError::Unsupported) };
        }
        core.open_protocol(controller, self.protocol, Some(agent), Some(controller), efi::OPEN_PROTOCOL_BY_DRIVER)
            .map_err(|_| EfiError::Unsupported)?;
        core.close_protocol(controller, self.protocol, agent, Some(controller))
    }

    fn start(&self, core: &Core, agent: Handle, controller: Handle, remaining: Option<&[u8]>) -> Result<()> {
        self.log.push(DriverCall::Start(self.name, controller));
        if self.shared {
            return Ok(());
        }
        core.open_protocol(controller, self.protocol, Some(agent), Some(controller), efi::OPEN_PROTOCOL_BY_DRIVER)?;

        for _ in 0..self.child_count {
            self.create_child(core, agent, controller, child_protocol_guid(), Interface::new(0u8))?;
        }

        if self.device_path_children {
            if let (Some(remaining), Some(parent_path)) = (remaining, core.device_path_for_handle(controller)) {
                if !is_device_path_end(remaining) {
                    let node = DevicePathNode::parse(remaining).ok_or(EfiError::InvalidParameter)?;
                    let mut child_path: DevicePathBuf = (*parent_path).clone();
                    child_path.push_node(node.node_type(), node.sub_type(), node.data());
                    self.create_child(
                        core,
                        agent,
                        controller,
                        efi::protocols::device_path::PROTOCOL_GUID,
                        Interface::new(child_path),
                    )?;
                }
            }
        }
        Ok(())
    }

    fn stop(&self, core: &Core, agent: Handle, controller: Handle, children: &[Handle]) -> Result<()> {
        self.log.push(DriverCall::Stop(self.name, children.len()));
        if self.shared {
            return Ok(());
        }
        if children.is_empty() {
            return core.close_protocol(controller, self.protocol, agent, Some(controller));
        }
        for child in children {
            core.close_protocol(controller, self.protocol, agent, Some(*child))?;
            let position = self.children.borrow().iter().position(|(handle, _, _)| handle == child);
            if let Some(position) = position {
                let (handle, protocol, interface) = self.children.borrow_mut().remove(position);
                core.uninstall_protocol_interface(handle, protocol, &interface)?;
            }
        }
        Ok(())
    }
}
