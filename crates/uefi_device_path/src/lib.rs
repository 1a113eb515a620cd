//! UEFI Device Path Utilities
//!
//! This library provides utilities for walking, comparing and building UEFI device paths. Device paths are handled as
//! byte slices in their packed wire form: a sequence of nodes, each starting with a four byte header (type, sub-type,
//! little-endian length), terminated by an end node. [`DevicePathBuf`] is an owned, always well-formed device path
//! suitable for publishing as a protocol interface.
//!
//! ## Examples
//!
//! ```
//! use r_efi::efi::protocols::device_path::{Hardware, TYPE_HARDWARE};
//! use uefi_device_path::{remaining_device_path, DevicePathBuf};
//!
//! let mut root = DevicePathBuf::new();
//! root.push_node(TYPE_HARDWARE, Hardware::SUBTYPE_PCI, &[0x0, 0x1C]);
//!
//! let mut child = root.clone();
//! child.push_node(TYPE_HARDWARE, Hardware::SUBTYPE_PCI, &[0x2, 0x0]);
//!
//! let (remaining, common) = remaining_device_path(root.as_bytes(), child.as_bytes()).unwrap();
//! assert_eq!(common, 1);
//! assert_eq!(remaining.len(), 6 + 4);
//! ```
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::vec::Vec;
use core::fmt;

use r_efi::efi::{
    self,
    protocols::device_path::{End, TYPE_END},
};

/// Size in bytes of a device path node header.
pub const NODE_HEADER_SIZE: usize = 4;

const END_ENTIRE_NODE: [u8; NODE_HEADER_SIZE] = [TYPE_END, End::SUBTYPE_ENTIRE, NODE_HEADER_SIZE as u8, 0];

/// A single node of a device path, borrowed from the path it was read from.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DevicePathNode<'a> {
    bytes: &'a [u8],
}

impl<'a> DevicePathNode<'a> {
    /// Reads the node at the start of `bytes`. Returns `None` if the header is truncated or its length is out of range.
    pub fn parse(bytes: &'a [u8]) -> Option<Self> {
        let header = bytes.get(..NODE_HEADER_SIZE)?;
        let length = u16::from_le_bytes([header[2], header[3]]) as usize;
        if length < NODE_HEADER_SIZE {
            return None;
        }
        Some(Self { bytes: bytes.get(..length)? })
    }

    /// The node type.
    pub fn node_type(&self) -> u8 {
        self.bytes[0]
    }

    /// The node sub-type.
    pub fn sub_type(&self) -> u8 {
        self.bytes[1]
    }

    /// Total length of the node in bytes, header included.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Nodes always carry at least a header.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// The node payload following the header.
    pub fn data(&self) -> &'a [u8] {
        &self.bytes[NODE_HEADER_SIZE..]
    }

    /// The raw bytes of the node, header included.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// True for any end node (end-of-instance or end-of-entire-path).
    pub fn is_end_type(&self) -> bool {
        self.node_type() == TYPE_END
    }

    /// True for the end-of-entire-path node.
    pub fn is_end_entire(&self) -> bool {
        self.is_end_type() && self.sub_type() == End::SUBTYPE_ENTIRE
    }
}

impl fmt::Debug for DevicePathNode<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DevicePathNode")
            .field("type", &self.node_type())
            .field("sub_type", &self.sub_type())
            .field("data", &self.data())
            .finish()
    }
}

/// Iterates over the nodes of a device path, including the terminating end node.
///
/// Iteration stops after the first end node, or early if a malformed node is encountered.
pub struct DevicePathWalker<'a> {
    remaining: Option<&'a [u8]>,
}

impl<'a> DevicePathWalker<'a> {
    /// Creates a walker over the device path in `device_path`.
    pub fn new(device_path: &'a [u8]) -> Self {
        Self { remaining: Some(device_path) }
    }
}

impl<'a> Iterator for DevicePathWalker<'a> {
    type Item = DevicePathNode<'a>;
    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.remaining.take()?;
        let node = DevicePathNode::parse(remaining)?;
        if !node.is_end_type() {
            self.remaining = Some(&remaining[node.len()..]);
        }
        Some(node)
    }
}

/// Returns the count of nodes and size (in bytes) of the given device path.
///
/// count and size outputs both include the terminating end node. A path that is truncated or has a malformed node
/// before its end node is rejected with `INVALID_PARAMETER`.
pub fn device_path_node_count(device_path: &[u8]) -> Result<(usize, usize), efi::Status> {
    let mut node_count = 0;
    let mut size = 0;
    for node in DevicePathWalker::new(device_path) {
        node_count += 1;
        size += node.len();
        if node.is_end_type() {
            return Ok((node_count, size));
        }
    }
    Err(efi::Status::INVALID_PARAMETER)
}

/// Returns the well-formed prefix of `device_path`, up to and including its end node.
pub fn device_path_as_slice(device_path: &[u8]) -> Result<&[u8], efi::Status> {
    let (_, size) = device_path_node_count(device_path)?;
    Ok(&device_path[..size])
}

/// Computes the remaining device path and the number of nodes in common for two device paths.
///
/// If device path `a` is a prefix of or identical to device path `b`, the result is Some(the portion of `b` that
/// remains after removing `a`, nodes_in_common). If `a` is not a prefix of `b`, the result is None.
///
/// nodes_in_common does not count the terminating end node.
pub fn remaining_device_path<'b>(a: &[u8], b: &'b [u8]) -> Option<(&'b [u8], usize)> {
    let mut a_rest = a;
    let mut b_rest = b;
    let mut node_count = 0;
    loop {
        let a_node = DevicePathNode::parse(a_rest)?;
        if a_node.is_end_type() {
            return Some((b_rest, node_count));
        }
        let b_node = DevicePathNode::parse(b_rest)?;
        if a_node != b_node {
            return None;
        }
        node_count += 1;
        a_rest = &a_rest[a_node.len()..];
        b_rest = &b_rest[b_node.len()..];
    }
}

/// Determines whether the given device path starts with an end-of-entire-path node.
///
/// An empty slice is treated as an end node, matching the convention that a missing remaining path means "nothing
/// left to resolve".
pub fn is_device_path_end(device_path: &[u8]) -> bool {
    match DevicePathNode::parse(device_path) {
        Some(node) => node.is_end_entire(),
        None => device_path.is_empty(),
    }
}

/// Produces a new device path that is the concatenation of `a` and `b`. The end node of `a` is dropped.
pub fn concat_device_path(a: &[u8], b: &[u8]) -> Result<DevicePathBuf, efi::Status> {
    let a_slice = device_path_as_slice(a)?;
    let b_slice = device_path_as_slice(b)?;
    let mut bytes = Vec::with_capacity(a_slice.len() + b_slice.len() - NODE_HEADER_SIZE);
    bytes.extend_from_slice(&a_slice[..a_slice.len() - NODE_HEADER_SIZE]);
    bytes.extend_from_slice(b_slice);
    Ok(DevicePathBuf(bytes))
}

/// An owned, well-formed device path.
#[derive(Clone, PartialEq, Eq)]
pub struct DevicePathBuf(Vec<u8>);

impl DevicePathBuf {
    /// Creates an empty device path consisting only of an end node.
    pub fn new() -> Self {
        Self(END_ENTIRE_NODE.to_vec())
    }

    /// Copies the well-formed prefix of `bytes` into a new device path.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, efi::Status> {
        Ok(Self(device_path_as_slice(bytes)?.to_vec()))
    }

    /// Appends a node before the terminating end node.
    pub fn push_node(&mut self, node_type: u8, sub_type: u8, data: &[u8]) -> &mut Self {
        let length = (NODE_HEADER_SIZE + data.len()) as u16;
        let end_node = self.0.split_off(self.0.len() - NODE_HEADER_SIZE);
        self.0.extend_from_slice(&[node_type, sub_type]);
        self.0.extend_from_slice(&length.to_le_bytes());
        self.0.extend_from_slice(data);
        self.0.extend_from_slice(&end_node);
        self
    }

    /// The packed device path bytes, end node included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Number of nodes, not counting the end node.
    pub fn node_count(&self) -> usize {
        self.nodes().filter(|node| !node.is_end_type()).count()
    }

    /// True if the path consists only of the end node.
    pub fn is_end(&self) -> bool {
        is_device_path_end(&self.0)
    }

    /// Iterates over the nodes of this path.
    pub fn nodes(&self) -> DevicePathWalker<'_> {
        DevicePathWalker::new(&self.0)
    }
}

impl Default for DevicePathBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl AsRef<[u8]> for DevicePathBuf {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for DevicePathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.nodes()).finish()
    }
}
