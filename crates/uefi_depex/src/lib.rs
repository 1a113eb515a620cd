//! UEFI Dependency Expression (DEPEX) support
//!
//! This crate provides a parser and evaluator for the dependency expressions carried in module DEPEX sections. An
//! expression is a postfix program over protocol GUIDs; it evaluates to true once every protocol it requires is
//! installed. Two special forms never evaluate to true on their own:
//!
//! - `BEFORE <guid>` / `AFTER <guid>` tie the module's position to another module. The dispatcher consults
//!   [`Depex::is_associated`] and schedules such modules around their target instead of evaluating them.
//! - `SOR` (schedule on request) holds the module back until [`Depex::schedule`] is called, after which the remainder
//!   of the expression is evaluated normally.
//!
//! ## Examples
//!
//! ```
//! use r_efi::efi;
//! use uefi_depex::Depex;
//!
//! let guid = efi::Guid::from_fields(0x76b6bdfa, 0x2acd, 0x4462, 0x9e, 0x3f, &[0xcb, 0x58, 0xc9, 0x69, 0xd9, 0x37]);
//! let mut bytes = vec![0x02]; // PUSH
//! bytes.extend_from_slice(guid.as_bytes());
//! bytes.push(0x08); // END
//!
//! let mut depex = Depex::from(bytes.as_slice());
//! assert!(!depex.eval(&[]));
//! assert!(depex.eval(&[guid]));
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
use core::mem;

use r_efi::efi;

const GUID_SIZE: usize = mem::size_of::<efi::Guid>();

const OPCODE_BEFORE: u8 = 0x00;
const OPCODE_AFTER: u8 = 0x01;
const OPCODE_PUSH: u8 = 0x02;
const OPCODE_AND: u8 = 0x03;
const OPCODE_OR: u8 = 0x04;
const OPCODE_NOT: u8 = 0x05;
const OPCODE_TRUE: u8 = 0x06;
const OPCODE_FALSE: u8 = 0x07;
const OPCODE_END: u8 = 0x08;
const OPCODE_SOR: u8 = 0x09;

/// A UEFI dependency expression (DEPEX) opcode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Opcode {
    /// Schedule immediately before the module with the given file name. Must be the only opcode besides `End`.
    Before(efi::Guid),
    /// Schedule immediately after the module with the given file name. Must be the only opcode besides `End`.
    After(efi::Guid),
    /// Push whether the protocol is installed. The flag caches a positive result, since protocols are never
    /// considered uninstalled once seen by the dispatcher.
    Push(efi::Guid, bool),
    /// Logical AND of the two operands on top of the stack.
    And,
    /// Logical OR of the two operands on top of the stack.
    Or,
    /// Logical NOT of the operand on top of the stack.
    Not,
    /// Pushes true.
    True,
    /// Pushes false.
    False,
    /// Pops and returns the final result.
    End,
    /// Schedule on request. Must be the first opcode.
    Sor,
    /// An opcode value that is not defined.
    Unknown(u8),
    /// A GUID-carrying opcode whose payload is too short.
    Malformed {
        /// The opcode value.
        opcode: u8,
        /// The number of payload bytes that were available.
        len: usize,
    },
}

impl Opcode {
    fn parse(bytes: &[u8]) -> Self {
        let opcode = bytes[0];
        let guid_operand = || {
            bytes
                .get(1..GUID_SIZE + 1)
                .and_then(|payload| <&[u8; GUID_SIZE]>::try_from(payload).ok())
                .map(efi::Guid::from_bytes)
                .ok_or(Opcode::Malformed { opcode, len: bytes.len() - 1 })
        };
        let result = match opcode {
            OPCODE_BEFORE => guid_operand().map(Opcode::Before),
            OPCODE_AFTER => guid_operand().map(Opcode::After),
            OPCODE_PUSH => guid_operand().map(|guid| Opcode::Push(guid, false)),
            OPCODE_AND => Ok(Opcode::And),
            OPCODE_OR => Ok(Opcode::Or),
            OPCODE_NOT => Ok(Opcode::Not),
            OPCODE_TRUE => Ok(Opcode::True),
            OPCODE_FALSE => Ok(Opcode::False),
            OPCODE_END => Ok(Opcode::End),
            OPCODE_SOR => Ok(Opcode::Sor),
            other => Ok(Opcode::Unknown(other)),
        };
        result.unwrap_or_else(|malformed| malformed)
    }

    fn byte_size(&self) -> usize {
        match self {
            Opcode::Before(_) | Opcode::After(_) | Opcode::Push(_, _) => 1 + GUID_SIZE,
            // a malformed opcode consumes the rest of the expression.
            Opcode::Malformed { len, .. } => 1 + len,
            _ => 1,
        }
    }
}

/// Represents an associated dependency, where one module must be dispatched right before or after another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociatedDependency {
    /// The module must be dispatched before the module with this file name.
    Before(efi::Guid),
    /// The module must be dispatched after the module with this file name.
    After(efi::Guid),
}

/// A parsed UEFI dependency expression (DEPEX)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Depex {
    expression: Vec<Opcode>,
}

impl From<&[u8]> for Depex {
    fn from(value: &[u8]) -> Self {
        let mut expression = Vec::new();
        let mut index = 0;
        while index < value.len() {
            let opcode = Opcode::parse(&value[index..]);
            index += opcode.byte_size();
            expression.push(opcode);
        }
        Self { expression }
    }
}

impl From<&[Opcode]> for Depex {
    fn from(value: &[Opcode]) -> Self {
        Self { expression: value.to_vec() }
    }
}

impl Depex {
    /// Returns the parsed opcodes.
    pub fn opcodes(&self) -> &[Opcode] {
        &self.expression
    }

    /// Returns true if the expression contains no opcodes.
    pub fn is_empty(&self) -> bool {
        self.expression.is_empty()
    }

    /// Evaluates the expression against the set of currently installed protocols.
    ///
    /// Associated (BEFORE/AFTER) and unscheduled SOR expressions evaluate to false, as do structurally invalid ones.
    pub fn eval(&mut self, protocols: &[efi::Guid]) -> bool {
        let length = self.expression.len();
        let mut stack: Vec<bool> = Vec::with_capacity(length);
        log::trace!("Depex:");
        for index in 0..length {
            let opcode = &mut self.expression[index];
            match opcode {
                Opcode::Before(_) | Opcode::After(_) => {
                    if index != 0 || length > 2 || (length == 2 && !matches!(self.expression[1], Opcode::End)) {
                        log::warn!("BEFORE/AFTER must be the only opcode in a depex: {:x?}", self.expression);
                    }
                    return false;
                }
                Opcode::Sor => {
                    if index != 0 {
                        log::warn!("SOR must be the first opcode in a depex: {:x?}", self.expression);
                    }
                    return false;
                }
                Opcode::Push(guid, present) => {
                    if !*present && protocols.contains(guid) {
                        *present = true;
                    }
                    stack.push(*present);
                }
                Opcode::And => {
                    let operand1 = stack.pop().unwrap_or(false);
                    let operand2 = stack.pop().unwrap_or(false);
                    stack.push(operand1 && operand2);
                }
                Opcode::Or => {
                    let operand1 = stack.pop().unwrap_or(false);
                    let operand2 = stack.pop().unwrap_or(false);
                    stack.push(operand1 || operand2);
                }
                Opcode::Not => {
                    let operand = stack.pop().unwrap_or(false);
                    stack.push(!operand);
                }
                Opcode::True => stack.push(true),
                Opcode::False => stack.push(false),
                Opcode::End => {
                    let result = stack.pop().unwrap_or(false);
                    log::trace!("  END => final result: {result:?}, remaining stack -> {stack:?}");
                    return result;
                }
                Opcode::Unknown(value) => {
                    log::warn!("Unknown depex opcode {value:#x}; evaluating to false.");
                    return false;
                }
                Opcode::Malformed { opcode, len } => {
                    log::error!("Depex opcode {opcode:#x} expects a guid, only has a length of: {len}");
                    return false;
                }
            }
            log::trace!("  {:x?} => stack -> {:?}", self.expression[index], stack);
        }
        log::warn!("Depex has no END opcode: {:x?}", self.expression);
        false
    }

    /// If the expression is an associated dependency, returns it.
    pub fn is_associated(&self) -> Option<AssociatedDependency> {
        match self.expression.first() {
            Some(Opcode::Before(guid)) => Some(AssociatedDependency::Before(*guid)),
            Some(Opcode::After(guid)) => Some(AssociatedDependency::After(*guid)),
            _ => None,
        }
    }

    /// Indicates that this is a "schedule on request" expression that has not yet been scheduled.
    pub fn is_sor(&self) -> bool {
        self.expression.first() == Some(&Opcode::Sor)
    }

    /// Marks a SOR expression as requested, so that the rest of the expression is evaluated from now on. Does nothing
    /// for other expressions.
    pub fn schedule(&mut self) {
        if self.is_sor() {
            self.expression.remove(0);
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use core::str::FromStr;
    use std::{vec, vec::Vec};

    use uuid::Uuid;

    use super::*;

    fn guid(s: &str) -> efi::Guid {
        efi::Guid::from_bytes(Uuid::from_str(s).unwrap().as_bytes())
    }

    fn push(bytes: &mut Vec<u8>, guid: &efi::Guid) {
        bytes.push(OPCODE_PUSH);
        bytes.extend_from_slice(guid.as_bytes());
    }

    #[test]
    fn malformed_opcodes_should_generate_malformed_variant() {
        assert_eq!(Depex::from([0x00u8].as_slice()).opcodes(), &[Opcode::Malformed { opcode: 0x00, len: 0 }]);
        assert_eq!(
            Depex::from([0x01u8, 0x01, 0x02, 0x03].as_slice()).opcodes(),
            &[Opcode::Malformed { opcode: 0x01, len: 3 }]
        );
        let mut depex = Depex::from([0x02u8, 0x01].as_slice());
        assert!(!depex.eval(&[]));
    }

    #[test]
    fn true_should_eval_true() {
        let mut depex = Depex::from(vec![OPCODE_TRUE, OPCODE_END].as_slice());
        assert!(depex.eval(&[]));
    }

    #[test]
    fn false_and_not_should_eval_as_expected() {
        assert!(!Depex::from([OPCODE_FALSE, OPCODE_END].as_slice()).eval(&[]));
        assert!(Depex::from([OPCODE_FALSE, OPCODE_NOT, OPCODE_END].as_slice()).eval(&[]));
        assert!(!Depex::from([OPCODE_TRUE, OPCODE_NOT, OPCODE_END].as_slice()).eval(&[]));
    }

    #[test]
    fn missing_end_should_eval_false() {
        assert!(!Depex::from([OPCODE_TRUE].as_slice()).eval(&[]));
    }

    #[test]
    fn unknown_opcode_should_eval_false() {
        let mut depex = Depex::from([OPCODE_TRUE, 0xE0, OPCODE_END].as_slice());
        assert_eq!(depex.opcodes()[1], Opcode::Unknown(0xE0));
        assert!(!depex.eval(&[]));
    }

    #[test]
    fn before_and_after_are_associated_and_eval_false() {
        let target = guid("76b6bdfa-2acd-4462-9e3f-cb58c969d937");
        let mut bytes = vec![OPCODE_BEFORE];
        bytes.extend_from_slice(target.as_bytes());
        bytes.push(OPCODE_END);
        let mut before = Depex::from(bytes.as_slice());
        assert_eq!(before.is_associated(), Some(AssociatedDependency::Before(target)));
        assert!(!before.eval(&[target]));

        bytes[0] = OPCODE_AFTER;
        let after = Depex::from(bytes.as_slice());
        assert_eq!(after.is_associated(), Some(AssociatedDependency::After(target)));
    }

    #[test]
    fn protocols_and_or_should_follow_installed_set() {
        let a = guid("0e896c7a-57dc-4987-bc22-abc3a8263210");
        let b = guid("1c67a5b1-e6b0-4c65-8a4a-fb9a5a3e7a3a");
        let c = guid("6e31c4e9-b2b7-4c90-9e4a-0c4d0d7c9c11");

        // (a AND b) OR c
        let mut bytes = Vec::new();
        push(&mut bytes, &a);
        push(&mut bytes, &b);
        bytes.push(OPCODE_AND);
        push(&mut bytes, &c);
        bytes.push(OPCODE_OR);
        bytes.push(OPCODE_END);

        assert!(!Depex::from(bytes.as_slice()).eval(&[]));
        assert!(!Depex::from(bytes.as_slice()).eval(&[a]));
        assert!(Depex::from(bytes.as_slice()).eval(&[a, b]));
        assert!(Depex::from(bytes.as_slice()).eval(&[c]));
    }

    #[test]
    fn push_should_remember_protocols_once_seen() {
        let a = guid("0e896c7a-57dc-4987-bc22-abc3a8263210");
        let mut depex = Depex::from([Opcode::Push(a, false), Opcode::End].as_slice());
        assert!(depex.eval(&[a]));
        assert!(depex.eval(&[]));
        assert_eq!(depex.opcodes()[0], Opcode::Push(a, true));
    }

    #[test]
    fn sor_should_eval_false_until_scheduled() {
        let mut depex = Depex::from([OPCODE_SOR, OPCODE_TRUE, OPCODE_END].as_slice());
        assert!(depex.is_sor());
        assert!(!depex.eval(&[]));
        depex.schedule();
        assert!(!depex.is_sor());
        assert!(depex.eval(&[]));
    }

    #[test]
    fn sor_not_first_should_eval_false() {
        let mut depex = Depex::from([OPCODE_TRUE, OPCODE_SOR, OPCODE_END].as_slice());
        assert!(!depex.is_sor());
        depex.schedule();
        assert!(!depex.eval(&[]));
    }

    #[test]
    fn empty_expression_is_empty() {
        let depex = Depex::from([0u8; 0].as_slice());
        assert!(depex.is_empty());
        assert_eq!(depex.is_associated(), None);
    }
}
