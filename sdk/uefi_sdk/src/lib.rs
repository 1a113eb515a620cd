//! UEFI Software Development Kit (SDK) for Rust
//!
//! Common types shared by the core service crates: a rust error type that round-trips with UEFI status codes, GUID
//! formatting and ordering helpers, and the well-known GUIDs the cores publish or consume.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#![cfg_attr(all(not(feature = "std"), not(test)), no_std)]

pub mod error;
pub mod guid;

/// Returns early with the given error if the condition does not hold.
///
/// ```
/// # use uefi_sdk::{ensure, error::EfiError};
/// fn check(pages: usize) -> Result<(), EfiError> {
///     ensure!(pages != 0, EfiError::InvalidParameter);
///     Ok(())
/// }
/// assert_eq!(check(0), Err(EfiError::InvalidParameter));
/// assert!(check(1).is_ok());
/// ```
#[macro_export]
macro_rules! ensure {
    ($condition:expr, $err:expr) => {{
        if !($condition) {
            $crate::error!($err);
        }
    }};
}

/// Returns early with the given error, converted into the error type of the enclosing function.
#[macro_export]
macro_rules! error {
    ($err:expr) => {{
        return Err($err.into());
    }};
}
