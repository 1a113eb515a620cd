//! Conversion between UEFI status codes and rust errors.
//!
//! Only the status codes produced or consumed by the core services have dedicated variants; anything else is carried
//! through [`EfiError::Unknown`] so that it survives a round trip unchanged.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::fmt;

use r_efi::efi;

/// A specialized [`Result`](core::result::Result) type for core service operations.
pub type Result<T> = core::result::Result<T, EfiError>;

/// UEFI error status as a rust enum.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum EfiError {
    LoadError,
    InvalidParameter,
    Unsupported,
    BadBufferSize,
    BufferTooSmall,
    NotReady,
    DeviceError,
    OutOfResources,
    NotFound,
    AccessDenied,
    Timeout,
    NotStarted,
    AlreadyStarted,
    Aborted,
    SecurityViolation,
    Unknown(efi::Status),
}

impl EfiError {
    /// Converts an `r_efi::efi::Status` to a `Result`.
    ///
    /// `SUCCESS` and warning codes produce `Ok(())`; error codes produce the matching `EfiError`.
    ///
    /// ```
    /// # use r_efi::efi;
    /// # use uefi_sdk::error::EfiError;
    /// assert_eq!(EfiError::status_to_result(efi::Status::SUCCESS), Ok(()));
    /// assert_eq!(EfiError::status_to_result(efi::Status::NOT_FOUND), Err(EfiError::NotFound));
    /// ```
    pub fn status_to_result(status: efi::Status) -> Result<()> {
        if !status.is_error() {
            return Ok(());
        }
        Err(match status {
            efi::Status::LOAD_ERROR => EfiError::LoadError,
            efi::Status::INVALID_PARAMETER => EfiError::InvalidParameter,
            efi::Status::UNSUPPORTED => EfiError::Unsupported,
            efi::Status::BAD_BUFFER_SIZE => EfiError::BadBufferSize,
            efi::Status::BUFFER_TOO_SMALL => EfiError::BufferTooSmall,
            efi::Status::NOT_READY => EfiError::NotReady,
            efi::Status::DEVICE_ERROR => EfiError::DeviceError,
            efi::Status::OUT_OF_RESOURCES => EfiError::OutOfResources,
            efi::Status::NOT_FOUND => EfiError::NotFound,
            efi::Status::ACCESS_DENIED => EfiError::AccessDenied,
            efi::Status::TIMEOUT => EfiError::Timeout,
            efi::Status::NOT_STARTED => EfiError::NotStarted,
            efi::Status::ALREADY_STARTED => EfiError::AlreadyStarted,
            efi::Status::ABORTED => EfiError::Aborted,
            efi::Status::SECURITY_VIOLATION => EfiError::SecurityViolation,
            other => EfiError::Unknown(other),
        })
    }
}

impl From<EfiError> for efi::Status {
    fn from(e: EfiError) -> efi::Status {
        match e {
            EfiError::LoadError => efi::Status::LOAD_ERROR,
            EfiError::InvalidParameter => efi::Status::INVALID_PARAMETER,
            EfiError::Unsupported => efi::Status::UNSUPPORTED,
            EfiError::BadBufferSize => efi::Status::BAD_BUFFER_SIZE,
            EfiError::BufferTooSmall => efi::Status::BUFFER_TOO_SMALL,
            EfiError::NotReady => efi::Status::NOT_READY,
            EfiError::DeviceError => efi::Status::DEVICE_ERROR,
            EfiError::OutOfResources => efi::Status::OUT_OF_RESOURCES,
            EfiError::NotFound => efi::Status::NOT_FOUND,
            EfiError::AccessDenied => efi::Status::ACCESS_DENIED,
            EfiError::Timeout => efi::Status::TIMEOUT,
            EfiError::NotStarted => efi::Status::NOT_STARTED,
            EfiError::AlreadyStarted => efi::Status::ALREADY_STARTED,
            EfiError::Aborted => efi::Status::ABORTED,
            EfiError::SecurityViolation => efi::Status::SECURITY_VIOLATION,
            EfiError::Unknown(status) => status,
        }
    }
}

impl From<efi::Status> for EfiError {
    /// Converts an error status. Non-error statuses have no error equivalent and are carried as `Unknown`.
    fn from(status: efi::Status) -> EfiError {
        match EfiError::status_to_result(status) {
            Err(err) => err,
            Ok(()) => EfiError::Unknown(status),
        }
    }
}

impl fmt::Display for EfiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EfiError::Unknown(status) => write!(f, "Unknown({:#x})", status.as_usize()),
            other => fmt::Debug::fmt(other, f),
        }
    }
}
