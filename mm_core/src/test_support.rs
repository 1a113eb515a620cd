//! MM Core Test Support
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
extern crate std;

use core::str::FromStr;

use r_efi::efi;
use uuid::Uuid;

pub(crate) fn test_guid(s: &str) -> efi::Guid {
    efi::Guid::from_bytes(Uuid::from_str(s).unwrap().as_bytes())
}
