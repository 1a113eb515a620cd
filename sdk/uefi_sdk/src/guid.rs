//! GUID helpers and well-known GUIDs.
//!
//! `efi::Guid` compares by raw byte equality but has no ordering. [`OrdGuid`] adds a byte-wise total order so GUIDs can
//! key ordered collections, and [`FmtGuid`] renders a GUID in registry format for log output.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::{cmp::Ordering, fmt};

use r_efi::efi;

/// Idle Loop Event Group GUID
///
/// Signaled between passes of `WaitForEvent` so that platforms can yield the processor while polling.
///
/// (`3C8D294C-5FC3-4451-BB31-C4C032295E6C`)
/// ```
/// # use uefi_sdk::guid::*;
/// # assert_eq!("3C8D294C-5FC3-4451-BB31-C4C032295E6C", format!("{:?}", FmtGuid(&IDLE_LOOP_EVENT_GROUP)));
/// ```
pub const IDLE_LOOP_EVENT_GROUP: efi::Guid =
    efi::Guid::from_fields(0x3c8d294c, 0x5fc3, 0x4451, 0xbb, 0x31, &[0xc4, 0xc0, 0x32, 0x29, 0x5e, 0x6c]);

/// Exit Boot Services Event Group GUID
///
/// (`27ABF055-B1B8-4C26-8048-748F37BAA2DF`)
pub const EVENT_GROUP_EXIT_BOOT_SERVICES: efi::Guid =
    efi::Guid::from_fields(0x27abf055, 0xb1b8, 0x4c26, 0x80, 0x48, &[0x74, 0x8f, 0x37, 0xba, 0xa2, 0xdf]);

/// Virtual Address Change Event Group GUID
///
/// (`13FA7698-C831-49C7-87EA-8F43FCC25196`)
pub const EVENT_GROUP_VIRTUAL_ADDRESS_CHANGE: efi::Guid =
    efi::Guid::from_fields(0x13fa7698, 0xc831, 0x49c7, 0x87, 0xea, &[0x8f, 0x43, 0xfc, 0xc2, 0x51, 0x96]);

/// Ready To Boot Event Group GUID
///
/// (`7CE88FB3-4BD7-4679-87A8-A8D8DEE50D2B`)
pub const EVENT_GROUP_READY_TO_BOOT: efi::Guid =
    efi::Guid::from_fields(0x7ce88fb3, 0x4bd7, 0x4679, 0x87, 0xa8, &[0xa8, 0xd8, 0xde, 0xe5, 0x0d, 0x2b]);

/// End of DXE Event Group GUID
///
/// (`02CE967A-DD7E-4FFC-9EE7-810CF0470880`)
/// ```
/// # use uefi_sdk::guid::*;
/// # assert_eq!("02CE967A-DD7E-4FFC-9EE7-810CF0470880", format!("{:?}", FmtGuid(&EVENT_GROUP_END_OF_DXE)));
/// ```
pub const EVENT_GROUP_END_OF_DXE: efi::Guid =
    efi::Guid::from_fields(0x2ce967a, 0xdd7e, 0x4ffc, 0x9e, 0xe7, &[0x81, 0xc, 0xf0, 0x47, 0x8, 0x80]);

/// DXE Dispatch Event GUID
///
/// Used as the MMI handler type for the request that asks the MM core to run its module dispatcher.
///
/// (`7081E22F-CAC6-4053-9468-675782CF88E5`)
pub const EVENT_DXE_DISPATCH: efi::Guid =
    efi::Guid::from_fields(0x7081e22f, 0xcac6, 0x4053, 0x94, 0x68, &[0x67, 0x57, 0x82, 0xcf, 0x88, 0xe5]);

/// DXE MM Ready To Lock Protocol GUID
///
/// Installed in DXE just before third-party code runs; the MM core receives it as an MMI handler type.
///
/// (`60FF8964-E906-41D0-AFED-F241E974E08E`)
pub const DXE_MM_READY_TO_LOCK_PROTOCOL: efi::Guid =
    efi::Guid::from_fields(0x60ff8964, 0xe906, 0x41d0, 0xaf, 0xed, &[0xf2, 0x41, 0xe9, 0x74, 0xe0, 0x8e]);

/// MM Ready To Lock Protocol GUID
///
/// (`47B7FA8C-F4BD-4AF6-8200-333086F0D2C8`)
pub const MM_READY_TO_LOCK_PROTOCOL: efi::Guid =
    efi::Guid::from_fields(0x47b7fa8c, 0xf4bd, 0x4af6, 0x82, 0x00, &[0x33, 0x30, 0x86, 0xf0, 0xd2, 0xc8]);

/// MM End Of DXE Protocol GUID
///
/// (`24E70042-D5C5-4260-8C39-0AD3AA32E93D`)
pub const MM_END_OF_DXE_PROTOCOL: efi::Guid =
    efi::Guid::from_fields(0x24e70042, 0xd5c5, 0x4260, 0x8c, 0x39, &[0x0a, 0xd3, 0xaa, 0x32, 0xe9, 0x3d]);

/// MM Ready To Boot Protocol GUID
///
/// (`6E057ECF-FA99-4F39-95BC-59F9921D17E4`)
pub const MM_READY_TO_BOOT_PROTOCOL: efi::Guid =
    efi::Guid::from_fields(0x6e057ecf, 0xfa99, 0x4f39, 0x95, 0xbc, &[0x59, 0xf9, 0x92, 0x1d, 0x17, 0xe4]);

/// MM Exit Boot Services Protocol GUID
///
/// (`296EB418-C4C8-4E05-AB59-39E8AF56F00A`)
pub const MM_EXIT_BOOT_SERVICES_PROTOCOL: efi::Guid =
    efi::Guid::from_fields(0x296eb418, 0xc4c8, 0x4e05, 0xab, 0x59, &[0x39, 0xe8, 0xaf, 0x56, 0xf0, 0x0a]);

/// Displays a GUID in registry format (`XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX`).
pub struct FmtGuid<'a>(pub &'a efi::Guid);

impl fmt::Display for FmtGuid<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (time_low, time_mid, time_hi_and_version, clk_seq_hi_res, clk_seq_low, node) = self.0.as_fields();
        write!(f, "{time_low:08X}-{time_mid:04X}-{time_hi_and_version:04X}-{clk_seq_hi_res:02X}{clk_seq_low:02X}-")?;
        for byte in node.iter() {
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for FmtGuid<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self)
    }
}

/// A GUID with a total order over its raw bytes.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct OrdGuid(pub efi::Guid);

impl PartialOrd for OrdGuid {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrdGuid {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.as_bytes().cmp(other.0.as_bytes())
    }
}

impl fmt::Debug for OrdGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&FmtGuid(&self.0), f)
    }
}

impl From<efi::Guid> for OrdGuid {
    fn from(guid: efi::Guid) -> Self {
        OrdGuid(guid)
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use core::str::FromStr;
    use std::{collections::BTreeSet, format};

    use uuid::Uuid;

    use super::*;

    fn guid(s: &str) -> efi::Guid {
        efi::Guid::from_bytes(Uuid::from_str(s).unwrap().as_bytes())
    }

    #[test]
    fn fmt_guid_uses_registry_format() {
        assert_eq!(format!("{}", FmtGuid(&EVENT_DXE_DISPATCH)), "7081E22F-CAC6-4053-9468-675782CF88E5");
        assert_eq!(format!("{:?}", FmtGuid(&MM_END_OF_DXE_PROTOCOL)), "24E70042-D5C5-4260-8C39-0AD3AA32E93D");
    }

    #[test]
    fn ord_guid_orders_by_raw_bytes() {
        let a = guid("00000000-0000-0000-0000-000000000001");
        let b = guid("00000000-0000-0000-0000-000000000002");
        let set: BTreeSet<OrdGuid> = [OrdGuid(b), OrdGuid(a), OrdGuid(b)].into_iter().collect();
        assert_eq!(set.len(), 2);
        assert_eq!(set.first(), Some(&OrdGuid(a)));
    }
}
