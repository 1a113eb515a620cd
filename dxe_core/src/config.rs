//! Core configuration.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::fmt;

use r_efi::efi;
use uefi_sdk::guid::{self, FmtGuid};

/// Tunables for a [`Core`](crate::Core).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CoreConfig {
    /// Period, in 100ns units, used when a periodic timer is set with a zero trigger time.
    pub default_timer_period: u64,
    /// Event group signaled between passes of `wait_for_event`.
    pub idle_loop_group: efi::Guid,
    /// How many times `connect_device_path` may invoke the module dispatcher before giving up.
    pub connect_device_path_attempts: usize,
}

impl CoreConfig {
    /// Overrides [`default_timer_period`](CoreConfig::default_timer_period).
    pub const fn with_default_timer_period(mut self, period: u64) -> Self {
        self.default_timer_period = period;
        self
    }

    /// Overrides [`idle_loop_group`](CoreConfig::idle_loop_group).
    pub const fn with_idle_loop_group(mut self, group: efi::Guid) -> Self {
        self.idle_loop_group = group;
        self
    }

    /// Overrides [`connect_device_path_attempts`](CoreConfig::connect_device_path_attempts).
    pub const fn with_connect_device_path_attempts(mut self, attempts: usize) -> Self {
        self.connect_device_path_attempts = attempts;
        self
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        // 10ms
        Self {
            default_timer_period: 100_000,
            idle_loop_group: guid::IDLE_LOOP_EVENT_GROUP,
            connect_device_path_attempts: 16,
        }
    }
}

impl fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreConfig")
            .field("default_timer_period", &self.default_timer_period)
            .field("idle_loop_group", &FmtGuid(&self.idle_loop_group))
            .field("connect_device_path_attempts", &self.connect_device_path_attempts)
            .finish()
    }
}
