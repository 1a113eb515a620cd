//! UEFI Task Priority Level (TPL) Locking support
//!
//! This crate provides a Mutex implementation based on UEFI TPL levels. Acquiring a [`TplMutex`] raises the TPL to the
//! level the mutex was created with; dropping the [`TplGuard`] releases the lock and then restores the previous TPL.
//!
//! The TPL itself is owned by whoever implements [`TplControl`] (normally a core context object), which is passed in
//! at lock time. Restoring the TPL on guard drop is what gives the owner a chance to dispatch pending notifications.
//!
//! ## Examples
//!
//! ```
//! use core::cell::Cell;
//! use r_efi::efi;
//! use tpl_lock::{TplControl, TplMutex};
//!
//! struct Tpl(Cell<efi::Tpl>);
//! impl TplControl for Tpl {
//!     fn raise_tpl(&self, new_tpl: efi::Tpl) -> efi::Tpl {
//!         self.0.replace(new_tpl)
//!     }
//!     fn restore_tpl(&self, old_tpl: efi::Tpl) {
//!         self.0.set(old_tpl);
//!     }
//! }
//!
//! let tpl = Tpl(Cell::new(efi::TPL_APPLICATION));
//! let mutex = TplMutex::new(efi::TPL_NOTIFY, 0_usize, "CounterLock");
//! {
//!     let mut guard = mutex.lock(&tpl);
//!     *guard += 1;
//!     assert_eq!(tpl.0.get(), efi::TPL_NOTIFY);
//! }
//! assert_eq!(tpl.0.get(), efi::TPL_APPLICATION);
//! ```
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#![cfg_attr(not(test), no_std)]

use core::{
    cell::UnsafeCell,
    fmt,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

use r_efi::efi;

/// Raises and restores the current TPL on behalf of a lock.
#[cfg_attr(test, mockall::automock)]
pub trait TplControl {
    /// Raises the TPL to `new_tpl` and returns the previous TPL.
    fn raise_tpl(&self, new_tpl: efi::Tpl) -> efi::Tpl;
    /// Restores the TPL to `old_tpl`, a value previously returned from `raise_tpl`.
    fn restore_tpl(&self, old_tpl: efi::Tpl);
}

/// Used to guard data with a locked MUTEX and TPL level.
pub struct TplMutex<T: ?Sized> {
    tpl_lock_level: efi::Tpl,
    lock: AtomicBool,
    name: &'static str,
    data: UnsafeCell<T>,
}

/// Wrapper for guarded data, which can be accessed by Deref or DerefMut on this object.
pub struct TplGuard<'a, T: ?Sized + 'a> {
    release: Option<(&'a dyn TplControl, efi::Tpl)>,
    lock: &'a AtomicBool,
    data: &'a mut T,
}

impl<T> TplMutex<T> {
    /// Instantiates a new TplMutex with the given TPL level, data object, and name string.
    pub const fn new(tpl_lock_level: efi::Tpl, data: T, name: &'static str) -> Self {
        Self { tpl_lock_level, lock: AtomicBool::new(false), data: UnsafeCell::new(data), name }
    }

    /// Consumes the mutex and returns the guarded data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> TplMutex<T> {
    /// Lock the TplMutex and return a TplGuard object used to access the data. The TPL is raised through `tpl` to the
    /// level specified at TplMutex creation.
    ///
    /// Lock reentrance is not supported; an attempt to re-lock something already locked will panic.
    pub fn lock<'a>(&'a self, tpl: &'a dyn TplControl) -> TplGuard<'a, T> {
        self.try_lock(tpl).unwrap_or_else(|| panic!("Re-entrant locks for {:?} not permitted.", self.name))
    }

    /// Attempts to lock the TplMutex, and if successful, returns a guard object that can be used to access the data.
    pub fn try_lock<'a>(&'a self, tpl: &'a dyn TplControl) -> Option<TplGuard<'a, T>> {
        let release_tpl = tpl.raise_tpl(self.tpl_lock_level);
        match self.acquire(Some((tpl, release_tpl))) {
            Some(guard) => Some(guard),
            None => {
                tpl.restore_tpl(release_tpl);
                None
            }
        }
    }

    /// Locks the mutex without touching the TPL.
    ///
    /// Intended for contexts where no TPL owner exists yet, such as construction and teardown of the owner itself.
    pub fn lock_without_tpl(&self) -> TplGuard<'_, T> {
        self.acquire(None).unwrap_or_else(|| panic!("Re-entrant locks for {:?} not permitted.", self.name))
    }

    /// Returns the TPL this mutex raises to when locked.
    pub fn tpl_lock_level(&self) -> efi::Tpl {
        self.tpl_lock_level
    }

    /// Returns the name the mutex was created with.
    pub fn name(&self) -> &'static str {
        self.name
    }

    fn acquire<'a>(&'a self, release: Option<(&'a dyn TplControl, efi::Tpl)>) -> Option<TplGuard<'a, T>> {
        if self.lock.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed).is_ok() {
            //Safety: the atomic flag grants exclusive access to data until the guard is dropped.
            Some(TplGuard { release, lock: &self.lock, data: unsafe { &mut *self.data.get() } })
        } else {
            None
        }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for TplMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.acquire(None) {
            Some(guard) => write!(f, "TplMutex {{ name: {:?}, data: {:?} }}", self.name, &*guard),
            None => write!(f, "TplMutex {{ name: {:?}, <locked> }}", self.name),
        }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for TplGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: ?Sized + fmt::Display> fmt::Display for TplGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&**self, f)
    }
}

impl<T: ?Sized> Deref for TplGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.data
    }
}

impl<T: ?Sized> DerefMut for TplGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.data
    }
}

impl<T: ?Sized> Drop for TplGuard<'_, T> {
    fn drop(&mut self) {
        // the lock must be free before restore_tpl runs, since restoring may dispatch notifications that take it.
        self.lock.store(false, Ordering::Release);
        if let Some((tpl, release_tpl)) = self.release {
            tpl.restore_tpl(release_tpl);
        }
    }
}
