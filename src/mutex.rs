// Copyright © 2019-2020 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A data carrying wrapper around [`RtMutex`].

use core::cell::UnsafeCell;
use core::fmt;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use std::time::Instant;

use crate::config::LockConfig;
use crate::error::Result;
use crate::rtmutex::RtMutex;

/// A priority inheritance mutex protecting a `T`.
///
/// The lock is released when the [`MutexGuard`] goes out of scope. Guards
/// stay on the task that took them, ownership is per task.
pub struct Mutex<T: ?Sized> {
    raw: RtMutex,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

/// Exclusive access to the data of a [`Mutex`].
pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
    /// Must be unlocked by the task that locked.
    _not_send: PhantomData<*const ()>,
}

impl<T> Mutex<T> {
    pub fn new(data: T) -> Mutex<T> {
        Mutex::with_config(data, LockConfig::default())
    }

    pub fn with_config(data: T, config: LockConfig) -> Mutex<T> {
        Mutex {
            raw: RtMutex::with_config(config),
            data: UnsafeCell::new(data),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    fn guard(&self) -> MutexGuard<'_, T> {
        MutexGuard {
            mutex: self,
            _not_send: PhantomData,
        }
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, T>> {
        self.raw.lock()?;
        Ok(self.guard())
    }

    pub fn lock_interruptible(&self) -> Result<MutexGuard<'_, T>> {
        self.raw.lock_interruptible()?;
        Ok(self.guard())
    }

    pub fn timed_lock(&self, deadline: Instant) -> Result<MutexGuard<'_, T>> {
        self.raw.timed_lock(deadline)?;
        Ok(self.guard())
    }

    pub fn try_lock(&self) -> Result<MutexGuard<'_, T>> {
        self.raw.try_lock()?;
        Ok(self.guard())
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// The underlying lock.
    pub fn raw(&self) -> &RtMutex {
        &self.raw
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Mutex<T> {
        Mutex::new(T::default())
    }
}

impl<T: ?Sized> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex").field("raw", &self.raw).finish()
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.raw.unlock();
    }
}
