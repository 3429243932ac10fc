// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Mutex as StdMutex, MutexGuard};

/// A Mutex that treats lock poisoning as fatal. A poisoned journal lock
/// means a panic mid-mutation; continuing would serve torn state.
#[derive(Debug, Default)]
pub struct Mutex<T>(StdMutex<T>);

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Mutex(StdMutex::new(value))
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.0
            .lock()
            .expect("cannot currently handle a poisoned lock")
    }
}
