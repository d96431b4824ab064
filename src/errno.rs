// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Thread-local error state, the crate's `errno` equivalent.
//!
//! Adapters record the code of the last failed external operation here. The
//! transaction context saves the value once per attempt before the first
//! adapter mutates it and restores it verbatim on every restart or recovery
//! entry, so application code observes the same error state it would have
//! seen without the aborted attempts in between.

use std::cell::Cell;

thread_local! {
    static ERRNO: Cell<i32> = const { Cell::new(0) };
}

pub fn get() -> i32 {
    ERRNO.with(|e| e.get())
}

pub fn set(value: i32) {
    ERRNO.with(|e| e.set(value));
}
