// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Adapters turning external operations into transactional ones.
//!
//! Every wrapped operation belongs to exactly one [`OpClass`]; the class
//! dictates when the real effect happens and how it is taken back. The
//! adapter contract: a revocable or deferred adapter appends its log entry
//! before returning success, and signals failures through
//! [`crate::TxControl::Recover`] rather than a sentinel return value, so
//! transaction bodies carry no error-checking boilerplate.

pub mod alloc;
pub mod fs;

/// Behavioral classification of a wrapped operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    /// No side effects to manage; executes immediately, rollback needs
    /// nothing. Example: a memory load.
    Pure,

    /// Simulated until commit, where the apply side of the log entry runs.
    /// Rollback just drops the entry. Example: freeing an allocation.
    Deferred,

    /// Executes immediately; the undo side of the log entry reverts it on
    /// rollback. Example: making an allocation.
    Revocable,

    /// Executes immediately and cannot be taken back. Only legal once the
    /// transaction holds sole run rights, see
    /// [`crate::Transaction::require_irrevocable`]. Example: reading from a
    /// pipe.
    Irrevocable,

    /// Immediate revocable part plus a deferred release part. Example:
    /// resizing an allocation.
    DeferredRevocable,
}
