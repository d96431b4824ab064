// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Irrevocability / exclusive-mode controller.
//!
//! Once a transaction performs an irrevocable operation it must never roll
//! back. The gate guarantees this structurally: every attempt of a normal
//! transaction holds the gate shared, an irrevocable attempt holds it
//! exclusively, so at most one irrevocable transaction exists system-wide
//! and no revocable transaction is mid-execution while it runs. The
//! `pending` flag makes in-flight revocable transactions restart at their
//! next record acquisition, draining the shared side quickly.

use log::*;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    RwLock, RwLockReadGuard, RwLockWriteGuard,
};

pub(crate) struct ExclusiveGate {
    pending: AtomicBool,
    gate: RwLock<()>,
}

pub(crate) struct GateGuard<'a> {
    _shared: Option<RwLockReadGuard<'a, ()>>,
    _exclusive: Option<RwLockWriteGuard<'a, ()>>,
}

impl ExclusiveGate {
    pub fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
            gate: RwLock::new(()),
        }
    }

    /// Enters the gate for one transaction attempt. The returned guard is
    /// held for the whole attempt and dropped on commit or rollback.
    pub fn enter(&self, exclusive: bool) -> GateGuard<'_> {
        if exclusive {
            self.pending.store(true, Ordering::SeqCst);
            let guard = self.gate.write().expect("exclusive gate poisoned");
            self.pending.store(false, Ordering::SeqCst);
            debug!("exclusive gate entered");
            GateGuard {
                _shared: None,
                _exclusive: Some(guard),
            }
        } else {
            GateGuard {
                _shared: Some(self.gate.read().expect("exclusive gate poisoned")),
                _exclusive: None,
            }
        }
    }

    /// Whether an irrevocable transaction is waiting for sole run rights.
    /// Revocable transactions poll this at every acquisition and restart to
    /// clear the way; the flag is a hint, mutual exclusion itself rests on
    /// the rwlock alone.
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }
}
