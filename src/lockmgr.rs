// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Wait-queue extension of the ownership discipline.
//!
//! Instead of restarting on the first conflict, a transaction may park in
//! the conflicted record's wait queue for a bounded time and retry the
//! acquisition once after being woken by a release (or by the timeout).
//! Waits are always bounded, so circular waiting can never deadlock; a
//! transaction that stays unlucky falls back to an ordinary restart.

use crate::record::TxId;
use log::*;
use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex},
    time::Duration,
};

struct WaitSlot {
    queue: Mutex<WaitQueue>,
    wakeup: Condvar,
}

#[derive(Default)]
struct WaitQueue {
    waiters: VecDeque<TxId>,
    /// Bumped on every wake so parked waiters can tell a release from a
    /// spurious wakeup
    epoch: usize,
}

pub(crate) struct LockManager {
    slots: Vec<WaitSlot>,
}

impl LockManager {
    pub fn new(slots: usize) -> Self {
        Self {
            slots: (0..slots)
                .map(|_| WaitSlot {
                    queue: Mutex::new(WaitQueue::default()),
                    wakeup: Condvar::new(),
                })
                .collect(),
        }
    }

    /// Parks `tx` on the record at `index` until the next release of that
    /// record or until `timeout` elapsed, whichever comes first.
    pub fn wait(&self, index: usize, tx: TxId, timeout: Duration) {
        let slot = &self.slots[index];
        let mut queue = slot.queue.lock().expect("wait queue mutex poisoned");
        queue.waiters.push_back(tx);
        let entered = queue.epoch;

        debug!("TX({}): waiting on record {}", tx, index);
        let mut remaining = timeout;
        loop {
            let start = std::time::Instant::now();
            let (guard, result) = slot
                .wakeup
                .wait_timeout(queue, remaining)
                .expect("wait queue mutex poisoned");
            queue = guard;

            if queue.epoch != entered || result.timed_out() {
                break;
            }
            remaining = remaining.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                break;
            }
        }
        queue.waiters.retain(|w| *w != tx);
    }

    /// Wakes every transaction parked on the record at `index`. Each woken
    /// waiter retries its acquisition itself; queue order is advisory only.
    pub fn wake(&self, index: usize) {
        let slot = &self.slots[index];
        let mut queue = slot.queue.lock().expect("wait queue mutex poisoned");
        if !queue.waiters.is_empty() {
            queue.epoch = queue.epoch.wrapping_add(1);
            slot.wakeup.notify_all();
        }
    }
}
