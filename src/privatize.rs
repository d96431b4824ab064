// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Privatization: direct access to shared memory from inside a
//! transaction.
//!
//! A privatized-for-store record is flipped to write-through: the shared
//! bytes become the live copy, stores land in them directly, and the local
//! buffer keeps a snapshot of the pre-image as the undo source. The release
//! write condition then restores the snapshot on rollback and leaves the
//! live bytes untouched on commit. Load-only privatization acquires shared
//! read ownership and leaves the record write-back.

use crate::{
    error::OpResult,
    record::{AccessKind, AccessMode, SPAN_SIZE},
    tx::Transaction,
};
use log::*;

/// Which direct accesses a privatized region must support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivatizeAccess {
    Load,
    Store,
    LoadStore,
}

impl PrivatizeAccess {
    fn wants_store(self) -> bool {
        !matches!(self, PrivatizeAccess::Load)
    }
}

impl Transaction {
    /// Privatizes `addr..addr + len` for direct access.
    pub fn privatize(&mut self, addr: usize, len: usize, access: PrivatizeAccess) -> OpResult<()> {
        let mut a = addr;
        let end = addr + len;
        while a < end {
            self.privatize_span(a, access)?;
            a = (a / SPAN_SIZE + 1) * SPAN_SIZE;
        }
        debug!("TX({}): privatized {} bytes at {:#x}", self.id, len, addr);
        Ok(())
    }

    /// Privatizes records starting at `addr` until `terminator` is found in
    /// the live shared data of a newly acquired span. Scanning the live
    /// bytes span by span avoids needing the length up front, which itself
    /// would require protected access. Returns the number of bytes up to
    /// and including the terminator.
    ///
    /// Running past the covered address space without finding the
    /// terminator is a fatal configuration error, like any uncovered
    /// address.
    pub fn privatize_until(
        &mut self,
        addr: usize,
        terminator: u8,
        access: PrivatizeAccess,
    ) -> OpResult<usize> {
        let mut a = addr;
        loop {
            let index = self.privatize_span(a, access)?;
            let span_offset = a % SPAN_SIZE;

            let record = self.table.record(index);
            let state = record.lock();
            for byte in span_offset..SPAN_SIZE {
                if state.shared[byte] == terminator {
                    let len = record.base() + byte - addr + 1;
                    debug!(
                        "TX({}): privatized {} terminator-scanned bytes at {:#x}",
                        self.id, len, addr
                    );
                    return Ok(len);
                }
            }
            drop(state);
            a = (a / SPAN_SIZE + 1) * SPAN_SIZE;
        }
    }

    fn privatize_span(&mut self, addr: usize, access: PrivatizeAccess) -> OpResult<usize> {
        if !access.wants_store() {
            return self.acquire_span(addr, AccessKind::Read);
        }

        let index = self.acquire_span(addr, AccessKind::Exclusive)?;
        let record = self.table.record(index);
        let mut guard = record.lock();
        let state = &mut *guard;
        if state.mode == AccessMode::WriteBack {
            if state.local_mask != 0 {
                // the record already holds buffered stores of this
                // transaction: swap them with the shared bytes so shared
                // becomes live and local keeps the pre-image for undo
                for i in 0..SPAN_SIZE {
                    if state.local_mask & (1 << i) != 0 {
                        let live = state.local[i];
                        state.local[i] = state.shared[i];
                        state.shared[i] = live;
                    } else {
                        state.local[i] = state.shared[i];
                    }
                }
            } else {
                state.local = state.shared;
            }
            state.local_mask = 0xff;
            state.mode = AccessMode::WriteThrough;
        }
        Ok(index)
    }
}
