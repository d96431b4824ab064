// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use crate::{
    error::TxError,
    lockmgr::LockManager,
    record::{AccessKind, ResourceRecord, TxId, SPAN_SIZE},
};
use log::*;
use std::time::Duration;

/// Fixed-granularity ownership table covering the transactional address
/// space. Every byte address maps to the [`ResourceRecord`] owning its
/// containing [`SPAN_SIZE`]-byte span by plain address decomposition: the
/// high bits index the record array, the low bits select the in-span byte.
///
/// The table owns the shared bytes themselves (inside each record), so the
/// address space is an arena constructed once and dropped at shutdown.
pub struct ResourceTable {
    records: Vec<ResourceRecord>,
    waiters: LockManager,
    wait_on_conflict: bool,
    wait_timeout: Duration,
}

impl ResourceTable {
    pub(crate) fn new(spans: usize, wait_on_conflict: bool, wait_timeout: Duration) -> Self {
        Self {
            records: (0..spans).map(|i| ResourceRecord::new(i * SPAN_SIZE)).collect(),
            waiters: LockManager::new(spans),
            wait_on_conflict,
            wait_timeout,
        }
    }

    /// Number of bytes covered by the table.
    pub fn len(&self) -> usize {
        self.records.len() * SPAN_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Index of the record covering `addr`.
    ///
    /// An address outside the covered space is a fatal configuration error
    /// with no transaction-level recovery path, so it aborts the process
    /// rather than returning an error.
    pub(crate) fn index_of(&self, addr: usize) -> usize {
        let index = addr / SPAN_SIZE;
        if index >= self.records.len() {
            panic!("address {:#x} is outside the covered address space", addr);
        }
        index
    }

    pub(crate) fn record(&self, index: usize) -> &ResourceRecord {
        &self.records[index]
    }

    /// Acquires the record at `index` for `tx`. With the lock-manager
    /// extension enabled a conflicting acquisition parks in the record's
    /// wait queue for a bounded time and retries exactly once; a second
    /// conflict is reported and restarts the transaction as usual.
    pub(crate) fn acquire(&self, tx: TxId, index: usize, kind: AccessKind) -> Result<(), TxError> {
        match self.records[index].try_acquire(tx, kind) {
            Ok(()) => Ok(()),
            Err(TxError::Conflict) if self.wait_on_conflict => {
                self.waiters.wait(index, tx, self.wait_timeout);
                self.records[index].try_acquire(tx, kind)
            }
            Err(e) => Err(e),
        }
    }

    /// Releases `tx`'s hold on the record at `index` and wakes any parked
    /// waiters. Content copy-back follows the write condition, see
    /// [`ResourceRecord::release`](crate::record::ResourceRecord).
    pub(crate) fn release(&self, tx: TxId, index: usize, commit: bool) {
        self.records[index].release(tx, commit);
        self.waiters.wake(index);
    }

    /// Non-transactional read of the globally visible bytes at `addr`,
    /// taking each record mutex in turn. Intended for initialization and
    /// verification outside of any transaction.
    pub fn read_atomic(&self, addr: usize, buf: &mut [u8]) {
        let mut offset = 0;
        while offset < buf.len() {
            let a = addr + offset;
            let index = self.index_of(a);
            let span_offset = a % SPAN_SIZE;
            let n = (SPAN_SIZE - span_offset).min(buf.len() - offset);
            let state = self.records[index].lock();
            buf[offset..offset + n].copy_from_slice(&state.shared[span_offset..span_offset + n]);
            offset += n;
        }
    }

    /// Non-transactional write of the globally visible bytes at `addr`.
    /// Intended for setting up initial memory content; concurrent use with
    /// running transactions voids isolation.
    pub fn write_atomic(&self, addr: usize, bytes: &[u8]) {
        let mut offset = 0;
        while offset < bytes.len() {
            let a = addr + offset;
            let index = self.index_of(a);
            let span_offset = a % SPAN_SIZE;
            let n = (SPAN_SIZE - span_offset).min(bytes.len() - offset);
            let mut state = self.records[index].lock();
            state.shared[span_offset..span_offset + n].copy_from_slice(&bytes[offset..offset + n]);
            offset += n;
        }
        trace!("wrote {} bytes atomically at {:#x}", bytes.len(), addr);
    }
}
