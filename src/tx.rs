// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use crate::{
    errno,
    error::{ErrorCode, OpResult, TxControl},
    exclusive::ExclusiveGate,
    ops::alloc::Allocator,
    record::{AccessKind, AccessMode, TxId, SPAN_SIZE},
    table::ResourceTable,
    tlog::{LogFn, TxLog},
};
use log::*;
use std::{collections::HashSet, sync::Arc};

/// The `begin` flag of a transaction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// First entry into the execution phase
    Fresh,

    /// Re-entered after a conflict or recovery-requested restart
    Restarted,

    /// Inside the recovery phase after an operation error
    Recovering,
}

/// Per-transaction context. One exists per [`crate::TxManager::run`] call
/// and is reused across that call's attempts; the held-record set and the
/// operation log drain to empty on every commit or rollback.
pub struct Transaction {
    pub(crate) id: TxId,
    pub(crate) status: TxStatus,
    pub(crate) retries: usize,
    pub(crate) irrevocable: bool,

    pub(crate) table: Arc<ResourceTable>,
    pub(crate) allocator: Arc<dyn Allocator>,
    pub(crate) gate: Arc<ExclusiveGate>,

    pub(crate) log: TxLog,
    pub(crate) held: HashSet<usize>,

    /// Thread-local error state as of the first adapter call of this
    /// attempt; restored verbatim on rollback. First save wins.
    saved_errno: Option<i32>,

    /// Code of the last operation error that entered recovery
    recovery_code: Option<ErrorCode>,
}

impl Transaction {
    pub(crate) fn new(
        id: TxId,
        table: Arc<ResourceTable>,
        allocator: Arc<dyn Allocator>,
        gate: Arc<ExclusiveGate>,
    ) -> Self {
        Self {
            id,
            status: TxStatus::Fresh,
            retries: 0,
            irrevocable: false,
            table,
            allocator,
            gate,
            log: TxLog::default(),
            held: HashSet::new(),
            saved_errno: None,
            recovery_code: None,
        }
    }

    pub fn id(&self) -> TxId {
        self.id
    }

    /// Why the execution (or recovery) phase was entered.
    pub fn status(&self) -> TxStatus {
        self.status
    }

    /// Number of rollbacks this transaction has been through.
    pub fn retries(&self) -> usize {
        self.retries
    }

    /// Code of the operation error currently being recovered from, if any.
    pub fn last_error(&self) -> Option<ErrorCode> {
        self.recovery_code
    }

    /// Whether this transaction runs with sole execution rights.
    pub fn is_irrevocable(&self) -> bool {
        self.irrevocable
    }

    /// Requests sole run rights for this transaction so it may perform
    /// irrevocable operations. A no-op when already exclusive; otherwise the
    /// attempt restarts and the next one enters the gate exclusively (at
    /// this point nothing irrevocable has happened yet, so rolling back is
    /// still legal).
    pub fn require_irrevocable(&mut self) -> OpResult<()> {
        if self.irrevocable {
            return Ok(());
        }
        info!("TX({}): requesting irrevocability, restarting exclusive", self.id);
        self.irrevocable = true;
        Err(TxControl::Restart)
    }

    /// Acquires ownership of every record covering `addr..addr + len`.
    /// The primitive higher-level layers build on; [`Transaction::load`],
    /// [`Transaction::store`] and the privatization calls go through it
    /// internally.
    pub fn acquire(&mut self, addr: usize, len: usize, kind: AccessKind) -> OpResult<()> {
        let mut a = addr;
        let end = addr + len;
        while a < end {
            self.acquire_span(a, kind)?;
            a = (a / SPAN_SIZE + 1) * SPAN_SIZE;
        }
        Ok(())
    }

    /// Transactional load of `buf.len()` bytes at `addr`. A pure operation:
    /// it acquires the covering records for isolation but leaves no log
    /// entry. Reads see the transaction's own buffered stores.
    pub fn load(&mut self, addr: usize, buf: &mut [u8]) -> OpResult<()> {
        let mut offset = 0;
        while offset < buf.len() {
            let a = addr + offset;
            let index = self.acquire_span(a, AccessKind::Read)?;
            let span_offset = a % SPAN_SIZE;
            let n = (SPAN_SIZE - span_offset).min(buf.len() - offset);

            let record = self.table.record(index);
            let state = record.lock();
            let from_local = state.mode == AccessMode::WriteBack && state.is_writer(self.id);
            for i in 0..n {
                let byte = span_offset + i;
                buf[offset + i] = if from_local && state.local_mask & (1 << byte) != 0 {
                    state.local[byte]
                } else {
                    state.shared[byte]
                };
            }
            offset += n;
        }
        Ok(())
    }

    /// Transactional store of `bytes` at `addr`. Deferred on a write-back
    /// record (buffered locally, published by the release at commit);
    /// writes straight through on a record privatized for store.
    pub fn store(&mut self, addr: usize, bytes: &[u8]) -> OpResult<()> {
        let mut offset = 0;
        while offset < bytes.len() {
            let a = addr + offset;
            let index = self.acquire_span(a, AccessKind::Write)?;
            let span_offset = a % SPAN_SIZE;
            let n = (SPAN_SIZE - span_offset).min(bytes.len() - offset);

            let record = self.table.record(index);
            let mut state = record.lock();
            match state.mode {
                AccessMode::WriteThrough => {
                    state.shared[span_offset..span_offset + n]
                        .copy_from_slice(&bytes[offset..offset + n]);
                }
                AccessMode::WriteBack => {
                    state.local[span_offset..span_offset + n]
                        .copy_from_slice(&bytes[offset..offset + n]);
                    for byte in span_offset..span_offset + n {
                        state.local_mask |= 1 << byte;
                    }
                }
            }
            offset += n;
        }
        Ok(())
    }

    /// Convenience load of a little-endian word at `addr`.
    pub fn load_u64(&mut self, addr: usize) -> OpResult<u64> {
        let mut buf = [0u8; 8];
        self.load(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Convenience store of a little-endian word at `addr`.
    pub fn store_u64(&mut self, addr: usize, value: u64) -> OpResult<()> {
        self.store(addr, &value.to_le_bytes())
    }

    /// Appends an (apply, undo, data) entry to the operation log. Apply
    /// functions run in insertion order at commit, undo functions in
    /// reverse order at rollback; neither runs before then.
    pub fn log_append(&mut self, apply: Option<LogFn>, undo: Option<LogFn>, data: u64) {
        self.log.append(apply, undo, data);
    }

    /// Saves the thread-local error state once per attempt; adapters call
    /// this before their first mutation of it.
    pub(crate) fn save_errno(&mut self) {
        if self.saved_errno.is_none() {
            self.saved_errno = Some(errno::get());
        }
    }

    pub(crate) fn acquire_span(&mut self, addr: usize, kind: AccessKind) -> OpResult<usize> {
        // clear the way for a waiting irrevocable transaction
        if !self.irrevocable && self.gate.is_pending() {
            debug!("TX({}): yielding to pending exclusive transaction", self.id);
            return Err(TxControl::Restart);
        }

        let index = self.table.index_of(addr);
        match self.table.acquire(self.id, index, kind) {
            Ok(()) => {
                self.held.insert(index);
                Ok(index)
            }
            Err(_) => {
                info!("TX({}): conflict on record {}", self.id, index);
                Err(TxControl::Restart)
            }
        }
    }

    /// Commit sequence: release every held record with `commit = true`
    /// (publishing buffered write-back content), then run the apply side of
    /// the log. The apply pass must come last so no release-class entry
    /// frees a resource a record write still needs.
    pub(crate) fn commit(&mut self) {
        info!("TX({}): COMMIT after {} retries", self.id, self.retries);
        for index in self.held.drain() {
            self.table.release(self.id, index, true);
        }
        self.log.apply_all();
        self.saved_errno = None;
        self.recovery_code = None;
    }

    /// Rollback sequence: release every held record with `commit = false`
    /// (restoring write-through pre-images), undo the log in reverse, then
    /// restore the saved thread-local error state.
    pub(crate) fn rollback(&mut self) {
        debug!("TX({}): ROLLBACK", self.id);
        for index in self.held.drain() {
            self.table.release(self.id, index, false);
        }
        self.log.undo_all();
        if let Some(saved) = self.saved_errno.take() {
            errno::set(saved);
        }
    }

    pub(crate) fn mark_restarted(&mut self) {
        self.status = TxStatus::Restarted;
        self.retries += 1;
    }

    pub(crate) fn enter_recovery(&mut self, code: ErrorCode) {
        self.status = TxStatus::Recovering;
        self.recovery_code = Some(code);
    }

    pub(crate) fn escalate(&mut self) {
        if !self.irrevocable {
            info!(
                "TX({}): escalating to exclusive mode after {} restarts",
                self.id, self.retries
            );
            self.irrevocable = true;
        }
    }
}
