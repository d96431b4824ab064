// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use crate::{
    error::{ErrorCode, OpResult, TxControl, TxError},
    exclusive::ExclusiveGate,
    ops::alloc::{Allocator, SlabAllocator},
    table::ResourceTable,
    tx::Transaction,
};
use log::*;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

/// Exit of the application-supplied recovery phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Resume the execution phase
    Restart,

    /// Fall through and end the transaction, surfacing the error
    Abort,
}

#[derive(Debug, Clone)]
pub struct TxConfig {
    /// Number of [`crate::record::SPAN_SIZE`]-byte spans the resource table
    /// covers
    pub spans: usize,

    /// Restarts after which a transaction escalates to exclusive mode.
    /// Escalation rules out livelock: the escalated transaction runs alone
    /// and commits.
    pub retry_threshold: usize,

    /// Park on a conflicted record's wait queue instead of restarting
    /// immediately
    pub wait_on_conflict: bool,

    /// Upper bound on any single conflict wait
    pub wait_timeout: Duration,
}

impl Default for TxConfig {
    fn default() -> Self {
        Self {
            spans: 1024,
            retry_threshold: 10,
            wait_on_conflict: false,
            wait_timeout: Duration::from_millis(10),
        }
    }
}

/// The transaction manager: owns the resource table, the exclusive-mode
/// gate and the allocator seam, and drives every transaction's lifecycle
/// through its dispatch loop.
pub struct TxManager {
    table: Arc<ResourceTable>,
    allocator: Arc<dyn Allocator>,
    gate: Arc<ExclusiveGate>,
    next_tx_id: AtomicUsize,
    committed: AtomicUsize,
    config: TxConfig,
}

impl Default for TxManager {
    fn default() -> Self {
        Self::new(TxConfig::default())
    }
}

impl TxManager {
    pub fn new(config: TxConfig) -> Self {
        Self::with_allocator(config, Arc::new(SlabAllocator::unbounded()))
    }

    /// Builds a manager around a caller-supplied allocator, the seam used
    /// by tests to inject allocation failures.
    pub fn with_allocator(config: TxConfig, allocator: Arc<dyn Allocator>) -> Self {
        Self {
            table: Arc::new(ResourceTable::new(
                config.spans,
                config.wait_on_conflict,
                config.wait_timeout,
            )),
            allocator,
            gate: Arc::new(ExclusiveGate::new()),
            next_tx_id: AtomicUsize::new(0),
            committed: AtomicUsize::new(0),
            config,
        }
    }

    /// The resource table, for non-transactional initialization and
    /// verification of memory content.
    pub fn table(&self) -> &Arc<ResourceTable> {
        &self.table
    }

    /// Number of transactions committed so far.
    pub fn committed(&self) -> usize {
        self.committed.load(Ordering::SeqCst)
    }

    /// Runs a transaction to completion: the body executes, and on success
    /// the transaction commits. A conflict rolls back and silently
    /// re-enters the body with [`crate::TxStatus::Restarted`]. An operation
    /// error rolls back and dispatches to `recover`, which decides between
    /// resuming execution and ending the transaction with the error.
    ///
    /// The controller itself never detects errors: detection lives in the
    /// adapter operations, recovery in the supplied closure. Restarts are
    /// invisible to the caller; after `retry_threshold` of them the
    /// transaction escalates to exclusive mode and runs alone, which
    /// bounds the number of attempts under any contention.
    pub fn run<T, F, R>(&self, mut body: F, mut recover: R) -> Result<T, TxError>
    where
        F: FnMut(&mut Transaction) -> OpResult<T>,
        R: FnMut(&mut Transaction, ErrorCode) -> Recovery,
    {
        let id = self.next_tx_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut tx = Transaction::new(id, self.table.clone(), self.allocator.clone(), self.gate.clone());

        loop {
            let _gate = self.gate.enter(tx.is_irrevocable());
            info!("TX({}): START ({:?})", id, tx.status());

            match body(&mut tx) {
                Ok(value) => {
                    tx.commit();
                    self.committed.fetch_add(1, Ordering::SeqCst);
                    return Ok(value);
                }
                Err(TxControl::Restart) => {
                    tx.rollback();
                    tx.mark_restarted();
                    if tx.retries() > self.config.retry_threshold {
                        tx.escalate();
                    }
                }
                Err(TxControl::Recover(code)) => {
                    info!("TX({}): RECOVER ({})", id, code);
                    tx.rollback();
                    tx.enter_recovery(code);
                    match recover(&mut tx, code) {
                        Recovery::Restart => tx.mark_restarted(),
                        Recovery::Abort => {
                            info!("TX({}): ABORT ({})", id, code);
                            return Err(TxError::Operation(code));
                        }
                    }
                }
            }
        }
    }
}
