// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # System-Level Software Transactional Memory
//!
//! This crate implements a transaction manager providing ACID semantics
//! (minus durability; everything is in-memory) over a span-granular address
//! space and external resources such as allocations and descriptors.
//!
//! Concurrency control is ownership-based: every 8-byte span of the covered
//! address space has a resource record, and a record has at most one writing
//! owner at any instant. Effects are buffered write-back until commit, or
//! applied write-through under privatization with a logged pre-image.
//! Conflicts are not errors — they roll the losing transaction back and
//! re-enter its body transparently. Operation errors dispatch to an
//! application-supplied recovery phase. External operations integrate
//! through adapters classified as pure, deferred, revocable or irrevocable
//! (see [`ops::OpClass`]); irrevocable operations require sole run rights,
//! coordinated by the exclusive-mode gate that also guarantees progress for
//! transactions past the retry threshold.

pub mod errno;
pub mod error;
pub mod manager;
pub mod ops;
pub mod privatize;
pub mod record;
pub mod table;
pub mod tlog;
pub mod tx;

mod exclusive;
mod lockmgr;

pub use error::{ErrorCode, OpResult, TxControl, TxError};
pub use tlog::{LogEntry, LogFn, TxLog};
pub use manager::{Recovery, TxConfig, TxManager};
pub use ops::{
    alloc::{AllocHandle, Allocator, SlabAllocator},
    fs::TxFile,
    OpClass,
};
pub use privatize::PrivatizeAccess;
pub use record::{AccessKind, AccessMode, TxId, SPAN_SIZE};
pub use table::ResourceTable;
pub use tx::{Transaction, TxStatus};

/// Runs `body` as a transaction that silently restarts on conflicts and
/// aborts on operation errors, surfacing them as
/// [`TxError::Operation`]. Use [`TxManager::run`] directly to supply a
/// recovery phase instead.
///
/// ```
/// use systx::{transactional, TxManager};
///
/// let mgr = TxManager::default();
/// transactional(&mgr, |tx| {
///     let v = tx.load_u64(0)?;
///     tx.store_u64(0, v + 10)
/// })
/// .expect("transaction failed");
///
/// let mut buf = [0u8; 8];
/// mgr.table().read_atomic(0, &mut buf);
/// assert_eq!(u64::from_le_bytes(buf), 10);
/// ```
pub fn transactional<T, F>(manager: &TxManager, body: F) -> Result<T, TxError>
where
    F: FnMut(&mut Transaction) -> OpResult<T>,
{
    manager.run(body, |_tx, _code| Recovery::Abort)
}
