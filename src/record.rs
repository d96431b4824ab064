// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use crate::error::TxError;
use std::sync::{Mutex, MutexGuard};

/// Number of bytes covered by one [`ResourceRecord`].
pub const SPAN_SIZE: usize = 8;

/// Identity of a transaction, handed out by the manager.
pub type TxId = usize;

/// Buffering discipline of a record while it is owned.
///
/// A write-back record collects stores in the transaction-local buffer and
/// publishes them at commit. A write-through record was privatized for
/// store: the shared bytes are live and the local buffer holds the
/// pre-image used to undo on rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    WriteBack,
    WriteThrough,
}

/// Requested ownership strength for an acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    /// Shared read access, compatible with other readers
    Read,

    /// Shared write access, one writer at a time
    Write,

    /// Sole ownership, required for privatization-for-store
    Exclusive,
}

#[derive(Debug, Clone)]
pub(crate) enum Owner {
    None,
    Exclusive(TxId),
    Shared { writer: Option<TxId>, readers: Vec<TxId> },
}

pub(crate) struct RecordState {
    /// The globally visible bytes of this span
    pub shared: [u8; SPAN_SIZE],

    /// Transaction-local buffer of the current writer
    pub local: [u8; SPAN_SIZE],

    /// Set bits mark bytes of `local` carrying a valid transaction-local value
    pub local_mask: u8,

    pub mode: AccessMode,
    pub owner: Owner,
}

/// Ownership record for one [`SPAN_SIZE`]-byte span of the covered address
/// space. The mutex protects every owner and mode transition; record content
/// is only touched by the current owner or while releasing.
pub struct ResourceRecord {
    base: usize,
    state: Mutex<RecordState>,
}

/// The single write condition of the release path: the local buffer is
/// copied out to the shared span iff `commit != write_through`. This covers
/// both publishing buffered stores at commit (write-back) and restoring the
/// pre-image on rollback (write-through).
pub(crate) fn copies_back(commit: bool, mode: AccessMode) -> bool {
    commit != matches!(mode, AccessMode::WriteThrough)
}

impl ResourceRecord {
    pub(crate) fn new(base: usize) -> Self {
        Self {
            base,
            state: Mutex::new(RecordState {
                shared: [0; SPAN_SIZE],
                local: [0; SPAN_SIZE],
                local_mask: 0,
                mode: AccessMode::WriteBack,
                owner: Owner::None,
            }),
        }
    }

    /// First byte address covered by this record.
    pub fn base(&self) -> usize {
        self.base
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RecordState> {
        self.state.lock().expect("resource record mutex poisoned")
    }

    /// Tries to extend ownership of this record to `tx` with the requested
    /// strength. An incompatible current owner is not an error condition but
    /// the designed conflict signal: the caller must restart.
    pub(crate) fn try_acquire(&self, tx: TxId, kind: AccessKind) -> Result<(), TxError> {
        let mut state = self.lock();
        if state.grant(tx, kind) {
            Ok(())
        } else {
            Err(TxError::Conflict)
        }
    }

    /// Releases `tx`'s hold on this record. Only the writing owner carries
    /// local content; its buffer is copied to the shared span when the write
    /// condition holds, then mask and mode are cleared.
    pub(crate) fn release(&self, tx: TxId, commit: bool) {
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.is_writer(tx) {
            if state.local_mask != 0 && copies_back(commit, state.mode) {
                for i in 0..SPAN_SIZE {
                    if state.local_mask & (1 << i) != 0 {
                        state.shared[i] = state.local[i];
                    }
                }
            }
            state.local_mask = 0;
            state.mode = AccessMode::WriteBack;
        }
        state.remove_owner(tx);
    }
}

impl RecordState {
    /// Compatibility check and owner transition. The discipline is strict:
    /// readers share with readers only, a writer excludes every other holder.
    /// This keeps released content out of sight of transactions that read the
    /// span earlier in their execution, which the serializability guarantee
    /// depends on.
    fn grant(&mut self, tx: TxId, kind: AccessKind) -> bool {
        match self.owner.clone() {
            Owner::None => {
                self.owner = match kind {
                    AccessKind::Read => Owner::Shared {
                        writer: None,
                        readers: vec![tx],
                    },
                    AccessKind::Write => Owner::Shared {
                        writer: Some(tx),
                        readers: Vec::new(),
                    },
                    AccessKind::Exclusive => Owner::Exclusive(tx),
                };
                true
            }
            Owner::Exclusive(owner) => owner == tx,
            Owner::Shared { writer, mut readers } => {
                let foreign_writer = writer.map_or(false, |w| w != tx);
                let foreign_readers = readers.iter().any(|r| *r != tx);
                match kind {
                    AccessKind::Read => {
                        if foreign_writer {
                            return false;
                        }
                        if !readers.contains(&tx) {
                            readers.push(tx);
                        }
                        self.owner = Owner::Shared { writer, readers };
                        true
                    }
                    AccessKind::Write => {
                        if foreign_writer || foreign_readers {
                            return false;
                        }
                        self.owner = Owner::Shared {
                            writer: Some(tx),
                            readers,
                        };
                        true
                    }
                    AccessKind::Exclusive => {
                        if foreign_writer || foreign_readers {
                            return false;
                        }
                        self.owner = Owner::Exclusive(tx);
                        true
                    }
                }
            }
        }
    }

    /// Whether `tx` currently holds write rights on this record.
    pub(crate) fn is_writer(&self, tx: TxId) -> bool {
        match &self.owner {
            Owner::Exclusive(owner) => *owner == tx,
            Owner::Shared { writer, .. } => *writer == Some(tx),
            Owner::None => false,
        }
    }

    fn remove_owner(&mut self, tx: TxId) {
        self.owner = match self.owner.clone() {
            Owner::Exclusive(owner) if owner == tx => Owner::None,
            Owner::Shared { mut writer, mut readers } => {
                if writer == Some(tx) {
                    writer = None;
                }
                readers.retain(|r| *r != tx);
                if writer.is_none() && readers.is_empty() {
                    Owner::None
                } else {
                    Owner::Shared { writer, readers }
                }
            }
            other => other,
        };
    }

    pub(crate) fn is_unowned(&self) -> bool {
        matches!(self.owner, Owner::None)
    }
}
