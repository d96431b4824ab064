// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Descriptor I/O adapters.
//!
//! A seekable descriptor keeps transactions revocable: a read executes
//! immediately and logs an undo that winds the cursor back, a write is
//! deferred wholesale to commit. A non-seekable stream cannot be wound
//! back, so reading from one is irrevocable and requires sole run rights
//! first.

use crate::{
    errno,
    error::{ErrorCode, OpResult, TxControl},
    tx::Transaction,
};
use log::*;
use std::{
    fs::File,
    io::{Read, Seek, SeekFrom, Write},
    sync::{Arc, Mutex},
};

/// A seekable file shared between a transaction and its log entries.
pub struct TxFile {
    inner: Arc<Mutex<File>>,
}

impl TxFile {
    pub fn new(file: File) -> Self {
        Self {
            inner: Arc::new(Mutex::new(file)),
        }
    }

    /// Current cursor position, outside of any transaction.
    pub fn position(&self) -> std::io::Result<u64> {
        self.inner.lock().expect("file mutex poisoned").stream_position()
    }
}

fn recover_io(error: std::io::Error) -> TxControl {
    let code = ErrorCode::Io;
    errno::set(code.as_raw());
    debug!("descriptor operation failed: {}", error);
    TxControl::Recover(code)
}

impl Transaction {
    /// Sequential read from a seekable file ([`crate::OpClass::Revocable`]): the
    /// bytes are consumed immediately, the logged undo seeks the cursor
    /// back to where this read started.
    pub fn file_read(&mut self, file: &TxFile, buf: &mut [u8]) -> OpResult<usize> {
        self.save_errno();
        let (position, n) = {
            let mut f = file.inner.lock().expect("file mutex poisoned");
            let position = f.stream_position().map_err(recover_io)?;
            let n = f.read(buf).map_err(recover_io)?;
            (position, n)
        };

        let inner = file.inner.clone();
        self.log_append(
            None,
            Some(Box::new(move |word| {
                let mut f = inner.lock().expect("file mutex poisoned");
                if let Err(e) = f.seek(SeekFrom::Start(word)) {
                    warn!("cursor restore failed: {}", e);
                }
            })),
            position,
        );
        Ok(n)
    }

    /// Write to a seekable file at an absolute offset
    /// ([`crate::OpClass::Deferred`]): nothing reaches the descriptor before
    /// commit, where the apply entry seeks and writes. A failure during
    /// apply is logged, not surfaced; there is no recovery phase after
    /// commit. A read of the same region inside the same transaction does
    /// not observe the pending write.
    pub fn file_write(&mut self, file: &TxFile, offset: u64, bytes: &[u8]) -> OpResult<()> {
        self.save_errno();
        let inner = file.inner.clone();
        let data = bytes.to_vec();
        self.log_append(
            Some(Box::new(move |word| {
                let mut f = inner.lock().expect("file mutex poisoned");
                let written = f
                    .seek(SeekFrom::Start(word))
                    .and_then(|_| f.write_all(&data));
                if let Err(e) = written {
                    warn!("deferred write failed: {}", e);
                }
            })),
            None,
            offset,
        );
        Ok(())
    }

    /// Read from a non-seekable stream ([`crate::OpClass::Irrevocable`]). The
    /// transaction must have entered exclusive mode first; calling this
    /// from a revocable transaction is a contract violation with undefined
    /// rollback behavior, asserted in debug builds only.
    pub fn stream_read<R: Read>(&mut self, reader: &mut R, buf: &mut [u8]) -> OpResult<usize> {
        debug_assert!(
            self.is_irrevocable(),
            "irrevocable operation outside exclusive mode"
        );
        self.save_errno();
        reader.read(buf).map_err(recover_io)
    }
}
