// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use thiserror::Error as DeriveError;

/// Codes for expected failures of external operations, handed to the
/// application's recovery phase. The raw value doubles as the errno-style
/// integer adapters leave in the thread-local error state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// The allocator could not satisfy the request
    OutOfMemory,

    /// An allocation handle does not name a live allocation
    InvalidHandle,

    /// A descriptor operation failed
    Io,
}

impl ErrorCode {
    pub fn as_raw(self) -> i32 {
        match self {
            ErrorCode::OutOfMemory => 12,
            ErrorCode::InvalidHandle => 9,
            ErrorCode::Io => 5,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::OutOfMemory => write!(f, "out of memory"),
            ErrorCode::InvalidHandle => write!(f, "invalid allocation handle"),
            ErrorCode::Io => write!(f, "i/o failure"),
        }
    }
}

#[derive(Debug, DeriveError, PartialEq, Eq)]
pub enum TxError {
    #[error("resource record is owned by another transaction")]
    Conflict,

    #[error("operation failed ({0})")]
    Operation(ErrorCode),
}

/// Control signal raised inside a transaction body. Adapters never return
/// sentinel values: a conflict or an operation failure propagates via `?`
/// up to the dispatch loop in [`crate::TxManager::run`], which rolls the
/// transaction back and either re-enters the body or the recovery closure.
#[derive(Debug, PartialEq, Eq)]
pub enum TxControl {
    /// Roll back and re-enter the execution phase
    Restart,

    /// Roll back and enter the recovery phase with the given code
    Recover(ErrorCode),
}

/// Result type of every operation usable inside a transaction body.
pub type OpResult<T> = Result<T, TxControl>;

impl From<TxError> for TxControl {
    fn from(error: TxError) -> Self {
        match error {
            TxError::Operation(code) => TxControl::Recover(code),
            _ => TxControl::Restart,
        }
    }
}
