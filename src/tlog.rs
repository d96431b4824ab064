// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use log::*;

/// Action invoked with the entry's opaque data word at commit or rollback.
pub type LogFn = Box<dyn FnOnce(u64) + Send>;

/// One logged operation. An entry with no apply function is pure-undo
/// (allocate-class), one with no undo function is pure-apply
/// (release-class). The data word is opaque to the log and passed through
/// to whichever function runs.
pub struct LogEntry {
    pub apply: Option<LogFn>,
    pub undo: Option<LogFn>,
    pub data: u64,
}

/// Append-only per-transaction operation log. Entries are appended in
/// execution order; the log is consumed exactly once, either by
/// [`TxLog::apply_all`] at commit or [`TxLog::undo_all`] at rollback, and
/// is empty afterwards.
#[derive(Default)]
pub struct TxLog {
    entries: Vec<LogEntry>,
}

impl TxLog {
    pub fn append(&mut self, apply: Option<LogFn>, undo: Option<LogFn>, data: u64) {
        self.entries.push(LogEntry { apply, undo, data });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Runs every apply function in insertion order and drains the log.
    /// Must run strictly after all resource-record releases of the commit,
    /// so no apply step frees a resource another entry still references.
    pub fn apply_all(&mut self) {
        let n = self.entries.len();
        if n > 0 {
            debug!("applying {} log entries", n);
        }
        for entry in self.entries.drain(..) {
            if let Some(apply) = entry.apply {
                apply(entry.data);
            }
        }
    }

    /// Runs every undo function in reverse insertion order and drains the
    /// log.
    pub fn undo_all(&mut self) {
        let n = self.entries.len();
        if n > 0 {
            debug!("undoing {} log entries", n);
        }
        for entry in self.entries.drain(..).rev() {
            if let Some(undo) = entry.undo {
                undo(entry.data);
            }
        }
    }
}
