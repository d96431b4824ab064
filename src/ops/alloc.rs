// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Transactional allocation adapters.
//!
//! The core never manages heap internals; it logs undo and apply actions
//! around calls into an ordinary allocator behind the [`Allocator`] trait.
//! Allocating is revocable (the handle is released again on rollback),
//! freeing is deferred (nothing happens before commit), resizing is the
//! parametrized mix of both.

use crate::{
    errno,
    error::{ErrorCode, OpResult, TxControl},
    tx::Transaction,
};
use log::*;
use std::sync::{Arc, Mutex};

/// Handle naming one live allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocHandle(pub(crate) usize);

impl AllocHandle {
    fn as_word(self) -> u64 {
        self.0 as u64
    }

    fn from_word(word: u64) -> Self {
        Self(word as usize)
    }
}

/// An ordinary, non-transactional allocator. Object-safe so tests can
/// substitute failure-injecting implementations.
pub trait Allocator: Send + Sync {
    fn allocate(&self, len: usize) -> Result<AllocHandle, ErrorCode>;
    fn release(&self, handle: AllocHandle);
}

struct Slots {
    buffers: Vec<Option<Box<[u8]>>>,
    free: Vec<usize>,
}

/// Stock [`Allocator`]: a mutexed slot vector of boxed buffers. An optional
/// capacity limit turns exhaustion into [`ErrorCode::OutOfMemory`], which
/// integration tests use to drive the recovery path.
pub struct SlabAllocator {
    slots: Mutex<Slots>,
    capacity: Option<usize>,
}

impl SlabAllocator {
    pub fn unbounded() -> Self {
        Self::with_capacity(None)
    }

    pub fn bounded(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity))
    }

    fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            slots: Mutex::new(Slots {
                buffers: Vec::new(),
                free: Vec::new(),
            }),
            capacity,
        }
    }

    /// Number of live allocations.
    pub fn live(&self) -> usize {
        let slots = self.slots.lock().expect("allocator mutex poisoned");
        slots.buffers.len() - slots.free.len()
    }
}

impl Allocator for SlabAllocator {
    fn allocate(&self, len: usize) -> Result<AllocHandle, ErrorCode> {
        let mut slots = self.slots.lock().expect("allocator mutex poisoned");
        let live = slots.buffers.len() - slots.free.len();
        if self.capacity.map_or(false, |cap| live >= cap) {
            return Err(ErrorCode::OutOfMemory);
        }
        let buffer = vec![0u8; len].into_boxed_slice();
        let slot = match slots.free.pop() {
            Some(slot) => {
                slots.buffers[slot] = Some(buffer);
                slot
            }
            None => {
                slots.buffers.push(Some(buffer));
                slots.buffers.len() - 1
            }
        };
        Ok(AllocHandle(slot))
    }

    fn release(&self, handle: AllocHandle) {
        let mut guard = self.slots.lock().expect("allocator mutex poisoned");
        let slots = &mut *guard;
        match slots.buffers.get_mut(handle.0) {
            Some(slot @ Some(_)) => {
                *slot = None;
                slots.free.push(handle.0);
            }
            _ => warn!("released dead allocation handle {:?}", handle),
        }
    }
}

impl Transaction {
    /// Transactional allocation ([`crate::OpClass::Revocable`]): allocates now and
    /// logs an undo that releases the handle again. On allocator failure
    /// the thread-local error state is set and the transaction enters
    /// recovery; no sentinel is ever returned.
    pub fn alloc(&mut self, len: usize) -> OpResult<AllocHandle> {
        self.save_errno();
        match self.allocator.allocate(len) {
            Ok(handle) => {
                debug!("TX({}): alloc {} bytes -> {:?}", self.id, len, handle);
                let allocator = self.allocator.clone();
                self.log_append(
                    None,
                    Some(Box::new(move |word| {
                        allocator.release(AllocHandle::from_word(word))
                    })),
                    handle.as_word(),
                );
                Ok(handle)
            }
            Err(code) => {
                errno::set(code.as_raw());
                Err(TxControl::Recover(code))
            }
        }
    }

    /// Transactional free ([`crate::OpClass::Deferred`]): the handle stays live
    /// until commit, where the apply entry releases it. Rollback drops the
    /// entry and the allocation survives.
    pub fn free(&mut self, handle: AllocHandle) -> OpResult<()> {
        debug!("TX({}): free {:?} deferred to commit", self.id, handle);
        let allocator = self.allocator.clone();
        self.log_append(
            Some(Box::new(move |word| {
                allocator.release(AllocHandle::from_word(word))
            })),
            None,
            handle.as_word(),
        );
        Ok(())
    }

    /// Transactional resize ([`crate::OpClass::DeferredRevocable`]): a new
    /// allocation is made immediately (and revoked on rollback), the old
    /// handle is freed at commit. The new handle must be returned now,
    /// which is exactly why this class exists.
    pub fn resize(&mut self, handle: AllocHandle, len: usize) -> OpResult<AllocHandle> {
        let new = self.alloc(len)?;
        self.free(handle)?;
        Ok(new)
    }
}
