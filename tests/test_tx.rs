// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use systx::{
    errno, transactional, Allocator, ErrorCode, PrivatizeAccess, Recovery, SlabAllocator, TxConfig,
    TxControl, TxError, TxManager, TxStatus,
};
use threadpool::ThreadPool;

#[allow(unused_imports)]
use log::*;

#[ctor::ctor]
/// This function will be run before any of the tests
fn init_logger() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Info)
        .try_init();
}

fn read_u64(mgr: &TxManager, addr: usize) -> u64 {
    let mut buf = [0u8; 8];
    mgr.table().read_atomic(addr, &mut buf);
    u64::from_le_bytes(buf)
}

#[test]
fn test_basic_commit() {
    let mgr = TxManager::default();
    mgr.table().write_atomic(0, &100u64.to_le_bytes());

    let result = transactional(&mgr, |tx| {
        let v = tx.load_u64(0)?;
        tx.store_u64(0, v + 1)?;
        tx.store_u64(8, v)
    });

    assert!(result.is_ok(), "transaction failed");
    assert_eq!(read_u64(&mgr, 0), 101);
    assert_eq!(read_u64(&mgr, 8), 100);
    assert_eq!(mgr.committed(), 1);
}

#[test]
fn test_atomicity_across_forced_restarts() {
    let mgr = TxManager::default();
    let attempts = AtomicUsize::new(0);

    let result = transactional(&mgr, |tx| {
        let n = attempts.fetch_add(1, Ordering::SeqCst);
        tx.store_u64(0, 1)?;
        if n < 3 {
            // a partial effect that must never become visible
            return Err(TxControl::Restart);
        }
        assert_eq!(tx.status(), TxStatus::Restarted);
        assert_eq!(tx.retries(), 3);
        tx.store_u64(8, 2)?;
        Ok(())
    });

    assert!(result.is_ok(), "transaction failed");
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    // final state equals a single clean execution
    assert_eq!(read_u64(&mgr, 0), 1);
    assert_eq!(read_u64(&mgr, 8), 2);
}

#[test]
fn test_aborted_attempts_leave_no_trace() {
    let mgr = TxManager::default();
    mgr.table().write_atomic(0, &7u64.to_le_bytes());

    let result: Result<(), _> = mgr.run(
        |tx| {
            tx.store_u64(0, 99)?;
            Err(TxControl::Recover(ErrorCode::Io))
        },
        |_tx, _code| Recovery::Abort,
    );

    assert_eq!(result, Err(TxError::Operation(ErrorCode::Io)));
    assert_eq!(read_u64(&mgr, 0), 7);
}

/// The producer/consumer check: producers store pairs `(i0, f(i0))` with a
/// known deterministic `f`; consumers must never observe a mismatched pair,
/// whatever interleaving the scheduler picks.
#[test]
fn test_serializability_producer_consumer() {
    use rand::Rng;

    fn f(i0: u64) -> u64 {
        i0.wrapping_mul(2).wrapping_add(1)
    }

    let mgr = Arc::new(TxManager::default());
    mgr.table().write_atomic(0, &0u64.to_le_bytes());
    mgr.table().write_atomic(8, &f(0).to_le_bytes());

    let pool = ThreadPool::new(8);
    let rounds = 200;

    for _ in 0..rounds {
        let mgr_p = mgr.clone();
        let i0: u64 = rand::thread_rng().gen_range(0..10_000);
        pool.execute(move || {
            let result = transactional(&mgr_p, |tx| {
                tx.store_u64(0, i0)?;
                tx.store_u64(8, f(i0))
            });
            assert!(result.is_ok(), "producer failed");
        });

        let mgr_c = mgr.clone();
        pool.execute(move || {
            let result = transactional(&mgr_c, |tx| {
                let a = tx.load_u64(0)?;
                let b = tx.load_u64(8)?;
                Ok((a, b))
            });
            let (a, b) = result.expect("consumer failed");
            assert_eq!(b, f(a), "observed a torn pair ({}, {})", a, b);
        });
    }

    pool.join();
    assert_eq!(pool.panic_count(), 0);

    let (a, b) = (read_u64(&mgr, 0), read_u64(&mgr, 8));
    assert_eq!(b, f(a));
}

#[test]
fn test_privatization_commit_persists_mutation() {
    let mgr = TxManager::default();
    let pattern: Vec<u8> = (0..16).collect();
    mgr.table().write_atomic(16, &pattern);

    let result = transactional(&mgr, |tx| {
        tx.privatize(16, 16, PrivatizeAccess::LoadStore)?;
        tx.store(16, &[0xEE; 16])
    });

    assert!(result.is_ok(), "transaction failed");
    let mut after = [0u8; 16];
    mgr.table().read_atomic(16, &mut after);
    assert_eq!(after, [0xEE; 16]);
}

#[test]
fn test_privatization_rollback_restores_bytes() {
    let mgr = TxManager::default();
    let pattern: Vec<u8> = (100..116).collect();
    mgr.table().write_atomic(32, &pattern);

    let result: Result<(), _> = mgr.run(
        |tx| {
            tx.privatize(32, 16, PrivatizeAccess::LoadStore)?;
            // write-through: this lands in the shared bytes immediately
            tx.store(32, &[0u8; 16])?;
            Err(TxControl::Recover(ErrorCode::Io))
        },
        |_tx, _code| Recovery::Abort,
    );

    assert!(result.is_err());
    let mut after = vec![0u8; 16];
    mgr.table().read_atomic(32, &mut after);
    assert_eq!(after, pattern, "pre-privatization content not restored");
}

#[test]
fn test_privatization_survives_restart() {
    let mgr = TxManager::default();
    mgr.table().write_atomic(0, &[1u8; 8]);
    let attempts = AtomicUsize::new(0);

    let result = transactional(&mgr, |tx| {
        tx.privatize(0, 8, PrivatizeAccess::LoadStore)?;
        tx.store(0, &[9u8; 8])?;
        if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(TxControl::Restart);
        }
        Ok(())
    });

    assert!(result.is_ok(), "transaction failed");
    let mut after = [0u8; 8];
    mgr.table().read_atomic(0, &mut after);
    assert_eq!(after, [9u8; 8]);
}

#[test]
fn test_buffered_stores_swap_into_privatization() {
    let mgr = TxManager::default();
    mgr.table().write_atomic(8, &[5u8; 8]);

    // store write-back first, then privatize the same span: the buffered
    // value must become the live one and rollback must still restore
    let result: Result<(), _> = mgr.run(
        |tx| {
            tx.store(8, &[6u8; 8])?;
            tx.privatize(8, 8, PrivatizeAccess::LoadStore)?;
            let mut live = [0u8; 8];
            tx.load(8, &mut live)?;
            assert_eq!(live, [6u8; 8]);
            Err(TxControl::Recover(ErrorCode::Io))
        },
        |_tx, _code| Recovery::Abort,
    );

    assert!(result.is_err());
    let mut after = [0u8; 8];
    mgr.table().read_atomic(8, &mut after);
    assert_eq!(after, [5u8; 8]);
}

#[test]
fn test_privatize_until_terminator() {
    let mgr = TxManager::default();
    mgr.table().write_atomic(40, b"hello, world\0");

    let result = transactional(&mgr, |tx| {
        let len = tx.privatize_until(40, 0, PrivatizeAccess::LoadStore)?;
        // shout the live bytes in place
        tx.store(40, b"HELLO")?;
        Ok(len)
    });

    assert_eq!(result.expect("transaction failed"), 13);
    let mut after = vec![0u8; 13];
    mgr.table().read_atomic(40, &mut after);
    assert_eq!(&after, b"HELLO, world\0");
}

/// Liveness under pathological contention: every transaction touches the
/// same two spans, so collisions are guaranteed. Retry-then-escalate must
/// get each of them committed within a bounded number of attempts.
#[test]
fn test_liveness_under_pathological_contention() {
    use rand::Rng;

    let config = TxConfig {
        retry_threshold: 5,
        ..TxConfig::default()
    };
    let threshold = config.retry_threshold;
    let mgr = Arc::new(TxManager::new(config));
    let pool = ThreadPool::new(8);
    let workers = 64;

    for _ in 0..workers {
        let mgr = mgr.clone();
        pool.execute(move || {
            let flip: bool = rand::thread_rng().gen();
            let retries = transactional(&mgr, |tx| {
                // opposite acquisition orders maximize collisions
                let (first, second) = if flip { (0, 8) } else { (8, 0) };
                let a = tx.load_u64(first)?;
                tx.store_u64(first, a + 1)?;
                let b = tx.load_u64(second)?;
                tx.store_u64(second, b + 1)?;
                Ok(tx.retries())
            })
            .expect("transaction failed");

            // escalated transactions run alone, so one extra attempt
            // past the threshold must suffice
            assert!(retries <= threshold + 1, "unbounded retries: {}", retries);
        });
    }

    pool.join();
    assert_eq!(pool.panic_count(), 0);
    assert_eq!(read_u64(&mgr, 0), workers);
    assert_eq!(read_u64(&mgr, 8), workers);
}

#[test]
fn test_contention_with_lock_manager_waits() {
    let config = TxConfig {
        wait_on_conflict: true,
        wait_timeout: std::time::Duration::from_millis(5),
        ..TxConfig::default()
    };
    let mgr = Arc::new(TxManager::new(config));
    let pool = ThreadPool::new(4);
    let workers = 32;

    for _ in 0..workers {
        let mgr = mgr.clone();
        pool.execute(move || {
            transactional(&mgr, |tx| {
                let v = tx.load_u64(0)?;
                tx.store_u64(0, v + 1)
            })
            .expect("transaction failed");
        });
    }

    pool.join();
    assert_eq!(pool.panic_count(), 0);
    assert_eq!(read_u64(&mgr, 0), workers);
}

/// At any instant the number of transactions holding exclusive run rights
/// is 0 or 1, and nothing else commits while one is active.
#[test]
fn test_irrevocable_mutual_exclusion() {
    let mgr = Arc::new(TxManager::default());
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let pool = ThreadPool::new(8);

    for _ in 0..16 {
        let mgr = mgr.clone();
        let active = active.clone();
        let peak = peak.clone();
        pool.execute(move || {
            transactional(&mgr, |tx| {
                tx.require_irrevocable()?;

                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);

                let v = tx.load_u64(0)?;
                tx.store_u64(0, v + 1)?;
                std::thread::sleep(std::time::Duration::from_millis(1));

                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
            .expect("transaction failed");
        });
    }

    pool.join();
    assert_eq!(pool.panic_count(), 0);
    assert_eq!(peak.load(Ordering::SeqCst), 1, "two transactions ran exclusively at once");
    assert_eq!(read_u64(&mgr, 0), 16);
}

/// Allocation failure mid-transaction: the adapter signals recovery with
/// the out-of-memory code, recovery repairs the cause and restarts, and
/// the final state matches a failure-free run.
#[test]
fn test_allocation_failure_recovery_scenario() {
    let slab = Arc::new(SlabAllocator::bounded(1));
    let mgr = TxManager::with_allocator(TxConfig::default(), slab.clone());

    // saturate the allocator so the first transactional attempt fails
    let blocker = slab.allocate(64).expect("setup allocation failed");

    errno::set(0);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in_recovery = seen.clone();
    let slab_in_recovery = slab.clone();

    let result = mgr.run(
        |tx| {
            let handle = tx.alloc(64)?;
            tx.store_u64(0, 4242)?;
            Ok(handle)
        },
        move |tx, code| {
            seen_in_recovery
                .lock()
                .expect("seen mutex poisoned")
                .push(code);
            assert_eq!(tx.last_error(), Some(code));
            // saved thread-local error state was restored before entry
            assert_eq!(errno::get(), 0);
            // repair: make room, then resume execution
            slab_in_recovery.release(blocker);
            Recovery::Restart
        },
    );

    assert!(result.is_ok(), "transaction never recovered");
    assert_eq!(*seen.lock().expect("seen mutex poisoned"), vec![ErrorCode::OutOfMemory]);
    assert_eq!(read_u64(&mgr, 0), 4242);
    // exactly the transaction's allocation is live
    assert_eq!(slab.live(), 1);
}

#[test]
fn test_alloc_is_undone_on_abort_and_free_is_deferred() {
    let slab = Arc::new(SlabAllocator::unbounded());
    let mgr = TxManager::with_allocator(TxConfig::default(), slab.clone());

    // aborted allocation leaves nothing behind
    let result: Result<(), _> = mgr.run(
        |tx| {
            tx.alloc(16)?;
            Err(TxControl::Recover(ErrorCode::Io))
        },
        |_tx, _code| Recovery::Abort,
    );
    assert!(result.is_err());
    assert_eq!(slab.live(), 0);

    // a committed allocation survives, its later free only lands at commit
    let handle = transactional(&mgr, |tx| tx.alloc(16)).expect("alloc tx failed");
    assert_eq!(slab.live(), 1);

    let attempts = AtomicUsize::new(0);
    transactional(&mgr, |tx| {
        tx.free(handle)?;
        if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            assert_eq!(slab.live(), 1, "free must not land before commit");
            return Err(TxControl::Restart);
        }
        Ok(())
    })
    .expect("free tx failed");
    assert_eq!(slab.live(), 0);
}

#[test]
fn test_resize_returns_new_handle_immediately() {
    let slab = Arc::new(SlabAllocator::unbounded());
    let mgr = TxManager::with_allocator(TxConfig::default(), slab.clone());

    let old = transactional(&mgr, |tx| tx.alloc(8)).expect("alloc tx failed");

    let new = transactional(&mgr, |tx| {
        let new = tx.resize(old, 32)?;
        assert_ne!(new, old);
        Ok(new)
    })
    .expect("resize tx failed");

    assert_ne!(new, old);
    // old freed at commit, new live
    assert_eq!(slab.live(), 1);
}

#[test]
fn test_errno_restored_on_restart() {
    let slab = Arc::new(SlabAllocator::bounded(0));
    let mgr = TxManager::with_allocator(TxConfig::default(), slab);

    errno::set(42);
    let result: Result<(), _> = mgr.run(
        |tx| {
            tx.alloc(8)?;
            Ok(())
        },
        |_tx, _code| {
            // the adapter set the out-of-memory code, the rollback restored
            // the value saved at the start of the attempt
            assert_eq!(errno::get(), 42);
            Recovery::Abort
        },
    );
    assert_eq!(result, Err(TxError::Operation(ErrorCode::OutOfMemory)));
    assert_eq!(errno::get(), 42);
}
