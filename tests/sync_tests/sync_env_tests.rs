//! Tests for SyncEnv
//!
//! These tests verify:
//! - Lock-mode detection at construction and on open
//! - Flag proxies (mode transitions, no state change on failure)
//! - Mutual exclusion in NO_LOCK mode
//! - Resize exclusivity against running transactions, including the
//!   backoff window of a delayed resize
//! - Retry loop driven by the handler chain
//! - Error propagation (MapFull, body errors)

#[path = "../support/mod.rs"]
mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel;
use envsync::{
    default_handlers, handler_fn, Backoff, EnvFlags, Handler, MapResizedHandler, SyncEnv,
    SyncError, TxnFlags,
};
use parking_lot::Mutex;
use support::{Kind, ProbeEnv};

// =============================================================================
// Helper Functions
// =============================================================================

fn handlers() -> Vec<Arc<dyn Handler<ProbeEnv>>> {
    vec![Arc::new(MapResizedHandler::new(8, Backoff::None))]
}

fn setup_env(flags: EnvFlags) -> SyncEnv<ProbeEnv> {
    let env = SyncEnv::new(None, handlers()).unwrap();
    env.open("probe", flags, 0o644).unwrap();
    env
}

fn probe(env: &SyncEnv<ProbeEnv>) -> &ProbeEnv {
    // SAFETY: tests only read the probe's records.
    unsafe { env.raw() }
}

fn assert_sequential(spans: &[(Instant, Instant)]) {
    let mut spans = spans.to_vec();
    spans.sort_by_key(|s| s.0);
    for pair in spans.windows(2) {
        assert!(
            pair[1].0 >= pair[0].1,
            "spans overlap: {:?} starts before {:?} ends",
            pair[1],
            pair[0]
        );
    }
}

// =============================================================================
// Construction / Flag Detection Tests
// =============================================================================

#[test]
fn test_new_without_engine_creates_one() {
    let env: SyncEnv<ProbeEnv> = SyncEnv::new(None, Vec::new()).unwrap();

    assert!(!env.is_no_lock());
    assert!(env.handlers().is_empty());
}

#[test]
fn test_unopened_engine_defaults_to_engine_locking() {
    let env = SyncEnv::new(Some(ProbeEnv::new()), handlers()).unwrap();

    assert!(!env.is_no_lock());
}

#[test]
fn test_detects_no_lock_on_open_engine() {
    let env = SyncEnv::new(Some(ProbeEnv::opened(EnvFlags::NO_LOCK)), handlers()).unwrap();

    assert!(env.is_no_lock());
}

#[test]
fn test_open_engine_without_no_lock() {
    let env = SyncEnv::new(Some(ProbeEnv::opened(EnvFlags::NO_SYNC)), handlers()).unwrap();

    assert!(!env.is_no_lock());
}

#[test]
fn test_open_with_no_lock_sets_mode() {
    let env: SyncEnv<ProbeEnv> = SyncEnv::new(None, handlers()).unwrap();

    env.open("probe", EnvFlags::NO_LOCK | EnvFlags::NO_SYNC, 0o644).unwrap();

    assert!(env.is_no_lock());
}

#[test]
fn test_failed_open_leaves_mode_unchanged() {
    let engine = ProbeEnv::new();
    engine.fail_next.store(true, Ordering::SeqCst);
    let env = SyncEnv::new(Some(engine), handlers()).unwrap();

    let result = env.open("probe", EnvFlags::NO_LOCK, 0o644);

    assert!(matches!(result, Err(SyncError::Config(_))));
    assert!(!env.is_no_lock());
}

#[test]
fn test_second_open_fails() {
    let env = setup_env(EnvFlags::empty());

    let result = env.open("probe", EnvFlags::NO_LOCK, 0o644);

    assert!(matches!(result, Err(SyncError::AlreadyOpen)));
    assert!(!env.is_no_lock());
}

// =============================================================================
// Flag Proxy Tests
// =============================================================================

#[test]
fn test_set_and_unset_no_lock() {
    let env = setup_env(EnvFlags::empty());

    env.set_flags(EnvFlags::NO_LOCK).unwrap();
    assert!(env.is_no_lock());
    assert!(probe(&env).engine_flags().contains(EnvFlags::NO_LOCK));

    env.unset_flags(EnvFlags::NO_LOCK).unwrap();
    assert!(!env.is_no_lock());
    assert!(!probe(&env).engine_flags().contains(EnvFlags::NO_LOCK));
}

#[test]
fn test_other_flags_do_not_change_mode() {
    let env = setup_env(EnvFlags::empty());

    env.set_flags(EnvFlags::NO_SYNC).unwrap();
    assert!(!env.is_no_lock());
    assert!(probe(&env).engine_flags().contains(EnvFlags::NO_SYNC));

    env.set_flags(EnvFlags::NO_LOCK).unwrap();
    env.unset_flags(EnvFlags::NO_SYNC).unwrap();
    assert!(env.is_no_lock());
}

#[test]
fn test_failed_set_flags_leaves_mode_unchanged() {
    let env = setup_env(EnvFlags::empty());
    probe(&env).fail_next.store(true, Ordering::SeqCst);

    assert!(env.set_flags(EnvFlags::NO_LOCK).is_err());
    assert!(!env.is_no_lock());
}

#[test]
fn test_failed_unset_flags_leaves_mode_unchanged() {
    let env = setup_env(EnvFlags::NO_LOCK);
    probe(&env).fail_next.store(true, Ordering::SeqCst);

    assert!(env.unset_flags(EnvFlags::NO_LOCK).is_err());
    assert!(env.is_no_lock());
}

// =============================================================================
// Admission Tests
// =============================================================================

#[test]
fn test_no_lock_updates_never_overlap() {
    let env = setup_env(EnvFlags::NO_LOCK);
    let spans = Mutex::new(Vec::new());

    crossbeam::thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|_| {
                for _ in 0..5 {
                    env.update(|_txn| {
                        let start = Instant::now();
                        thread::sleep(Duration::from_millis(2));
                        spans.lock().push((start, Instant::now()));
                        Ok(())
                    })
                    .unwrap();
                }
            });
        }
    })
    .unwrap();

    assert_eq!(spans.lock().len(), 20);
    assert_sequential(&spans.lock());
    assert_eq!(probe(&env).violations.load(Ordering::SeqCst), 0);
}

#[test]
fn test_no_lock_reads_never_overlap_writes() {
    let env = setup_env(EnvFlags::NO_LOCK);

    crossbeam::thread::scope(|s| {
        for i in 0..6 {
            let env = &env;
            s.spawn(move |_| {
                for _ in 0..5 {
                    let body = |_txn: &mut support::ProbeTxn| {
                        thread::sleep(Duration::from_millis(1));
                        Ok(())
                    };
                    if i % 2 == 0 {
                        env.update(body).unwrap();
                    } else {
                        env.view(body).unwrap();
                    }
                }
            });
        }
    })
    .unwrap();

    let writes = probe(&env).intervals_of(Kind::Write);
    let reads = probe(&env).intervals_of(Kind::Read);
    assert_eq!(writes.len(), 15);
    assert_eq!(reads.len(), 15);
    for w in &writes {
        for r in &reads {
            assert!(!w.overlaps(r), "write {:?} overlaps read {:?}", w, r);
        }
    }
    assert_eq!(probe(&env).violations.load(Ordering::SeqCst), 0);
}

#[test]
fn test_update_takes_shared_path_with_engine_locking() {
    let env = setup_env(EnvFlags::empty());
    let (entered_tx, entered_rx) = channel::bounded::<()>(1);
    let (seen_tx, seen_rx) = channel::bounded::<()>(1);

    crossbeam::thread::scope(|s| {
        let writer = s.spawn(|_| {
            env.update(|_txn| {
                entered_tx.send(()).unwrap();
                // Only completes if the concurrent view was admitted.
                seen_rx
                    .recv_timeout(Duration::from_secs(5))
                    .map_err(SyncError::txn)
            })
        });

        entered_rx.recv().unwrap();
        env.view(|_txn| {
            seen_tx.send(()).unwrap();
            Ok(())
        })
        .unwrap();

        writer.join().unwrap().unwrap();
    })
    .unwrap();
}

#[test]
fn test_set_flags_switches_update_to_exclusive_path() {
    let env = setup_env(EnvFlags::empty());
    env.set_flags(EnvFlags::NO_LOCK).unwrap();

    let (entered_tx, entered_rx) = channel::bounded::<()>(1);
    let write_end = Mutex::new(None);
    let read_start = Mutex::new(None);

    crossbeam::thread::scope(|s| {
        s.spawn(|_| {
            env.update(|_txn| {
                entered_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(50));
                *write_end.lock() = Some(Instant::now());
                Ok(())
            })
            .unwrap();
        });

        entered_rx.recv().unwrap();
        env.view(|_txn| {
            *read_start.lock() = Some(Instant::now());
            Ok(())
        })
        .unwrap();
    })
    .unwrap();

    let write_end = write_end.lock().unwrap();
    let read_start = read_start.lock().unwrap();
    assert!(read_start >= write_end);
}

#[test]
fn test_unset_flags_reverts_to_shared_path() {
    let env = setup_env(EnvFlags::NO_LOCK);
    env.unset_flags(EnvFlags::NO_LOCK).unwrap();

    let (entered_tx, entered_rx) = channel::bounded::<()>(1);
    let (seen_tx, seen_rx) = channel::bounded::<()>(1);

    crossbeam::thread::scope(|s| {
        let writer = s.spawn(|_| {
            env.update(|_txn| {
                entered_tx.send(()).unwrap();
                seen_rx
                    .recv_timeout(Duration::from_secs(5))
                    .map_err(SyncError::txn)
            })
        });

        entered_rx.recv().unwrap();
        env.view(|_txn| {
            seen_tx.send(()).unwrap();
            Ok(())
        })
        .unwrap();

        writer.join().unwrap().unwrap();
    })
    .unwrap();
}

#[test]
fn test_no_lock_second_update_starts_after_first_ends() {
    let env = setup_env(EnvFlags::NO_LOCK);
    let (entered_tx, entered_rx) = channel::bounded::<()>(1);
    let spans = Mutex::new(Vec::new());

    crossbeam::thread::scope(|s| {
        s.spawn(|_| {
            env.update(|_txn| {
                let start = Instant::now();
                entered_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(30));
                spans.lock().push((start, Instant::now()));
                Ok(())
            })
            .unwrap();
        });

        entered_rx.recv().unwrap();
        env.update(|_txn| {
            let start = Instant::now();
            spans.lock().push((start, Instant::now()));
            Ok(())
        })
        .unwrap();
    })
    .unwrap();

    let spans = spans.lock();
    assert_eq!(spans.len(), 2);
    assert!(spans[1].0 >= spans[0].1);
}

#[test]
fn test_updates_queued_behind_no_lock_switch_take_exclusive_path() {
    let env = setup_env(EnvFlags::empty());

    crossbeam::thread::scope(|s| {
        let env = &env;

        // A long read holds the shared lock; the switch queues behind it.
        s.spawn(move |_| {
            env.view(|_txn| {
                thread::sleep(Duration::from_millis(300));
                Ok(())
            })
            .unwrap();
        });
        thread::sleep(Duration::from_millis(50));
        s.spawn(move |_| env.set_flags(EnvFlags::NO_LOCK).unwrap());
        thread::sleep(Duration::from_millis(50));

        // These read the mode before the switch lands.
        for _ in 0..2 {
            s.spawn(move |_| {
                env.update(|_txn| {
                    thread::sleep(Duration::from_millis(100));
                    Ok(())
                })
                .unwrap();
            });
        }
    })
    .unwrap();

    assert!(env.is_no_lock());
    let writes = probe(&env).intervals_of(Kind::Write);
    assert_eq!(writes.len(), 2);
    assert!(!writes[0].overlaps(&writes[1]), "NO_LOCK writes overlapped");
    assert_eq!(probe(&env).violations.load(Ordering::SeqCst), 0);
}

// =============================================================================
// Resize Tests
// =============================================================================

#[test]
fn test_set_map_size_reaches_engine() {
    let env = setup_env(EnvFlags::empty());

    env.set_map_size(1 << 20).unwrap();

    assert_eq!(probe(&env).map_size.load(Ordering::SeqCst), 1 << 20);
    assert_eq!(*probe(&env).resize_calls.lock(), vec![1 << 20]);
}

#[test]
fn test_resize_never_overlaps_transactions() {
    for flags in [EnvFlags::empty(), EnvFlags::NO_LOCK] {
        let env = setup_env(flags);
        *probe(&env).resize_hold.lock() = Duration::from_millis(20);

        crossbeam::thread::scope(|s| {
            for i in 0..8 {
                let env = &env;
                s.spawn(move |_| {
                    for _ in 0..10 {
                        let body = |_txn: &mut support::ProbeTxn| {
                            thread::sleep(Duration::from_millis(1));
                            Ok(())
                        };
                        if i % 2 == 0 {
                            env.view(body).unwrap();
                        } else {
                            env.update(body).unwrap();
                        }
                    }
                });
            }
            s.spawn(|_| {
                thread::sleep(Duration::from_millis(5));
                env.set_map_size(4 << 20).unwrap();
            });
        })
        .unwrap();

        let resizes = probe(&env).intervals_of(Kind::Resize);
        assert_eq!(resizes.len(), 1);
        for kind in [Kind::Read, Kind::Write] {
            for txn in probe(&env).intervals_of(kind) {
                assert!(!txn.overlaps(&resizes[0]), "{:?} overlaps resize", txn);
            }
        }
        assert_eq!(probe(&env).violations.load(Ordering::SeqCst), 0);
    }
}

#[test]
fn test_transaction_after_resize_sees_new_size() {
    let env = setup_env(EnvFlags::empty());
    env.set_map_size(8 << 20).unwrap();

    let mut seen = 0;
    env.view(|_txn| {
        seen = probe(&env).map_size.load(Ordering::SeqCst);
        Ok(())
    })
    .unwrap();

    assert_eq!(seen, 8 << 20);
}

#[test]
fn test_delayed_resize_blocks_transactions_for_whole_window() {
    const BACKOFF: Duration = Duration::from_millis(50);
    let handlers: Vec<Arc<dyn Handler<ProbeEnv>>> =
        vec![Arc::new(MapResizedHandler::new(2, Backoff::Fixed(BACKOFF)))];
    let env = SyncEnv::new(Some(ProbeEnv::opened(EnvFlags::empty())), handlers).unwrap();
    let (tx, rx) = channel::bounded::<Instant>(1);

    let failed_at = crossbeam::thread::scope(|s| {
        let env = &env;
        s.spawn(move |_| {
            let mut calls = 0;
            env.update(|_txn| {
                calls += 1;
                if calls == 1 {
                    tx.send(Instant::now()).unwrap();
                    Err(SyncError::MapResized)
                } else {
                    Ok(())
                }
            })
            .unwrap();
        });

        let failed_at = rx.recv().unwrap();
        thread::sleep(Duration::from_millis(10));
        env.view(|_txn| Ok(())).unwrap();
        failed_at
    })
    .unwrap();

    let resizes = probe(&env).intervals_of(Kind::Resize);
    assert_eq!(resizes.len(), 1);
    assert!(resizes[0].start >= failed_at + BACKOFF);

    // The read issued during the backoff waits until the resize is done.
    let reads = probe(&env).intervals_of(Kind::Read);
    assert_eq!(reads.len(), 1);
    assert!(reads[0].start >= resizes[0].end);

    let writes = probe(&env).intervals_of(Kind::Write);
    assert_eq!(writes.len(), 2);
    assert!(writes[1].start >= resizes[0].end);
    assert_eq!(*probe(&env).resize_calls.lock(), vec![0]);
}

// =============================================================================
// Retry Tests
// =============================================================================

#[test]
fn test_map_resized_is_retried_until_success() {
    const N: usize = 4;
    let env = setup_env(EnvFlags::empty());
    let mut calls = 0;

    let result = env.update(|_txn| {
        calls += 1;
        if calls < N {
            Err(SyncError::MapResized)
        } else {
            Ok(())
        }
    });

    assert!(result.is_ok());
    assert_eq!(calls, N);
    // Each retry adopted the externally recorded size.
    assert_eq!(*probe(&env).resize_calls.lock(), vec![0; N - 1]);
}

#[test]
fn test_map_resized_gives_up_after_retry_limit() {
    let handlers: Vec<Arc<dyn Handler<ProbeEnv>>> =
        vec![Arc::new(MapResizedHandler::new(2, Backoff::None))];
    let env = SyncEnv::new(Some(ProbeEnv::opened(EnvFlags::empty())), handlers).unwrap();
    let mut calls = 0;

    let result = env.view(|_txn| {
        calls += 1;
        Err(SyncError::MapResized)
    });

    assert!(matches!(result, Err(SyncError::MapResized)));
    assert_eq!(calls, 3);
}

#[test]
fn test_retry_count_is_per_call() {
    let handlers: Vec<Arc<dyn Handler<ProbeEnv>>> =
        vec![Arc::new(MapResizedHandler::new(1, Backoff::None))];
    let env = SyncEnv::new(Some(ProbeEnv::opened(EnvFlags::empty())), handlers).unwrap();

    for _ in 0..3 {
        let mut calls = 0;
        env.update(|_txn| {
            calls += 1;
            if calls == 1 {
                Err(SyncError::MapResized)
            } else {
                Ok(())
            }
        })
        .unwrap();
        assert_eq!(calls, 2);
    }
}

#[test]
fn test_no_handlers_returns_map_resized() {
    let env = SyncEnv::new(Some(ProbeEnv::opened(EnvFlags::empty())), Vec::new()).unwrap();
    let mut calls = 0;

    let result = env.update(|_txn| {
        calls += 1;
        Err(SyncError::MapResized)
    });

    assert!(matches!(result, Err(SyncError::MapResized)));
    assert_eq!(calls, 1);
}

#[test]
fn test_custom_handler_can_retry_body_errors() {
    let retried = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&retried);
    let handlers: Vec<Arc<dyn Handler<ProbeEnv>>> = vec![Arc::new(handler_fn(
        move |bag, result: envsync::Result<()>| match result {
            Err(SyncError::Txn(_)) if counter.fetch_add(1, Ordering::SeqCst) < 2 => {
                (bag, Err(SyncError::RetryTxn))
            }
            other => (bag, other),
        },
    ))];
    let env = SyncEnv::new(Some(ProbeEnv::opened(EnvFlags::empty())), handlers).unwrap();
    let mut calls = 0;

    let result = env.update(|_txn| {
        calls += 1;
        Err(SyncError::txn("transient"))
    });

    assert!(matches!(result, Err(SyncError::Txn(_))));
    assert_eq!(calls, 3);
    assert_eq!(retried.load(Ordering::SeqCst), 3);
}

// =============================================================================
// Error Propagation Tests
// =============================================================================

#[test]
fn test_map_full_is_not_intercepted() {
    let env = setup_env(EnvFlags::empty());
    let mut calls = 0;

    let result = env.update(|_txn| {
        calls += 1;
        Err(SyncError::MapFull)
    });

    assert!(matches!(result, Err(SyncError::MapFull)));
    assert_eq!(calls, 1);
    assert!(probe(&env).resize_calls.lock().is_empty());
}

#[test]
fn test_body_error_returned_verbatim() {
    let env = setup_env(EnvFlags::empty());

    let result = env.view(|_txn| Err(SyncError::txn("boom")));

    match result {
        Err(SyncError::Txn(e)) => assert_eq!(e.to_string(), "boom"),
        other => panic!("unexpected result: {:?}", other),
    }
}

#[test]
fn test_engine_error_before_open_propagates() {
    let env: SyncEnv<ProbeEnv> = SyncEnv::new(None, default_handlers()).unwrap();

    let result = env.update(|_txn| Ok(()));

    assert!(matches!(result, Err(SyncError::NotOpen)));
}

// =============================================================================
// Transaction Form Tests
// =============================================================================

#[test]
fn test_run_txn_read_only_flag() {
    let env = setup_env(EnvFlags::empty());
    let mut readonly = Vec::new();

    env.run_txn(TxnFlags::READ_ONLY, |txn| {
        readonly.push(txn.readonly);
        Ok(())
    })
    .unwrap();
    env.run_txn(TxnFlags::empty(), |txn| {
        readonly.push(txn.readonly);
        Ok(())
    })
    .unwrap();

    assert_eq!(readonly, vec![true, false]);
}

#[test]
fn test_update_locked_is_exclusive_in_no_lock_mode() {
    let env = setup_env(EnvFlags::NO_LOCK);

    crossbeam::thread::scope(|s| {
        for i in 0..4 {
            let env = &env;
            s.spawn(move |_| {
                for _ in 0..5 {
                    let body = |_txn: &mut support::ProbeTxn| {
                        thread::sleep(Duration::from_millis(1));
                        Ok(())
                    };
                    if i % 2 == 0 {
                        env.update_locked(body).unwrap();
                    } else {
                        env.run_txn(TxnFlags::empty(), body).unwrap();
                    }
                }
            });
        }
    })
    .unwrap();

    let writes = probe(&env).intervals_of(Kind::Write);
    assert_eq!(writes.len(), 20);
    for pair in writes.windows(2) {
        assert!(!pair[0].overlaps(&pair[1]));
    }
    assert_eq!(probe(&env).violations.load(Ordering::SeqCst), 0);
}

#[test]
fn test_clones_share_admission_state() {
    let env = setup_env(EnvFlags::empty());
    let clone = env.clone();

    clone.set_flags(EnvFlags::NO_LOCK).unwrap();

    assert!(env.is_no_lock());
}
