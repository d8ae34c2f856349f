//! Concurrency tests for the tick clock and live store.

use outpost_core::{LiveStore, TickClock, TickStamp};
use outpost_protocol::{RecordData, SyncTick};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn store() -> Arc<LiveStore> {
    Arc::new(LiveStore::new(Arc::new(TickClock::new(SyncTick::new(0)))))
}

fn committed_ticks(threads: usize, per_thread: usize) -> Vec<SyncTick> {
    let store = store();
    let committed = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let store = Arc::clone(&store);
            let committed = Arc::clone(&committed);
            thread::spawn(move || {
                for i in 0..per_thread {
                    store
                        .write(|tx| {
                            let tick = tx.next_tick();
                            tx.put("counters", &format!("{t}-{i}"), RecordData::new(), false, TickStamp::Current);
                            // Recorded under the writer lock, so in commit order.
                            committed.lock().push(tick);
                            Ok(())
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let ticks = committed.lock().clone();
    ticks
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn committed_ticks_strictly_increase(threads in 1usize..6, per_thread in 1usize..20) {
        let ticks = committed_ticks(threads, per_thread);
        prop_assert_eq!(ticks.len(), threads * per_thread);
        for pair in ticks.windows(2) {
            prop_assert!(pair[0] < pair[1], "{:?} then {:?}", pair[0], pair[1]);
        }
    }
}

#[test]
fn waiter_blocks_until_slow_writer_finishes() {
    let store = store();
    let finished = Arc::new(AtomicBool::new(false));
    let (began, began_rx) = std::sync::mpsc::channel();

    let writer = {
        let store = Arc::clone(&store);
        let finished = Arc::clone(&finished);
        thread::spawn(move || {
            let mut tx = store.begin();
            began.send(tx.tick()).unwrap();
            tx.put("patients", "p1", RecordData::new(), false, TickStamp::Current);
            thread::sleep(Duration::from_millis(80));
            finished.store(true, Ordering::SeqCst);
            tx.commit();
        })
    };

    let tick = began_rx.recv().unwrap();
    // The clock moves on while the writer is still using the old tick.
    store.clock().set_current_tick(SyncTick::new(tick.as_i64() + 10));
    store.clock().wait_for_tick(tick);

    assert!(finished.load(Ordering::SeqCst));
    let record = store.get("patients", "p1").unwrap();
    assert_eq!(record.updated_at_sync_tick, tick);
    writer.join().unwrap();
}

#[test]
fn rolled_back_writer_also_releases_waiters() {
    let store = store();
    let (began, began_rx) = std::sync::mpsc::channel();

    let writer = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            let mut tx = store.begin();
            began.send(tx.tick()).unwrap();
            tx.put("patients", "p1", RecordData::new(), false, TickStamp::Current);
            thread::sleep(Duration::from_millis(30));
            drop(tx);
        })
    };

    let tick = began_rx.recv().unwrap();
    store
        .clock()
        .wait_for_tick_timeout(tick, Duration::from_secs(5))
        .unwrap();
    assert!(store.get("patients", "p1").is_none());
    writer.join().unwrap();
}

#[test]
fn wait_times_out_while_writer_is_stuck() {
    let store = store();
    let tx = store.begin();
    let err = store
        .clock()
        .wait_for_tick_timeout(tx.tick(), Duration::from_millis(20))
        .unwrap_err();
    assert!(err.to_string().contains("timed out"));
    drop(tx);
    assert!(store.clock().pending_ticks().is_empty());
}
