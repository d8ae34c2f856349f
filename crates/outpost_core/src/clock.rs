//! The logical sync clock and its advisory lock registry.
//!
//! A writer reads the current tick and holds an advisory lock tagged with it
//! until its transaction ends. Readers that need "everything as of tick T"
//! call [`TickClock::wait_for_tick`], which blocks until no lock at or below
//! `T` is held.

use crate::error::{CoreError, CoreResult};
use outpost_protocol::{SyncTick, TickTock};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// How a write chooses the tick it is stamped with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickStamp {
    /// The tick that was current when the writing transaction began.
    Current,
    /// A tick chosen by the caller.
    Explicit(SyncTick),
}

#[derive(Debug)]
struct ClockState {
    current: SyncTick,
    held: BTreeMap<SyncTick, usize>,
}

/// Monotonic logical clock shared by every writer of one live store.
#[derive(Debug)]
pub struct TickClock {
    state: Mutex<ClockState>,
    released: Condvar,
}

impl TickClock {
    /// Creates a clock whose first tick is `start`.
    pub fn new(start: SyncTick) -> Self {
        Self {
            state: Mutex::new(ClockState {
                current: start,
                held: BTreeMap::new(),
            }),
            released: Condvar::new(),
        }
    }

    /// Reads the current tick without advancing it.
    pub fn current_tick(&self) -> SyncTick {
        self.state.lock().current
    }

    /// Advances the clock by one and returns the new current tick.
    pub fn next_tick(&self) -> SyncTick {
        let mut state = self.state.lock();
        state.current = state.current.next();
        state.current
    }

    /// Advances the clock by two.
    ///
    /// The returned `tick` is unique to the caller; `tock` is the new current
    /// tick.
    pub fn tick_tock(&self) -> TickTock {
        let mut state = self.state.lock();
        let tock = SyncTick::new(state.current.as_i64() + 2);
        state.current = tock;
        TickTock {
            tick: SyncTick::new(tock.as_i64() - 1),
            tock,
        }
    }

    /// Moves the clock forward to `tick`. Never moves it backwards.
    ///
    /// Returns the tick that was current before the call.
    pub fn set_current_tick(&self, tick: SyncTick) -> SyncTick {
        let mut state = self.state.lock();
        let previous = state.current;
        if tick > previous {
            state.current = tick;
        }
        previous
    }

    /// Takes an advisory lock tagged with `tick`.
    ///
    /// The lock is released when the returned guard is dropped.
    pub fn hold_advisory_lock(&self, tick: SyncTick) -> AdvisoryLock<'_> {
        let mut state = self.state.lock();
        *state.held.entry(tick).or_insert(0) += 1;
        AdvisoryLock { clock: self, tick }
    }

    /// Reads the current tick and locks it in one step, so the clock cannot
    /// move past the tick before the lock is visible to waiters.
    pub fn hold_current(&self) -> AdvisoryLock<'_> {
        let mut state = self.state.lock();
        let tick = state.current;
        *state.held.entry(tick).or_insert(0) += 1;
        AdvisoryLock { clock: self, tick }
    }

    /// Advances the clock by two and locks the tock in one step.
    pub fn hold_tick_tock(&self) -> (TickTock, AdvisoryLock<'_>) {
        let mut state = self.state.lock();
        let tock = SyncTick::new(state.current.as_i64() + 2);
        state.current = tock;
        *state.held.entry(tock).or_insert(0) += 1;
        let tick_tock = TickTock {
            tick: SyncTick::new(tock.as_i64() - 1),
            tock,
        };
        (tick_tock, AdvisoryLock { clock: self, tick: tock })
    }

    /// Ticks that currently have at least one advisory lock held.
    pub fn pending_ticks(&self) -> Vec<SyncTick> {
        self.state.lock().held.keys().copied().collect()
    }

    /// Blocks until no advisory lock at or below `tick` is held.
    pub fn wait_for_tick(&self, tick: SyncTick) {
        let mut state = self.state.lock();
        while has_lock_at_or_below(&state.held, tick) {
            self.released.wait(&mut state);
        }
    }

    /// Like [`TickClock::wait_for_tick`], giving up after `timeout`.
    pub fn wait_for_tick_timeout(&self, tick: SyncTick, timeout: Duration) -> CoreResult<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while has_lock_at_or_below(&state.held, tick) {
            if self.released.wait_until(&mut state, deadline).timed_out()
                && has_lock_at_or_below(&state.held, tick)
            {
                return Err(CoreError::TickWaitTimeout { tick });
            }
        }
        Ok(())
    }

    /// Resolves the tick a write is stamped with.
    ///
    /// `begin` is the tick current when the writing transaction began. An
    /// explicit request for [`SyncTick::INCOMING_FROM_CENTRAL`] is stored as
    /// [`SyncTick::LAST_UPDATED_ELSEWHERE`].
    pub fn stamp(&self, begin: SyncTick, stamp: TickStamp) -> SyncTick {
        match stamp {
            TickStamp::Current => begin,
            TickStamp::Explicit(t) if t == SyncTick::INCOMING_FROM_CENTRAL => {
                SyncTick::LAST_UPDATED_ELSEWHERE
            }
            TickStamp::Explicit(t) => t,
        }
    }

    fn release(&self, tick: SyncTick) {
        let mut state = self.state.lock();
        if let Some(count) = state.held.get_mut(&tick) {
            *count -= 1;
            if *count == 0 {
                state.held.remove(&tick);
            }
        }
        drop(state);
        self.released.notify_all();
    }
}

impl Default for TickClock {
    fn default() -> Self {
        Self::new(SyncTick::new(0))
    }
}

fn has_lock_at_or_below(held: &BTreeMap<SyncTick, usize>, tick: SyncTick) -> bool {
    held.range(..=tick).next().is_some()
}

/// A held advisory lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct AdvisoryLock<'a> {
    clock: &'a TickClock,
    tick: SyncTick,
}

impl AdvisoryLock<'_> {
    /// The tick this lock is tagged with.
    pub fn tick(&self) -> SyncTick {
        self.tick
    }
}

impl Drop for AdvisoryLock<'_> {
    fn drop(&mut self) {
        self.clock.release(self.tick);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn next_tick_advances() {
        let clock = TickClock::default();
        assert_eq!(clock.current_tick(), SyncTick::new(0));
        assert_eq!(clock.next_tick(), SyncTick::new(1));
        assert_eq!(clock.current_tick(), SyncTick::new(1));
    }

    #[test]
    fn tick_tock_reserves_a_unique_tick() {
        let clock = TickClock::new(SyncTick::new(10));
        let tt = clock.tick_tock();
        assert_eq!(tt.tick, SyncTick::new(11));
        assert_eq!(tt.tock, SyncTick::new(12));
        assert_eq!(clock.current_tick(), SyncTick::new(12));

        let (tt, lock) = clock.hold_tick_tock();
        assert_eq!(tt.tock, SyncTick::new(14));
        assert_eq!(clock.pending_ticks(), vec![tt.tock]);
        drop(lock);
        assert!(clock.pending_ticks().is_empty());
    }

    #[test]
    fn set_current_tick_never_goes_back() {
        let clock = TickClock::new(SyncTick::new(10));
        assert_eq!(clock.set_current_tick(SyncTick::new(20)), SyncTick::new(10));
        assert_eq!(clock.set_current_tick(SyncTick::new(5)), SyncTick::new(20));
        assert_eq!(clock.current_tick(), SyncTick::new(20));
    }

    #[test]
    fn stamp_substitutes_incoming_sentinel() {
        let clock = TickClock::default();
        let begin = SyncTick::new(7);
        assert_eq!(clock.stamp(begin, TickStamp::Current), begin);
        assert_eq!(
            clock.stamp(begin, TickStamp::Explicit(SyncTick::INCOMING_FROM_CENTRAL)),
            SyncTick::LAST_UPDATED_ELSEWHERE
        );
        assert_eq!(
            clock.stamp(begin, TickStamp::Explicit(SyncTick::new(40))),
            SyncTick::new(40)
        );
    }

    #[test]
    fn locks_are_counted_per_tick() {
        let clock = TickClock::default();
        let a = clock.hold_advisory_lock(SyncTick::new(3));
        let b = clock.hold_advisory_lock(SyncTick::new(3));
        assert_eq!(clock.pending_ticks(), vec![SyncTick::new(3)]);
        drop(a);
        assert_eq!(clock.pending_ticks(), vec![SyncTick::new(3)]);
        drop(b);
        assert!(clock.pending_ticks().is_empty());
    }

    #[test]
    fn wait_ignores_locks_above_the_tick() {
        let clock = TickClock::default();
        let _later = clock.hold_advisory_lock(SyncTick::new(9));
        clock.wait_for_tick(SyncTick::new(8));
        assert!(clock
            .wait_for_tick_timeout(SyncTick::new(9), Duration::from_millis(20))
            .is_err());
    }

    #[test]
    fn waiter_blocks_until_slow_writer_releases() {
        let clock = Arc::new(TickClock::new(SyncTick::new(5)));
        let released = Arc::new(AtomicBool::new(false));
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();

        let writer = {
            let clock = Arc::clone(&clock);
            let released = Arc::clone(&released);
            thread::spawn(move || {
                let lock = clock.hold_current();
                locked_tx.send(lock.tick()).unwrap();
                thread::sleep(Duration::from_millis(50));
                released.store(true, Ordering::SeqCst);
                drop(lock);
            })
        };

        let tick = locked_rx.recv().unwrap();
        clock.next_tick();
        clock.wait_for_tick(tick);
        assert!(released.load(Ordering::SeqCst));
        writer.join().unwrap();
    }
}
