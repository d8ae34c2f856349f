//! Logical sync clock values.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A value of the logical sync clock.
///
/// Ticks are totally ordered. The live "current tick" of a node only ever
/// increases; every synced write is stamped with the tick that was current
/// when its transaction began.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncTick(pub i64);

impl SyncTick {
    /// Cursor value meaning "nothing has been synced yet".
    pub const ORIGIN: SyncTick = SyncTick(-1);

    /// Marks a write that arrived from the central node and must not be
    /// treated as a local edit.
    ///
    /// Shares its value with [`SyncTick::ORIGIN`]: a record stamped this way
    /// is never selected by an export that starts from the origin.
    pub const INCOMING_FROM_CENTRAL: SyncTick = SyncTick(-1);

    /// Stored in place of [`SyncTick::INCOMING_FROM_CENTRAL`] when a write
    /// explicitly asks for it, so exporters can tell "never locally modified"
    /// apart from "explicitly marked as not locally modified".
    pub const LAST_UPDATED_ELSEWHERE: SyncTick = SyncTick(-999);

    /// Creates a new tick.
    #[must_use]
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw tick value.
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self.0
    }

    /// Returns the following tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns true for the reserved sentinel values.
    #[must_use]
    pub const fn is_sentinel(self) -> bool {
        self.0 == Self::INCOMING_FROM_CENTRAL.0 || self.0 == Self::LAST_UPDATED_ELSEWHERE.0
    }
}

impl Default for SyncTick {
    fn default() -> Self {
        Self::ORIGIN
    }
}

impl fmt::Display for SyncTick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tick:{}", self.0)
    }
}

impl From<i64> for SyncTick {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// The pair of ticks handed out by a central "tick-tock" advance.
///
/// The `tick` is unique to whoever requested it; the `tock` is the new
/// current tick that later central writes are stamped with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickTock {
    /// Tick reserved for the requester.
    pub tick: SyncTick,
    /// New current tick of the clock.
    pub tock: SyncTick,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_and_next() {
        let a = SyncTick::new(5);
        assert!(a < a.next());
        assert_eq!(a.next().as_i64(), 6);
        assert!(SyncTick::LAST_UPDATED_ELSEWHERE < SyncTick::ORIGIN);
    }

    #[test]
    fn sentinels() {
        assert!(SyncTick::INCOMING_FROM_CENTRAL.is_sentinel());
        assert!(SyncTick::LAST_UPDATED_ELSEWHERE.is_sentinel());
        assert!(!SyncTick::new(0).is_sentinel());
        assert_eq!(SyncTick::default(), SyncTick::ORIGIN);
    }

    #[test]
    fn display() {
        assert_eq!(SyncTick::new(42).to_string(), "tick:42");
    }
}
