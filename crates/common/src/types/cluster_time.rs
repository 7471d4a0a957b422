use std::{
    fmt,
    sync::atomic::{
        AtomicU64,
        Ordering,
    },
};

use serde::{
    Deserialize,
    Serialize,
};

/// Cluster-wide logical time: a `(secs, inc)` pair totally ordered first by
/// seconds, then by the increment. Packs into a `u64` (`secs << 32 | inc`),
/// which is also its wire representation.
#[cfg_attr(
    any(test, feature = "testing"),
    derive(proptest_derive::Arbitrary)
)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClusterTime {
    secs: u32,
    inc: u32,
}

impl ClusterTime {
    pub const fn new(secs: u32, inc: u32) -> Self {
        Self { secs, inc }
    }

    pub fn secs(&self) -> u32 {
        self.secs
    }

    pub fn inc(&self) -> u32 {
        self.inc
    }

    pub const fn as_u64(&self) -> u64 {
        ((self.secs as u64) << 32) | self.inc as u64
    }

    pub const fn from_u64(packed: u64) -> Self {
        Self {
            secs: (packed >> 32) as u32,
            inc: packed as u32,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::from(self.as_u64())
    }
}

impl fmt::Display for ClusterTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.secs, self.inc)
    }
}

impl Serialize for ClusterTime {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.as_u64().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ClusterTime {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self::from_u64(u64::deserialize(deserializer)?))
    }
}

/// Process-wide source of cluster time. Lock-free: the latest observed time
/// lives in an `AtomicU64` in packed form, and both `tick` and `observe` are
/// single atomic operations.
pub struct LogicalClock {
    latest: AtomicU64,
}

impl LogicalClock {
    pub fn new(initial: ClusterTime) -> Self {
        Self {
            latest: AtomicU64::new(initial.as_u64()),
        }
    }

    pub fn now(&self) -> ClusterTime {
        ClusterTime::from_u64(self.latest.load(Ordering::SeqCst))
    }

    /// Advance the increment component and return the new time. Packed-u64
    /// addition carries into the seconds component on overflow, which
    /// preserves monotonicity.
    pub fn tick(&self) -> ClusterTime {
        ClusterTime::from_u64(self.latest.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Advance-to-max with a time observed from another node. Never moves
    /// the clock backwards.
    pub fn observe(&self, ts: ClusterTime) {
        self.latest.fetch_max(ts.as_u64(), Ordering::SeqCst);
    }
}
