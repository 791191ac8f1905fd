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

use crate::unique::process_unique_id;

static TID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// A 128-bit transaction identifier, uniquely assigned per transaction and
/// totally ordered.
///
/// Field order matters: `(d1, d2)` compares lexicographically, so the
/// derived `Ord` is exactly the original's `Tid::cmp`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
pub struct Tid {
    d1: u64,
    d2: u64,
}

impl Tid {
    /// The distinguished zero tid. Never returned by [`Tid::new`].
    pub const ZERO: Tid = Tid { d1: 0, d2: 0 };

    /// Assigns a fresh tid: process-unique id concatenated with a
    /// per-process monotonic counter, so collisions across machines are
    /// impossible as long as `process_unique_id` doesn't collide (it's
    /// 64 bits of randomness, generated once per process).
    pub fn new() -> Self {
        let d2 = TID_COUNTER.fetch_add(1, Ordering::Relaxed);
        Tid {
            d1: process_unique_id(),
            d2,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Tid::ZERO
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.d1, self.d2)
    }
}
