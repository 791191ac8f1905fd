use std::{
    cell::RefCell,
    fmt,
    time::{
        SystemTime,
        UNIX_EPOCH,
    },
};

use serde::{
    Deserialize,
    Serialize,
};

use crate::unique::process_unique_id;

const CLOCK_MASK: u64 = (1 << 48) - 1;
/// Arbitrary fixed tag occupying the high 16 bits of the first word. Not
/// load-bearing for correctness; present so the two halves of a
/// `Timestamp` are never confused with an unrelated `u64` pair.
const MAGIC: u64 = 0x7A51;

/// A 128-bit, roughly-monotonic, globally unique timestamp.
///
/// Layout: `hi = [magic:16][localclock:48]`, `lo = [count:16][uniqueid:48]`.
/// Ordering is lexicographic on `(hi, lo)`, i.e. derived `Ord` on the two
/// fields in this declaration order.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
pub struct Timestamp {
    hi: u64,
    lo: u64,
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({:016x}:{:016x})", self.hi, self.lo)
    }
}

thread_local! {
    static CLOCK: RefCell<ClockState> = RefCell::new(ClockState::new());
}

struct ClockState {
    /// Skew (in microseconds, signed) applied to the wall clock so that
    /// `catchup` can push future timestamps strictly past some value.
    advance: i64,
    last_local_clock: u64,
    count: u16,
    /// Number of times `count` has wrapped around within the same
    /// microsecond. Kept only for diagnostics, matching the original's
    /// `countoverflow`.
    countoverflow: u32,
}

impl ClockState {
    fn new() -> Self {
        ClockState {
            advance: 0,
            last_local_clock: 0,
            count: 0,
            countoverflow: 0,
        }
    }
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_micros() as u64
        & CLOCK_MASK
}

impl Timestamp {
    /// The arithmetic minimum, also the distinguished "illegal" timestamp.
    pub const MIN: Timestamp = Timestamp { hi: 0, lo: 0 };
    pub const MAX: Timestamp = Timestamp {
        hi: u64::MAX,
        lo: u64::MAX,
    };

    pub fn is_illegal(&self) -> bool {
        *self == Timestamp::MIN
    }

    /// Returns a timestamp strictly greater than any previously issued on
    /// this thread, and strictly greater than the horizon set by the most
    /// recent [`Timestamp::catchup`] call on this thread.
    pub fn set_new() -> Timestamp {
        CLOCK.with(|cell| {
            let mut clock = cell.borrow_mut();
            let wall = now_micros();
            let skewed = (wall as i64).wrapping_add(clock.advance) as u64 & CLOCK_MASK;
            let localclock = skewed.max(clock.last_local_clock);
            let count = if localclock == clock.last_local_clock {
                let (next, overflowed) = clock.count.overflowing_add(1);
                if overflowed {
                    clock.countoverflow += 1;
                }
                next
            } else {
                0
            };
            clock.last_local_clock = localclock;
            clock.count = count;
            Timestamp {
                hi: (MAGIC << 48) | localclock,
                lo: ((count as u64) << 48) | (process_unique_id().rotate_left(16) & CLOCK_MASK),
            }
        })
    }

    /// Advances this thread's clock skew so that subsequently issued
    /// timestamps (via [`Timestamp::set_new`]) are strictly greater than
    /// `ts`.
    pub fn catchup(ts: Timestamp) {
        CLOCK.with(|cell| {
            let mut clock = cell.borrow_mut();
            let ts_localclock = ts.hi & CLOCK_MASK;
            let wall = now_micros();
            let current_skewed = (wall as i64).wrapping_add(clock.advance) as u64 & CLOCK_MASK;
            if ts_localclock >= current_skewed {
                clock.advance = ts_localclock as i64 - wall as i64;
            }
            if ts_localclock >= clock.last_local_clock {
                clock.last_local_clock = ts_localclock;
                clock.count = (ts.lo >> 48) as u16;
            }
        });
    }

    /// The smallest timestamp strictly greater than `self`.
    pub fn add_epsilon(&self) -> Timestamp {
        let (lo, carry) = self.lo.overflowing_add(1);
        let hi = if carry { self.hi.wrapping_add(1) } else { self.hi };
        Timestamp { hi, lo }
    }

    pub fn pred(&self) -> Timestamp {
        let (lo, borrow) = self.lo.overflowing_sub(1);
        let hi = if borrow { self.hi.wrapping_sub(1) } else { self.hi };
        Timestamp { hi, lo }
    }

    /// `self`'s local-clock component advanced by `micros`, wrapping
    /// within the 48-bit clock field. Used to project a reserve horizon
    /// (`ts + CACHE_RESERVE_TIME`) ahead of a timestamp without taking a
    /// fresh reading of the wall clock.
    pub fn advance_by_micros(&self, micros: u64) -> Timestamp {
        let localclock = (self.hi & CLOCK_MASK).wrapping_add(micros) & CLOCK_MASK;
        Timestamp {
            hi: (MAGIC << 48) | localclock,
            lo: self.lo,
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}.{:016x}", self.hi, self.lo)
    }
}
