use serde::{
    Deserialize,
    Serialize,
};

/// The lower bound of an [`Interval`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lower {
    Open(Vec<u8>),
    Closed(Vec<u8>),
    Unbounded,
}

/// The upper bound of an [`Interval`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Upper {
    Open(Vec<u8>),
    Closed(Vec<u8>),
    Unbounded,
}

/// A key-space interval used by delrange and list queries. The cross
/// product of three lower-bound kinds and three upper-bound kinds gives
/// the nine interval types (open/closed/unbounded on each side).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub lower: Lower,
    pub upper: Upper,
}

impl Interval {
    pub fn unbounded() -> Self {
        Interval {
            lower: Lower::Unbounded,
            upper: Upper::Unbounded,
        }
    }

    pub fn closed(lo: Vec<u8>, hi: Vec<u8>) -> Self {
        Interval {
            lower: Lower::Closed(lo),
            upper: Upper::Closed(hi),
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        let above_lower = match &self.lower {
            Lower::Open(k) => key > k.as_slice(),
            Lower::Closed(k) => key >= k.as_slice(),
            Lower::Unbounded => true,
        };
        let below_upper = match &self.upper {
            Upper::Open(k) => key < k.as_slice(),
            Upper::Closed(k) => key <= k.as_slice(),
            Upper::Unbounded => true,
        };
        above_lower && below_upper
    }

    /// Whether `self` and `other` share at least one key. Conservative at
    /// the single shared endpoint of two open bounds abutting a closed
    /// one; exact for the half-open/closed/unbounded combinations the
    /// nine interval types admit.
    pub fn overlaps(&self, other: &Interval) -> bool {
        let lower_bound_of = |lower: &Lower| -> Option<(&[u8], bool)> {
            match lower {
                Lower::Open(k) => Some((k.as_slice(), false)),
                Lower::Closed(k) => Some((k.as_slice(), true)),
                Lower::Unbounded => None,
            }
        };
        let upper_bound_of = |upper: &Upper| -> Option<(&[u8], bool)> {
            match upper {
                Upper::Open(k) => Some((k.as_slice(), false)),
                Upper::Closed(k) => Some((k.as_slice(), true)),
                Upper::Unbounded => None,
            }
        };

        // self.lower must not exceed other.upper, and vice versa.
        let self_starts_after_other_ends = match (lower_bound_of(&self.lower), upper_bound_of(&other.upper)) {
            (Some((lo, lo_closed)), Some((hi, hi_closed))) => {
                lo > hi || (lo == hi && !(lo_closed && hi_closed))
            },
            _ => false,
        };
        let other_starts_after_self_ends = match (lower_bound_of(&other.lower), upper_bound_of(&self.upper)) {
            (Some((lo, lo_closed)), Some((hi, hi_closed))) => {
                lo > hi || (lo == hi && !(lo_closed && hi_closed))
            },
            _ => false,
        };
        !self_starts_after_other_ends && !other_starts_after_self_ends
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_interval_contains_endpoints() {
        let iv = Interval::closed(b"a".to_vec(), b"c".to_vec());
        assert!(iv.contains(b"a"));
        assert!(iv.contains(b"c"));
        assert!(!iv.contains(b"d"));
    }

    #[test]
    fn open_bounds_exclude_endpoints() {
        let iv = Interval {
            lower: Lower::Open(b"a".to_vec()),
            upper: Upper::Open(b"c".to_vec()),
        };
        assert!(!iv.contains(b"a"));
        assert!(iv.contains(b"b"));
        assert!(!iv.contains(b"c"));
    }

    #[test]
    fn adjacent_open_closed_do_not_overlap_at_shared_point() {
        let left = Interval {
            lower: Lower::Unbounded,
            upper: Upper::Open(b"m".to_vec()),
        };
        let right = Interval {
            lower: Lower::Closed(b"m".to_vec()),
            upper: Upper::Unbounded,
        };
        assert!(!left.overlaps(&right));
    }

    #[test]
    fn adjacent_closed_closed_overlap_at_shared_point() {
        let left = Interval {
            lower: Lower::Unbounded,
            upper: Upper::Closed(b"m".to_vec()),
        };
        let right = Interval {
            lower: Lower::Closed(b"m".to_vec()),
            upper: Upper::Unbounded,
        };
        assert!(left.overlaps(&right));
    }

    #[test]
    fn unbounded_overlaps_everything() {
        let all = Interval::unbounded();
        let some = Interval::closed(b"x".to_vec(), b"y".to_vec());
        assert!(all.overlaps(&some));
    }
}
