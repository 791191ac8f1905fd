use serde::{
    Deserialize,
    Serialize,
};

/// Number of attribute slots a super-value carries. The original reserves
/// a small fixed-size array here rather than a general map; we keep that
/// shape since it bounds a node header's size.
pub const NUM_ATTRS: usize = 8;

/// A fixed-size array of `i64` attributes, each independently
/// present-or-absent. Used for B-tree node bookkeeping (child count,
/// subtree size, split watermark, ...) that rides alongside a
/// super-value's cell list.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attrs {
    present: u8,
    values: [i64; NUM_ATTRS],
}

impl Attrs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, idx: usize) -> Option<i64> {
        assert!(idx < NUM_ATTRS, "attribute index {idx} out of range");
        (self.present & (1 << idx) != 0).then_some(self.values[idx])
    }

    pub fn set(&mut self, idx: usize, value: i64) {
        assert!(idx < NUM_ATTRS, "attribute index {idx} out of range");
        self.present |= 1 << idx;
        self.values[idx] = value;
    }

    pub fn clear(&mut self, idx: usize) {
        assert!(idx < NUM_ATTRS, "attribute index {idx} out of range");
        self.present &= !(1 << idx);
        self.values[idx] = 0;
    }

    pub fn is_set(&self, idx: usize) -> bool {
        self.present & (1 << idx) != 0
    }

    /// Merges `other`'s set attributes onto `self`, overwriting any
    /// attribute `other` also has set. Used to fold a transaction's
    /// attribute-set list onto a base super-value.
    pub fn merge(&mut self, other: &Attrs) {
        for idx in 0..NUM_ATTRS {
            if let Some(v) = other.get(idx) {
                self.set(idx, v);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_attrs_read_as_none() {
        let attrs = Attrs::new();
        assert_eq!(attrs.get(3), None);
    }

    #[test]
    fn set_then_clear_round_trips() {
        let mut attrs = Attrs::new();
        attrs.set(2, 42);
        assert_eq!(attrs.get(2), Some(42));
        attrs.clear(2);
        assert_eq!(attrs.get(2), None);
    }

    #[test]
    fn merge_overwrites_only_set_attrs() {
        let mut base = Attrs::new();
        base.set(0, 1);
        base.set(1, 2);

        let mut patch = Attrs::new();
        patch.set(1, 99);

        base.merge(&patch);
        assert_eq!(base.get(0), Some(1));
        assert_eq!(base.get(1), Some(99));
    }
}
