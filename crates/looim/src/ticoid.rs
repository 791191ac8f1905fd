use errors::ErrorMetadata;
use serde::{
    Deserialize,
    Serialize,
};
use storevalue::{
    Attrs,
    Cell,
    CellType,
    StoredValue,
    SuperValue,
    Value,
};

use crate::interval::Interval;

/// A transaction's collected, not-yet-applied effects on one object.
/// Exactly one of `write` being `Some(WriteOp::Value(_))` and any other
/// field being non-default is a violation of the value/supervalue
/// exclusivity invariant; callers (the pending-transaction table) are
/// responsible for rejecting that combination before it reaches a ticoid.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Ticoid {
    pub write: Option<WriteOp>,
    pub listadds: Vec<Cell>,
    pub delranges: Vec<Interval>,
    pub attrsets: Attrs,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WriteOp {
    Value(Value),
    SuperValue(SuperValue),
}

impl Ticoid {
    pub fn is_empty(&self) -> bool {
        self.write.is_none() && self.listadds.is_empty() && self.delranges.is_empty() && self.attrsets == Attrs::default()
    }

    fn has_sv_ops(&self) -> bool {
        !self.listadds.is_empty() || !self.delranges.is_empty() || self.attrsets != Attrs::default()
    }

    fn is_plain_write(&self) -> bool {
        matches!(self.write, Some(WriteOp::Value(_)))
    }

    /// True iff `self` and `other` touch the same object in ways that
    /// don't commute, per the conflict rules.
    pub fn conflicts_with(&self, other: &Ticoid) -> bool {
        if self.is_plain_write() || other.is_plain_write() {
            // Two plain writes, or a plain write alongside any supervalue
            // op, always conflict.
            return self.write.is_some() || other.write.is_some() || self.has_sv_ops() || other.has_sv_ops();
        }
        if matches!(self.write, Some(WriteOp::SuperValue(_))) || matches!(other.write, Some(WriteOp::SuperValue(_))) {
            // A supervalue write conflicts with any other operation on
            // the same object, including another supervalue write.
            return true;
        }

        if attrsets_conflict(&self.attrsets, &other.attrsets) {
            return true;
        }
        if listadds_conflict(&self.listadds, &other.listadds) {
            return true;
        }
        if listadd_delrange_conflict(&self.listadds, &other.delranges) {
            return true;
        }
        if listadd_delrange_conflict(&other.listadds, &self.delranges) {
            return true;
        }
        if delranges_conflict(&self.delranges, &other.delranges) {
            return true;
        }
        false
    }
}

fn attrsets_conflict(a: &Attrs, b: &Attrs) -> bool {
    for idx in 0..storevalue::NUM_ATTRS {
        if let (Some(av), Some(bv)) = (a.get(idx), b.get(idx)) {
            if av != bv {
                return true;
            }
        }
    }
    false
}

fn listadds_conflict(a: &[Cell], b: &[Cell]) -> bool {
    for ca in a {
        for cb in b {
            if ca.p_key == cb.p_key && ca.n_key == cb.n_key {
                return true;
            }
        }
    }
    false
}

/// A cell's own shape tells us which field its key lives in: `p_key`
/// populated means `CellType::Composite`, `None` means `CellType::Int`
/// (matching how `with_pkey`/`with_nkey` construct them). Unlike
/// `SuperValue`'s methods, which read `self.celltype` because every cell
/// in one super-value shares it, a bare `&[Cell]` here carries no such
/// context, so we recover it per cell instead.
fn listadd_delrange_conflict(adds: &[Cell], ranges: &[Interval]) -> bool {
    adds.iter().any(|cell| {
        let celltype = if cell.p_key.is_some() { CellType::Composite } else { CellType::Int };
        let key = cell.sort_key(celltype);
        ranges.iter().any(|iv| iv.contains(&key))
    })
}

fn delranges_conflict(a: &[Interval], b: &[Interval]) -> bool {
    a.iter().any(|x| b.iter().any(|y| x.overlaps(y)))
}

/// Builds the post-application value of an object given its prior state
/// (`None` if never written) and one transaction's delta. Applies in the
/// order attribute-sets, list-adds (in key order), then delranges.
pub fn apply_ticoid(base: Option<&StoredValue>, delta: &Ticoid) -> Result<StoredValue, ErrorMetadata> {
    if let Some(WriteOp::Value(v)) = &delta.write {
        return Ok(StoredValue::Value(v.clone()));
    }

    let mut sv = match &delta.write {
        Some(WriteOp::SuperValue(sv)) => sv.clone(),
        Some(WriteOp::Value(_)) => unreachable!("handled above"),
        None => match base {
            Some(StoredValue::SuperValue(sv)) => sv.clone(),
            Some(StoredValue::Value(_)) if delta.has_sv_ops() => {
                return Err(ErrorMetadata::wrong_type(
                    "supervalue operation applied to an object holding a plain value",
                ));
            },
            Some(StoredValue::Value(v)) => return Ok(StoredValue::Value(v.clone())),
            None => SuperValue::default(),
        },
    };

    sv.attrs.merge(&delta.attrsets);

    let mut adds = delta.listadds.clone();
    adds.sort_by(|a, b| a.sort_key(sv.celltype).cmp(&b.sort_key(sv.celltype)));
    for cell in adds {
        sv.insert(cell);
    }

    for range in &delta.delranges {
        let lower = match &range.lower {
            crate::interval::Lower::Open(k) | crate::interval::Lower::Closed(k) => Some(k.as_slice()),
            crate::interval::Lower::Unbounded => None,
        };
        let upper = match &range.upper {
            crate::interval::Upper::Open(k) | crate::interval::Upper::Closed(k) => Some(k.as_slice()),
            crate::interval::Upper::Unbounded => None,
        };
        // `remove_range` is half-open `[from, to)`; adjust closed/open
        // endpoints so the removed span matches the interval exactly.
        let from = match &range.lower {
            crate::interval::Lower::Open(k) => Some(successor(k)),
            crate::interval::Lower::Closed(_) => lower.map(|k| k.to_vec()),
            crate::interval::Lower::Unbounded => None,
        };
        let to = match &range.upper {
            crate::interval::Upper::Open(_) => upper.map(|k| k.to_vec()),
            crate::interval::Upper::Closed(k) => Some(successor(k)),
            crate::interval::Upper::Unbounded => None,
        };
        sv.remove_range(from.as_deref(), to.as_deref());
    }

    Ok(StoredValue::SuperValue(sv))
}

/// The lexicographically smallest byte string strictly greater than `k`,
/// used to turn an open/closed endpoint into the half-open bound
/// `remove_range` expects.
fn successor(k: &[u8]) -> Vec<u8> {
    let mut v = k.to_vec();
    v.push(0);
    v
}

#[cfg(test)]
mod tests {
    use storevalue::CellType;

    use super::*;

    #[test]
    fn two_plain_writes_conflict() {
        let a = Ticoid {
            write: Some(WriteOp::Value(Value::new(b"a".to_vec()))),
            ..Default::default()
        };
        let b = Ticoid {
            write: Some(WriteOp::Value(Value::new(b"b".to_vec()))),
            ..Default::default()
        };
        assert!(a.conflicts_with(&b));
    }

    #[test]
    fn disjoint_attrsets_do_not_conflict() {
        let mut a = Ticoid::default();
        a.attrsets.set(0, 1);
        let mut b = Ticoid::default();
        b.attrsets.set(1, 2);
        assert!(!a.conflicts_with(&b));
    }

    #[test]
    fn same_attr_different_value_conflicts() {
        let mut a = Ticoid::default();
        a.attrsets.set(0, 1);
        let mut b = Ticoid::default();
        b.attrsets.set(0, 2);
        assert!(a.conflicts_with(&b));
    }

    /// Before this used `Cell::sort_key`, an int-keyed listadd's `p_key`
    /// was always `None`, so the comparison silently used `&[]` instead
    /// of the cell's actual `n_key` -- making every int-keyed listadd look
    /// like it sorts below any non-empty delrange lower bound, regardless
    /// of its real key.
    #[test]
    fn listadd_inside_delrange_conflicts_for_int_keyed_cells() {
        let a = Ticoid {
            listadds: vec![Cell::with_nkey(5, 1)],
            ..Default::default()
        };
        let lo = Cell::with_nkey(0, 0).sort_key(CellType::Int);
        let hi = Cell::with_nkey(10, 0).sort_key(CellType::Int);
        let b = Ticoid {
            delranges: vec![Interval::closed(lo, hi)],
            ..Default::default()
        };
        assert!(a.conflicts_with(&b), "n_key=5 falls inside the [0, 10] int range");
        assert!(b.conflicts_with(&a));
    }

    #[test]
    fn listadd_outside_int_delrange_does_not_conflict() {
        let a = Ticoid {
            listadds: vec![Cell::with_nkey(50, 1)],
            ..Default::default()
        };
        let lo = Cell::with_nkey(0, 0).sort_key(CellType::Int);
        let hi = Cell::with_nkey(10, 0).sort_key(CellType::Int);
        let b = Ticoid {
            delranges: vec![Interval::closed(lo, hi)],
            ..Default::default()
        };
        assert!(!a.conflicts_with(&b), "n_key=50 falls outside the [0, 10] int range");
    }

    #[test]
    fn listadd_inside_delrange_conflicts() {
        let a = Ticoid {
            listadds: vec![Cell::with_pkey(b"m".to_vec(), 1)],
            ..Default::default()
        };
        let b = Ticoid {
            delranges: vec![Interval::closed(b"a".to_vec(), b"z".to_vec())],
            ..Default::default()
        };
        assert!(a.conflicts_with(&b));
        assert!(b.conflicts_with(&a));
    }

    /// spec.md §8's nine-interval delrange boundary matrix: populate a
    /// node with `{0, 2, 4, 6, 8}` and delrange `(left=2, right=6)` under
    /// each of the nine interval types, checking the exact survivor set
    /// the table specifies.
    #[test]
    fn nine_interval_delrange_boundary_matrix() {
        fn interval_of_type(ty: u8, lo: &[u8], hi: &[u8]) -> Interval {
            let lower = match ty {
                0 | 1 | 2 => crate::interval::Lower::Open(lo.to_vec()),
                3 | 4 | 5 => crate::interval::Lower::Closed(lo.to_vec()),
                6 | 7 | 8 => crate::interval::Lower::Unbounded,
                _ => unreachable!(),
            };
            let upper = match ty {
                0 | 3 | 6 => crate::interval::Upper::Open(hi.to_vec()),
                1 | 4 | 7 => crate::interval::Upper::Closed(hi.to_vec()),
                2 | 5 | 8 => crate::interval::Upper::Unbounded,
                _ => unreachable!(),
            };
            Interval { lower, upper }
        }

        let expected_survivors: [&[u8]; 9] = [
            b"0268", // type 0: open/open      -> {0,2,6,8}
            b"028",  // type 1: open/closed     -> {0,2,8}
            b"02",   // type 2: open/+inf       -> {0,2}
            b"068",  // type 3: closed/open     -> {0,6,8}
            b"08",   // type 4: closed/closed   -> {0,8}
            b"0",    // type 5: closed/+inf     -> {0}
            b"68",   // type 6: -inf/open       -> {6,8}
            b"8",    // type 7: -inf/closed     -> {8}
            b"",     // type 8: -inf/+inf       -> {}
        ];

        for (ty, expected) in expected_survivors.iter().enumerate() {
            let mut base = SuperValue::new(CellType::Composite);
            for k in [b'0', b'2', b'4', b'6', b'8'] {
                base.insert(Cell::with_pkey(vec![k], 0));
            }
            let delta = Ticoid {
                delranges: vec![interval_of_type(ty as u8, b"2", b"6")],
                ..Default::default()
            };
            let result = apply_ticoid(Some(&StoredValue::SuperValue(base)), &delta).unwrap();
            let sv = result.as_supervalue().unwrap();
            let survivors: Vec<u8> = sv.cells().iter().map(|c| c.p_key.as_ref().unwrap()[0]).collect();
            assert_eq!(survivors, expected.to_vec(), "interval type {ty}");
        }
    }

    #[test]
    fn apply_ticoid_applies_delrange_after_listadds() {
        let mut base = SuperValue::new(CellType::Composite);
        base.insert(Cell::with_pkey(b"a".to_vec(), 1));
        let delta = Ticoid {
            listadds: vec![Cell::with_pkey(b"b".to_vec(), 2)],
            delranges: vec![Interval::closed(b"a".to_vec(), b"a".to_vec())],
            ..Default::default()
        };
        let result = apply_ticoid(Some(&StoredValue::SuperValue(base)), &delta).unwrap();
        let sv = result.as_supervalue().unwrap();
        assert!(sv.find(b"a").is_none());
        assert!(sv.find(b"b").is_some());
    }
}
