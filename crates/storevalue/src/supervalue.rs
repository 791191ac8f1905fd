use serde::{
    Deserialize,
    Serialize,
};

use crate::{
    attrs::Attrs,
    cell::{
        Cell,
        CellType,
    },
    keyinfo::KeyInfo,
};

/// The sole representation of a B-tree node: an attribute array plus an
/// ordered list of cells. Leaves use `CellType::Composite` cells keyed by
/// `pKey`; interior nodes use `CellType::Int` cells keyed by `nKey`
/// (the separator between children). `keyinfo` is only meaningful for
/// composite cells.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuperValue {
    pub attrs: Attrs,
    pub celltype: CellType,
    cells: Vec<Cell>,
    pub keyinfo: Option<KeyInfo>,
}

impl Default for CellType {
    fn default() -> Self {
        CellType::Composite
    }
}

impl SuperValue {
    pub fn new(celltype: CellType) -> Self {
        SuperValue {
            attrs: Attrs::new(),
            celltype,
            cells: Vec::new(),
            keyinfo: matches!(celltype, CellType::Composite).then_some(KeyInfo::ByteLexicographic),
        }
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    fn keyinfo(&self) -> KeyInfo {
        self.keyinfo.unwrap_or_default()
    }

    /// Position of the first cell whose sort key is `>= key`, per the
    /// binary-search convention `partition_point` uses.
    pub fn lower_bound(&self, key: &[u8]) -> usize {
        let celltype = self.celltype;
        let keyinfo = self.keyinfo();
        self.cells
            .partition_point(|c| keyinfo.compare(&c.sort_key(celltype), key) == std::cmp::Ordering::Less)
    }

    pub fn find(&self, key: &[u8]) -> Option<&Cell> {
        let idx = self.lower_bound(key);
        let celltype = self.celltype;
        let keyinfo = self.keyinfo();
        self.cells
            .get(idx)
            .filter(|c| keyinfo.compare(&c.sort_key(celltype), key) == std::cmp::Ordering::Equal)
    }

    /// Inserts `cell` in sorted position, replacing an existing cell with
    /// the same sort key.
    pub fn insert(&mut self, cell: Cell) {
        let idx = self.lower_bound(&cell.sort_key(self.celltype));
        if let Some(existing) = self.cells.get(idx) {
            if self.keyinfo().compare(&existing.sort_key(self.celltype), &cell.sort_key(self.celltype))
                == std::cmp::Ordering::Equal
            {
                self.cells[idx] = cell;
                return;
            }
        }
        self.cells.insert(idx, cell);
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<Cell> {
        let idx = self.lower_bound(key);
        let celltype = self.celltype;
        let keyinfo = self.keyinfo();
        if self
            .cells
            .get(idx)
            .is_some_and(|c| keyinfo.compare(&c.sort_key(celltype), key) == std::cmp::Ordering::Equal)
        {
            Some(self.cells.remove(idx))
        } else {
            None
        }
    }

    /// Removes every cell with sort key in `[from, to)`, returning them in
    /// order. A `None` bound is unbounded on that side.
    pub fn remove_range(&mut self, from: Option<&[u8]>, to: Option<&[u8]>) -> Vec<Cell> {
        let start = from.map(|k| self.lower_bound(k)).unwrap_or(0);
        let end = to.map(|k| self.lower_bound(k)).unwrap_or(self.cells.len());
        self.cells.drain(start..end).collect()
    }

    /// Splits off the tail of the cell list starting at `at`, leaving
    /// `self` with the prefix. Used by the split engine for split-at-cell
    /// (and, with `at = len/2`, split-at-middle).
    pub fn split_off(&mut self, at: usize) -> Vec<Cell> {
        self.cells.split_off(at)
    }

    pub fn extend(&mut self, cells: Vec<Cell>) {
        self.cells.extend(cells);
    }

    /// Total byte size of this super-value's cells, used by the split
    /// engine's byte-budget check.
    pub fn byte_size(&self) -> usize {
        self.cells
            .iter()
            .map(|c| 16 + c.p_key.as_ref().map_or(0, |k| k.len()))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_keeps_sorted_order() {
        let mut sv = SuperValue::new(CellType::Composite);
        sv.insert(Cell::with_pkey(b"c".to_vec(), 3));
        sv.insert(Cell::with_pkey(b"a".to_vec(), 1));
        sv.insert(Cell::with_pkey(b"b".to_vec(), 2));

        let keys: Vec<_> = sv.cells().iter().map(|c| c.p_key.clone().unwrap()).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn insert_replaces_existing_key() {
        let mut sv = SuperValue::new(CellType::Composite);
        sv.insert(Cell::with_pkey(b"a".to_vec(), 1));
        sv.insert(Cell::with_pkey(b"a".to_vec(), 2));
        assert_eq!(sv.len(), 1);
        assert_eq!(sv.find(b"a").unwrap().value, 2);
    }

    #[test]
    fn remove_range_is_half_open() {
        let mut sv = SuperValue::new(CellType::Composite);
        for k in [b"a", b"b", b"c", b"d"] {
            sv.insert(Cell::with_pkey(k.to_vec(), 0));
        }
        let removed = sv.remove_range(Some(b"b"), Some(b"d"));
        assert_eq!(removed.len(), 2);
        assert_eq!(sv.len(), 2);
        assert!(sv.find(b"a").is_some());
        assert!(sv.find(b"d").is_some());
    }

    #[test]
    fn int_cells_sort_by_signed_value() {
        let mut sv = SuperValue::new(CellType::Int);
        sv.insert(Cell::with_nkey(5, 0));
        sv.insert(Cell::with_nkey(-5, 0));
        sv.insert(Cell::with_nkey(0, 0));
        let keys: Vec<_> = sv.cells().iter().map(|c| c.n_key).collect();
        assert_eq!(keys, vec![-5, 0, 5]);
    }
}
