//! B-tree node layout: a super-value whose attribute slots carry the node
//! header (`flags`, `height`, sibling/last-child pointers) and whose cell
//! list holds either leaf key/value pairs or interior separator/child-oid
//! pairs (§4.H).
use ids::Oid;
use storevalue::{
    Cell,
    CellType,
    SuperValue,
};

/// The root of every tree lives at this oid within its table's cid.
pub const ROOT_OID: Oid = 0;

pub const ATTR_FLAGS: usize = 0;
pub const ATTR_HEIGHT: usize = 1;
pub const ATTR_LEFTPTR: usize = 2;
pub const ATTR_RIGHTPTR: usize = 3;
pub const ATTR_LASTPTR: usize = 4;

/// Set on a node's `flags` attribute iff it is a leaf (`height == 0`).
pub const FLAG_LEAF: i64 = 1 << 0;
/// Set iff the node's cells are ordered by `nKey` rather than `pKey`.
pub const FLAG_INTKEY: i64 = 1 << 1;

/// Convenience accessors/mutators for the node-header attributes every
/// B-tree node super-value carries. Implemented as an extension trait
/// since [`SuperValue`] is a generic storage type owned by `storevalue`.
pub trait NodeExt {
    fn flags(&self) -> i64;
    fn is_leaf(&self) -> bool;
    fn is_intkey(&self) -> bool;
    fn height(&self) -> i64;
    fn left_ptr(&self) -> Oid;
    fn right_ptr(&self) -> Oid;
    fn last_ptr(&self) -> Oid;
    fn set_flags(&mut self, flags: i64);
    fn set_height(&mut self, height: i64);
    fn set_left_ptr(&mut self, oid: Oid);
    fn set_right_ptr(&mut self, oid: Oid);
    fn set_last_ptr(&mut self, oid: Oid);
}

impl NodeExt for SuperValue {
    fn flags(&self) -> i64 {
        self.attrs.get(ATTR_FLAGS).unwrap_or(0)
    }

    fn is_leaf(&self) -> bool {
        self.flags() & FLAG_LEAF != 0
    }

    fn is_intkey(&self) -> bool {
        self.flags() & FLAG_INTKEY != 0
    }

    fn height(&self) -> i64 {
        self.attrs.get(ATTR_HEIGHT).unwrap_or(0)
    }

    fn left_ptr(&self) -> Oid {
        self.attrs.get(ATTR_LEFTPTR).unwrap_or(0) as Oid
    }

    fn right_ptr(&self) -> Oid {
        self.attrs.get(ATTR_RIGHTPTR).unwrap_or(0) as Oid
    }

    fn last_ptr(&self) -> Oid {
        self.attrs.get(ATTR_LASTPTR).unwrap_or(0) as Oid
    }

    fn set_flags(&mut self, flags: i64) {
        self.attrs.set(ATTR_FLAGS, flags);
    }

    fn set_height(&mut self, height: i64) {
        self.attrs.set(ATTR_HEIGHT, height);
    }

    fn set_left_ptr(&mut self, oid: Oid) {
        self.attrs.set(ATTR_LEFTPTR, oid as i64);
    }

    fn set_right_ptr(&mut self, oid: Oid) {
        self.attrs.set(ATTR_RIGHTPTR, oid as i64);
    }

    fn set_last_ptr(&mut self, oid: Oid) {
        self.attrs.set(ATTR_LASTPTR, oid as i64);
    }
}

pub fn new_leaf() -> SuperValue {
    let mut sv = SuperValue::new(CellType::Composite);
    sv.set_flags(FLAG_LEAF);
    sv.set_height(0);
    sv
}

pub fn new_inner(height: i64) -> SuperValue {
    let mut sv = SuperValue::new(CellType::Composite);
    sv.set_flags(0);
    sv.set_height(height);
    sv
}

/// Chooses the child to descend into for `key`: the first cell whose key
/// is `>= key` (I-T1: "every key in the subtree rooted at `cells[i].value`
/// is `<= cells[i].key`"), or `lastPtr` if `key` is greater than every
/// cell's key.
pub fn choose_child(node: &SuperValue, key: &[u8]) -> Oid {
    for cell in node.cells() {
        if key <= cell.p_key.as_deref().unwrap_or(&[]) {
            return cell.value as Oid;
        }
    }
    node.last_ptr()
}

/// The lexicographically smallest byte string strictly greater than `k`.
pub fn successor(k: &[u8]) -> Vec<u8> {
    let mut v = k.to_vec();
    v.push(0);
    v
}

pub fn leaf_cell(key: Vec<u8>, value: i64) -> Cell {
    Cell::with_pkey(key, value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn choose_child_picks_first_cell_geq_key() {
        let mut node = new_inner(1);
        node.insert(leaf_cell(b"m".to_vec(), 10));
        node.insert(leaf_cell(b"z".to_vec(), 20));
        node.set_last_ptr(30);

        assert_eq!(choose_child(&node, b"a"), 10);
        assert_eq!(choose_child(&node, b"m"), 10);
        assert_eq!(choose_child(&node, b"n"), 20);
        assert_eq!(choose_child(&node, b"zz"), 30);
    }

    #[test]
    fn leaf_flag_roundtrips() {
        let leaf = new_leaf();
        assert!(leaf.is_leaf());
        let inner = new_inner(1);
        assert!(!inner.is_leaf());
        assert_eq!(inner.height(), 1);
    }
}
