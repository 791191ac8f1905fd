//! The cached inner-node store (§4.H "Parent lookup", §4.I "traverse ...
//! using the cached inner-node store"): a process-local, per-(table, oid)
//! cache of node contents sitting in front of every root-to-node walk.
//! [`find_parent_cached`] and [`crate::ops::descend_to_leaf`] both try a
//! walk entirely within the cache first, falling back to
//! [`crate::split::find_parent_real`] (or an equivalent uncached
//! traversal) only when the cached walk misses -- matching the split
//! engine's own "rebuild via real traversal if the cached parent oid no
//! longer points at the target" fallback. The split engine repairs the
//! cache by invalidating every node it overwrites, so a walk that misses
//! always lands on a store read rather than stale content.
use std::{
    collections::HashMap,
    sync::Arc,
};

use ids::{
    Cid,
    Oid,
};
use parking_lot::RwLock;
use storevalue::SuperValue;

/// Cheap to clone (internally reference-counted); every [`crate::TreeStore`]
/// implementation owns one and shares it across however many concurrent
/// traversals it serves.
#[derive(Clone, Default)]
pub struct InnerNodeCache {
    entries: Arc<RwLock<HashMap<(Cid, Oid), SuperValue>>>,
}

impl InnerNodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, table_cid: Cid, oid: Oid) -> Option<SuperValue> {
        self.entries.read().get(&(table_cid, oid)).cloned()
    }

    pub fn put(&self, table_cid: Cid, oid: Oid, content: SuperValue) {
        self.entries.write().insert((table_cid, oid), content);
    }

    /// Drops `oid`'s cached content. Called by the split engine whenever
    /// it overwrites a node's stored content (the split node itself, its
    /// parent, and -- for a root split -- the root), and by the write
    /// operations (`insert`/`update`/`delete`) whenever they mutate a
    /// leaf, so a later traversal re-reads the current version instead of
    /// serving what's now a stale copy.
    pub fn invalidate(&self, table_cid: Cid, oid: Oid) {
        self.entries.write().remove(&(table_cid, oid));
    }
}

#[cfg(test)]
mod tests {
    use storevalue::CellType;

    use super::*;

    #[test]
    fn put_then_get_round_trips() {
        let cache = InnerNodeCache::new();
        let sv = SuperValue::new(CellType::Composite);
        cache.put(1, 5, sv.clone());
        assert_eq!(cache.get(1, 5), Some(sv));
    }

    #[test]
    fn invalidate_clears_the_entry() {
        let cache = InnerNodeCache::new();
        cache.put(1, 5, SuperValue::new(CellType::Composite));
        cache.invalidate(1, 5);
        assert_eq!(cache.get(1, 5), None);
    }

    #[test]
    fn entries_are_scoped_per_table() {
        let cache = InnerNodeCache::new();
        cache.put(1, 5, SuperValue::new(CellType::Composite));
        assert_eq!(cache.get(2, 5), None);
    }
}
