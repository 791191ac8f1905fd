//! The split engine: grows a node that has outgrown its size budget into
//! two, promoting a separator key into its parent, with a special case
//! for the root (which must keep oid 0 across a split) and a cascading
//! walk up the tree when the parent itself now needs splitting (§4.H).
use ids::{
    set_random_serverid,
    Cid,
    Coid,
    Oid,
    Tid,
    Timestamp,
};
use storevalue::SuperValue;

use crate::{
    inner_cache::InnerNodeCache,
    node::{
        self,
        NodeExt,
        ATTR_LEFTPTR,
    },
    store::TreeStore,
    thresholds::SplitThresholds,
};
use errors::ErrorMetadata;

/// True iff `node` has grown past the point a size-driven split should
/// fire. `split_minsize` is a safety net: a node under it is left alone
/// even if a single oversized cell pushes it over the byte budget, since
/// splitting it wouldn't produce two usable halves.
pub fn needs_split(node: &SuperValue, thresholds: &SplitThresholds) -> bool {
    if node.len() < thresholds.split_minsize {
        return false;
    }
    node.len() > thresholds.split_size || node.byte_size() > thresholds.split_size_bytes
}

/// Picks the cell index to split at: the boundary closest to half the
/// node's total byte size. This is "split-at-cell" generalized to also
/// cover the even, uniform-size case (where it degenerates to splitting
/// near the middle) and the load-split case (a handful of oversized
/// cells, where a pure cell-count midpoint would leave one half far
/// larger than the other).
pub fn choose_split_index(node: &SuperValue) -> usize {
    let total = node.byte_size();
    let idx = if total == 0 {
        node.len() / 2
    } else {
        let half = total / 2;
        let mut running = 0usize;
        let mut chosen = node.len() / 2;
        for (i, cell) in node.cells().iter().enumerate() {
            running += 16 + cell.p_key.as_ref().map_or(0, |k| k.len());
            if running >= half {
                chosen = i;
                break;
            }
        }
        chosen
    };
    idx.min(node.len().saturating_sub(2))
}

/// Walks down from the root looking for the node whose chosen child (via
/// [`node::choose_child`] on `search_key`) is `target_oid`, returning that
/// node and its oid. `search_key` must fall within `target_oid`'s key
/// range (any cell in `target_oid`'s own node works).
pub async fn find_parent_real(
    store: &dyn TreeStore,
    tid: Tid,
    table_cid: Cid,
    target_oid: Oid,
    search_key: &[u8],
    ts: Timestamp,
    max_levels: usize,
) -> Result<Option<(Oid, SuperValue)>, ErrorMetadata> {
    if target_oid == node::ROOT_OID {
        return Ok(None);
    }
    let mut current_oid = node::ROOT_OID;
    for _ in 0..max_levels {
        let coid = Coid::new(table_cid, current_oid);
        let current = match store.read_supervalue(tid, coid, ts).await? {
            Some(sv) => sv,
            None => return Ok(None),
        };
        if current.is_leaf() {
            return Ok(None);
        }
        let child = node::choose_child(&current, search_key);
        if child == target_oid {
            return Ok(Some((current_oid, current)));
        }
        current_oid = child;
    }
    Ok(None)
}

/// `FindParentCache` (spec.md §4.H): walks from the root down using only
/// what's already in `store`'s cached inner-node store, terminating as
/// soon as a cached node's chosen child is `target_oid`. A miss at any
/// level -- the node was never cached, or was invalidated by a split --
/// falls back to [`find_parent_real`] entirely, which repopulates the
/// cache with the parent it finds so the next split on this branch of the
/// tree hits the cache instead.
pub async fn find_parent_cached(
    store: &dyn TreeStore,
    tid: Tid,
    table_cid: Cid,
    target_oid: Oid,
    search_key: &[u8],
    ts: Timestamp,
    max_levels: usize,
) -> Result<Option<(Oid, SuperValue)>, ErrorMetadata> {
    if target_oid == node::ROOT_OID {
        return Ok(None);
    }
    let cache = store.inner_node_cache();
    if let Some(found) = find_parent_in_cache(cache, table_cid, target_oid, search_key, max_levels) {
        return Ok(Some(found));
    }
    let found = find_parent_real(store, tid, table_cid, target_oid, search_key, ts, max_levels).await?;
    if let Some((parent_oid, ref parent)) = found {
        cache.put(table_cid, parent_oid, parent.clone());
    }
    Ok(found)
}

fn find_parent_in_cache(cache: &InnerNodeCache, table_cid: Cid, target_oid: Oid, search_key: &[u8], max_levels: usize) -> Option<(Oid, SuperValue)> {
    let mut current_oid = node::ROOT_OID;
    for _ in 0..max_levels {
        let current = cache.get(table_cid, current_oid)?;
        if current.is_leaf() {
            return None;
        }
        let child = node::choose_child(&current, search_key);
        if child == target_oid {
            return Some((current_oid, current));
        }
        current_oid = child;
    }
    None
}

/// Splits a non-root node in place: `node` (keeping its original oid)
/// retains the lower-keyed half, a freshly allocated node takes the
/// upper-keyed half, and `parent` gains or updates the separator cell
/// routing to each. For an interior node, the pivot cell's child pointer
/// is promoted to become the left half's `lastPtr` rather than surviving
/// as a cell (I-T1 would otherwise be violated: a cell's key must upper-
/// bound its own subtree, and the pivot's subtree covers keys beyond it).
pub async fn split_node(
    store: &dyn TreeStore,
    tid: Tid,
    table_cid: Cid,
    node_oid: Oid,
    mut to_split: SuperValue,
    parent_oid: Oid,
    mut parent: SuperValue,
) -> Result<(), ErrorMetadata> {
    let idx = choose_split_index(&to_split);
    let is_leaf = to_split.is_leaf();
    let old_right_ptr = to_split.right_ptr();
    let old_last_ptr = to_split.last_ptr();

    let mut new_right = if is_leaf {
        node::new_leaf()
    } else {
        node::new_inner(to_split.height())
    };

    let separator_key;
    if is_leaf {
        let tail = to_split.split_off(idx + 1);
        separator_key = to_split.cells().last().expect("split index is within bounds").p_key.clone().unwrap_or_default();
        new_right.extend(tail);
    } else {
        let mut tail = to_split.split_off(idx);
        let pivot = tail.remove(0);
        separator_key = pivot.p_key.clone().unwrap_or_default();
        to_split.set_last_ptr(pivot.value as Oid);
        new_right.extend(tail);
        new_right.set_last_ptr(old_last_ptr);
    }

    let new_right_oid = set_random_serverid(store.new_oid().await);
    new_right.set_left_ptr(node_oid);
    new_right.set_right_ptr(old_right_ptr);
    to_split.set_right_ptr(new_right_oid);

    if old_right_ptr != 0 {
        store
            .setattr(tid, Coid::new(table_cid, old_right_ptr), ATTR_LEFTPTR, new_right_oid as i64)
            .await?;
    }

    let mut retargeted = false;
    for existing in parent.cells().to_vec() {
        if existing.value as Oid == node_oid {
            parent.insert(node::leaf_cell(existing.p_key.clone().unwrap_or_default(), new_right_oid as i64));
            retargeted = true;
            break;
        }
    }
    if !retargeted {
        parent.set_last_ptr(new_right_oid);
    }
    parent.insert(node::leaf_cell(separator_key, node_oid as i64));

    store.write_supervalue(tid, Coid::new(table_cid, node_oid), to_split).await?;
    store.write_supervalue(tid, Coid::new(table_cid, new_right_oid), new_right).await?;
    store.write_supervalue(tid, Coid::new(table_cid, parent_oid), parent).await?;

    // Cache fix-up (spec.md's "repair cache entries" step): every node
    // whose stored content this split just overwrote -- `node_oid` itself,
    // its parent, and the old right sibling's retargeted `leftPtr` -- must
    // be dropped from the cache so the next traversal re-reads the
    // post-split version instead of serving the stale cached one.
    let cache = store.inner_node_cache();
    cache.invalidate(table_cid, node_oid);
    cache.invalidate(table_cid, parent_oid);
    if old_right_ptr != 0 {
        cache.invalidate(table_cid, old_right_ptr);
    }
    Ok(())
}

/// Splits the root: since the root's oid must stay `ROOT_OID` for every
/// other node and every client to keep finding the table, this allocates
/// *two* fresh nodes for the old root's content and replaces the root's
/// own contents with a new one-cell interior node one level taller.
pub async fn split_root(
    store: &dyn TreeStore,
    tid: Tid,
    table_cid: Cid,
    root: SuperValue,
    _thresholds: &SplitThresholds,
) -> Result<(), ErrorMetadata> {
    let idx = choose_split_index(&root);
    let is_leaf = root.is_leaf();
    let height = root.height();
    let old_left_ptr = root.left_ptr();
    let old_right_ptr = root.right_ptr();
    let old_last_ptr = root.last_ptr();

    let mut cells = root.cells().to_vec();
    let right_cells = cells.split_off(idx + 1);
    let mut left_cells = cells;

    let mut left = if is_leaf { node::new_leaf() } else { node::new_inner(height) };
    let mut right = if is_leaf { node::new_leaf() } else { node::new_inner(height) };

    let separator_key = if is_leaf {
        let key = left_cells.last().expect("split index is within bounds").p_key.clone().unwrap_or_default();
        left.extend(left_cells);
        right.extend(right_cells);
        key
    } else {
        let pivot = left_cells.pop().expect("split index is within bounds");
        left.extend(left_cells);
        left.set_last_ptr(pivot.value as Oid);
        right.extend(right_cells);
        right.set_last_ptr(old_last_ptr);
        pivot.p_key.clone().unwrap_or_default()
    };

    let left_oid = set_random_serverid(store.new_oid().await);
    let right_oid = set_random_serverid(store.new_oid().await);
    left.set_left_ptr(old_left_ptr);
    left.set_right_ptr(right_oid);
    right.set_left_ptr(left_oid);
    right.set_right_ptr(old_right_ptr);

    store.write_supervalue(tid, Coid::new(table_cid, left_oid), left).await?;
    store.write_supervalue(tid, Coid::new(table_cid, right_oid), right).await?;

    let mut new_root = node::new_inner(height + 1);
    new_root.insert(node::leaf_cell(separator_key, left_oid as i64));
    new_root.set_last_ptr(right_oid);
    store.write_supervalue(tid, Coid::new(table_cid, node::ROOT_OID), new_root).await?;
    // Cache fix-up: the root's content is entirely replaced; `left_oid`
    // and `right_oid` are freshly allocated so they can't already be
    // cached.
    store.inner_node_cache().invalidate(table_cid, node::ROOT_OID);
    Ok(())
}

/// The outcome of one `split_cascade` step, reported back for tests and
/// logging.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SplitOutcome {
    NotNeeded,
    Root,
    Child { parent_oid: Oid },
}

/// Splits `start_oid` if it needs it, then walks up re-checking each
/// ancestor that received a new separator cell, bounded by
/// `thresholds.max_levels` so a corrupt or cyclic tree can't loop
/// forever.
pub async fn split_cascade(
    store: &dyn TreeStore,
    tid: Tid,
    table_cid: Cid,
    start_oid: Oid,
    ts: Timestamp,
    thresholds: &SplitThresholds,
) -> Result<SplitOutcome, ErrorMetadata> {
    let mut current_oid = start_oid;
    let mut first = true;
    for _ in 0..thresholds.max_levels {
        let coid = Coid::new(table_cid, current_oid);
        let current = match store.read_supervalue(tid, coid, ts).await? {
            Some(sv) => sv,
            None => return Ok(SplitOutcome::NotNeeded),
        };
        if !needs_split(&current, thresholds) {
            return Ok(if first { SplitOutcome::NotNeeded } else { SplitOutcome::Child { parent_oid: current_oid } });
        }
        if current_oid == node::ROOT_OID {
            split_root(store, tid, table_cid, current, thresholds).await?;
            return Ok(SplitOutcome::Root);
        }
        let search_key = current.cells().first().and_then(|c| c.p_key.clone()).unwrap_or_default();
        let (parent_oid, parent) = find_parent_cached(store, tid, table_cid, current_oid, &search_key, ts, thresholds.max_levels)
            .await?
            .ok_or_else(|| ErrorMetadata::not_found("split_cascade: parent not found for non-root node"))?;
        split_node(store, tid, table_cid, current_oid, current, parent_oid, parent).await?;
        current_oid = parent_oid;
        first = false;
    }
    Ok(SplitOutcome::Child { parent_oid: current_oid })
}
