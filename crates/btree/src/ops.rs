//! Traversal operations: descending from the root to the leaf owning a
//! key, and the insert/delete/lookup/update/scan primitives built on top
//! of it (§4.I). None of these trigger a split themselves -- that's the
//! commit-time splitter's job, driven by [`crate::split::split_cascade`]
//! once a write lands.
use ids::{
    Cid,
    Coid,
    Oid,
    Tid,
    Timestamp,
};
use looim::Interval;
use storevalue::SuperValue;

use crate::{
    node::{
        self,
        NodeExt,
    },
    store::TreeStore,
};
use errors::ErrorMetadata;

/// Descends from the table's root to the leaf that would hold `key`,
/// returning its oid and contents. Tries the walk entirely within the
/// cached inner-node store first (§4.I); a miss at any level falls back
/// to [`descend_to_leaf_real`], which re-reads from `store` and repopulates
/// the cache as it goes. Bounded by `max_levels` so a corrupt or cyclic
/// tree surfaces an error instead of hanging.
pub async fn descend_to_leaf(
    store: &dyn TreeStore,
    tid: Tid,
    table_cid: Cid,
    key: &[u8],
    ts: Timestamp,
    max_levels: usize,
) -> Result<(Oid, SuperValue), ErrorMetadata> {
    let cache = store.inner_node_cache();
    if let Some(found) = descend_to_leaf_cached(cache, table_cid, key, max_levels) {
        return Ok(found);
    }
    descend_to_leaf_real(store, cache, tid, table_cid, key, ts, max_levels).await
}

/// A pure in-memory walk using only what's already cached; `None` on the
/// first level whose content isn't cached (including "never cached" and
/// "invalidated since").
fn descend_to_leaf_cached(cache: &crate::inner_cache::InnerNodeCache, table_cid: Cid, key: &[u8], max_levels: usize) -> Option<(Oid, SuperValue)> {
    let mut oid = node::ROOT_OID;
    for _ in 0..max_levels {
        let current = cache.get(table_cid, oid)?;
        if current.is_leaf() {
            return Some((oid, current));
        }
        oid = node::choose_child(&current, key);
    }
    None
}

async fn descend_to_leaf_real(
    store: &dyn TreeStore,
    cache: &crate::inner_cache::InnerNodeCache,
    tid: Tid,
    table_cid: Cid,
    key: &[u8],
    ts: Timestamp,
    max_levels: usize,
) -> Result<(Oid, SuperValue), ErrorMetadata> {
    let mut oid = node::ROOT_OID;
    for _ in 0..max_levels {
        let coid = Coid::new(table_cid, oid);
        let current = store
            .read_supervalue(tid, coid, ts)
            .await?
            .ok_or_else(|| ErrorMetadata::not_found("btree descent hit a missing node"))?;
        cache.put(table_cid, oid, current.clone());
        if current.is_leaf() {
            return Ok((oid, current));
        }
        oid = node::choose_child(&current, key);
    }
    Err(ErrorMetadata::not_found("btree descent exceeded the configured max tree height"))
}

pub async fn lookup(
    store: &dyn TreeStore,
    tid: Tid,
    table_cid: Cid,
    key: &[u8],
    ts: Timestamp,
    max_levels: usize,
) -> Result<Option<i64>, ErrorMetadata> {
    let (_, leaf) = descend_to_leaf(store, tid, table_cid, key, ts, max_levels).await?;
    Ok(leaf.find(key).map(|c| c.value))
}

/// Inserts or overwrites `key`'s value. The leaf's cell list is upsert
/// by construction (`SuperValue::insert` replaces a matching key), so
/// insert and overwrite share one code path; [`update`] differs only in
/// requiring the key to already exist.
pub async fn insert(
    store: &dyn TreeStore,
    tid: Tid,
    table_cid: Cid,
    key: Vec<u8>,
    value: i64,
    ts: Timestamp,
    max_levels: usize,
) -> Result<Oid, ErrorMetadata> {
    let (leaf_oid, _) = descend_to_leaf(store, tid, table_cid, &key, ts, max_levels).await?;
    store.listadd(tid, Coid::new(table_cid, leaf_oid), node::leaf_cell(key, value)).await?;
    store.inner_node_cache().invalidate(table_cid, leaf_oid);
    Ok(leaf_oid)
}

/// spec.md §4.I `Update(key, mutator)`: a read-modify-write over the
/// key's current value rather than a blind overwrite, so a caller can
/// express e.g. an increment without racing its own read against another
/// transaction's write (the surrounding `tid`'s prepare still catches
/// that race the usual way -- this just gives the mutator the value it
/// was applied to). Errors if `key` does not exist; inserting a fresh
/// key is `insert`'s job.
pub async fn update<F>(
    store: &dyn TreeStore,
    tid: Tid,
    table_cid: Cid,
    key: Vec<u8>,
    mutator: F,
    ts: Timestamp,
    max_levels: usize,
) -> Result<i64, ErrorMetadata>
where
    F: Fn(i64) -> i64,
{
    let (leaf_oid, leaf) = descend_to_leaf(store, tid, table_cid, &key, ts, max_levels).await?;
    let current = leaf.find(&key).map(|c| c.value).ok_or_else(|| ErrorMetadata::not_found("update: key does not exist"))?;
    let new_value = mutator(current);
    store.listadd(tid, Coid::new(table_cid, leaf_oid), node::leaf_cell(key, new_value)).await?;
    store.inner_node_cache().invalidate(table_cid, leaf_oid);
    Ok(new_value)
}

pub async fn delete(
    store: &dyn TreeStore,
    tid: Tid,
    table_cid: Cid,
    key: Vec<u8>,
    ts: Timestamp,
    max_levels: usize,
) -> Result<(), ErrorMetadata> {
    let (leaf_oid, _) = descend_to_leaf(store, tid, table_cid, &key, ts, max_levels).await?;
    let range = Interval::closed(key.clone(), key);
    store.listdelrange(tid, Coid::new(table_cid, leaf_oid), range).await?;
    store.inner_node_cache().invalidate(table_cid, leaf_oid);
    Ok(())
}

/// spec.md §4.I `Scan(key, n, cb, fetchData)`: scans `[start_key,
/// end_key)` (an unbounded `end_key` scans to the table's last leaf) in
/// key order, following `rightPtr` sibling links across leaf boundaries,
/// invoking `cb` for up to `n` entries (`None` for unbounded). When
/// `fetch_data` is `false`, `cb` is given `None` in place of the value --
/// "scans may optionally skip fetching data, returning only keys".
pub async fn scan<F>(
    store: &dyn TreeStore,
    tid: Tid,
    table_cid: Cid,
    start_key: &[u8],
    end_key: Option<&[u8]>,
    n: Option<usize>,
    fetch_data: bool,
    ts: Timestamp,
    max_levels: usize,
    mut cb: F,
) -> Result<(), ErrorMetadata>
where
    F: FnMut(Vec<u8>, Option<i64>),
{
    let (mut leaf_oid, mut leaf) = descend_to_leaf(store, tid, table_cid, start_key, ts, max_levels).await?;
    let mut emitted = 0usize;
    loop {
        for cell in leaf.cells() {
            let k = cell.p_key.as_deref().unwrap_or(&[]);
            if k < start_key {
                continue;
            }
            if let Some(end) = end_key {
                if k >= end {
                    return Ok(());
                }
            }
            if n.is_some_and(|limit| emitted >= limit) {
                return Ok(());
            }
            cb(k.to_vec(), fetch_data.then_some(cell.value));
            emitted += 1;
        }
        let next_oid = leaf.right_ptr();
        if next_oid == 0 {
            return Ok(());
        }
        leaf_oid = next_oid;
        leaf = store
            .read_supervalue(tid, Coid::new(table_cid, leaf_oid), ts)
            .await?
            .ok_or_else(|| ErrorMetadata::not_found("btree leaf disappeared mid-scan"))?;
    }
}
