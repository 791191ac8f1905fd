//! The public, application-facing surface (spec.md §4.I): a [`Client`]
//! bound to a [`crate::cluster::Cluster`], and a [`Table`] handle for the
//! one table most callers care about, wrapping `btree::ops` with
//! transaction retry (`crate::txn::run_txn`) so a caller never has to
//! reason about tids, prepare votes, or which server owns which coid.
use std::sync::Arc;

use btree::{
    node,
    SplitThresholds,
};
use errors::ErrorMetadata;
use ids::{
    get_cid_table,
    Cid,
    Coid,
    Timestamp,
};
use storevalue::Cell;

use clientcache::ClientCache;

use crate::{
    cluster::Cluster,
    store::RpcTreeStore,
    txn::run_txn,
};

/// A connection to a cluster, holding the consistent client cache
/// (spec.md §4.G) every table handle shares.
#[derive(Clone)]
pub struct Client {
    store: Arc<RpcTreeStore>,
    max_levels: usize,
}

impl Client {
    pub fn new(cluster: Cluster) -> Self {
        Client {
            store: Arc::new(RpcTreeStore::new(cluster, ClientCache::new())),
            max_levels: SplitThresholds::default().max_levels,
        }
    }

    /// A handle to the B-tree rooted at `(dbid, tableid)`.
    pub fn table(&self, dbid: u32, tableid: u32) -> Table {
        Table {
            store: self.store.clone(),
            cid: get_cid_table(dbid, tableid),
            max_levels: self.max_levels,
        }
    }
}

/// One B-tree table. Every method drives `btree::ops` over RPC and, for
/// anything that writes, wraps the whole operation in `run_txn` so a
/// prepare conflict is retried rather than surfaced.
#[derive(Clone)]
pub struct Table {
    store: Arc<RpcTreeStore>,
    cid: Cid,
    max_levels: usize,
}

impl Table {
    /// Brings the table into existence by writing an empty leaf at its
    /// root oid. Idempotent: a second call just overwrites the root with
    /// another empty leaf, which is only safe to rely on before any data
    /// has been inserted.
    pub async fn create(&self) -> Result<(), ErrorMetadata> {
        run_txn(self.store.as_ref(), |tid, _start_ts| async move {
            self.store.write_supervalue(tid, Coid::new(self.cid, node::ROOT_OID), node::new_leaf()).await
        })
        .await
    }

    pub async fn insert(&self, key: Vec<u8>, value: i64) -> Result<(), ErrorMetadata> {
        run_txn(self.store.as_ref(), |tid, start_ts| {
            let key = key.clone();
            async move { btree::insert(self.store.as_ref(), tid, self.cid, key, value, start_ts, self.max_levels).await.map(|_| ()) }
        })
        .await
    }

    /// Read-modify-write: `mutator` is handed the key's current value and
    /// its return value is written back (spec.md §4.I `Update(key,
    /// mutator)`). Errors if `key` does not exist. `mutator` may run more
    /// than once if the surrounding transaction has to retry after a
    /// prepare conflict.
    pub async fn update<F>(&self, key: Vec<u8>, mutator: F) -> Result<i64, ErrorMetadata>
    where
        F: Fn(i64) -> i64,
    {
        run_txn(self.store.as_ref(), |tid, start_ts| {
            let key = key.clone();
            let mutator = &mutator;
            async move { btree::update(self.store.as_ref(), tid, self.cid, key, mutator, start_ts, self.max_levels).await }
        })
        .await
    }

    pub async fn delete(&self, key: Vec<u8>) -> Result<(), ErrorMetadata> {
        run_txn(self.store.as_ref(), |tid, start_ts| {
            let key = key.clone();
            async move { btree::delete(self.store.as_ref(), tid, self.cid, key, start_ts, self.max_levels).await }
        })
        .await
    }

    /// A read-only lookup: no transaction, no commit, just a descent at a
    /// fresh read timestamp (served from the client cache when `coid` is
    /// cacheable and the reserve window covers it).
    pub async fn lookup(&self, key: &[u8]) -> Result<Option<i64>, ErrorMetadata> {
        let tid = self.store.new_tid();
        let ts = Timestamp::set_new();
        btree::lookup(self.store.as_ref(), tid, self.cid, key, ts, self.max_levels).await
    }

    /// Scans `[start_key, end_key)` in key order, up to `n` entries
    /// (`None` for unbounded), skipping fetching each cell's value when
    /// `fetch_data` is `false` (spec.md §4.I `Scan(key, n, cb,
    /// fetchData)`). Reports the first cell found back to its owning
    /// server as a load-split hint (spec.md §4.I `ReportAccess`) -- a
    /// scan landing repeatedly on the same leaf is exactly the access
    /// pattern a cell-driven split should react to.
    pub async fn scan(
        &self,
        start_key: &[u8],
        end_key: Option<&[u8]>,
        n: Option<usize>,
        fetch_data: bool,
    ) -> Result<Vec<(Vec<u8>, Option<i64>)>, ErrorMetadata> {
        let tid = self.store.new_tid();
        let ts = Timestamp::set_new();
        let mut results = Vec::new();
        btree::scan(self.store.as_ref(), tid, self.cid, start_key, end_key, n, fetch_data, ts, self.max_levels, |k, v| {
            results.push((k, v))
        })
        .await?;
        if let Some((k, v)) = results.first() {
            self.store
                .report_access(Coid::new(self.cid, node::ROOT_OID), Cell::with_pkey(k.clone(), v.unwrap_or(0)))
                .await;
        }
        Ok(results)
    }
}
