//! A minimal [`TreeStore`] for this crate's own traversal/split tests:
//! one [`Looim`] per coid plus a [`PendingTxTable`], with a simplified
//! prepare/commit that skips the disk log and server-to-server fan-out
//! the full protocol needs. The real thing lives in the server crate;
//! this only has to exercise the algorithms in this crate correctly.
use std::{
    collections::HashMap,
    sync::{
        atomic::{
            AtomicU64,
            Ordering,
        },
        Arc,
    },
};

use async_trait::async_trait;
use errors::{
    ErrorCode,
    ErrorMetadata,
};
use ids::{
    Coid,
    Oid,
    Tid,
    Timestamp,
};
use looim::{
    Interval,
    Looim,
    ReadOutcome,
};
use parking_lot::Mutex as PlMutex;
use pendingtx::PendingTxTable;
use storevalue::{
    Cell,
    StoredValue,
    SuperValue,
    Value,
};

use crate::{
    inner_cache::InnerNodeCache,
    node,
    store::{
        CommitOutcome,
        Outcome,
        PrepareOutcome,
        TreeStore,
        Vote,
    },
};

pub struct TestStore {
    looims: PlMutex<HashMap<Coid, Arc<Looim>>>,
    pending: PendingTxTable,
    next_oid: AtomicU64,
    inner_node_cache: InnerNodeCache,
}

impl TestStore {
    pub fn new() -> Self {
        TestStore {
            looims: PlMutex::new(HashMap::new()),
            pending: PendingTxTable::new(),
            next_oid: AtomicU64::new(1),
            inner_node_cache: InnerNodeCache::new(),
        }
    }

    fn looim_for(&self, coid: Coid) -> Arc<Looim> {
        self.looims.lock().entry(coid).or_insert_with(|| Arc::new(Looim::new(coid))).clone()
    }

    fn read_stored(&self, coid: Coid, ts: Timestamp) -> Result<Option<StoredValue>, ErrorMetadata> {
        match self.looim_for(coid).read_coid(ts) {
            ReadOutcome::Value { value, .. } => Ok(value),
            ReadOutcome::Defer(_) => Err(ErrorMetadata::new(ErrorCode::DeferRpc, "test store does not support deferred reads")),
        }
    }

    /// Test-only convenience: drives `tid` through prepare and commit at
    /// `ts`, panicking if prepare votes no (tests that expect a conflict
    /// call `prepare`/`commit` directly instead).
    pub async fn commit_for_test(&self, tid: Tid, ts: Timestamp) -> Result<(), ErrorMetadata> {
        let prepared = self.prepare(tid, ts, true).await?;
        assert_eq!(prepared.vote, Vote::Yes, "test transaction unexpectedly conflicted");
        self.commit(tid, prepared.mincommitts.add_epsilon(), Outcome::Commit).await?;
        Ok(())
    }
}

impl Default for TestStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TreeStore for TestStore {
    fn new_tid(&self) -> Tid {
        Tid::new()
    }

    async fn new_oid(&self) -> Oid {
        self.next_oid.fetch_add(1, Ordering::Relaxed)
    }

    async fn read_value(&self, _tid: Tid, coid: Coid, ts: Timestamp) -> Result<Option<Value>, ErrorMetadata> {
        match self.read_stored(coid, ts)? {
            Some(StoredValue::Value(v)) => Ok(Some(v)),
            Some(StoredValue::SuperValue(_)) => Err(ErrorMetadata::wrong_type("expected a value, found a supervalue")),
            None => Ok(None),
        }
    }

    async fn read_supervalue(&self, _tid: Tid, coid: Coid, ts: Timestamp) -> Result<Option<SuperValue>, ErrorMetadata> {
        match self.read_stored(coid, ts)? {
            Some(StoredValue::SuperValue(sv)) => Ok(Some(sv)),
            Some(StoredValue::Value(_)) => Err(ErrorMetadata::wrong_type("expected a supervalue, found a value")),
            None if coid.oid == node::ROOT_OID => Ok(Some(node::new_leaf())),
            None => Ok(None),
        }
    }

    async fn write_value(&self, tid: Tid, coid: Coid, value: Value) -> Result<(), ErrorMetadata> {
        self.pending.get_info(tid).lock().write_value(coid, value)
    }

    async fn write_supervalue(&self, tid: Tid, coid: Coid, sv: SuperValue) -> Result<(), ErrorMetadata> {
        self.pending.get_info(tid).lock().write_supervalue(coid, sv)
    }

    async fn listadd(&self, tid: Tid, coid: Coid, cell: Cell) -> Result<(), ErrorMetadata> {
        self.pending.get_info(tid).lock().listadd(coid, cell)
    }

    async fn listdelrange(&self, tid: Tid, coid: Coid, interval: Interval) -> Result<(), ErrorMetadata> {
        self.pending.get_info(tid).lock().listdelrange(coid, interval)
    }

    async fn setattr(&self, tid: Tid, coid: Coid, idx: usize, value: i64) -> Result<(), ErrorMetadata> {
        self.pending.get_info(tid).lock().setattr(coid, idx, value)
    }

    async fn prepare(&self, tid: Tid, start_ts: Timestamp, _one_shot: bool) -> Result<PrepareOutcome, ErrorMetadata> {
        let info_arc = self.pending.get_info(tid);
        let coidinfo = info_arc.lock().coidinfo.clone();

        let propose_ts = start_ts.add_epsilon();
        let mut mincommitts = propose_ts;
        let mut installed = Vec::with_capacity(coidinfo.len());
        let mut conflicted = false;
        for (coid, delta) in &coidinfo {
            match self.looim_for(*coid).check_and_add_pending(start_ts, propose_ts, tid, delta.clone()) {
                Ok(pending) => {
                    mincommitts = mincommitts.max(pending.ts());
                    installed.push((*coid, pending));
                },
                Err(()) => {
                    conflicted = true;
                    break;
                },
            }
        }

        if conflicted {
            for (coid, pending) in &installed {
                self.looim_for(*coid).resolve_pending(pending, pending.ts(), false);
            }
            return Ok(PrepareOutcome {
                vote: Vote::No,
                mincommitts: Timestamp::MIN,
            });
        }

        let mut info = info_arc.lock();
        for (coid, pending) in installed {
            info.record_pending(coid, pending);
        }
        info.status = pendingtx::Status::VotedYes;
        Ok(PrepareOutcome {
            vote: Vote::Yes,
            mincommitts,
        })
    }

    async fn commit(&self, tid: Tid, committs: Timestamp, outcome: Outcome) -> Result<CommitOutcome, ErrorMetadata> {
        let Ok(info_arc) = self.pending.get_info_no_create(tid) else {
            return Ok(CommitOutcome { waitingts: committs });
        };
        let commit = !matches!(outcome, Outcome::Abort | Outcome::AppAbort);
        {
            let info = info_arc.lock();
            for (coid, pending) in info.pending.iter() {
                self.looim_for(*coid).resolve_pending(pending, committs, commit);
            }
        }
        self.pending.remove_info(tid);
        Ok(CommitOutcome { waitingts: committs })
    }
}
