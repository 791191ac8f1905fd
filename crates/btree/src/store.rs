//! The abstract interface the split engine and traversal operations run
//! against. `server` implements this directly over `looim`/`pendingtx`
//! for its internal splitter task; `client` implements it over RPCs to a
//! remote server. Keeping the algorithms in this crate generic over
//! [`TreeStore`] means they're exercised identically in both places.
use async_trait::async_trait;
use errors::ErrorMetadata;
use ids::{
    Coid,
    Oid,
    Tid,
    Timestamp,
};
use looim::Interval;
use storevalue::{
    Cell,
    SuperValue,
    Value,
};

use crate::inner_cache::InnerNodeCache;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Vote {
    Yes,
    No,
}

#[derive(Clone, Copy, Debug)]
pub struct PrepareOutcome {
    pub vote: Vote,
    pub mincommitts: Timestamp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Commit,
    Abort,
    /// Application-level abort of a transaction that never prepared; no
    /// log record is required for this path (§4.F).
    AppAbort,
}

#[derive(Clone, Copy, Debug)]
pub struct CommitOutcome {
    pub waitingts: Timestamp,
}

/// The outcome of driving one transaction through prepare+commit.
#[derive(Clone, Copy, Debug)]
pub enum CommitResult {
    Committed(Timestamp),
    /// Prepare voted no; the caller composed a transaction that
    /// conflicted with a concurrent one and must retry with a fresh tid.
    Conflict,
}

/// Everything the B-tree's split engine and traversal operations need
/// from a transactional object store: per-coid reads/writes accumulated
/// under a `Tid`, and the 2PC `prepare`/`commit` pair that durably
/// resolves them (§4.C/§4.D/§4.F).
#[async_trait]
pub trait TreeStore: Send + Sync {
    fn new_tid(&self) -> Tid;

    /// The cached inner-node store (§4.H/§4.I) this store's traversals and
    /// splits share. Every implementation owns one long enough to be worth
    /// caching in (not recreated per call), so a repeated root-to-leaf walk
    /// over the same hot nodes doesn't redo a read for each of them.
    fn inner_node_cache(&self) -> &InnerNodeCache;

    /// Allocates a fresh, server-unique oid for a newly created node.
    async fn new_oid(&self) -> Oid;

    async fn read_value(&self, tid: Tid, coid: Coid, ts: Timestamp) -> Result<Option<Value>, ErrorMetadata>;

    async fn read_supervalue(&self, tid: Tid, coid: Coid, ts: Timestamp) -> Result<Option<SuperValue>, ErrorMetadata>;

    async fn write_value(&self, tid: Tid, coid: Coid, value: Value) -> Result<(), ErrorMetadata>;

    async fn write_supervalue(&self, tid: Tid, coid: Coid, sv: SuperValue) -> Result<(), ErrorMetadata>;

    async fn listadd(&self, tid: Tid, coid: Coid, cell: Cell) -> Result<(), ErrorMetadata>;

    async fn listdelrange(&self, tid: Tid, coid: Coid, interval: Interval) -> Result<(), ErrorMetadata>;

    async fn setattr(&self, tid: Tid, coid: Coid, idx: usize, value: i64) -> Result<(), ErrorMetadata>;

    async fn prepare(&self, tid: Tid, start_ts: Timestamp, one_shot: bool) -> Result<PrepareOutcome, ErrorMetadata>;

    async fn commit(&self, tid: Tid, committs: Timestamp, outcome: Outcome) -> Result<CommitOutcome, ErrorMetadata>;
}

/// Drives `tid`'s accumulated writes through prepare (with the one-phase
/// commit optimization, since every caller in this crate only ever
/// touches objects on a single store) and commit. A no vote means the
/// transaction conflicted with a concurrent one; the caller must retry
/// from scratch with a fresh tid rather than reuse this one (a voted-no
/// tid carries no further state once prepare returns).
pub async fn commit_single_shot(store: &dyn TreeStore, tid: Tid, start_ts: Timestamp) -> Result<CommitResult, ErrorMetadata> {
    let prepared = store.prepare(tid, start_ts, true).await?;
    if prepared.vote == Vote::No {
        return Ok(CommitResult::Conflict);
    }
    let committs = prepared.mincommitts.add_epsilon();
    // One-phase commit already applied this transaction server-side
    // during `prepare`; this call is a harmless no-op there (the PTI is
    // gone) and is only load-bearing for stores that don't implement the
    // one-shot optimization.
    let commit = store.commit(tid, committs, Outcome::Commit).await?;
    Ok(CommitResult::Committed(commit.waitingts.max(committs)))
}
