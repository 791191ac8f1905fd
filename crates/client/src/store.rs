//! [`btree::TreeStore`] implemented over RPCs to a [`Cluster`] of storage
//! servers, folding the consistent client cache (spec.md §4.G) into every
//! read and fanning prepare/commit out across however many servers a
//! transaction actually touched. The single-server case uses the server's
//! one-phase-commit optimization (spec.md §4.F); touching more than one
//! server falls back to genuine two-phase commit, with this store acting
//! as the coordinator the way spec.md §2's data-flow table describes.
use std::{
    collections::{
        BTreeSet,
        HashMap,
    },
    sync::{
        atomic::{
            AtomicU64,
            Ordering,
        },
        Arc,
    },
};

use async_trait::async_trait;
use btree::{
    CommitOutcome,
    Outcome,
    PrepareOutcome,
    TreeStore,
    Vote,
};
use clientcache::ClientCache;
use errors::ErrorMetadata;
use ids::{
    oid_serverid,
    Coid,
    IssuerId,
    Oid,
    Tid,
    Timestamp,
};
use looim::Interval;
use parking_lot::Mutex;
use rand::Rng;
use server::rpc::{
    CachePiggyback,
    Outcome as WireOutcome,
    Request,
    Response,
    ServerId,
    Vote as WireVote,
};
use storevalue::{
    Cell,
    StoredValue,
    SuperValue,
    Valbuf,
    Value,
};

use crate::cluster::Cluster;

/// High bit of every issuerid a client allocates is left unset, so a
/// client-allocated oid's issuer never collides with a server's (which
/// sets it, per `server::store::SERVER_ISSUER_BIT`).
const CLIENT_ISSUER_MAX: u32 = u32::MAX / 2;

#[derive(Default)]
struct TxState {
    touched: BTreeSet<ServerId>,
}

/// The client-side half of the transactional object store: routes every
/// coid to the server that owns it (`oid_serverid`), accumulates which
/// servers a transaction has written to, and drives prepare/commit across
/// exactly those servers.
pub struct RpcTreeStore {
    cluster: Cluster,
    cache: ClientCache,
    issuerid: IssuerId,
    oid_counter: AtomicU64,
    txns: Mutex<HashMap<Tid, TxState>>,
}

impl RpcTreeStore {
    pub fn new(cluster: Cluster, cache: ClientCache) -> Self {
        RpcTreeStore {
            cluster,
            cache,
            issuerid: rand::rng().random_range(0..CLIENT_ISSUER_MAX),
            oid_counter: AtomicU64::new(1),
            txns: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &ClientCache {
        &self.cache
    }

    fn touch(&self, tid: Tid, coid: Coid) -> ServerId {
        let serverid = oid_serverid(coid.oid);
        self.txns.lock().entry(tid).or_default().touched.insert(serverid);
        serverid
    }

    fn take_touched(&self, tid: Tid) -> BTreeSet<ServerId> {
        self.txns.lock().remove(&tid).map(|s| s.touched).unwrap_or_default()
    }

    fn fold_cache(&self, serverid: ServerId, piggyback: CachePiggyback) {
        if !piggyback.reserve_ts.is_illegal() {
            self.cache.report(serverid, piggyback.version_no, piggyback.ts, piggyback.reserve_ts);
        }
    }

    /// spec.md §4.I `ReportAccess`: tells the server that owns `coid` that
    /// a read landed on `cell`, a load-balancing signal the server may use
    /// to trigger a cell-driven split at a hot key. Fire-and-forget: a
    /// failure here never affects correctness, only split timing.
    pub async fn report_access(&self, coid: Coid, cell: Cell) {
        let serverid = oid_serverid(coid.oid);
        let req = Request::FullRead {
            tid: Tid::new(),
            coid,
            ts: Timestamp::set_new(),
            cell_hint: Some(cell),
        };
        if let Err(err) = self.cluster.call(serverid, req).await {
            tracing::debug!(?coid, ?err, "report_access failed, ignoring");
        }
    }
}

fn unexpected(resp: &Response) -> ErrorMetadata {
    ErrorMetadata::wrong_type(format!("unexpected RPC response variant: {resp:?}"))
}

#[async_trait]
impl TreeStore for RpcTreeStore {
    fn new_tid(&self) -> Tid {
        Tid::new()
    }

    async fn new_oid(&self) -> Oid {
        let counter = (self.oid_counter.fetch_add(1, Ordering::Relaxed) & 0xffff) as u16;
        let oid = ids::new_oid(self.issuerid, counter, 0);
        ids::set_random_serverid(oid)
    }

    async fn read_value(&self, tid: Tid, coid: Coid, ts: Timestamp) -> Result<Option<Value>, ErrorMetadata> {
        let serverid = oid_serverid(coid.oid);
        if coid.is_cacheable() {
            if let Some(buf) = self.cache.lookup(serverid, coid, ts) {
                return Ok(Some(buf.value.as_value()?.clone()));
            }
        }
        match self.cluster.call(serverid, Request::Read { tid, coid, ts }).await? {
            Response::Read { status, read_ts, buf, cache } => {
                status.into_result()?;
                self.fold_cache(serverid, cache);
                let value = buf.map(Value::new);
                if coid.is_cacheable() {
                    if let Some(v) = &value {
                        self.cache.set(
                            serverid,
                            coid,
                            Arc::new(Valbuf {
                                coid,
                                value: StoredValue::Value(v.clone()),
                                commit_ts: read_ts,
                                read_ts,
                            }),
                        );
                    }
                }
                Ok(value)
            },
            other => Err(unexpected(&other)),
        }
    }

    async fn read_supervalue(&self, tid: Tid, coid: Coid, ts: Timestamp) -> Result<Option<SuperValue>, ErrorMetadata> {
        let serverid = oid_serverid(coid.oid);
        if coid.is_cacheable() {
            if let Some(buf) = self.cache.lookup(serverid, coid, ts) {
                return Ok(Some(buf.value.as_supervalue()?.clone()));
            }
        }
        match self
            .cluster
            .call(serverid, Request::FullRead { tid, coid, ts, cell_hint: None })
            .await?
        {
            Response::FullRead {
                status,
                read_ts,
                attrs,
                celltype,
                cells,
                pki,
                cache,
            } => {
                status.into_result()?;
                self.fold_cache(serverid, cache);
                let sv = match (attrs, celltype) {
                    (Some(attrs), Some(celltype)) => {
                        let mut sv = SuperValue::new(celltype);
                        sv.attrs = attrs;
                        sv.keyinfo = pki.or(sv.keyinfo);
                        sv.extend(cells);
                        Some(sv)
                    },
                    _ => None,
                };
                if coid.is_cacheable() {
                    if let Some(sv) = &sv {
                        self.cache.set(
                            serverid,
                            coid,
                            Arc::new(Valbuf {
                                coid,
                                value: StoredValue::SuperValue(sv.clone()),
                                commit_ts: read_ts,
                                read_ts,
                            }),
                        );
                    }
                }
                Ok(sv)
            },
            other => Err(unexpected(&other)),
        }
    }

    async fn write_value(&self, tid: Tid, coid: Coid, value: Value) -> Result<(), ErrorMetadata> {
        let serverid = self.touch(tid, coid);
        match self
            .cluster
            .call(
                serverid,
                Request::Write {
                    tid,
                    coid,
                    ts: Timestamp::set_new(),
                    buf: value.into_bytes(),
                },
            )
            .await?
        {
            Response::Write { status, cache } => {
                self.fold_cache(serverid, cache);
                status.into_result()
            },
            other => Err(unexpected(&other)),
        }
    }

    async fn write_supervalue(&self, tid: Tid, coid: Coid, sv: SuperValue) -> Result<(), ErrorMetadata> {
        let serverid = self.touch(tid, coid);
        let cells: Vec<Cell> = sv.cells().to_vec();
        match self
            .cluster
            .call(
                serverid,
                Request::FullWrite {
                    tid,
                    coid,
                    celltype: sv.celltype,
                    attrs: sv.attrs,
                    cells,
                    pki: sv.keyinfo,
                },
            )
            .await?
        {
            Response::FullWrite { status, cache } => {
                self.fold_cache(serverid, cache);
                status.into_result()
            },
            other => Err(unexpected(&other)),
        }
    }

    async fn listadd(&self, tid: Tid, coid: Coid, cell: Cell) -> Result<(), ErrorMetadata> {
        let serverid = self.touch(tid, coid);
        match self
            .cluster
            .call(
                serverid,
                Request::ListAdd {
                    tid,
                    coid,
                    cell,
                    pki: None,
                    check_scope: false,
                    bypass_throttle: true,
                },
            )
            .await?
        {
            Response::ListAdd { status, cache, .. } => {
                self.fold_cache(serverid, cache);
                status.into_result()
            },
            other => Err(unexpected(&other)),
        }
    }

    async fn listdelrange(&self, tid: Tid, coid: Coid, interval: Interval) -> Result<(), ErrorMetadata> {
        let serverid = self.touch(tid, coid);
        match self
            .cluster
            .call(
                serverid,
                Request::ListDelRange {
                    tid,
                    coid,
                    range: interval,
                    pki: None,
                },
            )
            .await?
        {
            Response::ListDelRange { status, cache } => {
                self.fold_cache(serverid, cache);
                status.into_result()
            },
            other => Err(unexpected(&other)),
        }
    }

    async fn setattr(&self, tid: Tid, coid: Coid, idx: usize, value: i64) -> Result<(), ErrorMetadata> {
        let serverid = self.touch(tid, coid);
        match self
            .cluster
            .call(
                serverid,
                Request::AttrSet {
                    tid,
                    coid,
                    attrid: idx,
                    attrvalue: value,
                },
            )
            .await?
        {
            Response::AttrSet { status } => status.into_result(),
            other => Err(unexpected(&other)),
        }
    }

    /// `one_shot` is accepted for trait compatibility but this store
    /// decides the actual prepare strategy from how many distinct servers
    /// `tid` touched: exactly one uses the server's one-phase-commit
    /// optimization regardless of the caller's request; more than one runs
    /// genuine 2PC with this store as coordinator.
    async fn prepare(&self, tid: Tid, start_ts: Timestamp, _one_shot: bool) -> Result<PrepareOutcome, ErrorMetadata> {
        let touched: Vec<ServerId> = self.txns.lock().get(&tid).map(|s| s.touched.iter().copied().collect()).unwrap_or_default();

        if touched.is_empty() {
            return Ok(PrepareOutcome {
                vote: Vote::Yes,
                mincommitts: start_ts,
            });
        }

        if touched.len() == 1 {
            let serverid = touched[0];
            return match self
                .cluster
                .call(
                    serverid,
                    Request::Prepare {
                        tid,
                        start_ts,
                        piggy_write: None,
                        one_shot: true,
                    },
                )
                .await?
            {
                Response::Prepare { vote, mincommitts, cache } => {
                    self.fold_cache(serverid, cache);
                    if vote == WireVote::No {
                        self.take_touched(tid);
                    }
                    Ok(PrepareOutcome {
                        vote: wire_vote(vote),
                        mincommitts,
                    })
                },
                other => Err(unexpected(&other)),
            };
        }

        let calls = touched.iter().map(|&serverid| {
            let req = Request::Prepare {
                tid,
                start_ts,
                piggy_write: None,
                one_shot: false,
            };
            async move { (serverid, self.cluster.call(serverid, req).await) }
        });
        let results = futures::future::join_all(calls).await;

        let mut yes_voters = Vec::new();
        let mut any_no = false;
        let mut max_mincommitts = start_ts;
        for (serverid, res) in results {
            match res? {
                Response::Prepare { vote, mincommitts, cache } => {
                    self.fold_cache(serverid, cache);
                    match vote {
                        WireVote::Yes => {
                            yes_voters.push(serverid);
                            max_mincommitts = max_mincommitts.max(mincommitts);
                        },
                        WireVote::No => any_no = true,
                    }
                },
                other => return Err(unexpected(&other)),
            }
        }

        if any_no {
            self.take_touched(tid);
            let abort_committs = max_mincommitts.add_epsilon();
            for serverid in yes_voters {
                let _ = self
                    .cluster
                    .call(
                        serverid,
                        Request::Commit {
                            tid,
                            committs: abort_committs,
                            outcome: WireOutcome::Abort,
                        },
                    )
                    .await;
            }
            return Ok(PrepareOutcome {
                vote: Vote::No,
                mincommitts: Timestamp::MIN,
            });
        }

        Ok(PrepareOutcome {
            vote: Vote::Yes,
            mincommitts: max_mincommitts,
        })
    }

    /// Fans `committs`/`outcome` out to every server `tid` touched. For
    /// the single-server one-phase-commit path this is a harmless no-op
    /// round trip (the server already committed during `prepare`; its PTI
    /// is gone, so `dispatch::commit` just echoes back) -- see
    /// `btree::commit_single_shot`'s doc comment.
    async fn commit(&self, tid: Tid, committs: Timestamp, outcome: Outcome) -> Result<CommitOutcome, ErrorMetadata> {
        let touched = self.take_touched(tid);
        if touched.is_empty() {
            return Ok(CommitOutcome { waitingts: committs });
        }

        let wire_outcome = wire_outcome(outcome);
        let calls = touched.iter().map(|&serverid| {
            let req = Request::Commit {
                tid,
                committs,
                outcome: wire_outcome,
            };
            async move { (serverid, self.cluster.call(serverid, req).await) }
        });
        let results = futures::future::join_all(calls).await;

        let mut waitingts = committs;
        for (_serverid, res) in results {
            match res? {
                Response::Commit { status, waitingts: w } => {
                    status.into_result()?;
                    waitingts = waitingts.max(w);
                },
                other => return Err(unexpected(&other)),
            }
        }
        Ok(CommitOutcome { waitingts })
    }
}

fn wire_vote(vote: WireVote) -> Vote {
    match vote {
        WireVote::Yes => Vote::Yes,
        WireVote::No => Vote::No,
    }
}

fn wire_outcome(outcome: Outcome) -> WireOutcome {
    match outcome {
        Outcome::Commit => WireOutcome::Commit,
        Outcome::Abort => WireOutcome::Abort,
        Outcome::AppAbort => WireOutcome::AppAbort,
    }
}
