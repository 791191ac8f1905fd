//! [`btree::TreeStore`] implemented directly over this server's own
//! [`ServerState`], used by the splitter task (`crate::splitter`) to run
//! the split engine in-process rather than over RPC. Goes through the
//! same `dispatch` functions the RPC surface calls, so a split commits
//! exactly like any client-originated transaction would.
use std::sync::Arc;

use async_trait::async_trait;
use errors::ErrorMetadata;
use ids::{
    new_oid,
    set_random_serverid,
    Coid,
    Oid,
    Tid,
    Timestamp,
};
use looim::Interval;
use storevalue::{
    Cell,
    KeyInfo,
    SuperValue,
    Value,
};

use crate::{
    dispatch,
    state::ServerState,
};

/// High bit set on every issuerid this server allocates itself, so a
/// split-allocated oid's issuer is distinguishable from a client's (which
/// never sets it -- `client::oid_alloc` keeps its issuerid under
/// `u32::MAX / 2`).
const SERVER_ISSUER_BIT: u32 = 1 << 31;

pub struct ServerTreeStore(pub Arc<ServerState>);

#[async_trait]
impl btree::TreeStore for ServerTreeStore {
    fn new_tid(&self) -> Tid {
        Tid::new()
    }

    async fn new_oid(&self) -> Oid {
        let issuerid = SERVER_ISSUER_BIT | self.0.serverid as u32;
        let oid = new_oid(issuerid, self.0.next_oid_counter(), self.0.serverid);
        set_random_serverid(oid)
    }

    async fn read_value(&self, tid: Tid, coid: Coid, ts: Timestamp) -> Result<Option<Value>, ErrorMetadata> {
        dispatch::read_value(&self.0, tid, coid, ts).await.map(|(v, _)| v)
    }

    async fn read_supervalue(&self, tid: Tid, coid: Coid, ts: Timestamp) -> Result<Option<SuperValue>, ErrorMetadata> {
        dispatch::read_supervalue(&self.0, tid, coid, ts).await.map(|(v, _)| v)
    }

    async fn write_value(&self, tid: Tid, coid: Coid, value: Value) -> Result<(), ErrorMetadata> {
        dispatch::write_value(&self.0, tid, coid, Timestamp::set_new(), value)
    }

    async fn write_supervalue(&self, tid: Tid, coid: Coid, sv: SuperValue) -> Result<(), ErrorMetadata> {
        let cells: Vec<Cell> = sv.cells().to_vec();
        let pki: Option<KeyInfo> = sv.keyinfo;
        dispatch::write_supervalue(&self.0, tid, coid, sv.celltype, sv.attrs, cells, pki)
    }

    async fn listadd(&self, tid: Tid, coid: Coid, cell: Cell) -> Result<(), ErrorMetadata> {
        dispatch::listadd(&self.0, tid, coid, cell, false, true).map(|_| ())
    }

    async fn listdelrange(&self, tid: Tid, coid: Coid, interval: Interval) -> Result<(), ErrorMetadata> {
        dispatch::listdelrange(&self.0, tid, coid, interval)
    }

    async fn setattr(&self, tid: Tid, coid: Coid, idx: usize, value: i64) -> Result<(), ErrorMetadata> {
        dispatch::attrset(&self.0, tid, coid, idx, value)
    }

    async fn prepare(&self, tid: Tid, start_ts: Timestamp, one_shot: bool) -> Result<btree::PrepareOutcome, ErrorMetadata> {
        dispatch::prepare(&self.0, tid, start_ts, None, one_shot).await
    }

    async fn commit(&self, tid: Tid, committs: Timestamp, outcome: btree::Outcome) -> Result<btree::CommitOutcome, ErrorMetadata> {
        dispatch::commit(&self.0, tid, committs, outcome).await
    }
}
