//! The pending-transaction table (PTI): server-side bookkeeping for
//! in-flight transactions between their first RPC and their commit or
//! abort.
use std::{
    collections::BTreeMap,
    sync::Arc,
};

use errors::ErrorMetadata;
use ids::{
    Coid,
    Tid,
};
use looim::{
    Ticoid,
    WriteOp,
};
use parking_lot::{
    Mutex,
    RwLock,
};
use storevalue::Cell as SvCell;

/// Lifecycle state of a pending transaction, server-side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Active,
    VotedYes,
    VotedNo,
    ClearedAbort,
}

/// One transaction's bookkeeping: its accumulated per-coid effects (in
/// coid order, so prepare's conflict scan is deadlock-free) plus status.
pub struct TxInfo {
    pub coidinfo: BTreeMap<Coid, Ticoid>,
    pub status: Status,
    pub updates_cacheable: bool,
    /// The pending sleim prepare added to each touched coid's looim,
    /// remembered so commit can resolve it without re-scanning --
    /// mirrors the original's `ptr->value->pendingentriesSleim`.
    pub pending: BTreeMap<Coid, Arc<looim::PendingEntry>>,
}

impl TxInfo {
    fn new() -> Self {
        TxInfo {
            coidinfo: BTreeMap::new(),
            status: Status::Active,
            updates_cacheable: false,
            pending: BTreeMap::new(),
        }
    }

    /// Records the pending sleim prepare installed for `coid`, for commit
    /// to resolve later.
    pub fn record_pending(&mut self, coid: Coid, entry: Arc<looim::PendingEntry>) {
        self.pending.insert(coid, entry);
    }

    /// Accumulates a plain-value write for `coid`. A coid that already
    /// has supervalue operations recorded cannot also take a plain
    /// write, and vice versa.
    pub fn write_value(&mut self, coid: Coid, value: storevalue::Value) -> Result<(), ErrorMetadata> {
        let entry = self.lookup_insert(coid);
        if entry.has_sv_ops() {
            return Err(ErrorMetadata::wrong_type(
                "plain write conflicts with earlier supervalue operation in the same transaction",
            ));
        }
        entry.write = Some(WriteOp::Value(value));
        if coid.is_cacheable() {
            self.updates_cacheable = true;
        }
        Ok(())
    }

    pub fn write_supervalue(&mut self, coid: Coid, sv: storevalue::SuperValue) -> Result<(), ErrorMetadata> {
        let entry = self.lookup_insert(coid);
        if matches!(entry.write, Some(WriteOp::Value(_))) {
            return Err(ErrorMetadata::wrong_type(
                "supervalue write conflicts with earlier plain write in the same transaction",
            ));
        }
        entry.write = Some(WriteOp::SuperValue(sv));
        if coid.is_cacheable() {
            self.updates_cacheable = true;
        }
        Ok(())
    }

    pub fn listadd(&mut self, coid: Coid, cell: SvCell) -> Result<(), ErrorMetadata> {
        let entry = self.lookup_insert(coid);
        if matches!(entry.write, Some(WriteOp::Value(_))) {
            return Err(ErrorMetadata::wrong_type("listadd on a coid already holding a plain write"));
        }
        entry.listadds.push(cell);
        if coid.is_cacheable() {
            self.updates_cacheable = true;
        }
        Ok(())
    }

    pub fn listdelrange(&mut self, coid: Coid, range: looim::Interval) -> Result<(), ErrorMetadata> {
        let entry = self.lookup_insert(coid);
        if matches!(entry.write, Some(WriteOp::Value(_))) {
            return Err(ErrorMetadata::wrong_type("listdelrange on a coid already holding a plain write"));
        }
        entry.delranges.push(range);
        if coid.is_cacheable() {
            self.updates_cacheable = true;
        }
        Ok(())
    }

    pub fn setattr(&mut self, coid: Coid, idx: usize, value: i64) -> Result<(), ErrorMetadata> {
        let entry = self.lookup_insert(coid);
        if matches!(entry.write, Some(WriteOp::Value(_))) {
            return Err(ErrorMetadata::wrong_type("setattr on a coid already holding a plain write"));
        }
        entry.attrsets.set(idx, value);
        if coid.is_cacheable() {
            self.updates_cacheable = true;
        }
        Ok(())
    }

    /// Piggybacks a write-on-prepare value: materializes it only if the
    /// coid has no prior write recorded in this transaction. The explicit
    /// write always wins by happens-before.
    pub fn piggyback_write(&mut self, coid: Coid, value: storevalue::Value) {
        let entry = self.coidinfo.entry(coid).or_default();
        if entry.write.is_none() {
            entry.write = Some(WriteOp::Value(value));
            if coid.is_cacheable() {
                self.updates_cacheable = true;
            }
        }
    }

    fn lookup_insert(&mut self, coid: Coid) -> &mut Ticoid {
        self.coidinfo.entry(coid).or_default()
    }
}

trait TicoidExt {
    fn has_sv_ops(&self) -> bool;
}

impl TicoidExt for Ticoid {
    fn has_sv_ops(&self) -> bool {
        !self.listadds.is_empty() || !self.delranges.is_empty() || self.attrsets != Default::default()
    }
}

/// Server-wide table of in-flight transactions, keyed by `Tid`.
#[derive(Default)]
pub struct PendingTxTable {
    txs: RwLock<std::collections::HashMap<Tid, Arc<Mutex<TxInfo>>>>,
}

impl PendingTxTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the PTI for `tid`, creating it if this is the first RPC
    /// that mentions it.
    pub fn get_info(&self, tid: Tid) -> Arc<Mutex<TxInfo>> {
        if let Some(info) = self.txs.read().get(&tid) {
            return info.clone();
        }
        let mut txs = self.txs.write();
        txs.entry(tid).or_insert_with(|| Arc::new(Mutex::new(TxInfo::new()))).clone()
    }

    pub fn get_info_no_create(&self, tid: Tid) -> Result<Arc<Mutex<TxInfo>>, ErrorMetadata> {
        self.txs
            .read()
            .get(&tid)
            .cloned()
            .ok_or_else(|| ErrorMetadata::not_found(format!("no pending transaction for tid {tid}")))
    }

    pub fn remove_info(&self, tid: Tid) {
        self.txs.write().remove(&tid);
    }

    pub fn len(&self) -> usize {
        self.txs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use ids::Coid;

    use super::*;

    #[test]
    fn get_info_creates_on_first_access() {
        let table = PendingTxTable::new();
        let tid = Tid::new();
        assert!(table.get_info_no_create(tid).is_err());
        let _ = table.get_info(tid);
        assert!(table.get_info_no_create(tid).is_ok());
    }

    #[test]
    fn remove_info_clears_the_entry() {
        let table = PendingTxTable::new();
        let tid = Tid::new();
        let _ = table.get_info(tid);
        table.remove_info(tid);
        assert!(table.get_info_no_create(tid).is_err());
    }

    #[test]
    fn plain_write_after_supervalue_op_is_rejected() {
        let table = PendingTxTable::new();
        let tid = Tid::new();
        let info = table.get_info(tid);
        let coid = Coid::new(1, 1);
        {
            let mut info = info.lock();
            info.listadd(coid, SvCell::with_pkey(b"k".to_vec(), 1)).unwrap();
            assert!(info.write_value(coid, storevalue::Value::new(b"v".to_vec())).is_err());
        }
    }

    #[test]
    fn piggyback_is_discarded_when_coid_already_written() {
        let table = PendingTxTable::new();
        let tid = Tid::new();
        let info = table.get_info(tid);
        let coid = Coid::new(1, 1);
        let mut info = info.lock();
        info.write_value(coid, storevalue::Value::new(b"explicit".to_vec())).unwrap();
        info.piggyback_write(coid, storevalue::Value::new(b"piggyback".to_vec()));
        match &info.coidinfo.get(&coid).unwrap().write {
            Some(WriteOp::Value(v)) => assert_eq!(v.as_bytes(), b"explicit"),
            other => panic!("unexpected write: {other:?}"),
        }
    }
}
