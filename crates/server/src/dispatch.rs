//! The RPC handlers' actual logic (spec.md §4.F, §4.C, §4.G), expressed
//! as plain async functions over [`ServerState`] rather than directly on
//! the wire [`crate::rpc::Request`]/[`crate::rpc::Response`] types. Kept
//! separate from wire encoding so the in-process splitter
//! ([`crate::store::ServerTreeStore`]) can call the same logic the RPC
//! surface does, without a serialization round trip.
use std::sync::Arc;

use btree::{
    CommitOutcome,
    Outcome,
    PrepareOutcome,
    Vote,
};
use errors::ErrorMetadata;
use ids::{
    Coid,
    Tid,
    Timestamp,
};
use looim::{
    Interval,
    ReadOutcome,
    Ticoid,
};
use pendingtx::Status;
use storevalue::{
    Attrs,
    Cell,
    CellType,
    KeyInfo,
    StoredValue,
    SuperValue,
    Value,
};
use tracing::instrument;

use crate::{
    metrics,
    state::ServerState,
};

#[instrument(skip(state))]
pub async fn read_value(state: &ServerState, _tid: Tid, coid: Coid, ts: Timestamp) -> Result<(Option<Value>, Timestamp), ErrorMetadata> {
    Timestamp::catchup(ts);
    let mut ts = ts;
    loop {
        match state.looim(coid).read_coid(ts) {
            ReadOutcome::Value { value, read_ts } => {
                return match value {
                    None => Ok((None, read_ts)),
                    Some(StoredValue::Value(v)) => Ok((Some(v), read_ts)),
                    Some(StoredValue::SuperValue(_)) => Err(ErrorMetadata::wrong_type("expected a value, found a supervalue")),
                };
            },
            ReadOutcome::Defer(pending) => {
                pending.wait().await;
                // `resolve_pending` sets the entry's timestamp to its
                // committed `final_ts` (always `propose_ts.add_epsilon()`
                // or later, never equal) before waking waiters, so the
                // retry must fold that entry in even though it now sits
                // strictly past the original `ts` -- otherwise a reader
                // that deferred on a to-be-committed write would observe
                // a stale snapshot instead of the committed one (spec.md
                // S3: `readTsActual >= pts`).
                ts = ts.max(pending.ts());
            },
        }
    }
}

#[instrument(skip(state))]
pub async fn read_supervalue(
    state: &ServerState,
    _tid: Tid,
    coid: Coid,
    ts: Timestamp,
) -> Result<(Option<SuperValue>, Timestamp), ErrorMetadata> {
    Timestamp::catchup(ts);
    let mut ts = ts;
    loop {
        match state.looim(coid).read_coid(ts) {
            ReadOutcome::Value { value, read_ts } => {
                return match value {
                    None => Ok((None, read_ts)),
                    Some(StoredValue::SuperValue(sv)) => Ok((Some(sv), read_ts)),
                    Some(StoredValue::Value(_)) => Err(ErrorMetadata::wrong_type("expected a supervalue, found a value")),
                };
            },
            ReadOutcome::Defer(pending) => {
                pending.wait().await;
                ts = ts.max(pending.ts());
            },
        }
    }
}

pub fn write_value(state: &ServerState, tid: Tid, coid: Coid, ts: Timestamp, value: Value) -> Result<(), ErrorMetadata> {
    Timestamp::catchup(ts);
    state.pending.get_info(tid).lock().write_value(coid, value)
}

pub fn write_supervalue(
    state: &ServerState,
    tid: Tid,
    coid: Coid,
    celltype: CellType,
    attrs: Attrs,
    cells: Vec<Cell>,
    pki: Option<KeyInfo>,
) -> Result<(), ErrorMetadata> {
    let mut sv = SuperValue::new(celltype);
    sv.attrs = attrs;
    sv.keyinfo = pki.or(sv.keyinfo);
    for cell in cells {
        sv.insert(cell);
    }
    state.pending.get_info(tid).lock().write_supervalue(coid, sv)
}

/// `check_scope`/`bypass_throttle` correspond to ListAdd's flag bits
/// (spec.md §6: "bit0=check-scope, bit1=bypass-throttle"). A scope check
/// is, in this implementation, the load-split signal: an add outside the
/// node's current key span is reported to the splitter as a hot-cell
/// access (spec.md §4.I `ReportAccess`) unless throttled.
pub fn listadd(
    state: &ServerState,
    tid: Tid,
    coid: Coid,
    cell: Cell,
    check_scope: bool,
    bypass_throttle: bool,
) -> Result<(usize, usize), ErrorMetadata> {
    state.pending.get_info(tid).lock().listadd(coid, cell.clone())?;
    if check_scope && (bypass_throttle || rand::random::<u8>() < 32) {
        state.hint_access(coid, Some(cell));
    }
    // ncells/size aren't tracked precisely pre-commit (the node's actual
    // cell count depends on the commit-time merge with concurrent
    // writers); report the transaction-local delta count instead, which
    // is what a caller deciding whether to keep inserting without
    // re-reading actually needs.
    let delta_len = state
        .pending
        .get_info_no_create(tid)
        .map(|info| info.lock().coidinfo.get(&coid).map(|t| t.listadds.len()).unwrap_or(0))
        .unwrap_or(0);
    Ok((delta_len, 0))
}

pub fn listdelrange(state: &ServerState, tid: Tid, coid: Coid, range: Interval) -> Result<(), ErrorMetadata> {
    state.pending.get_info(tid).lock().listdelrange(coid, range)
}

pub fn attrset(state: &ServerState, tid: Tid, coid: Coid, attrid: usize, attrvalue: i64) -> Result<(), ErrorMetadata> {
    state.pending.get_info(tid).lock().setattr(coid, attrid, attrvalue)
}

/// spec.md §4.F `Prepare`. Conflict-check and pending-install happen
/// atomically per coid (`Looim::check_and_add_pending`), matching the
/// original's single-pass-with-rollback-on-conflict shape: a "no" vote
/// rolls back whatever pending entries this prepare already installed on
/// earlier coids. A two-pass check-then-install split was tried first
/// but is unsound -- it leaves a window between the two passes in which
/// a second, genuinely concurrent prepare for a different tid can also
/// pass the conflict scan before either transaction's write is visible
/// to the other.
#[instrument(skip(state, piggy_write))]
pub async fn prepare(
    state: &ServerState,
    tid: Tid,
    start_ts: Timestamp,
    piggy_write: Option<(Coid, Vec<u8>)>,
    one_shot: bool,
) -> Result<PrepareOutcome, ErrorMetadata> {
    Timestamp::catchup(start_ts);
    let info_arc = state.pending.get_info(tid);

    if let Some((coid, bytes)) = piggy_write {
        let mut info = info_arc.lock();
        let had_write = info.coidinfo.get(&coid).is_some_and(|t| t.write.is_some());
        info.piggyback_write(coid, Value::new(bytes));
        if had_write {
            tracing::debug!(?tid, ?coid, "write-on-prepare piggyback discarded: explicit write already present");
        }
    }

    let (coidinfo, updates_cacheable) = {
        let info = info_arc.lock();
        (info.coidinfo.clone(), info.updates_cacheable)
    };

    if updates_cacheable {
        state.cache.begin_preparing();
    }
    let mut propose_ts = if updates_cacheable {
        start_ts.max(state.cache.advance_ts().add_epsilon())
    } else {
        start_ts
    };

    for (coid, _delta) in coidinfo.iter() {
        propose_ts = propose_ts.max(state.looim(*coid).last_read());
    }

    // Each coid's conflict-check-and-install happens atomically under
    // that coid's own looim lock (`check_and_add_pending`), so a
    // concurrent prepare for a different tid that touches the same coid
    // can never slip its own pending entry in between this transaction's
    // check and install -- it either installs first (and this scan sees
    // it as a conflict) or blocks until this one has installed (and then
    // sees this one). If a later coid conflicts, the pending entries
    // already installed on earlier coids are rolled back before voting
    // no, since nothing else may hold a lock across the whole loop.
    let mut mincommitts = propose_ts;
    let mut installed: Vec<(Coid, Arc<looim::PendingEntry>)> = Vec::with_capacity(coidinfo.len());
    let mut writes: Vec<(Coid, Ticoid)> = Vec::with_capacity(coidinfo.len());
    let mut conflicted_coid = None;
    for (coid, delta) in coidinfo.iter() {
        match state.looim(*coid).check_and_add_pending(start_ts, propose_ts, tid, delta.clone()) {
            Ok(pending) => {
                mincommitts = mincommitts.max(pending.ts());
                installed.push((*coid, pending));
                writes.push((*coid, delta.clone()));
            },
            Err(()) => {
                conflicted_coid = Some(*coid);
                break;
            },
        }
    }

    if let Some(coid) = conflicted_coid {
        for (coid, pending) in &installed {
            state.looim(*coid).resolve_pending(pending, pending.ts(), false);
        }
        if updates_cacheable {
            state.cache.done_preparing(false, Timestamp::MIN);
        }
        info_arc.lock().status = Status::VotedNo;
        tracing::debug!(?tid, ?coid, "prepare conflict, voting no");
        metrics::PREPARE_NO_TOTAL.inc();
        return Ok(PrepareOutcome {
            vote: Vote::No,
            mincommitts: Timestamp::MIN,
        });
    }

    {
        let mut info = info_arc.lock();
        for (coid, pending) in installed {
            info.record_pending(coid, pending);
        }
        info.status = Status::VotedYes;
    }

    let handle = state
        .disklog
        .log_updates_and_yes_vote(tid, propose_ts, writes)
        .await
        .map_err(|e| ErrorMetadata::no_mem(format!("disk log append failed: {e}")).with_tier(errors::Tier::Fatal))?;
    state.disklog.flush().await.map_err(|e| ErrorMetadata::no_mem(format!("disk log flush failed: {e}")).with_tier(errors::Tier::Fatal))?;
    handle.wait().await;

    metrics::PREPARE_YES_TOTAL.inc();

    if one_shot {
        let committs = mincommitts.add_epsilon();
        commit(state, tid, committs, Outcome::Commit).await?;
    }

    Ok(PrepareOutcome {
        vote: Vote::Yes,
        mincommitts,
    })
}

/// spec.md §4.F `Commit`. A missing PTI is tolerated (the write-on-
/// prepare / one-phase-commit optimizations can legitimately leave
/// nothing to find here).
#[instrument(skip(state))]
pub async fn commit(state: &ServerState, tid: Tid, committs: Timestamp, outcome: Outcome) -> Result<CommitOutcome, ErrorMetadata> {
    Timestamp::catchup(committs);
    let Ok(info_arc) = state.pending.get_info_no_create(tid) else {
        return Ok(CommitOutcome { waitingts: committs });
    };

    let committed = matches!(outcome, Outcome::Commit);
    let (updates_cacheable, was_voted_yes, pending, coidinfo) = {
        let info = info_arc.lock();
        (
            info.updates_cacheable,
            info.status == Status::VotedYes,
            info.pending.clone(),
            info.coidinfo.clone(),
        )
    };

    let mut waitingts = committs;
    for (coid, sleim) in pending.iter() {
        state.looim(*coid).resolve_pending(sleim, committs, committed);
        waitingts = waitingts.max(sleim.ts());
    }

    if updates_cacheable {
        state.cache.done_preparing(committed, committs);
    }

    if committed {
        state.disklog.log_commit_async(tid, committs).await;
        metrics::COMMIT_TOTAL.inc();
        for (coid, delta) in coidinfo.iter() {
            if coid.is_tree_node() && (!delta.listadds.is_empty() || !delta.delranges.is_empty() || matches!(delta.write, Some(looim::WriteOp::SuperValue(_)))) {
                state.hint_access(*coid, None);
            }
        }
    } else {
        metrics::ABORT_TOTAL.inc();
        if was_voted_yes {
            state.disklog.log_abort_async(tid, committs).await;
        }
    }

    state.pending.remove_info(tid);
    Ok(CommitOutcome { waitingts })
}

pub fn cache_snapshot(state: &ServerState) -> crate::rpc::CachePiggyback {
    state.cache.snapshot()
}

fn wire_vote(vote: Vote) -> crate::rpc::Vote {
    match vote {
        Vote::Yes => crate::rpc::Vote::Yes,
        Vote::No => crate::rpc::Vote::No,
    }
}

fn wire_outcome(outcome: crate::rpc::Outcome) -> Outcome {
    match outcome {
        crate::rpc::Outcome::Commit => Outcome::Commit,
        crate::rpc::Outcome::Abort => Outcome::Abort,
        crate::rpc::Outcome::AppAbort => Outcome::AppAbort,
    }
}

/// The RPC surface's single entry point (spec.md §6): decodes a
/// [`crate::rpc::Request`], runs the corresponding logic above, and
/// encodes the result back into a [`crate::rpc::Response`]. Every branch
/// attaches the current cache snapshot (spec.md §4.G) except the
/// administrative RPCs, which don't touch cacheable data.
pub async fn handle(state: &ServerState, req: crate::rpc::Request) -> crate::rpc::Response {
    use crate::rpc::{
        Request,
        Response,
        Status as WStatus,
    };

    match req {
        Request::Null => Response::Null,

        Request::Write { tid, coid, ts, buf } => {
            let result = write_value(state, tid, coid, ts, Value::new(buf));
            Response::Write {
                status: WStatus::from_result(&result),
                cache: cache_snapshot(state),
            }
        },

        Request::Read { tid, coid, ts } => match read_value(state, tid, coid, ts).await {
            Ok((buf, read_ts)) => Response::Read {
                status: WStatus::Ok,
                read_ts,
                buf: buf.map(Value::into_bytes),
                cache: cache_snapshot(state),
            },
            Err(e) => Response::Read {
                status: WStatus::from_result::<()>(&Err(e)),
                read_ts: Timestamp::MIN,
                buf: None,
                cache: cache_snapshot(state),
            },
        },

        Request::FullWrite {
            tid,
            coid,
            celltype,
            attrs,
            cells,
            pki,
        } => {
            let result = write_supervalue(state, tid, coid, celltype, attrs, cells, pki);
            Response::FullWrite {
                status: WStatus::from_result(&result),
                cache: cache_snapshot(state),
            }
        },

        Request::FullRead { tid, coid, ts, cell_hint } => {
            if let Some(cell) = &cell_hint {
                state.hint_access(coid, Some(cell.clone()));
            }
            match read_supervalue(state, tid, coid, ts).await {
                Ok((sv, read_ts)) => Response::FullRead {
                    status: WStatus::Ok,
                    read_ts,
                    attrs: sv.as_ref().map(|sv| sv.attrs.clone()),
                    celltype: sv.as_ref().map(|sv| sv.celltype),
                    cells: sv.as_ref().map(|sv| sv.cells().to_vec()).unwrap_or_default(),
                    pki: sv.as_ref().and_then(|sv| sv.keyinfo),
                    cache: cache_snapshot(state),
                },
                Err(e) => Response::FullRead {
                    status: WStatus::from_result::<()>(&Err(e)),
                    read_ts: Timestamp::MIN,
                    attrs: None,
                    celltype: None,
                    cells: Vec::new(),
                    pki: None,
                    cache: cache_snapshot(state),
                },
            }
        },

        Request::ListAdd {
            tid,
            coid,
            cell,
            pki: _,
            check_scope,
            bypass_throttle,
        } => match listadd(state, tid, coid, cell, check_scope, bypass_throttle) {
            Ok((ncells, size)) => Response::ListAdd {
                status: WStatus::Ok,
                ncells,
                size,
                cache: cache_snapshot(state),
            },
            Err(e) => Response::ListAdd {
                status: WStatus::from_result::<()>(&Err(e)),
                ncells: 0,
                size: 0,
                cache: cache_snapshot(state),
            },
        },

        Request::ListDelRange { tid, coid, range, pki: _ } => {
            let result = listdelrange(state, tid, coid, range);
            Response::ListDelRange {
                status: WStatus::from_result(&result),
                cache: cache_snapshot(state),
            }
        },

        Request::AttrSet { tid, coid, attrid, attrvalue } => {
            let result = attrset(state, tid, coid, attrid, attrvalue);
            Response::AttrSet {
                status: WStatus::from_result(&result),
            }
        },

        Request::Prepare {
            tid,
            start_ts,
            piggy_write,
            one_shot,
        } => match prepare(state, tid, start_ts, piggy_write, one_shot).await {
            Ok(outcome) => Response::Prepare {
                vote: wire_vote(outcome.vote),
                mincommitts: outcome.mincommitts,
                cache: cache_snapshot(state),
            },
            Err(_) => Response::Prepare {
                vote: crate::rpc::Vote::No,
                mincommitts: Timestamp::MIN,
                cache: cache_snapshot(state),
            },
        },

        Request::Commit { tid, committs, outcome } => match commit(state, tid, committs, wire_outcome(outcome)).await {
            Ok(result) => Response::Commit {
                status: WStatus::Ok,
                waitingts: result.waitingts,
            },
            Err(e) => Response::Commit {
                status: WStatus::from_result::<()>(&Err(e)),
                waitingts: committs,
            },
        },

        Request::Shutdown { level } => {
            state.request_shutdown(level);
            Response::Shutdown { status: WStatus::Ok }
        },

        Request::StartSplitter => {
            state.set_splitter_enabled(true);
            Response::StartSplitter { status: WStatus::Ok }
        },

        Request::FlushFile { filename: _ } => {
            let result = state.disklog.flush().await;
            Response::FlushFile {
                status: WStatus::from_result(&result.map_err(|e| ErrorMetadata::no_mem(format!("flush failed: {e}")))),
            }
        },

        Request::LoadFile { filename } => {
            let result = crate::recovery::recover(&filename).await;
            let status = match result {
                Ok(records) => {
                    for (coid, ts, ticoid) in records {
                        let pending = state.looim(coid).add_pending(ts, Tid::new(), ticoid);
                        state.looim(coid).resolve_pending(&pending, ts, true);
                    }
                    WStatus::Ok
                },
                Err(e) => WStatus::from_result::<()>(&Err(ErrorMetadata::not_found(format!("failed to load {filename}: {e}")))),
            };
            Response::LoadFile { status }
        },
    }
}
