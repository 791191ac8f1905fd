//! The storage server's in-process state: per-coid logs, the pending-
//! transaction table, the disk log, the server-side cache-reserve
//! bookkeeping (spec.md §4.G), and the channel that feeds the splitter
//! task.
use std::{
    collections::HashMap,
    sync::{
        atomic::{
            AtomicBool,
            AtomicI64,
            AtomicU64,
            Ordering,
        },
        Arc,
    },
};

use disklog::DiskLog;
use ids::{
    Coid,
    Timestamp,
};
use looim::Looim;
use parking_lot::{
    Mutex as PlMutex,
    RwLock,
};
use pendingtx::PendingTxTable;
use storevalue::Cell;
use tokio::sync::Notify;

use crate::rpc::{
    CachePiggyback,
    ServerId,
    ShutdownLevel,
};

/// How far `advance_ts` is projected ahead of a cacheable commit's
/// timestamp, per `original_source/include/ccache.h`'s `CACHE_RESERVE_TIME`
/// literal (1543ms), overridable via `YESQUEL_CACHE_RESERVE_MS`.
pub const CACHE_RESERVE_MS_DEFAULT: u64 = 1543;

/// Server-side half of the consistent-cache protocol (spec.md §4.G): a
/// monotone version number bumped on every committed write to cacheable
/// data, and the reserve horizon `advance_ts` the server promises not to
/// violate. `preparing` tracks in-flight prepares touching cacheable
/// coids; `advance_ts` is only ever advanced while it's zero.
pub struct CacheState {
    version_no: AtomicU64,
    version_ts: PlMutex<Timestamp>,
    advance_ts: PlMutex<Timestamp>,
    preparing: AtomicI64,
    reserve_micros: u64,
}

impl CacheState {
    fn new(reserve_micros: u64) -> Self {
        CacheState {
            version_no: AtomicU64::new(1),
            version_ts: PlMutex::new(Timestamp::MIN),
            advance_ts: PlMutex::new(Timestamp::MIN),
            preparing: AtomicI64::new(0),
            reserve_micros,
        }
    }

    pub fn snapshot(&self) -> CachePiggyback {
        CachePiggyback {
            version_no: self.version_no.load(Ordering::SeqCst),
            ts: *self.version_ts.lock(),
            reserve_ts: *self.advance_ts.lock(),
        }
    }

    pub fn advance_ts(&self) -> Timestamp {
        *self.advance_ts.lock()
    }

    /// Called at the start of a prepare that touches cacheable data,
    /// before the conflict scan: marks a prepare as in flight so the
    /// reserve-advance loop won't push `advance_ts` out from under it.
    pub fn begin_preparing(&self) {
        self.preparing.fetch_add(1, Ordering::SeqCst);
    }

    /// spec.md §4.F `Commit`'s "donePreparing(committed, committs)":
    /// decrements the in-flight counter, and on a successful commit of
    /// cacheable data, bumps the version and adopts `committs` as the
    /// new version's timestamp.
    pub fn done_preparing(&self, committed: bool, committs: Timestamp) {
        self.preparing.fetch_sub(1, Ordering::SeqCst);
        if committed {
            self.version_no.fetch_add(1, Ordering::SeqCst);
            let mut version_ts = self.version_ts.lock();
            if committs > *version_ts {
                *version_ts = committs;
            }
        }
    }

    /// Advances `advance_ts` to `reserve_micros` past `now`, but only if
    /// no cacheable prepare is currently in flight -- maintains the
    /// invariant that the server never promises past a write it hasn't
    /// yet voted on.
    pub fn try_advance_reserve(&self, now: Timestamp) {
        if self.preparing.load(Ordering::SeqCst) != 0 {
            return;
        }
        let candidate = now.advance_by_micros(self.reserve_micros);
        let mut advance_ts = self.advance_ts.lock();
        if candidate > *advance_ts {
            *advance_ts = candidate;
        }
    }
}

/// A load-split hint: a coid whose access pattern suggests a cell-driven
/// split, queued for the splitter task (spec.md §4.I `ReportAccess`).
pub struct SplitHint {
    pub coid: Coid,
    pub cell: Option<Cell>,
}

pub struct ServerState {
    pub serverid: ServerId,
    looims: RwLock<HashMap<Coid, Arc<Looim>>>,
    pub pending: PendingTxTable,
    pub disklog: DiskLog,
    pub cache: CacheState,
    pub thresholds: btree::SplitThresholds,
    pub split_hints: tokio::sync::mpsc::UnboundedSender<SplitHint>,
    next_oid_counter: AtomicU64,
    splitter_enabled: AtomicBool,
    shutdown: Notify,
    shutdown_full: std::sync::atomic::AtomicBool,
}

impl ServerState {
    pub fn new(
        serverid: ServerId,
        disklog: DiskLog,
        thresholds: btree::SplitThresholds,
        reserve_ms: u64,
        split_hints: tokio::sync::mpsc::UnboundedSender<SplitHint>,
    ) -> Arc<Self> {
        Arc::new(ServerState {
            serverid,
            looims: RwLock::new(HashMap::new()),
            pending: PendingTxTable::new(),
            disklog,
            cache: CacheState::new(reserve_ms * 1000),
            thresholds,
            split_hints,
            next_oid_counter: AtomicU64::new(1),
            splitter_enabled: AtomicBool::new(true),
            shutdown: Notify::new(),
            shutdown_full: AtomicBool::new(false),
        })
    }

    pub fn splitter_enabled(&self) -> bool {
        self.splitter_enabled.load(Ordering::Relaxed)
    }

    pub fn set_splitter_enabled(&self, enabled: bool) {
        self.splitter_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Requests a shutdown (spec.md §6 `Shutdown`). `SplitterOnly` just
    /// disables the splitter; `Full` also wakes
    /// [`ServerState::wait_for_shutdown`], which `main` selects against
    /// to stop serving.
    pub fn request_shutdown(&self, level: ShutdownLevel) {
        self.set_splitter_enabled(false);
        if matches!(level, ShutdownLevel::Full) {
            self.shutdown_full.store(true, Ordering::SeqCst);
            self.shutdown.notify_waiters();
        }
    }

    pub async fn wait_for_shutdown(&self) {
        if self.shutdown_full.load(Ordering::SeqCst) {
            return;
        }
        self.shutdown.notified().await;
    }

    pub fn looim(&self, coid: Coid) -> Arc<Looim> {
        if let Some(l) = self.looims.read().get(&coid) {
            return l.clone();
        }
        self.looims.write().entry(coid).or_insert_with(|| Arc::new(Looim::new(coid))).clone()
    }

    pub fn has_looim(&self, coid: Coid) -> bool {
        self.looims.read().contains_key(&coid)
    }

    /// Allocates a server-locally-unique oid counter value; the caller
    /// (the splitter, allocating a node for a split) composes this with
    /// an issuerid and a (possibly randomized) serverid.
    pub fn next_oid_counter(&self) -> u16 {
        (self.next_oid_counter.fetch_add(1, Ordering::Relaxed) & 0xffff) as u16
    }

    pub fn hint_access(&self, coid: Coid, cell: Option<Cell>) {
        let _ = self.split_hints.send(SplitHint { coid, cell });
    }
}
